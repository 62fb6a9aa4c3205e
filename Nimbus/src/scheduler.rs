use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::config::{Algorithm, Config};
use crate::error::{OsError, Result};
use crate::instruction::{Instruction, Operand};
use crate::memory::{MemoryManager, DEFAULT_STORE_FILE};
use crate::process::{Process, ProcessHandle};
use crate::queue::ReadyQueue;
use crate::snapshot::{ProcessSnapshot, VmStat};

const GENERATOR_POLL_MS: u64 = 10;
/// Generated FOR blocks never nest deeper than this.
const MAX_GENERATED_FOR_DEPTH: u32 = 3;

/// Handles shared by the scheduler and its worker/generator/ticker threads.
struct Shared {
    config: Config,
    clock: Clock,
    queue: ReadyQueue,
    memory: MemoryManager,
    registry: Mutex<Vec<ProcessHandle>>,
    running: AtomicBool,
    generating: AtomicBool,
    cores_used: AtomicUsize,
    next_auto_id: AtomicU64,
}

/// Root owner of the simulation: worker cores draining the ready queue, the
/// auto-generator, the tick driver, and the process registry. Everything is
/// built at startup and reached through injected handles.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    generator: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start with the default backing-store file.
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with_store(config, DEFAULT_STORE_FILE)
    }

    /// Start with an explicit backing-store path (tests give each scheduler
    /// its own scratch file).
    pub fn start_with_store<P: AsRef<Path>>(config: Config, store_path: P) -> Result<Self> {
        let memory = MemoryManager::new(config.max_overall_mem, config.mem_per_frame, store_path)?;
        let shared = Arc::new(Shared {
            clock: Clock::new(),
            queue: ReadyQueue::new(),
            memory,
            registry: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            generating: AtomicBool::new(false),
            cores_used: AtomicUsize::new(0),
            next_auto_id: AtomicU64::new(0),
            config,
        });

        let workers = (0..shared.config.num_cpu)
            .map(|core| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared, core))
            })
            .collect();
        let generator = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || generator_loop(&shared))
        };
        let ticker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || ticker_loop(&shared))
        };

        info!(
            "scheduler up: {} core(s), {:?}, {} B memory in {} B frames",
            shared.config.num_cpu,
            shared.config.scheduler,
            shared.config.max_overall_mem,
            shared.config.mem_per_frame
        );
        Ok(Self {
            shared,
            workers,
            generator: Some(generator),
            ticker: Some(ticker),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.shared.memory
    }

    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.shared.generating.load(Ordering::SeqCst)
    }

    pub fn cores_used(&self) -> usize {
        self.shared.cores_used.load(Ordering::SeqCst)
    }

    pub fn num_cores(&self) -> usize {
        self.shared.config.num_cpu
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Enqueue a user-defined process. The size must be a power of two
    /// within the configured per-process bounds.
    pub fn submit(
        &self,
        name: &str,
        virtual_bytes: usize,
        instructions: Vec<Instruction>,
    ) -> Result<()> {
        self.validate_size(virtual_bytes)?;
        self.shared.admit(name, virtual_bytes, instructions)?;
        Ok(())
    }

    /// Enqueue a user-named process with a generated program (`screen -s`).
    pub fn submit_generated(&self, name: &str, virtual_bytes: usize) -> Result<()> {
        self.validate_size(virtual_bytes)?;
        let mut rng = SmallRng::from_entropy();
        let program = generate_program(&mut rng, &self.shared.config, name, virtual_bytes);
        self.shared.admit(name, virtual_bytes, program)?;
        Ok(())
    }

    fn validate_size(&self, virtual_bytes: usize) -> Result<()> {
        let config = &self.shared.config;
        if !virtual_bytes.is_power_of_two()
            || virtual_bytes < config.min_mem_per_proc
            || virtual_bytes > config.max_mem_per_proc
        {
            return Err(OsError::InvalidSize(virtual_bytes));
        }
        Ok(())
    }

    /// Enable the auto-generator, seeding one process per core up front.
    pub fn start_generation(&self) {
        if self.shared.generating.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rng = SmallRng::from_entropy();
        for _ in 0..self.shared.config.num_cpu.max(1) {
            self.shared.spawn_generated(&mut rng);
        }
        info!("process generation enabled");
    }

    pub fn stop_generation(&self) {
        self.shared.generating.store(false, Ordering::SeqCst);
        info!("process generation disabled");
    }

    /// Snapshots of every process, oldest first.
    pub fn processes(&self) -> Vec<ProcessSnapshot> {
        let handles: Vec<ProcessHandle> = {
            let registry = self.shared.registry.lock().unwrap();
            registry.clone()
        };
        handles
            .iter()
            .map(|p| {
                let mut snap = p.snapshot();
                snap.resident_bytes = self.shared.memory.process_resident(p.name());
                snap
            })
            .collect()
    }

    pub fn process(&self, name: &str) -> Option<ProcessSnapshot> {
        let handle = self.find(name)?;
        let mut snap = handle.snapshot();
        snap.resident_bytes = self.shared.memory.process_resident(name);
        Some(snap)
    }

    pub fn process_output(&self, name: &str) -> Option<Vec<String>> {
        Some(self.find(name)?.output_log())
    }

    fn find(&self, name: &str) -> Option<ProcessHandle> {
        let registry = self.shared.registry.lock().unwrap();
        registry.iter().find(|p| p.name() == name).cloned()
    }

    pub fn vmstat(&self) -> VmStat {
        let memory = &self.shared.memory;
        let used_bytes = memory.used_frames() * memory.frame_bytes();
        // idle is read before total so the snapshot never shows idle > total
        let idle_ticks = self.shared.clock.idle();
        let total_ticks = self.shared.clock.total();
        VmStat {
            total_bytes: memory.total_bytes(),
            used_bytes,
            free_bytes: memory.total_bytes() - used_bytes,
            idle_ticks,
            active_ticks: total_ticks - idle_ticks,
            total_ticks,
            paged_in: memory.paged_in(),
            paged_out: memory.paged_out(),
        }
    }

    /// Cooperative shutdown: clear the running flag, wake every consumer,
    /// join the generator, ticker and workers.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.generating.store(false, Ordering::SeqCst);
        self.shared.queue.close();
        if let Some(ticker) = self.ticker.take() {
            ticker.join().ok();
        }
        if let Some(generator) = self.generator.take() {
            generator.join().ok();
        }
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
        info!("scheduler joined all of its threads");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Register with the memory manager and place the new process in the
    /// registry and ready queue. Name uniqueness is decided here.
    fn admit(
        &self,
        name: &str,
        virtual_bytes: usize,
        instructions: Vec<Instruction>,
    ) -> Result<ProcessHandle> {
        let mut registry = self.registry.lock().unwrap();
        if registry.iter().any(|p| p.name() == name) {
            return Err(OsError::DuplicateName(name.to_string()));
        }
        self.memory.register_process(name, virtual_bytes)?;
        let handle = Arc::new(Process::new(name, virtual_bytes, instructions));
        registry.push(Arc::clone(&handle));
        drop(registry);
        self.queue.push(Arc::clone(&handle));
        debug!("admitted '{}' ({} B virtual)", name, virtual_bytes);
        Ok(handle)
    }

    /// One synthetic workload: `p<N>` name, power-of-two size, random
    /// program. Skips names a user has already taken.
    fn spawn_generated(&self, rng: &mut SmallRng) {
        for _ in 0..8 {
            let name = format!("p{}", self.next_auto_id.fetch_add(1, Ordering::SeqCst));
            let bytes = random_power_of_two(
                rng,
                self.config.min_mem_per_proc,
                self.config.max_mem_per_proc,
            );
            let program = generate_program(rng, &self.config, &name, bytes);
            match self.admit(&name, bytes, program) {
                Ok(_) => {
                    info!("generated {} ({} B virtual)", name, bytes);
                    return;
                }
                Err(OsError::DuplicateName(_)) => continue,
                Err(e) => {
                    error!("could not generate a process: {}", e);
                    return;
                }
            }
        }
    }
}

fn worker_loop(shared: &Shared, core: usize) {
    let quantum = match shared.config.scheduler {
        Algorithm::RoundRobin => Some(shared.config.quantum_cycles),
        Algorithm::Fcfs => None,
    };
    while let Some(process) = shared.queue.pop() {
        // e.g. a violation recorded while it sat in the queue
        if process.is_finished() {
            shared.memory.release_process(process.name());
            continue;
        }
        shared.cores_used.fetch_add(1, Ordering::SeqCst);
        process.set_dispatched(core);
        let result = process.execute(&shared.memory, shared.config.delays_per_exec, quantum);
        process.clear_dispatched();
        shared.cores_used.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = result {
            error!("core {}: {}; shutting down", core, e);
            shared.running.store(false, Ordering::SeqCst);
            shared.generating.store(false, Ordering::SeqCst);
            shared.queue.close();
            break;
        }
        if process.is_finished() {
            shared.memory.release_process(process.name());
        } else {
            // only the Round-Robin path gets here
            shared.queue.push(process);
        }
    }
    debug!("core {} stopped", core);
}

fn generator_loop(shared: &Shared) {
    let mut rng = SmallRng::from_entropy();
    let mut last_gen: u64 = 0;
    while shared.running.load(Ordering::SeqCst) {
        if shared.generating.load(Ordering::SeqCst) {
            let now = shared.clock.total();
            if now.saturating_sub(last_gen) >= shared.config.batch_process_freq {
                last_gen = now;
                shared.spawn_generated(&mut rng);
            }
        }
        thread::sleep(Duration::from_millis(GENERATOR_POLL_MS));
    }
    debug!("generator stopped");
}

/// Advances simulated time; a tick with nothing runnable counts as idle.
fn ticker_loop(shared: &Shared) {
    while shared.running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(shared.config.tick_millis));
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        if shared.queue.is_empty() {
            shared.clock.tick_idle();
        } else {
            shared.clock.tick();
        }
    }
}

/// Random power of two in [min, max], the distribution used for generated
/// process sizes.
fn random_power_of_two(rng: &mut SmallRng, min: usize, max: usize) -> usize {
    let mut powers = Vec::new();
    let mut v = min.max(1);
    while v <= max {
        powers.push(v);
        v <<= 1;
    }
    if powers.is_empty() {
        return min;
    }
    powers[rng.gen_range(0..powers.len())]
}

/// Synthesize a program: a leading DECLARE, then a mix of simple
/// instructions with occasional FOR blocks.
fn generate_program(
    rng: &mut SmallRng,
    config: &Config,
    name: &str,
    mem_bytes: usize,
) -> Vec<Instruction> {
    let max_ins = config.max_ins.max(config.min_ins);
    let target = rng.gen_range(config.min_ins..=max_ins);
    let mut program = vec![Instruction::Declare {
        var: "x".to_string(),
        value: Operand::Literal(rng.gen_range(1..=100)),
    }];
    while program.len() < target {
        if program.len() > 1 && rng.gen_ratio(1, 5) {
            program.push(random_for_block(rng, name, mem_bytes, 1));
        } else {
            program.push(random_simple_instruction(rng, name, mem_bytes));
        }
    }
    program
}

fn random_for_block(
    rng: &mut SmallRng,
    name: &str,
    mem_bytes: usize,
    depth: u32,
) -> Instruction {
    let repeats = rng.gen_range(2..=5);
    let body_len = rng.gen_range(2..=4);
    let body = (0..body_len)
        .map(|_| {
            if depth < MAX_GENERATED_FOR_DEPTH && rng.gen_ratio(1, 10) {
                random_for_block(rng, name, mem_bytes, depth + 1)
            } else {
                random_simple_instruction(rng, name, mem_bytes)
            }
        })
        .collect();
    Instruction::For {
        count: repeats,
        body,
    }
}

fn random_simple_instruction(rng: &mut SmallRng, name: &str, mem_bytes: usize) -> Instruction {
    let max_addr = mem_bytes.saturating_sub(1).min(u16::MAX as usize) as u16;
    match rng.gen_range(0..6) {
        0 => Instruction::Read {
            var: format!("var_{}", rng.gen_range(0..5u32)),
            addr: rng.gen_range(0..=max_addr),
        },
        1 => Instruction::Write {
            addr: rng.gen_range(0..=max_addr),
            value: Operand::Literal(rng.gen_range(1..=100)),
        },
        2 => Instruction::Add {
            dest: "x".to_string(),
            lhs: Operand::Var("x".to_string()),
            rhs: Operand::Literal(rng.gen_range(1..=100)),
        },
        3 => Instruction::Subtract {
            dest: "x".to_string(),
            lhs: Operand::Var("x".to_string()),
            rhs: Operand::Literal(rng.gen_range(0..50)),
        },
        4 => Instruction::Sleep {
            millis: rng.gen_range(10..30),
        },
        _ => Instruction::Print {
            message: format!("Value from {}: %x%", name),
        },
    }
}
