use std::fs;
use std::path::Path;

use log::warn;

/// Scheduling policy for the worker cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Fcfs,
    RoundRobin,
}

/// Emulator configuration, loaded from a `key value` text file.
///
/// Unknown keys are ignored, out-of-range values are clamped, and a missing
/// file yields the defaults, so old config files keep loading.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker cores, 1..=128.
    pub num_cpu: usize,
    pub scheduler: Algorithm,
    /// Top-level instructions per Round-Robin dispatch.
    pub quantum_cycles: u32,
    /// Ticks between auto-generated processes.
    pub batch_process_freq: u64,
    pub min_ins: usize,
    pub max_ins: usize,
    /// Busy-loop iterations before each instruction; a pure throttle.
    pub delays_per_exec: u32,
    /// Physical memory in bytes.
    pub max_overall_mem: usize,
    /// Frame (and page) size in bytes.
    pub mem_per_frame: usize,
    /// Per-process virtual size bounds; powers of two.
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
    /// Wall-clock milliseconds per simulated tick.
    pub tick_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cpu: 2,
            scheduler: Algorithm::RoundRobin,
            quantum_cycles: 4,
            batch_process_freq: 1,
            min_ins: 100,
            max_ins: 100,
            delays_per_exec: 1,
            max_overall_mem: 16384,
            mem_per_frame: 16,
            min_mem_per_proc: 64,
            max_mem_per_proc: 65536,
            tick_millis: 500,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults if the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        let mut config = Config::default();
        let text = match fs::read_to_string(path.as_ref()) {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    "config file {} not found, using defaults",
                    path.as_ref().display()
                );
                return config;
            }
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = match parts.next() {
                Some(k) => k,
                None => continue,
            };
            let value = parts.next().unwrap_or("").trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            config.apply(key, value);
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "num-cpu" => self.num_cpu = parse(key, value, self.num_cpu).clamp(1, 128),
            "scheduler" => {
                self.scheduler = match value {
                    "rr" => Algorithm::RoundRobin,
                    "fcfs" => Algorithm::Fcfs,
                    other => {
                        warn!("unrecognized scheduler '{}', using fcfs", other);
                        Algorithm::Fcfs
                    }
                }
            }
            "quantum-cycles" => {
                self.quantum_cycles = parse(key, value, self.quantum_cycles).max(1)
            }
            "batch-process-freq" => {
                self.batch_process_freq = parse(key, value, self.batch_process_freq).max(1)
            }
            "min-ins" => self.min_ins = parse(key, value, self.min_ins).max(1),
            "max-ins" => self.max_ins = parse(key, value, self.max_ins).max(1),
            "delays-per-exec" => self.delays_per_exec = parse(key, value, self.delays_per_exec),
            "max-overall-mem" => {
                self.max_overall_mem = parse(key, value, self.max_overall_mem).max(1)
            }
            "mem-per-frame" => self.mem_per_frame = parse(key, value, self.mem_per_frame).max(2),
            "min-mem-per-proc" => {
                self.min_mem_per_proc = parse(key, value, self.min_mem_per_proc).max(64)
            }
            "max-mem-per-proc" => {
                self.max_mem_per_proc = parse(key, value, self.max_mem_per_proc).min(65536)
            }
            "tick-millis" => self.tick_millis = parse(key, value, self.tick_millis).max(1),
            _ => {} // unknown keys are tolerated
        }
    }
}

fn parse<T: std::str::FromStr + Copy>(key: &str, value: &str, fallback: T) -> T {
    match value.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("bad value '{}' for {}, keeping default", value, key);
            fallback
        }
    }
}
