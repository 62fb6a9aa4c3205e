//! End-to-end scenarios driving the whole engine: scheduler, workers,
//! demand paging and the executor together.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nimbus::{parse_program, Algorithm, Config, Instruction, Scheduler};

fn store_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "nimbus-system-{}-{}.bin",
        tag,
        std::process::id()
    ))
}

fn fast_config() -> Config {
    Config {
        num_cpu: 1,
        scheduler: Algorithm::Fcfs,
        quantum_cycles: 4,
        batch_process_freq: 1,
        min_ins: 3,
        max_ins: 6,
        delays_per_exec: 0,
        max_overall_mem: 16384,
        mem_per_frame: 4096,
        min_mem_per_proc: 64,
        max_mem_per_proc: 65536,
        tick_millis: 2,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn wait_for_finish(scheduler: &Scheduler, name: &str) {
    assert!(
        wait_until(Duration::from_secs(10), || scheduler
            .process(name)
            .map_or(false, |p| p.finished)),
        "process '{}' did not finish in time",
        name
    );
}

#[test]
fn fcfs_single_process_runs_to_completion() {
    let mut scheduler =
        Scheduler::start_with_store(fast_config(), store_path("fcfs-single")).unwrap();
    let program = parse_program("DECLARE x 5; ADD x x 7; PRINT \"x=%x%\"").unwrap();
    scheduler.submit("calc", 1024, program).unwrap();

    wait_for_finish(&scheduler, "calc");
    let log = scheduler.process_output("calc").unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("\"x=12\""), "got {}", log[0]);

    // frames go back to the free list once the worker retires the process
    assert!(wait_until(Duration::from_secs(5), || scheduler
        .memory()
        .used_frames()
        == 0));
    assert_eq!(scheduler.memory().paged_in(), 1);
    assert_eq!(scheduler.memory().paged_out(), 0);

    let snap = scheduler.process("calc").unwrap();
    assert!(snap.finished && !snap.running);
    assert_eq!(snap.pc, 3);
    assert!(snap.finished_at.is_some());
    scheduler.shutdown();
}

#[test]
fn eviction_round_trips_values_through_the_store() {
    // a single 64-byte frame, so two-page processes thrash it
    let config = Config {
        max_overall_mem: 64,
        mem_per_frame: 64,
        ..fast_config()
    };
    let mut scheduler = Scheduler::start_with_store(config, store_path("eviction")).unwrap();
    let first = parse_program("WRITE 0x0 111; WRITE 0x40 211; READ a 0x0; PRINT \"a=\" + a")
        .unwrap();
    let second = parse_program("WRITE 0x0 122; WRITE 0x40 222; READ b 0x0; PRINT \"b=\" + b")
        .unwrap();
    scheduler.submit("first", 128, first).unwrap();
    scheduler.submit("second", 128, second).unwrap();

    wait_for_finish(&scheduler, "first");
    wait_for_finish(&scheduler, "second");
    assert!(scheduler.process_output("first").unwrap()[0].contains("\"a=111\""));
    assert!(scheduler.process_output("second").unwrap()[0].contains("\"b=122\""));
    assert!(scheduler.memory().paged_in() >= 4);
    assert!(scheduler.memory().paged_out() >= 2);
    assert!(scheduler.memory().paged_in() >= scheduler.memory().paged_out());
    scheduler.shutdown();
}

#[test]
fn round_robin_preempts_after_a_quantum() {
    // one core: the short process can only finish first if the long one
    // was preempted
    let config = Config {
        scheduler: Algorithm::RoundRobin,
        quantum_cycles: 2,
        ..fast_config()
    };
    let mut scheduler = Scheduler::start_with_store(config, store_path("rr-preempt")).unwrap();
    // each SLEEP keeps a quantum busy long enough for the short process to
    // be queued behind the first one
    let long = parse_program(
        "SLEEP 30; SLEEP 30; SLEEP 30; SLEEP 30; SLEEP 30; PRINT \"long done\"",
    )
    .unwrap();
    let short = parse_program("PRINT \"quick\"").unwrap();
    scheduler.submit("long", 256, long).unwrap();
    scheduler.submit("short", 256, short).unwrap();

    wait_for_finish(&scheduler, "long");
    wait_for_finish(&scheduler, "short");
    let long_done = scheduler.process("long").unwrap().finished_at.unwrap();
    let short_done = scheduler.process("short").unwrap().finished_at.unwrap();
    assert!(
        short_done < long_done,
        "short should slip in between the long process's quanta"
    );
    assert_eq!(scheduler.process_output("long").unwrap().len(), 1);
    scheduler.shutdown();
}

#[test]
fn round_robin_finishes_more_processes_than_cores() {
    let config = Config {
        num_cpu: 2,
        scheduler: Algorithm::RoundRobin,
        quantum_cycles: 2,
        ..fast_config()
    };
    let mut scheduler = Scheduler::start_with_store(config, store_path("rr-fair")).unwrap();
    for name in ["a", "b", "c"] {
        let program = parse_program(
            "DECLARE n 1; ADD n n 1; ADD n n 1; ADD n n 1; ADD n n 1; PRINT \"n=\" + n",
        )
        .unwrap();
        scheduler.submit(name, 256, program).unwrap();
    }
    for name in ["a", "b", "c"] {
        wait_for_finish(&scheduler, name);
        assert!(scheduler.process_output(name).unwrap()[0].contains("\"n=5\""));
    }
    scheduler.shutdown();
}

#[test]
fn violation_terminates_only_the_offender() {
    let config = Config {
        num_cpu: 2,
        ..fast_config()
    };
    let mut scheduler = Scheduler::start_with_store(config, store_path("violation")).unwrap();
    let offender = parse_program("WRITE 0xFFFF 1").unwrap();
    let mut busy = Vec::new();
    for i in 0..100 {
        busy.push(Instruction::Print {
            message: format!("line {}", i),
        });
    }
    scheduler.submit("offender", 64, offender).unwrap();
    scheduler.submit("busy", 1024, busy).unwrap();

    wait_for_finish(&scheduler, "offender");
    wait_for_finish(&scheduler, "busy");

    let bad = scheduler.process("offender").unwrap();
    let violation = bad.violation.expect("violation recorded");
    assert_eq!(violation.addr, 0xFFFF);
    assert!(bad.finished_at.is_some());
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.process("offender").unwrap().resident_bytes == 0
    }));

    let good = scheduler.process("busy").unwrap();
    assert!(good.finished && good.violation.is_none());
    assert_eq!(scheduler.process_output("busy").unwrap().len(), 100);
    assert!(scheduler.is_running());
    scheduler.shutdown();
}

#[test]
fn saturated_symbol_table_prints_zero_for_unbound_names() {
    let mut scheduler =
        Scheduler::start_with_store(fast_config(), store_path("symbols")).unwrap();
    let mut program = Vec::new();
    for i in 0..40 {
        program.push(Instruction::Declare {
            var: format!("v{}", i),
            value: nimbus::Operand::Literal(i as u16 + 1),
        });
    }
    program.extend(parse_program("PRINT \"late=\" + v32; PRINT \"last=\" + v31").unwrap());
    scheduler.submit("crowded", 1024, program).unwrap();

    wait_for_finish(&scheduler, "crowded");
    let log = scheduler.process_output("crowded").unwrap();
    assert!(log[0].contains("\"late=0\""));
    assert!(log[1].contains("\"last=32\""));
    scheduler.shutdown();
}

#[test]
fn shutdown_joins_cleanly_with_the_generator_running() {
    let config = Config {
        num_cpu: 2,
        scheduler: Algorithm::RoundRobin,
        quantum_cycles: 2,
        ..fast_config()
    };
    let mut scheduler = Scheduler::start_with_store(config, store_path("drain")).unwrap();
    scheduler.start_generation();
    assert!(scheduler.is_generating());
    assert!(wait_until(Duration::from_secs(10), || scheduler
        .clock()
        .total()
        >= 50));
    assert!(!scheduler.processes().is_empty());
    scheduler.stop_generation();
    scheduler.shutdown();

    // every worker exited; nobody is marked on a core
    assert!(scheduler.processes().iter().all(|p| !p.running));
    let memory = scheduler.memory();
    assert_eq!(
        memory.free_frames() + memory.used_frames(),
        memory.total_frames()
    );
    assert!(memory.used_frames() * memory.frame_bytes() <= memory.total_bytes());
    assert!(memory.paged_in() >= memory.paged_out());
    let stat = scheduler.vmstat();
    assert_eq!(stat.total_ticks, stat.idle_ticks + stat.active_ticks);
}

#[test]
fn boundary_access_at_last_byte_succeeds() {
    let mut scheduler =
        Scheduler::start_with_store(fast_config(), store_path("boundary")).unwrap();
    // 64-byte process: address 63 is fine, the executor never goes past it
    let program = parse_program("WRITE 63 9; READ v 63; PRINT \"v=\" + v").unwrap();
    scheduler.submit("edge", 64, program).unwrap();
    wait_for_finish(&scheduler, "edge");
    let snap = scheduler.process("edge").unwrap();
    assert!(snap.violation.is_none());
    assert!(scheduler.process_output("edge").unwrap()[0].contains("\"v=9\""));

    // one past the end is a violation, even though the page exists
    let past = parse_program("WRITE 64 1").unwrap();
    scheduler.submit("past", 64, past).unwrap();
    wait_for_finish(&scheduler, "past");
    let snap = scheduler.process("past").unwrap();
    assert_eq!(snap.violation.expect("violation").addr, 64);
    scheduler.shutdown();
}

#[test]
fn duplicate_and_invalid_submissions_are_rejected() {
    let mut scheduler =
        Scheduler::start_with_store(fast_config(), store_path("rejects")).unwrap();
    scheduler.submit("taken", 256, Vec::new()).unwrap();
    assert!(matches!(
        scheduler.submit("taken", 256, Vec::new()),
        Err(nimbus::OsError::DuplicateName(_))
    ));
    // not a power of two
    assert!(matches!(
        scheduler.submit("odd", 100, Vec::new()),
        Err(nimbus::OsError::InvalidSize(100))
    ));
    // below the configured minimum
    assert!(matches!(
        scheduler.submit("tiny", 32, Vec::new()),
        Err(nimbus::OsError::InvalidSize(32))
    ));
    scheduler.shutdown();
}
