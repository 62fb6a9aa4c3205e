use std::fs::File;
use std::io::{self, BufRead, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use nimbus::{format_timestamp, parse_program, Config, ProcessSnapshot, Scheduler};

const CONFIG_FILE: &str = "config.txt";
const REPORT_FILE: &str = "utilization-report.txt";

const BANNER: &str = r#"
     _   _ ___ __  __ ____  _   _ ____
    | \ | |_ _|  \/  | __ )| | | / ___|
    |  \| || || |\/| |  _ \| | | \___ \
    | |\  || || |  | | |_) | |_| |___) |
    |_| \_|___|_|  |_|____/ \___/|____/
"#;

struct Shell {
    scheduler: Option<Scheduler>,
    /// Name of the process screen the user is attached to, if any.
    attached: Option<String>,
    quit: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let mut shell = Shell {
        scheduler: None,
        attached: None,
        quit: false,
    };
    shell.clear_screen()?;

    let stdin = io::stdin();
    while !shell.quit {
        shell.prompt()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF behaves like exit
        }
        log::debug!("command: {}", line.trim());
        shell.dispatch(line.trim())?;
    }

    if let Some(mut scheduler) = shell.scheduler.take() {
        println!("Shutting down scheduler...");
        scheduler.shutdown();
    }
    println!("Goodbye.");
    Ok(())
}

impl Shell {
    fn prompt(&self) -> Result<()> {
        let screen = self.attached.as_deref().unwrap_or("main");
        execute!(
            io::stdout(),
            SetForegroundColor(Color::Green),
            Print(format!("{} > ", screen)),
            ResetColor
        )?;
        io::stdout().flush()?;
        Ok(())
    }

    fn clear_screen(&self) -> Result<()> {
        execute!(io::stdout(), Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        match self.attached.as_deref() {
            None => self.print_banner()?,
            Some(name) => {
                if let Some(scheduler) = self.scheduler.as_ref() {
                    if let Some(snap) = scheduler.process(name) {
                        draw_screen(scheduler, &snap);
                    }
                }
            }
        }
        Ok(())
    }

    fn print_banner(&self) -> Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::Cyan),
            Print(BANNER),
            ResetColor,
            Print("\n  A tiny demand-paged multicore OS emulator.\n"),
            SetForegroundColor(Color::DarkRed),
            Print("  Type 'help' for commands, 'clear' to redraw, 'exit' to quit.\n\n"),
            ResetColor
        )?;
        Ok(())
    }

    fn dispatch(&mut self, command: &str) -> Result<()> {
        if self.attached.is_some() {
            self.screen_command(command)
        } else {
            self.main_command(command)
        }
    }

    fn main_command(&mut self, command: &str) -> Result<()> {
        let keyword = command.split_whitespace().next().unwrap_or("");
        match keyword {
            "" => return Ok(()),
            "exit" => {
                println!("Exiting...");
                self.quit = true;
                return Ok(());
            }
            "clear" => return self.clear_screen(),
            "help" => {
                print_help();
                return Ok(());
            }
            "initialize" => {
                if self.scheduler.is_some() {
                    println!("Already initialized.");
                } else {
                    let config = Config::load(CONFIG_FILE);
                    match Scheduler::start(config) {
                        Ok(scheduler) => {
                            self.scheduler = Some(scheduler);
                            println!("Initialized successfully.");
                        }
                        Err(e) => println!("Initialization failed: {}", e),
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        let Some(scheduler) = self.scheduler.as_ref() else {
            println!("Initialize first.");
            return Ok(());
        };

        match keyword {
            "screen" => handle_screen(scheduler, command, &mut self.attached),
            "scheduler-start" => {
                if scheduler.is_generating() {
                    println!("Process generation is already active.");
                } else {
                    println!("Starting process generation...");
                    scheduler.start_generation();
                }
            }
            "scheduler-stop" => {
                if !scheduler.is_generating() {
                    println!("Process generation is already stopped.");
                } else {
                    println!("Stopping process generation...");
                    scheduler.stop_generation();
                }
            }
            "process-smi" => print_smi(scheduler),
            "vmstat" => print_vmstat(scheduler),
            "report-util" => match write_report(scheduler) {
                Ok(()) => println!("Utilization report saved to '{}'.", REPORT_FILE),
                Err(e) => println!("Failed to write report: {}", e),
            },
            "snapshot-memory" => print_frame_table(scheduler),
            _ => println!(
                "Unknown command '{}'. Type 'help' for available commands.",
                command
            ),
        }
        if self.attached.is_some() {
            self.clear_screen()?;
        }
        Ok(())
    }

    fn screen_command(&mut self, command: &str) -> Result<()> {
        match command {
            "exit" => {
                self.attached = None;
                self.clear_screen()?;
            }
            "clear" => self.clear_screen()?,
            "help" => {
                println!("Available commands:");
                println!("  process-smi         : Show this process's state and logs");
                println!("  clear               : Redraw the screen");
                println!("  exit                : Return to the main console");
            }
            "process-smi" => {
                let name = self.attached.clone().unwrap_or_default();
                if let (Some(scheduler), false) = (self.scheduler.as_ref(), name.is_empty()) {
                    if let Some(snap) = scheduler.process(&name) {
                        draw_screen(scheduler, &snap);
                    }
                }
            }
            "" => {}
            other => println!(
                "Unknown command '{}'. Type 'exit' to return to the main console.",
                other
            ),
        }
        Ok(())
    }
}

/// First `n` whitespace-separated tokens plus the untouched remainder.
fn split_tokens(text: &str, n: usize) -> (Vec<&str>, &str) {
    let mut rest = text;
    let mut tokens = Vec::new();
    for _ in 0..n {
        rest = rest.trim_start();
        match rest.find(char::is_whitespace) {
            Some(i) => {
                tokens.push(&rest[..i]);
                rest = &rest[i..];
            }
            None => {
                if !rest.is_empty() {
                    tokens.push(rest);
                    rest = "";
                }
                break;
            }
        }
    }
    (tokens, rest.trim_start())
}

fn handle_screen(scheduler: &Scheduler, command: &str, attached: &mut Option<String>) {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    match tokens.get(1).copied() {
        Some("-ls") => list_processes(scheduler),
        Some("-s") => match (tokens.get(2), tokens.get(3).and_then(|s| s.parse::<usize>().ok())) {
            (Some(name), Some(bytes)) => match scheduler.submit_generated(name, bytes) {
                Ok(()) => println!(
                    "Process {} created with {} bytes of virtual memory.",
                    name, bytes
                ),
                Err(e) => println!("{}", e),
            },
            _ => println!("Usage: screen -s <name> <size>"),
        },
        Some("-c") => {
            let (head, instructions) = split_tokens(command, 4);
            let (name, bytes) = match (head.get(2), head.get(3).and_then(|s| s.parse::<usize>().ok())) {
                (Some(&name), Some(bytes)) if !instructions.is_empty() => (name, bytes),
                _ => {
                    println!("Usage: screen -c <name> <size> \"<instructions>\"");
                    return;
                }
            };
            let instructions = instructions
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(instructions);
            match parse_program(instructions) {
                Ok(program) => match scheduler.submit(name, bytes, program) {
                    Ok(()) => println!(
                        "Process {} created with {} bytes of virtual memory and custom instructions.",
                        name, bytes
                    ),
                    Err(e) => println!("{}", e),
                },
                Err(e) => println!("{}", e),
            }
        }
        Some("-r") => match tokens.get(2) {
            None => println!("Usage: screen -r <name>"),
            Some(&name) => match scheduler.process(name) {
                None => println!("No process named '{}'.", name),
                Some(snap) => {
                    if let Some(violation) = &snap.violation {
                        println!(
                            "Process <{}> shut down due to a memory access violation at {}. <0x{:X}> invalid.",
                            name,
                            format_timestamp(&violation.at),
                            violation.addr
                        );
                    } else if snap.finished {
                        println!("Process '{}' has already finished execution.", name);
                    } else {
                        *attached = Some(name.to_string());
                    }
                }
            },
        },
        _ => println!(
            "Use 'screen -ls', 'screen -s <name> <size>', 'screen -c <name> <size> \"<instr>\"' or 'screen -r <name>'."
        ),
    }
}

fn status_line(snap: &ProcessSnapshot) -> String {
    if let Some(violation) = &snap.violation {
        format!(
            "MEM_FAULT at {} (0x{:X} invalid)",
            format_timestamp(&violation.at),
            violation.addr
        )
    } else if snap.finished {
        match &snap.finished_at {
            Some(at) => format!("Finished at {}", format_timestamp(at)),
            None => "Finished".to_string(),
        }
    } else if snap.running {
        format!("Running on Core {}", snap.core_id.map_or(-1, |c| c as i64))
    } else {
        "Waiting in queue".to_string()
    }
}

fn list_processes(scheduler: &Scheduler) {
    let processes = scheduler.processes();
    println!("--------------------------------------------------------------------------------");
    println!("Processes:");
    for snap in &processes {
        println!(
            "{:<15}{}\t({}/{} instructions)",
            snap.name,
            status_line(snap),
            snap.pc,
            snap.total_instructions
        );
    }
    if processes.is_empty() {
        println!("  (None)");
    }
    println!("--------------------------------------------------------------------------------");
}

fn draw_screen(scheduler: &Scheduler, snap: &ProcessSnapshot) {
    println!("=== Process Screen: {} ===", snap.name);
    println!("Process name     : {}", snap.name);
    println!(
        "Instruction      : {} / {}",
        snap.pc, snap.total_instructions
    );
    println!("Created at       : {}", format_timestamp(&snap.created_at));
    println!("Virtual memory   : {} B ({} B resident)", snap.virtual_bytes, snap.resident_bytes);
    println!("Status           : {}", status_line(snap));
    println!("Logs:");
    match scheduler.process_output(&snap.name) {
        Some(lines) if !lines.is_empty() => {
            for line in lines {
                println!("  {}", line);
            }
        }
        _ => println!("  (no output yet)"),
    }
    println!();
    println!("(Type 'exit' to return to the main menu)");
}

fn print_smi(scheduler: &Scheduler) {
    let stat = scheduler.vmstat();
    let cores = scheduler.num_cores();
    let cpu_util = if cores > 0 {
        scheduler.cores_used() * 100 / cores
    } else {
        0
    };
    let mem_util = if stat.total_bytes > 0 {
        stat.used_bytes * 100 / stat.total_bytes
    } else {
        0
    };
    println!("| PROCESS-SMI V01.00 Driver Version: 01.00 |");
    println!("CPU-Util: {}%", cpu_util);
    println!("Memory Usage: {}B / {}B", stat.used_bytes, stat.total_bytes);
    println!("Memory Util: {}%", mem_util);
    println!("================================================");
    println!("Running processes and memory usage:");
    let mut any = false;
    for snap in scheduler.processes() {
        if !snap.finished {
            println!("  {:<15}{:>8}B", snap.name, snap.resident_bytes);
            any = true;
        }
    }
    if !any {
        println!("  (None)");
    }
}

fn print_vmstat(scheduler: &Scheduler) {
    let stat = scheduler.vmstat();
    println!("{:>12} B  total memory", stat.total_bytes);
    println!("{:>12} B  used memory", stat.used_bytes);
    println!("{:>12} B  free memory", stat.free_bytes);
    println!("------------------------------------");
    println!("{:>12}   idle cpu ticks", stat.idle_ticks);
    println!("{:>12}   active cpu ticks", stat.active_ticks);
    println!("{:>12}   total cpu ticks", stat.total_ticks);
    println!("------------------------------------");
    println!("{:>12}   pages paged in", stat.paged_in);
    println!("{:>12}   pages paged out", stat.paged_out);
}

fn write_report(scheduler: &Scheduler) -> io::Result<()> {
    let mut processes = scheduler.processes();
    processes.sort_by_key(|p| p.created_at);
    let (finished, running): (Vec<_>, Vec<_>) = processes.into_iter().partition(|p| p.finished);

    let cores = scheduler.num_cores();
    let used = scheduler.cores_used();
    let mut file = File::create(REPORT_FILE)?;
    writeln!(
        file,
        "CPU utilization: {}%",
        if cores > 0 { used * 100 / cores } else { 0 }
    )?;
    writeln!(file, "Cores used: {}", used)?;
    writeln!(file, "Cores available: {}", cores)?;
    writeln!(
        file,
        "--------------------------------------------------------------------------------"
    )?;
    writeln!(file, "Running processes:")?;
    if running.is_empty() {
        writeln!(file, " (None)")?;
    }
    for snap in &running {
        write!(
            file,
            "{:<10} ({})",
            snap.name,
            format_timestamp(&snap.created_at)
        )?;
        if let Some(core) = snap.core_id {
            write!(file, "\tCore: {}", core)?;
        }
        writeln!(file, "\t{} / {}", snap.pc, snap.total_instructions)?;
    }
    writeln!(file)?;
    writeln!(file, "Finished processes:")?;
    if finished.is_empty() {
        writeln!(file, " (None)")?;
    }
    for snap in &finished {
        let at = snap.finished_at.unwrap_or(snap.created_at);
        writeln!(
            file,
            "{:<10} ({})\tFinished\t{} / {}",
            snap.name,
            format_timestamp(&at),
            snap.pc,
            snap.total_instructions
        )?;
    }
    writeln!(
        file,
        "--------------------------------------------------------------------------------"
    )?;
    Ok(())
}

fn print_frame_table(scheduler: &Scheduler) {
    let memory = scheduler.memory();
    let frames = memory.frame_table();
    println!(
        "Frame table: {} frames x {} B ({} used)",
        memory.total_frames(),
        memory.frame_bytes(),
        memory.used_frames()
    );
    println!("{:<8}{:<10}{:<20}{:<8}", "#", "status", "process", "page");
    for (index, frame) in frames.iter().enumerate() {
        match &frame.owner {
            None => println!("{:<8}{:<10}", index, "Free"),
            Some(owner) => println!(
                "{:<8}{:<10}{:<20}{:<8}{}",
                index,
                "Used",
                owner.process,
                owner.page,
                if frame.dirty { " [dirty]" } else { "" }
            ),
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  initialize                        : Read {} and start the emulator.", CONFIG_FILE);
    println!("  screen -s <name> <size>           : Create a process with a generated program.");
    println!("  screen -c <name> <size> \"<ins>\"   : Create a process with custom instructions.");
    println!("  screen -r <name>                  : Attach to a process screen.");
    println!("  screen -ls                        : List all processes and their status.");
    println!("  scheduler-start                   : Start automatic process generation.");
    println!("  scheduler-stop                    : Stop automatic process generation.");
    println!("  process-smi                       : CPU / memory summary per process.");
    println!("  vmstat                            : Virtual memory and tick statistics.");
    println!("  report-util                       : Write the utilization report file.");
    println!("  snapshot-memory                   : Print the physical frame table.");
    println!("  clear                             : Clear the screen.");
    println!("  exit                              : Exit the emulator.");
}
