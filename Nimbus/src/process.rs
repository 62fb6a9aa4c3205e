use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::{OsError, Result};
use crate::instruction::{Instruction, Operand};
use crate::memory::MemoryManager;
use crate::snapshot::{format_timestamp, ProcessSnapshot};

/// The symbol table occupies the first 64 bytes of the address space:
/// 32 variables of 2 bytes each, laid out from logical address 0.
pub const SYMBOL_TABLE_BYTES: u16 = 64;
pub const MAX_VARIABLES: usize = 32;

const MAX_OUTPUT_LINES: usize = 1000;

pub type ProcessHandle = Arc<Process>;

#[derive(Debug, Clone)]
pub struct Violation {
    pub addr: u16,
    pub at: DateTime<Local>,
}

/// A simulated process: an instruction list plus the mutable execution
/// state behind the process's own mutex. The worker owning the current
/// dispatch is the only mutator; snapshot readers lock for consistent
/// views.
pub struct Process {
    name: String,
    virtual_bytes: usize,
    instructions: Vec<Instruction>,
    created_at: DateTime<Local>,
    state: Mutex<ProcState>,
}

struct ProcState {
    pc: usize,
    core_id: Option<usize>,
    running: bool,
    /// Variable name -> logical byte offset. Values live in paged memory.
    symbols: HashMap<String, u16>,
    next_offset: u16,
    violation: Option<Violation>,
    finished_at: Option<DateTime<Local>>,
    output: VecDeque<String>,
}

impl Process {
    pub fn new(name: impl Into<String>, virtual_bytes: usize, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            virtual_bytes,
            instructions,
            created_at: Local::now(),
            state: Mutex::new(ProcState {
                pc: 0,
                core_id: None,
                running: false,
                symbols: HashMap::new(),
                next_offset: 0,
                violation: None,
                finished_at: None,
                output: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn virtual_bytes(&self) -> usize {
        self.virtual_bytes
    }

    pub fn total_instructions(&self) -> usize {
        self.instructions.len()
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn is_finished(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.violation.is_some() || st.pc >= self.instructions.len()
    }

    /// Called by the worker when the process lands on a core.
    pub fn set_dispatched(&self, core: usize) {
        let mut st = self.state.lock().unwrap();
        st.core_id = Some(core);
        st.running = true;
    }

    pub fn clear_dispatched(&self) {
        let mut st = self.state.lock().unwrap();
        st.core_id = None;
        st.running = false;
    }

    pub fn output_log(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.output.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let st = self.state.lock().unwrap();
        ProcessSnapshot {
            name: self.name.clone(),
            pc: st.pc,
            total_instructions: self.instructions.len(),
            core_id: st.core_id,
            running: st.running,
            finished: st.violation.is_some() || st.pc >= self.instructions.len(),
            violation: st.violation.clone(),
            created_at: self.created_at,
            finished_at: st.finished_at,
            virtual_bytes: self.virtual_bytes,
            resident_bytes: 0,
        }
    }

    /// Run at most `quantum` top-level instructions (`None` runs to
    /// completion or violation). A FOR block counts as one top-level
    /// instruction no matter how large its body.
    ///
    /// Only `BackingStoreIo` escapes; access violations terminate the
    /// process in place.
    pub fn execute(
        &self,
        memory: &MemoryManager,
        delays_per_exec: u32,
        quantum: Option<u32>,
    ) -> Result<()> {
        let total = self.instructions.len();
        let mut executed = 0u32;
        loop {
            if quantum.map_or(false, |q| executed >= q) {
                break;
            }
            busy_delay(delays_per_exec);
            let mut st = self.state.lock().unwrap();
            if st.violation.is_some() || st.pc >= total {
                st.mark_finished();
                return Ok(());
            }
            let inst = &self.instructions[st.pc];
            self.run(&mut st, inst, memory, delays_per_exec)?;
            if st.violation.is_none() {
                st.pc += 1;
            }
            executed += 1;
            if st.violation.is_some() || st.pc >= total {
                st.mark_finished();
                return Ok(());
            }
        }
        let mut st = self.state.lock().unwrap();
        if st.violation.is_some() || st.pc >= total {
            st.mark_finished();
        }
        Ok(())
    }

    fn run(
        &self,
        st: &mut ProcState,
        inst: &Instruction,
        memory: &MemoryManager,
        delays_per_exec: u32,
    ) -> Result<()> {
        match inst {
            Instruction::Declare { var, value } => {
                if st.symbols.len() < MAX_VARIABLES {
                    let value = self.resolve(st, value, memory)?;
                    self.set_variable(st, var, value, memory)?;
                }
                // table full: declaration is silently dropped
            }
            Instruction::Add { dest, lhs, rhs } => {
                let value = self
                    .resolve(st, lhs, memory)?
                    .wrapping_add(self.resolve(st, rhs, memory)?);
                if st.violation.is_none() {
                    self.set_variable(st, dest, value, memory)?;
                }
            }
            Instruction::Subtract { dest, lhs, rhs } => {
                let value = self
                    .resolve(st, lhs, memory)?
                    .wrapping_sub(self.resolve(st, rhs, memory)?);
                if st.violation.is_none() {
                    self.set_variable(st, dest, value, memory)?;
                }
            }
            Instruction::Read { var, addr } => match memory.read(&self.name, *addr) {
                Ok(value) => {
                    if st.symbols.contains_key(var) || st.symbols.len() < MAX_VARIABLES {
                        self.set_variable(st, var, value, memory)?;
                    }
                }
                Err(OsError::AccessViolation { addr }) => self.trigger_violation(st, addr),
                Err(e) => return Err(e),
            },
            Instruction::Write { addr, value } => {
                let value = self.resolve(st, value, memory)?;
                if st.violation.is_none() {
                    match memory.write(&self.name, *addr, value) {
                        Ok(()) => {}
                        Err(OsError::AccessViolation { addr }) => self.trigger_violation(st, addr),
                        Err(e) => return Err(e),
                    }
                }
            }
            Instruction::Print { message } => {
                let text = self.substitute(st, message, memory)?;
                if st.violation.is_some() {
                    return Ok(());
                }
                let core = st.core_id.map_or(-1, |c| c as i64);
                let line = format!(
                    "({}) Core:{} \"{}\"",
                    format_timestamp(&Local::now()),
                    core,
                    text
                );
                if st.output.len() == MAX_OUTPUT_LINES {
                    st.output.pop_front();
                }
                st.output.push_back(line);
            }
            Instruction::Sleep { millis } => {
                thread::sleep(Duration::from_millis(*millis as u64));
            }
            Instruction::For { count, body } => {
                for _ in 0..*count {
                    if st.violation.is_some() {
                        break;
                    }
                    for inner in body {
                        if st.violation.is_some() {
                            break;
                        }
                        busy_delay(delays_per_exec);
                        self.run(st, inner, memory, delays_per_exec)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace every `%name%` token with the variable's current value
    /// (unbound names print as 0). A lone `%` passes through unchanged.
    fn substitute(
        &self,
        st: &mut ProcState,
        message: &str,
        memory: &MemoryManager,
    ) -> Result<String> {
        let mut out = String::new();
        let mut rest = message;
        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(end) if end > 0 => {
                    let name = after[..end].to_string();
                    let value = self.resolve(st, &Operand::Var(name), memory)?;
                    if st.violation.is_some() {
                        return Ok(out);
                    }
                    out.push_str(&value.to_string());
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('%');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Literal operands resolve to themselves; variables are read out of
    /// paged memory, after making sure the symbol-table page is resident.
    /// Unknown names resolve to 0.
    fn resolve(&self, st: &mut ProcState, op: &Operand, memory: &MemoryManager) -> Result<u16> {
        match op {
            Operand::Literal(value) => Ok(*value),
            Operand::Var(name) => {
                self.ensure_symbol_page(st, memory)?;
                if st.violation.is_some() {
                    return Ok(0);
                }
                let addr = match st.symbols.get(name) {
                    Some(&addr) => addr,
                    None => return Ok(0),
                };
                match memory.read(&self.name, addr) {
                    Ok(value) => Ok(value),
                    Err(OsError::AccessViolation { addr }) => {
                        self.trigger_violation(st, addr);
                        Ok(0)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Bind `name` if new (2-byte slot from the symbol-table region) and
    /// store its value through the memory manager. A full table drops the
    /// binding silently.
    fn set_variable(
        &self,
        st: &mut ProcState,
        name: &str,
        value: u16,
        memory: &MemoryManager,
    ) -> Result<()> {
        self.ensure_symbol_page(st, memory)?;
        if st.violation.is_some() {
            return Ok(());
        }
        let addr = match st.symbols.get(name) {
            Some(&addr) => addr,
            None => {
                if st.next_offset >= SYMBOL_TABLE_BYTES {
                    return Ok(());
                }
                let addr = st.next_offset;
                st.symbols.insert(name.to_string(), addr);
                st.next_offset += 2;
                addr
            }
        };
        match memory.write(&self.name, addr, value) {
            Ok(()) => Ok(()),
            Err(OsError::AccessViolation { addr }) => {
                self.trigger_violation(st, addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Touch logical address 0 so the page holding the symbol table is
    /// resident before a variable access.
    fn ensure_symbol_page(&self, st: &mut ProcState, memory: &MemoryManager) -> Result<()> {
        match memory.read(&self.name, 0) {
            Ok(_) => Ok(()),
            Err(OsError::AccessViolation { addr }) => {
                self.trigger_violation(st, addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn trigger_violation(&self, st: &mut ProcState, addr: u16) {
        if st.violation.is_some() {
            return;
        }
        let now = Local::now();
        st.violation = Some(Violation { addr, at: now });
        st.finished_at.get_or_insert(now);
    }
}

impl ProcState {
    // finish timestamp is recorded exactly once
    fn mark_finished(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Local::now());
        }
    }
}

fn busy_delay(iterations: u32) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}
