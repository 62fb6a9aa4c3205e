use chrono::{DateTime, Local};

use crate::process::Violation;

/// Timestamp format used in logs, listings and reports.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format("%m/%d/%Y, %I:%M:%S %p").to_string()
}

/// Read-only view of one process, as handed to the console.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub name: String,
    pub pc: usize,
    pub total_instructions: usize,
    pub core_id: Option<usize>,
    pub running: bool,
    pub finished: bool,
    pub violation: Option<Violation>,
    pub created_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub virtual_bytes: usize,
    pub resident_bytes: usize,
}

/// Aggregate memory and tick statistics for the `vmstat` view.
#[derive(Debug, Clone)]
pub struct VmStat {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub idle_ticks: u64,
    pub active_ticks: u64,
    pub total_ticks: u64,
    pub paged_in: u64,
    pub paged_out: u64,
}
