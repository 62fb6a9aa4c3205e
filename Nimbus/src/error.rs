use std::fmt;
use std::io;

/// Errors surfaced by the emulator core. User-input problems are reported
/// back to the console; `BackingStoreIo` is fatal and shuts the scheduler
/// down.
#[derive(Debug)]
pub enum OsError {
    /// A process with this name is already registered.
    DuplicateName(String),
    /// Requested virtual-memory size is not a power of two inside the
    /// configured bounds.
    InvalidSize(usize),
    /// A logical address outside the process's address space.
    AccessViolation { addr: u16 },
    /// I/O failure on the backing-store file.
    BackingStoreIo(io::Error),
    /// An operation was issued before the scheduler/process was set up.
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, OsError>;

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::DuplicateName(name) => write!(f, "process '{}' already exists", name),
            OsError::InvalidSize(size) => write!(
                f,
                "invalid memory size {} (must be a power of two within the configured bounds)",
                size
            ),
            OsError::AccessViolation { addr } => {
                write!(f, "memory access violation at 0x{:X}", addr)
            }
            OsError::BackingStoreIo(e) => write!(f, "backing store I/O failure: {}", e),
            OsError::NotInitialized => write!(f, "not initialized"),
        }
    }
}

impl std::error::Error for OsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OsError::BackingStoreIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OsError {
    fn from(e: io::Error) -> Self {
        OsError::BackingStoreIo(e)
    }
}
