use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::backing_store::BackingStore;
use crate::error::{OsError, Result};

/// Default backing-store file, truncated at scheduler start.
pub const DEFAULT_STORE_FILE: &str = "backing-store.bin";

/// A physical memory slot. `owner` doubles as the allocated flag.
#[derive(Debug, Clone)]
pub struct Frame {
    pub owner: Option<FrameOwner>,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
pub struct FrameOwner {
    pub process: String,
    pub page: usize,
}

impl Frame {
    fn empty() -> Self {
        Frame {
            owner: None,
            dirty: false,
        }
    }

    pub fn allocated(&self) -> bool {
        self.owner.is_some()
    }
}

// valid <=> frame.is_some()
#[derive(Debug, Clone, Default)]
struct PageTableEntry {
    frame: Option<usize>,
    dirty: bool,
}

struct ProcessPages {
    entries: Vec<PageTableEntry>,
    virtual_bytes: usize,
    /// First slot of this process in the backing store; stable for the
    /// process's lifetime.
    store_base: u64,
}

struct MemState {
    frames: Vec<Frame>,
    /// Physical memory as 16-bit cells, `frame_bytes / 2` per frame.
    cells: Vec<u16>,
    free_list: VecDeque<usize>,
    /// FIFO victim cursor; advances by index across all frames.
    last_victim: Option<usize>,
    tables: HashMap<String, ProcessPages>,
    next_store_page: u64,
    store: BackingStore,
}

/// Demand-paged memory manager: global frame table, per-process page
/// tables, FIFO victim selection and a file-backed store for evicted pages.
/// The whole paging state machine runs under one mutex; the paging counters
/// are atomics readable without it.
pub struct MemoryManager {
    frame_bytes: usize,
    total_bytes: usize,
    num_frames: usize,
    paged_in: AtomicU64,
    paged_out: AtomicU64,
    state: Mutex<MemState>,
}

impl MemoryManager {
    pub fn new<P: AsRef<Path>>(
        total_bytes: usize,
        frame_bytes: usize,
        store_path: P,
    ) -> Result<Self> {
        if frame_bytes < 2 || frame_bytes % 2 != 0 {
            return Err(OsError::InvalidSize(frame_bytes));
        }
        let num_frames = total_bytes / frame_bytes;
        if num_frames == 0 {
            return Err(OsError::InvalidSize(total_bytes));
        }
        let store = BackingStore::create(store_path, frame_bytes)?;
        Ok(Self {
            frame_bytes,
            total_bytes,
            num_frames,
            paged_in: AtomicU64::new(0),
            paged_out: AtomicU64::new(0),
            state: Mutex::new(MemState {
                frames: vec![Frame::empty(); num_frames],
                cells: vec![0; num_frames * frame_bytes / 2],
                free_list: (0..num_frames).collect(),
                last_victim: None,
                tables: HashMap::new(),
                next_store_page: 0,
                store,
            }),
        })
    }

    /// Create an empty page table for a new process. Frames are allocated
    /// purely on demand.
    pub fn register_process(&self, name: &str, virtual_bytes: usize) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.tables.contains_key(name) {
            return Err(OsError::DuplicateName(name.to_string()));
        }
        let pages = (virtual_bytes + self.frame_bytes - 1) / self.frame_bytes;
        let store_base = st.next_store_page;
        st.next_store_page += pages as u64;
        st.tables.insert(
            name.to_string(),
            ProcessPages {
                entries: vec![PageTableEntry::default(); pages],
                virtual_bytes,
                store_base,
            },
        );
        Ok(())
    }

    /// Return every resident frame of the process to the free list and drop
    /// its page table. Idempotent.
    pub fn release_process(&self, name: &str) {
        let mut st = self.state.lock().unwrap();
        if st.tables.remove(name).is_none() {
            return;
        }
        let mut freed = Vec::new();
        for (index, frame) in st.frames.iter_mut().enumerate() {
            if frame.owner.as_ref().map_or(false, |o| o.process == name) {
                frame.owner = None;
                frame.dirty = false;
                freed.push(index);
            }
        }
        debug!("released {} frame(s) of '{}'", freed.len(), name);
        st.free_list.extend(freed);
    }

    /// 16-bit load at a process-logical byte address.
    pub fn read(&self, name: &str, addr: u16) -> Result<u16> {
        let mut st = self.state.lock().unwrap();
        let cell = self.locate(&mut st, name, addr)?;
        Ok(st.cells[cell])
    }

    /// 16-bit store at a process-logical byte address; marks the page and
    /// frame dirty.
    pub fn write(&self, name: &str, addr: u16, value: u16) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let cell = self.locate(&mut st, name, addr)?;
        st.cells[cell] = value;
        let page = addr as usize / self.frame_bytes;
        let frame = cell / (self.frame_bytes / 2);
        st.frames[frame].dirty = true;
        if let Some(table) = st.tables.get_mut(name) {
            table.entries[page].dirty = true;
        }
        Ok(())
    }

    /// Translate an address, faulting the page in if needed, and return the
    /// physical cell index.
    fn locate(&self, st: &mut MemState, name: &str, addr: u16) -> Result<usize> {
        let page = addr as usize / self.frame_bytes;
        let offset = addr as usize % self.frame_bytes;
        let resident = {
            let table = st.tables.get(name).ok_or(OsError::NotInitialized)?;
            if addr as usize >= table.virtual_bytes || page >= table.entries.len() {
                return Err(OsError::AccessViolation { addr });
            }
            table.entries[page].frame
        };
        let frame = match resident {
            Some(frame) => frame,
            None => self.handle_fault(st, name, page)?,
        };
        Ok(frame * (self.frame_bytes / 2) + offset / 2)
    }

    /// Bring `page` of `name` into memory: head of the free list if any,
    /// otherwise the next frame under the FIFO victim cursor (picked
    /// regardless of its dirty/free status).
    fn handle_fault(&self, st: &mut MemState, name: &str, page: usize) -> Result<usize> {
        let frame = match st.free_list.pop_front() {
            Some(frame) => frame,
            None => {
                let next = st.last_victim.map_or(0, |v| (v + 1) % self.num_frames);
                st.last_victim = Some(next);
                next
            }
        };
        let cells_per_frame = self.frame_bytes / 2;

        if let Some(evicted) = st.frames[frame].owner.take() {
            if st.frames[frame].dirty {
                if let Some(table) = st.tables.get(&evicted.process) {
                    let slot = table.store_base + evicted.page as u64;
                    let MemState { cells, store, .. } = &mut *st;
                    store.write_page(slot, &cells[frame * cells_per_frame..][..cells_per_frame])?;
                    self.paged_out.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "paged out '{}' page {} from frame {}",
                        evicted.process, evicted.page, frame
                    );
                }
            }
            if let Some(table) = st.tables.get_mut(&evicted.process) {
                table.entries[evicted.page] = PageTableEntry::default();
            }
            st.frames[frame].dirty = false;
        }

        let slot = {
            let table = st.tables.get(name).ok_or(OsError::NotInitialized)?;
            table.store_base + page as u64
        };
        {
            let MemState { cells, store, .. } = &mut *st;
            store.read_page(slot, &mut cells[frame * cells_per_frame..][..cells_per_frame])?;
        }
        self.paged_in.fetch_add(1, Ordering::SeqCst);
        debug!("paged in '{}' page {} to frame {}", name, page, frame);

        st.frames[frame] = Frame {
            owner: Some(FrameOwner {
                process: name.to_string(),
                page,
            }),
            dirty: false,
        };
        if let Some(table) = st.tables.get_mut(name) {
            table.entries[page] = PageTableEntry {
                frame: Some(frame),
                dirty: false,
            };
        }
        Ok(frame)
    }

    pub fn paged_in(&self) -> u64 {
        self.paged_in.load(Ordering::SeqCst)
    }

    pub fn paged_out(&self) -> u64 {
        self.paged_out.load(Ordering::SeqCst)
    }

    pub fn total_frames(&self) -> usize {
        self.num_frames
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn used_frames(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.frames.iter().filter(|f| f.allocated()).count()
    }

    pub fn free_frames(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.free_list.len()
    }

    /// Resident memory of one process, in bytes.
    pub fn process_resident(&self, name: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.frames
            .iter()
            .filter(|f| f.owner.as_ref().map_or(false, |o| o.process == name))
            .count()
            * self.frame_bytes
    }

    /// Point-in-time copy of the frame table for the console's memory view.
    pub fn frame_table(&self) -> Vec<Frame> {
        let st = self.state.lock().unwrap();
        st.frames.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tag: &str, total: usize, frame: usize) -> MemoryManager {
        let path = std::env::temp_dir().join(format!(
            "nimbus-mm-test-{}-{}.bin",
            tag,
            std::process::id()
        ));
        MemoryManager::new(total, frame, path).unwrap()
    }

    #[test]
    fn register_rejects_duplicates() {
        let mm = manager("dup", 256, 64);
        mm.register_process("a", 128).unwrap();
        assert!(matches!(
            mm.register_process("a", 128),
            Err(OsError::DuplicateName(_))
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mm = manager("rw", 256, 64);
        mm.register_process("a", 128).unwrap();
        mm.write("a", 10, 1234).unwrap();
        assert_eq!(mm.read("a", 10).unwrap(), 1234);
        // both accesses hit the same page, one fault total
        assert_eq!(mm.paged_in(), 1);
        assert_eq!(mm.paged_out(), 0);
    }

    #[test]
    fn out_of_range_address_is_a_violation() {
        let mm = manager("oob", 256, 64);
        mm.register_process("a", 128).unwrap();
        assert_eq!(mm.read("a", 127).unwrap(), 0);
        assert!(matches!(
            mm.read("a", 128),
            Err(OsError::AccessViolation { addr: 128 })
        ));
        assert!(matches!(
            mm.write("a", 0xFFFF, 1),
            Err(OsError::AccessViolation { addr: 0xFFFF })
        ));
    }

    #[test]
    fn size_bound_is_checked_even_within_the_first_page() {
        // 64-byte process inside a 4 KiB frame: the page exists, the
        // address space ends at 64
        let mm = manager("tightbound", 16384, 4096);
        mm.register_process("a", 64).unwrap();
        assert_eq!(mm.read("a", 63).unwrap(), 0);
        assert!(matches!(
            mm.read("a", 64),
            Err(OsError::AccessViolation { addr: 64 })
        ));
    }

    #[test]
    fn eviction_round_trips_through_backing_store() {
        // one frame total, so every second access evicts
        let mm = manager("evict", 64, 64);
        mm.register_process("a", 128).unwrap();
        mm.write("a", 0, 111).unwrap(); // fault page 0
        mm.write("a", 64, 222).unwrap(); // evicts dirty page 0
        assert_eq!(mm.read("a", 0).unwrap(), 111); // evicts dirty page 1, reloads 0
        assert_eq!(mm.read("a", 64).unwrap(), 222);
        assert!(mm.paged_in() >= 3);
        assert!(mm.paged_out() >= 2);
        assert!(mm.paged_in() >= mm.paged_out());
    }

    #[test]
    fn processes_do_not_share_store_slots() {
        let mm = manager("isolated", 64, 64);
        mm.register_process("a", 128).unwrap();
        mm.register_process("b", 128).unwrap();
        mm.write("a", 0, 41).unwrap();
        mm.write("b", 0, 42).unwrap(); // evicts a's page
        assert_eq!(mm.read("a", 0).unwrap(), 41);
        assert_eq!(mm.read("b", 0).unwrap(), 42);
    }

    #[test]
    fn release_returns_frames_and_is_idempotent() {
        let mm = manager("release", 256, 64);
        mm.register_process("a", 256).unwrap();
        mm.write("a", 0, 1).unwrap();
        mm.write("a", 64, 2).unwrap();
        assert_eq!(mm.used_frames(), 2);
        assert_eq!(mm.process_resident("a"), 128);
        mm.release_process("a");
        mm.release_process("a");
        assert_eq!(mm.used_frames(), 0);
        assert_eq!(mm.free_frames(), mm.total_frames());
        assert_eq!(mm.process_resident("a"), 0);
    }

    #[test]
    fn frame_accounting_invariant_holds() {
        let mm = manager("invariant", 256, 64);
        mm.register_process("a", 256).unwrap();
        mm.register_process("b", 256).unwrap();
        for addr in [0u16, 64, 128, 192] {
            mm.write("a", addr, addr).unwrap();
            assert_eq!(mm.free_frames() + mm.used_frames(), mm.total_frames());
        }
        mm.write("b", 0, 7).unwrap(); // forces an eviction
        assert_eq!(mm.free_frames() + mm.used_frames(), mm.total_frames());
        mm.release_process("a");
        assert_eq!(mm.free_frames() + mm.used_frames(), mm.total_frames());
        assert!(mm.used_frames() * mm.frame_bytes() <= mm.total_bytes());
    }

    #[test]
    fn reregistration_restores_initial_state() {
        let mm = manager("rereg", 256, 64);
        mm.register_process("a", 128).unwrap();
        mm.write("a", 0, 99).unwrap();
        mm.release_process("a");
        mm.register_process("a", 128).unwrap();
        // fresh table: nothing resident until touched again
        assert_eq!(mm.process_resident("a"), 0);
        assert_eq!(mm.used_frames(), 0);
    }
}
