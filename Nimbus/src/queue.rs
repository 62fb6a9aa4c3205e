use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::process::ProcessHandle;

/// FIFO of runnable processes. Producers never block; consumers block until
/// an item arrives or the queue is closed at shutdown.
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

struct Inner {
    items: VecDeque<ProcessHandle>,
    open: bool,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                open: true,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, process: ProcessHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(process);
        self.available.notify_one();
    }

    /// Block for the next process. Returns `None` once the queue is closed;
    /// remaining items are discarded by the shutdown drain.
    pub fn pop(&self) -> Option<ProcessHandle> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.open {
                return None;
            }
            if let Some(process) = inner.items.pop_front() {
                return Some(process);
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Wake every blocked consumer and make further pops return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn handle(name: &str) -> ProcessHandle {
        Arc::new(Process::new(name, 64, Vec::new()))
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = ReadyQueue::new();
        queue.push(handle("first"));
        queue.push(handle("second"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name(), "first");
        assert_eq!(queue.pop().unwrap().name(), "second");
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(ReadyQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn closed_queue_discards_remaining_items() {
        let queue = ReadyQueue::new();
        queue.push(handle("stranded"));
        queue.close();
        assert!(queue.pop().is_none());
    }
}
