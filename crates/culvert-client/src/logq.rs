//! Pull-based diagnostic log buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO buffer of diagnostic strings drained one entry per poll.
///
/// The engine enqueues internally from any task; an external poller drains
/// entries one at a time over the app message channel. Enqueueing never
/// blocks and never fails. An optional capacity evicts the oldest entry
/// when the poller falls behind.
#[derive(Debug, Default)]
pub struct LogQueue {
    entries: Mutex<VecDeque<String>>,
    capacity: Option<usize>,
}

impl LogQueue {
    /// An unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue holding at most `capacity` entries. A capacity of zero is
    /// treated as one.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn enqueue(&self, entry: impl Into<String>) {
        let entry = entry.into();
        let mut entries = self.entries.lock().unwrap();
        if let Some(capacity) = self.capacity {
            while entries.len() >= capacity {
                entries.pop_front();
            }
        }
        entries.push_back(entry);
    }

    /// The oldest entry, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<String> {
        self.entries.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
