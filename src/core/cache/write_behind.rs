// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use core::cache::buffer_cache::CacheCore;
use core::store::BlockDevice;

/// FIFO of slot indices awaiting a write-behind flush.
///
/// Eviction and shutdown push, the flusher worker pops. A slot is queued
/// at most once at a time: producers set the slot's `flushing` flag before
/// enqueueing, and nothing but the worker clears it.
pub(crate) struct WriteBehindQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

struct QueueState {
    pending: VecDeque<usize>,
    closed: bool,
}

impl WriteBehindQueue {
    pub fn new() -> WriteBehindQueue {
        WriteBehindQueue {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Appends `slot` and wakes the worker. Returns `false` once the queue
    /// is closed, in which case the caller still owns the slot's
    /// `flushing` reservation and must back it out.
    pub fn push(&self, slot: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.pending.push_back(slot);
        self.ready.notify_all();
        true
    }

    /// Blocks until an index is available and pops it. Returns `None` once
    /// the queue has been closed and fully drained.
    pub fn pop(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(slot) = state.pending.pop_front() {
                return Some(slot);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    /// Stops admitting work. The worker drains what is already queued and
    /// exits.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

/// Worker body: drain the queue until it is closed and empty.
pub(crate) fn flush_loop<D: BlockDevice>(core: Arc<CacheCore<D>>) {
    debug!("write-behind worker started");
    while let Some(slot) = core.queue.pop() {
        flush_slot(&core, slot);
    }
    debug!("write-behind worker exiting");
}

/// Writes one queued slot back to the device and releases its reservation.
pub(crate) fn flush_slot<D: BlockDevice>(core: &CacheCore<D>, idx: usize) {
    let slot = &core.slots[idx];
    let sector = {
        let state = match slot.lock() {
            Ok(state) => state,
            Err(_) => {
                error!("slot {} lock poisoned, abandoning its flush", idx);
                return;
            }
        };
        debug_assert!(state.flushing);
        debug_assert!(state.active_readers == 0 && state.active_writers == 0);
        state.sector_id
    };

    // The flushing flag keeps every other party away from the payload and
    // pins the slot's identity, so the device write runs without the slot
    // lock held.
    let res = core.device.write_sector(sector, unsafe { slot.payload() });

    let mut state = match slot.lock() {
        Ok(state) => state,
        Err(_) => {
            error!("slot {} lock poisoned, abandoning its flush", idx);
            return;
        }
    };
    match res {
        Ok(()) => {
            state.dirty = false;
            core.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            // The slot stays dirty, so the next eviction pass re-enqueues
            // it.
            core.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
            error!("write-behind of sector {} failed: {}", sector, e);
        }
    }
    state.flushing = false;
    slot.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn queue_is_fifo() {
        let queue = WriteBehindQueue::new();
        assert!(queue.push(3));
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn pop_blocks_until_an_index_arrives() {
        let queue = Arc::new(WriteBehindQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.push(5));
        assert_eq!(consumer.join().unwrap(), Some(5));
    }

    #[test]
    fn close_drains_then_stops_the_consumer() {
        let queue = Arc::new(WriteBehindQueue::new());
        assert!(queue.push(0));
        assert!(queue.push(1));
        queue.close();
        assert!(!queue.push(2), "a closed queue admits nothing");
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn close_wakes_a_blocked_consumer() {
        let queue = Arc::new(WriteBehindQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
