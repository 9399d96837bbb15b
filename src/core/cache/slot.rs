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

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex, MutexGuard};

use core::store::SECTOR_SIZE;
use core::util::{SectorId, NO_SECTOR};
use error::Result;

/// Book-keeping half of a cache slot, guarded by the slot mutex.
///
/// The two I/O flags and the four counters drive the admission protocol:
/// readers and writers first register as waiters, then sleep on the slot
/// condition variable until the state lets them in. Every transition that
/// clears a flag or decrements a counter broadcasts, since readers,
/// writers, the evictor and the flusher all block on different predicates
/// of the same condition variable.
pub(crate) struct SlotState {
    /// Sector this slot holds, or `NO_SECTOR`.
    pub sector_id: SectorId,
    /// Clock-algorithm reference bit.
    pub accessed: bool,
    /// The payload differs from the device.
    pub dirty: bool,
    /// A device load into the payload is in flight.
    pub loading: bool,
    /// The slot is queued for, or undergoing, a write-behind flush. It
    /// must not be re-keyed until the worker clears this.
    pub flushing: bool,
    /// Readers currently copying out of the payload.
    pub active_readers: u32,
    /// Writers currently copying into the payload. Never exceeds one.
    pub active_writers: u32,
    /// Readers registered and asleep on the condition variable.
    pub waiting_readers: u32,
    /// Writers registered and asleep on the condition variable.
    pub waiting_writers: u32,
}

impl SlotState {
    /// True if eviction must pass this slot over.
    pub fn busy(&self) -> bool {
        self.loading
            || self.flushing
            || self.active_readers + self.active_writers + self.waiting_readers
                + self.waiting_writers
                > 0
    }
}

/// One cache slot: admission state, a condition variable, and a
/// sector-sized payload.
///
/// The payload deliberately lives outside the mutex so that byte copies
/// run without the slot lock held and readers of the same sector overlap.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
    payload: UnsafeCell<[u8; SECTOR_SIZE]>,
}

// The payload cell is only touched by parties the state machine admits:
// overlapping readers (`active_readers > 0`, shared access), one writer
// (`active_writers == 1`), the loader (`loading`) or the flusher
// (`flushing`). The admission predicates make the exclusive holders
// mutually exclusive with everything else.
unsafe impl Sync for Slot {}

impl Slot {
    pub fn new() -> Slot {
        Slot {
            state: Mutex::new(SlotState {
                sector_id: NO_SECTOR,
                accessed: false,
                dirty: false,
                loading: false,
                flushing: false,
                active_readers: 0,
                active_writers: 0,
                waiting_readers: 0,
                waiting_writers: 0,
            }),
            cond: Condvar::new(),
            payload: UnsafeCell::new([0u8; SECTOR_SIZE]),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<SlotState>> {
        Ok(self.state.lock()?)
    }

    pub fn wait<'a>(
        &self,
        guard: MutexGuard<'a, SlotState>,
    ) -> Result<MutexGuard<'a, SlotState>> {
        Ok(self.cond.wait(guard)?)
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Blocks until the calling reader is admitted, converting its
    /// registration into an active hold, and releases the slot lock.
    ///
    /// The caller must already be counted in `waiting_readers`. Returns
    /// `false`, after deregistering, if the slot stopped holding `sector`
    /// while the caller slept (a failed load un-keyed it); the caller then
    /// re-scans the table.
    pub fn await_read(&self, sector: SectorId, mut guard: MutexGuard<SlotState>) -> Result<bool> {
        debug_assert!(guard.waiting_readers > 0);
        // Readers also yield to registered writers, so a stream of readers
        // cannot starve a writer.
        while guard.loading
            || guard.flushing
            || guard.waiting_writers + guard.active_writers > 0
        {
            guard = self.wait(guard)?;
        }
        guard.waiting_readers -= 1;
        if guard.sector_id != sector {
            self.notify_all();
            return Ok(false);
        }
        guard.active_readers += 1;
        debug_assert!(guard.active_writers == 0);
        Ok(true)
    }

    /// Writer counterpart of `await_read`; at most one writer is admitted
    /// at a time.
    pub fn await_write(&self, sector: SectorId, mut guard: MutexGuard<SlotState>) -> Result<bool> {
        debug_assert!(guard.waiting_writers > 0);
        while guard.loading
            || guard.flushing
            || guard.active_readers + guard.active_writers > 0
        {
            guard = self.wait(guard)?;
        }
        guard.waiting_writers -= 1;
        if guard.sector_id != sector {
            self.notify_all();
            return Ok(false);
        }
        guard.active_writers += 1;
        debug_assert!(guard.active_writers == 1 && guard.active_readers == 0);
        Ok(true)
    }

    /// Drops an active read hold and wakes whatever the release may
    /// unblock.
    pub fn finish_read(&self) -> Result<()> {
        let mut guard = self.lock()?;
        debug_assert!(guard.active_readers > 0 && guard.active_writers == 0);
        guard.active_readers -= 1;
        guard.accessed = true;
        self.notify_all();
        Ok(())
    }

    /// Drops the active write hold, marking the payload dirty.
    pub fn finish_write(&self) -> Result<()> {
        let mut guard = self.lock()?;
        debug_assert!(guard.active_writers == 1 && guard.active_readers == 0);
        guard.active_writers -= 1;
        guard.dirty = true;
        guard.accessed = true;
        self.notify_all();
        Ok(())
    }

    /// Copies `dst.len()` payload bytes starting at `start` into `dst`.
    ///
    /// The caller must hold an admission that grants shared access: an
    /// active read, or the `flushing` reservation.
    pub unsafe fn copy_out(&self, start: usize, dst: &mut [u8]) {
        let payload = &*self.payload.get();
        dst.copy_from_slice(&payload[start..start + dst.len()]);
    }

    /// Overwrites payload bytes `[start, start + src.len())` with `src`.
    ///
    /// The caller must hold an exclusive admission: the active write, or
    /// the `loading` reservation.
    pub unsafe fn copy_in(&self, start: usize, src: &[u8]) {
        let payload = &mut *self.payload.get();
        payload[start..start + src.len()].copy_from_slice(src);
    }

    /// Exclusive view of the whole payload for the device loader. The
    /// caller must hold the `loading` reservation.
    pub unsafe fn payload_mut(&self) -> &mut [u8; SECTOR_SIZE] {
        &mut *self.payload.get()
    }

    /// Shared view of the whole payload for the flusher. The caller must
    /// hold the `flushing` reservation.
    pub unsafe fn payload(&self) -> &[u8; SECTOR_SIZE] {
        &*self.payload.get()
    }
}
