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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use core::cache::slot::{Slot, SlotState};
use core::cache::write_behind::{flush_loop, WriteBehindQueue};
use core::store::{BlockDevice, SECTOR_SIZE};
use core::util::{SectorId, NO_SECTOR};
use error::{ErrorKind, Result};

/// Number of slots a cache created through `BufferCache::new` holds.
pub const DEFAULT_CACHE_SLOTS: usize = 64;

/// Point-in-time counters describing cache traffic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub flushes: AtomicU64,
    pub failed_flushes: AtomicU64,
}

/// State shared between the public API and the flusher worker.
pub(crate) struct CacheCore<D: BlockDevice> {
    pub device: Arc<D>,
    pub slots: Box<[Slot]>,
    /// Global table lock. Guards the clock hand and serializes lookup and
    /// eviction, which together own every identity change: a slot is only
    /// re-keyed while this lock is held. Shutdown also flips `closed`
    /// under it, and admissions re-check the flag once they hold it.
    /// Released before any wait on a slot condition variable in the miss
    /// path and before any device call.
    pub hand: Mutex<usize>,
    pub queue: WriteBehindQueue,
    pub closed: AtomicBool,
    pub counters: Counters,
}

/// A fixed-capacity, thread-safe cache of device sectors with clock
/// (second chance) eviction and write-behind flushing.
///
/// Operations on the same sector are linearizable in the order callers
/// clear the per-slot admission protocol; operations on different sectors
/// proceed in parallel. `write` returns as soon as the cache holds the new
/// payload; dirty sectors reach the device when eviction hands them to the
/// background worker, and `shutdown` flushes whatever is still dirty.
///
/// Two caches are fully independent, even over the same device.
pub struct BufferCache<D: BlockDevice> {
    core: Arc<CacheCore<D>>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Creates a cache with `DEFAULT_CACHE_SLOTS` slots over `device` and
    /// starts its write-behind worker.
    pub fn new(device: Arc<D>) -> BufferCache<D> {
        Self::with_slots(device, DEFAULT_CACHE_SLOTS)
    }

    /// Creates a cache with `slots` slots. The slot array is sized once,
    /// here, and never grows or shrinks afterwards.
    pub fn with_slots(device: Arc<D>, slots: usize) -> BufferCache<D> {
        assert!(slots > 0, "a cache needs at least one slot");
        let mut table = Vec::with_capacity(slots);
        for _ in 0..slots {
            table.push(Slot::new());
        }
        let core = Arc::new(CacheCore {
            device,
            slots: table.into_boxed_slice(),
            hand: Mutex::new(0),
            queue: WriteBehindQueue::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let worker = Arc::clone(&core);
        let flusher = thread::Builder::new()
            .name("write-behind".into())
            .spawn(move || flush_loop(worker))
            .expect("failed to spawn the write-behind worker");
        debug!("buffer cache up with {} slots", slots);
        BufferCache {
            core,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Number of slots in the table.
    pub fn slot_count(&self) -> usize {
        self.core.slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.core.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Number of slots whose payload has not reached the device yet.
    pub fn dirty_slots(&self) -> Result<usize> {
        let mut dirty = 0;
        for slot in self.core.slots.iter() {
            if slot.lock()?.dirty {
                dirty += 1;
            }
        }
        Ok(dirty)
    }

    /// Reads sector `sector` into `buf`.
    pub fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.read_partial(sector, buf, 0, SECTOR_SIZE)
    }

    /// Writes `buf` to sector `sector`. Returns once the cache holds the
    /// new payload; the device copy happens behind the caller's back.
    pub fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.write_partial(sector, buf, 0, SECTOR_SIZE)
    }

    /// Reads bytes `[start, start + length)` of sector `sector` into
    /// `buf[..length]`.
    pub fn read_partial(
        &self,
        sector: SectorId,
        buf: &mut [u8],
        start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(sector, buf.len(), start, length)?;
        loop {
            self.ensure_open()?;
            let mut hand = self.core.hand.lock()?;
            // Shutdown flips the closed flag under the table lock;
            // re-check now that we hold it.
            self.ensure_open()?;
            if let Some((idx, guard)) = self.find_slot(sector, false)? {
                drop(hand);
                if self.read_admitted(idx, sector, guard, &mut buf[..length], start)? {
                    self.core.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                // The slot lost its identity while we slept; re-scan.
                continue;
            }
            self.core.counters.misses.fetch_add(1, Ordering::Relaxed);
            let (idx, mut victim) = self.take_victim(&mut hand)?;
            victim.sector_id = sector;
            victim.accessed = false;
            victim.dirty = false;
            drop(hand);
            return self.read_miss(idx, sector, victim, &mut buf[..length], start);
        }
    }

    /// Writes `buf[..length]` to bytes `[start, start + length)` of sector
    /// `sector`. A write that covers part of a sector not yet cached loads
    /// the sector first; the whole slot is marked dirty either way.
    pub fn write_partial(
        &self,
        sector: SectorId,
        buf: &[u8],
        start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(sector, buf.len(), start, length)?;
        loop {
            self.ensure_open()?;
            let mut hand = self.core.hand.lock()?;
            // Shutdown flips the closed flag under the table lock;
            // re-check now that we hold it.
            self.ensure_open()?;
            if let Some((idx, guard)) = self.find_slot(sector, true)? {
                drop(hand);
                if self.write_admitted(idx, sector, guard, &buf[..length], start)? {
                    self.core.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
            self.core.counters.misses.fetch_add(1, Ordering::Relaxed);
            let (idx, mut victim) = self.take_victim(&mut hand)?;
            victim.sector_id = sector;
            victim.accessed = false;
            victim.dirty = false;
            drop(hand);
            return self.write_miss(idx, sector, victim, &buf[..length], start);
        }
    }

    /// Stops admitting requests, pushes every dirty slot through the
    /// write-behind queue, waits for the queue to drain and joins the
    /// worker. Dirty payloads have reached the device when this returns.
    pub fn shutdown(&self) -> Result<()> {
        {
            // Flip the flag while holding the table lock: admissions
            // re-check it under the same lock, so whatever got in ahead
            // of us is already registered on its slot and the sweep
            // below waits it out before looking at the dirty bit.
            let _hand = self.core.hand.lock()?;
            if self.core.closed.swap(true, Ordering::AcqRel) {
                bail!(ErrorKind::AlreadyClosed(
                    "buffer cache is already shut down".to_string()
                ));
            }
        }
        debug!("buffer cache: shutting down, flushing dirty slots");
        for (idx, slot) in self.core.slots.iter().enumerate() {
            let mut state = slot.lock()?;
            // Let in-flight operations finish; nothing new is admitted.
            while state.loading
                || state.active_readers + state.active_writers + state.waiting_readers
                    + state.waiting_writers
                    > 0
            {
                state = slot.wait(state)?;
            }
            if state.dirty && !state.flushing {
                state.flushing = true;
                drop(state);
                if !self.core.queue.push(idx) {
                    // Only reachable if the queue was closed behind our
                    // back; release the reservation rather than wedge
                    // the slot.
                    let mut state = slot.lock()?;
                    state.flushing = false;
                    slot.notify_all();
                }
            }
        }
        self.core.queue.close();
        if let Some(worker) = self.flusher.lock()?.take() {
            if worker.join().is_err() {
                // The worker died mid-queue. Release the reservations it
                // will never clear, so nothing waits on them forever,
                // then report; the payloads stay dirty and their data is
                // lost with the worker.
                for slot in self.core.slots.iter() {
                    let mut state = slot.lock()?;
                    if state.flushing {
                        state.flushing = false;
                        slot.notify_all();
                    }
                }
                bail!(ErrorKind::IllegalState(
                    "write-behind worker panicked".to_string()
                ));
            }
        }
        if cfg!(debug_assertions) {
            for slot in self.core.slots.iter() {
                debug_assert!(!slot.lock()?.flushing);
            }
        }
        debug!("buffer cache: shutdown complete");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            bail!(ErrorKind::AlreadyClosed(
                "buffer cache is shut down".to_string()
            ));
        }
        Ok(())
    }

    /// Linear scan for `sector` under the global lock. On a hit the caller
    /// is pre-registered as a waiter, so eviction cannot take the slot out
    /// from under it, and the slot lock comes back still held.
    fn find_slot(
        &self,
        sector: SectorId,
        for_write: bool,
    ) -> Result<Option<(usize, MutexGuard<SlotState>)>> {
        for (idx, slot) in self.core.slots.iter().enumerate() {
            let mut state = slot.lock()?;
            if state.sector_id != sector {
                continue;
            }
            // A flush owns the payload but not the identity; wait it out
            // rather than racing the worker.
            while state.flushing {
                state = slot.wait(state)?;
            }
            if state.sector_id != sector {
                // Flushing slots are never re-keyed, so the match cannot
                // really go away. Keep scanning regardless.
                continue;
            }
            if for_write {
                state.waiting_writers += 1;
            } else {
                state.waiting_readers += 1;
            }
            return Ok(Some((idx, state)));
        }
        Ok(None)
    }

    /// Clock sweep, run under the global lock. Returns the victim index
    /// with its slot lock held. Every pass over a slot either clears its
    /// reference bit, starts a flush, or yields it as the victim, so the
    /// sweep terminates as soon as any slot goes quiet.
    fn take_victim<'a>(
        &'a self,
        hand: &mut MutexGuard<usize>,
    ) -> Result<(usize, MutexGuard<'a, SlotState>)> {
        loop {
            let idx = **hand;
            **hand = (idx + 1) % self.core.slots.len();
            let slot = &self.core.slots[idx];
            let mut state = slot.lock()?;
            if state.busy() {
                continue;
            }
            if state.accessed {
                // Second chance.
                state.accessed = false;
                continue;
            }
            if state.dirty {
                // Reserve the slot for the worker and move on; it becomes
                // evictable once the flush lands.
                state.flushing = true;
                drop(state);
                if !self.core.queue.push(idx) {
                    // Lost a race with shutdown; back the reservation out.
                    let mut state = slot.lock()?;
                    state.flushing = false;
                    slot.notify_all();
                    bail!(ErrorKind::AlreadyClosed(
                        "buffer cache is shut down".to_string()
                    ));
                }
                continue;
            }
            if state.sector_id != NO_SECTOR {
                self.core.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            return Ok((idx, state));
        }
    }

    /// Loads `sector` from the device into the slot's payload. Releases
    /// the slot lock around the device call and returns it re-acquired
    /// with `loading` cleared, so the caller can register its admission
    /// before anything else can claim the slot.
    fn load<'a>(
        &self,
        slot: &'a Slot,
        sector: SectorId,
        mut guard: MutexGuard<'a, SlotState>,
    ) -> Result<MutexGuard<'a, SlotState>> {
        // A flush enqueued before the re-key may still own the payload.
        // Victim selection skips flushing slots, so this does not happen
        // today; wait it out all the same.
        while guard.flushing {
            guard = slot.wait(guard)?;
        }
        guard.loading = true;
        drop(guard);

        let res = self
            .core
            .device
            .read_sector(sector, unsafe { slot.payload_mut() });

        let mut guard = slot.lock()?;
        guard.loading = false;
        slot.notify_all();
        if let Err(e) = res {
            // Give the slot up so a retry loads afresh instead of anyone
            // being served the garbage payload.
            guard.sector_id = NO_SECTOR;
            guard.dirty = false;
            guard.accessed = false;
            return Err(e);
        }
        Ok(guard)
    }

    /// Hit path: the caller is pre-registered as a waiting reader and
    /// holds the slot lock. Returns `false` if the slot stopped holding
    /// `sector` before admission; the caller then re-scans.
    fn read_admitted(
        &self,
        idx: usize,
        sector: SectorId,
        guard: MutexGuard<SlotState>,
        dst: &mut [u8],
        start: usize,
    ) -> Result<bool> {
        let slot = &self.core.slots[idx];
        if !slot.await_read(sector, guard)? {
            return Ok(false);
        }
        unsafe { slot.copy_out(start, dst) };
        slot.finish_read()?;
        Ok(true)
    }

    fn write_admitted(
        &self,
        idx: usize,
        sector: SectorId,
        guard: MutexGuard<SlotState>,
        src: &[u8],
        start: usize,
    ) -> Result<bool> {
        let slot = &self.core.slots[idx];
        if !slot.await_write(sector, guard)? {
            return Ok(false);
        }
        unsafe { slot.copy_in(start, src) };
        slot.finish_write()?;
        Ok(true)
    }

    /// Miss path: the slot was just re-keyed to `sector` and its lock is
    /// still held. Loads the payload, then runs the ordinary reader
    /// admission.
    fn read_miss(
        &self,
        idx: usize,
        sector: SectorId,
        guard: MutexGuard<SlotState>,
        dst: &mut [u8],
        start: usize,
    ) -> Result<()> {
        let slot = &self.core.slots[idx];
        let mut guard = self.load(slot, sector, guard)?;
        guard.waiting_readers += 1;
        if !slot.await_read(sector, guard)? {
            // A registered waiter pins the slot's identity, and the lock
            // was held from the load to the registration.
            bail!(ErrorKind::IllegalState(format!(
                "slot {} lost sector {} with waiters registered",
                idx, sector
            )));
        }
        unsafe { slot.copy_out(start, dst) };
        slot.finish_read()
    }

    /// Miss path for writes. A write covering the whole sector replaces
    /// the payload outright; a narrower one loads the sector first and
    /// patches it.
    fn write_miss(
        &self,
        idx: usize,
        sector: SectorId,
        guard: MutexGuard<SlotState>,
        src: &[u8],
        start: usize,
    ) -> Result<()> {
        let slot = &self.core.slots[idx];
        let mut guard = if src.len() < SECTOR_SIZE {
            self.load(slot, sector, guard)?
        } else {
            // The slot lock is held from the re-key to the registration
            // below, so no reader can slip in and observe the stale
            // payload.
            guard
        };
        guard.waiting_writers += 1;
        if !slot.await_write(sector, guard)? {
            bail!(ErrorKind::IllegalState(format!(
                "slot {} lost sector {} with waiters registered",
                idx, sector
            )));
        }
        unsafe { slot.copy_in(start, src) };
        slot.finish_write()
    }
}

impl<D: BlockDevice> Drop for BufferCache<D> {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::Acquire) {
            if let Err(e) = self.shutdown() {
                error!("buffer cache: shutdown during drop failed: {}", e);
            }
        }
    }
}

/// Validates a request before any lock is taken.
fn check_range(sector: SectorId, buf_len: usize, start: usize, length: usize) -> Result<()> {
    if sector == NO_SECTOR {
        bail!(ErrorKind::IllegalArgument(format!(
            "sector {} is reserved",
            sector
        )));
    }
    if length == 0 {
        bail!(ErrorKind::IllegalArgument(
            "zero-length transfer".to_string()
        ));
    }
    let in_bounds = match start.checked_add(length) {
        Some(end) => end <= SECTOR_SIZE,
        None => false,
    };
    if !in_bounds {
        bail!(ErrorKind::IllegalArgument(format!(
            "range starting at {} for {} bytes exceeds the {} byte sector",
            start, length, SECTOR_SIZE
        )));
    }
    if buf_len < length {
        bail!(ErrorKind::IllegalArgument(format!(
            "buffer holds {} bytes but the transfer asks for {}",
            buf_len, length
        )));
    }
    Ok(())
}
