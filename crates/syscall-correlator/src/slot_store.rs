//! Fixed-capacity table correlating call entries with their exits.
//!
//! Every (thread, call kind) pair hashes to exactly one slot. The table never
//! grows: a `put` overwrites whatever occupies the slot, either a stale record
//! of the same key (the call never reached its exit) or the record of a
//! colliding key. Both are silently discarded, trading completeness for a
//! bounded memory footprint.
//!
//! Slots are guarded by a try-lock. Hooks never wait: if a slot is held by
//! another invocation the operation behaves as if the record wasn't there.
//! Since keys contain the thread id, contention only happens on collisions.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use probe_common::ThreadId;

use crate::{kind::CallKind, record::CallRecord};

pub const DEFAULT_SLOT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotKey {
    pub thread: ThreadId,
    pub kind: CallKind,
}

#[derive(Debug)]
struct Entry {
    key: SlotKey,
    /// Increasing sequence number assigned on `put`
    seq: u64,
    record: CallRecord,
}

struct Slot {
    busy: AtomicBool,
    entry: UnsafeCell<Option<Entry>>,
}

// SAFETY: `entry` is only accessed while `busy` is held, see `Slot::try_lock`.
unsafe impl Sync for Slot {}

impl Slot {
    fn empty() -> Self {
        Self {
            busy: AtomicBool::new(false),
            entry: UnsafeCell::new(None),
        }
    }

    fn try_lock(&self) -> Option<SlotLock<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SlotLock { slot: self })
    }
}

struct SlotLock<'a> {
    slot: &'a Slot,
}

impl SlotLock<'_> {
    fn entry(&mut self) -> &mut Option<Entry> {
        // SAFETY: we hold `busy`, nobody else can reach the cell.
        unsafe { &mut *self.slot.entry.get() }
    }
}

impl Drop for SlotLock<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Mutable view of a stored record. The slot stays locked until the guard
/// is dropped, so keep it short lived.
pub struct SlotGuard<'a> {
    entry: &'a mut Entry,
    _lock: SlotLock<'a>,
}

impl SlotGuard<'_> {
    /// Sequence number the record got when stored.
    pub fn seq(&self) -> u64 {
        self.entry.seq
    }
}

impl Deref for SlotGuard<'_> {
    type Target = CallRecord;

    fn deref(&self) -> &CallRecord {
        &self.entry.record
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut CallRecord {
        &mut self.entry.record
    }
}

pub struct SlotStore {
    slots: Box<[Slot]>,
    mask: usize,
    sequence: AtomicU64,
}

impl SlotStore {
    /// Allocate the table. The capacity is rounded up to a power of two and
    /// never changes afterwards.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            mask: capacity - 1,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: SlotKey) -> &Slot {
        let hash = key.thread.as_raw() ^ ((key.kind.id() as u64) << 56);
        &self.slots[hash_index(hash, self.mask)]
    }

    /// Store `record` for `thread`, overwriting any previous occupant of the
    /// slot. Returns the sequence number of the stored record, or `None` if
    /// the slot was busy and the record was dropped.
    pub fn put(&self, thread: ThreadId, record: CallRecord) -> Option<u64> {
        let key = SlotKey {
            thread,
            kind: record.kind(),
        };
        let Some(mut lock) = self.slot(key).try_lock() else {
            log::trace!("slot busy, dropping {:?} entry of {}", key.kind, thread);
            return None;
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = lock.entry().replace(Entry { key, seq, record });
        if let Some(previous) = previous {
            if previous.key == key {
                log::trace!(
                    "discarding unmatched {} entry #{} of {}",
                    key.kind,
                    previous.seq,
                    thread
                );
            } else {
                log::trace!(
                    "evicting {} entry #{} of {} on collision",
                    previous.key.kind,
                    previous.seq,
                    previous.key.thread
                );
            }
        }
        Some(seq)
    }

    /// Borrow the record of `thread` without removing it.
    pub fn peek(&self, thread: ThreadId, kind: CallKind) -> Option<SlotGuard<'_>> {
        let key = SlotKey { thread, kind };
        let slot = self.slot(key);
        let lock = slot.try_lock()?;
        // SAFETY: `lock` holds the slot and moves into the guard along with
        // the borrow, so the slot stays locked while the entry is reachable.
        let entry = unsafe { &mut *slot.entry.get() }.as_mut()?;
        if entry.key != key {
            return None;
        }
        Some(SlotGuard { entry, _lock: lock })
    }

    /// Retrieve and remove the record of `thread`.
    pub fn pop(&self, thread: ThreadId, kind: CallKind) -> Option<CallRecord> {
        let key = SlotKey { thread, kind };
        let mut lock = self.slot(key).try_lock()?;
        let entry = lock.entry();
        if entry.as_ref().is_some_and(|stored| stored.key == key) {
            entry.take().map(|entry| entry.record)
        } else {
            None
        }
    }

    /// Number of occupied slots. Scans the whole table, not meant for hooks.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                // a busy slot is being used by a hook, count it as occupied
                slot.try_lock()
                    .map(|mut lock| lock.entry().is_some())
                    .unwrap_or(true)
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fibonacci hashing of `value` into a table of `mask + 1` entries.
pub(crate) fn hash_index(value: u64, mask: usize) -> usize {
    let hash = value.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (hash ^ (hash >> 32)) as usize & mask
}
