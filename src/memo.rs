//! Lightweight identity hash table for the memo
//! - Keys are object addresses, hashed with SplitMix64
//! - Open addressing, linear probing, tombstones on delete
//! - Owns its values; never exposed to Python directly (see proxy.rs)

use std::collections::TryReserveError;

use crate::ffi::hash_pointer;

const INITIAL_SIZE: usize = 8;
const LOAD_FACTOR_NUM: usize = 7;
const LOAD_FACTOR_DEN: usize = 10;

/// Maximum size to retain between calls (131072 slots)
const RETAIN_MAX_SLOTS: usize = 1 << 17;
/// Shrink to this size (8192 slots)
const RETAIN_SHRINK_TO: usize = 1 << 13;

#[derive(Debug, Default)]
enum Slot<V> {
    #[default]
    Empty,
    Tombstone,
    Full { key: usize, value: V },
}

#[derive(Debug)]
pub struct MemoTable<V> {
    slots: Vec<Slot<V>>,
    /// Live entries.
    used: usize,
    /// Live entries plus tombstones; drives the resize decision.
    filled: usize,
}

impl<V> Default for MemoTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoTable<V> {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            used: 0,
            filled: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Resize table to new size (must be power of 2)
    fn resize(&mut self, new_size: usize) -> Result<(), TryReserveError> {
        debug_assert!(new_size.is_power_of_two());
        let mut fresh: Vec<Slot<V>> = Vec::new();
        fresh.try_reserve_exact(new_size)?;
        fresh.resize_with(new_size, || Slot::Empty);

        let mask = new_size - 1;
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Full { key, value } = slot {
                let mut idx = hash_pointer(key) & mask;
                while !matches!(fresh[idx], Slot::Empty) {
                    idx = (idx + 1) & mask;
                }
                fresh[idx] = Slot::Full { key, value };
            }
        }

        self.slots = fresh;
        self.filled = self.used;
        Ok(())
    }

    fn find(&self, key: usize) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut idx = hash_pointer(key) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Full { key: k, .. } if *k == key => return Some(idx),
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    #[inline]
    pub fn lookup(&self, key: usize) -> Option<&V> {
        match self.find(key).map(|idx| &self.slots[idx]) {
            Some(Slot::Full { value, .. }) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, key: usize) -> bool {
        self.find(key).is_some()
    }

    /// Insert or replace; returns the displaced value, if any.
    pub fn insert(&mut self, key: usize, value: V) -> Result<Option<V>, TryReserveError> {
        if self.slots.is_empty() {
            self.resize(INITIAL_SIZE)?;
        } else if (self.filled + 1) * LOAD_FACTOR_DEN >= self.slots.len() * LOAD_FACTOR_NUM {
            // Mostly tombstones: rehash in place instead of doubling.
            let new_size = if self.used * 2 < self.filled {
                self.slots.len()
            } else {
                self.slots.len() * 2
            };
            self.resize(new_size)?;
        }

        if let Some(idx) = self.find(key) {
            if let Slot::Full { value: existing, .. } = &mut self.slots[idx] {
                return Ok(Some(std::mem::replace(existing, value)));
            }
        }

        let mask = self.slots.len() - 1;
        let mut idx = hash_pointer(key) & mask;
        loop {
            match self.slots[idx] {
                Slot::Empty => {
                    self.filled += 1;
                    break;
                }
                Slot::Tombstone => break,
                Slot::Full { .. } => idx = (idx + 1) & mask,
            }
        }
        self.slots[idx] = Slot::Full { key, value };
        self.used += 1;
        Ok(None)
    }

    /// Remove an entry, leaving a tombstone so probe chains stay intact.
    pub fn remove(&mut self, key: usize) -> Option<V> {
        let idx = self.find(key)?;
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Full { value, .. } => {
                self.used -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Drop all entries but keep capacity for reuse
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::Empty;
        }
        self.used = 0;
        self.filled = 0;
    }

    /// Shrink if table grew too large
    pub fn shrink_if_large(&mut self) {
        if self.capacity() > RETAIN_MAX_SLOTS && self.is_empty() {
            self.slots = Vec::new();
            // If the allocation fails the table simply starts empty next time.
            let _ = self.resize(RETAIN_SHRINK_TO);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full { key, value } => Some((*key, value)),
            _ => None,
        })
    }
}
