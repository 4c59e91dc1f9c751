//! Keepalive vector
//! - Append-only for the duration of one traversal
//! - Keeps memoized sources alive so their addresses cannot be recycled
//! - Returns to baseline capacity if a single call ballooned it

use std::collections::TryReserveError;

/// Maximum capacity to retain (8192 elements)
const RETAIN_MAX: usize = 1 << 13;
/// Target capacity after shrink (1024 elements)
const RETAIN_TARGET: usize = 1 << 10;

#[derive(Debug)]
pub struct KeepVector<V> {
    items: Vec<V>,
}

impl<V> Default for KeepVector<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeepVector<V> {
    #[inline(always)]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    #[inline]
    pub fn append(&mut self, item: V) -> Result<(), TryReserveError> {
        self.items.try_reserve(1)?;
        self.items.push(item);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drop everything appended after `len` (rollback to a checkpoint).
    pub fn truncate(&mut self, len: usize) -> std::vec::Drain<'_, V> {
        let len = len.min(self.items.len());
        self.items.drain(len..)
    }

    /// Shrink capacity if it ballooned past the cap
    pub fn shrink_if_large(&mut self) {
        if self.capacity() > RETAIN_MAX {
            self.items.shrink_to(RETAIN_TARGET.max(self.items.len()));
        }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&V> {
        self.items.get(index)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_index() {
        let mut keep = KeepVector::new();
        keep.append("a").unwrap();
        keep.append("b").unwrap();
        assert_eq!(keep.len(), 2);
        assert_eq!(keep.get(1), Some(&"b"));
        assert_eq!(keep.get(2), None);
    }

    #[test]
    fn truncate_returns_rolled_back_items() {
        let mut keep = KeepVector::new();
        for i in 0..5 {
            keep.append(i).unwrap();
        }
        let dropped: Vec<_> = keep.truncate(3).collect();
        assert_eq!(dropped, vec![3, 4]);
        assert_eq!(keep.len(), 3);
        assert_eq!(keep.truncate(10).count(), 0);
    }

    #[test]
    fn shrinks_back_to_baseline() {
        let mut keep = KeepVector::new();
        for i in 0..(RETAIN_MAX * 2) {
            keep.append(i).unwrap();
        }
        keep.clear();
        keep.shrink_if_large();
        assert!(keep.capacity() >= RETAIN_TARGET);
        assert!(keep.capacity() <= RETAIN_MAX);
    }

    #[test]
    fn small_capacity_untouched() {
        let mut keep = KeepVector::new();
        keep.append(1).unwrap();
        let cap = keep.capacity();
        keep.clear();
        keep.shrink_if_large();
        assert_eq!(keep.capacity(), cap);
    }
}
