//! Append-only buffer with an explicit, reproducible growth policy.
//!
//! Capacity is tracked separately from the logical length: slots up to
//! `capacity()` are allocated and zero-filled, slots up to `len()` hold data.
//! When an append would overflow, capacity grows to
//! `max(2 * capacity, required)` rather than following `Vec`'s own heuristic.

use std::collections::TryReserveError;
use std::ops::Index;

#[derive(Debug, Clone, PartialEq)]
pub struct GrowableBuffer<T> {
    slots: Vec<T>,
    len: usize,
}

impl<T: Copy + Default> GrowableBuffer<T> {
    /// Allocate `capacity` zeroed slots.
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        slots.resize(capacity, T::default());
        Ok(Self { slots, len: 0 })
    }

    /// Wrap fully populated data, e.g. restored from a checkpoint.
    pub fn from_vec(data: Vec<T>) -> Self {
        let len = data.len();
        Self { slots: data, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.slots[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.slots[..self.len]
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Make room for `additional` more elements.
    ///
    /// Returns the new capacity if the buffer had to grow.
    pub fn ensure_room(&mut self, additional: usize) -> Result<Option<usize>, TryReserveError> {
        let required = self.len + additional;
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(None);
        }

        let new_capacity = (capacity * 2).max(required);
        self.slots.try_reserve_exact(new_capacity - capacity)?;
        self.slots.resize(new_capacity, T::default());
        Ok(Some(new_capacity))
    }

    /// Append one element, growing first if the buffer is full.
    pub fn push(&mut self, value: T) -> Result<Option<usize>, TryReserveError> {
        let grown = self.ensure_room(1)?;
        self.slots[self.len] = value;
        self.len += 1;
        Ok(grown)
    }

    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<Option<usize>, TryReserveError> {
        let grown = self.ensure_room(values.len())?;
        self.slots[self.len..self.len + values.len()].copy_from_slice(values);
        self.len += values.len();
        Ok(grown)
    }

    /// Drop logical entries past `len`; capacity is unchanged.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.slots[len..self.len].fill(T::default());
            self.len = len;
        }
    }

    /// Release every slot past the logical length.
    pub fn shrink_to_len(&mut self) {
        self.slots.truncate(self.len);
        self.slots.shrink_to_fit();
    }

    pub fn into_vec(mut self) -> Vec<T> {
        self.slots.truncate(self.len);
        self.slots
    }
}

impl<T: Copy + Default> Index<usize> for GrowableBuffer<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &Self::Output {
        assert!(idx < self.len, "index {} out of bounds (len {})", idx, self.len);
        &self.slots[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_from_capacity_one() {
        let mut buf = GrowableBuffer::<i64>::with_capacity(1).unwrap();
        for v in [10, 11, 12, 13, 14] {
            buf.push(v).unwrap();
        }
        assert!(buf.capacity() >= 5);
        assert_eq!(buf.as_slice(), &[10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_doubling_policy() {
        let mut buf = GrowableBuffer::<i64>::with_capacity(1).unwrap();
        let mut capacities = vec![buf.capacity()];
        for v in 0..9 {
            if let Some(cap) = buf.push(v).unwrap() {
                capacities.push(cap);
            }
        }
        assert_eq!(capacities, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_exact_fit_when_doubling_is_not_enough() {
        let mut buf = GrowableBuffer::<f32>::with_capacity(2).unwrap();
        buf.push(1.0).unwrap();
        let grown = buf.extend_from_slice(&[2.0; 9]).unwrap();
        assert_eq!(grown, Some(10));
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_zero_capacity_grows_to_fit() {
        let mut buf = GrowableBuffer::<i64>::with_capacity(0).unwrap();
        assert_eq!(buf.push(7).unwrap(), Some(1));
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn test_no_growth_within_capacity() {
        let mut buf = GrowableBuffer::<i64>::with_capacity(4).unwrap();
        assert_eq!(buf.extend_from_slice(&[1, 2, 3, 4]).unwrap(), None);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_truncate_keeps_capacity_and_shrink_releases_it() {
        let mut buf = GrowableBuffer::<i64>::with_capacity(8).unwrap();
        buf.extend_from_slice(&[1, 2, 3, 4, 5]).unwrap();
        buf.truncate(3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert_eq!(buf.capacity(), 8);

        buf.shrink_to_len();
        assert_eq!(buf.capacity(), 3);
        assert_eq!(buf.clone().into_vec(), vec![1, 2, 3]);

        // Idempotent.
        buf.shrink_to_len();
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    fn test_from_vec_is_full() {
        let buf = GrowableBuffer::from_vec(vec![1.0f32, 2.0]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.capacity(), 2);
        assert_eq!(buf.last(), Some(&2.0));
    }

    #[test]
    #[should_panic]
    fn test_index_past_len_panics() {
        let buf = GrowableBuffer::<i64>::with_capacity(4).unwrap();
        let _ = buf[0];
    }
}
