//! Implements a map from integer indices to data.
//! Rather than storing data for every index, internally, this maps entire ranges to the data.
//! To this end, the APIs all work on ranges, not on individual integers. Ranges are split as
//! necessary (e.g., when [0,5) is first associated with X, and then [1,2) is mutated).
//! Users must not depend on whether a range is coalesced or not, even though this is observable
//! via the iteration APIs.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::Size;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Elem<T> {
    /// The range covered by this element; never empty.
    range: Range<u64>,
    /// The data stored for this element.
    data: T,
}

#[derive(Clone, Debug)]
pub struct RangeMap<T> {
    v: Vec<Elem<T>>,
}

impl<T> RangeMap<T> {
    /// Creates a new `RangeMap` for the given size, and with the given initial value used for
    /// the entire range.
    #[inline(always)]
    pub fn new(size: Size, init: T) -> RangeMap<T> {
        let size = size.bytes();
        let v = if size > 0 { vec![Elem { range: 0..size, data: init }] } else { Vec::new() };
        RangeMap { v }
    }

    /// The total number of bytes covered by the map.
    pub fn size(&self) -> Size {
        Size::from_bytes(self.v.last().map_or(0, |elem| elem.range.end))
    }

    /// The number of distinct ranges currently stored.
    pub fn num_ranges(&self) -> usize {
        self.v.len()
    }

    /// Finds the index containing the given offset.
    fn find_offset(&self, offset: u64) -> usize {
        let idx = self.v.partition_point(|elem| elem.range.end <= offset);
        debug_assert!(self.v[idx].range.contains(&offset));
        idx
    }

    /// Provides read-only iteration over everything in the given range. This does
    /// *not* split items if they overlap with the edges. Do not use this to mutate
    /// through interior mutability.
    ///
    /// The iterator also provides the range of the given element.
    /// How exactly the ranges are split can differ even for otherwise identical
    /// maps, so user-visible behavior should never depend on the exact range.
    pub fn iter(&self, offset: Size, len: Size) -> impl Iterator<Item = (Range<u64>, &T)> {
        let offset = offset.bytes();
        let len = len.bytes();
        let end = offset + len;
        assert!(end <= self.size().bytes(), "iterating beyond the bounds of this RangeMap");
        let slice: &[Elem<T>] = if len == 0 { &[] } else { &self.v[self.find_offset(offset)..] };
        slice
            .iter()
            .take_while(move |elem| elem.range.start < end)
            .map(|elem| (elem.range.clone(), &elem.data))
    }

    pub fn iter_all(&self) -> impl Iterator<Item = (Range<u64>, &T)> {
        self.v.iter().map(|elem| (elem.range.clone(), &elem.data))
    }

    pub fn iter_mut_all(&mut self) -> impl Iterator<Item = (Range<u64>, &mut T)> {
        self.v.iter_mut().map(|elem| (elem.range.clone(), &mut elem.data))
    }

    // Splits the element situated at the given `index`, such that the 2nd one starts at offset
    // `split_offset`. Do nothing if the element already starts there.
    // Returns whether a split was necessary.
    fn split_index(&mut self, index: usize, split_offset: u64) -> bool
    where
        T: Clone,
    {
        let elem = &mut self.v[index];
        if split_offset == elem.range.start || split_offset == elem.range.end {
            // Nothing to do.
            return false;
        }
        debug_assert!(
            elem.range.contains(&split_offset),
            "the `split_offset` is not in the element to be split"
        );

        // Now we really have to split. Reduce length of first element.
        let second_range = split_offset..elem.range.end;
        elem.range.end = split_offset;
        // Copy the data, and insert second element.
        let second = Elem { range: second_range, data: elem.data.clone() };
        self.v.insert(index + 1, second);
        true
    }

    /// Provides mutable iteration over everything in the given range. As a side-effect,
    /// this will split entries in the map that are only partially hit by the given range,
    /// to make sure that when they are mutated, the effect is constrained to the given range.
    /// Merging neighbouring equal blocks is left to `merge_adjacent_thorough`.
    ///
    /// The iterator also provides the range of the given element.
    /// How exactly the ranges are split (both prior to and resulting from the execution of this
    /// function) can differ even for otherwise identical maps, so user-visible behavior should
    /// never depend on the exact range.
    pub fn iter_mut(
        &mut self,
        offset: Size,
        len: Size,
    ) -> impl Iterator<Item = (Range<u64>, &mut T)>
    where
        T: Clone,
    {
        let offset = offset.bytes();
        let len = len.bytes();
        let end = offset + len;
        assert!(end <= self.size().bytes(), "iterating beyond the bounds of this RangeMap");
        let slice: &mut [Elem<T>] = if len == 0 {
            // We can't just call `find_offset` here, since the offset may be the size.
            &mut []
        } else {
            // Make sure the first element starts exactly at `offset`.
            let first_idx = self.find_offset(offset);
            let first_idx =
                if self.split_index(first_idx, offset) { first_idx + 1 } else { first_idx };
            // Find the last element and make sure it ends exactly at `end`.
            let mut end_idx = first_idx;
            while self.v[end_idx].range.end < end {
                end_idx += 1;
            }
            self.split_index(end_idx, end);
            &mut self.v[first_idx..=end_idx]
        };
        slice.iter_mut().map(|elem| (elem.range.clone(), &mut elem.data))
    }

    /// Remove all adjacent duplicates
    pub fn merge_adjacent_thorough(&mut self)
    where
        T: PartialEq,
    {
        let clean = Vec::with_capacity(self.v.len());
        for elem in core::mem::replace(&mut self.v, clean) {
            if let Some(prev) = self.v.last_mut() {
                if prev.data == elem.data {
                    assert_eq!(prev.range.end, elem.range.start);
                    prev.range.end = elem.range.end;
                    continue;
                }
            }
            self.v.push(elem);
        }
    }
}
