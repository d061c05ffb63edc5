//! Dense indices for the nodes of a tree.
//!
//! A `UniKeyMap<K>` is a (slow) mapping from `K` to `UniIndex`,
//! and `UniValMap<V>` is a (fast) mapping from `UniIndex` to `V`.
//! Thus a pair `(UniKeyMap<K>, UniValMap<V>)` acts as a virtual `HashMap<K, V>`,
//! and a tree keeps one `UniKeyMap` for all of its per-location `UniValMap`s.
//!
//! Nodes are never removed from a tree, so indices are handed out in order and
//! never reused.

use std::hash::Hash;

use crate::BHashMap;

/// Intermediate key between a UniKeyMap and a UniValMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniIndex {
    idx: u32,
}

/// From K to UniIndex
#[derive(Debug, Clone)]
pub struct UniKeyMap<K> {
    /// Every key is assigned the number of keys inserted before it.
    mapping: BHashMap<K, u32>,
}

impl<K> Default for UniKeyMap<K> {
    fn default() -> Self {
        Self { mapping: BHashMap::default() }
    }
}

/// From UniIndex to V
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniValMap<V> {
    data: Vec<Option<V>>,
}

impl<V> Default for UniValMap<V> {
    fn default() -> Self {
        Self { data: Vec::default() }
    }
}

impl<K> UniKeyMap<K>
where
    K: Hash + Eq,
{
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.mapping.contains_key(key)
    }

    /// Assign this key to the next free index.
    /// The caller checks with `contains_key` that the key is new.
    #[track_caller]
    pub fn insert(&mut self, key: K) -> UniIndex {
        let idx: u32 = self.mapping.len().try_into().expect("UniMap ran out of useable keys");
        let previous = self.mapping.insert(key, idx);
        debug_assert!(previous.is_none(), "key inserted twice in a UniKeyMap");
        UniIndex { idx }
    }

    /// If it exists, the index this key maps to.
    pub fn get(&self, key: &K) -> Option<UniIndex> {
        self.mapping.get(key).map(|&idx| UniIndex { idx })
    }
}

impl<V> UniValMap<V> {
    /// Assign a value to the index. Permanently overwrites any previous value.
    pub fn insert(&mut self, idx: UniIndex, val: V) {
        let idx = idx.idx as usize;
        if idx >= self.data.len() {
            self.data.resize_with(idx + 1, || None);
        }
        self.data[idx] = Some(val)
    }

    pub fn get(&self, idx: UniIndex) -> Option<&V> {
        self.data.get(idx.idx as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: UniIndex) -> Option<&mut V> {
        self.data.get_mut(idx.idx as usize).and_then(Option::as_mut)
    }

    /// Iterate over all stored values together with their index.
    pub fn iter(&self) -> impl Iterator<Item = (UniIndex, &V)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(idx, v)| Some((UniIndex { idx: idx as u32 }, v.as_ref()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_stable() {
        let mut km = UniKeyMap::<u64>::default();
        let a = km.insert(10);
        let b = km.insert(20);
        assert_ne!(a, b);
        assert_eq!(km.get(&10), Some(a));
        assert_eq!(km.get(&20), Some(b));
        assert_eq!(km.get(&30), None);
        assert!(km.contains_key(&20));
        assert_eq!(km.len(), 2);
    }

    #[test]
    fn values_follow_their_keys() {
        let mut km = UniKeyMap::<char>::default();
        let mut vm = UniValMap::<u8>::default();
        let a = km.insert('a');
        let b = km.insert('b');
        let c = km.insert('c');
        // Only `c` gets a value, the gap before it stays empty.
        vm.insert(c, 3);
        assert_eq!(vm.get(a), None);
        assert_eq!(vm.get(c), Some(&3));
        vm.insert(a, 1);
        *vm.get_mut(a).unwrap() += 1;
        assert_eq!(vm.get_mut(b), None);
        assert_eq!(vm.iter().collect::<Vec<_>>(), vec![(a, &2), (c, &3)]);
    }
}
