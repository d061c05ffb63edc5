use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxBuildHasher;
use tbsan_shared::{ProtectorKind, Size};

use crate::borrow_tracker::errors::{BorrowTrackerError, BtOp, BtOpType, BtResult};
use crate::borrow_tracker::tree::Tree;
use crate::*;

/// Process-wide state of the checker: id counters, the allocation table and
/// the set of protected tags.
/// Only shared references (&self) are needed to use it, every table sits
/// behind its own lock. Lock order is allocation table, then a single
/// allocation, then `protected_tags`.
#[derive(Debug)]
pub struct GlobalCtx {
    config: Config,
    /// Counters for IDs assigned to allocations, borrow tags and calls.
    next_alloc_id: AtomicUsize,
    next_bor_tag: AtomicUsize,
    next_call_id: AtomicUsize,
    allocs: Mutex<BHashMap<AllocId, Arc<Mutex<AllocInfo>>>>,
    protected_tags: Mutex<BHashMap<BorTag, ProtectorKind>>,
}

impl GlobalCtx {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next_alloc_id: AtomicUsize::new(AllocId::min().get()),
            // Tags 0 and 1 are reserved for wildcard and null provenance.
            next_bor_tag: AtomicUsize::new(2),
            next_call_id: AtomicUsize::new(0),
            allocs: Mutex::new(BHashMap::default()),
            protected_tags: Mutex::new(BHashMap::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn new_alloc_id(&self) -> AllocId {
        let id = self.next_alloc_id.fetch_add(1, Ordering::Relaxed);
        AllocId::new(id)
    }

    pub fn new_borrow_tag(&self) -> BorTag {
        let id = self.next_bor_tag.fetch_add(1, Ordering::Relaxed);
        BorTag::new(id)
    }

    pub fn new_call_id(&self) -> CallId {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        CallId::new(id)
    }

    /// Register a fresh allocation of `size` bytes, and return the provenance of
    /// its root pointer.
    pub fn new_allocation(&self, size: Size) -> Provenance {
        let alloc_id = self.new_alloc_id();
        let bor_tag = self.new_borrow_tag();
        let tree = Tree::new(bor_tag, size).with_config(&self.config);
        let info = AllocInfo { alloc_id, size, tree };
        self.allocs.lock().insert(alloc_id, Arc::new(Mutex::new(info)));
        tracing::debug!("new allocation {alloc_id:?} of {} bytes with root tag {bor_tag:?}", size.bytes());
        if self.config.is_tracked(bor_tag) {
            tracing::info!("created tag {bor_tag:?} as the root of {alloc_id:?}");
        }
        Provenance { alloc_id, bor_tag }
    }

    /// Metadata of a live allocation.
    pub fn alloc_info(&self, alloc_id: AllocId) -> Option<Arc<Mutex<AllocInfo>>> {
        self.allocs.lock().get(&alloc_id).cloned()
    }

    /// Discard the tree of `alloc_id`. Other allocations are not affected.
    pub fn drop_allocation(&self, alloc_id: AllocId) -> BtResult<()> {
        match self.allocs.lock().remove(&alloc_id) {
            Some(_) => {
                tracing::debug!("dropped allocation {alloc_id:?}");
                Ok(())
            }
            None =>
                Err(BorrowTrackerError::UseAfterFree(BtOp::new(
                    BtOpType::Dealloc,
                    format!("{alloc_id:?} is not a live allocation"),
                ))),
        }
    }

    /// Number of allocations that have not been deallocated yet.
    pub fn live_allocations(&self) -> usize {
        self.allocs.lock().len()
    }

    pub fn add_protected_tag(&self, bor_tag: BorTag, protector_kind: ProtectorKind) {
        let mut tag_map = self.protected_tags.lock();
        tag_map.insert(bor_tag, protector_kind);
    }

    pub fn remove_protected_tag(&self, bor_tag: BorTag) {
        let mut tag_map = self.protected_tags.lock();
        tag_map.remove(&bor_tag);
    }

    pub fn get_protector_kind(&self, bor_tag: BorTag) -> Option<ProtectorKind> {
        let tag_map = self.protected_tags.lock();
        tag_map.get(&bor_tag).copied()
    }

    /// Locks the set of protected tags for the duration of one tree operation.
    pub(crate) fn protected_tags(&self) -> MutexGuard<'_, BHashMap<BorTag, ProtectorKind>> {
        self.protected_tags.lock()
    }
}

impl Default for GlobalCtx {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// A thin wrapper around `HashMap` that always hashes with `FxBuildHasher`
#[derive(Debug, Clone)]
pub struct BHashMap<K, V>(HashMap<K, V, FxBuildHasher>);

impl<K, V> Deref for BHashMap<K, V> {
    type Target = HashMap<K, V, FxBuildHasher>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for BHashMap<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K, V> Default for BHashMap<K, V> {
    fn default() -> Self {
        Self(HashMap::with_hasher(FxBuildHasher))
    }
}
