//! Runtime of a Tree Borrows aliasing checker.
//!
//! A host interpreter reports allocations, pointer derivations, memory accesses
//! and call scopes to a [`Runtime`]. Each allocation owns a tree of pointer tags
//! whose permissions evolve with every access; any access a permission does not
//! allow is returned to the host as a [`TreeError`].

use std::fmt;
use std::ops::{Deref, DerefMut};

pub use tbsan_shared::{
    AccessKind, AllocRange, DerivationKind, Permission, PermissionKind, ProtectorKind, RetagInfo,
    Size, WriteCapability,
};

mod config;
pub use config::*;

mod global;
pub use global::*;

mod local;
pub use local::*;

pub mod borrow_tracker;
use borrow_tracker::errors::BtOpType;
pub use borrow_tracker::errors::{BorrowTrackerError, BtResult, TreeError, ViolationKind};
use borrow_tracker::tree::Tree;
use borrow_tracker::*;

pub mod diagnostics;

/// Unique identifier for an allocation
#[repr(transparent)]
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllocId(usize);

impl AllocId {
    pub fn new(i: usize) -> Self {
        AllocId(i)
    }
    pub fn get(&self) -> usize {
        self.0
    }
    /// The first id handed out to an allocation
    pub const fn min() -> Self {
        AllocId(1)
    }
}

impl fmt::Debug for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "a{}", self.0) } else { write!(f, "alloc{}", self.0) }
    }
}

/// Unique identifier for a node within the tree
#[repr(transparent)]
#[derive(Copy, Clone, Hash, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BorTag(usize);

impl BorTag {
    pub const fn new(i: usize) -> Self {
        BorTag(i)
    }
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for BorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Unique identifier for a function call, used to scope protectors
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallId(usize);

impl CallId {
    pub fn new(i: usize) -> Self {
        CallId(i)
    }
    pub fn get(&self) -> usize {
        self.0
    }
}

/// Pointers have provenance (RFC #3559). In Tree Borrows, this includes an allocation ID
/// and a borrow tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Provenance {
    pub alloc_id: AllocId,
    pub bor_tag: BorTag,
}

/// Metadata kept for every live allocation.
#[derive(Debug)]
pub struct AllocInfo {
    pub alloc_id: AllocId,
    pub size: Size,
    pub tree: Tree,
}

/// The event interface used by a host interpreter.
///
/// Holds the process-wide context and the call frames of the single logical
/// thread whose events are reported.
#[derive(Debug)]
pub struct Runtime {
    global: GlobalCtx,
    local: LocalCtx,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self { global: GlobalCtx::new(config), local: LocalCtx::new() }
    }

    pub fn global(&self) -> &GlobalCtx {
        &self.global
    }

    pub fn local(&self) -> &LocalCtx {
        &self.local
    }

    /// A new allocation of `size` bytes. Returns the provenance of its root pointer.
    pub fn notify_allocate(&self, size: u64) -> Provenance {
        self.global.new_allocation(Size::from_bytes(size))
    }

    /// The allocation is gone, without checking any pointer's right to free it.
    pub fn notify_deallocate(&self, alloc_id: AllocId) -> BtResult<()> {
        self.global.drop_allocation(alloc_id)
    }

    /// The allocation is freed through `prov`. This acts as a write through `prov`
    /// to the whole allocation and is rejected while a tag of it is strongly protected.
    pub fn notify_free(&self, prov: Provenance) -> BtResult<()> {
        BorrowTracker::new(prov, &self.global, BtOpType::Dealloc)?.dealloc()
    }

    /// A pointer to `range` was derived from `prov`.
    pub fn notify_create(
        &mut self,
        prov: Provenance,
        range: AllocRange,
        derivation: DerivationKind,
        interior_mut: bool,
    ) -> BtResult<Option<BorTag>> {
        self.notify_retag(prov, range, RetagInfo::new(derivation, interior_mut))
    }

    /// Same as `notify_create`, but the new tag may be protected by the innermost call.
    pub fn notify_retag(
        &mut self,
        prov: Provenance,
        range: AllocRange,
        retag_info: RetagInfo,
    ) -> BtResult<Option<BorTag>> {
        let wants_protector = retag_info.protector_kind.is_protector();
        if wants_protector && self.local.depth() == 0 {
            tracing::warn!("protected retag of {:?} outside of any call, ignoring the protector", prov.bor_tag);
        }
        let protected = wants_protector && self.local.depth() > 0;
        let tracker = BorrowTracker::new(prov, &self.global, BtOpType::Retag)?;
        let new_tag = tracker.retag(range, &retag_info, protected)?;
        if let Some(tag) = new_tag.filter(|_| protected) {
            self.global.add_protected_tag(tag, retag_info.protector_kind);
            self.local.add_protected_tag(prov.alloc_id, tag);
            tracing::debug!(
                "protected {tag:?} ({:?}) in {:?}",
                retag_info.protector_kind,
                self.local.innermost_call()
            );
        }
        Ok(new_tag)
    }

    pub fn notify_access(
        &self,
        prov: Provenance,
        range: AllocRange,
        access_kind: AccessKind,
    ) -> BtResult<()> {
        let op = match access_kind {
            AccessKind::Read => BtOpType::Read,
            AccessKind::Write => BtOpType::Write,
        };
        BorrowTracker::new(prov, &self.global, op)?.access(access_kind, range)
    }

    pub fn new_call_id(&self) -> CallId {
        self.global.new_call_id()
    }

    /// A call starts, and strongly protects `tags` until it ends.
    /// Tags that do not belong to a live allocation are reported and skipped.
    pub fn notify_call_enter(&mut self, call_id: CallId, tags: &[Provenance]) {
        self.local.push_frame(call_id);
        tracing::debug!("entering {call_id:?} with {} protected tags", tags.len());
        for &prov in tags {
            let protected = BorrowTracker::new(prov, &self.global, BtOpType::Protect)
                .and_then(|tracker| tracker.protect());
            if let Err(err) = protected {
                tracing::warn!("cannot protect {:?} in {call_id:?}: {err}", prov.bor_tag);
                continue;
            }
            self.global.add_protected_tag(prov.bor_tag, ProtectorKind::StrongProtector);
            self.local.add_protected_tag(prov.alloc_id, prov.bor_tag);
            if self.global.config().is_tracked(prov.bor_tag) {
                tracing::info!("tag {:?} is now protected by {call_id:?}", prov.bor_tag);
            }
        }
    }

    /// The call ends, normally or by unwinding. Calls nested inside it that have
    /// not been exited yet end with it.
    pub fn notify_call_exit(&mut self, call_id: CallId) {
        let Some(frames) = self.local.pop_frames_until(call_id) else {
            tracing::warn!("exit from {call_id:?}, which is not an active call");
            return;
        };
        for frame in frames {
            if frame.call_id != call_id {
                tracing::debug!("unwinding {:?} through {call_id:?}", frame.call_id);
            }
            for (_, tag) in frame.protected_tags {
                self.global.remove_protected_tag(tag);
                if self.global.config().is_tracked(tag) {
                    tracing::info!("tag {tag:?} is no longer protected");
                }
            }
        }
        tracing::debug!("exited {call_id:?}");
    }

    /// Enter a new call protecting `tags`; the call is exited when the guard is dropped.
    pub fn enter_call(&mut self, tags: &[Provenance]) -> ProtectorGuard<'_> {
        let call_id = self.new_call_id();
        self.notify_call_enter(call_id, tags);
        ProtectorGuard { rt: self, call_id }
    }

    /// Attach a human readable name to the tag of `prov`, for diagnostics.
    pub fn name_tag(&self, prov: Provenance, name: &str) -> BtResult<()> {
        BorrowTracker::new(prov, &self.global, BtOpType::Inspect)?.give_pointer_debug_name(0, name)
    }

    /// The current permission of `prov`'s tag at `offset`.
    pub fn permission_at(&self, prov: Provenance, offset: u64) -> BtResult<Permission> {
        BorrowTracker::new(prov, &self.global, BtOpType::Inspect)?.perm_at(offset)
    }
}

/// A call scope entered through `Runtime::enter_call`.
/// Dereferences to the runtime so that events can be reported while it is alive.
#[derive(Debug)]
pub struct ProtectorGuard<'rt> {
    rt: &'rt mut Runtime,
    call_id: CallId,
}

impl ProtectorGuard<'_> {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }
}

impl Deref for ProtectorGuard<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        self.rt
    }
}

impl DerefMut for ProtectorGuard<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        self.rt
    }
}

impl Drop for ProtectorGuard<'_> {
    fn drop(&mut self) {
        self.rt.notify_call_exit(self.call_id);
    }
}
