use std::sync::Arc;

use parking_lot::Mutex;
use tbsan_shared::{AccessKind, AllocRange, Permission, RetagInfo};

use crate::borrow_tracker::errors::{BorrowTrackerError, BtOp, BtOpType, BtResult};
use crate::borrow_tracker::tree::{ChildParams, LocationState};
use crate::diagnostics::AccessCause;
use crate::{AllocInfo, BorTag, GlobalCtx, Provenance};

pub mod errors;
pub mod tree;
pub mod unimap;

/// A view of one allocation through one pointer, valid for the duration of a
/// single operation.
#[derive(Debug)]
pub struct BorrowTracker<'a> {
    prov: Provenance,
    ctx: &'a GlobalCtx,
    alloc_info: Arc<Mutex<AllocInfo>>,
}

impl<'a> BorrowTracker<'a> {
    /// Fails with `UseAfterFree` if the allocation of `prov` is gone.
    pub fn new(prov: Provenance, ctx: &'a GlobalCtx, op: BtOpType) -> BtResult<Self> {
        let Some(alloc_info) = ctx.alloc_info(prov.alloc_id) else {
            return Err(BorrowTrackerError::UseAfterFree(BtOp::new(
                op,
                format!("{:?} through {:?} is not a live allocation", prov.alloc_id, prov.bor_tag),
            )));
        };
        Ok(Self { prov, ctx, alloc_info })
    }

    /// Derive a new pointer from `self.prov` over `range`.
    /// Returns the new tag, or `None` if the pointer keeps the tag of its parent.
    pub fn retag(
        &self,
        range: AllocRange,
        retag_info: &RetagInfo,
        protected: bool,
    ) -> BtResult<Option<BorTag>> {
        let Provenance { alloc_id, bor_tag: parent_tag } = self.prov;
        let mut info = self.alloc_info.lock();
        let Some(default_perm) = retag_info.derivation.initial_permission(retag_info.interior_mut)
        else {
            // No new node, but the parent must still be readable.
            info.tree.perform_access(
                parent_tag,
                range,
                AccessKind::Read,
                AccessCause::Reborrow,
                self.ctx,
                alloc_id,
            )?;
            tracing::trace!("{:?} keeps tag {parent_tag:?} on {alloc_id:?}", retag_info.derivation);
            return Ok(None);
        };

        let new_tag = self.ctx.new_borrow_tag();
        let params = ChildParams { parent_tag, new_tag, default_perm, protected, range };
        info.tree.create_child(params, self.ctx, alloc_id)?;
        tracing::trace!(
            "reborrow {parent_tag:?} -> {new_tag:?} ({default_perm}) on {alloc_id:?} at {range:?}"
        );
        if self.ctx.config().is_tracked(new_tag) {
            tracing::info!(
                "created tag {new_tag:?} as a child of {parent_tag:?} with permission {default_perm} at {range:?}"
            );
        }
        Ok(Some(new_tag))
    }

    pub fn access(&self, access_kind: AccessKind, range: AllocRange) -> BtResult<()> {
        let mut info = self.alloc_info.lock();
        info.tree.perform_access(
            self.prov.bor_tag,
            range,
            access_kind,
            AccessCause::Explicit(access_kind),
            self.ctx,
            self.prov.alloc_id,
        )
    }

    /// Check the deallocation through `self.prov`, then discard the tree.
    pub fn dealloc(self) -> BtResult<()> {
        {
            let mut info = self.alloc_info.lock();
            info.tree.dealloc(self.prov.bor_tag, self.ctx, self.prov.alloc_id)?;
        }
        self.ctx.drop_allocation(self.prov.alloc_id)
    }

    /// Prepare the tree for `self.prov` becoming protected.
    pub fn protect(&self) -> BtResult<()> {
        let mut info = self.alloc_info.lock();
        info.tree.reset_idempotence(self.prov.bor_tag)
    }

    pub fn give_pointer_debug_name(&self, nth_parent: u8, name: &str) -> BtResult<()> {
        let mut info = self.alloc_info.lock();
        info.tree.give_pointer_debug_name(self.prov.bor_tag, nth_parent, name)
    }

    pub fn location_state_at(&self, offset: u64) -> BtResult<LocationState> {
        self.alloc_info.lock().tree.location_state_at(self.prov.bor_tag, offset)
    }

    pub fn perm_at(&self, offset: u64) -> BtResult<Permission> {
        self.alloc_info.lock().tree.perm_at(self.prov.bor_tag, offset)
    }
}
