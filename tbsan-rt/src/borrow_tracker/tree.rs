//! In this file we handle the "Tree" part of Tree Borrows, i.e. all tree
//! traversal functions, optimizations to trim branches, and keeping track of
//! the relative position of the access to each node being updated.
//!
//! Accesses are computed first and committed afterwards, so that a rejected
//! access leaves every permission of the tree untouched.

use std::fmt;

use smallvec::SmallVec;
use tbsan_shared::*;

use super::errors::{BorrowTrackerError, BtOp, BtOpType, BtResult, TransitionError};
use super::errors::{TreeError, TreeTransitionResult};
use super::unimap::{UniIndex, UniKeyMap, UniValMap};
use crate::diagnostics::{self, AccessCause, NodeDebugInfo, TbError};
use crate::{AllocId, BorTag, Config, GlobalCtx};

/// Whether to continue exploring the children recursively or not.
enum ContinueTraversal {
    Recurse,
    SkipSelfAndChildren,
}

/// Data for a single *location*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationState {
    /// A location is "accessed" when it is child-accessed for the first time (and the initial
    /// retag initializes the location for the range covered by the reborrow), and it then stays
    /// accessed forever.
    /// For accessed locations, "permission" is the current permission. However, for
    /// non-accessed locations, we still need to track the "future initial permission": this will
    /// start out to be `default_initial_perm`, but foreign accesses need to be taken into account.
    /// Protectors apply to both kinds of locations alike.
    /// Note that the tree root is also always accessed, as if the allocation was a write access.
    accessed: bool,
    /// This pointer's current permission / future initial permission.
    permission: Permission,
    /// See `foreign_access_skipping.rs`.
    /// Stores an idempotent foreign access for this location and its children.
    /// For correctness, this must not be too strong, and the recorded idempotent foreign access
    /// of all children must be at least as strong as this.
    idempotent_foreign_access: IdempotentForeignAccess,
}

impl LocationState {
    /// Constructs a new initial state. It has neither been accessed, nor been subjected
    /// to any foreign access yet.
    /// The permission is not allowed to be `Active`.
    /// `sifa` is the (strongest) idempotent foreign access, see `foreign_access_skipping.rs`
    pub fn new_non_accessed(permission: Permission, sifa: IdempotentForeignAccess) -> Self {
        debug_assert!(permission.is_initial() || permission.is_disabled());
        Self { permission, accessed: false, idempotent_foreign_access: sifa }
    }

    /// Constructs a new initial state. It has not yet been subjected
    /// to any foreign access. However, it is already marked as having been accessed.
    /// `sifa` is the (strongest) idempotent foreign access, see `foreign_access_skipping.rs`
    pub fn new_accessed(permission: Permission, sifa: IdempotentForeignAccess) -> Self {
        Self { permission, accessed: true, idempotent_foreign_access: sifa }
    }

    /// Check if the location has been accessed, i.e. if it has
    /// ever been accessed through a child pointer.
    pub fn is_accessed(&self) -> bool {
        self.accessed
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn idempotent_foreign_access(&self) -> IdempotentForeignAccess {
        self.idempotent_foreign_access
    }

    /// Apply the effect of an access to one location, including
    /// - applying `Permission::perform_access` to the inner `Permission`,
    /// - emitting protector UB, whether or not the location was accessed,
    /// - updating the accessed status (child accesses produce accessed locations).
    fn perform_access(
        &mut self,
        access_kind: AccessKind,
        rel_pos: AccessRelatedness,
        protected: bool,
    ) -> TreeTransitionResult<PermTransition> {
        let old_perm = self.permission;
        let transition = Permission::perform_access(access_kind, rel_pos, old_perm, protected)
            .ok_or(TransitionError::ChildAccessForbidden(old_perm))?;
        self.accessed |= !rel_pos.is_foreign();
        self.permission = transition.endpoint();
        // Offsets outside of the reborrowed range are protected like any other.
        if protected && transition.is_protector_violation() {
            return Err(TransitionError::ProtectedTransition(transition));
        }
        Ok(transition)
    }

    /// Like `perform_access`, but ignores the concrete error cause and also uses state-passing
    /// rather than a mutable reference. As such, it returns `Some(x)` if the transition succeeded,
    /// or `None` if there was an error.
    #[cfg(test)]
    fn perform_access_no_fluff(
        mut self,
        access_kind: AccessKind,
        rel_pos: AccessRelatedness,
        protected: bool,
    ) -> Option<Self> {
        match self.perform_access(access_kind, rel_pos, protected) {
            Ok(_) => Some(self),
            Err(_) => None,
        }
    }

    /// Tree traversal optimizations. See `foreign_access_skipping.rs`.
    /// This checks if such a foreign access can be skipped.
    fn skip_if_known_noop(
        &self,
        access_kind: AccessKind,
        rel_pos: AccessRelatedness,
    ) -> ContinueTraversal {
        if rel_pos.is_foreign() {
            let happening_now = IdempotentForeignAccess::from_foreign(access_kind);
            if self.idempotent_foreign_access.can_skip_foreign_access(happening_now) {
                // The whole subtree already absorbed an access at least this strong,
                // so repeating it changes nothing below this node.
                return ContinueTraversal::SkipSelfAndChildren;
            }
        }
        // A child access breaks the streak of foreign accesses in a row.
        ContinueTraversal::Recurse
    }

    /// Records a new access, so that future access can potentially be skipped
    /// by `skip_if_known_noop`. This must be called on child accesses, and otherwise
    /// should be called on foreign accesses for increased performance.
    /// See `foreign_access_skipping.rs`
    fn record_new_access(&mut self, access_kind: AccessKind, rel_pos: AccessRelatedness) {
        self.idempotent_foreign_access
            .record_new(IdempotentForeignAccess::from_acc_and_rel(access_kind, rel_pos));
    }
}

impl fmt::Display for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.permission)?;
        if !self.accessed {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// Everything needed to insert a new node below an existing one.
#[derive(Debug, Clone, Copy)]
pub struct ChildParams {
    pub parent_tag: BorTag,
    pub new_tag: BorTag,
    /// The permission of the new node on the reborrowed range, and its lazy
    /// default everywhere else.
    pub default_perm: Permission,
    /// Whether the new tag is protected from the moment it is created.
    pub protected: bool,
    /// The reborrowed range, relative to the start of the allocation.
    pub range: AllocRange,
}

/// Tree structure with both parents and children since we want to be
/// able to traverse the tree efficiently in both directions.
#[derive(Clone, Debug)]
pub struct Tree {
    /// Mapping from tags to keys. The key obtained can then be used in
    /// any of the `UniValMap` relative to this allocation, i.e. both the
    /// `nodes` and `rperms` of the same `Tree`.
    /// The parent-child relationship in `Node` is encoded in terms of these same
    /// keys, so traversing the entire tree needs exactly one access to
    /// `tag_mapping`.
    pub(crate) tag_mapping: UniKeyMap<BorTag>,
    /// All nodes of this tree.
    pub(crate) nodes: UniValMap<Node>,
    /// Maps a tag and a location to a perm, with possible lazy
    /// initialization.
    ///
    /// NOTE: not all tags registered in `nodes` are necessarily in all
    /// ranges of `rperms`, because `rperms` is in part lazily initialized.
    /// Just because `nodes.get(key)` is `Some(_)` does not mean you can safely
    /// `unwrap` any `perm.get(key)`.
    ///
    /// We do uphold the fact that `keys(perms)` is a subset of `keys(nodes)`
    pub(crate) rperms: RangeMap<UniValMap<LocationState>>,
    /// The index of the root node.
    pub(crate) root: UniIndex,
    /// Whether foreign accesses may skip subtrees known to be unaffected.
    foreign_access_skipping: bool,
    /// How many new ranges `rperms` may accumulate before adjacent ones are merged.
    merge_threshold: usize,
    ranges_at_last_merge: usize,
}

/// A node in the borrow tree. Each node is uniquely identified by a tag via
/// the `nodes` map of `Tree`.
#[derive(Clone, Debug)]
pub struct Node {
    /// The tag of this node.
    pub tag: BorTag,
    /// All tags except the root have a parent tag.
    pub parent: Option<UniIndex>,
    /// If the pointer was reborrowed, it has children.
    pub children: SmallVec<[UniIndex; 4]>,
    /// Either `Reserved`,  `Frozen`, or `Disabled`, it is the permission this tag will
    /// lazily be initialized to on the first access.
    /// It is only ever `Disabled` for a tree root, since the root is initialized to `Active` by
    /// its own separate mechanism.
    default_initial_perm: Permission,
    /// The default initial (strongest) idempotent foreign access.
    /// This participates in the invariant for `LocationState::idempotent_foreign_access`
    /// in cases where there is no location state yet. See `foreign_access_skipping.rs`,
    /// and `LocationState::idempotent_foreign_access` for more information
    default_initial_idempotent_foreign_access: IdempotentForeignAccess,
    /// Some extra information useful only for debugging purposes
    pub debug_info: NodeDebugInfo,
}

impl Node {
    /// The state of this node at a location it has no entry for.
    fn default_location_state(&self) -> LocationState {
        LocationState::new_non_accessed(
            self.default_initial_perm,
            self.default_initial_idempotent_foreign_access,
        )
    }
}

/// The new state of one node at one location, written back once the whole
/// access is known to succeed.
struct Update {
    idx: UniIndex,
    state: LocationState,
    transition: PermTransition,
    is_foreign: bool,
}

/// Read-only view of the tree at a single location.
struct TreeVisitor<'tree> {
    nodes: &'tree UniValMap<Node>,
    perms: &'tree UniValMap<LocationState>,
}

impl<'tree> TreeVisitor<'tree> {
    fn node(&self, idx: UniIndex) -> &'tree Node {
        self.nodes.get(idx).expect("every index reachable from the root has a node")
    }

    fn state_of(&self, idx: UniIndex, node: &Node) -> LocationState {
        self.perms.get(idx).copied().unwrap_or_else(|| node.default_location_state())
    }

    /// Applies `f_propagate` to every node of the tree: first `start` and its subtree
    /// (`This`, then `AncestorAccess`), then each ancestor (`StrictChildAccess`) followed
    /// by the subtrees hanging off of it (`CousinAccess`).
    /// Foreign subtrees for which `f_continue` answers `SkipSelfAndChildren` are not visited.
    fn traverse_this_parents_children_other<E>(
        &self,
        start: UniIndex,
        mut f_continue: impl FnMut(&LocationState, AccessRelatedness) -> ContinueTraversal,
        mut f_propagate: impl FnMut(UniIndex, &'tree Node, LocationState, AccessRelatedness) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut on_path: Option<UniIndex> = None;
        let mut current = Some(start);
        let mut rel_pos = AccessRelatedness::This;
        while let Some(idx) = current {
            self.traverse_subtree(idx, rel_pos, on_path, &mut f_continue, &mut f_propagate)?;
            on_path = Some(idx);
            current = self.node(idx).parent;
            rel_pos = AccessRelatedness::StrictChildAccess;
        }
        Ok(())
    }

    /// Visits `top` with `rel_pos`, and all of its descendants except those below `exclude`.
    fn traverse_subtree<E>(
        &self,
        top: UniIndex,
        rel_pos: AccessRelatedness,
        exclude: Option<UniIndex>,
        f_continue: &mut impl FnMut(&LocationState, AccessRelatedness) -> ContinueTraversal,
        f_propagate: &mut impl FnMut(UniIndex, &'tree Node, LocationState, AccessRelatedness) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut stack: Vec<(UniIndex, AccessRelatedness)> = vec![(top, rel_pos)];
        while let Some((idx, rel_pos)) = stack.pop() {
            let node = self.node(idx);
            let state = self.state_of(idx, node);
            if rel_pos.is_foreign()
                && matches!(f_continue(&state, rel_pos), ContinueTraversal::SkipSelfAndChildren)
            {
                continue;
            }
            f_propagate(idx, node, state, rel_pos)?;
            let child_rel = rel_pos.for_child();
            stack.extend(
                node.children.iter().filter(|&&child| Some(child) != exclude).map(|&c| (c, child_rel)),
            );
        }
        Ok(())
    }
}

impl Tree {
    /// Create a new tree, with only a root pointer.
    /// The root is `Active` and accessed on the whole allocation.
    pub fn new(root_tag: BorTag, size: Size) -> Self {
        let mut tag_mapping = UniKeyMap::default();
        let root_idx = tag_mapping.insert(root_tag);
        let nodes = {
            let mut nodes = UniValMap::<Node>::default();
            nodes.insert(
                root_idx,
                Node {
                    tag: root_tag,
                    parent: None,
                    children: SmallVec::default(),
                    default_initial_perm: Permission::new_disabled(),
                    // The root may never be skipped, all accesses will be local.
                    default_initial_idempotent_foreign_access: IdempotentForeignAccess::None,
                    debug_info: NodeDebugInfo::new(root_tag, Permission::new_active()),
                },
            );
            nodes
        };
        let rperms = {
            let mut perms = UniValMap::default();
            perms.insert(
                root_idx,
                LocationState::new_accessed(Permission::new_active(), IdempotentForeignAccess::None),
            );
            RangeMap::new(size, perms)
        };
        let defaults = Config::default();
        Self {
            root: root_idx,
            nodes,
            rperms,
            tag_mapping,
            foreign_access_skipping: defaults.foreign_access_skipping,
            merge_threshold: defaults.merge_threshold,
            ranges_at_last_merge: 1,
        }
    }

    /// Applies the tuning knobs of `config` to this tree.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.foreign_access_skipping = config.foreign_access_skipping;
        self.merge_threshold = config.merge_threshold;
        self
    }

    /// Size of the allocation covered by this tree.
    pub fn size(&self) -> Size {
        self.rperms.size()
    }

    /// The tag of the root of this tree.
    pub fn root_tag(&self) -> BorTag {
        self.node(self.root).tag
    }

    fn node(&self, idx: UniIndex) -> &Node {
        self.nodes.get(idx).expect("every index reachable from the root has a node")
    }

    fn lookup(&self, tag: BorTag, op: BtOpType) -> BtResult<UniIndex> {
        self.tag_mapping.get(&tag).ok_or_else(|| {
            BorrowTrackerError::InvalidProvenance(BtOp::new(
                op,
                format!("tag {tag:?} does not belong to this allocation"),
            ))
        })
    }

    fn check_bounds(&self, range: AllocRange, op: BtOpType) -> BtResult<()> {
        let size = self.size();
        match range.checked_end() {
            Some(end) if end <= size => Ok(()),
            _ =>
                Err(BorrowTrackerError::OutOfBounds(BtOp::new(
                    op,
                    format!("range {range:?} exceeds the allocation size {}", size.bytes()),
                ))),
        }
    }

    /// The state of the node `idx` at `offset`, materializing its default if needed.
    fn state_at(&self, idx: UniIndex, offset: u64) -> LocationState {
        let default = || self.node(idx).default_location_state();
        if offset >= self.size().bytes() {
            return default();
        }
        self.rperms
            .iter(Size::from_bytes(offset), Size::from_bytes(1))
            .next()
            .and_then(|(_, perms)| perms.get(idx).copied())
            .unwrap_or_else(default)
    }

    /// The current permission of `tag` at `offset`.
    pub fn perm_at(&self, tag: BorTag, offset: u64) -> BtResult<Permission> {
        Ok(self.location_state_at(tag, offset)?.permission())
    }

    /// The complete state of `tag` at `offset`.
    pub fn location_state_at(&self, tag: BorTag, offset: u64) -> BtResult<LocationState> {
        let idx = self.lookup(tag, BtOpType::Inspect)?;
        self.check_bounds(AllocRange::new(offset, 1), BtOpType::Inspect)?;
        Ok(self.state_at(idx, offset))
    }

    /// Insert a new tag in the tree.
    ///
    /// The reborrow first acts as a read access through the parent over `range`.
    /// The new node is accessed with `default_perm` on `range` and lazily takes
    /// `default_perm` everywhere else.
    pub fn create_child(
        &mut self,
        params: ChildParams,
        global: &GlobalCtx,
        alloc_id: AllocId,
    ) -> BtResult<()> {
        let ChildParams { parent_tag, new_tag, default_perm, protected, range } = params;
        if self.tag_mapping.contains_key(&new_tag) {
            return Err(BorrowTrackerError::InvalidProvenance(BtOp::new(
                BtOpType::Retag,
                format!("tag {new_tag:?} already exists in this allocation"),
            )));
        }
        self.perform_access(
            parent_tag,
            range,
            AccessKind::Read,
            AccessCause::Reborrow,
            global,
            alloc_id,
        )?;

        let parent_idx = self.lookup(parent_tag, BtOpType::Retag)?;
        let idx = self.tag_mapping.insert(new_tag);
        // The SIFA of the new node describes a leaf, its ancestors must be no stronger.
        let strongest_idempotent = default_perm.strongest_idempotent_foreign_access(protected);
        self.nodes.insert(
            idx,
            Node {
                tag: new_tag,
                parent: Some(parent_idx),
                children: SmallVec::default(),
                default_initial_perm: default_perm,
                default_initial_idempotent_foreign_access: strongest_idempotent,
                debug_info: NodeDebugInfo::new(new_tag, default_perm),
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent_idx) {
            parent.children.push(idx);
        }

        for (_, perms) in self.rperms.iter_mut(range.start, range.size) {
            perms.insert(idx, LocationState::new_accessed(default_perm, strongest_idempotent));
        }
        self.weaken_idempotence(parent_idx, strongest_idempotent);
        self.maybe_merge();
        Ok(())
    }

    /// Forget every foreign access recorded on `tag` and its ancestors.
    /// Needed when `tag` becomes protected, since a protected `Reserved` is no
    /// longer idempotent under foreign reads.
    pub fn reset_idempotence(&mut self, tag: BorTag) -> BtResult<()> {
        let idx = self.lookup(tag, BtOpType::Protect)?;
        self.weaken_idempotence(idx, IdempotentForeignAccess::None);
        Ok(())
    }

    /// Restores the invariant that children have SIFAs at least as strong as their parents,
    /// after a node below `from` gained the SIFA `strongest_allowed`.
    fn weaken_idempotence(&mut self, from: UniIndex, strongest_allowed: IdempotentForeignAccess) {
        let mut current = Some(from);
        while let Some(idx) = current {
            let Some(node) = self.nodes.get_mut(idx) else { break };
            node.default_initial_idempotent_foreign_access
                .ensure_no_stronger_than(strongest_allowed);
            current = node.parent;
            for (_, perms) in self.rperms.iter_mut_all() {
                if let Some(state) = perms.get_mut(idx) {
                    state.idempotent_foreign_access.ensure_no_stronger_than(strongest_allowed);
                }
            }
        }
    }

    /// Traverse the tree looking for the effect of an access on every location in `range`,
    /// without modifying any state.
    fn compute_access(
        &mut self,
        tag: BorTag,
        range: AllocRange,
        access_kind: AccessKind,
        access_cause: AccessCause,
        global: &GlobalCtx,
        alloc_id: AllocId,
    ) -> BtResult<Vec<Vec<Update>>> {
        let op = access_cause.op_type();
        let start_idx = self.lookup(tag, op)?;
        self.check_bounds(range, op)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let protected_tags = global.protected_tags();
        let skipping = self.foreign_access_skipping;
        let nodes = &self.nodes;
        let accessed_info = &nodes
            .get(start_idx)
            .expect("every index reachable from the root has a node")
            .debug_info;
        let mut pending = Vec::new();
        // Splitting the ranges here is not observable, even if the access is rejected.
        for (perms_range, perms) in self.rperms.iter_mut(range.start, range.size) {
            let perms = &*perms;
            let mut updates = Vec::new();
            TreeVisitor { nodes, perms }.traverse_this_parents_children_other(
                start_idx,
                |state, rel_pos| {
                    if skipping {
                        state.skip_if_known_noop(access_kind, rel_pos)
                    } else {
                        ContinueTraversal::Recurse
                    }
                },
                |idx, node, old_state, rel_pos| -> Result<(), TreeError> {
                    let protected = protected_tags.contains_key(&node.tag);
                    let mut state = old_state;
                    let transition =
                        state.perform_access(access_kind, rel_pos, protected).map_err(
                            |error_kind| {
                                TbError {
                                    error_kind,
                                    alloc_id,
                                    error_offset: perms_range.start,
                                    conflicting_info: &node.debug_info,
                                    access_cause,
                                    accessed_info,
                                    perm_before: old_state.permission(),
                                }
                                .build()
                            },
                        )?;
                    state.record_new_access(access_kind, rel_pos);
                    if state != old_state {
                        updates.push(Update {
                            idx,
                            state,
                            transition,
                            is_foreign: rel_pos.is_foreign(),
                        });
                    }
                    Ok(())
                },
            )?;
            pending.push(updates);
        }
        Ok(pending)
    }

    /// Write back the states computed by `compute_access`.
    fn commit(
        &mut self,
        pending: Vec<Vec<Update>>,
        range: AllocRange,
        access_cause: AccessCause,
        global: &GlobalCtx,
    ) {
        let config = global.config();
        let nodes = &self.nodes;
        for ((perms_range, perms), updates) in
            self.rperms.iter_mut(range.start, range.size).zip(pending)
        {
            for Update { idx, state, transition, is_foreign } in updates {
                if !transition.is_noop() {
                    if let Some(node) = nodes.get(idx).filter(|node| config.is_tracked(node.tag)) {
                        tracing::info!(
                            "{} at {:?}",
                            diagnostics::describe_transition(
                                node.tag,
                                transition,
                                access_cause,
                                is_foreign
                            ),
                            AllocRange::from(perms_range.clone()),
                        );
                    }
                }
                perms.insert(idx, state);
            }
        }
        self.maybe_merge();
    }

    /// Map the per-node and per-location `LocationState::perform_access`
    /// to each location of the access.
    ///
    /// Either every location is updated, or the first violation is returned
    /// and nothing changes.
    pub fn perform_access(
        &mut self,
        tag: BorTag,
        range: AllocRange,
        access_kind: AccessKind,
        access_cause: AccessCause,
        global: &GlobalCtx,
        alloc_id: AllocId,
    ) -> BtResult<()> {
        tracing::trace!(
            "{} through {tag:?} on {alloc_id:?} at {range:?}",
            access_cause.print_as_access(false)
        );
        let pending =
            self.compute_access(tag, range, access_kind, access_cause, global, alloc_id)?;
        self.commit(pending, range, access_cause, global);
        Ok(())
    }

    /// Check that this pointer has permission to deallocate this range.
    ///
    /// Deallocation acts as a write through `tag` on the whole allocation, and is
    /// forbidden while any tag of the tree is strongly protected.
    pub fn dealloc(&mut self, tag: BorTag, global: &GlobalCtx, alloc_id: AllocId) -> BtResult<()> {
        let range = AllocRange { start: Size::ZERO, size: self.size() };
        let pending = self.compute_access(
            tag,
            range,
            AccessKind::Write,
            AccessCause::Dealloc,
            global,
            alloc_id,
        )?;

        let strongly_protected = {
            let protected_tags = global.protected_tags();
            self.nodes.iter().find_map(|(idx, node)| {
                (protected_tags.get(&node.tag) == Some(&ProtectorKind::StrongProtector))
                    .then_some(idx)
            })
        };
        if let Some(idx) = strongly_protected {
            let accessed_idx = self.lookup(tag, BtOpType::Dealloc)?;
            let err = TbError {
                error_kind: TransitionError::ProtectedDealloc,
                alloc_id,
                error_offset: 0,
                conflicting_info: &self.node(idx).debug_info,
                access_cause: AccessCause::Dealloc,
                accessed_info: &self.node(accessed_idx).debug_info,
                perm_before: self.state_at(idx, 0).permission(),
            }
            .build();
            return Err(err.into());
        }

        self.commit(pending, range, AccessCause::Dealloc, global);
        Ok(())
    }

    /// Coalesce equal adjacent ranges once the map has grown by `merge_threshold`.
    fn maybe_merge(&mut self) {
        if self.rperms.num_ranges() >= self.ranges_at_last_merge + self.merge_threshold {
            self.rperms.merge_adjacent_thorough();
            self.ranges_at_last_merge = self.rperms.num_ranges();
        }
    }
}
