use core::cmp::Ordering;
use core::cmp::Ordering::*;
use core::fmt;

use crate::{AccessKind, AccessRelatedness, IdempotentForeignAccess};

/// The activation states of a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PermissionPriv {
    /// represents: a local mutable reference that has not yet been written to;
    /// allows: child reads, foreign reads;
    /// affected by: child writes (becomes Active),
    /// rejects: foreign writes (Disabled).
    ///
    /// `ReservedFrz` is for types that are `Freeze` (no interior mutability).
    /// If the type has interior mutability, see `ReservedIM` instead.
    ///
    /// special case: behaves differently when protected. A foreign read makes
    /// a protected `Reserved` become `Frozen` right away, so that
    /// foreign-read then child-write is UB, as `noalias` requires.
    ReservedFrz,
    /// Alternative version of `ReservedFrz` made for types with interior mutability.
    /// allows: child reads, foreign reads, foreign writes (extra);
    /// affected by: child writes (becomes Active);
    /// rejects: nothing, unless protected.
    ReservedIM,
    /// represents: a unique pointer;
    /// allows: child reads, child writes;
    /// rejects: foreign reads (Frozen), foreign writes (Disabled).
    Active,
    /// represents: a shared pointer;
    /// allows: all read accesses;
    /// rejects child writes (UB), foreign writes (Disabled).
    Frozen,
    /// represents: a dead pointer;
    /// allows: all foreign accesses;
    /// rejects: all child accesses (UB).
    Disabled,
}
use self::PermissionPriv::*;

impl PartialOrd for PermissionPriv {
    /// PermissionPriv is ordered by the reflexive transitive closure of
    /// `Reserved < Active < Frozen < Disabled`.
    /// `Reserved` that have incompatible interior mutability are incomparable to each other.
    /// This ordering matches the reachability by transitions, as asserted by the exhaustive test
    /// `permissionpriv_partialord_is_reachability`.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(match (self, other) {
            (a, b) if a == b => Equal,
            (Disabled, _) => Greater,
            (_, Disabled) => Less,
            (Frozen, _) => Greater,
            (_, Frozen) => Less,
            (Active, _) => Greater,
            (_, Active) => Less,
            // Versions of `Reserved` with different interior mutability are incomparable with each
            // other.
            (ReservedIM, ReservedFrz) | (ReservedFrz, ReservedIM) => return None,
            (ReservedIM, ReservedIM) | (ReservedFrz, ReservedFrz) => Equal,
        })
    }
}

impl PermissionPriv {
    /// Check if `self` can be the initial state of a pointer.
    fn is_initial(&self) -> bool {
        matches!(self, ReservedFrz | Frozen | ReservedIM)
    }

    fn kind(&self) -> PermissionKind {
        match self {
            ReservedFrz | ReservedIM => PermissionKind::Reserved,
            Active => PermissionKind::Active,
            Frozen => PermissionKind::Frozen,
            Disabled => PermissionKind::Disabled,
        }
    }
}

/// This module controls how each permission individually reacts to an access.
/// Although these functions take `protected` as an argument, this is NOT because
/// we check protector violations here, but because some permissions behave differently
/// when protected.
mod transition {
    use super::*;

    /// A child node was read-accessed: UB on Disabled, noop on the rest.
    fn child_read(state: PermissionPriv, _protected: bool) -> Option<PermissionPriv> {
        Some(match state {
            Disabled => return None,
            // Interior mutability of `Reserved` is irrelevant for reads.
            readable @ (ReservedFrz | ReservedIM | Active | Frozen) => readable,
        })
    }

    /// A non-child node was read-accessed: keep `Reserved` but mark it as `Frozen`
    /// if it is protected; invalidate `Active`.
    fn foreign_read(state: PermissionPriv, protected: bool) -> Option<PermissionPriv> {
        Some(match state {
            // Foreign reads are not allowed to coexist with a later child write
            // while the protector is active.
            ReservedFrz | ReservedIM if protected => Frozen,
            res @ (ReservedFrz | ReservedIM) => res,
            // Whether the transition `Active -> Frozen` is allowed for a
            // protected tag is decided by the caller, see `PermTransition::is_protector_violation`.
            Active => Frozen,
            non_writeable @ (Frozen | Disabled) => non_writeable,
        })
    }

    /// A child node was write-accessed: `Reserved` must become `Active` to obtain
    /// write permissions, `Frozen` and `Disabled` cannot obtain such permissions and produce UB.
    fn child_write(state: PermissionPriv, _protected: bool) -> Option<PermissionPriv> {
        Some(match state {
            ReservedFrz | ReservedIM | Active => Active,
            Frozen | Disabled => return None,
        })
    }

    /// A non-child node was write-accessed: this makes everything `Disabled` except for
    /// non-protected interior mutable `Reserved` which stay the same.
    fn foreign_write(state: PermissionPriv, protected: bool) -> Option<PermissionPriv> {
        Some(match state {
            res @ ReservedIM if !protected => res,
            _ => Disabled,
        })
    }

    /// Dispatch handler depending on the kind of access and its position.
    pub(super) fn perform_access(
        kind: AccessKind,
        rel_pos: AccessRelatedness,
        child: PermissionPriv,
        protected: bool,
    ) -> Option<PermissionPriv> {
        match (kind, rel_pos.is_foreign()) {
            (AccessKind::Write, true) => foreign_write(child, protected),
            (AccessKind::Read, true) => foreign_read(child, protected),
            (AccessKind::Write, false) => child_write(child, protected),
            (AccessKind::Read, false) => child_read(child, protected),
        }
    }
}

/// The four named permission states, totally ordered by decreasing capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionKind {
    Reserved,
    Active,
    Frozen,
    Disabled,
}

/// Whether a permission may write now, may write after being activated, or never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteCapability {
    Yes,
    Future,
    No,
}

/// Public interface to the state machine that controls read-write permissions.
/// This is the "private `enum`" pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permission {
    inner: PermissionPriv,
}

/// Transition from one permission to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermTransition {
    from: PermissionPriv,
    to: PermissionPriv,
}

impl Permission {
    /// Check if `self` can be the initial state of a pointer.
    pub fn is_initial(&self) -> bool {
        self.inner.is_initial()
    }
    /// Check if `self` is the terminal state of a pointer (is `Disabled`).
    pub fn is_disabled(&self) -> bool {
        self.inner == Disabled
    }
    /// Check if `self` is the post-child-write state of a pointer (is `Active`).
    pub fn is_active(&self) -> bool {
        self.inner == Active
    }
    /// Check if `self` is the shared-reference state of a pointer (is `Frozen`).
    pub fn is_frozen(&self) -> bool {
        self.inner == Frozen
    }
    /// Check if `self` is still waiting for its first child write.
    pub fn is_reserved(&self) -> bool {
        matches!(self.inner, ReservedFrz | ReservedIM)
    }

    /// Default initial permission of the root of a new tree at inbounds positions.
    /// Must *only* be used for the root, this is not in general an "initial" permission!
    pub fn new_active() -> Self {
        Self { inner: Active }
    }

    /// Default initial permission of a reborrowed mutable reference.
    /// Interior mutability is fixed for the lifetime of the tag; protectors only
    /// change how accesses act on it.
    pub fn new_reserved(interior_mut: bool) -> Self {
        if interior_mut { Self { inner: ReservedIM } } else { Self { inner: ReservedFrz } }
    }

    /// Default initial permission of a reborrowed shared reference.
    pub fn new_frozen() -> Self {
        Self { inner: Frozen }
    }

    /// Default initial permission of the root of a new tree at out-of-bounds positions.
    /// Must *only* be used for the root, this is not in general an "initial" permission!
    pub fn new_disabled() -> Self {
        Self { inner: Disabled }
    }

    /// Which of the four named states this permission is in.
    pub fn kind(&self) -> PermissionKind {
        self.inner.kind()
    }

    pub fn read_capability(&self) -> bool {
        !self.is_disabled()
    }

    pub fn write_capability(&self) -> WriteCapability {
        match self.inner {
            ReservedFrz | ReservedIM => WriteCapability::Future,
            Active => WriteCapability::Yes,
            Frozen | Disabled => WriteCapability::No,
        }
    }

    /// Apply the transition to the inner PermissionPriv.
    pub fn perform_access(
        kind: AccessKind,
        rel_pos: AccessRelatedness,
        old_perm: Self,
        protected: bool,
    ) -> Option<PermTransition> {
        let old_state = old_perm.inner;
        transition::perform_access(kind, rel_pos, old_state, protected)
            .map(|new_state| PermTransition { from: old_state, to: new_state })
    }

    /// The strongest foreign access that leaves this permission unchanged.
    /// A node and all its children can only be skipped if every one of them
    /// survives the access, see `foreign_access_skipping.rs`.
    pub fn strongest_idempotent_foreign_access(&self, protected: bool) -> IdempotentForeignAccess {
        match self.inner {
            // A protected `Reserved` becomes `Frozen` on the next foreign read.
            ReservedFrz | ReservedIM if protected => IdempotentForeignAccess::None,
            // Cell survives any foreign access.
            ReservedIM => IdempotentForeignAccess::Write,
            ReservedFrz => IdempotentForeignAccess::Read,
            Active => IdempotentForeignAccess::None,
            Frozen => IdempotentForeignAccess::Read,
            Disabled => IdempotentForeignAccess::Write,
        }
    }

    /// Abbreviated name of the permission, used when printing trees.
    pub fn short_name(self) -> &'static str {
        match self.inner {
            ReservedFrz => "Res",
            ReservedIM => "ReIM",
            Active => "Act",
            Frozen => "Frz",
            Disabled => "Dis",
        }
    }
}

impl PartialOrd for Permission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.inner.partial_cmp(&other.inner)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self.inner {
                ReservedFrz => "Reserved",
                ReservedIM => "Reserved (interior mutable)",
                Active => "Active",
                Frozen => "Frozen",
                Disabled => "Disabled",
            }
        )
    }
}

impl PermTransition {
    /// All transitions created through normal means (using `perform_access`)
    /// should be possible, but the same is not guaranteed by construction of
    /// transitions inferred by diagnostics. This checks that a transition
    /// reconstructed by diagnostics is indeed one that could happen.
    fn is_possible(self) -> bool {
        self.from <= self.to
    }

    pub fn is_noop(self) -> bool {
        self.from == self.to
    }

    /// The permission before the access.
    pub fn started(self) -> Permission {
        Permission { inner: self.from }
    }

    /// The permission after the access.
    pub fn endpoint(self) -> Permission {
        Permission { inner: self.to }
    }

    /// Determines if this transition would disable the permission.
    pub fn produces_disabled(self) -> bool {
        self.from != Disabled && self.to == Disabled
    }

    /// A protected tag must not lose its read permission, nor a write
    /// permission it already holds. Losing a *future* write (`Reserved -> Frozen`)
    /// is allowed.
    pub fn is_protector_violation(self) -> bool {
        let (from, to) = (self.started(), self.endpoint());
        let loses_read = from.read_capability() && !to.read_capability();
        let loses_write = from.write_capability() == WriteCapability::Yes
            && to.write_capability() == WriteCapability::No;
        loses_read || loses_write
    }

    /// Extract result of a transition (checks that the starting point matches).
    pub fn applied(self, starting_point: Permission) -> Option<Permission> {
        (starting_point.inner == self.from).then_some(Permission { inner: self.to })
    }

    /// Provide a textual description of what happened.
    pub fn summary(&self) -> &'static str {
        debug_assert!(self.is_possible());
        match (self.from, self.to) {
            (a, b) if a == b => "no change",
            (_, Active) => "the first write to a 2-phase borrowed mutable reference",
            (_, Frozen) => "a loss of write permissions",
            (Frozen, Disabled) => "a loss of read permissions",
            (_, Disabled) => "a loss of read and write permissions",
            (_, ReservedFrz | ReservedIM) => "a change of interior mutability",
        }
    }
}

impl fmt::Display for PermTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from {} to {}", self.started(), self.endpoint())
    }
}
