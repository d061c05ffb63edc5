use crate::{AccessKind, AccessRelatedness};

/// Summary of which foreign accesses are known to leave a node *and its whole subtree*
/// unchanged, recorded per location (the "strongest idempotent foreign access", SIFA).
///
/// Foreign accesses tend to come in streaks and every transition is idempotent, so once
/// a subtree has seen a foreign access of some kind, seeing it again is a noop and the
/// traversal may skip the subtree entirely. Setting the summary to `None` is always
/// sound; stronger values only make more accesses skippable.
///
/// - `None`: nothing can be skipped.
/// - `Read`: foreign reads can be skipped, foreign writes cannot.
/// - `Write`: every foreign access can be skipped (after a foreign write, a foreign
///   read changes nothing, see test `foreign_read_is_noop_after_foreign_write`).
///
/// Invariant: at every location, the SIFA of a child is at least as strong as the SIFA
/// of its parent. Accesses maintain it naturally, since a foreign access to a node is
/// also foreign to all its children. Two events break it and must weaken the ancestors
/// through `ensure_no_stronger_than`: inserting a new child, and protecting an existing
/// tag (a protected `Reserved` reacts to foreign reads).
///
/// The derived order `None < Read < Write` is relied upon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdempotentForeignAccess {
    #[default]
    None,
    Read,
    Write,
}

impl IdempotentForeignAccess {
    /// Returns true if a node where the strongest idempotent foreign access is `self`
    /// can skip the access `happening_next`. Note that if this returns
    /// `true`, then the entire subtree will be skipped.
    pub fn can_skip_foreign_access(self, happening_next: IdempotentForeignAccess) -> bool {
        debug_assert!(happening_next.is_foreign());
        // This ordering is correct. Intuitively, if the last access here was
        // a foreign write, everything can be skipped, since after a foreign write,
        // all further foreign accesses are idempotent
        happening_next <= self
    }

    /// Updates `self` to account for a foreign access.
    pub fn record_new(&mut self, just_happened: IdempotentForeignAccess) {
        if just_happened.is_local() {
            // If the access is local, reset everything.
            *self = IdempotentForeignAccess::None;
        } else {
            // If the access is foreign, see what happened. We can only record it if it is stronger.
            *self = (*self).max(just_happened);
        }
    }

    /// Returns true if this access is local.
    pub fn is_local(self) -> bool {
        matches!(self, IdempotentForeignAccess::None)
    }

    /// Returns true if this access is foreign, i.e. not local.
    pub fn is_foreign(self) -> bool {
        !self.is_local()
    }

    /// Constructs a foreign access from an `AccessKind`
    pub fn from_foreign(acc: AccessKind) -> IdempotentForeignAccess {
        match acc {
            AccessKind::Read => Self::Read,
            AccessKind::Write => Self::Write,
        }
    }

    /// Usually, tree traversals have an `AccessKind` and an `AccessRelatedness`.
    /// This methods converts these into the corresponding `IdempotentForeignAccess`, to be used
    /// to e.g. invoke `can_skip_foreign_access`.
    pub fn from_acc_and_rel(acc: AccessKind, rel: AccessRelatedness) -> IdempotentForeignAccess {
        if rel.is_foreign() { Self::from_foreign(acc) } else { Self::None }
    }

    /// During retags, the SIFA needs to be weakened to account for children with weaker SIFAs being inserted.
    /// Thus, this method is called from the bottom up on each parent, until it returns false, which means the
    /// "children have stronger SIFAs" invariant is restored.
    pub fn ensure_no_stronger_than(&mut self, strongest_allowed: IdempotentForeignAccess) -> bool {
        if *self > strongest_allowed {
            *self = strongest_allowed;
            true
        } else {
            false
        }
    }
}
