use std::fmt;

use tbsan_shared::{PermTransition, Permission};
use thiserror::Error;

use crate::diagnostics::{AccessCause, NodeDebugInfo};
use crate::AllocId;

pub type BtResult<T> = Result<T, BorrowTrackerError>;
pub type TreeTransitionResult<T> = Result<T, TransitionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// This access is not allowed because some parent tag has insufficient permissions.
    /// For example, if a tag is `Frozen` and encounters a child write this will
    /// produce a `ChildAccessForbidden(Frozen)`.
    /// This kind of error can only occur on child accesses.
    ChildAccessForbidden(Permission),
    /// A protector was triggered due to an invalid transition that loses
    /// too much permissions.
    /// For example, if a protected tag goes from `Active` to `Disabled` due
    /// to a foreign write this will produce a `ProtectedTransition(Active -> Disabled)`.
    /// This kind of error can only occur on foreign accesses.
    ProtectedTransition(PermTransition),
    /// Cannot deallocate because some tag in the allocation is strongly protected.
    /// This kind of error can only occur on deallocations.
    ProtectedDealloc,
}

impl TransitionError {
    pub fn violation_kind(self) -> ViolationKind {
        match self {
            TransitionError::ChildAccessForbidden(_) => ViolationKind::Incompatible,
            TransitionError::ProtectedTransition(_) | TransitionError::ProtectedDealloc =>
                ViolationKind::Protector,
        }
    }
}

/// Whether a violation comes from the permission itself or from a protector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// The access needs a permission that the state cannot grant.
    Incompatible,
    /// A protected tag would have lost a permission it holds.
    Protector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtOpType {
    Read,
    Write,
    Retag,
    Dealloc,
    Protect,
    Inspect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtOp {
    pub op: BtOpType,
    pub reason: Option<String>,
}

impl BtOp {
    pub fn new(op: BtOpType, reason: impl Into<String>) -> Self {
        Self { op, reason: Some(reason.into()) }
    }
}

impl fmt::Display for BtOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "during {:?}: {reason}", self.op),
            None => write!(f, "during {:?}", self.op),
        }
    }
}

#[derive(Error, Debug)]
pub enum BorrowTrackerError {
    #[error("Detected use after free {0}")]
    UseAfterFree(BtOp),
    #[error("Detected out-of-bounds access {0}")]
    OutOfBounds(BtOp),
    #[error("Invalid provenance {0}")]
    InvalidProvenance(BtOp),
    #[error("Tree Borrows violation: {0}")]
    AliasingViolation(Box<TreeError>),
}

impl BorrowTrackerError {
    /// The aliasing violation carried by this error, if there is one.
    pub fn as_violation(&self) -> Option<&TreeError> {
        match self {
            BorrowTrackerError::AliasingViolation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TreeError> for BorrowTrackerError {
    fn from(err: TreeError) -> Self {
        BorrowTrackerError::AliasingViolation(Box::new(err))
    }
}

// Derived from Miri's TbError
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeError {
    /// What failure occurred.
    pub error_kind: TransitionError,
    /// The allocation in which the error is happening.
    pub alloc_id: AllocId,
    /// The offset (into the allocation) at which the conflict occurred.
    pub error_offset: u64,
    /// The tag on which the error was triggered.
    /// On protector violations, this is the tag that was protected.
    /// On accesses rejected due to insufficient permissions, this is the
    /// tag that lacked those permissions.
    pub conflicting_info: NodeDebugInfo,
    // What kind of access caused this error (read, write, reborrow, deallocation)
    pub access_cause: AccessCause,
    /// Which tag the access that caused this error was made through, i.e.
    /// which tag was used to read/write/deallocate.
    pub accessed_info: NodeDebugInfo,
    /// Permission of the conflicting tag at `error_offset` before the access.
    pub perm_before: Permission,
    /// The permission the access would have produced, if any.
    pub perm_after: Option<Permission>,
}

impl TreeError {
    pub fn kind(&self) -> ViolationKind {
        self.error_kind.violation_kind()
    }

    /// Whether the access was made through the tag that rejected it.
    pub fn is_own_tag(&self) -> bool {
        self.conflicting_info.tag == self.accessed_info.tag
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let accessed = &self.accessed_info;
        let conflicting = &self.conflicting_info;
        write!(
            f,
            "{cause} through {accessed} at {alloc:?}[{offset:#x}] is forbidden",
            cause = self.access_cause,
            alloc = self.alloc_id,
            offset = self.error_offset,
        )?;
        match self.error_kind {
            TransitionError::ChildAccessForbidden(perm) => {
                if self.is_own_tag() {
                    write!(f, ": the accessed tag has state {perm}")
                } else {
                    write!(f, ": the accessed tag is a child of {conflicting} which has state {perm}")
                }
            }
            TransitionError::ProtectedTransition(transition) => write!(
                f,
                ": this foreign access would cause the protected tag {conflicting} to transition {transition}, which is {summary}",
                summary = transition.summary(),
            ),
            TransitionError::ProtectedDealloc =>
                write!(f, ": the allocation is strongly protected by {conflicting}"),
        }
    }
}
