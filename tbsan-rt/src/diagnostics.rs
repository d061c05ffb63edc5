// Adapted from Miri's Tree Borrows `diagnostics.rs`: only the pieces needed to
// describe a violation to the host are kept. Rendering is left to the host.
use std::fmt;

use tbsan_shared::{AccessKind, PermTransition, Permission};

use crate::borrow_tracker::errors::{
    BorrowTrackerError, BtOp, BtOpType, BtResult, TransitionError, TreeError,
};
use crate::borrow_tracker::tree::Tree;
use crate::{AllocId, BorTag};

/// Cause of an access: either a real access or one
/// inserted by Tree Borrows due to a reborrow or a deallocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessCause {
    Explicit(AccessKind),
    Reborrow,
    Dealloc,
}

impl fmt::Display for AccessCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(kind) => write!(f, "{kind}"),
            Self::Reborrow => write!(f, "reborrow"),
            Self::Dealloc => write!(f, "deallocation"),
        }
    }
}

impl AccessCause {
    /// The access this cause acts as, as seen from a node with relation `rel`.
    pub fn print_as_access(self, is_foreign: bool) -> String {
        let rel = if is_foreign { "foreign" } else { "child" };
        match self {
            Self::Explicit(kind) => format!("{rel} {kind}"),
            Self::Reborrow => format!("reborrow (acting as a {rel} read access)"),
            Self::Dealloc => format!("deallocation (acting as a {rel} write access)"),
        }
    }

    pub(crate) fn op_type(self) -> BtOpType {
        match self {
            Self::Explicit(AccessKind::Read) => BtOpType::Read,
            Self::Explicit(AccessKind::Write) => BtOpType::Write,
            Self::Reborrow => BtOpType::Retag,
            Self::Dealloc => BtOpType::Dealloc,
        }
    }
}

/// Some information that is irrelevant for the algorithm but very
/// convenient to know about a tag for debugging and testing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDebugInfo {
    /// The tag in question.
    pub tag: BorTag,
    /// Name(s) that were associated with this tag (comma-separated).
    /// Typically the name of the variable holding the corresponding
    /// pointer in the source code.
    /// Helps match tag numbers to human-readable names.
    pub name: Option<String>,
    /// The permission this tag was created with.
    pub created: Permission,
}

impl NodeDebugInfo {
    /// Information for a new node. By default it has no name.
    pub fn new(tag: BorTag, initial: Permission) -> Self {
        Self { tag, name: None, created: initial }
    }

    /// Add a name to the tag. If a same tag is associated to several pointers,
    /// it can have several names which will be separated by commas.
    pub fn add_name(&mut self, name: &str) {
        if let Some(prev_name) = &mut self.name {
            prev_name.push_str(", ");
            prev_name.push_str(name);
        } else {
            self.name = Some(String::from(name));
        }
    }
}

impl fmt::Display for NodeDebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref name) = self.name {
            write!(f, "{tag:?} ({name})", tag = self.tag)
        } else {
            write!(f, "{tag:?}", tag = self.tag)
        }
    }
}

impl Tree {
    /// Climb the tree to get the tag of a distant ancestor.
    /// Allows operations on tags that are unreachable by the program
    /// but still exist in the tree.
    fn nth_parent(&self, tag: BorTag, nth_parent: u8) -> Option<BorTag> {
        let mut idx = self.tag_mapping.get(&tag)?;
        for _ in 0..nth_parent {
            let node = self.nodes.get(idx)?;
            idx = node.parent?;
        }
        Some(self.nodes.get(idx)?.tag)
    }

    /// Debug helper: assign name to tag.
    pub fn give_pointer_debug_name(
        &mut self,
        tag: BorTag,
        nth_parent: u8,
        name: &str,
    ) -> BtResult<()> {
        let Some(target) = self.nth_parent(tag, nth_parent) else {
            return Err(BorrowTrackerError::InvalidProvenance(BtOp::new(
                BtOpType::Inspect,
                format!("tag {tag:?} has no ancestor at depth {nth_parent}"),
            )));
        };
        if let Some(node) = self.tag_mapping.get(&target).and_then(|idx| self.nodes.get_mut(idx)) {
            node.debug_info.add_name(name);
        } else {
            tracing::warn!("Tag {target:?} (to be named '{name}') not found!");
        }
        Ok(())
    }

    /// Debug helper: determines if the tree contains a tag.
    pub fn is_allocation_of(&self, tag: BorTag) -> bool {
        self.tag_mapping.contains_key(&tag)
    }
}

/// Failures that can occur during the execution of Tree Borrows procedures.
/// Borrows the debug info of both tags until it is turned into a `TreeError`.
pub(crate) struct TbError<'node> {
    pub error_kind: TransitionError,
    pub alloc_id: AllocId,
    pub error_offset: u64,
    pub conflicting_info: &'node NodeDebugInfo,
    pub access_cause: AccessCause,
    pub accessed_info: &'node NodeDebugInfo,
    /// State of the conflicting tag at `error_offset` before the access.
    pub perm_before: Permission,
}

impl TbError<'_> {
    /// Produce a self-contained report of the violation.
    pub fn build(self) -> TreeError {
        let perm_after = match self.error_kind {
            TransitionError::ProtectedTransition(transition) => Some(transition.endpoint()),
            TransitionError::ChildAccessForbidden(_) | TransitionError::ProtectedDealloc => None,
        };
        TreeError {
            error_kind: self.error_kind,
            alloc_id: self.alloc_id,
            error_offset: self.error_offset,
            conflicting_info: self.conflicting_info.clone(),
            access_cause: self.access_cause,
            accessed_info: self.accessed_info.clone(),
            perm_before: self.perm_before,
            perm_after,
        }
    }
}

/// A one-line description of a transition, for logs about tracked tags.
pub(crate) fn describe_transition(
    tag: BorTag,
    transition: PermTransition,
    cause: AccessCause,
    is_foreign: bool,
) -> String {
    format!(
        "the tag {tag:?} transitioned {transition} due to a {access}, which is {summary}",
        access = cause.print_as_access(is_foreign),
        summary = transition.summary(),
    )
}
