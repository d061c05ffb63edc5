use core::fmt;
use core::ops::{Add, Range};

use crate::Permission;

/// A number of bytes, or an offset in bytes into an allocation.
#[repr(transparent)]
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Size(u64);

impl Size {
    pub const ZERO: Size = Size(0);

    /// Get a Size defined by a number of bytes
    pub const fn from_bytes(bytes: u64) -> Size {
        Size(bytes)
    }

    /// Get the number of bytes in a size
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size(self.0 + rhs.0)
    }
}

impl fmt::Debug for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "s{}", self.0) } else { write!(f, "size{}", self.0) }
    }
}

/// A contiguous range of bytes inside an allocation, relative to its base.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
pub struct AllocRange {
    pub start: Size,
    pub size: Size,
}

impl AllocRange {
    pub fn new(start: u64, size: u64) -> Self {
        AllocRange { start: Size::from_bytes(start), size: Size::from_bytes(size) }
    }

    /// One past the last byte of the range, `None` if it does not fit in a `u64`.
    pub fn checked_end(self) -> Option<Size> {
        self.start.bytes().checked_add(self.size.bytes()).map(Size::from_bytes)
    }

    pub fn is_empty(self) -> bool {
        self.size == Size::ZERO
    }
}

impl From<Range<u64>> for AllocRange {
    fn from(range: Range<u64>) -> Self {
        AllocRange::new(range.start, range.end.saturating_sub(range.start))
    }
}

impl fmt::Debug for AllocRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.bytes();
        write!(f, "[{start:#x}..{:#x}]", start.saturating_add(self.size.bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectorKind {
    #[default]
    NoProtector,
    /// Protected against aliasing violations from other pointers.
    ///
    /// Items protected like this cause UB when they are invalidated, *but* the pointer itself may
    /// still be used to issue a deallocation.
    ///
    /// This is required for LLVM IR pointers that are `noalias` but *not* `dereferenceable`.
    WeakProtector,

    /// Protected against any kind of invalidation.
    ///
    /// Items protected like this cause UB when they are invalidated or the memory is deallocated.
    /// This is strictly stronger protection than `WeakProtector`.
    ///
    /// This is required for LLVM IR pointers that are `dereferenceable` (and also allows `noalias`).
    StrongProtector,
}

impl ProtectorKind {
    pub fn is_protector(self) -> bool {
        !matches!(self, ProtectorKind::NoProtector)
    }
}

/// How the host derived a new pointer from an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivationKind {
    /// `&mut T` where `T: Unpin`.
    ExclusiveReborrow,
    /// `&T`. Only gets its own node when `T` has no interior mutability.
    SharedReborrow,
    /// Raw pointers and `&mut T` where `T: !Unpin`. These keep the parent's tag.
    RawOrRetained,
}

impl DerivationKind {
    /// The permission of the node this derivation creates, or `None` if the new
    /// pointer is folded into its parent's tag.
    pub fn initial_permission(self, interior_mut: bool) -> Option<Permission> {
        match self {
            DerivationKind::ExclusiveReborrow => Some(Permission::new_reserved(interior_mut)),
            DerivationKind::SharedReborrow if interior_mut => None,
            DerivationKind::SharedReborrow => Some(Permission::new_frozen()),
            DerivationKind::RawOrRetained => None,
        }
    }
}

/// Everything the runtime needs to know about a pointer creation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetagInfo {
    pub derivation: DerivationKind,
    pub interior_mut: bool,
    pub protector_kind: ProtectorKind,
}

impl RetagInfo {
    #[inline]
    pub fn new(derivation: DerivationKind, interior_mut: bool) -> Self {
        Self { derivation, interior_mut, protector_kind: ProtectorKind::NoProtector }
    }

    /// Same as `new`, but the new tag is protected by the innermost call frame.
    #[inline]
    pub fn protected(derivation: DerivationKind, interior_mut: bool, kind: ProtectorKind) -> Self {
        Self { derivation, interior_mut, protector_kind: kind }
    }
}
