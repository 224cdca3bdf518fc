//! Per-object attribute bits and the slab variant matrix.

use crate::error::{CollectorError, Result};

/// Attribute bits carried by every allocation.
///
/// The lower byte is stored per slot. The encoding is part of the collector's
/// stable contract with the embedding runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectAttributes(u8);

impl ObjectAttributes {
    /// No attributes: a scanned, non-finalizable object.
    pub const NONE: Self = Self(0x00);
    /// The object has a registered finalizer and must not be reclaimed
    /// before it runs.
    pub const FINALIZE: Self = Self(0x80);
    /// Set by the sweep on dead finalizable objects awaiting dispose.
    /// Rejected at allocation time.
    pub const PENDING_DISPOSE: Self = Self(0x40);
    /// The object contains no pointers; the marker never scans it.
    pub const LEAF: Self = Self(0x20);
    /// The object is tracked by the embedding runtime. Tracked objects are
    /// always scanned (never leaf) and carry their bit through sweep.
    pub const TRACKED: Self = Self(0x10);
    /// The object is a root regardless of graph connectivity.
    pub const IMPLICIT_ROOT: Self = Self(0x08);
    /// Pointer stores into the object must go through the write barrier;
    /// the object is placed in barrier-tracked slabs.
    pub const WRITE_BARRIER: Self = Self(0x04);

    const ALLOC_MASK: u8 = 0x80 | 0x20 | 0x10 | 0x08 | 0x04;

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from raw bits without validation. Used when reading
    /// stored attribute bytes back out of a slab.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits)
    }

    /// Validate attribute bits for an allocation request.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::InvalidAttributes`] for unknown bits or for
    /// bits only the collector itself may set (`PENDING_DISPOSE`).
    pub const fn for_alloc(bits: u8) -> Result<Self> {
        if bits & !Self::ALLOC_MASK != 0 {
            return Err(CollectorError::InvalidAttributes { bits });
        }
        Ok(Self(bits))
    }

    /// Combine two attribute sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if all bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Objects without pointers are not scanned. A tracked object is always
    /// scanned even if the embedder also passed `LEAF`.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.0 & Self::LEAF.0 != 0 && self.0 & Self::TRACKED.0 == 0
    }

    /// True if the object was allocated with a finalizer slot.
    #[must_use]
    pub const fn is_finalizable(self) -> bool {
        self.0 & Self::FINALIZE.0 != 0
    }

    /// True if stores into the object are barrier-recorded.
    #[must_use]
    pub const fn has_write_barrier(self) -> bool {
        self.0 & Self::WRITE_BARRIER.0 != 0
    }

    /// True if the object roots itself.
    #[must_use]
    pub const fn is_implicit_root(self) -> bool {
        self.0 & Self::IMPLICIT_ROOT.0 != 0
    }

    /// True once the sweep has tagged the object for dispose.
    #[must_use]
    pub const fn is_pending_dispose(self) -> bool {
        self.0 & Self::PENDING_DISPOSE.0 != 0
    }
}

/// The closed set of slab variants.
///
/// The size/attribute matrix from the original design is a family of
/// template-specialized block types; here it is one `Slab` type plus this
/// tag chosen at construction, dispatched by `match` in the capability
/// surface (sweep, mark, find, enumerate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeClass {
    /// Scanned objects, no finalizers, no barrier.
    Normal = 0,
    /// Pointer-free objects.
    Leaf = 1,
    /// Objects with finalizer slots.
    Finalizable = 2,
    /// Scanned objects whose stores are barrier-recorded.
    WriteBarrier = 3,
    /// Finalizable and barrier-recorded.
    FinalizableWriteBarrier = 4,
}

impl AttributeClass {
    /// Number of attribute classes; sizing for pool matrices.
    pub const COUNT: usize = 5;

    /// All classes, in index order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Normal,
        Self::Leaf,
        Self::Finalizable,
        Self::WriteBarrier,
        Self::FinalizableWriteBarrier,
    ];

    /// Classify an allocation request.
    #[must_use]
    pub const fn from_attrs(attrs: ObjectAttributes) -> Self {
        match (
            attrs.is_finalizable(),
            attrs.has_write_barrier(),
            attrs.is_leaf(),
        ) {
            (true, true, _) => Self::FinalizableWriteBarrier,
            (true, false, _) => Self::Finalizable,
            (false, true, _) => Self::WriteBarrier,
            (false, false, true) => Self::Leaf,
            (false, false, false) => Self::Normal,
        }
    }

    /// Index into per-class arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Slabs of this class carry finalizer slots.
    #[must_use]
    pub const fn has_finalizers(self) -> bool {
        matches!(self, Self::Finalizable | Self::FinalizableWriteBarrier)
    }

    /// Slabs of this class register their pages with the write barrier
    /// table on reserve.
    #[must_use]
    pub const fn barrier_tracked(self) -> bool {
        matches!(self, Self::WriteBarrier | Self::FinalizableWriteBarrier)
    }

    /// Objects in this class are never scanned. Per-object `LEAF` bits can
    /// additionally suppress scanning inside non-leaf classes.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Leaf)
    }

    /// Slabs of this class may be handed to the background sweeper.
    /// Finalizable classes require synchronous handling because finalizers
    /// run on the owning thread.
    #[must_use]
    pub const fn sweeps_in_background(self) -> bool {
        !self.has_finalizers()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeClass, ObjectAttributes};

    #[test]
    fn alloc_validation() {
        assert!(ObjectAttributes::for_alloc(0).is_ok());
        assert!(ObjectAttributes::for_alloc(ObjectAttributes::LEAF.bits()).is_ok());
        assert!(ObjectAttributes::for_alloc(ObjectAttributes::PENDING_DISPOSE.bits()).is_err());
        assert!(ObjectAttributes::for_alloc(0x02).is_err());
    }

    #[test]
    fn classification_matrix() {
        let f = ObjectAttributes::FINALIZE;
        let b = ObjectAttributes::WRITE_BARRIER;
        let l = ObjectAttributes::LEAF;
        assert_eq!(
            AttributeClass::from_attrs(ObjectAttributes::NONE),
            AttributeClass::Normal
        );
        assert_eq!(AttributeClass::from_attrs(l), AttributeClass::Leaf);
        assert_eq!(AttributeClass::from_attrs(f), AttributeClass::Finalizable);
        assert_eq!(AttributeClass::from_attrs(b), AttributeClass::WriteBarrier);
        assert_eq!(
            AttributeClass::from_attrs(f.union(b)),
            AttributeClass::FinalizableWriteBarrier
        );
        // A finalizable leaf still lives in the finalizable class; the leaf
        // bit is honored per object at scan time.
        assert_eq!(
            AttributeClass::from_attrs(f.union(l)),
            AttributeClass::Finalizable
        );
    }

    #[test]
    fn tracked_is_never_leaf() {
        let t = ObjectAttributes::TRACKED.union(ObjectAttributes::LEAF);
        assert!(!t.is_leaf());
    }
}
