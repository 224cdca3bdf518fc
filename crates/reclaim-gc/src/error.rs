//! Error taxonomy for the collector.
//!
//! Three classes of failure exist and they are deliberately not unified:
//!
//! - *Resource exhaustion* (`OutOfMemory`) is recoverable by the caller and
//!   only surfaces after the collector has already forced an exhaustive
//!   collection and retried.
//! - *Usage errors* (everything else in [`CollectorError`]) leave the heap
//!   untouched; the caller may retry after fixing the call.
//! - *Invariant violations* are not errors at all: continuing after one risks
//!   silent heap corruption, so [`fatal::invariant_violation`] aborts the
//!   process. They are never representable as a catchable value.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = CollectorError> = std::result::Result<T, E>;

/// Recoverable failures reported by the collector API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollectorError {
    /// Page reservation or size-class growth failed even after an exhaustive
    /// collection and retry.
    #[error("out of memory reserving {pages} pages")]
    OutOfMemory {
        /// Number of pages the failed reservation asked for.
        pages: usize,
    },

    /// A requested size would overflow slab or header sizing arithmetic.
    #[error("allocation size {size} overflows sizing computations")]
    SizeOverflow {
        /// The offending request size.
        size: usize,
    },

    /// The attribute byte contains bits that are not valid at allocation
    /// time (for example `PENDING_DISPOSE`, which only the sweep sets).
    #[error("invalid allocation attributes {bits:#04x}")]
    InvalidAttributes {
        /// The raw attribute byte as passed in.
        bits: u8,
    },

    /// A collection or mutation was requested while a heap walk holds
    /// exclusive access.
    #[error("heap walk in progress")]
    HeapWalkInProgress,

    /// A collector entry point was re-entered while a collection is running.
    #[error("collection already in progress")]
    CollectionInProgress,

    /// An allocation was attempted from inside a before-collect callback.
    #[error("allocation from inside a before-collect callback is rejected")]
    ReentrantAllocation,

    /// The address does not resolve to the start of a live allocation.
    #[error("address {addr:#x} is not a live object known to the collector")]
    UnknownObject {
        /// The address that failed to resolve.
        addr: usize,
    },

    /// A finalizer was registered on an object not allocated with the
    /// `FINALIZE` attribute.
    #[error("object {addr:#x} was not allocated finalizable")]
    NotFinalizable {
        /// Start address of the object.
        addr: usize,
    },

    /// `unpin_root` on an address with no outstanding pin.
    #[error("address {addr:#x} has no outstanding pin")]
    NotPinned {
        /// The address passed to `unpin_root`.
        addr: usize,
    },

    /// The collector has been disabled for teardown; no new allocation or
    /// collection requests are accepted.
    #[error("collector is disabled")]
    Disabled,
}

pub(crate) mod fatal {
    //! Fail-fast path for invariant violations.

    /// Abort the process. Heap invariant violations indicate pointer-tracking
    /// bugs elsewhere; continuing risks silent corruption.
    #[cold]
    #[inline(never)]
    pub fn invariant_violation(msg: &str) -> ! {
        // Stderr rather than a logger: the process is about to die and the
        // message must not depend on subscriber state.
        eprintln!("heap invariant violated: {msg}");
        std::process::abort();
    }
}

/// Abort unless a heap invariant holds.
macro_rules! heap_verify {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::error::fatal::invariant_violation($msg);
        }
    };
}

pub(crate) use heap_verify;
