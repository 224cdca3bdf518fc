//! A tracing, segregated-size-class garbage collector for managed-language
//! runtimes.
//!
//! `reclaim-gc` manages all heap memory for an embedding runtime:
//! allocation through size-class slab pools and a large-object pool,
//! liveness marking over a conservative pointer graph, sweeping,
//! finalization, and partial/concurrent collection modes backed by a
//! card-table write barrier.
//!
//! # Architecture
//!
//! - **Slabs** are page-aligned blocks of equal-size slots with separate
//!   free and mark bit vectors and a per-slot attribute byte. One slab
//!   serves one (size class, attribute class) pair.
//! - **Pools** own slabs on allocatable/full/empty/pending lists; an
//!   allocator cache gives the mutator a bump-pointer fast path.
//! - **Large objects** live behind inline headers with an address-sorted
//!   free-span list (split on allocation, coalesce on free) and support
//!   explicit release.
//! - The **collector facade** drives whole-heap cycles:
//!   `Idle -> ResetMarks -> ScanRoots -> Mark -> Sweep -> Idle`, either
//!   stop-the-world or with marking and sweeping on a background worker.
//!
//! # Quick start
//!
//! ```no_run
//! use reclaim_gc::{CollectMode, Collector, ObjectAttributes};
//!
//! let gc = Collector::new().unwrap();
//!
//! // Allocate a pointer-free object and a scanned one.
//! let leaf = gc.alloc(24, ObjectAttributes::LEAF).unwrap();
//! let node = gc.alloc(48, ObjectAttributes::NONE).unwrap();
//!
//! // Roots are explicit: pin an object or register a scanned region.
//! gc.pin_root(node).unwrap();
//!
//! gc.collect_now(CollectMode::Exhaustive).unwrap();
//! assert!(gc.is_live_object(node));
//! # let _ = leaf;
//! ```
//!
//! # Concurrent collection and the write barrier
//!
//! [`CollectMode::Concurrent`] marks and sweeps on a background thread
//! while the mutator keeps running. Correctness requires the write-barrier
//! contract: every pointer store into an object allocated with
//! [`ObjectAttributes::WRITE_BARRIER`] must be reported through
//! [`Collector::write_barrier`] (or the indexed store against
//! [`barrier::WriteBarrierTable`] that compiled code emits) with no
//! arbitrary delay. Dirty regions are rescanned in a short stop-the-world
//! tail before sweeping. Objects that receive pointer stores during
//! concurrent cycles must be barrier-tracked; untracked objects are only
//! safe to mutate between cycles.
//!
//! # Threading
//!
//! A [`Collector`] belongs to one mutator thread (it is neither `Send` nor
//! `Sync`). The optional background worker communicates exclusively through
//! job/notice channels drained at safe points — there are no per-list locks.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod attrs;
mod bits;
mod cache;
mod collector;
mod config;
mod error;
mod heap;
mod large;
mod mark;
mod metrics;
mod pool;
mod slab;
mod sweep;

/// Card-table write barrier; public because its base-pointer-and-shift
/// indexing is a stable contract with compiled code.
pub mod barrier;

#[cfg(feature = "tracing")]
mod tracing;

pub use attrs::{AttributeClass, ObjectAttributes};
pub use collector::{CollectMode, Collector};
pub use config::{CollectorConfig, SizeBucket, SMALL_GRANULARITY};
pub use error::{CollectorError, Result};
pub use metrics::{
    CollectionKind, GcMetrics, MemoryEvent, MemoryEventCallback, MemoryUsage,
};
