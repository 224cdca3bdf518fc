//! Internal tracing spans, compiled in with the `tracing` feature.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id tying a cycle's spans together.
pub(crate) fn next_gc_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn collection_span(kind: &'static str, gc_id: u64) -> tracing::Span {
    tracing::debug_span!("gc_collection", kind, gc_id)
}

pub(crate) fn phase_span(phase: &'static str) -> tracing::Span {
    tracing::trace_span!("gc_phase", phase)
}
