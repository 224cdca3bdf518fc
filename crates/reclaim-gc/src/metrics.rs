//! Collection metrics and host accounting hooks.

use std::time::{Duration, Instant};

/// Which collection ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Stop-the-world exhaustive collection.
    Exhaustive = 1,
    /// Partial collection: dense slabs folded back unswept.
    Partial = 2,
    /// Concurrent mark and/or sweep on the background worker.
    Concurrent = 3,
}

/// Statistics from the most recent collection cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcMetrics {
    /// Wall time from collection entry to the cycle reaching Idle (for
    /// concurrent cycles this spans mutator execution).
    pub duration: Duration,
    /// Duration of the reset-marks phase.
    pub reset_duration: Duration,
    /// Duration of root scanning plus marking.
    pub mark_duration: Duration,
    /// Duration of the sweep phase (foreground portion).
    pub sweep_duration: Duration,
    /// Bytes returned to the free structures.
    pub bytes_reclaimed: usize,
    /// Bytes still allocated after the cycle.
    pub bytes_surviving: usize,
    /// Objects reclaimed (including disposed finalizable objects).
    pub objects_reclaimed: usize,
    /// Objects the mark phase visited.
    pub objects_marked: usize,
    /// Dirty cards rescanned before sweep (concurrent mode).
    pub cards_rescanned: usize,
    /// Which collection ran.
    pub kind: CollectionKind,
    /// Collections completed by this collector so far.
    pub total_collections: usize,
}

/// Times the phases of one cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseTimer {
    pub reset: Duration,
    pub mark: Duration,
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    pub const fn new() -> Self {
        Self {
            reset: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    pub fn end_reset(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.reset += start.elapsed();
        }
    }

    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep += start.elapsed();
        }
    }
}

/// Instance-owned metrics store.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    last: Option<GcMetrics>,
    total_collections: usize,
}

impl MetricsRecorder {
    pub fn record(&mut self, mut metrics: GcMetrics) {
        self.total_collections += 1;
        metrics.total_collections = self.total_collections;
        self.last = Some(metrics);
    }

    pub fn last(&self) -> Option<GcMetrics> {
        self.last
    }
}

/// Page-level memory events delivered to the host accounting callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    /// Pages were reserved from the page source.
    Allocate {
        /// Bytes reserved.
        bytes: usize,
    },
    /// Pages were released back to the page source.
    Free {
        /// Bytes released.
        bytes: usize,
    },
    /// A reservation failed (page source refusal or memory limit).
    Failure {
        /// Bytes the failed request asked for.
        bytes: usize,
    },
}

/// Host callback for memory events. Runs with collection internals in a
/// restricted state: calling back into the collector is rejected, not
/// deadlocked.
pub type MemoryEventCallback = Box<dyn FnMut(MemoryEvent)>;

/// Reserved and live byte counts reported to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes currently reserved from the page source.
    pub reserved_bytes: usize,
    /// Bytes currently allocated to live objects (size-class rounded).
    pub used_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::{GcMetrics, MetricsRecorder};

    #[test]
    fn test_recorder_counts_collections() {
        let mut r = MetricsRecorder::default();
        assert!(r.last().is_none());
        r.record(GcMetrics::default());
        r.record(GcMetrics::default());
        assert_eq!(r.last().unwrap().total_collections, 2);
    }
}
