//! Concurrent collection coordination.
//!
//! Cross-thread handoff is explicit message passing: the foreground thread
//! detaches whole slabs and ships them to the background worker as jobs; the
//! worker ships outcome batches back over a bounded channel that the
//! foreground drains only at safe points. Every slab list keeps a single
//! writer — the thread that currently owns the slab — so no per-list locks
//! exist anywhere in the collector.

use std::collections::HashMap;
use std::io;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::heap::{IndexSnapshot, PoolId};
use crate::mark::{self, MarkStats, MarkWorkList};
use crate::slab::{Slab, SweepMode, SweepState};

/// Capacity of the notice channel; backpressures a worker that outpaces the
/// foreground's safe points.
const NOTICE_CHANNEL_CAP: usize = 64;

/// A slab crossing the thread boundary.
///
/// Only slabs of classes without finalizer slots are enveloped (the
/// coordinator enforces it), so the contained `Box<Slab>` holds no non-Send
/// payload; exclusive ownership transfers with the message.
pub(crate) struct SlabEnvelope(pub Box<Slab>);

// SAFETY: see type docs; ownership handoff is total, the sender retains no
// pointer to the slab until it is merged back.
unsafe impl Send for SlabEnvelope {}

/// A mark work list crossing the thread boundary. Entries reference slab
/// memory that the foreground keeps alive for the whole cycle.
pub(crate) struct WorkEnvelope(pub MarkWorkList);

// SAFETY: see type docs.
unsafe impl Send for WorkEnvelope {}

pub(crate) enum Job {
    /// Drain the work list against the index snapshot, in parallel.
    Mark {
        snapshot: IndexSnapshot,
        list: WorkEnvelope,
        workers: usize,
    },
    /// Sweep detached slabs of one pool.
    Sweep {
        pool: PoolId,
        slabs: Vec<SlabEnvelope>,
    },
    Shutdown,
}

pub(crate) enum Notice {
    MarkDone {
        stats: MarkStats,
    },
    /// One pool's batch is ready to merge: slab, post-sweep state, slots
    /// reclaimed.
    Swept {
        pool: PoolId,
        slabs: Vec<(SlabEnvelope, SweepState, u32)>,
    },
}

/// The background collector thread.
pub(crate) struct BackgroundWorker {
    job_tx: Sender<Job>,
    notice_rx: Receiver<Notice>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn() -> io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (notice_tx, notice_rx) = bounded::<Notice>(NOTICE_CHANNEL_CAP);
        let handle = std::thread::Builder::new()
            .name("reclaim-gc-sweeper".into())
            .spawn(move || worker_loop(&job_rx, &notice_tx))?;
        Ok(Self {
            job_tx,
            notice_rx,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, job: Job) {
        // A send can only fail after the worker exited, which only happens
        // at shutdown; jobs submitted during teardown are intentionally
        // dropped.
        let _ = self.job_tx.send(job);
    }

    /// Non-blocking notice poll (safe-point path).
    pub fn try_notice(&self) -> Option<Notice> {
        self.notice_rx.try_recv().ok()
    }

    /// Blocking notice wait (cycle-completion path).
    pub fn wait_notice(&self) -> Option<Notice> {
        self.notice_rx.recv().ok()
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        let _ = self.job_tx.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(jobs: &Receiver<Job>, notices: &Sender<Notice>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Mark {
                snapshot,
                list,
                workers,
            } => {
                let stats = mark::drain_parallel(&snapshot, list.0, workers);
                if notices.send(Notice::MarkDone { stats }).is_err() {
                    break;
                }
            }
            Job::Sweep { pool, slabs } => {
                let mut out = Vec::with_capacity(slabs.len());
                for SlabEnvelope(mut slab) in slabs {
                    let before = slab.allocated_count();
                    let state = slab.sweep(SweepMode::Eager);
                    let reclaimed = before - slab.allocated_count();
                    out.push((SlabEnvelope(slab), state, reclaimed));
                }
                if notices.send(Notice::Swept { pool, slabs: out }).is_err() {
                    break;
                }
            }
        }
    }
}

/// Per-cycle sweep state: the lists produced by a concurrent or partial
/// sweep that must not touch the live pool lists until the foreground
/// reaches a safe point.
pub(crate) struct SweepCoordinator {
    /// Slabs awaiting dispatch to the worker, per pool.
    queued_sweep: HashMap<PoolId, Vec<SlabEnvelope>>,
    /// Empty slabs produced under the deferred-release policy, merged back
    /// (and possibly released) at the next safe point.
    queued_empty: HashMap<PoolId, Vec<SlabEnvelope>>,
    /// Sweep jobs dispatched but not yet acknowledged.
    outstanding_jobs: usize,
    in_sweep: bool,
    partial: bool,
}

impl SweepCoordinator {
    pub fn new() -> Self {
        Self {
            queued_sweep: HashMap::new(),
            queued_empty: HashMap::new(),
            outstanding_jobs: 0,
            in_sweep: false,
            partial: false,
        }
    }

    /// Open a sweep cycle.
    pub fn begin_sweep(&mut self, partial: bool) {
        debug_assert!(!self.in_sweep);
        self.in_sweep = true;
        self.partial = partial;
    }

    #[allow(dead_code)]
    pub const fn in_partial_collect(&self) -> bool {
        self.partial
    }

    /// Queue a slab whose reclamation was deferred to the background.
    pub fn queue_pending_sweep_block(&mut self, pool: PoolId, slab: Box<Slab>) {
        debug_assert!(slab.kind().sweeps_in_background());
        self.queued_sweep
            .entry(pool)
            .or_default()
            .push(SlabEnvelope(slab));
    }

    /// Queue an empty slab under the deferred-release policy.
    pub fn queue_empty_block(&mut self, pool: PoolId, slab: Box<Slab>) {
        self.queued_empty
            .entry(pool)
            .or_default()
            .push(SlabEnvelope(slab));
    }

    /// Ship queued pending-sweep batches to the worker.
    pub fn dispatch(&mut self, worker: &BackgroundWorker) {
        for (pool, slabs) in self.queued_sweep.drain() {
            self.outstanding_jobs += 1;
            worker.submit(Job::Sweep { pool, slabs });
        }
    }

    /// A `Swept` notice was drained; one job accounted for.
    pub fn note_job_done(&mut self) {
        debug_assert!(self.outstanding_jobs > 0);
        self.outstanding_jobs -= 1;
    }

    /// Take the deferred empty batches for foreground merging.
    pub fn take_empty_batches(&mut self) -> Vec<(PoolId, Vec<SlabEnvelope>)> {
        self.queued_empty.drain().collect()
    }

    /// True once every deferred slab has been merged back.
    pub fn is_quiescent(&self) -> bool {
        self.outstanding_jobs == 0 && self.queued_sweep.is_empty() && self.queued_empty.is_empty()
    }

    /// Close the sweep cycle.
    pub fn end_sweep(&mut self) {
        debug_assert!(self.is_quiescent());
        self.in_sweep = false;
        self.partial = false;
    }
}
