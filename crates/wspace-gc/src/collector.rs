//! Collection cycle coordinator
//!
//! ```text
//! verify before ─> roots ─> mark ─> remark* ─> references ─> verify marking
//!     ─> sweep ─> pfc ─> merge ─> remembered set ─> flip ─> verify after
//! ```
//!
//! A pending forwarding pass (objects promoted since the last cycle) turns
//! any requested cycle into a fallback collection.

use std::time::{Duration, Instant};

use crate::config::{GcConfig, VERIFY_USAGE, VerifyOptions};
use crate::error::Result;
use crate::heap::Heap;
use crate::mark::{MarkMode, MarkStats, run_marking};
use crate::merge;
use crate::mutator::Mutator;
use crate::object::info;
use crate::sweep::{self, SweepTally};
use crate::verify::VerificationSession;
use crate::weak::{self, RefStats};

/// Kind of collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Regular major collection
    Major,
    /// Stop-the-world completion of an aborted minor or concurrent cycle
    Fallback,
}

impl CollectionKind {
    fn mark_mode(self) -> MarkMode {
        match self {
            CollectionKind::Major => MarkMode::Concurrent,
            CollectionKind::Fallback => MarkMode::Fallback,
        }
    }
}

/// Statistics of one collection
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Collection number, starting at 1
    pub collection: u64,
    /// Kind actually run
    pub kind: CollectionKind,
    /// Live mature objects after sweeping plus marked nursery objects
    pub live_objects: usize,
    /// Bytes held by live objects
    pub live_bytes: usize,
    /// Objects marked
    pub marked_objects: usize,
    /// Reference slots visited while marking
    pub scanned_slots: usize,
    /// Slots redirected to forwarded copies
    pub redirected_slots: usize,
    /// Remark passes run after the first marking pass
    pub remark_passes: usize,
    /// Chunks that held objects and are now free
    pub freed_chunks: usize,
    /// Free chunks after merging
    pub free_chunks: usize,
    /// Free bytes after merging
    pub free_bytes: usize,
    /// Chunks kept for allocation
    pub pfc_chunks: usize,
    /// Finalizable objects resurrected and queued
    pub resurrected_objects: usize,
    /// Bytes of resurrected objects
    pub resurrected_bytes: usize,
    /// References cleared and enqueued
    pub cleared_references: usize,
    /// Remembered-set entries kept
    pub remembered: usize,
    /// Pause time
    pub pause: Duration,
}

/// Counters accumulated over all collections
#[derive(Debug, Default, Clone, Copy)]
pub struct GcTotals {
    /// Collections run
    pub collections: u64,
    /// Fallback collections run
    pub fallback_collections: u64,
    /// Objects marked
    pub marked_objects: usize,
    /// Chunks freed
    pub freed_chunks: usize,
    /// Objects resurrected
    pub resurrected_objects: usize,
    /// References cleared
    pub cleared_references: usize,
    /// Total pause time
    pub pause: Duration,
}

/// The collector: owns the heap and, when enabled, the verifier
pub struct Gc {
    heap: Heap,
    verifier: Option<VerificationSession>,
    totals: GcTotals,
    last: Option<GcStats>,
}

impl Gc {
    /// Create a heap and collector
    ///
    /// A malformed `verify` option string is not an error: the usage text
    /// is logged and the collector runs without verification.
    pub fn new(config: GcConfig) -> Result<Self> {
        let verifier = match config.verify.as_deref() {
            None => None,
            Some(raw) => match VerifyOptions::parse(raw) {
                Ok(options) if options.is_enabled() => Some(VerificationSession::new(
                    options,
                    config.task_block_capacity,
                    config.verifier_block_limit,
                )),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(target: "wspace::verify", error = %e, "{VERIFY_USAGE}");
                    None
                }
            },
        };
        Ok(Self {
            heap: Heap::new(config)?,
            verifier,
            totals: GcTotals::default(),
            last: None,
        })
    }

    /// The heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, for class registration and carving allocation
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// A mutator over the heap
    pub fn mutator(&self) -> Mutator<'_> {
        Mutator::new(&self.heap)
    }

    /// The verification session, if verification is enabled
    pub fn verifier(&self) -> Option<&VerificationSession> {
        self.verifier.as_ref()
    }

    /// Statistics of the last collection
    pub fn last_stats(&self) -> Option<&GcStats> {
        self.last.as_ref()
    }

    /// Accumulated statistics
    pub fn totals(&self) -> GcTotals {
        self.totals
    }

    fn effective_kind(&self, requested: CollectionKind) -> CollectionKind {
        if self.heap.nursery().forwarding_pending() {
            CollectionKind::Fallback
        } else {
            requested
        }
    }

    fn begin(&mut self, kind: CollectionKind) {
        tracing::debug!(
            target: "wspace::gc",
            collection = self.totals.collections + 1,
            ?kind,
            free_bytes = self.heap.wspace().free_bytes(),
            "GC cycle starting"
        );
        if let Some(verifier) = &mut self.verifier {
            verifier.verify_before_gc(&self.heap, kind == CollectionKind::Fallback);
        }
    }

    /// Run a stop-the-world collection
    pub fn collect(&mut self, kind: CollectionKind) -> GcStats {
        let start = Instant::now();
        let kind = self.effective_kind(kind);
        self.begin(kind);
        let threads = self.heap.config().collector_threads;
        self.heap.set_marking(true);
        let mark = initial_mark(&self.heap, kind.mark_mode(), threads);
        self.finish(kind, start, mark, false)
    }

    /// Run a major collection whose first marking pass overlaps `mutator`
    ///
    /// The mutator runs on its own thread next to the collectors; its
    /// barrier buffers are handed over when it returns. The rest of the
    /// cycle is stop-the-world. A pending forwarding pass is first settled
    /// by a stop-the-world fallback collection, since fallback marking
    /// never runs next to a mutator. Returns the statistics of the major
    /// cycle and the mutator's result.
    pub fn collect_concurrent<F, R>(&mut self, mutator: F) -> (GcStats, R)
    where
        F: FnOnce(&mut Mutator<'_>) -> R + Send,
        R: Send,
    {
        if self.heap.nursery().forwarding_pending() {
            self.collect(CollectionKind::Fallback);
        }
        let start = Instant::now();
        let kind = CollectionKind::Major;
        self.begin(kind);
        let threads = self.heap.config().collector_threads;
        let heap = &self.heap;
        heap.set_marking(true);

        let result = crossbeam_utils::thread::scope(|s| {
            let app = s.spawn(move |_| {
                let mut m = Mutator::new(heap);
                let r = mutator(&mut m);
                m.flush();
                r
            });
            let mark = initial_mark(heap, kind.mark_mode(), threads);
            let r = app.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
            (mark, r)
        });
        let (mark, r) = result.unwrap_or_else(|e| std::panic::resume_unwind(e));
        if let Some(verifier) = &mut self.verifier {
            verifier.note_mutation();
        }
        (self.finish(kind, start, mark, true), r)
    }

    fn finish(&mut self, kind: CollectionKind, start: Instant, mut mark: MarkStats, mutated: bool) -> GcStats {
        let threads = self.heap.config().collector_threads;
        let mode = kind.mark_mode();

        let remark_passes = remark(&self.heap, mode, threads, mutated, &mut mark);
        let refs: RefStats = weak::process_references(&self.heap, mode, threads);
        self.heap.set_marking(false);
        if let Some(verifier) = &mut self.verifier {
            verifier.verify_after_marking(&self.heap);
        }

        let (young_objects, young_bytes) = live_nursery(&self.heap);
        let tallies = sweep::sweep_space(&self.heap, threads);
        let mut live_objects = young_objects;
        let mut live_bytes = young_bytes;
        let mut freed_chunks = 0;
        let mut pfc = Vec::new();
        let mut free_lists = Vec::with_capacity(tallies.len());
        for SweepTally {
            live_obj_num,
            live_obj_size,
            freed_chunks: freed,
            free_list,
            pfc_list,
            ..
        } in tallies
        {
            live_objects += live_obj_num;
            live_bytes += live_obj_size;
            freed_chunks += freed;
            pfc.extend(pfc_list);
            free_lists.push(free_list);
        }
        let pfc_chunks = pfc.len();
        self.heap.wspace.install_pfc(pfc);

        let merged = match kind {
            CollectionKind::Major => merge::merge_free_chunks(&mut self.heap.wspace, free_lists),
            CollectionKind::Fallback => {
                let merged = merge::remerge_free_chunks(&mut self.heap.wspace, free_lists);
                self.heap.nursery().set_forwarding_pending(false);
                merged
            }
        };
        let remembered = self.heap.retain_remembered_set();
        self.heap.flip_colors();
        self.heap.clear_nursery_marks();

        if let Some(verifier) = &mut self.verifier {
            verifier.verify_after_gc(&self.heap);
        }

        let pause = start.elapsed();
        self.totals.collections += 1;
        if kind == CollectionKind::Fallback {
            self.totals.fallback_collections += 1;
        }
        self.totals.marked_objects += mark.marked_objects;
        self.totals.freed_chunks += freed_chunks;
        self.totals.resurrected_objects += refs.resurrected_objects;
        self.totals.cleared_references += refs.cleared();
        self.totals.pause += pause;

        let stats = GcStats {
            collection: self.totals.collections,
            kind,
            live_objects,
            live_bytes,
            marked_objects: mark.marked_objects,
            scanned_slots: mark.scanned_slots,
            redirected_slots: mark.redirected_slots,
            remark_passes,
            freed_chunks,
            free_chunks: merged.len(),
            free_bytes: self.heap.wspace().free_bytes(),
            pfc_chunks,
            resurrected_objects: refs.resurrected_objects,
            resurrected_bytes: refs.resurrected_bytes,
            cleared_references: refs.cleared(),
            remembered,
            pause,
        };
        tracing::info!(
            target: "wspace::gc",
            collection = stats.collection,
            kind = ?stats.kind,
            live_objects = stats.live_objects,
            live_bytes = stats.live_bytes,
            freed_chunks = stats.freed_chunks,
            pfc_chunks = stats.pfc_chunks,
            resurrected_objects = stats.resurrected_objects,
            resurrected_bytes = stats.resurrected_bytes,
            pause_us = pause.as_micros() as u64,
            "GC cycle complete"
        );
        self.last = Some(stats.clone());
        stats
    }
}

fn initial_mark(heap: &Heap, mode: MarkMode, threads: usize) -> MarkStats {
    let roots = heap.roots().enumerate(heap.metadata());
    weak::mark_queued_objects(heap, mode);
    tracing::debug!(target: "wspace::gc", roots, ?mode, "roots enumerated");
    run_marking(heap, mode, threads)
}

/// Rescan roots and drain barrier-grayed objects until nothing new shows up
fn remark(heap: &Heap, mode: MarkMode, threads: usize, mutated: bool, stats: &mut MarkStats) -> usize {
    let md = heap.metadata();
    debug_assert!(
        mode == MarkMode::Concurrent || (!mutated && md.dirty_obj_pool.is_empty()),
        "fallback marking ran next to a mutator"
    );
    let mut rescan_roots = mutated;
    let mut passes = 0;
    while rescan_roots || !md.dirty_obj_pool.is_empty() {
        rescan_roots = false;
        md.mark_task_pool.absorb(&md.dirty_obj_pool);
        heap.roots().enumerate(md);
        *stats += run_marking(heap, mode, threads);
        passes += 1;
    }
    passes
}

/// Marked, unforwarded nursery objects and their bytes
fn live_nursery(heap: &Heap) -> (usize, usize) {
    use crate::class::ObjectLayout;
    heap.nursery_objects()
        .into_iter()
        .filter(|&obj| !heap.is_forwarded(obj) && heap.info_bits(obj) & info::NURSERY_MARK != 0)
        .fold((0, 0), |(n, bytes), obj| (n + 1, bytes + heap.object_size(obj)))
}
