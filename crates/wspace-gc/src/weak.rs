//! Reference processing and finalizer resurrection
//!
//! Runs after strong marking has terminated, in this order:
//!
//! 1. soft references: retained (their referents marked) or, when soft
//!    clearing is on, cleared like weak ones
//! 2. weak references whose referent is unmarked are cleared and enqueued
//! 3. unmarked finalizable objects are resurrected, traced and moved to
//!    the finalization queue
//! 4. soft/weak references discovered while tracing resurrected objects
//! 5. phantom references whose referent is unmarked are cleared and enqueued
//!
//! The reference objects themselves are never cleared by this pass: they
//! were reached, which is how they were discovered.

use crate::class::ObjectLayout;
use crate::heap::Heap;
use crate::mark::{MarkMode, MarkWorker, run_marking};
use crate::metadata::Pool;
use crate::object::{self, ObjectRef, Slot};

/// Outcome of one reference-processing pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefStats {
    /// Soft referents kept alive
    pub retained_soft: usize,
    /// Soft references cleared
    pub cleared_soft: usize,
    /// Weak references cleared
    pub cleared_weak: usize,
    /// Phantom references cleared
    pub cleared_phantom: usize,
    /// Finalizable objects resurrected and queued
    pub resurrected_objects: usize,
    /// Bytes held by resurrected objects
    pub resurrected_bytes: usize,
}

impl RefStats {
    /// References cleared in total
    pub fn cleared(&self) -> usize {
        self.cleared_soft + self.cleared_weak + self.cleared_phantom
    }
}

/// Referent of `slot`, rewriting the slot if the referent was forwarded
fn load_referent(heap: &Heap, slot: Slot) -> Option<ObjectRef> {
    let obj = heap.load_ref(slot)?;
    match object::forwarded_to(heap.header(obj)) {
        Some(to) if heap.is_young(obj) => {
            heap.store_ref(slot, Some(to));
            Some(to)
        }
        _ => Some(obj),
    }
}

/// Clear the referent of every reference in `pool` that was not reached
fn clear_unreached(heap: &Heap, pool: &Pool) -> usize {
    let mut cleared = Vec::new();
    for ref_obj in pool.drain_entries().into_iter().filter_map(ObjectRef::new) {
        let Some(slot) = heap.referent_slot(ref_obj) else {
            continue;
        };
        if let Some(referent) = load_referent(heap, slot) {
            if !heap.is_marked(referent) {
                heap.store_ref(slot, None);
                cleared.push(ref_obj);
            }
        }
    }
    let count = cleared.len();
    heap.enqueue_references(cleared);
    count
}

/// Mark the referents of soft references until no new ones are found
fn retain_soft(heap: &Heap, mode: MarkMode, threads: usize) -> usize {
    let mut retained = 0;
    loop {
        let softs = heap.metadata.softref_pool.drain_entries();
        if softs.is_empty() {
            return retained;
        }
        {
            let mut worker = MarkWorker::new(heap, mode);
            for ref_obj in softs.into_iter().filter_map(ObjectRef::new) {
                let Some(slot) = heap.referent_slot(ref_obj) else {
                    continue;
                };
                if let Some(referent) = load_referent(heap, slot) {
                    if !heap.is_marked(referent) {
                        retained += 1;
                        worker.seed_slot(slot);
                    }
                }
            }
        }
        run_marking(heap, mode, threads);
    }
}

fn process_soft(heap: &Heap, mode: MarkMode, threads: usize, stats: &mut RefStats) {
    if heap.config().clear_soft_references {
        stats.cleared_soft += clear_unreached(heap, &heap.metadata.softref_pool);
    } else {
        stats.retained_soft += retain_soft(heap, mode, threads);
    }
}

/// Mark objects waiting in the finalization and reference queues; they
/// stay alive until the embedder takes them
pub fn mark_queued_objects(heap: &Heap, mode: MarkMode) {
    let mut worker = MarkWorker::new(heap, mode);
    for obj in heap.finalization_queue().into_iter().chain(heap.reference_queue()) {
        worker.seed_object(heap.resolve(obj));
    }
}

/// Move every unmarked finalizable object to the finalization queue,
/// marking everything it reaches. Returns the count and bytes resurrected.
pub fn resurrect_finalizables(heap: &Heap, mode: MarkMode, threads: usize) -> (usize, usize) {
    let registered = std::mem::take(&mut *heap.finalizable_registry().lock());
    let (live, doomed): (Vec<_>, Vec<_>) = registered
        .into_iter()
        .map(|obj| heap.resolve(obj))
        .partition(|&obj| heap.is_marked(obj));

    let mut bytes = 0;
    {
        let mut worker = MarkWorker::new(heap, mode);
        for &obj in &doomed {
            bytes += heap.object_size(obj);
            worker.seed_object(obj);
        }
    }
    if !doomed.is_empty() {
        run_marking(heap, mode, threads);
    }

    heap.finalizable_registry().lock().extend(live);
    let count = doomed.len();
    heap.enqueue_finalization(doomed);
    (count, bytes)
}

/// Process discovered references and finalizable objects after marking
pub fn process_references(heap: &Heap, mode: MarkMode, threads: usize) -> RefStats {
    let mut stats = RefStats::default();
    process_soft(heap, mode, threads, &mut stats);
    stats.cleared_weak += clear_unreached(heap, &heap.metadata.weakref_pool);

    let (count, bytes) = resurrect_finalizables(heap, mode, threads);
    stats.resurrected_objects = count;
    stats.resurrected_bytes = bytes;

    process_soft(heap, mode, threads, &mut stats);
    stats.cleared_weak += clear_unreached(heap, &heap.metadata.weakref_pool);
    stats.cleared_phantom += clear_unreached(heap, &heap.metadata.phanref_pool);

    tracing::debug!(
        target: "wspace::gc",
        retained_soft = stats.retained_soft,
        cleared = stats.cleared(),
        resurrected = stats.resurrected_objects,
        "reference processing done"
    );
    stats
}
