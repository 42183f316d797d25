//! Parallel marking
//!
//! ## Design
//!
//! - N collector threads share the mark pool; each owns a local segment
//! - An object is pushed only by the thread whose gray CAS succeeded, so no
//!   object is enqueued twice in one cycle
//! - Threads leave through [`Termination`]: a finished-collector counter
//!   with a decrement-and-retry path for work that shows up late
//! - The regular tracer stacks objects; the fallback marker stacks slots
//!   so that it can redirect forwarded referents before marking

pub mod fallback;
pub mod tracer;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::class::RefKind;
use crate::color::ColorTransition;
use crate::heap::Heap;
use crate::metadata::{Pool, TaskStack};
use crate::object::{ObjectRef, Slot};
use crate::scan::ScanOptions;

/// Marking algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// Gray/black tracing over object tasks
    Concurrent,
    /// Stop-the-world black marking over slot tasks, following forwarding
    Fallback,
}

/// Counters of one marking pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    /// Successful first marks (one per reached object)
    pub marked_objects: usize,
    /// Reference slots visited
    pub scanned_slots: usize,
    /// Slots rewritten to a forwarded copy
    pub redirected_slots: usize,
}

impl std::ops::AddAssign for MarkStats {
    fn add_assign(&mut self, other: Self) {
        self.marked_objects += other.marked_objects;
        self.scanned_slots += other.scanned_slots;
        self.redirected_slots += other.redirected_slots;
    }
}

/// Termination barrier shared by the collectors of one pass
pub struct Termination {
    finished: CachePadded<AtomicUsize>,
    collectors: usize,
    aborted: AtomicBool,
}

impl Termination {
    /// Barrier for `collectors` threads
    pub fn new(collectors: usize) -> Self {
        Self {
            finished: CachePadded::new(AtomicUsize::new(0)),
            collectors,
            aborted: AtomicBool::new(false),
        }
    }

    /// Called by a collector whose local segment and the shared pool are
    /// both empty. Returns true when every collector has finished; returns
    /// false, after withdrawing, if `pool` received work meanwhile.
    /// Always true once the pass is aborted.
    pub fn try_terminate(&self, pool: &Pool) -> bool {
        self.finished.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.is_aborted() {
                return true;
            }
            if !pool.is_empty() {
                self.finished.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            if self.finished.load(Ordering::Acquire) == self.collectors {
                return true;
            }
            backoff.snooze();
        }
    }

    /// Collectors currently waiting in the barrier
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    /// Release every waiting collector; used when one of them panicked
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether the pass was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Per-thread marking state
pub(crate) struct MarkWorker<'h> {
    pub(crate) heap: &'h Heap,
    pub(crate) mode: MarkMode,
    pub(crate) options: ScanOptions,
    pub(crate) stack: TaskStack<'h>,
    soft: TaskStack<'h>,
    weak: TaskStack<'h>,
    phantom: TaskStack<'h>,
    pub(crate) stats: MarkStats,
}

impl<'h> MarkWorker<'h> {
    pub(crate) fn new(heap: &'h Heap, mode: MarkMode) -> Self {
        let md = &heap.metadata;
        let config = heap.config();
        Self {
            heap,
            mode,
            options: ScanOptions {
                referent_policy: config.referent_policy,
                class_epoch: config.trace_classes.then(|| heap.epoch()),
            },
            stack: TaskStack::new(md, &md.mark_task_pool),
            soft: TaskStack::new(md, &md.softref_pool),
            weak: TaskStack::new(md, &md.weakref_pool),
            phantom: TaskStack::new(md, &md.phanref_pool),
            stats: MarkStats::default(),
        }
    }

    /// Gray `obj` and push it if this thread made the transition
    pub(crate) fn gray_and_push(&mut self, obj: ObjectRef) -> bool {
        if self.heap.try_mark(obj, ColorTransition::Gray) {
            self.stats.marked_objects += 1;
            self.stack.push(obj.addr());
            true
        } else {
            false
        }
    }

    /// Record a reference object for reference processing
    pub(crate) fn discover_reference(&mut self, obj: ObjectRef, kind: RefKind) {
        match kind {
            RefKind::Soft => self.soft.push(obj.addr()),
            RefKind::Weak => self.weak.push(obj.addr()),
            RefKind::Phantom => self.phantom.push(obj.addr()),
            RefKind::None => {}
        }
    }

    /// Make `obj` reachable outside the normal trace (finalizer resurrection,
    /// soft retention). Returns true if it was not marked before.
    pub(crate) fn seed_object(&mut self, obj: ObjectRef) -> bool {
        match self.mode {
            MarkMode::Concurrent => self.gray_and_push(obj),
            MarkMode::Fallback => fallback::mark_and_expand(self, obj),
        }
    }

    /// Treat `slot` as an extra strong edge
    pub(crate) fn seed_slot(&mut self, slot: Slot) {
        match self.mode {
            MarkMode::Concurrent => {
                if let Some(obj) = self.heap.load_ref(slot) {
                    self.gray_and_push(obj);
                }
            }
            MarkMode::Fallback => self.stack.push(slot.addr()),
        }
    }

    fn run(&mut self, termination: &Termination) {
        match self.mode {
            MarkMode::Concurrent => tracer::mark_scan_pool(self, termination),
            MarkMode::Fallback => fallback::fallback_mark_scan_pool(self, termination),
        }
    }
}

/// Drain the rootset and mark pools on `threads` collector threads
pub fn run_marking(heap: &Heap, mode: MarkMode, threads: usize) -> MarkStats {
    let threads = threads.max(1);
    let termination = Termination::new(threads);
    let result = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let termination = &termination;
                s.spawn(move |_| {
                    let mut worker = MarkWorker::new(heap, mode);
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| worker.run(termination))) {
                        termination.abort();
                        panic::resume_unwind(payload);
                    }
                    worker.stats
                })
            })
            .collect();
        let mut stats = MarkStats::default();
        for handle in handles {
            stats += handle
                .join()
                .unwrap_or_else(|e| panic::resume_unwind(e));
        }
        stats
    });
    let stats = result.unwrap_or_else(|e| panic::resume_unwind(e));
    tracing::debug!(
        target: "wspace::gc",
        ?mode,
        threads,
        marked = stats.marked_objects,
        scanned = stats.scanned_slots,
        redirected = stats.redirected_slots,
        "marking pass done"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{GcMetadata, VectorBlock};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_single_collector_terminates_immediately() {
        let termination = Termination::new(1);
        let pool = Pool::new();
        assert!(termination.try_terminate(&pool));
    }

    #[test]
    fn test_late_work_withdraws_from_barrier() {
        let termination = Termination::new(2);
        let metadata = GcMetadata::new(4, None);
        let pool = &metadata.mark_task_pool;
        let resumed = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                // First collector runs out of work, then gets some back.
                assert!(!termination.try_terminate(pool));
                resumed.store(true, Ordering::Release);
                let block = pool.get_entry().unwrap();
                assert_eq!(block.iter().collect::<Vec<_>>(), vec![42]);
                assert!(termination.try_terminate(pool));
            });
            s.spawn(|| {
                while termination.finished() == 0 {
                    std::hint::spin_loop();
                }
                let mut block = VectorBlock::new(4);
                block.push(42).unwrap();
                pool.put_entry(block);
                while !resumed.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                while !pool.is_empty() {
                    std::hint::spin_loop();
                }
                assert!(termination.try_terminate(pool));
            });
        });
        assert_eq!(termination.finished(), 2);
    }

    #[test]
    fn test_abort_releases_waiting_collector() {
        let termination = Termination::new(2);
        let pool = Pool::new();
        std::thread::scope(|s| {
            let waiting = s.spawn(|| termination.try_terminate(&pool));
            while termination.finished() == 0 {
                std::hint::spin_loop();
            }
            termination.abort();
            assert!(waiting.join().unwrap());
        });
        assert!(termination.is_aborted());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_collector_panic_reaches_caller() {
        use crate::class::ClassDesc;
        use crate::config::GcConfig;

        let mut heap = Heap::new(GcConfig {
            heap_size: 64 * 1024,
            nursery_size: 4096,
            root_capacity: 16,
            normal_chunk_size: 4096,
            chunk_granule: 1024,
            ..GcConfig::default()
        })
        .unwrap();
        let node = heap.register_class(ClassDesc::plain("Node", 2)).unwrap();
        let young = heap.try_alloc_young(node, 0).unwrap();
        heap.promote(young).unwrap();
        // A stale address in the mark pool trips the tracer's assertion.
        let md = heap.metadata();
        TaskStack::new(md, &md.mark_task_pool).push(young.addr());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_marking(&heap, MarkMode::Concurrent, 3)
        }));
        assert!(result.is_err());
    }
}
