//! Heap verifier
//!
//! A diagnostic auditor owned by the collector when verification is
//! enabled. It never changes what the collector does: failures are logged
//! under the `wspace::verify` target and remembered in the session.
//!
//! ## Per cycle
//!
//! ```text
//! verify_before_gc      rootset / write-barrier / allocation checks, snapshot
//! verify_after_marking  everything the verifier reaches is marked
//! verify_after_gc       the same checks again, snapshot, compare
//! ```

pub mod checks;
pub mod snapshot;
pub mod trace;

use crate::config::VerifyOptions;
use crate::heap::Heap;
use crate::metadata::GcMetadata;

pub use snapshot::{HeapSnapshot, Mismatch, ObjectRecord, compare};

/// Verifier state threaded through the collection cycles
pub struct VerificationSession {
    options: VerifyOptions,
    metadata: GcMetadata,
    is_before_gc: bool,
    is_before_fallback_collection: bool,
    is_verification_passed: bool,
    failures: usize,
    before: Option<HeapSnapshot>,
    last_after: Option<HeapSnapshot>,
}

impl VerificationSession {
    /// Session running the checks selected by `options`, tracing with at
    /// most `block_limit` stack blocks of `block_capacity` entries
    pub fn new(options: VerifyOptions, block_capacity: usize, block_limit: usize) -> Self {
        Self {
            options,
            metadata: GcMetadata::new(block_capacity, Some(block_limit)),
            is_before_gc: true,
            is_before_fallback_collection: false,
            is_verification_passed: true,
            failures: 0,
            before: None,
            last_after: None,
        }
    }

    /// Selected checks
    pub fn options(&self) -> VerifyOptions {
        self.options
    }

    /// Whether every check so far has passed
    pub fn passed(&self) -> bool {
        self.is_verification_passed
    }

    /// Number of problems reported so far
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Snapshot taken before the current cycle
    pub fn before_snapshot(&self) -> Option<&HeapSnapshot> {
        self.before.as_ref()
    }

    /// Snapshot taken after the last completed cycle
    pub fn after_snapshot(&self) -> Option<&HeapSnapshot> {
        self.last_after.as_ref()
    }

    fn report(&mut self, check: &str, problems: Vec<String>) {
        if problems.is_empty() {
            return;
        }
        self.is_verification_passed = false;
        self.failures += problems.len();
        for problem in &problems {
            tracing::warn!(target: "wspace::verify", check, "{problem}");
        }
    }

    fn run_checks(&mut self, heap: &Heap, stage: &str) {
        let before_fallback = self.is_before_gc && self.is_before_fallback_collection;
        if self.options.rootset {
            let problems = checks::check_rootset(heap, before_fallback);
            self.report("rootset", problems);
        }
        if self.options.writebarrier {
            let problems = checks::check_write_barrier(heap);
            self.report("writebarrier", problems);
        }
        if self.options.allocation {
            let problems = checks::check_allocation(heap, before_fallback);
            self.report("allocation", problems);
        }
        let problems = checks::check_finalizers(heap);
        self.report("finalizer", problems);
        tracing::debug!(target: "wspace::verify", stage, passed = self.is_verification_passed, "checks done");
    }

    /// Checks and snapshot at the start of a cycle
    pub fn verify_before_gc(&mut self, heap: &Heap, fallback: bool) {
        debug_assert!(self.is_before_gc, "verify_before_gc called twice");
        self.is_before_gc = true;
        self.is_before_fallback_collection = fallback;
        self.run_checks(heap, "before gc");
        if self.options.gc {
            let snapshot = trace::trace_heap(heap, &self.metadata);
            tracing::info!(
                target: "wspace::verify",
                live_objects = snapshot.live_objects(),
                live_bytes = snapshot.live_bytes,
                hashed = snapshot.hashed,
                hashed_attached = snapshot.hashed_attached,
                fallback,
                "before gc"
            );
            self.before = Some(snapshot);
        }
        self.is_before_gc = false;
    }

    /// Once marking and reference processing are done, before sweeping
    pub fn verify_after_marking(&mut self, heap: &Heap) {
        if !self.options.gc {
            return;
        }
        let snapshot = trace::trace_heap(heap, &self.metadata);
        let problems = checks::check_marked(heap, &snapshot.objects);
        self.report("marking", problems);
    }

    /// Drop the before snapshot: the heap was mutated during the cycle, so
    /// it cannot be compared with the after snapshot
    pub fn note_mutation(&mut self) {
        if self.before.take().is_some() {
            tracing::debug!(target: "wspace::verify", "heap mutated during cycle, skipping comparison");
        }
    }

    /// Checks, snapshot and comparison at the end of a cycle
    pub fn verify_after_gc(&mut self, heap: &Heap) {
        debug_assert!(!self.is_before_gc, "verify_after_gc without verify_before_gc");
        self.run_checks(heap, "after gc");
        if self.options.gc {
            let after = trace::trace_heap(heap, &self.metadata);
            tracing::info!(
                target: "wspace::verify",
                live_objects = after.live_objects(),
                live_bytes = after.live_bytes,
                hashed = after.hashed,
                hashed_attached = after.hashed_attached,
                "after gc"
            );
            if let Some(before) = self.before.take() {
                let mismatches = compare(&before, &after);
                let problems = mismatches.iter().map(|m| format!("{m:?}")).collect();
                self.report("compare", problems);
            }
            self.last_after = Some(after);
        }
        self.is_before_gc = true;
        self.is_before_fallback_collection = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassDesc;
    use crate::config::GcConfig;

    #[test]
    fn test_no_op_cycle_passes() {
        let mut heap = Heap::new(GcConfig {
            heap_size: 64 * 1024,
            nursery_size: 4096,
            root_capacity: 16,
            normal_chunk_size: 4096,
            chunk_granule: 1024,
            ..GcConfig::default()
        })
        .unwrap();
        let node = heap
            .register_class(ClassDesc::plain("Node", 2).with_refs(&[1]))
            .unwrap();
        let a = heap.alloc_mature(node, 0).unwrap();
        let b = heap.alloc_mature(node, 0).unwrap();
        heap.store_ref(a.slot(1), Some(b));
        heap.roots().add(Some(a)).unwrap();

        let mut session = VerificationSession::new(VerifyOptions::all(), 8, 64);
        session.verify_before_gc(&heap, false);
        session.verify_after_gc(&heap);
        assert!(session.passed());
        assert_eq!(session.after_snapshot().unwrap().live_objects(), 2);
    }

    #[test]
    fn test_changed_graph_fails_comparison() {
        let mut heap = Heap::new(GcConfig {
            heap_size: 64 * 1024,
            nursery_size: 4096,
            root_capacity: 16,
            normal_chunk_size: 4096,
            chunk_granule: 1024,
            ..GcConfig::default()
        })
        .unwrap();
        let node = heap
            .register_class(ClassDesc::plain("Node", 2).with_refs(&[1]))
            .unwrap();
        let a = heap.alloc_mature(node, 0).unwrap();
        let b = heap.alloc_mature(node, 0).unwrap();
        heap.store_ref(a.slot(1), Some(b));
        heap.roots().add(Some(a)).unwrap();

        let mut session = VerificationSession::new(VerifyOptions::parse("gc").unwrap(), 8, 64);
        session.verify_before_gc(&heap, false);
        heap.store_ref(a.slot(1), None);
        session.verify_after_gc(&heap);
        assert!(!session.passed());
        assert_eq!(session.failures(), 2);
    }
}
