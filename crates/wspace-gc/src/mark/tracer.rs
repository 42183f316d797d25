//! Color-table tracer
//!
//! Per collector: gray the referents of the root slots, then pop objects,
//! gray and push their white children, and blacken them once scanned.

use crate::class::{RefKind, VTable};
use crate::color::ColorTransition;
use crate::mark::{MarkWorker, Termination};
use crate::object::{ObjectRef, Slot};
use crate::scan::{SlotVisitor, scan_object};

struct TraceVisitor<'a, 'h> {
    worker: &'a mut MarkWorker<'h>,
}

impl SlotVisitor for TraceVisitor<'_, '_> {
    fn visit_slot(&mut self, slot: Slot) {
        self.worker.stats.scanned_slots += 1;
        if let Some(child) = self.worker.heap.load_ref(slot) {
            self.worker.gray_and_push(child);
        }
    }

    fn visit_reference(&mut self, obj: ObjectRef, kind: RefKind) {
        self.worker.discover_reference(obj, kind);
    }

    fn visit_class_object(&mut self, _vt: &VTable, obj: ObjectRef) {
        let obj = self.worker.heap.resolve(obj);
        self.worker.gray_and_push(obj);
    }
}

fn drain_rootset(worker: &mut MarkWorker<'_>) {
    let heap = worker.heap;
    while let Some(block) = heap.metadata.rootset_pool.get_entry() {
        for slot in block.iter().map(Slot::new) {
            // Null roots are allowed here.
            if let Some(obj) = heap.load_ref(slot) {
                worker.gray_and_push(obj);
            }
        }
        heap.metadata.recycle(block);
    }
}

fn scan_and_blacken(worker: &mut MarkWorker<'_>, obj: ObjectRef) {
    let heap = worker.heap;
    let options = worker.options;
    debug_assert!(
        !heap.is_forwarded(obj),
        "tracer reached forwarded object {obj:?}"
    );
    scan_object(heap, obj, &options, &mut TraceVisitor { worker });
    heap.try_mark(obj, ColorTransition::Black);
}

/// Trace until the mark pool is empty and every collector agrees
pub(crate) fn mark_scan_pool(worker: &mut MarkWorker<'_>, termination: &Termination) {
    drain_rootset(worker);
    loop {
        while let Some(task) = worker.stack.pop() {
            if let Some(obj) = ObjectRef::new(task) {
                scan_and_blacken(worker, obj);
            }
        }
        if termination.try_terminate(&worker.heap.metadata.mark_task_pool) {
            break;
        }
    }
}
