//! Fallback marker
//!
//! Runs stop-the-world when a minor or concurrent cycle had to be abandoned.
//! Tasks are reference slots rather than objects: an object address read
//! before an interrupted forwarding pass may be stale, so each popped slot
//! is re-read, redirected to the forwarded copy if there is one, and
//! rewritten in place before the referent is marked. Marking goes straight
//! to black, and the minor collector's stale mark bit is cleared on the way.

use crate::class::{RefKind, VTable};
use crate::color::ColorTransition;
use crate::mark::{MarkWorker, Termination};
use crate::object::{self, ObjectRef, Slot, info};
use crate::scan::{SlotVisitor, scan_object};

struct FallbackVisitor<'a, 'h> {
    worker: &'a mut MarkWorker<'h>,
}

impl SlotVisitor for FallbackVisitor<'_, '_> {
    fn visit_slot(&mut self, slot: Slot) {
        self.worker.stats.scanned_slots += 1;
        if self.worker.heap.load_ref(slot).is_some() {
            self.worker.stack.push(slot.addr());
        }
    }

    fn visit_reference(&mut self, obj: ObjectRef, kind: RefKind) {
        self.worker.discover_reference(obj, kind);
    }

    fn visit_class_object(&mut self, vt: &VTable, obj: ObjectRef) {
        let heap = self.worker.heap;
        let obj = match object::forwarded_to(heap.header(obj)) {
            Some(to) if heap.is_young(obj) => {
                vt.set_class_object(Some(to));
                self.worker.stats.redirected_slots += 1;
                to
            }
            _ => obj,
        };
        mark_and_expand(self.worker, obj);
    }
}

/// Referent of `slot`, redirecting the slot if it points at a forwarded
/// nursery object
pub(crate) fn resolve_slot(worker: &mut MarkWorker<'_>, slot: Slot) -> Option<ObjectRef> {
    let heap = worker.heap;
    let obj = heap.load_ref(slot)?;
    if heap.is_young(obj) {
        if let Some(to) = object::forwarded_to(heap.header(obj)) {
            heap.store_ref(slot, Some(to));
            worker.stats.redirected_slots += 1;
            return Some(to);
        }
    }
    Some(obj)
}

/// Blacken `obj` and push its reference slots; returns false if it was
/// already marked
pub(crate) fn mark_and_expand(worker: &mut MarkWorker<'_>, obj: ObjectRef) -> bool {
    let heap = worker.heap;
    if !heap.try_mark(obj, ColorTransition::BlackDirect) {
        return false;
    }
    worker.stats.marked_objects += 1;
    // Left over from the aborted minor pass; must not survive into the next one.
    heap.clear_info_bits(obj, info::MINOR_MARK);
    let options = worker.options;
    scan_object(heap, obj, &options, &mut FallbackVisitor { worker });
    true
}

/// Mark from the rootset and mark pools until every collector agrees
pub(crate) fn fallback_mark_scan_pool(worker: &mut MarkWorker<'_>, termination: &Termination) {
    let heap = worker.heap;
    while let Some(block) = heap.metadata.rootset_pool.get_entry() {
        for slot in block.iter() {
            debug_assert!(
                heap.load_ref(Slot::new(slot)).is_some(),
                "fallback root slot {slot:#x} is null"
            );
            worker.stack.push(slot);
        }
        heap.metadata.recycle(block);
    }
    loop {
        while let Some(task) = worker.stack.pop() {
            if let Some(obj) = resolve_slot(worker, Slot::new(task)) {
                mark_and_expand(worker, obj);
            }
        }
        if termination.try_terminate(&heap.metadata.mark_task_pool) {
            break;
        }
    }
}
