//! Independent re-trace of the live graph
//!
//! Uses the verifier's own stack and the `VERIFY_GRAY`/`VERIFY_BLACK`
//! header bits, never the color table, and resolves forwarding without
//! rewriting any slot. Each root is traced to completion, depth first,
//! before the next one, so two traces of the same graph visit objects in
//! the same order whatever their addresses.

use crate::class::ObjectLayout;
use crate::heap::Heap;
use crate::metadata::{GcMetadata, TaskStack};
use crate::object::{ObjectRef, Slot, header_class, info};
use crate::scan::{ScanOptions, SlotVisitor, scan_object};
use crate::verify::snapshot::{HeapSnapshot, ObjectRecord, UNSTABLE_INFO};

#[derive(Default)]
struct Edges(Vec<Slot>);

impl SlotVisitor for Edges {
    fn visit_slot(&mut self, slot: Slot) {
        self.0.push(slot);
    }
}

/// Roots of a verifier trace: root cells in order, then finalizable and
/// queued objects by address
pub fn root_objects(heap: &Heap) -> Vec<ObjectRef> {
    let mut roots: Vec<ObjectRef> = heap
        .roots()
        .slots()
        .into_iter()
        .filter_map(|slot| heap.load_ref(slot))
        .map(|obj| heap.resolve(obj))
        .collect();
    let mut extra: Vec<ObjectRef> = heap
        .finalizables()
        .into_iter()
        .chain(heap.finalization_queue())
        .chain(heap.reference_queue())
        .map(|obj| heap.resolve(obj))
        .collect();
    extra.sort_unstable();
    extra.dedup();
    roots.extend(extra);
    roots
}

/// Trace everything reachable from [`root_objects`] and record it
pub fn trace_heap(heap: &Heap, metadata: &GcMetadata) -> HeapSnapshot {
    let options = ScanOptions {
        referent_policy: heap.config().referent_policy,
        class_epoch: None,
    };
    let trace_classes = heap.config().trace_classes;
    let mut snapshot = HeapSnapshot::default();
    let mut stack = TaskStack::new(metadata, &metadata.mark_task_pool);

    for root in root_objects(heap) {
        if !heap.set_info_bits(root, info::VERIFY_GRAY) {
            continue;
        }
        stack.push(root.addr());
        while let Some(addr) = stack.pop() {
            let Some(obj) = ObjectRef::new(addr) else { continue };
            heap.set_info_bits(obj, info::VERIFY_BLACK);

            let mut edges = Edges::default();
            scan_object(heap, obj, &options, &mut edges);
            let targets: Vec<Option<ObjectRef>> = edges
                .0
                .iter()
                .map(|&slot| heap.load_ref(slot).map(|t| heap.resolve(t)))
                .collect();
            let header = heap.header(obj);
            let bits = crate::object::header_info(header);
            snapshot.records.push(ObjectRecord {
                class: header_class(header),
                info: bits & !UNSTABLE_INFO,
                slot_classes: targets
                    .iter()
                    .map(|t| t.map(|t| header_class(heap.header(t))))
                    .collect(),
            });
            snapshot.objects.push(obj);
            snapshot.live_bytes += heap.object_size(obj);
            if bits & info::HASHED != 0 {
                snapshot.hashed += 1;
            }
            if bits & info::HASHED_ATTACHED != 0 {
                snapshot.hashed_attached += 1;
            }

            let mut children = targets;
            if trace_classes {
                if let Some(vt) = heap.vtable_of(obj) {
                    children.push(vt.class_object().map(|c| heap.resolve(c)));
                }
            }
            // Reversed so that the first field is traced first.
            for child in children.into_iter().rev().flatten() {
                if heap.set_info_bits(child, info::VERIFY_GRAY) {
                    stack.push(child.addr());
                }
            }
        }
    }

    for &obj in &snapshot.objects {
        heap.clear_info_bits(obj, info::VERIFY_GRAY | info::VERIFY_BLACK);
    }
    snapshot
}
