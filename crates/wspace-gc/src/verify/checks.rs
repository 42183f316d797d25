//! Heap consistency checks
//!
//! Every check returns the problems it found as strings; the session logs
//! them and records the failure.

use rustc_hash::FxHashSet;

use crate::chunk::ChunkStatus;
use crate::class::ObjectLayout;
use crate::heap::Heap;
use crate::object::ObjectRef;

/// Root slots must reference objects inside the heap. A root may point at a
/// forwarded nursery object only before a fallback collection, which is
/// the one that redirects it.
pub fn check_rootset(heap: &Heap, before_fallback: bool) -> Vec<String> {
    let mut problems = Vec::new();
    for slot in heap.roots().slots() {
        let Some(obj) = heap.load_ref(slot) else { continue };
        if !heap.in_bounds(obj.addr()) || heap.roots().contains(obj.addr()) {
            problems.push(format!("root {:#x} points outside the heap: {obj:?}", slot.addr()));
            continue;
        }
        if heap.is_young(obj) && heap.is_forwarded(obj) {
            if !before_fallback {
                problems.push(format!(
                    "root {:#x} still points at forwarded nursery object {obj:?}",
                    slot.addr()
                ));
            }
            continue;
        }
        if let Err(e) = heap.check_object(obj) {
            problems.push(format!("root {:#x}: {e}", slot.addr()));
        }
    }
    problems
}

/// Every mature object holding a nursery reference must be in the
/// remembered set with its dirty bit set
pub fn check_write_barrier(heap: &Heap) -> Vec<String> {
    let remembered: FxHashSet<usize> = heap.metadata().remset_pool.entries().into_iter().collect();
    let mut problems = Vec::new();
    for chunk in heap.wspace().chunks().filter(|c| !c.is_free()) {
        for obj in chunk.objects() {
            if !heap.holds_young_refs(obj) {
                continue;
            }
            if !remembered.contains(&obj.addr()) {
                problems.push(format!("{obj:?} references the nursery but is not remembered"));
            } else if !heap.is_dirty(obj) {
                problems.push(format!("{obj:?} is remembered without its dirty bit"));
            }
        }
    }
    problems
}

/// Chunk bookkeeping: chunks tile the space, adjacency links agree with
/// addresses, allocation counters and bookmarks match the color table, and
/// every allocated slot holds an initialized object
pub fn check_allocation(heap: &Heap, before_fallback: bool) -> Vec<String> {
    let space = heap.wspace();
    let mut problems = Vec::new();
    let mut expected_base = space.base();
    for chunk in space.chunks() {
        if chunk.base() != expected_base {
            problems.push(format!(
                "gap or overlap before chunk {:#x} (expected {expected_base:#x})",
                chunk.base()
            ));
        }
        expected_base = chunk.end();

        match chunk.adj_prev() {
            Some(prev) => {
                if space.chunk(prev).is_none_or(|p| p.end() != chunk.base()) {
                    problems.push(format!("chunk {:#x} has a stale adj_prev {prev:?}", chunk.base()));
                }
            }
            None if chunk.base() != space.base() && !before_fallback => {
                problems.push(format!("chunk {:#x} has no adj_prev", chunk.base()));
            }
            None => {}
        }

        if chunk.is_free() {
            if chunk.status().contains(ChunkStatus::TO_MERGE) {
                problems.push(format!("free chunk {:#x} was never merged", chunk.base()));
            }
            continue;
        }

        let allocated = chunk.allocated_slots().count();
        if allocated != chunk.alloc_num() {
            problems.push(format!(
                "chunk {:#x}: alloc_num {} but {allocated} slots allocated",
                chunk.base(),
                chunk.alloc_num()
            ));
        }
        let bookmark = chunk.first_free_word();
        for word in 0..bookmark.min(chunk.table().len()) {
            let full = (0..chunk.valid_slots_in_word(word))
                .all(|i| chunk.is_slot_allocated(word * crate::color::SLOTS_PER_WORD + i));
            if !full {
                problems.push(format!(
                    "chunk {:#x}: free slot below first_free_word {bookmark}",
                    chunk.base()
                ));
                break;
            }
        }
        for obj in chunk.objects() {
            if let Err(e) = heap.check_object(obj) {
                problems.push(format!("allocated slot {obj:?}: {e}"));
            }
        }
    }
    if expected_base != space.end() {
        problems.push(format!(
            "chunks end at {expected_base:#x}, space ends at {:#x}",
            space.end()
        ));
    }
    problems
}

/// Finalizer bookkeeping: registered objects are finalizable, nothing is
/// registered twice or both registered and queued, and queued objects are
/// still allocated
pub fn check_finalizers(heap: &Heap) -> Vec<String> {
    let mut problems = Vec::new();
    let mut registered = FxHashSet::default();
    for obj in heap.finalizables() {
        let obj = heap.resolve(obj);
        if !registered.insert(obj) {
            problems.push(format!("{obj:?} registered for finalization twice"));
        }
        if !heap.vtable_of(obj).is_some_and(|vt| vt.is_finalizable()) {
            problems.push(format!("{obj:?} registered but its class is not finalizable"));
        }
    }
    for obj in heap.finalization_queue() {
        let obj = heap.resolve(obj);
        if registered.contains(&obj) {
            problems.push(format!("{obj:?} is both registered and queued for finalization"));
        }
        if let Err(e) = heap.check_object(obj) {
            problems.push(format!("queued finalizable {obj:?}: {e}"));
        }
    }
    problems
}

/// After marking, everything the verifier reaches must be marked, and so
/// must every registered or queued finalizable object
pub fn check_marked(heap: &Heap, reachable: &[ObjectRef]) -> Vec<String> {
    let mut problems = Vec::new();
    for &obj in reachable {
        if !heap.is_marked(obj) {
            problems.push(format!("reachable object {obj:?} was not marked"));
        }
    }
    for obj in heap.finalizables().into_iter().chain(heap.finalization_queue()) {
        let obj = heap.resolve(obj);
        if !heap.is_marked(obj) {
            problems.push(format!("finalizable {obj:?} was not marked"));
        }
    }
    problems
}
