//! GC correctness tests
//!
//! These tests drive the engine through its public API: marking, sweeping,
//! merging, fallback redirection, barriers and the verifier.

use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use wspace_gc::chunk::Chunk;
use wspace_gc::color::{COLOR_GRAY, SLOTS_PER_WORD, replicate};
use wspace_gc::merge::merge_free_chunks;
use wspace_gc::space::{Linking, Wspace};
use wspace_gc::sweep::{SweepOutcome, sweep_chunk};
use wspace_gc::{
    ChunkHandle, ChunkStatus, ClassDesc, CollectionKind, Color, ColorTransition, CycleColors, Gc,
    GcConfig, MarkMode, ObjectRef, RefKind, VTableId, VerificationSession, VerifyOptions,
    run_marking,
};

fn config() -> GcConfig {
    GcConfig {
        heap_size: 64 * 1024,
        nursery_size: 8 * 1024,
        root_capacity: 64,
        normal_chunk_size: 1024,
        chunk_granule: 1024,
        collector_threads: 2,
        task_block_capacity: 8,
        ..GcConfig::default()
    }
}

fn gc_with(config: GcConfig) -> (Gc, VTableId) {
    let mut gc = Gc::new(config).unwrap();
    let node = gc
        .heap_mut()
        .register_class(ClassDesc::plain("Node", 2).with_refs(&[1]))
        .unwrap();
    (gc, node)
}

fn link(gc: &Gc, from: ObjectRef, to: Option<ObjectRef>) {
    gc.mutator().write_ref(from, 0, to).unwrap();
}

// ============================================================================
// Marking
// ============================================================================

#[test]
fn test_gray_mark_succeeds_once_per_object() {
    let (mut gc, node) = gc_with(config());
    let objs: Vec<_> = (0..32)
        .map(|_| gc.heap_mut().alloc_mature(node, 0).unwrap())
        .collect();
    let heap = gc.heap();
    let wins = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for &obj in &objs {
                    if heap.try_mark(obj, ColorTransition::Gray) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    assert_eq!(wins.load(Ordering::Relaxed), objs.len());
}

#[test]
fn test_shared_children_enqueued_once() {
    let (mut gc, node) = gc_with(config());
    let pair = gc
        .heap_mut()
        .register_class(ClassDesc::plain("Pair", 3).with_refs(&[1, 2]))
        .unwrap();
    // A lattice where every object is reachable along many paths.
    let layers: Vec<Vec<ObjectRef>> = (0..6)
        .map(|_| {
            (0..8)
                .map(|_| gc.heap_mut().alloc_mature(pair, 0).unwrap())
                .collect()
        })
        .collect();
    let leaf = gc.heap_mut().alloc_mature(node, 0).unwrap();
    {
        let mut m = gc.mutator();
        for window in layers.windows(2) {
            for (i, &obj) in window[0].iter().enumerate() {
                m.write_ref(obj, 0, Some(window[1][i])).unwrap();
                m.write_ref(obj, 1, Some(window[1][(i + 1) % 8])).unwrap();
            }
        }
        for &obj in layers.last().unwrap() {
            m.write_ref(obj, 0, Some(leaf)).unwrap();
        }
    }
    for &obj in &layers[0] {
        gc.heap().roots().add(Some(obj)).unwrap();
    }

    let heap = gc.heap();
    heap.roots().enumerate(heap.metadata());
    let stats = run_marking(heap, MarkMode::Concurrent, 4);
    assert_eq!(stats.marked_objects, 6 * 8 + 1);
    assert!(heap.metadata().mark_task_pool.is_empty());
}

#[test]
fn test_colors_never_regress_within_a_cycle() {
    let (mut gc, node) = gc_with(config());
    let obj = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let heap = gc.heap();
    let rank = |c: Option<Color>| match c {
        Some(Color::White) => 0,
        Some(Color::Gray) => 1,
        Some(Color::Black) => 2,
        other => panic!("unexpected color {other:?}"),
    };

    let mut last = rank(heap.color_of(obj));
    assert_eq!(last, 0);
    for transition in [
        ColorTransition::Gray,
        ColorTransition::Gray,
        ColorTransition::Dirty,
        ColorTransition::Black,
        ColorTransition::Gray,
        ColorTransition::BlackDirect,
        ColorTransition::Black,
    ] {
        heap.try_mark(obj, transition);
        let now = rank(heap.color_of(obj));
        assert!(now >= last, "{transition:?} moved color back");
        last = now;
    }
    assert_eq!(last, 2);
}

#[test]
fn test_color_flip_twice_is_identity() {
    let original = CycleColors::default();
    let mut colors = original;
    colors.flip();
    assert_eq!(colors.alloc, original.black);
    assert_eq!(colors.black, original.alloc);
    assert_eq!(colors.mark_mask, original.alloc_mask);
    colors.flip();
    assert_eq!(colors, original);
}

// ============================================================================
// End-to-end scenario
// ============================================================================

#[test]
fn test_shared_child_scenario() {
    let (mut gc, node) = gc_with(config());
    let objs: Vec<_> = (0..21)
        .map(|_| gc.heap_mut().alloc_mature(node, 0).unwrap())
        .collect();
    let chunk_base = objs[0].addr();
    for (i, obj) in objs.iter().enumerate() {
        assert_eq!(obj.addr(), chunk_base + i * 16);
    }
    for i in [0, 5, 10] {
        link(&gc, objs[i], Some(objs[20]));
        gc.heap().roots().add(Some(objs[i])).unwrap();
    }

    let heap = gc.heap();
    heap.roots().enumerate(heap.metadata());
    let stats = run_marking(heap, MarkMode::Concurrent, 2);
    assert_eq!(stats.marked_objects, 4);
    for (i, &obj) in objs.iter().enumerate() {
        let expected = if [0, 5, 10, 20].contains(&i) {
            Color::Black
        } else {
            Color::White
        };
        assert_eq!(heap.color_of(obj), Some(expected), "slot {i}");
    }

    let chunk = heap.wspace().chunk_at(chunk_base).unwrap();
    assert_eq!(chunk.slot_num(), 64);
    let result = sweep_chunk(chunk, heap.colors(), heap.config().pfc_reuse_ratio);
    assert_eq!(result.live, 4);
    assert_eq!(result.free, 60);
    assert_eq!(result.outcome, SweepOutcome::PartiallyFree);
    assert_eq!(chunk.status(), ChunkStatus::NORMAL);
}

// ============================================================================
// Sweeping and merging
// ============================================================================

proptest! {
    #[test]
    fn prop_sweep_conserves_slots(
        slot_size in prop::sample::select(vec![16usize, 48, 64, 96, 256]),
        words in prop::collection::vec(any::<u64>(), 16),
    ) {
        let colors = CycleColors::default();
        let chunk = Chunk::new_normal(0x10000, 1024, slot_size);
        let n = chunk.slot_num();
        let mut expected_live = 0;
        for (w, cell) in chunk.table().iter().enumerate() {
            let valid = chunk.valid_slots_in_word(w);
            let keep = if valid == SLOTS_PER_WORD { usize::MAX } else { (1usize << (valid * 4)) - 1 };
            let bits = words[w] as usize & keep;
            for s in 0..valid {
                if (bits >> (s * 4)) & colors.black != 0 {
                    expected_live += 1;
                }
            }
            cell.store(bits, Ordering::Relaxed);
        }

        let result = sweep_chunk(&chunk, &colors, 0.1);
        prop_assert_eq!(result.live + result.free, n);
        prop_assert_eq!(result.live, expected_live);
        prop_assert_eq!(chunk.live_slots(&colors), expected_live);
        for cell in chunk.table() {
            prop_assert_eq!(cell.load(Ordering::Relaxed) & !colors.mark_mask, 0);
        }
    }

    #[test]
    fn prop_merge_ignores_input_order(
        order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
        split in 0..3usize,
    ) {
        let colors = CycleColors::default();
        let mut space = Wspace::new(0x100000, 8 * 1024, 1024, 1024);
        let handles: Vec<ChunkHandle> = (0..8)
            .map(|_| space.alloc_normal_chunk(16, Linking::Linked).unwrap())
            .collect();
        // Chunks 1..=6 die; 0 and 7 stay in use.
        let live = space.chunk(handles[0]).unwrap().claim_free_slot(colors.black);
        prop_assert!(live.is_some());
        space.chunk(handles[7]).unwrap().claim_free_slot(colors.black);
        for &h in &handles[1..=6] {
            let outcome = sweep_chunk(space.chunk(h).unwrap(), &colors, 0.1).outcome;
            prop_assert_eq!(outcome, SweepOutcome::Free);
        }

        let permuted: Vec<ChunkHandle> = order.iter().map(|&i| handles[i + 1]).collect();
        let (a, b) = permuted.split_at(split);
        let merged = merge_free_chunks(&mut space, vec![a.to_vec(), b.to_vec()]);
        prop_assert_eq!(merged, vec![handles[1]]);
        prop_assert_eq!(space.free_chunks(), vec![(handles[1].base(), 6 * 1024)]);
        prop_assert_eq!(space.chunk(handles[7]).unwrap().adj_prev(), Some(handles[1]));
    }
}

#[test]
fn test_sweep_tallies_across_threads() {
    let (mut gc, node) = gc_with(config());
    let mut roots = Vec::new();
    for i in 0..(64 * 5) {
        let obj = gc.heap_mut().alloc_mature(node, 0).unwrap();
        if i % 64 == 0 {
            roots.push(gc.heap().roots().add(Some(obj)).unwrap());
        }
    }
    let stats = gc.collect(CollectionKind::Major);
    assert_eq!(stats.live_objects, 5);
    assert_eq!(stats.live_bytes, 5 * 16);
    assert_eq!(stats.pfc_chunks, 5);
    assert_eq!(stats.freed_chunks, 0);

    // Without roots the five chunks and the tail merge into one run.
    for handle in roots {
        gc.heap().roots().remove(handle);
    }
    let stats = gc.collect(CollectionKind::Major);
    let space = gc.heap().wspace();
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.freed_chunks, 5);
    assert_eq!(stats.pfc_chunks, 0);
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free_bytes, space.end() - space.base());
    assert!(space.pfc_chunks(16).is_empty());
}

// ============================================================================
// Fallback marking
// ============================================================================

#[test]
fn test_fallback_redirects_before_marking() {
    let (mut gc, node) = gc_with(config());
    let holder = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let young = gc.heap().try_alloc_young(node, 0).unwrap();
    let leaf = gc.heap().try_alloc_young(node, 0).unwrap();
    link(&gc, holder, Some(young));
    link(&gc, young, Some(leaf));
    let young_root = gc.heap().roots().add(Some(young)).unwrap();
    gc.heap().roots().add(Some(holder)).unwrap();
    let copy = gc.heap_mut().promote(young).unwrap();

    let heap = gc.heap();
    heap.roots().enumerate(heap.metadata());
    let stats = run_marking(heap, MarkMode::Fallback, 2);
    assert_eq!(stats.redirected_slots, 2);
    // holder, copy and leaf
    assert_eq!(stats.marked_objects, 3);
    assert_eq!(heap.roots().get(young_root), Some(copy));
    assert_eq!(heap.read_field(holder, 0).unwrap(), Some(copy));
    assert_eq!(heap.read_field(copy, 0).unwrap(), Some(leaf));
    assert!(heap.metadata().mark_task_pool.is_empty());
}

// ============================================================================
// Full cycles
// ============================================================================

#[test]
fn test_collection_frees_and_merges_dead_chunks() {
    let (mut gc, node) = gc_with(GcConfig {
        verify: Some("all".to_string()),
        ..config()
    });
    let head = gc.heap_mut().alloc_mature(node, 0).unwrap();
    gc.heap().roots().add(Some(head)).unwrap();
    let mut prev = head;
    for _ in 0..9 {
        let next = gc.heap_mut().alloc_mature(node, 0).unwrap();
        link(&gc, prev, Some(next));
        prev = next;
    }
    for _ in 0..(64 * 3) {
        gc.heap_mut().alloc_mature(node, 0).unwrap();
    }
    let free_before = gc.heap().wspace().free_bytes();

    let stats = gc.collect(CollectionKind::Major);
    assert_eq!(stats.live_objects, 10);
    assert_eq!(stats.freed_chunks, 3);
    assert_eq!(stats.free_bytes, free_before + 3 * 1024);
    assert_eq!(stats.free_chunks, 1);
    assert!(gc.verifier().unwrap().passed());

    // Allocation reuses the partially free chunk before carving.
    let carved_before = gc.heap().wspace().chunks().count();
    let fresh = gc.mutator().alloc_mature(node, 0).unwrap();
    assert_eq!(gc.heap().chunk_of(fresh), gc.heap().chunk_of(head));
    assert_eq!(gc.heap().wspace().chunks().count(), carved_before);

    let again = gc.collect(CollectionKind::Major);
    assert_eq!(again.live_objects, 10);
    assert_eq!(again.freed_chunks, 0);
    assert!(gc.verifier().unwrap().passed());
    assert_eq!(gc.totals().collections, 2);
}

#[test]
fn test_fallback_cycle_after_promotion() {
    let (mut gc, node) = gc_with(GcConfig {
        verify: Some("all".to_string()),
        ..config()
    });
    let old = gc.heap_mut().alloc_mature(node, 0).unwrap();
    gc.heap().roots().add(Some(old)).unwrap();
    let young: Vec<_> = (0..5)
        .map(|_| gc.heap().try_alloc_young(node, 0).unwrap())
        .collect();
    for pair in young.windows(2) {
        link(&gc, pair[0], Some(pair[1]));
    }
    link(&gc, old, Some(young[0]));
    let hash = gc.heap().identity_hash(young[0]).unwrap();
    let copies: Vec<_> = young[..3]
        .iter()
        .map(|&y| gc.heap_mut().promote(y).unwrap())
        .collect();

    let stats = gc.collect(CollectionKind::Major);
    assert_eq!(stats.kind, CollectionKind::Fallback);
    // old, three copies and the two young objects left in the nursery
    assert_eq!(stats.live_objects, 6);
    assert_eq!(gc.heap().read_field(old, 0).unwrap(), Some(copies[0]));
    assert_eq!(gc.heap().read_field(copies[0], 0).unwrap(), Some(copies[1]));
    assert_eq!(gc.heap().identity_hash(copies[0]).unwrap(), hash);
    assert_eq!(stats.remembered, 1);
    assert!(gc.verifier().unwrap().passed());
}

#[test]
fn test_weak_and_finalizer_processing() {
    let (mut gc, node) = gc_with(config());
    let weak = gc
        .heap_mut()
        .register_class(ClassDesc::plain("WeakRef", 2).reference(RefKind::Weak, 1))
        .unwrap();
    let resource = gc
        .heap_mut()
        .register_class(ClassDesc::plain("Resource", 2).with_refs(&[1]).finalizable())
        .unwrap();
    let target = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let w = gc.heap_mut().alloc_mature(weak, 0).unwrap();
    let doomed = gc.heap_mut().alloc_mature(resource, 0).unwrap();
    gc.mutator().set_referent(w, Some(target)).unwrap();
    gc.heap().roots().add(Some(w)).unwrap();

    let stats = gc.collect(CollectionKind::Major);
    assert_eq!(stats.cleared_references, 1);
    assert_eq!(stats.resurrected_objects, 1);
    assert_eq!(gc.heap().referent(w).unwrap(), None);
    assert_eq!(gc.heap().take_reference_queue(), vec![w]);
    assert_eq!(gc.heap().finalization_queue(), vec![doomed]);
    assert_eq!(gc.heap().color_of(doomed), Some(Color::White));
    assert_eq!(gc.heap().color_of(target), Some(Color::Free));

    // Queued objects survive until taken; then they are garbage.
    let kept = gc.collect(CollectionKind::Major);
    assert_eq!(kept.live_objects, 2);
    assert_eq!(gc.heap().color_of(doomed), Some(Color::White));
    assert_eq!(gc.heap().take_finalization_queue(), vec![doomed]);
    let last = gc.collect(CollectionKind::Major);
    assert_eq!(last.live_objects, 1);
    assert_eq!(gc.heap().color_of(doomed), Some(Color::Free));
}

#[test]
fn test_class_objects_traced_only_when_enabled() {
    for trace_classes in [false, true] {
        let (mut gc, node) = gc_with(GcConfig {
            trace_classes,
            verify: Some("gc".to_string()),
            ..config()
        });
        let class_obj = gc.heap_mut().alloc_mature(node, 0).unwrap();
        let instance = gc.heap_mut().alloc_mature(node, 0).unwrap();
        gc.heap().classes().get(node).unwrap().set_class_object(Some(class_obj));
        gc.heap().roots().add(Some(instance)).unwrap();

        let stats = gc.collect(CollectionKind::Major);
        let expected = if trace_classes { 2 } else { 1 };
        assert_eq!(stats.live_objects, expected, "trace_classes = {trace_classes}");
        assert!(gc.verifier().unwrap().passed());
        // A second cycle runs under a new epoch and traces the class again.
        let again = gc.collect(CollectionKind::Major);
        assert_eq!(again.live_objects, expected);
    }
}

#[test]
fn test_promoted_class_object_survives_later_cycles() {
    let (mut gc, node) = gc_with(GcConfig {
        trace_classes: true,
        verify: Some("all".to_string()),
        ..config()
    });
    let instance = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let class_obj = gc.heap().try_alloc_young(node, 0).unwrap();
    gc.heap().classes().get(node).unwrap().set_class_object(Some(class_obj));
    gc.heap().roots().add(Some(instance)).unwrap();
    let copy = gc.heap_mut().promote(class_obj).unwrap();

    let first = gc.collect(CollectionKind::Major);
    assert_eq!(first.kind, CollectionKind::Fallback);
    assert_eq!(gc.heap().classes().get(node).unwrap().class_object(), Some(copy));
    assert_eq!(first.live_objects, 2);

    for _ in 0..2 {
        let stats = gc.collect(CollectionKind::Major);
        assert_eq!(stats.kind, CollectionKind::Major);
        assert_eq!(stats.live_objects, 2);
        assert_eq!(gc.heap().color_of(copy), Some(Color::White));
    }
    assert_eq!(gc.heap().resolve(class_obj), copy);
    assert!(gc.verifier().unwrap().passed());
}

#[test]
fn test_concurrent_cycle_after_promotion_runs_fallback_first() {
    let (mut gc, node) = gc_with(GcConfig {
        verify: Some("all".to_string()),
        ..config()
    });
    let holder = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let target = gc.heap_mut().alloc_mature(node, 0).unwrap();
    gc.heap().roots().add(Some(holder)).unwrap();
    let target_root = gc.heap().roots().add(Some(target)).unwrap();
    let young = gc.heap().try_alloc_young(node, 0).unwrap();
    gc.heap().roots().add(Some(young)).unwrap();
    gc.heap_mut().promote(young).unwrap();

    for _ in 0..4 {
        let (stats, ()) = gc.collect_concurrent(|m| {
            m.write_ref(holder, 0, Some(target)).unwrap();
            m.set_root(target_root, None);
        });
        assert_eq!(stats.kind, CollectionKind::Major);
        assert_eq!(gc.heap().color_of(target), Some(Color::White));
        gc.mutator().set_root(target_root, Some(target));
        gc.mutator().write_ref(holder, 0, None).unwrap();
    }
    assert_eq!(gc.totals().fallback_collections, 1);
    assert_eq!(gc.totals().collections, 5);
    assert!(gc.verifier().unwrap().passed());
}

#[test]
fn test_concurrent_mutation_loses_nothing() {
    let (mut gc, node) = gc_with(GcConfig {
        verify: Some("all".to_string()),
        collector_threads: 3,
        ..config()
    });
    let array = gc
        .heap_mut()
        .register_class(ClassDesc::ref_array("Object[]"))
        .unwrap();
    let nodes: Vec<_> = (0..200)
        .map(|_| gc.heap_mut().alloc_mature(node, 0).unwrap())
        .collect();
    for pair in nodes.windows(2) {
        link(&gc, pair[0], Some(pair[1]));
    }
    let holder = gc.heap_mut().alloc_mature(array, 10).unwrap();
    gc.heap().roots().add(Some(holder)).unwrap();
    gc.heap().roots().add(Some(nodes[0])).unwrap();

    let (stats, young) = gc.collect_concurrent(|m| {
        // Cut the chain into segments that only the holder array reaches.
        for i in 0..10 {
            let cut = nodes[i * 20 + 10];
            let rest = m.read_ref(cut, 0).unwrap();
            m.write_ref(holder, i, rest).unwrap();
            m.write_ref(cut, 0, None).unwrap();
        }
        m.alloc(node).unwrap()
    });
    assert!(gc.verifier().unwrap().passed());
    assert!(stats.remark_passes >= 1);
    // Every node and the holder survive; the young object was born marked.
    assert_eq!(stats.live_objects, 200 + 1 + 1);
    assert!(gc.heap().is_young(young));
    for &n in &nodes {
        assert!(gc.heap().wspace().locate(n.addr()).is_some());
    }
}

// ============================================================================
// Verifier
// ============================================================================

#[test]
fn test_verifier_round_trip_on_unchanged_heap() {
    let (mut gc, node) = gc_with(config());
    let a = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let b = gc.heap().try_alloc_young(node, 0).unwrap();
    link(&gc, a, Some(b));
    gc.heap().roots().add(Some(a)).unwrap();

    let mut session = VerificationSession::new(VerifyOptions::all(), 4, 32);
    session.verify_before_gc(gc.heap(), false);
    let before = session.before_snapshot().unwrap().live_objects();
    session.verify_after_gc(gc.heap());
    let after = session.after_snapshot().unwrap().live_objects();
    assert!(session.passed());
    assert_eq!(before, 2);
    assert_eq!(before, after);
}

#[test]
fn test_verifier_flags_write_barrier_bypass() {
    let (mut gc, node) = gc_with(config());
    let old = gc.heap_mut().alloc_mature(node, 0).unwrap();
    let young = gc.heap().try_alloc_young(node, 0).unwrap();
    gc.heap().roots().add(Some(old)).unwrap();
    // A raw store skips the barrier.
    gc.heap().store(old.word_addr(1), young.addr()).unwrap();

    let mut session = VerificationSession::new(VerifyOptions::parse("writebarrier").unwrap(), 4, 32);
    session.verify_before_gc(gc.heap(), false);
    assert!(!session.passed());
    assert_eq!(session.failures(), 1);
}

#[test]
fn test_verify_option_parsing() {
    let options = VerifyOptions::parse(" rootset , allocation").unwrap();
    assert!(options.rootset && options.allocation);
    assert!(!options.gc && !options.writebarrier);
    assert_eq!(VerifyOptions::parse("all").unwrap(), VerifyOptions::all());
    assert!(VerifyOptions::parse("rootset,,gc").is_err());
    assert!(VerifyOptions::parse("everything").is_err());
}

#[test]
fn test_gray_bit_alone_is_not_live_after_sweep() {
    let colors = CycleColors::default();
    let chunk = Chunk::new_normal(0x10000, 256, 16);
    chunk.table()[0].store(replicate(COLOR_GRAY), Ordering::Relaxed);
    let result = sweep_chunk(&chunk, &colors, 0.1);
    assert_eq!(result.outcome, SweepOutcome::Free);
    assert!(chunk.status().contains(ChunkStatus::TO_MERGE));
}
