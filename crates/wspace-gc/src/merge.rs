//! Free-chunk merging
//!
//! Single-threaded; runs after every sweeper has finished. Free chunks that
//! touch are coalesced into maximal runs and the runs are filed in the
//! space's size-segregated registry.

use crate::chunk::{Chunk, ChunkHandle, ChunkStatus};
use crate::space::Wspace;

fn mergeable(space: &Wspace, base: usize) -> bool {
    space
        .chunks
        .get(&base)
        .is_some_and(|c| c.status().contains(ChunkStatus::FREE.with(ChunkStatus::TO_MERGE)))
}

/// Coalesce the free chunks collected by the sweepers
///
/// Each chunk walks back over mergeable predecessors to the head of its run,
/// then the head absorbs mergeable successors. Absorbed chunks disappear
/// from the space; the head is replaced by one free chunk spanning the run.
/// Returns the resulting free chunks in address order.
pub fn merge_free_chunks(space: &mut Wspace, lists: Vec<Vec<ChunkHandle>>) -> Vec<ChunkHandle> {
    let pending: Vec<ChunkHandle> = lists.into_iter().flatten().collect();
    let mut merged = Vec::new();

    for handle in pending {
        if !mergeable(space, handle.0) {
            // absorbed earlier, or already the head of a merged run
            continue;
        }

        let mut head = handle.0;
        while let Some(prev) = space.chunks.get(&head).and_then(|c| c.adj_prev) {
            let touches = space.chunks.get(&prev.0).is_some_and(|p| p.end() == head);
            if !(touches && mergeable(space, prev.0)) {
                break;
            }
            head = prev.0;
        }

        let Some(first) = space.chunks.remove(&head) else {
            continue;
        };
        space.free_registry.remove(&(first.size(), head));
        let mut size = first.size();
        let mut next = first.adj_next;
        while let Some(n) = next {
            if n.0 != head + size || !mergeable(space, n.0) {
                break;
            }
            let Some(absorbed) = space.chunks.remove(&n.0) else {
                break;
            };
            space.free_registry.remove(&(absorbed.size(), n.0));
            size += absorbed.size();
            next = absorbed.adj_next;
        }

        let mut run = Chunk::new_free(head, size);
        run.adj_prev = first.adj_prev;
        run.adj_next = next;
        if let Some(n) = next.and_then(|n| space.chunks.get_mut(&n.0)) {
            n.adj_prev = Some(ChunkHandle(head));
        }
        space.chunks.insert(head, run);
        space.free_registry.insert((size, head));
        merged.push(ChunkHandle(head));
    }

    merged.sort_unstable();
    tracing::debug!(
        target: "wspace::gc",
        runs = merged.len(),
        free_bytes = space.free_bytes(),
        "free chunks merged"
    );
    merged
}

/// Merge after rebuilding the adjacency chain
///
/// Needed after a forwarding phase carved chunks without setting their
/// `adj_prev`.
pub fn remerge_free_chunks(space: &mut Wspace, lists: Vec<Vec<ChunkHandle>>) -> Vec<ChunkHandle> {
    space.rebuild_adjacency();
    merge_free_chunks(space, lists)
}
