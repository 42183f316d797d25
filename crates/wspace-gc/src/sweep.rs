//! Parallel chunk sweeping
//!
//! Collector threads claim chunks through a shared atomic cursor. Each
//! thread keeps its own tallies and free-chunk list; nothing global is
//! locked while sweeping. The lists are merged afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::chunk::{Chunk, ChunkHandle, ChunkStatus};
use crate::color::{CycleColors, SLOTS_PER_WORD};
use crate::heap::Heap;

/// What sweeping decided for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// No live object; the chunk joins the free list
    Free,
    /// Enough free slots to allocate from
    PartiallyFree,
    /// Too full to bother allocating from
    Used,
}

/// Result of sweeping one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSweep {
    /// Classification
    pub outcome: SweepOutcome,
    /// Live slots
    pub live: usize,
    /// Free slots
    pub free: usize,
    /// Live bytes
    pub live_bytes: usize,
    /// Whether the chunk held objects before this sweep
    pub newly_freed: bool,
}

/// Sweep one chunk
///
/// For a normal chunk every table word is ANDed with the mark mask, so only
/// this cycle's black survives, and live slots are counted per word. An
/// abnormal chunk is live iff its single table word is non-zero.
pub fn sweep_chunk(chunk: &Chunk, colors: &CycleColors, pfc_reuse_ratio: f64) -> ChunkSweep {
    let status = chunk.status();
    if status.contains(ChunkStatus::FREE) {
        chunk.set_status(status.with(ChunkStatus::TO_MERGE));
        return ChunkSweep {
            outcome: SweepOutcome::Free,
            live: 0,
            free: 0,
            live_bytes: 0,
            newly_freed: false,
        };
    }

    if status.contains(ChunkStatus::ABNORMAL) {
        let word = &chunk.table()[0];
        let masked = word.load(Ordering::Acquire) & colors.mark_mask;
        word.store(masked, Ordering::Release);
        if masked == 0 {
            chunk.set_alloc_num(0);
            chunk.set_status(ChunkStatus::FREE.with(ChunkStatus::TO_MERGE));
            return ChunkSweep {
                outcome: SweepOutcome::Free,
                live: 0,
                free: 1,
                live_bytes: 0,
                newly_freed: true,
            };
        }
        chunk.set_alloc_num(1);
        return ChunkSweep {
            outcome: SweepOutcome::Used,
            live: 1,
            free: 0,
            live_bytes: chunk.size(),
            newly_freed: false,
        };
    }

    let mut live = 0;
    let mut first_free_word = None;
    for (i, word) in chunk.table().iter().enumerate() {
        let masked = word.load(Ordering::Acquire) & colors.mark_mask;
        word.store(masked, Ordering::Release);
        let live_here = masked.count_ones() as usize;
        live += live_here;
        if first_free_word.is_none() && live_here < chunk.valid_slots_in_word(i) {
            first_free_word = Some(i);
        }
    }
    let slot_num = chunk.slot_num();
    let free = slot_num - live;
    chunk.set_alloc_num(live);
    chunk.set_first_free_word(first_free_word.unwrap_or(slot_num.div_ceil(SLOTS_PER_WORD)));

    let outcome = if live == 0 {
        chunk.set_status(ChunkStatus::FREE.with(ChunkStatus::TO_MERGE));
        SweepOutcome::Free
    } else if free as f64 / slot_num as f64 > pfc_reuse_ratio {
        chunk.set_status(ChunkStatus::NORMAL);
        SweepOutcome::PartiallyFree
    } else {
        chunk.set_status(ChunkStatus::NORMAL.with(ChunkStatus::USED));
        SweepOutcome::Used
    };
    ChunkSweep {
        outcome,
        live,
        free,
        live_bytes: live * chunk.slot_size(),
        newly_freed: live == 0,
    }
}

/// Per-collector sweep tallies
#[derive(Debug, Default, Clone)]
pub struct SweepTally {
    /// Live objects
    pub live_obj_num: usize,
    /// Live bytes
    pub live_obj_size: usize,
    /// Chunks that held objects and are now free
    pub freed_chunks: usize,
    /// Free chunks, to be merged
    pub free_list: Vec<ChunkHandle>,
    /// Chunks to allocate from next cycle
    pub pfc_list: Vec<ChunkHandle>,
    /// Chunks swept by this collector
    pub swept: usize,
}

/// Sweep every chunk of the mature space on `threads` collector threads
pub fn sweep_space(heap: &Heap, threads: usize) -> Vec<SweepTally> {
    let chunks: Vec<&Chunk> = heap.wspace().chunks().collect();
    let cursor = CachePadded::new(AtomicUsize::new(0));
    let colors = *heap.colors();
    let ratio = heap.config().pfc_reuse_ratio;
    let threads = threads.max(1);

    let result = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let chunks = &chunks;
                let cursor = &cursor;
                s.spawn(move |_| {
                    let mut tally = SweepTally::default();
                    loop {
                        let next = cursor.fetch_add(1, Ordering::AcqRel);
                        let Some(chunk) = chunks.get(next) else {
                            break;
                        };
                        let result = sweep_chunk(chunk, &colors, ratio);
                        tally.swept += 1;
                        tally.live_obj_num += result.live;
                        tally.live_obj_size += result.live_bytes;
                        match result.outcome {
                            SweepOutcome::Free => {
                                tally.free_list.push(chunk.handle());
                                if result.newly_freed {
                                    tally.freed_chunks += 1;
                                }
                            }
                            SweepOutcome::PartiallyFree => tally.pfc_list.push(chunk.handle()),
                            SweepOutcome::Used => {}
                        }
                    }
                    tally
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect::<Vec<_>>()
    });
    result.unwrap_or_else(|e| std::panic::resume_unwind(e))
}
