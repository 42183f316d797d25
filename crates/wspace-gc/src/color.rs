//! Color table encoding and the single color-transition primitive
//!
//! Every slot of a chunk owns four bits in a shared table word:
//!
//! ```text
//! bit 0  color A   \ one of these is the allocation color, the other the
//! bit 1  color B   / mark-black color; they swap at every cycle flip
//! bit 2  gray
//! bit 3  dirty     (already in the remembered set)
//! ```
//!
//! Because the allocation and black colors swap at the end of a cycle,
//! the survivors of one cycle carry the allocation color of the next one
//! and the table never has to be rewritten to reset marks.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Color bits per slot
pub const COLORBITS_PER_OBJ: usize = 4;
/// Slots sharing one table word
pub const SLOTS_PER_WORD: usize = usize::BITS as usize / COLORBITS_PER_OBJ;

/// Color A bit
pub const COLOR_A: usize = 0b0001;
/// Color B bit
pub const COLOR_B: usize = 0b0010;
/// Gray bit
pub const COLOR_GRAY: usize = 0b0100;
/// Dirty bit
pub const COLOR_DIRTY: usize = 0b1000;
/// Bits that make a slot allocated (alloc/black/gray)
pub const ALLOCATED_MASK: usize = COLOR_A | COLOR_B | COLOR_GRAY;
const SLOT_MASK: usize = 0b1111;

/// Replicate a 4-bit pattern into every slot position of a word
pub const fn replicate(nibble: usize) -> usize {
    let mut word = 0;
    let mut i = 0;
    while i < SLOTS_PER_WORD {
        word |= (nibble & SLOT_MASK) << (i * COLORBITS_PER_OBJ);
        i += 1;
    }
    word
}

/// Both generational color bits in every slot position
pub const FLIP_COLOR_MASK_IN_TABLE: usize = replicate(COLOR_A | COLOR_B);

/// Colors in effect for one collection cycle
///
/// Owned by the heap, replaced only at [`CycleColors::flip`] between cycles
/// and read-only while collectors run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleColors {
    /// Color given to newly allocated slots
    pub alloc: usize,
    /// Gray bit
    pub gray: usize,
    /// Color of fully scanned slots
    pub black: usize,
    /// `alloc` replicated over a table word
    pub alloc_mask: usize,
    /// `black` replicated over a table word; the sweeper ANDs with it
    pub mark_mask: usize,
}

impl Default for CycleColors {
    fn default() -> Self {
        Self {
            alloc: COLOR_A,
            gray: COLOR_GRAY,
            black: COLOR_B,
            alloc_mask: replicate(COLOR_A),
            mark_mask: replicate(COLOR_B),
        }
    }
}

impl CycleColors {
    /// Swap allocation and mark-black colors and invert both masks
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.alloc, &mut self.black);
        self.alloc_mask = !self.alloc_mask & FLIP_COLOR_MASK_IN_TABLE;
        self.mark_mask = !self.mark_mask & FLIP_COLOR_MASK_IN_TABLE;
    }
}

/// Requested color change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTransition {
    /// white -> gray
    Gray,
    /// gray -> black
    Black,
    /// white or gray -> black, skipping the gray stage
    BlackDirect,
    /// set the dirty bit
    Dirty,
    /// clear gray and black
    Clear,
}

/// Logical color of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not allocated
    Free,
    /// Allocated, not reached this cycle
    White,
    /// Reached, not yet scanned
    Gray,
    /// Scanned
    Black,
}

/// Position of a slot's bits inside the table
#[inline]
pub fn color_position(slot_index: usize) -> (usize, u32) {
    let word = slot_index / SLOTS_PER_WORD;
    let shift = (COLORBITS_PER_OBJ * (slot_index % SLOTS_PER_WORD)) as u32;
    (word, shift)
}

/// Decode the four bits of a slot
pub fn decode(nibble: usize, colors: &CycleColors) -> Color {
    if nibble & colors.black != 0 {
        Color::Black
    } else if nibble & colors.gray != 0 {
        Color::Gray
    } else if nibble & colors.alloc != 0 {
        Color::White
    } else {
        Color::Free
    }
}

/// Read the bits of the slot at `shift` in `word`
#[inline]
pub fn load_nibble(word: &AtomicUsize, shift: u32) -> usize {
    (word.load(Ordering::Acquire) >> shift) & SLOT_MASK
}

fn apply(nibble: usize, transition: ColorTransition, colors: &CycleColors) -> Option<usize> {
    match transition {
        ColorTransition::Gray => {
            if nibble & (colors.gray | colors.black) != 0 {
                None
            } else {
                Some((nibble & !colors.alloc) | colors.gray)
            }
        }
        ColorTransition::Black => {
            if nibble & colors.black != 0 {
                None
            } else {
                Some((nibble & !(colors.alloc | colors.gray)) | colors.black)
            }
        }
        ColorTransition::BlackDirect => {
            if nibble & (colors.black | colors.gray) != 0 {
                None
            } else {
                Some((nibble & !colors.alloc) | colors.black)
            }
        }
        ColorTransition::Dirty => {
            if nibble & COLOR_DIRTY != 0 {
                None
            } else {
                Some(nibble | COLOR_DIRTY)
            }
        }
        ColorTransition::Clear => {
            if nibble & (colors.gray | colors.black) == 0 {
                None
            } else {
                Some(nibble & !(colors.gray | colors.black))
            }
        }
    }
}

/// Atomically apply `transition` to the slot at `shift` in `word`
///
/// Returns true only when this call performed the transition. A false
/// result does not mean the slot lacks the color: another thread may have
/// made the same transition first.
pub fn try_mark(
    word: &AtomicUsize,
    shift: u32,
    transition: ColorTransition,
    colors: &CycleColors,
) -> bool {
    let mut current = word.load(Ordering::Acquire);
    loop {
        let nibble = (current >> shift) & SLOT_MASK;
        let Some(next) = apply(nibble, transition, colors) else {
            return false;
        };
        let new_word = (current & !(SLOT_MASK << shift)) | (next << shift);
        match word.compare_exchange_weak(current, new_word, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Claim a free slot in `word` among the first `valid` positions, giving it `color`
///
/// Returns the position inside the word that was claimed.
pub fn claim_free(word: &AtomicUsize, valid: usize, color: usize) -> Option<usize> {
    let mut current = word.load(Ordering::Acquire);
    loop {
        let pos = (0..valid).find(|&i| {
            (current >> (i * COLORBITS_PER_OBJ)) & ALLOCATED_MASK == 0
        })?;
        let shift = pos * COLORBITS_PER_OBJ;
        let new_word = (current & !(SLOT_MASK << shift)) | (color << shift);
        match word.compare_exchange_weak(current, new_word, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(pos),
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_twice_is_identity() {
        let original = CycleColors::default();
        let mut colors = original;
        colors.flip();
        assert_eq!(colors.alloc, COLOR_B);
        assert_eq!(colors.black, COLOR_A);
        assert_eq!(colors.mark_mask, replicate(COLOR_A));
        assert_eq!(colors.alloc_mask, replicate(COLOR_B));
        colors.flip();
        assert_eq!(colors, original);
    }

    #[test]
    fn test_color_position() {
        assert_eq!(color_position(0), (0, 0));
        assert_eq!(color_position(5), (0, 20));
        assert_eq!(color_position(16), (1, 0));
        assert_eq!(color_position(20), (1, 16));
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let colors = CycleColors::default();
        let word = AtomicUsize::new(colors.alloc << 8);
        assert_eq!(decode(load_nibble(&word, 8), &colors), Color::White);

        assert!(try_mark(&word, 8, ColorTransition::Gray, &colors));
        assert_eq!(decode(load_nibble(&word, 8), &colors), Color::Gray);
        assert!(!try_mark(&word, 8, ColorTransition::Gray, &colors));

        assert!(try_mark(&word, 8, ColorTransition::Black, &colors));
        assert_eq!(decode(load_nibble(&word, 8), &colors), Color::Black);
        assert!(!try_mark(&word, 8, ColorTransition::Gray, &colors));
        assert!(!try_mark(&word, 8, ColorTransition::Black, &colors));
        assert_eq!(decode(load_nibble(&word, 8), &colors), Color::Black);
        // neighbours untouched
        assert_eq!(load_nibble(&word, 4), 0);
        assert_eq!(load_nibble(&word, 12), 0);
    }

    #[test]
    fn test_black_direct_and_clear() {
        let colors = CycleColors::default();
        let word = AtomicUsize::new(colors.alloc);
        assert!(try_mark(&word, 0, ColorTransition::BlackDirect, &colors));
        assert!(!try_mark(&word, 0, ColorTransition::BlackDirect, &colors));
        assert!(try_mark(&word, 0, ColorTransition::Clear, &colors));
        assert_eq!(decode(load_nibble(&word, 0), &colors), Color::Free);
        assert!(!try_mark(&word, 0, ColorTransition::Clear, &colors));
    }

    #[test]
    fn test_dirty_is_orthogonal() {
        let colors = CycleColors::default();
        let word = AtomicUsize::new(colors.alloc);
        assert!(try_mark(&word, 0, ColorTransition::Dirty, &colors));
        assert!(!try_mark(&word, 0, ColorTransition::Dirty, &colors));
        assert!(try_mark(&word, 0, ColorTransition::Gray, &colors));
        assert_eq!(load_nibble(&word, 0), COLOR_GRAY | COLOR_DIRTY);
    }

    #[test]
    fn test_claim_free_skips_allocated() {
        let word = AtomicUsize::new(COLOR_A | (COLOR_B << 4));
        assert_eq!(claim_free(&word, 16, COLOR_A), Some(2));
        assert_eq!(claim_free(&word, 3, COLOR_A), None);
        assert_eq!(load_nibble(&word, 8), COLOR_A);
    }

    #[test]
    fn test_concurrent_gray_has_one_winner() {
        let colors = CycleColors::default();
        let word = AtomicUsize::new(replicate(colors.alloc));
        let wins = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for slot in 0..SLOTS_PER_WORD {
                        let shift = (slot * COLORBITS_PER_OBJ) as u32;
                        if try_mark(&word, shift, ColorTransition::Gray, &colors) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::Relaxed), SLOTS_PER_WORD);
        assert_eq!(word.load(Ordering::Relaxed), replicate(COLOR_GRAY));
    }
}
