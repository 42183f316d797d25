//! Bump-allocated young generation
//!
//! Nursery objects have no color-table entry; the mature collector marks
//! them through the `NURSERY_MARK` header bit. Promotion copies an object
//! into the mature space and leaves a forwarding header behind.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::object::WORD;

/// Young generation region
pub struct Nursery {
    base: usize,
    words: Box<[AtomicUsize]>,
    top: AtomicUsize,
    forwarding_pending: AtomicBool,
}

impl Nursery {
    /// Create a nursery of `size` bytes at `base`
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            words: (0..size / WORD).map(|_| AtomicUsize::new(0)).collect(),
            top: AtomicUsize::new(base),
            forwarding_pending: AtomicBool::new(false),
        }
    }

    /// First address
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last address
    pub fn end(&self) -> usize {
        self.base + self.words.len() * WORD
    }

    /// Allocation top
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Whether `addr` lies inside the nursery
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Memory word at `addr`
    pub fn word(&self, addr: usize) -> Option<&AtomicUsize> {
        if !self.contains(addr) {
            return None;
        }
        self.words.get((addr - self.base) / WORD)
    }

    /// Reserve `size_words` words; the memory is zero
    pub fn bump(&self, size_words: usize) -> Option<usize> {
        let bytes = size_words * WORD;
        let end = self.end();
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top + bytes <= end).then_some(top + bytes)
            })
            .ok()
    }

    /// Whether objects have been forwarded since the last fallback collection
    pub fn forwarding_pending(&self) -> bool {
        self.forwarding_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_forwarding_pending(&self, pending: bool) {
        self.forwarding_pending.store(pending, Ordering::Release);
    }
}
