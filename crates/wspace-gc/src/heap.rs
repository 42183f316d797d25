//! Heap: address space, allocation and per-object marking
//!
//! ## Layout
//!
//! ```text
//! ROOT_BASE        root table    root_capacity words
//! nursery_base     nursery       nursery_size bytes (bump allocated)
//! wspace_base      mature space  heap_size bytes, split into chunks
//! ```
//!
//! Memory is simulated with atomic words; addresses are plain `usize` and
//! every access goes through [`Heap::word`]. Address 0 is null.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::chunk::ChunkHandle;
use crate::class::{ClassDesc, ClassTable, ObjectLayout, RefKind, VTable};
use crate::color::{self, Color, ColorTransition, CycleColors};
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::metadata::{GcMetadata, TaskStack};
use crate::nursery::Nursery;
use crate::object::{
    self, ObjectRef, Slot, VTableId, WORD, header_class, header_info, info, info_bits_word,
    make_header,
};
use crate::roots::RootSet;
use crate::space::{self, LARGE_OBJECT_THRESHOLD, Linking, Wspace};

/// Address of the first root cell
pub const ROOT_BASE: usize = 0x1_0000;
const REGION_ALIGN: usize = 0x1000;

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// The managed heap
pub struct Heap {
    config: GcConfig,
    classes: ClassTable,
    roots: RootSet,
    nursery: Nursery,
    pub(crate) wspace: Wspace,
    colors: CycleColors,
    marking: AtomicBool,
    epoch: u32,
    pub(crate) metadata: GcMetadata,
    finalizables: Mutex<Vec<ObjectRef>>,
    finalization_queue: Mutex<Vec<ObjectRef>>,
    reference_queue: Mutex<Vec<ObjectRef>>,
}

impl Heap {
    /// Create a heap; fails on inconsistent configuration
    pub fn new(config: GcConfig) -> Result<Self> {
        config.validate()?;
        let nursery_base = align_up(ROOT_BASE + config.root_capacity * WORD, REGION_ALIGN);
        let wspace_base = align_up(
            nursery_base + config.nursery_size + REGION_ALIGN,
            config.chunk_granule,
        );
        Ok(Self {
            classes: ClassTable::new(),
            roots: RootSet::new(ROOT_BASE, config.root_capacity),
            nursery: Nursery::new(nursery_base, config.nursery_size),
            wspace: Wspace::new(
                wspace_base,
                config.heap_size,
                config.normal_chunk_size,
                config.chunk_granule,
            ),
            colors: CycleColors::default(),
            marking: AtomicBool::new(false),
            epoch: 1,
            metadata: GcMetadata::new(config.task_block_capacity, None),
            finalizables: Mutex::new(Vec::new()),
            finalization_queue: Mutex::new(Vec::new()),
            reference_queue: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Register a class
    pub fn register_class(&mut self, desc: ClassDesc) -> Result<VTableId> {
        self.classes.register(desc)
    }

    /// Class table
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Root cells
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Young generation
    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// Mature space
    pub fn wspace(&self) -> &Wspace {
        &self.wspace
    }

    /// Collector task pools
    pub fn metadata(&self) -> &GcMetadata {
        &self.metadata
    }

    /// Colors of the current cycle
    pub fn colors(&self) -> &CycleColors {
        &self.colors
    }

    /// Cycle counter, also the class-tracing epoch
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Whether a marking phase is in progress
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub(crate) fn set_marking(&self, marking: bool) {
        self.marking.store(marking, Ordering::Release);
    }

    /// Swap allocation and mark colors and advance the epoch
    pub fn flip_colors(&mut self) {
        self.colors.flip();
        self.epoch = self.epoch.wrapping_add(1).max(1);
    }

    // ----- memory -----

    /// Word at `addr` in any region
    pub fn word(&self, addr: usize) -> Option<&AtomicUsize> {
        if self.wspace.contains(addr) {
            self.wspace.chunk_at(addr)?.word(addr)
        } else if self.nursery.contains(addr) {
            self.nursery.word(addr)
        } else {
            self.roots.word(addr)
        }
    }

    /// Whether `addr` is inside any heap region
    pub fn in_bounds(&self, addr: usize) -> bool {
        self.wspace.contains(addr) || self.nursery.contains(addr) || self.roots.contains(addr)
    }

    /// Read a word
    pub fn load(&self, addr: usize) -> Result<usize> {
        self.word(addr)
            .map(|w| w.load(Ordering::Acquire))
            .ok_or(GcError::InvalidAddress(addr))
    }

    /// Write a word
    pub fn store(&self, addr: usize, value: usize) -> Result<()> {
        self.word(addr)
            .map(|w| w.store(value, Ordering::Release))
            .ok_or(GcError::InvalidAddress(addr))
    }

    /// Referent held by `slot`; unreadable slots read as null
    pub fn load_ref(&self, slot: Slot) -> Option<ObjectRef> {
        self.word(slot.addr())
            .and_then(|w| ObjectRef::new(w.load(Ordering::Acquire)))
    }

    pub(crate) fn store_ref(&self, slot: Slot, obj: Option<ObjectRef>) {
        if let Some(w) = self.word(slot.addr()) {
            w.store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
        }
    }

    /// Header word cell of `obj`
    pub fn header_word(&self, obj: ObjectRef) -> Option<&AtomicUsize> {
        self.word(obj.addr())
    }

    /// Header word of `obj`
    pub fn header(&self, obj: ObjectRef) -> usize {
        self.header_word(obj)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Object-info bits of `obj` (of its copy if forwarded)
    pub fn info_bits(&self, obj: ObjectRef) -> u32 {
        header_info(self.header(self.resolve(obj)))
    }

    /// Set header info bits; returns true if any of them was clear.
    /// A forwarding header is left alone and reports false.
    pub(crate) fn set_info_bits(&self, obj: ObjectRef, bits: u32) -> bool {
        let Some(word) = self.header_word(obj) else {
            return false;
        };
        let mask = info_bits_word(bits);
        word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
            (!object::is_forwarded(h) && header_info(h) & bits != bits).then_some(h | mask)
        })
        .is_ok()
    }

    /// Clear header info bits; returns true if any of them was set.
    /// A forwarding header is left alone and reports false.
    pub(crate) fn clear_info_bits(&self, obj: ObjectRef, bits: u32) -> bool {
        let Some(word) = self.header_word(obj) else {
            return false;
        };
        let mask = info_bits_word(bits);
        word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
            (!object::is_forwarded(h) && header_info(h) & bits != 0).then_some(h & !mask)
        })
        .is_ok()
    }

    /// Follow a forwarding header, if any
    pub fn resolve(&self, obj: ObjectRef) -> ObjectRef {
        object::forwarded_to(self.header(obj)).unwrap_or(obj)
    }

    /// Whether `obj` has been forwarded
    pub fn is_forwarded(&self, obj: ObjectRef) -> bool {
        object::is_forwarded(self.header(obj))
    }

    /// Whether `obj` lives in the nursery
    pub fn is_young(&self, obj: ObjectRef) -> bool {
        self.nursery.contains(obj.addr())
    }

    /// Whether `obj` lives in the mature space
    pub fn is_mature(&self, obj: ObjectRef) -> bool {
        self.wspace.contains(obj.addr())
    }

    // ----- colors -----

    /// Color word and bit offset of a mature object
    pub fn get_color_word(&self, obj: ObjectRef) -> Option<(&AtomicUsize, u32)> {
        let (chunk, index) = self.wspace.locate(obj.addr())?;
        chunk.color_word(index)
    }

    /// Apply a color transition; nursery objects use their header mark bit
    ///
    /// Returns true only if this call performed the transition.
    pub fn try_mark(&self, obj: ObjectRef, transition: ColorTransition) -> bool {
        if let Some((word, shift)) = self.get_color_word(obj) {
            return color::try_mark(word, shift, transition, &self.colors);
        }
        if !self.is_young(obj) {
            return false;
        }
        match transition {
            ColorTransition::Gray | ColorTransition::BlackDirect => {
                self.set_info_bits(obj, info::NURSERY_MARK)
            }
            ColorTransition::Clear => self.clear_info_bits(obj, info::NURSERY_MARK),
            ColorTransition::Black | ColorTransition::Dirty => false,
        }
    }

    /// Color of a mature object; nursery objects report `Black` once marked
    pub fn color_of(&self, obj: ObjectRef) -> Option<Color> {
        if let Some((word, shift)) = self.get_color_word(obj) {
            return Some(color::decode(color::load_nibble(word, shift), &self.colors));
        }
        if self.is_young(obj) {
            let marked = self.info_bits(obj) & info::NURSERY_MARK != 0;
            return Some(if marked { Color::Black } else { Color::White });
        }
        None
    }

    /// Whether `obj` has been reached in the current cycle
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        matches!(self.color_of(obj), Some(Color::Gray | Color::Black))
    }

    /// Whether the dirty bit of a mature object is set
    pub fn is_dirty(&self, obj: ObjectRef) -> bool {
        self.get_color_word(obj)
            .is_some_and(|(w, shift)| color::load_nibble(w, shift) & color::COLOR_DIRTY != 0)
    }

    // ----- allocation -----

    fn alloc_color(&self) -> usize {
        if self.is_marking() {
            self.colors.black
        } else {
            self.colors.alloc
        }
    }

    fn checked_size(&self, class: VTableId, len: usize) -> Result<(&VTable, usize)> {
        let vt = self.classes.lookup(class)?;
        Ok((vt, vt.size_words(len)))
    }

    fn init_object(&self, addr: usize, vt: &VTable, len: usize, extra_info: u32) -> Result<ObjectRef> {
        let obj = ObjectRef::new(addr).ok_or(GcError::InvalidAddress(addr))?;
        if vt.is_array() {
            self.store(obj.word_addr(1), len)?;
        }
        self.store(addr, make_header(vt.id(), extra_info))?;
        if vt.is_finalizable() {
            self.finalizables.lock().push(obj);
        }
        Ok(obj)
    }

    /// Size class for an object of `bytes`, or `None` if it needs a super
    /// chunk. A class must fit at least once in a normal chunk.
    fn slot_size_for(&self, bytes: usize) -> Option<usize> {
        space::size_class_for(bytes).filter(|&sc| sc <= self.wspace.normal_chunk_size())
    }

    /// Allocate in the mature space, carving chunks as needed
    pub fn alloc_mature(&mut self, class: VTableId, len: usize) -> Result<ObjectRef> {
        self.alloc_mature_linked(class, len, Linking::Linked)
    }

    fn alloc_mature_linked(&mut self, class: VTableId, len: usize, linking: Linking) -> Result<ObjectRef> {
        let (_, words) = self.checked_size(class, len)?;
        let bytes = words * WORD;
        let color = self.alloc_color();
        let addr = match self.slot_size_for(bytes) {
            Some(slot_size) => match self.wspace.alloc_slot(slot_size, color) {
                Some(addr) => addr,
                None => {
                    self.wspace
                        .alloc_normal_chunk(slot_size, linking)
                        .ok_or(GcError::HeapExhausted { requested: bytes })?;
                    self.wspace
                        .alloc_slot(slot_size, color)
                        .ok_or(GcError::HeapExhausted { requested: bytes })?
                }
            },
            None => {
                let handle = self
                    .wspace
                    .alloc_super_chunk(bytes, linking)
                    .ok_or(GcError::HeapExhausted { requested: bytes })?;
                self.wspace
                    .claim_super(handle, color)
                    .ok_or(GcError::HeapExhausted { requested: bytes })?
            }
        };
        let vt = self.classes.lookup(class)?;
        self.init_object(addr, vt, len, 0)
    }

    /// Allocate in the mature space from chunks that already have free slots
    pub fn try_alloc_mature(&self, class: VTableId, len: usize) -> Result<ObjectRef> {
        let (vt, words) = self.checked_size(class, len)?;
        let bytes = words * WORD;
        let slot_size = self.slot_size_for(bytes).ok_or(GcError::ObjectTooLarge {
            size: bytes,
            slot_size: LARGE_OBJECT_THRESHOLD.min(self.wspace.normal_chunk_size()),
        })?;
        let addr = self
            .wspace
            .alloc_slot(slot_size, self.alloc_color())
            .ok_or(GcError::HeapExhausted { requested: bytes })?;
        self.init_object(addr, vt, len, 0)
    }

    /// Bump-allocate in the nursery; objects allocated while marking are
    /// born marked
    pub fn try_alloc_young(&self, class: VTableId, len: usize) -> Result<ObjectRef> {
        let (vt, words) = self.checked_size(class, len)?;
        let addr = self.nursery.bump(words).ok_or(GcError::HeapExhausted {
            requested: words * WORD,
        })?;
        let mark = if self.is_marking() { info::NURSERY_MARK } else { 0 };
        self.init_object(addr, vt, len, mark)
    }

    /// Allocate in the nursery, carving mature chunks if it is full
    pub fn alloc(&mut self, class: VTableId, len: usize) -> Result<ObjectRef> {
        match self.try_alloc_young(class, len) {
            Err(GcError::HeapExhausted { .. }) => self.alloc_mature(class, len),
            other => other,
        }
    }

    /// Copy a nursery object into the mature space and leave a forwarding
    /// header behind. The copy carries the minor collector's mark bit, as
    /// an interrupted minor collection would leave it.
    pub fn promote(&mut self, obj: ObjectRef) -> Result<ObjectRef> {
        if !self.is_young(obj) {
            return Err(GcError::NotAnObject(obj.addr()));
        }
        if let Some(to) = object::forwarded_to(self.header(obj)) {
            return Ok(to);
        }
        let header = self.header(obj);
        let class = header_class(header);
        let vt = self.classes.lookup(class)?;
        let len = if vt.is_array() { self.load(obj.word_addr(1))? } else { 0 };
        let words = vt.size_words(len);
        let finalizable = vt.is_finalizable();

        let copy = self.alloc_mature_linked(class, len, Linking::Deferred)?;
        if finalizable {
            // alloc registered the copy; the original registration is resolved later
            self.finalizables.lock().retain(|&o| o != copy);
        }
        for i in 1..words {
            self.store(copy.word_addr(i), self.load(obj.word_addr(i))?)?;
        }
        let mut info_bits = header_info(header) & !(info::NURSERY_MARK | info::VERIFY_GRAY | info::VERIFY_BLACK);
        if info_bits & info::HASHED != 0 {
            info_bits |= info::HASHED_ATTACHED;
        }
        self.store(copy.addr(), make_header(class, info_bits | info::MINOR_MARK))?;
        self.store(obj.addr(), object::forwarding_header(copy))?;
        self.nursery.set_forwarding_pending(true);

        if self.holds_young_refs(copy) {
            self.remember(copy);
        }
        Ok(copy)
    }

    /// Add a mature object to the remembered set unless its dirty bit is set
    pub fn remember(&self, obj: ObjectRef) -> bool {
        if !self.try_mark(obj, ColorTransition::Dirty) {
            return false;
        }
        let mut stack = TaskStack::new(&self.metadata, &self.metadata.remset_pool);
        stack.push(obj.addr());
        true
    }

    /// Identity hash of `obj`, assigned on first request
    pub fn identity_hash(&self, obj: ObjectRef) -> Result<u32> {
        let obj = self.resolve(obj);
        let word = self.header_word(obj).ok_or(GcError::InvalidAddress(obj.addr()))?;
        let fresh = ((obj.addr() >> 3) as u32) & info::HASH_MASK;
        let mut current = word.load(Ordering::Acquire);
        loop {
            let bits = header_info(current);
            if bits & info::HASHED != 0 {
                return Ok((bits >> info::HASH_SHIFT) & info::HASH_MASK);
            }
            let next = current | info_bits_word(info::HASHED | (fresh << info::HASH_SHIFT));
            match word.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(fresh),
                Err(actual) => current = actual,
            }
        }
    }

    // ----- object access -----

    /// Validate that `obj` starts an initialized object
    pub fn check_object(&self, obj: ObjectRef) -> Result<&VTable> {
        if !self.in_bounds(obj.addr()) || self.roots.contains(obj.addr()) {
            return Err(GcError::InvalidAddress(obj.addr()));
        }
        if self.is_mature(obj) && self.wspace.locate(obj.addr()).is_none() {
            return Err(GcError::NotAnObject(obj.addr()));
        }
        self.vtable_of(obj).ok_or(GcError::NotAnObject(obj.addr()))
    }

    /// Slot of reference field `index`
    pub fn field_slot(&self, obj: ObjectRef, index: usize) -> Result<Slot> {
        self.check_object(obj)?;
        self.ref_field_at(obj, index).ok_or(GcError::InvalidField {
            index,
            count: self.ref_field_count(obj),
        })
    }

    /// Read reference field `index`
    pub fn read_field(&self, obj: ObjectRef, index: usize) -> Result<Option<ObjectRef>> {
        let slot = self.field_slot(obj, index)?;
        Ok(self.load_ref(slot))
    }

    /// Referent of a reference object
    pub fn referent(&self, obj: ObjectRef) -> Result<Option<ObjectRef>> {
        self.check_object(obj)?;
        let slot = self.referent_slot(obj).ok_or(GcError::NotAnObject(obj.addr()))?;
        Ok(self.load_ref(slot))
    }

    // ----- finalization and reference queues -----

    /// Objects registered for finalization that have not been queued
    pub fn finalizables(&self) -> Vec<ObjectRef> {
        self.finalizables.lock().clone()
    }

    pub(crate) fn finalizable_registry(&self) -> &Mutex<Vec<ObjectRef>> {
        &self.finalizables
    }

    /// Objects waiting for their finalizer to run
    pub fn finalization_queue(&self) -> Vec<ObjectRef> {
        self.finalization_queue.lock().clone()
    }

    pub(crate) fn enqueue_finalization(&self, objs: impl IntoIterator<Item = ObjectRef>) {
        self.finalization_queue.lock().extend(objs);
    }

    /// Take every object waiting for finalization
    pub fn take_finalization_queue(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.finalization_queue.lock())
    }

    /// Reference objects whose referent was cleared
    pub fn reference_queue(&self) -> Vec<ObjectRef> {
        self.reference_queue.lock().clone()
    }

    pub(crate) fn enqueue_references(&self, refs: impl IntoIterator<Item = ObjectRef>) {
        self.reference_queue.lock().extend(refs);
    }

    /// Take every cleared reference object
    pub fn take_reference_queue(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.reference_queue.lock())
    }

    // ----- cycle bookkeeping -----

    /// Objects in the nursery below the allocation top, in address order
    pub fn nursery_objects(&self) -> Vec<ObjectRef> {
        let mut objects = Vec::new();
        let mut addr = self.nursery.base();
        let top = self.nursery.top();
        while addr < top {
            let Some(obj) = ObjectRef::new(addr) else { break };
            if self.header(obj) == 0 {
                break;
            }
            let size = self.object_size(obj);
            if size == 0 {
                break;
            }
            objects.push(obj);
            addr += size;
        }
        objects
    }

    /// Clear the nursery mark bits set by the last marking phase
    pub fn clear_nursery_marks(&self) {
        for obj in self.nursery_objects() {
            if !self.is_forwarded(obj) {
                self.clear_info_bits(obj, info::NURSERY_MARK);
            }
        }
    }

    /// Drop remembered-set entries whose object died or no longer holds
    /// nursery references, and restore the dirty bit of the rest
    pub fn retain_remembered_set(&self) -> usize {
        let entries = self.metadata.remset_pool.drain_entries();
        let mut seen = FxHashSet::default();
        let mut stack = TaskStack::new(&self.metadata, &self.metadata.remset_pool);
        for obj in entries.into_iter().filter_map(ObjectRef::new) {
            if !seen.insert(obj) {
                continue;
            }
            let Some((chunk, index)) = self.wspace.locate(obj.addr()) else {
                continue;
            };
            if !chunk.is_slot_allocated(index) {
                continue;
            }
            if self.holds_young_refs(obj) {
                self.try_mark(obj, ColorTransition::Dirty);
                stack.push(obj.addr());
            }
        }
        drop(stack);
        self.metadata.remset_pool.entries().len()
    }

    /// Whether a reference field of `obj` points into the nursery
    pub(crate) fn holds_young_refs(&self, obj: ObjectRef) -> bool {
        (0..self.ref_field_count(obj))
            .filter_map(|i| self.ref_field_at(obj, i))
            .filter_map(|slot| self.load_ref(slot))
            .any(|target| self.is_young(target))
    }

    /// Handle of the chunk containing `obj`
    pub fn chunk_of(&self, obj: ObjectRef) -> Option<ChunkHandle> {
        self.wspace.chunk_at(obj.addr()).map(|c| c.handle())
    }

    /// Reference kind of `obj`
    pub fn ref_kind(&self, obj: ObjectRef) -> RefKind {
        self.special_reference_kind(obj)
    }
}

impl ObjectLayout for Heap {
    fn vtable_of(&self, obj: ObjectRef) -> Option<&VTable> {
        let mut header = self.header(obj);
        if let Some(to) = object::forwarded_to(header) {
            header = self.header(to);
        }
        self.classes.get(header_class(header))
    }

    fn array_length(&self, obj: ObjectRef) -> usize {
        self.word(obj.word_addr(1))
            .map_or(0, |w| w.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> GcConfig {
        GcConfig {
            heap_size: 64 * 1024,
            nursery_size: 4096,
            root_capacity: 64,
            normal_chunk_size: 1024,
            chunk_granule: 1024,
            collector_threads: 2,
            ..GcConfig::default()
        }
    }

    #[test]
    fn test_regions_are_disjoint() {
        let heap = Heap::new(small_config()).unwrap();
        assert!(heap.roots().end() <= heap.nursery().base());
        assert!(heap.nursery().end() < heap.wspace().base());
        assert!(heap.load(0).is_err());
    }

    #[test]
    fn test_alloc_mature_and_fields() {
        let mut heap = Heap::new(small_config()).unwrap();
        let node = heap
            .register_class(ClassDesc::plain("Node", 3).with_refs(&[1, 2]))
            .unwrap();
        let a = heap.alloc_mature(node, 0).unwrap();
        let b = heap.alloc_mature(node, 0).unwrap();
        assert!(heap.is_mature(a));
        assert_eq!(b.addr() - a.addr(), 32);
        assert_eq!(heap.color_of(a), Some(Color::White));
        heap.store_ref(heap.field_slot(a, 1).unwrap(), Some(b));
        assert_eq!(heap.read_field(a, 1).unwrap(), Some(b));
        assert!(matches!(
            heap.read_field(a, 2),
            Err(GcError::InvalidField { index: 2, count: 2 })
        ));
        assert_eq!(heap.object_size(a), 24);
    }

    #[test]
    fn test_large_object_gets_super_chunk() {
        let mut heap = Heap::new(small_config()).unwrap();
        let arr = heap.register_class(ClassDesc::prim_array("long[]")).unwrap();
        let big = heap.alloc_mature(arr, 400).unwrap();
        let chunk = heap.wspace().chunk_at(big.addr()).unwrap();
        assert!(chunk.is_abnormal());
        assert_eq!(chunk.size(), 4096);
        assert_eq!(heap.array_length(big), 400);
        assert!(matches!(
            heap.try_alloc_mature(arr, 400),
            Err(GcError::ObjectTooLarge { .. })
        ));
    }

    #[test]
    fn test_size_class_larger_than_chunk_gets_super_chunk() {
        let mut heap = Heap::new(small_config()).unwrap();
        let arr = heap.register_class(ClassDesc::ref_array("Object[]")).unwrap();
        let free = heap.wspace().free_bytes();
        // 182 words: size class 2048 does not fit a 1024-byte chunk.
        let obj = heap.alloc_mature(arr, 180).unwrap();
        let chunk = heap.wspace().chunk_at(obj.addr()).unwrap();
        assert!(chunk.is_abnormal());
        assert_eq!(chunk.size(), 2048);
        assert_eq!(heap.wspace().free_bytes(), free - 2048);
        assert!(matches!(
            heap.try_alloc_mature(arr, 180),
            Err(GcError::ObjectTooLarge { slot_size: 1024, .. })
        ));
        // Classes up to the chunk size still use slots.
        let fits = heap.alloc_mature(arr, 100).unwrap();
        let chunk = heap.wspace().chunk_at(fits.addr()).unwrap();
        assert!(!chunk.is_abnormal());
        assert_eq!((chunk.slot_size(), chunk.slot_num()), (1024, 1));
    }

    #[test]
    fn test_mark_bits_never_touch_forwarding_header() {
        let mut heap = Heap::new(small_config()).unwrap();
        let node = heap
            .register_class(ClassDesc::plain("Node", 2).with_refs(&[1]))
            .unwrap();
        let young = heap.try_alloc_young(node, 0).unwrap();
        let copy = heap.promote(young).unwrap();
        let forwarding = object::forwarding_header(copy);

        assert!(!heap.try_mark(young, ColorTransition::Gray));
        assert!(!heap.try_mark(young, ColorTransition::BlackDirect));
        assert!(!heap.set_info_bits(young, info::VERIFY_GRAY));
        assert!(!heap.clear_info_bits(young, info::NURSERY_MARK));
        assert_eq!(heap.header(young), forwarding);
        assert_eq!(heap.resolve(young), copy);
    }

    #[test]
    fn test_black_allocation_while_marking() {
        let mut heap = Heap::new(small_config()).unwrap();
        let leaf = heap.register_class(ClassDesc::plain("Leaf", 2)).unwrap();
        heap.alloc_mature(leaf, 0).unwrap();
        heap.set_marking(true);
        let young = heap.try_alloc_young(leaf, 0).unwrap();
        let old = heap.try_alloc_mature(leaf, 0).unwrap();
        assert_eq!(heap.color_of(old), Some(Color::Black));
        assert!(heap.is_marked(young));
    }

    #[test]
    fn test_promote_leaves_forwarding_header() {
        let mut heap = Heap::new(small_config()).unwrap();
        let node = heap
            .register_class(ClassDesc::plain("Node", 2).with_refs(&[1]))
            .unwrap();
        let child = heap.try_alloc_young(node, 0).unwrap();
        let parent = heap.try_alloc_young(node, 0).unwrap();
        heap.store_ref(parent.slot(1), Some(child));
        let hash = heap.identity_hash(parent).unwrap();

        let copy = heap.promote(parent).unwrap();
        assert!(heap.is_mature(copy));
        assert!(heap.is_forwarded(parent));
        assert_eq!(heap.resolve(parent), copy);
        assert_eq!(heap.read_field(copy, 0).unwrap(), Some(child));
        assert_eq!(heap.identity_hash(copy).unwrap(), hash);
        let bits = heap.info_bits(copy);
        assert_ne!(bits & info::HASHED_ATTACHED, 0);
        assert_ne!(bits & info::MINOR_MARK, 0);
        // copy holds a nursery reference, so it is remembered
        assert!(heap.is_dirty(copy));
        assert_eq!(heap.metadata().remset_pool.entries(), vec![copy.addr()]);
        assert!(heap.nursery().forwarding_pending());
        assert_eq!(heap.promote(parent).unwrap(), copy);
    }

    #[test]
    fn test_nursery_walk() {
        let mut heap = Heap::new(small_config()).unwrap();
        let leaf = heap.register_class(ClassDesc::plain("Leaf", 2)).unwrap();
        let arr = heap.register_class(ClassDesc::ref_array("Leaf[]")).unwrap();
        let a = heap.try_alloc_young(leaf, 0).unwrap();
        let b = heap.try_alloc_young(arr, 3).unwrap();
        let c = heap.try_alloc_young(leaf, 0).unwrap();
        assert_eq!(heap.nursery_objects(), vec![a, b, c]);
        heap.promote(b).unwrap();
        assert_eq!(heap.nursery_objects(), vec![a, b, c]);
    }

    #[test]
    fn test_finalizable_registration() {
        let mut heap = Heap::new(small_config()).unwrap();
        let res = heap
            .register_class(ClassDesc::plain("Resource", 2).finalizable())
            .unwrap();
        let obj = heap.alloc_mature(res, 0).unwrap();
        assert_eq!(heap.finalizables(), vec![obj]);
    }
}
