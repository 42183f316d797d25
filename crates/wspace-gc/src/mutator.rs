//! Mutator: allocation and the write barrier
//!
//! A [`Mutator`] borrows the heap shared, so any number of them can run
//! next to the collector threads of a concurrent cycle. Each keeps local
//! segments of the remembered-set and dirty-object pools and hands them
//! over on [`Mutator::flush`] or drop.

use crate::class::ObjectLayout;
use crate::color::{Color, ColorTransition};
use crate::error::{GcError, Result};
use crate::heap::Heap;
use crate::metadata::TaskStack;
use crate::object::{ObjectRef, Slot, VTableId};
use crate::roots::RootHandle;

/// Application-thread view of the heap
pub struct Mutator<'h> {
    heap: &'h Heap,
    remset: TaskStack<'h>,
    dirty: TaskStack<'h>,
}

impl<'h> Mutator<'h> {
    /// Create a mutator for `heap`
    pub fn new(heap: &'h Heap) -> Self {
        let md = &heap.metadata;
        Self {
            heap,
            remset: TaskStack::new(md, &md.remset_pool),
            dirty: TaskStack::new(md, &md.dirty_obj_pool),
        }
    }

    /// The heap
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Allocate a plain object, young if the nursery has room
    pub fn alloc(&mut self, class: VTableId) -> Result<ObjectRef> {
        self.alloc_array(class, 0)
    }

    /// Allocate an array of `len` elements (or a plain object for `len` 0)
    pub fn alloc_array(&mut self, class: VTableId, len: usize) -> Result<ObjectRef> {
        match self.heap.try_alloc_young(class, len) {
            Err(GcError::HeapExhausted { .. }) => self.heap.try_alloc_mature(class, len),
            other => other,
        }
    }

    /// Allocate directly in the mature space, from chunks with free slots
    pub fn alloc_mature(&mut self, class: VTableId, len: usize) -> Result<ObjectRef> {
        self.heap.try_alloc_mature(class, len)
    }

    /// Read reference field `index` of `obj`
    pub fn read_ref(&self, obj: ObjectRef, index: usize) -> Result<Option<ObjectRef>> {
        self.heap.read_field(obj, index)
    }

    /// Store `target` into reference field `index` of `obj`
    pub fn write_ref(&mut self, obj: ObjectRef, index: usize, target: Option<ObjectRef>) -> Result<()> {
        let slot = self.heap.field_slot(obj, index)?;
        self.write_slot(obj, slot, target);
        Ok(())
    }

    /// Store `target` into the referent slot of reference object `obj`
    pub fn set_referent(&mut self, obj: ObjectRef, target: Option<ObjectRef>) -> Result<()> {
        self.heap.check_object(obj)?;
        let slot = self
            .heap
            .referent_slot(obj)
            .ok_or(GcError::NotAnObject(obj.addr()))?;
        self.write_slot(obj, slot, target);
        Ok(())
    }

    /// Store into a root cell
    pub fn set_root(&mut self, handle: RootHandle, target: Option<ObjectRef>) {
        self.heap.roots().set(handle, target);
        if let Some(target) = target {
            self.shade(target);
        }
    }

    fn write_slot(&mut self, obj: ObjectRef, slot: Slot, target: Option<ObjectRef>) {
        self.heap.store_ref(slot, target);
        let Some(target) = target else { return };
        if self.heap.is_mature(obj) && self.heap.is_young(target) {
            self.remember(obj);
        }
        self.shade(target);
    }

    /// Record an old-to-young store; the dirty bit keeps each object in the
    /// remembered set once
    fn remember(&mut self, obj: ObjectRef) {
        if self.heap.try_mark(obj, ColorTransition::Dirty) {
            self.remset.push(obj.addr());
        }
    }

    /// Insertion barrier: gray a white target while marking is active
    fn shade(&mut self, target: ObjectRef) {
        if !self.heap.is_marking() {
            return;
        }
        let target = self.heap.resolve(target);
        if self.heap.color_of(target) == Some(Color::White)
            && self.heap.try_mark(target, ColorTransition::Gray)
        {
            self.dirty.push(target.addr());
        }
    }

    /// Hand local barrier buffers to the shared pools
    pub fn flush(&mut self) {
        self.remset.flush();
        self.dirty.flush();
    }
}
