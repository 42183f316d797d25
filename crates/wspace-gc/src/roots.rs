//! Global root cells
//!
//! The root table is a region of reference words. Enumeration hands the
//! addresses of non-null cells to the collectors through the rootset pool.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{GcError, Result};
use crate::metadata::{GcMetadata, TaskStack};
use crate::object::{ObjectRef, Slot, WORD};

/// Handle of an occupied root cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

impl RootHandle {
    /// Cell index
    pub fn index(self) -> usize {
        self.0
    }
}

/// Root cells and their occupancy
pub struct RootSet {
    base: usize,
    cells: Box<[AtomicUsize]>,
    occupancy: Mutex<Occupancy>,
}

struct Occupancy {
    free: Vec<usize>,
    occupied: Vec<bool>,
}

impl RootSet {
    /// Create `capacity` cells starting at `base`
    pub fn new(base: usize, capacity: usize) -> Self {
        Self {
            base,
            cells: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            occupancy: Mutex::new(Occupancy {
                // Popped from the back, so low cells are handed out first.
                free: (0..capacity).rev().collect(),
                occupied: vec![false; capacity],
            }),
        }
    }

    /// First address of the table
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last cell
    pub fn end(&self) -> usize {
        self.base + self.cells.len() * WORD
    }

    /// Whether `addr` is a root cell
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub(crate) fn word(&self, addr: usize) -> Option<&AtomicUsize> {
        if !self.contains(addr) {
            return None;
        }
        self.cells.get((addr - self.base) / WORD)
    }

    /// Occupy a cell holding `obj`
    pub fn add(&self, obj: Option<ObjectRef>) -> Result<RootHandle> {
        let mut occupancy = self.occupancy.lock();
        let index = occupancy.free.pop().ok_or(GcError::RootTableFull)?;
        occupancy.occupied[index] = true;
        self.cells[index].store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
        Ok(RootHandle(index))
    }

    /// Slot of a root cell
    pub fn slot(&self, handle: RootHandle) -> Slot {
        Slot::new(self.base + handle.0 * WORD)
    }

    /// Current referent of a root
    pub fn get(&self, handle: RootHandle) -> Option<ObjectRef> {
        ObjectRef::new(self.cells[handle.0].load(Ordering::Acquire))
    }

    /// Store into a root cell without any barrier; while marking is active
    /// go through [`crate::Mutator::set_root`] instead
    pub fn set(&self, handle: RootHandle, obj: Option<ObjectRef>) {
        self.cells[handle.0].store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
    }

    /// Release a cell; releasing a free cell does nothing
    pub fn remove(&self, handle: RootHandle) {
        let mut occupancy = self.occupancy.lock();
        if !std::mem::replace(&mut occupancy.occupied[handle.0], false) {
            return;
        }
        self.cells[handle.0].store(0, Ordering::Release);
        occupancy.free.push(handle.0);
    }

    /// Occupied non-null root slots in cell order
    pub fn slots(&self) -> Vec<Slot> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.load(Ordering::Acquire) != 0)
            .map(|(i, _)| Slot::new(self.base + i * WORD))
            .collect()
    }

    /// Push the slot address of every non-null root into the rootset pool
    pub fn enumerate(&self, metadata: &GcMetadata) -> usize {
        let mut stack = TaskStack::new(metadata, &metadata.rootset_pool);
        let slots = self.slots();
        for slot in &slots {
            stack.push(slot.addr());
        }
        slots.len()
    }
}
