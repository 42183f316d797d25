//! Class metadata and the object layout query interface

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{GcError, Result};
use crate::object::{ObjectRef, Slot, VTableId};

/// Special reference kind of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Ordinary object
    None,
    /// Cleared under memory pressure
    Soft,
    /// Cleared once the referent is only weakly reachable
    Weak,
    /// Enqueued after the referent has been finalized
    Phantom,
}

/// Instance shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Fixed number of words, references at declared offsets
    Plain,
    /// Length word followed by reference elements
    RefArray,
    /// Length word followed by non-reference elements
    PrimArray,
}

/// Class description passed to [`ClassTable::register`]
#[derive(Debug, Clone)]
pub struct ClassDesc {
    name: String,
    shape: Shape,
    instance_words: usize,
    ref_offsets: Vec<usize>,
    ref_kind: RefKind,
    referent_offset: Option<usize>,
    finalizable: bool,
}

impl ClassDesc {
    /// Plain object of `instance_words` words including the header
    pub fn plain(name: &str, instance_words: usize) -> Self {
        Self {
            name: name.to_string(),
            shape: Shape::Plain,
            instance_words,
            ref_offsets: Vec::new(),
            ref_kind: RefKind::None,
            referent_offset: None,
            finalizable: false,
        }
    }

    /// Array of references
    pub fn ref_array(name: &str) -> Self {
        Self {
            shape: Shape::RefArray,
            instance_words: 2,
            ..Self::plain(name, 2)
        }
    }

    /// Array of word-sized primitives
    pub fn prim_array(name: &str) -> Self {
        Self {
            shape: Shape::PrimArray,
            instance_words: 2,
            ..Self::plain(name, 2)
        }
    }

    /// Declare reference fields at word offsets
    pub fn with_refs(mut self, offsets: &[usize]) -> Self {
        self.ref_offsets.extend_from_slice(offsets);
        self
    }

    /// Make this a soft/weak/phantom reference class with its referent at `offset`
    pub fn reference(mut self, kind: RefKind, offset: usize) -> Self {
        self.ref_kind = kind;
        self.referent_offset = Some(offset);
        self
    }

    /// Instances need finalization
    pub fn finalizable(mut self) -> Self {
        self.finalizable = true;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(GcError::InvalidConfig(msg));
        if self.shape == Shape::Plain {
            if self.instance_words == 0 {
                return invalid(format!("class {} has no header word", self.name));
            }
            let in_body = |off: usize| off >= 1 && off < self.instance_words;
            if let Some(bad) = self.ref_offsets.iter().find(|&&off| !in_body(off)) {
                return invalid(format!("class {}: ref offset {bad} out of range", self.name));
            }
            if let Some(off) = self.referent_offset {
                if !in_body(off) || self.ref_offsets.contains(&off) {
                    return invalid(format!("class {}: bad referent offset {off}", self.name));
                }
            }
        } else if self.ref_kind != RefKind::None || !self.ref_offsets.is_empty() {
            return invalid(format!("array class {} cannot declare fields", self.name));
        }
        Ok(())
    }
}

/// Registered class metadata
#[derive(Debug)]
pub struct VTable {
    id: VTableId,
    name: String,
    shape: Shape,
    instance_words: usize,
    ref_offsets: Box<[usize]>,
    ref_kind: RefKind,
    referent_offset: Option<usize>,
    finalizable: bool,
    class_object: AtomicUsize,
    /// Cycle in which the class object was last traced (`VT_MARKED`)
    mark_epoch: AtomicU32,
}

impl VTable {
    /// Class id
    pub fn id(&self) -> VTableId {
        self.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance shape
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Whether instances are arrays
    pub fn is_array(&self) -> bool {
        self.shape != Shape::Plain
    }

    /// Reference field offsets (plain objects)
    pub fn ref_offsets(&self) -> &[usize] {
        &self.ref_offsets
    }

    /// Special reference kind
    pub fn ref_kind(&self) -> RefKind {
        self.ref_kind
    }

    /// Referent word offset for reference classes
    pub fn referent_offset(&self) -> Option<usize> {
        self.referent_offset
    }

    /// Whether instances are registered for finalization
    pub fn is_finalizable(&self) -> bool {
        self.finalizable
    }

    /// Instance size in words for an array of `len` elements (ignored for plain objects)
    pub fn size_words(&self, len: usize) -> usize {
        match self.shape {
            Shape::Plain => self.instance_words,
            Shape::RefArray | Shape::PrimArray => 2 + len,
        }
    }

    /// Class object attached to this vtable
    pub fn class_object(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.class_object.load(Ordering::Acquire))
    }

    /// Attach a heap object representing the class
    pub fn set_class_object(&self, obj: Option<ObjectRef>) {
        self.class_object
            .store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
    }

    /// Record that the class object was traced in `epoch`; returns false
    /// if it already was. Races only cause a redundant mark attempt.
    pub(crate) fn mark_for_epoch(&self, epoch: u32) -> bool {
        if self.mark_epoch.load(Ordering::Relaxed) == epoch {
            return false;
        }
        self.mark_epoch.store(epoch, Ordering::Relaxed);
        true
    }
}

/// All registered classes
#[derive(Debug, Default)]
pub struct ClassTable {
    vtables: Vec<VTable>,
}

impl ClassTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class; ids start at 1
    pub fn register(&mut self, desc: ClassDesc) -> Result<VTableId> {
        desc.validate()?;
        let id = VTableId(self.vtables.len() as u32 + 1);
        self.vtables.push(VTable {
            id,
            name: desc.name,
            shape: desc.shape,
            instance_words: desc.instance_words,
            ref_offsets: desc.ref_offsets.into_boxed_slice(),
            ref_kind: desc.ref_kind,
            referent_offset: desc.referent_offset,
            finalizable: desc.finalizable,
            class_object: AtomicUsize::new(0),
            mark_epoch: AtomicU32::new(0),
        });
        Ok(id)
    }

    /// Look up a class
    pub fn get(&self, id: VTableId) -> Option<&VTable> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.vtables.get(i))
    }

    /// Look up a class, failing on unknown ids
    pub fn lookup(&self, id: VTableId) -> Result<&VTable> {
        self.get(id).ok_or(GcError::UnknownClass(id.0))
    }

    /// Iterate registered classes
    pub fn iter(&self) -> impl Iterator<Item = &VTable> {
        self.vtables.iter()
    }
}

/// Object layout queries the scanner and the verifier rely on
///
/// Implementors provide class lookup and array length; the rest derives
/// from the vtable.
pub trait ObjectLayout {
    /// Class of `obj`, following a forwarding header if present
    fn vtable_of(&self, obj: ObjectRef) -> Option<&VTable>;

    /// Element count of an array object
    fn array_length(&self, obj: ObjectRef) -> usize;

    /// Size in bytes
    fn object_size(&self, obj: ObjectRef) -> usize {
        match self.vtable_of(obj) {
            Some(vt) if vt.is_array() => vt.size_words(self.array_length(obj)) * crate::object::WORD,
            Some(vt) => vt.size_words(0) * crate::object::WORD,
            None => 0,
        }
    }

    /// Whether `obj` has any reference fields or elements
    fn object_has_ref_field(&self, obj: ObjectRef) -> bool {
        self.ref_field_count(obj) > 0
    }

    /// Whether `obj` is an array
    fn object_is_array(&self, obj: ObjectRef) -> bool {
        self.vtable_of(obj).is_some_and(VTable::is_array)
    }

    /// Number of reference fields (reference array: element count)
    fn ref_field_count(&self, obj: ObjectRef) -> usize {
        match self.vtable_of(obj) {
            Some(vt) => match vt.shape() {
                Shape::Plain => vt.ref_offsets().len(),
                Shape::RefArray => self.array_length(obj),
                Shape::PrimArray => 0,
            },
            None => 0,
        }
    }

    /// Slot of the `index`-th reference field
    fn ref_field_at(&self, obj: ObjectRef, index: usize) -> Option<Slot> {
        let vt = self.vtable_of(obj)?;
        match vt.shape() {
            Shape::Plain => vt.ref_offsets().get(index).map(|&off| obj.slot(off)),
            Shape::RefArray => (index < self.array_length(obj)).then(|| obj.slot(2 + index)),
            Shape::PrimArray => None,
        }
    }

    /// Special reference kind of `obj`
    fn special_reference_kind(&self, obj: ObjectRef) -> RefKind {
        self.vtable_of(obj).map_or(RefKind::None, VTable::ref_kind)
    }

    /// Referent slot of a reference object
    fn referent_slot(&self, obj: ObjectRef) -> Option<Slot> {
        self.vtable_of(obj)?.referent_offset().map(|off| obj.slot(off))
    }
}
