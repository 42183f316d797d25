//! Object graph scanner
//!
//! Enumerates the reference slots an object owns and hands them to a
//! visitor. The scanner never marks anything itself.

use crate::class::{ObjectLayout, RefKind, Shape, VTable};
use crate::config::ReferentPolicy;
use crate::object::{ObjectRef, Slot};

/// Receives the outgoing edges of a scanned object
pub trait SlotVisitor {
    /// A reference-bearing slot
    fn visit_slot(&mut self, slot: Slot);

    /// A soft/weak/phantom reference object whose referent is handled by
    /// reference processing instead of being traced
    fn visit_reference(&mut self, _obj: ObjectRef, _kind: RefKind) {}

    /// The class object of `vt`, reached through the vtable
    fn visit_class_object(&mut self, _vt: &VTable, _obj: ObjectRef) {}
}

/// Scanner settings for one pass
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Referent handling
    pub referent_policy: ReferentPolicy,
    /// Epoch for class tracing; `None` disables it
    pub class_epoch: Option<u32>,
}

/// Feed every reference slot of `obj` to `visitor`
pub fn scan_object<L, V>(layout: &L, obj: ObjectRef, options: &ScanOptions, visitor: &mut V)
where
    L: ObjectLayout + ?Sized,
    V: SlotVisitor + ?Sized,
{
    let vt = layout.vtable_of(obj);
    debug_assert!(vt.is_some(), "scanning {obj:?} without a class");
    let Some(vt) = vt else {
        return;
    };

    match vt.shape() {
        Shape::RefArray => {
            let len = layout.array_length(obj);
            for i in 0..len {
                visitor.visit_slot(obj.slot(2 + i));
            }
        }
        Shape::Plain => {
            for &off in vt.ref_offsets() {
                visitor.visit_slot(obj.slot(off));
            }
        }
        Shape::PrimArray => {}
    }

    if let Some(off) = vt.referent_offset() {
        match options.referent_policy {
            ReferentPolicy::BuiltIn => visitor.visit_reference(obj, vt.ref_kind()),
            ReferentPolicy::Strong => visitor.visit_slot(obj.slot(off)),
        }
    }

    if let Some(epoch) = options.class_epoch {
        if let Some(class_obj) = vt.class_object() {
            if vt.mark_for_epoch(epoch) {
                visitor.visit_class_object(vt, class_obj);
            }
        }
    }
}
