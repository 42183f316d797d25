//! Live-graph snapshots and their comparison

use crate::object::{ObjectRef, VTableId, info};

/// Info bits that may legitimately change across a collection
pub const UNSTABLE_INFO: u32 = info::TRANSIENT | info::HASHED_ATTACHED;

/// What the verifier records for one live object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Class of the object
    pub class: VTableId,
    /// Object-info bits without [`UNSTABLE_INFO`]
    pub info: u32,
    /// Class of each reference slot's target; `None` for null
    pub slot_classes: Vec<Option<VTableId>>,
}

/// Live objects in trace order
#[derive(Debug, Clone, Default)]
pub struct HeapSnapshot {
    /// Records in the order objects were reached
    pub records: Vec<ObjectRecord>,
    /// Addresses of the recorded objects, same order
    pub objects: Vec<ObjectRef>,
    /// Bytes held by live objects
    pub live_bytes: usize,
    /// Live objects with an identity hash
    pub hashed: usize,
    /// Live objects whose hash moved with them
    pub hashed_attached: usize,
}

impl HeapSnapshot {
    /// Live object count
    pub fn live_objects(&self) -> usize {
        self.records.len()
    }
}

/// A difference between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// Different live object counts
    Count {
        /// Objects before
        before: usize,
        /// Objects after
        after: usize,
    },
    /// Records at `index` differ
    Record {
        /// Trace position
        index: usize,
        /// Record before
        before: ObjectRecord,
        /// Record after
        after: ObjectRecord,
    },
}

/// Walk both snapshots entry by entry; every record must be identical
pub fn compare(before: &HeapSnapshot, after: &HeapSnapshot) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    if before.live_objects() != after.live_objects() {
        mismatches.push(Mismatch::Count {
            before: before.live_objects(),
            after: after.live_objects(),
        });
    }
    for (index, (b, a)) in before.records.iter().zip(&after.records).enumerate() {
        if b != a {
            mismatches.push(Mismatch::Record {
                index,
                before: b.clone(),
                after: a.clone(),
            });
        }
    }
    mismatches
}
