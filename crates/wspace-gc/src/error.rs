//! Collector errors

use thiserror::Error;

/// Errors surfaced by the heap, the mutator interface and configuration parsing
#[derive(Debug, Error)]
pub enum GcError {
    /// No chunk or nursery space could satisfy the request
    #[error("Heap exhausted while allocating {requested} bytes")]
    HeapExhausted {
        /// Requested size in bytes
        requested: usize,
    },

    /// Object does not fit the slot sizes available to this allocation path
    #[error("Object of {size} bytes exceeds the largest slot size ({slot_size} bytes)")]
    ObjectTooLarge {
        /// Object size in bytes
        size: usize,
        /// Largest slot size usable on this path
        slot_size: usize,
    },

    /// Class id is not registered
    #[error("Unknown class id: {0}")]
    UnknownClass(u32),

    /// Address lies outside every heap region
    #[error("Invalid heap address: {0:#x}")]
    InvalidAddress(usize),

    /// Address is inside the heap but does not start a live object
    #[error("Not an object: {0:#x}")]
    NotAnObject(usize),

    /// Reference field index out of range
    #[error("Invalid field index {index} (object has {count} reference fields)")]
    InvalidField {
        /// Requested index
        index: usize,
        /// Number of reference fields on the object
        count: usize,
    },

    /// Every root cell is occupied
    #[error("Root table full")]
    RootTableFull,

    /// Malformed verifier option string
    #[error("Invalid verify option: {0}")]
    InvalidVerifyOption(String),

    /// Inconsistent configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Bounded metadata arena has no more blocks
    #[error("Run out of GC metadata")]
    MetadataExhausted,
}

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, GcError>;
