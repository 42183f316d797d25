//! # wspace GC
//!
//! Parallel mark-sweep engine for the mature space of a generational heap.
//!
//! ## Design
//!
//! - **Color table**: 4 bits per slot in a per-chunk table; allocation and
//!   black colors swap at every cycle, so marks never need a reset pass
//! - **Parallel marking**: collector threads share block-based task pools
//!   and leave through a termination barrier; an object is enqueued only by
//!   the thread whose gray CAS succeeded
//! - **Fallback marking**: stop-the-world variant that marks through slots
//!   and repairs references to objects forwarded by an aborted minor pass
//! - **Sweeping**: chunks are claimed through an atomic cursor, classified
//!   as free, partially free or used, and free runs are merged afterwards
//! - **Barriers**: mutators remember old-to-young stores and gray white
//!   targets while marking (Dijkstra insertion barrier)
//! - **Verification**: an optional independent re-trace compares the live
//!   graph before and after each cycle

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod chunk;
pub mod class;
pub mod collector;
pub mod color;
pub mod config;
pub mod error;
pub mod heap;
pub mod mark;
pub mod merge;
pub mod metadata;
pub mod mutator;
pub mod nursery;
pub mod object;
pub mod roots;
pub mod scan;
pub mod space;
pub mod sweep;
pub mod verify;
pub mod weak;

pub use chunk::{Chunk, ChunkHandle, ChunkStatus};
pub use class::{ClassDesc, ObjectLayout, RefKind, Shape, VTable};
pub use collector::{CollectionKind, Gc, GcStats, GcTotals};
pub use color::{Color, ColorTransition, CycleColors};
pub use config::{GcConfig, ReferentPolicy, VerifyOptions};
pub use error::{GcError, Result};
pub use heap::Heap;
pub use mark::{MarkMode, MarkStats, run_marking};
pub use mutator::Mutator;
pub use object::{ObjectRef, Slot, VTableId};
pub use roots::RootHandle;
pub use verify::VerificationSession;
