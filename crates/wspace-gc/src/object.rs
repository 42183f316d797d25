//! Object references and the one-word object header
//!
//! ## Layout
//!
//! ```text
//! header word:
//!   bit 63      forwarded flag (rest of the word is then the new address)
//!   bits 32..62 object-info bits
//!   bits 0..31  class id (VTableId, never 0 for an initialized object)
//!
//! plain object:  [header][payload word]...
//! array:         [header][length][element]...
//! ```

use std::fmt;

/// Machine word size in bytes
pub const WORD: usize = 8;

/// Set on a header that has been replaced by a forwarding address
pub const FORWARD_BIT: usize = 1 << 63;

const CLASS_MASK: usize = 0xFFFF_FFFF;
const INFO_SHIFT: u32 = 32;
const INFO_MASK: usize = 0x7FFF_FFFF;

/// Object-info bits stored in the upper half of the header
pub mod info {
    /// Mark bit for objects that live outside any color table (nursery)
    pub const NURSERY_MARK: u32 = 1 << 0;
    /// Verifier: discovered
    pub const VERIFY_GRAY: u32 = 1 << 1;
    /// Verifier: scanned
    pub const VERIFY_BLACK: u32 = 1 << 2;
    /// Mark bit of the minor collector; stale after an aborted minor pass
    pub const MINOR_MARK: u32 = 1 << 3;
    /// Identity hash has been handed out
    pub const HASHED: u32 = 1 << 4;
    /// Identity hash was carried over when the object moved
    pub const HASHED_ATTACHED: u32 = 1 << 5;
    /// Position of the stored identity hash
    pub const HASH_SHIFT: u32 = 8;
    /// Mask of the stored identity hash (after shifting)
    pub const HASH_MASK: u32 = (1 << 23) - 1;

    /// Bits owned by collectors and the verifier; excluded from snapshot comparison
    pub const TRANSIENT: u32 = NURSERY_MARK | VERIFY_GRAY | VERIFY_BLACK | MINOR_MARK;
}

/// Index of a registered class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VTableId(pub u32);

/// Address of an object header
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// Wrap a non-null, word-aligned address
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0 && addr.is_multiple_of(WORD)).then_some(Self(addr))
    }

    /// Header address
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }

    /// Address of the `index`-th word of the object
    #[inline]
    pub fn word_addr(self, index: usize) -> usize {
        self.0 + index * WORD
    }

    /// Slot at word offset `index`
    #[inline]
    pub fn slot(self, index: usize) -> Slot {
        Slot(self.word_addr(index))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Address of a word holding a reference (0 = null)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(usize);

impl Slot {
    /// Wrap a slot address
    pub fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Slot address
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:#x})", self.0)
    }
}

/// Build a header word
#[inline]
pub fn make_header(class: VTableId, info: u32) -> usize {
    ((info as usize & INFO_MASK) << INFO_SHIFT) | class.0 as usize
}

/// Class id of a non-forwarded header
#[inline]
pub fn header_class(header: usize) -> VTableId {
    VTableId((header & CLASS_MASK) as u32)
}

/// Object-info bits of a non-forwarded header
#[inline]
pub fn header_info(header: usize) -> u32 {
    ((header >> INFO_SHIFT) & INFO_MASK) as u32
}

/// Header word with the given info bits set
#[inline]
pub fn info_bits_word(bits: u32) -> usize {
    (bits as usize & INFO_MASK) << INFO_SHIFT
}

/// Whether the header has been replaced by a forwarding address
#[inline]
pub fn is_forwarded(header: usize) -> bool {
    header & FORWARD_BIT != 0
}

/// Forwarding header pointing at `to`
#[inline]
pub fn forwarding_header(to: ObjectRef) -> usize {
    FORWARD_BIT | to.addr()
}

/// Target of a forwarding header
#[inline]
pub fn forwarded_to(header: usize) -> Option<ObjectRef> {
    if is_forwarded(header) {
        ObjectRef::new(header & !FORWARD_BIT)
    } else {
        None
    }
}
