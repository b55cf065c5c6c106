//! Position-independent intra-segment references.
//!
//! The segment is mapped at a different virtual address in every process
//! that opens it, so nothing stored inside the segment may hold a native
//! pointer. Every in-segment reference is an [`Offset`]: a byte distance
//! from one of the two area bases. Conversion to and from real addresses
//! happens only through `Segment`, which knows the bases.

use std::ops::Add;

/// A byte offset from an area base. `Offset::NULL` (zero) means "none";
/// the byte at offset zero is never a valid target.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    pub const NULL: Offset = Offset(0);

    pub const fn new(raw: u64) -> Self {
        Offset(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Add<u64> for Offset {
    type Output = Offset;

    fn add(self, bytes: u64) -> Offset {
        Offset(self.0 + bytes)
    }
}

/// Which base an offset is taken against.
///
/// `System` is the segment base itself (offset zero is the first byte of
/// the mapped file), so system-relative offsets can address the entire
/// mapping, including the user arena above the system area. `User` is the
/// start of the allocator-managed arena. Every B-tree records the area its
/// offsets are relative to and uses only that one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Area {
    System = 0,
    User = 1,
}

impl Area {
    pub fn from_raw(raw: u32) -> Option<Area> {
        match raw {
            0 => Some(Area::System),
            1 => Some(Area::User),
            _ => None,
        }
    }
}
