use crate::SegmentAddress;
use core::fmt;

/// The half-open byte range `[start, start + len)` the allocator manages.
///
/// The segment is owned by the host; the allocator only indexes it. `len` is
/// always a multiple of the segment alignment.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Segment {
    start: SegmentAddress,
    len: usize,
}

impl Segment {
    #[inline]
    #[must_use]
    pub const fn new(start: SegmentAddress, len: usize) -> Self {
        Self { start, len }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> SegmentAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// One past the last byte of the segment.
    #[inline]
    #[must_use]
    pub const fn end(self) -> SegmentAddress {
        self.start.byte_add(self.len)
    }

    /// Whether `addr` lies inside the segment.
    #[inline]
    #[must_use]
    pub const fn contains(self, addr: SegmentAddress) -> bool {
        addr.as_usize() >= self.start.as_usize() && addr.as_usize() < self.end().as_usize()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({} + 0x{:X})", self.start, self.len)
    }
}
