//! Block layout and the bit-packed header codec.
//!
//! Every block starts with one 64-bit header word. Free blocks additionally
//! carry three link words used by the free index and mirror their header into
//! their last word (the footer), so the right-hand neighbor can find the
//! block's start:
//!
//! ```text
//! +--------+--------+--------+--------+- - - - - - - -+--------+
//! | header | parent | left   | right  |      ...      | footer |
//! +--------+--------+--------+--------+- - - - - - - -+--------+
//! ^ block start                                       ^ size - 8
//! ```
//!
//! An allocated block owns everything past the header as payload; the link
//! and footer words belong to the user while allocated. The client pointer
//! handed out is the payload address, 8 bytes past the block start.
//!
//! ### Header bit layout
//!
//! | Bits  | Name             | Meaning |
//! |-------|------------------|----------|
//! | 0     | `allocated`      | This block is allocated. |
//! | 1     | `left_allocated` | The left physical neighbor is allocated (or this is the first block). |
//! | 2     | `red`            | Node color while the block sits in the red-black free index. |
//! | 63..3 | size             | Block length in bytes; always a multiple of 8, so the low three bits are free for the flags. |
//!
//! The footer is a copy of the header. The color bit is meaningless in
//! footers and in allocated blocks.

use bitfield_struct::bitfield;
use heap_addresses::{ALIGNMENT, SegmentAddress, WORD, align_up};

/// Smallest representable block: header, three links, and a footer.
pub const MIN_BLOCK: usize = 5 * WORD;

/// Bytes reserved at the segment tail for the sentinel block (header plus the
/// three link words the tree variant uses as its NIL node).
pub const SENTINEL_BYTES: usize = 4 * WORD;

/// The 64-bit word at the start of every block (and, mirrored, at the end of
/// every free block).
#[bitfield(u64)]
pub struct HeaderWord {
    /// Allocation status (bit 0).
    pub allocated: bool,
    /// Allocation status of the left physical neighbor (bit 1). The first
    /// block of the segment keeps this set.
    pub left_allocated: bool,
    /// Red-black color (bit 2); only meaningful for free blocks indexed by
    /// the tree variant.
    pub red: bool,
    /// Block size in words (bits 63..3).
    #[bits(61)]
    size_words: u64,
}

impl HeaderWord {
    /// Block size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        (self.size_words() as usize) * WORD
    }

    /// Set the block size (bytes; must be a multiple of 8).
    #[inline]
    pub const fn set_size(&mut self, bytes: usize) {
        self.set_size_words((bytes / WORD) as u64);
    }

    /// Set the block size (bytes; must be a multiple of 8).
    #[inline]
    #[must_use]
    pub const fn with_size(mut self, bytes: usize) -> Self {
        self.set_size(bytes);
        self
    }
}

/// Block size needed to serve a request of `request` payload bytes.
///
/// The request grows by one header word, rounds up to the segment alignment,
/// and is clamped to [`MIN_BLOCK`] so the block can later rejoin the free
/// index.
#[inline]
#[must_use]
pub const fn block_size_for(request: usize) -> usize {
    let size = align_up(request + WORD, ALIGNMENT);
    if size < MIN_BLOCK { MIN_BLOCK } else { size }
}

/// Direction index for the symmetric tree operations.
///
/// Left and right cases of the red-black fixups are mirror images; indexing
/// the two child slots by `Dir` lets one code path serve both.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Dir {
    Left = 0,
    Right = 1,
}

impl Dir {
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// Handle on one block, addressed by its header word.
///
/// A `BlockPtr` is a plain address with accessors layered on top; it owns
/// nothing and stays valid for as long as the segment does. The null handle
/// terminates the segregated lists.
///
/// # Safety
///
/// All accessors that touch memory are `unsafe`: the handle must point at a
/// live block inside the allocator's segment, and accessors for the link
/// slots or the footer must only run while the block is free (while
/// allocated, those words belong to the user payload).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BlockPtr(SegmentAddress);

impl BlockPtr {
    pub const NULL: Self = Self(SegmentAddress::new(0));

    #[inline]
    #[must_use]
    pub const fn new(header: SegmentAddress) -> Self {
        Self(header)
    }

    /// The block owning the client pointer `payload`.
    #[inline]
    #[must_use]
    pub const fn from_payload(payload: SegmentAddress) -> Self {
        Self(payload.byte_sub(WORD))
    }

    #[inline]
    #[must_use]
    pub const fn addr(self) -> SegmentAddress {
        self.0
    }

    /// The client address of this block.
    #[inline]
    #[must_use]
    pub const fn payload(self) -> SegmentAddress {
        self.0.byte_add(WORD)
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0.as_usize() == 0
    }

    #[inline]
    #[must_use]
    pub unsafe fn header(self) -> HeaderWord {
        HeaderWord::from_bits(unsafe { self.0.as_ptr::<u64>().read() })
    }

    #[inline]
    pub unsafe fn set_header(self, word: HeaderWord) {
        unsafe { self.0.as_mut_ptr::<u64>().write(word.into_bits()) }
    }

    #[inline]
    #[must_use]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header() }.size()
    }

    /// Mirror the current header into the block's last word.
    #[inline]
    pub unsafe fn write_footer(self) {
        unsafe {
            let header = self.header();
            self.0
                .byte_add(header.size() - WORD)
                .as_mut_ptr::<u64>()
                .write(header.into_bits());
        }
    }

    /// The footer word of the block's own last word (free blocks only).
    #[inline]
    #[must_use]
    pub unsafe fn footer(self) -> HeaderWord {
        unsafe { HeaderWord::from_bits(self.0.byte_add(self.size() - WORD).as_ptr::<u64>().read()) }
    }

    /// The footer word of the left physical neighbor, which sits directly
    /// below this block's header. Only valid while the left neighbor is free.
    #[inline]
    #[must_use]
    pub unsafe fn left_footer(self) -> HeaderWord {
        unsafe { HeaderWord::from_bits(self.0.byte_sub(WORD).as_ptr::<u64>().read()) }
    }

    /// The right physical neighbor.
    #[inline]
    #[must_use]
    pub unsafe fn right(self) -> Self {
        Self(self.0.byte_add(unsafe { self.size() }))
    }

    /// The left physical neighbor, located through its footer. Only valid
    /// while the left neighbor is free.
    #[inline]
    #[must_use]
    pub unsafe fn left(self) -> Self {
        Self(self.0.byte_sub(unsafe { self.left_footer() }.size()))
    }

    #[inline]
    unsafe fn link(self, slot: usize) -> Self {
        Self(SegmentAddress::new(unsafe {
            self.0.byte_add(slot).as_ptr::<usize>().read()
        }))
    }

    #[inline]
    unsafe fn set_link(self, slot: usize, to: Self) {
        unsafe {
            self.0
                .byte_add(slot)
                .as_mut_ptr::<usize>()
                .write(to.0.as_usize());
        }
    }

    /// Tree parent link (first link word).
    #[inline]
    #[must_use]
    pub unsafe fn parent(self) -> Self {
        unsafe { self.link(WORD) }
    }

    #[inline]
    pub unsafe fn set_parent(self, to: Self) {
        unsafe { self.set_link(WORD, to) }
    }

    /// Tree child link in direction `dir` (second and third link words).
    #[inline]
    #[must_use]
    pub unsafe fn child(self, dir: Dir) -> Self {
        unsafe { self.link(2 * WORD + dir as usize * WORD) }
    }

    #[inline]
    pub unsafe fn set_child(self, dir: Dir, to: Self) {
        unsafe { self.set_link(2 * WORD + dir as usize * WORD, to) }
    }

    /// List predecessor; shares the slot of the left child link.
    #[inline]
    #[must_use]
    pub unsafe fn prev(self) -> Self {
        unsafe { self.child(Dir::Left) }
    }

    #[inline]
    pub unsafe fn set_prev(self, to: Self) {
        unsafe { self.set_child(Dir::Left, to) }
    }

    /// List successor; shares the slot of the right child link.
    #[inline]
    #[must_use]
    pub unsafe fn next(self) -> Self {
        unsafe { self.child(Dir::Right) }
    }

    #[inline]
    pub unsafe fn set_next(self, to: Self) {
        unsafe { self.set_child(Dir::Right, to) }
    }
}

impl core::fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BlockPtr({})", self.0)
    }
}
