//! Human-readable heap dumps for the interactive inspector and for debugging
//! failed audits. Not on the hot path.

use crate::block::BlockPtr;
use crate::heap::Heap;
use crate::index::FreeIndex;
use core::fmt;

/// How much detail [`Heap::write_dump`] emits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DumpStyle {
    /// Sizes and states only.
    Plain,
    /// Adds block addresses and, for the tree index, per-node black heights.
    Verbose,
}

impl<I: FreeIndex> Heap<I> {
    /// Write the linear block map followed by the free-index contents.
    ///
    /// # Errors
    /// Propagates formatter errors.
    pub fn write_dump(&self, out: &mut dyn fmt::Write, style: DumpStyle) -> fmt::Result {
        let verbose = style == DumpStyle::Verbose;

        writeln!(out, "segment {:?}", self.segment)?;
        let mut block = BlockPtr::new(self.segment.start());
        while block != self.sentinel {
            // SAFETY: the walk follows header sizes inside the segment.
            let header = unsafe { block.header() };
            let state = if header.allocated() {
                "allocated"
            } else if header.red() {
                "free (red)"
            } else {
                "free (black)"
            };
            if verbose {
                writeln!(out, "  {} {:>8}B {}", block.addr(), header.size(), state)?;
            } else {
                writeln!(out, "  {:>8}B {}", header.size(), state)?;
            }
            block = BlockPtr::new(block.addr().byte_add(header.size()));
        }
        if verbose {
            writeln!(out, "  {} sentinel", self.sentinel.addr())?;
        } else {
            writeln!(out, "  sentinel")?;
        }

        writeln!(out, "free index ({} blocks):", self.free_block_count())?;
        self.write_free_index(out, verbose)
    }

    /// Write only the free-index contents (the inspector's breakpoint view).
    ///
    /// # Errors
    /// Propagates formatter errors.
    pub fn write_free_index(&self, out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
        // SAFETY: the index references only live free blocks.
        unsafe { self.index.write_contents(out, verbose) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RbHeap;
    use core::ptr::NonNull;

    #[test]
    fn dump_shows_blocks_and_index() {
        let mut backing = vec![0u64; 512];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let mut heap = unsafe { RbHeap::init(base, 4096) }.unwrap();
        let a = heap.allocate(100).unwrap();
        let _b = heap.allocate(50).unwrap();
        unsafe { heap.deallocate(Some(a)) };

        let mut plain = String::new();
        heap.write_dump(&mut plain, DumpStyle::Plain).unwrap();
        assert!(plain.contains("112B allocated") || plain.contains("112B free"));
        assert!(plain.contains("sentinel"));
        assert!(plain.contains("free index (2 blocks):"));

        let mut verbose = String::new();
        heap.write_dump(&mut verbose, DumpStyle::Verbose).unwrap();
        assert!(verbose.contains("0x"));
        assert!(verbose.contains("bh="));
    }
}
