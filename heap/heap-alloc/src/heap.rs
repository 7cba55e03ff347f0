//! The allocator façade: one value per segment, generic over the free index.

use crate::block::{BlockPtr, HeaderWord, MIN_BLOCK, SENTINEL_BYTES, block_size_for};
use crate::index::FreeIndex;
use crate::rb::RbIndex;
use crate::seg_list::SegListIndex;
use core::ptr::{self, NonNull};
use heap_addresses::{ALIGNMENT, Segment, SegmentAddress, WORD, align_down};
use log::trace;

/// Why [`Heap::init`] rejected a segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("segment base {base} is not 8-byte aligned")]
    Misaligned { base: SegmentAddress },
    #[error("segment of {len} bytes is too small, need at least {min}")]
    TooSmall { len: usize, min: usize },
}

/// A heap over one host-provided segment.
///
/// The allocator is single-threaded and non-reentrant; it performs no system
/// calls and never grows past the segment it was initialized over. All
/// bookkeeping lives inside the segment itself: block headers, free-block
/// links, and the tail sentinel that terminates the linear walk and serves as
/// the tree's NIL.
pub struct Heap<I> {
    pub(crate) segment: Segment,
    pub(crate) sentinel: BlockPtr,
    pub(crate) index: I,
}

/// The primary configuration: best-fit through a red-black tree.
pub type RbHeap = Heap<RbIndex>;

/// The segregated-list configuration; same contract, simpler index.
pub type SegListHeap = Heap<SegListIndex>;

impl<I: FreeIndex> Heap<I> {
    /// Take over the segment `[base, base + len)`.
    ///
    /// Rounds `len` down to the segment alignment, lays out one giant free
    /// block followed by the sentinel, and seeds the free index with it.
    ///
    /// # Errors
    /// [`InitError::Misaligned`] if `base` is not 8-byte aligned;
    /// [`InitError::TooSmall`] if the rounded length cannot hold one minimal
    /// block plus the sentinel.
    ///
    /// # Safety
    /// - `[base, base + len)` must be valid, writable, and exclusive to the
    ///   allocator for the heap's whole lifetime.
    /// - The host must not touch the segment except through returned client
    ///   pointers.
    pub unsafe fn init(base: NonNull<u8>, len: usize) -> Result<Self, InitError> {
        let start = SegmentAddress::from_nonnull(base);
        if !start.is_aligned_to(ALIGNMENT) {
            return Err(InitError::Misaligned { base: start });
        }
        let len = align_down(len, ALIGNMENT);
        if len < MIN_BLOCK + SENTINEL_BYTES {
            return Err(InitError::TooSmall {
                len,
                min: MIN_BLOCK + SENTINEL_BYTES,
            });
        }

        let segment = Segment::new(start, len);
        let first_size = len - SENTINEL_BYTES;
        let first = BlockPtr::new(start);
        let sentinel = BlockPtr::new(start.byte_add(first_size));

        unsafe {
            // The first block has no left neighbor; it keeps the bit set.
            first.set_header(HeaderWord::new().with_size(first_size).with_left_allocated(true));
            first.write_footer();
            sentinel.set_header(HeaderWord::new().with_allocated(true));

            let mut index = I::new(sentinel);
            index.insert(first);

            trace!("heap over {segment:?}, first block {first_size}B");
            Ok(Self {
                segment,
                sentinel,
                index,
            })
        }
    }

    /// The segment this heap manages.
    #[must_use]
    pub const fn segment(&self) -> Segment {
        self.segment
    }

    /// Largest request the heap could ever satisfy.
    #[must_use]
    pub fn max_request(&self) -> usize {
        self.segment.len() - SENTINEL_BYTES - WORD
    }

    /// Number of blocks in the free index.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.index.len()
    }

    /// Allocate `request` bytes; the returned pointer is 8-byte aligned.
    ///
    /// Returns `None` for zero-size and oversized requests and when no free
    /// block fits.
    pub fn allocate(&mut self, request: usize) -> Option<NonNull<u8>> {
        if request == 0 || request > self.max_request() {
            return None;
        }
        let need = block_size_for(request);
        // SAFETY: the index only hands out blocks inside our segment.
        unsafe {
            let found = self.index.pop_best_fit(need)?;
            Some(self.place(found, need))
        }
    }

    /// Release the block behind `ptr`. `None` is a no-op.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap's [`allocate`](Self::allocate)
    /// or [`reallocate`](Self::reallocate) and not released since.
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        unsafe {
            let block = BlockPtr::from_payload(SegmentAddress::from_nonnull(ptr));
            let block = self.coalesce(block);
            self.finish_free(block);
        }
    }

    /// Resize the block behind `ptr` to `request` bytes.
    ///
    /// `None` behaves as [`allocate`](Self::allocate); a zero `request`
    /// behaves as [`deallocate`](Self::deallocate) and returns `None`. The
    /// block grows in place when coalescing its neighbors yields enough room
    /// (moving the payload down when the head moves left); otherwise the
    /// contents move to a fresh allocation.
    ///
    /// Unlike libc `realloc`, a failed grow is destructive: the old block has
    /// already been coalesced and is released to the free index, so the old
    /// pointer is invalid even when `None` comes back.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap and not released since.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        request: usize,
    ) -> Option<NonNull<u8>> {
        if request > self.max_request() {
            return None;
        }
        let Some(ptr) = ptr else {
            return self.allocate(request);
        };
        if request == 0 {
            unsafe { self.deallocate(Some(ptr)) };
            return None;
        }

        unsafe {
            let old_block = BlockPtr::from_payload(SegmentAddress::from_nonnull(ptr));
            let old_size = old_block.size();
            let preserved = old_size - WORD;
            let need = block_size_for(request);

            let block = self.coalesce(old_block);
            if block.size() >= need {
                if block != old_block {
                    // The head moved left; slide the payload down to the new
                    // client address. Regions may overlap.
                    ptr::copy(ptr.as_ptr(), block.payload().as_mut_ptr(), preserved);
                }
                return Some(self.place(block, need));
            }

            let moved = self.allocate(request);
            if let Some(new_ptr) = moved {
                ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), preserved);
            }
            self.finish_free(block);
            moved
        }
    }

    /// Payload bytes of the live block behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap and not released since.
    #[must_use]
    pub unsafe fn payload_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { BlockPtr::from_payload(SegmentAddress::from_nonnull(ptr)).size() - WORD }
    }

    /// Split-or-take: carve `need` bytes out of the free block `block`, mark
    /// the result allocated, and return its client pointer.
    ///
    /// `block` must not be in the free index. When the surplus can stand as a
    /// block of its own it becomes a free tail; otherwise the whole block is
    /// taken.
    unsafe fn place(&mut self, block: BlockPtr, need: usize) -> NonNull<u8> {
        unsafe {
            let total = block.size();
            let header = block.header();
            if total >= need + MIN_BLOCK {
                block.set_header(header.with_size(need).with_allocated(true).with_red(false));

                let tail = BlockPtr::new(block.addr().byte_add(need));
                tail.set_header(
                    HeaderWord::new()
                        .with_size(total - need)
                        .with_left_allocated(true),
                );
                tail.write_footer();
                // The block right of the tail sees a free left neighbor.
                let right = tail.right();
                right.set_header(right.header().with_left_allocated(false));
                self.index.insert(tail);
            } else {
                block.set_header(header.with_allocated(true).with_red(false));
                let right = block.right();
                right.set_header(right.header().with_left_allocated(true));
            }
            NonNull::new_unchecked(block.payload().as_mut_ptr())
        }
    }

    /// Merge `block` with whichever physical neighbors are free.
    ///
    /// Neighbors leave the free index; the surviving header keeps its own
    /// left-allocated bit and the combined size. The footer is deliberately
    /// not written (a reallocation may turn the block allocated again) and
    /// the result is not re-indexed; callers finalize.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        unsafe {
            let mut start = block;
            let mut size = block.size();

            let right = block.right();
            if right != self.sentinel && !right.header().allocated() {
                self.index.remove(right);
                size += right.size();
            }

            if !block.header().left_allocated() {
                let left = block.left();
                self.index.remove(left);
                size += left.size();
                start = left;
            }

            start.set_header(start.header().with_size(size).with_allocated(false));
            start
        }
    }

    /// Mark `block` free for good: header, footer, the right neighbor's
    /// left-allocated bit, and the index entry.
    unsafe fn finish_free(&mut self, block: BlockPtr) {
        unsafe {
            block.set_header(block.header().with_allocated(false).with_red(false));
            block.write_footer();
            let right = block.right();
            right.set_header(right.header().with_left_allocated(false));
            self.index.insert(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::HeapAuditError;

    /// 4 KiB of 8-byte-aligned backing plus a heap over it.
    fn rb_heap(backing: &mut Vec<u64>) -> RbHeap {
        heap::<RbIndex>(backing)
    }

    fn heap<I: FreeIndex>(backing: &mut Vec<u64>) -> Heap<I> {
        backing.clear();
        backing.resize(512, 0);
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { Heap::init(base, 4096) }.expect("segment fits")
    }

    fn audited<I: FreeIndex>(heap: &Heap<I>) -> crate::audit::HeapReport {
        heap.audit().expect("heap invariants")
    }

    #[test]
    fn init_lays_out_one_giant_block() {
        let mut backing = Vec::new();
        let heap = rb_heap(&mut backing);
        assert_eq!(heap.free_block_count(), 1);
        assert_eq!(heap.max_request(), 4096 - SENTINEL_BYTES - WORD);
        let report = audited(&heap);
        assert_eq!(report.free_bytes, 4096 - SENTINEL_BYTES);
        assert_eq!(report.allocated_blocks, 0);
    }

    #[test]
    fn init_rejects_unusable_segments() {
        let mut backing = vec![0u64; 16];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        assert!(matches!(
            unsafe { RbHeap::init(base, 64) },
            Err(InitError::TooSmall { len: 64, min: 72 })
        ));
        let odd = NonNull::new(unsafe { backing.as_mut_ptr().cast::<u8>().add(4) }).unwrap();
        assert!(matches!(
            unsafe { RbHeap::init(odd, 96) },
            Err(InitError::Misaligned { .. })
        ));
    }

    #[test]
    fn split_on_allocation() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let ptr = heap.allocate(24).expect("plenty of room");
        // 24B request -> minimal 40B block at the segment base; client
        // pointer sits one word in.
        assert_eq!(
            ptr.as_ptr() as usize,
            heap.segment().start().as_usize() + WORD
        );
        assert_eq!(heap.free_block_count(), 1);
        let report = audited(&heap);
        assert_eq!(report.allocated_bytes, MIN_BLOCK);
        assert_eq!(report.free_bytes, 4096 - SENTINEL_BYTES - MIN_BLOCK);
    }

    #[test]
    fn zero_and_oversized_requests_fail_cleanly() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        assert!(heap.allocate(0).is_none());
        assert!(heap.allocate(heap.max_request() + 1).is_none());
        audited(&heap);
        // The whole segment in one shot still works.
        let all = heap.allocate(heap.max_request()).expect("exact fit");
        assert_eq!(heap.free_block_count(), 0);
        audited(&heap);
        unsafe { heap.deallocate(Some(all)) };
        assert_eq!(heap.free_block_count(), 1);
        audited(&heap);
    }

    #[test]
    fn whole_block_taken_when_tail_would_be_too_small() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        // Carve a 64B free hole between two allocated blocks.
        let a = heap.allocate(56).unwrap();
        let _b = heap.allocate(56).unwrap();
        unsafe { heap.deallocate(Some(a)) };
        audited(&heap);

        // 40B need inside the 64B hole leaves 24B < MIN_BLOCK: take it all.
        let again = heap.allocate(32).unwrap();
        assert_eq!(again, a);
        assert_eq!(unsafe { heap.payload_size(again) }, 64 - WORD);
        audited(&heap);
    }

    #[test]
    fn free_coalesces_in_every_direction() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        assert_eq!(heap.free_block_count(), 1);

        // Neighbors allocated: the middle block stays alone in the index.
        unsafe { heap.deallocate(Some(b)) };
        assert_eq!(heap.free_block_count(), 2);
        audited(&heap);

        // Left free: freeing the first block merges the pair.
        unsafe { heap.deallocate(Some(a)) };
        assert_eq!(heap.free_block_count(), 2);
        audited(&heap);

        // Freeing the last block merges with both sides back into one giant
        // free block.
        unsafe { heap.deallocate(Some(c)) };
        assert_eq!(heap.free_block_count(), 1);
        let report = audited(&heap);
        assert_eq!(report.free_bytes, 4096 - SENTINEL_BYTES);
    }

    #[test]
    fn allocation_is_reusable_after_free() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let sizes = [24, 200, 56, 1024, 400];
        let ptrs: Vec<_> = sizes.iter().map(|&n| heap.allocate(n).unwrap()).collect();
        audited(&heap);
        for &p in ptrs.iter().rev() {
            unsafe { heap.deallocate(Some(p)) };
            audited(&heap);
        }
        assert_eq!(heap.free_block_count(), 1);
        // Space fully reclaimed: the giant allocation fits again.
        assert!(heap.allocate(heap.max_request()).is_some());
    }

    #[test]
    fn realloc_null_and_zero_edges() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let p = unsafe { heap.reallocate(None, 48) }.expect("acts as allocate");
        audited(&heap);
        assert!(unsafe { heap.reallocate(Some(p), 0) }.is_none());
        assert_eq!(heap.free_block_count(), 1);
        audited(&heap);
        assert!(unsafe { heap.reallocate(None, heap.max_request() + 1) }.is_none());
    }

    #[test]
    fn realloc_grows_in_place_over_a_free_right_neighbor() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        let _guard = heap.allocate(32).unwrap();
        unsafe { heap.deallocate(Some(b)) };
        audited(&heap);

        unsafe {
            a.as_ptr().write_bytes(0xAB, 32);
            let grown = heap.reallocate(Some(a), 56).expect("right neighbor absorbs");
            // Head did not move: same client pointer, contents untouched.
            assert_eq!(grown, a);
            for i in 0..32 {
                assert_eq!(grown.as_ptr().add(i).read(), 0xAB);
            }
        }
        audited(&heap);
    }

    #[test]
    fn realloc_moves_left_and_slides_the_payload() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(32).unwrap();
        let _guard = heap.allocate(32).unwrap();
        unsafe { heap.deallocate(Some(a)) };
        audited(&heap);

        unsafe {
            b.as_ptr().write_bytes(0xCD, 32);
            // b's only room is the free block on its left; the head moves
            // down and the payload slides with it.
            let grown = heap.reallocate(Some(b), 80).expect("left coalesce");
            assert_eq!(grown, a, "reuses the freed left neighbor's address");
            for i in 0..32 {
                assert_eq!(grown.as_ptr().add(i).read(), 0xCD);
            }
        }
        audited(&heap);
    }

    #[test]
    fn realloc_relocates_when_neighbors_cannot_help() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let a = heap.allocate(32).unwrap();
        let _guard = heap.allocate(32).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x5A, 32);
            let moved = heap.reallocate(Some(a), 512).expect("tail has room");
            assert_ne!(moved, a);
            for i in 0..32 {
                assert_eq!(moved.as_ptr().add(i).read(), 0x5A);
            }
        }
        audited(&heap);
    }

    #[test]
    fn realloc_failure_releases_the_block() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let a = heap.allocate(64).unwrap();
        let _rest = heap.allocate(heap.max_request() - 64 - 2 * WORD).unwrap();
        assert_eq!(heap.free_block_count(), 0);

        // No free neighbor and no fallback space: the grow fails, and the
        // documented destructive semantics free the original block.
        let grown = unsafe { heap.reallocate(Some(a), 3000) };
        assert!(grown.is_none());
        assert_eq!(heap.free_block_count(), 1);
        audited(&heap);
    }

    #[test]
    fn seg_list_heap_honors_the_same_contract() {
        let mut backing = Vec::new();
        let mut heap = heap::<SegListIndex>(&mut backing);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        unsafe { heap.deallocate(Some(b)) };
        audited(&heap);
        unsafe { heap.deallocate(Some(a)) };
        audited(&heap);
        unsafe {
            c.as_ptr().write_bytes(0x42, 100);
            let grown = heap.reallocate(Some(c), 400).expect("merges left");
            for i in 0..100 {
                assert_eq!(grown.as_ptr().add(i).read(), 0x42);
            }
        }
        let report = audited(&heap);
        assert_eq!(report.allocated_blocks, 1);
    }

    #[test]
    fn audit_spots_a_clobbered_header() {
        let mut backing = Vec::new();
        let mut heap = rb_heap(&mut backing);
        let p = heap.allocate(48).unwrap();
        // A buffer overflow by one word lands on the next block's header.
        unsafe {
            p.as_ptr().cast::<u64>().add(48 / 8).write(0);
        }
        assert!(matches!(
            heap.audit(),
            Err(HeapAuditError::ZeroSize { .. })
        ));
        assert!(!heap.validate());
    }
}
