//! Whole-heap invariant audit: an O(N) linear walk cross-checked against the
//! free index. Meant for use between requests during correctness testing;
//! never on the hot path.

use crate::block::{BlockPtr, SENTINEL_BYTES};
use crate::heap::Heap;
use crate::index::{FreeIndex, IndexAuditError};
use heap_addresses::{ALIGNMENT, SegmentAddress};
use log::error;

/// Byte and block tallies from a successful audit.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapReport {
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

/// Ways a heap can fail its audit.
///
/// Any of these outside an allocator call means corrupted bookkeeping (or a
/// client overflow) and should be treated as fatal by the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapAuditError {
    #[error("block at {at} has zero size")]
    ZeroSize { at: SegmentAddress },
    #[error("block at {at} has unaligned size {size}")]
    UnalignedSize { at: SegmentAddress, size: usize },
    #[error("block at {at} runs past the sentinel")]
    Overrun { at: SegmentAddress },
    #[error("adjacent free blocks at {left} and {right}")]
    AdjacentFree {
        left: SegmentAddress,
        right: SegmentAddress,
    },
    #[error("free block at {at}: footer {footer:#018X} does not mirror header {header:#018X}")]
    FooterMismatch {
        at: SegmentAddress,
        header: u64,
        footer: u64,
    },
    #[error("block at {at} disagrees with its left neighbor's allocation state")]
    LeftBitStale { at: SegmentAddress },
    #[error("sentinel at {at} was rewritten to {found:#018X}")]
    SentinelClobbered { at: SegmentAddress, found: u64 },
    #[error("free index: {0}")]
    Index(#[from] IndexAuditError),
    #[error(
        "index tracks {index_blocks} blocks / {index_bytes} bytes, walk found {walk_blocks} / {walk_bytes}"
    )]
    IndexMismatch {
        index_blocks: usize,
        index_bytes: usize,
        walk_blocks: usize,
        walk_bytes: usize,
    },
}

/// The color bit: meaningless in footers, masked out of the mirror check.
const COLOR_BIT: u64 = 0b100;

impl<I: FreeIndex> Heap<I> {
    /// Walk the whole segment and verify every structural invariant: exact
    /// tiling up to the sentinel, no adjacent free pair, footer mirroring,
    /// left-allocated-bit consistency, and a free index that agrees with the
    /// walk in blocks, bytes, and its own structure.
    ///
    /// # Errors
    /// The first violation found, see [`HeapAuditError`].
    pub fn audit(&self) -> Result<HeapReport, HeapAuditError> {
        let mut report = HeapReport::default();
        let sentinel_addr = self.sentinel.addr();

        let mut block = BlockPtr::new(self.segment.start());
        let mut left_allocated = true;
        let mut left_addr = SegmentAddress::new(0);

        while block != self.sentinel {
            // SAFETY: the walk stays inside the segment; every stop is
            // re-checked against the sentinel before the next hop.
            let header = unsafe { block.header() };
            let size = header.size();
            let at = block.addr();

            if size == 0 {
                return Err(HeapAuditError::ZeroSize { at });
            }
            if size % ALIGNMENT != 0 {
                return Err(HeapAuditError::UnalignedSize { at, size });
            }
            if at.byte_add(size) > sentinel_addr {
                return Err(HeapAuditError::Overrun { at });
            }
            if header.left_allocated() != left_allocated {
                return Err(HeapAuditError::LeftBitStale { at });
            }

            if header.allocated() {
                report.allocated_blocks += 1;
                report.allocated_bytes += size;
            } else {
                if !left_allocated {
                    return Err(HeapAuditError::AdjacentFree {
                        left: left_addr,
                        right: at,
                    });
                }
                let footer = unsafe { block.footer() };
                if footer.into_bits() & !COLOR_BIT != header.into_bits() & !COLOR_BIT {
                    return Err(HeapAuditError::FooterMismatch {
                        at,
                        header: header.into_bits(),
                        footer: footer.into_bits(),
                    });
                }
                report.free_blocks += 1;
                report.free_bytes += size;
            }

            left_allocated = header.allocated();
            left_addr = at;
            block = BlockPtr::new(at.byte_add(size));
        }

        // SAFETY: the sentinel block is owned by the heap.
        let sentinel_header = unsafe { self.sentinel.header() };
        if !sentinel_header.allocated() || sentinel_header.size() != 0 {
            return Err(HeapAuditError::SentinelClobbered {
                at: sentinel_addr,
                found: sentinel_header.into_bits(),
            });
        }
        if sentinel_header.left_allocated() != left_allocated {
            return Err(HeapAuditError::LeftBitStale { at: sentinel_addr });
        }

        debug_assert_eq!(
            report.allocated_bytes + report.free_bytes + SENTINEL_BYTES,
            self.segment.len()
        );

        // SAFETY: the index only references free blocks inside the segment.
        let index = unsafe { self.index.audit() }?;
        if index.blocks != report.free_blocks || index.bytes != report.free_bytes {
            return Err(HeapAuditError::IndexMismatch {
                index_blocks: index.blocks,
                index_bytes: index.bytes,
                walk_blocks: report.free_blocks,
                walk_bytes: report.free_bytes,
            });
        }

        Ok(report)
    }

    /// [`audit`](Self::audit) reduced to a flag; the defect is logged.
    #[must_use]
    pub fn validate(&self) -> bool {
        match self.audit() {
            Ok(_) => true,
            Err(defect) => {
                error!("heap audit failed: {defect}");
                false
            }
        }
    }
}
