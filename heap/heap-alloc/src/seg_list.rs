//! Segregated size-class lists; the simpler stand-in for the tree index.
//!
//! Twenty classes, bounded by payload bytes. Each class is a doubly-linked
//! list of free blocks sorted ascending by block size, so first-fit inside
//! the right class approximates best-fit. Blocks link through the same
//! in-block words the tree uses (`prev`/`next` alias the two child slots);
//! the parent slot is unused here.

use crate::block::BlockPtr;
use crate::index::{FreeIndex, IndexAudit, IndexAuditError};
use core::fmt;
use heap_addresses::WORD;

pub const CLASS_COUNT: usize = 20;

/// Upper payload-byte bound of each class; the last class is unbounded.
const PAYLOAD_BOUNDS: [usize; CLASS_COUNT] = [
    1,
    2,
    3,
    4,
    5,
    6,
    7,
    8,
    16,
    32,
    64,
    128,
    256,
    512,
    1024,
    2048,
    4096,
    8192,
    16384,
    usize::MAX,
];

/// Class holding blocks of `block_size` total bytes.
fn class_of(block_size: usize) -> usize {
    let payload = block_size - WORD;
    PAYLOAD_BOUNDS
        .iter()
        .position(|&bound| payload <= bound)
        .unwrap_or(CLASS_COUNT - 1)
}

pub struct SegListIndex {
    heads: [BlockPtr; CLASS_COUNT],
    len: usize,
}

impl SegListIndex {
    /// Unlink `block` from `class`.
    unsafe fn unlink(&mut self, class: usize, block: BlockPtr) {
        unsafe {
            let prev = block.prev();
            let next = block.next();
            if prev.is_null() {
                self.heads[class] = next;
            } else {
                prev.set_next(next);
            }
            if !next.is_null() {
                next.set_prev(prev);
            }
            self.len -= 1;
        }
    }
}

impl FreeIndex for SegListIndex {
    unsafe fn new(_nil: BlockPtr) -> Self {
        Self {
            heads: [BlockPtr::NULL; CLASS_COUNT],
            len: 0,
        }
    }

    unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            let size = block.size();
            let class = class_of(size);

            let mut prev = BlockPtr::NULL;
            let mut walk = self.heads[class];
            while !walk.is_null() && walk.size() < size {
                prev = walk;
                walk = walk.next();
            }

            block.set_prev(prev);
            block.set_next(walk);
            if !walk.is_null() {
                walk.set_prev(block);
            }
            if prev.is_null() {
                self.heads[class] = block;
            } else {
                prev.set_next(block);
            }
            self.len += 1;
        }
    }

    unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            self.unlink(class_of(block.size()), block);
        }
    }

    unsafe fn pop_best_fit(&mut self, min_block: usize) -> Option<BlockPtr> {
        unsafe {
            let start = class_of(min_block);

            // Within the starting class the list is sorted, so the first
            // block that fits is the best fit.
            let mut walk = self.heads[start];
            while !walk.is_null() {
                if walk.size() >= min_block {
                    self.unlink(start, walk);
                    return Some(walk);
                }
                walk = walk.next();
            }

            // Every block in a higher class fits; its head is that class's
            // minimum.
            for class in start + 1..CLASS_COUNT {
                let head = self.heads[class];
                if !head.is_null() {
                    self.unlink(class, head);
                    return Some(head);
                }
            }
            None
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    unsafe fn audit(&self) -> Result<IndexAudit, IndexAuditError> {
        unsafe {
            let mut tally = IndexAudit::default();
            for (class, &head) in self.heads.iter().enumerate() {
                let mut prev = BlockPtr::NULL;
                let mut walk = head;
                while !walk.is_null() {
                    let header = walk.header();
                    if header.allocated() {
                        return Err(IndexAuditError::AllocatedNode { at: walk.addr() });
                    }
                    let size = header.size();
                    if class_of(size) != class {
                        return Err(IndexAuditError::WrongClass {
                            at: walk.addr(),
                            size,
                            class,
                        });
                    }
                    if !prev.is_null() && prev.size() > size {
                        return Err(IndexAuditError::UnsortedClass {
                            at: walk.addr(),
                            class,
                        });
                    }
                    if walk.prev() != prev {
                        return Err(IndexAuditError::PrevLink { at: walk.addr() });
                    }
                    tally.blocks += 1;
                    tally.bytes += size;
                    prev = walk;
                    walk = walk.next();
                }
            }
            if tally.blocks != self.len {
                return Err(IndexAuditError::CountMismatch {
                    tracked: self.len,
                    counted: tally.blocks,
                });
            }
            Ok(tally)
        }
    }

    unsafe fn write_contents(&self, out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
        unsafe {
            let mut any = false;
            for (class, &head) in self.heads.iter().enumerate() {
                if head.is_null() {
                    continue;
                }
                any = true;
                let bound = PAYLOAD_BOUNDS[class];
                if bound == usize::MAX {
                    write!(out, "class {class} (unbounded):")?;
                } else {
                    write!(out, "class {class} (payload <= {bound}):")?;
                }
                let mut walk = head;
                while !walk.is_null() {
                    if verbose {
                        write!(out, " {}B@{}", walk.size(), walk.addr())?;
                    } else {
                        write!(out, " {}B", walk.size())?;
                    }
                    walk = walk.next();
                }
                writeln!(out)?;
            }
            if !any {
                writeln!(out, "(empty)")?;
            }
            Ok(())
        }
    }
}
