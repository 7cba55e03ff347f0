//! Red-black tree over the free blocks, keyed by block size.
//!
//! Nodes are the free blocks themselves: each carries `parent`, `left`, and
//! `right` links in its first three payload words, and its color in the
//! header's red bit. The segment-tail sentinel doubles as the NIL leaf and as
//! the root's parent, so rotations and fixups never branch on null links.
//!
//! Equal keys insert to the right of equal ancestors; no duplicate list is
//! kept. The rebalancing follows the classic Cormen insert/delete fixups,
//! with the left/right mirror cases collapsed through [`Dir`].

use crate::block::{BlockPtr, Dir};
use crate::index::{FreeIndex, IndexAudit, IndexAuditError};
use core::fmt;

pub struct RbIndex {
    root: BlockPtr,
    nil: BlockPtr,
    len: usize,
}

#[inline]
unsafe fn is_red(block: BlockPtr) -> bool {
    unsafe { block.header() }.red()
}

#[inline]
unsafe fn set_red(block: BlockPtr, red: bool) {
    unsafe { block.set_header(block.header().with_red(red)) }
}

/// Which child slot of `parent` holds `node`.
#[inline]
unsafe fn side_of(parent: BlockPtr, node: BlockPtr) -> Dir {
    if unsafe { parent.child(Dir::Left) } == node {
        Dir::Left
    } else {
        Dir::Right
    }
}

impl RbIndex {
    /// Rotate `down` one level down in direction `dir`, promoting its
    /// opposite child.
    unsafe fn rotate(&mut self, down: BlockPtr, dir: Dir) {
        unsafe {
            let up = down.child(dir.opposite());
            let transfer = up.child(dir);

            down.set_child(dir.opposite(), transfer);
            if transfer != self.nil {
                transfer.set_parent(down);
            }

            let parent = down.parent();
            up.set_parent(parent);
            if parent == self.nil {
                self.root = up;
            } else {
                parent.set_child(side_of(parent, down), up);
            }

            up.set_child(dir, down);
            down.set_parent(up);
        }
    }

    unsafe fn insert_fixup(&mut self, mut node: BlockPtr) {
        unsafe {
            while is_red(node.parent()) {
                let parent = node.parent();
                let grand = parent.parent();
                let dir = side_of(grand, parent);
                let aunt = grand.child(dir.opposite());

                if is_red(aunt) {
                    set_red(parent, false);
                    set_red(aunt, false);
                    set_red(grand, true);
                    node = grand;
                } else {
                    if node == parent.child(dir.opposite()) {
                        node = parent;
                        self.rotate(node, dir);
                    }
                    let parent = node.parent();
                    let grand = parent.parent();
                    set_red(parent, false);
                    set_red(grand, true);
                    self.rotate(grand, dir.opposite());
                }
            }
            set_red(self.root, false);
        }
    }

    /// Replace the subtree rooted at `out` with the one rooted at `into`.
    ///
    /// `into` may be the sentinel; its parent link is still updated so that
    /// the delete fixup can walk upward from it.
    unsafe fn transplant(&mut self, out: BlockPtr, into: BlockPtr) {
        unsafe {
            let parent = out.parent();
            if parent == self.nil {
                self.root = into;
            } else {
                parent.set_child(side_of(parent, out), into);
            }
            into.set_parent(parent);
        }
    }

    unsafe fn minimum(&self, mut node: BlockPtr) -> BlockPtr {
        unsafe {
            while node.child(Dir::Left) != self.nil {
                node = node.child(Dir::Left);
            }
            node
        }
    }

    unsafe fn delete_fixup(&mut self, mut node: BlockPtr) {
        unsafe {
            while node != self.root && !is_red(node) {
                let parent = node.parent();
                let dir = side_of(parent, node);
                let mut sibling = parent.child(dir.opposite());

                if is_red(sibling) {
                    set_red(sibling, false);
                    set_red(parent, true);
                    self.rotate(parent, dir);
                    sibling = node.parent().child(dir.opposite());
                }

                if !is_red(sibling.child(Dir::Left)) && !is_red(sibling.child(Dir::Right)) {
                    set_red(sibling, true);
                    node = node.parent();
                } else {
                    if !is_red(sibling.child(dir.opposite())) {
                        set_red(sibling.child(dir), false);
                        set_red(sibling, true);
                        self.rotate(sibling, dir.opposite());
                        sibling = node.parent().child(dir.opposite());
                    }
                    let parent = node.parent();
                    set_red(sibling, is_red(parent));
                    set_red(parent, false);
                    set_red(sibling.child(dir.opposite()), false);
                    self.rotate(parent, dir);
                    node = self.root;
                }
            }
            set_red(node, false);
        }
    }

    /// Blacks on the path from `node` down to NIL (leftmost descent).
    unsafe fn black_height(&self, mut node: BlockPtr) -> usize {
        unsafe {
            let mut height = 1;
            while node != self.nil {
                if !is_red(node) {
                    height += 1;
                }
                node = node.child(Dir::Left);
            }
            height
        }
    }

    /// Verify order, colors, back-pointers, and black height below `node`;
    /// returns the subtree's black height.
    unsafe fn audit_node(
        &self,
        node: BlockPtr,
        low: usize,
        high: usize,
        tally: &mut IndexAudit,
    ) -> Result<usize, IndexAuditError> {
        unsafe {
            if node == self.nil {
                return Ok(1);
            }
            let header = node.header();
            if header.allocated() {
                return Err(IndexAuditError::AllocatedNode { at: node.addr() });
            }
            let size = header.size();
            // Rotations can carry an equal key into a left subtree, so the
            // order check is weak on both sides.
            if size < low || size > high {
                return Err(IndexAuditError::OutOfOrder { at: node.addr() });
            }

            let left = node.child(Dir::Left);
            let right = node.child(Dir::Right);
            if left != self.nil && left.parent() != node {
                return Err(IndexAuditError::ParentLink { at: left.addr() });
            }
            if right != self.nil && right.parent() != node {
                return Err(IndexAuditError::ParentLink { at: right.addr() });
            }
            if header.red() && (is_red(left) || is_red(right)) {
                return Err(IndexAuditError::RedRed { at: node.addr() });
            }

            tally.blocks += 1;
            tally.bytes += size;

            let left_height = self.audit_node(left, low, size, tally)?;
            let right_height = self.audit_node(right, size, high, tally)?;
            if left_height != right_height {
                return Err(IndexAuditError::BlackHeight {
                    at: node.addr(),
                    left: left_height,
                    right: right_height,
                });
            }
            Ok(left_height + usize::from(!header.red()))
        }
    }

    unsafe fn write_node(
        &self,
        out: &mut dyn fmt::Write,
        node: BlockPtr,
        depth: usize,
        verbose: bool,
    ) -> fmt::Result {
        unsafe {
            if node == self.nil {
                return Ok(());
            }
            for _ in 0..depth {
                out.write_str("  ")?;
            }
            let header = node.header();
            let color = if header.red() { "red" } else { "black" };
            if verbose {
                writeln!(
                    out,
                    "{} {}B {} bh={}",
                    node.addr(),
                    header.size(),
                    color,
                    self.black_height(node)
                )?;
            } else {
                writeln!(out, "{}B {}", header.size(), color)?;
            }
            self.write_node(out, node.child(Dir::Left), depth + 1, verbose)?;
            self.write_node(out, node.child(Dir::Right), depth + 1, verbose)
        }
    }
}

impl FreeIndex for RbIndex {
    unsafe fn new(nil: BlockPtr) -> Self {
        unsafe {
            nil.set_parent(nil);
            nil.set_child(Dir::Left, nil);
            nil.set_child(Dir::Right, nil);
        }
        Self {
            root: nil,
            nil,
            len: 0,
        }
    }

    unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            let nil = self.nil;
            let key = block.size();

            let mut parent = nil;
            let mut walk = self.root;
            while walk != nil {
                parent = walk;
                walk = if key < walk.size() {
                    walk.child(Dir::Left)
                } else {
                    // equal keys descend right
                    walk.child(Dir::Right)
                };
            }

            block.set_parent(parent);
            if parent == nil {
                self.root = block;
            } else if key < parent.size() {
                parent.set_child(Dir::Left, block);
            } else {
                parent.set_child(Dir::Right, block);
            }
            block.set_child(Dir::Left, nil);
            block.set_child(Dir::Right, nil);
            set_red(block, true);

            self.insert_fixup(block);
            self.len += 1;
        }
    }

    unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let nil = self.nil;
            let mut spliced_was_red = is_red(block);
            let fix_from;

            if block.child(Dir::Left) == nil {
                fix_from = block.child(Dir::Right);
                self.transplant(block, fix_from);
            } else if block.child(Dir::Right) == nil {
                fix_from = block.child(Dir::Left);
                self.transplant(block, fix_from);
            } else {
                // Splice in the in-order successor and give it the removed
                // node's color; the fixup chases the successor's old slot.
                let successor = self.minimum(block.child(Dir::Right));
                spliced_was_red = is_red(successor);
                fix_from = successor.child(Dir::Right);
                if successor.parent() == block {
                    fix_from.set_parent(successor);
                } else {
                    self.transplant(successor, successor.child(Dir::Right));
                    successor.set_child(Dir::Right, block.child(Dir::Right));
                    successor.child(Dir::Right).set_parent(successor);
                }
                self.transplant(block, successor);
                successor.set_child(Dir::Left, block.child(Dir::Left));
                successor.child(Dir::Left).set_parent(successor);
                set_red(successor, is_red(block));
            }

            if !spliced_was_red {
                self.delete_fixup(fix_from);
            }
            self.len -= 1;
        }
    }

    unsafe fn pop_best_fit(&mut self, min_block: usize) -> Option<BlockPtr> {
        unsafe {
            let nil = self.nil;
            let mut best = nil;
            let mut best_size = usize::MAX;

            let mut walk = self.root;
            while walk != nil {
                let size = walk.size();
                if size == min_block {
                    best = walk;
                    break;
                }
                if min_block < size {
                    if size < best_size {
                        best = walk;
                        best_size = size;
                    }
                    walk = walk.child(Dir::Left);
                } else {
                    walk = walk.child(Dir::Right);
                }
            }

            if best == nil {
                return None;
            }
            self.remove(best);
            Some(best)
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    unsafe fn audit(&self) -> Result<IndexAudit, IndexAuditError> {
        unsafe {
            let mut tally = IndexAudit::default();
            if self.root != self.nil {
                if is_red(self.root) {
                    return Err(IndexAuditError::RootRed {
                        at: self.root.addr(),
                    });
                }
                if self.root.parent() != self.nil {
                    return Err(IndexAuditError::ParentLink {
                        at: self.root.addr(),
                    });
                }
            }
            self.audit_node(self.root, 0, usize::MAX, &mut tally)?;
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
            if self.root == self.nil {
                return writeln!(out, "(empty)");
            }
            self.write_node(out, self.root, 0, verbose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{HeaderWord, SENTINEL_BYTES};
    use heap_addresses::SegmentAddress;

    /// Carve consecutive fake free blocks of the given sizes out of `backing`
    /// and append a sentinel; returns the blocks and the sentinel.
    fn carve(backing: &mut Vec<u64>, sizes: &[usize]) -> (Vec<BlockPtr>, BlockPtr) {
        let total: usize = sizes.iter().sum::<usize>() + SENTINEL_BYTES;
        backing.clear();
        backing.resize(total / 8, 0);

        let mut at = SegmentAddress::from_ptr(backing.as_ptr());
        let mut blocks = Vec::new();
        for &size in sizes {
            let block = BlockPtr::new(at);
            unsafe {
                block.set_header(HeaderWord::new().with_size(size));
                block.write_footer();
            }
            blocks.push(block);
            at = at.byte_add(size);
        }
        let nil = BlockPtr::new(at);
        unsafe {
            nil.set_header(HeaderWord::new().with_allocated(true));
        }
        (blocks, nil)
    }

    fn audit_ok(index: &RbIndex) -> IndexAudit {
        unsafe { index.audit() }.expect("tree invariants")
    }

    #[test]
    fn best_fit_picks_the_smallest_that_fits() {
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &[48, 64, 128]);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
        }
        assert_eq!(index.len(), 3);
        audit_ok(&index);

        let hit = unsafe { index.pop_best_fit(60) }.expect("64B block fits");
        assert_eq!(unsafe { hit.size() }, 64);

        let tally = audit_ok(&index);
        assert_eq!(tally.blocks, 2);
        assert_eq!(tally.bytes, 48 + 128);
    }

    #[test]
    fn exact_fit_short_circuits() {
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &[40, 48, 56, 64]);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
        }
        let hit = unsafe { index.pop_best_fit(56) }.expect("exact match");
        assert_eq!(unsafe { hit.size() }, 56);
        audit_ok(&index);
    }

    #[test]
    fn no_fit_returns_none_and_keeps_the_tree() {
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &[40, 48]);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
        }
        assert!(unsafe { index.pop_best_fit(64) }.is_none());
        assert_eq!(index.len(), 2);
        audit_ok(&index);
    }

    #[test]
    fn duplicate_keys_coexist_and_drain() {
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &[48, 48, 48, 48, 48]);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
            audit_ok(&index);
        }
        for expected in (1..=5).rev() {
            assert_eq!(index.len(), expected);
            let hit = unsafe { index.pop_best_fit(40) }.expect("one of the 48s");
            assert_eq!(unsafe { hit.size() }, 48);
            audit_ok(&index);
        }
        assert!(unsafe { index.pop_best_fit(40) }.is_none());
    }

    #[test]
    fn arbitrary_removal_keeps_invariants() {
        let mut backing = Vec::new();
        let sizes = [40, 56, 72, 88, 104, 120, 136, 152, 168];
        let (blocks, nil) = carve(&mut backing, &sizes);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
        }
        // Remove from the middle out, auditing every step.
        for &victim in &[blocks[4], blocks[1], blocks[7], blocks[0], blocks[8]] {
            unsafe { index.remove(victim) };
            audit_ok(&index);
        }
        assert_eq!(index.len(), 4);
        let tally = audit_ok(&index);
        assert_eq!(tally.bytes, 56 + 72 + 120 + 152);
    }

    #[test]
    fn churn_stays_balanced() {
        // Deterministic shuffle of insert/remove pairs over 64 blocks.
        let mut state: u64 = 0x243F_6A88_85A3_08D3;
        let mut next = move |bound: usize| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as usize % bound
        };

        let sizes: Vec<usize> = (1..=64).map(|i| 40 + 8 * (i % 17)).collect();
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &sizes);
        let mut index = unsafe { RbIndex::new(nil) };

        let mut inside: Vec<BlockPtr> = Vec::new();
        let mut outside: Vec<BlockPtr> = blocks;
        for _ in 0..400 {
            let grow = inside.is_empty() || (!outside.is_empty() && next(2) == 0);
            if grow {
                let block = outside.swap_remove(next(outside.len()));
                unsafe { index.insert(block) };
                inside.push(block);
            } else {
                let block = inside.swap_remove(next(inside.len()));
                unsafe { index.remove(block) };
                outside.push(block);
            }
            let tally = audit_ok(&index);
            assert_eq!(tally.blocks, inside.len());
        }
    }

    #[test]
    fn dump_lists_every_node() {
        let mut backing = Vec::new();
        let (blocks, nil) = carve(&mut backing, &[40, 64, 96]);
        let mut index = unsafe { RbIndex::new(nil) };
        for &b in &blocks {
            unsafe { index.insert(b) };
        }
        let mut plain = String::new();
        unsafe { index.write_contents(&mut plain, false) }.unwrap();
        for needle in ["40B", "64B", "96B"] {
            assert!(plain.contains(needle), "{plain}");
        }
        let mut verbose = String::new();
        unsafe { index.write_contents(&mut verbose, true) }.unwrap();
        assert!(verbose.contains("bh="));
        assert!(verbose.contains("0x"));
    }
}
