//! Stateful in-order iterators.
//!
//! An iterator is process-local: it holds a node offset and a slot index,
//! never pointers. It snapshots the tree's generation counter when
//! positioned; any structural mutation afterwards makes every operation
//! on it fail with `StaleIterator` rather than walk freed nodes.

use crate::error::{Result, VsiError};
use crate::offset::Offset;

use super::Btree;

pub(crate) struct BtreeIter<'a> {
    tree: Btree<'a>,
    node: Offset,
    idx: u32,
    generation: u64,
}

impl<'a> BtreeIter<'a> {
    pub(super) fn at(tree: Btree<'a>, node: Offset, idx: u32) -> BtreeIter<'a> {
        let generation = unsafe { (*tree.header()).generation };
        BtreeIter {
            tree,
            node,
            idx,
            generation,
        }
    }

    pub(super) fn end(tree: Btree<'a>) -> BtreeIter<'a> {
        Self::at(tree, Offset::NULL, 0)
    }

    pub fn at_end(&self) -> bool {
        self.node.is_null()
    }

    fn check_generation(&self) -> Result<()> {
        if unsafe { (*self.tree.header()).generation } != self.generation {
            return Err(VsiError::StaleIterator);
        }
        Ok(())
    }

    /// The record at the current position; `None` at end.
    pub fn record(&self) -> Result<Option<Offset>> {
        if self.at_end() {
            return Ok(None);
        }
        let _guard = self.tree.mutex().lock();
        self.check_generation()?;
        unsafe {
            let node = self.tree.node(self.node);
            Ok(Some(self.tree.rec_at(node, self.idx as usize)))
        }
    }

    /// Step to the in-order successor; past the maximum the iterator
    /// becomes the end iterator and stays there.
    pub fn advance(&mut self) -> Result<()> {
        if self.at_end() {
            return Ok(());
        }
        let _guard = self.tree.mutex().lock();
        self.check_generation()?;
        unsafe {
            let node = self.tree.node(self.node);
            if (*node).level > 0 {
                // Successor of an internal slot: minimum of the right
                // subtree.
                let mut cur = self.tree.child_at(node, self.idx as usize + 1);
                while (*self.tree.node(cur)).level > 0 {
                    cur = self.tree.child_at(self.tree.node(cur), 0);
                }
                self.node = cur;
                self.idx = 0;
                return Ok(());
            }
            if self.idx + 1 < (*node).keys_in_use {
                self.idx += 1;
                return Ok(());
            }
            // Leaf exhausted to the right: ascend to the nearest ancestor
            // whose key range continues past the current subtree.
            let mut child = self.node;
            let mut parent = (*node).parent;
            while !parent.is_null() {
                let p = self.tree.node(parent);
                let pos = self.tree.child_index_of(p, child);
                if pos < (*p).keys_in_use as usize {
                    self.node = parent;
                    self.idx = pos as u32;
                    return Ok(());
                }
                child = parent;
                parent = (*p).parent;
            }
            self.node = Offset::NULL;
            self.idx = 0;
            Ok(())
        }
    }

    /// Step to the in-order predecessor; before the minimum the iterator
    /// becomes the end iterator and stays there.
    pub fn retreat(&mut self) -> Result<()> {
        if self.at_end() {
            return Ok(());
        }
        let _guard = self.tree.mutex().lock();
        self.check_generation()?;
        unsafe {
            let node = self.tree.node(self.node);
            if (*node).level > 0 {
                // Predecessor of an internal slot: maximum of the left
                // subtree.
                let mut cur = self.tree.child_at(node, self.idx as usize);
                loop {
                    let n = self.tree.node(cur);
                    if (*n).level == 0 {
                        break;
                    }
                    cur = self.tree.child_at(n, (*n).keys_in_use as usize);
                }
                self.node = cur;
                self.idx = (*self.tree.node(cur)).keys_in_use - 1;
                return Ok(());
            }
            if self.idx > 0 {
                self.idx -= 1;
                return Ok(());
            }
            let mut child = self.node;
            let mut parent = (*node).parent;
            while !parent.is_null() {
                let p = self.tree.node(parent);
                let pos = self.tree.child_index_of(p, child);
                if pos > 0 {
                    self.node = parent;
                    self.idx = (pos - 1) as u32;
                    return Ok(());
                }
                child = parent;
                parent = (*p).parent;
            }
            self.node = Offset::NULL;
            self.idx = 0;
            Ok(())
        }
    }
}
