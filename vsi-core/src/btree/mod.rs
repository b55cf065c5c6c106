//! Position-independent, locked B-tree.
//!
//! The tree is the ordered map of the segment: the allocator keeps its two
//! free-block indices in it and the signal store uses it for every
//! directory. Records are offsets of caller-owned structures; the tree
//! never looks inside them except through the key definition.
//!
//! # Shape
//!
//! Cormen-style B-tree of minimum degree `t = (max + 1) / 2` with `max`
//! odd. Inserts split full nodes top-down; deletes rebalance preventively
//! on the way down, so neither ever revisits the path. Nodes are fixed
//! size: a small header plus the record and child arrays allocated in the
//! same block.
//!
//! ```text
//! ┌────────────────────────┬───────────────────┬─────────────────────┐
//! │ BtreeNode header       │ records           │ children            │
//! │ next/parent/keys/level │ max × 8 bytes     │ (max + 1) × 8 bytes │
//! └────────────────────────┴───────────────────┴─────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! One process-shared mutex per tree wraps every public operation.
//! Iterators are process-local and carry the tree's generation counter;
//! any structural mutation bumps it and later iterator use fails with
//! `StaleIterator`.

pub(crate) mod iter;
pub(crate) mod key;

use std::cmp::Ordering;
use std::mem::size_of;

use crate::alloc::Allocator;
use crate::error::{Result, VsiError};
use crate::offset::{Area, Offset};
use crate::segment::Segment;
use crate::sync::SharedMutex;

use iter::BtreeIter;
use key::{KeyDef, KeyProbe};

/// Records per node for every tree in the segment. Odd, per the split
/// arithmetic; [`Btree::init_header`] bumps even values.
pub(crate) const NODE_MAX_RECORDS: u32 = 21;

/// Per-tree control block, embedded in the segment header for the six
/// root trees.
#[repr(C)]
pub(crate) struct BtreeHeader {
    pub mutex: SharedMutex,
    pub max_records: u32,
    pub min_records: u32,
    /// Minimum degree `t`; non-root nodes hold `t-1 ..= 2t-1` records.
    pub t: u32,
    /// `Area` discriminant all of this tree's offsets are relative to.
    pub area: u32,
    pub node_size: u64,
    pub count: u64,
    pub root: Offset,
    /// System-relative offset of the tree's [`KeyDef`].
    pub key_def: Offset,
    /// Bumped by every structural mutation; iterators snapshot it.
    pub generation: u64,
}

/// Node header. The record and child arrays live in the same allocation,
/// directly after this header; `records` and `children` hold their
/// area-relative offsets.
#[repr(C)]
pub(crate) struct BtreeNode {
    /// Reserved intrusive link for traversal chains.
    pub next: Offset,
    pub parent: Offset,
    pub keys_in_use: u32,
    /// 0 = leaf; the root's level is the tree height.
    pub level: u32,
    pub records: Offset,
    pub children: Offset,
}

const NODE_HEADER_SIZE: u64 = size_of::<BtreeNode>() as u64;

/// Handle on one tree: the segment it lives in plus its control block.
#[derive(Clone, Copy)]
pub(crate) struct Btree<'a> {
    seg: &'a Segment,
    hdr: *mut BtreeHeader,
}

impl<'a> Btree<'a> {
    pub fn new(seg: &'a Segment, hdr: *mut BtreeHeader) -> Btree<'a> {
        Btree { seg, hdr }
    }

    pub fn node_size_for(max: u32) -> u64 {
        NODE_HEADER_SIZE + (max as u64) * 8 + (max as u64 + 1) * 8
    }

    /// Initialise a control block in place. Called once per tree, at
    /// segment creation.
    ///
    /// # Safety
    /// `hdr` must point at writable segment memory not yet shared.
    pub unsafe fn init_header(
        hdr: *mut BtreeHeader,
        max: u32,
        area: Area,
        key_def: Offset,
    ) -> Result<()> {
        let max = if max % 2 == 0 { max + 1 } else { max };
        let t = (max + 1) / 2;
        SharedMutex::init(std::ptr::addr_of_mut!((*hdr).mutex))?;
        (*hdr).max_records = max;
        (*hdr).min_records = t - 1;
        (*hdr).t = t;
        (*hdr).area = area as u32;
        (*hdr).node_size = Self::node_size_for(max);
        (*hdr).count = 0;
        (*hdr).root = Offset::NULL;
        (*hdr).key_def = key_def;
        (*hdr).generation = 0;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        let _guard = self.mutex().lock();
        unsafe { (*self.hdr).count }
    }

    // ---- public operations -------------------------------------------

    /// Insert the record at `record`. Duplicate keys are accepted; equal
    /// records land to the right of their peers.
    pub fn insert(&self, record: Offset) -> Result<()> {
        let _guard = self.mutex().lock();
        unsafe {
            if (*self.hdr).root.is_null() {
                let root = self.alloc_node(0)?;
                let node = self.node(root);
                self.set_rec(node, 0, record);
                (*node).keys_in_use = 1;
                (*self.hdr).root = root;
            } else {
                let mut top = (*self.hdr).root;
                if (*self.node(top)).keys_in_use == (*self.hdr).max_records {
                    let old_root = top;
                    let new_root = self.alloc_node((*self.node(old_root)).level + 1)?;
                    self.set_child(self.node(new_root), 0, old_root);
                    if let Err(err) = self.split_child(new_root, 0) {
                        self.free_node(new_root)?;
                        return Err(err);
                    }
                    (*self.node(old_root)).parent = new_root;
                    (*self.hdr).root = new_root;
                    top = new_root;
                }
                self.insert_nonfull(top, record)?;
            }
            (*self.hdr).count += 1;
            (*self.hdr).generation += 1;
        }
        Ok(())
    }

    /// Delete one record matching `probe`; returns its offset, or `None`
    /// when no record matches.
    pub fn remove(&self, probe: &KeyProbe<'_>) -> Result<Option<Offset>> {
        let _guard = self.mutex().lock();
        unsafe {
            if (*self.hdr).root.is_null() {
                return Ok(None);
            }
            let removed = self.delete_from((*self.hdr).root, probe)?;
            let root_off = (*self.hdr).root;
            if !root_off.is_null() {
                let root = self.node(root_off);
                if (*root).keys_in_use == 0 {
                    if (*root).level == 0 {
                        (*self.hdr).root = Offset::NULL;
                    } else {
                        let child = self.child_at(root, 0);
                        (*self.node(child)).parent = Offset::NULL;
                        (*self.hdr).root = child;
                    }
                    self.free_node(root_off)?;
                }
            }
            if removed.is_some() {
                (*self.hdr).count -= 1;
                (*self.hdr).generation += 1;
            }
            Ok(removed)
        }
    }

    /// Locate a record matching `probe`. With duplicates present, the
    /// leftmost match is returned.
    pub fn search(&self, probe: &KeyProbe<'_>) -> Option<Offset> {
        let _guard = self.mutex().lock();
        unsafe {
            let mut cur = (*self.hdr).root;
            while !cur.is_null() {
                let node = self.node(cur);
                let n = (*node).keys_in_use as usize;
                let idx = self.lower_bound(node, probe);
                if idx < n && self.cmp_probe(probe, self.rec_at(node, idx)) == Ordering::Equal {
                    return Some(self.rec_at(node, idx));
                }
                if (*node).level == 0 {
                    return None;
                }
                cur = self.child_at(node, idx);
            }
            None
        }
    }

    pub fn min(&self) -> Option<Offset> {
        let _guard = self.mutex().lock();
        unsafe {
            let leaf = self.leftmost_leaf((*self.hdr).root)?;
            Some(self.rec_at(self.node(leaf), 0))
        }
    }

    pub fn max(&self) -> Option<Offset> {
        let _guard = self.mutex().lock();
        unsafe {
            let leaf = self.rightmost_leaf((*self.hdr).root)?;
            let node = self.node(leaf);
            Some(self.rec_at(node, (*node).keys_in_use as usize - 1))
        }
    }

    /// Iterator positioned at the smallest record.
    pub fn iter_min(&self) -> BtreeIter<'a> {
        let _guard = self.mutex().lock();
        unsafe {
            match self.leftmost_leaf((*self.hdr).root) {
                Some(leaf) => BtreeIter::at(*self, leaf, 0),
                None => BtreeIter::end(*self),
            }
        }
    }

    /// Iterator positioned at the smallest record `>= probe`; at end when
    /// every record is smaller.
    pub fn find(&self, probe: &KeyProbe<'_>) -> BtreeIter<'a> {
        let _guard = self.mutex().lock();
        unsafe {
            let mut best: Option<(Offset, u32)> = None;
            let mut cur = (*self.hdr).root;
            while !cur.is_null() {
                let node = self.node(cur);
                let n = (*node).keys_in_use as usize;
                let idx = self.lower_bound(node, probe);
                if idx < n {
                    best = Some((cur, idx as u32));
                }
                if (*node).level == 0 {
                    break;
                }
                cur = self.child_at(node, idx);
            }
            match best {
                Some((node, idx)) => BtreeIter::at(*self, node, idx),
                None => BtreeIter::end(*self),
            }
        }
    }

    /// Iterator positioned at the largest record `<= probe`; at end when
    /// every record is larger.
    pub fn rfind(&self, probe: &KeyProbe<'_>) -> BtreeIter<'a> {
        let _guard = self.mutex().lock();
        unsafe {
            let mut best: Option<(Offset, u32)> = None;
            let mut cur = (*self.hdr).root;
            while !cur.is_null() {
                let node = self.node(cur);
                let idx = self.upper_bound_probe(node, probe);
                if idx > 0 {
                    best = Some((cur, idx as u32 - 1));
                }
                if (*node).level == 0 {
                    break;
                }
                cur = self.child_at(node, idx);
            }
            match best {
                Some((node, idx)) => BtreeIter::at(*self, node, idx),
                None => BtreeIter::end(*self),
            }
        }
    }

    /// Walk the whole tree verifying the structural invariants: record
    /// counts per node, level uniformity, parent links, and in-order key
    /// ordering. Diagnostic surface behind `dump` and the test suites.
    pub fn check_invariants(&self) -> Result<()> {
        let _guard = self.mutex().lock();
        unsafe {
            let root = (*self.hdr).root;
            if root.is_null() {
                if (*self.hdr).count != 0 {
                    return Err(self.corrupt("empty tree with non-zero count"));
                }
                return Ok(());
            }
            let mut prev: Option<Offset> = None;
            let mut seen = 0u64;
            self.check_node(root, Offset::NULL, true, &mut prev, &mut seen)?;
            if seen != (*self.hdr).count {
                return Err(self.corrupt("record count does not match traversal"));
            }
            Ok(())
        }
    }

    unsafe fn check_node(
        &self,
        off: Offset,
        parent: Offset,
        is_root: bool,
        prev: &mut Option<Offset>,
        seen: &mut u64,
    ) -> Result<()> {
        let node = self.node(off);
        let n = (*node).keys_in_use as usize;
        let min = if is_root { 1 } else { (*self.hdr).min_records as usize };
        if n < min || n > (*self.hdr).max_records as usize {
            return Err(self.corrupt("node record count out of bounds"));
        }
        if (*node).parent != parent {
            return Err(self.corrupt("parent link broken"));
        }
        for i in 0..=n {
            if (*node).level > 0 {
                let child = self.child_at(node, i);
                if child.is_null() {
                    return Err(self.corrupt("missing child"));
                }
                if (*self.node(child)).level != (*node).level - 1 {
                    return Err(self.corrupt("child level mismatch"));
                }
                self.check_node(child, off, false, prev, seen)?;
            }
            if i < n {
                let rec = self.rec_at(node, i);
                if let Some(p) = *prev {
                    if self.cmp_recs(p, rec) == Ordering::Greater {
                        return Err(self.corrupt("records out of order"));
                    }
                }
                *prev = Some(rec);
                *seen += 1;
            }
        }
        Ok(())
    }

    // ---- internals ---------------------------------------------------

    pub(super) fn header(&self) -> *mut BtreeHeader {
        self.hdr
    }

    pub(super) fn mutex(&self) -> &'a SharedMutex {
        unsafe { &(*self.hdr).mutex }
    }

    pub(super) fn area(&self) -> Area {
        let raw = unsafe { (*self.hdr).area };
        Area::from_raw(raw).unwrap_or_else(|| panic!("vsi: invalid tree area {raw}"))
    }

    fn key_def(&self) -> *const KeyDef {
        unsafe { self.seg.ptr(Area::System, (*self.hdr).key_def) as *const KeyDef }
    }

    fn corrupt(&self, what: &str) -> VsiError {
        VsiError::CorruptSegment(format!("btree: {what}"))
    }

    pub(super) fn node(&self, off: Offset) -> *mut BtreeNode {
        self.seg.ptr(self.area(), off) as *mut BtreeNode
    }

    fn rec_ptr(&self, rec: Offset) -> *const u8 {
        self.seg.ptr(self.area(), rec) as *const u8
    }

    pub(super) unsafe fn rec_at(&self, node: *mut BtreeNode, i: usize) -> Offset {
        let arr = self.seg.ptr(self.area(), (*node).records) as *const Offset;
        *arr.add(i)
    }

    unsafe fn set_rec(&self, node: *mut BtreeNode, i: usize, rec: Offset) {
        let arr = self.seg.ptr(self.area(), (*node).records) as *mut Offset;
        *arr.add(i) = rec;
    }

    pub(super) unsafe fn child_at(&self, node: *mut BtreeNode, i: usize) -> Offset {
        let arr = self.seg.ptr(self.area(), (*node).children) as *const Offset;
        *arr.add(i)
    }

    unsafe fn set_child(&self, node: *mut BtreeNode, i: usize, child: Offset) {
        let arr = self.seg.ptr(self.area(), (*node).children) as *mut Offset;
        *arr.add(i) = child;
    }

    /// Index of `child` within `parent`'s child array.
    pub(super) unsafe fn child_index_of(&self, parent: *mut BtreeNode, child: Offset) -> usize {
        let n = (*parent).keys_in_use as usize;
        for i in 0..=n {
            if self.child_at(parent, i) == child {
                return i;
            }
        }
        panic!("vsi segment corrupted: btree child not linked to its parent");
    }

    pub(super) unsafe fn cmp_probe(&self, probe: &KeyProbe<'_>, rec: Offset) -> Ordering {
        key::compare_probe(self.seg, self.area(), &*self.key_def(), probe, self.rec_ptr(rec))
    }

    unsafe fn cmp_recs(&self, a: Offset, b: Offset) -> Ordering {
        key::compare_records(
            self.seg,
            self.area(),
            &*self.key_def(),
            self.rec_ptr(a),
            self.rec_ptr(b),
        )
    }

    /// First index whose record is `>= probe`.
    unsafe fn lower_bound(&self, node: *mut BtreeNode, probe: &KeyProbe<'_>) -> usize {
        let n = (*node).keys_in_use as usize;
        for i in 0..n {
            if self.cmp_probe(probe, self.rec_at(node, i)) != Ordering::Greater {
                return i;
            }
        }
        n
    }

    /// First index whose record is strictly `> probe`.
    unsafe fn upper_bound_probe(&self, node: *mut BtreeNode, probe: &KeyProbe<'_>) -> usize {
        let n = (*node).keys_in_use as usize;
        for i in 0..n {
            if self.cmp_probe(probe, self.rec_at(node, i)) == Ordering::Less {
                return i;
            }
        }
        n
    }

    /// First index whose record is strictly greater than `rec`; equal
    /// records sort left of the insertion point.
    unsafe fn upper_bound_rec(&self, node: *mut BtreeNode, rec: Offset) -> usize {
        let n = (*node).keys_in_use as usize;
        for i in 0..n {
            if self.cmp_recs(rec, self.rec_at(node, i)) == Ordering::Less {
                return i;
            }
        }
        n
    }

    unsafe fn leftmost_leaf(&self, from: Offset) -> Option<Offset> {
        if from.is_null() {
            return None;
        }
        let mut cur = from;
        while (*self.node(cur)).level > 0 {
            cur = self.child_at(self.node(cur), 0);
        }
        Some(cur)
    }

    unsafe fn rightmost_leaf(&self, from: Offset) -> Option<Offset> {
        if from.is_null() {
            return None;
        }
        let mut cur = from;
        loop {
            let node = self.node(cur);
            if (*node).level == 0 {
                return Some(cur);
            }
            cur = self.child_at(node, (*node).keys_in_use as usize);
        }
    }

    unsafe fn alloc_node(&self, level: u32) -> Result<Offset> {
        let node_size = (*self.hdr).node_size;
        let max = (*self.hdr).max_records as u64;
        let off = match self.area() {
            Area::System => self.seg.pool_alloc()?,
            Area::User => Allocator::new(self.seg).alloc(node_size)?,
        };
        let base = self.seg.ptr(self.area(), off);
        std::ptr::write_bytes(base, 0, node_size as usize);
        let node = base as *mut BtreeNode;
        (*node).level = level;
        (*node).records = off + NODE_HEADER_SIZE;
        (*node).children = off + NODE_HEADER_SIZE + max * 8;
        Ok(off)
    }

    unsafe fn free_node(&self, off: Offset) -> Result<()> {
        match self.area() {
            Area::System => {
                self.seg.pool_free(off);
                Ok(())
            }
            Area::User => Allocator::new(self.seg).free(off),
        }
    }

    /// Split the full child at `parent.children[i]`, lifting its median
    /// record into the parent. The parent must not be full.
    unsafe fn split_child(&self, parent_off: Offset, i: usize) -> Result<()> {
        let t = (*self.hdr).t as usize;
        let parent = self.node(parent_off);
        let child_off = self.child_at(parent, i);
        let child = self.node(child_off);
        let sibling_off = self.alloc_node((*child).level)?;
        let sibling = self.node(sibling_off);

        // Upper t-1 records move to the new right sibling.
        for j in 0..t - 1 {
            self.set_rec(sibling, j, self.rec_at(child, j + t));
        }
        (*sibling).keys_in_use = (t - 1) as u32;
        if (*child).level > 0 {
            for j in 0..t {
                let moved = self.child_at(child, j + t);
                self.set_child(sibling, j, moved);
                (*self.node(moved)).parent = sibling_off;
            }
        }
        (*child).keys_in_use = (t - 1) as u32;

        // Open a slot in the parent for the median and the new child.
        let pk = (*parent).keys_in_use as usize;
        for j in (i + 1..=pk).rev() {
            let c = self.child_at(parent, j);
            self.set_child(parent, j + 1, c);
        }
        for j in (i..pk).rev() {
            let r = self.rec_at(parent, j);
            self.set_rec(parent, j + 1, r);
        }
        self.set_child(parent, i + 1, sibling_off);
        self.set_rec(parent, i, self.rec_at(child, t - 1));
        (*parent).keys_in_use += 1;
        (*sibling).parent = parent_off;
        Ok(())
    }

    unsafe fn insert_nonfull(&self, mut node_off: Offset, record: Offset) -> Result<()> {
        loop {
            let node = self.node(node_off);
            let n = (*node).keys_in_use as usize;
            if (*node).level == 0 {
                let pos = self.upper_bound_rec(node, record);
                for j in (pos..n).rev() {
                    let r = self.rec_at(node, j);
                    self.set_rec(node, j + 1, r);
                }
                self.set_rec(node, pos, record);
                (*node).keys_in_use += 1;
                return Ok(());
            }
            let mut i = self.upper_bound_rec(node, record);
            if (*self.node(self.child_at(node, i))).keys_in_use == (*self.hdr).max_records {
                self.split_child(node_off, i)?;
                if self.cmp_recs(record, self.rec_at(node, i)) != Ordering::Less {
                    i += 1;
                }
            }
            node_off = self.child_at(node, i);
        }
    }

    unsafe fn remove_at(&self, node: *mut BtreeNode, idx: usize) -> Offset {
        let n = (*node).keys_in_use as usize;
        let rec = self.rec_at(node, idx);
        for j in idx..n - 1 {
            let r = self.rec_at(node, j + 1);
            self.set_rec(node, j, r);
        }
        (*node).keys_in_use -= 1;
        rec
    }

    unsafe fn subtree_max_record(&self, from: Offset) -> Offset {
        let leaf = self
            .rightmost_leaf(from)
            .unwrap_or_else(|| panic!("vsi segment corrupted: empty btree subtree"));
        let node = self.node(leaf);
        self.rec_at(node, (*node).keys_in_use as usize - 1)
    }

    unsafe fn subtree_min_record(&self, from: Offset) -> Offset {
        let leaf = self
            .leftmost_leaf(from)
            .unwrap_or_else(|| panic!("vsi segment corrupted: empty btree subtree"));
        self.rec_at(self.node(leaf), 0)
    }

    /// Merge `children[i+1]` and the separator `records[i]` into
    /// `children[i]`, freeing the right node. Both children hold `t-1`
    /// records on entry.
    unsafe fn merge_children(&self, parent_off: Offset, i: usize) -> Result<()> {
        let t = (*self.hdr).t as usize;
        let parent = self.node(parent_off);
        let left_off = self.child_at(parent, i);
        let right_off = self.child_at(parent, i + 1);
        let left = self.node(left_off);
        let right = self.node(right_off);

        self.set_rec(left, t - 1, self.rec_at(parent, i));
        for j in 0..t - 1 {
            self.set_rec(left, t + j, self.rec_at(right, j));
        }
        if (*left).level > 0 {
            for j in 0..t {
                let moved = self.child_at(right, j);
                self.set_child(left, t + j, moved);
                (*self.node(moved)).parent = left_off;
            }
        }
        (*left).keys_in_use = (2 * t - 1) as u32;

        let pk = (*parent).keys_in_use as usize;
        for j in i..pk - 1 {
            let r = self.rec_at(parent, j + 1);
            self.set_rec(parent, j, r);
        }
        for j in i + 1..pk {
            let c = self.child_at(parent, j + 1);
            self.set_child(parent, j, c);
        }
        (*parent).keys_in_use -= 1;
        self.free_node(right_off)
    }

    /// Bring `children[i]` up to at least `t` records by borrowing from a
    /// sibling or merging with one. Returns the index the target child
    /// ended up at (merging with the left sibling shifts it).
    unsafe fn fill_child(&self, parent_off: Offset, i: usize) -> Result<usize> {
        let t = (*self.hdr).t as usize;
        let parent = self.node(parent_off);
        let pk = (*parent).keys_in_use as usize;
        let child_off = self.child_at(parent, i);
        let child = self.node(child_off);

        if i > 0 {
            let left_off = self.child_at(parent, i - 1);
            let left = self.node(left_off);
            if (*left).keys_in_use as usize >= t {
                // Rotate right: separator drops into the child, the left
                // sibling's last record replaces it.
                let cn = (*child).keys_in_use as usize;
                for j in (0..cn).rev() {
                    let r = self.rec_at(child, j);
                    self.set_rec(child, j + 1, r);
                }
                self.set_rec(child, 0, self.rec_at(parent, i - 1));
                if (*child).level > 0 {
                    for j in (0..=cn).rev() {
                        let c = self.child_at(child, j);
                        self.set_child(child, j + 1, c);
                    }
                    let moved = self.child_at(left, (*left).keys_in_use as usize);
                    self.set_child(child, 0, moved);
                    (*self.node(moved)).parent = child_off;
                }
                (*child).keys_in_use += 1;
                let ln = (*left).keys_in_use as usize;
                self.set_rec(parent, i - 1, self.rec_at(left, ln - 1));
                (*left).keys_in_use -= 1;
                return Ok(i);
            }
        }
        if i < pk {
            let right_off = self.child_at(parent, i + 1);
            let right = self.node(right_off);
            if (*right).keys_in_use as usize >= t {
                // Rotate left: separator appends to the child, the right
                // sibling's first record replaces it.
                let cn = (*child).keys_in_use as usize;
                self.set_rec(child, cn, self.rec_at(parent, i));
                self.set_rec(parent, i, self.rec_at(right, 0));
                if (*child).level > 0 {
                    let moved = self.child_at(right, 0);
                    self.set_child(child, cn + 1, moved);
                    (*self.node(moved)).parent = child_off;
                }
                (*child).keys_in_use += 1;
                let rn = (*right).keys_in_use as usize;
                for j in 0..rn - 1 {
                    let r = self.rec_at(right, j + 1);
                    self.set_rec(right, j, r);
                }
                if (*right).level > 0 {
                    for j in 0..rn {
                        let c = self.child_at(right, j + 1);
                        self.set_child(right, j, c);
                    }
                }
                (*right).keys_in_use -= 1;
                return Ok(i);
            }
        }
        if i < pk {
            self.merge_children(parent_off, i)?;
            Ok(i)
        } else {
            self.merge_children(parent_off, i - 1)?;
            Ok(i - 1)
        }
    }

    /// Cormen top-down delete. Every internal node visited on the way
    /// down is fixed up to hold at least `t` records before descending.
    unsafe fn delete_from(&self, node_off: Offset, probe: &KeyProbe<'_>) -> Result<Option<Offset>> {
        let t = (*self.hdr).t as usize;
        let node = self.node(node_off);
        let n = (*node).keys_in_use as usize;
        let idx = self.lower_bound(node, probe);
        let found = idx < n && self.cmp_probe(probe, self.rec_at(node, idx)) == Ordering::Equal;

        if (*node).level == 0 {
            if !found {
                return Ok(None);
            }
            return Ok(Some(self.remove_at(node, idx)));
        }

        if found {
            let rec = self.rec_at(node, idx);
            let left_off = self.child_at(node, idx);
            let right_off = self.child_at(node, idx + 1);
            if (*self.node(left_off)).keys_in_use as usize >= t {
                // Swap with the in-order predecessor, then delete it from
                // the left subtree by its own key.
                let pred = self.subtree_max_record(left_off);
                let pred_key =
                    key::extract_owned(self.seg, self.area(), &*self.key_def(), self.rec_ptr(pred));
                self.set_rec(node, idx, pred);
                self.delete_from(left_off, &pred_key.probe())?;
                return Ok(Some(rec));
            }
            if (*self.node(right_off)).keys_in_use as usize >= t {
                let succ = self.subtree_min_record(right_off);
                let succ_key =
                    key::extract_owned(self.seg, self.area(), &*self.key_def(), self.rec_ptr(succ));
                self.set_rec(node, idx, succ);
                self.delete_from(right_off, &succ_key.probe())?;
                return Ok(Some(rec));
            }
            // Both neighbours are minimal: merge them around the target
            // record and continue in the merged child.
            self.merge_children(node_off, idx)?;
            return self.delete_from(left_off, probe);
        }

        let mut ci = idx;
        if ((*self.node(self.child_at(node, ci))).keys_in_use as usize) < t {
            ci = self.fill_child(node_off, ci)?;
        }
        let child = self.child_at(self.node(node_off), ci);
        self.delete_from(child, probe)
    }
}
