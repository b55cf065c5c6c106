//! Best-fit arena allocator with coalescing free lists.
//!
//! The user arena is one contiguous range. Free blocks are indexed twice:
//! by `(size, offset)` for best-fit allocation and by `offset` for O(log n)
//! neighbour lookup when freeing. Both indices are system-based B-trees
//! whose records are the free blocks themselves — the first 16 bytes of a
//! free block hold its `(size, self_offset)` pair.
//!
//! Allocated blocks carry an 8-byte size header; the caller sees the
//! payload offset just past it. Adjacent free blocks never coexist: every
//! free merges with both neighbours when they touch, which is also where
//! double frees and overlapping frees surface as `CorruptSegment`.

use std::mem::offset_of;

use log::warn;

use crate::btree::key::{FieldKind, KeyDef, KeyProbe};
use crate::error::{Result, VsiError};
use crate::offset::{Area, Offset};
use crate::segment::Segment;

/// Size header preceding every allocated payload.
pub(crate) const BLOCK_HEADER: u64 = 8;
/// Smallest block: must fit the free-block record.
pub(crate) const MIN_BLOCK: u64 = 16;
/// A best-fit residue below this is handed to the caller rather than
/// split into a fragment.
const MIN_SPLIT: u64 = 32;

/// Overlay on the first bytes of a free block; doubles as the record
/// both free-list trees index.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub size: u64,
    /// System-relative offset of this block itself.
    pub self_off: u64,
}

pub(crate) fn free_by_size_keydef() -> KeyDef {
    KeyDef::new(&[
        (FieldKind::U64, offset_of!(FreeBlock, size) as u32),
        (FieldKind::U64, offset_of!(FreeBlock, self_off) as u32),
    ])
}

pub(crate) fn free_by_offset_keydef() -> KeyDef {
    KeyDef::new(&[(FieldKind::U64, offset_of!(FreeBlock, self_off) as u32)])
}

/// Point-in-time allocator accounting, computed under the allocator
/// mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub arena_size: u64,
    pub free_bytes: u64,
    pub free_blocks: u64,
    pub largest_free: u64,
}

pub(crate) struct Allocator<'a> {
    seg: &'a Segment,
}

fn round_up8(v: u64) -> u64 {
    (v + 7) & !7
}

impl<'a> Allocator<'a> {
    pub fn new(seg: &'a Segment) -> Allocator<'a> {
        Allocator { seg }
    }

    /// Seed the arena with a single free block spanning it. Called once,
    /// at segment creation.
    pub fn format(&self) -> Result<()> {
        let _guard = self.seg.alloc_mutex().lock();
        unsafe { self.insert_free(self.seg.user_base_off(), self.seg.arena_size()) }
    }

    /// Allocate `n` payload bytes from the arena; returns the
    /// user-relative payload offset.
    pub fn alloc(&self, n: u64) -> Result<Offset> {
        if n == 0 {
            return Err(VsiError::InvalidArgument("zero-length allocation"));
        }
        let need = round_up8(n + BLOCK_HEADER).max(MIN_BLOCK);
        let _guard = self.seg.alloc_mutex().lock();
        unsafe {
            // Best fit: smallest free block with size >= need; the offset
            // component of the key breaks ties toward low addresses.
            let probe = KeyProbe::new().unsigned(need).unsigned(0);
            let rec = match self.seg.free_by_size().find(&probe).record()? {
                Some(rec) => rec,
                None => {
                    warn!("arena exhausted allocating {need} bytes");
                    return Err(VsiError::OutOfMemory);
                }
            };
            let fb = self.seg.ptr(Area::System, rec) as *const FreeBlock;
            let (block_off, block_size) = ((*fb).self_off, (*fb).size);
            self.remove_free(block_off, block_size)?;

            let take = if block_size - need >= MIN_SPLIT {
                self.insert_free(block_off + need, block_size - need)?;
                need
            } else {
                block_size
            };
            *(self.seg.ptr(Area::System, Offset::new(block_off)) as *mut u64) = take;
            Ok(self
                .seg
                .sys_to_user(Offset::new(block_off + BLOCK_HEADER)))
        }
    }

    /// Return a payload to the arena, merging with any touching free
    /// neighbours.
    pub fn free(&self, payload: Offset) -> Result<()> {
        if payload.is_null() {
            return Err(VsiError::InvalidArgument("null free"));
        }
        let sys = self.seg.user_to_sys(payload);
        if sys.raw() < self.seg.user_base_off() + BLOCK_HEADER || sys.raw() % 8 != 0 {
            return Err(VsiError::CorruptSegment(format!(
                "free of unaligned or out-of-arena offset {:#x}",
                sys.raw()
            )));
        }
        let block_off = sys.raw() - BLOCK_HEADER;

        let _guard = self.seg.alloc_mutex().lock();
        unsafe {
            let size = *(self.seg.ptr(Area::System, Offset::new(block_off)) as *const u64);
            if size < MIN_BLOCK || size % 8 != 0 || block_off + size > self.seg.total_size() {
                return Err(VsiError::CorruptSegment(format!(
                    "free block header at {block_off:#x} has implausible size {size}"
                )));
            }

            let mut off = block_off;
            let mut size = size;

            // Predecessor in offset order: merge when it ends where this
            // block begins; detect double frees and overlaps.
            let pred = self
                .seg
                .free_by_offset()
                .rfind(&KeyProbe::new().unsigned(off))
                .record()?;
            if let Some(rec) = pred {
                let fb = self.seg.ptr(Area::System, rec) as *const FreeBlock;
                let (p_off, p_size) = ((*fb).self_off, (*fb).size);
                if p_off == off {
                    return Err(VsiError::CorruptSegment(format!(
                        "double free of block at {off:#x}"
                    )));
                }
                if p_off + p_size > off {
                    return Err(VsiError::CorruptSegment(format!(
                        "free of {off:#x} overlaps free block at {p_off:#x}"
                    )));
                }
                if p_off + p_size == off {
                    self.remove_free(p_off, p_size)?;
                    off = p_off;
                    size += p_size;
                }
            }

            // Successor: first free block past the original offset.
            let succ = self
                .seg
                .free_by_offset()
                .find(&KeyProbe::new().unsigned(block_off + 1))
                .record()?;
            if let Some(rec) = succ {
                let fb = self.seg.ptr(Area::System, rec) as *const FreeBlock;
                let (s_off, s_size) = ((*fb).self_off, (*fb).size);
                if off + size > s_off {
                    return Err(VsiError::CorruptSegment(format!(
                        "free of {off:#x} overlaps free block at {s_off:#x}"
                    )));
                }
                if off + size == s_off {
                    self.remove_free(s_off, s_size)?;
                    size += s_size;
                }
            }

            self.insert_free(off, size)
        }
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let _guard = self.seg.alloc_mutex().lock();
        let mut stats = MemoryStats {
            arena_size: self.seg.arena_size(),
            free_bytes: 0,
            free_blocks: 0,
            largest_free: 0,
        };
        let mut it = self.seg.free_by_offset().iter_min();
        while let Some(rec) = it.record()? {
            let size = unsafe { (*(self.seg.ptr(Area::System, rec) as *const FreeBlock)).size };
            stats.free_bytes += size;
            stats.free_blocks += 1;
            stats.largest_free = stats.largest_free.max(size);
            it.advance()?;
        }
        Ok(stats)
    }

    /// Verify both free-list trees agree and no two free blocks touch.
    /// Diagnostic surface behind `dump` and the test suites.
    pub fn check_free_lists(&self) -> Result<()> {
        let _guard = self.seg.alloc_mutex().lock();
        let by_size = self.seg.free_by_size();
        let by_offset = self.seg.free_by_offset();
        if by_size.count() != by_offset.count() {
            return Err(VsiError::CorruptSegment(
                "free-list trees disagree on block count".into(),
            ));
        }
        let mut prev_end: Option<u64> = None;
        let mut it = by_offset.iter_min();
        while let Some(rec) = it.record()? {
            let fb = self.seg.ptr(Area::System, rec) as *const FreeBlock;
            let (off, size) = unsafe { ((*fb).self_off, (*fb).size) };
            if let Some(end) = prev_end {
                if end == off {
                    return Err(VsiError::CorruptSegment(format!(
                        "adjacent free blocks left uncoalesced at {off:#x}"
                    )));
                }
                if end > off {
                    return Err(VsiError::CorruptSegment(format!(
                        "overlapping free blocks at {off:#x}"
                    )));
                }
            }
            let probe = KeyProbe::new().unsigned(size).unsigned(off);
            if by_size.search(&probe).is_none() {
                return Err(VsiError::CorruptSegment(format!(
                    "free block at {off:#x} missing from the size index"
                )));
            }
            prev_end = Some(off + size);
            it.advance()?;
        }
        Ok(())
    }

    unsafe fn insert_free(&self, off: u64, size: u64) -> Result<()> {
        let fb = self.seg.ptr(Area::System, Offset::new(off)) as *mut FreeBlock;
        (*fb).size = size;
        (*fb).self_off = off;
        self.seg.free_by_size().insert(Offset::new(off))?;
        self.seg.free_by_offset().insert(Offset::new(off))?;
        Ok(())
    }

    unsafe fn remove_free(&self, off: u64, size: u64) -> Result<()> {
        let size_probe = KeyProbe::new().unsigned(size).unsigned(off);
        if self.seg.free_by_size().remove(&size_probe)?.is_none() {
            return Err(VsiError::CorruptSegment(format!(
                "free block at {off:#x} missing from the size index"
            )));
        }
        let off_probe = KeyProbe::new().unsigned(off);
        if self.seg.free_by_offset().remove(&off_probe)?.is_none() {
            return Err(VsiError::CorruptSegment(format!(
                "free block at {off:#x} missing from the offset index"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::test_config;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn segment() -> (tempfile::TempDir, Segment) {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&test_config(&dir)).unwrap();
        (dir, seg)
    }

    #[test]
    fn fresh_arena_is_one_block() {
        let (_dir, seg) = segment();
        let stats = Allocator::new(&seg).stats().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, seg.arena_size());
        assert_eq!(stats.largest_free, seg.arena_size());
    }

    #[test]
    fn alloc_free_restores_stats() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        let before = alloc.stats().unwrap();
        let a = alloc.alloc(100).unwrap();
        let b = alloc.alloc(5000).unwrap();
        let mid = alloc.stats().unwrap();
        // Free + allocated always accounts for the whole arena: the
        // requests round up to 112 and 5008 bytes including headers.
        assert_eq!(mid.free_bytes, before.free_bytes - 112 - 5008);
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.stats().unwrap(), before);
        alloc.check_free_lists().unwrap();
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        let a = alloc.alloc(64).unwrap();
        let b = alloc.alloc(64).unwrap();
        let c = alloc.alloc(64).unwrap();
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        // The hole between a and c closes when b goes.
        alloc.free(b).unwrap();
        let stats = alloc.stats().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, seg.arena_size());
    }

    #[test]
    fn double_free_is_detected() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        let a = alloc.alloc(64).unwrap();
        let _b = alloc.alloc(64).unwrap();
        alloc.free(a).unwrap();
        assert!(matches!(alloc.free(a), Err(VsiError::CorruptSegment(_))));
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        let small = alloc.alloc(64).unwrap();
        let _keep1 = alloc.alloc(8).unwrap();
        let large = alloc.alloc(4096).unwrap();
        let _keep2 = alloc.alloc(8).unwrap();
        alloc.free(small).unwrap();
        alloc.free(large).unwrap();
        // A 64-byte request must land in the 64-byte hole, not the big one.
        let again = alloc.alloc(64).unwrap();
        assert_eq!(again, small);
        alloc.check_free_lists().unwrap();
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        assert!(matches!(
            alloc.alloc(seg.arena_size() * 2),
            Err(VsiError::OutOfMemory)
        ));
    }

    #[test]
    fn random_pressure_returns_arena_to_one_block() {
        let (_dir, seg) = segment();
        let alloc = Allocator::new(&seg);
        let mut rng = rand::thread_rng();
        let mut live = Vec::new();
        for _ in 0..50 {
            let n = rng.gen_range(1..64);
            live.push(alloc.alloc(n).unwrap());
        }
        alloc.check_free_lists().unwrap();
        live.shuffle(&mut rng);
        for off in live {
            alloc.free(off).unwrap();
        }
        let stats = alloc.stats().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, seg.arena_size());
        alloc.check_free_lists().unwrap();
    }
}
