//! The memory-mapped segment.
//!
//! One file per deployment, mapped by every participating process. The
//! header at offset 0 is the root of everything: it carries the magic,
//! the allocator mutex, the system node pool, and the control blocks of
//! all six B-trees. Nothing in the segment is a native pointer.
//!
//! # Memory layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SegmentHeader                                                │
//! │   magic / version / sizes                                    │
//! │   allocator mutex + system node pool state                   │
//! │   free-by-size + free-by-offset control blocks and key defs  │
//! │   signal/name/private/group control blocks and key defs     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ System node pool (fixed chunks for the free-list tree nodes) │
//! ├──────────────────────────────────────────────────────────────┤
//! │ User arena (allocator-managed: records, queues, payloads,    │
//! │ directory tree nodes, name strings)                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::fs::OpenOptions;
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::addr_of_mut;

use log::{error, info};
use memmap2::{MmapMut, MmapOptions};

use crate::alloc::{self, Allocator};
use crate::btree::key::KeyDef;
use crate::btree::{Btree, BtreeHeader, NODE_MAX_RECORDS};
use crate::config::VsiConfig;
use crate::error::{Result, VsiError};
use crate::group;
use crate::offset::{Area, Offset};
use crate::store;
use crate::sync::SharedMutex;

pub(crate) const VSI_MAGIC: [u8; 8] = *b"VSISEG\0\0";
pub(crate) const VSI_VERSION: u32 = 1;

/// Fixed-chunk arena for the allocator's own B-tree nodes. Breaking the
/// bootstrap cycle is its whole job: the free-list trees cannot allocate
/// their nodes from the allocator they implement. Guarded by the
/// allocator mutex.
#[repr(C)]
pub(crate) struct NodePool {
    pub chunk_size: u64,
    /// Next never-used chunk (system-relative).
    pub bump: u64,
    pub end: u64,
    /// Intrusive LIFO of returned chunks; first 8 bytes of each free
    /// chunk link to the next.
    pub free_head: u64,
}

#[repr(C)]
pub(crate) struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub _pad0: u32,
    pub total_size: u64,
    /// System-relative offset where the user arena starts.
    pub user_base: u64,
    pub user_size: u64,
    pub max_name_len: u64,
    pub alloc_mutex: SharedMutex,
    pub node_pool: NodePool,
    pub free_by_size: BtreeHeader,
    pub free_by_offset: BtreeHeader,
    pub free_by_size_key: KeyDef,
    pub free_by_offset_key: KeyDef,
    pub signal_id_index: BtreeHeader,
    pub signal_name_index: BtreeHeader,
    pub private_id_index: BtreeHeader,
    pub group_id_index: BtreeHeader,
    pub signal_id_key: KeyDef,
    pub signal_name_key: KeyDef,
    pub private_id_key: KeyDef,
    pub group_id_key: KeyDef,
}

const _: () = assert!(size_of::<SegmentHeader>() <= 4096);

fn round_up8(v: u64) -> u64 {
    (v + 7) & !7
}

/// One process's view of the shared segment.
pub(crate) struct Segment {
    // Keeps the mapping alive; all access goes through `base`.
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
    user_base: usize,
    path: PathBuf,
}

// SAFETY: every mutation of segment memory is serialised by the
// process-shared locks living inside the segment itself; the raw base
// pointer is valid for the lifetime of `_mmap`, which the struct owns.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a fresh segment: truncate, resize, and initialise the
    /// backing file, then seed the allocator with one free block
    /// covering the whole user arena.
    pub fn create(cfg: &VsiConfig) -> Result<Segment> {
        let header_size = round_up8(size_of::<SegmentHeader>() as u64);
        let pool_size = round_up8(cfg.system_area_size);
        let user_base = header_size + pool_size;
        if pool_size < 64 * Btree::node_size_for(NODE_MAX_RECORDS) {
            return Err(VsiError::InvalidArgument("system area too small"));
        }
        if cfg.segment_size < user_base + 64 * 1024 {
            return Err(VsiError::InvalidArgument("segment size too small"));
        }
        if cfg.max_name_len == 0 {
            return Err(VsiError::InvalidArgument("max_name_len must be positive"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cfg.segment_path)?;
        file.set_len(cfg.segment_size)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let seg = Segment {
            _mmap: mmap,
            base,
            len: cfg.segment_size as usize,
            user_base: user_base as usize,
            path: cfg.segment_path.clone(),
        };
        unsafe {
            seg.init_header(cfg, header_size, user_base)?;
        }
        Allocator::new(&seg).format()?;
        info!(
            "created segment {} ({} bytes, {} byte arena)",
            seg.path.display(),
            cfg.segment_size,
            cfg.segment_size - user_base
        );
        Ok(seg)
    }

    /// Map an existing segment and validate its header.
    pub fn open(path: &Path) -> Result<Segment> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if (len as usize) < size_of::<SegmentHeader>() {
            return Err(VsiError::CorruptSegment(format!(
                "{}: file smaller than the segment header",
                path.display()
            )));
        }
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let hdr = base as *const SegmentHeader;
        unsafe {
            if (*hdr).magic != VSI_MAGIC {
                return Err(VsiError::CorruptSegment(format!(
                    "{}: bad magic",
                    path.display()
                )));
            }
            if (*hdr).version != VSI_VERSION {
                return Err(VsiError::CorruptSegment(format!(
                    "{}: segment version {}, expected {}",
                    path.display(),
                    (*hdr).version,
                    VSI_VERSION
                )));
            }
            if (*hdr).total_size != len {
                return Err(VsiError::CorruptSegment(format!(
                    "{}: header says {} bytes, file has {}",
                    path.display(),
                    (*hdr).total_size,
                    len
                )));
            }
            let user_base = (*hdr).user_base;
            if user_base < size_of::<SegmentHeader>() as u64 || user_base >= len {
                return Err(VsiError::CorruptSegment(format!(
                    "{}: user arena base {} out of range",
                    path.display(),
                    user_base
                )));
            }
            Ok(Segment {
                _mmap: mmap,
                base,
                len: len as usize,
                user_base: user_base as usize,
                path: path.to_path_buf(),
            })
        }
    }

    unsafe fn init_header(&self, cfg: &VsiConfig, header_size: u64, user_base: u64) -> Result<()> {
        let hdr = self.header();
        (*hdr).magic = VSI_MAGIC;
        (*hdr).version = VSI_VERSION;
        (*hdr).total_size = cfg.segment_size;
        (*hdr).user_base = user_base;
        (*hdr).user_size = cfg.segment_size - user_base;
        (*hdr).max_name_len = cfg.max_name_len;

        SharedMutex::init(addr_of_mut!((*hdr).alloc_mutex))?;
        let chunk = Btree::node_size_for(NODE_MAX_RECORDS);
        (*hdr).node_pool = NodePool {
            chunk_size: chunk,
            bump: header_size,
            end: user_base,
            free_head: 0,
        };

        (*hdr).free_by_size_key = alloc::free_by_size_keydef();
        (*hdr).free_by_offset_key = alloc::free_by_offset_keydef();
        (*hdr).signal_id_key = store::signal_id_keydef();
        (*hdr).signal_name_key = store::signal_name_keydef();
        (*hdr).private_id_key = store::private_id_keydef();
        (*hdr).group_id_key = group::group_id_keydef();

        let key_off = |field: usize| Offset::new(field as u64);
        Btree::init_header(
            addr_of_mut!((*hdr).free_by_size),
            NODE_MAX_RECORDS,
            Area::System,
            key_off(offset_of!(SegmentHeader, free_by_size_key)),
        )?;
        Btree::init_header(
            addr_of_mut!((*hdr).free_by_offset),
            NODE_MAX_RECORDS,
            Area::System,
            key_off(offset_of!(SegmentHeader, free_by_offset_key)),
        )?;
        Btree::init_header(
            addr_of_mut!((*hdr).signal_id_index),
            NODE_MAX_RECORDS,
            Area::User,
            key_off(offset_of!(SegmentHeader, signal_id_key)),
        )?;
        Btree::init_header(
            addr_of_mut!((*hdr).signal_name_index),
            NODE_MAX_RECORDS,
            Area::User,
            key_off(offset_of!(SegmentHeader, signal_name_key)),
        )?;
        Btree::init_header(
            addr_of_mut!((*hdr).private_id_index),
            NODE_MAX_RECORDS,
            Area::User,
            key_off(offset_of!(SegmentHeader, private_id_key)),
        )?;
        Btree::init_header(
            addr_of_mut!((*hdr).group_id_index),
            NODE_MAX_RECORDS,
            Area::User,
            key_off(offset_of!(SegmentHeader, group_id_key)),
        )?;
        Ok(())
    }

    pub fn header(&self) -> *mut SegmentHeader {
        self.base as *mut SegmentHeader
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.len as u64
    }

    pub fn user_base_off(&self) -> u64 {
        self.user_base as u64
    }

    pub fn arena_size(&self) -> u64 {
        (self.len - self.user_base) as u64
    }

    pub fn max_name_len(&self) -> u64 {
        unsafe { (*self.header()).max_name_len }
    }

    fn corrupt(&self, msg: &str) -> ! {
        error!("segment {}: {msg}", self.path.display());
        panic!("vsi segment corrupted: {msg}");
    }

    /// Resolve an area-relative offset to an address in this mapping.
    /// Out-of-range offsets mean in-segment corruption; there is nothing
    /// to recover, so this panics.
    pub fn ptr(&self, area: Area, off: Offset) -> *mut u8 {
        if off.is_null() {
            self.corrupt("null offset dereference");
        }
        let base = match area {
            Area::System => 0usize,
            Area::User => self.user_base,
        };
        let abs = match base.checked_add(off.raw() as usize) {
            Some(abs) if abs < self.len => abs,
            _ => self.corrupt(&format!("offset {:#x} outside the segment", off.raw())),
        };
        unsafe { self.base.add(abs) }
    }

    /// Rebase a system-relative offset inside the user arena.
    pub fn sys_to_user(&self, off: Offset) -> Offset {
        if (off.raw() as usize) < self.user_base {
            self.corrupt(&format!("offset {:#x} below the user arena", off.raw()));
        }
        Offset::new(off.raw() - self.user_base as u64)
    }

    /// Rebase a user-relative offset against the segment base.
    pub fn user_to_sys(&self, off: Offset) -> Offset {
        Offset::new(off.raw() + self.user_base as u64)
    }

    // ---- system node pool --------------------------------------------

    /// Take one chunk from the system node pool.
    ///
    /// # Safety
    /// The caller must hold the allocator mutex.
    pub unsafe fn pool_alloc(&self) -> Result<Offset> {
        let pool = addr_of_mut!((*self.header()).node_pool);
        if (*pool).free_head != 0 {
            let off = (*pool).free_head;
            let next = *(self.ptr(Area::System, Offset::new(off)) as *const u64);
            (*pool).free_head = next;
            return Ok(Offset::new(off));
        }
        if (*pool).bump + (*pool).chunk_size <= (*pool).end {
            let off = (*pool).bump;
            (*pool).bump += (*pool).chunk_size;
            return Ok(Offset::new(off));
        }
        log::warn!("system node pool exhausted");
        Err(VsiError::OutOfMemory)
    }

    /// Return a chunk to the system node pool.
    ///
    /// # Safety
    /// The caller must hold the allocator mutex, and `off` must have come
    /// from [`Segment::pool_alloc`].
    pub unsafe fn pool_free(&self, off: Offset) {
        let pool = addr_of_mut!((*self.header()).node_pool);
        *(self.ptr(Area::System, off) as *mut u64) = (*pool).free_head;
        (*pool).free_head = off.raw();
    }

    // ---- tree handles ------------------------------------------------

    pub fn alloc_mutex(&self) -> &SharedMutex {
        unsafe { &(*self.header()).alloc_mutex }
    }

    pub fn free_by_size(&self) -> Btree<'_> {
        Btree::new(self, unsafe { addr_of_mut!((*self.header()).free_by_size) })
    }

    pub fn free_by_offset(&self) -> Btree<'_> {
        Btree::new(self, unsafe {
            addr_of_mut!((*self.header()).free_by_offset)
        })
    }

    pub fn signal_id_index(&self) -> Btree<'_> {
        Btree::new(self, unsafe {
            addr_of_mut!((*self.header()).signal_id_index)
        })
    }

    pub fn signal_name_index(&self) -> Btree<'_> {
        Btree::new(self, unsafe {
            addr_of_mut!((*self.header()).signal_name_index)
        })
    }

    pub fn private_id_index(&self) -> Btree<'_> {
        Btree::new(self, unsafe {
            addr_of_mut!((*self.header()).private_id_index)
        })
    }

    pub fn group_id_index(&self) -> Btree<'_> {
        Btree::new(self, unsafe {
            addr_of_mut!((*self.header()).group_id_index)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::VsiConfig;
    use std::io::Write;

    pub(crate) fn test_config(dir: &tempfile::TempDir) -> VsiConfig {
        VsiConfig {
            segment_path: dir.path().join("segment.db"),
            segment_size: 4 * 1024 * 1024,
            system_area_size: 256 * 1024,
            max_name_len: 255,
        }
    }

    #[test]
    fn create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        {
            let seg = Segment::create(&cfg).unwrap();
            assert_eq!(seg.total_size(), cfg.segment_size);
            assert!(seg.arena_size() > 3 * 1024 * 1024);
        }
        let seg = Segment::open(&cfg.segment_path).unwrap();
        assert_eq!(seg.total_size(), cfg.segment_size);
        assert_eq!(seg.max_name_len(), 255);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.db");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 8192]).unwrap();
        drop(file);
        assert!(matches!(
            Segment::open(&path),
            Err(VsiError::CorruptSegment(_))
        ));
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"VSISEG\0\0").unwrap();
        assert!(matches!(
            Segment::open(&path),
            Err(VsiError::CorruptSegment(_))
        ));
    }

    #[test]
    fn offset_rebasing_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&test_config(&dir)).unwrap();
        let user = Offset::new(128);
        let sys = seg.user_to_sys(user);
        assert_eq!(sys.raw(), 128 + seg.user_base_off());
        assert_eq!(seg.sys_to_user(sys), user);
    }

    #[test]
    fn pool_reuses_freed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&test_config(&dir)).unwrap();
        unsafe {
            let _guard = seg.alloc_mutex().lock();
            let a = seg.pool_alloc().unwrap();
            let b = seg.pool_alloc().unwrap();
            assert_ne!(a, b);
            seg.pool_free(a);
            let c = seg.pool_alloc().unwrap();
            assert_eq!(a, c);
        }
    }

    #[test]
    fn rejects_undersized_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.segment_size = 64 * 1024;
        assert!(matches!(
            Segment::create(&cfg),
            Err(VsiError::InvalidArgument(_))
        ));
    }
}
