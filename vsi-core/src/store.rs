//! The signal store: per-signal FIFO queues plus the directories that
//! locate them.
//!
//! A `SignalList` record exists for every live `(domain, signal)` pair and
//! owns an intrusive FIFO of payload blocks. Three directory trees index
//! the records: by `(domain, signal)`, by `(domain, name)`, and by
//! `(domain, private_id)`. Producers append under the queue's semaphore
//! and post it; consumers pop the head (oldest, destructive) or peek the
//! tail (newest), optionally blocking on the semaphore until data shows
//! up.

use std::mem::{offset_of, size_of};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::alloc::Allocator;
use crate::btree::key::{FieldKind, KeyDef, KeyProbe};
use crate::error::{Result, VsiError};
use crate::offset::{Area, Offset};
use crate::segment::Segment;
use crate::sync::{Deadline, QueueSemaphore};

/// One live `(domain, signal)` pair: identity, FIFO state, and the
/// semaphore serialising both.
#[repr(C)]
pub(crate) struct SignalList {
    pub domain_id: u32,
    pub signal_id: u32,
    pub private_id: u32,
    pub _pad0: u32,
    /// User-relative offset of the NUL-terminated name; NULL when the
    /// signal was auto-created without a definition.
    pub name: Offset,
    pub head: Offset,
    pub tail: Offset,
    pub current_count: u32,
    pub _pad1: u32,
    pub total_bytes: u64,
    pub semaphore: QueueSemaphore,
}

/// One queued payload, intrusively linked from head to tail.
#[repr(C)]
pub(crate) struct SignalData {
    pub next: Offset,
    pub length: u64,
    // payload bytes follow
}

const DATA_HEADER: u64 = size_of::<SignalData>() as u64;

pub(crate) fn signal_id_keydef() -> KeyDef {
    KeyDef::new(&[
        (FieldKind::U32, offset_of!(SignalList, domain_id) as u32),
        (FieldKind::U32, offset_of!(SignalList, signal_id) as u32),
    ])
}

pub(crate) fn signal_name_keydef() -> KeyDef {
    KeyDef::new(&[
        (FieldKind::U32, offset_of!(SignalList, domain_id) as u32),
        (FieldKind::Str, offset_of!(SignalList, name) as u32),
    ])
}

pub(crate) fn private_id_keydef() -> KeyDef {
    KeyDef::new(&[
        (FieldKind::U32, offset_of!(SignalList, domain_id) as u32),
        (FieldKind::U32, offset_of!(SignalList, private_id) as u32),
    ])
}

/// How a fetch behaves on an empty queue.
#[derive(Clone, Copy)]
pub(crate) enum WaitMode {
    NoWait,
    Block,
    Until(Deadline),
}

pub(crate) struct FetchOpts<'a> {
    pub wait: WaitMode,
    /// Cooperative cancellation for group listeners: checked before
    /// every wait and after every wake.
    pub cancel: Option<&'a AtomicBool>,
}

impl FetchOpts<'_> {
    pub fn no_wait() -> FetchOpts<'static> {
        FetchOpts {
            wait: WaitMode::NoWait,
            cancel: None,
        }
    }

    pub fn wait(deadline: Option<Deadline>) -> FetchOpts<'static> {
        FetchOpts {
            wait: match deadline {
                Some(d) => WaitMode::Until(d),
                None => WaitMode::Block,
            },
            cancel: None,
        }
    }
}

/// Directory listing entry, as shown by `dump`.
#[derive(Debug, Clone)]
pub struct SignalInfo {
    pub domain: u32,
    pub signal: u32,
    pub private_id: u32,
    pub name: Option<String>,
    pub queued: u32,
    pub total_bytes: u64,
}

pub(crate) struct Store<'a> {
    seg: &'a Segment,
}

impl<'a> Store<'a> {
    pub fn new(seg: &'a Segment) -> Store<'a> {
        Store { seg }
    }

    fn list(&self, off: Offset) -> *mut SignalList {
        self.seg.ptr(Area::User, off) as *mut SignalList
    }

    pub fn ids_of(&self, sl_off: Offset) -> (u32, u32) {
        unsafe {
            let sl = self.list(sl_off);
            ((*sl).domain_id, (*sl).signal_id)
        }
    }

    pub fn name_of(&self, sl_off: Offset) -> Option<String> {
        unsafe {
            let name = (*self.list(sl_off)).name;
            if name.is_null() {
                return None;
            }
            let p = self.seg.ptr(Area::User, name);
            let cstr = std::ffi::CStr::from_ptr(p as *const libc::c_char);
            Some(String::from_utf8_lossy(cstr.to_bytes()).into_owned())
        }
    }

    // ---- definition and lookup ---------------------------------------

    /// Define `(domain, signal)` with the given name and optional private
    /// id, entering it into every applicable directory.
    pub fn define_signal(
        &self,
        domain: u32,
        signal: u32,
        private: u32,
        name: &str,
    ) -> Result<Offset> {
        if domain == 0 {
            return Err(VsiError::InvalidArgument("domain must be positive"));
        }
        if signal == 0 {
            return Err(VsiError::InvalidArgument("signal id must be positive"));
        }
        if name.len() as u64 > self.seg.max_name_len() {
            return Err(VsiError::InvalidArgument("signal name too long"));
        }
        if name.contains('\0') {
            return Err(VsiError::InvalidArgument("signal name contains NUL"));
        }
        if self.lookup(domain, signal).is_some() {
            return Err(VsiError::InvalidArgument("signal already defined"));
        }
        let sl_off = self.create_record(domain, signal, private, name)?;
        self.seg.signal_id_index().insert(sl_off)?;
        if !name.is_empty() {
            self.seg.signal_name_index().insert(sl_off)?;
        }
        if private != 0 {
            self.seg.private_id_index().insert(sl_off)?;
        }
        info!("defined signal {domain}/{signal} ({name:?}, private {private})");
        Ok(sl_off)
    }

    fn create_record(&self, domain: u32, signal: u32, private: u32, name: &str) -> Result<Offset> {
        let alloc = Allocator::new(self.seg);
        let name_off = if name.is_empty() {
            Offset::NULL
        } else {
            let off = alloc.alloc(name.len() as u64 + 1)?;
            unsafe {
                let p = self.seg.ptr(Area::User, off);
                std::ptr::copy_nonoverlapping(name.as_ptr(), p, name.len());
                *p.add(name.len()) = 0;
            }
            off
        };
        let sl_off = alloc.alloc(size_of::<SignalList>() as u64)?;
        unsafe {
            let sl = self.list(sl_off);
            (*sl).domain_id = domain;
            (*sl).signal_id = signal;
            (*sl).private_id = private;
            (*sl)._pad0 = 0;
            (*sl).name = name_off;
            (*sl).head = Offset::NULL;
            (*sl).tail = Offset::NULL;
            (*sl).current_count = 0;
            (*sl)._pad1 = 0;
            (*sl).total_bytes = 0;
            QueueSemaphore::init(addr_of_mut!((*sl).semaphore))?;
        }
        Ok(sl_off)
    }

    pub fn lookup(&self, domain: u32, signal: u32) -> Option<Offset> {
        let probe = KeyProbe::new()
            .unsigned(domain as u64)
            .unsigned(signal as u64);
        self.seg.signal_id_index().search(&probe)
    }

    pub fn lookup_by_name(&self, domain: u32, name: &str) -> Option<Offset> {
        let probe = KeyProbe::new().unsigned(domain as u64).str(name);
        self.seg.signal_name_index().search(&probe)
    }

    /// Resolve `(domain, signal)`, auto-creating an unnamed queue on
    /// first insert. Undefined-named signals are permitted.
    fn ensure_signal(&self, domain: u32, signal: u32) -> Result<Offset> {
        if domain == 0 {
            return Err(VsiError::InvalidArgument("domain must be positive"));
        }
        if signal == 0 {
            return Err(VsiError::InvalidArgument("signal id must be positive"));
        }
        if let Some(off) = self.lookup(domain, signal) {
            return Ok(off);
        }
        debug!("auto-creating unnamed signal {domain}/{signal}");
        let sl_off = self.create_record(domain, signal, 0, "")?;
        self.seg.signal_id_index().insert(sl_off)?;
        Ok(sl_off)
    }

    pub fn name_to_id(&self, domain: u32, name: &str) -> Result<u32> {
        if domain == 0 {
            return Err(VsiError::InvalidArgument("domain must be positive"));
        }
        let sl_off = self
            .lookup_by_name(domain, name)
            .ok_or(VsiError::UnknownSignal)?;
        Ok(unsafe { (*self.list(sl_off)).signal_id })
    }

    /// The defined name of `(domain, signal)`; `Ok(None)` for a live but
    /// unnamed (auto-created) signal. The name is copied out of the
    /// segment rather than lent.
    pub fn id_to_name(&self, domain: u32, signal: u32) -> Result<Option<String>> {
        let sl_off = self.lookup(domain, signal).ok_or(VsiError::UnknownSignal)?;
        Ok(self.name_of(sl_off))
    }

    pub fn private_to_id(&self, domain: u32, private: u32) -> Result<u32> {
        if domain == 0 {
            return Err(VsiError::InvalidArgument("domain must be positive"));
        }
        if private == 0 {
            return Err(VsiError::InvalidArgument("private id must be positive"));
        }
        let probe = KeyProbe::new()
            .unsigned(domain as u64)
            .unsigned(private as u64);
        let sl_off = self
            .seg
            .private_id_index()
            .search(&probe)
            .ok_or(VsiError::UnknownSignal)?;
        Ok(unsafe { (*self.list(sl_off)).signal_id })
    }

    // ---- queue operations --------------------------------------------

    pub fn insert(&self, domain: u32, signal: u32, data: &[u8]) -> Result<()> {
        let sl_off = self.ensure_signal(domain, signal)?;
        self.insert_on(sl_off, data)
    }

    pub fn insert_on(&self, sl_off: Offset, data: &[u8]) -> Result<()> {
        let block = Allocator::new(self.seg).alloc(DATA_HEADER + data.len() as u64)?;
        unsafe {
            let d = self.seg.ptr(Area::User, block) as *mut SignalData;
            (*d).next = Offset::NULL;
            (*d).length = data.len() as u64;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (d as *mut u8).add(DATA_HEADER as usize),
                data.len(),
            );

            let sl = self.list(sl_off);
            let sem = &(*sl).semaphore;
            let guard = sem.lock();
            if (*sl).tail.is_null() {
                (*sl).head = block;
            } else {
                let tail = self.seg.ptr(Area::User, (*sl).tail) as *mut SignalData;
                (*tail).next = block;
            }
            (*sl).tail = block;
            (*sl).current_count += 1;
            (*sl).total_bytes += data.len() as u64;
            sem.post(&guard);
        }
        Ok(())
    }

    pub fn fetch_oldest(&self, domain: u32, signal: u32, opts: &FetchOpts<'_>) -> Result<Vec<u8>> {
        let sl_off = self.lookup(domain, signal).ok_or(VsiError::NoData)?;
        self.fetch_oldest_on(sl_off, opts)
    }

    /// Pop the oldest payload: destructive, FIFO order.
    pub fn fetch_oldest_on(&self, sl_off: Offset, opts: &FetchOpts<'_>) -> Result<Vec<u8>> {
        let (block, data) = unsafe {
            let sl = self.list(sl_off);
            let sem = &(*sl).semaphore;
            let guard = sem.lock();
            self.wait_loop(sl, sem, &guard, opts)?;

            let block = (*sl).head;
            let d = self.seg.ptr(Area::User, block) as *const SignalData;
            let len = (*d).length as usize;
            let payload = (d as *const u8).add(DATA_HEADER as usize);
            let data = std::slice::from_raw_parts(payload, len).to_vec();

            (*sl).head = (*d).next;
            if (*sl).head.is_null() {
                (*sl).tail = Offset::NULL;
            }
            (*sl).current_count -= 1;
            (*sl).total_bytes -= len as u64;
            sem.take_message(&guard);
            (block, data)
        };
        Allocator::new(self.seg).free(block)?;
        Ok(data)
    }

    pub fn fetch_newest(&self, domain: u32, signal: u32, opts: &FetchOpts<'_>) -> Result<Vec<u8>> {
        let sl_off = self.lookup(domain, signal).ok_or(VsiError::NoData)?;
        self.fetch_newest_on(sl_off, opts)
    }

    /// Peek the newest payload: the entry is returned but stays queued.
    pub fn fetch_newest_on(&self, sl_off: Offset, opts: &FetchOpts<'_>) -> Result<Vec<u8>> {
        unsafe {
            let sl = self.list(sl_off);
            let sem = &(*sl).semaphore;
            let guard = sem.lock();
            self.wait_loop(sl, sem, &guard, opts)?;

            let d = self.seg.ptr(Area::User, (*sl).tail) as *const SignalData;
            let len = (*d).length as usize;
            let payload = (d as *const u8).add(DATA_HEADER as usize);
            Ok(std::slice::from_raw_parts(payload, len).to_vec())
        }
    }

    /// Common empty-queue wait: return only with the queue non-empty and
    /// the semaphore still locked, or fail with `NoData` (no-wait /
    /// cancelled) or `Timeout`.
    unsafe fn wait_loop(
        &self,
        sl: *mut SignalList,
        sem: &QueueSemaphore,
        guard: &crate::sync::MutexGuard<'_>,
        opts: &FetchOpts<'_>,
    ) -> Result<()> {
        loop {
            if (*sl).current_count > 0 {
                return Ok(());
            }
            if let Some(cancel) = opts.cancel {
                if cancel.load(Ordering::Acquire) {
                    return Err(VsiError::NoData);
                }
            }
            match opts.wait {
                WaitMode::NoWait => return Err(VsiError::NoData),
                WaitMode::Block => sem.wait(guard),
                WaitMode::Until(deadline) => {
                    if sem.wait_until(guard, deadline) {
                        return Err(VsiError::Timeout);
                    }
                }
            }
        }
    }

    /// Block until the queue is non-empty without consuming anything.
    /// Used by group listeners racing to claim a payload.
    pub fn wait_nonempty(
        &self,
        sl_off: Offset,
        deadline: Option<Deadline>,
        cancel: &AtomicBool,
    ) -> Result<()> {
        unsafe {
            let sl = self.list(sl_off);
            let sem = &(*sl).semaphore;
            let guard = sem.lock();
            let opts = FetchOpts {
                wait: match deadline {
                    Some(d) => WaitMode::Until(d),
                    None => WaitMode::Block,
                },
                cancel: Some(cancel),
            };
            self.wait_loop(sl, sem, &guard, &opts)
        }
    }

    /// Rouse every waiter on the queue so cancellation flags get
    /// re-checked.
    pub fn wake_all_on(&self, sl_off: Offset) {
        unsafe {
            (*self.list(sl_off)).semaphore.wake_all();
        }
    }

    pub fn flush(&self, domain: u32, signal: u32) -> Result<()> {
        let sl_off = self.lookup(domain, signal).ok_or(VsiError::UnknownSignal)?;
        self.flush_on(sl_off)
    }

    /// Drop every queued payload; the signal itself persists.
    pub fn flush_on(&self, sl_off: Offset) -> Result<()> {
        let mut blocks = Vec::new();
        unsafe {
            let sl = self.list(sl_off);
            let sem = &(*sl).semaphore;
            let guard = sem.lock();
            let mut cur = (*sl).head;
            while !cur.is_null() {
                blocks.push(cur);
                cur = (*(self.seg.ptr(Area::User, cur) as *const SignalData)).next;
            }
            (*sl).head = Offset::NULL;
            (*sl).tail = Offset::NULL;
            (*sl).current_count = 0;
            (*sl).total_bytes = 0;
            sem.reset(&guard);
        }
        let alloc = Allocator::new(self.seg);
        for block in &blocks {
            alloc.free(*block)?;
        }
        debug!("flushed {} payloads", blocks.len());
        Ok(())
    }

    // ---- introspection -----------------------------------------------

    pub fn signals(&self) -> Result<Vec<SignalInfo>> {
        let mut out = Vec::new();
        let mut it = self.seg.signal_id_index().iter_min();
        while let Some(rec) = it.record()? {
            unsafe {
                let sl = self.list(rec);
                out.push(SignalInfo {
                    domain: (*sl).domain_id,
                    signal: (*sl).signal_id,
                    private_id: (*sl).private_id,
                    name: self.name_of(rec),
                    queued: (*sl).current_count,
                    total_bytes: (*sl).total_bytes,
                });
            }
            it.advance()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::test_config;

    fn store_segment() -> (tempfile::TempDir, Segment) {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&test_config(&dir)).unwrap();
        (dir, seg)
    }

    #[test]
    fn define_validates_arguments() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        assert!(matches!(
            store.define_signal(0, 1, 0, "x"),
            Err(VsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.define_signal(1, 0, 0, "x"),
            Err(VsiError::InvalidArgument(_))
        ));
        let long = "n".repeat(300);
        assert!(matches!(
            store.define_signal(1, 1, 0, &long),
            Err(VsiError::InvalidArgument(_))
        ));
        store.define_signal(1, 1, 0, "ok").unwrap();
        assert!(matches!(
            store.define_signal(1, 1, 0, "ok"),
            Err(VsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn name_directory_resolves_both_ways() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        store.define_signal(1, 42, 0, "bar").unwrap();
        assert_eq!(store.name_to_id(1, "bar").unwrap(), 42);
        assert_eq!(store.id_to_name(1, 42).unwrap().as_deref(), Some("bar"));
        assert!(matches!(
            store.name_to_id(1, "missing"),
            Err(VsiError::UnknownSignal)
        ));
        assert!(matches!(
            store.id_to_name(1, 7),
            Err(VsiError::UnknownSignal)
        ));
    }

    #[test]
    fn private_id_directory() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        store.define_signal(1, 42, 900, "with-private").unwrap();
        store.define_signal(1, 43, 0, "without").unwrap();
        assert_eq!(store.private_to_id(1, 900).unwrap(), 42);
        assert!(matches!(
            store.private_to_id(1, 901),
            Err(VsiError::UnknownSignal)
        ));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        for payload in [b"p1".as_slice(), b"p2", b"p3"] {
            store.insert(1, 42, payload).unwrap();
        }
        assert_eq!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()).unwrap(),
            b"p1"
        );
        assert_eq!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()).unwrap(),
            b"p2"
        );
        assert_eq!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()).unwrap(),
            b"p3"
        );
        assert!(matches!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()),
            Err(VsiError::NoData)
        ));
    }

    #[test]
    fn newest_peeks_without_consuming() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        store.insert(1, 42, &[41]).unwrap();
        store.insert(1, 42, &[42]).unwrap();
        store.insert(1, 42, &[43]).unwrap();
        assert_eq!(
            store.fetch_newest(1, 42, &FetchOpts::no_wait()).unwrap(),
            [43]
        );
        let info = &store.signals().unwrap()[0];
        assert_eq!(info.queued, 3);
        assert_eq!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()).unwrap(),
            [41]
        );
        assert_eq!(
            store.fetch_newest(1, 42, &FetchOpts::no_wait()).unwrap(),
            [43]
        );
        assert_eq!(store.signals().unwrap()[0].queued, 2);
    }

    #[test]
    fn flush_frees_every_payload() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        store.define_signal(1, 42, 0, "flushed").unwrap();
        let before = Allocator::new(&seg).stats().unwrap();
        for i in 0..10u8 {
            store.insert(1, 42, &[i; 33]).unwrap();
        }
        store.flush(1, 42).unwrap();
        assert_eq!(Allocator::new(&seg).stats().unwrap(), before);
        assert_eq!(store.signals().unwrap()[0].queued, 0);
        assert!(matches!(
            store.flush(1, 99),
            Err(VsiError::UnknownSignal)
        ));
    }

    #[test]
    fn auto_created_signals_are_unnamed() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        store.insert(1, 7, b"x").unwrap();
        assert_eq!(store.id_to_name(1, 7).unwrap(), None);
        let info = &store.signals().unwrap()[0];
        assert_eq!((info.domain, info.signal), (1, 7));
        assert_eq!(info.name, None);
    }

    #[test]
    fn fetch_on_missing_signal_is_no_data() {
        let (_dir, seg) = store_segment();
        let store = Store::new(&seg);
        assert!(matches!(
            store.fetch_oldest(1, 42, &FetchOpts::no_wait()),
            Err(VsiError::NoData)
        ));
        assert!(matches!(
            store.fetch_newest(1, 42, &FetchOpts::no_wait()),
            Err(VsiError::NoData)
        ));
    }
}
