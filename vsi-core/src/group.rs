//! Signal groups: named sets of signals with aggregate fetch and
//! multi-signal waits.
//!
//! A group record owns a singly-linked, append-only member list; each
//! member node references a signal's queue record. `listen_any` and
//! `listen_all` fan one worker thread out per member; losers of the
//! `listen_any` race are cancelled cooperatively — an atomic claim flag
//! plus a broadcast on every member semaphore — never by OS-level thread
//! cancellation.

use std::mem::{offset_of, size_of};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::alloc::Allocator;
use crate::btree::key::{FieldKind, KeyDef, KeyProbe};
use crate::error::{Result, VsiError};
use crate::offset::{Area, Offset};
use crate::segment::Segment;
use crate::store::{FetchOpts, Store};
use crate::sync::{Deadline, SharedMutex};

#[repr(C)]
pub(crate) struct SignalGroup {
    pub group_id: u32,
    pub signal_count: u32,
    pub head: Offset,
    pub tail: Offset,
    /// Guards the member list.
    pub mutex: SharedMutex,
}

#[repr(C)]
pub(crate) struct GroupMember {
    pub next: Offset,
    /// User-relative offset of the member's `SignalList`.
    pub signal_list: Offset,
}

pub(crate) fn group_id_keydef() -> KeyDef {
    KeyDef::new(&[(FieldKind::U32, offset_of!(SignalGroup, group_id) as u32)])
}

/// Per-member outcome of an aggregate fetch. Slot order matches member
/// insertion order.
#[derive(Debug)]
pub struct GroupSlot {
    pub domain: u32,
    pub signal: u32,
    pub result: Result<Vec<u8>>,
}

/// Group listing entry, as shown by `dump`.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: u32,
    pub members: Vec<(u32, u32)>,
}

pub(crate) struct Groups<'a> {
    seg: &'a Segment,
}

impl<'a> Groups<'a> {
    pub fn new(seg: &'a Segment) -> Groups<'a> {
        Groups { seg }
    }

    fn group(&self, off: Offset) -> *mut SignalGroup {
        self.seg.ptr(Area::User, off) as *mut SignalGroup
    }

    fn find(&self, group_id: u32) -> Option<Offset> {
        let probe = KeyProbe::new().unsigned(group_id as u64);
        self.seg.group_id_index().search(&probe)
    }

    pub fn create(&self, group_id: u32) -> Result<()> {
        if group_id == 0 {
            return Err(VsiError::InvalidArgument("group id must be positive"));
        }
        if self.find(group_id).is_some() {
            return Err(VsiError::DuplicateGroup);
        }
        let off = Allocator::new(self.seg).alloc(size_of::<SignalGroup>() as u64)?;
        unsafe {
            let grp = self.group(off);
            (*grp).group_id = group_id;
            (*grp).signal_count = 0;
            (*grp).head = Offset::NULL;
            (*grp).tail = Offset::NULL;
            SharedMutex::init(addr_of_mut!((*grp).mutex))?;
        }
        self.seg.group_id_index().insert(off)?;
        info!("created group {group_id}");
        Ok(())
    }

    pub fn delete(&self, group_id: u32) -> Result<()> {
        let probe = KeyProbe::new().unsigned(group_id as u64);
        let off = self
            .seg
            .group_id_index()
            .remove(&probe)?
            .ok_or(VsiError::UnknownGroup)?;
        let alloc = Allocator::new(self.seg);
        let mut members = Vec::new();
        unsafe {
            let grp = self.group(off);
            let _guard = (*grp).mutex.lock();
            let mut cur = (*grp).head;
            while !cur.is_null() {
                members.push(cur);
                cur = (*(self.seg.ptr(Area::User, cur) as *const GroupMember)).next;
            }
            (*grp).head = Offset::NULL;
            (*grp).tail = Offset::NULL;
            (*grp).signal_count = 0;
        }
        for m in members {
            alloc.free(m)?;
        }
        alloc.free(off)?;
        info!("deleted group {group_id}");
        Ok(())
    }

    pub fn add_member(&self, group_id: u32, sl_off: Offset) -> Result<()> {
        let grp_off = self.find(group_id).ok_or(VsiError::UnknownGroup)?;
        let node = Allocator::new(self.seg).alloc(size_of::<GroupMember>() as u64)?;
        unsafe {
            let m = self.seg.ptr(Area::User, node) as *mut GroupMember;
            (*m).next = Offset::NULL;
            (*m).signal_list = sl_off;

            let grp = self.group(grp_off);
            let _guard = (*grp).mutex.lock();
            if (*grp).tail.is_null() {
                (*grp).head = node;
            } else {
                let tail = self.seg.ptr(Area::User, (*grp).tail) as *mut GroupMember;
                (*tail).next = node;
            }
            (*grp).tail = node;
            (*grp).signal_count += 1;
        }
        Ok(())
    }

    /// Unlink the member referencing `sl_off`; the list is singly linked,
    /// so this walks from the head.
    pub fn remove_member(&self, group_id: u32, sl_off: Offset) -> Result<()> {
        let grp_off = self.find(group_id).ok_or(VsiError::UnknownGroup)?;
        let removed;
        unsafe {
            let grp = self.group(grp_off);
            let _guard = (*grp).mutex.lock();
            let mut prev: Offset = Offset::NULL;
            let mut cur = (*grp).head;
            loop {
                if cur.is_null() {
                    return Err(VsiError::UnknownSignal);
                }
                let m = self.seg.ptr(Area::User, cur) as *mut GroupMember;
                if (*m).signal_list == sl_off {
                    if prev.is_null() {
                        (*grp).head = (*m).next;
                    } else {
                        let p = self.seg.ptr(Area::User, prev) as *mut GroupMember;
                        (*p).next = (*m).next;
                    }
                    if (*grp).tail == cur {
                        (*grp).tail = prev;
                    }
                    (*grp).signal_count -= 1;
                    removed = cur;
                    break;
                }
                prev = cur;
                cur = (*m).next;
            }
        }
        Allocator::new(self.seg).free(removed)
    }

    /// Member queue records in insertion order.
    pub fn members(&self, group_id: u32) -> Result<Vec<Offset>> {
        let grp_off = self.find(group_id).ok_or(VsiError::UnknownGroup)?;
        let mut out = Vec::new();
        unsafe {
            let grp = self.group(grp_off);
            let _guard = (*grp).mutex.lock();
            let mut cur = (*grp).head;
            while !cur.is_null() {
                let m = self.seg.ptr(Area::User, cur) as *const GroupMember;
                out.push((*m).signal_list);
                cur = (*m).next;
            }
        }
        Ok(out)
    }

    /// Non-blocking aggregate fetch: one slot per member, per-slot
    /// status, call-level success.
    pub fn fetch_all(&self, group_id: u32, newest: bool) -> Result<Vec<GroupSlot>> {
        let store = Store::new(self.seg);
        let mut slots = Vec::new();
        for sl_off in self.members(group_id)? {
            let (domain, signal) = store.ids_of(sl_off);
            let result = if newest {
                store.fetch_newest_on(sl_off, &FetchOpts::no_wait())
            } else {
                store.fetch_oldest_on(sl_off, &FetchOpts::no_wait())
            };
            slots.push(GroupSlot {
                domain,
                signal,
                result,
            });
        }
        Ok(slots)
    }

    pub fn flush(&self, group_id: u32) -> Result<()> {
        let store = Store::new(self.seg);
        for sl_off in self.members(group_id)? {
            store.flush_on(sl_off)?;
        }
        debug!("flushed group {group_id}");
        Ok(())
    }

    /// Block until any member has data, consume exactly one payload, and
    /// report which member produced it.
    pub fn listen_any(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
    ) -> Result<(u32, u32, Vec<u8>)> {
        let members = self.members(group_id)?;
        if members.is_empty() {
            return Err(VsiError::InvalidArgument("group has no members"));
        }
        let deadline = timeout.map(Deadline::after);
        // `claimed` gates the single consume; `done` is the cooperative
        // cancel flag every sleeping worker re-checks after a wake.
        let claimed = AtomicBool::new(false);
        let done = AtomicBool::new(false);

        let results: Vec<Option<Result<(u32, u32, Vec<u8>)>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|&sl_off| {
                    let store = Store::new(self.seg);
                    let members = &members;
                    let claimed = &claimed;
                    let done = &done;
                    scope.spawn(move || {
                        listen_any_worker(&store, sl_off, members, deadline, claimed, done)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("group {group_id} listener panicked");
                        None
                    }
                })
                .collect()
        });

        let mut timed_out = false;
        let mut failure = None;
        for res in results {
            match res {
                Some(Ok(win)) => return Ok(win),
                Some(Err(VsiError::Timeout)) => timed_out = true,
                Some(Err(err)) => failure = Some(err),
                None => {}
            }
        }
        match failure {
            Some(err) => Err(err),
            None if timed_out => Err(VsiError::Timeout),
            None => Err(VsiError::NoData),
        }
    }

    /// Wait for every member to produce (or time out) independently; one
    /// slot per member, call-level success.
    pub fn listen_all(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
        newest: bool,
    ) -> Result<Vec<GroupSlot>> {
        let members = self.members(group_id)?;
        if members.is_empty() {
            return Err(VsiError::InvalidArgument("group has no members"));
        }
        let deadline = timeout.map(Deadline::after);

        let results: Vec<Result<Vec<u8>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|&sl_off| {
                    let store = Store::new(self.seg);
                    scope.spawn(move || {
                        let opts = FetchOpts::wait(deadline);
                        if newest {
                            store.fetch_newest_on(sl_off, &opts)
                        } else {
                            store.fetch_oldest_on(sl_off, &opts)
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("group {group_id} listener panicked");
                        Err(VsiError::NoData)
                    }
                })
                .collect()
        });

        let store = Store::new(self.seg);
        Ok(members
            .iter()
            .zip(results)
            .map(|(&sl_off, result)| {
                let (domain, signal) = store.ids_of(sl_off);
                GroupSlot {
                    domain,
                    signal,
                    result,
                }
            })
            .collect())
    }

    pub fn groups(&self) -> Result<Vec<GroupInfo>> {
        let store = Store::new(self.seg);
        let mut out = Vec::new();
        let mut it = self.seg.group_id_index().iter_min();
        while let Some(rec) = it.record()? {
            let id = unsafe { (*self.group(rec)).group_id };
            let members = self
                .members(id)?
                .into_iter()
                .map(|sl_off| store.ids_of(sl_off))
                .collect();
            out.push(GroupInfo { id, members });
            it.advance()?;
        }
        Ok(out)
    }
}

/// One `listen_any` worker. Waits for its member queue to fill, then
/// races to claim the group-wide consume ticket. The claim can be
/// released again when another consumer emptied the queue first.
fn listen_any_worker(
    store: &Store<'_>,
    sl_off: Offset,
    members: &[Offset],
    deadline: Option<Deadline>,
    claimed: &AtomicBool,
    done: &AtomicBool,
) -> Option<Result<(u32, u32, Vec<u8>)>> {
    let wake_peers = || {
        for &peer in members {
            store.wake_all_on(peer);
        }
    };
    loop {
        if done.load(Ordering::Acquire) {
            return None;
        }
        match store.wait_nonempty(sl_off, deadline, done) {
            Ok(()) => {}
            Err(VsiError::NoData) => return None, // cancelled
            Err(VsiError::Timeout) => return Some(Err(VsiError::Timeout)),
            Err(err) => {
                done.store(true, Ordering::Release);
                wake_peers();
                return Some(Err(err));
            }
        }
        if done.load(Ordering::Acquire) {
            return None;
        }
        if claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            match store.fetch_oldest_on(sl_off, &FetchOpts::no_wait()) {
                Ok(data) => {
                    done.store(true, Ordering::Release);
                    wake_peers();
                    let (domain, signal) = store.ids_of(sl_off);
                    return Some(Ok((domain, signal, data)));
                }
                Err(VsiError::NoData) => {
                    // Someone drained the queue between the wake and the
                    // claim; give the ticket back and wait again.
                    claimed.store(false, Ordering::Release);
                    continue;
                }
                Err(err) => {
                    done.store(true, Ordering::Release);
                    wake_peers();
                    return Some(Err(err));
                }
            }
        }
        // Lost the claim race; the winner is about to set `done`.
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::test_config;

    fn group_segment() -> (tempfile::TempDir, Segment) {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&test_config(&dir)).unwrap();
        (dir, seg)
    }

    #[test]
    fn create_delete_lifecycle() {
        let (_dir, seg) = group_segment();
        let groups = Groups::new(&seg);
        groups.create(10).unwrap();
        assert!(matches!(groups.create(10), Err(VsiError::DuplicateGroup)));
        assert!(matches!(groups.create(0), Err(VsiError::InvalidArgument(_))));
        groups.delete(10).unwrap();
        assert!(matches!(groups.delete(10), Err(VsiError::UnknownGroup)));
        groups.create(10).unwrap();
    }

    #[test]
    fn membership_preserves_insertion_order() {
        let (_dir, seg) = group_segment();
        let store = Store::new(&seg);
        let groups = Groups::new(&seg);
        let a = store.define_signal(1, 11, 0, "gen").unwrap();
        let b = store.define_signal(1, 12, 0, "ivi").unwrap();
        let c = store.define_signal(1, 13, 0, "adas").unwrap();
        groups.create(10).unwrap();
        for sl in [a, b, c] {
            groups.add_member(10, sl).unwrap();
        }
        assert_eq!(groups.members(10).unwrap(), vec![a, b, c]);

        groups.remove_member(10, b).unwrap();
        assert_eq!(groups.members(10).unwrap(), vec![a, c]);
        assert!(matches!(
            groups.remove_member(10, b),
            Err(VsiError::UnknownSignal)
        ));
    }

    #[test]
    fn fetch_all_reports_per_slot_status() {
        let (_dir, seg) = group_segment();
        let store = Store::new(&seg);
        let groups = Groups::new(&seg);
        let gen = store.define_signal(1, 11, 0, "gen").unwrap();
        let ivi = store.define_signal(1, 12, 0, "ivi").unwrap();
        groups.create(10).unwrap();
        groups.add_member(10, gen).unwrap();
        groups.add_member(10, ivi).unwrap();

        store.insert(1, 11, &[48]).unwrap();
        store.insert(1, 11, &[49]).unwrap();

        let slots = groups.fetch_all(10, true).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].signal, 11);
        assert_eq!(slots[0].result.as_deref().unwrap(), &[49]);
        assert!(matches!(slots[1].result, Err(VsiError::NoData)));
    }

    #[test]
    fn delete_group_frees_member_nodes() {
        let (_dir, seg) = group_segment();
        let store = Store::new(&seg);
        let groups = Groups::new(&seg);
        let sl = store.define_signal(1, 11, 0, "gen").unwrap();
        let before = Allocator::new(&seg).stats().unwrap();
        groups.create(10).unwrap();
        groups.add_member(10, sl).unwrap();
        groups.delete(10).unwrap();
        assert_eq!(Allocator::new(&seg).stats().unwrap(), before);
    }
}
