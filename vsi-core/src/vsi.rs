//! The public handle: segment lifecycle plus the full signal, group, and
//! introspection surface.

use std::path::Path;
use std::time::Duration;

use log::info;

use crate::alloc::{Allocator, MemoryStats};
use crate::config::VsiConfig;
use crate::error::{Result, VsiError};
use crate::group::{GroupInfo, GroupSlot, Groups};
use crate::segment::Segment;
use crate::store::{FetchOpts, SignalInfo, Store};
use crate::vss::{self, ImportStats};

/// Outcome of a by-name or group-listen fetch: the resolved identity
/// plus the payload.
#[derive(Debug)]
pub struct SignalResult {
    pub domain: u32,
    pub signal: u32,
    pub name: Option<String>,
    pub data: Vec<u8>,
}

/// One open handle on a VSI segment. The handle is `Sync`: every
/// operation locks the in-segment structures it touches, so threads can
/// share one handle freely, and other processes can map the same file.
pub struct Vsi {
    seg: Segment,
}

impl Vsi {
    /// Open the segment named by `cfg`. With `create_new` the backing
    /// file is truncated, resized, and initialised; without it the file
    /// must already hold a valid segment.
    pub fn initialize(cfg: &VsiConfig, create_new: bool) -> Result<Vsi> {
        let seg = if create_new {
            Segment::create(cfg)?
        } else {
            Segment::open(&cfg.segment_path)?
        };
        Ok(Vsi { seg })
    }

    /// Tear the deployment down: unmap the segment and remove its
    /// backing file. Per-record cleanup does not exist — the arena owns
    /// everything, so reclaiming the segment reclaims it all.
    pub fn destroy(self) -> Result<()> {
        let path = self.seg.path().to_path_buf();
        drop(self.seg);
        std::fs::remove_file(&path)?;
        info!("destroyed segment {}", path.display());
        Ok(())
    }

    fn store(&self) -> Store<'_> {
        Store::new(&self.seg)
    }

    fn groups(&self) -> Groups<'_> {
        Groups::new(&self.seg)
    }

    fn wait_opts(wait: bool) -> FetchOpts<'static> {
        if wait {
            FetchOpts::wait(None)
        } else {
            FetchOpts::no_wait()
        }
    }

    // ---- signal definition -------------------------------------------

    pub fn define_signal(&self, domain: u32, signal: u32, private: u32, name: &str) -> Result<()> {
        self.store().define_signal(domain, signal, private, name)?;
        Ok(())
    }

    /// Ingest a VSS text file into `domain` (see [`crate::vss`]).
    pub fn vss_import(&self, path: &Path, domain: u32) -> Result<ImportStats> {
        vss::import(self, path, domain)
    }

    // ---- insert ------------------------------------------------------

    pub fn insert_signal(&self, domain: u32, signal: u32, data: &[u8]) -> Result<()> {
        self.store().insert(domain, signal, data)
    }

    pub fn insert_signal_by_name(&self, domain: u32, name: &str, data: &[u8]) -> Result<()> {
        let signal = self.store().name_to_id(domain, name)?;
        self.store().insert(domain, signal, data)
    }

    // ---- fetch -------------------------------------------------------

    /// Oldest payload of `(domain, signal)`, destructively. With `wait`
    /// the call blocks until a producer posts; otherwise an empty queue
    /// is `NoData`.
    pub fn get_oldest_signal(&self, domain: u32, signal: u32, wait: bool) -> Result<Vec<u8>> {
        self.store()
            .fetch_oldest(domain, signal, &Self::wait_opts(wait))
    }

    /// Newest payload of `(domain, signal)`; the entry stays queued.
    pub fn get_newest_signal(&self, domain: u32, signal: u32, wait: bool) -> Result<Vec<u8>> {
        self.store()
            .fetch_newest(domain, signal, &Self::wait_opts(wait))
    }

    pub fn get_oldest_signal_by_name(
        &self,
        domain: u32,
        name: &str,
        wait: bool,
    ) -> Result<SignalResult> {
        let signal = self.store().name_to_id(domain, name)?;
        let data = self.get_oldest_signal(domain, signal, wait)?;
        Ok(SignalResult {
            domain,
            signal,
            name: Some(name.to_string()),
            data,
        })
    }

    pub fn get_newest_signal_by_name(
        &self,
        domain: u32,
        name: &str,
        wait: bool,
    ) -> Result<SignalResult> {
        let signal = self.store().name_to_id(domain, name)?;
        let data = self.get_newest_signal(domain, signal, wait)?;
        Ok(SignalResult {
            domain,
            signal,
            name: Some(name.to_string()),
            data,
        })
    }

    pub fn flush_signal(&self, domain: u32, signal: u32) -> Result<()> {
        self.store().flush(domain, signal)
    }

    pub fn flush_signal_by_name(&self, domain: u32, name: &str) -> Result<()> {
        let signal = self.store().name_to_id(domain, name)?;
        self.store().flush(domain, signal)
    }

    // ---- name and id resolution --------------------------------------

    pub fn name_to_id(&self, domain: u32, name: &str) -> Result<u32> {
        self.store().name_to_id(domain, name)
    }

    pub fn id_to_name(&self, domain: u32, signal: u32) -> Result<Option<String>> {
        self.store().id_to_name(domain, signal)
    }

    pub fn private_to_id(&self, domain: u32, private: u32) -> Result<u32> {
        self.store().private_to_id(domain, private)
    }

    // ---- groups ------------------------------------------------------

    pub fn create_signal_group(&self, group_id: u32) -> Result<()> {
        self.groups().create(group_id)
    }

    pub fn delete_signal_group(&self, group_id: u32) -> Result<()> {
        self.groups().delete(group_id)
    }

    pub fn add_signal_to_group(&self, domain: u32, signal: u32, group_id: u32) -> Result<()> {
        let sl_off = self
            .store()
            .lookup(domain, signal)
            .ok_or(VsiError::UnknownSignal)?;
        self.groups().add_member(group_id, sl_off)
    }

    pub fn add_signal_to_group_by_name(
        &self,
        domain: u32,
        name: &str,
        group_id: u32,
    ) -> Result<()> {
        let sl_off = self
            .store()
            .lookup_by_name(domain, name)
            .ok_or(VsiError::UnknownSignal)?;
        self.groups().add_member(group_id, sl_off)
    }

    pub fn remove_signal_from_group(&self, domain: u32, signal: u32, group_id: u32) -> Result<()> {
        let sl_off = self
            .store()
            .lookup(domain, signal)
            .ok_or(VsiError::UnknownSignal)?;
        self.groups().remove_member(group_id, sl_off)
    }

    pub fn remove_signal_from_group_by_name(
        &self,
        domain: u32,
        name: &str,
        group_id: u32,
    ) -> Result<()> {
        let sl_off = self
            .store()
            .lookup_by_name(domain, name)
            .ok_or(VsiError::UnknownSignal)?;
        self.groups().remove_member(group_id, sl_off)
    }

    /// Oldest payload of each member, non-blocking; slot order matches
    /// member insertion order, status per slot.
    pub fn get_oldest_in_group(&self, group_id: u32) -> Result<Vec<GroupSlot>> {
        self.groups().fetch_all(group_id, false)
    }

    /// Newest payload of each member, non-blocking and non-destructive.
    pub fn get_newest_in_group(&self, group_id: u32) -> Result<Vec<GroupSlot>> {
        self.groups().fetch_all(group_id, true)
    }

    /// Like [`Vsi::get_oldest_in_group`], but each slot waits for its
    /// member to produce (bounded by `timeout`).
    pub fn get_oldest_in_group_wait(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<GroupSlot>> {
        self.groups().listen_all(group_id, timeout, false)
    }

    pub fn get_newest_in_group_wait(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<GroupSlot>> {
        self.groups().listen_all(group_id, timeout, true)
    }

    /// Block until any member of the group has data; exactly one payload
    /// is consumed, from the member that produced first.
    pub fn listen_any_in_group(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
    ) -> Result<SignalResult> {
        let (domain, signal, data) = self.groups().listen_any(group_id, timeout)?;
        Ok(SignalResult {
            domain,
            signal,
            name: self.store().id_to_name(domain, signal)?,
            data,
        })
    }

    /// Block until every member of the group has produced (or timed
    /// out); one destructive fetch per member.
    pub fn listen_all_in_group(
        &self,
        group_id: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<GroupSlot>> {
        self.groups().listen_all(group_id, timeout, false)
    }

    pub fn flush_group(&self, group_id: u32) -> Result<()> {
        self.groups().flush(group_id)
    }

    // ---- introspection -----------------------------------------------

    pub fn memory_stats(&self) -> Result<MemoryStats> {
        Allocator::new(&self.seg).stats()
    }

    pub fn signals(&self) -> Result<Vec<SignalInfo>> {
        self.store().signals()
    }

    pub fn signal_groups(&self) -> Result<Vec<GroupInfo>> {
        self.groups().groups()
    }

    /// Walk every tree and both free lists, verifying the structural
    /// invariants. Diagnostic surface behind `dump`.
    pub fn verify(&self) -> Result<()> {
        self.seg.free_by_size().check_invariants()?;
        self.seg.free_by_offset().check_invariants()?;
        self.seg.signal_id_index().check_invariants()?;
        self.seg.signal_name_index().check_invariants()?;
        self.seg.private_id_index().check_invariants()?;
        self.seg.group_id_index().check_invariants()?;
        Allocator::new(&self.seg).check_free_lists()
    }
}
