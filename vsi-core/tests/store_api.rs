//! End-to-end exercises of the public surface: definition round trips,
//! oldest/newest semantics, group aggregation, blocking fetches across
//! threads, and allocator restoration after churn.

use std::thread;
use std::time::Duration;

use vsi_core::{Vsi, VsiConfig, VsiError};

fn config(dir: &tempfile::TempDir) -> VsiConfig {
    VsiConfig {
        segment_path: dir.path().join("segment.db"),
        segment_size: 8 * 1024 * 1024,
        system_area_size: 512 * 1024,
        max_name_len: 255,
    }
}

fn new_vsi(dir: &tempfile::TempDir) -> Vsi {
    Vsi::initialize(&config(dir), true).unwrap()
}

fn queue_len(vsi: &Vsi, domain: u32, signal: u32) -> u32 {
    vsi.signals()
        .unwrap()
        .iter()
        .find(|s| s.domain == domain && s.signal == signal)
        .map(|s| s.queued)
        .unwrap_or(0)
}

#[test]
fn define_and_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 42, 0, "bar").unwrap();
    vsi.insert_signal(1, 42, &[0x41, 0x42, 0x43]).unwrap();
    let data = vsi.get_oldest_signal(1, 42, false).unwrap();
    assert_eq!(data, b"ABC");
    assert!(matches!(
        vsi.get_oldest_signal(1, 42, false),
        Err(VsiError::NoData)
    ));
}

#[test]
fn name_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 42, 0, "bar").unwrap();
    assert_eq!(vsi.name_to_id(1, "bar").unwrap(), 42);
    assert_eq!(vsi.id_to_name(1, 42).unwrap().as_deref(), Some("bar"));
    assert!(matches!(
        vsi.name_to_id(1, "missing"),
        Err(VsiError::UnknownSignal)
    ));
}

#[test]
fn oldest_vs_newest() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    for v in [41u8, 42, 43] {
        vsi.insert_signal(1, 42, &[v]).unwrap();
    }
    assert_eq!(vsi.get_newest_signal(1, 42, false).unwrap(), [43]);
    assert_eq!(queue_len(&vsi, 1, 42), 3);
    assert_eq!(vsi.get_oldest_signal(1, 42, false).unwrap(), [41]);
    assert_eq!(queue_len(&vsi, 1, 42), 2);
    assert_eq!(vsi.get_oldest_signal(1, 42, false).unwrap(), [42]);
    assert_eq!(queue_len(&vsi, 1, 42), 1);
    assert_eq!(vsi.get_newest_signal(1, 42, false).unwrap(), [43]);
    assert_eq!(queue_len(&vsi, 1, 42), 1);
}

#[test]
fn group_newest_follows_member_order() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.define_signal(1, 12, 0, "ivi").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group_by_name(1, "gen", 10).unwrap();
    vsi.add_signal_to_group_by_name(1, "ivi", 10).unwrap();

    vsi.insert_signal(1, 11, &[48]).unwrap();
    vsi.insert_signal(1, 11, &[49]).unwrap();
    vsi.insert_signal(1, 12, &[50]).unwrap();
    vsi.insert_signal(1, 12, &[51]).unwrap();

    let slots = vsi.get_newest_in_group(10).unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!((slots[0].domain, slots[0].signal), (1, 11));
    assert_eq!(slots[0].result.as_deref().unwrap(), &[49]);
    assert_eq!((slots[1].domain, slots[1].signal), (1, 12));
    assert_eq!(slots[1].result.as_deref().unwrap(), &[51]);
    // Newest is non-destructive.
    assert_eq!(queue_len(&vsi, 1, 11), 2);
    assert_eq!(queue_len(&vsi, 1, 12), 2);
}

#[test]
fn flush_restores_allocator_state() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    for s in 1..=4u32 {
        vsi.define_signal(1, s, 0, &format!("sig{s}")).unwrap();
    }
    let before = vsi.memory_stats().unwrap();

    // Mixed sizes across signals, flushed in a different order.
    for s in 1..=4u32 {
        for i in 0..20u8 {
            vsi.insert_signal(1, s, &vec![i; 1 + (i as usize * 7) % 60])
                .unwrap();
        }
    }
    assert!(vsi.memory_stats().unwrap().free_bytes < before.free_bytes);
    for s in [3u32, 1, 4, 2] {
        vsi.flush_signal(1, s).unwrap();
    }
    assert_eq!(vsi.memory_stats().unwrap(), before);
    vsi.verify().unwrap();
}

#[test]
fn blocking_fetch_unblocks_on_insert() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 42, 0, "bar").unwrap();
    thread::scope(|s| {
        let consumer = s.spawn(|| vsi.get_oldest_signal(1, 42, true));
        thread::sleep(Duration::from_millis(100));
        vsi.insert_signal(1, 42, &[0x7]).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), [0x7]);
    });
}

#[test]
fn one_wakeup_per_insert() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 42, 0, "bar").unwrap();
    thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut got = Vec::new();
            for _ in 0..5 {
                got.push(vsi.get_oldest_signal(1, 42, true).unwrap()[0]);
            }
            got
        });
        for v in 0..5u8 {
            vsi.insert_signal(1, 42, &[v]).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3, 4]);
    });
    assert!(matches!(
        vsi.get_oldest_signal(1, 42, false),
        Err(VsiError::NoData)
    ));
}

#[test]
fn concurrent_producers_preserve_fifo_per_signal() {
    const SIGNALS: u32 = 4;
    const ITEMS: u32 = 100;

    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    for s in 1..=SIGNALS {
        vsi.define_signal(1, s, 0, &format!("chan{s}")).unwrap();
    }
    let idle = vsi.memory_stats().unwrap();

    thread::scope(|scope| {
        for s in 1..=SIGNALS {
            let vsi = &vsi;
            scope.spawn(move || {
                for i in 0..ITEMS {
                    vsi.insert_signal(1, s, &i.to_le_bytes()).unwrap();
                }
            });
            scope.spawn(move || {
                for expect in 0..ITEMS {
                    let data = vsi.get_oldest_signal(1, s, true).unwrap();
                    let got = u32::from_le_bytes(data.try_into().unwrap());
                    assert_eq!(got, expect, "signal {s} out of order");
                }
            });
        }
    });

    for s in 1..=SIGNALS {
        assert_eq!(queue_len(&vsi, 1, s), 0);
    }
    // Every payload block went back to the arena.
    assert_eq!(vsi.memory_stats().unwrap(), idle);
    vsi.verify().unwrap();
}

#[test]
fn listen_any_consumes_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.define_signal(1, 12, 0, "ivi").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group(1, 11, 10).unwrap();
    vsi.add_signal_to_group(1, 12, 10).unwrap();

    thread::scope(|s| {
        let listener = s.spawn(|| vsi.listen_any_in_group(10, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(100));
        vsi.insert_signal(1, 12, &[0x55]).unwrap();
        let result = listener.join().unwrap().unwrap();
        assert_eq!((result.domain, result.signal), (1, 12));
        assert_eq!(result.name.as_deref(), Some("ivi"));
        assert_eq!(result.data, [0x55]);
    });
    // The winning queue was drained; nothing else was touched.
    assert_eq!(queue_len(&vsi, 1, 11), 0);
    assert_eq!(queue_len(&vsi, 1, 12), 0);
}

#[test]
fn listen_any_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group(1, 11, 10).unwrap();
    assert!(matches!(
        vsi.listen_any_in_group(10, Some(Duration::from_millis(80))),
        Err(VsiError::Timeout)
    ));
}

#[test]
fn listen_all_waits_for_every_member() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.define_signal(1, 12, 0, "ivi").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group(1, 11, 10).unwrap();
    vsi.add_signal_to_group(1, 12, 10).unwrap();

    vsi.insert_signal(1, 11, &[1]).unwrap();
    thread::scope(|s| {
        let listener = s.spawn(|| vsi.listen_all_in_group(10, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(100));
        vsi.insert_signal(1, 12, &[2]).unwrap();
        let slots = listener.join().unwrap().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].result.as_deref().unwrap(), &[1]);
        assert_eq!(slots[1].result.as_deref().unwrap(), &[2]);
    });
}

#[test]
fn listen_all_reports_per_slot_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.define_signal(1, 12, 0, "ivi").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group(1, 11, 10).unwrap();
    vsi.add_signal_to_group(1, 12, 10).unwrap();

    vsi.insert_signal(1, 11, &[9]).unwrap();
    let slots = vsi
        .listen_all_in_group(10, Some(Duration::from_millis(80)))
        .unwrap();
    assert_eq!(slots[0].result.as_deref().unwrap(), &[9]);
    assert!(matches!(slots[1].result, Err(VsiError::Timeout)));
}

#[test]
fn group_flush_and_membership_changes() {
    let dir = tempfile::tempdir().unwrap();
    let vsi = new_vsi(&dir);
    vsi.define_signal(1, 11, 0, "gen").unwrap();
    vsi.define_signal(1, 12, 0, "ivi").unwrap();
    vsi.create_signal_group(10).unwrap();
    vsi.add_signal_to_group(1, 11, 10).unwrap();
    vsi.add_signal_to_group(1, 12, 10).unwrap();

    vsi.insert_signal(1, 11, &[1]).unwrap();
    vsi.insert_signal(1, 12, &[2]).unwrap();
    vsi.flush_group(10).unwrap();
    assert_eq!(queue_len(&vsi, 1, 11), 0);
    assert_eq!(queue_len(&vsi, 1, 12), 0);

    vsi.remove_signal_from_group(1, 11, 10).unwrap();
    let slots = vsi.get_oldest_in_group(10).unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!((slots[0].domain, slots[0].signal), (1, 12));

    vsi.delete_signal_group(10).unwrap();
    assert!(matches!(
        vsi.get_oldest_in_group(10),
        Err(VsiError::UnknownGroup)
    ));
}

#[test]
fn two_handles_share_one_segment() {
    // Two mappings of the same file stand in for two processes.
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let writer = Vsi::initialize(&cfg, true).unwrap();
    writer.define_signal(1, 42, 0, "bar").unwrap();

    let reader = Vsi::initialize(&cfg, false).unwrap();
    writer.insert_signal(1, 42, b"cross").unwrap();
    assert_eq!(reader.get_oldest_signal(1, 42, false).unwrap(), b"cross");
    assert_eq!(reader.name_to_id(1, "bar").unwrap(), 42);

    // Blocking across mappings, too.
    thread::scope(|s| {
        let consumer = s.spawn(|| reader.get_oldest_signal(1, 42, true));
        thread::sleep(Duration::from_millis(100));
        writer.insert_signal(1, 42, &[0xaa]).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), [0xaa]);
    });
}

#[test]
fn reopen_without_create_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    {
        let vsi = Vsi::initialize(&cfg, true).unwrap();
        vsi.define_signal(1, 42, 7, "persisted").unwrap();
        vsi.insert_signal(1, 42, b"still here").unwrap();
    }
    let vsi = Vsi::initialize(&cfg, false).unwrap();
    assert_eq!(vsi.private_to_id(1, 7).unwrap(), 42);
    assert_eq!(vsi.get_oldest_signal(1, 42, false).unwrap(), b"still here");
    vsi.verify().unwrap();
}

#[test]
fn destroy_removes_the_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let vsi = Vsi::initialize(&cfg, true).unwrap();
    assert!(cfg.segment_path.exists());
    vsi.destroy().unwrap();
    assert!(!cfg.segment_path.exists());
    assert!(Vsi::initialize(&cfg, false).is_err());
}
