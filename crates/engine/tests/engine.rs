use std::{path::Path, sync::Arc, thread, time::Duration};

use pretty_assertions::assert_eq;
use rand::seq::SliceRandom;
use tempfile::tempdir;

use segstore_engine::{error::ReadError, Config, Engine, TOMBSTONE};

fn config(dir: &Path) -> Config {
    let mut config = Config::new(dir);
    // Keep the timer out of the way; tests drive maintenance explicitly.
    config.maintenance_interval = Duration::from_secs(3600);
    config
}

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

#[test]
fn get_on_empty_engine_is_not_found() {
    let tmp = tempdir().unwrap();
    let engine = Engine::open(config(tmp.path())).unwrap();

    assert!(matches!(engine.get("missing"), Err(ReadError::NotFound)));
}

#[test]
fn set_then_get() {
    let tmp = tempdir().unwrap();
    let engine = Engine::open(config(tmp.path())).unwrap();

    engine.set("a", b"1").unwrap();
    assert_eq!(engine.get("a").unwrap(), b"1");
}

#[test]
fn overwrite_returns_latest() {
    let tmp = tempdir().unwrap();
    let engine = Engine::open(config(tmp.path())).unwrap();

    engine.set("a", b"1").unwrap();
    engine.set("a", b"2").unwrap();
    assert_eq!(engine.get("a").unwrap(), b"2");
}

#[test]
fn delete_then_get_is_not_found() {
    let tmp = tempdir().unwrap();
    let engine = Engine::open(config(tmp.path())).unwrap();

    engine.set("a", b"1").unwrap();
    engine.delete("a").unwrap();
    assert!(matches!(engine.get("a"), Err(ReadError::NotFound)));

    // A later write resurrects the key.
    engine.set("a", b"2").unwrap();
    assert_eq!(engine.get("a").unwrap(), b"2");
}

#[test]
fn rollover_freezes_segments_and_keeps_data() {
    enable_logging();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.segment_size_threshold = 1024;
    let engine = Engine::open(cfg).unwrap();
    let initial_active = engine.segments_info().active;

    for i in 0..200u32 {
        engine.set(&format!("{i:016}"), &[i as u8; 16]).unwrap();
    }

    let info = engine.segments_info();
    assert!(!info.frozen.is_empty());
    assert_ne!(info.active, initial_active);
    for i in 0..200u32 {
        assert_eq!(engine.get(&format!("{i:016}")).unwrap(), [i as u8; 16]);
    }
}

#[test]
fn restart_recovers_state() {
    enable_logging();
    let tmp = tempdir().unwrap();
    {
        let engine = Engine::open(config(tmp.path())).unwrap();
        engine.set("a", b"1").unwrap();
        engine.set("b", b"2").unwrap();
        engine.set("a", b"3").unwrap();
        engine.delete("b").unwrap();
        engine.close();
    }

    let engine = Engine::open(config(tmp.path())).unwrap();
    assert_eq!(engine.get("a").unwrap(), b"3");
    assert!(matches!(engine.get("b"), Err(ReadError::NotFound)));
}

#[test]
fn compaction_and_merge_collapse_repeated_updates() {
    enable_logging();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.segment_size_threshold = 1024;
    let engine = Engine::open(cfg).unwrap();

    for i in 0..1000u32 {
        engine.set("k", format!("v{i}").as_bytes()).unwrap();
    }
    assert!(engine.segments_info().frozen.len() > 1);

    engine.compact().unwrap();
    engine.merge().unwrap();

    // All frozen updates of "k" collapsed into one segment holding only
    // the latest value; on disk there is just that segment plus the
    // active one.
    let info = engine.segments_info();
    assert_eq!(info.frozen.len(), 1);
    assert_eq!(engine.get("k").unwrap(), b"v999");
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 2);

    let metrics = engine.metrics().snapshot();
    assert!(metrics.total_compactions >= 1);
    assert!(metrics.total_merges >= 1);
}

#[test]
fn tombstone_is_invisible_at_every_layer() {
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.segment_size_threshold = 1024;
    let engine = Engine::open(cfg.clone()).unwrap();

    engine.set("k", b"1").unwrap();
    engine.delete("k").unwrap();
    // Push the tombstone out of the active segment.
    for i in 0..100u32 {
        engine.set(&format!("filler-{i:08}"), &[0; 16]).unwrap();
    }
    assert!(!engine.segments_info().frozen.is_empty());
    assert!(matches!(engine.get("k"), Err(ReadError::NotFound)));

    engine.compact().unwrap();
    engine.merge().unwrap();
    assert!(matches!(engine.get("k"), Err(ReadError::NotFound)));

    engine.close();
    drop(engine);
    let engine = Engine::open(cfg).unwrap();
    assert!(matches!(engine.get("k"), Err(ReadError::NotFound)));

    // Writing the marker bytes directly is indistinguishable from delete.
    engine.set("explicit", TOMBSTONE).unwrap();
    assert!(matches!(engine.get("explicit"), Err(ReadError::NotFound)));
}

#[test]
fn concurrent_writers_are_all_visible_after_reopen() {
    enable_logging();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.segment_size_threshold = 8 * 1024;
    let engine = Arc::new(Engine::open(cfg.clone()).unwrap());

    let workers = 8;
    let keys_per_worker = 100u32;
    thread::scope(|scope| {
        for worker in 0..workers {
            let engine = Arc::clone(&engine);
            scope.spawn(move || {
                for i in 0..keys_per_worker {
                    let key = format!("w{worker}-{i:06}");
                    engine.set(&key, key.as_bytes()).unwrap();
                }
            });
        }
    });

    // Validate in a shuffled order, so hits spread over all segments
    // rather than replaying the write order.
    let mut keys: Vec<String> = (0..workers)
        .flat_map(|worker| (0..keys_per_worker).map(move |i| format!("w{worker}-{i:06}")))
        .collect();
    keys.shuffle(&mut rand::rng());

    let check = |engine: &Engine| {
        for key in &keys {
            assert_eq!(engine.get(key).unwrap(), key.as_bytes());
        }
    };
    check(&engine);

    engine.close();
    drop(engine);
    let engine = Engine::open(cfg).unwrap();
    check(&engine);
}

#[test]
fn counters_track_operations() {
    let tmp = tempdir().unwrap();
    let cfg = config(tmp.path());
    let metrics = Arc::clone(&cfg.metrics);
    let engine = Engine::open(cfg).unwrap();

    engine.set("a", b"1").unwrap();
    engine.delete("a").unwrap();
    let _ = engine.get("a");

    let snap = metrics.snapshot();
    assert_eq!(snap.total_writes, 2);
    assert_eq!(snap.total_reads, 1);
}
