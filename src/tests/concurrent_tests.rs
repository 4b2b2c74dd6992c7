/// Concurrent tests: readers racing the writer, writers racing each other.
use super::{init_logging, recording_registry};
use crate::{Registry, RegistryError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

/// Test 1: many readers walk the registry while one writer churns it
#[test]
fn test_readers_walk_during_churn() {
    const READERS: usize = 4;
    const MIN_WALKS: usize = 200;
    const MIN_ROUNDS: i64 = 500;

    let (registry, freed) = recording_registry(Some(16));
    for key in 0..32 {
        registry.add(key, &format!("item-{}", key)).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let walks = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(READERS + 1));
    let mut handles = vec![];

    for _ in 0..READERS {
        let registry = registry.clone();
        let stop = stop.clone();
        let walks = walks.clone();
        let start = start.clone();

        handles.push(thread::spawn(move || {
            let reader = registry.register_reader();
            start.wait();
            while !stop.load(Ordering::Acquire) {
                let token = reader.enter();
                for item in token.iter() {
                    // A freed node would fail this sooner or later.
                    assert_eq!(item.payload(), format!("item-{}", item.key()));
                }
                drop(token);
                walks.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    start.wait();
    let walks_at_start = walks.load(Ordering::Relaxed);

    // Keep churning until the readers have finished enough walks that
    // overlapped it, not just a fixed number of rounds.
    let mut removed = 0;
    let mut round = 0i64;
    while round < MIN_ROUNDS || walks.load(Ordering::Relaxed) < walks_at_start + MIN_WALKS {
        let key = round % 32;
        if registry.remove(key).is_ok() {
            removed += 1;
        }
        registry.add(key, &format!("item-{}", key)).unwrap();
        round += 1;
    }
    let walks_during_churn = walks.load(Ordering::Relaxed) - walks_at_start;

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(walks_during_churn >= MIN_WALKS);
    assert_eq!(removed, round as usize);

    registry.shutdown().unwrap();
    let freed = freed.lock().unwrap();
    assert_eq!(freed.len(), removed + 32);
}

/// Test 2: racing writers never leave two live items with the same key
#[test]
fn test_concurrent_writers_keep_keys_unique() {
    init_logging();
    let registry = Registry::new();
    let barrier = Arc::new(Barrier::new(4));
    let mut handles = vec![];

    for writer_id in 0..4 {
        let registry = registry.clone();
        let barrier = barrier.clone();

        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut wins = 0;
            for key in 0..200 {
                match registry.add(key, &format!("w{}", writer_id)) {
                    Ok(_) => wins += 1,
                    Err(RegistryError::DuplicateKey(dup)) => assert_eq!(dup, key),
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
            wins
        }));
    }

    let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total_wins, 200);

    let entries = registry.entries();
    assert_eq!(entries.len(), 200);
    let keys: HashSet<i64> = entries.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys.len(), 200);
}

/// Test 3: racing adds and removes on overlapping keys
#[test]
fn test_mixed_writers_keep_keys_unique() {
    let registry = Registry::builder().auto_reclaim_threshold(8).build();
    let mut handles = vec![];

    for seed in 0..4i64 {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for i in 0..300i64 {
                let key = (i * 7 + seed) % 16;
                if i % 3 == 0 {
                    let _ = registry.remove(key);
                } else {
                    let _ = registry.add(key, "v");
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let entries = registry.entries();
    let keys: HashSet<i64> = entries.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys.len(), entries.len());
    assert_eq!(registry.stats().live, entries.len());
}

/// Test 4: once remove returns, sections entered afterwards never see the key
#[test]
fn test_removal_visible_to_later_sections() {
    const KEYS: usize = 200;

    let registry = Registry::builder().auto_reclaim_threshold(32).build();
    for key in 0..KEYS as i64 {
        registry.add(key, "v").unwrap();
    }

    let removed: Arc<Vec<AtomicBool>> = Arc::new((0..KEYS).map(|_| AtomicBool::new(false)).collect());
    let done = Arc::new(AtomicBool::new(false));
    let mut handles = vec![];

    for offset in 0..3 {
        let registry = registry.clone();
        let removed = removed.clone();
        let done = done.clone();

        handles.push(thread::spawn(move || {
            let reader = registry.register_reader();
            let mut key = offset;
            while !done.load(Ordering::Acquire) {
                let was_removed = removed[key].load(Ordering::Acquire);
                let token = reader.enter();
                if was_removed {
                    assert!(token.lookup(key as i64).is_none(), "key {} seen after removal", key);
                }
                drop(token);
                key = (key + 7) % KEYS;
            }
        }));
    }

    for key in 0..KEYS {
        registry.remove(key as i64).unwrap();
        removed[key].store(true, Ordering::Release);
    }

    done.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(registry.entries().is_empty());
}

/// Test 5: a section opened before a removal keeps reading while the
/// writer keeps trying to reclaim
#[test]
fn test_section_survives_concurrent_reclaim_attempts() {
    let (registry, freed) = recording_registry(None);
    for key in 0..10 {
        registry.add(key, &format!("p{}", key)).unwrap();
    }

    let finishing = Arc::new(AtomicBool::new(false));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (removed_tx, removed_rx) = mpsc::channel::<()>();

    let reader_registry = registry.clone();
    let reader_finishing = finishing.clone();
    let reader_thread = thread::spawn(move || {
        let reader = reader_registry.register_reader();
        let token = reader.enter();
        let victim = token.lookup(5).unwrap();
        entered_tx.send(()).unwrap();

        removed_rx.recv().unwrap();
        for _ in 0..100 {
            for item in token.iter() {
                assert_eq!(item.payload(), format!("p{}", item.key()));
            }
            assert_eq!(victim.payload(), "p5");
            thread::yield_now();
        }
        assert_eq!(victim.retire_epoch(), Some(0));

        reader_finishing.store(true, Ordering::SeqCst);
        drop(token);
    });

    entered_rx.recv().unwrap();
    registry.remove(5).unwrap();
    removed_tx.send(()).unwrap();

    let mut reclaimed = 0;
    while !reader_thread.is_finished() {
        let freed_now = registry.force_reclaim().unwrap();
        if freed_now > 0 {
            // Only possible once the section is over.
            assert!(finishing.load(Ordering::SeqCst));
            reclaimed += freed_now;
            break;
        }
        thread::yield_now();
    }
    reader_thread.join().unwrap();

    reclaimed += registry.force_reclaim().unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(*freed.lock().unwrap(), vec![5]);
}

/// Test 6: concurrent drains free every item exactly once
#[test]
fn test_concurrent_drains_free_once() {
    let (registry, freed) = recording_registry(None);
    for key in 0..500 {
        registry.add(key, "v").unwrap();
    }
    for key in 0..500 {
        registry.remove(key).unwrap();
    }

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.force_reclaim().unwrap()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 500);

    let freed = freed.lock().unwrap();
    let unique: HashSet<i64> = freed.iter().copied().collect();
    assert_eq!(freed.len(), 500);
    assert_eq!(unique.len(), 500);
}

/// Test 7: shutdown waits for readers that are still finishing
#[test]
fn test_shutdown_waits_for_readers() {
    let (registry, freed) = recording_registry(Some(4));
    for key in 0..20 {
        registry.add(key, "v").unwrap();
    }

    let exited = Arc::new(AtomicBool::new(false));
    let (entered_tx, entered_rx) = mpsc::channel();
    let reader_registry = registry.clone();
    let reader_exited = exited.clone();
    let reader_thread = thread::spawn(move || {
        let reader = reader_registry.register_reader();
        let token = reader.enter();
        entered_tx.send(()).unwrap();
        thread::sleep(std::time::Duration::from_millis(50));
        let seen = token.iter().count();
        reader_exited.store(true, Ordering::SeqCst);
        drop(token);
        seen
    });

    entered_rx.recv().unwrap();
    registry.shutdown().unwrap();

    // The reader had to leave its section for shutdown to finish.
    assert!(exited.load(Ordering::SeqCst));
    let seen = reader_thread.join().unwrap();
    assert!(seen <= 20);

    assert_eq!(freed.lock().unwrap().len(), 20);
    assert!(registry.entries().is_empty());
}
