// ==============================================
// CONCURRENCY TESTS (integration)
// ==============================================
//
// Races between readers, writers, the eviction worker, and the bulk
// operations. These require multi-threaded execution and cannot live
// inline.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shardlru::cache::Cache;
use shardlru::config::Configuration;

const TTL: Duration = Duration::from_secs(60);

// ==============================================
// Accounting under mixed concurrent ops
// ==============================================
//
// With buffers large enough that no promotion hint is dropped, every
// entry that survives in a shard must be linked and accounted exactly
// once after a final sync_updates.

mod accounting {
    use super::*;

    #[test]
    fn size_matches_item_count_after_concurrent_churn() {
        let threads = 8;
        let ops = 400;
        let cache: Arc<Cache<usize>> = Arc::new(
            Cache::with_config(
                Configuration::new()
                    .promote_buffer(65536)
                    .delete_buffer(65536),
            )
            .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..ops {
                        let key = ((tid * 31 + i * 17) % 64).to_string();
                        cache.set(&key, i, TTL);
                        if i % 2 == 0 {
                            let _ = cache.get(&key);
                        }
                        if i % 5 == 0 {
                            let _ = cache.delete(&((i % 64).to_string()));
                        }
                        if i % 7 == 0 {
                            let _ = cache.replace(&key, i + 1);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.sync_updates();
        assert_eq!(cache.get_size(), cache.item_count() as i64);

        // every reachable key must actually resolve
        let mut reachable = 0;
        cache.for_each(|_, _| {
            reachable += 1;
            true
        });
        assert_eq!(reachable, cache.item_count());
    }
}

// ==============================================
// Readers race one writer on a hot key
// ==============================================

mod hot_key {
    use super::*;

    #[test]
    fn readers_observe_monotonic_replacements() {
        let cache: Arc<Cache<usize>> = Arc::new(Cache::with_config(Configuration::new()).unwrap());
        cache.set("hot", 0, TTL);

        let readers = 4;
        let writes = 2000;
        let barrier = Arc::new(Barrier::new(readers + 1));

        let mut handles: Vec<_> = (0..readers)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut last = 0;
                    for _ in 0..writes {
                        let seen = cache.get("hot").unwrap().value();
                        assert!(seen >= last, "value went backwards: {seen} < {last}");
                        last = seen;
                    }
                })
            })
            .collect();

        let writer = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 1..=writes {
                    cache.replace("hot", i);
                }
            })
        };
        handles.push(writer);

        for handle in handles {
            handle.join().unwrap();
        }
    }
}

// ==============================================
// Pins hold against a churning eviction worker
// ==============================================

mod pinning {
    use super::*;

    #[test]
    fn pinned_entries_survive_concurrent_evictions() {
        let cache: Arc<Cache<usize>> = Arc::new(
            Cache::with_config(
                Configuration::new()
                    .track()
                    .max_size(50)
                    .items_to_prune(10)
                    .promote_buffer(65536)
                    .delete_buffer(65536),
            )
            .unwrap(),
        );

        let pins: Vec<_> = (0..5)
            .map(|i| cache.tracking_set(&format!("pin{i}"), i, TTL))
            .collect();
        cache.sync_updates();

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..1000 {
                        cache.set(&format!("churn-{tid}-{i}"), i, TTL);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        cache.sync_updates();

        for i in 0..5 {
            assert_eq!(
                cache.get(&format!("pin{i}")).unwrap().value(),
                i,
                "pinned entry pin{i} was evicted"
            );
        }

        // released pins become ordinary eviction candidates
        drop(pins);
        cache.set_max_size(1);
        cache.sync_updates();
        assert_eq!(cache.item_count(), 1);
    }
}

// ==============================================
// Clear races writers and bulk deletes
// ==============================================
//
// Small buffers on purpose: a full deletions channel plus an all-shard
// clear is the deadlock-prone corner.

mod clearing {
    use super::*;

    #[test]
    fn clear_never_deadlocks_against_writers() {
        let cache: Arc<Cache<usize>> = Arc::new(
            Cache::with_config(
                Configuration::new()
                    .buckets(4)
                    .promote_buffer(4)
                    .delete_buffer(4),
            )
            .unwrap(),
        );

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads + 1));
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..300 {
                        cache.set(&format!("{tid}-{i}"), i, TTL);
                        if i % 10 == 0 {
                            let _ = cache.delete_prefix(&format!("{tid}-"));
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        for _ in 0..20 {
            cache.clear();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // quiesced: one final clear must leave nothing behind
        cache.clear();
        cache.sync_updates();
        assert_eq!(cache.item_count(), 0);
        assert_eq!(cache.get_size(), 0);
    }
}

// ==============================================
// Stop during activity
// ==============================================

mod stopping {
    use super::*;

    #[test]
    fn stop_midstream_is_quiet() {
        let cache: Arc<Cache<usize>> = Arc::new(Cache::with_config(Configuration::new()).unwrap());
        let barrier = Arc::new(Barrier::new(3));

        let workers: Vec<_> = (0..2)
            .map(|tid| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..500 {
                        cache.set(&format!("{tid}-{i}"), i, TTL);
                        let _ = cache.get(&format!("{tid}-{i}"));
                        let _ = cache.delete(&format!("{tid}-{}", i / 2));
                    }
                })
            })
            .collect();

        barrier.wait();
        cache.stop();
        for handle in workers {
            handle.join().unwrap();
        }

        // after stop: shard data intact, control ops return defaults
        assert_eq!(cache.get_size(), 0);
        assert_eq!(cache.get_dropped(), 0);
        cache.sync_updates();
    }
}
