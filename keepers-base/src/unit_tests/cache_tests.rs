// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use super::{CacheCleaner, Expiration, TtlCache};
use crate::time::{timer, Duration};

const TTL: Duration = Duration::from_secs(60);

/// Tests that a value is visible before its time-to-live elapses and invisible afterwards,
/// even though nothing swept the cache.
#[tokio::test(start_paused = true)]
async fn test_value_expires_without_sweeping() {
    let cache = TtlCache::<u64, &str>::new(TTL);
    cache.set(1, "one", Expiration::Default);

    timer::advance(TTL - Duration::from_millis(1)).await;
    assert_eq!(cache.get(&1), Some("one"));

    timer::advance(Duration::from_millis(1)).await;
    assert_eq!(cache.get(&1), None);
    assert!(!cache.contains_key(&1));
    // The entry is still physically present until swept.
    assert_eq!(cache.len(), 1);
}

/// Tests per-entry expirations overriding the default.
#[tokio::test(start_paused = true)]
async fn test_explicit_expirations() {
    let cache = TtlCache::<u64, u64>::new(TTL);
    cache.set(1, 10, Expiration::After(Duration::from_secs(1)));
    cache.set(2, 20, Expiration::Never);

    timer::advance(TTL * 100).await;
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.get(&2), Some(20));
}

/// Tests that `update` sees the live value and can decline to write.
#[tokio::test(start_paused = true)]
async fn test_update_reads_and_replaces() {
    let cache = TtlCache::<&str, u64>::new(TTL);

    assert!(cache.update("max", Expiration::Default, |current| {
        assert_eq!(current, None);
        Some(5)
    }));
    assert!(!cache.update("max", Expiration::Default, |current| {
        assert_eq!(current, Some(&5));
        None
    }));
    assert!(cache.update("max", Expiration::Default, |current| {
        current.map(|value| value + 1)
    }));
    assert_eq!(cache.get(&"max"), Some(6));

    timer::advance(TTL).await;
    assert!(cache.update("max", Expiration::Default, |current| {
        assert_eq!(current, None, "expired values are not handed to `update`");
        Some(1)
    }));
    assert_eq!(cache.get(&"max"), Some(1));
}

/// Tests removing values.
#[tokio::test(start_paused = true)]
async fn test_remove() {
    let cache = TtlCache::<u64, u64>::new(TTL);
    cache.set(1, 1, Expiration::Default);
    cache.set(2, 2, Expiration::After(Duration::from_secs(1)));
    timer::advance(Duration::from_secs(2)).await;

    assert_eq!(cache.remove(&1), Some(1));
    assert_eq!(cache.remove(&2), None);
    assert!(cache.is_empty());
}

/// Tests the explicit eviction of expired entries.
#[tokio::test(start_paused = true)]
async fn test_evict_expired() {
    let cache = TtlCache::<u64, u64>::new(TTL);
    for key in 0..10 {
        let expiration = if key % 2 == 0 {
            Expiration::After(Duration::from_secs(1))
        } else {
            Expiration::Default
        };
        cache.set(key, key, expiration);
    }

    timer::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.evict_expired(), 5);
    assert_eq!(cache.len(), 5);
    assert_eq!(cache.evict_expired(), 0);
}

/// Tests that the cleaner sweeps expired entries in the background.
#[test_log::test(tokio::test(start_paused = true))]
async fn test_cleaner_sweeps_expired_entries() {
    let cache = Arc::new(TtlCache::<u64, u64>::new(Duration::from_secs(1)));
    let cleaner = CacheCleaner::spawn(&cache, Duration::from_secs(5));
    cache.set(1, 1, Expiration::Default);
    cache.set(2, 2, Expiration::Never);

    timer::sleep(Duration::from_secs(6)).await;
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&2), Some(2));

    cleaner.stop();
    cleaner.stop();
    assert!(cleaner.is_stopped());
}

/// Tests that a stopped cleaner no longer sweeps.
#[tokio::test(start_paused = true)]
async fn test_stopped_cleaner_does_not_sweep() {
    let cache = Arc::new(TtlCache::<u64, u64>::new(Duration::from_secs(1)));
    let cleaner = CacheCleaner::spawn(&cache, Duration::from_secs(5));
    cleaner.stop();
    cache.set(1, 1, Expiration::Default);

    timer::sleep(Duration::from_secs(20)).await;
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&1), None);
}

/// Tests that dropping the cache lets the cleaner terminate without keeping it alive.
#[tokio::test(start_paused = true)]
async fn test_cleaner_does_not_keep_cache_alive() {
    let cache = Arc::new(TtlCache::<u64, u64>::new(Duration::from_secs(1)));
    let weak = Arc::downgrade(&cache);
    let cleaner = CacheCleaner::spawn(&cache, Duration::from_secs(1));

    drop(cache);
    timer::sleep(Duration::from_secs(3)).await;
    assert!(weak.upgrade().is_none());
    assert!(!cleaner.is_stopped());
}
