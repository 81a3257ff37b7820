// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Concurrent caches whose entries expire after a time-to-live.
//!
//! Expired entries are never returned, whether or not they have been swept yet. A
//! [`CacheCleaner`] can be attached to a cache to physically remove them at a fixed
//! interval and keep memory bounded.

#[cfg(test)]
#[path = "unit_tests/cache_tests.rs"]
mod unit_tests;

use std::{
    hash::Hash,
    sync::{Arc, Weak},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::time::{timer, Duration, Instant};

/// How long an entry stays in a [`TtlCache`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Expiration {
    /// Use the cache's default time-to-live.
    #[default]
    Default,
    /// Expire after the given duration.
    After(Duration),
    /// Never expire.
    Never,
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// A concurrent key-value cache with per-entry expiration.
///
/// This is not an LRU: entries are only ever removed because they expired or were removed
/// explicitly.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache whose entries live for `default_ttl` unless told otherwise.
    pub fn new(default_ttl: Duration) -> Self {
        TtlCache {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Returns the time-to-live used for [`Expiration::Default`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn deadline(&self, expiration: Expiration, now: Instant) -> Option<Instant> {
        match expiration {
            Expiration::Default => Some(now + self.default_ttl),
            Expiration::After(ttl) => Some(now + ttl),
            Expiration::Never => None,
        }
    }

    /// Inserts or replaces the value for `key`.
    pub fn set(&self, key: K, value: V, expiration: Expiration) {
        let expires_at = self.deadline(expiration, Instant::now());
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Returns a copy of the value for `key`, unless it is missing or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Returns whether a live entry exists for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Atomically reads and replaces the value for `key`.
    ///
    /// `update` receives the current live value, if any. If it returns a new value, that
    /// value is stored with the given expiration. Returns whether the entry was written.
    ///
    /// No other operation on the same key can interleave with `update`.
    pub fn update<F>(&self, key: K, expiration: Expiration, update: F) -> bool
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let now = Instant::now();
        let expires_at = self.deadline(expiration, now);
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                let current = if entry.is_expired(now) {
                    None
                } else {
                    Some(&entry.value)
                };
                match update(current) {
                    Some(value) => {
                        occupied.insert(CacheEntry { value, expires_at });
                        true
                    }
                    None => false,
                }
            }
            Entry::Vacant(vacant) => match update(None) {
                Some(value) => {
                    vacant.insert(CacheEntry { value, expires_at });
                    true
                }
                None => false,
            },
        }
    }

    /// Removes the entry for `key`, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (_, entry) = self.entries.remove(key)?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    /// Returns the number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            trace!(count = evicted, "evicted expired cache entries");
        }
        evicted
    }
}

/// A background task that periodically removes expired entries from a [`TtlCache`].
///
/// The task only holds a weak reference to the cache and exits on its own once the cache
/// is dropped. It is also stopped when the cleaner is dropped.
pub struct CacheCleaner {
    cancellation: CancellationToken,
}

impl CacheCleaner {
    /// Spawns a task sweeping `cache` every `interval`. Must be called within a Tokio
    /// runtime.
    pub fn spawn<K, V>(cache: &Arc<TtlCache<K, V>>, interval: Duration) -> Self
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let cancellation = CancellationToken::new();
        tokio::spawn(Self::run(
            Arc::downgrade(cache),
            interval,
            cancellation.clone(),
        ));
        CacheCleaner { cancellation }
    }

    async fn run<K, V>(
        cache: Weak<TtlCache<K, V>>,
        interval: Duration,
        cancellation: CancellationToken,
    ) where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let mut ticker = timer::interval(interval);
        ticker.set_missed_tick_behavior(timer::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(cache) = cache.upgrade() else {
                break;
            };
            cache.evict_expired();
        }
        debug!("cache cleaner stopped");
    }

    /// Stops the sweeping task. Calling this more than once has no further effect.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Returns whether [`CacheCleaner::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Drop for CacheCleaner {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
