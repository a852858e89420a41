//! Time-bounded cache of per-session pipelines
//!
//! Lookup, build and insert on a miss run inside one critical section, so at
//! most one build is in flight per cache and concurrent requests for the same
//! session wait for it instead of issuing their own certificate.
//!
//! Entry lifetime is `min(pipeline TTL, session expiry - now)`, computed
//! before the build starts. Session expiry is wall-clock time; the resulting
//! deadline is tracked on the monotonic clock.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use trellis_common::metrics::record_cache_lookup;

use crate::error::{Error, Result};
use crate::session::SessionKey;

struct CacheEntry<V> {
    value: V,
    deadline: Instant,
    last_used: u64,
}

struct CacheState<V> {
    entries: HashMap<SessionKey, CacheEntry<V>>,
    tick: u64,
}

/// TTL-bounded map from session key to a shared value
pub struct SessionCache<V> {
    state: Mutex<CacheState<V>>,
    ttl: Duration,
    min_ttl: Duration,
    capacity: usize,
}

impl<V: Clone> SessionCache<V> {
    /// Create a cache
    ///
    /// Entries live at most `ttl`; builds whose lifetime would be at or below
    /// `min_ttl` are refused. At most `capacity` entries are kept.
    pub fn new(ttl: Duration, min_ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            }),
            ttl,
            min_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Return the live entry for `key`, building and inserting it if absent
    ///
    /// A failed build leaves the cache untouched.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &SessionKey,
        session_expires_at: DateTime<Utc>,
        build: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tick += 1;
        let tick = state.tick;

        let stale = match state.entries.get_mut(key) {
            Some(entry) if entry.deadline > now => {
                entry.last_used = tick;
                record_cache_lookup(true);
                return Ok(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            state.entries.remove(key);
        }
        record_cache_lookup(false);

        let ttl = self.entry_ttl(key, session_expires_at)?;
        let deadline = now + ttl;

        let value = build().await?;

        self.make_room(&mut state, Instant::now());
        state.entries.insert(
            key.clone(),
            CacheEntry {
                value: value.clone(),
                deadline,
                last_used: tick,
            },
        );
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cached pipeline");

        Ok(value)
    }

    fn entry_ttl(&self, key: &SessionKey, session_expires_at: DateTime<Utc>) -> Result<Duration> {
        let remaining = (session_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ttl = self.ttl.min(remaining);
        if ttl <= self.min_ttl {
            debug!(
                key = %key,
                remaining_ms = remaining.as_millis() as u64,
                "Session too close to expiry"
            );
            return Err(Error::SessionExpired {
                cluster: key.cluster.clone(),
            });
        }
        Ok(ttl)
    }

    fn make_room(&self, state: &mut CacheState<V>, now: Instant) {
        if state.entries.len() < self.capacity {
            return;
        }
        state.entries.retain(|_, entry| entry.deadline > now);
        if state.entries.len() < self.capacity {
            return;
        }
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!(key = %key, "Evicting least recently used pipeline");
            state.entries.remove(&key);
        }
    }

    /// Drop every entry whose TTL has elapsed, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.deadline > now);
        before - state.entries.len()
    }

    /// Number of entries, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Check if the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
