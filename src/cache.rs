//! Short-TTL read-through cache for recent-event pages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::EventStore;
use crate::types::{Event, EventFilter, RECENT_KEY_PREFIX};

/// A cached query result. `Empty` is a real hit, distinct from a miss.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPage {
    Empty,
    Events(Vec<Event>),
}

impl CachedPage {
    pub fn from_events(events: &[Event]) -> Self {
        if events.is_empty() {
            CachedPage::Empty
        } else {
            CachedPage::Events(events.to_vec())
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        match self {
            CachedPage::Empty => Vec::new(),
            CachedPage::Events(events) => events,
        }
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CachedPage>>;

    async fn put(&self, key: &str, value: CachedPage, ttl: Duration) -> anyhow::Result<()>;

    /// Drop every entry whose key starts with `prefix`. Returns how many were dropped.
    async fn invalidate_prefix(&self, prefix: &str) -> anyhow::Result<usize>;
}

struct CacheEntry {
    value: CachedPage,
    expires_at: DateTime<Utc>,
}

/// In-process cache backend. Expiry is checked lazily against the injected clock.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CachedPage>> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries are dropped on the read that notices them.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, value: CachedPage, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// `queryRecent` served through the cache.
///
/// Inserts do not invalidate; a freshly fired event may take up to one TTL to
/// appear. The sweeper invalidates the whole recent key space after each pass.
pub struct RecentEvents {
    store: Arc<EventStore>,
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    read_retries: u32,
}

impl RecentEvents {
    pub fn new(
        store: Arc<EventStore>,
        cache: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        read_retries: u32,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            ttl,
            read_retries,
        }
    }

    pub async fn query_recent(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let key = filter.recent_cache_key();

        match self.cache.get(&key).await {
            Ok(Some(page)) => {
                debug!(key = %key, "Recent events cache hit");
                return Ok(page.into_events());
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache read failed, falling back to store"),
        }

        let events = self.load(filter).await?;

        if let Err(e) = self
            .cache
            .put(&key, CachedPage::from_events(&events), self.ttl)
            .await
        {
            warn!(key = %key, error = %e, "Failed to populate recent events cache");
        }
        Ok(events)
    }

    /// Drop every cached recent-events page.
    pub async fn invalidate_all(&self) -> anyhow::Result<usize> {
        self.cache.invalidate_prefix(RECENT_KEY_PREFIX).await
    }

    async fn load(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut attempt = 0;
        loop {
            match self.store.query_recent(filter, self.clock.now()).await {
                Ok(events) => return Ok(events),
                Err(e) if e.is_retriable() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Recent events read failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
