//! Periodic reclassification of stored events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::RecentEvents;
use crate::clock::Clock;
use crate::error::Result;
use crate::heartbeat::PeriodicJob;
use crate::store::{EventStore, ReclassifyStats};

pub struct RetentionSweeper {
    store: Arc<EventStore>,
    recent: Arc<RecentEvents>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a sweep ends, including by panic.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<EventStore>,
        recent: Arc<RecentEvents>,
        clock: Arc<dyn Clock>,
        sweep_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            recent,
            clock,
            interval: Duration::from_secs(sweep_interval_secs),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one sweep unless another is in flight, in which case `None` is returned.
    ///
    /// After the store commits, every cached recent-events page is dropped. A
    /// failed invalidation is logged and does not fail the sweep.
    pub async fn sweep_now(&self) -> Result<Option<ReclassifyStats>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep already in flight, skipping");
            return Ok(None);
        }
        let _in_flight = InFlight(&self.in_flight);

        let now = self.clock.now();
        let stats = self.store.bulk_reclassify(now).await?;

        match self.recent.invalidate_all().await {
            Ok(dropped) => debug!(dropped, "Invalidated recent events cache"),
            Err(e) => warn!(error = %e, "Cache invalidation after sweep failed"),
        }

        info!(
            transitioned = stats.transitioned,
            deleted = stats.deleted,
            "Retention sweep complete"
        );
        Ok(Some(stats))
    }

    pub fn is_sweeping(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn into_job(self: Arc<Self>) -> PeriodicJob {
        let interval = self.interval;
        PeriodicJob::new("retention_sweeper", interval, move || {
            let sweeper = self.clone();
            async move {
                sweeper.sweep_now().await?;
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CachedPage, MemoryCache};
    use crate::clock::ManualClock;
    use crate::lifecycle::{EventStatus, RetentionWindows};
    use crate::types::{EventFilter, NewEvent, Payload, TriggerKind};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct NoInvalidate(MemoryCache);

    #[async_trait]
    impl CacheBackend for NoInvalidate {
        async fn get(&self, key: &str) -> anyhow::Result<Option<CachedPage>> {
            self.0.get(key).await
        }
        async fn put(&self, key: &str, value: CachedPage, ttl: ChronoDuration) -> anyhow::Result<()> {
            self.0.put(key, value, ttl).await
        }
        async fn invalidate_prefix(&self, _prefix: &str) -> anyhow::Result<usize> {
            anyhow::bail!("invalidation unavailable")
        }
    }

    struct Fixture {
        sweeper: RetentionSweeper,
        recent: Arc<RecentEvents>,
        store: Arc<EventStore>,
        clock: Arc<ManualClock>,
        _db: tempfile::NamedTempFile,
    }

    async fn setup(broken_invalidation: bool) -> Fixture {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let pool = crate::db::connect(db_file.path().to_str().unwrap(), 5)
            .await
            .unwrap();
        let store = Arc::new(
            EventStore::new(pool, RetentionWindows::default())
                .await
                .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(t0()));
        let memory = MemoryCache::new(clock.clone());
        let cache: Arc<dyn CacheBackend> = if broken_invalidation {
            Arc::new(NoInvalidate(memory))
        } else {
            Arc::new(memory)
        };
        let recent = Arc::new(RecentEvents::new(
            store.clone(),
            cache,
            clock.clone(),
            ChronoDuration::seconds(60),
            1,
        ));
        let sweeper = RetentionSweeper::new(store.clone(), recent.clone(), clock.clone(), 1800);
        Fixture {
            sweeper,
            recent,
            store,
            clock,
            _db: db_file,
        }
    }

    async fn insert_at(store: &EventStore, at: DateTime<Utc>) -> i64 {
        let trigger = match store.find_trigger_by_name("t").await.unwrap() {
            Some(t) => t,
            None => store
                .insert_trigger(
                    "t",
                    &TriggerKind::Scheduled {
                        schedule: "5".to_string(),
                    },
                    t0(),
                )
                .await
                .unwrap(),
        };
        store
            .insert_event(NewEvent {
                trigger_id: trigger.id,
                payload: Payload::new(),
                is_test: false,
                triggered_at: at,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_transitions_deletes_and_is_idempotent() {
        let fx = setup(false).await;
        let old = insert_at(&fx.store, t0()).await;
        let aging = insert_at(&fx.store, t0() + ChronoDuration::hours(46)).await;
        fx.clock.set(t0() + ChronoDuration::hours(48) + ChronoDuration::seconds(1));
        let fresh = insert_at(&fx.store, fx.clock.now()).await;

        let stats = fx.sweeper.sweep_now().await.unwrap().unwrap();
        assert_eq!(
            stats,
            ReclassifyStats {
                transitioned: 1,
                deleted: 1
            }
        );
        let second = fx.sweeper.sweep_now().await.unwrap().unwrap();
        assert_eq!(second, ReclassifyStats::default());

        let events = fx
            .recent
            .query_recent(&EventFilter::default())
            .await
            .unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![fresh, aging]);
        assert!(!ids.contains(&old));
        assert_eq!(events[1].status, EventStatus::Archived);
        assert!(!fx.sweeper.is_sweeping());
    }

    #[tokio::test]
    async fn test_sweep_invalidates_cached_pages() {
        let fx = setup(false).await;
        insert_at(&fx.store, t0()).await;
        let filter = EventFilter::default();

        fx.clock.advance(ChronoDuration::hours(48));
        assert!(fx.recent.query_recent(&filter).await.unwrap().is_empty());
        insert_at(&fx.store, fx.clock.now()).await;
        assert!(
            fx.recent.query_recent(&filter).await.unwrap().is_empty(),
            "cached empty page is served until invalidated"
        );

        fx.sweeper.sweep_now().await.unwrap();
        assert_eq!(fx.recent.query_recent(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_invalidation_does_not_fail_sweep() {
        let fx = setup(true).await;
        insert_at(&fx.store, t0()).await;
        fx.clock.advance(ChronoDuration::hours(3));
        let stats = fx.sweeper.sweep_now().await.unwrap().unwrap();
        assert_eq!(stats.transitioned, 1);
        assert!(!fx.sweeper.is_sweeping());
    }

    #[tokio::test]
    async fn test_sweep_skipped_while_another_is_in_flight() {
        let fx = setup(false).await;
        fx.sweeper.in_flight.store(true, Ordering::SeqCst);
        assert!(fx.sweeper.sweep_now().await.unwrap().is_none());

        fx.sweeper.in_flight.store(false, Ordering::SeqCst);
        assert!(fx.sweeper.sweep_now().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_storage_error_releases_guard() {
        let fx = setup(false).await;
        fx.store.pool().close().await;
        assert!(fx.sweeper.sweep_now().await.is_err());
        assert!(!fx.sweeper.is_sweeping());
    }
}
