//! Trigger and event persistence on SQLite.
//!
//! The store is the only owner of persisted rows:
//! - trigger registration and lookup
//! - event inserts (always Active) with the trigger foreign key enforced
//! - paginated recent/archived listings that never write
//! - the sweeper's bulk reclassification (Active -> Archived, Expired -> deleted)

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::db::{fmt_ts, parse_ts};
use crate::error::{Result, TriggerdError};
use crate::lifecycle::{EventStatus, RetentionWindows};
use crate::types::{ApiSchema, Event, EventFilter, NewEvent, Payload, Trigger, TriggerKind};

const EVENT_COLUMNS: &str = "id, trigger_id, status, payload, is_test, triggered_at, archived_at";
const TRIGGER_COLUMNS: &str = "id, name, trigger_type, schedule, api_schema, created_at";

/// Outcome of one reclassification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclassifyStats {
    pub transitioned: u64,
    pub deleted: u64,
}

pub struct EventStore {
    pool: SqlitePool,
    windows: RetentionWindows,
}

impl EventStore {
    /// Create the store and run migrations.
    pub async fn new(pool: SqlitePool, windows: RetentionWindows) -> anyhow::Result<Self> {
        crate::db::migrations::migrate(&pool).await?;
        Ok(Self { pool, windows })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn windows(&self) -> RetentionWindows {
        self.windows
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    pub async fn insert_trigger(
        &self,
        name: &str,
        kind: &TriggerKind,
        created_at: DateTime<Utc>,
    ) -> Result<Trigger> {
        let (schedule, api_schema) = match kind {
            TriggerKind::Scheduled { schedule } => (Some(schedule.clone()), None),
            TriggerKind::Api { api_schema } => (
                None,
                Some(serde_json::to_string(api_schema).map_err(decode_err)?),
            ),
        };

        let result = sqlx::query(
            "INSERT INTO triggers (name, trigger_type, schedule, api_schema, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(kind.type_str())
        .bind(&schedule)
        .bind(&api_schema)
        .bind(fmt_ts(created_at))
        .execute(&self.pool)
        .await?;

        Ok(Trigger {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            kind: kind.clone(),
            created_at,
        })
    }

    pub async fn get_trigger(&self, id: i64) -> Result<Trigger> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM triggers WHERE id = ?",
            TRIGGER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_trigger(&row),
            None => Err(TriggerdError::trigger_not_found(id)),
        }
    }

    pub async fn find_trigger_by_name(&self, name: &str) -> Result<Option<Trigger>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM triggers WHERE name = ? ORDER BY id LIMIT 1",
            TRIGGER_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trigger).transpose()
    }

    pub async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM triggers ORDER BY id",
            TRIGGER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trigger).collect()
    }

    pub async fn list_scheduled_triggers(&self) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM triggers WHERE trigger_type = 'scheduled' ORDER BY id",
            TRIGGER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trigger).collect()
    }

    // =========================================================================
    // Events: writes
    // =========================================================================

    /// Persist a new Active event. Fails with `ForeignKey` if the trigger is unknown.
    pub async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let payload_json = serde_json::to_string(&event.payload).map_err(decode_err)?;

        let result = sqlx::query(
            "INSERT INTO events (trigger_id, status, payload, is_test, triggered_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.trigger_id)
        .bind(EventStatus::Active.as_str())
        .bind(&payload_json)
        .bind(event.is_test)
        .bind(fmt_ts(event.triggered_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, event.trigger_id))?;

        let id = result.last_insert_rowid();
        debug!(event_id = id, trigger_id = event.trigger_id, "Inserted event");

        Ok(Event {
            id,
            trigger_id: event.trigger_id,
            status: EventStatus::Active,
            payload: event.payload,
            is_test: event.is_test,
            triggered_at: event.triggered_at,
            archived_at: None,
        })
    }

    /// Archive aged Active rows and delete Expired rows in one transaction.
    ///
    /// Rows inserted after `now` fall outside both cutoffs and are left for the
    /// next pass. Deleting rows that are already gone affects nothing, so a
    /// retried pass is harmless.
    pub async fn bulk_reclassify(&self, now: DateTime<Utc>) -> Result<ReclassifyStats> {
        let archive_cutoff = fmt_ts(self.windows.archive_cutoff(now));
        let expire_cutoff = fmt_ts(self.windows.expire_cutoff(now));
        let now_str = fmt_ts(now);

        let mut tx = self.pool.begin().await?;

        let transitioned = sqlx::query(
            "UPDATE events SET status = 'archived', archived_at = ?
             WHERE status = 'active' AND triggered_at <= ? AND triggered_at > ?",
        )
        .bind(&now_str)
        .bind(&archive_cutoff)
        .bind(&expire_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let deleted = sqlx::query("DELETE FROM events WHERE triggered_at <= ?")
            .bind(&expire_cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if transitioned > 0 || deleted > 0 {
            info!(transitioned, deleted, "Reclassified events");
        }
        Ok(ReclassifyStats {
            transitioned,
            deleted,
        })
    }

    // =========================================================================
    // Events: reads
    // =========================================================================

    pub async fn get_event(&self, id: i64, now: DateTime<Utc>) -> Result<Event> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM events WHERE id = ? AND triggered_at > ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .bind(fmt_ts(self.windows.expire_cutoff(now)))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_event(&row, now),
            None => Err(TriggerdError::event_not_found(id)),
        }
    }

    /// Active and Archived events, newest first. Expired rows are hidden even
    /// before the sweeper removes them.
    pub async fn query_recent(&self, filter: &EventFilter, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let expire_cutoff = fmt_ts(self.windows.expire_cutoff(now));
        self.query_page(filter, now, "triggered_at > ?", &[&expire_cutoff])
            .await
    }

    /// Archived events only (2h <= age < 48h by default), newest first.
    pub async fn query_archived(
        &self,
        filter: &EventFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let expire_cutoff = fmt_ts(self.windows.expire_cutoff(now));
        let archive_cutoff = fmt_ts(self.windows.archive_cutoff(now));
        self.query_page(
            filter,
            now,
            "triggered_at > ? AND (status = 'archived' OR triggered_at <= ?)",
            &[&expire_cutoff, &archive_cutoff],
        )
        .await
    }

    pub async fn count_events(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn query_page(
        &self,
        filter: &EventFilter,
        now: DateTime<Utc>,
        predicate: &str,
        binds: &[&str],
    ) -> Result<Vec<Event>> {
        let test_clause = if filter.show_test {
            ""
        } else {
            " AND is_test = 0"
        };
        let query_str = format!(
            "SELECT {} FROM events
             WHERE {}{}
             ORDER BY triggered_at DESC, id DESC
             LIMIT ? OFFSET ?",
            EVENT_COLUMNS, predicate, test_clause
        );

        let mut q = sqlx::query(&query_str);
        for value in binds {
            q = q.bind(*value);
        }
        let rows = q
            .bind(filter.page_size as i64)
            .bind(filter.offset())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| self.row_to_event(row, now)).collect()
    }

    // =========================================================================
    // Helper Methods
    // =========================================================================

    /// The presented status is the later of what is stored and what the
    /// classifier says now. Nothing is written back.
    fn row_to_event(&self, row: &SqliteRow, now: DateTime<Utc>) -> Result<Event> {
        let status_str: String = row.try_get("status")?;
        let payload_str: String = row.try_get("payload")?;
        let triggered_at_str: String = row.try_get("triggered_at")?;
        let archived_at_str: Option<String> = row.try_get("archived_at")?;

        let stored = EventStatus::from_str(&status_str)
            .ok_or_else(|| decode_err(format!("unknown event status '{}'", status_str)))?;
        let triggered_at = parse_ts(&triggered_at_str).map_err(decode_err)?;
        let computed = EventStatus::for_lifecycle(self.windows.classify(triggered_at, now))
            .unwrap_or(EventStatus::Archived);
        let payload: Payload = serde_json::from_str(&payload_str).map_err(decode_err)?;
        let archived_at = archived_at_str
            .map(|s| parse_ts(&s))
            .transpose()
            .map_err(decode_err)?;

        Ok(Event {
            id: row.try_get("id")?,
            trigger_id: row.try_get("trigger_id")?,
            status: stored.max(computed),
            payload,
            is_test: row.try_get("is_test")?,
            triggered_at,
            archived_at,
        })
    }
}

fn row_to_trigger(row: &SqliteRow) -> Result<Trigger> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let schedule: Option<String> = row.try_get("schedule")?;
    let api_schema: Option<String> = row.try_get("api_schema")?;
    let created_at_str: String = row.try_get("created_at")?;

    let kind = match (trigger_type.as_str(), schedule, api_schema) {
        ("scheduled", Some(schedule), None) => TriggerKind::Scheduled { schedule },
        ("api", None, Some(raw)) => {
            let api_schema: ApiSchema = serde_json::from_str(&raw).map_err(decode_err)?;
            TriggerKind::Api { api_schema }
        }
        (other, _, _) => {
            return Err(decode_err(format!(
                "malformed trigger row of type '{}'",
                other
            )))
        }
    };

    Ok(Trigger {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
        created_at: parse_ts(&created_at_str).map_err(decode_err)?,
    })
}

fn decode_err<E>(err: E) -> TriggerdError
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    TriggerdError::Storage(sqlx::Error::Decode(err.into()))
}

fn map_insert_error(err: sqlx::Error, trigger_id: i64) -> TriggerdError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_foreign_key_violation() {
            return TriggerdError::ForeignKey { trigger_id };
        }
    }
    TriggerdError::Storage(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use chrono::Duration;
    use serde_json::json;

    async fn setup_store() -> (EventStore, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().expect("temp db file");
        let pool = crate::db::connect(db_file.path().to_str().unwrap(), 5)
            .await
            .expect("connect sqlite");
        let store = EventStore::new(pool, RetentionWindows::default())
            .await
            .expect("init event store");
        (store, db_file)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn scheduled_trigger(store: &EventStore) -> Trigger {
        store
            .insert_trigger(
                "every minute",
                &TriggerKind::Scheduled {
                    schedule: "every 1m".to_string(),
                },
                t0(),
            )
            .await
            .expect("insert trigger")
    }

    async fn insert_at(
        store: &EventStore,
        trigger_id: i64,
        is_test: bool,
        at: DateTime<Utc>,
    ) -> Event {
        store
            .insert_event(NewEvent {
                trigger_id,
                payload: Payload::new(),
                is_test,
                triggered_at: at,
            })
            .await
            .expect("insert event")
    }

    fn all() -> EventFilter {
        EventFilter::new(true, 1, 100).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_roundtrip_through_storage() {
        let (store, _db) = setup_store().await;
        let schema: ApiSchema = [
            ("amount".to_string(), FieldType::Float),
            ("user_id".to_string(), FieldType::Int),
        ]
        .into_iter()
        .collect();
        let api = store
            .insert_trigger(
                "Payment Webhook",
                &TriggerKind::Api {
                    api_schema: schema.clone(),
                },
                t0(),
            )
            .await
            .unwrap();
        let scheduled = scheduled_trigger(&store).await;

        let fetched = store.get_trigger(api.id).await.unwrap();
        assert_eq!(fetched, api);
        assert_eq!(store.list_triggers().await.unwrap().len(), 2);

        let scheduled_only = store.list_scheduled_triggers().await.unwrap();
        assert_eq!(scheduled_only, vec![scheduled]);

        assert!(store
            .find_trigger_by_name("Payment Webhook")
            .await
            .unwrap()
            .is_some());
        assert!(store.find_trigger_by_name("nope").await.unwrap().is_none());

        let err = store.get_trigger(999).await.unwrap_err();
        assert!(matches!(err, TriggerdError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_insert_event_unknown_trigger_is_foreign_key_error() {
        let (store, _db) = setup_store().await;
        let err = store
            .insert_event(NewEvent {
                trigger_id: 42,
                payload: Payload::new(),
                is_test: false,
                triggered_at: t0(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerdError::ForeignKey { trigger_id: 42 }));
        assert_eq!(store.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_recent_orders_paginates_and_hides_tests() {
        let (store, _db) = setup_store().await;
        let trigger = scheduled_trigger(&store).await;
        for i in 0..5 {
            insert_at(&store, trigger.id, false, t0() + Duration::minutes(i)).await;
        }
        let test_event = insert_at(&store, trigger.id, true, t0() + Duration::minutes(10)).await;
        let now = t0() + Duration::minutes(11);

        let visible = store
            .query_recent(&EventFilter::default(), now)
            .await
            .unwrap();
        assert_eq!(visible.len(), 5);
        assert!(visible.iter().all(|e| !e.is_test));
        assert!(visible
            .windows(2)
            .all(|w| w[0].triggered_at >= w[1].triggered_at));

        let with_tests = store.query_recent(&all(), now).await.unwrap();
        assert_eq!(with_tests[0].id, test_event.id);

        let page2 = store
            .query_recent(&EventFilter::new(false, 2, 2).unwrap(), now)
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].triggered_at, t0() + Duration::minutes(2));

        let past_end = store
            .query_recent(&EventFilter::new(false, 4, 2).unwrap(), now)
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_presented_status_follows_age_without_writing() {
        let (store, _db) = setup_store().await;
        let trigger = scheduled_trigger(&store).await;
        let event = insert_at(&store, trigger.id, false, t0()).await;

        let later = t0() + Duration::hours(2) + Duration::seconds(1);
        let listed = store.query_recent(&all(), later).await.unwrap();
        assert_eq!(listed[0].status, EventStatus::Archived);

        // The stored row is still Active until the sweeper runs.
        let stored: String = sqlx::query_scalar("SELECT status FROM events WHERE id = ?")
            .bind(event.id)
            .fetch_one(&store.pool())
            .await
            .unwrap();
        assert_eq!(stored, "active");

        let expired = t0() + Duration::hours(48);
        assert!(store.query_recent(&all(), expired).await.unwrap().is_empty());
        assert!(matches!(
            store.get_event(event.id, expired).await.unwrap_err(),
            TriggerdError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_query_archived_window() {
        let (store, _db) = setup_store().await;
        let trigger = scheduled_trigger(&store).await;
        let now = t0() + Duration::hours(50);
        insert_at(&store, trigger.id, false, now - Duration::minutes(30)).await;
        let archived = insert_at(&store, trigger.id, false, now - Duration::hours(5)).await;
        insert_at(&store, trigger.id, false, now - Duration::hours(49)).await;

        let rows = store
            .query_archived(&EventFilter::default(), now)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, archived.id);
        assert_eq!(rows[0].status, EventStatus::Archived);
    }

    #[tokio::test]
    async fn test_bulk_reclassify_transitions_deletes_and_is_idempotent() {
        let (store, _db) = setup_store().await;
        let trigger = scheduled_trigger(&store).await;
        let now = t0() + Duration::hours(72);
        let fresh = insert_at(&store, trigger.id, false, now - Duration::minutes(5)).await;
        let aging = insert_at(&store, trigger.id, false, now - Duration::hours(2)).await;
        insert_at(&store, trigger.id, true, now - Duration::hours(48)).await;
        insert_at(&store, trigger.id, false, now - Duration::hours(60)).await;

        let stats = store.bulk_reclassify(now).await.unwrap();
        assert_eq!(
            stats,
            ReclassifyStats {
                transitioned: 1,
                deleted: 2
            }
        );

        let second = store.bulk_reclassify(now).await.unwrap();
        assert_eq!(second, ReclassifyStats::default());

        let aged = store.get_event(aging.id, now).await.unwrap();
        assert_eq!(aged.status, EventStatus::Archived);
        assert_eq!(aged.archived_at, Some(now));
        assert_eq!(
            store.get_event(fresh.id, now).await.unwrap().status,
            EventStatus::Active
        );
        assert_eq!(store.count_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reclassify_concurrent_with_inserts_misses_nothing() {
        let (store, _db) = setup_store().await;
        let store = std::sync::Arc::new(store);
        let trigger = scheduled_trigger(&store).await;
        let now = t0() + Duration::hours(3);
        for i in 0..20 {
            insert_at(&store, trigger.id, false, t0() + Duration::seconds(i)).await;
        }

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    insert_at(&store, trigger.id, false, now + Duration::seconds(i)).await;
                }
            })
        };
        let first = store.bulk_reclassify(now).await.unwrap();
        writer.await.unwrap();
        let second = store.bulk_reclassify(now).await.unwrap();

        assert_eq!(first.transitioned + second.transitioned, 20);
        assert_eq!(second.transitioned, 0);
        assert_eq!(first.deleted + second.deleted, 0);
        assert_eq!(store.count_events().await.unwrap(), 40);

        let rows = store.query_recent(&all(), now).await.unwrap();
        let active = rows
            .iter()
            .filter(|e| e.status == EventStatus::Active)
            .count();
        assert_eq!(active, 20);
    }

    #[tokio::test]
    async fn test_payload_roundtrip() {
        let (store, _db) = setup_store().await;
        let trigger = scheduled_trigger(&store).await;
        let mut payload = Payload::new();
        payload.insert("amount".to_string(), json!(12.5));
        payload.insert("currency".to_string(), json!("usd"));
        let inserted = store
            .insert_event(NewEvent {
                trigger_id: trigger.id,
                payload: payload.clone(),
                is_test: true,
                triggered_at: t0(),
            })
            .await
            .unwrap();
        let fetched = store.get_event(inserted.id, t0()).await.unwrap();
        assert_eq!(fetched, inserted);
        assert_eq!(fetched.payload, payload);
    }
}
