use sqlx::SqlitePool;
use tracing::info;

/// Create the triggers and events tables.
///
/// Safe to call on every startup: all statements use `IF NOT EXISTS`.
pub(crate) async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            trigger_type TEXT NOT NULL CHECK (trigger_type IN ('scheduled', 'api')),
            schedule TEXT,
            api_schema TEXT,
            created_at TEXT NOT NULL,
            CHECK ((schedule IS NULL) <> (api_schema IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_triggers_type ON triggers(trigger_type)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trigger_id INTEGER NOT NULL REFERENCES triggers(id),
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'archived')),
            payload TEXT NOT NULL,
            is_test INTEGER NOT NULL DEFAULT 0,
            triggered_at TEXT NOT NULL,
            archived_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Newest-first listing and the sweeper's age-range scans.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_triggered_at
         ON events(triggered_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_status_time
         ON events(status, triggered_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_trigger ON events(trigger_id)")
        .execute(pool)
        .await?;

    info!("Triggers and events table migration complete");
    Ok(())
}
