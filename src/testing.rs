//! Test infrastructure: a fully wired `Core` on a temp-file database and a
//! manual clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock::{Clock, ManualClock};
use crate::config::AppConfig;
use crate::core::Core;
use crate::types::Payload;

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// Everything needed to run integration tests against the core.
pub struct TestHarness {
    pub core: Core,
    pub clock: Arc<ManualClock>,
    /// Keep the temp file alive. The DB is deleted when this drops.
    _db_file: tempfile::NamedTempFile,
}

impl TestHarness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Fixed start time for every harness.
pub fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Build a core with default config on an isolated database.
pub async fn setup_test_core() -> anyhow::Result<TestHarness> {
    setup_test_core_with(|_| {}).await
}

/// Build a core after letting the caller adjust the config.
///
/// Each call creates an isolated database, so tests can run in parallel.
pub async fn setup_test_core_with(
    configure: impl FnOnce(&mut AppConfig),
) -> anyhow::Result<TestHarness> {
    // Temp file for SQLite (pool needs a real file, not :memory:)
    let db_file = tempfile::NamedTempFile::new()?;

    let mut config = AppConfig::default();
    config.state.db_path = db_file.path().to_string_lossy().into_owned();
    configure(&mut config);

    let clock = Arc::new(ManualClock::new(epoch()));
    let core = Core::build(config, clock.clone() as Arc<dyn Clock>).await?;

    Ok(TestHarness {
        core,
        clock,
        _db_file: db_file,
    })
}

/// Build a payload from a `json!({...})` object literal.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
