//! Event lifecycle classification.
//!
//! An event's lifecycle is a pure function of its age. The sweeper is the only
//! writer that persists the result; read paths may present it but never store it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle bucket computed from an event's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    Active,
    Archived,
    /// Past the archive window; the row must be removed.
    Expired,
}

/// Status persisted on an event row. Expired is never stored; it is a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    Archived,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EventStatus::Active),
            "archived" => Some(EventStatus::Archived),
            _ => None,
        }
    }

    /// Stored status for a lifecycle, or None when the row should be deleted.
    pub fn for_lifecycle(lifecycle: Lifecycle) -> Option<Self> {
        match lifecycle {
            Lifecycle::Active => Some(EventStatus::Active),
            Lifecycle::Archived => Some(EventStatus::Archived),
            Lifecycle::Expired => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Active => write!(f, "Active"),
            EventStatus::Archived => write!(f, "Archived"),
        }
    }
}

/// Age boundaries of the lifecycle. Defaults are 2h active and 48h total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindows {
    /// Events younger than this are Active.
    pub active: Duration,
    /// Events this old or older are Expired.
    pub archive: Duration,
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            active: Duration::hours(2),
            archive: Duration::hours(48),
        }
    }
}

impl RetentionWindows {
    pub fn new(active: Duration, archive: Duration) -> anyhow::Result<Self> {
        if active <= Duration::zero() {
            anyhow::bail!("Active window must be positive");
        }
        if archive <= active {
            anyhow::bail!("Archive window must be longer than the active window");
        }
        Ok(Self { active, archive })
    }

    /// Classify an event. Ties at a boundary resolve to the later state.
    pub fn classify(&self, triggered_at: DateTime<Utc>, now: DateTime<Utc>) -> Lifecycle {
        let age = now - triggered_at;
        if age >= self.archive {
            Lifecycle::Expired
        } else if age >= self.active {
            Lifecycle::Archived
        } else {
            Lifecycle::Active
        }
    }

    /// Events triggered at or before this instant are at least Archived.
    pub fn archive_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.active
    }

    /// Events triggered at or before this instant are Expired.
    pub fn expire_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.archive
    }
}

/// Classify with the default 2h / 48h windows.
pub fn classify(triggered_at: DateTime<Utc>, now: DateTime<Utc>) -> Lifecycle {
    RetentionWindows::default().classify(triggered_at, now)
}
