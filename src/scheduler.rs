//! Fires scheduled triggers when their next occurrence comes due.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::heartbeat::PeriodicJob;
use crate::schedule::{parse_schedule, Schedule};
use crate::triggers::TriggerRegistry;
use crate::types::{Payload, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    Idle,
    Due,
    Firing,
}

/// Point-in-time view of one scheduled trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub trigger_id: i64,
    pub name: String,
    pub phase: TriggerPhase,
    pub last_checked: DateTime<Utc>,
    pub next_due: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub failed: usize,
}

struct TrackedTrigger {
    trigger: Trigger,
    schedule: Schedule,
    phase: TriggerPhase,
    last_checked: DateTime<Utc>,
    last_fired_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TrackedTrigger {
    fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            trigger_id: self.trigger.id,
            name: self.trigger.name.clone(),
            phase: self.phase,
            last_checked: self.last_checked,
            next_due: self
                .schedule
                .next_after(self.trigger.created_at, self.last_checked)
                .ok(),
            last_fired_at: self.last_fired_at,
            last_error: self.last_error.clone(),
        }
    }
}

pub struct TriggerScheduler {
    registry: Arc<TriggerRegistry>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    tracked: Mutex<HashMap<i64, TrackedTrigger>>,
    /// Triggers whose stored schedule failed to parse. Never retried.
    rejected: Mutex<HashSet<i64>>,
    /// Serializes ticks; `tracked` is only locked briefly so snapshots stay readable.
    tick_lock: tokio::sync::Mutex<()>,
}

impl TriggerScheduler {
    pub fn new(
        registry: Arc<TriggerRegistry>,
        clock: Arc<dyn Clock>,
        tick_interval_secs: u64,
    ) -> Self {
        Self {
            registry,
            clock,
            tick_interval: Duration::from_secs(tick_interval_secs),
            tracked: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Evaluate every scheduled trigger once.
    ///
    /// A trigger is due when an occurrence falls in `(last_checked, now]`. A due
    /// trigger fires exactly once however many occurrences were missed, and a
    /// failed fire is not retried until its next occurrence.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let now = self.clock.now();

        let triggers = self.registry.list_scheduled().await?;
        let due = self.refresh_and_collect_due(triggers, now);

        let mut report = TickReport::default();
        for trigger_id in due {
            self.set_phase(trigger_id, TriggerPhase::Firing);
            let result = self.registry.fire(trigger_id, Payload::new(), false).await;

            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = tracked.get_mut(&trigger_id) else {
                continue;
            };
            match result {
                Ok(event) => {
                    report.fired += 1;
                    entry.last_fired_at = Some(now);
                    entry.last_error = None;
                    info!(trigger_id, event_id = event.id, name = %entry.trigger.name, "Fired scheduled trigger");
                }
                Err(e) => {
                    report.failed += 1;
                    entry.last_error = Some(e.to_string());
                    error!(trigger_id, name = %entry.trigger.name, error = %e, "Scheduled trigger fire failed");
                }
            }
            entry.last_checked = now;
            entry.phase = TriggerPhase::Idle;
        }

        Ok(report)
    }

    pub fn snapshots(&self) -> Vec<ScheduleSnapshot> {
        let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<ScheduleSnapshot> = tracked.values().map(|t| t.snapshot()).collect();
        rows.sort_by_key(|s| s.trigger_id);
        rows
    }

    /// Ids of stored triggers skipped because their schedule does not parse.
    pub fn rejected(&self) -> Vec<i64> {
        let rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = rejected.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Wrap the scheduler in a periodic job ticking at the configured interval.
    pub fn into_job(self: Arc<Self>) -> PeriodicJob {
        let interval = self.tick_interval;
        PeriodicJob::new("trigger_scheduler", interval, move || {
            let scheduler = self.clone();
            async move {
                let report = scheduler.tick().await?;
                if report.failed > 0 {
                    warn!(fired = report.fired, failed = report.failed, "Scheduler tick had failures");
                }
                Ok(())
            }
        })
    }

    /// Track newly seen triggers and mark the due ones. Triggers that are not
    /// due advance their checkpoint to `now`.
    fn refresh_and_collect_due(&self, triggers: Vec<Trigger>, now: DateTime<Utc>) -> Vec<i64> {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        let mut rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());

        for trigger in triggers {
            if tracked.contains_key(&trigger.id) || rejected.contains(&trigger.id) {
                continue;
            }
            let Some(expr) = trigger.schedule_expr().map(str::to_string) else {
                continue;
            };
            match parse_schedule(&expr, now) {
                Ok(schedule) => {
                    tracked.insert(
                        trigger.id,
                        TrackedTrigger {
                            last_checked: trigger.created_at,
                            trigger,
                            schedule,
                            phase: TriggerPhase::Idle,
                            last_fired_at: None,
                            last_error: None,
                        },
                    );
                }
                Err(e) => {
                    warn!(trigger_id = trigger.id, schedule = %expr, error = %e, "Ignoring trigger with unparseable schedule");
                    rejected.insert(trigger.id);
                }
            }
        }

        let mut due = Vec::new();
        for (id, entry) in tracked.iter_mut() {
            match entry
                .schedule
                .is_due(entry.trigger.created_at, entry.last_checked, now)
            {
                Ok(true) => {
                    entry.phase = TriggerPhase::Due;
                    due.push(*id);
                }
                Ok(false) => entry.last_checked = now,
                Err(e) => {
                    warn!(trigger_id = *id, error = %e, "Failed to compute next occurrence");
                    entry.last_checked = now;
                }
            }
        }
        due.sort_unstable();
        due
    }

    fn set_phase(&self, trigger_id: i64, phase: TriggerPhase) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = tracked.get_mut(&trigger_id) {
            entry.phase = phase;
        }
    }
}
