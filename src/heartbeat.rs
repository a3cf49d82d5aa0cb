use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Runtime snapshot of a background job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub interval_secs: u64,
    pub last_run_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub is_running: bool,
}

impl JobSnapshot {
    fn new(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval_secs: interval.as_secs(),
            last_run_at: None,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            consecutive_failures: 0,
            is_running: false,
        }
    }
}

/// Shared telemetry for background jobs.
#[derive(Default)]
pub struct JobTelemetry {
    jobs: Mutex<HashMap<String, JobSnapshot>>,
}

impl JobTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job(&self, name: &str, interval: Duration) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(name.to_string())
            .or_insert_with(|| JobSnapshot::new(name, interval));
    }

    pub fn mark_started(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_run_at = Some(Utc::now().to_rfc3339());
            job.is_running = true;
        }
    }

    pub fn mark_success(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_success_at = Some(Utc::now().to_rfc3339());
            job.last_error = None;
            job.last_error_at = None;
            job.consecutive_failures = 0;
            job.is_running = false;
        }
    }

    pub fn mark_failure(&self, name: &str, consecutive_failures: u32, message: String) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_error_at = Some(Utc::now().to_rfc3339());
            job.last_error = Some(message);
            job.consecutive_failures = consecutive_failures;
            job.is_running = false;
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(name).cloned()
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<JobSnapshot> = jobs.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

/// Type alias for the async closure a periodic job executes.
type JobRunFn =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// A named job run on a fixed interval until cancelled.
///
/// Each run is awaited inline, so a job never overlaps itself. Ticks that
/// elapse while a run is in progress are skipped, not queued.
pub struct PeriodicJob {
    name: String,
    interval: Duration,
    run: JobRunFn,
    consecutive_failures: u32,
    telemetry: Option<Arc<JobTelemetry>>,
}

impl PeriodicJob {
    pub fn new<F, Fut>(name: &str, interval: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            interval,
            run: Box::new(move || Box::pin(f())),
            consecutive_failures: 0,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<JobTelemetry>) -> Self {
        telemetry.register_job(&self.name, self.interval);
        self.telemetry = Some(telemetry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the job once. Errors and panics are recorded and logged, never propagated.
    pub async fn run_once(&mut self) -> bool {
        if let Some(ref t) = self.telemetry {
            t.mark_started(&self.name);
        }
        debug!(job = %self.name, "Job starting");

        let fut = (self.run)();
        let result = AssertUnwindSafe(fut).catch_unwind().await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("job panicked".to_string()),
        };

        match failure {
            None => {
                if self.consecutive_failures > 0 {
                    info!(job = %self.name, prev_failures = self.consecutive_failures, "Job recovered");
                }
                self.consecutive_failures = 0;
                if let Some(ref t) = self.telemetry {
                    t.mark_success(&self.name);
                }
                debug!(job = %self.name, "Job completed");
                true
            }
            Some(message) => {
                self.consecutive_failures += 1;
                error!(
                    job = %self.name,
                    error = %message,
                    consecutive_failures = self.consecutive_failures,
                    "Job failed"
                );
                if let Some(ref t) = self.telemetry {
                    t.mark_failure(&self.name, self.consecutive_failures, message);
                }
                false
            }
        }
    }

    /// Spawn the tick loop. The first run happens immediately.
    ///
    /// Cancellation stops new ticks; a run already in progress completes
    /// before the task returns.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = %self.name, interval_secs = self.interval.as_secs(), "Job loop started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.run_once().await;
            }

            info!(job = %self.name, "Job loop stopped");
        })
    }
}
