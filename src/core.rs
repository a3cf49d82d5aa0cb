use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{MemoryCache, RecentEvents};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::heartbeat::JobTelemetry;
use crate::scheduler::TriggerScheduler;
use crate::store::{EventStore, ReclassifyStats};
use crate::sweeper::RetentionSweeper;
use crate::triggers::TriggerRegistry;
use crate::types::{Event, EventFilter, Payload, Trigger};

/// All core components wired against one database and one clock.
///
/// This is the surface an outer request layer calls into.
pub struct Core {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<EventStore>,
    pub registry: Arc<TriggerRegistry>,
    pub recent: Arc<RecentEvents>,
    pub scheduler: Arc<TriggerScheduler>,
    pub sweeper: Arc<RetentionSweeper>,
    pub telemetry: Arc<JobTelemetry>,
}

impl Core {
    pub async fn build(config: AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        config.validate()?;
        let windows = config.retention.windows()?;

        // 1. Event store
        let pool = crate::db::connect(&config.state.db_path, config.state.max_connections).await?;
        let store = Arc::new(EventStore::new(pool, windows).await?);
        info!(db_path = %config.state.db_path, "Event store initialized");

        // 2. Read-through cache
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let recent = Arc::new(RecentEvents::new(
            store.clone(),
            cache,
            clock.clone(),
            config.cache.ttl()?,
            config.cache.read_retries,
        ));

        // 3. Trigger registry, seeded from config
        let registry = Arc::new(TriggerRegistry::new(store.clone(), clock.clone()));
        let seeded = registry.seed_from_config(&config.scheduler.triggers).await?;
        if seeded > 0 {
            info!(count = seeded, "Seeded scheduled triggers from config");
        }

        // 4. Background components
        let scheduler = Arc::new(TriggerScheduler::new(
            registry.clone(),
            clock.clone(),
            config.scheduler.tick_interval_secs,
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            recent.clone(),
            clock.clone(),
            config.retention.sweep_interval_secs,
        ));

        Ok(Self {
            config,
            clock,
            store,
            registry,
            recent,
            scheduler,
            sweeper,
            telemetry: Arc::new(JobTelemetry::new()),
        })
    }

    /// Spawn the retention sweeper and, if enabled, the trigger scheduler.
    pub fn start(&self) -> BackgroundHandles {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let sweeper_job = self
            .sweeper
            .clone()
            .into_job()
            .with_telemetry(self.telemetry.clone());
        handles.push(sweeper_job.spawn(cancel.child_token()));

        if self.config.scheduler.enabled {
            let scheduler_job = self
                .scheduler
                .clone()
                .into_job()
                .with_telemetry(self.telemetry.clone());
            handles.push(scheduler_job.spawn(cancel.child_token()));
        } else {
            info!("Trigger scheduler disabled by config");
        }

        BackgroundHandles { cancel, handles }
    }

    pub async fn register_scheduled(&self, name: &str, schedule: &str) -> Result<Trigger> {
        self.registry.register_scheduled(name, schedule).await
    }

    pub async fn register_api(
        &self,
        name: &str,
        schema: &HashMap<String, String>,
    ) -> Result<Trigger> {
        self.registry.register_api(name, schema).await
    }

    pub async fn fire(&self, trigger_id: i64, payload: Payload, is_test: bool) -> Result<Event> {
        self.registry.fire(trigger_id, payload, is_test).await
    }

    pub async fn get_trigger(&self, trigger_id: i64) -> Result<Trigger> {
        self.registry.get(trigger_id).await
    }

    pub async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        self.registry.list().await
    }

    pub async fn get_event(&self, event_id: i64) -> Result<Event> {
        self.registry.get_event(event_id).await
    }

    pub async fn query_recent(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.recent.query_recent(filter).await
    }

    /// Archived page, read straight from the store.
    pub async fn query_archived(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.store.query_archived(filter, self.clock.now()).await
    }

    pub async fn sweep_now(&self) -> Result<Option<ReclassifyStats>> {
        self.sweeper.sweep_now().await
    }
}

/// Running background loops.
pub struct BackgroundHandles {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundHandles {
    /// Stop ticking and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background job did not shut down cleanly: {}", e);
            }
        }
        info!("Background jobs stopped");
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let core = Core::build(config, Arc::new(SystemClock)).await?;
    let background = core.start();

    info!("Starting triggerd v{}", env!("CARGO_PKG_VERSION"));
    let signal = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");

    background.shutdown().await;
    signal?;
    Ok(())
}
