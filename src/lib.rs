//! Trigger registry, scheduler and time-bounded event retention.
//!
//! Events are Active for their first two hours, Archived until they are two
//! days old, then deleted by the retention sweeper. Both windows are
//! configurable.

pub mod cache;
pub mod clock;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod triggers;
pub mod types;

#[cfg(test)]
mod testing;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::AppConfig;
pub use crate::core::{BackgroundHandles, Core};
pub use crate::error::{FieldMismatch, Result, TriggerdError};
pub use crate::lifecycle::{classify, EventStatus, Lifecycle, RetentionWindows};
pub use crate::types::{Event, EventFilter, FieldType, Payload, Trigger, TriggerKind};
