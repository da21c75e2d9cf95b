//! MonAlisa to bookkeeping synchronization: diffing, reconciliation and scheduling.

mod config;
mod diff;
mod errors;
mod scheduler;
mod synchronizer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use config::SyncConfig;
pub use diff::{absent_versions, needs_update, records_to_update, WatermarkIndex};
pub use errors::{ErrorAggregate, SyncError};
pub use scheduler::build_scheduler;
pub use synchronizer::{classify_skimming_stage, MonAlisaSynchronizer};

pub const CRATE_NAME: &str = "bkp-sync";

/// Outcome of one resource type within a synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub fetched: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Set when the listing could not be fetched and nothing was reconciled.
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub data_passes: ResourceSummary,
    pub simulation_passes: ResourceSummary,
}

impl SyncRunSummary {
    pub fn is_clean(&self) -> bool {
        [&self.data_passes, &self.simulation_passes]
            .iter()
            .all(|r| r.fatal.is_none() && r.failed == 0)
    }
}
