use std::sync::LazyLock;

use bkp_core::{extract_lhc_period, DataPass, DataPassVersionStatus, NewDataPass, SkimmingStage};
use bkp_monalisa::{DataPassVersionRecord, PassSource, SimulationPassRecord};
use bkp_storage::{PassStore, VersionWatermark};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::diff::{absent_versions, records_to_update, WatermarkIndex};
use crate::errors::{ErrorAggregate, SyncError};
use crate::{ResourceSummary, SyncRunSummary};

static SKIMMED_PASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pass.*_skimmed").expect("static skimmed pass pattern"));

/// Skimming stage of a data pass created now, given the passes already in its LHC period.
pub fn classify_skimming_stage(name: &str, period_passes: &[DataPass]) -> Option<SkimmingStage> {
    if name.contains("skimming") {
        return Some(SkimmingStage::Skimming);
    }
    if !SKIMMED_PASS.is_match(name) {
        return None;
    }
    let skimmed_exists = period_passes
        .iter()
        .any(|pass| pass.skimming_stage == Some(SkimmingStage::Skimmed));
    Some(if skimmed_exists {
        SkimmingStage::PostSkimmed
    } else {
        SkimmingStage::Skimmed
    })
}

/// Reconciles MonAlisa data pass versions and simulation passes into the local store.
///
/// Holds no state between calls; every item is written in its own transaction.
pub struct MonAlisaSynchronizer<S, T> {
    source: S,
    store: T,
}

impl<S: PassSource, T: PassStore> MonAlisaSynchronizer<S, T> {
    pub fn new(source: S, store: T) -> Self {
        Self { source, store }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Runs data passes then simulation passes. A fatal error in one does not skip the other.
    pub async fn synchronize(&self) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("monalisa_sync", %run_id);

        async move {
            info!("starting MonAlisa synchronization");
            let data_passes = self.synchronize_data_passes().await;
            let simulation_passes = self.synchronize_simulation_passes().await;
            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                data_passes,
                simulation_passes,
            };
            info!(
                data_passes_updated = summary.data_passes.updated,
                data_passes_deleted = summary.data_passes.deleted,
                simulation_passes_updated = summary.simulation_passes.updated,
                failed = summary.data_passes.failed + summary.simulation_passes.failed,
                "finished MonAlisa synchronization"
            );
            summary
        }
        .instrument(span)
        .await
    }

    pub async fn synchronize_data_passes(&self) -> ResourceSummary {
        self.try_synchronize_data_passes()
            .await
            .unwrap_or_else(|err| fatal("DataPasses", err))
    }

    pub async fn synchronize_simulation_passes(&self) -> ResourceSummary {
        self.try_synchronize_simulation_passes()
            .await
            .unwrap_or_else(|err| fatal("SimulationPasses", err))
    }

    async fn try_synchronize_data_passes(&self) -> Result<ResourceSummary, SyncError> {
        let records = self.source.data_pass_versions().await?;
        let index = WatermarkIndex::new(self.store.data_pass_version_watermarks().await?);
        let pending = records_to_update(&records, &index);
        debug!(
            fetched = records.len(),
            known = index.len(),
            pending = pending.len(),
            "compared data pass versions"
        );

        let mut summary = ResourceSummary {
            fetched: records.len(),
            ..Default::default()
        };
        let mut errors = ErrorAggregate::default();

        for record in pending {
            match self.update_data_pass_version(record).await {
                Ok(()) => summary.updated += 1,
                Err(err) => errors.record(&record.name, &err),
            }
        }

        for watermark in absent_versions(&index, &records) {
            match self.mark_deleted(watermark).await {
                Ok(()) => summary.deleted += 1,
                Err(err) => errors.record(&watermark.description, &err),
            }
        }

        summary.failed = errors.failed();
        errors.log("data passes");
        Ok(summary)
    }

    async fn update_data_pass_version(&self, record: &DataPassVersionRecord) -> Result<(), SyncError> {
        let period = extract_lhc_period(&record.name)
            .ok_or_else(|| SyncError::InvalidPassName(record.name.clone()))?;

        let mut tx = self.store.begin().await?;
        let lhc_period = tx.get_or_create_lhc_period(&period.name).await?;

        let data_pass = match tx.find_data_pass_by_name(&record.name).await? {
            Some(data_pass) => data_pass,
            None => {
                let period_passes = tx.data_passes_in_period(lhc_period.id).await?;
                let skimming_stage = classify_skimming_stage(&record.name, &period_passes);
                tx.create_data_pass(&NewDataPass {
                    name: record.name.clone(),
                    lhc_period_id: lhc_period.id,
                    skimming_stage,
                })
                .await?
            }
        };

        let upserted = tx.upsert_data_pass_version(data_pass.id, &record.version).await?;
        let version = upserted.record;
        let latest = if upserted.created {
            None
        } else {
            tx.latest_version_status(version.id).await?
        };
        if latest != Some(DataPassVersionStatus::Running) {
            if latest == Some(DataPassVersionStatus::Deleted) {
                info!(description = %version.description, "data pass version restarted");
            }
            tx.append_version_status(version.id, DataPassVersionStatus::Running)
                .await?;
        }

        let details = self
            .source
            .data_pass_version_details(&record.version.description)
            .await?;
        let run_numbers: Vec<i64> = tx
            .find_physics_runs(&details.run_numbers)
            .await?
            .into_iter()
            .map(|run| run.run_number)
            .collect();
        tx.associate_data_pass_runs(data_pass.id, &run_numbers).await?;

        tx.commit().await?;
        debug!(
            data_pass = %record.name,
            description = %version.description,
            runs = run_numbers.len(),
            created = upserted.created,
            "synchronized data pass version"
        );
        Ok(())
    }

    async fn mark_deleted(&self, watermark: &VersionWatermark) -> Result<(), SyncError> {
        let mut tx = self.store.begin().await?;
        tx.append_version_status(watermark.id, DataPassVersionStatus::Deleted)
            .await?;
        tx.commit().await?;
        info!(description = %watermark.description, "data pass version deleted");
        Ok(())
    }

    async fn try_synchronize_simulation_passes(&self) -> Result<ResourceSummary, SyncError> {
        let records = self.source.simulation_passes().await?;
        let mut summary = ResourceSummary {
            fetched: records.len(),
            ..Default::default()
        };
        let mut errors = ErrorAggregate::default();

        for record in &records {
            match self.update_simulation_pass(record).await {
                Ok(()) => summary.updated += 1,
                Err(err) => errors.record(&record.properties.name, &err),
            }
        }

        summary.failed = errors.failed();
        errors.log("simulation passes");
        Ok(summary)
    }

    async fn update_simulation_pass(&self, record: &SimulationPassRecord) -> Result<(), SyncError> {
        let name = &record.properties.name;
        let mut tx = self.store.begin().await?;

        let data_passes = tx
            .find_data_passes_by_names(&record.associations.data_pass_names())
            .await?;
        if data_passes.is_empty() {
            return Err(SyncError::NoAssociatedDataPasses(name.clone()));
        }

        let simulation_pass = tx.upsert_simulation_pass(&record.properties).await?;
        let data_pass_ids: Vec<i64> = data_passes.iter().map(|pass| pass.id).collect();
        tx.associate_simulation_pass_data_passes(simulation_pass.id, &data_pass_ids)
            .await?;

        let run_numbers: Vec<i64> = tx
            .find_physics_runs(&record.associations.run_numbers)
            .await?
            .into_iter()
            .map(|run| run.run_number)
            .collect();
        tx.associate_simulation_pass_runs(simulation_pass.id, &run_numbers)
            .await?;

        tx.commit().await?;
        debug!(
            simulation_pass = %name,
            data_passes = data_pass_ids.len(),
            runs = run_numbers.len(),
            "synchronized simulation pass"
        );
        Ok(())
    }
}

fn fatal(resource: &str, err: SyncError) -> ResourceSummary {
    error!(resource, "Fatal error preventing synchronization of {resource}: {err}");
    ResourceSummary {
        fatal: Some(err.to_string()),
        ..Default::default()
    }
}
