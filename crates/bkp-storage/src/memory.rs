//! In-memory [`PassStore`] with whole-store transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bkp_core::{
    DataPass, DataPassVersion, DataPassVersionDraft, DataPassVersionStatus,
    DataPassVersionStatusEntry, LhcPeriod, NewDataPass, Run, RunDefinition, SimulationPass,
    SimulationPassDraft,
};
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{PassStore, PassTransaction, StoreError, UpsertOutcome, VersionWatermark};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    lhc_periods: Vec<LhcPeriod>,
    data_passes: Vec<DataPass>,
    versions: Vec<DataPassVersion>,
    status_history: Vec<DataPassVersionStatusEntry>,
    runs: BTreeMap<i64, Run>,
    simulation_passes: Vec<SimulationPass>,
    data_pass_runs: BTreeSet<(i64, i64)>,
    simulation_pass_runs: BTreeSet<(i64, i64)>,
    simulation_pass_data_passes: BTreeSet<(i64, i64)>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn latest_status(&self, version_id: i64) -> Option<DataPassVersionStatus> {
        self.status_history
            .iter()
            .rev()
            .find(|entry| entry.data_pass_version_id == version_id)
            .map(|entry| entry.status)
    }

    fn data_pass_by_name(&self, name: &str) -> Option<&DataPass> {
        self.data_passes.iter().find(|dp| dp.name == name)
    }

    fn simulation_pass_by_name(&self, name: &str) -> Option<&SimulationPass> {
        self.simulation_passes.iter().find(|sp| sp.name == name)
    }
}

/// Store kept entirely in process memory.
///
/// An open transaction holds the store lock; other callers wait until it commits or is dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_run(&self, run_number: i64, definition: Option<RunDefinition>) {
        let mut state = self.state.lock().await;
        state.runs.insert(
            run_number,
            Run {
                run_number,
                definition,
            },
        );
    }

    pub async fn lhc_periods(&self) -> Vec<LhcPeriod> {
        self.state.lock().await.lhc_periods.clone()
    }

    pub async fn data_passes(&self) -> Vec<DataPass> {
        self.state.lock().await.data_passes.clone()
    }

    pub async fn data_pass_versions(&self) -> Vec<DataPassVersion> {
        self.state.lock().await.versions.clone()
    }

    pub async fn simulation_passes(&self) -> Vec<SimulationPass> {
        self.state.lock().await.simulation_passes.clone()
    }

    /// Status history of the version with `description`, oldest first.
    pub async fn status_history(&self, description: &str) -> Vec<DataPassVersionStatus> {
        let state = self.state.lock().await;
        let Some(version) = state.versions.iter().find(|v| v.description == description) else {
            return Vec::new();
        };
        state
            .status_history
            .iter()
            .filter(|entry| entry.data_pass_version_id == version.id)
            .map(|entry| entry.status)
            .collect()
    }

    pub async fn status_history_len(&self) -> usize {
        self.state.lock().await.status_history.len()
    }

    pub async fn data_pass_run_numbers(&self, data_pass_name: &str) -> Vec<i64> {
        let state = self.state.lock().await;
        let Some(data_pass) = state.data_pass_by_name(data_pass_name) else {
            return Vec::new();
        };
        state
            .data_pass_runs
            .iter()
            .filter(|(id, _)| *id == data_pass.id)
            .map(|(_, run_number)| *run_number)
            .collect()
    }

    pub async fn simulation_pass_run_numbers(&self, simulation_pass_name: &str) -> Vec<i64> {
        let state = self.state.lock().await;
        let Some(simulation_pass) = state.simulation_pass_by_name(simulation_pass_name) else {
            return Vec::new();
        };
        state
            .simulation_pass_runs
            .iter()
            .filter(|(id, _)| *id == simulation_pass.id)
            .map(|(_, run_number)| *run_number)
            .collect()
    }

    /// Names of data passes linked to the simulation pass, sorted.
    pub async fn simulation_pass_data_pass_names(&self, simulation_pass_name: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(simulation_pass) = state.simulation_pass_by_name(simulation_pass_name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = state
            .simulation_pass_data_passes
            .iter()
            .filter(|(id, _)| *id == simulation_pass.id)
            .filter_map(|(_, data_pass_id)| {
                state
                    .data_passes
                    .iter()
                    .find(|dp| dp.id == *data_pass_id)
                    .map(|dp| dp.name.clone())
            })
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PassStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn PassTransaction>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            state: guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn data_pass_version_watermarks(&self) -> Result<Vec<VersionWatermark>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .map(|version| VersionWatermark {
                id: version.id,
                description: version.description.clone(),
                last_seen: version.last_seen,
                last_status: state.latest_status(version.id),
            })
            .collect())
    }
}

struct MemoryTransaction {
    state: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.state = snapshot;
        }
    }
}

#[async_trait]
impl PassTransaction for MemoryTransaction {
    async fn get_or_create_lhc_period(&mut self, name: &str) -> Result<LhcPeriod, StoreError> {
        if let Some(period) = self.state.lhc_periods.iter().find(|p| p.name == name) {
            return Ok(period.clone());
        }
        let period = LhcPeriod {
            id: self.state.allocate_id(),
            name: name.to_string(),
        };
        self.state.lhc_periods.push(period.clone());
        Ok(period)
    }

    async fn find_data_pass_by_name(&mut self, name: &str) -> Result<Option<DataPass>, StoreError> {
        Ok(self.state.data_pass_by_name(name).cloned())
    }

    async fn data_passes_in_period(
        &mut self,
        lhc_period_id: i64,
    ) -> Result<Vec<DataPass>, StoreError> {
        Ok(self
            .state
            .data_passes
            .iter()
            .filter(|dp| dp.lhc_period_id == lhc_period_id)
            .cloned()
            .collect())
    }

    async fn create_data_pass(&mut self, data_pass: &NewDataPass) -> Result<DataPass, StoreError> {
        if let Some(existing) = self.state.data_pass_by_name(&data_pass.name) {
            return Ok(existing.clone());
        }
        let created = DataPass {
            id: self.state.allocate_id(),
            name: data_pass.name.clone(),
            lhc_period_id: data_pass.lhc_period_id,
            skimming_stage: data_pass.skimming_stage,
        };
        self.state.data_passes.push(created.clone());
        Ok(created)
    }

    async fn upsert_data_pass_version(
        &mut self,
        data_pass_id: i64,
        version: &DataPassVersionDraft,
    ) -> Result<UpsertOutcome<DataPassVersion>, StoreError> {
        if let Some(existing) = self
            .state
            .versions
            .iter_mut()
            .find(|v| v.description == version.description)
        {
            if existing.data_pass_id != data_pass_id {
                return Err(StoreError::VersionOwnership {
                    description: existing.description.clone(),
                    owner_id: existing.data_pass_id,
                });
            }
            existing.output_size = version.output_size;
            existing.reconstructed_events_count = version.reconstructed_events_count;
            existing.last_seen = version.last_seen;
            return Ok(UpsertOutcome {
                record: existing.clone(),
                created: false,
            });
        }

        let created = DataPassVersion {
            id: self.state.allocate_id(),
            data_pass_id,
            description: version.description.clone(),
            output_size: version.output_size,
            reconstructed_events_count: version.reconstructed_events_count,
            last_seen: version.last_seen,
        };
        self.state.versions.push(created.clone());
        Ok(UpsertOutcome {
            record: created,
            created: true,
        })
    }

    async fn latest_version_status(
        &mut self,
        data_pass_version_id: i64,
    ) -> Result<Option<DataPassVersionStatus>, StoreError> {
        Ok(self.state.latest_status(data_pass_version_id))
    }

    async fn append_version_status(
        &mut self,
        data_pass_version_id: i64,
        status: DataPassVersionStatus,
    ) -> Result<(), StoreError> {
        if !self.state.versions.iter().any(|v| v.id == data_pass_version_id) {
            return Err(StoreError::NotFound {
                entity: "data pass version",
                key: data_pass_version_id.to_string(),
            });
        }
        let id = self.state.allocate_id();
        self.state.status_history.push(DataPassVersionStatusEntry {
            id,
            data_pass_version_id,
            status,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_physics_runs(&mut self, run_numbers: &[i64]) -> Result<Vec<Run>, StoreError> {
        Ok(run_numbers
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|number| self.state.runs.get(number))
            .filter(|run| run.definition == Some(RunDefinition::Physics))
            .cloned()
            .collect())
    }

    async fn associate_data_pass_runs(
        &mut self,
        data_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError> {
        for run_number in run_numbers {
            self.state.data_pass_runs.insert((data_pass_id, *run_number));
        }
        Ok(())
    }

    async fn find_data_passes_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DataPass>, StoreError> {
        Ok(self
            .state
            .data_passes
            .iter()
            .filter(|dp| names.contains(&dp.name))
            .cloned()
            .collect())
    }

    async fn upsert_simulation_pass(
        &mut self,
        simulation_pass: &SimulationPassDraft,
    ) -> Result<SimulationPass, StoreError> {
        if let Some(existing) = self
            .state
            .simulation_passes
            .iter_mut()
            .find(|sp| sp.name == simulation_pass.name)
        {
            *existing = SimulationPass::from_draft(existing.id, simulation_pass);
            return Ok(existing.clone());
        }
        let created = SimulationPass::from_draft(self.state.allocate_id(), simulation_pass);
        self.state.simulation_passes.push(created.clone());
        Ok(created)
    }

    async fn associate_simulation_pass_data_passes(
        &mut self,
        simulation_pass_id: i64,
        data_pass_ids: &[i64],
    ) -> Result<(), StoreError> {
        for data_pass_id in data_pass_ids {
            self.state
                .simulation_pass_data_passes
                .insert((simulation_pass_id, *data_pass_id));
        }
        Ok(())
    }

    async fn associate_simulation_pass_runs(
        &mut self,
        simulation_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError> {
        for run_number in run_numbers {
            self.state
                .simulation_pass_runs
                .insert((simulation_pass_id, *run_number));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }
}
