use async_trait::async_trait;
use bkp_core::{
    DataPass, DataPassVersion, DataPassVersionDraft, DataPassVersionStatus, LhcPeriod, NewDataPass,
    Run, SimulationPass, SimulationPassDraft,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("data pass version `{description}` already belongs to data pass {owner_id}")]
    VersionOwnership { description: String, owner_id: i64 },
}

/// Last known state of a locally stored data pass version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionWatermark {
    pub id: i64,
    pub description: String,
    pub last_seen: Option<i64>,
    pub last_status: Option<DataPassVersionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome<T> {
    pub record: T,
    pub created: bool,
}

/// Local store of passes, periods and their run associations.
#[async_trait]
pub trait PassStore: Send + Sync {
    /// Opens a transaction; dropping it without [`PassTransaction::commit`] rolls it back.
    async fn begin(&self) -> Result<Box<dyn PassTransaction>, StoreError>;

    async fn data_pass_version_watermarks(&self) -> Result<Vec<VersionWatermark>, StoreError>;
}

/// Unit of work against the store. Association inserts ignore existing links.
#[async_trait]
pub trait PassTransaction: Send {
    async fn get_or_create_lhc_period(&mut self, name: &str) -> Result<LhcPeriod, StoreError>;

    async fn find_data_pass_by_name(&mut self, name: &str) -> Result<Option<DataPass>, StoreError>;

    async fn data_passes_in_period(&mut self, lhc_period_id: i64)
        -> Result<Vec<DataPass>, StoreError>;

    async fn create_data_pass(&mut self, data_pass: &NewDataPass) -> Result<DataPass, StoreError>;

    /// Fails with [`StoreError::VersionOwnership`] when the description belongs to another data pass.
    async fn upsert_data_pass_version(
        &mut self,
        data_pass_id: i64,
        version: &DataPassVersionDraft,
    ) -> Result<UpsertOutcome<DataPassVersion>, StoreError>;

    async fn latest_version_status(
        &mut self,
        data_pass_version_id: i64,
    ) -> Result<Option<DataPassVersionStatus>, StoreError>;

    async fn append_version_status(
        &mut self,
        data_pass_version_id: i64,
        status: DataPassVersionStatus,
    ) -> Result<(), StoreError>;

    /// Returns the stored runs among `run_numbers` whose definition is PHYSICS.
    async fn find_physics_runs(&mut self, run_numbers: &[i64]) -> Result<Vec<Run>, StoreError>;

    async fn associate_data_pass_runs(
        &mut self,
        data_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError>;

    async fn find_data_passes_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DataPass>, StoreError>;

    async fn upsert_simulation_pass(
        &mut self,
        simulation_pass: &SimulationPassDraft,
    ) -> Result<SimulationPass, StoreError>;

    async fn associate_simulation_pass_data_passes(
        &mut self,
        simulation_pass_id: i64,
        data_pass_ids: &[i64],
    ) -> Result<(), StoreError>;

    async fn associate_simulation_pass_runs(
        &mut self,
        simulation_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
