//! PostgreSQL-backed [`PassStore`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bkp_core::{
    DataPass, DataPassVersion, DataPassVersionDraft, DataPassVersionStatus, LhcPeriod, NewDataPass,
    Run, RunDefinition, SimulationPass, SimulationPassDraft, SkimmingStage,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::info;

use crate::store::{PassStore, PassTransaction, StoreError, UpsertOutcome, VersionWatermark};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl PassStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn PassTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn data_pass_version_watermarks(&self) -> Result<Vec<VersionWatermark>, StoreError> {
        let rows: Vec<WatermarkRow> = sqlx::query_as(
            r#"
            SELECT v.id, v.description, v.last_seen, h.status AS last_status
            FROM data_pass_versions AS v
            LEFT JOIN LATERAL (
                SELECT s.status
                FROM data_pass_version_status_history AS s
                WHERE s.data_pass_version_id = v.id
                ORDER BY s.created_at DESC, s.id DESC
                LIMIT 1
            ) AS h ON TRUE
            ORDER BY v.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(VersionWatermark {
                    id: row.id,
                    description: row.description,
                    last_seen: row.last_seen,
                    last_status: parse_optional(row.last_status)?,
                })
            })
            .collect()
    }
}

#[derive(FromRow)]
struct WatermarkRow {
    id: i64,
    description: String,
    last_seen: Option<i64>,
    last_status: Option<String>,
}

#[derive(FromRow)]
struct LhcPeriodRow {
    id: i64,
    name: String,
}

#[derive(FromRow)]
struct DataPassRow {
    id: i64,
    name: String,
    lhc_period_id: i64,
    skimming_stage: Option<String>,
}

impl TryFrom<DataPassRow> for DataPass {
    type Error = StoreError;

    fn try_from(row: DataPassRow) -> Result<Self, Self::Error> {
        Ok(DataPass {
            id: row.id,
            name: row.name,
            lhc_period_id: row.lhc_period_id,
            skimming_stage: parse_optional::<SkimmingStage>(row.skimming_stage)?,
        })
    }
}

#[derive(FromRow)]
struct DataPassVersionRow {
    id: i64,
    data_pass_id: i64,
    description: String,
    output_size: Option<i64>,
    reconstructed_events_count: Option<i64>,
    last_seen: Option<i64>,
    inserted: bool,
}

#[derive(FromRow)]
struct RunRow {
    run_number: i64,
    definition: Option<String>,
}

fn parse_optional<T: FromStr>(value: Option<String>) -> Result<Option<T>, StoreError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.parse::<T>().map_err(|e| StoreError::Invalid(e.to_string())))
        .transpose()
}

const DATA_PASS_COLUMNS: &str = "id, name, lhc_period_id, skimming_stage";

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PassTransaction for PgTransaction {
    async fn get_or_create_lhc_period(&mut self, name: &str) -> Result<LhcPeriod, StoreError> {
        let row: LhcPeriodRow = sqlx::query_as(
            r#"
            INSERT INTO lhc_periods (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(LhcPeriod {
            id: row.id,
            name: row.name,
        })
    }

    async fn find_data_pass_by_name(&mut self, name: &str) -> Result<Option<DataPass>, StoreError> {
        let row: Option<DataPassRow> = sqlx::query_as(&format!(
            "SELECT {DATA_PASS_COLUMNS} FROM data_passes WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(DataPass::try_from).transpose()
    }

    async fn data_passes_in_period(
        &mut self,
        lhc_period_id: i64,
    ) -> Result<Vec<DataPass>, StoreError> {
        let rows: Vec<DataPassRow> = sqlx::query_as(&format!(
            "SELECT {DATA_PASS_COLUMNS} FROM data_passes WHERE lhc_period_id = $1 ORDER BY id"
        ))
        .bind(lhc_period_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(DataPass::try_from).collect()
    }

    async fn create_data_pass(&mut self, data_pass: &NewDataPass) -> Result<DataPass, StoreError> {
        let row: DataPassRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO data_passes (name, lhc_period_id, skimming_stage) VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING {DATA_PASS_COLUMNS}
            "#
        ))
        .bind(&data_pass.name)
        .bind(data_pass.lhc_period_id)
        .bind(data_pass.skimming_stage.map(SkimmingStage::as_str))
        .fetch_one(&mut *self.tx)
        .await?;
        DataPass::try_from(row)
    }

    async fn upsert_data_pass_version(
        &mut self,
        data_pass_id: i64,
        version: &DataPassVersionDraft,
    ) -> Result<UpsertOutcome<DataPassVersion>, StoreError> {
        let row: Option<DataPassVersionRow> = sqlx::query_as(
            r#"
            INSERT INTO data_pass_versions
                (data_pass_id, description, output_size, reconstructed_events_count, last_seen)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (description) DO UPDATE SET
                output_size = EXCLUDED.output_size,
                reconstructed_events_count = EXCLUDED.reconstructed_events_count,
                last_seen = EXCLUDED.last_seen,
                updated_at = now()
            WHERE data_pass_versions.data_pass_id = EXCLUDED.data_pass_id
            RETURNING id, data_pass_id, description, output_size, reconstructed_events_count,
                last_seen, (xmax = 0) AS inserted
            "#,
        )
        .bind(data_pass_id)
        .bind(&version.description)
        .bind(version.output_size)
        .bind(version.reconstructed_events_count)
        .bind(version.last_seen)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            let owner_id: i64 = sqlx::query_scalar(
                "SELECT data_pass_id FROM data_pass_versions WHERE description = $1",
            )
            .bind(&version.description)
            .fetch_one(&mut *self.tx)
            .await?;
            return Err(StoreError::VersionOwnership {
                description: version.description.clone(),
                owner_id,
            });
        };

        Ok(UpsertOutcome {
            created: row.inserted,
            record: DataPassVersion {
                id: row.id,
                data_pass_id: row.data_pass_id,
                description: row.description,
                output_size: row.output_size,
                reconstructed_events_count: row.reconstructed_events_count,
                last_seen: row.last_seen,
            },
        })
    }

    async fn latest_version_status(
        &mut self,
        data_pass_version_id: i64,
    ) -> Result<Option<DataPassVersionStatus>, StoreError> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM data_pass_version_status_history
            WHERE data_pass_version_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(data_pass_version_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        parse_optional(status)
    }

    async fn append_version_status(
        &mut self,
        data_pass_version_id: i64,
        status: DataPassVersionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO data_pass_version_status_history (data_pass_version_id, status) VALUES ($1, $2)",
        )
        .bind(data_pass_version_id)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_physics_runs(&mut self, run_numbers: &[i64]) -> Result<Vec<Run>, StoreError> {
        if run_numbers.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT run_number, definition FROM runs
            WHERE run_number = ANY($1) AND definition = $2
            ORDER BY run_number
            "#,
        )
        .bind(run_numbers)
        .bind(RunDefinition::Physics.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Run {
                    run_number: row.run_number,
                    definition: parse_optional(row.definition)?,
                })
            })
            .collect()
    }

    async fn associate_data_pass_runs(
        &mut self,
        data_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO data_passes_runs (data_pass_id, run_number)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(data_pass_id)
        .bind(run_numbers)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_data_passes_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DataPass>, StoreError> {
        let rows: Vec<DataPassRow> = sqlx::query_as(&format!(
            "SELECT {DATA_PASS_COLUMNS} FROM data_passes WHERE name = ANY($1) ORDER BY name"
        ))
        .bind(names)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(DataPass::try_from).collect()
    }

    async fn upsert_simulation_pass(
        &mut self,
        simulation_pass: &SimulationPassDraft,
    ) -> Result<SimulationPass, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO simulation_passes
                (name, jira_id, description, pwg, requested_events_count, generated_events_count, output_size)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                jira_id = EXCLUDED.jira_id,
                description = EXCLUDED.description,
                pwg = EXCLUDED.pwg,
                requested_events_count = EXCLUDED.requested_events_count,
                generated_events_count = EXCLUDED.generated_events_count,
                output_size = EXCLUDED.output_size,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(&simulation_pass.name)
        .bind(&simulation_pass.jira_id)
        .bind(&simulation_pass.description)
        .bind(&simulation_pass.pwg)
        .bind(simulation_pass.requested_events_count)
        .bind(simulation_pass.generated_events_count)
        .bind(simulation_pass.output_size)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(SimulationPass::from_draft(id, simulation_pass))
    }

    async fn associate_simulation_pass_data_passes(
        &mut self,
        simulation_pass_id: i64,
        data_pass_ids: &[i64],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO data_passes_simulation_passes (simulation_pass_id, data_pass_id)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(simulation_pass_id)
        .bind(data_pass_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn associate_simulation_pass_runs(
        &mut self,
        simulation_pass_id: i64,
        run_numbers: &[i64],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO simulation_passes_runs (simulation_pass_id, run_number)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(simulation_pass_id)
        .bind(run_numbers)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
