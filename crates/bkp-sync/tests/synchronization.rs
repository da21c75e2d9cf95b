use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bkp_core::{
    DataPassVersionDraft, DataPassVersionStatus, RunDefinition, SimulationPassDraft, SkimmingStage,
};
use bkp_monalisa::{
    DataPassVersionDetails, DataPassVersionRecord, MonAlisaError, PassSource,
    SimulationPassAssociations, SimulationPassRecord,
};
use bkp_storage::{FetchError, MemoryStore};
use bkp_sync::{build_scheduler, MonAlisaSynchronizer, SyncConfig};

use DataPassVersionStatus::{Deleted, Running};

#[derive(Default)]
struct Script {
    versions: Option<Vec<DataPassVersionRecord>>,
    details: HashMap<String, Vec<i64>>,
    simulation_passes: Option<Vec<SimulationPassRecord>>,
}

/// Pass source answering from a mutable script; `None` listings fail with HTTP 503.
#[derive(Default)]
struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    fn set_versions(&self, versions: Option<Vec<DataPassVersionRecord>>) {
        self.script.lock().expect("script").versions = versions;
    }

    fn set_details(&self, description: &str, run_numbers: &[i64]) {
        self.script
            .lock()
            .expect("script")
            .details
            .insert(description.to_string(), run_numbers.to_vec());
    }

    fn remove_details(&self, description: &str) {
        self.script.lock().expect("script").details.remove(description);
    }

    fn set_simulation_passes(&self, passes: Option<Vec<SimulationPassRecord>>) {
        self.script.lock().expect("script").simulation_passes = passes;
    }
}

fn unavailable(url: &str) -> MonAlisaError {
    MonAlisaError::Fetch(FetchError::HttpStatus {
        status: 503,
        url: url.to_string(),
    })
}

#[async_trait]
impl PassSource for ScriptedSource {
    async fn data_pass_versions(&self) -> Result<Vec<DataPassVersionRecord>, MonAlisaError> {
        let script = self.script.lock().expect("script");
        script
            .versions
            .clone()
            .ok_or_else(|| unavailable("https://monalisa.test/raw"))
    }

    async fn data_pass_version_details(
        &self,
        description: &str,
    ) -> Result<DataPassVersionDetails, MonAlisaError> {
        let script = self.script.lock().expect("script");
        script
            .details
            .get(description)
            .map(|run_numbers| DataPassVersionDetails {
                run_numbers: run_numbers.clone(),
            })
            .ok_or_else(|| unavailable("https://monalisa.test/details"))
    }

    async fn simulation_passes(&self) -> Result<Vec<SimulationPassRecord>, MonAlisaError> {
        let script = self.script.lock().expect("script");
        script
            .simulation_passes
            .clone()
            .ok_or_else(|| unavailable("https://monalisa.test/mc"))
    }
}

fn version(name: &str, description: &str, last_seen: Option<i64>) -> DataPassVersionRecord {
    DataPassVersionRecord {
        name: name.into(),
        version: DataPassVersionDraft {
            description: description.into(),
            output_size: Some(1_000),
            reconstructed_events_count: Some(50),
            last_seen,
        },
    }
}

fn simulation_pass(
    name: &str,
    periods: &[&str],
    suffixes: &[&str],
    run_numbers: &[i64],
) -> SimulationPassRecord {
    SimulationPassRecord {
        properties: SimulationPassDraft {
            name: name.into(),
            jira_id: Some("O2-1234".into()),
            description: Some("Pythia8 Monash".into()),
            pwg: Some("PWGHF".into()),
            requested_events_count: Some(1_000),
            generated_events_count: Some(900),
            output_size: None,
        },
        associations: SimulationPassAssociations {
            lhc_periods: periods.iter().map(|p| p.to_string()).collect(),
            data_pass_suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
            run_numbers: run_numbers.to_vec(),
        },
    }
}

async fn setup() -> MonAlisaSynchronizer<ScriptedSource, MemoryStore> {
    let store = MemoryStore::new();
    store.insert_run(54, Some(RunDefinition::Physics)).await;
    store.insert_run(55, Some(RunDefinition::Cosmics)).await;
    store.insert_run(56, Some(RunDefinition::Physics)).await;
    store.insert_run(57, None).await;

    let source = ScriptedSource::default();
    source.set_simulation_passes(Some(Vec::new()));
    MonAlisaSynchronizer::new(source, store)
}

#[tokio::test]
async fn first_run_creates_passes_and_links_physics_runs() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23f_apass1", "LHC23f pass 1", Some(83)),
        version("LHC22b_apass1", "LHC22b pass 1", Some(12)),
    ]));
    sync.source().set_details("LHC23f pass 1", &[54, 55, 56, 57, 999]);
    sync.source().set_details("LHC22b pass 1", &[]);

    let summary = sync.synchronize().await;
    assert!(summary.is_clean(), "{summary:?}");
    assert_eq!(summary.data_passes.fetched, 2);
    assert_eq!(summary.data_passes.updated, 2);
    assert_eq!(summary.data_passes.deleted, 0);

    let store = sync.store();
    let mut periods: Vec<String> = store.lhc_periods().await.into_iter().map(|p| p.name).collect();
    periods.sort();
    assert_eq!(periods, vec!["LHC22b", "LHC23f"]);
    assert_eq!(store.data_passes().await.len(), 2);
    assert_eq!(store.status_history("LHC23f pass 1").await, vec![Running]);
    assert_eq!(store.data_pass_run_numbers("LHC23f_apass1").await, vec![54, 56]);
    assert!(store.data_pass_run_numbers("LHC22b_apass1").await.is_empty());
}

#[tokio::test]
async fn unchanged_watermarks_are_not_rewritten() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23f_apass1", "A", Some(83)),
        version("LHC23f_apass2", "B", None),
    ]));
    sync.source().set_details("A", &[54]);
    sync.source().set_details("B", &[56]);

    sync.synchronize().await;
    let history_after_first = sync.store().status_history_len().await;

    let second = sync.synchronize().await;
    assert!(second.is_clean());
    // B has no external watermark and is revisited every run.
    assert_eq!(second.data_passes.updated, 1);
    assert_eq!(sync.store().status_history_len().await, history_after_first);
    assert_eq!(sync.store().data_pass_versions().await.len(), 2);
    assert_eq!(sync.store().status_history("B").await, vec![Running]);
}

#[tokio::test]
async fn changed_watermark_updates_version_properties() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![version("LHC23f_apass1", "A", Some(83))]));
    sync.source().set_details("A", &[54]);
    sync.synchronize().await;

    let mut changed = version("LHC23f_apass1", "A", Some(90));
    changed.version.output_size = Some(2_000);
    sync.source().set_versions(Some(vec![changed]));
    sync.source().set_details("A", &[54, 56]);

    let summary = sync.synchronize().await;
    assert_eq!(summary.data_passes.updated, 1);

    let versions = sync.store().data_pass_versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].last_seen, Some(90));
    assert_eq!(versions[0].output_size, Some(2_000));
    assert_eq!(sync.store().status_history("A").await, vec![Running]);
    assert_eq!(sync.store().data_pass_run_numbers("LHC23f_apass1").await, vec![54, 56]);
}

#[tokio::test]
async fn disappearing_versions_are_deleted_and_restarted() {
    let sync = setup().await;
    sync.source().set_details("A", &[54]);
    sync.source().set_details("B", &[56]);

    let both = vec![
        version("LHC23f_apass1", "A", Some(1)),
        version("LHC23f_apass2", "B", Some(2)),
    ];
    sync.source().set_versions(Some(both.clone()));
    sync.synchronize().await;

    sync.source().set_versions(Some(vec![version("LHC23f_apass1", "A", Some(1))]));
    let removal = sync.synchronize().await;
    assert_eq!(removal.data_passes.deleted, 1);
    assert_eq!(sync.store().status_history("B").await, vec![Running, Deleted]);

    let repeated = sync.synchronize().await;
    assert_eq!(repeated.data_passes.deleted, 0);
    assert_eq!(sync.store().status_history("B").await, vec![Running, Deleted]);

    sync.source().set_versions(Some(both));
    let restart = sync.synchronize().await;
    assert_eq!(restart.data_passes.updated, 1);
    assert_eq!(
        sync.store().status_history("B").await,
        vec![Running, Deleted, Running]
    );
    assert_eq!(sync.store().status_history("A").await, vec![Running]);
    assert_eq!(sync.store().data_pass_versions().await.len(), 2);
}

#[tokio::test]
async fn empty_listing_deletes_every_known_version() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![version("LHC23f_apass1", "A", Some(1))]));
    sync.source().set_details("A", &[]);
    sync.synchronize().await;

    sync.source().set_versions(Some(Vec::new()));
    let summary = sync.synchronize().await;
    assert_eq!(summary.data_passes.deleted, 1);
    assert_eq!(sync.store().status_history("A").await, vec![Running, Deleted]);
}

#[tokio::test]
async fn skimming_stages_follow_creation_order() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23f_skimming", "skimming", Some(1)),
        version("LHC23f_apass4_skimmed", "apass4 skimmed", Some(1)),
        version("LHC23f_apass3_skimmed", "apass3 skimmed", Some(1)),
        version("LHC23f_apass1", "apass1", Some(1)),
    ]));
    for description in ["skimming", "apass4 skimmed", "apass3 skimmed", "apass1"] {
        sync.source().set_details(description, &[]);
    }

    sync.synchronize().await;

    let stages: HashMap<String, Option<SkimmingStage>> = sync
        .store()
        .data_passes()
        .await
        .into_iter()
        .map(|pass| (pass.name, pass.skimming_stage))
        .collect();
    assert_eq!(stages["LHC23f_skimming"], Some(SkimmingStage::Skimming));
    assert_eq!(stages["LHC23f_apass3_skimmed"], Some(SkimmingStage::Skimmed));
    assert_eq!(stages["LHC23f_apass4_skimmed"], Some(SkimmingStage::PostSkimmed));
    assert_eq!(stages["LHC23f_apass1"], None);
}

#[tokio::test]
async fn failed_details_roll_back_only_that_version() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23f_apass1", "A", Some(1)),
        version("LHC23f_apass2", "B", Some(1)),
    ]));
    sync.source().set_details("A", &[54]);
    sync.source().set_details("B", &[56]);
    sync.synchronize().await;

    sync.source().set_versions(Some(vec![
        version("LHC23f_apass1", "A", Some(2)),
        version("LHC23f_apass2", "B", Some(2)),
        version("LHC23f_apass3", "C", Some(2)),
    ]));
    sync.source().remove_details("A");
    sync.source().set_details("C", &[54]);

    let summary = sync.synchronize().await;
    assert_eq!(summary.data_passes.updated, 2);
    assert_eq!(summary.data_passes.failed, 1);
    assert_eq!(summary.data_passes.deleted, 0);
    assert!(!summary.is_clean());

    let versions = sync.store().data_pass_versions().await;
    let a = versions.iter().find(|v| v.description == "A").expect("A kept");
    assert_eq!(a.last_seen, Some(1));
    assert_eq!(sync.store().status_history("A").await, vec![Running]);
    assert_eq!(sync.store().status_history("C").await, vec![Running]);
}

#[tokio::test]
async fn failed_details_leave_new_version_absent() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![version("LHC23f_apass1", "A", Some(1))]));

    let summary = sync.synchronize().await;
    assert_eq!(summary.data_passes.failed, 1);
    assert!(sync.store().data_pass_versions().await.is_empty());
    assert!(sync.store().data_passes().await.is_empty());
    assert!(sync.store().lhc_periods().await.is_empty());
    assert_eq!(sync.store().status_history_len().await, 0);
}

#[tokio::test]
async fn shared_description_does_not_move_version_between_passes() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23g_apass1", "shared", Some(1)),
        version("LHC23f_apass1", "shared", Some(2)),
    ]));
    sync.source().set_details("shared", &[54]);

    let summary = sync.synchronize().await;
    assert_eq!(summary.data_passes.updated, 1);
    assert_eq!(summary.data_passes.failed, 1);

    let store = sync.store();
    let passes = store.data_passes().await;
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].name, "LHC23f_apass1");

    let versions = store.data_pass_versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].data_pass_id, passes[0].id);
    assert_eq!(versions[0].last_seen, Some(2));
    assert!(store.data_pass_run_numbers("LHC23g_apass1").await.is_empty());
}

#[tokio::test]
async fn listing_failure_is_fatal_for_data_passes_only() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![version("LHC23f_apass1", "A", Some(1))]));
    sync.source().set_details("A", &[]);
    sync.synchronize().await;

    sync.source().set_versions(None);
    sync.source().set_simulation_passes(Some(vec![simulation_pass(
        "LHC23k6c",
        &["LHC23f"],
        &["apass1"],
        &[54],
    )]));

    let summary = sync.synchronize().await;
    let fatal = summary.data_passes.fatal.as_deref().expect("fatal recorded");
    assert!(fatal.contains("503"), "{fatal}");
    assert_eq!(summary.data_passes.deleted, 0);
    assert_eq!(sync.store().status_history("A").await, vec![Running]);
    assert_eq!(summary.simulation_passes.updated, 1);
    assert!(summary.simulation_passes.fatal.is_none());
}

#[tokio::test]
async fn simulation_passes_link_only_existing_data_passes() {
    let sync = setup().await;
    sync.source().set_versions(Some(vec![
        version("LHC23f_apass1", "A", Some(1)),
        version("LHC22a_apass2", "B", Some(1)),
    ]));
    sync.source().set_details("A", &[]);
    sync.source().set_details("B", &[]);
    sync.source().set_simulation_passes(Some(vec![
        simulation_pass("LHC23k6c", &["LHC23f", "LHC22a"], &["apass1", "apass2"], &[54, 55, 56, 999]),
        simulation_pass("LHC24orphan", &["LHC24a"], &["apass1"], &[54]),
    ]));

    let summary = sync.synchronize().await;
    assert_eq!(summary.simulation_passes.fetched, 2);
    assert_eq!(summary.simulation_passes.updated, 1);
    assert_eq!(summary.simulation_passes.failed, 1);

    let store = sync.store();
    let names: Vec<String> = store.simulation_passes().await.into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["LHC23k6c"]);
    assert_eq!(
        store.simulation_pass_data_pass_names("LHC23k6c").await,
        vec!["LHC22a_apass2", "LHC23f_apass1"]
    );
    assert_eq!(store.simulation_pass_run_numbers("LHC23k6c").await, vec![54, 56]);

    let again = sync.synchronize().await;
    assert_eq!(again.simulation_passes.updated, 1);
    assert_eq!(store.simulation_passes().await.len(), 1);
    assert_eq!(store.simulation_pass_run_numbers("LHC23k6c").await, vec![54, 56]);
}

#[tokio::test]
async fn simulation_listing_failure_is_fatal() {
    let sync = setup().await;
    sync.source().set_versions(Some(Vec::new()));
    sync.source().set_simulation_passes(None);

    let summary = sync.synchronize().await;
    assert!(summary.data_passes.fatal.is_none());
    assert!(summary.simulation_passes.fatal.is_some());
}

#[tokio::test]
async fn disabled_synchronization_has_no_scheduler() {
    let config = SyncConfig::from_lookup(|_| None);
    let sync = Arc::new(setup().await);
    let scheduler = build_scheduler(&config, sync).await.expect("build");
    assert!(scheduler.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn enabled_synchronization_schedules_jobs() {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.enable_synchronization = true;
    config.initial_delay = Duration::from_secs(3600);
    config.synchronization_period = Duration::from_secs(86_400);

    let sync = Arc::new(setup().await);
    let scheduler = build_scheduler(&config, sync).await.expect("build");
    assert!(scheduler.is_some());
}
