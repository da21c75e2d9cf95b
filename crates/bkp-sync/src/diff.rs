//! Watermark comparison between fetched data pass versions and the local store.

use std::collections::{BTreeMap, BTreeSet};

use bkp_core::DataPassVersionStatus;
use bkp_monalisa::DataPassVersionRecord;
use bkp_storage::VersionWatermark;

/// Known, not deleted data pass versions keyed by description.
#[derive(Debug, Clone, Default)]
pub struct WatermarkIndex {
    versions: BTreeMap<String, VersionWatermark>,
}

impl WatermarkIndex {
    pub fn new(watermarks: impl IntoIterator<Item = VersionWatermark>) -> Self {
        let versions = watermarks
            .into_iter()
            .filter(|w| w.last_status != Some(DataPassVersionStatus::Deleted))
            .map(|w| (w.description.clone(), w))
            .collect();
        Self { versions }
    }

    pub fn get(&self, description: &str) -> Option<&VersionWatermark> {
        self.versions.get(description)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// A record is up to date only when both sides carry the same `last_seen`.
pub fn needs_update(record: &DataPassVersionRecord, index: &WatermarkIndex) -> bool {
    match (record.version.last_seen, index.get(&record.version.description)) {
        (Some(last_seen), Some(known)) => known.last_seen != Some(last_seen),
        _ => true,
    }
}

/// Records to reconcile, ordered by pass name.
pub fn records_to_update<'a>(
    records: &'a [DataPassVersionRecord],
    index: &WatermarkIndex,
) -> Vec<&'a DataPassVersionRecord> {
    let mut pending: Vec<_> = records.iter().filter(|r| needs_update(r, index)).collect();
    pending.sort_by(|a, b| a.name.cmp(&b.name));
    pending
}

/// Known versions no longer reported by the external feed.
pub fn absent_versions<'a>(
    index: &'a WatermarkIndex,
    fetched: &[DataPassVersionRecord],
) -> Vec<&'a VersionWatermark> {
    let reported: BTreeSet<&str> = fetched
        .iter()
        .map(|r| r.version.description.as_str())
        .collect();
    index
        .versions
        .values()
        .filter(|w| !reported.contains(w.description.as_str()))
        .collect()
}
