//! Parsing of MonAlisa payloads into pass records.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use bkp_core::{extract_lhc_period, DataPassVersionDraft, SimulationPassDraft};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

static JIRA_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+[A-Z0-9]+-\d+$").expect("static JIRA id pattern"));

const NAME_COLUMN: usize = 0;
const DESCRIPTION_COLUMN: usize = 1;
const RECONSTRUCTED_EVENTS_COLUMN: usize = 10;
const LAST_SEEN_COLUMN: usize = 14;
const OUTPUT_SIZE_COLUMN: usize = 16;

/// One data pass version row reported by MonAlisa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPassVersionRecord {
    pub name: String,
    pub version: DataPassVersionDraft,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataPassVersionDetails {
    pub run_numbers: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimulationPassAssociations {
    pub lhc_periods: Vec<String>,
    pub data_pass_suffixes: Vec<String>,
    pub run_numbers: Vec<i64>,
}

impl SimulationPassAssociations {
    /// Candidate data pass names: every anchored period combined with every pass suffix.
    pub fn data_pass_names(&self) -> Vec<String> {
        self.lhc_periods
            .iter()
            .flat_map(|period| {
                self.data_pass_suffixes
                    .iter()
                    .map(move |suffix| format!("{period}_{suffix}"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationPassRecord {
    pub properties: SimulationPassDraft,
    pub associations: SimulationPassAssociations,
}

/// Raw simulation pass attributes; MonAlisa sends numbers as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSimulationPass {
    #[serde(default, deserialize_with = "lenient_string")]
    pub anchor_production: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub anchor_pass: Option<String>,
    #[serde(default, rename = "runList", deserialize_with = "lenient_string")]
    pub run_list: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub generator: Option<String>,
    #[serde(default, rename = "jiraID", deserialize_with = "lenient_string")]
    pub jira_id: Option<String>,
    #[serde(default, rename = "PWG", deserialize_with = "lenient_string")]
    pub pwg: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub requested_events: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub generated_events: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub output_size: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn unquote(field: &str) -> &str {
    field.trim().trim_matches('"').trim()
}

fn parse_count(field: &str) -> Option<i64> {
    let field = unquote(field);
    if field.is_empty() {
        return None;
    }
    field
        .parse::<i64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
}

fn year_accepted(name: &str, year_lower_limit: i32) -> bool {
    extract_lhc_period(name).is_some_and(|period| period.year >= year_lower_limit)
}

/// Parses the `;`-separated data pass versions listing. The first row is a header.
///
/// Rows whose name is not a data pass of an accepted LHC period, or whose description is
/// blank, are skipped.
pub fn parse_data_pass_versions(payload: &str, year_lower_limit: i32) -> Vec<DataPassVersionRecord> {
    payload
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let columns: Vec<&str> = line.split(';').collect();
            let column = |index: usize| columns.get(index).copied().unwrap_or_default();

            let name = unquote(column(NAME_COLUMN));
            let description = unquote(column(DESCRIPTION_COLUMN));
            if !year_accepted(name, year_lower_limit) || description.is_empty() {
                return None;
            }
            Some(DataPassVersionRecord {
                name: name.to_string(),
                version: DataPassVersionDraft {
                    description: description.to_string(),
                    reconstructed_events_count: parse_count(column(RECONSTRUCTED_EVENTS_COLUMN)),
                    last_seen: parse_count(column(LAST_SEEN_COLUMN)),
                    output_size: parse_count(column(OUTPUT_SIZE_COLUMN)),
                },
            })
        })
        .collect()
}

/// Run numbers of a data pass version details payload (`{ key: { run_no } }`), first-seen order.
pub fn parse_data_pass_version_details(payload: &JsonValue) -> DataPassVersionDetails {
    let Some(entries) = payload.as_object() else {
        return DataPassVersionDetails::default();
    };
    let mut seen = BTreeSet::new();
    let run_numbers = entries
        .values()
        .filter_map(|entry| match entry.get("run_no")? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|run_number| seen.insert(*run_number))
        .collect();
    DataPassVersionDetails { run_numbers }
}

/// Splits a trailing `, <JIRA-ID>` off a generator description.
///
/// Returns the remaining description (or `None` when blank) and the extracted id.
pub fn extract_jira_id(generator: &str) -> (Option<String>, Option<String>) {
    let generator = generator.trim();
    if let Some((description, candidate)) = generator.rsplit_once(", ") {
        let candidate = candidate.trim();
        if JIRA_ID.is_match(candidate) {
            return (non_blank(description), Some(candidate.to_string()));
        }
    }
    (non_blank(generator), None)
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// Zero, missing or unparsable counters are treated as unknown.
fn positive_count(value: Option<&str>) -> Option<i64> {
    value.and_then(parse_count).filter(|v| *v != 0)
}

fn simulation_pass_from_raw(
    name: &str,
    raw: &RawSimulationPass,
    year_lower_limit: i32,
) -> SimulationPassRecord {
    let (description, extracted_jira_id) = extract_jira_id(raw.generator.as_deref().unwrap_or_default());
    let jira_id = extracted_jira_id.or_else(|| raw.jira_id.as_deref().and_then(non_blank));

    SimulationPassRecord {
        properties: SimulationPassDraft {
            name: name.to_string(),
            jira_id,
            description,
            pwg: raw.pwg.as_deref().and_then(non_blank),
            requested_events_count: positive_count(raw.requested_events.as_deref()),
            generated_events_count: positive_count(raw.generated_events.as_deref()),
            output_size: positive_count(raw.output_size.as_deref()),
        },
        associations: SimulationPassAssociations {
            lhc_periods: split_list(raw.anchor_production.as_deref())
                .filter(|period| year_accepted(period, year_lower_limit))
                .map(str::to_string)
                .collect(),
            data_pass_suffixes: split_list(raw.anchor_pass.as_deref())
                .map(str::to_string)
                .collect(),
            run_numbers: split_list(raw.run_list.as_deref())
                .filter_map(|run| run.parse().ok())
                .collect(),
        },
    }
}

/// Converts the simulation passes payload, dropping passes without usable anchors.
pub fn parse_simulation_passes(
    payload: &BTreeMap<String, RawSimulationPass>,
    year_lower_limit: i32,
) -> Vec<SimulationPassRecord> {
    payload
        .iter()
        .map(|(name, raw)| (name.trim(), raw))
        .filter(|(name, raw)| {
            !name.is_empty()
                && raw.anchor_production.as_deref().is_some_and(|s| !s.trim().is_empty())
                && raw.anchor_pass.as_deref().is_some_and(|s| !s.trim().is_empty())
        })
        .map(|(name, raw)| simulation_pass_from_raw(name, raw, year_lower_limit))
        .filter(|record| {
            !record.associations.lhc_periods.is_empty()
                && !record.associations.data_pass_suffixes.is_empty()
        })
        .collect()
}
