//! Core domain model for the bookkeeping MonAlisa synchronization.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bkp-core";

static LHC_PERIOD_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(LHC(\d{2})[A-Za-z]+)(?:_.*)?$").expect("static LHC period pattern")
});

/// LHC period name and year derived from a pass or period name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LhcPeriodName {
    pub name: String,
    pub year: i32,
}

/// Extracts the LHC period from names such as `LHC23f` or `LHC23f_apass1`.
///
/// Returns `None` when the name does not follow the `LHC<yy><letters>[_suffix]` convention.
pub fn extract_lhc_period(name: &str) -> Option<LhcPeriodName> {
    let captures = LHC_PERIOD_NAME.captures(name.trim())?;
    let year: i32 = captures.get(2)?.as_str().parse().ok()?;
    Some(LhcPeriodName {
        name: captures.get(1)?.as_str().to_string(),
        year: 2000 + year,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a wire-named enum with `as_str`, `Display` and `FromStr`.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($wire => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum!(
    /// Classification of a data pass within the skimming workflow of its period.
    SkimmingStage, "skimming stage", {
        Skimming => "SKIMMING",
        Skimmed => "SKIMMED",
        PostSkimmed => "POST_SKIMMED",
    }
);

wire_enum!(
    /// Presence of a data pass version in MonAlisa.
    DataPassVersionStatus, "data pass version status", {
        Running => "RUNNING",
        Deleted => "DELETED",
    }
);

wire_enum!(
    RunDefinition, "run definition", {
        Physics => "PHYSICS",
        Cosmics => "COSMICS",
        Technical => "TECHNICAL",
        Synthetic => "SYNTHETIC",
        Calibration => "CALIBRATION",
        Commissioning => "COMMISSIONING",
    }
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LhcPeriod {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPass {
    pub id: i64,
    pub name: String,
    pub lhc_period_id: i64,
    pub skimming_stage: Option<SkimmingStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataPass {
    pub name: String,
    pub lhc_period_id: i64,
    pub skimming_stage: Option<SkimmingStage>,
}

/// Data pass version properties as reported by MonAlisa, keyed by `description`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPassVersionDraft {
    pub description: String,
    pub output_size: Option<i64>,
    pub reconstructed_events_count: Option<i64>,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPassVersion {
    pub id: i64,
    pub data_pass_id: i64,
    pub description: String,
    pub output_size: Option<i64>,
    pub reconstructed_events_count: Option<i64>,
    pub last_seen: Option<i64>,
}

/// One append-only entry of a data pass version status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPassVersionStatusEntry {
    pub id: i64,
    pub data_pass_version_id: i64,
    pub status: DataPassVersionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationPassDraft {
    pub name: String,
    pub jira_id: Option<String>,
    pub description: Option<String>,
    pub pwg: Option<String>,
    pub requested_events_count: Option<i64>,
    pub generated_events_count: Option<i64>,
    pub output_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationPass {
    pub id: i64,
    pub name: String,
    pub jira_id: Option<String>,
    pub description: Option<String>,
    pub pwg: Option<String>,
    pub requested_events_count: Option<i64>,
    pub generated_events_count: Option<i64>,
    pub output_size: Option<i64>,
}

impl SimulationPass {
    pub fn from_draft(id: i64, draft: &SimulationPassDraft) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            jira_id: draft.jira_id.clone(),
            description: draft.description.clone(),
            pwg: draft.pwg.clone(),
            requested_events_count: draft.requested_events_count,
            generated_events_count: draft.generated_events_count,
            output_size: draft.output_size,
        }
    }
}

/// Run as known locally; never created by the synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_number: i64,
    pub definition: Option<RunDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_period_from_pass_names() {
        assert_eq!(
            extract_lhc_period("LHC23f_apass1"),
            Some(LhcPeriodName {
                name: "LHC23f".into(),
                year: 2023
            })
        );
        assert_eq!(
            extract_lhc_period("LHC22zzh"),
            Some(LhcPeriodName {
                name: "LHC22zzh".into(),
                year: 2022
            })
        );
        assert_eq!(extract_lhc_period("LHC09a_pass2_skimmed").map(|p| p.year), Some(2009));
    }

    #[test]
    fn rejects_names_outside_convention() {
        for name in ["", "LHC2f_apass1", "LHC23_apass1", "lhc23f_apass1", "XLHC23f", "LHC23f-apass1"] {
            assert_eq!(extract_lhc_period(name), None, "{name}");
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for stage in SkimmingStage::ALL {
            assert_eq!(stage.as_str().parse::<SkimmingStage>(), Ok(*stage));
        }
        assert_eq!("POST_SKIMMED".parse::<SkimmingStage>(), Ok(SkimmingStage::PostSkimmed));
        assert_eq!(
            serde_json::to_string(&DataPassVersionStatus::Deleted).expect("json"),
            "\"DELETED\""
        );
        let err = "physics".parse::<RunDefinition>().unwrap_err();
        assert_eq!(err.to_string(), "unknown run definition value `physics`");
    }
}
