//! Core domain model and provenance types for the VisaPath sponsor graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod normalize;
mod text;

pub use normalize::{normalize, snake_key, Normalized, SkipReason, JOB_AD_NUMERIC_FIELDS};
pub use text::{canonical_org_key, clean_company_name, collapse_whitespace, tokens};

pub const CRATE_NAME: &str = "visapath-core";

pub const UNKNOWN_TOWN: &str = "<UnknownTown>";
pub const UNKNOWN_COUNTY: &str = "<UnknownCounty>";
pub const UNKNOWN_ROUTE: &str = "<UnknownRoute>";

/// Attributes a registry row may never write onto an Organisation node.
pub const ORGANISATION_RESERVED: [&str; 4] = ["name", "display_name", "first_seen", "last_updated"];

/// Attributes a job ad may never write onto a JobAd node.
pub const JOB_AD_RESERVED: [&str; 6] = [
    "id",
    "company_clean",
    "sponsor_possible",
    "match_score",
    "route",
    "last_matched_ts",
];

/// Smallest step `last_updated` moves forward when a write reuses an older load timestamp.
pub const LAST_UPDATED_STEP_MS: i64 = 1;

/// Raw record as handed over by a source reader, before normalization.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Property bag stored on a graph node.
pub type Props = BTreeMap<String, PropValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Registry,
    JobAd,
}

impl RecordKind {
    /// Field that must be present (and non-blank) for a record of this kind to be kept.
    pub fn key_field(self) -> &'static str {
        match self {
            RecordKind::Registry => "organisation_name",
            RecordKind::JobAd => "id",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Registry => "registry",
            RecordKind::JobAd => "job_ad",
        }
    }
}

/// Scalar or list value that can live on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(v) => Some(*v),
            PropValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropValue::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(value: Vec<String>) -> Self {
        PropValue::List(value)
    }
}

/// Normalized record: snake-case keys, trimmed values, guaranteed non-blank key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub kind: RecordKind,
    pub key: String,
    pub props: Props,
}

impl CanonicalRecord {
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.props.get(field).and_then(PropValue::as_str)
    }

    /// String attribute, treating a blank value as absent.
    pub fn non_blank(&self, field: &str) -> Option<&str> {
        self.get_str(field).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationKey {
    pub town: String,
    pub county: String,
}

impl LocationKey {
    pub fn new(town: impl Into<String>, county: impl Into<String>) -> Self {
        Self {
            town: town.into(),
            county: county.into(),
        }
    }
}

/// One registry row prepared for merge into the graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganisationUpsert {
    pub key: String,
    pub display_name: String,
    pub town: String,
    pub county: String,
    pub type_rating: String,
    pub route: String,
    pub props: Props,
}

impl OrganisationUpsert {
    pub fn location(&self) -> LocationKey {
        LocationKey::new(self.town.clone(), self.county.clone())
    }
}

/// Accepted fuzzy match of a job ad's company onto an organisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub organisation_key: String,
    pub score: f64,
}

/// One job ad prepared for the enrichment write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAdWrite {
    pub id: String,
    pub props: Props,
    pub company_clean: String,
    pub matched: Option<MatchDecision>,
}

/// Read model of an Organisation with its outgoing relationships.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganisationNode {
    pub key: String,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub props: Props,
    pub locations: Vec<LocationKey>,
    pub routes: Vec<String>,
}

impl OrganisationNode {
    pub fn type_rating(&self) -> Option<&str> {
        self.props.get("type_rating").and_then(PropValue::as_str)
    }

    pub fn town(&self) -> Option<&str> {
        self.props.get("town").and_then(PropValue::as_str)
    }

    pub fn county(&self) -> Option<&str> {
        self.props.get("county").and_then(PropValue::as_str)
    }
}

/// Read model of a JobAd with its match edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAdNode {
    pub id: String,
    pub props: Props,
    pub company_clean: Option<String>,
    pub sponsor_possible: bool,
    pub match_score: Option<f64>,
    pub route: Option<Vec<String>>,
    pub last_matched_ts: Option<DateTime<Utc>>,
    pub posted_by: Option<String>,
}

/// Next `last_updated` value for a node written at `load_ts`.
///
/// Moves to `load_ts` when that is later than what is stored, otherwise steps the stored
/// value forward so every successful write is visible even when a load timestamp is reused.
pub fn advance_last_updated(
    previous: Option<DateTime<Utc>>,
    load_ts: DateTime<Utc>,
) -> DateTime<Utc> {
    match previous {
        Some(prev) if prev >= load_ts => prev + Duration::milliseconds(LAST_UPDATED_STEP_MS),
        _ => load_ts,
    }
}
