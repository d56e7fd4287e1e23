//! Upsert Engine: registry rows into Organisation, Location and Route nodes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use visapath_core::{
    canonical_org_key, collapse_whitespace, CanonicalRecord, OrganisationUpsert, PropValue,
    ORGANISATION_RESERVED, UNKNOWN_COUNTY, UNKNOWN_ROUTE, UNKNOWN_TOWN,
};
use visapath_storage::{GraphStore, RetryPolicy, StoreError};

use crate::orchestrator::{BatchOutcome, BatchSink};

const TOWN_FIELD: &str = "town_city";
const COUNTY_FIELD: &str = "county";
const RATING_FIELD: &str = "type_rating";
const ROUTE_FIELD: &str = "route";

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Shape one normalized registry row into a merge request.
    pub fn prepare(record: &CanonicalRecord) -> OrganisationUpsert {
        let town = record.non_blank(TOWN_FIELD).unwrap_or(UNKNOWN_TOWN);
        let county = record.non_blank(COUNTY_FIELD).unwrap_or(UNKNOWN_COUNTY);
        let route = record.non_blank(ROUTE_FIELD).unwrap_or(UNKNOWN_ROUTE);

        let type_rating = record.get_str(RATING_FIELD).unwrap_or_default();

        let mut props = record.props.clone();
        for reserved in ORGANISATION_RESERVED {
            props.remove(reserved);
        }
        // The node mirrors the Location it was last written with, sentinels included.
        props.insert("town".into(), PropValue::Str(town.to_string()));
        props.insert(COUNTY_FIELD.into(), PropValue::Str(county.to_string()));
        props.insert(RATING_FIELD.into(), PropValue::Str(type_rating.to_string()));

        OrganisationUpsert {
            key: canonical_org_key(&record.key),
            display_name: collapse_whitespace(&record.key),
            town: town.to_string(),
            county: county.to_string(),
            type_rating: type_rating.to_string(),
            route: route.to_string(),
            props,
        }
    }

    /// Merge one batch in a single transaction, retrying once on a transient failure.
    pub async fn upsert(
        &self,
        records: &[CanonicalRecord],
        load_ts: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let rows: Vec<OrganisationUpsert> = records.iter().map(Self::prepare).collect();
        let store = &self.store;
        let rows = rows.as_slice();
        let written = self
            .retry
            .run("upsert_organisations", move || async move {
                store.upsert_organisations(rows, load_ts).await
            })
            .await?;
        debug!(written, "registry batch committed");
        Ok(written)
    }
}

/// A registry ingestion run: every batch is stamped with the same load timestamp.
pub struct RegistryLoad {
    engine: UpsertEngine,
    load_ts: DateTime<Utc>,
}

impl RegistryLoad {
    pub fn new(engine: UpsertEngine, load_ts: DateTime<Utc>) -> Self {
        Self { engine, load_ts }
    }
}

#[async_trait]
impl BatchSink for RegistryLoad {
    fn label(&self) -> &'static str {
        "registry"
    }

    async fn write_batch(&self, batch: &[CanonicalRecord]) -> Result<BatchOutcome, StoreError> {
        let written = self.engine.upsert(batch, self.load_ts).await?;
        Ok(BatchOutcome {
            written,
            matched: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visapath_core::{Props, RecordKind};

    fn registry(pairs: &[(&str, &str)]) -> CanonicalRecord {
        let props: Props = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropValue::Str(v.to_string())))
            .collect();
        CanonicalRecord {
            kind: RecordKind::Registry,
            key: props
                .get("organisation_name")
                .and_then(PropValue::as_str)
                .unwrap_or_default()
                .to_string(),
            props,
        }
    }

    #[test]
    fn prepare_canonicalises_key_and_keeps_source_spelling() {
        let row = UpsertEngine::prepare(&registry(&[
            ("organisation_name", "ACME   Ltd"),
            ("town_city", "London"),
            ("county", "Greater London"),
            ("type_rating", "Worker (A rating)"),
            ("route", "Skilled Worker"),
            ("website", "acme.example"),
        ]));

        assert_eq!(row.key, "acme ltd");
        assert_eq!(row.display_name, "ACME Ltd");
        assert_eq!(row.location().town, "London");
        assert_eq!(row.route, "Skilled Worker");
        assert_eq!(row.props.get("website").and_then(PropValue::as_str), Some("acme.example"));
    }

    #[test]
    fn blank_location_and_route_fall_back_to_sentinels() {
        let row = UpsertEngine::prepare(&registry(&[
            ("organisation_name", "Acme"),
            ("town_city", ""),
            ("county", ""),
            ("route", ""),
        ]));
        assert_eq!(row.town, UNKNOWN_TOWN);
        assert_eq!(row.county, UNKNOWN_COUNTY);
        assert_eq!(row.route, UNKNOWN_ROUTE);
        assert_eq!(row.type_rating, "");
        assert_eq!(row.props.get("town").and_then(PropValue::as_str), Some(UNKNOWN_TOWN));
        assert_eq!(row.props.get("county").and_then(PropValue::as_str), Some(UNKNOWN_COUNTY));
    }

    #[test]
    fn reserved_attributes_are_not_overlaid() {
        let row = UpsertEngine::prepare(&registry(&[
            ("organisation_name", "Acme"),
            ("first_seen", "1999-01-01"),
            ("name", "spoofed"),
        ]));
        assert!(!row.props.contains_key("first_seen"));
        assert!(!row.props.contains_key("name"));
    }
}
