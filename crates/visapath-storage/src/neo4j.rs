use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString,
    BoltType, ConfigBuilder, Graph, Query, Row,
};
use tracing::{debug, info, warn};
use visapath_core::{
    JobAdNode, JobAdWrite, LocationKey, OrganisationNode, OrganisationUpsert, PropValue, Props,
    JOB_AD_RESERVED, ORGANISATION_RESERVED,
};

use crate::{with_timeout, GraphConnectionConfig, GraphStore, StoreError};

const CONSTRAINTS: [&str; 4] = [
    "CREATE CONSTRAINT organisation_name IF NOT EXISTS FOR (o:Organisation) REQUIRE o.name IS UNIQUE",
    "CREATE CONSTRAINT location_key IF NOT EXISTS FOR (l:Location) REQUIRE (l.town, l.county) IS UNIQUE",
    "CREATE CONSTRAINT route_name IF NOT EXISTS FOR (r:Route) REQUIRE r.name IS UNIQUE",
    "CREATE CONSTRAINT job_ad_id IF NOT EXISTS FOR (j:JobAd) REQUIRE j.id IS UNIQUE",
];

const UPSERT_ORGANISATIONS: &str = "
UNWIND $rows AS row
MERGE (o:Organisation {name: row.key})
ON CREATE SET o.first_seen = $load_ts
SET o.last_updated = CASE
        WHEN o.last_updated IS NULL OR o.last_updated < $load_ts THEN $load_ts
        ELSE o.last_updated + duration({milliseconds: 1})
    END,
    o.display_name = row.display_name
SET o += row.props
SET o.town = row.town, o.county = row.county, o.type_rating = row.type_rating
MERGE (l:Location {town: row.town, county: row.county})
MERGE (r:Route {name: row.route})
MERGE (o)-[:LOCATED_IN]->(l)
MERGE (o)-[:OFFERS_ROUTE]->(r)";

// Unmatched rows carry a null org_key, so the optional match finds nothing and the
// node falls back to the unmatched state.
const WRITE_JOB_ADS: &str = "
UNWIND $rows AS row
MERGE (j:JobAd {id: row.id})
SET j += row.props, j.company_clean = row.company_clean
WITH j, row
OPTIONAL MATCH (j)-[old:POSTED_BY]->()
DELETE old
WITH DISTINCT j, row
OPTIONAL MATCH (o:Organisation {name: row.org_key})
FOREACH (_ IN CASE WHEN o IS NULL THEN [] ELSE [1] END | MERGE (j)-[:POSTED_BY]->(o))
SET j.sponsor_possible = o IS NOT NULL,
    j.match_score = CASE WHEN o IS NULL THEN null ELSE row.score END,
    j.last_matched_ts = CASE WHEN o IS NULL THEN j.last_matched_ts ELSE $matched_at END
WITH j, o
OPTIONAL MATCH (o)-[:OFFERS_ROUTE]->(rt:Route)
WITH j, o, rt.name AS route_name ORDER BY route_name
WITH j, o, collect(DISTINCT route_name) AS routes
SET j.route = CASE WHEN o IS NULL THEN null ELSE routes END";

const ORGANISATION_KEYS: &str = "MATCH (o:Organisation) RETURN o.name AS name ORDER BY name";

const READ_ORGANISATION: &str = "
MATCH (o:Organisation {name: $key})
OPTIONAL MATCH (o)-[:LOCATED_IN]->(l:Location)
OPTIONAL MATCH (o)-[:OFFERS_ROUTE]->(r:Route)
RETURN properties(o) AS props,
       o.first_seen AS first_seen,
       o.last_updated AS last_updated,
       collect(DISTINCT l {.town, .county}) AS locations,
       collect(DISTINCT r.name) AS routes";

const READ_JOB_AD: &str = "
MATCH (j:JobAd {id: $id})
OPTIONAL MATCH (j)-[:POSTED_BY]->(o:Organisation)
RETURN properties(j) AS props,
       j.last_matched_ts AS last_matched_ts,
       o.name AS posted_by";

/// Neo4j-backed graph store. Each write runs in its own explicit transaction on a pooled
/// connection that goes back to the pool on commit or rollback.
#[derive(Clone)]
pub struct Neo4jStore {
    graph: Graph,
    op_timeout: Duration,
}

impl Neo4jStore {
    pub async fn connect(config: &GraphConnectionConfig) -> Result<Self, StoreError> {
        let neo_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.user.as_str())
            .password(config.password.as_str())
            .db(config.database.as_str())
            .fetch_size(config.fetch_size)
            .max_connections(config.max_connections)
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;

        let graph = match tokio::time::timeout(config.op_timeout, Graph::connect(neo_config)).await
        {
            Ok(Ok(graph)) => graph,
            Ok(Err(err)) => return Err(StoreError::Connectivity(err.to_string())),
            Err(_) => {
                return Err(StoreError::Connectivity(format!(
                    "no response from {} within {:?}",
                    config.uri, config.op_timeout
                )))
            }
        };
        info!(
            uri = %config.uri,
            database = %config.database,
            max_connections = config.max_connections,
            "connected to neo4j"
        );
        Ok(Self {
            graph,
            op_timeout: config.op_timeout,
        })
    }

    async fn write_in_txn(&self, label: &str, q: Query) -> Result<(), StoreError> {
        let limit = self.op_timeout;
        let mut txn = with_timeout(limit, async {
            self.graph.start_txn().await.map_err(classify)
        })
        .await?;

        let outcome = with_timeout(limit, async { txn.run(q).await.map_err(classify) }).await;
        if let Err(err) = outcome {
            debug!(op = label, error = %err, "rolling back");
            match tokio::time::timeout(limit, txn.rollback()).await {
                Ok(Ok(())) => {}
                Ok(Err(rollback_err)) => {
                    warn!(op = label, error = %rollback_err, "rollback failed")
                }
                Err(_) => warn!(op = label, "rollback timed out"),
            }
            return Err(err);
        }

        with_timeout(limit, async move { txn.commit().await.map_err(classify) }).await
    }

    async fn fetch_one(&self, q: Query) -> Result<Option<Row>, StoreError> {
        with_timeout(self.op_timeout, async {
            let mut stream = self.graph.execute(q).await.map_err(classify)?;
            stream.next().await.map_err(classify)
        })
        .await
    }

    async fn run_ignoring_exists(&self, cypher: &str) -> Result<(), StoreError> {
        let outcome = with_timeout(self.op_timeout, async {
            self.graph.run(query(cypher)).await.map_err(classify)
        })
        .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                let msg = err.to_string().to_lowercase();
                if msg.contains("already exists") || msg.contains("equivalent") {
                    debug!(statement = cypher, "constraint already present");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    fn backend(&self) -> &'static str {
        "neo4j"
    }

    async fn verify_connectivity(&self) -> Result<(), StoreError> {
        match self.fetch_one(query("RETURN 1 AS ok")).await {
            Ok(_) => Ok(()),
            Err(err) => Err(StoreError::Connectivity(err.to_string())),
        }
    }

    async fn ensure_constraints(&self) -> Result<(), StoreError> {
        for statement in CONSTRAINTS {
            self.run_ignoring_exists(statement).await?;
        }
        info!(count = CONSTRAINTS.len(), "uniqueness constraints in place");
        Ok(())
    }

    async fn upsert_organisations(
        &self,
        rows: &[OrganisationUpsert],
        load_ts: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let payload: Vec<BoltType> = rows.iter().map(organisation_row).collect();
        let q = query(UPSERT_ORGANISATIONS)
            .param("rows", payload)
            .param("load_ts", load_ts.fixed_offset());
        self.write_in_txn("upsert_organisations", q).await?;
        Ok(rows.len())
    }

    async fn write_job_ads(
        &self,
        rows: &[JobAdWrite],
        matched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let payload: Vec<BoltType> = rows.iter().map(job_ad_row).collect();
        let q = query(WRITE_JOB_ADS)
            .param("rows", payload)
            .param("matched_at", matched_at.fixed_offset());
        self.write_in_txn("write_job_ads", q).await?;
        Ok(rows.len())
    }

    async fn organisation_keys(&self) -> Result<Vec<String>, StoreError> {
        with_timeout(self.op_timeout, async {
            let mut stream = self
                .graph
                .execute(query(ORGANISATION_KEYS))
                .await
                .map_err(classify)?;
            let mut keys = Vec::new();
            while let Some(row) = stream.next().await.map_err(classify)? {
                if let Ok(name) = row.get::<String>("name") {
                    keys.push(name);
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn organisation(&self, key: &str) -> Result<Option<OrganisationNode>, StoreError> {
        let Some(row) = self
            .fetch_one(query(READ_ORGANISATION).param("key", key))
            .await?
        else {
            return Ok(None);
        };
        let bolt_props: BoltMap = row.get("props").map_err(decode_error)?;
        let mut props = props_from_bolt(&bolt_props);
        let display_name = match props.remove("display_name") {
            Some(PropValue::Str(name)) => name,
            _ => key.to_string(),
        };
        for reserved in ORGANISATION_RESERVED {
            props.remove(reserved);
        }
        let first_seen = row_datetime(&row, "first_seen")
            .ok_or_else(|| StoreError::Rejected(format!("organisation {key} has no first_seen")))?;
        let last_updated = row_datetime(&row, "last_updated").unwrap_or(first_seen);

        let mut locations: Vec<LocationKey> = row
            .get::<Vec<BoltMap>>("locations")
            .unwrap_or_default()
            .iter()
            .filter_map(|map| {
                let located = props_from_bolt(map);
                let town = located.get("town")?.as_str()?.to_string();
                let county = located.get("county")?.as_str()?.to_string();
                Some(LocationKey { town, county })
            })
            .collect();
        locations.sort();
        let mut routes: Vec<String> = row.get("routes").unwrap_or_default();
        routes.sort();

        Ok(Some(OrganisationNode {
            key: key.to_string(),
            display_name,
            first_seen,
            last_updated,
            props,
            locations,
            routes,
        }))
    }

    async fn job_ad(&self, id: &str) -> Result<Option<JobAdNode>, StoreError> {
        let Some(row) = self.fetch_one(query(READ_JOB_AD).param("id", id)).await? else {
            return Ok(None);
        };
        let bolt_props: BoltMap = row.get("props").map_err(decode_error)?;
        let mut props = props_from_bolt(&bolt_props);

        let company_clean = match props.remove("company_clean") {
            Some(PropValue::Str(s)) => Some(s),
            _ => None,
        };
        let sponsor_possible = props
            .remove("sponsor_possible")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let match_score = props.remove("match_score").and_then(|v| v.as_f64());
        let route = match props.remove("route") {
            Some(PropValue::List(routes)) => Some(routes),
            _ => None,
        };
        for reserved in JOB_AD_RESERVED {
            props.remove(reserved);
        }

        Ok(Some(JobAdNode {
            id: id.to_string(),
            props,
            company_clean,
            sponsor_possible,
            match_score,
            route,
            last_matched_ts: row_datetime(&row, "last_matched_ts"),
            posted_by: row.get::<Option<String>>("posted_by").ok().flatten(),
        }))
    }
}

/// Map a driver error onto the retry taxonomy by its status text.
fn classify(err: neo4rs::Error) -> StoreError {
    classify_message(err.to_string())
}

fn classify_message(msg: String) -> StoreError {
    let lower = msg.to_lowercase();
    let misconfigured = [
        "unauthorized",
        "authentication",
        "credentials",
        "databasenotfound",
        "database does not exist",
    ]
    .iter()
    .any(|marker| lower.contains(marker));
    if misconfigured {
        return StoreError::Config(msg);
    }
    let transient = [
        "transienterror",
        "deadlock",
        "notaleader",
        "not a leader",
        "connection reset",
        "connection refused",
        "broken pipe",
        "timed out",
        "io error",
    ]
    .iter()
    .any(|marker| lower.contains(marker));
    if transient {
        StoreError::Transient(msg)
    } else {
        StoreError::Rejected(msg)
    }
}

fn decode_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Rejected(format!("unexpected row shape: {err}"))
}

fn row_datetime(row: &Row, key: &str) -> Option<DateTime<Utc>> {
    row.get::<DateTime<FixedOffset>>(key)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn entry(key: &str, value: BoltType) -> (BoltString, BoltType) {
    (BoltString::from(key), value)
}

fn bolt_str(value: &str) -> BoltType {
    BoltType::String(BoltString::from(value))
}

fn organisation_row(row: &OrganisationUpsert) -> BoltType {
    BoltType::Map(BoltMap::from_iter(vec![
        entry("key", bolt_str(&row.key)),
        entry("display_name", bolt_str(&row.display_name)),
        entry("town", bolt_str(&row.town)),
        entry("county", bolt_str(&row.county)),
        entry("type_rating", bolt_str(&row.type_rating)),
        entry("route", bolt_str(&row.route)),
        entry("props", BoltType::Map(props_to_bolt(&row.props))),
    ]))
}

fn job_ad_row(row: &JobAdWrite) -> BoltType {
    let (org_key, score) = match &row.matched {
        Some(decision) => (
            bolt_str(&decision.organisation_key),
            BoltType::Float(BoltFloat::new(decision.score)),
        ),
        None => (BoltType::Null(BoltNull), BoltType::Null(BoltNull)),
    };
    BoltType::Map(BoltMap::from_iter(vec![
        entry("id", bolt_str(&row.id)),
        entry("props", BoltType::Map(props_to_bolt(&row.props))),
        entry("company_clean", bolt_str(&row.company_clean)),
        entry("org_key", org_key),
        entry("score", score),
    ]))
}

fn props_to_bolt(props: &Props) -> BoltMap {
    BoltMap::from_iter(
        props
            .iter()
            .map(|(key, value)| (BoltString::from(key.as_str()), prop_to_bolt(value))),
    )
}

fn prop_to_bolt(value: &PropValue) -> BoltType {
    match value {
        PropValue::Bool(v) => BoltType::Boolean(BoltBoolean::new(*v)),
        PropValue::Int(v) => BoltType::Integer(BoltInteger::new(*v)),
        PropValue::Float(v) => BoltType::Float(BoltFloat::new(*v)),
        PropValue::Str(v) => bolt_str(v),
        PropValue::List(items) => BoltType::List(BoltList {
            value: items.iter().map(|item| bolt_str(item)).collect(),
        }),
    }
}

/// Scalar and string-list properties only; temporal values are read through their own columns.
fn props_from_bolt(map: &BoltMap) -> Props {
    map.value
        .iter()
        .filter_map(|(key, value)| Some((key.value.clone(), prop_from_bolt(value)?)))
        .collect()
}

fn prop_from_bolt(value: &BoltType) -> Option<PropValue> {
    match value {
        BoltType::String(s) => Some(PropValue::Str(s.value.clone())),
        BoltType::Boolean(b) => Some(PropValue::Bool(b.value)),
        BoltType::Integer(i) => Some(PropValue::Int(i.value)),
        BoltType::Float(f) => Some(PropValue::Float(f.value)),
        BoltType::List(list) => Some(PropValue::List(
            list.value
                .iter()
                .filter_map(|item| match item {
                    BoltType::String(s) => Some(s.value.clone()),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bolt_conversion_keeps_supported_values() {
        let mut props = Props::new();
        props.insert("title".into(), "Engineer".into());
        props.insert("salary_min".into(), 42000.0.into());
        props.insert("remote".into(), true.into());
        props.insert("tags".into(), vec!["rust".to_string(), "graph".to_string()].into());

        let back = props_from_bolt(&props_to_bolt(&props));
        assert_eq!(back, props);
    }

    #[test]
    fn organisation_rows_carry_merge_keys() {
        let row = OrganisationUpsert {
            key: "acme ltd".into(),
            display_name: "Acme Ltd".into(),
            town: "London".into(),
            county: "Greater London".into(),
            type_rating: "Worker (A rating)".into(),
            route: "Skilled Worker".into(),
            props: Props::new(),
        };
        let BoltType::Map(map) = organisation_row(&row) else {
            panic!("expected a map");
        };
        let flat = props_from_bolt(&map);
        assert_eq!(flat.get("key").and_then(PropValue::as_str), Some("acme ltd"));
        assert_eq!(flat.get("route").and_then(PropValue::as_str), Some("Skilled Worker"));
    }

    #[test]
    fn unmatched_job_rows_send_null_match_fields() {
        let row = JobAdWrite {
            id: "77".into(),
            props: Props::new(),
            company_clean: "totally unrelated co".into(),
            matched: None,
        };
        let BoltType::Map(map) = job_ad_row(&row) else {
            panic!("expected a map");
        };
        assert!(matches!(map.value.get(&BoltString::from("org_key")), Some(BoltType::Null(_))));
        assert!(matches!(map.value.get(&BoltString::from("score")), Some(BoltType::Null(_))));
        let flat = props_from_bolt(&map);
        assert_eq!(flat.get("id").and_then(PropValue::as_str), Some("77"));
        assert_eq!(
            flat.get("company_clean").and_then(PropValue::as_str),
            Some("totally unrelated co")
        );
    }

    #[test]
    fn matched_job_rows_carry_key_and_score() {
        let row = JobAdWrite {
            id: "123".into(),
            props: Props::new(),
            company_clean: "acme ltd".into(),
            matched: Some(visapath_core::MatchDecision {
                organisation_key: "acme ltd".into(),
                score: 0.93,
            }),
        };
        let BoltType::Map(map) = job_ad_row(&row) else {
            panic!("expected a map");
        };
        let flat = props_from_bolt(&map);
        assert_eq!(flat.get("org_key").and_then(PropValue::as_str), Some("acme ltd"));
        assert_eq!(flat.get("score").and_then(PropValue::as_f64), Some(0.93));
    }

    #[test]
    fn driver_messages_map_onto_the_retry_taxonomy() {
        let lock = classify_message("Neo.TransientError.Transaction.DeadlockDetected".into());
        assert!(matches!(lock, StoreError::Transient(_)));

        let auth = classify_message("Neo.ClientError.Security.Unauthorized: bad credentials".into());
        assert!(auth.is_fatal_for_run());

        let syntax = classify_message("Neo.ClientError.Statement.SyntaxError".into());
        assert!(matches!(syntax, StoreError::Rejected(_)));
        assert!(!syntax.is_fatal_for_run());
    }
}
