//! In-process property graph with the same merge semantics as the Neo4j statements.
//!
//! Used for `--dry-run` previews and as the store behind the pipeline tests. Each write
//! transaction runs against a copy of the state that replaces the original only on success.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use visapath_core::{
    advance_last_updated, JobAdNode, JobAdWrite, LocationKey, OrganisationNode,
    OrganisationUpsert, PropValue, Props,
};

use crate::{GraphStore, StoreError};

/// Failure to raise on a given write attempt, for exercising retry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Timeout,
    Rejected,
    Unreachable,
}

impl InjectedFailure {
    fn into_error(self, attempt: usize) -> StoreError {
        match self {
            InjectedFailure::Transient => {
                StoreError::Transient(format!("injected lock conflict on write attempt {attempt}"))
            }
            InjectedFailure::Timeout => StoreError::Timeout(Duration::from_secs(30)),
            InjectedFailure::Rejected => {
                StoreError::Rejected(format!("injected rejection on write attempt {attempt}"))
            }
            InjectedFailure::Unreachable => {
                StoreError::Connectivity(format!("injected outage on write attempt {attempt}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub organisations: usize,
    pub locations: usize,
    pub routes: usize,
    pub located_in: usize,
    pub offers_route: usize,
    pub job_ads: usize,
    pub posted_by: usize,
}

#[derive(Debug, Clone)]
struct OrganisationRecord {
    display_name: String,
    first_seen: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    props: Props,
}

#[derive(Debug, Clone, Default)]
struct JobAdRecord {
    props: Props,
    company_clean: Option<String>,
    sponsor_possible: bool,
    match_score: Option<f64>,
    route: Option<Vec<String>>,
    last_matched_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    organisations: BTreeMap<String, OrganisationRecord>,
    locations: BTreeSet<LocationKey>,
    routes: BTreeSet<String>,
    located_in: BTreeSet<(String, LocationKey)>,
    offers_route: BTreeSet<(String, String)>,
    job_ads: BTreeMap<String, JobAdRecord>,
    // job ad id -> organisation key; one entry per job ad keeps the edge unique
    posted_by: BTreeMap<String, String>,
}

impl GraphState {
    fn merge_organisation(&mut self, row: &OrganisationUpsert, load_ts: DateTime<Utc>) {
        let org = match self.organisations.entry(row.key.clone()) {
            Entry::Vacant(slot) => slot.insert(OrganisationRecord {
                display_name: row.display_name.clone(),
                first_seen: load_ts,
                last_updated: advance_last_updated(None, load_ts),
                props: Props::new(),
            }),
            Entry::Occupied(slot) => {
                let org = slot.into_mut();
                org.last_updated = advance_last_updated(Some(org.last_updated), load_ts);
                org
            }
        };
        org.display_name = row.display_name.clone();
        for (key, value) in &row.props {
            org.props.insert(key.clone(), value.clone());
        }
        org.props.insert("town".into(), PropValue::Str(row.town.clone()));
        org.props.insert("county".into(), PropValue::Str(row.county.clone()));
        org.props
            .insert("type_rating".into(), PropValue::Str(row.type_rating.clone()));

        let location = row.location();
        self.locations.insert(location.clone());
        self.routes.insert(row.route.clone());
        self.located_in.insert((row.key.clone(), location));
        self.offers_route.insert((row.key.clone(), row.route.clone()));
    }

    fn routes_of(&self, org_key: &str) -> Vec<String> {
        self.offers_route
            .iter()
            .filter(|(org, _)| org == org_key)
            .map(|(_, route)| route.clone())
            .collect()
    }

    fn write_job_ad(&mut self, row: &JobAdWrite, matched_at: DateTime<Utc>) {
        let matched = row
            .matched
            .as_ref()
            .filter(|d| self.organisations.contains_key(&d.organisation_key));
        let routes = matched.map(|d| self.routes_of(&d.organisation_key));

        let job = self.job_ads.entry(row.id.clone()).or_default();
        for (key, value) in &row.props {
            job.props.insert(key.clone(), value.clone());
        }
        job.company_clean = Some(row.company_clean.clone());

        match matched {
            Some(decision) => {
                job.sponsor_possible = true;
                job.match_score = Some(decision.score);
                job.last_matched_ts = Some(matched_at);
                job.route = routes;
                self.posted_by
                    .insert(row.id.clone(), decision.organisation_key.clone());
            }
            None => {
                job.sponsor_possible = false;
                job.match_score = None;
                job.route = None;
                self.posted_by.remove(&row.id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: Mutex<GraphState>,
    constraints_ready: AtomicBool,
    write_attempts: AtomicUsize,
    injected: StdMutex<BTreeMap<usize, InjectedFailure>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the write attempt with the given zero-based index (counted across all writes).
    pub fn inject_failure(&self, attempt: usize, failure: InjectedFailure) {
        if let Ok(mut injected) = self.injected.lock() {
            injected.insert(attempt, failure);
        }
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub async fn counts(&self) -> GraphCounts {
        let state = self.state.lock().await;
        GraphCounts {
            organisations: state.organisations.len(),
            locations: state.locations.len(),
            routes: state.routes.len(),
            located_in: state.located_in.len(),
            offers_route: state.offers_route.len(),
            job_ads: state.job_ads.len(),
            posted_by: state.posted_by.len(),
        }
    }

    async fn write_txn<F>(&self, label: &str, apply: F) -> Result<usize, StoreError>
    where
        F: FnOnce(&mut GraphState) -> usize + Send,
    {
        let attempt = self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .injected
            .lock()
            .ok()
            .and_then(|mut injected| injected.remove(&attempt));
        if let Some(failure) = injected {
            debug!(attempt, ?failure, op = label, "raising injected store failure");
            return Err(failure.into_error(attempt));
        }
        if !self.constraints_ready.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(
                "uniqueness constraints have not been established".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let mut draft = state.clone();
        let written = apply(&mut draft);
        *state = draft;
        Ok(written)
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn verify_connectivity(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_constraints(&self) -> Result<(), StoreError> {
        self.constraints_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_organisations(
        &self,
        rows: &[OrganisationUpsert],
        load_ts: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.write_txn("upsert_organisations", |state| {
            for row in rows {
                state.merge_organisation(row, load_ts);
            }
            rows.len()
        })
        .await
    }

    async fn write_job_ads(
        &self,
        rows: &[JobAdWrite],
        matched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.write_txn("write_job_ads", |state| {
            for row in rows {
                state.write_job_ad(row, matched_at);
            }
            rows.len()
        })
        .await
    }

    async fn organisation_keys(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.organisations.keys().cloned().collect())
    }

    async fn organisation(&self, key: &str) -> Result<Option<OrganisationNode>, StoreError> {
        let state = self.state.lock().await;
        let Some(org) = state.organisations.get(key) else {
            return Ok(None);
        };
        let locations = state
            .located_in
            .iter()
            .filter(|(org_key, _)| org_key == key)
            .map(|(_, location)| location.clone())
            .collect();
        Ok(Some(OrganisationNode {
            key: key.to_string(),
            display_name: org.display_name.clone(),
            first_seen: org.first_seen,
            last_updated: org.last_updated,
            props: org.props.clone(),
            locations,
            routes: state.routes_of(key),
        }))
    }

    async fn job_ad(&self, id: &str) -> Result<Option<JobAdNode>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.job_ads.get(id).map(|job| JobAdNode {
            id: id.to_string(),
            props: job.props.clone(),
            company_clean: job.company_clean.clone(),
            sponsor_possible: job.sponsor_possible,
            match_score: job.match_score,
            route: job.route.clone(),
            last_matched_ts: job.last_matched_ts,
            posted_by: state.posted_by.get(id).cloned(),
        }))
    }
}
