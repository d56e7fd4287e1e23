//! Fuzzy Matcher: job-ad company names onto organisation keys.

use std::collections::{BTreeSet, HashMap};

use strsim::jaro_winkler;
use visapath_core::{clean_company_name, tokens, MatchDecision};
use visapath_storage::{GraphStore, StoreError};

// Below this threshold a candidate sharing no token can still win, so the index is bypassed.
const INDEX_FLOOR: f64 = 0.5;

/// Similarity of two cleaned names in `[0, 1]`.
///
/// Equal names score 1.0. Otherwise the score averages Jaro-Winkler similarity with the
/// share of distinct tokens the names have in common, relative to the shorter name.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    0.5 * jaro_winkler(a, b) + 0.5 * token_overlap(a, b)
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = tokens(a).collect();
    let right: BTreeSet<&str> = tokens(b).collect();
    let smaller = left.len().min(right.len());
    if smaller == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / smaller as f64
}

#[derive(Debug, Clone)]
struct Candidate {
    key: String,
    cleaned: String,
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    threshold: f64,
    // sorted by key, so lower positions win ties
    candidates: Vec<Candidate>,
    index: HashMap<String, Vec<usize>>,
}

impl FuzzyMatcher {
    pub fn from_keys<I, S>(keys: I, threshold: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut candidates = Vec::with_capacity(keys.len());
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for key in keys {
            let cleaned = clean_company_name(&key);
            let position = candidates.len();
            let distinct: BTreeSet<&str> = tokens(&cleaned).collect();
            for token in distinct {
                index.entry(token.to_string()).or_default().push(position);
            }
            candidates.push(Candidate { key, cleaned });
        }

        Self {
            threshold,
            candidates,
            index,
        }
    }

    /// Build the candidate index from every organisation currently in the store.
    pub async fn from_store(store: &dyn GraphStore, threshold: f64) -> Result<Self, StoreError> {
        let keys = store.organisation_keys().await?;
        Ok(Self::from_keys(keys, threshold))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Best candidate scoring strictly above the threshold, if any.
    pub fn match_company(&self, company: &str) -> Option<MatchDecision> {
        let cleaned = clean_company_name(company);
        if cleaned.is_empty() {
            return None;
        }

        let positions: Vec<usize> = if self.threshold >= INDEX_FLOOR {
            let mut shared = BTreeSet::new();
            for token in tokens(&cleaned) {
                if let Some(hits) = self.index.get(token) {
                    shared.extend(hits.iter().copied());
                }
            }
            shared.into_iter().collect()
        } else {
            (0..self.candidates.len()).collect()
        };

        let mut best: Option<(usize, f64)> = None;
        for position in positions {
            let score = name_similarity(&cleaned, &self.candidates[position].cleaned);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((position, score));
            }
        }

        best.filter(|(_, score)| *score > self.threshold)
            .map(|(position, score)| MatchDecision {
                organisation_key: self.candidates[position].key.clone(),
                score,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> FuzzyMatcher {
        FuzzyMatcher::from_keys(
            ["acme ltd", "acme engineering", "zenith logistics plc", "café rouge ltd"],
            0.80,
        )
    }

    #[test]
    fn exact_match_after_cleaning_scores_one() {
        let decision = matcher().match_company("  ACME LTD. ").unwrap();
        assert_eq!(decision.organisation_key, "acme ltd");
        assert_eq!(decision.score, 1.0);
    }

    #[test]
    fn diacritics_do_not_block_a_match() {
        let decision = matcher().match_company("Cafe Rouge Ltd").unwrap();
        assert_eq!(decision.organisation_key, "café rouge ltd");
        assert_eq!(decision.score, 1.0);
    }

    #[test]
    fn prefix_name_passes_default_threshold() {
        let matcher = FuzzyMatcher::from_keys(["acme ltd"], 0.80);
        let decision = matcher.match_company("ACME").unwrap();
        assert!(decision.score > 0.9 && decision.score < 1.0, "{}", decision.score);
    }

    #[test]
    fn one_shared_token_is_not_enough() {
        let score = name_similarity("acme holdings", "acme engineering");
        assert!(score <= 0.75, "{score}");
        let matcher = FuzzyMatcher::from_keys(["acme engineering"], 0.80);
        assert!(matcher.match_company("Acme Holdings").is_none());
    }

    #[test]
    fn closer_names_never_score_lower() {
        let exact = name_similarity("acme ltd", "acme ltd");
        let prefix = name_similarity("acme", "acme ltd");
        let one_token = name_similarity("acme holdings", "acme ltd");
        assert!(exact > prefix);
        assert!(prefix > one_token);
    }

    #[test]
    fn unrelated_and_empty_names_do_not_match() {
        let matcher = matcher();
        assert!(matcher.match_company("Totally Unrelated Co").is_none());
        assert!(matcher.match_company("  ").is_none());
        assert!(matcher.match_company("!!!").is_none());
    }

    #[test]
    fn ties_go_to_the_smallest_key() {
        let matcher = FuzzyMatcher::from_keys(["beta co", "alpha co"], 0.10);
        let first = matcher.match_company("co").unwrap();
        let second = matcher.match_company("co").unwrap();
        assert_eq!(first, second);
        let alpha = name_similarity("co", "alpha co");
        let beta = name_similarity("co", "beta co");
        if (alpha - beta).abs() < f64::EPSILON {
            assert_eq!(first.organisation_key, "alpha co");
        }
    }

    #[test]
    fn low_threshold_scores_every_candidate() {
        let matcher = FuzzyMatcher::from_keys(["acme ltd"], 0.30);
        let decision = matcher.match_company("acmee");
        assert!(decision.is_some());
    }
}
