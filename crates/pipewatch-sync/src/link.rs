//! Intervention-to-asset matching. Exact or single-asset containment only.

use std::collections::BTreeSet;

use pipewatch_core::{contains_tokens, MatchConfidence, Normalizer};
use serde::Serialize;
use strsim::jaro_winkler;
use uuid::Uuid;

use crate::index::AliasIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked {
        asset_id: Uuid,
        confidence: MatchConfidence,
    },
    /// Containment candidates span several assets; nothing is linked.
    Ambiguous { candidates: Vec<Uuid> },
    Unmatched,
}

pub fn resolve_intervention(
    index: &AliasIndex,
    normalizer: &Normalizer,
    intervention: &str,
) -> LinkOutcome {
    let key = normalizer.key(intervention);
    if key.is_empty() {
        return LinkOutcome::Unmatched;
    }
    if let Some(asset_id) = index.lookup(&key) {
        return LinkOutcome::Linked {
            asset_id,
            confidence: MatchConfidence::Exact,
        };
    }

    let min_len = normalizer.rules().min_alias_len;
    let key_is_long_enough = key.chars().count() >= min_len;
    let candidates = index
        .aliases()
        .filter(|(alias, _)| alias.chars().count() >= min_len)
        .filter(|(alias, _)| {
            contains_tokens(&key, alias) || (key_is_long_enough && contains_tokens(alias, &key))
        })
        .map(|(_, asset_id)| asset_id)
        .collect::<BTreeSet<_>>();

    match candidates.len() {
        0 => LinkOutcome::Unmatched,
        1 => LinkOutcome::Linked {
            asset_id: candidates.into_iter().next().unwrap_or_default(),
            confidence: MatchConfidence::Contained,
        },
        _ => LinkOutcome::Ambiguous {
            candidates: candidates.into_iter().collect(),
        },
    }
}

/// Unmatched intervention that closely resembles a known alias. Never linked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewSuggestion {
    pub nct_id: String,
    pub intervention: String,
    pub alias: String,
    pub confidence_score: f64,
}

pub fn review_suggestion(
    index: &AliasIndex,
    normalizer: &Normalizer,
    nct_id: &str,
    intervention: &str,
    review_threshold: f64,
) -> Option<ReviewSuggestion> {
    let key = normalizer.key(intervention);
    if key.is_empty() {
        return None;
    }
    index
        .aliases()
        .map(|(alias, _)| (alias, jaro_winkler(&key, alias)))
        .filter(|(_, score)| *score >= review_threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(alias, score)| ReviewSuggestion {
            nct_id: nct_id.to_string(),
            intervention: intervention.to_string(),
            alias: alias.to_string(),
            confidence_score: score,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, Uuid)]) -> AliasIndex {
        let normalizer = Normalizer::default();
        let mut index = AliasIndex::default();
        for (alias, id) in entries {
            index.insert_alias(normalizer.key(alias), alias.to_string(), *id);
        }
        index
    }

    #[test]
    fn exact_match_wins_over_containment() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let idx = index(&[("IMA402", a), ("IMA402 + ICI", b)]);
        let n = Normalizer::default();

        assert_eq!(
            resolve_intervention(&idx, &n, "IMA402"),
            LinkOutcome::Linked {
                asset_id: a,
                confidence: MatchConfidence::Exact
            }
        );
        assert_eq!(
            resolve_intervention(&idx, &n, "IMA402 + ICI"),
            LinkOutcome::Linked {
                asset_id: b,
                confidence: MatchConfidence::Exact
            }
        );
    }

    #[test]
    fn containment_resolving_to_one_asset_links() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let idx = index(&[("IMA203", a), ("anzu-cel", a), ("mRNA-4203", b)]);
        let n = Normalizer::default();

        assert_eq!(
            resolve_intervention(&idx, &n, "ACTengine IMA203"),
            LinkOutcome::Linked {
                asset_id: a,
                confidence: MatchConfidence::Contained
            }
        );
        assert_eq!(resolve_intervention(&idx, &n, "IMA2030"), LinkOutcome::Unmatched);
        assert_eq!(resolve_intervention(&idx, &n, "Placebo"), LinkOutcome::Unmatched);
        assert_eq!(resolve_intervention(&idx, &n, "()"), LinkOutcome::Unmatched);
    }

    #[test]
    fn containment_across_assets_is_ambiguous() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let idx = index(&[("IMA402", a), ("IMA402 + ICI", b)]);
        let n = Normalizer::default();

        match resolve_intervention(&idx, &n, "IMA402 + ICI + chemo") {
            LinkOutcome::Ambiguous { candidates } => assert_eq!(candidates, vec![a, b]),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn short_aliases_never_match_by_containment() {
        let a = Uuid::from_u128(1);
        let idx = index(&[("ICI", a)]);
        let n = Normalizer::default();
        assert_eq!(resolve_intervention(&idx, &n, "ICI therapy"), LinkOutcome::Unmatched);
    }

    #[test]
    fn near_misses_become_review_suggestions() {
        let a = Uuid::from_u128(1);
        let idx = index(&[("amivantamab", a)]);
        let n = Normalizer::default();

        let suggestion =
            review_suggestion(&idx, &n, "NCT1", "amivantamab-vmjw", 0.88).expect("suggestion");
        assert_eq!(suggestion.alias, "amivantamab");
        assert!(suggestion.confidence_score >= 0.88);
        assert!(review_suggestion(&idx, &n, "NCT1", "pembrolizumab", 0.88).is_none());
    }
}
