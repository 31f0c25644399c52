//! Core domain model, provenance types and change-event payloads for pipewatch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod normalize;
mod stage;

pub use normalize::{
    collapse_whitespace, contains_tokens, parenthetical_aliases, LabelRejection,
    NormalizationRules, Normalizer,
};
pub use stage::{Stage, StageDirection, UnknownStage};

pub const CRATE_NAME: &str = "pipewatch-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
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

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// A tracked company. Loaded from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    PipelinePdf,
    PipelineHtml,
    PipelineImage,
    CtgStudyJson,
    CuratedSeed,
}

string_enum!(EvidenceType, "evidence type", {
    PipelinePdf => "pipeline_pdf",
    PipelineHtml => "pipeline_html",
    PipelineImage => "pipeline_image",
    CtgStudyJson => "ctg_study_json",
    CuratedSeed => "curated_seed",
});

impl EvidenceType {
    /// File extension for stored blobs, inferred from the type and source URL.
    pub fn extension_for(&self, source_url: &str) -> &'static str {
        let lower = source_url.to_ascii_lowercase();
        match self {
            EvidenceType::PipelinePdf => "pdf",
            EvidenceType::PipelineHtml => "html",
            EvidenceType::CtgStudyJson => "json",
            EvidenceType::CuratedSeed => "yaml",
            EvidenceType::PipelineImage => {
                if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
                    "jpg"
                } else if lower.ends_with(".webp") {
                    "webp"
                } else {
                    "png"
                }
            }
        }
    }
}

/// Content-addressed provenance record for one fetched artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub company_id: String,
    pub evidence_type: EvidenceType,
    pub source_url: String,
    pub content_hash: String,
    pub stored_path: String,
    pub byte_size: i64,
    pub fetched_at: DateTime<Utc>,
}

impl Evidence {
    /// Deterministic id for the dedup key `(company_id, type, content_hash)`.
    pub fn id_for(company_id: &str, evidence_type: EvidenceType, content_hash: &str) -> Uuid {
        let key = format!("evidence:{company_id}:{}:{content_hash}", evidence_type.as_str());
        Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub company_id: String,
    pub canonical_name: String,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// Deterministic id for the identity key `(company_id, canonical_name)`.
    pub fn id_for(company_id: &str, canonical_name: &str) -> Uuid {
        let key = format!("asset:{company_id}:{canonical_name}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
    }
}

/// Retention generation of an indication row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicationStatus {
    Confirmed,
    Unconfirmed,
    Removed,
}

string_enum!(IndicationStatus, "indication status", {
    Confirmed => "confirmed",
    Unconfirmed => "unconfirmed",
    Removed => "removed",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub company_id: String,
    pub nct_id: String,
    pub title: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
    pub last_update_posted: Option<String>,
    /// Deduplicated, sorted intervention names.
    #[serde(default)]
    pub interventions: Vec<String>,
    pub evidence_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// Normalized intervention equals a normalized alias.
    Exact,
    /// Token-boundary containment resolving to a single asset.
    Contained,
}

string_enum!(MatchConfidence, "match confidence", {
    Exact => "exact",
    Contained => "contained",
});

/// Raw disclosure fragment handed over by a source parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFragment {
    pub label: String,
    pub indication: String,
    pub stage: String,
    #[serde(default)]
    pub therapeutic_area: Option<String>,
    pub evidence_type: EvidenceType,
    pub source_url: String,
    #[serde(skip)]
    pub raw_evidence_bytes: Vec<u8>,
}

/// Study record handed over by the trials fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub nct_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
    pub last_update_posted: Option<String>,
    pub intervention_names: Vec<String>,
    pub source_url: String,
    #[serde(skip)]
    pub raw_evidence_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PipelineIngested,
    AssetAdded,
    AssetAliasAdded,
    AssetIndicationAdded,
    AssetIndicationStageChanged,
    AssetIndicationRemoved,
    TrialAdded,
    TrialUpdated,
    TrialStatusChanged,
    TrialsIngested,
    TrialAssetsLinked,
}

string_enum!(EventType, "event type", {
    PipelineIngested => "pipeline_ingested",
    AssetAdded => "asset_added",
    AssetAliasAdded => "asset_alias_added",
    AssetIndicationAdded => "asset_indication_added",
    AssetIndicationStageChanged => "asset_indication_stage_changed",
    AssetIndicationRemoved => "asset_indication_removed",
    TrialAdded => "trial_added",
    TrialUpdated => "trial_updated",
    TrialStatusChanged => "trial_status_changed",
    TrialsIngested => "trials_ingested",
    TrialAssetsLinked => "trial_assets_linked",
});

impl EventType {
    /// Run-level summary events, emitted once per run regardless of changes.
    pub fn is_summary(&self) -> bool {
        matches!(self, EventType::PipelineIngested | EventType::TrialsIngested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineIngested {
    pub as_of_date: Option<String>,
    pub assets_seen: usize,
    pub fragments: usize,
    pub skipped: usize,
    pub failed: usize,
    pub indications_unconfirmed: usize,
    pub indications_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAdded {
    pub asset_id: Uuid,
    pub asset: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAliasAdded {
    pub asset_id: Uuid,
    pub asset: String,
    pub alias: String,
    pub normalized: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicationChange {
    pub asset_id: Uuid,
    pub asset: String,
    pub indication: String,
    pub stage: Stage,
    pub therapeutic_area: Option<String>,
    pub evidence_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChanged {
    pub asset_id: Uuid,
    pub asset: String,
    pub indication: String,
    pub from: Stage,
    pub to: Stage,
    pub direction: StageDirection,
    pub evidence_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialAdded {
    pub nct_id: String,
    pub title: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialUpdated {
    pub nct_id: String,
    pub changed_fields: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialStatusChanged {
    pub nct_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Other fields updated in the same mutation.
    pub changed_fields: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialsIngested {
    pub trials_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub status_changed: usize,
    /// `ambiguous + unmatched`.
    pub bad_aliases: usize,
    pub ambiguous: usize,
    pub unmatched: usize,
    pub failed: usize,
    pub fetch_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialAssetsLinked {
    pub nct_id: String,
    pub linked_assets: usize,
    pub new_links: Vec<String>,
}

/// Typed payload of a change event. The variant determines the event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChangePayload {
    PipelineIngested(PipelineIngested),
    AssetAdded(AssetAdded),
    AssetAliasAdded(AssetAliasAdded),
    AssetIndicationAdded(IndicationChange),
    AssetIndicationStageChanged(StageChanged),
    AssetIndicationRemoved(IndicationChange),
    TrialAdded(TrialAdded),
    TrialUpdated(TrialUpdated),
    TrialStatusChanged(TrialStatusChanged),
    TrialsIngested(TrialsIngested),
    TrialAssetsLinked(TrialAssetsLinked),
}

impl ChangePayload {
    pub fn event_type(&self) -> EventType {
        match self {
            ChangePayload::PipelineIngested(_) => EventType::PipelineIngested,
            ChangePayload::AssetAdded(_) => EventType::AssetAdded,
            ChangePayload::AssetAliasAdded(_) => EventType::AssetAliasAdded,
            ChangePayload::AssetIndicationAdded(_) => EventType::AssetIndicationAdded,
            ChangePayload::AssetIndicationStageChanged(_) => {
                EventType::AssetIndicationStageChanged
            }
            ChangePayload::AssetIndicationRemoved(_) => EventType::AssetIndicationRemoved,
            ChangePayload::TrialAdded(_) => EventType::TrialAdded,
            ChangePayload::TrialUpdated(_) => EventType::TrialUpdated,
            ChangePayload::TrialStatusChanged(_) => EventType::TrialStatusChanged,
            ChangePayload::TrialsIngested(_) => EventType::TrialsIngested,
            ChangePayload::TrialAssetsLinked(_) => EventType::TrialAssetsLinked,
        }
    }

    /// Short human-readable line for logs and briefs.
    pub fn summary(&self) -> String {
        match self {
            ChangePayload::PipelineIngested(p) => format!(
                "pipeline ingested: {} assets from {} fragments ({} skipped, {} failed)",
                p.assets_seen, p.fragments, p.skipped, p.failed
            ),
            ChangePayload::AssetAdded(p) => format!("new asset {}", p.asset),
            ChangePayload::AssetAliasAdded(p) => format!("{} also known as {}", p.asset, p.alias),
            ChangePayload::AssetIndicationAdded(p) => {
                format!("{}: {} ({})", p.asset, p.indication, p.stage)
            }
            ChangePayload::AssetIndicationStageChanged(p) => format!(
                "{}: {} {} -> {}",
                p.asset, p.indication, p.from, p.to
            ),
            ChangePayload::AssetIndicationRemoved(p) => {
                format!("{}: {} no longer disclosed", p.asset, p.indication)
            }
            ChangePayload::TrialAdded(p) => format!("new trial {}", p.nct_id),
            ChangePayload::TrialUpdated(p) => format!(
                "{} updated ({})",
                p.nct_id,
                p.changed_fields
                    .iter()
                    .map(|c| c.field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ChangePayload::TrialStatusChanged(p) => format!(
                "{} status {} -> {}",
                p.nct_id,
                p.from.as_deref().unwrap_or("none"),
                p.to.as_deref().unwrap_or("none")
            ),
            ChangePayload::TrialsIngested(p) => format!(
                "trials ingested: {} seen, {} new, {} updated, {} bad aliases",
                p.trials_seen, p.inserted, p.updated, p.bad_aliases
            ),
            ChangePayload::TrialAssetsLinked(p) => {
                format!("{} linked to {} assets", p.nct_id, p.linked_assets)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Persisted, append-only change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub company_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
    pub run_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_ids_are_deterministic_per_dedup_key() {
        let a = Evidence::id_for("jnj", EvidenceType::PipelinePdf, "abc");
        let b = Evidence::id_for("jnj", EvidenceType::PipelinePdf, "abc");
        let c = Evidence::id_for("jnj", EvidenceType::PipelineHtml, "abc");
        let d = Evidence::id_for("immatics", EvidenceType::PipelinePdf, "abc");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn asset_ids_follow_company_namespace() {
        assert_eq!(Asset::id_for("jnj", "RYBREVANT"), Asset::id_for("jnj", "RYBREVANT"));
        assert_ne!(Asset::id_for("jnj", "RYBREVANT"), Asset::id_for("immatics", "RYBREVANT"));
    }

    #[test]
    fn string_enums_round_trip_through_text() {
        for ty in [
            EventType::PipelineIngested,
            EventType::AssetIndicationStageChanged,
            EventType::TrialAssetsLinked,
        ] {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
        assert_eq!(
            "ctg_study_json".parse::<EvidenceType>().unwrap(),
            EvidenceType::CtgStudyJson
        );
        assert!("bogus".parse::<IndicationStatus>().is_err());
    }

    #[test]
    fn payload_variant_names_the_event_type() {
        let payload = ChangePayload::TrialAssetsLinked(TrialAssetsLinked {
            nct_id: "NCT06946225".into(),
            linked_assets: 2,
            new_links: vec!["anzu-cel".into(), "mRNA-4203".into()],
        });
        assert_eq!(payload.event_type(), EventType::TrialAssetsLinked);
        let json = payload.to_json().unwrap();
        assert_eq!(json["linked_assets"], 2);
        assert_eq!(json["nct_id"], "NCT06946225");
    }

    #[test]
    fn image_extension_follows_url() {
        assert_eq!(
            EvidenceType::PipelineImage.extension_for("https://x/pipeline.JPG"),
            "jpg"
        );
        assert_eq!(EvidenceType::PipelineImage.extension_for("https://x/p"), "png");
    }
}
