//! Collaborator contracts + file-backed sources: fragment bundles, curated seed lists, study captures.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipewatch_core::{EvidenceType, RawFragment, TrialRecord};
use pipewatch_storage::FetchError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

mod ctg;

pub use ctg::{
    parse_studies_document, query_terms_for_aliases, sanitize_query_term, study_to_record,
    CtgFetchSettings, CtgTrialsFetcher, SponsorFilter, StudiesFileSource, CTG_STUDIES_ENDPOINT,
    DEFAULT_ACTIVE_STATUSES,
};

pub const CRATE_NAME: &str = "pipewatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Curated `alias -> canonical name` mapping carried alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasSeed {
    pub alias: String,
    pub canonical: String,
}

/// One authoritative listing of a company's disclosed pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub as_of_date: Option<String>,
    pub fragments: Vec<RawFragment>,
    pub alias_seeds: Vec<AliasSeed>,
}

#[async_trait]
pub trait PipelineSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn load_snapshot(&self) -> Result<PipelineSnapshot, AdapterError>;
}

/// Study records from one trials pass, plus non-fatal upstream warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialsBatch {
    pub records: Vec<TrialRecord>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait TrialsSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch studies for the given intervention query terms (asset-first).
    async fn fetch_trials(&self, query_terms: &[String]) -> Result<TrialsBatch, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentBundle {
    pub company_id: String,
    #[serde(default)]
    pub as_of_date: Option<String>,
    pub artifacts: Vec<BundleArtifact>,
    #[serde(default)]
    pub alias_seeds: Vec<AliasSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleArtifact {
    pub evidence_type: EvidenceType,
    pub source_url: String,
    /// Raw artifact file, relative to the bundle.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    pub fragments: Vec<BundleFragment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFragment {
    pub label: String,
    pub indication: String,
    pub stage: String,
    #[serde(default)]
    pub therapeutic_area: Option<String>,
}

pub fn load_fragment_bundle(path: impl AsRef<Path>) -> Result<FragmentBundle> {
    let path = path.as_ref();
    let mut bundle: FragmentBundle = read_json_file(path)?;
    hydrate_raw_artifacts(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_raw_artifacts(bundle_path: &Path, bundle: &mut FragmentBundle) -> Result<()> {
    let base = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    for artifact in &mut bundle.artifacts {
        if let Some(text) = &artifact.inline_text {
            artifact.raw_bytes = text.as_bytes().to_vec();
            continue;
        }
        if let Some(rel_path) = &artifact.path {
            let raw_path = base.join(rel_path);
            artifact.raw_bytes = fs::read(&raw_path)
                .with_context(|| format!("reading raw artifact {}", raw_path.display()))?;
            continue;
        }
        // no captured artifact: the parsed rows themselves are the evidence
        artifact.raw_bytes = serde_json::to_vec(&artifact.fragments)
            .context("serializing bundle fragments as evidence")?;
    }
    Ok(())
}

impl FragmentBundle {
    pub fn into_snapshot(self) -> PipelineSnapshot {
        let mut fragments = Vec::new();
        for artifact in self.artifacts {
            for fragment in artifact.fragments {
                fragments.push(RawFragment {
                    label: fragment.label,
                    indication: fragment.indication,
                    stage: fragment.stage,
                    therapeutic_area: fragment.therapeutic_area,
                    evidence_type: artifact.evidence_type,
                    source_url: artifact.source_url.clone(),
                    raw_evidence_bytes: artifact.raw_bytes.clone(),
                });
            }
        }
        PipelineSnapshot {
            as_of_date: self.as_of_date,
            fragments,
            alias_seeds: self.alias_seeds,
        }
    }
}

/// Pipeline source backed by a parsed fragment bundle on disk.
#[derive(Debug, Clone)]
pub struct BundlePipelineSource {
    company_id: String,
    path: PathBuf,
}

impl BundlePipelineSource {
    pub fn new(company_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            company_id: company_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl PipelineSource for BundlePipelineSource {
    fn source_id(&self) -> &str {
        "fragment_bundle"
    }

    async fn load_snapshot(&self) -> Result<PipelineSnapshot, AdapterError> {
        let bundle = load_fragment_bundle(&self.path)?;
        if bundle.company_id != self.company_id {
            return Err(AdapterError::Message(format!(
                "bundle {} belongs to company {}, not {}",
                self.path.display(),
                bundle.company_id,
                self.company_id
            )));
        }
        Ok(bundle.into_snapshot())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuratedSeed {
    #[serde(default)]
    pub as_of_date: Option<String>,
    #[serde(default)]
    pub assets: Vec<CuratedAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratedAsset {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub indications: Vec<CuratedIndication>,
    #[serde(default)]
    pub as_of_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratedIndication {
    pub indication: String,
    pub stage: String,
    #[serde(default)]
    pub therapeutic_area: Option<String>,
}

impl CuratedSeed {
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).context("parsing curated seed yaml")
    }

    pub fn alias_seeds(&self) -> Vec<AliasSeed> {
        self.assets
            .iter()
            .flat_map(|asset| {
                asset.aliases.iter().map(|alias| AliasSeed {
                    alias: alias.clone(),
                    canonical: asset.name.clone(),
                })
            })
            .collect()
    }

    /// Whole file is the evidence for every fragment it yields.
    pub fn into_snapshot(self, source_url: &str, raw_bytes: &[u8]) -> PipelineSnapshot {
        let alias_seeds = self.alias_seeds();
        let as_of_date = self
            .as_of_date
            .clone()
            .or_else(|| self.assets.iter().filter_map(|a| a.as_of_date.clone()).max());
        let fragments = self
            .assets
            .into_iter()
            .flat_map(|asset| {
                let name = asset.name;
                asset.indications.into_iter().map(move |ind| RawFragment {
                    label: name.clone(),
                    indication: ind.indication,
                    stage: ind.stage,
                    therapeutic_area: ind.therapeutic_area,
                    evidence_type: EvidenceType::CuratedSeed,
                    source_url: source_url.to_string(),
                    raw_evidence_bytes: raw_bytes.to_vec(),
                })
            })
            .collect();
        PipelineSnapshot {
            as_of_date,
            fragments,
            alias_seeds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CuratedSeedSource {
    path: PathBuf,
}

impl CuratedSeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PipelineSource for CuratedSeedSource {
    fn source_id(&self) -> &str {
        "curated_seed"
    }

    async fn load_snapshot(&self) -> Result<PipelineSnapshot, AdapterError> {
        let raw = fs::read(&self.path)
            .with_context(|| format!("reading curated seed {}", self.path.display()))?;
        let seed = CuratedSeed::from_yaml(&raw)
            .with_context(|| format!("in {}", self.path.display()))?;
        let source_url = format!("file://{}", self.path.display());
        Ok(seed.into_snapshot(&source_url, &raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BUNDLE: &str = r#"{
        "company_id": "immatics",
        "as_of_date": "2025-11-03",
        "artifacts": [
            {
                "evidence_type": "pipeline_html",
                "source_url": "https://immatics.com/pipeline/",
                "path": "pipeline.html",
                "fragments": [
                    {"label": "IMA203 (anzu-cel)", "indication": "Melanoma", "stage": "Phase 3", "therapeutic_area": "Oncology"},
                    {"label": "IMA402", "indication": "Solid tumors", "stage": "Phase 1"}
                ]
            },
            {
                "evidence_type": "pipeline_image",
                "source_url": "https://immatics.com/pipeline.png",
                "fragments": [
                    {"label": "IMA401", "indication": "Solid tumors", "stage": "Phase 1"}
                ]
            }
        ]
    }"#;

    fn write_bundle(dir: &Path) -> PathBuf {
        fs::write(dir.join("pipeline.html"), "<table>pipeline</table>").expect("write raw");
        let path = dir.join("bundle.json");
        fs::write(&path, BUNDLE).expect("write bundle");
        path
    }

    #[test]
    fn bundle_fragments_carry_their_artifact_bytes() {
        let dir = tempdir().expect("tempdir");
        let bundle = load_fragment_bundle(write_bundle(dir.path())).expect("load bundle");
        let snapshot = bundle.into_snapshot();

        assert_eq!(snapshot.as_of_date.as_deref(), Some("2025-11-03"));
        assert_eq!(snapshot.fragments.len(), 3);
        assert_eq!(snapshot.fragments[0].raw_evidence_bytes, b"<table>pipeline</table>");
        assert_eq!(snapshot.fragments[0].evidence_type, EvidenceType::PipelineHtml);
        assert_eq!(snapshot.fragments[1].therapeutic_area, None);
        assert_eq!(snapshot.fragments[2].evidence_type, EvidenceType::PipelineImage);
        assert!(!snapshot.fragments[2].raw_evidence_bytes.is_empty());
    }

    #[test]
    fn missing_raw_artifact_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        fs::write(&path, BUNDLE).expect("write bundle");
        assert!(load_fragment_bundle(&path).is_err());
    }

    #[tokio::test]
    async fn bundle_source_rejects_foreign_company() {
        let dir = tempdir().expect("tempdir");
        let path = write_bundle(dir.path());

        let ok = BundlePipelineSource::new("immatics", &path)
            .load_snapshot()
            .await
            .expect("snapshot");
        assert_eq!(ok.fragments.len(), 3);

        let err = BundlePipelineSource::new("jnj", &path)
            .load_snapshot()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("belongs to company immatics"));
    }

    #[tokio::test]
    async fn curated_seed_yields_fragments_and_alias_seeds() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("curated.yaml");
        fs::write(
            &path,
            r#"
assets:
  - name: RYBREVANT
    aliases: [amivantamab, JNJ-61186372]
    as_of_date: "2025-10-01"
    indications:
      - indication: NSCLC EGFR exon 20
        stage: Registration
        therapeutic_area: Oncology
      - indication: Colorectal cancer
        stage: Phase 3
  - name: TALVEY
    indications: []
"#,
        )
        .expect("write seed");

        let snapshot = CuratedSeedSource::new(&path)
            .load_snapshot()
            .await
            .expect("snapshot");
        assert_eq!(snapshot.fragments.len(), 2);
        assert!(snapshot
            .fragments
            .iter()
            .all(|f| f.label == "RYBREVANT" && f.evidence_type == EvidenceType::CuratedSeed));
        assert_eq!(snapshot.as_of_date.as_deref(), Some("2025-10-01"));
        assert_eq!(
            snapshot.alias_seeds,
            vec![
                AliasSeed {
                    alias: "amivantamab".into(),
                    canonical: "RYBREVANT".into()
                },
                AliasSeed {
                    alias: "JNJ-61186372".into(),
                    canonical: "RYBREVANT".into()
                },
            ]
        );
    }
}
