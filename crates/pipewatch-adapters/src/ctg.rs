//! ClinicalTrials.gov v2 study extraction and asset-first fetching.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use pipewatch_core::{collapse_whitespace, Normalizer, TrialRecord};
use pipewatch_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{AdapterError, TrialsBatch, TrialsSource};

pub const CTG_STUDIES_ENDPOINT: &str = "https://clinicaltrials.gov/api/v2/studies";

pub const DEFAULT_ACTIVE_STATUSES: [&str; 4] = [
    "NOT_YET_RECRUITING",
    "RECRUITING",
    "ENROLLING_BY_INVITATION",
    "ACTIVE_NOT_RECRUITING",
];

// the v2 API answers 400 to query.intr values containing these
const REJECTED_QUERY_CHARS: &[char] = &['(', ')', '[', ']', '{', '}', '"', '\'', '<', '>'];
const TRAILING_QUERY_PUNCT: &[char] = &[' ', ',', ';', ':', '.', '!', '/', '\\', '|'];
const PLACEHOLDER_TERMS: &[&str] = &["other", "others", "unknown"];
const PROTOCOL: &str = "protocolSection";

pub fn sanitize_query_term(term: &str, min_len: usize) -> Option<String> {
    let stripped = term
        .chars()
        .filter(|c| !REJECTED_QUERY_CHARS.contains(c))
        .collect::<String>();
    let collapsed = collapse_whitespace(&stripped);
    let cleaned = collapsed.trim_matches(TRAILING_QUERY_PUNCT);
    if cleaned.chars().count() < min_len {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Distinct, sanitized query terms for a company's aliases, shortest first.
pub fn query_terms_for_aliases<'a>(
    aliases: impl IntoIterator<Item = &'a str>,
    min_len: usize,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for alias in aliases {
        let Some(term) = sanitize_query_term(alias, min_len) else {
            continue;
        };
        let lower = term.to_lowercase();
        if lower.contains("undisclosed") || PLACEHOLDER_TERMS.contains(&lower.as_str()) {
            continue;
        }
        if seen.insert(lower) {
            out.push(term);
        }
    }
    out.sort_by_key(|t| t.chars().count());
    out
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return &[],
        }
    }
    cur.as_array().map(Vec::as_slice).unwrap_or(&[])
}

/// Extract the trial core of one study document. `None` without an NCT id.
pub fn study_to_record(study: &JsonValue) -> Option<TrialRecord> {
    let nct_id = json_str(study, &[PROTOCOL, "identificationModule", "nctId"])?
        .trim()
        .to_string();
    if nct_id.is_empty() {
        return None;
    }

    let title = json_str(study, &[PROTOCOL, "identificationModule", "officialTitle"])
        .or_else(|| json_str(study, &[PROTOCOL, "identificationModule", "briefTitle"]))
        .map(ToString::to_string);
    let overall_status =
        json_str(study, &[PROTOCOL, "statusModule", "overallStatus"]).map(ToString::to_string);
    let last_update_posted = json_str(
        study,
        &[PROTOCOL, "statusModule", "lastUpdatePostDateStruct", "date"],
    )
    .map(ToString::to_string);

    let phases = json_array(study, &[PROTOCOL, "designModule", "phases"])
        .iter()
        .filter_map(JsonValue::as_str)
        .collect::<Vec<_>>();
    let phase = (!phases.is_empty()).then(|| phases.join(","));

    let intervention_names = json_array(study, &[PROTOCOL, "armsInterventionsModule", "interventions"])
        .iter()
        .filter_map(|it| it.get("name").and_then(JsonValue::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect();

    Some(TrialRecord {
        source_url: format!("https://clinicaltrials.gov/study/{nct_id}"),
        nct_id,
        title,
        overall_status,
        phase,
        last_update_posted,
        intervention_names,
        raw_evidence_bytes: serde_json::to_vec(study).unwrap_or_default(),
    })
}

/// Keeps studies whose lead sponsor or a collaborator names the company.
/// An empty alias list accepts every study.
#[derive(Debug, Clone, Default)]
pub struct SponsorFilter {
    keys: Vec<String>,
    normalizer: Normalizer,
}

impl SponsorFilter {
    pub fn new(aliases: &[String]) -> Self {
        let normalizer = Normalizer::default();
        let keys = aliases
            .iter()
            .map(|a| normalizer.key(a))
            .filter(|k| !k.is_empty())
            .collect();
        Self { keys, normalizer }
    }

    fn hit(&self, name: &str) -> bool {
        let key = self.normalizer.key(name);
        self.keys.iter().any(|alias| key.contains(alias.as_str()))
    }

    pub fn matches(&self, study: &JsonValue) -> bool {
        if self.keys.is_empty() {
            return true;
        }
        if json_str(study, &[PROTOCOL, "sponsorCollaboratorsModule", "leadSponsor", "name"])
            .is_some_and(|lead| self.hit(lead))
        {
            return true;
        }
        json_array(study, &[PROTOCOL, "sponsorCollaboratorsModule", "collaborators"])
            .iter()
            .filter_map(|c| c.get("name").and_then(JsonValue::as_str))
            .any(|name| self.hit(name))
    }
}

/// Accepts either a v2 `{"studies": [...]}` page or a bare array of studies.
pub fn parse_studies_document(bytes: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
    let doc: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::Message(format!("decoding studies document: {e}")))?;
    match doc {
        JsonValue::Array(studies) => Ok(studies),
        JsonValue::Object(mut map) => match map.remove("studies") {
            Some(JsonValue::Array(studies)) => Ok(studies),
            _ => Ok(Vec::new()),
        },
        _ => Err(AdapterError::Message(
            "studies document must be an object or an array".to_string(),
        )),
    }
}

fn collect_study(
    study: &JsonValue,
    sponsor: &SponsorFilter,
    seen: &mut HashSet<String>,
    out: &mut Vec<TrialRecord>,
) {
    let Some(record) = study_to_record(study) else {
        return;
    };
    if seen.contains(&record.nct_id) || !sponsor.matches(study) {
        return;
    }
    seen.insert(record.nct_id.clone());
    out.push(record);
}

/// Trials source backed by a captured studies document on disk.
#[derive(Debug, Clone)]
pub struct StudiesFileSource {
    path: PathBuf,
    sponsor: SponsorFilter,
}

impl StudiesFileSource {
    pub fn new(path: impl Into<PathBuf>, sponsor: SponsorFilter) -> Self {
        Self {
            path: path.into(),
            sponsor,
        }
    }
}

#[async_trait]
impl TrialsSource for StudiesFileSource {
    fn source_id(&self) -> &str {
        "studies_file"
    }

    async fn fetch_trials(&self, _query_terms: &[String]) -> Result<TrialsBatch, AdapterError> {
        let raw = fs::read(&self.path)
            .with_context(|| format!("reading studies file {}", self.path.display()))?;
        let mut seen = HashSet::new();
        let mut batch = TrialsBatch::default();
        for study in parse_studies_document(&raw)? {
            collect_study(&study, &self.sponsor, &mut seen, &mut batch.records);
        }
        Ok(batch)
    }
}

#[derive(Debug, Clone)]
pub struct CtgFetchSettings {
    pub statuses: Vec<String>,
    pub page_size: usize,
    pub max_pages_per_term: usize,
    pub min_term_len: usize,
}

impl Default for CtgFetchSettings {
    fn default() -> Self {
        Self {
            statuses: DEFAULT_ACTIVE_STATUSES.iter().map(|s| s.to_string()).collect(),
            page_size: 100,
            max_pages_per_term: 50,
            min_term_len: 4,
        }
    }
}

/// Live asset-first fetcher: one paged `query.intr` search per alias term.
#[derive(Debug, Clone)]
pub struct CtgTrialsFetcher {
    http: Arc<HttpFetcher>,
    sponsor: SponsorFilter,
    settings: CtgFetchSettings,
}

impl CtgTrialsFetcher {
    pub fn new(http: Arc<HttpFetcher>, sponsor: SponsorFilter, settings: CtgFetchSettings) -> Self {
        Self {
            http,
            sponsor,
            settings,
        }
    }

    fn page_params(&self, term: &str, page_token: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("query.intr", term.to_string()),
            ("pageSize", self.settings.page_size.to_string()),
            ("countTotal", "false".to_string()),
            ("format", "json".to_string()),
            ("filter.overallStatus", self.settings.statuses.join(",")),
            ("sort", "LastUpdatePostDate:desc".to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        params
    }
}

#[async_trait]
impl TrialsSource for CtgTrialsFetcher {
    fn source_id(&self) -> &str {
        "clinicaltrials_gov"
    }

    async fn fetch_trials(&self, query_terms: &[String]) -> Result<TrialsBatch, AdapterError> {
        let mut seen = HashSet::new();
        let mut batch = TrialsBatch::default();

        for raw_term in query_terms {
            let Some(term) = sanitize_query_term(raw_term, self.settings.min_term_len) else {
                continue;
            };
            let mut page_token: Option<String> = None;
            let mut pages = 0usize;

            loop {
                let params = self.page_params(&term, page_token.as_deref());
                let response = match self.http.fetch_query(CTG_STUDIES_ENDPOINT, &params).await {
                    Ok(response) => response,
                    Err(FetchError::HttpStatus { status: 400, .. }) => {
                        warn!(term = %term, "query term rejected upstream; skipping");
                        batch.warnings.push(format!("query rejected: {term}"));
                        break;
                    }
                    Err(err) if err.is_upstream_timeout() => {
                        warn!(term = %term, error = %err, "upstream fetch timed out; skipping term");
                        batch.warnings.push(format!("timeout: {term}"));
                        break;
                    }
                    Err(err) => return Err(err.into()),
                };

                let doc: JsonValue = serde_json::from_slice(&response.body).map_err(|e| {
                    AdapterError::Message(format!("decoding studies page for {term}: {e}"))
                })?;
                for study in json_array(&doc, &["studies"]) {
                    collect_study(study, &self.sponsor, &mut seen, &mut batch.records);
                }

                pages += 1;
                page_token = json_str(&doc, &["nextPageToken"]).map(ToString::to_string);
                if page_token.is_none() {
                    break;
                }
                if pages >= self.settings.max_pages_per_term {
                    warn!(term = %term, pages, "hit page cap for query term");
                    break;
                }
            }
        }

        info!(
            terms = query_terms.len(),
            trials = batch.records.len(),
            warnings = batch.warnings.len(),
            "ctg fetch complete"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn study(nct: &str, lead: &str, interventions: &[&str]) -> JsonValue {
        json!({
            "protocolSection": {
                "identificationModule": {"nctId": nct, "briefTitle": format!("Study {nct}")},
                "statusModule": {
                    "overallStatus": "RECRUITING",
                    "lastUpdatePostDateStruct": {"date": "2025-09-30"}
                },
                "designModule": {"phases": ["PHASE1", "PHASE2"]},
                "sponsorCollaboratorsModule": {
                    "leadSponsor": {"name": lead},
                    "collaborators": [{"name": "Moderna, Inc."}]
                },
                "armsInterventionsModule": {
                    "interventions": interventions.iter().map(|n| json!({"name": n, "type": "DRUG"})).collect::<Vec<_>>()
                }
            }
        })
    }

    #[test]
    fn query_terms_are_sanitized_and_sorted() {
        assert_eq!(sanitize_query_term("autoleucel)", 4).as_deref(), Some("autoleucel"));
        assert_eq!(sanitize_query_term(" IMA203 / ", 4).as_deref(), Some("IMA203"));
        assert_eq!(sanitize_query_term("(x)", 4), None);

        let terms = query_terms_for_aliases(
            ["anzutresgene autoleucel", "IMA203", "ima203", "Undisclosed target", "Other"],
            4,
        );
        assert_eq!(terms, vec!["IMA203".to_string(), "anzutresgene autoleucel".to_string()]);
    }

    #[test]
    fn extracts_trial_core_fields() {
        let record = study_to_record(&study("NCT06946225", "Immatics", &["IMA203", " "])).unwrap();
        assert_eq!(record.nct_id, "NCT06946225");
        assert_eq!(record.title.as_deref(), Some("Study NCT06946225"));
        assert_eq!(record.overall_status.as_deref(), Some("RECRUITING"));
        assert_eq!(record.phase.as_deref(), Some("PHASE1,PHASE2"));
        assert_eq!(record.last_update_posted.as_deref(), Some("2025-09-30"));
        assert_eq!(record.intervention_names, vec!["IMA203".to_string()]);
        assert!(!record.raw_evidence_bytes.is_empty());

        assert!(study_to_record(&json!({"protocolSection": {}})).is_none());
    }

    #[test]
    fn sponsor_filter_checks_lead_and_collaborators() {
        let filter = SponsorFilter::new(&["Immatics".to_string()]);
        assert!(filter.matches(&study("NCT1", "Immatics Biotechnologies GmbH", &[])));
        assert!(!filter.matches(&study("NCT2", "Janssen Research", &[])));

        let via_collab = SponsorFilter::new(&["moderna".to_string()]);
        assert!(via_collab.matches(&study("NCT3", "Immatics", &[])));

        assert!(SponsorFilter::new(&[]).matches(&study("NCT4", "Anyone", &[])));
    }

    #[tokio::test]
    async fn studies_file_source_dedups_and_filters() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("studies.json");
        let doc = json!({
            "studies": [
                study("NCT1", "Immatics", &["IMA203"]),
                study("NCT1", "Immatics", &["IMA203"]),
                study("NCT2", "Janssen", &["RYBREVANT"]),
            ]
        });
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).expect("write");

        let source = StudiesFileSource::new(&path, SponsorFilter::new(&["immatics".to_string()]));
        let batch = source.fetch_trials(&[]).await.expect("batch");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].nct_id, "NCT1");
        assert!(batch.warnings.is_empty());
    }

    #[test]
    fn bare_study_arrays_are_accepted() {
        let bytes = serde_json::to_vec(&json!([study("NCT9", "X", &[])])).unwrap();
        assert_eq!(parse_studies_document(&bytes).unwrap().len(), 1);
        assert!(parse_studies_document(b"42").is_err());
    }
}
