//! Trials run: upserts study records, diffs them and links interventions to assets.

use chrono::Utc;
use pipewatch_adapters::{query_terms_for_aliases, TrialsSource};
use pipewatch_core::{
    ChangePayload, EvidenceType, Normalizer, Trial, TrialAdded, TrialAssetsLinked, TrialRecord,
    TrialStatusChanged, TrialUpdated, TrialsIngested,
};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::{parse_uuid, ts};
use crate::feed::{append_event, diff_trial, merge_trial, TrialDiff};
use crate::index::AliasIndex;
use crate::ledger::EvidenceLedger;
use crate::link::{resolve_intervention, review_suggestion, LinkOutcome, ReviewSuggestion};
use crate::IngestError;

#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousIntervention {
    pub nct_id: String,
    pub intervention: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTrial {
    pub nct_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialsRunSummary {
    pub run_id: i64,
    pub company_id: String,
    pub report: TrialsIngested,
    pub ambiguous: Vec<AmbiguousIntervention>,
    pub review: Vec<ReviewSuggestion>,
    pub failed: Vec<FailedTrial>,
    pub fetch_warnings: Vec<String>,
    pub events: usize,
}

#[derive(Debug, Default)]
struct Counters {
    inserted: usize,
    updated: usize,
    status_changed: usize,
    ambiguous: usize,
    unmatched: usize,
}

pub(crate) struct TrialLinker<'a> {
    pool: &'a SqlitePool,
    ledger: &'a EvidenceLedger,
    normalizer: &'a Normalizer,
    review_threshold: f64,
    company_id: &'a str,
    run_id: i64,
    index: AliasIndex,
    counters: Counters,
    ambiguous: Vec<AmbiguousIntervention>,
    review: Vec<ReviewSuggestion>,
    events: usize,
}

impl<'a> TrialLinker<'a> {
    pub(crate) async fn new(
        pool: &'a SqlitePool,
        ledger: &'a EvidenceLedger,
        normalizer: &'a Normalizer,
        review_threshold: f64,
        company_id: &'a str,
        run_id: i64,
    ) -> Result<Self, IngestError> {
        let mut conn = pool.acquire().await?;
        let index = AliasIndex::load(&mut *conn, company_id).await?;
        Ok(Self {
            pool,
            ledger,
            normalizer,
            review_threshold,
            company_id,
            run_id,
            index,
            counters: Counters::default(),
            ambiguous: Vec::new(),
            review: Vec::new(),
            events: 0,
        })
    }

    /// Alias texts usable as intervention search terms.
    pub(crate) fn query_terms(&self) -> Vec<String> {
        query_terms_for_aliases(
            self.index.alias_texts().iter().map(String::as_str),
            self.normalizer.rules().min_alias_len,
        )
    }

    pub(crate) async fn run(mut self, source: &dyn TrialsSource) -> Result<TrialsRunSummary, IngestError> {
        if self.index.is_empty() {
            warn!(company_id = self.company_id, "no assets known yet; trials cannot be linked");
        }
        let terms = self.query_terms();
        let batch = source
            .fetch_trials(&terms)
            .instrument(info_span!("fetch_trials", source = source.source_id(), terms = terms.len()))
            .await?;
        for warning in &batch.warnings {
            warn!(company_id = self.company_id, %warning, "trials fetch warning");
        }

        let mut failed = Vec::new();
        for record in &batch.records {
            match self.apply_record(record).await {
                Ok(()) => {}
                Err(IngestError::EvidenceWrite(error)) => {
                    warn!(nct_id = %record.nct_id, %error, "evidence write failed; trial not applied");
                    failed.push(FailedTrial {
                        nct_id: record.nct_id.clone(),
                        error,
                    });
                }
                Err(other) => return Err(other),
            }
        }

        let report = TrialsIngested {
            trials_seen: batch.records.len(),
            inserted: self.counters.inserted,
            updated: self.counters.updated,
            status_changed: self.counters.status_changed,
            bad_aliases: self.counters.ambiguous + self.counters.unmatched,
            ambiguous: self.counters.ambiguous,
            unmatched: self.counters.unmatched,
            failed: failed.len(),
            fetch_warnings: batch.warnings.len(),
        };
        let mut conn = self.pool.acquire().await?;
        self.emit(&mut *conn, ChangePayload::TrialsIngested(report.clone()))
            .await?;

        info!(
            company_id = self.company_id,
            run_id = self.run_id,
            trials_seen = report.trials_seen,
            inserted = report.inserted,
            updated = report.updated,
            ambiguous = report.ambiguous,
            unmatched = report.unmatched,
            review_suggestions = self.review.len(),
            "trials run applied"
        );
        Ok(TrialsRunSummary {
            run_id: self.run_id,
            company_id: self.company_id.to_string(),
            report,
            ambiguous: self.ambiguous,
            review: self.review,
            failed,
            fetch_warnings: batch.warnings,
            events: self.events,
        })
    }

    async fn emit(&mut self, conn: &mut SqliteConnection, payload: ChangePayload) -> Result<(), IngestError> {
        append_event(conn, self.company_id, self.run_id, &payload).await?;
        self.events += 1;
        Ok(())
    }

    /// One transaction per study: evidence, trial diff, interventions, links.
    async fn apply_record(&mut self, record: &TrialRecord) -> Result<(), IngestError> {
        let raw = if record.raw_evidence_bytes.is_empty() {
            serde_json::to_vec(record)?
        } else {
            record.raw_evidence_bytes.clone()
        };

        let mut tx = self.pool.begin().await?;
        let evidence = self
            .ledger
            .record(
                &mut *tx,
                self.company_id,
                EvidenceType::CtgStudyJson,
                &record.source_url,
                &raw,
                self.run_id,
            )
            .await?;

        let existing = load_trial(&mut *tx, self.company_id, &record.nct_id).await?;
        let diff = diff_trial(existing.as_ref(), record);
        let interventions = if diff.is_mutation() {
            let mut merged = merge_trial(existing.as_ref(), record, self.company_id);
            merged.evidence_id = evidence.id;
            upsert_trial(&mut *tx, &merged).await?;
            store_interventions(&mut *tx, &merged).await?;
            merged.interventions
        } else {
            existing.map(|t| t.interventions).unwrap_or_default()
        };

        match diff {
            TrialDiff::Added => {
                self.counters.inserted += 1;
                let payload = ChangePayload::TrialAdded(TrialAdded {
                    nct_id: record.nct_id.clone(),
                    title: record.title.clone(),
                    overall_status: record.overall_status.clone(),
                    phase: record.phase.clone(),
                });
                self.emit(&mut *tx, payload).await?;
            }
            TrialDiff::StatusChanged {
                from,
                to,
                changed_fields,
            } => {
                self.counters.updated += 1;
                self.counters.status_changed += 1;
                let payload = ChangePayload::TrialStatusChanged(TrialStatusChanged {
                    nct_id: record.nct_id.clone(),
                    from,
                    to,
                    changed_fields,
                });
                self.emit(&mut *tx, payload).await?;
            }
            TrialDiff::Updated { changed_fields } => {
                self.counters.updated += 1;
                let payload = ChangePayload::TrialUpdated(TrialUpdated {
                    nct_id: record.nct_id.clone(),
                    changed_fields,
                });
                self.emit(&mut *tx, payload).await?;
            }
            TrialDiff::Unchanged => {}
        }

        self.link_interventions(&mut *tx, &record.nct_id, &interventions)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn link_interventions(
        &mut self,
        conn: &mut SqliteConnection,
        nct_id: &str,
        interventions: &[String],
    ) -> Result<(), IngestError> {
        let mut new_links = Vec::new();
        for intervention in interventions {
            match resolve_intervention(&self.index, self.normalizer, intervention) {
                LinkOutcome::Linked {
                    asset_id,
                    confidence,
                } => {
                    let inserted = sqlx::query(
                        "INSERT INTO trial_asset_links (company_id, nct_id, asset_id, match_confidence, created_at) \
                         VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                    )
                    .bind(self.company_id)
                    .bind(nct_id)
                    .bind(asset_id.to_string())
                    .bind(confidence.as_str())
                    .bind(ts(Utc::now()))
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
                    if inserted > 0 {
                        new_links.push(self.index.name_of(asset_id).unwrap_or_default().to_string());
                    }
                }
                LinkOutcome::Ambiguous { candidates } => {
                    self.counters.ambiguous += 1;
                    let candidates = self.names(&candidates);
                    warn!(nct_id, intervention = %intervention, ?candidates, "ambiguous intervention, not linked");
                    self.ambiguous.push(AmbiguousIntervention {
                        nct_id: nct_id.to_string(),
                        intervention: intervention.clone(),
                        candidates,
                    });
                }
                LinkOutcome::Unmatched => {
                    self.counters.unmatched += 1;
                    if let Some(suggestion) = review_suggestion(
                        &self.index,
                        self.normalizer,
                        nct_id,
                        intervention,
                        self.review_threshold,
                    ) {
                        info!(
                            nct_id,
                            intervention = %intervention,
                            alias = %suggestion.alias,
                            score = suggestion.confidence_score,
                            "unmatched intervention resembles a known alias"
                        );
                        self.review.push(suggestion);
                    }
                }
            }
        }

        if !new_links.is_empty() {
            let linked_assets: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM trial_asset_links WHERE company_id = ? AND nct_id = ?",
            )
            .bind(self.company_id)
            .bind(nct_id)
            .fetch_one(&mut *conn)
            .await?;
            let payload = ChangePayload::TrialAssetsLinked(TrialAssetsLinked {
                nct_id: nct_id.to_string(),
                linked_assets: linked_assets as usize,
                new_links,
            });
            self.emit(conn, payload).await?;
        }
        Ok(())
    }

    fn names(&self, asset_ids: &[Uuid]) -> Vec<String> {
        asset_ids
            .iter()
            .map(|id| self.index.name_of(*id).unwrap_or_default().to_string())
            .collect()
    }
}

async fn load_trial(
    conn: &mut SqliteConnection,
    company_id: &str,
    nct_id: &str,
) -> Result<Option<Trial>, IngestError> {
    let row = sqlx::query(
        "SELECT title, overall_status, phase, last_update_posted, evidence_id \
         FROM trials WHERE company_id = ? AND nct_id = ?",
    )
    .bind(company_id)
    .bind(nct_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let interventions: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM trial_interventions WHERE company_id = ? AND nct_id = ? ORDER BY name",
    )
    .bind(company_id)
    .bind(nct_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(Trial {
        company_id: company_id.to_string(),
        nct_id: nct_id.to_string(),
        title: row.try_get("title")?,
        overall_status: row.try_get("overall_status")?,
        phase: row.try_get("phase")?,
        last_update_posted: row.try_get("last_update_posted")?,
        interventions,
        evidence_id: parse_uuid(&row.try_get::<String, _>("evidence_id")?)?,
    }))
}

async fn upsert_trial(conn: &mut SqliteConnection, trial: &Trial) -> Result<(), IngestError> {
    sqlx::query(
        "INSERT INTO trials (company_id, nct_id, title, overall_status, phase, last_update_posted, evidence_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (company_id, nct_id) DO UPDATE SET \
         title = excluded.title, overall_status = excluded.overall_status, phase = excluded.phase, \
         last_update_posted = excluded.last_update_posted, evidence_id = excluded.evidence_id",
    )
    .bind(&trial.company_id)
    .bind(&trial.nct_id)
    .bind(&trial.title)
    .bind(&trial.overall_status)
    .bind(&trial.phase)
    .bind(&trial.last_update_posted)
    .bind(trial.evidence_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Rewrites the stored intervention rows to match `trial.interventions`.
async fn store_interventions(conn: &mut SqliteConnection, trial: &Trial) -> Result<(), IngestError> {
    sqlx::query("DELETE FROM trial_interventions WHERE company_id = ? AND nct_id = ?")
        .bind(&trial.company_id)
        .bind(&trial.nct_id)
        .execute(&mut *conn)
        .await?;
    for name in &trial.interventions {
        sqlx::query("INSERT INTO trial_interventions (company_id, nct_id, name) VALUES (?, ?, ?)")
            .bind(&trial.company_id)
            .bind(&trial.nct_id)
            .bind(name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
