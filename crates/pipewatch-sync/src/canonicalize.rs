//! Asset canonicalizer: resolves disclosure fragments to stable assets and
//! diffs their indications against persisted state.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{SubsecRound, Utc};
use pipewatch_adapters::{AliasSeed, PipelineSnapshot};
use pipewatch_core::{
    collapse_whitespace, parenthetical_aliases, Asset, AssetAdded, AssetAliasAdded, ChangePayload,
    IndicationChange, LabelRejection, Normalizer, PipelineIngested, RawFragment, Stage,
    StageChanged,
};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{parse_text, parse_uuid, ts};
use crate::feed::{append_event, diff_indication, IndicationDiff, IndicationState};
use crate::index::AliasIndex;
use crate::ledger::EvidenceLedger;
use crate::IngestError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    EmptyLabel,
    ImplausibleLabel { rejection: LabelRejection },
    UnknownStage { stage: String },
    EmptyIndication,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFragment {
    pub label: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFragment {
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: i64,
    pub company_id: String,
    pub report: PipelineIngested,
    pub skipped: Vec<SkippedFragment>,
    pub failed: Vec<FailedFragment>,
    /// Change events appended by the run, summary included.
    pub events: usize,
}

/// Fragment that passed cleaning, before asset resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PreparedFragment {
    label: String,
    indication: String,
    stage: Stage,
    therapeutic_area: Option<String>,
}

fn prepare(normalizer: &Normalizer, raw: &RawFragment) -> Result<PreparedFragment, SkipReason> {
    let label = normalizer.clean_label(&raw.label).ok_or(SkipReason::EmptyLabel)?;
    if normalizer.key(&label).is_empty() {
        return Err(SkipReason::EmptyLabel);
    }
    normalizer
        .check_plausible(&label)
        .map_err(|rejection| SkipReason::ImplausibleLabel { rejection })?;
    let stage = Stage::parse_loose(&raw.stage).map_err(|_| SkipReason::UnknownStage {
        stage: raw.stage.clone(),
    })?;
    let indication = normalizer.clean_indication(&raw.indication);
    if indication.is_empty() {
        return Err(SkipReason::EmptyIndication);
    }
    let therapeutic_area = raw
        .therapeutic_area
        .as_deref()
        .map(collapse_whitespace)
        .filter(|ta| !ta.is_empty());
    Ok(PreparedFragment {
        label,
        indication,
        stage,
        therapeutic_area,
    })
}

#[derive(Debug, Clone)]
struct ResolvedIndication {
    asset_id: Uuid,
    indication: String,
    stage: Stage,
    therapeutic_area: Option<String>,
    evidence_id: Uuid,
}

/// Keeps the highest stage per `(asset, indication)`, first occurrence order.
fn collapse_duplicates(resolved: Vec<ResolvedIndication>) -> Vec<ResolvedIndication> {
    let mut positions: HashMap<(Uuid, String), usize> = HashMap::new();
    let mut out: Vec<ResolvedIndication> = Vec::new();
    for item in resolved {
        let key = (item.asset_id, item.indication.clone());
        match positions.get(&key) {
            Some(&pos) => {
                if item.stage > out[pos].stage {
                    out[pos] = item;
                }
            }
            None => {
                positions.insert(key, out.len());
                out.push(item);
            }
        }
    }
    out
}

/// Curated `alias -> canonical` mapping keyed by normalized text.
#[derive(Debug, Default)]
struct SeedMap {
    canonical_by_key: HashMap<String, String>,
    aliases_by_canonical_key: HashMap<String, Vec<String>>,
}

impl SeedMap {
    fn build(
        normalizer: &Normalizer,
        configured: &BTreeMap<String, Vec<String>>,
        carried: &[AliasSeed],
    ) -> Self {
        let pairs = configured
            .iter()
            .flat_map(|(canonical, aliases)| aliases.iter().map(move |a| (canonical, a)))
            .chain(carried.iter().map(|s| (&s.canonical, &s.alias)));

        let mut seeds = Self::default();
        for (canonical, alias) in pairs {
            let canonical_key = normalizer.key(canonical);
            let alias_key = normalizer.key(alias);
            if canonical_key.is_empty() || alias_key.is_empty() {
                continue;
            }
            seeds
                .canonical_by_key
                .entry(canonical_key.clone())
                .or_insert_with(|| canonical.clone());
            let owner = seeds
                .canonical_by_key
                .entry(alias_key)
                .or_insert_with(|| canonical.clone());
            if owner != canonical {
                warn!(alias = %alias, kept = %owner, ignored = %canonical, "conflicting alias seed");
                continue;
            }
            let aliases = seeds.aliases_by_canonical_key.entry(canonical_key).or_default();
            if !aliases.contains(alias) {
                aliases.push(alias.clone());
            }
        }
        seeds
    }

    fn canonical_for(&self, key: &str) -> Option<&str> {
        self.canonical_by_key.get(key).map(String::as_str)
    }

    fn aliases_for(&self, canonical_key: &str) -> Vec<String> {
        self.aliases_by_canonical_key
            .get(canonical_key)
            .cloned()
            .unwrap_or_default()
    }
}

pub(crate) struct Canonicalizer<'a> {
    pool: &'a SqlitePool,
    ledger: &'a EvidenceLedger,
    normalizer: &'a Normalizer,
    company_id: &'a str,
    run_id: i64,
    index: AliasIndex,
    seeds: SeedMap,
    seeded_assets: HashSet<Uuid>,
    events: usize,
}

impl<'a> Canonicalizer<'a> {
    pub(crate) async fn new(
        pool: &'a SqlitePool,
        ledger: &'a EvidenceLedger,
        normalizer: &'a Normalizer,
        company_id: &'a str,
        run_id: i64,
        configured_seeds: &BTreeMap<String, Vec<String>>,
        carried_seeds: &[AliasSeed],
    ) -> Result<Self, IngestError> {
        let mut conn = pool.acquire().await?;
        let index = AliasIndex::load(&mut *conn, company_id).await?;
        Ok(Self {
            pool,
            ledger,
            normalizer,
            company_id,
            run_id,
            index,
            seeds: SeedMap::build(normalizer, configured_seeds, carried_seeds),
            seeded_assets: HashSet::new(),
            events: 0,
        })
    }

    pub(crate) async fn run(
        mut self,
        snapshot: PipelineSnapshot,
    ) -> Result<PipelineRunSummary, IngestError> {
        let fragments = snapshot.fragments.len();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        let mut resolved = Vec::new();

        for raw in &snapshot.fragments {
            let prepared = match prepare(self.normalizer, raw) {
                Ok(prepared) => prepared,
                Err(reason) => {
                    warn!(label = %raw.label, ?reason, "skipping fragment");
                    skipped.push(SkippedFragment {
                        label: raw.label.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let mut tx = self.pool.begin().await?;
            let evidence = match self
                .ledger
                .record(
                    &mut *tx,
                    self.company_id,
                    raw.evidence_type,
                    &raw.source_url,
                    &raw.raw_evidence_bytes,
                    self.run_id,
                )
                .await
            {
                Ok(evidence) => evidence,
                Err(IngestError::EvidenceWrite(error)) => {
                    warn!(label = %raw.label, %error, "evidence write failed; fragment not applied");
                    failed.push(FailedFragment {
                        label: raw.label.clone(),
                        error,
                    });
                    continue;
                }
                Err(other) => return Err(other),
            };
            let asset_id = self.resolve_asset(&mut *tx, &prepared.label).await?;
            tx.commit().await?;

            resolved.push(ResolvedIndication {
                asset_id,
                indication: prepared.indication,
                stage: prepared.stage,
                therapeutic_area: prepared.therapeutic_area,
                evidence_id: evidence.id,
            });
        }

        let assets_seen = resolved.iter().map(|r| r.asset_id).collect::<HashSet<_>>().len();
        let nothing_resolved = resolved.is_empty();
        for item in collapse_duplicates(resolved) {
            let mut tx = self.pool.begin().await?;
            self.apply_indication(&mut *tx, &item).await?;
            tx.commit().await?;
        }

        // an incomplete or fully rejected listing must not age anything
        let (indications_removed, indications_unconfirmed) = if nothing_resolved {
            warn!(
                fragments,
                skipped = skipped.len(),
                failed = failed.len(),
                "no fragment resolved; retention pass skipped"
            );
            (0, 0)
        } else if !failed.is_empty() {
            warn!(failed = failed.len(), "retention pass skipped for partially applied snapshot");
            (0, 0)
        } else {
            (self.retire_unseen().await?, self.unconfirm_unseen().await?)
        };

        let report = PipelineIngested {
            as_of_date: snapshot.as_of_date.clone(),
            assets_seen,
            fragments,
            skipped: skipped.len(),
            failed: failed.len(),
            indications_unconfirmed,
            indications_removed,
        };
        let mut conn = self.pool.acquire().await?;
        self.emit(&mut *conn, ChangePayload::PipelineIngested(report.clone()))
            .await?;

        info!(
            company_id = self.company_id,
            run_id = self.run_id,
            assets_seen,
            fragments,
            skipped = report.skipped,
            failed = report.failed,
            events = self.events,
            "pipeline run applied"
        );
        Ok(PipelineRunSummary {
            run_id: self.run_id,
            company_id: self.company_id.to_string(),
            report,
            skipped,
            failed,
            events: self.events,
        })
    }

    async fn emit(
        &mut self,
        conn: &mut SqliteConnection,
        payload: ChangePayload,
    ) -> Result<(), IngestError> {
        append_event(conn, self.company_id, self.run_id, &payload).await?;
        self.events += 1;
        Ok(())
    }

    fn asset_name(&self, asset_id: Uuid) -> String {
        self.index.name_of(asset_id).unwrap_or_default().to_string()
    }

    /// Alias table first, then curated seeds, else a new asset named by the label.
    /// A seed canonical resolves through its normalized key before any asset is created.
    async fn resolve_asset(
        &mut self,
        conn: &mut SqliteConnection,
        label: &str,
    ) -> Result<Uuid, IngestError> {
        let key = self.normalizer.key(label);
        let asset_id = match self.index.lookup(&key) {
            Some(asset_id) => asset_id,
            None => {
                let canonical = self
                    .seeds
                    .canonical_for(&key)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| label.to_string());
                let existing = self
                    .index
                    .lookup(&self.normalizer.key(&canonical))
                    .or_else(|| self.index.asset_by_name(&canonical));
                match existing {
                    Some(asset_id) => {
                        self.add_alias(conn, asset_id, label).await?;
                        asset_id
                    }
                    None => self.create_asset(conn, &canonical, label).await?,
                }
            }
        };
        self.ensure_seed_aliases(conn, asset_id).await?;
        Ok(asset_id)
    }

    async fn create_asset(
        &mut self,
        conn: &mut SqliteConnection,
        canonical_name: &str,
        label: &str,
    ) -> Result<Uuid, IngestError> {
        let asset = Asset {
            id: Asset::id_for(self.company_id, canonical_name),
            company_id: self.company_id.to_string(),
            canonical_name: canonical_name.to_string(),
            created_at: Utc::now().trunc_subsecs(6),
        };
        sqlx::query("INSERT INTO assets (id, company_id, canonical_name, created_at) VALUES (?, ?, ?, ?)")
            .bind(asset.id.to_string())
            .bind(&asset.company_id)
            .bind(&asset.canonical_name)
            .bind(ts(asset.created_at))
            .execute(&mut *conn)
            .await?;
        self.index.insert_asset(asset.id, asset.canonical_name.clone());

        let mut candidates = vec![canonical_name.to_string(), label.to_string()];
        candidates.extend(parenthetical_aliases(canonical_name));
        candidates.extend(parenthetical_aliases(label));
        candidates.extend(self.seeds.aliases_for(&self.normalizer.key(canonical_name)));

        let mut registered = Vec::new();
        for text in candidates {
            if self.insert_alias(conn, asset.id, &text).await? {
                registered.push(text);
            }
        }
        self.seeded_assets.insert(asset.id);

        self.emit(
            conn,
            ChangePayload::AssetAdded(AssetAdded {
                asset_id: asset.id,
                asset: asset.canonical_name.clone(),
                aliases: registered,
            }),
        )
        .await?;
        Ok(asset.id)
    }

    /// Inserts the alias row unless its key is empty, implausible or already owned.
    async fn insert_alias(
        &mut self,
        conn: &mut SqliteConnection,
        asset_id: Uuid,
        alias_text: &str,
    ) -> Result<bool, IngestError> {
        let alias_text = collapse_whitespace(alias_text);
        let key = self.normalizer.key(&alias_text);
        if key.is_empty() || self.normalizer.check_plausible(&alias_text).is_err() {
            return Ok(false);
        }
        if let Some(owner) = self.index.lookup(&key) {
            if owner != asset_id {
                debug!(alias = %alias_text, owner = %owner, "alias key already owned by another asset");
            }
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO asset_aliases (company_id, normalized_text, asset_id, alias_text) VALUES (?, ?, ?, ?)",
        )
        .bind(self.company_id)
        .bind(&key)
        .bind(asset_id.to_string())
        .bind(&alias_text)
        .execute(&mut *conn)
        .await?;
        self.index.insert_alias(key, alias_text, asset_id);
        Ok(true)
    }

    async fn add_alias(
        &mut self,
        conn: &mut SqliteConnection,
        asset_id: Uuid,
        alias_text: &str,
    ) -> Result<(), IngestError> {
        if self.insert_alias(conn, asset_id, alias_text).await? {
            let alias = collapse_whitespace(alias_text);
            let payload = ChangePayload::AssetAliasAdded(AssetAliasAdded {
                asset_id,
                asset: self.asset_name(asset_id),
                normalized: self.normalizer.key(&alias),
                alias,
            });
            self.emit(conn, payload).await?;
        }
        Ok(())
    }

    /// Registers curated seeds of an existing asset once per run.
    async fn ensure_seed_aliases(
        &mut self,
        conn: &mut SqliteConnection,
        asset_id: Uuid,
    ) -> Result<(), IngestError> {
        if !self.seeded_assets.insert(asset_id) {
            return Ok(());
        }
        let canonical_key = self.normalizer.key(&self.asset_name(asset_id));
        for alias in self.seeds.aliases_for(&canonical_key) {
            self.add_alias(conn, asset_id, &alias).await?;
        }
        Ok(())
    }

    async fn apply_indication(
        &mut self,
        conn: &mut SqliteConnection,
        item: &ResolvedIndication,
    ) -> Result<(), IngestError> {
        let row = sqlx::query(
            "SELECT stage, status FROM asset_indications WHERE asset_id = ? AND indication_text = ?",
        )
        .bind(item.asset_id.to_string())
        .bind(&item.indication)
        .fetch_optional(&mut *conn)
        .await?;
        let existing = row
            .map(|row| -> Result<IndicationState, IngestError> {
                Ok(IndicationState {
                    stage: parse_text(&row.try_get::<String, _>("stage")?)?,
                    status: parse_text(&row.try_get::<String, _>("status")?)?,
                })
            })
            .transpose()?;

        let asset = self.asset_name(item.asset_id);
        let indication_change = || IndicationChange {
            asset_id: item.asset_id,
            asset: asset.clone(),
            indication: item.indication.clone(),
            stage: item.stage,
            therapeutic_area: item.therapeutic_area.clone(),
            evidence_id: item.evidence_id,
        };

        match diff_indication(existing, item.stage) {
            IndicationDiff::Added => {
                sqlx::query(
                    "INSERT INTO asset_indications \
                     (asset_id, indication_text, stage, therapeutic_area, first_seen_at, evidence_id, status, last_confirmed_run_id) \
                     VALUES (?, ?, ?, ?, ?, ?, 'confirmed', ?)",
                )
                .bind(item.asset_id.to_string())
                .bind(&item.indication)
                .bind(item.stage.as_str())
                .bind(&item.therapeutic_area)
                .bind(ts(Utc::now()))
                .bind(item.evidence_id.to_string())
                .bind(self.run_id)
                .execute(&mut *conn)
                .await?;
                self.emit(conn, ChangePayload::AssetIndicationAdded(indication_change()))
                    .await?;
            }
            IndicationDiff::Readded => {
                sqlx::query(
                    "UPDATE asset_indications SET stage = ?, evidence_id = ?, \
                     therapeutic_area = COALESCE(therapeutic_area, ?), status = 'confirmed', last_confirmed_run_id = ? \
                     WHERE asset_id = ? AND indication_text = ?",
                )
                .bind(item.stage.as_str())
                .bind(item.evidence_id.to_string())
                .bind(&item.therapeutic_area)
                .bind(self.run_id)
                .bind(item.asset_id.to_string())
                .bind(&item.indication)
                .execute(&mut *conn)
                .await?;
                self.emit(conn, ChangePayload::AssetIndicationAdded(indication_change()))
                    .await?;
            }
            IndicationDiff::StageChanged {
                from,
                to,
                direction,
            } => {
                sqlx::query(
                    "UPDATE asset_indications SET stage = ?, evidence_id = ?, status = 'confirmed', \
                     last_confirmed_run_id = ? WHERE asset_id = ? AND indication_text = ?",
                )
                .bind(to.as_str())
                .bind(item.evidence_id.to_string())
                .bind(self.run_id)
                .bind(item.asset_id.to_string())
                .bind(&item.indication)
                .execute(&mut *conn)
                .await?;
                let payload = ChangePayload::AssetIndicationStageChanged(StageChanged {
                    asset_id: item.asset_id,
                    asset: asset.clone(),
                    indication: item.indication.clone(),
                    from,
                    to,
                    direction,
                    evidence_id: item.evidence_id,
                });
                self.emit(conn, payload).await?;
            }
            IndicationDiff::Unchanged => {
                sqlx::query(
                    "UPDATE asset_indications SET status = 'confirmed', last_confirmed_run_id = ? \
                     WHERE asset_id = ? AND indication_text = ?",
                )
                .bind(self.run_id)
                .bind(item.asset_id.to_string())
                .bind(&item.indication)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }

    /// Second consecutive miss: `unconfirmed -> removed`, one event per row.
    async fn retire_unseen(&mut self) -> Result<usize, IngestError> {
        let rows = sqlx::query(
            "SELECT ai.asset_id, ai.indication_text, ai.stage, ai.therapeutic_area, ai.evidence_id \
             FROM asset_indications ai JOIN assets a ON a.id = ai.asset_id \
             WHERE a.company_id = ? AND ai.status = 'unconfirmed' AND ai.last_confirmed_run_id != ? \
             ORDER BY a.canonical_name, ai.indication_text",
        )
        .bind(self.company_id)
        .bind(self.run_id)
        .fetch_all(self.pool)
        .await?;

        let mut removed = 0;
        for row in rows {
            let asset_id = parse_uuid(&row.try_get::<String, _>("asset_id")?)?;
            let indication: String = row.try_get("indication_text")?;
            let payload = ChangePayload::AssetIndicationRemoved(IndicationChange {
                asset_id,
                asset: self.asset_name(asset_id),
                indication: indication.clone(),
                stage: parse_text(&row.try_get::<String, _>("stage")?)?,
                therapeutic_area: row.try_get("therapeutic_area")?,
                evidence_id: parse_uuid(&row.try_get::<String, _>("evidence_id")?)?,
            });

            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE asset_indications SET status = 'removed' WHERE asset_id = ? AND indication_text = ?",
            )
            .bind(asset_id.to_string())
            .bind(&indication)
            .execute(&mut *tx)
            .await?;
            self.emit(&mut *tx, payload).await?;
            tx.commit().await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// First miss: `confirmed -> unconfirmed`. Bookkeeping only, no event.
    async fn unconfirm_unseen(&mut self) -> Result<usize, IngestError> {
        let result = sqlx::query(
            "UPDATE asset_indications SET status = 'unconfirmed' \
             WHERE status = 'confirmed' AND last_confirmed_run_id != ? \
             AND asset_id IN (SELECT id FROM assets WHERE company_id = ?)",
        )
        .bind(self.run_id)
        .bind(self.company_id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewatch_core::EvidenceType;

    fn raw(label: &str, indication: &str, stage: &str) -> RawFragment {
        RawFragment {
            label: label.into(),
            indication: indication.into(),
            stage: stage.into(),
            therapeutic_area: None,
            evidence_type: EvidenceType::PipelineHtml,
            source_url: "https://example.com/pipeline".into(),
            raw_evidence_bytes: b"<table/>".to_vec(),
        }
    }

    #[test]
    fn prepare_reports_each_skip_reason() {
        let n = Normalizer::default();
        assert_eq!(prepare(&n, &raw(" † ", "NSCLC", "Phase 3")), Err(SkipReason::EmptyLabel));
        assert_eq!(
            prepare(&n, &raw("Indications", "NSCLC", "Phase 3")),
            Err(SkipReason::ImplausibleLabel {
                rejection: LabelRejection::StopLabel
            })
        );
        assert_eq!(
            prepare(&n, &raw("RYBREVANT", "NSCLC", "Approved")),
            Err(SkipReason::UnknownStage {
                stage: "Approved".into()
            })
        );
        assert_eq!(
            prepare(&n, &raw("RYBREVANT", "   ", "Phase 3")),
            Err(SkipReason::EmptyIndication)
        );

        let ok = prepare(&n, &raw("system) RYBREVANT", " NSCLC   EGFR ", "Ph 3")).unwrap();
        assert_eq!(ok.label, "RYBREVANT");
        assert_eq!(ok.indication, "NSCLC EGFR");
        assert_eq!(ok.stage, Stage::Phase3);
    }

    #[test]
    fn prepare_applies_sanitizer_rules() {
        let n = Normalizer::default();
        assert_eq!(
            prepare(&n, &raw("Immatics Biosciences", "Solid tumors", "Phase 1")),
            Err(SkipReason::ImplausibleLabel {
                rejection: LabelRejection::CorporateToken
            })
        );
        assert_eq!(
            prepare(&n, &raw("F a c t o r X I a", "Thrombosis", "Phase 2")),
            Err(SkipReason::ImplausibleLabel {
                rejection: LabelRejection::StopLabel
            })
        );
        assert_eq!(
            prepare(&n, &raw("TAR-200", "Inclusion in this pipeline is not a forecast", "Phase 3")),
            Err(SkipReason::EmptyIndication)
        );

        let ok = prepare(
            &n,
            &raw("TAR-200", "NMIBC, through clinical trials in 2026", "Phase 3"),
        )
        .unwrap();
        assert_eq!(ok.indication, "NMIBC");
    }

    #[test]
    fn duplicates_keep_highest_stage() {
        let a = Uuid::from_u128(1);
        let item = |indication: &str, stage| ResolvedIndication {
            asset_id: a,
            indication: indication.into(),
            stage,
            therapeutic_area: None,
            evidence_id: Uuid::nil(),
        };
        let collapsed = collapse_duplicates(vec![
            item("NSCLC", Stage::Phase2),
            item("CRC", Stage::Phase1),
            item("NSCLC", Stage::Phase3),
            item("NSCLC", Stage::Phase1),
        ]);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].indication, "NSCLC");
        assert_eq!(collapsed[0].stage, Stage::Phase3);
        assert_eq!(collapsed[1].indication, "CRC");
    }

    #[test]
    fn seed_map_resolves_aliases_to_canonical_names() {
        let n = Normalizer::default();
        let mut configured = BTreeMap::new();
        configured.insert("RYBREVANT".to_string(), vec!["amivantamab".to_string()]);
        let carried = vec![
            AliasSeed {
                alias: "JNJ-61186372".into(),
                canonical: "RYBREVANT".into(),
            },
            AliasSeed {
                alias: "Amivantamab".into(),
                canonical: "LAZCLUZE".into(),
            },
        ];
        let seeds = SeedMap::build(&n, &configured, &carried);

        assert_eq!(seeds.canonical_for("amivantamab"), Some("RYBREVANT"));
        assert_eq!(seeds.canonical_for("rybrevant"), Some("RYBREVANT"));
        assert_eq!(seeds.canonical_for("jnj-61186372"), Some("RYBREVANT"));
        assert_eq!(
            seeds.aliases_for("rybrevant"),
            vec!["amivantamab".to_string(), "JNJ-61186372".to_string()]
        );
        assert!(seeds.aliases_for("lazcluze").is_empty());
    }
}
