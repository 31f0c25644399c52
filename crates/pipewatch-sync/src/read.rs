//! Read model over canonical state and the change feed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pipewatch_core::{ChangeEvent, IndicationStatus, MatchConfidence, Stage};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::{parse_text, parse_ts, parse_uuid, ts};
use crate::IngestError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicationView {
    pub indication: String,
    pub stage: Stage,
    pub therapeutic_area: Option<String>,
    pub status: IndicationStatus,
    pub evidence_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetView {
    pub id: Uuid,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    /// Highest stage over the active indications.
    pub highest_stage: Option<Stage>,
    /// Confirmed and unconfirmed indications; removed rows are history only.
    pub indications: Vec<IndicationView>,
}

pub async fn list_assets(pool: &SqlitePool, company_id: &str) -> Result<Vec<AssetView>, IngestError> {
    let mut aliases: HashMap<Uuid, Vec<String>> = HashMap::new();
    let alias_rows = sqlx::query(
        "SELECT asset_id, alias_text FROM asset_aliases WHERE company_id = ? ORDER BY alias_text",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    for row in alias_rows {
        let asset_id = parse_uuid(&row.try_get::<String, _>("asset_id")?)?;
        aliases.entry(asset_id).or_default().push(row.try_get("alias_text")?);
    }

    let mut indications: HashMap<Uuid, Vec<IndicationView>> = HashMap::new();
    let indication_rows = sqlx::query(
        "SELECT ai.asset_id, ai.indication_text, ai.stage, ai.therapeutic_area, ai.status, ai.evidence_id \
         FROM asset_indications ai JOIN assets a ON a.id = ai.asset_id \
         WHERE a.company_id = ? AND ai.status != 'removed' \
         ORDER BY ai.indication_text",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    for row in indication_rows {
        let asset_id = parse_uuid(&row.try_get::<String, _>("asset_id")?)?;
        indications.entry(asset_id).or_default().push(IndicationView {
            indication: row.try_get("indication_text")?,
            stage: parse_text(&row.try_get::<String, _>("stage")?)?,
            therapeutic_area: row.try_get("therapeutic_area")?,
            status: parse_text(&row.try_get::<String, _>("status")?)?,
            evidence_id: parse_uuid(&row.try_get::<String, _>("evidence_id")?)?,
        });
    }

    let asset_rows =
        sqlx::query("SELECT id, canonical_name FROM assets WHERE company_id = ? ORDER BY canonical_name")
            .bind(company_id)
            .fetch_all(pool)
            .await?;
    asset_rows
        .iter()
        .map(|row| {
            let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
            let indications = indications.remove(&id).unwrap_or_default();
            Ok(AssetView {
                id,
                canonical_name: row.try_get("canonical_name")?,
                aliases: aliases.remove(&id).unwrap_or_default(),
                highest_stage: indications.iter().map(|i| i.stage).max(),
                indications,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedAsset {
    pub asset_id: Uuid,
    pub canonical_name: String,
    pub match_confidence: MatchConfidence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialView {
    pub nct_id: String,
    pub title: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
    pub last_update_posted: Option<String>,
    pub interventions: Vec<String>,
    pub linked_assets: Vec<LinkedAsset>,
}

pub async fn list_trials(pool: &SqlitePool, company_id: &str) -> Result<Vec<TrialView>, IngestError> {
    let mut interventions: HashMap<String, Vec<String>> = HashMap::new();
    let intervention_rows = sqlx::query(
        "SELECT nct_id, name FROM trial_interventions WHERE company_id = ? ORDER BY name",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    for row in intervention_rows {
        interventions
            .entry(row.try_get("nct_id")?)
            .or_default()
            .push(row.try_get("name")?);
    }

    let mut links: HashMap<String, Vec<LinkedAsset>> = HashMap::new();
    let link_rows = sqlx::query(
        "SELECT l.nct_id, l.asset_id, a.canonical_name, l.match_confidence \
         FROM trial_asset_links l JOIN assets a ON a.id = l.asset_id \
         WHERE l.company_id = ? ORDER BY a.canonical_name",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    for row in link_rows {
        links.entry(row.try_get("nct_id")?).or_default().push(LinkedAsset {
            asset_id: parse_uuid(&row.try_get::<String, _>("asset_id")?)?,
            canonical_name: row.try_get("canonical_name")?,
            match_confidence: parse_text(&row.try_get::<String, _>("match_confidence")?)?,
        });
    }

    let trial_rows = sqlx::query(
        "SELECT nct_id, title, overall_status, phase, last_update_posted \
         FROM trials WHERE company_id = ? ORDER BY nct_id",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    trial_rows
        .iter()
        .map(|row| {
            let nct_id: String = row.try_get("nct_id")?;
            Ok(TrialView {
                title: row.try_get("title")?,
                overall_status: row.try_get("overall_status")?,
                phase: row.try_get("phase")?,
                last_update_posted: row.try_get("last_update_posted")?,
                interventions: interventions.remove(&nct_id).unwrap_or_default(),
                linked_assets: links.remove(&nct_id).unwrap_or_default(),
                nct_id,
            })
        })
        .collect()
}

/// Feed filter. All bounds are optional; `until` is exclusive.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Cursor: only events with a greater id.
    pub since_id: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Events of one company in `(occurred_at, id)` order.
pub async fn list_events(
    pool: &SqlitePool,
    company_id: &str,
    query: &EventQuery,
) -> Result<Vec<ChangeEvent>, IngestError> {
    let from = query.from.map(ts);
    let until = query.until.map(ts);
    let rows = sqlx::query(
        "SELECT id, company_id, event_type, payload, summary, occurred_at, run_id FROM change_events \
         WHERE company_id = ? \
         AND (? IS NULL OR id > ?) \
         AND (? IS NULL OR occurred_at >= ?) \
         AND (? IS NULL OR occurred_at < ?) \
         ORDER BY occurred_at, id LIMIT ?",
    )
    .bind(company_id)
    .bind(query.since_id)
    .bind(query.since_id)
    .bind(&from)
    .bind(&from)
    .bind(&until)
    .bind(&until)
    // negative LIMIT means no limit in SQLite
    .bind(query.limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

fn event_from_row(row: &SqliteRow) -> Result<ChangeEvent, IngestError> {
    Ok(ChangeEvent {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        event_type: parse_text(&row.try_get::<String, _>("event_type")?)?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
        summary: row.try_get("summary")?,
        occurred_at: parse_ts(&row.try_get::<String, _>("occurred_at")?)?,
        run_id: row.try_get("run_id")?,
    })
}

pub async fn latest_event_id(pool: &SqlitePool, company_id: &str) -> Result<Option<i64>, IngestError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM change_events WHERE company_id = ?")
        .bind(company_id)
        .fetch_one(pool)
        .await?;
    Ok(id)
}
