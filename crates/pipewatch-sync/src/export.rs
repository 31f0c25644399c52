//! Parquet snapshots, manifest and markdown change brief for one company.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use pipewatch_core::ChangeEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::fs;
use tracing::info;

use crate::read::{list_assets, list_events, list_trials, AssetView, EventQuery, TrialView};

/// Events listed individually in the brief.
pub const BRIEF_EVENT_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub company_id: String,
    pub generated_at: DateTime<Utc>,
    pub latest_event_id: Option<i64>,
    pub files: Vec<ManifestFile>,
}

pub async fn export_snapshot(pool: &SqlitePool, company_id: &str, out_dir: &Path) -> Result<ExportManifest> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let assets = list_assets(pool, company_id)
        .await
        .context("loading assets for export")?;
    let trials = list_trials(pool, company_id)
        .await
        .context("loading trials for export")?;
    let events = list_events(pool, company_id, &EventQuery::default())
        .await
        .context("loading change events for export")?;

    let assets_path = out_dir.join("assets.parquet");
    let trials_path = out_dir.join("trials.parquet");
    let events_path = out_dir.join("change_events.parquet");
    let brief_path = out_dir.join("change_brief.md");

    write_assets_parquet(&assets_path, &assets)?;
    write_trials_parquet(&trials_path, &trials)?;
    write_events_parquet(&events_path, &events)?;
    fs::write(&brief_path, change_brief(company_id, &assets, &events))
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;

    let manifest = ExportManifest {
        schema_version: 1,
        company_id: company_id.to_string(),
        generated_at: Utc::now(),
        latest_event_id: events.iter().map(|e| e.id).max(),
        files: vec![
            manifest_entry("assets", out_dir, &assets_path)?,
            manifest_entry("trials", out_dir, &trials_path)?,
            manifest_entry("change_events", out_dir, &events_path)?,
            manifest_entry("change_brief", out_dir, &brief_path)?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        company_id,
        assets = assets.len(),
        trials = trials.len(),
        events = events.len(),
        out = %out_dir.display(),
        "snapshot exported"
    );
    Ok(manifest)
}

/// Markdown digest: event counts by type, then the most recent events.
pub fn change_brief(company_id: &str, assets: &[AssetView], events: &[ChangeEvent]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.event_type.as_str()).or_default() += 1;
    }

    let mut lines = vec![
        format!("# Change brief: {company_id}"),
        String::new(),
        format!("- Assets: {}", assets.len()),
        format!(
            "- Active indications: {}",
            assets.iter().map(|a| a.indications.len()).sum::<usize>()
        ),
        format!("- Change events: {}", events.len()),
        String::new(),
        "## Event counts".to_string(),
    ];
    if counts.is_empty() {
        lines.push("- none".to_string());
    }
    lines.extend(counts.iter().map(|(kind, n)| format!("- {kind}: {n}")));

    lines.push(String::new());
    lines.push("## Recent changes".to_string());
    let recent = events
        .iter()
        .rev()
        .filter(|e| !e.event_type.is_summary())
        .take(BRIEF_EVENT_LIMIT)
        .collect::<Vec<_>>();
    if recent.is_empty() {
        lines.push("- none".to_string());
    }
    for event in recent.into_iter().rev() {
        lines.push(format!(
            "- #{} {} `{}` {}",
            event.id,
            event.occurred_at.format("%Y-%m-%d %H:%M"),
            event.event_type,
            event.summary
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_assets_parquet(path: &PathBuf, assets: &[AssetView]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("asset_id", DataType::Utf8, false),
        ArrowField::new("canonical_name", DataType::Utf8, false),
        ArrowField::new("highest_stage", DataType::Utf8, true),
        ArrowField::new("aliases", DataType::Utf8, false),
        ArrowField::new("active_indications", DataType::UInt32, false),
    ]));

    let ids = StringArray::from(assets.iter().map(|a| Some(a.id.to_string())).collect::<Vec<_>>());
    let names = StringArray::from(
        assets
            .iter()
            .map(|a| Some(a.canonical_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let stages = StringArray::from(
        assets
            .iter()
            .map(|a| a.highest_stage.map(|s| s.as_str()))
            .collect::<Vec<_>>(),
    );
    let aliases = StringArray::from(
        assets
            .iter()
            .map(|a| Some(a.aliases.join(" | ")))
            .collect::<Vec<_>>(),
    );
    let counts = UInt32Array::from(
        assets
            .iter()
            .map(|a| a.indications.len() as u32)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(stages),
            Arc::new(aliases),
            Arc::new(counts),
        ],
    )
    .context("building assets record batch")?;
    write_parquet(path, batch)
}

fn write_trials_parquet(path: &PathBuf, trials: &[TrialView]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("nct_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("overall_status", DataType::Utf8, true),
        ArrowField::new("phase", DataType::Utf8, true),
        ArrowField::new("last_update_posted", DataType::Utf8, true),
        ArrowField::new("linked_assets", DataType::Utf8, false),
    ]));

    let nct_ids = StringArray::from(trials.iter().map(|t| Some(t.nct_id.as_str())).collect::<Vec<_>>());
    let titles = StringArray::from(trials.iter().map(|t| t.title.as_deref()).collect::<Vec<_>>());
    let statuses = StringArray::from(
        trials
            .iter()
            .map(|t| t.overall_status.as_deref())
            .collect::<Vec<_>>(),
    );
    let phases = StringArray::from(trials.iter().map(|t| t.phase.as_deref()).collect::<Vec<_>>());
    let updated = StringArray::from(
        trials
            .iter()
            .map(|t| t.last_update_posted.as_deref())
            .collect::<Vec<_>>(),
    );
    let linked = StringArray::from(
        trials
            .iter()
            .map(|t| {
                Some(
                    t.linked_assets
                        .iter()
                        .map(|l| l.canonical_name.as_str())
                        .collect::<Vec<_>>()
                        .join(" | "),
                )
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(nct_ids),
            Arc::new(titles),
            Arc::new(statuses),
            Arc::new(phases),
            Arc::new(updated),
            Arc::new(linked),
        ],
    )
    .context("building trials record batch")?;
    write_parquet(path, batch)
}

fn write_events_parquet(path: &PathBuf, events: &[ChangeEvent]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("event_type", DataType::Utf8, false),
        ArrowField::new("occurred_at", DataType::Utf8, false),
        ArrowField::new("run_id", DataType::Int64, true),
        ArrowField::new("summary", DataType::Utf8, false),
        ArrowField::new("payload", DataType::Utf8, false),
    ]));

    let ids = Int64Array::from(events.iter().map(|e| e.id).collect::<Vec<_>>());
    let types = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.event_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let occurred = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.occurred_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let runs = Int64Array::from(events.iter().map(|e| e.run_id).collect::<Vec<_>>());
    let summaries = StringArray::from(events.iter().map(|e| Some(e.summary.as_str())).collect::<Vec<_>>());
    let payloads = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.payload.to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(types),
            Arc::new(occurred),
            Arc::new(runs),
            Arc::new(summaries),
            Arc::new(payloads),
        ],
    )
    .context("building change_events record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
