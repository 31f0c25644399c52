use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipewatch_adapters::{
    BundlePipelineSource, CuratedSeedSource, PipelineSource, SponsorFilter, StudiesFileSource,
};
use pipewatch_sync::read::{latest_event_id, list_assets, list_events, list_trials};
use pipewatch_sync::{db, export_snapshot, Engine, EventQuery, SyncConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pipewatch")]
#[command(about = "Pharma pipeline canonicalization and change feed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Ingest one pipeline listing for a company.
    IngestPipeline {
        #[arg(long)]
        company: String,
        /// JSON fragment bundle; defaults to the company's configured bundle.
        #[arg(long, conflicts_with = "curated")]
        bundle: Option<PathBuf>,
        /// Curated YAML seed list; defaults to the company's configured file.
        #[arg(long)]
        curated: Option<PathBuf>,
    },
    /// Fetch studies for known aliases and link them to assets.
    IngestTrials {
        #[arg(long)]
        company: String,
        /// Captured studies document instead of the live registry.
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Print change events in feed order.
    Changes {
        #[arg(long)]
        company: String,
        #[arg(long)]
        since_id: Option<i64>,
        #[arg(long)]
        limit: Option<i64>,
    },
    Assets {
        #[arg(long)]
        company: String,
    },
    Trials {
        #[arg(long)]
        company: String,
    },
    /// Write parquet snapshots, manifest and change brief.
    Export {
        #[arg(long)]
        company: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let sync = SyncConfig::from_env();

    if let Commands::Migrate = cli.command {
        let pool = db::connect(&sync.database_url).await?;
        db::migrate(&pool).await.context("running migrations")?;
        println!("migrations applied: {}", sync.database_url);
        return Ok(());
    }

    let engine = Engine::from_sync_config(&sync).await?;
    match cli.command {
        Commands::Migrate => {}
        Commands::IngestPipeline {
            company,
            bundle,
            curated,
        } => {
            let source = pipeline_source(&engine, &company, bundle, curated)?;
            let snapshot = source
                .load_snapshot()
                .await
                .with_context(|| format!("loading snapshot from {}", source.source_id()))?;
            let summary = engine.ingest_pipeline(&company, snapshot).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::IngestTrials { company, bundle } => {
            let summary = match bundle {
                Some(path) => {
                    let sponsors = engine
                        .config()
                        .company(&company)
                        .map(|c| c.sponsor_aliases.clone())
                        .unwrap_or_default();
                    let source = StudiesFileSource::new(path, SponsorFilter::new(&sponsors));
                    engine.ingest_trials(&company, &source).await?
                }
                None => {
                    let source = engine.live_trials_source(&company, &sync)?;
                    engine.ingest_trials(&company, &source).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Changes {
            company,
            since_id,
            limit,
        } => {
            let query = EventQuery {
                since_id,
                limit,
                ..EventQuery::default()
            };
            let events = list_events(engine.pool(), &company, &query).await?;
            for event in &events {
                println!(
                    "{}\t{}\t{}\t{}",
                    event.id,
                    event.occurred_at.to_rfc3339(),
                    event.event_type,
                    event.summary
                );
            }
            if let Some(latest) = latest_event_id(engine.pool(), &company).await? {
                eprintln!("{} events, latest id {latest}", events.len());
            }
        }
        Commands::Assets { company } => {
            for asset in list_assets(engine.pool(), &company).await? {
                let stage = asset.highest_stage.map(|s| s.as_str()).unwrap_or("-");
                println!(
                    "{}\t{}\t{} indications\t{}",
                    asset.canonical_name,
                    stage,
                    asset.indications.len(),
                    asset.aliases.join(" | ")
                );
            }
        }
        Commands::Trials { company } => {
            for trial in list_trials(engine.pool(), &company).await? {
                let linked = trial
                    .linked_assets
                    .iter()
                    .map(|l| format!("{} ({})", l.canonical_name, l.match_confidence))
                    .collect::<Vec<_>>();
                println!(
                    "{}\t{}\t{}\t{}",
                    trial.nct_id,
                    trial.overall_status.as_deref().unwrap_or("-"),
                    trial.phase.as_deref().unwrap_or("-"),
                    linked.join(", ")
                );
            }
        }
        Commands::Export { company, out } => {
            let manifest = export_snapshot(engine.pool(), &company, &out).await?;
            println!(
                "export complete: {} files, latest event {}",
                manifest.files.len(),
                manifest
                    .latest_event_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }
    }

    Ok(())
}

fn pipeline_source(
    engine: &Engine,
    company_id: &str,
    bundle: Option<PathBuf>,
    curated: Option<PathBuf>,
) -> Result<Box<dyn PipelineSource>> {
    if let Some(path) = bundle {
        return Ok(Box::new(BundlePipelineSource::new(company_id, path)));
    }
    if let Some(path) = curated {
        return Ok(Box::new(CuratedSeedSource::new(path)));
    }
    let Some(company) = engine.config().company(company_id) else {
        bail!("company {company_id:?} is not configured");
    };
    match (&company.pipeline_bundle, &company.curated_assets_file) {
        (Some(path), _) => Ok(Box::new(BundlePipelineSource::new(company_id, path.clone()))),
        (None, Some(path)) => Ok(Box::new(CuratedSeedSource::new(path.clone()))),
        (None, None) => bail!("no --bundle or --curated given and {company_id} configures neither"),
    }
}
