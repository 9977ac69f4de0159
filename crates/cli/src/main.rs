use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tagflow_cli::report;
use tagflow_core::config;
use tagflow_core::config::AppConfig;
use tagflow_core::pipeline::{Pipeline, PipelineMode};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest { path } => run_pipeline(cfg, PipelineMode::Ingest(path), cli.json).await,
        Commands::Rules => run_pipeline(cfg, PipelineMode::Rules, cli.json).await,
        Commands::Llm { min_usage, limit } => {
            let mut cfg = cfg;
            if let Some(min) = min_usage {
                cfg.llm.min_usage_count = min;
            }
            if limit.is_some() {
                cfg.llm.limit = limit;
            }
            run_pipeline(cfg, PipelineMode::Llm, cli.json).await
        }
        Commands::Audit => run_pipeline(cfg, PipelineMode::Audit, cli.json).await,
        Commands::Export { force } => {
            run_pipeline(cfg, PipelineMode::Export { force }, cli.json).await
        }
        Commands::Migrate => run_pipeline(cfg, PipelineMode::Migrate, cli.json).await,
        Commands::Embed { max_stages } => {
            run_pipeline(cfg, PipelineMode::Embed { max_stages }, cli.json).await
        }
        Commands::Verify => run_pipeline(cfg, PipelineMode::Verify, cli.json).await,
        Commands::All => run_pipeline(cfg, PipelineMode::All, cli.json).await,
        Commands::ClassifyTag { name, native } => run_classify_tag(cfg, &name, native, cli.json).await,
        Commands::Override {
            name,
            main,
            sub,
            reasoning,
        } => run_override(cfg, &name, &main, sub.as_deref(), reasoning.as_deref()).await,
        Commands::ResetSource { source } => run_reset_source(cfg, &source).await,
        Commands::Status => run_status(cfg, cli.json).await,
    }
}

#[derive(Parser)]
#[command(name = "tagflow")]
#[command(about = "Tag classification and staged migration", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load tags from a JSON-lines dump
    Ingest {
        path: PathBuf,
    },
    /// Classify unclassified tags with the rule engine
    Rules,
    /// Classify remaining general tags with the oracle
    Llm {
        /// Override llm.min_usage_count
        #[arg(long)]
        min_usage: Option<i64>,
        /// Stop after this many tags
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Report coverage and quality statistics
    Audit,
    /// Write migration batch artifacts
    Export {
        /// Discard an existing manifest and re-export
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Export (reusing artifacts) and upload pending batches
    Migrate,
    /// Generate embeddings tier by tier
    Embed {
        /// Run at most this many tiers
        #[arg(long)]
        max_stages: Option<usize>,
    },
    /// Compare local and remote row counts
    Verify,
    /// Run every phase in order
    All,
    /// Show what the rule engine would assign to a tag
    ClassifyTag {
        name: String,
        /// Native category 0-5
        #[arg(long)]
        native: Option<i64>,
    },
    /// Set a manual classification that no automated pass overwrites
    Override {
        name: String,
        main: String,
        sub: Option<String>,
        #[arg(long)]
        reasoning: Option<String>,
    },
    /// Clear every classification made by one source
    ResetSource {
        source: String,
    },
    /// Show store counts and migration progress
    Status,
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            child.cancel();
        }
    });
    token
}

fn mode_label(mode: &PipelineMode) -> &'static str {
    match mode {
        PipelineMode::Ingest(_) => "ingest",
        PipelineMode::Rules => "rules",
        PipelineMode::Llm => "llm",
        PipelineMode::Audit => "audit",
        PipelineMode::Export { .. } => "export",
        PipelineMode::Migrate => "migrate",
        PipelineMode::Embed { .. } => "embed",
        PipelineMode::Verify => "verify",
        PipelineMode::All => "all",
    }
}

async fn run_pipeline(cfg: AppConfig, mode: PipelineMode, json: bool) -> Result<()> {
    let label = mode_label(&mode);
    let pipeline = Pipeline::open(cfg)
        .await?
        .with_cancellation(cancel_on_ctrl_c());
    let summary = pipeline.run(mode).await?;
    if json {
        let summary_json = serde_json::json!({
            "status": if summary.cancelled { "cancelled" } else { "ok" },
            "mode": label,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&summary_json)?);
    } else {
        for line in report::render(label, &summary) {
            println!("{line}");
        }
    }
    if let Some(v) = &summary.verification {
        if !v.is_consistent() {
            anyhow::bail!("verification found {} mismatches", v.mismatches.len());
        }
    }
    Ok(())
}

async fn run_classify_tag(cfg: AppConfig, name: &str, native: Option<i64>, json: bool) -> Result<()> {
    let pipeline = Pipeline::open(cfg).await?;
    let engine = pipeline.rule_engine()?;
    let result = engine.classify(name, native);
    if json {
        let value = serde_json::json!({
            "name": name,
            "main_category": result.as_ref().map(|c| c.main()),
            "sub_category": result.as_ref().and_then(|c| c.sub()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match result {
            Some(c) => println!("{name}: {}/{}", c.main(), c.sub().unwrap_or("-")),
            None => println!("{name}: no rule matches"),
        }
    }
    Ok(())
}

async fn run_override(
    cfg: AppConfig,
    name: &str,
    main: &str,
    sub: Option<&str>,
    reasoning: Option<&str>,
) -> Result<()> {
    let pipeline = Pipeline::open(cfg).await?;
    let classification = pipeline
        .taxonomy()
        .classification(main, sub)
        .with_context(|| format!("cannot classify {name} as {main}"))?;
    if !pipeline
        .store()
        .set_manual_override(name, &classification, reasoning)
        .await?
    {
        anyhow::bail!("unknown tag `{name}`");
    }
    println!("{name}: {}/{} (manual)", classification.main(), classification.sub().unwrap_or("-"));
    Ok(())
}

async fn run_reset_source(cfg: AppConfig, source: &str) -> Result<()> {
    let pipeline = Pipeline::open(cfg).await?;
    let cleared = pipeline.store().reset_source(source).await?;
    println!("cleared {cleared} classifications from {source}");
    Ok(())
}

async fn run_status(cfg: AppConfig, json: bool) -> Result<()> {
    let artifact_dir = cfg.migration.artifact_dir.clone();
    let pipeline = Pipeline::open(cfg).await?;
    let counts = pipeline.store().counts().await?;
    let stager = pipeline.stager();
    let manifest = stager.read_manifest().await?;
    let done = stager.completed_batches().await?;
    if json {
        let value = serde_json::json!({
            "counts": counts,
            "artifact_dir": artifact_dir,
            "batch_count": manifest.as_ref().map(|m| m.batch_count),
            "completed_batches": done.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "tags: {} total, {} classified, {} embedded",
            counts.total, counts.classified, counts.embedded
        );
        match manifest {
            Some(m) => println!("migration: {}/{} batches uploaded", done.len(), m.batch_count),
            None => println!("migration: not exported ({artifact_dir})"),
        }
    }
    Ok(())
}
