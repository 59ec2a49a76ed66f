//! attrib-engine - touchpoint attribution batch jobs
//!
//! Each subcommand is one bounded invocation against the record store.
//! Results are printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use attrib_common::config::resolve_database_url;
use attrib_common::store::{RecordStore, SqliteRecordStore};
use attrib_engine::models::{AttributionModel, MatchOptions, SignalKind};
use attrib_engine::services::HttpGeoProvider;
use attrib_engine::{AttributionEngine, EngineConfig, RunContext};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for attrib-engine
#[derive(Parser, Debug)]
#[command(name = "attrib-engine")]
#[command(about = "Touchpoint attribution engine")]
#[command(version)]
struct Args {
    /// Path to attrib.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Record store URL (overrides ATTRIB_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Wall-clock budget in seconds for this invocation (0 = unbounded)
    #[arg(long, global = true)]
    budget_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build or continue building the signal indexes
    BuildIndexes {
        /// Discard saved progress and start a fresh build
        #[arg(long)]
        restart: bool,
    },
    /// Resolve a single conversion
    Resolve {
        /// Conversion id or full `conversion:{id}` key
        conversion: String,
        #[command(flatten)]
        matching: MatchingArgs,
        /// Write the result back to the conversion record
        #[arg(long)]
        persist: bool,
    },
    /// Attribute every conversion that has no attribution yet
    AttributePending {
        #[command(flatten)]
        matching: MatchingArgs,
    },
    /// Run a named recovery pass
    Recover {
        /// Pass name from [[recovery]] or a built-in preset
        pass: String,
    },
    /// List configured and built-in recovery passes
    ListPasses,
    /// Show the most recent visits for one signal value
    QueryIndex {
        /// ip, session, fp, screen, webgl, page, source, or hour
        signal: String,
        value: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Delete expired records from the store
    Purge,
}

#[derive(clap::Args, Debug)]
struct MatchingArgs {
    /// first_touch or last_touch
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    lookback_days: Option<u32>,
}

impl MatchingArgs {
    fn options(&self, config: &EngineConfig) -> Result<MatchOptions> {
        let mut options = config.matching.options();
        if let Some(model) = &self.model {
            options.model = model
                .parse::<AttributionModel>()
                .map_err(anyhow::Error::msg)?;
        }
        if let Some(days) = self.lookback_days {
            options.lookback_days = days;
        }
        Ok(options)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode result")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Logs to stderr; stdout carries the JSON result
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting attrib-engine {}", env!("CARGO_PKG_VERSION"));

    if let Command::ListPasses = args.command {
        return print_json(&config.recovery_passes());
    }

    let database_url = resolve_database_url(args.database_url.as_deref(), &config.store)
        .context("Record store configuration")?;
    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::connect(
            &database_url,
            config.store.max_connections,
            config.store.max_lock_wait_ms,
        )
        .await
        .context("Failed to open record store")?,
    );

    let provider = Arc::new(
        HttpGeoProvider::new(config.geo.client_settings())
            .context("Failed to initialize geolocation client")?,
    );

    let engine = AttributionEngine::new(store, provider, config);

    let default_budget = match args.command {
        Command::BuildIndexes { .. } => engine.config().index.budget_secs,
        Command::Resolve { .. } | Command::QueryIndex { .. } | Command::Purge => 0,
        _ => engine.config().batch.budget_secs,
    };
    let budget_secs = args.budget_secs.unwrap_or(default_budget);

    let cancel = CancellationToken::new();
    let ctx: RunContext = engine.new_run_context(budget_secs).with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, checkpointing");
            cancel.cancel();
        }
    });

    info!(run_id = %ctx.run_id(), budget_secs, "Run context created");

    match args.command {
        Command::BuildIndexes { restart } => {
            let report = engine
                .build_indexes(&ctx, restart)
                .await
                .context("Index build failed")?;
            print_json(&report)
        }
        Command::Resolve {
            conversion,
            matching,
            persist,
        } => {
            let options = matching.options(engine.config())?;
            let record = engine
                .resolve_attribution(&ctx, &conversion, &options, persist)
                .await
                .with_context(|| format!("Failed to resolve {conversion}"))?;
            print_json(&record)
        }
        Command::AttributePending { matching } => {
            let options = matching.options(engine.config())?;
            let report = engine
                .attribute_pending(&ctx, options)
                .await
                .context("Pending attribution pass failed")?;
            print_json(&report)
        }
        Command::Recover { pass } => {
            let report = engine
                .run_recovery(&ctx, &pass)
                .await
                .with_context(|| format!("Recovery pass {pass} failed"))?;
            print_json(&report)
        }
        Command::QueryIndex {
            signal,
            value,
            limit,
        } => {
            let kind: SignalKind = signal.parse().map_err(anyhow::Error::msg)?;
            let visits = engine
                .query_index(kind, &value, limit)
                .await
                .context("Index query failed")?;
            print_json(&visits)
        }
        Command::Purge => {
            let removed = engine.purge_expired().await.context("Purge failed")?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Command::ListPasses => Ok(()),
    }
}
