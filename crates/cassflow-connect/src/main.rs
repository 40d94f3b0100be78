//! cassflow - Cassandra commit-log replicator
//!
//! Tails the source's cdc_raw directory and replicates row mutations to the
//! enabled destination warehouses with exactly-once observable effect,
//! sensitive-field masking, and schema-evolution tolerance.
//!
//! ```text
//! cassflow --config config/cassflow.yaml
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 internal error, 2 invalid configuration,
//! 3 source unreachable at startup, 4 fatal DLQ failure.

use anyhow::Context;
use cassflow_cdc::{CommitLogReader, JsonFileCatalog, OffsetManager, ReaderConfig, SchemaMonitor};
use cassflow_connect::config::ReplicatorConfig;
use cassflow_connect::dlq::DlqWriter;
use cassflow_connect::health::{self, HealthState};
use cassflow_connect::masking::MaskingRules;
use cassflow_connect::metrics::MetricsRegistry;
use cassflow_connect::pipeline::{Pipeline, PipelineConfig};
use cassflow_connect::sinks::{ClickhouseSink, PostgresSink, Sink, TimescaleSink};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_INTERNAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_SOURCE: i32 = 3;
const EXIT_FATAL_DLQ: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "cassflow", version, about = "Commit-log CDC replicator")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/cassflow.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match ReplicatorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    };
    if cli.check {
        info!(path = %cli.config.display(), "configuration is valid");
        return 0;
    }
    if config.enabled_destination_count() == 0 {
        error!("no destinations enabled; nothing to replicate to");
        return EXIT_CONFIG;
    }

    if !config.source.cdc_directory.exists() {
        error!(
            directory = %config.source.cdc_directory.display(),
            "source cdc directory unreachable"
        );
        return EXIT_SOURCE;
    }

    match replicate(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "pipeline failed");
            EXIT_INTERNAL
        }
    }
}

async fn replicate(config: ReplicatorConfig) -> anyhow::Result<i32> {
    info!(
        destinations = config.enabled_destination_count(),
        tables = config.source.tables.len(),
        "starting cassflow"
    );

    // Destination sinks. Relational pools carry one connection per worker
    // plus headroom for the health prober and DDL.
    let pool_size = config.workers_per_destination + 1;
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if config.destinations.postgres.enabled {
        sinks.push(Arc::new(PostgresSink::new(
            config.destinations.postgres.clone(),
            pool_size,
        )));
    }
    if config.destinations.clickhouse.enabled {
        sinks.push(Arc::new(ClickhouseSink::new(
            config.destinations.clickhouse.clone(),
        )));
    }
    if config.destinations.timescaledb.enabled {
        sinks.push(Arc::new(TimescaleSink::new(
            config.destinations.timescaledb.clone(),
            pool_size,
        )));
    }
    for sink in &sinks {
        sink.connect()
            .await
            .with_context(|| format!("connecting {}", sink.destination()))?;
    }

    // Offset recovery: every destination reports its committed offsets and
    // the reader resumes from the earliest one so no destination misses
    // events.
    let offsets = Arc::new(OffsetManager::new());
    for sink in &sinks {
        for offset in sink
            .load_offsets()
            .await
            .with_context(|| format!("loading offsets from {}", sink.destination()))?
        {
            offsets.seed(offset).await;
        }
    }
    let resume = offsets.min_position().await;
    let resume_label = resume
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "oldest".into());
    info!(resume = %resume_label, "resolved resume position");

    let dlq = Arc::new(DlqWriter::new(config.dlq.directory.clone()).await?);
    let masking = Arc::new(MaskingRules::from_config(&config.masking));
    let metrics = MetricsRegistry::new();
    let health_state = HealthState::new();

    // Stop watch: phase one of shutdown stops the reader, the monitor, and
    // the HTTP listener; the pipeline handle owns the sender.
    let (stop_tx, stop_rx) = watch::channel(false);

    // Schema monitor.
    let catalog = Arc::new(JsonFileCatalog::new(config.source.catalog_directory.clone()));
    let monitor = SchemaMonitor::new(
        catalog,
        config.source.tables.clone(),
        Duration::from_millis(config.schema_poll_interval_ms),
    );
    let schema_cache = monitor.cache();
    let (schema_tx, schema_rx) = mpsc::channel(16);
    tokio::spawn(monitor.run(schema_tx, stop_rx.clone()));

    // Commit-log reader.
    let mut reader_config = ReaderConfig::new(config.source.cdc_directory.clone());
    reader_config.poll_interval = Duration::from_millis(config.source.poll_interval_ms);
    reader_config.tables = config.source.tables.clone();
    reader_config.queue_capacity = config.batch.batch_size * 4;
    let reader_rx = CommitLogReader::new(reader_config).open(resume, stop_rx.clone());

    // Observability listener.
    {
        let bind = config.http.bind.clone();
        let health_state = Arc::clone(&health_state);
        let metrics = Arc::clone(&metrics);
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&bind, health_state, metrics, stop_rx).await {
                warn!(error = %e, "observability listener stopped");
            }
        });
    }

    // The pipeline itself.
    let pipeline = Pipeline::new(
        PipelineConfig::from_config(&config),
        sinks,
        masking,
        schema_cache,
        offsets,
        dlq,
        metrics,
        health_state,
    );
    let handle = pipeline.start(reader_rx, schema_rx, stop_tx);

    // Run until a signal or a fatal pipeline failure.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut fatal = handle.fatal_watch();
    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            0
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            0
        }
        _ = fatal.changed() => {
            let message = fatal.borrow().clone().unwrap_or_default();
            error!(message = %message, "fatal pipeline failure");
            if message.starts_with("DLQ") {
                EXIT_FATAL_DLQ
            } else {
                EXIT_INTERNAL
            }
        }
    };

    let clean = handle.shutdown().await;
    if exit == 0 && !clean {
        warn!("shutdown deadline exceeded; unacknowledged events will replay on next start");
    }
    Ok(exit)
}
