use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use delta_stage::host::{self, JsonLinesCollector};
use delta_stage::{
    config, logger, server, AppResult, FieldTimeDeltaStage, LogBackend, MetricSink,
    PeriodicReporter, ReporterSettings,
};

/// How long the status endpoint may take to close its connections.
const STATUS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reads `[id, payload, metadata]` JSON lines from stdin, measures the time
/// between two payload timestamps, and writes every record to stdout.
#[derive(Debug, Parser)]
#[command(name = "delta-stage", version)]
struct Cli {
    /// Stage settings file (.toml or .json)
    #[arg(long, env = "DELTA_STAGE_CONFIG")]
    config: PathBuf,

    /// Overrides `topology-name`
    #[arg(long, env = "DELTA_STAGE_TOPOLOGY")]
    topology: Option<String>,

    /// Overrides `workers`
    #[arg(long)]
    workers: Option<u32>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    logger::init_logging(cli.verbose);

    // ── 1. Resolve configuration ─────────────────────────────────
    let mut settings = config::load_settings(&cli.config)?;
    if let Some(topology) = cli.topology {
        settings.topology_name = Some(topology);
    }
    if let Some(workers) = cli.workers {
        settings.workers = workers;
    }
    let config = settings.validate()?;

    // ── 2. Build the stage ───────────────────────────────────────
    let sink = Arc::new(MetricSink::new());
    let stage = Arc::new(FieldTimeDeltaStage::new(&config, sink.clone()));
    info!(
        namespace = %config.namespace,
        metric = stage.metric_name(),
        unit = %config.time_unit,
        "stage prepared"
    );

    // ── 3. Start the reporter ────────────────────────────────────
    let mut reporter = PeriodicReporter::new(
        ReporterSettings::from_config(&config),
        sink.view(),
        Box::new(LogBackend::new(config.region.clone())),
    );
    reporter.start(config.report_interval)?;

    // ── 4. Optional status endpoint ──────────────────────────────
    let shutdown = CancellationToken::new();
    let status = match config.status_listen {
        Some(addr) => Some(server::spawn(addr, sink.view(), shutdown.clone()).await?),
        None => None,
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    // ── 5. Process stdin until EOF or Ctrl-C ─────────────────────
    let (collector, writer) = JsonLinesCollector::spawn(std::io::stdout());
    let collector = Arc::new(collector);
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let stats = host::run(
        input,
        stage,
        collector.clone(),
        config.workers,
        shutdown.clone(),
    )
    .await;

    // ── 6. Shut down ─────────────────────────────────────────────
    shutdown.cancel();
    reporter.stop().await;

    if let Some(mut handle) = status {
        if tokio::time::timeout(STATUS_SHUTDOWN_GRACE, &mut handle)
            .await
            .is_err()
        {
            warn!("status endpoint did not close in time, aborting");
            handle.abort();
        }
    }

    info!(
        received = stats.received,
        rejected = stats.rejected,
        emitted = collector.emitted(),
        acked = collector.acked(),
        "stage finished"
    );

    // the writer exits once the last collector handle is gone
    drop(collector);
    if let Err(err) = writer.await {
        error!(error = %err, "output writer ended abnormally");
    }
    Ok(())
}
