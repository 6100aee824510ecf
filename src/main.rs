mod consumer;
mod controller;
mod errors;
mod format;
mod report;
mod retry;
mod slot;
mod source;
mod stats;

use crate::consumer::{LogConsumer, SnapshotConsumer};
use crate::controller::{
    ControllerConfig, SamplingController, SessionOutcome,
};
use crate::errors::SpeedTestError;
use crate::report::TestReport;
use crate::source::multiprobe::{MultiProbeConfig, MultiProbeSource};
use crate::source::streaming::{StreamingConfig, StreamingSource};
use crate::source::MeasurementSource;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use log::info;
use std::sync::Arc;
use std::time::Duration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn long_version() -> &'static str {
    use std::sync::LazyLock;
    static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
        match option_env!("QWKSPD_BUILD_GIT_HASH") {
            Some(hash) => format!("{} (rev {})", VERSION, hash),
            None => VERSION.to_string(),
        }
    });
    LONG_VERSION.as_str()
}

/// Which measurement engine drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Phased engine with a continuously-converging aggregate.
    Streaming,
    /// Sequential one-shot probes against public endpoints.
    Multiprobe,
}

#[derive(Parser)]
#[command(author, version, long_version = long_version(), about, long_about = None)]
struct Cli {
    /// Measurement engine to drive
    #[arg(long, value_enum, default_value_t = Engine::Streaming)]
    engine: Engine,

    /// Poll period in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Consecutive identical samples that end the session
    #[arg(long, default_value_t = controller::DEFAULT_STABILITY_THRESHOLD)]
    stability_ticks: u32,

    /// Tick ceiling once upload activity is seen
    #[arg(long, default_value_t = controller::DEFAULT_MAX_TICKS)]
    max_ticks: u32,

    /// Emit the final report as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    match run(cli).await {
        Ok(()) => {}
        Err(error) => {
            eprintln!("{}", error.to_string().bright_red());
            std::process::exit(error.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<(), SpeedTestError> {
    let source: Arc<dyn MeasurementSource> = match cli.engine {
        Engine::Streaming => {
            Arc::new(StreamingSource::new(StreamingConfig::default())?)
        }
        Engine::Multiprobe => {
            Arc::new(MultiProbeSource::new(MultiProbeConfig::default())?)
        }
    };

    let config = ControllerConfig {
        poll_interval: Duration::from_millis(cli.interval_ms),
        stability_threshold: cli.stability_ticks,
        max_ticks: cli.max_ticks,
    };

    let mut sampler = SamplingController::new(config);
    let consumer: Arc<dyn SnapshotConsumer> = Arc::new(LogConsumer);
    let handle = sampler.start_session(Arc::clone(&source), consumer);

    tokio::select! {
        _ = handle.wait_finished() => {}
        _ = tokio::signal::ctrl_c() => {
            handle.dispose();
            info!("interrupted; session disposed");
            return Ok(());
        }
    }

    if let Some(error) = source.take_error() {
        return Err(error);
    }

    let outcome =
        handle.outcome().unwrap_or(SessionOutcome::SourceStopped);
    let snapshot =
        handle.take_result().unwrap_or_else(|| handle.snapshot());
    let report = TestReport::new(&snapshot, outcome);

    if cli.json {
        let json = report.to_json().map_err(|e| {
            SpeedTestError::new(
                errors::ErrorKind::Unknown,
                format!("failed to serialize report: {}", e),
            )
        })?;
        println!("{}", json);
    } else {
        report.print();
    }

    Ok(())
}
