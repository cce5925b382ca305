//! CLI entry point for the mobility fusion engine.
//!
//! Provides subcommands for replaying recorded source files into engine
//! state, training a congestion model from that state, serving forecasts,
//! and ranking route recommendations.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mobility_fusion::config::EngineConfig;
use mobility_fusion::engine::Engine;
use mobility_fusion::output::{append_forecast, print_json};
use mobility_fusion::replay::{FileReplaySource, ReplayStats, replay_into};
use mobility_fusion::routing::TransportMode;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "mobility_fusion")]
#[command(about = "Fuses urban mobility feeds into congestion forecasts and route rankings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded source files into engine state
    Ingest {
        /// JSONL record files to replay (.gz accepted)
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Engine config file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Engine state file to write after replay
        #[arg(short, long, default_value = "state/engine.json")]
        state: PathBuf,

        /// Maximum number of files replayed concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Train a congestion model from saved engine state
    Train {
        /// Engine state file produced by `ingest`
        #[arg(short, long, default_value = "state/engine.json")]
        state: PathBuf,

        /// Engine config file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the model artifact
        #[arg(short, long, default_value = "state/model.json")]
        output: PathBuf,
    },
    /// Forecast congestion for one segment or every known segment
    Forecast {
        /// Segment to forecast; omit to forecast every known segment
        #[arg(value_name = "SEGMENT_ID")]
        segment: Option<String>,

        /// Engine state file produced by `ingest`
        #[arg(short, long, default_value = "state/engine.json")]
        state: PathBuf,

        /// Engine config file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model artifact to serve from; baseline-only when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// CSV file to append forecast rows to
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Rank candidate routes between two points
    Recommend {
        /// Origin point id
        #[arg(value_name = "ORIGIN")]
        origin: String,

        /// Destination point id
        #[arg(value_name = "DESTINATION")]
        destination: String,

        /// Route catalog file (JSON)
        #[arg(short, long, default_value = "routes.json")]
        routes: PathBuf,

        /// Engine state file produced by `ingest`
        #[arg(short, long, default_value = "state/engine.json")]
        state: PathBuf,

        /// Engine config file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model artifact to serve from; baseline-only when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Restrict ranking to these modes, e.g. --modes metro,cycling
        #[arg(long, value_delimiter = ',')]
        modes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/mobility_fusion.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("mobility_fusion.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            files,
            config,
            state,
            concurrency,
        } => {
            ingest(files, config.as_deref(), &state, concurrency).await?;
        }
        Commands::Train {
            state,
            config,
            output,
        } => {
            let engine = load_engine(config.as_deref(), &state)?;
            let artifact = engine.train_model(&output)?;
            info!(
                model_version = artifact.model_version,
                training_samples = artifact.training_samples,
                "Training complete"
            );
        }
        Commands::Forecast {
            segment,
            state,
            config,
            model,
            csv,
        } => {
            let engine = load_engine(config.as_deref(), &state)?;
            if let Some(path) = model.as_deref() {
                engine.reload_model(path)?;
            }
            let engine = Arc::new(engine);

            let segments = match segment {
                Some(id) => vec![id],
                None => engine.traffic_segments(),
            };

            let mut results = Vec::with_capacity(segments.len());
            for id in &segments {
                let forecast = Arc::clone(&engine).get_forecast_with_timeout(id).await?;
                if let Some(csv_path) = csv.as_deref() {
                    append_forecast(csv_path, &forecast)?;
                }
                results.push(forecast);
            }
            print_json(&results)?;
        }
        Commands::Recommend {
            origin,
            destination,
            routes,
            state,
            config,
            model,
            modes,
        } => {
            let engine = load_engine(config.as_deref(), &state)?;
            if let Some(path) = model.as_deref() {
                engine.reload_model(path)?;
            }
            engine.load_catalog(&routes)?;

            let modes = modes
                .iter()
                .map(|m| m.parse::<TransportMode>())
                .collect::<Result<Vec<_>, _>>()?;

            let engine = Arc::new(engine);
            let response = engine
                .get_recommendations_with_timeout(&origin, &destination, &modes)
                .await?;
            print_json(&response)?;
        }
    }

    Ok(())
}

/// Builds an engine from config and restores saved state into it.
fn load_engine(config_path: Option<&Path>, state_path: &Path) -> Result<Engine> {
    let config = EngineConfig::load_or_default(config_path)?;
    let engine = Engine::new(config);
    engine.load_state(state_path)?;
    Ok(engine)
}

/// Replays every record file into a fresh engine, bounded by `concurrency`,
/// then saves the resulting state.
#[tracing::instrument(skip(files, config_path, state_path), fields(files = files.len(), concurrency))]
async fn ingest(
    files: Vec<PathBuf>,
    config_path: Option<&Path>,
    state_path: &Path,
    concurrency: usize,
) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let engine = Arc::new(Engine::new(config));

    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
    let mut tasks = vec![];

    for file in files {
        let sem = Arc::clone(&semaphore);
        let engine = Arc::clone(&engine);

        let file_span = tracing::info_span!("replay_file", file = %file.display());

        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire().await.unwrap();

                let source = FileReplaySource::new(&file);
                match replay_into(&engine, &source).await {
                    Ok(stats) => {
                        info!(
                            appended = stats.appended,
                            upgraded = stats.upgraded,
                            ignored_duplicates = stats.ignored_duplicates,
                            malformed = stats.malformed,
                            "File replayed"
                        );
                        Some(stats)
                    }
                    Err(e) => {
                        error!(error = %e, "File replay failed");
                        None
                    }
                }
            }
            .instrument(file_span),
        );

        tasks.push(task);
    }

    let mut totals = ReplayStats::default();
    let mut failed = 0usize;
    for task in tasks {
        match task.await {
            Ok(Some(stats)) => {
                totals.appended += stats.appended;
                totals.upgraded += stats.upgraded;
                totals.ignored_duplicates += stats.ignored_duplicates;
                totals.malformed += stats.malformed;
            }
            Ok(None) | Err(_) => failed += 1,
        }
    }

    if failed > 0 {
        warn!(failed, "Some record files could not be replayed");
    }
    info!(
        appended = totals.appended,
        upgraded = totals.upgraded,
        ignored_duplicates = totals.ignored_duplicates,
        malformed = totals.malformed,
        segments = engine.traffic_segments().len(),
        "Replay complete"
    );

    engine.save_state(state_path)?;
    Ok(())
}
