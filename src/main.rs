use std::fs;
use std::path::PathBuf;

use anomaly_scoring::{EngineConfig, ScoringEngine};
use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "anomaly-scoring")]
#[command(version = "0.1.0")]
#[command(about = "Isolation-forest anomaly scoring for numeric series", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on the given values, or on the fallback dataset when omitted
    Train {
        /// Comma-separated training values
        #[arg(short, long, value_delimiter = ',', allow_negative_numbers = true)]
        values: Option<Vec<f64>>,

        /// Expected outlier fraction in (0, 0.5]
        #[arg(long)]
        contamination: Option<f64>,
    },

    /// Score one series against the trained model
    Predict {
        /// Comma-separated values to score
        #[arg(short, long, value_delimiter = ',', allow_negative_numbers = true, required = true)]
        values: Vec<f64>,
    },

    /// Score every sequence in a JSON file holding an array of arrays
    PredictBatch {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show the current model state
    Info,

    /// Train on synthetic data and score a few sample series
    Demo,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    init_tracing(cli.debug, &config.logging.level);

    let engine = ScoringEngine::new(&config)?;
    // Unreadable blobs must not block `train`, which is what replaces them.
    if let Err(e) = engine.restore() {
        error!(error = %e, "failed to restore persisted model, starting untrained");
    }
    let contamination_default = config.training.default_contamination;

    match cli.command {
        Commands::Train {
            values,
            contamination,
        } => {
            let summary = engine.train(
                values.as_deref(),
                contamination.unwrap_or(contamination_default),
            )?;
            print_json(&summary)?;
        }

        Commands::Predict { values } => {
            let prediction = engine.predict(&values)?;
            print_json(&serde_json::json!({
                "scores": prediction.scores,
                "labels": prediction.labels,
                "anomaly_count": prediction.anomaly_count(),
                "statistics": prediction.score_stats(),
            }))?;
        }

        Commands::PredictBatch { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let sequences: Vec<Vec<f64>> = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            let batch = engine.predict_batch(&sequences)?;
            print_json(&keyed_batch(&batch))?;
        }

        Commands::Info => {
            print_json(&engine.get_model_info())?;
        }

        Commands::Demo => run_demo(&engine, contamination_default)?,
    }

    Ok(())
}

fn init_tracing(debug: bool, level: &str) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    // Logs go to stderr so stdout stays valid JSON.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn keyed_batch(batch: &anomaly_scoring::BatchResult) -> serde_json::Map<String, serde_json::Value> {
    batch
        .keyed()
        .into_iter()
        .map(|(key, sequence)| {
            let value = serde_json::json!({
                "scores": sequence.scores,
                "labels": sequence.labels,
                "anomaly_count": sequence.anomaly_count,
                "is_anomalous": sequence.is_anomalous,
            });
            (key, value)
        })
        .collect()
}

/// Approximately normal draw (Irwin-Hall, 12 uniforms).
fn normal(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    let z: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
    mean + std_dev * z
}

fn run_demo(engine: &ScoringEngine, contamination: f64) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut training: Vec<f64> = (0..100).map(|_| normal(&mut rng, 50.0, 5.0)).collect();
    training.extend((0..10).map(|_| normal(&mut rng, 10.0, 2.0)));

    info!(points = training.len(), "demo: training on synthetic data");
    let summary = engine.train(Some(training.as_slice()), contamination)?;
    print_json(&summary)?;

    let test_series = [45.0, 50.0, 55.0, 5.0, 48.0, 52.0, 100.0, 51.0];
    let prediction = engine.predict(&test_series)?;
    let flagged: Vec<f64> = test_series
        .iter()
        .zip(&prediction.labels)
        .filter(|(_, label)| **label == 1)
        .map(|(&value, _)| value)
        .collect();
    print_json(&serde_json::json!({
        "series": test_series,
        "scores": prediction.scores,
        "labels": prediction.labels,
        "anomalous_values": flagged,
    }))?;

    let sequences = vec![
        vec![48.0, 50.0, 52.0, 49.0, 51.0],
        vec![50.0, 5.0, 50.0, 95.0, 50.0],
        vec![47.0, 53.0, 50.0, 12.0],
    ];
    let batch = engine.predict_batch(&sequences)?;
    print_json(&keyed_batch(&batch))?;

    print_json(&engine.get_model_info())?;
    Ok(())
}
