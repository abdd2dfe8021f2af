//! Command-line entry point: train and evaluate traffic-gnn models.

use std::fs;
use std::path::PathBuf;

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use traffic_gnn::config::ModelConfig;
use traffic_gnn::error::GnnResult;
use traffic_gnn::eval::{EvalOverrides, Evaluator};
use traffic_gnn::trainer::{TrainOptions, Trainer};

#[derive(Parser)]
#[command(
    name = "traffic-gnn",
    version,
    about = "Graph-attention recurrent network for traffic prediction"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a network's preprocessed runs
    Train {
        /// Network name under the data root
        net_name: String,
        /// Directory for params.json and checkpoints
        model_dir: PathBuf,
        #[arg(long, default_value = "data/networks")]
        data_root: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        val_split: Option<f32>,
        #[arg(long)]
        seed: Option<u64>,
        /// Hyperparameter record to start from instead of the defaults
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Evaluate the latest checkpoint in a model directory
    Eval {
        /// Network name under the data root
        net_name: String,
        /// Directory holding params.json and checkpoints
        model_dir: PathBuf,
        #[arg(long, default_value = "data/networks")]
        data_root: PathBuf,
        #[arg(short = 'b', long)]
        batch_size: Option<usize>,
        #[arg(short = 'v', long)]
        val_split: Option<f32>,
        #[arg(short = 's', long)]
        seed: Option<u64>,
    },
}

fn preprocessed_dir(data_root: &PathBuf, net_name: &str) -> PathBuf {
    data_root.join(net_name).join("preprocessed_data")
}

fn main() -> GnnResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train {
            net_name,
            model_dir,
            data_root,
            epochs,
            batch_size,
            val_split,
            seed,
            params,
        } => {
            let data_dir = preprocessed_dir(&data_root, &net_name);
            let mut config = match params {
                Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
                None => ModelConfig::default(),
            };
            if let Some(b) = batch_size {
                config.batch_size = b;
            }
            if let Some(s) = seed {
                config.seed = s;
            }
            let mut options = TrainOptions::default();
            if let Some(e) = epochs {
                options.epochs = e;
            }
            if let Some(v) = val_split {
                options.val_split = v;
            }

            info!(net = %net_name, data = %data_dir.display(), "starting training");
            let trainer = Trainer::new(config, options, Device::Cpu)?;
            let history = trainer.train(&data_dir, &model_dir)?;
            if let Some(last) = history.last() {
                info!(
                    epochs = history.len(),
                    val_loss = last.val_loss,
                    "training finished"
                );
            }
        }
        Commands::Eval {
            net_name,
            model_dir,
            data_root,
            batch_size,
            val_split,
            seed,
        } => {
            let data_dir = preprocessed_dir(&data_root, &net_name);
            let overrides = EvalOverrides {
                batch_size,
                val_split,
                seed,
            };
            let mut evaluator = Evaluator::new(&data_dir, &model_dir, &overrides, &Device::Cpu)?;
            let (report, _) = evaluator.run()?;
            for (target, metrics) in &report.targets {
                info!(
                    feature = %target,
                    mae = metrics.mae,
                    mse = metrics.mse,
                    huber = metrics.huber,
                    mape = metrics.mape,
                    "evaluation metrics"
                );
            }
        }
    }
    Ok(())
}
