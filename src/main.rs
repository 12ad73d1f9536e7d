use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use review_sentiment::io::read_text;
use review_sentiment::training::{self, TrainOutcome};
use review_sentiment::{Config, Predictor, Trainer};

#[derive(Parser)]
#[command(
    name = "review-sentiment",
    version,
    about = "Train and run binary sentiment classifiers for product reviews",
    long_about = "review-sentiment - train CNN, LSTM or Hybrid sentiment models and score review tables\n\
                  \n\
                  Examples:\n\
                    # Train from a local config\n\
                    review-sentiment train --config config.yaml\n\
                    \n\
                    # Score a table with a trained model\n\
                    review-sentiment predict --config predict.yaml\n\
                    \n\
                    # Managed training job with a config stored in Cloud Storage\n\
                    review-sentiment job --train-config gs://bucket/configs/train.yaml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train {
        /// Path or gs:// URI of the YAML config
        #[arg(short, long)]
        config: String,
    },

    /// Score a table of reviews with a trained model
    Predict {
        /// Path or gs:// URI of the YAML config
        #[arg(short, long)]
        config: String,
    },

    /// Copy a training config into the working directory, then train
    Job {
        /// Path or gs:// URI of the YAML config
        #[arg(long)]
        train_config: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", "Review Sentiment - product review classifiers".bright_white().bold());
    println!("{}", format!("Version {} - Rust + Candle Edition", env!("CARGO_PKG_VERSION")).bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    match cli.command {
        Commands::Train { config } => {
            let config = load_config(&config)?;
            run_training(&config)
        }
        Commands::Predict { config } => {
            let config = load_config(&config)?;
            run_prediction(&config)
        }
        Commands::Job { train_config } => {
            let config = training::stage_config(&train_config, None)?;
            run_training(&config)
        }
    }
}

/// Read a config from a local path or a `gs://` object
fn load_config(location: &str) -> Result<Config> {
    let text = read_text(location, None)?;
    Config::from_yaml_str(&text).with_context(|| format!("Failed to load config {}", location))
}

fn run_training(config: &Config) -> Result<()> {
    let train_params = config.train_params()?;
    let mut trainer = match Trainer::new(config) {
        Ok(trainer) => trainer,
        Err(e) => {
            if let Err(clean_err) = training::clean_up(&train_params.work_dir, &train_params.data_dir) {
                log::warn!("Clean-up failed: {:#}", clean_err);
            }
            return Err(e);
        }
    };

    let result = trainer.train();
    if let Err(clean_err) = trainer.clean_up() {
        log::warn!("Clean-up failed: {:#}", clean_err);
    }
    let outcome = result?;
    print_training_summary(&outcome);
    Ok(())
}

fn print_training_summary(outcome: &TrainOutcome) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Training complete!".bright_green().bold());
    println!("Run directory: {}", outcome.run_dir);
    println!("Model: {}", outcome.model_file);
    if let Some(last) = outcome.report.last() {
        for (key, value) in last.iter().filter(|(k, _)| k.starts_with("val_")) {
            println!("{}: {:.4}", key, value);
        }
    }
    println!("Training time: {:.1}s", outcome.training_time_seconds);
    println!("{}", "=".repeat(60).bright_blue());
}

fn run_prediction(config: &Config) -> Result<()> {
    let mut predictor = Predictor::new(config)?;
    let result = predictor.run();
    if let Err(clean_err) = predictor.clean_up() {
        log::warn!("Clean-up failed: {:#}", clean_err);
    }
    let run = result?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Prediction complete!".bright_green().bold());
    println!(
        "Scored {} reviews ({} positive) -> {}",
        run.predictions, run.positives, run.result_path
    );
    if let Some(metrics) = run.metrics {
        for (key, value) in metrics.report() {
            println!("{}: {:.4}", key, value);
        }
    }
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}
