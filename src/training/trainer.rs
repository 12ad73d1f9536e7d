use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use chrono::Local;
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::callbacks::{CHECKPOINT_DIR, build_callbacks};
use super::fit::{FitOptions, FitReport, fit};
use super::optimizer::TrainOptimizer;
use crate::config::{Config, MODEL_NAME, ModelParams, TrainParams, compute_device};
use crate::data::archive::TRAIN_VAL_ARCHIVE;
use crate::data::{LabeledCorpus, SequenceDataset, SplitFiles, extract_zip};
use crate::io::safetensors::{WeightMetadata, save_weights};
use crate::io::{
    ArtifactStore, CloudStore, GcsClient, LocalStore, StorageUri, TransferMode, fetch, read_text, remove_path,
};
use crate::model::{self, ModelDims};
use crate::tokenizer::{TokenizerDetails, WordTokenizer, pad_sequences};

/// Scratch directory holding the tokenizer artifacts
pub const PARSER_OUTPUT_DIR: &str = "parser_output";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WORD_INDEX_FILE: &str = "word_index.txt";
/// Scratch directory holding the final weights
pub const TRAINED_MODEL_DIR: &str = "trained_model";
pub const CONFIG_FILE: &str = "config.yaml";

/// Tokenized and padded splits ready for training
pub struct Prepared {
    pub x_train: Vec<Vec<u32>>,
    pub y_train: Vec<u8>,
    pub x_val: Vec<Vec<u32>>,
    pub y_val: Vec<u8>,
}

/// What a finished training run produced
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub run_dir: String,
    pub model_file: String,
    pub report: FitReport,
    pub training_time_seconds: f64,
}

/// Runs the fetch, preprocess, train and publish pipeline for one config
pub struct Trainer {
    train_params: TrainParams,
    model_params: ModelParams,
    run_dir: String,
    store: Arc<dyn ArtifactStore>,
    gcs: Option<Arc<GcsClient>>,
    details: TokenizerDetails,
    device: Device,
}

impl Trainer {
    pub fn new(config: &Config) -> Result<Self> {
        let train_params = config.train_params()?.clone();
        let model_params = config.model_params()?.clone();

        let run_name = format!(
            "{}_{}",
            model_params.model,
            Local::now().format("%Y_%m_%d-%H:%M:%S")
        );
        let run_dir = StorageUri::parse(&train_params.output_dir)?.join(&run_name).to_string();

        let bucket = StorageUri::bucket_of(&train_params.output_dir)
            .or_else(|| StorageUri::bucket_of(&train_params.data_dir));
        let gcs = match bucket {
            Some(_) => Some(Arc::new(GcsClient::from_env()?)),
            None => None,
        };
        let store: Arc<dyn ArtifactStore> = match (bucket, &gcs) {
            (Some(bucket), Some(client)) => Arc::new(CloudStore::new(client.clone(), bucket)),
            _ => Arc::new(LocalStore),
        };
        log::info!("Writing run artifacts to {} ({})", run_dir, store.describe());

        let device = compute_device().context("Failed to initialize compute device")?;
        let details = TokenizerDetails::new(
            WordTokenizer::new(Some(train_params.top_k)),
            train_params.top_k,
            train_params.max_sequence_length,
        );

        Ok(Self {
            train_params,
            model_params,
            run_dir,
            store,
            gcs,
            details,
            device,
        })
    }

    pub fn run_dir(&self) -> &str {
        &self.run_dir
    }

    pub fn tokenizer(&self) -> &TokenizerDetails {
        &self.details
    }

    fn work_dir(&self) -> &Path {
        &self.train_params.work_dir
    }

    /// Make `train_text.csv.gz` and `val_text.csv.gz` available locally
    pub fn load_data(&self) -> Result<SplitFiles> {
        let work_dir = self.work_dir();
        fs::create_dir_all(work_dir)?;
        let data_dir = &self.train_params.data_dir;

        if StorageUri::is_remote(data_dir) {
            let archive_uri = StorageUri::parse(data_dir)?.join(TRAIN_VAL_ARCHIVE).to_string();
            let fetched = fetch(&archive_uri, work_dir, self.gcs.as_deref())?;
            extract_zip(&fetched.path, work_dir)?;
            remove_path(&fetched.path)?;
            return SplitFiles::locate(work_dir);
        }

        let local = Path::new(data_dir);
        let archive = local.join(TRAIN_VAL_ARCHIVE);
        if archive.is_file() {
            extract_zip(&archive, work_dir)?;
            SplitFiles::locate(work_dir)
        } else {
            SplitFiles::locate(local)
        }
    }

    fn preprocessing_pool(&self) -> Result<rayon::ThreadPool> {
        let threads = if self.train_params.use_multiprocessing {
            self.train_params.workers.max(1)
        } else {
            1
        };
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("Failed to build preprocessing thread pool")
    }

    /// Fit the tokenizer on both splits, then convert and pad them
    pub fn preprocess(&mut self, files: &SplitFiles) -> Result<Prepared> {
        let train = LabeledCorpus::read(&files.train)?;
        let val = LabeledCorpus::read(&files.val)?;
        let y_train = train.require_labels()?;
        let y_val = val.require_labels()?;

        let train_texts = train.texts();
        let val_texts = val.texts();
        let all_texts: Vec<&str> = train_texts.iter().chain(val_texts.iter()).copied().collect();

        let top_k = self.train_params.top_k;
        let maxlen = self.train_params.max_sequence_length;
        let mut tokenizer = WordTokenizer::new(Some(top_k));
        tokenizer.fit_on_texts(&all_texts);
        log::info!("Fitted tokenizer on {} texts, {} distinct words", all_texts.len(), tokenizer.vocab_len());

        let pool = self.preprocessing_pool()?;
        let (x_train, x_val) = pool.install(|| {
            (
                pad_sequences(&tokenizer.texts_to_sequences(&train_texts), maxlen),
                pad_sequences(&tokenizer.texts_to_sequences(&val_texts), maxlen),
            )
        });

        self.details = TokenizerDetails::new(tokenizer, top_k, maxlen);
        let parser_dir = self.work_dir().join(PARSER_OUTPUT_DIR);
        fs::create_dir_all(&parser_dir)?;
        let written = self.details.write_word_index(parser_dir.join(WORD_INDEX_FILE))?;
        log::info!("Wrote {} entries to {}", written, WORD_INDEX_FILE);

        Ok(Prepared {
            x_train,
            y_train,
            x_val,
            y_val,
        })
    }

    /// Persist the fitted tokenizer and publish `parser_output` to the run directory
    pub fn save_tokenizer(&self) -> Result<PathBuf> {
        let parser_dir = self.work_dir().join(PARSER_OUTPUT_DIR);
        let path = parser_dir.join(TOKENIZER_FILE);
        self.details.save(&path)?;
        self.store
            .write(&parser_dir, &self.run_dir, TransferMode::Copy)
            .context("Failed to publish tokenizer")?;
        Ok(path)
    }

    /// Run the whole pipeline and publish the weights and logs
    pub fn train(&mut self) -> Result<TrainOutcome> {
        let start_time = Instant::now();
        let arch = self.model_params.model;
        println!("\n{}", format!("Starting {} training run...", arch).bright_cyan());

        println!("\n{}", "[Step 1/5] Loading data".bright_green());
        let files = self.load_data().context("Failed to load training data")?;

        println!("\n{}", "[Step 2/5] Preprocessing".bright_green());
        let prepared = self.preprocess(&files).context("Failed to preprocess data")?;
        self.save_tokenizer()?;

        println!("\n{}", format!("[Step 3/5] Building {} model", arch).bright_green());
        let dims = ModelDims {
            num_features: self.details.num_features(),
            max_sequence_length: self.details.max_sequence_length,
            embedding_dim: self.model_params.embedding_dim,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = model::build(arch, &dims, vb).context("Failed to build model")?;
        model::log_summary(model.as_ref(), &dims, &varmap);
        let metadata = WeightMetadata::new(arch, dims);

        println!("\n{}", "[Step 4/5] Training model".bright_green());
        let seq_len = dims.max_sequence_length;
        let train_set = SequenceDataset::new(&prepared.x_train, &prepared.y_train, seq_len, &self.device)?;
        let val_set = SequenceDataset::new(&prepared.x_val, &prepared.y_val, seq_len, &self.device)?;

        let checkpoint_dir = self.work_dir().join(CHECKPOINT_DIR);
        remove_path(&checkpoint_dir)?;
        fs::create_dir_all(&checkpoint_dir)?;
        let mut callbacks = build_callbacks(
            &self.train_params.callbacks,
            arch,
            self.work_dir(),
            &self.run_dir,
            self.store.clone(),
        )?;
        log::info!("Callbacks: {:?}", callbacks.names());

        let mut optimizer = TrainOptimizer::new(
            self.model_params.optimizer,
            varmap.all_vars(),
            self.model_params.learning_rate,
        )
        .context("Failed to create optimizer")?;
        let options = FitOptions {
            epochs: self.train_params.num_epochs,
            batch_size: self.train_params.batch_size,
            steps_per_epoch: self.train_params.steps_per_epoch,
            seed: self.train_params.seed,
            metrics: self.model_params.metrics.clone(),
        };
        let report = fit(
            model.as_ref(),
            &varmap,
            &metadata,
            &mut optimizer,
            &train_set,
            &val_set,
            &options,
            &mut callbacks,
        )
        .context("Failed during model training")?;
        if report.stopped_early {
            log::info!("Training stopped early after {} epochs", report.history.len());
        }

        println!("\n{}", "[Step 5/5] Saving model".bright_green());
        let model_dir = self.work_dir().join(TRAINED_MODEL_DIR);
        let model_name = format!("{}_{}", arch, MODEL_NAME);
        save_weights(&varmap, model_dir.join(&model_name), &metadata)?;
        self.store
            .write(&model_dir, &self.run_dir, TransferMode::Move)
            .context("Failed to publish trained model")?;
        if let Some(csv_log) = callbacks.csv_log().filter(|p| p.is_file()) {
            self.store.write(csv_log, &self.run_dir, TransferMode::Move)?;
        }

        let model_file = StorageUri::parse(&self.run_dir)?
            .join(TRAINED_MODEL_DIR)
            .join(&model_name)
            .to_string();
        println!("{} {}", "Model written to".bright_cyan(), model_file);

        Ok(TrainOutcome {
            run_dir: self.run_dir.clone(),
            model_file,
            report,
            training_time_seconds: start_time.elapsed().as_secs_f64(),
        })
    }

    pub fn clean_up(&self) -> Result<()> {
        clean_up(self.work_dir(), &self.train_params.data_dir)
    }
}

/// Delete scratch artifacts from `work_dir`.
///
/// `*.csv.gz` files and `train_val.zip` are kept when `data_dir` is `work_dir` itself.
pub fn clean_up(work_dir: &Path, data_dir: &str) -> Result<()> {
    if !work_dir.is_dir() {
        return Ok(());
    }
    let data_is_work_dir = !StorageUri::is_remote(data_dir)
        && fs::canonicalize(data_dir).ok() == fs::canonicalize(work_dir).ok();

    for name in [CHECKPOINT_DIR, TRAINED_MODEL_DIR, PARSER_OUTPUT_DIR, "train_logs.csv", CONFIG_FILE] {
        remove_path(&work_dir.join(name))?;
    }
    if !data_is_work_dir {
        remove_path(&work_dir.join(TRAIN_VAL_ARCHIVE))?;
        for entry in fs::read_dir(work_dir)? {
            let path = entry?.path();
            if path.is_file() && path.to_string_lossy().ends_with(".csv.gz") {
                remove_path(&path)?;
            }
        }
    }
    log::info!("Cleaned up scratch files in {}", work_dir.display());
    Ok(())
}

/// Load the run config from `location` and leave a copy at `<work_dir>/config.yaml`
pub fn stage_config(location: &str, client: Option<&GcsClient>) -> Result<Config> {
    let text = read_text(location, client)?;
    let config = Config::from_yaml_str(&text).with_context(|| format!("Failed to load config {}", location))?;
    let work_dir = &config.train_params()?.work_dir;
    fs::create_dir_all(work_dir)?;

    let dest = work_dir.join(CONFIG_FILE);
    let same_file = match StorageUri::parse(location)? {
        StorageUri::Local(src) => dest.exists() && fs::canonicalize(&src)? == fs::canonicalize(&dest)?,
        StorageUri::Gcs { .. } => false,
    };
    if !same_file {
        fs::write(&dest, &text).with_context(|| format!("Failed to write {}", dest.display()))?;
        log::info!("Copied {} to {}", location, dest.display());
    }
    Ok(config)
}
