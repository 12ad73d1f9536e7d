use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

use crate::SentimentError;
use crate::config::{Architecture, Config, PredictParams, compute_device};
use crate::data::LabeledCorpus;
use crate::evaluation::{BinaryMetrics, ConfusionMatrix, to_labels};
use crate::io::results::write_predictions;
use crate::io::safetensors::{load_weights, read_metadata};
use crate::io::{Fetched, GcsClient, StorageUri, fetch, put_file, remove_path};
use crate::model::{self, SentimentClassifier};
use crate::tokenizer::{TokenizerDetails, pad_sequence, pad_sequences};
use crate::training::trainer::TOKENIZER_FILE;

/// Summary of a scoring run
#[derive(Debug, Clone)]
pub struct PredictionRun {
    pub result_path: String,
    pub predictions: usize,
    pub positives: usize,
    pub metrics: Option<BinaryMetrics>,
}

/// Scores a table of reviews with a trained classifier
pub struct Predictor {
    params: PredictParams,
    details: TokenizerDetails,
    model: Box<dyn SentimentClassifier>,
    device: Device,
    gcs: Option<GcsClient>,
    downloaded: Vec<PathBuf>,
}

fn ensure_csv(result_path: &str) -> Result<()> {
    if !result_path.ends_with(".csv") {
        return Err(SentimentError::Config(format!(
            "result_path must point to a .csv file, got {}",
            result_path
        ))
        .into());
    }
    Ok(())
}

impl Predictor {
    /// Load the tokenizer and weights named by `predict_params`
    pub fn new(config: &Config) -> Result<Self> {
        let params = config.predict_params()?.clone();
        let architecture = config.model_params()?.model;
        ensure_csv(&params.result_path)?;
        fs::create_dir_all(&params.work_dir)?;

        let remote = [&params.data_path, &params.result_path, &params.model_path, &params.tokenizer_path]
            .iter()
            .any(|p| StorageUri::is_remote(p));
        let gcs = if remote { Some(GcsClient::from_env()?) } else { None };

        let mut predictor_downloads = Vec::new();
        let mut fetch_tracked = |location: &str| -> Result<PathBuf> {
            let Fetched { path, downloaded } = fetch(location, &params.work_dir, gcs.as_ref())?;
            if downloaded {
                predictor_downloads.push(path.clone());
            }
            Ok(path)
        };

        let mut tokenizer_path = fetch_tracked(&params.tokenizer_path)?;
        if tokenizer_path.is_dir() {
            tokenizer_path = tokenizer_path.join(TOKENIZER_FILE);
        }
        let details = TokenizerDetails::load(&tokenizer_path)?;

        let weights_path = fetch_tracked(&params.model_path)?;
        let (model, device) = Self::load_model(architecture, &details, &weights_path)?;

        Ok(Self {
            params,
            details,
            model,
            device,
            gcs,
            downloaded: predictor_downloads,
        })
    }

    fn load_model(
        architecture: Architecture,
        details: &TokenizerDetails,
        weights_path: &Path,
    ) -> Result<(Box<dyn SentimentClassifier>, Device)> {
        let metadata = read_metadata(weights_path)?;
        if metadata.architecture != architecture {
            return Err(SentimentError::Config(format!(
                "{} holds a {} model but model_params.model is {}",
                weights_path.display(),
                metadata.architecture,
                architecture
            ))
            .into());
        }
        if metadata.dims.max_sequence_length != details.max_sequence_length {
            return Err(SentimentError::Config(format!(
                "model expects sequences of {} tokens but the tokenizer pads to {}",
                metadata.dims.max_sequence_length, details.max_sequence_length
            ))
            .into());
        }

        if metadata.dims.num_features != details.num_features() {
            return Err(SentimentError::Config(format!(
                "model was trained on {} features but the tokenizer yields {}",
                metadata.dims.num_features,
                details.num_features()
            ))
            .into());
        }

        let device = compute_device().context("Failed to initialize compute device")?;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = model::build(architecture, &metadata.dims, vb)?;
        load_weights(&mut varmap, weights_path)?;
        log::info!(
            "Loaded {} model ({} features, created {})",
            architecture,
            metadata.dims.num_features,
            metadata.created
        );
        Ok((model, device))
    }

    pub fn architecture(&self) -> Architecture {
        self.model.architecture()
    }

    pub fn tokenizer(&self) -> &TokenizerDetails {
        &self.details
    }

    /// Positive-class probabilities for sequences already padded to `max_sequence_length`
    pub fn predict_proba(&self, sequences: &[Vec<u32>]) -> Result<Vec<f32>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let seq_len = self.details.max_sequence_length;
        let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(flat, (sequences.len(), seq_len), &self.device)?;
        Ok(self.model.predict_proba(&ids)?.to_vec1()?)
    }

    /// Label one token sequence: 1 when the probability exceeds 0.5
    pub fn predict(&self, sequence: &[u32]) -> Result<u8> {
        let padded = pad_sequence(sequence, self.details.max_sequence_length);
        let probs = self.predict_proba(&[padded])?;
        Ok(to_labels(&probs)[0])
    }

    /// Label raw texts
    pub fn predict_texts<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Result<Vec<u8>> {
        let sequences = pad_sequences(
            &self.details.tokenizer.texts_to_sequences(texts),
            self.details.max_sequence_length,
        );
        let mut probs = Vec::with_capacity(sequences.len());
        for chunk in sequences.chunks(self.params.batch_size) {
            probs.extend(self.predict_proba(chunk)?);
        }
        Ok(to_labels(&probs))
    }

    /// Score `data_path`, write the results table and report metrics when labels exist
    pub fn run(&mut self) -> Result<PredictionRun> {
        println!("\n{}", format!("Scoring with {} model...", self.architecture()).bright_cyan());

        println!("\n{}", "[Step 1/3] Loading data".bright_green());
        let data = fetch(&self.params.data_path, &self.params.work_dir, self.gcs.as_ref())?;
        if data.downloaded {
            self.downloaded.push(data.path.clone());
        }
        let corpus = LabeledCorpus::read(&data.path)?;
        log::info!("Read {} rows from {}", corpus.len(), self.params.data_path);

        println!("\n{}", "[Step 2/3] Predicting".bright_green());
        let sequences = pad_sequences(
            &self.details.tokenizer.texts_to_sequences(&corpus.texts()),
            self.details.max_sequence_length,
        );
        let pb = ProgressBar::new(sequences.len().div_ceil(self.params.batch_size) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches | ETA: {eta}")
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        let mut probs = Vec::with_capacity(sequences.len());
        for chunk in sequences.chunks(self.params.batch_size) {
            probs.extend(self.predict_proba(chunk)?);
            pb.inc(1);
        }
        pb.finish_and_clear();
        let predictions = to_labels(&probs);

        println!("\n{}", "[Step 3/3] Writing results".bright_green());
        let result_uri = StorageUri::parse(&self.params.result_path)?;
        let local_result = match &result_uri {
            StorageUri::Local(path) => path.clone(),
            remote => {
                let name = remote.file_name().unwrap_or_else(|| "results.csv".to_string());
                let path = self.params.work_dir.join(name);
                self.downloaded.push(path.clone());
                path
            }
        };
        write_predictions(&corpus, &predictions, &local_result)?;
        if matches!(result_uri, StorageUri::Gcs { .. }) {
            put_file(&local_result, &self.params.result_path, self.gcs.as_ref())
                .context("Failed to upload results")?;
        }
        println!("{} {}", "Results written to".bright_cyan(), self.params.result_path);

        let metrics = match corpus.labels()? {
            Some(labels) => {
                let metrics = ConfusionMatrix::from_labels(&labels, &predictions).metrics();
                for (key, value) in metrics.report() {
                    log::info!("{}: {:.4}", key, value);
                }
                Some(metrics)
            }
            None => {
                log::warn!("No `labels` column in {}, skipping metrics", self.params.data_path);
                None
            }
        };

        Ok(PredictionRun {
            result_path: self.params.result_path.clone(),
            predictions: predictions.len(),
            positives: predictions.iter().filter(|&&p| p == 1).count(),
            metrics,
        })
    }

    /// Remove every local copy this predictor downloaded
    pub fn clean_up(&mut self) -> Result<()> {
        for path in self.downloaded.drain(..) {
            remove_path(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::safetensors::{WeightMetadata, save_weights};
    use crate::model::ModelDims;
    use crate::tokenizer::WordTokenizer;

    struct Fixture {
        dir: tempfile::TempDir,
        weights: PathBuf,
        tokenizer: PathBuf,
    }

    fn fixture(arch: Architecture) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut tokenizer = WordTokenizer::new(Some(30));
        tokenizer.fit_on_texts(&["good great fine", "bad awful poor"]);
        let details = TokenizerDetails::new(tokenizer, 30, 6);
        let tokenizer_path = dir.path().join("parser_output").join(TOKENIZER_FILE);
        details.save(&tokenizer_path).unwrap();

        let dims = ModelDims {
            num_features: details.num_features(),
            max_sequence_length: 6,
            embedding_dim: 4,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        model::build(arch, &dims, vb).unwrap();
        let weights = dir.path().join("model.safetensors");
        save_weights(&varmap, &weights, &WeightMetadata::new(arch, dims)).unwrap();

        Fixture {
            dir,
            weights,
            tokenizer: tokenizer_path,
        }
    }

    fn config(fx: &Fixture, arch: &str, data: &Path, result: &str) -> Config {
        let yaml = format!(
            "model_params:\n  model: {}\npredict_params:\n  data_path: {}\n  result_path: {}\n  model_path: {}\n  tokenizer_path: {}\n  batch_size: 2\n  work_dir: {}\n",
            arch,
            data.display(),
            result,
            fx.weights.display(),
            fx.tokenizer.parent().unwrap().display(),
            fx.dir.path().display()
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn test_run_writes_predictions_and_metrics() {
        let fx = fixture(Architecture::Hybrid);
        let data = fx.dir.path().join("test.csv");
        fs::write(&data, "input,labels\ngood great,1\nbad awful,0\nfine,1\n").unwrap();
        let result = fx.dir.path().join("out").join("results.csv");

        let mut predictor = Predictor::new(&config(&fx, "Hybrid", &data, result.to_str().unwrap())).unwrap();
        let run = predictor.run().unwrap();

        assert_eq!(run.predictions, 3);
        assert!(run.metrics.is_some());
        let written = fs::read_to_string(&result).unwrap();
        assert!(written.starts_with("input,labels,predictions\n"));
        assert_eq!(written.lines().count(), 4);

        predictor.clean_up().unwrap();
        assert!(data.is_file());
    }

    #[test]
    fn test_unlabelled_input_skips_metrics() {
        let fx = fixture(Architecture::Cnn);
        let data = fx.dir.path().join("test.csv");
        fs::write(&data, "input\ngood\n").unwrap();
        let result = fx.dir.path().join("results.csv");
        let mut predictor = Predictor::new(&config(&fx, "CNN", &data, result.to_str().unwrap())).unwrap();
        let run = predictor.run().unwrap();
        assert!(run.metrics.is_none());
    }

    #[test]
    fn test_result_path_must_be_csv() {
        let fx = fixture(Architecture::Cnn);
        let data = fx.dir.path().join("missing.csv");
        let err = Predictor::new(&config(&fx, "CNN", &data, "out/results.parquet"))
            .err()
            .unwrap();
        assert!(err.to_string().contains(".csv"));
    }

    #[test]
    fn test_architecture_mismatch() {
        let fx = fixture(Architecture::Lstm);
        let data = fx.dir.path().join("test.csv");
        let result = fx.dir.path().join("results.csv");
        let err = Predictor::new(&config(&fx, "CNN", &data, result.to_str().unwrap()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("LSTM"));
    }

    #[test]
    fn test_predict_single_sequence_and_texts() {
        let fx = fixture(Architecture::Cnn);
        let data = fx.dir.path().join("test.csv");
        let result = fx.dir.path().join("results.csv");
        let predictor = Predictor::new(&config(&fx, "CNN", &data, result.to_str().unwrap())).unwrap();

        let label = predictor.predict(&[1, 2, 3]).unwrap();
        assert!(label <= 1);
        let labels = predictor.predict_texts(&["good great", "bad", "unseen words only"]).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(predictor.predict_proba(&[]).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn test_tokenizer_vocabulary_mismatch() {
        let fx = fixture(Architecture::Cnn);
        let dims = ModelDims {
            num_features: 3,
            max_sequence_length: 6,
            embedding_dim: 4,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        model::build(Architecture::Cnn, &dims, vb).unwrap();
        save_weights(&varmap, &fx.weights, &WeightMetadata::new(Architecture::Cnn, dims)).unwrap();

        let data = fx.dir.path().join("test.csv");
        let result = fx.dir.path().join("results.csv");
        let err = Predictor::new(&config(&fx, "CNN", &data, result.to_str().unwrap()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("features"));
    }
}
