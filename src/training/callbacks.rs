use anyhow::{Context, Result, bail};
use candle_nn::VarMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Architecture;
use crate::io::safetensors::{WeightMetadata, save_weights};
use crate::io::uri::join_key;
use crate::io::{ArtifactStore, TransferMode};

/// Metric name -> value for one epoch, sorted by name
pub type EpochLogs = BTreeMap<String, f64>;

/// Local directory that ModelCheckpoint writes into
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Mutable training state the callbacks may inspect or change
pub struct TrainingContext<'a> {
    pub varmap: &'a VarMap,
    pub metadata: &'a WeightMetadata,
    pub learning_rate: f64,
    pub stop_training: bool,
}

pub trait Callback {
    fn name(&self) -> &'static str;

    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        Ok(())
    }

    /// `epoch` is zero-based
    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()>;
}

/// Whether a monitored quantity should go down or up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    #[default]
    Auto,
    Min,
    Max,
}

/// Tracks the best value seen for one log key
#[derive(Debug, Clone)]
pub struct Monitor {
    key: String,
    maximize: bool,
    min_delta: f64,
    best: Option<f64>,
}

impl Monitor {
    pub fn new(key: &str, mode: MonitorMode, min_delta: f64) -> Self {
        let maximize = match mode {
            MonitorMode::Min => false,
            MonitorMode::Max => true,
            MonitorMode::Auto => ["acc", "precision", "recall", "f1"].iter().any(|m| key.contains(m)),
        };
        Self {
            key: key.to_string(),
            maximize,
            min_delta: min_delta.abs(),
            best: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Record `logs[key]`; returns `Some(improved)` or `None` when the key is absent
    pub fn update(&mut self, logs: &EpochLogs) -> Option<bool> {
        let value = *logs.get(&self.key)?;
        let improved = match self.best {
            None => true,
            Some(best) if self.maximize => value - self.min_delta > best,
            Some(best) => value + self.min_delta < best,
        };
        if improved {
            self.best = Some(value);
        }
        Some(improved)
    }
}

fn default_monitor() -> String {
    "val_loss".to_string()
}

/// Expand `{epoch}` (1-based, unpadded), `{epoch:02d}` and `{key:.4f}` placeholders in a file name
pub fn format_filename(template: &str, epoch: usize, logs: &EpochLogs) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let field = &rest[start + 1..start + len];
        let (name, spec) = field.split_once(':').unwrap_or((field, ""));
        if name == "epoch" {
            let width: usize = spec.trim_end_matches('d').parse().unwrap_or(0);
            out.push_str(&format!("{:0width$}", epoch + 1, width = width));
        } else if let Some(value) = logs.get(name) {
            let precision: usize = spec
                .trim_start_matches('.')
                .trim_end_matches('f')
                .parse()
                .unwrap_or(4);
            out.push_str(&format!("{:.prec$}", value, prec = precision));
        } else {
            out.push_str(&rest[start..=start + len]);
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCheckpointOptions {
    pub filepath: String,
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default)]
    pub save_best_only: bool,
    #[serde(default)]
    pub mode: MonitorMode,
}

/// Saves weights into the local checkpoint directory after each epoch
pub struct ModelCheckpoint {
    template: PathBuf,
    monitor: Monitor,
    save_best_only: bool,
}

impl ModelCheckpoint {
    pub fn new(options: ModelCheckpointOptions, architecture: Architecture, checkpoint_dir: &Path) -> Self {
        let mut filename = base_name(&options.filepath);
        for ext in [".hdf5", ".h5", ".keras"] {
            if let Some(stem) = filename.strip_suffix(ext) {
                filename = format!("{}.safetensors", stem);
            }
        }
        Self {
            template: checkpoint_dir.join(format!("{}_{}", architecture, filename)),
            monitor: Monitor::new(&options.monitor, options.mode, 0.0),
            save_best_only: options.save_best_only,
        }
    }

    pub fn template(&self) -> &Path {
        &self.template
    }
}

impl Callback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        let improved = self.monitor.update(logs);
        if self.save_best_only {
            match improved {
                Some(true) => {}
                Some(false) => return Ok(()),
                None => {
                    log::warn!("Can save best model only with {} available, skipping", self.monitor.key());
                    return Ok(());
                }
            }
        }
        let path = format_filename(&self.template.to_string_lossy(), epoch, logs);
        save_weights(ctx.varmap, &path, ctx.metadata)?;
        log::info!("Epoch {}: saved checkpoint to {}", epoch + 1, path);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvLoggerOptions {
    pub filename: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub append: bool,
}

fn default_separator() -> String {
    ",".to_string()
}

/// Appends one row of epoch logs per epoch to a CSV file
pub struct CsvLogger {
    path: PathBuf,
    delimiter: u8,
    append: bool,
    keys: Option<Vec<String>>,
}

impl CsvLogger {
    pub fn new(options: CsvLoggerOptions, work_dir: &Path) -> Result<Self> {
        let delimiter = match options.separator.as_bytes() {
            [byte] => *byte,
            _ => bail!("CSVLogger separator must be a single byte, got {:?}", options.separator),
        };
        Ok(Self {
            path: work_dir.join(base_name(&options.filename)),
            delimiter,
            append: options.append,
            keys: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Callback for CsvLogger {
    fn name(&self) -> &'static str {
        "CSVLogger"
    }

    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        if !self.append && self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        let write_header = !self.path.exists();
        let keys = self
            .keys
            .get_or_insert_with(|| logs.keys().cloned().collect())
            .clone();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(file);

        if write_header {
            let mut header = vec!["epoch".to_string()];
            header.extend(keys.iter().cloned());
            writer.write_record(&header)?;
        }

        let mut row = vec![epoch.to_string()];
        row.extend(keys.iter().map(|k| logs.get(k).map_or_else(String::new, |v| format!("{:.6}", v))));
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EarlyStoppingOptions {
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default)]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
    #[serde(default)]
    pub mode: MonitorMode,
}

/// Stops training after `patience` epochs without improvement
pub struct EarlyStopping {
    monitor: Monitor,
    patience: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(options: EarlyStoppingOptions) -> Self {
        Self {
            monitor: Monitor::new(&options.monitor, options.mode, options.min_delta),
            patience: options.patience,
            wait: 0,
        }
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &'static str {
        "EarlyStopping"
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        match self.monitor.update(logs) {
            Some(true) => self.wait = 0,
            Some(false) => {
                self.wait += 1;
                if self.wait >= self.patience {
                    log::info!("Epoch {}: early stopping on {}", epoch + 1, self.monitor.key());
                    ctx.stop_training = true;
                }
            }
            None => log::warn!("Early stopping conditioned on unavailable metric {}", self.monitor.key()),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReduceLrOptions {
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_lr_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub mode: MonitorMode,
}

fn default_factor() -> f64 {
    0.1
}

fn default_lr_patience() -> usize {
    10
}

/// Multiplies the learning rate by `factor` when the monitored value plateaus
pub struct ReduceLrOnPlateau {
    monitor: Monitor,
    factor: f64,
    patience: usize,
    min_lr: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(options: ReduceLrOptions) -> Result<Self> {
        if !(0.0..1.0).contains(&options.factor) {
            bail!("ReduceLROnPlateau factor must be in [0, 1), got {}", options.factor);
        }
        Ok(Self {
            monitor: Monitor::new(&options.monitor, options.mode, options.min_delta),
            factor: options.factor,
            patience: options.patience,
            min_lr: options.min_lr,
            wait: 0,
        })
    }
}

impl Callback for ReduceLrOnPlateau {
    fn name(&self) -> &'static str {
        "ReduceLROnPlateau"
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        match self.monitor.update(logs) {
            Some(true) => self.wait = 0,
            Some(false) => {
                self.wait += 1;
                if self.wait >= self.patience {
                    let new_lr = (ctx.learning_rate * self.factor).max(self.min_lr);
                    if new_lr < ctx.learning_rate {
                        log::info!("Epoch {}: reducing learning rate to {:.2e}", epoch + 1, new_lr);
                        ctx.learning_rate = new_lr;
                    }
                    self.wait = 0;
                }
            }
            None => log::warn!("Learning rate reduction conditioned on unavailable metric {}", self.monitor.key()),
        }
        Ok(())
    }
}

/// Copies every file in the local checkpoint directory to the run directory after each epoch
pub struct CheckpointSync {
    local_dir: PathBuf,
    dest_dir: String,
    store: Arc<dyn ArtifactStore>,
}

impl CheckpointSync {
    pub fn new(local_dir: PathBuf, dest_dir: String, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            local_dir,
            dest_dir,
            store,
        }
    }
}

impl Callback for CheckpointSync {
    fn name(&self) -> &'static str {
        "CheckpointSync"
    }

    fn on_epoch_end(&mut self, _epoch: usize, _logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        if !self.local_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.local_dir)? {
            let path = entry?.path();
            self.store.write(&path, &self.dest_dir, TransferMode::Copy)?;
        }
        Ok(())
    }
}

/// Ordered callbacks plus the log file the trainer uploads afterwards
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
    csv_log: Option<PathBuf>,
}

impl CallbackList {
    pub fn empty() -> Self {
        Self {
            callbacks: Vec::new(),
            csv_log: None,
        }
    }

    pub fn push(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    pub fn csv_log(&self) -> Option<&Path> {
        self.csv_log.as_deref()
    }

    pub fn on_train_begin(&mut self, ctx: &mut TrainingContext) -> Result<()> {
        for cb in &mut self.callbacks {
            cb.on_train_begin(ctx)?;
        }
        Ok(())
    }

    pub fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        for cb in &mut self.callbacks {
            cb.on_epoch_end(epoch, logs, ctx)
                .with_context(|| format!("{} failed at epoch {}", cb.name(), epoch + 1))?;
        }
        Ok(())
    }
}

fn options<T: serde::de::DeserializeOwned>(name: &str, value: &serde_yaml::Value) -> Result<T> {
    let value = if value.is_null() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        value.clone()
    };
    serde_yaml::from_value(value).with_context(|| format!("Invalid options for callback {}", name))
}

/// Build the callback list from the `callbacks` config mapping.
///
/// Checkpoints and CSV logs are written under `work_dir`; a `CheckpointSync`
/// is always appended so checkpoints reach `<run_dir>/checkpoints`.
pub fn build_callbacks(
    config: &serde_yaml::Mapping,
    architecture: Architecture,
    work_dir: &Path,
    run_dir: &str,
    store: Arc<dyn ArtifactStore>,
) -> Result<CallbackList> {
    let checkpoint_dir = work_dir.join(CHECKPOINT_DIR);
    let mut list = CallbackList::empty();

    for (key, value) in config {
        let Some(name) = key.as_str() else {
            bail!("callback names must be strings, got {:?}", key);
        };
        match name {
            "ModelCheckpoint" => {
                let cb = ModelCheckpoint::new(options(name, value)?, architecture, &checkpoint_dir);
                list.push(Box::new(cb));
            }
            "CSVLogger" => {
                let cb = CsvLogger::new(options(name, value)?, work_dir)?;
                list.csv_log = Some(cb.path().to_path_buf());
                list.push(Box::new(cb));
            }
            "EarlyStopping" => list.push(Box::new(EarlyStopping::new(options(name, value)?))),
            "ReduceLROnPlateau" => list.push(Box::new(ReduceLrOnPlateau::new(options(name, value)?)?)),
            "TensorBoard" => {
                let log_dir = value
                    .get("log_dir")
                    .and_then(|v| v.as_str())
                    .unwrap_or("logs");
                log::warn!(
                    "TensorBoard callback is not supported, skipping (log_dir would be {}_{})",
                    log_dir,
                    architecture
                );
            }
            other => bail!("Unknown callback: {}", other),
        }
    }

    let dest = join_key(run_dir, CHECKPOINT_DIR);
    list.push(Box::new(CheckpointSync::new(checkpoint_dir, dest, store)));
    Ok(list)
}
