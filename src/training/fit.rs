use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressStyle};

use super::callbacks::{CallbackList, EpochLogs, TrainingContext};
use super::optimizer::{TrainOptimizer, binary_cross_entropy_with_logits};
use crate::config::MetricKind;
use crate::data::SequenceDataset;
use crate::evaluation::ConfusionMatrix;
use crate::io::safetensors::WeightMetadata;
use crate::model::SentimentClassifier;

/// Knobs of the epoch loop
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub steps_per_epoch: Option<usize>,
    pub seed: u64,
    pub metrics: Vec<MetricKind>,
}

#[derive(Debug, Clone, Default)]
pub struct FitReport {
    pub history: Vec<EpochLogs>,
    pub stopped_early: bool,
}

impl FitReport {
    pub fn last(&self) -> Option<&EpochLogs> {
        self.history.last()
    }
}

/// Running loss and confusion counts over a pass
#[derive(Debug, Default)]
struct PassStats {
    loss_sum: f64,
    samples: usize,
    confusion: ConfusionMatrix,
}

impl PassStats {
    fn record(&mut self, logits: &Tensor, targets: &Tensor, loss: f32) -> Result<()> {
        let logits: Vec<f32> = logits.to_vec1()?;
        let targets: Vec<f32> = targets.to_vec1()?;
        for (logit, target) in logits.iter().zip(&targets) {
            // sigmoid(x) > 0.5 <=> x > 0
            self.confusion.record(*target > 0.5, *logit > 0.0);
        }
        self.loss_sum += f64::from(loss) * targets.len() as f64;
        self.samples += targets.len();
        Ok(())
    }

    fn mean_loss(&self) -> f64 {
        if self.samples == 0 { 0.0 } else { self.loss_sum / self.samples as f64 }
    }

    fn write_logs(&self, prefix: &str, metrics: &[MetricKind], logs: &mut EpochLogs) {
        logs.insert(format!("{}loss", prefix), self.mean_loss());
        for metric in metrics {
            let value = match metric {
                MetricKind::Accuracy => self.confusion.accuracy(),
                MetricKind::Precision => self.confusion.precision(),
                MetricKind::Recall => self.confusion.recall(),
            };
            logs.insert(format!("{}{}", prefix, metric.key()), value);
        }
    }
}

fn eval_pass(model: &dyn SentimentClassifier, dataset: &SequenceDataset, batch_size: usize) -> Result<PassStats> {
    let mut stats = PassStats::default();
    for batch in dataset.dataloader(batch_size, false, 0) {
        let (x, y) = batch?;
        let logits = model.forward_t(&x, false)?;
        let loss = binary_cross_entropy_with_logits(&logits, &y)?.to_scalar::<f32>()?;
        stats.record(&logits, &y, loss)?;
    }
    Ok(stats)
}

/// Loss and confusion counts of `model` over `dataset` without updating weights
pub fn evaluate(
    model: &dyn SentimentClassifier,
    dataset: &SequenceDataset,
    batch_size: usize,
) -> Result<(f64, ConfusionMatrix)> {
    let stats = eval_pass(model, dataset, batch_size)?;
    Ok((stats.mean_loss(), stats.confusion))
}

/// Train `model` for up to `options.epochs` epochs, validating after each one
#[allow(clippy::too_many_arguments)]
pub fn fit(
    model: &dyn SentimentClassifier,
    varmap: &VarMap,
    metadata: &WeightMetadata,
    optimizer: &mut TrainOptimizer,
    train: &SequenceDataset,
    val: &SequenceDataset,
    options: &FitOptions,
    callbacks: &mut CallbackList,
) -> Result<FitReport> {
    let mut dataloader = train
        .dataloader(options.batch_size, true, options.seed)
        .with_max_steps(options.steps_per_epoch);

    let total_steps = options.epochs * dataloader.len();
    let pb = ProgressBar::new(total_steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps | Loss: {msg} | ETA: {eta}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let mut ctx = TrainingContext {
        varmap,
        metadata,
        learning_rate: optimizer.learning_rate(),
        stop_training: false,
    };
    callbacks.on_train_begin(&mut ctx)?;

    let mut report = FitReport::default();
    let mut recent_losses: Vec<f32> = Vec::new();
    let mut step = 0;

    for epoch in 0..options.epochs {
        if epoch > 0 {
            dataloader.reset();
        }
        let mut stats = PassStats::default();

        for batch in &mut dataloader {
            let (x, y) = batch?;
            let logits = model.forward_t(&x, true)?;
            let loss = binary_cross_entropy_with_logits(&logits, &y)?;
            optimizer.backward_step(&loss)?;

            let loss_val = loss.to_scalar::<f32>()?;
            stats.record(&logits, &y, loss_val)?;

            recent_losses.push(loss_val);
            if recent_losses.len() > 10 {
                recent_losses.remove(0);
            }
            let smoothed_loss = recent_losses.iter().sum::<f32>() / recent_losses.len() as f32;

            step += 1;
            pb.set_position(step as u64);
            pb.set_message(format!("{:.4}", smoothed_loss));
        }

        let mut logs = EpochLogs::new();
        stats.write_logs("", &options.metrics, &mut logs);

        eval_pass(model, val, options.batch_size)?.write_logs("val_", &options.metrics, &mut logs);
        logs.insert("lr".to_string(), ctx.learning_rate);

        let summary: Vec<String> = logs
            .iter()
            .filter(|(k, _)| k.as_str() != "lr")
            .map(|(k, v)| format!("{}: {:.4}", k, v))
            .collect();
        pb.println(format!("Epoch {}/{} - {}", epoch + 1, options.epochs, summary.join(" - ")));
        log::debug!("Epoch {} logs: {:?}", epoch + 1, logs);

        callbacks.on_epoch_end(epoch, &logs, &mut ctx)?;
        report.history.push(logs);

        if ctx.learning_rate != optimizer.learning_rate() {
            optimizer.set_learning_rate(ctx.learning_rate);
        }
        if ctx.stop_training {
            report.stopped_early = true;
            break;
        }
    }

    let final_loss = report.last().and_then(|l| l.get("loss").copied()).unwrap_or_default();
    pb.finish_with_message(format!("Training complete - Final loss: {:.4}", final_loss));
    Ok(report)
}
