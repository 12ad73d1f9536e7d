use serde::{Deserialize, Serialize};

/// Counts of a binary classifier's outcomes, positive class = 1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
    pub tp: usize,
}

impl ConfusionMatrix {
    /// Tally predictions against labels. Any non-zero label counts as positive.
    pub fn from_labels(y_true: &[u8], y_pred: &[u8]) -> Self {
        let mut cm = Self::default();
        for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
            cm.record(t != 0, p != 0);
        }
        cm
    }

    pub fn record(&mut self, actual: bool, predicted: bool) {
        match (actual, predicted) {
            (false, false) => self.tn += 1,
            (false, true) => self.fp += 1,
            (true, false) => self.fn_ += 1,
            (true, true) => self.tp += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.tn + self.fp + self.fn_ + self.tp
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let denom = self.tp as f64 + 0.5 * (self.fp + self.fn_) as f64;
        if denom == 0.0 { 0.0 } else { self.tp as f64 / denom }
    }

    pub fn metrics(&self) -> BinaryMetrics {
        BinaryMetrics {
            accuracy: self.accuracy(),
            precision: self.precision(),
            recall: self.recall(),
            f1: self.f1(),
        }
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 { 0.0 } else { num as f64 / denom as f64 }
}

/// Summary scores reported after scoring a labeled file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl BinaryMetrics {
    /// Named values in report order
    pub fn report(&self) -> [(&'static str, f64); 4] {
        [
            ("val_accuracy", self.accuracy),
            ("val_precision", self.precision),
            ("val_recall", self.recall),
            ("val_f1", self.f1),
        ]
    }
}

/// Threshold probabilities at 0.5
pub fn to_labels(probabilities: &[f32]) -> Vec<u8> {
    probabilities.iter().map(|&p| u8::from(p > 0.5)).collect()
}
