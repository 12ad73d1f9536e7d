use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::OptimizerKind;

/// The optimizer selected by `model_params.optimizer`
pub enum TrainOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl TrainOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        let adam = |weight_decay: f64| ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay,
        };
        Ok(match kind {
            OptimizerKind::Adam => TrainOptimizer::AdamW(AdamW::new(vars, adam(0.0))?),
            OptimizerKind::AdamW => TrainOptimizer::AdamW(AdamW::new(vars, adam(0.01))?),
            OptimizerKind::Sgd => TrainOptimizer::Sgd(SGD::new(vars, learning_rate)?),
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            TrainOptimizer::AdamW(opt) => opt.backward_step(loss),
            TrainOptimizer::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainOptimizer::AdamW(opt) => opt.learning_rate(),
            TrainOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            TrainOptimizer::AdamW(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Mean binary cross-entropy computed from logits.
///
/// Uses `max(x, 0) - x * y + log(1 + exp(-|x|))` so large logits do not overflow.
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let relu = logits.relu()?;
    let xy = (logits * targets)?;
    let log_term = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((relu - xy)? + log_term)?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_bce_matches_reference() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.0f32, 2.0, -3.0], &device).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0, 0.0], &device).unwrap();
        let loss = binary_cross_entropy_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(sigmoid(0.0)).ln() - (1.0 - sigmoid(2.0)).ln() - (1.0 - sigmoid(-3.0)).ln()) / 3.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_bce_is_finite_for_large_logits() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[500.0f32, -500.0], &device).unwrap();
        let targets = Tensor::new(&[0.0f32, 1.0], &device).unwrap();
        let loss = binary_cross_entropy_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_learning_rate_can_change() {
        let var = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        for kind in [OptimizerKind::Adam, OptimizerKind::AdamW, OptimizerKind::Sgd] {
            let mut opt = TrainOptimizer::new(kind, vec![var.clone()], 0.01).unwrap();
            assert_eq!(opt.learning_rate(), 0.01);
            opt.set_learning_rate(0.001);
            assert_eq!(opt.learning_rate(), 0.001);
        }
    }

    #[test]
    fn test_sgd_step_moves_towards_minimum() {
        let var = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = TrainOptimizer::new(OptimizerKind::Sgd, vec![var.clone()], 0.1).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let value: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert!((value[0] - 1.6).abs() < 1e-6);
    }
}
