use candle_core::{D, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Embedding, Module, VarBuilder, conv1d, embedding};

/// Kernel width shared by every convolution in the classifiers
pub const KERNEL_SIZE: usize = 3;

/// Units of every recurrent layer
pub const LSTM_UNITS: usize = 128;

/// Token embedding followed by a transpose into channels-first layout.
///
/// Input `(batch, seq_len)` of `u32` ids, output `(batch, embedding_dim, seq_len)`.
pub struct ChannelsFirstEmbedding {
    inner: Embedding,
}

impl ChannelsFirstEmbedding {
    pub fn new(num_features: usize, embedding_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: embedding(num_features, embedding_dim, vb)?,
        })
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        self.inner.forward(ids)?.transpose(1, 2)?.contiguous()
    }
}

/// Conv1D with `same` padding and a ReLU activation
pub struct SameConv1d {
    conv: Conv1d,
}

impl SameConv1d {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: KERNEL_SIZE / 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv1d(in_channels, out_channels, KERNEL_SIZE, cfg, vb)?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)?.relu()
    }
}

/// Non-overlapping max pooling over the last axis of `(batch, channels, len)`.
/// A trailing element that does not fill a window is dropped.
pub fn max_pool1d(xs: &Tensor, pool_size: usize) -> Result<Tensor> {
    let (b, c, len) = xs.dims3()?;
    let out_len = len / pool_size;
    if out_len == 0 {
        candle_core::bail!("sequence of length {} is shorter than pool size {}", len, pool_size);
    }
    xs.narrow(2, 0, out_len * pool_size)?
        .reshape((b, c, out_len, pool_size))?
        .max(D::Minus1)
}

/// Mean over the sequence axis of `(batch, channels, len)`
pub fn global_average_pool1d(xs: &Tensor) -> Result<Tensor> {
    xs.mean(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_max_pool_drops_remainder() {
        let xs = Tensor::new(&[[[1f32, 5., 2., 2., 9.]]], &Device::Cpu).unwrap();
        let pooled = max_pool1d(&xs, 2).unwrap();
        assert_eq!(pooled.to_vec3::<f32>().unwrap(), vec![vec![vec![5., 2.]]]);
    }

    #[test]
    fn test_global_average_pool() {
        let xs = Tensor::new(&[[[1f32, 3.], [2., 4.]]], &Device::Cpu).unwrap();
        let pooled = global_average_pool1d(&xs).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![2., 3.]]);
    }

    #[test]
    fn test_pool_too_short() {
        let xs = Tensor::zeros((1, 1, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(max_pool1d(&xs, 2).is_err());
    }
}
