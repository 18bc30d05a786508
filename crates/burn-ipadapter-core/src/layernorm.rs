//! Layer normalization with PyTorch semantics
//!
//! Checkpoints are trained with `torch.nn.LayerNorm`, which normalizes with
//! the biased (population) variance. Burn's `var` is unbiased, so this
//! module uses `var_bias` to reproduce the trained behaviour exactly.

use burn::prelude::*;

/// Default epsilon of `torch.nn.LayerNorm`
pub const DEFAULT_EPS: f64 = 1e-5;

/// Layer normalization over the last dimension
///
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Tensor<B, 1>,
    /// Shift parameter
    pub bias: Tensor<B, 1>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Identity-initialized layer norm of the given width
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: DEFAULT_EPS,
        }
    }

    /// Layer norm from checkpoint weight and bias
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: DEFAULT_EPS,
        }
    }

    /// Width of the normalized dimension
    pub fn size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Normalizes `x` across its last dimension
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}
