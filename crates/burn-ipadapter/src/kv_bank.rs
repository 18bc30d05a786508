//! Bank of per-layer image key/value projections

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_ipadapter_convert::KvWeight;

use crate::error::IpAdapterError;

/// Ordered bias-free projections from conditioning tokens to each layer's
/// key and value space
///
/// Slot `2i` projects keys for attention layer `i`, slot `2i + 1` its
/// values.
#[derive(Module, Debug)]
pub struct KvBank<B: Backend> {
    projections: Vec<Linear<B>>,
}

impl<B: Backend> KvBank<B> {
    /// Randomly initialized bank with one projection per table entry
    ///
    /// # Arguments
    ///
    /// * `widths` - Output width of each slot, keys and values interleaved
    /// * `cross_attention_dim` - Width of the conditioning tokens
    /// * `device` - Device to create tensors on
    pub fn new(widths: &[usize], cross_attention_dim: usize, device: &B::Device) -> Self {
        let projections = widths
            .iter()
            .map(|&width| {
                LinearConfig::new(cross_attention_dim, width)
                    .with_bias(false)
                    .init(device)
            })
            .collect();

        Self { projections }
    }

    /// Bank from checkpoint weights, assigned by position
    ///
    /// Weight `i` must have shape `[widths[i], cross_attention_dim]`. Names are
    /// not consulted.
    pub fn from_weights(
        weights: Vec<KvWeight<B>>,
        widths: &[usize],
        cross_attention_dim: usize,
    ) -> Result<Self, IpAdapterError> {
        if weights.len() != widths.len() {
            return Err(IpAdapterError::shape_mismatch(
                "ip_adapter weight count",
                &[widths.len()],
                &[weights.len()],
            ));
        }

        let projections = weights
            .into_iter()
            .zip(widths)
            .enumerate()
            .map(|(slot, (kv, &width))| {
                let [out_features, in_features] = kv.weight.dims();
                if out_features != width || in_features != cross_attention_dim {
                    return Err(IpAdapterError::shape_mismatch(
                        format!("ip_adapter slot {slot} ({})", kv.name),
                        &[width, cross_attention_dim],
                        &[out_features, in_features],
                    ));
                }

                let device = kv.weight.device();
                let mut linear = LinearConfig::new(in_features, out_features)
                    .with_bias(false)
                    .init(&device);
                linear.weight = Param::from_tensor(kv.weight.transpose());
                Ok(linear)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { projections })
    }

    /// Number of projections (twice the number of layers)
    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    pub fn num_layers(&self) -> usize {
        self.projections.len() / 2
    }

    /// Key projection of attention layer `layer`, if the bank has one
    pub fn key(&self, layer: usize) -> Option<&Linear<B>> {
        layer.checked_mul(2).and_then(|slot| self.projections.get(slot))
    }

    /// Value projection of attention layer `layer`, if the bank has one
    pub fn value(&self, layer: usize) -> Option<&Linear<B>> {
        layer
            .checked_mul(2)
            .and_then(|slot| self.projections.get(slot + 1))
    }

    /// Output width of projection slot `slot`
    pub fn width(&self, slot: usize) -> Option<usize> {
        self.projections.get(slot).map(|linear| linear.weight.dims()[1])
    }

    /// Project conditioning tokens into layer `layer`'s image keys and values
    ///
    /// # Arguments
    ///
    /// * `layer` - Attention layer, below [`num_layers`](Self::num_layers)
    /// * `tokens` - Conditioning tokens `[batch, tokens, cross_attention_dim]`
    ///
    /// # Returns
    ///
    /// Keys and values, each `[batch, tokens, width]`
    pub fn project(
        &self,
        layer: usize,
        tokens: Tensor<B, 3>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>), IpAdapterError> {
        let (Some(key), Some(value)) = (self.key(layer), self.value(layer)) else {
            return Err(IpAdapterError::shape_mismatch(
                format!("ip_adapter layer {layer} (bank layer count)"),
                &[self.num_layers()],
                &[layer.saturating_add(1)],
            ));
        };

        Ok((key.forward(tokens.clone()), value.forward(tokens)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ArchitectureVariant;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn kv_weights(widths: &[usize], dim: usize) -> Vec<KvWeight<TestBackend>> {
        let device = Default::default();
        widths
            .iter()
            .enumerate()
            .map(|(i, &width)| KvWeight {
                name: format!("{}.weight", i),
                weight: Tensor::ones([width, dim], &device) * (i as f32 + 1.0),
            })
            .collect()
    }

    #[test]
    fn test_bank_from_classic_table() {
        let widths = ArchitectureVariant::Classic.widths();
        let bank = KvBank::from_weights(kv_weights(widths, 8), widths, 8).unwrap();

        assert_eq!(bank.len(), 32);
        assert_eq!(bank.num_layers(), 16);
        for (slot, &width) in widths.iter().enumerate() {
            assert_eq!(bank.width(slot), Some(width));
        }
    }

    #[test]
    fn test_positional_assignment() {
        let device = Default::default();
        let widths = [4, 4, 6, 6];
        let bank = KvBank::from_weights(kv_weights(&widths, 2), &widths, 2).unwrap();

        // Every weight entry of slot i equals i + 1, so a ones input sums to 2 * (i + 1)
        let tokens = Tensor::<TestBackend, 3>::ones([1, 3, 2], &device);
        let (key, value) = bank.project(1, tokens).unwrap();
        assert_eq!(key.dims(), [1, 3, 6]);

        let key: Vec<f32> = key.into_data().to_vec().unwrap();
        let value: Vec<f32> = value.into_data().to_vec().unwrap();
        assert!(key.iter().all(|&k| (k - 6.0).abs() < 1e-6));
        assert!(value.iter().all(|&v| (v - 8.0).abs() < 1e-6));
    }

    #[test]
    fn test_layer_out_of_range() {
        let device = Default::default();
        let widths = ArchitectureVariant::Classic.widths();
        let bank = KvBank::from_weights(kv_weights(widths, 8), widths, 8).unwrap();
        assert!(bank.key(16).is_none());
        assert!(bank.value(15).is_some());
        assert_eq!(bank.width(32), None);
        assert!(bank.key(usize::MAX).is_none());

        let tokens = Tensor::<TestBackend, 3>::ones([2, 4, 8], &device);
        let err = bank.project(16, tokens).unwrap_err();
        assert!(matches!(err, IpAdapterError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_count_mismatch() {
        let widths = ArchitectureVariant::Classic.widths();
        let err = KvBank::from_weights(kv_weights(&widths[..30], 8), widths, 8).unwrap_err();
        match err {
            IpAdapterError::ShapeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, vec![32]);
                assert_eq!(actual, vec![30]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_width_mismatch() {
        let mut widths = ArchitectureVariant::Classic.widths().to_vec();
        let weights = kv_weights(&widths, 8);
        widths[5] = 1280;
        let err = KvBank::from_weights(weights, &widths, 8).unwrap_err();
        assert!(err.to_string().contains("slot 5"));
    }

    #[test]
    fn test_cross_attention_dim_mismatch() {
        let widths = [4, 4];
        let err = KvBank::from_weights(kv_weights(&widths, 8), &widths, 16).unwrap_err();
        assert!(matches!(err, IpAdapterError::ShapeMismatch { .. }));
    }
}
