//! Image projection: CLIP image embedding to conditioning tokens

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_ipadapter_convert::ImageProjWeights;
use burn_ipadapter_core::layernorm::LayerNorm;

use crate::error::IpAdapterError;

/// Projects an image embedding into `num_tokens` cross-attention tokens
///
/// A single linear layer widens the embedding to
/// `num_tokens * cross_attention_dim`, the result is split into tokens and
/// each token is layer-normalized.
#[derive(Module, Debug)]
pub struct ImageProjection<B: Backend> {
    proj: Linear<B>,
    norm: LayerNorm<B>,
    num_tokens: usize,
    cross_attention_dim: usize,
}

impl<B: Backend> ImageProjection<B> {
    /// Randomly initialized projection
    ///
    /// # Arguments
    ///
    /// * `image_embed_dim` - Width of the CLIP image embedding
    /// * `cross_attention_dim` - Width of each output token
    /// * `num_tokens` - Number of tokens per embedding
    /// * `device` - Device to create tensors on
    pub fn new(
        image_embed_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
        device: &B::Device,
    ) -> Self {
        let proj =
            LinearConfig::new(image_embed_dim, num_tokens * cross_attention_dim).init(device);
        let norm = LayerNorm::new(cross_attention_dim, device);

        Self {
            proj,
            norm,
            num_tokens,
            cross_attention_dim,
        }
    }

    /// Projection from checkpoint weights
    ///
    /// `cross_attention_dim` comes from the key/value weights; the token count
    /// is the projection output width divided by it.
    pub fn from_weights(
        weights: ImageProjWeights<B>,
        cross_attention_dim: usize,
    ) -> Result<Self, IpAdapterError> {
        let [out_features, image_embed_dim] = weights.proj_weight.dims();

        if cross_attention_dim == 0 || out_features % cross_attention_dim != 0 {
            return Err(IpAdapterError::shape_mismatch(
                "image_proj.proj.weight rows (multiple of cross_attention_dim)",
                &[cross_attention_dim],
                &[out_features],
            ));
        }
        let num_tokens = out_features / cross_attention_dim;

        let [bias_len] = weights.proj_bias.dims();
        if bias_len != out_features {
            return Err(IpAdapterError::shape_mismatch(
                "image_proj.proj.bias",
                &[out_features],
                &[bias_len],
            ));
        }

        for (what, tensor) in [
            ("image_proj.norm.weight", &weights.norm_weight),
            ("image_proj.norm.bias", &weights.norm_bias),
        ] {
            let [len] = tensor.dims();
            if len != cross_attention_dim {
                return Err(IpAdapterError::shape_mismatch(
                    what,
                    &[cross_attention_dim],
                    &[len],
                ));
            }
        }

        let device = weights.proj_weight.device();
        let mut proj = LinearConfig::new(image_embed_dim, out_features).init(&device);
        // PyTorch stores [out, in]; Burn multiplies by [in, out]
        proj.weight = Param::from_tensor(weights.proj_weight.transpose());
        proj.bias = Some(Param::from_tensor(weights.proj_bias));

        Ok(Self {
            proj,
            norm: LayerNorm::from_weight_bias(weights.norm_weight, weights.norm_bias),
            num_tokens,
            cross_attention_dim,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn cross_attention_dim(&self) -> usize {
        self.cross_attention_dim
    }

    /// Width of the image embedding this projection accepts
    pub fn image_embed_dim(&self) -> usize {
        self.proj.weight.dims()[0]
    }

    /// Project image embeddings to cross-attention space
    ///
    /// # Arguments
    ///
    /// * `image_embeds` - Embeddings of shape `[batch, image_embed_dim]`
    ///
    /// # Returns
    ///
    /// Layer-normalized tokens of shape `[batch, num_tokens, cross_attention_dim]`
    pub fn forward(&self, image_embeds: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _] = image_embeds.dims();

        let projected = self.proj.forward(image_embeds);
        let tokens = projected.reshape([batch, self.num_tokens, self.cross_attention_dim]);

        self.norm.forward(tokens)
    }
}
