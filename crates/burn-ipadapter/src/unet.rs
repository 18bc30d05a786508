//! Reference UNet host: cross-attention layout and a patchable attention block
//!
//! Block ids follow the LDM UNet numbering. Input block 0 is the stem
//! convolution; every level then contributes `num_res_blocks` residual blocks
//! plus a downsampler (except the last level). Output blocks walk the levels
//! in reverse with `num_res_blocks + 1` blocks each. Residual blocks at a
//! level with a non-zero transformer depth carry that many transformer
//! blocks, each with one cross-attention layer.

use std::collections::BTreeMap;

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_ipadapter_core::attention::multi_head_attention;

use crate::error::IpAdapterError;
use crate::patch::{AttnOptions, AttnReplace, BlockPosition, CrossAttentionLayout};

/// How attention heads are sized at each width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    /// Fixed head count, head dim scales with width (SD 1.x)
    Heads(usize),
    /// Fixed head dim, head count scales with width (SD 2.x, SDXL)
    HeadDim(usize),
}

impl HeadLayout {
    fn options(self, width: usize) -> AttnOptions {
        match self {
            Self::Heads(n_heads) => AttnOptions::new(n_heads, width / n_heads),
            Self::HeadDim(dim_head) => AttnOptions::new(width / dim_head, dim_head),
        }
    }
}

/// UNet structure relevant to cross-attention placement
#[derive(Debug, Clone)]
pub struct UNetLayoutConfig {
    /// Base channel count
    pub model_channels: usize,
    /// Channel multiplier per level
    pub channel_mult: Vec<usize>,
    /// Residual blocks per level on the input side
    pub num_res_blocks: usize,
    /// Transformer blocks per residual block at each level (0 = none)
    pub transformer_depth: Vec<usize>,
    /// Transformer blocks in the middle block
    pub transformer_depth_middle: usize,
    pub heads: HeadLayout,
}

impl UNetLayoutConfig {
    /// SD 1.x UNet
    pub fn sd1x() -> Self {
        Self {
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            transformer_depth: vec![1, 1, 1, 0],
            transformer_depth_middle: 1,
            heads: HeadLayout::Heads(8),
        }
    }

    /// SDXL base UNet
    pub fn sdxl() -> Self {
        Self {
            model_channels: 320,
            channel_mult: vec![1, 2, 4],
            num_res_blocks: 2,
            transformer_depth: vec![0, 2, 10],
            transformer_depth_middle: 10,
            heads: HeadLayout::HeadDim(64),
        }
    }
}

/// Shape of one cross-attention layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionLayerSpec {
    /// Query/output width
    pub width: usize,
    pub options: AttnOptions,
}

/// Every cross-attention layer of a UNet, by position
#[derive(Debug, Clone)]
pub struct UNetAttentionLayout {
    layers: BTreeMap<BlockPosition, AttentionLayerSpec>,
}

impl UNetAttentionLayout {
    pub fn from_config(config: &UNetLayoutConfig) -> Self {
        let mut layers = BTreeMap::new();
        let levels = config.channel_mult.len();
        let mut insert = |position: BlockPosition, width: usize| {
            layers.insert(
                position,
                AttentionLayerSpec {
                    width,
                    options: config.heads.options(width),
                },
            );
        };

        let mut id = 1;
        for (level, &mult) in config.channel_mult.iter().enumerate() {
            let width = config.model_channels * mult;
            let depth = config.transformer_depth.get(level).copied().unwrap_or(0);
            for _ in 0..config.num_res_blocks {
                for index in 0..depth {
                    insert(BlockPosition::input(id, index), width);
                }
                id += 1;
            }
            if level + 1 < levels {
                // downsampler
                id += 1;
            }
        }

        let deepest = config.model_channels * config.channel_mult.last().copied().unwrap_or(1);
        for index in 0..config.transformer_depth_middle {
            insert(BlockPosition::middle(0, index), deepest);
        }

        let mut id = 0;
        for (level, &mult) in config.channel_mult.iter().enumerate().rev() {
            let width = config.model_channels * mult;
            let depth = config.transformer_depth.get(level).copied().unwrap_or(0);
            for _ in 0..=config.num_res_blocks {
                for index in 0..depth {
                    insert(BlockPosition::output(id, index), width);
                }
                id += 1;
            }
        }

        Self { layers }
    }

    pub fn sd1x() -> Self {
        Self::from_config(&UNetLayoutConfig::sd1x())
    }

    pub fn sdxl() -> Self {
        Self::from_config(&UNetLayoutConfig::sdxl())
    }

    pub fn get(&self, position: &BlockPosition) -> Option<&AttentionLayerSpec> {
        self.layers.get(position)
    }

    /// Positions in ascending order
    pub fn positions(&self) -> impl Iterator<Item = &BlockPosition> {
        self.layers.keys()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Build the cross-attention block at `position`
    pub fn cross_attention<B: Backend>(
        &self,
        position: &BlockPosition,
        context_dim: usize,
        device: &B::Device,
    ) -> Option<CrossAttention<B>> {
        self.get(position).map(|spec| {
            CrossAttention::new(
                spec.width,
                spec.options.n_heads,
                spec.options.dim_head,
                context_dim,
                device,
            )
        })
    }
}

impl CrossAttentionLayout for UNetAttentionLayout {
    fn cross_attention_width(&self, position: &BlockPosition) -> Option<usize> {
        self.get(position).map(|spec| spec.width)
    }
}

/// Cross-attention over a text context
///
/// Query from the image features, keys and values from the context.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    pub to_q: Linear<B>,
    pub to_k: Linear<B>,
    pub to_v: Linear<B>,
    pub to_out: Linear<B>,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl<B: Backend> CrossAttention<B> {
    /// Create a new cross-attention layer
    ///
    /// # Arguments
    ///
    /// * `query_dim` - Width of the image features
    /// * `num_heads` - Number of attention heads
    /// * `head_dim` - Dimension per attention head
    /// * `context_dim` - Width of the text context
    /// * `device` - Device to create tensors on
    pub fn new(
        query_dim: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: usize,
        device: &B::Device,
    ) -> Self {
        let inner_dim = num_heads * head_dim;

        Self {
            to_q: LinearConfig::new(query_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_k: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_v: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_out: LinearConfig::new(inner_dim, query_dim).init(device),
            num_heads,
            head_dim,
        }
    }

    pub fn options(&self) -> AttnOptions {
        AttnOptions::new(self.num_heads, self.head_dim)
    }

    /// Native attention
    ///
    /// # Arguments
    ///
    /// * `x` - Image features of shape `[batch, seq_len, query_dim]`
    /// * `context` - Text context of shape `[batch, ctx_len, context_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, seq_len, query_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let q = self.to_q.forward(x);
        let k = self.to_k.forward(context.clone());
        let v = self.to_v.forward(context);

        let out = multi_head_attention(q, k, v, self.num_heads, self.head_dim);
        self.to_out.forward(out)
    }

    /// Attention with an optional replacement for the core computation
    ///
    /// The replacement sees the projected q, k, v; the output projection is
    /// applied to whatever it returns.
    pub fn forward_patched(
        &self,
        x: Tensor<B, 3>,
        context: Tensor<B, 3>,
        replace: Option<&dyn AttnReplace<B>>,
    ) -> Result<Tensor<B, 3>, IpAdapterError> {
        let Some(replace) = replace else {
            return Ok(self.forward(x, context));
        };

        let q = self.to_q.forward(x);
        let k = self.to_k.forward(context.clone());
        let v = self.to_v.forward(context);

        let out = replace.forward(q, k, v, &self.options())?;
        Ok(self.to_out.forward(out))
    }
}
