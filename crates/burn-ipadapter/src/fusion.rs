//! Decoupled cross-attention
//!
//! Each patched layer computes its native text attention and adds a second
//! attention over the image tokens, sharing the layer's queries:
//!
//! ```text
//! out = attn(q, k, v) + weight * attn(q, to_k_ip(tokens), to_v_ip(tokens))
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use burn::prelude::*;

use burn_ipadapter_core::attention::multi_head_attention;

use crate::adapter::{ConditioningEmbeddings, IpAdapter};
use crate::cache::ConditioningCache;
use crate::error::IpAdapterError;
use crate::patch::{AttnOptions, AttnReplace};

#[derive(Debug)]
struct FusionState<B: Backend> {
    adapter: IpAdapter<B>,
    embeds: ConditioningEmbeddings<B>,
    cache: ConditioningCache<B>,
}

/// State shared by every patched layer of one installation
///
/// All layers read the same image tokens and the same batch cache.
#[derive(Debug)]
pub struct IpAdapterContext<B: Backend> {
    weight: f32,
    state: Mutex<FusionState<B>>,
}

impl<B: Backend> IpAdapterContext<B> {
    pub fn new(adapter: IpAdapter<B>, embeds: ConditioningEmbeddings<B>, weight: f32) -> Self {
        Self {
            weight,
            state: Mutex::new(FusionState {
                adapter,
                embeds,
                cache: ConditioningCache::new(),
            }),
        }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Number of key/value projections in the adapter
    pub fn num_projections(&self) -> usize {
        self.lock().adapter.kv_bank().len()
    }

    /// Output width of projection slot `slot`, if the adapter has that slot
    pub fn projection_width(&self, slot: usize) -> Option<usize> {
        self.lock().adapter.kv_bank().width(slot)
    }

    /// Batch size the cache currently holds tokens for
    pub fn cached_batch(&self) -> Option<usize> {
        self.lock().cache.batch()
    }

    /// Number of cache rebuilds so far
    pub fn cache_rebuilds(&self) -> usize {
        self.lock().cache.rebuilds()
    }

    fn lock(&self) -> MutexGuard<'_, FusionState<B>> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Image keys and values of `layer` for a batch of `batch` samples
    fn image_kv(
        &self,
        layer: usize,
        batch: usize,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>), IpAdapterError> {
        let mut state = self.lock();
        let FusionState {
            adapter,
            embeds,
            cache,
        } = &mut *state;

        let tokens = cache.ensure(batch, embeds)?;
        adapter.kv_bank().project(layer, tokens)
    }
}

/// Cross-attention replacement for one attention layer
#[derive(Debug, Clone)]
pub struct IpAttnPatch<B: Backend> {
    layer: usize,
    context: Arc<IpAdapterContext<B>>,
}

impl<B: Backend> IpAttnPatch<B> {
    /// Patch using the key/value projections of attention layer `layer`
    /// (slots `2 * layer` and `2 * layer + 1`)
    pub fn new(layer: usize, context: Arc<IpAdapterContext<B>>) -> Self {
        Self { layer, context }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }
}

impl<B: Backend> AttnReplace<B> for IpAttnPatch<B> {
    fn forward(
        &self,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        options: &AttnOptions,
    ) -> Result<Tensor<B, 3>, IpAdapterError> {
        let [batch, seq_len, width] = q.dims();
        if width != options.inner_dim() {
            return Err(IpAdapterError::shape_mismatch(
                "query width (n_heads * dim_head)",
                &[batch, seq_len, options.inner_dim()],
                &[batch, seq_len, width],
            ));
        }

        let text = multi_head_attention(q.clone(), k, v, options.n_heads, options.dim_head);

        let weight = self.context.weight();
        if weight == 0.0 {
            return Ok(text);
        }

        let (ip_k, ip_v) = self.context.image_kv(self.layer, batch)?;
        let ip_width = ip_k.dims()[2];
        if ip_width != width {
            return Err(IpAdapterError::shape_mismatch(
                format!("image key/value width of layer {}", self.layer),
                &[width],
                &[ip_width],
            ));
        }

        let image = multi_head_attention(q, ip_k, ip_v, options.n_heads, options.dim_head);

        Ok(text + image * weight)
    }
}
