//! Batch-shaped conditioning cache
//!
//! Samplers evaluate the unconditioned and conditioned halves of a
//! classifier-free guidance batch together, so the image tokens fed to every
//! patched layer are `[uncond; cond]` repeated to half the batch each. The
//! cache builds that tensor once per batch size and hands out clones.

use burn::prelude::*;

use crate::adapter::ConditioningEmbeddings;
use crate::error::IpAdapterError;

/// Cache state
#[derive(Debug, Clone, Default)]
pub enum CacheState<B: Backend> {
    /// Nothing built yet
    #[default]
    Empty,
    /// Tokens built for `batch`
    Built {
        batch: usize,
        tokens: Tensor<B, 3>,
    },
}

/// Conditioning tokens reshaped for the current batch size
#[derive(Debug, Clone, Default)]
pub struct ConditioningCache<B: Backend> {
    state: CacheState<B>,
    rebuilds: usize,
}

impl<B: Backend> ConditioningCache<B> {
    pub fn new() -> Self {
        Self {
            state: CacheState::Empty,
            rebuilds: 0,
        }
    }

    pub fn state(&self) -> &CacheState<B> {
        &self.state
    }

    /// Batch size of the built tokens, if any
    pub fn batch(&self) -> Option<usize> {
        match &self.state {
            CacheState::Empty => None,
            CacheState::Built { batch, .. } => Some(*batch),
        }
    }

    /// Number of times the tokens were (re)built
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn clear(&mut self) {
        self.state = CacheState::Empty;
    }

    /// Tokens for a batch of `batch` samples
    ///
    /// Returns `[batch, num_tokens, cross_attention_dim]` with the
    /// unconditioned tokens in the first half and the conditioned tokens in
    /// the second. Rebuilds only when `batch` differs from the cached size.
    pub fn ensure(
        &mut self,
        batch: usize,
        embeds: &ConditioningEmbeddings<B>,
    ) -> Result<Tensor<B, 3>, IpAdapterError> {
        if batch == 0 || batch % 2 != 0 {
            return Err(IpAdapterError::BatchSizeContractViolation { batch });
        }

        if let CacheState::Built {
            batch: cached,
            tokens,
        } = &self.state
        {
            if *cached == batch {
                return Ok(tokens.clone());
            }
        }

        let half = batch / 2;
        let tokens = Tensor::cat(
            vec![
                embeds.uncond.clone().repeat_dim(0, half),
                embeds.cond.clone().repeat_dim(0, half),
            ],
            0,
        );
        self.rebuilds += 1;
        tracing::debug!(batch, rebuilds = self.rebuilds, "rebuilt conditioning cache");

        self.state = CacheState::Built {
            batch,
            tokens: tokens.clone(),
        };
        Ok(tokens)
    }
}
