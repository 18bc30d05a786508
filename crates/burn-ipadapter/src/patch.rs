//! Attention replacement registry
//!
//! A host diffusion model exposes its cross-attention layers by
//! [`BlockPosition`]. A [`ModelPatcher`] wraps the model together with a
//! registry of [`AttnReplace`] hooks; the model's cross-attention layers ask
//! the patcher for a hook at their position and call it instead of their
//! native attention.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use burn::prelude::*;

use crate::error::IpAdapterError;

/// UNet block group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockKind {
    Input,
    Middle,
    Output,
}

impl BlockKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Middle => "middle",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of one cross-attention layer: block group, block id and
/// transformer index within the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPosition {
    pub kind: BlockKind,
    pub id: usize,
    pub index: usize,
}

impl BlockPosition {
    pub const fn new(kind: BlockKind, id: usize, index: usize) -> Self {
        Self { kind, id, index }
    }

    pub const fn input(id: usize, index: usize) -> Self {
        Self::new(BlockKind::Input, id, index)
    }

    pub const fn middle(id: usize, index: usize) -> Self {
        Self::new(BlockKind::Middle, id, index)
    }

    pub const fn output(id: usize, index: usize) -> Self {
        Self::new(BlockKind::Output, id, index)
    }
}

impl fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.id, self.index)
    }
}

/// Head layout of the attention call being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttnOptions {
    pub n_heads: usize,
    pub dim_head: usize,
}

impl AttnOptions {
    pub fn new(n_heads: usize, dim_head: usize) -> Self {
        Self { n_heads, dim_head }
    }

    /// Model width, `n_heads * dim_head`
    pub fn inner_dim(&self) -> usize {
        self.n_heads * self.dim_head
    }
}

/// Replacement for a layer's cross-attention computation
///
/// Receives the layer's already projected queries, keys and values (all
/// `[batch, seq, inner_dim]`, keys and values over the text context) and
/// returns the attention output before the layer's output projection.
pub trait AttnReplace<B: Backend>: Send + Sync {
    fn forward(
        &self,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        options: &AttnOptions,
    ) -> Result<Tensor<B, 3>, IpAdapterError>;
}

/// Cross-attention widths a host model exposes
pub trait CrossAttentionLayout {
    /// Query/output width of the cross-attention layer at `position`, or
    /// `None` if the model has no cross-attention there
    fn cross_attention_width(&self, position: &BlockPosition) -> Option<usize>;
}

/// Shared model plus per-position cross-attention replacements
///
/// Cloning shares the model and copies the registry, so patches installed on
/// a clone leave the original untouched.
pub struct ModelPatcher<B: Backend, M> {
    model: Arc<M>,
    attn2_replace: BTreeMap<BlockPosition, Arc<dyn AttnReplace<B>>>,
}

impl<B: Backend, M> Clone for ModelPatcher<B, M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            attn2_replace: self.attn2_replace.clone(),
        }
    }
}

impl<B: Backend, M> fmt::Debug for ModelPatcher<B, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPatcher")
            .field("patches", &self.attn2_replace.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<B: Backend, M> ModelPatcher<B, M> {
    pub fn new(model: M) -> Self {
        Self::from_shared(Arc::new(model))
    }

    pub fn from_shared(model: Arc<M>) -> Self {
        Self {
            model,
            attn2_replace: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Register `patch` as the cross-attention replacement at `position`,
    /// replacing any earlier one
    pub fn set_attn2_replace(&mut self, position: BlockPosition, patch: Arc<dyn AttnReplace<B>>) {
        self.attn2_replace.insert(position, patch);
    }

    pub fn attn2_replace(&self, position: &BlockPosition) -> Option<&dyn AttnReplace<B>> {
        self.attn2_replace.get(position).map(|patch| patch.as_ref())
    }

    pub fn remove_attn2_replace(&mut self, position: &BlockPosition) -> bool {
        self.attn2_replace.remove(position).is_some()
    }

    /// Patched positions in ascending order
    pub fn patches(&self) -> impl Iterator<Item = &BlockPosition> {
        self.attn2_replace.keys()
    }

    pub fn num_patches(&self) -> usize {
        self.attn2_replace.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    struct Scale(f32);

    impl AttnReplace<TestBackend> for Scale {
        fn forward(
            &self,
            q: Tensor<TestBackend, 3>,
            _k: Tensor<TestBackend, 3>,
            _v: Tensor<TestBackend, 3>,
            _options: &AttnOptions,
        ) -> Result<Tensor<TestBackend, 3>, IpAdapterError> {
            Ok(q * self.0)
        }
    }

    #[test]
    fn test_position_display_and_order() {
        assert_eq!(BlockPosition::output(11, 0).to_string(), "output.11.0");
        assert_eq!(BlockPosition::middle(0, 3).to_string(), "middle.0.3");

        let mut positions = vec![
            BlockPosition::middle(0, 0),
            BlockPosition::output(0, 0),
            BlockPosition::input(8, 1),
            BlockPosition::input(8, 0),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                BlockPosition::input(8, 0),
                BlockPosition::input(8, 1),
                BlockPosition::middle(0, 0),
                BlockPosition::output(0, 0),
            ]
        );
    }

    #[test]
    fn test_clone_copies_registry() {
        let base = ModelPatcher::<TestBackend, ()>::new(());
        let mut patched = base.clone();
        patched.set_attn2_replace(BlockPosition::input(1, 0), Arc::new(Scale(2.0)));

        assert_eq!(base.num_patches(), 0);
        assert_eq!(patched.num_patches(), 1);
        assert!(patched.attn2_replace(&BlockPosition::input(1, 0)).is_some());
        assert!(patched.attn2_replace(&BlockPosition::input(2, 0)).is_none());
    }

    #[test]
    fn test_replace_and_remove() {
        let device = Default::default();
        let position = BlockPosition::middle(0, 0);
        let mut patcher = ModelPatcher::<TestBackend, ()>::new(());
        patcher.set_attn2_replace(position, Arc::new(Scale(2.0)));
        patcher.set_attn2_replace(position, Arc::new(Scale(3.0)));
        assert_eq!(patcher.num_patches(), 1);

        let q = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        let out = patcher
            .attn2_replace(&position)
            .unwrap()
            .forward(q.clone(), q.clone(), q, &AttnOptions::new(1, 4))
            .unwrap();
        let out: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(out.iter().all(|&v| v == 3.0));

        assert!(patcher.remove_attn2_replace(&position));
        assert!(!patcher.remove_attn2_replace(&position));
    }
}
