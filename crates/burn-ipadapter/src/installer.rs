//! Binding key/value slots to host cross-attention layers
//!
//! The installer walks the host's blocks in a fixed order per variant and
//! hands out bank layers sequentially, so layer `n` of the walk uses slots
//! `2n` (key) and `2n + 1` (value).

use std::sync::Arc;

use burn::prelude::*;

use crate::adapter::IpAdapter;
use crate::config::IpAdapterConfig;
use crate::error::IpAdapterError;
use crate::fusion::{IpAdapterContext, IpAttnPatch};
use crate::patch::{BlockPosition, CrossAttentionLayout, ModelPatcher};
use crate::topology::ArchitectureVariant;

/// One cross-attention position and the bank layer bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerBinding {
    pub position: BlockPosition,
    /// Bank layer; key slot `2 * layer`, value slot `2 * layer + 1`
    pub layer: usize,
}

impl LayerBinding {
    pub fn key_slot(&self) -> usize {
        self.layer * 2
    }

    pub fn value_slot(&self) -> usize {
        self.layer * 2 + 1
    }
}

/// Cross-attention positions in slot order
pub fn enumerate(variant: ArchitectureVariant) -> Vec<LayerBinding> {
    let mut positions = Vec::with_capacity(variant.num_layers());

    match variant {
        ArchitectureVariant::Classic => {
            for id in [1, 2, 4, 5, 7, 8] {
                positions.push(BlockPosition::input(id, 0));
            }
            for id in 3..=11 {
                positions.push(BlockPosition::output(id, 0));
            }
            positions.push(BlockPosition::middle(0, 0));
        }
        ArchitectureVariant::ExtraLarge => {
            for (id, depth) in [(4, 2), (5, 2), (7, 10), (8, 10)] {
                for index in 0..depth {
                    positions.push(BlockPosition::input(id, index));
                }
            }
            for (id, depth) in [(0, 10), (1, 10), (2, 10), (3, 2), (4, 2), (5, 2)] {
                for index in 0..depth {
                    positions.push(BlockPosition::output(id, index));
                }
            }
            for index in 0..10 {
                positions.push(BlockPosition::middle(0, index));
            }
        }
    }

    positions
        .into_iter()
        .enumerate()
        .map(|(layer, position)| LayerBinding { position, layer })
        .collect()
}

/// Patch every cross-attention layer of `host` for `variant`
///
/// Returns a patched copy; `host` keeps its own registry. Fails with
/// [`IpAdapterError::UnsupportedTopology`] before any patch is returned if a
/// position has no cross-attention layer or its width disagrees with the
/// bound slot.
pub fn install<B: Backend, M: CrossAttentionLayout>(
    host: &ModelPatcher<B, M>,
    context: Arc<IpAdapterContext<B>>,
    variant: ArchitectureVariant,
) -> Result<ModelPatcher<B, M>, IpAdapterError> {
    let widths = variant.widths();
    if context.num_projections() != widths.len() {
        return Err(IpAdapterError::shape_mismatch(
            format!("{variant} key/value projections"),
            &[widths.len()],
            &[context.num_projections()],
        ));
    }

    let bindings = enumerate(variant);
    for binding in &bindings {
        let expected = context.projection_width(binding.key_slot()).ok_or_else(|| {
            IpAdapterError::shape_mismatch(
                format!("{variant} key/value projections"),
                &[widths.len()],
                &[binding.key_slot()],
            )
        })?;
        match host.model().cross_attention_width(&binding.position) {
            None => {
                return Err(IpAdapterError::UnsupportedTopology {
                    position: binding.position,
                    reason: "no replaceable cross-attention layer".to_string(),
                });
            }
            Some(width) if width != expected => {
                return Err(IpAdapterError::UnsupportedTopology {
                    position: binding.position,
                    reason: format!(
                        "layer width {width} does not match slot {} width {expected}",
                        binding.key_slot()
                    ),
                });
            }
            Some(_) => {}
        }
    }

    let mut patched = host.clone();
    for binding in bindings {
        tracing::debug!(
            position = %binding.position,
            layer = binding.layer,
            "registering IP-Adapter attention"
        );
        patched.set_attn2_replace(
            binding.position,
            Arc::new(IpAttnPatch::new(binding.layer, Arc::clone(&context))),
        );
    }

    tracing::info!(
        %variant,
        layers = variant.num_layers(),
        weight = context.weight(),
        "patched model with IP-Adapter"
    );

    Ok(patched)
}

/// Embed `image_embeds` and install `adapter` on a copy of `host`
///
/// `image_embeds` is `[1, D]`.
pub fn apply_ip_adapter<B: Backend, M: CrossAttentionLayout>(
    host: &ModelPatcher<B, M>,
    adapter: IpAdapter<B>,
    image_embeds: Tensor<B, 2>,
    config: &IpAdapterConfig,
) -> Result<ModelPatcher<B, M>, IpAdapterError> {
    if !config.weight_in_range() {
        tracing::warn!(weight = config.weight, "IP-Adapter weight outside [-1, 3]");
    }

    let variant = adapter.variant();
    let embeds = adapter.embed(image_embeds)?;
    let context = Arc::new(IpAdapterContext::new(adapter, embeds, config.weight));

    install(host, context, variant)
}
