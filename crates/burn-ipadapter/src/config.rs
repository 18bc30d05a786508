//! IP-Adapter runtime configuration

use crate::topology::ArchitectureVariant;

/// Lowest supported image weight
pub const WEIGHT_MIN: f32 = -1.0;
/// Highest supported image weight
pub const WEIGHT_MAX: f32 = 3.0;
/// Step granularity exposed to users
pub const WEIGHT_STEP: f32 = 0.05;

/// IP-Adapter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IpAdapterConfig {
    /// Scale of the image attention branch (0 disables it)
    pub weight: f32,
    /// Architecture override; inferred from the embedding width when `None`
    pub variant: Option<ArchitectureVariant>,
}

impl Default for IpAdapterConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            variant: None,
        }
    }
}

impl IpAdapterConfig {
    /// Configuration pinned to SD 1.x / 2.x
    pub fn classic() -> Self {
        Self {
            variant: Some(ArchitectureVariant::Classic),
            ..Self::default()
        }
    }

    /// Configuration pinned to SDXL
    pub fn extra_large() -> Self {
        Self {
            variant: Some(ArchitectureVariant::ExtraLarge),
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_variant(mut self, variant: ArchitectureVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Whether the weight lies in the supported `[-1, 3]` range
    ///
    /// Out-of-range weights are still applied.
    pub fn weight_in_range(&self) -> bool {
        (WEIGHT_MIN..=WEIGHT_MAX).contains(&self.weight)
    }

    /// Variant to use for an embedding of `embed_width`
    pub fn resolve_variant(&self, embed_width: usize) -> ArchitectureVariant {
        let inferred = ArchitectureVariant::from_embedding_width(embed_width);
        match self.variant {
            Some(variant) => {
                if variant != inferred {
                    tracing::warn!(
                        %variant,
                        %inferred,
                        embed_width,
                        "variant override disagrees with embedding width"
                    );
                }
                variant
            }
            None => inferred,
        }
    }
}
