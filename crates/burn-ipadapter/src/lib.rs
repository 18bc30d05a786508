//! IP-Adapter for Burn
//!
//! IP-Adapter conditions a pretrained diffusion UNet on a reference image
//! without retraining it. A CLIP image embedding is projected into a few
//! pseudo-tokens, and every cross-attention layer of the UNet gets a second
//! attention over those tokens that is added to its text attention.
//!
//! # Components
//!
//! - [`ArchitectureVariant`] and [`topology`] - per-architecture projection widths
//! - [`IpAdapter`] - image projection plus key/value bank, built from a checkpoint
//! - [`ConditioningCache`] - image tokens laid out for a guidance batch
//! - [`IpAttnPatch`] - the decoupled cross-attention replacement
//! - [`ModelPatcher`] - host model handle with attention replacements
//! - [`install`], [`apply_ip_adapter`] - bind the bank to the host's layers
//!
//! # Example
//!
//! ```ignore
//! use burn_ipadapter::{IpAdapter, IpAdapterConfig, ModelPatcher, UNetAttentionLayout, apply_ip_adapter};
//!
//! let config = IpAdapterConfig::default().with_weight(0.8);
//! let adapter = IpAdapter::<B>::from_file("ip-adapter_sd15.safetensors", &config, 1024, &device)?;
//!
//! let host = ModelPatcher::new(UNetAttentionLayout::sd1x());
//! let patched = apply_ip_adapter(&host, adapter, clip_image_embeds, &config)?;
//!
//! // Inside the UNet, each cross-attention block consults the patcher
//! let out = attn.forward_patched(x, text, patched.attn2_replace(&position))?;
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod fusion;
pub mod installer;
pub mod kv_bank;
pub mod patch;
pub mod preprocess;
pub mod projection;
pub mod topology;
pub mod unet;

pub use adapter::{ConditioningEmbeddings, IpAdapter};
pub use cache::{CacheState, ConditioningCache};
pub use config::{IpAdapterConfig, WEIGHT_MAX, WEIGHT_MIN, WEIGHT_STEP};
pub use error::IpAdapterError;
pub use fusion::{IpAdapterContext, IpAttnPatch};
pub use installer::{LayerBinding, apply_ip_adapter, enumerate, install};
pub use kv_bank::KvBank;
pub use patch::{
    AttnOptions, AttnReplace, BlockKind, BlockPosition, CrossAttentionLayout, ModelPatcher,
};
pub use preprocess::{FaceBox, FaceDetector, PrepMode, prepare};
pub use projection::ImageProjection;
pub use topology::{ArchitectureVariant, widths};
pub use unet::{CrossAttention, HeadLayout, UNetAttentionLayout, UNetLayoutConfig};
