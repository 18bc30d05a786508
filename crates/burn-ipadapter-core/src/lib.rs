//! Core Building Blocks for IP-Adapter
//!
//! Shared tensor components used by the adapter model and by the host
//! cross-attention blocks it patches.
//!
//! # Modules
//!
//! - [`attention`] - Scaled dot-product attention and head split/merge
//! - [`layernorm`] - Layer normalization matching `torch.nn.LayerNorm`
//!
//! # Example
//!
//! ```ignore
//! use burn_ipadapter_core::attention::multi_head_attention;
//!
//! // q: [batch, seq, heads * head_dim], k/v: [batch, ctx, heads * head_dim]
//! let out = multi_head_attention(q, k, v, 8, 40);
//! ```

pub mod attention;
pub mod layernorm;
