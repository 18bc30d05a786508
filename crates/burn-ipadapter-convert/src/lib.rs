//! Weight Loading for IP-Adapter
//!
//! This crate reads IP-Adapter checkpoints from safetensors format into
//! Burn tensors.
//!
//! # Weight Loading
//!
//! ```ignore
//! use burn_ipadapter_convert::{SafeTensorFile, LoadError};
//!
//! let file = SafeTensorFile::open("ip-adapter_sd15.safetensors")?;
//! let tensor = file.load_f32::<B, 2>("image_proj.proj.weight", &device)?;
//! ```
//!
//! # Checkpoints
//!
//! [`IpAdapterCheckpoint`] groups the image projection weights and the
//! ordered list of per-layer key/value projection weights:
//!
//! ```ignore
//! use burn_ipadapter_convert::IpAdapterCheckpoint;
//!
//! let checkpoint = IpAdapterCheckpoint::<B>::open("ip-adapter_sd15.safetensors", &device)?;
//! assert_eq!(checkpoint.ip_adapter.len(), 32);
//! ```
//!
//! Weights stored as f16 or bf16 are widened to f32 on load.

pub mod ip_adapter_loader;
pub mod loader;

pub use ip_adapter_loader::{
    IMAGE_PROJ_GROUP, IP_ADAPTER_GROUP, ImageProjWeights, IpAdapterCheckpoint,
    IpAdapterLoadError, KvWeight, ip_adapter_order,
};
pub use loader::{LoadError, SafeTensorFile};
