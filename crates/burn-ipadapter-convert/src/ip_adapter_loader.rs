//! IP-Adapter checkpoint loading from safetensors
//!
//! An IP-Adapter checkpoint holds two weight groups:
//!
//! - `image_proj.*` - the image projection (`proj.weight`, `proj.bias`,
//!   `norm.weight`, `norm.bias`)
//! - `ip_adapter.*` - one bias-free linear weight per key/value projection,
//!   named `<n>.to_k_ip.weight` / `<n>.to_v_ip.weight`
//!
//! The `ip_adapter` list is bound to UNet layers purely by position. The
//! safetensors header does not preserve insertion order, so the order of the
//! original module dictionary is rebuilt from the numeric prefix `<n>`
//! (ascending) and then the remaining key (`to_k_ip` sorts before `to_v_ip`).

use std::path::Path;

use burn::prelude::*;

use crate::loader::{LoadError, SafeTensorFile};

/// Weight group holding the image projection
pub const IMAGE_PROJ_GROUP: &str = "image_proj";
/// Weight group holding the per-layer key/value projections
pub const IP_ADAPTER_GROUP: &str = "ip_adapter";

/// Error type for IP-Adapter checkpoint loading
#[derive(Debug, thiserror::Error)]
pub enum IpAdapterLoadError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Missing weight group: {0}")]
    MissingGroup(&'static str),

    #[error("Cannot order ip_adapter weight {0}: expected a numeric layer prefix")]
    UnorderedKey(String),
}

/// Raw image projection weights, PyTorch layout
#[derive(Debug, Clone)]
pub struct ImageProjWeights<B: Backend> {
    /// `[num_tokens * cross_attention_dim, image_embed_dim]`
    pub proj_weight: Tensor<B, 2>,
    /// `[num_tokens * cross_attention_dim]`
    pub proj_bias: Tensor<B, 1>,
    /// `[cross_attention_dim]`
    pub norm_weight: Tensor<B, 1>,
    /// `[cross_attention_dim]`
    pub norm_bias: Tensor<B, 1>,
}

/// One key or value projection weight, `[out_features, cross_attention_dim]`
#[derive(Debug, Clone)]
pub struct KvWeight<B: Backend> {
    /// Key inside the `ip_adapter` group, for diagnostics only
    pub name: String,
    pub weight: Tensor<B, 2>,
}

/// A loaded IP-Adapter checkpoint
///
/// `ip_adapter` is in checkpoint order: entry `2i` is the key projection of
/// attention layer `i` and entry `2i + 1` its value projection.
#[derive(Debug, Clone)]
pub struct IpAdapterCheckpoint<B: Backend> {
    pub image_proj: ImageProjWeights<B>,
    pub ip_adapter: Vec<KvWeight<B>>,
}

impl<B: Backend> IpAdapterCheckpoint<B> {
    /// Checkpoint from weights already in memory
    pub fn new(image_proj: ImageProjWeights<B>, ip_adapter: Vec<KvWeight<B>>) -> Self {
        Self {
            image_proj,
            ip_adapter,
        }
    }

    /// Open and load a `.safetensors` IP-Adapter checkpoint
    pub fn open<P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Self, IpAdapterLoadError> {
        let file = SafeTensorFile::open(path.as_ref())?;
        let checkpoint = Self::from_file(&file, device)?;

        tracing::info!(
            path = %path.as_ref().display(),
            kv_weights = checkpoint.ip_adapter.len(),
            "loaded IP-Adapter checkpoint"
        );

        Ok(checkpoint)
    }

    /// Load both weight groups from an opened file
    ///
    /// Keys outside the two groups are ignored.
    pub fn from_file(
        file: &SafeTensorFile,
        device: &B::Device,
    ) -> Result<Self, IpAdapterLoadError> {
        if file.names_with_prefix(IMAGE_PROJ_GROUP).next().is_none() {
            return Err(IpAdapterLoadError::MissingGroup(IMAGE_PROJ_GROUP));
        }

        let key = |name: &str| format!("{IMAGE_PROJ_GROUP}.{name}");
        let image_proj = ImageProjWeights {
            proj_weight: file.load_f32(&key("proj.weight"), device)?,
            proj_bias: file.load_f32(&key("proj.bias"), device)?,
            norm_weight: file.load_f32(&key("norm.weight"), device)?,
            norm_bias: file.load_f32(&key("norm.bias"), device)?,
        };

        let names = ip_adapter_order(file.names_with_prefix(IP_ADAPTER_GROUP))?;
        if names.is_empty() {
            return Err(IpAdapterLoadError::MissingGroup(IP_ADAPTER_GROUP));
        }

        let ip_adapter = names
            .into_iter()
            .map(|name| -> Result<KvWeight<B>, IpAdapterLoadError> {
                let weight = file.load_f32(&format!("{IP_ADAPTER_GROUP}.{name}"), device)?;
                Ok(KvWeight {
                    name: name.to_string(),
                    weight,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(image_proj, ip_adapter))
    }

    /// Width of the image embedding the projection expects
    pub fn image_embed_dim(&self) -> usize {
        self.image_proj.proj_weight.dims()[1]
    }
}

/// Sort `ip_adapter` keys into checkpoint order
///
/// Keys are ordered by their numeric layer prefix, then by the rest of the
/// key, so `1.to_k_ip.weight`, `1.to_v_ip.weight`, `3.to_k_ip.weight`, ...
/// and `10.*` sorts after `9.*`.
pub fn ip_adapter_order<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<&'a str>, IpAdapterLoadError> {
    let mut keyed = names
        .into_iter()
        .map(|name| -> Result<_, IpAdapterLoadError> {
            let (index, rest) = name
                .split_once('.')
                .and_then(|(index, rest)| Some((index.parse::<usize>().ok()?, rest)))
                .ok_or_else(|| IpAdapterLoadError::UnorderedKey(name.to_string()))?;
            Ok((index, rest, name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    Ok(keyed.into_iter().map(|(_, _, name)| name).collect())
}
