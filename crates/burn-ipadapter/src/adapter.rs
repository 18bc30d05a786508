//! IP-Adapter model: image projection plus key/value bank
//!
//! IP-Adapter uses images as prompts by projecting CLIP image embeddings
//! into extra cross-attention tokens and giving every UNet cross-attention
//! layer its own key/value projections for those tokens.

use std::path::Path;

use burn::prelude::*;

use burn_ipadapter_convert::IpAdapterCheckpoint;

use crate::config::IpAdapterConfig;
use crate::error::IpAdapterError;
use crate::kv_bank::KvBank;
use crate::projection::ImageProjection;
use crate::topology::ArchitectureVariant;

/// Conditioned and unconditioned image tokens
///
/// Both are `[1, num_tokens, cross_attention_dim]`.
#[derive(Debug, Clone)]
pub struct ConditioningEmbeddings<B: Backend> {
    /// Tokens of the reference image
    pub cond: Tensor<B, 3>,
    /// Tokens of an all-zero embedding
    pub uncond: Tensor<B, 3>,
}

impl<B: Backend> ConditioningEmbeddings<B> {
    pub fn num_tokens(&self) -> usize {
        self.cond.dims()[1]
    }

    pub fn cross_attention_dim(&self) -> usize {
        self.cond.dims()[2]
    }
}

/// IP-Adapter model
#[derive(Debug, Clone)]
pub struct IpAdapter<B: Backend> {
    image_proj: ImageProjection<B>,
    kv_bank: KvBank<B>,
    variant: ArchitectureVariant,
}

impl<B: Backend> IpAdapter<B> {
    /// Randomly initialized adapter for `variant`
    pub fn new(
        variant: ArchitectureVariant,
        image_embed_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            image_proj: ImageProjection::new(
                image_embed_dim,
                cross_attention_dim,
                num_tokens,
                device,
            ),
            kv_bank: KvBank::new(variant.widths(), cross_attention_dim, device),
            variant,
        }
    }

    /// Build the adapter from a checkpoint, inferring the variant from the
    /// image embedding width
    pub fn load(
        checkpoint: IpAdapterCheckpoint<B>,
        image_embed_dim: usize,
    ) -> Result<Self, IpAdapterError> {
        let variant = ArchitectureVariant::from_embedding_width(image_embed_dim);
        Self::load_with_variant(checkpoint, image_embed_dim, variant)
    }

    /// Build the adapter from a checkpoint for an explicit variant
    ///
    /// `cross_attention_dim` is read from the first key projection weight and
    /// the token count from the projection width. Fails with
    /// [`IpAdapterError::ShapeMismatch`] when the checkpoint does not fit the
    /// variant's topology table or the embedding width.
    pub fn load_with_variant(
        checkpoint: IpAdapterCheckpoint<B>,
        image_embed_dim: usize,
        variant: ArchitectureVariant,
    ) -> Result<Self, IpAdapterError> {
        let IpAdapterCheckpoint {
            image_proj,
            ip_adapter,
        } = checkpoint;

        let cross_attention_dim = ip_adapter
            .first()
            .map(|kv| kv.weight.dims()[1])
            .ok_or_else(|| {
                IpAdapterError::shape_mismatch(
                    "ip_adapter weight count",
                    &[variant.widths().len()],
                    &[0],
                )
            })?;

        let [_, proj_in] = image_proj.proj_weight.dims();
        if proj_in != image_embed_dim {
            return Err(IpAdapterError::shape_mismatch(
                "image embedding width",
                &[proj_in],
                &[image_embed_dim],
            ));
        }

        let kv_bank = KvBank::from_weights(ip_adapter, variant.widths(), cross_attention_dim)?;
        let image_proj = ImageProjection::from_weights(image_proj, cross_attention_dim)?;

        tracing::info!(
            %variant,
            image_embed_dim,
            cross_attention_dim,
            num_tokens = image_proj.num_tokens(),
            layers = kv_bank.num_layers(),
            "built IP-Adapter"
        );

        Ok(Self {
            image_proj,
            kv_bank,
            variant,
        })
    }

    /// Load a `.safetensors` checkpoint, resolving the variant from `config`
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        config: &IpAdapterConfig,
        image_embed_dim: usize,
        device: &B::Device,
    ) -> Result<Self, IpAdapterError> {
        let checkpoint = IpAdapterCheckpoint::open(path, device)?;
        let variant = config.resolve_variant(image_embed_dim);
        Self::load_with_variant(checkpoint, image_embed_dim, variant)
    }

    pub fn variant(&self) -> ArchitectureVariant {
        self.variant
    }

    pub fn image_proj(&self) -> &ImageProjection<B> {
        &self.image_proj
    }

    pub fn kv_bank(&self) -> &KvBank<B> {
        &self.kv_bank
    }

    pub fn num_tokens(&self) -> usize {
        self.image_proj.num_tokens()
    }

    pub fn cross_attention_dim(&self) -> usize {
        self.image_proj.cross_attention_dim()
    }

    pub fn image_embed_dim(&self) -> usize {
        self.image_proj.image_embed_dim()
    }

    /// Move all weights to `device`
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            image_proj: self.image_proj.to_device(device),
            kv_bank: self.kv_bank.to_device(device),
            variant: self.variant,
        }
    }

    /// Compute conditioned and unconditioned image tokens
    ///
    /// `image_embeds` is a single embedding, `[1, image_embed_dim]`. The
    /// unconditioned tokens come from an all-zero embedding of the same
    /// shape, so they depend only on the weights.
    pub fn embed(
        &self,
        image_embeds: Tensor<B, 2>,
    ) -> Result<ConditioningEmbeddings<B>, IpAdapterError> {
        let dims = image_embeds.dims();
        if dims != [1, self.image_embed_dim()] {
            return Err(IpAdapterError::shape_mismatch(
                "image embedding",
                &[1, self.image_embed_dim()],
                &dims,
            ));
        }

        let zeros = image_embeds.zeros_like();
        let cond = self.image_proj.forward(image_embeds);
        let uncond = self.image_proj.forward(zeros);

        Ok(ConditioningEmbeddings { cond, uncond })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ipadapter_convert::{ImageProjWeights, KvWeight};
    use burn_ndarray::NdArray;

    pub(crate) type TestBackend = NdArray<f32>;

    /// Random checkpoint shaped for `variant`
    pub(crate) fn checkpoint(
        variant: ArchitectureVariant,
        image_embed_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
    ) -> IpAdapterCheckpoint<TestBackend> {
        let device = Default::default();
        let normal = Distribution::Normal(0.0, 0.1);
        let out_features = num_tokens * cross_attention_dim;

        let image_proj = ImageProjWeights {
            proj_weight: Tensor::random([out_features, image_embed_dim], normal, &device),
            proj_bias: Tensor::random([out_features], normal, &device),
            norm_weight: Tensor::ones([cross_attention_dim], &device),
            norm_bias: Tensor::zeros([cross_attention_dim], &device),
        };
        let ip_adapter = variant
            .widths()
            .iter()
            .enumerate()
            .map(|(i, &width)| KvWeight {
                name: format!("{}.to_{}_ip.weight", i / 2 * 2 + 1, ["k", "v"][i % 2]),
                weight: Tensor::random([width, cross_attention_dim], normal, &device),
            })
            .collect();

        IpAdapterCheckpoint::new(image_proj, ip_adapter)
    }

    #[test]
    fn test_load_classic() {
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 1024, 16, 4), 1024).unwrap();
        assert_eq!(adapter.variant(), ArchitectureVariant::Classic);
        assert_eq!(adapter.cross_attention_dim(), 16);
        assert_eq!(adapter.num_tokens(), 4);
        assert_eq!(adapter.kv_bank().len(), 32);
    }

    #[test]
    fn test_load_extra_large_from_width() {
        let adapter = IpAdapter::load(checkpoint(ArchitectureVariant::ExtraLarge, 1280, 8, 4), 1280)
            .unwrap();
        assert_eq!(adapter.variant(), ArchitectureVariant::ExtraLarge);
        assert_eq!(adapter.kv_bank().len(), 140);
        assert_eq!(adapter.kv_bank().num_layers(), 70);
    }

    #[test]
    fn test_load_variant_mismatch() {
        // An SDXL checkpoint with a 1024 embedding is classified Classic and rejected
        let err = IpAdapter::load(checkpoint(ArchitectureVariant::ExtraLarge, 1024, 8, 4), 1024)
            .unwrap_err();
        assert!(matches!(err, IpAdapterError::ShapeMismatch { .. }));

        // ...unless the variant is given explicitly
        let adapter = IpAdapter::load_with_variant(
            checkpoint(ArchitectureVariant::ExtraLarge, 1024, 8, 4),
            1024,
            ArchitectureVariant::ExtraLarge,
        )
        .unwrap();
        assert_eq!(adapter.kv_bank().len(), 140);
    }

    #[test]
    fn test_load_embed_width_mismatch() {
        let err = IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 1024, 8, 4), 768)
            .unwrap_err();
        assert!(err.to_string().contains("image embedding width"));
    }

    #[test]
    fn test_embed_shapes() {
        let device = Default::default();
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 32, 8, 4), 32).unwrap();
        let embeds = Tensor::<TestBackend, 2>::random([1, 32], Distribution::Default, &device);

        let out = adapter.embed(embeds).unwrap();
        assert_eq!(out.cond.dims(), [1, 4, 8]);
        assert_eq!(out.uncond.dims(), [1, 4, 8]);
        assert_eq!(out.num_tokens(), 4);
        assert_eq!(out.cross_attention_dim(), 8);
    }

    #[test]
    fn test_embed_deterministic() {
        let device = Default::default();
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 32, 8, 4), 32).unwrap();
        let embeds = Tensor::<TestBackend, 2>::random([1, 32], Distribution::Default, &device);

        let a = adapter.embed(embeds.clone()).unwrap();
        let b = adapter.embed(embeds).unwrap();
        let a_cond: Vec<f32> = a.cond.into_data().to_vec().unwrap();
        let b_cond: Vec<f32> = b.cond.into_data().to_vec().unwrap();
        assert_eq!(a_cond, b_cond);
    }

    #[test]
    fn test_to_device_keeps_outputs() {
        let device = Default::default();
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 32, 8, 4), 32).unwrap();
        let input = Tensor::<TestBackend, 2>::random([1, 32], Distribution::Default, &device);

        let before = adapter.embed(input.clone()).unwrap();
        let (before_k, _) = adapter.kv_bank().project(3, before.cond.clone()).unwrap();

        let moved = adapter.to_device(&device);
        assert_eq!(moved.variant(), ArchitectureVariant::Classic);
        assert_eq!(moved.num_tokens(), 4);
        assert_eq!(moved.kv_bank().len(), 32);

        let after = moved.embed(input).unwrap();
        let (after_k, _) = moved.kv_bank().project(3, after.cond.clone()).unwrap();

        let to_vec = |t: Tensor<TestBackend, 3>| -> Vec<f32> { t.into_data().to_vec().unwrap() };
        assert_eq!(to_vec(before.cond), to_vec(after.cond));
        assert_eq!(to_vec(before.uncond), to_vec(after.uncond));
        assert_eq!(to_vec(before_k), to_vec(after_k));
    }

    #[test]
    fn test_uncond_ignores_embedding_values() {
        let device = Default::default();
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 32, 8, 4), 32).unwrap();

        let first = adapter
            .embed(Tensor::random([1, 32], Distribution::Default, &device))
            .unwrap();
        let second = adapter
            .embed(Tensor::ones([1, 32], &device) * 5.0)
            .unwrap();

        let first_uncond: Vec<f32> = first.uncond.into_data().to_vec().unwrap();
        let second_uncond: Vec<f32> = second.uncond.into_data().to_vec().unwrap();
        assert_eq!(first_uncond, second_uncond);

        let first_cond: Vec<f32> = first.cond.into_data().to_vec().unwrap();
        let second_cond: Vec<f32> = second.cond.into_data().to_vec().unwrap();
        assert_ne!(first_cond, second_cond);
    }

    #[test]
    fn test_embed_rejects_batches() {
        let device = Default::default();
        let adapter =
            IpAdapter::load(checkpoint(ArchitectureVariant::Classic, 32, 8, 4), 32).unwrap();
        let err = adapter
            .embed(Tensor::zeros([2, 32], &device))
            .unwrap_err();
        assert!(matches!(err, IpAdapterError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_file() {
        use safetensors::Dtype;
        use safetensors::tensor::TensorView;
        use std::collections::HashMap;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ip-adapter_sd15.safetensors");

        // 2 tokens of dim 8 from a 16-wide embedding
        let mut entries: Vec<(String, Vec<usize>)> = vec![
            ("image_proj.proj.weight".into(), vec![16, 16]),
            ("image_proj.proj.bias".into(), vec![16]),
            ("image_proj.norm.weight".into(), vec![8]),
            ("image_proj.norm.bias".into(), vec![8]),
        ];
        let widths = ArchitectureVariant::Classic.widths();
        for (layer, pair) in widths.chunks_exact(2).enumerate() {
            let n = layer * 2 + 1;
            entries.push((format!("ip_adapter.{n}.to_k_ip.weight"), vec![pair[0], 8]));
            entries.push((format!("ip_adapter.{n}.to_v_ip.weight"), vec![pair[1], 8]));
        }

        let buffers: Vec<Vec<u8>> = entries
            .iter()
            .map(|(_, shape)| {
                let len = shape.iter().product::<usize>();
                (0..len).flat_map(|i| (i as f32 * 1e-3).to_le_bytes()).collect()
            })
            .collect();
        let views: HashMap<String, TensorView<'_>> = entries
            .iter()
            .zip(&buffers)
            .map(|((name, shape), bytes)| {
                let view = TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap();
                (name.clone(), view)
            })
            .collect();
        let bytes = safetensors::serialize(&views, &None::<HashMap<String, String>>).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let device = Default::default();
        let adapter =
            IpAdapter::<TestBackend>::from_file(&path, &IpAdapterConfig::default(), 16, &device)
                .unwrap();
        assert_eq!(adapter.variant(), ArchitectureVariant::Classic);
        assert_eq!(adapter.num_tokens(), 2);
        assert_eq!(adapter.cross_attention_dim(), 8);
        assert_eq!(adapter.kv_bank().len(), 32);
        assert_eq!(adapter.kv_bank().width(30), Some(1280));

        let embeds = adapter.embed(Tensor::ones([1, 16], &device)).unwrap();
        assert_eq!(embeds.cond.dims(), [1, 2, 8]);

        // Forcing SDXL on a 32-entry checkpoint is a shape error
        let err = IpAdapter::<TestBackend>::from_file(
            &path,
            &IpAdapterConfig::extra_large(),
            16,
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, IpAdapterError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_random_init() {
        let device = Default::default();
        let adapter =
            IpAdapter::<TestBackend>::new(ArchitectureVariant::ExtraLarge, 1280, 8, 4, &device);
        assert_eq!(adapter.kv_bank().len(), 140);
        assert_eq!(adapter.image_embed_dim(), 1280);
        assert_eq!(adapter.num_tokens(), 4);
    }
}
