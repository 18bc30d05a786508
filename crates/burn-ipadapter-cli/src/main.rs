//! burn-ipadapter CLI
//!
//! Inspect IP-Adapter checkpoints and compute image conditioning tokens on
//! the CPU.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use burn::prelude::*;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};

use burn_ipadapter::{
    ArchitectureVariant, ConditioningEmbeddings, IpAdapter, IpAdapterConfig, IpAdapterContext,
    ModelPatcher, UNetAttentionLayout, enumerate, install,
};
use burn_ipadapter_convert::{
    IMAGE_PROJ_GROUP, IP_ADAPTER_GROUP, IpAdapterCheckpoint, SafeTensorFile,
};

mod logging;

type B = NdArray<f32>;

#[derive(Parser)]
#[command(name = "burn-ipadapter")]
#[command(about = "IP-Adapter image prompt conditioning for Burn")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the layer binding order and projection widths of a variant
    Topology {
        #[arg(long, value_enum, default_value = "classic")]
        variant: VariantArg,
    },

    /// Show the structure of an IP-Adapter checkpoint
    Inspect {
        /// IP-Adapter checkpoint (.safetensors)
        checkpoint: PathBuf,

        /// Image embedding width (default: read from the checkpoint)
        #[arg(long)]
        embed_dim: Option<usize>,

        /// Architecture override (default: inferred from the embedding width)
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,

        /// List every tensor in the file
        #[arg(long)]
        tensors: bool,
    },

    /// Compute conditioning tokens for a CLIP image embedding and patch the
    /// reference UNet layout
    Embed {
        /// IP-Adapter checkpoint (.safetensors)
        checkpoint: PathBuf,

        /// Safetensors file holding the image embedding, `[D]` or `[1, D]`
        #[arg(long)]
        embedding: PathBuf,

        /// Tensor name of the embedding
        #[arg(long, default_value = "image_embeds")]
        key: String,

        /// Image attention weight
        #[arg(long, default_value = "1.0", allow_negative_numbers = true)]
        weight: f32,

        /// Architecture override (default: inferred from the embedding width)
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    /// SD 1.x / 2.x (16 cross-attention layers)
    Classic,
    /// SDXL (70 cross-attention layers)
    Sdxl,
}

impl From<VariantArg> for ArchitectureVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Classic => ArchitectureVariant::Classic,
            VariantArg::Sdxl => ArchitectureVariant::ExtraLarge,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Topology { variant } => run_topology(variant.into()),
        Commands::Inspect {
            checkpoint,
            embed_dim,
            variant,
            tensors,
        } => run_inspect(&checkpoint, embed_dim, variant.map(Into::into), tensors),
        Commands::Embed {
            checkpoint,
            embedding,
            key,
            weight,
            variant,
        } => {
            let config = IpAdapterConfig {
                weight,
                variant: variant.map(Into::into),
            };
            run_embed(&checkpoint, &embedding, &key, &config)
        }
    }
}

fn reference_layout(variant: ArchitectureVariant) -> UNetAttentionLayout {
    match variant {
        ArchitectureVariant::Classic => UNetAttentionLayout::sd1x(),
        ArchitectureVariant::ExtraLarge => UNetAttentionLayout::sdxl(),
    }
}

fn run_topology(variant: ArchitectureVariant) -> Result<()> {
    let widths = variant.widths();
    let layout = reference_layout(variant);

    println!("Variant: {variant}");
    println!(
        "Layers: {} ({} key/value projections)\n",
        variant.num_layers(),
        widths.len()
    );
    println!(
        "{:>5}  {:<14} {:>6}  {:>5}  {:>8}",
        "layer", "position", "width", "heads", "head_dim"
    );

    for binding in enumerate(variant) {
        let width = widths[binding.key_slot()];
        let (heads, head_dim) = layout
            .get(&binding.position)
            .map(|spec| (spec.options.n_heads, spec.options.dim_head))
            .unwrap_or_default();
        println!(
            "{:>5}  {:<14} {:>6}  {:>5}  {:>8}",
            binding.layer,
            binding.position.to_string(),
            width,
            heads,
            head_dim
        );
    }

    Ok(())
}

fn run_inspect(
    path: &Path,
    embed_dim: Option<usize>,
    variant: Option<ArchitectureVariant>,
    list_tensors: bool,
) -> Result<()> {
    let file = SafeTensorFile::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    println!("File: {}", path.display());
    println!("Total tensors: {}", file.len());
    println!(
        "  {IMAGE_PROJ_GROUP}: {}",
        file.names_with_prefix(IMAGE_PROJ_GROUP).count()
    );
    println!(
        "  {IP_ADAPTER_GROUP}: {}",
        file.names_with_prefix(IP_ADAPTER_GROUP).count()
    );

    if list_tensors {
        println!();
        for name in file.names() {
            let shape = file.shape(name).unwrap_or_default();
            let dtype = file
                .dtype(name)
                .map(|dtype| format!("{dtype:?}"))
                .unwrap_or_default();
            println!("{name}: {shape:?} ({dtype})");
        }
    }

    let device = Default::default();
    let checkpoint = IpAdapterCheckpoint::<B>::from_file(&file, &device)
        .context("Failed to read IP-Adapter weights")?;
    let embed_dim = embed_dim.unwrap_or_else(|| {
        let width = checkpoint.image_embed_dim();
        tracing::info!(width, "using image embedding width from the checkpoint");
        width
    });

    let config = IpAdapterConfig {
        variant,
        ..IpAdapterConfig::default()
    };
    let variant = config.resolve_variant(embed_dim);

    let adapter = IpAdapter::load_with_variant(checkpoint, embed_dim, variant)
        .context("Checkpoint does not match the adapter topology")?;

    println!();
    println!("Variant: {}", adapter.variant());
    println!("Image embedding width: {}", adapter.image_embed_dim());
    println!("Cross-attention dim: {}", adapter.cross_attention_dim());
    println!("Tokens: {}", adapter.num_tokens());
    println!(
        "Key/value projections: {} ({} layers)",
        adapter.kv_bank().len(),
        adapter.kv_bank().num_layers()
    );

    Ok(())
}

fn load_embedding(path: &Path, key: &str, device: &NdArrayDevice) -> Result<Tensor<B, 2>> {
    let file = SafeTensorFile::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let shape = file
        .shape(key)
        .with_context(|| format!("No tensor named {key} in {}", path.display()))?
        .to_vec();

    tracing::debug!(key, ?shape, path = %path.display(), "loading image embedding");

    match shape.as_slice() {
        [width] => {
            let embedding = file.load_f32::<B, 1>(key, device)?;
            Ok(embedding.reshape([1, *width]))
        }
        [1, _] => Ok(file.load_f32::<B, 2>(key, device)?),
        other => bail!("Expected an embedding of shape [D] or [1, D], got {other:?}"),
    }
}

/// Install already computed tokens on the reference layout of the adapter's variant
fn patch_reference(
    adapter: IpAdapter<B>,
    embeds: ConditioningEmbeddings<B>,
    config: &IpAdapterConfig,
) -> Result<ModelPatcher<B, UNetAttentionLayout>> {
    let variant = adapter.variant();
    if !config.weight_in_range() {
        tracing::warn!(weight = config.weight, "IP-Adapter weight outside [-1, 3]");
    }

    let host = ModelPatcher::new(reference_layout(variant));
    let context = Arc::new(IpAdapterContext::new(adapter, embeds, config.weight));
    Ok(install(&host, context, variant)?)
}

fn run_embed(
    checkpoint: &Path,
    embedding: &Path,
    key: &str,
    config: &IpAdapterConfig,
) -> Result<()> {
    let device = Default::default();

    let image_embeds = load_embedding(embedding, key, &device)?;
    let [_, embed_dim] = image_embeds.dims();

    let adapter = IpAdapter::<B>::from_file(checkpoint, config, embed_dim, &device)
        .with_context(|| format!("Failed to load {}", checkpoint.display()))?;
    let variant = adapter.variant();

    let embeds = adapter.embed(image_embeds)?;
    let cond_norm: f32 = embeds.cond.clone().powf_scalar(2.0).sum().sqrt().into_scalar();
    let uncond_norm: f32 = embeds.uncond.clone().powf_scalar(2.0).sum().sqrt().into_scalar();
    tracing::debug!(cond_norm, uncond_norm, "computed conditioning tokens");

    println!("Variant: {variant}");
    println!("Conditioned tokens: {:?} (norm {cond_norm:.4})", embeds.cond.dims());
    println!("Unconditioned tokens: {:?} (norm {uncond_norm:.4})", embeds.uncond.dims());

    let patched = patch_reference(adapter, embeds, config)
        .context("Failed to patch the reference UNet")?;

    println!(
        "Patched {} cross-attention layers at weight {}",
        patched.num_patches(),
        config.weight
    );

    Ok(())
}
