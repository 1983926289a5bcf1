use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueHint};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use vqgan_core::config::WhichModel;
use vqgan_core::models::vqgan::checkpoint::load_checkpoint_non_strict;
use vqgan_core::models::vqgan::config::VqModelConfig;
use vqgan_core::models::vqgan::VqModel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input image tensor, (3, H, W) or (B, 3, H, W) in .npy format
    #[arg(short = 'i', long = "input", value_hint = ValueHint::FilePath)]
    src_image: PathBuf,

    /// Output codebook indices
    #[arg(
        short = 'o',
        long = "output-path",
        value_hint = ValueHint::FilePath,
        default_value = "codes.npy"
    )]
    dest_codes: PathBuf,

    /// Model weights (.safetensors or .pth). Missing keys keep their initialisation
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    /// JSON model config; overrides --model
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "f16")]
    model: WhichModel,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;

    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;

    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    let device = Device::Cpu;

    let config = match &args.config {
        Some(path) => VqModelConfig::from_json_file(path)?,
        None => VqModelConfig::get_config_for(args.model),
    };

    let (model, varmap) = VqModel::new(&config, DType::F32, &device)?;
    if let Some(checkpoint) = &args.checkpoint {
        let report = load_checkpoint_non_strict(&varmap, checkpoint)?;
        println!(
            "Loaded {} tensors ({} missing, {} unexpected, {} mismatched)",
            report.loaded,
            report.missing.len(),
            report.unexpected.len(),
            report.mismatched.len()
        );
    }
    println!("Using device {:?}", device);

    let mut image = Tensor::read_npy(&args.src_image)?
        .to_dtype(DType::F32)?
        .to_device(&device)?;
    if image.rank() == 3 {
        // Add spurious batch dimension for consistency
        image = image.unsqueeze(0)?;
    }
    println!("Encoding image batch of shape {:?}", image.shape());

    let start = Instant::now();
    let (_quant, _loss, indices, perplexity) = model.encode_with_stats(&image)?;
    let dt = start.elapsed();
    println!(
        "Encoded in {:.2}s, codebook perplexity {:.2}",
        dt.as_secs_f64(),
        perplexity.to_scalar::<f32>()?
    );

    println!("Generated indices of shape {:?}", indices.shape());
    indices.to_dtype(DType::I64)?.write_npy(args.dest_codes)?;

    Ok(())
}
