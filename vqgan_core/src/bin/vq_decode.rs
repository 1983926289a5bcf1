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
    /// Codebook indices, (H, W) or (B, H, W) in .npy format
    #[arg(short = 'i', long = "input", value_hint = ValueHint::FilePath)]
    src_codes: PathBuf,

    /// Output image tensor
    #[arg(
        short = 'o',
        long = "output-path",
        value_hint = ValueHint::FilePath,
        default_value = "decoded.npy"
    )]
    dest_image: PathBuf,

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
        load_checkpoint_non_strict(&varmap, checkpoint)?;
    }
    println!("Using device {:?}", device);

    let mut codes = Tensor::read_npy(&args.src_codes)?
        .to_dtype(DType::U32)?
        .to_device(&device)?;
    if codes.rank() == 2 {
        codes = codes.unsqueeze(0)?;
    }
    let max_code = codes.flatten_all()?.max(0)?.to_scalar::<u32>()?;
    if max_code as usize >= config.n_embed {
        anyhow::bail!(
            "code {} out of range for a codebook of {} entries",
            max_code,
            config.n_embed
        );
    }

    let start = Instant::now();
    let image = model.decode_code(&codes)?;
    println!(
        "Decoded {:?} codes in {:.2}s",
        codes.shape(),
        start.elapsed().as_secs_f64()
    );

    image.to_dtype(DType::F32)?.write_npy(args.dest_image)?;
    println!("Wrote image tensor of shape {:?}", image.shape());

    Ok(())
}
