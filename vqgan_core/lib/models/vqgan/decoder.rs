use super::config::DdConfig;
use super::utils::{normalize, AttnBlock, Level, MidBlock, ResnetBlock, Upsample};
use candle_core::{bail, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, Module, VarBuilder};

/// Continuous latent grid -> image, mirror of the encoder
pub struct Decoder {
    conv_in: Conv2d,
    mid: MidBlock,
    /// Indexed by level, applied from the deepest level up
    up: Vec<(Level, Option<Upsample>)>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn load(vb: VarBuilder, cfg: &DdConfig) -> Result<Self> {
        if cfg.ch_mult.is_empty() {
            bail!("decoder needs at least one level, ch_mult is empty")
        }
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let num_levels = cfg.ch_mult.len();
        let mut block_in = cfg.ch * cfg.ch_mult[num_levels - 1];
        let mut curr_res = cfg.resolution / cfg.downsample_factor();

        let conv_in = conv2d(cfg.z_channels, block_in, 3, conv_cfg, vb.pp("conv_in"))?;
        let mid = MidBlock::load(vb.pp("mid"), block_in)?;

        let mut up = Vec::with_capacity(num_levels);
        for i_level in (0..num_levels).rev() {
            let vb_level = vb.pp(format!("up.{}", i_level));
            let block_out = cfg.ch * cfg.ch_mult[i_level];

            let mut block = Vec::with_capacity(cfg.num_res_blocks + 1);
            let mut attn = vec![];
            for i_block in 0..cfg.num_res_blocks + 1 {
                block.push(ResnetBlock::load(
                    vb_level.pp(format!("block.{}", i_block)),
                    block_in,
                    block_out,
                )?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attn.push(AttnBlock::load(
                        vb_level.pp(format!("attn.{}", i_block)),
                        block_in,
                    )?);
                }
            }

            let upsample = if i_level != 0 {
                curr_res *= 2;
                Some(Upsample::load(vb_level.pp("upsample"), block_in)?)
            } else {
                None
            };
            up.push((Level { block, attn }, upsample));
        }
        // Built deepest first; store by level index like the checkpoint does
        up.reverse();

        let norm_out = normalize(vb.pp("norm_out"), block_in)?;
        let conv_out = conv2d(block_in, cfg.out_ch, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            mid,
            up,
            norm_out,
            conv_out,
        })
    }

    /// Weight of the final conv, the reference point for adaptive loss weighting
    pub fn last_layer_weight(&self) -> &Tensor {
        self.conv_out.weight()
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.conv_in.forward(z)?;
        let mut h = self.mid.forward(&h)?;
        for (level, upsample) in self.up.iter().rev() {
            h = level.forward(&h)?;
            if let Some(upsample) = upsample {
                h = upsample.forward(&h)?;
            }
        }
        let h = self.norm_out.forward(&h)?.silu()?;
        self.conv_out.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vqgan::config::VqModelConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_tiny_decoder_shape() {
        let device = Device::Cpu;
        let cfg = VqModelConfig::tiny().ddconfig;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::load(vb, &cfg).unwrap();

        let z = Tensor::randn(0f32, 1.0, (1, cfg.z_channels, 8, 8), &device).unwrap();
        let image = decoder.forward(&z).unwrap();
        assert_eq!(image.dims(), &[1, cfg.out_ch, 16, 16]);
        assert_eq!(decoder.last_layer_weight().dims(), &[cfg.out_ch, cfg.ch, 3, 3]);
    }

    #[test]
    fn test_parameter_layout() {
        let device = Device::Cpu;
        let cfg = VqModelConfig::tiny().ddconfig;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Decoder::load(vb, &cfg).unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("up.1.upsample.conv.weight"));
        assert!(!data.contains_key("up.0.upsample.conv.weight"));
        // num_res_blocks + 1 blocks per level
        assert!(data.contains_key("up.0.block.1.conv2.weight"));
        assert!(data.contains_key("up.1.attn.1.proj_out.weight"));
    }

    #[test]
    fn test_empty_ch_mult_is_an_error() {
        let device = Device::Cpu;
        let mut cfg = VqModelConfig::tiny().ddconfig;
        cfg.ch_mult = vec![];
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(Decoder::load(vb, &cfg).is_err());
    }
}
