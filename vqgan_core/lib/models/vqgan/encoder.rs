use super::config::DdConfig;
use super::utils::{normalize, AttnBlock, Downsample, Level, MidBlock, ResnetBlock};
use candle_core::{bail, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, Module, VarBuilder};

/// Image -> continuous latent grid, `(b, in_channels, r, r)` -> `(b, z_channels, r / f, r / f)`
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<(Level, Option<Downsample>)>,
    mid: MidBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    pub fn load(vb: VarBuilder, cfg: &DdConfig) -> Result<Self> {
        if cfg.ch_mult.is_empty() {
            bail!("encoder needs at least one level, ch_mult is empty")
        }
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(cfg.in_channels, cfg.ch, 3, conv_cfg, vb.pp("conv_in"))?;

        let num_levels = cfg.ch_mult.len();
        let mut curr_res = cfg.resolution;
        let mut block_in = cfg.ch;
        let mut down = Vec::with_capacity(num_levels);
        for (i_level, mult) in cfg.ch_mult.iter().enumerate() {
            let vb_level = vb.pp(format!("down.{}", i_level));
            let block_out = cfg.ch * mult;

            let mut block = Vec::with_capacity(cfg.num_res_blocks);
            let mut attn = vec![];
            for i_block in 0..cfg.num_res_blocks {
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

            let downsample = if i_level != num_levels - 1 {
                curr_res /= 2;
                Some(Downsample::load(vb_level.pp("downsample"), block_in)?)
            } else {
                None
            };
            down.push((Level { block, attn }, downsample));
        }

        let mid = MidBlock::load(vb.pp("mid"), block_in)?;
        let norm_out = normalize(vb.pp("norm_out"), block_in)?;
        let z_out = if cfg.double_z {
            2 * cfg.z_channels
        } else {
            cfg.z_channels
        };
        let conv_out = conv2d(block_in, z_out, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            down,
            mid,
            norm_out,
            conv_out,
        })
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?;
        for (level, downsample) in self.down.iter() {
            h = level.forward(&h)?;
            if let Some(downsample) = downsample {
                h = downsample.forward(&h)?;
            }
        }
        let h = self.mid.forward(&h)?;
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
    fn test_tiny_encoder_shape() {
        let device = Device::Cpu;
        let cfg = VqModelConfig::tiny().ddconfig;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::load(vb, &cfg).unwrap();

        let image = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device).unwrap();
        let z = encoder.forward(&image).unwrap();
        assert_eq!(z.dims(), &[2, cfg.z_channels, 8, 8]);
    }

    #[test]
    fn test_attention_only_at_configured_resolution() {
        let device = Device::Cpu;
        let cfg = VqModelConfig::tiny().ddconfig;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Encoder::load(vb, &cfg).unwrap();

        let data = varmap.data().lock().unwrap();
        // 16px at level 0, 8px at level 1
        assert!(!data.contains_key("down.0.attn.0.q.weight"));
        assert!(data.contains_key("down.1.attn.0.q.weight"));
        assert!(data.contains_key("down.0.downsample.conv.weight"));
        assert!(!data.contains_key("down.1.downsample.conv.weight"));
    }

    #[test]
    fn test_empty_ch_mult_is_an_error() {
        let device = Device::Cpu;
        let mut cfg = VqModelConfig::tiny().ddconfig;
        cfg.ch_mult = vec![];
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(Encoder::load(vb, &cfg).is_err());
    }
}
