use candle_core::{Result, Tensor, D};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, Module, VarBuilder};

/// GroupNorm(32) with the eps the taming checkpoints were trained with
pub fn normalize(vb: VarBuilder, channels: usize) -> Result<GroupNorm> {
    group_norm(32, channels, 1e-6, vb)
}

fn conv3x3(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Conv2d> {
    conv2d(
        in_channels,
        out_channels,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )
}

fn conv1x1(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Conv2d> {
    conv2d(in_channels, out_channels, 1, Default::default(), vb)
}

#[derive(Clone, Debug)]
pub struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    pub fn load(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let norm1 = normalize(vb.pp("norm1"), in_channels)?;
        let conv1 = conv3x3(vb.pp("conv1"), in_channels, out_channels)?;
        let norm2 = normalize(vb.pp("norm2"), out_channels)?;
        // Dropout sits between norm2 and conv2 upstream; inference only here
        let conv2 = conv3x3(vb.pp("conv2"), out_channels, out_channels)?;
        let nin_shortcut = if in_channels != out_channels {
            Some(conv1x1(vb.pp("nin_shortcut"), in_channels, out_channels)?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(xs)?.silu()?;
        let h = self.conv1.forward(&h)?;
        let h = self.norm2.forward(&h)?.silu()?;
        let h = self.conv2.forward(&h)?;
        match &self.nin_shortcut {
            Some(shortcut) => shortcut.forward(xs)? + h,
            None => xs + h,
        }
    }
}

/// Single-head spatial self-attention over all `h * w` positions
#[derive(Clone, Debug)]
pub struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            norm: normalize(vb.pp("norm"), channels)?,
            q: conv1x1(vb.pp("q"), channels, channels)?,
            k: conv1x1(vb.pp("k"), channels, channels)?,
            v: conv1x1(vb.pp("v"), channels, channels)?,
            proj_out: conv1x1(vb.pp("proj_out"), channels, channels)?,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let h_ = self.norm.forward(xs)?;

        // b c h w -> b (hw) c
        let q = self
            .q
            .forward(&h_)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self.k.forward(&h_)?.reshape((b, c, h * w))?;
        let v = self.v.forward(&h_)?.reshape((b, c, h * w))?;

        // attn[b, i, j] = softmax_j(q_i . k_j / sqrt(c))
        let attn = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;

        let out = v.matmul(&attn.transpose(1, 2)?.contiguous()?)?;
        let out = self.proj_out.forward(&out.reshape((b, c, h, w))?)?;
        xs + out
    }
}

/// Strided 3x3 conv with asymmetric (right/bottom) padding
#[derive(Clone, Debug)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self { conv })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs
            .pad_with_zeros(D::Minus1, 0, 1)?
            .pad_with_zeros(D::Minus2, 0, 1)?;
        self.conv.forward(&xs)
    }
}

/// Nearest-neighbour 2x followed by a 3x3 conv
#[derive(Clone, Debug)]
pub struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            conv: conv3x3(vb.pp("conv"), channels, channels)?,
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        let xs = xs.upsample_nearest2d(h * 2, w * 2)?;
        self.conv.forward(&xs)
    }
}

/// Res blocks with optional attention after each, as stored under `down.{i}` / `up.{i}`
#[derive(Clone, Debug)]
pub struct Level {
    pub block: Vec<ResnetBlock>,
    pub attn: Vec<AttnBlock>,
}

impl Module for Level {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, block) in self.block.iter().enumerate() {
            xs = block.forward(&xs)?;
            if let Some(attn) = self.attn.get(i) {
                xs = attn.forward(&xs)?;
            }
        }
        Ok(xs)
    }
}

#[derive(Clone, Debug)]
pub struct MidBlock {
    block_1: ResnetBlock,
    attn_1: AttnBlock,
    block_2: ResnetBlock,
}

impl MidBlock {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            block_1: ResnetBlock::load(vb.pp("block_1"), channels, channels)?,
            attn_1: AttnBlock::load(vb.pp("attn_1"), channels)?,
            block_2: ResnetBlock::load(vb.pp("block_2"), channels, channels)?,
        })
    }
}

impl Module for MidBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.block_1.forward(xs)?;
        let xs = self.attn_1.forward(&xs)?;
        self.block_2.forward(&xs)
    }
}
