pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod ops;
pub mod quantizer;
mod utils;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Module, VarBuilder, VarMap};
use config::VqModelConfig;
use decoder::Decoder;
use encoder::Encoder;
use quantizer::VectorQuantizer;

/// Encoder -> 1x1 conv -> codebook -> 1x1 conv -> decoder
pub struct VqModel {
    encoder: Encoder,
    decoder: Decoder,
    quantize: VectorQuantizer,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    pub cfg: VqModelConfig,
    pub device: Device,
}

impl VqModel {
    /// Every parameter comes from `vb`, which also fixes the device and dtype.
    ///
    /// Checkpoints are not restored here; see [`checkpoint::load_checkpoint_non_strict`].
    pub fn load(vb: VarBuilder, cfg: &VqModelConfig) -> Result<Self> {
        let dd = &cfg.ddconfig;
        let encoder = Encoder::load(vb.pp("encoder"), dd)?;
        let decoder = Decoder::load(vb.pp("decoder"), dd)?;
        let quantize =
            VectorQuantizer::load(vb.pp("quantize"), cfg.n_embed, cfg.embed_dim, cfg.beta)?;
        let quant_conv = conv2d(
            dd.z_channels,
            cfg.embed_dim,
            1,
            Default::default(),
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = conv2d(
            cfg.embed_dim,
            dd.z_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;

        Ok(Self {
            encoder,
            decoder,
            quantize,
            quant_conv,
            post_quant_conv,
            cfg: cfg.clone(),
            device: vb.device().clone(),
        })
    }

    /// Freshly initialised, trainable model. Parameters are registered in the returned map.
    pub fn new(cfg: &VqModelConfig, dtype: DType, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let model = Self::load(vb, cfg)?;
        Ok((model, varmap))
    }

    /// `(b, c, r, r)` image -> `(quantized, embedding_loss, indices)`
    pub fn encode(&self, image: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let h = self.encoder.forward(image)?;
        let h = self.quant_conv.forward(&h)?;
        self.quantize.forward(&h)
    }

    /// `encode` plus the codebook perplexity of the batch
    pub fn encode_with_stats(&self, image: &Tensor) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let h = self.encoder.forward(image)?;
        let h = self.quant_conv.forward(&h)?;
        self.quantize.forward_with_stats(&h)
    }

    pub fn decode(&self, quant: &Tensor) -> Result<Tensor> {
        let quant = self.post_quant_conv.forward(quant)?;
        self.decoder.forward(&quant)
    }

    /// Decode `(b, h, w)` codebook indices without going through the encoder
    pub fn decode_code(&self, indices: &Tensor) -> Result<Tensor> {
        let quant = self.quantize.embed_code(indices)?;
        self.decode(&quant)
    }

    /// `(reconstruction, embedding_loss)`
    pub fn forward(&self, image: &Tensor) -> Result<(Tensor, Tensor)> {
        let (quant, diff, _indices) = self.encode(image)?;
        let dec = self.decode(&quant)?;
        Ok((dec, diff))
    }

    pub fn quantizer(&self) -> &VectorQuantizer {
        &self.quantize
    }

    pub fn last_layer_weight(&self) -> &Tensor {
        self.decoder.last_layer_weight()
    }

    /// Adversarial loss weight for this step, measured at the decoder's last layer
    pub fn calculate_lambda(&self, nll_loss: &Tensor, gan_loss: &Tensor) -> crate::Result<Tensor> {
        loss::calculate_lambda(nll_loss, gan_loss, self.last_layer_weight())
    }

    pub fn adopt_weight(disc_factor: f64, step: usize, threshold: usize, value: f64) -> f64 {
        loss::adopt_weight(disc_factor, step, threshold, value)
    }
}
