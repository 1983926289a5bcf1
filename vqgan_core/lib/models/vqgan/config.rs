use crate::config::WhichModel;
use crate::error::Result;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Encoder / decoder hyperparameters, named as in the taming `ddconfig` dict
#[derive(Debug, Clone, Deserialize)]
pub struct DdConfig {
    pub double_z: bool,
    pub z_channels: usize,
    pub resolution: usize,
    pub in_channels: usize,
    pub out_ch: usize,
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
    /// Unused except for training
    pub dropout: f64,
}

impl Default for DdConfig {
    fn default() -> Self {
        Self {
            double_z: false,
            z_channels: 256,
            resolution: 256,
            in_channels: 3,
            out_ch: 3,
            ch: 128,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            attn_resolutions: vec![16],
            dropout: 0.0,
        }
    }
}

impl DdConfig {
    /// Spatial downsampling between image and latent grid
    pub fn downsample_factor(&self) -> usize {
        1 << self.ch_mult.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VqModelConfig {
    pub ddconfig: DdConfig,
    pub n_embed: usize,
    pub embed_dim: usize,
    #[serde(default = "default_beta")]
    pub beta: f64,
}

fn default_beta() -> f64 {
    0.25
}

impl VqModelConfig {
    /// f16 image tokenizer: 256px in, 16x16 grid of 1024 codes out
    pub fn f16_1024() -> Self {
        Self {
            ddconfig: DdConfig::default(),
            n_embed: 1024,
            embed_dim: 256,
            beta: default_beta(),
        }
    }

    pub fn tiny() -> Self {
        Self {
            ddconfig: DdConfig {
                z_channels: 8,
                resolution: 16,
                ch: 32,
                ch_mult: vec![1, 2],
                num_res_blocks: 1,
                attn_resolutions: vec![8],
                ..Default::default()
            },
            n_embed: 16,
            embed_dim: 8,
            beta: default_beta(),
        }
    }

    pub fn get_config_for(model: WhichModel) -> Self {
        match model {
            WhichModel::F16 => Self::f16_1024(),
            WhichModel::Tiny => Self::tiny(),
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_downsample_factor() {
        let cfg = VqModelConfig::f16_1024();
        assert_eq!(cfg.ddconfig.downsample_factor(), 16);
        assert_eq!(cfg.ddconfig.resolution / cfg.ddconfig.downsample_factor(), 16);
    }

    #[test]
    fn test_from_json_defaults_beta() {
        let json = r#"{
            "ddconfig": {
                "double_z": false, "z_channels": 4, "resolution": 8,
                "in_channels": 3, "out_ch": 3, "ch": 32, "ch_mult": [1, 2],
                "num_res_blocks": 1, "attn_resolutions": [], "dropout": 0.0
            },
            "n_embed": 8,
            "embed_dim": 4
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();

        let cfg = VqModelConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.n_embed, 8);
        assert_eq!(cfg.beta, 0.25);
        assert_eq!(cfg.ddconfig.downsample_factor(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = VqModelConfig::from_json_file("does/not/exist.json").unwrap_err();
        assert!(matches!(err, crate::VqError::Io(_)));
    }
}
