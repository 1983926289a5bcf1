use clap;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhichModel {
    /// 16x downsampling, 1024 codes of dim 256
    #[value(name = "f16")]
    F16,

    /// Two-level toy model for smoke runs
    #[value(name = "tiny")]
    Tiny,
}
