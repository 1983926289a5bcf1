pub mod config;
pub mod error;
pub mod lm;
pub mod models;

pub use error::{Result, VqError};
