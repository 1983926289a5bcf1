pub mod image_pos;

pub use image_pos::ImagePosEmbeddings;
