pub mod straight_through;

pub use straight_through::straight_through;
