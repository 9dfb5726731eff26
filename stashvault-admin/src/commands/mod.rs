pub mod config;
pub mod image;
pub mod key;
pub mod rotation;

pub use config::*;
pub use image::*;
pub use key::*;
pub use rotation::*;
