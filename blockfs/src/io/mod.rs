mod image;
mod storage;

pub use image::{DiskImage, DiskImageBuilder};
pub use storage::Storage;
