mod alloc;
mod entry;
mod fs;
pub mod io;
mod layout;

pub use crate::fs::{FileStore, FsError, Result};
pub use crate::layout::{Geometry, Layout};

use std::path::Path;

impl FileStore<io::DiskImage> {
    /// Opens the image file at `path`, creating and formatting it when it does
    /// not exist yet or is empty.
    ///
    /// # Layout
    /// ==========================================================
    /// | Entries | Nodes | padding | Data Region (max_blocks)   |
    /// ==========================================================
    pub fn open_path<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let dev = io::DiskImage::open(path, geometry)?;
        FileStore::open(dev, geometry)
    }
}
