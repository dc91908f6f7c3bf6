use crate::io::Storage;
use crate::layout::{Geometry, Layout};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

/// A disk image stored in a regular host file.
///
/// All access goes through the file's single cursor (seek, then read or write),
/// so a `DiskImage` must never be used from two threads at once without an
/// outer lock.
pub struct DiskImage {
    fd: File,
    /// The number of bytes the image may span. Accesses beyond this are
    /// rejected even if the host file happens to be longer.
    capacity: u64,
}

impl DiskImage {
    /// Opens an image file at `path`, creating an empty one if it does not
    /// exist. Existing contents are preserved.
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> std::io::Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        DiskImageBuilder::from(fd)
            .with_geometry(geometry)
            .clear_medium(false)
            .build()
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, offset: u64, len: usize) -> std::io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "access exceeds disk image capacity",
            )),
        }
    }
}

impl Storage for DiskImage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }

    fn len(&mut self) -> std::io::Result<u64> {
        Ok(self.fd.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        self.fd.set_len(len)
    }
}

pub struct DiskImageBuilder {
    fd: File,
    geometry: Geometry,
    clear: bool,
}

impl From<File> for DiskImageBuilder {
    fn from(fd: File) -> Self {
        DiskImageBuilder {
            fd,
            geometry: Geometry::default(),
            clear: true,
        }
    }
}

impl DiskImageBuilder {
    /// Sets the capacities the image is laid out for.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// When set (the default) any existing contents are discarded so the store
    /// is formatted the next time it is opened.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor and, unless told
    /// otherwise, truncates it. Ownership of the file is transferred to the
    /// image meaning this builder can only be used to create one image.
    pub fn build(self) -> std::io::Result<DiskImage> {
        if self.clear {
            self.fd.set_len(0)?;
        }
        Ok(DiskImage {
            fd: self.fd,
            capacity: Layout::new(self.geometry).image_len(),
        })
    }
}
