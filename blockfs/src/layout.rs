use crate::fs::{FsError, Result};

/// Bytes reserved for a file name inside an entry.
pub const NAME_LEN: usize = 11;
/// name (11) + size (2) + head node (2).
pub const ENTRY_SIZE: usize = NAME_LEN + 2 + 2;
/// block index (2) + next (2).
pub const NODE_SIZE: usize = 2 + 2;

/// The capacities of a store, fixed for the lifetime of a disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Size in bytes of one physical data block.
    pub block_size: usize,
    /// Number of slots in the entry table.
    pub max_files: usize,
    /// Number of physical data blocks, which is also the number of block-nodes.
    pub max_blocks: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: 128,
            max_files: 5,
            max_blocks: 10,
        }
    }
}

impl Geometry {
    pub fn new(block_size: usize, max_files: usize, max_blocks: usize) -> Self {
        Self {
            block_size,
            max_files,
            max_blocks,
        }
    }

    /// Checks that every on-disk field can represent the values this geometry
    /// produces. Handles are stored as `i16` with -1 reserved for "none" and
    /// file sizes as `u16`.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.max_files == 0 || self.max_blocks == 0 {
            return Err(FsError::InvalidGeometry(format!(
                "all capacities must be non-zero: {:?}",
                self
            )));
        }
        if self.max_files > i16::MAX as usize || self.max_blocks > i16::MAX as usize {
            return Err(FsError::InvalidGeometry(format!(
                "max_files and max_blocks must not exceed {}",
                i16::MAX
            )));
        }
        if self.max_file_size() > u16::MAX as usize {
            return Err(FsError::InvalidGeometry(format!(
                "max file size {} does not fit the 16-bit size field",
                self.max_file_size()
            )));
        }
        Ok(())
    }

    /// The largest payload a single file can hold.
    pub fn max_file_size(&self) -> usize {
        self.max_blocks * self.block_size
    }

    /// Number of blocks needed to hold `len` bytes.
    pub fn blocks_for(&self, len: usize) -> usize {
        (len + self.block_size - 1) / self.block_size
    }
}

/// Translates table slots and physical block numbers into byte offsets of the
/// backing store.
///
/// # Layout
/// =====================================================================
/// | Entries | Nodes | zero padding to block boundary | Data blocks ... |
/// =====================================================================
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    geometry: Geometry,
    metadata_blocks: usize,
}

impl Layout {
    pub fn new(geometry: Geometry) -> Self {
        let metadata_bytes = geometry.max_files * ENTRY_SIZE + geometry.max_blocks * NODE_SIZE;
        Self {
            geometry,
            metadata_blocks: geometry.blocks_for(metadata_bytes),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn metadata_blocks(&self) -> usize {
        self.metadata_blocks
    }

    pub fn data_region_start(&self) -> u64 {
        (self.metadata_blocks * self.geometry.block_size) as u64
    }

    /// Total number of bytes the backing store must hold.
    pub fn image_len(&self) -> u64 {
        self.data_region_start() + self.geometry.max_file_size() as u64
    }

    pub fn entry_offset(&self, index: usize) -> u64 {
        debug_assert!(index < self.geometry.max_files);
        (index * ENTRY_SIZE) as u64
    }

    pub fn node_offset(&self, index: usize) -> u64 {
        debug_assert!(index < self.geometry.max_blocks);
        (self.geometry.max_files * ENTRY_SIZE + index * NODE_SIZE) as u64
    }

    pub fn block_offset(&self, block: usize) -> u64 {
        debug_assert!(block < self.geometry.max_blocks);
        self.data_region_start() + (block * self.geometry.block_size) as u64
    }
}
