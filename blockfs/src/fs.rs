use crate::alloc::{BlockIndex, BlockTable, NodeIndex, State};
use crate::entry::{FileEntry, InodeTable};
use crate::io::Storage;
use crate::layout::{Geometry, Layout, NAME_LEN, NODE_SIZE};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid filename {0:?}: must be 1 to 11 bytes with no NUL")]
    InvalidName(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("maximum file limit reached")]
    CapacityExceeded,
    #[error("data of {len} bytes exceeds maximum file size of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("not enough free space: {required} blocks required, {available} available")]
    InsufficientSpace { required: usize, available: usize },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("inconsistent metadata: {0}")]
    Corrupt(String),
    #[error("backing store failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_LEN || name.contains('\0') {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Everything guarded by the store lock. The backing store keeps a single
/// cursor, so reads need exclusive access just like writes.
struct Inner<T: Storage> {
    dev: T,
    layout: Layout,
    entries: InodeTable,
    blocks: BlockTable,
}

/// A flat file store kept in a single disk image.
///
/// Files are named by up to eleven bytes and hold at most
/// `max_blocks * block_size` bytes. Each file's contents live in a chain of
/// block-nodes, each pointing at one physical data block.
///
/// All operations are synchronous and may be called from many threads at once.
/// Each one holds the store lock from start to finish, and mutating operations
/// flush the backing store before releasing it.
pub struct FileStore<T: Storage> {
    inner: Mutex<Inner<T>>,
}

impl<T: Storage> FileStore<T> {
    /// Formats `dev` if it is empty, otherwise loads the store it holds.
    pub fn open(mut dev: T, geometry: Geometry) -> Result<Self> {
        if dev.is_empty()? {
            Self::format(dev, geometry)
        } else {
            Self::load(dev, geometry)
        }
    }

    /// Initializes an empty store onto owned storage, discarding whatever it
    /// held before.
    pub fn format(mut dev: T, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let layout = Layout::new(geometry);

        dev.set_len(0)?;
        let entries = InodeTable::new(geometry.max_files);
        entries.persist_all(&mut dev, &layout)?;
        let blocks = BlockTable::new(geometry.max_blocks);
        blocks.persist_all(&mut dev, &layout)?;

        // Pad the metadata region out to a block boundary.
        let nodes_end = layout.node_offset(geometry.max_blocks - 1) + NODE_SIZE as u64;
        let padding = vec![0; (layout.data_region_start() - nodes_end) as usize];
        dev.write_at(nodes_end, &padding)?;

        let zero_block = vec![0; geometry.block_size];
        for block in 0..geometry.max_blocks {
            dev.write_at(layout.block_offset(block), &zero_block)?;
        }
        dev.sync_disk()?;

        info!(
            "formatted store: {} files, {} blocks of {} bytes, {} metadata blocks",
            geometry.max_files,
            geometry.max_blocks,
            geometry.block_size,
            layout.metadata_blocks()
        );
        Ok(Self::from_parts(dev, layout, entries, blocks))
    }

    /// Reads an existing store and rebuilds the free bitmap from its chains.
    pub fn load(mut dev: T, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let layout = Layout::new(geometry);

        let len = dev.len()?;
        if len < layout.image_len() {
            return Err(FsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "backing store holds {} bytes, geometry needs {}",
                    len,
                    layout.image_len()
                ),
            )));
        }

        let entries = InodeTable::load(&mut dev, &layout)?;
        let mut blocks = BlockTable::load(&mut dev, &layout)?;
        blocks.rebuild_bitmap(entries.live().map(|entry| entry.head));

        info!(
            "loaded store: {} live files, {} of {} blocks free",
            entries.live().count(),
            blocks.free_blocks(),
            geometry.max_blocks
        );
        Ok(Self::from_parts(dev, layout, entries, blocks))
    }

    fn from_parts(dev: T, layout: Layout, entries: InodeTable, blocks: BlockTable) -> Self {
        Self {
            inner: Mutex::new(Inner {
                dev,
                layout,
                entries,
                blocks,
            }),
        }
    }

    /// Flushes the backing store and hands it back to the caller.
    pub fn close(self) -> Result<T> {
        let mut inner = self.inner.into_inner();
        inner.dev.sync_disk()?;
        info!("closed store");
        Ok(inner.dev)
    }

    pub fn geometry(&self) -> Geometry {
        *self.inner.lock().layout.geometry()
    }

    /// Creates an empty file.
    ///
    /// # Errors
    ///
    /// `InvalidName` for names that are empty, longer than eleven bytes or
    /// contain NUL, `AlreadyExists` if a live file has that name and
    /// `CapacityExceeded` when every entry slot is taken.
    pub fn create_file(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.inner.lock().create_file(name)
    }

    /// Removes a file and frees its blocks.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.lock().delete_file(name)
    }

    /// Replaces the whole contents of a file with `data`.
    ///
    /// The new contents are written to freshly allocated blocks and the old
    /// chain is only released once the entry points at the new one. On failure
    /// the file keeps its previous contents.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.inner.lock().write_file(name, data)
    }

    /// Returns the contents of a file. A chain that ends early yields the bytes
    /// that could be reached rather than an error.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.lock().read_file(name)
    }

    /// Names of all live files, in entry table order.
    pub fn list_files(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .live()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn file_size(&self, name: &str) -> Result<usize> {
        let inner = self.inner.lock();
        let index = inner.find(name)?;
        Ok(inner.entries.get(index).size as usize)
    }

    /// Number of free physical data blocks.
    pub fn free_blocks(&self) -> usize {
        self.inner.lock().blocks.free_blocks()
    }

    /// Verifies that every live chain is well formed, that no node or block is
    /// shared, and that the free bitmap is exactly the complement of the
    /// reachable blocks.
    pub fn check_consistency(&self) -> Result<()> {
        self.inner.lock().check_consistency()
    }
}

impl<T: Storage> Inner<T> {
    fn find(&self, name: &str) -> Result<usize> {
        self.entries
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    fn create_file(&mut self, name: &str) -> Result<()> {
        if self.entries.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let index = self.entries.free_slot().ok_or(FsError::CapacityExceeded)?;

        self.entries.set(index, FileEntry::named(name));
        self.entries.persist(index, &mut self.dev, &self.layout)?;
        self.dev.sync_disk()?;
        debug!("created {:?} in slot {}", name, index);
        Ok(())
    }

    fn delete_file(&mut self, name: &str) -> Result<()> {
        let index = self.find(name)?;
        let head = self.entries.get(index).head;

        // Zero the data before touching any metadata, so a failed zero-fill
        // leaves the file in place.
        let zero_block = vec![0; self.layout.geometry().block_size];
        for node in self.blocks.chain(head) {
            if let Some(block) = self.blocks.block_of(node) {
                self.dev
                    .write_at(self.layout.block_offset(block.get()), &zero_block)?;
            }
        }
        let freed = self.blocks.release(head, &mut self.dev, &self.layout)?;

        self.entries.set(index, FileEntry::default());
        self.entries.persist(index, &mut self.dev, &self.layout)?;
        self.dev.sync_disk()?;
        debug!("deleted {:?} from slot {}, freed {} blocks", name, index, freed.len());
        Ok(())
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let index = self.find(name)?;
        let geometry = *self.layout.geometry();
        if data.len() > geometry.max_file_size() {
            return Err(FsError::TooLarge {
                len: data.len(),
                max: geometry.max_file_size(),
            });
        }

        let required = geometry.blocks_for(data.len());
        let available = self.blocks.free_blocks();
        if available < required {
            return Err(FsError::InsufficientSpace {
                required,
                available,
            });
        }

        let previous = self.entries.get(index).clone();
        let head = self.blocks.allocate(required, &mut self.dev, &self.layout)?;

        if let Err(err) = self.commit_write(index, name, head, data) {
            warn!("write to {:?} failed, rolling back: {}", name, err);
            self.rollback_write(index, previous, head);
            return Err(err);
        }

        // The new contents are committed. A node of the old chain that cannot
        // be cleared on disk is reclaimed on the next load.
        if let Err(err) = self.blocks.release(previous.head, &mut self.dev, &self.layout) {
            warn!("could not release old chain of {:?}: {}", name, err);
        }
        self.dev.sync_disk()?;
        debug!("wrote {} bytes to {:?} over {} blocks", data.len(), name, required);
        Ok(())
    }

    /// Copies `data` across the chain at `head`, then points the entry at it.
    /// The last block is written only up to the end of the payload.
    fn commit_write(
        &mut self,
        index: usize,
        name: &str,
        head: Option<NodeIndex>,
        data: &[u8],
    ) -> Result<()> {
        let block_size = self.layout.geometry().block_size;
        let chain = self.blocks.chain(head);
        for (node, chunk) in chain.iter().zip(data.chunks(block_size)) {
            let block = self.blocks.block_of(*node).ok_or_else(|| {
                FsError::Corrupt(format!("freshly allocated node {} has no block", node.get()))
            })?;
            self.dev.write_at(self.layout.block_offset(block.get()), chunk)?;
        }

        self.entries.set(
            index,
            FileEntry {
                name: name.to_string(),
                size: data.len() as u16,
                head,
            },
        );
        self.entries.persist(index, &mut self.dev, &self.layout)?;
        Ok(())
    }

    /// Restores the entry and gives back the chain allocated for a failed
    /// write. Errors here are only logged so the caller sees the failure that
    /// triggered the rollback.
    fn rollback_write(&mut self, index: usize, previous: FileEntry, head: Option<NodeIndex>) {
        self.entries.set(index, previous);
        if let Err(err) = self.entries.persist(index, &mut self.dev, &self.layout) {
            warn!("rollback could not restore entry {}: {}", index, err);
        }
        if let Err(err) = self.blocks.release(head, &mut self.dev, &self.layout) {
            warn!("rollback could not release new chain: {}", err);
        }
        if let Err(err) = self.dev.sync_disk() {
            warn!("rollback could not sync: {}", err);
        }
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self.find(name)?;
        let entry = self.entries.get(index);
        let size = entry.size as usize;
        let block_size = self.layout.geometry().block_size;

        let mut data = vec![0; size];
        let mut filled = 0;
        for node in self.blocks.chain(entry.head) {
            if filled >= size {
                break;
            }
            if let Some(block) = self.blocks.block_of(node) {
                let n = block_size.min(size - filled);
                self.dev.read_at(
                    self.layout.block_offset(block.get()),
                    &mut data[filled..filled + n],
                )?;
                filled += n;
            }
        }

        if filled < size {
            warn!(
                "chain of {:?} ended after {} of {} bytes",
                name, filled, size
            );
            data.truncate(filled);
        }
        Ok(data)
    }

    fn check_consistency(&self) -> Result<()> {
        let geometry = self.layout.geometry();
        let mut names = HashSet::new();
        let mut nodes = HashSet::new();
        let mut reachable = HashSet::new();

        for entry in self.entries.live() {
            if !names.insert(entry.name.as_str()) {
                return Err(FsError::Corrupt(format!("duplicate name {:?}", entry.name)));
            }

            let chain = self.blocks.chain(entry.head);
            if chain.len() != geometry.blocks_for(entry.size as usize) {
                return Err(FsError::Corrupt(format!(
                    "{:?} holds {} bytes in {} nodes",
                    entry.name,
                    entry.size,
                    chain.len()
                )));
            }
            if let Some(last) = chain.last() {
                if self.blocks.node(*last).next.is_some() {
                    return Err(FsError::Corrupt(format!(
                        "chain of {:?} is not terminated",
                        entry.name
                    )));
                }
            }

            for node in chain {
                if !nodes.insert(node) {
                    return Err(FsError::Corrupt(format!("node {} is shared", node.get())));
                }
                let block = self.blocks.block_of(node).ok_or_else(|| {
                    FsError::Corrupt(format!("node {} of {:?} has no block", node.get(), entry.name))
                })?;
                if !reachable.insert(block) {
                    return Err(FsError::Corrupt(format!("block {} is shared", block.get())));
                }
            }
        }

        for i in 0..geometry.max_blocks {
            let node = NodeIndex::new(i);
            if !nodes.contains(&node) && !self.blocks.node(node).is_free() {
                return Err(FsError::Corrupt(format!("node {} is orphaned", i)));
            }
        }

        let bitmap = self.blocks.bitmap();
        for block in 0..geometry.max_blocks {
            let used = bitmap.get(block) == State::Used;
            let expected = reachable.contains(&BlockIndex::new(block));
            if used != expected {
                return Err(FsError::Corrupt(format!(
                    "bitmap marks block {} as {:?}",
                    block,
                    bitmap.get(block)
                )));
            }
        }
        Ok(())
    }
}
