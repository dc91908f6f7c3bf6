use crate::alloc::NodeIndex;
use crate::io::Storage;
use crate::layout::{Layout, ENTRY_SIZE, NAME_LEN};

use byteorder::BigEndian;
use zerocopy::byteorder::{I16, U16};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

/// On-disk encoding of a file entry. Integers are big endian and the name is
/// padded with NUL bytes; an all-NUL name marks a free slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
struct DiskEntry {
    name: [u8; NAME_LEN],
    size: U16<BigEndian>,
    /// Index of the first block-node, -1 when the file has no data.
    head: I16<BigEndian>,
}

/// The metadata record of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u16,
    pub head: Option<NodeIndex>,
}

impl FileEntry {
    /// An empty, live entry named `name`.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            head: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.name.is_empty()
    }

    fn encode(&self) -> DiskEntry {
        let mut name = [0; NAME_LEN];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        DiskEntry {
            name,
            size: U16::new(self.size),
            head: I16::new(NodeIndex::encode(self.head)),
        }
    }

    fn decode(raw: &DiskEntry) -> Self {
        let end = raw.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        Self {
            name: String::from_utf8_lossy(&raw.name[..end]).into_owned(),
            size: raw.size.get(),
            head: NodeIndex::decode(raw.head.get()),
        }
    }
}

/// The fixed-size table of file entries, mirrored in memory.
pub struct InodeTable {
    entries: Vec<FileEntry>,
}

impl InodeTable {
    /// A table with every slot free.
    pub fn new(max_files: usize) -> Self {
        Self {
            entries: vec![FileEntry::default(); max_files],
        }
    }

    /// Reads every entry from the start of the metadata region.
    pub fn load<T: Storage>(dev: &mut T, layout: &Layout) -> std::io::Result<Self> {
        let count = layout.geometry().max_files;
        let mut buf = vec![0; count * ENTRY_SIZE];
        dev.read_at(layout.entry_offset(0), &mut buf)?;

        let entries = buf
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| {
                // Chunks are exactly ENTRY_SIZE and DiskEntry is unaligned, so
                // this cannot fail.
                LayoutVerified::<_, DiskEntry>::new_unaligned(chunk)
                    .map(|raw| FileEntry::decode(&raw))
                    .unwrap_or_default()
            })
            .collect();
        Ok(Self { entries })
    }

    /// Writes every slot, in table order. Used when formatting.
    pub fn persist_all<T: Storage>(&self, dev: &mut T, layout: &Layout) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for entry in &self.entries {
            buf.extend_from_slice(entry.encode().as_bytes());
        }
        dev.write_at(layout.entry_offset(0), &buf)
    }

    /// Rewrites only the bytes of slot `index`. Flushing is left to the caller.
    pub fn persist<T: Storage>(
        &self,
        index: usize,
        dev: &mut T,
        layout: &Layout,
    ) -> std::io::Result<()> {
        dev.write_at(layout.entry_offset(index), self.entries[index].encode().as_bytes())
    }

    pub fn get(&self, index: usize) -> &FileEntry {
        &self.entries[index]
    }

    pub fn set(&mut self, index: usize, entry: FileEntry) {
        self.entries[index] = entry;
    }

    /// Slot of the live entry named `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.name == name)
    }

    /// First free slot in table order.
    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(FileEntry::is_free)
    }

    /// Live entries in table order.
    pub fn live(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|entry| !entry.is_free())
    }
}
