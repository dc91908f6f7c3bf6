use crate::fs::{FsError, Result};
use crate::io::Storage;
use crate::layout::{Layout, NODE_SIZE};

use log::{debug, warn};
use byteorder::BigEndian;
use zerocopy::byteorder::I16;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u16);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                debug_assert!(index <= i16::MAX as usize);
                Self(index as u16)
            }

            pub fn get(self) -> usize {
                self.0 as usize
            }

            /// Negative stored values mean "none".
            pub(crate) fn decode(raw: i16) -> Option<Self> {
                if raw < 0 {
                    None
                } else {
                    Some(Self(raw as u16))
                }
            }

            pub(crate) fn encode(handle: Option<Self>) -> i16 {
                handle.map_or(-1, |h| h.0 as i16)
            }
        }
    };
}

handle!(
    /// Position of a block-node in the indirection table.
    NodeIndex
);
handle!(
    /// Number of a physical block in the data region.
    BlockIndex
);

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One bit per physical data block. Never written to disk; it is rebuilt from
/// the entry and node tables every time a store is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    /// A set bit marks a used block.
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` blocks, all free.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len);
        let mask = 0b01_u64 << (blocknr % 64);
        if self.words[blocknr / 64] & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len);
        self.words[blocknr / 64] |= 0b01_u64 << (blocknr % 64);
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < self.len);
        self.words[blocknr / 64] &= !(0b01_u64 << (blocknr % 64));
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    pub fn count_free(&self) -> usize {
        let used: u32 = self.words.iter().map(|word| word.count_ones()).sum();
        self.len - used as usize
    }

    /// Free blocks in ascending order.
    pub fn next_available(&self) -> NextAvailableAllocation<'_> {
        NextAvailableAllocation {
            marker: 0,
            bitmap: self,
        }
    }
}

/// Implements a naive block allocation policy. On each call to the iterator the
/// next free block, in ascending order, is returned. Blocks are not reserved by
/// the iterator itself.
pub struct NextAvailableAllocation<'a> {
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl Iterator for NextAvailableAllocation<'_> {
    type Item = BlockIndex;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len() {
            let i = self.marker;
            self.marker += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(BlockIndex::new(i));
            }
        }
        None
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
struct DiskNode {
    block: I16<BigEndian>,
    next: I16<BigEndian>,
}

/// One link of a file's chain. A node with no block is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockNode {
    pub block: Option<BlockIndex>,
    pub next: Option<NodeIndex>,
}

impl BlockNode {
    pub fn is_free(&self) -> bool {
        self.block.is_none()
    }

    fn encode(&self) -> DiskNode {
        DiskNode {
            block: I16::new(BlockIndex::encode(self.block)),
            next: I16::new(NodeIndex::encode(self.next)),
        }
    }

    fn decode(raw: &DiskNode) -> Self {
        Self {
            block: BlockIndex::decode(raw.block.get()),
            next: NodeIndex::decode(raw.next.get()),
        }
    }
}

/// The block-node table together with the free bitmap of the data region.
///
/// Node slots and physical blocks are separate address spaces: the node at
/// position `n` may reference any physical block. Every stored handle is
/// checked against its table before it is followed.
pub struct BlockTable {
    nodes: Vec<BlockNode>,
    bitmap: Bitmap,
}

impl BlockTable {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            nodes: vec![BlockNode::default(); max_blocks],
            bitmap: Bitmap::new(max_blocks),
        }
    }

    /// Reads the node table. The bitmap starts out all free; call
    /// [`BlockTable::rebuild_bitmap`] once the entries are known.
    pub fn load<T: Storage>(dev: &mut T, layout: &Layout) -> std::io::Result<Self> {
        let count = layout.geometry().max_blocks;
        let mut buf = vec![0; count * NODE_SIZE];
        dev.read_at(layout.node_offset(0), &mut buf)?;

        let nodes = buf
            .chunks_exact(NODE_SIZE)
            .map(|chunk| {
                LayoutVerified::<_, DiskNode>::new_unaligned(chunk)
                    .map(|raw| BlockNode::decode(&raw))
                    .unwrap_or_default()
            })
            .collect();
        Ok(Self {
            nodes,
            bitmap: Bitmap::new(count),
        })
    }

    pub fn persist_all<T: Storage>(&self, dev: &mut T, layout: &Layout) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(self.nodes.len() * NODE_SIZE);
        for node in &self.nodes {
            buf.extend_from_slice(node.encode().as_bytes());
        }
        dev.write_at(layout.node_offset(0), &buf)
    }

    pub fn persist<T: Storage>(
        &self,
        index: NodeIndex,
        dev: &mut T,
        layout: &Layout,
    ) -> std::io::Result<()> {
        dev.write_at(
            layout.node_offset(index.get()),
            self.nodes[index.get()].encode().as_bytes(),
        )
    }

    pub fn node(&self, index: NodeIndex) -> &BlockNode {
        &self.nodes[index.get()]
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn free_blocks(&self) -> usize {
        self.bitmap.count_free()
    }

    /// The physical block of `node`, if it names one inside the data region.
    pub fn block_of(&self, node: NodeIndex) -> Option<BlockIndex> {
        self.nodes[node.get()]
            .block
            .filter(|block| block.get() < self.bitmap.len())
    }

    /// Follows `next` links from `head` and returns the visited nodes in
    /// order. Traversal ends at "none", at a handle outside the table, or at a
    /// node already visited, and never takes more hops than there are nodes.
    pub fn chain(&self, head: Option<NodeIndex>) -> Vec<NodeIndex> {
        let mut visited = vec![false; self.nodes.len()];
        let mut chain = Vec::new();
        let mut current = head;

        while let Some(index) = current {
            if index.get() >= self.nodes.len() {
                warn!("chain hop to node {} is out of range, stopping", index.get());
                break;
            }
            if visited[index.get()] {
                warn!("chain revisits node {}, stopping", index.get());
                break;
            }
            visited[index.get()] = true;
            chain.push(index);
            current = self.nodes[index.get()].next;
        }
        chain
    }

    /// Marks every block reachable from `heads` as used and all others free.
    /// Nodes that no chain reaches are left over from an interrupted release
    /// and are freed in memory so their slots can be allocated again.
    pub fn rebuild_bitmap<I>(&mut self, heads: I)
    where
        I: IntoIterator<Item = Option<NodeIndex>>,
    {
        self.bitmap.clear();
        let mut reachable = vec![false; self.nodes.len()];
        for head in heads {
            for node in self.chain(head) {
                reachable[node.get()] = true;
                if let Some(block) = self.block_of(node) {
                    self.bitmap.set_reserved(block.get());
                }
            }
        }

        for (i, node) in self.nodes.iter_mut().enumerate() {
            if !reachable[i] && !node.is_free() {
                warn!("node {} is not part of any file, reclaiming it", i);
                *node = BlockNode::default();
            }
        }
    }

    /// Builds a chain of `count` nodes, each bound to a free physical block.
    /// Node slots and blocks are both taken in ascending order. Returns the
    /// head of the new chain, or `None` when `count` is zero.
    ///
    /// # Errors
    ///
    /// `InsufficientSpace` when either free nodes or free blocks run short; no
    /// state is changed in that case. An IO error while persisting undoes the
    /// in-memory binding before it is returned.
    pub fn allocate<T: Storage>(
        &mut self,
        count: usize,
        dev: &mut T,
        layout: &Layout,
    ) -> Result<Option<NodeIndex>> {
        if count == 0 {
            return Ok(None);
        }

        let slots: Vec<NodeIndex> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_free())
            .map(|(i, _)| NodeIndex::new(i))
            .take(count)
            .collect();
        let blocks: Vec<BlockIndex> = self.bitmap.next_available().take(count).collect();

        if slots.len() < count || blocks.len() < count {
            return Err(FsError::InsufficientSpace {
                required: count,
                available: slots.len().min(blocks.len()),
            });
        }

        for (i, (&slot, &block)) in slots.iter().zip(blocks.iter()).enumerate() {
            self.bitmap.set_reserved(block.get());
            self.nodes[slot.get()] = BlockNode {
                block: Some(block),
                next: slots.get(i + 1).copied(),
            };
        }

        for &slot in &slots {
            if let Err(err) = self.persist(slot, dev, layout) {
                warn!("failed to persist node {}, undoing allocation: {}", slot.get(), err);
                for (&slot, &block) in slots.iter().zip(blocks.iter()) {
                    self.bitmap.set_free(block.get());
                    self.nodes[slot.get()] = BlockNode::default();
                    // The slot may or may not have reached disk; clear it either way.
                    if let Err(err) = self.persist(slot, dev, layout) {
                        warn!("could not clear node {} on disk: {}", slot.get(), err);
                    }
                }
                return Err(err.into());
            }
        }

        debug!(
            "allocated chain {:?} over blocks {:?}",
            slots.iter().map(|n| n.get()).collect::<Vec<_>>(),
            blocks.iter().map(|b| b.get()).collect::<Vec<_>>()
        );
        Ok(slots.first().copied())
    }

    /// Frees every node of the chain starting at `head` along with its block,
    /// and returns the blocks that were freed in chain order.
    ///
    /// The whole chain is freed in memory before any node is written, and
    /// every node is written even after a failure. The first IO error is
    /// returned; nodes that did not reach disk are reclaimed on the next load.
    pub fn release<T: Storage>(
        &mut self,
        head: Option<NodeIndex>,
        dev: &mut T,
        layout: &Layout,
    ) -> std::io::Result<Vec<BlockIndex>> {
        let chain = self.chain(head);
        let mut freed = Vec::new();
        for &node in &chain {
            if let Some(block) = self.block_of(node) {
                self.bitmap.set_free(block.get());
                freed.push(block);
            }
            self.nodes[node.get()] = BlockNode::default();
        }

        let mut result = Ok(());
        for &node in &chain {
            if let Err(err) = self.persist(node, dev, layout) {
                warn!("could not clear node {} on disk: {}", node.get(), err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        debug!(
            "released blocks {:?}",
            freed.iter().map(|b| b.get()).collect::<Vec<_>>()
        );
        result.map(|()| freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DiskImage, DiskImageBuilder};
    use crate::layout::Geometry;

    fn create_test_device(geometry: Geometry) -> (DiskImage, Layout) {
        let layout = Layout::new(geometry);
        let mut dev = DiskImageBuilder::from(tempfile::tempfile().unwrap())
            .with_geometry(geometry)
            .build()
            .unwrap();
        dev.set_len(layout.image_len()).unwrap();
        BlockTable::new(geometry.max_blocks)
            .persist_all(&mut dev, &layout)
            .unwrap();
        (dev, layout)
    }

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new(10);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
        assert_eq!(bmp.count_free(), 9);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new(130);

        bmp.set_reserved(10);
        bmp.set_reserved(129);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Freeing one bit must not disturb its neighbours.
        assert_eq!(bmp.get(129), State::Used);
    }

    #[test]
    fn next_available_skips_used_blocks() {
        let mut bmp = Bitmap::new(6);
        bmp.set_reserved(0);
        bmp.set_reserved(2);
        let free: Vec<usize> = bmp.next_available().map(BlockIndex::get).collect();
        assert_eq!(free, vec![1, 3, 4, 5]);
    }

    #[test]
    fn allocate_links_nodes_in_ascending_order() {
        let (mut dev, layout) = create_test_device(Geometry::new(16, 2, 4));
        let mut table = BlockTable::new(4);

        let head = table.allocate(3, &mut dev, &layout).unwrap();
        assert_eq!(head, Some(NodeIndex::new(0)));
        let chain = table.chain(head);
        assert_eq!(chain, vec![NodeIndex::new(0), NodeIndex::new(1), NodeIndex::new(2)]);
        assert_eq!(table.node(NodeIndex::new(2)).next, None);
        assert_eq!(table.free_blocks(), 1);

        // The chain must survive a reload.
        let mut loaded = BlockTable::load(&mut dev, &layout).unwrap();
        loaded.rebuild_bitmap(vec![head]);
        assert_eq!(loaded.chain(head), chain);
        assert_eq!(loaded.bitmap(), table.bitmap());
    }

    #[test]
    fn allocate_without_space_changes_nothing() {
        let (mut dev, layout) = create_test_device(Geometry::new(16, 2, 4));
        let mut table = BlockTable::new(4);
        table.allocate(3, &mut dev, &layout).unwrap();

        let before = table.bitmap().clone();
        match table.allocate(2, &mut dev, &layout) {
            Err(FsError::InsufficientSpace { required: 2, available: 1 }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(table.bitmap(), &before);
        assert!(table.node(NodeIndex::new(3)).is_free());
    }

    #[test]
    fn release_frees_nodes_and_blocks() {
        let (mut dev, layout) = create_test_device(Geometry::new(16, 2, 4));
        let mut table = BlockTable::new(4);
        let first = table.allocate(1, &mut dev, &layout).unwrap();
        let second = table.allocate(2, &mut dev, &layout).unwrap();

        let freed = table.release(first, &mut dev, &layout).unwrap();
        assert_eq!(freed, vec![BlockIndex::new(0)]);
        assert_eq!(table.free_blocks(), 2);
        assert!(table.node(NodeIndex::new(0)).is_free());
        assert_eq!(table.chain(second).len(), 2);

        // The freed slot and block are reused first.
        let third = table.allocate(1, &mut dev, &layout).unwrap();
        assert_eq!(third, Some(NodeIndex::new(0)));
        assert_eq!(table.block_of(NodeIndex::new(0)), Some(BlockIndex::new(0)));
    }

    #[test]
    fn traversal_stops_at_cycles_and_out_of_range_hops() {
        let mut table = BlockTable::new(4);
        table.nodes[0] = BlockNode {
            block: Some(BlockIndex::new(0)),
            next: Some(NodeIndex::new(1)),
        };
        table.nodes[1] = BlockNode {
            block: Some(BlockIndex::new(1)),
            next: Some(NodeIndex::new(0)),
        };
        table.nodes[2] = BlockNode {
            block: Some(BlockIndex::new(9)),
            next: Some(NodeIndex::new(300)),
        };

        assert_eq!(table.chain(Some(NodeIndex::new(0))).len(), 2);
        assert_eq!(table.chain(Some(NodeIndex::new(2))), vec![NodeIndex::new(2)]);
        assert!(table.chain(Some(NodeIndex::new(7))).is_empty());

        table.rebuild_bitmap(vec![Some(NodeIndex::new(0)), Some(NodeIndex::new(2))]);
        // Block 9 lies outside the data region and is ignored.
        assert_eq!(table.free_blocks(), 2);
    }

    #[test]
    fn rebuild_reclaims_nodes_no_file_reaches() {
        let (mut dev, layout) = create_test_device(Geometry::new(16, 2, 4));
        let mut table = BlockTable::new(4);
        let kept = table.allocate(1, &mut dev, &layout).unwrap();
        table.allocate(2, &mut dev, &layout).unwrap();

        let mut loaded = BlockTable::load(&mut dev, &layout).unwrap();
        loaded.rebuild_bitmap(vec![kept]);
        assert_eq!(loaded.free_blocks(), 3);
        assert!(loaded.node(NodeIndex::new(1)).is_free());
        assert!(loaded.node(NodeIndex::new(2)).is_free());

        // Reclaimed slots are handed out again.
        let next = loaded.allocate(3, &mut dev, &layout).unwrap();
        assert_eq!(next, Some(NodeIndex::new(1)));
        assert_eq!(loaded.free_blocks(), 0);
    }
}
