//! The block store: the whole volume held in memory one block at a time,
//! loaded from and synced back to a [`BlockStorage`] device. Mutation happens
//! in place against these blocks; persistence is explicit via [`sync`].
//!
//! [`sync`]: BlockStore::sync

use crate::alloc;
use crate::io::BlockStorage;
use crate::sb::DiskLayout;
use crate::BLOCK_SIZE;
use log::debug;

pub type Block = [u8; BLOCK_SIZE];

pub struct BlockStore {
    blocks: Vec<Box<Block>>,
    layout: DiskLayout,
}

impl BlockStore {
    /// A zeroed volume, not yet formatted.
    pub fn blank(layout: DiskLayout) -> Self {
        let blocks = (0..layout.block_count)
            .map(|_| Box::new([0u8; BLOCK_SIZE]))
            .collect();
        Self { blocks, layout }
    }

    /// Reads every block of an existing image off the device.
    pub fn load<T: BlockStorage>(dev: &mut T, layout: DiskLayout) -> std::io::Result<Self> {
        let mut store = Self::blank(layout);
        for (nr, block) in store.blocks.iter_mut().enumerate() {
            dev.read_block(nr, &mut block[..])?;
        }
        Ok(store)
    }

    /// Writes every block back out and flushes the device.
    pub fn sync<T: BlockStorage>(&mut self, dev: &mut T) -> std::io::Result<()> {
        for nr in 0..self.blocks.len() {
            dev.write_block(nr, &mut self.blocks[nr][..])?;
        }
        dev.sync_disk()
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    pub fn block(&self, nr: u32) -> &Block {
        &self.blocks[nr as usize]
    }

    pub fn block_mut(&mut self, nr: u32) -> &mut Block {
        &mut self.blocks[nr as usize]
    }

    /// Marks the metadata blocks (block 0 and the inode table) as taken so
    /// data allocation never hands them out. Part of formatting.
    pub fn reserve_metadata(&mut self) {
        for nr in 0..self.layout.data_start() {
            self.set_block_used(nr);
        }
    }

    /// Claims the first free block, zeroed. `None` when the volume is full.
    pub fn alloc_block(&mut self) -> Option<u32> {
        let range = 0..self.layout.block_count as usize;
        let map_range = self.layout.block_bitmap_range();
        let nr = alloc::first_free(&self.blocks[0][map_range], range)? as u32;
        self.set_block_used(nr);
        // A recycled block may still hold bytes from its previous owner.
        for byte in self.block_mut(nr).iter_mut() {
            *byte = 0;
        }
        debug!("alloc_block() -> {}", nr);
        Some(nr)
    }

    pub fn free_block(&mut self, nr: u32) {
        debug!("free_block({})", nr);
        debug_assert!(nr >= self.layout.data_start());
        let map_range = self.layout.block_bitmap_range();
        alloc::set_free(&mut self.blocks[0][map_range], nr as usize);
    }

    fn set_block_used(&mut self, nr: u32) {
        let map_range = self.layout.block_bitmap_range();
        alloc::set_used(&mut self.blocks[0][map_range], nr as usize);
    }

    /// The inode-allocation bitmap region of block 0.
    pub fn inode_map(&self) -> &[u8] {
        &self.blocks[0][self.layout.inode_bitmap_range()]
    }

    pub fn inode_map_mut(&mut self) -> &mut [u8] {
        let range = self.layout.inode_bitmap_range();
        &mut self.blocks[0][range]
    }

    /// The persisted root entry record in block 0.
    pub fn root_entry(&self) -> &[u8] {
        &self.blocks[0][self.layout.root_entry_range()]
    }

    pub fn root_entry_mut(&mut self) -> &mut [u8] {
        let range = self.layout.root_entry_range();
        &mut self.blocks[0][range]
    }
}
