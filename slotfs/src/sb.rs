use crate::BLOCK_SIZE;
use std::convert::TryInto;
use std::ops::Range;

const SB_MAGIC: u32 = 0x534c_4654; // SLFT

/// Serialized byte width of the superblock at the front of block 0.
pub const SB_BYTES: usize = 32;

/// Bytes one inode record occupies in the on-disk table.
pub const INODE_SIZE: usize = 32;

/// Where everything lives on the volume. Passed into the inode and directory
/// managers at construction instead of being baked in as arithmetic
/// constants, so test volumes can be sized freely.
///
/// Block 0 holds, back to back: the superblock, the block bitmap, the inode
/// bitmap, and the persisted root entry record. The inode table follows in
/// its own reserved blocks, then the data region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskLayout {
    /// Total blocks in the volume.
    pub block_count: u32,
    /// Capacity of the inode table.
    pub inode_count: u32,
    /// Bytes per on-disk inode record.
    pub inode_size: u32,
    /// First block of the inode table.
    pub inode_start: u32,
}

impl DiskLayout {
    /// Standard layout: one inode per volume block so inode allocation never
    /// runs out before block allocation does. Panics if the block-0 regions
    /// (superblock, both bitmaps, root entry) would not fit in one block.
    pub fn with_block_count(block_count: u32) -> Self {
        let layout = Self {
            block_count,
            inode_count: block_count,
            inode_size: INODE_SIZE as u32,
            inode_start: 1,
        };
        assert!(
            layout.root_entry_range().end <= BLOCK_SIZE,
            "volume too large: block 0 cannot hold its metadata regions"
        );
        layout
    }

    pub fn inode_table_blocks(&self) -> u32 {
        let bytes = self.inode_count * self.inode_size;
        (bytes + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32
    }

    /// First block available to file and directory data.
    pub fn data_start(&self) -> u32 {
        self.inode_start + self.inode_table_blocks()
    }

    fn inodes_per_block(&self) -> u32 {
        BLOCK_SIZE as u32 / self.inode_size
    }

    /// Physical block and byte offset of an inode record in the table.
    pub fn inode_position(&self, inum: u32) -> (u32, usize) {
        debug_assert!(inum < self.inode_count);
        let block = self.inode_start + inum / self.inodes_per_block();
        let offset = (inum % self.inodes_per_block()) as usize * self.inode_size as usize;
        (block, offset)
    }

    /// Block-allocation bitmap region of block 0.
    pub fn block_bitmap_range(&self) -> Range<usize> {
        SB_BYTES..SB_BYTES + bitmap_bytes(self.block_count)
    }

    /// Inode-allocation bitmap region of block 0.
    pub fn inode_bitmap_range(&self) -> Range<usize> {
        let start = self.block_bitmap_range().end;
        start..start + bitmap_bytes(self.inode_count)
    }

    /// The root entry record, persisted outside any directory block.
    pub fn root_entry_range(&self) -> Range<usize> {
        let start = self.inode_bitmap_range().end;
        start..start + crate::dir::SLOT_SIZE
    }
}

fn bitmap_bytes(bits: u32) -> usize {
    ((bits + 7) / 8) as usize
}

/// The head of block 0, storing the information needed to rebuild a
/// [`DiskLayout`] when mounting and to verify the image is formatted.
#[derive(Debug, PartialEq)]
pub struct SuperBlock {
    magic: u32,
    pub block_count: u32,
    pub inode_count: u32,
    pub inode_size: u32,
    pub inode_start: u32,
}

impl SuperBlock {
    pub fn from_layout(layout: &DiskLayout) -> Self {
        Self {
            magic: SB_MAGIC,
            block_count: layout.block_count,
            inode_count: layout.inode_count,
            inode_size: layout.inode_size,
            inode_start: layout.inode_start,
        }
    }

    pub fn layout(&self) -> DiskLayout {
        DiskLayout {
            block_count: self.block_count,
            inode_count: self.inode_count,
            inode_size: self.inode_size,
            inode_start: self.inode_start,
        }
    }

    /// Reads the superblock from the head of block 0. Panics if the magic
    /// constant does not match: the image was never formatted.
    pub fn parse(buf: &[u8]) -> Self {
        assert!(buf.len() >= SB_BYTES, "buffer too short for superblock");

        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(magic, SB_MAGIC, "superblock magic constant invalid");

        Self {
            magic,
            block_count: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            inode_count: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            inode_size: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            inode_start: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Serializes the superblock for the head of block 0. The encoding is a
    /// series of struct fields with big endian alignment.
    pub fn serialize(&self) -> [u8; SB_BYTES] {
        let mut encoded = [0u8; SB_BYTES];
        encoded[0..4].copy_from_slice(&self.magic.to_be_bytes());
        encoded[4..8].copy_from_slice(&self.block_count.to_be_bytes());
        encoded[8..12].copy_from_slice(&self.inode_count.to_be_bytes());
        encoded[12..16].copy_from_slice(&self.inode_size.to_be_bytes());
        encoded[16..20].copy_from_slice(&self.inode_start.to_be_bytes());
        encoded
    }
}
