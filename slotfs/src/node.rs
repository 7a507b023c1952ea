//! The inode layer: block-pointer management, growth/shrink, and byte-range
//! read/write against an inode's data.
//!
//! An inode addresses up to [`DIRECT_BLOCKS`] data blocks directly plus one
//! single-level indirect block (`cont`) holding an array of further block
//! numbers. Block number 0 is always metadata, so 0 doubles as the "no
//! pointer" sentinel.

use crate::alloc;
use crate::fs::FsError;
use crate::sb::{DiskLayout, INODE_SIZE};
use crate::store::BlockStore;
use crate::BLOCK_SIZE;
use log::debug;
use std::convert::TryInto;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

/// Direct block pointers per inode.
pub const DIRECT_BLOCKS: usize = 4;

/// Block numbers that fit in the indirect block.
const INDIRECT_ENTRIES: usize = BLOCK_SIZE / 4;

/// One on-disk inode record.
#[repr(C)]
#[derive(AsBytes, FromBytes, Debug, Copy, Clone, PartialEq)]
pub struct Inode {
    /// Hard-link count. Storage is released when it reaches 0.
    pub refs: u32,
    /// Type and permission bits.
    pub mode: u32,
    /// Logical byte length of the data.
    pub size: u32,
    /// Direct data block pointers, 0 when unused.
    pub direct: [u32; DIRECT_BLOCKS],
    /// Indirect block pointer, 0 when absent.
    pub cont: u32,
}

const _: () = assert!(mem::size_of::<Inode>() == INODE_SIZE);

impl Inode {
    pub fn empty(mode: u32) -> Self {
        Self {
            refs: 1,
            mode,
            size: 0,
            direct: [0; DIRECT_BLOCKS],
            cont: 0,
        }
    }

    /// Copies one record out of its table slot. `buf` must be exactly one
    /// record wide.
    pub fn parse(buf: &[u8]) -> Self {
        Self::read_from(buf).unwrap()
    }
}

/// Whole blocks needed to hold `bytes` of data.
fn blocks_for(bytes: u32) -> usize {
    (bytes as usize + BLOCK_SIZE - 1) / BLOCK_SIZE
}

fn cont_entry(store: &BlockStore, cont: u32, slot: usize) -> u32 {
    let off = slot * 4;
    u32::from_le_bytes(store.block(cont)[off..off + 4].try_into().unwrap())
}

fn set_cont_entry(store: &mut BlockStore, cont: u32, slot: usize, nr: u32) {
    let off = slot * 4;
    store.block_mut(cont)[off..off + 4].copy_from_slice(&nr.to_le_bytes());
}

/// Manages the on-disk inode table: allocation, the block-pointer set, and
/// byte-granular data access. Records are copied out of the table, mutated,
/// and written back with [`put`]; nothing hands out references into block
/// storage.
///
/// [`put`]: InodeTable::put
#[derive(Debug, Clone, Copy)]
pub struct InodeTable {
    layout: DiskLayout,
}

impl InodeTable {
    pub fn new(layout: DiskLayout) -> Self {
        Self { layout }
    }

    pub fn get(&self, store: &BlockStore, inum: u32) -> Inode {
        let (block, offset) = self.layout.inode_position(inum);
        Inode::parse(&store.block(block)[offset..offset + INODE_SIZE])
    }

    pub fn put(&self, store: &mut BlockStore, inum: u32, node: &Inode) {
        let (block, offset) = self.layout.inode_position(inum);
        store.block_mut(block)[offset..offset + INODE_SIZE].copy_from_slice(node.as_bytes());
    }

    /// Claims the first free inode past the reserved root slot.
    pub fn allocate(&self, store: &mut BlockStore) -> Result<u32, FsError> {
        let inum = alloc::first_free(store.inode_map(), 1..self.layout.inode_count as usize)
            .ok_or(FsError::Exhausted)? as u32;
        alloc::set_used(store.inode_map_mut(), inum as usize);
        self.put(store, inum, &Inode::empty(0));
        debug!("allocate() -> inode {}", inum);
        Ok(inum)
    }

    /// Drops one reference. At zero the data blocks go back to the store and
    /// the inode slot is reusable; the caller must not touch the inode
    /// afterward.
    pub fn release(&self, store: &mut BlockStore, inum: u32) {
        let mut node = self.get(store, inum);
        node.refs -= 1;
        if node.refs == 0 {
            self.shrink(store, &mut node, 0);
            alloc::set_free(store.inode_map_mut(), inum as usize);
            debug!("release(): inode {} storage freed", inum);
        }
        self.put(store, inum, &node);
    }

    /// Extends the block-pointer set until the inode can hold `target`
    /// bytes, direct slots first, then through the indirect block. Returns
    /// the size actually reached: on block exhaustion this stops short and
    /// reports the bytes covered by whole allocated blocks. Partial growth
    /// is an observable outcome, not an error. New blocks come back zeroed
    /// from the store.
    pub fn grow(&self, store: &mut BlockStore, node: &mut Inode, target: u32) -> u32 {
        if node.size >= target {
            return node.size;
        }
        let held = blocks_for(node.size);
        let wanted = blocks_for(target);
        for index in held..wanted {
            if self.push_block(store, node, index).is_none() {
                node.size = (index * BLOCK_SIZE) as u32;
                debug!(
                    "grow(): out of blocks, reached {} of {} bytes",
                    node.size, target
                );
                return node.size;
            }
        }
        node.size = target;
        target
    }

    fn push_block(&self, store: &mut BlockStore, node: &mut Inode, index: usize) -> Option<u32> {
        if index < DIRECT_BLOCKS {
            let nr = store.alloc_block()?;
            node.direct[index] = nr;
            return Some(nr);
        }
        let slot = index - DIRECT_BLOCKS;
        if slot >= INDIRECT_ENTRIES {
            // Single-level indirection caps the file size; treat the limit
            // like exhaustion.
            return None;
        }
        let fresh_cont = node.cont == 0;
        if fresh_cont {
            node.cont = store.alloc_block()?;
        }
        match store.alloc_block() {
            Some(nr) => {
                set_cont_entry(store, node.cont, slot, nr);
                Some(nr)
            }
            None => {
                if fresh_cont {
                    store.free_block(node.cont);
                    node.cont = 0;
                }
                None
            }
        }
    }

    /// Frees data blocks from the highest logical index downward until the
    /// inode holds exactly `target` bytes. Freeing the first indirect entry
    /// also frees the indirect block itself and clears `cont`.
    pub fn shrink(&self, store: &mut BlockStore, node: &mut Inode, target: u32) -> u32 {
        if node.size <= target {
            return node.size;
        }
        let held = blocks_for(node.size);
        for index in (0..held).rev() {
            if ((index * BLOCK_SIZE) as u32) < target {
                // This block still backs bytes below the target.
                break;
            }
            if index < DIRECT_BLOCKS {
                store.free_block(node.direct[index]);
                node.direct[index] = 0;
            } else {
                let slot = index - DIRECT_BLOCKS;
                let nr = cont_entry(store, node.cont, slot);
                store.free_block(nr);
                set_cont_entry(store, node.cont, slot, 0);
                if slot == 0 {
                    // Last indirect entry gone; the table block goes too.
                    store.free_block(node.cont);
                    node.cont = 0;
                }
            }
        }
        node.size = target;
        target
    }

    /// Maps a logical block index to its physical block number.
    pub fn block_number(&self, store: &BlockStore, node: &Inode, index: usize) -> Option<u32> {
        if index < DIRECT_BLOCKS {
            return match node.direct[index] {
                0 => None,
                nr => Some(nr),
            };
        }
        let slot = index - DIRECT_BLOCKS;
        if node.cont == 0 || slot >= INDIRECT_ENTRIES {
            return None;
        }
        match cont_entry(store, node.cont, slot) {
            0 => None,
            nr => Some(nr),
        }
    }

    /// Copies up to `buf.len()` bytes starting at `offset` into `buf`,
    /// clamped to the inode's size. Out-of-range requests short-read rather
    /// than fail.
    pub fn read(&self, store: &BlockStore, node: &Inode, offset: usize, buf: &mut [u8]) -> usize {
        let size = node.size as usize;
        if offset >= size {
            return 0;
        }
        let len = buf.len().min(size - offset);
        let mut copied = 0;
        while copied < len {
            let pos = offset + copied;
            let index = pos / BLOCK_SIZE;
            let within = pos % BLOCK_SIZE;
            let chunk = (len - copied).min(BLOCK_SIZE - within);
            let nr = match self.block_number(store, node, index) {
                Some(nr) => nr,
                None => break,
            };
            buf[copied..copied + chunk]
                .copy_from_slice(&store.block(nr)[within..within + chunk]);
            copied += chunk;
        }
        copied
    }

    /// Writes `data` at `offset`, growing the inode first when the write
    /// extends past the current end. `offset` may not exceed the current
    /// size: the layer does not punch sparse holes. Under block exhaustion
    /// the write is cut at the size growth actually reached and the short
    /// count is returned.
    pub fn write(
        &self,
        store: &mut BlockStore,
        node: &mut Inode,
        offset: usize,
        data: &[u8],
    ) -> Result<usize, FsError> {
        if offset > node.size as usize {
            return Err(FsError::InvalidOperation("write past end of file"));
        }
        let end = offset + data.len();
        if end > node.size as usize {
            self.grow(store, node, end as u32);
        }
        let writable = (node.size as usize).min(end);
        let mut copied = 0;
        while offset + copied < writable {
            let pos = offset + copied;
            let index = pos / BLOCK_SIZE;
            let within = pos % BLOCK_SIZE;
            let chunk = (writable - pos).min(BLOCK_SIZE - within);
            let nr = match self.block_number(store, node, index) {
                Some(nr) => nr,
                None => break,
            };
            store.block_mut(nr)[within..within + chunk]
                .copy_from_slice(&data[copied..copied + chunk]);
            copied += chunk;
        }
        Ok(copied)
    }
}
