//! The directory layer: a directory inode's data is a run of fixed-size
//! blocks of [`SLOTS_PER_BLOCK`] entry slots. Slot 0 of every block is a
//! [`DirHeader`] carrying the block's slot-occupancy bitmap and free count;
//! the remaining slots hold [`DirEnt`] records. The two record types overlay
//! the same slot array, so both must be exactly [`SLOT_SIZE`] bytes.
//!
//! Directories only ever grow. Removing an entry clears its occupancy bit
//! and bumps the owning header's free count; blocks are never compacted or
//! reclaimed, even when they empty out entirely.

use crate::alloc::{self, State};
use crate::fs::FsError;
use crate::node::{Inode, InodeTable};
use crate::store::BlockStore;
use crate::BLOCK_SIZE;
use log::debug;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

/// Byte width of one directory slot.
pub const SLOT_SIZE: usize = 64;

/// Slots per directory block, header included.
pub const SLOTS_PER_BLOCK: usize = BLOCK_SIZE / SLOT_SIZE;

/// Longest storable name in bytes. Longer names are silently truncated.
pub const NAME_MAX: usize = 52;

/// The root directory's reserved inode.
pub const ROOT_INUM: u32 = 0;

pub const ROOT_NAME: &str = "/";

/// Upper bits of `mode` naming the entry kind.
pub const MODE_KIND_MASK: u32 = 0o170000;
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_FILE: u32 = 0o100000;

const FLAG_DIR: u8 = 0b0000_0001;

/// A name-to-inode binding stored in a directory block slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, Debug, Copy, Clone)]
pub struct DirEnt {
    name: [u8; NAME_MAX + 1],
    flags: u8,
    _pad: [u8; 2],
    pub inum: u32,
    pub mode: u32,
}

/// Slot 0 of every directory block: an occupancy bitmap over the block's
/// slots (bit 0 permanently set for the header itself) and the count of
/// unused slots among 1..63.
#[repr(C)]
#[derive(AsBytes, FromBytes, Debug, Copy, Clone)]
pub struct DirHeader {
    occupancy: [u8; 8],
    free: u32,
    _reserved: [u8; 52],
}

// The header overlays slot 0 of the same array the entries live in.
const _: () = assert!(mem::size_of::<DirEnt>() == SLOT_SIZE);
const _: () = assert!(mem::size_of::<DirHeader>() == SLOT_SIZE);

/// Caps a name to the storable byte bound.
fn clamp_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(NAME_MAX)]
}

impl DirEnt {
    pub fn new(name: &str, inum: u32, mode: u32) -> Self {
        let bytes = clamp_name(name);
        let mut buf = [0u8; NAME_MAX + 1];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            name: buf,
            flags: if mode & MODE_KIND_MASK == MODE_DIR {
                FLAG_DIR
            } else {
                0
            },
            _pad: [0; 2],
            inum,
            mode,
        }
    }

    /// Copies one entry out of its slot. `buf` must be exactly one slot
    /// wide.
    pub fn parse(buf: &[u8]) -> Self {
        Self::read_from(buf).unwrap()
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_KIND_MASK == MODE_DIR
    }
}

impl DirHeader {
    /// A header for a brand-new block: only the header slot taken.
    fn fresh() -> Self {
        let mut occupancy = [0u8; 8];
        alloc::set_used(&mut occupancy, 0);
        Self {
            occupancy,
            free: (SLOTS_PER_BLOCK - 1) as u32,
            _reserved: [0; 52],
        }
    }

    fn parse(buf: &[u8]) -> Self {
        Self::read_from(buf).unwrap()
    }

    fn slot_used(&self, slot: usize) -> bool {
        alloc::get(&self.occupancy, slot) == State::Used
    }

    #[cfg(test)]
    fn free_count(&self) -> u32 {
        self.free
    }

    #[cfg(test)]
    fn clear_slots(&self) -> u32 {
        (1..SLOTS_PER_BLOCK).filter(|&s| !self.slot_used(s)).count() as u32
    }
}

/// Names an entry without aliasing live block storage. A handle is
/// re-resolved against the store on every access, so it stays safe to hold
/// across directory growth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryHandle {
    /// The persisted root record, outside any directory block.
    Root,
    Slot {
        /// Owning directory's inode.
        dir: u32,
        /// Logical directory block index.
        block: usize,
        /// Slot within the block, never 0.
        slot: usize,
    },
}

/// Interprets directory inodes' data and maintains the on-disk free-slot
/// bookkeeping. Must not be mixed with raw byte writes against the same
/// inode.
#[derive(Debug, Clone, Copy)]
pub struct DirTable {
    nodes: InodeTable,
}

impl DirTable {
    pub fn new(nodes: InodeTable) -> Self {
        Self { nodes }
    }

    /// Formats a fresh inode's first directory block.
    pub fn format(&self, store: &mut BlockStore, dir: u32) -> Result<(), FsError> {
        debug_assert_eq!(self.nodes.get(store, dir).size, 0);
        debug!("formatting inode {} as a directory", dir);
        self.append_block(store, dir).map(|_| ())
    }

    /// Grows the directory by one formatted block, returning its logical
    /// index.
    fn append_block(&self, store: &mut BlockStore, dir: u32) -> Result<usize, FsError> {
        let mut node = self.nodes.get(store, dir);
        let offset = node.size as usize;
        debug_assert_eq!(offset % BLOCK_SIZE, 0);

        let mut block = [0u8; BLOCK_SIZE];
        block[..SLOT_SIZE].copy_from_slice(DirHeader::fresh().as_bytes());
        let written = self.nodes.write(store, &mut node, offset, &block)?;
        if written < BLOCK_SIZE {
            // Partial growth left a truncated tail; give the bytes back.
            self.nodes.shrink(store, &mut node, offset as u32);
            self.nodes.put(store, dir, &node);
            return Err(FsError::Exhausted);
        }
        self.nodes.put(store, dir, &node);
        Ok(offset / BLOCK_SIZE)
    }

    fn header(&self, store: &BlockStore, node: &Inode, block: usize) -> Option<DirHeader> {
        let nr = self.nodes.block_number(store, node, block)?;
        Some(DirHeader::parse(&store.block(nr)[..SLOT_SIZE]))
    }

    /// All occupied entries of a directory in block/slot order. Lazy and
    /// restartable; the borrow on the store keeps the directory from moving
    /// underneath it.
    pub(crate) fn entries<'a>(&self, store: &'a BlockStore, dir: u32) -> Entries<'a> {
        Entries {
            table: *self,
            store,
            node: self.nodes.get(store, dir),
            block: 0,
            slot: 0,
            header: None,
        }
    }

    /// Occupied entry names in block/slot order. No ordering guarantee
    /// beyond the physical layout.
    pub fn names<'a>(&self, store: &'a BlockStore, dir: u32) -> impl Iterator<Item = String> + 'a {
        self.entries(store, dir).map(|(_, _, entry)| entry.name())
    }

    /// First occupied slot whose stored name matches, searched in block
    /// order. The match applies the same truncation insertion does.
    pub fn lookup(&self, store: &BlockStore, dir: u32, name: &str) -> Option<EntryHandle> {
        let want = clamp_name(name);
        self.entries(store, dir)
            .find(|(_, _, entry)| entry.name_bytes() == want)
            .map(|(block, slot, _)| EntryHandle::Slot { dir, block, slot })
    }

    /// Walks a slash-separated path from the root, one segment at a time.
    /// The empty path and the bare root name resolve to the persisted root
    /// record without scanning any directory block. Empty segments (doubled
    /// or trailing slashes) are skipped.
    pub fn resolve(&self, store: &BlockStore, path: &str) -> Option<EntryHandle> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut dir = ROOT_INUM;
        let mut handle = EntryHandle::Root;
        let mut segments = trimmed.split('/').filter(|s| !s.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            handle = self.lookup(store, dir, segment)?;
            if segments.peek().is_some() {
                let entry = self.entry(store, handle)?;
                if !entry.is_dir() {
                    return None;
                }
                dir = entry.inum;
            }
        }
        Some(handle)
    }

    /// Reads the entry a handle names, if it is still occupied.
    pub fn entry(&self, store: &BlockStore, handle: EntryHandle) -> Option<DirEnt> {
        match handle {
            EntryHandle::Root => Some(DirEnt::parse(store.root_entry())),
            EntryHandle::Slot { dir, block, slot } => {
                let node = self.nodes.get(store, dir);
                let header = self.header(store, &node, block)?;
                if !header.slot_used(slot) {
                    return None;
                }
                let nr = self.nodes.block_number(store, &node, block)?;
                let off = slot * SLOT_SIZE;
                Some(DirEnt::parse(&store.block(nr)[off..off + SLOT_SIZE]))
            }
        }
    }

    /// Rewrites the entry a handle names through a closure. The handle is
    /// re-resolved against current storage first.
    pub fn patch(
        &self,
        store: &mut BlockStore,
        handle: EntryHandle,
        apply: impl FnOnce(&mut DirEnt),
    ) -> Result<(), FsError> {
        let mut entry = self.entry(store, handle).ok_or(FsError::NotFound)?;
        apply(&mut entry);
        match handle {
            EntryHandle::Root => store.root_entry_mut().copy_from_slice(entry.as_bytes()),
            EntryHandle::Slot { dir, block, slot } => {
                let node = self.nodes.get(store, dir);
                let nr = self
                    .nodes
                    .block_number(store, &node, block)
                    .ok_or(FsError::NotFound)?;
                let off = slot * SLOT_SIZE;
                store.block_mut(nr)[off..off + SLOT_SIZE].copy_from_slice(entry.as_bytes());
            }
        }
        Ok(())
    }

    /// Binds `name` to `inum` in the first block with a free slot, appending
    /// and formatting a new block when every existing one is full. The
    /// chosen block's header bookkeeping is updated in the same step.
    pub fn insert(
        &self,
        store: &mut BlockStore,
        dir: u32,
        name: &str,
        inum: u32,
        mode: u32,
    ) -> Result<(), FsError> {
        debug!("insert {:?} -> inode {} into directory {}", name, inum, dir);
        let node = self.nodes.get(store, dir);
        let blocks = node.size as usize / BLOCK_SIZE;
        let mut chosen = None;
        for block in 0..blocks {
            if let Some(header) = self.header(store, &node, block) {
                if header.free != 0 {
                    chosen = Some(block);
                    break;
                }
            }
        }
        let block = match chosen {
            Some(block) => block,
            None => self.append_block(store, dir)?,
        };

        // Re-read: appending may have grown the inode.
        let node = self.nodes.get(store, dir);
        let nr = self
            .nodes
            .block_number(store, &node, block)
            .ok_or(FsError::InvalidOperation("directory block unreachable"))?;
        let bytes = store.block_mut(nr);
        let mut header = DirHeader::parse(&bytes[..SLOT_SIZE]);
        let slot = match alloc::first_free(&header.occupancy, 1..SLOTS_PER_BLOCK) {
            Some(slot) => slot,
            None => {
                return Err(FsError::InvalidOperation(
                    "directory header free count disagrees with its occupancy map",
                ))
            }
        };

        let entry = DirEnt::new(name, inum, mode);
        let off = slot * SLOT_SIZE;
        bytes[off..off + SLOT_SIZE].copy_from_slice(entry.as_bytes());
        alloc::set_used(&mut header.occupancy, slot);
        header.free -= 1;
        bytes[..SLOT_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }

    /// Unbinds a name: clears the slot's occupancy bit and returns the slot
    /// to the header's free count. The entry bytes stay in place, merely
    /// marked free.
    pub fn remove(&self, store: &mut BlockStore, dir: u32, name: &str) -> Result<(), FsError> {
        debug!("remove {:?} from directory {}", name, dir);
        let handle = self.lookup(store, dir, name).ok_or(FsError::NotFound)?;
        if let EntryHandle::Slot { block, slot, .. } = handle {
            let node = self.nodes.get(store, dir);
            let nr = self
                .nodes
                .block_number(store, &node, block)
                .ok_or(FsError::NotFound)?;
            let bytes = store.block_mut(nr);
            let mut header = DirHeader::parse(&bytes[..SLOT_SIZE]);
            alloc::set_free(&mut header.occupancy, slot);
            header.free += 1;
            bytes[..SLOT_SIZE].copy_from_slice(header.as_bytes());
        }
        Ok(())
    }

    /// True when no block of the directory holds an occupied entry slot.
    pub fn is_empty(&self, store: &BlockStore, dir: u32) -> bool {
        self.entries(store, dir).next().is_none()
    }
}

pub(crate) struct Entries<'a> {
    table: DirTable,
    store: &'a BlockStore,
    node: Inode,
    block: usize,
    slot: usize,
    header: Option<DirHeader>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (usize, usize, DirEnt);

    fn next(&mut self) -> Option<Self::Item> {
        let blocks = self.node.size as usize / BLOCK_SIZE;
        loop {
            if self.block >= blocks {
                return None;
            }
            if self.slot == 0 {
                // Entering a new block: cache its header, skip slot 0.
                self.header = self.table.header(self.store, &self.node, self.block);
                self.slot = 1;
            }
            if self.slot >= SLOTS_PER_BLOCK || self.header.is_none() {
                self.block += 1;
                self.slot = 0;
                continue;
            }
            let slot = self.slot;
            self.slot += 1;
            let occupied = match &self.header {
                Some(header) => header.slot_used(slot),
                None => false,
            };
            if !occupied {
                continue;
            }
            let nr = self
                .table
                .nodes
                .block_number(self.store, &self.node, self.block)?;
            let off = slot * SLOT_SIZE;
            let entry = DirEnt::parse(&self.store.block(nr)[off..off + SLOT_SIZE]);
            return Some((self.block, slot, entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::DiskLayout;

    fn fresh_dir() -> (BlockStore, DirTable, u32) {
        let layout = DiskLayout::with_block_count(64);
        let mut store = BlockStore::blank(layout);
        store.reserve_metadata();
        let nodes = InodeTable::new(layout);
        let table = DirTable::new(nodes);
        let dir = nodes.allocate(&mut store).unwrap();
        table.format(&mut store, dir).unwrap();
        (store, table, dir)
    }

    fn header_of(table: &DirTable, store: &BlockStore, dir: u32, block: usize) -> DirHeader {
        let node = table.nodes.get(store, dir);
        table.header(store, &node, block).unwrap()
    }

    #[test]
    fn formatting_writes_one_block_with_a_fresh_header() {
        let (store, table, dir) = fresh_dir();
        assert_eq!(table.nodes.get(&store, dir).size as usize, BLOCK_SIZE);

        let header = header_of(&table, &store, dir, 0);
        assert_eq!(header.free_count(), 63);
        assert!(header.slot_used(0));
        assert_eq!(header.clear_slots(), 63);
    }

    #[test]
    fn inserted_names_resolve_with_their_inum_and_mode() {
        let (mut store, table, dir) = fresh_dir();
        table.insert(&mut store, dir, "a.txt", 7, 0o100644).unwrap();

        let handle = table.lookup(&store, dir, "a.txt").unwrap();
        let entry = table.entry(&store, handle).unwrap();
        assert_eq!(entry.inum, 7);
        assert_eq!(entry.mode, 0o100644);
        assert!(!entry.is_dir());
        assert!(table.lookup(&store, dir, "b.txt").is_none());
    }

    #[test]
    fn header_free_count_tracks_the_occupancy_map() {
        let (mut store, table, dir) = fresh_dir();
        for i in 0..10 {
            table
                .insert(&mut store, dir, &format!("f{}", i), i + 1, 0o100644)
                .unwrap();
        }
        table.remove(&mut store, dir, "f3").unwrap();
        table.remove(&mut store, dir, "f7").unwrap();

        let header = header_of(&table, &store, dir, 0);
        assert_eq!(header.free_count(), 63 - 8);
        assert_eq!(header.clear_slots(), header.free_count());
    }

    #[test]
    fn removal_leaves_other_entries_alone() {
        let (mut store, table, dir) = fresh_dir();
        table.insert(&mut store, dir, "keep", 1, 0o100644).unwrap();
        table.insert(&mut store, dir, "drop", 2, 0o100644).unwrap();
        table.insert(&mut store, dir, "also", 3, 0o100644).unwrap();

        table.remove(&mut store, dir, "drop").unwrap();

        assert!(table.lookup(&store, dir, "drop").is_none());
        assert!(table.lookup(&store, dir, "keep").is_some());
        assert!(table.lookup(&store, dir, "also").is_some());

        match table.remove(&mut store, dir, "drop") {
            Err(FsError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn sixty_fourth_insertion_opens_a_second_block() {
        let (mut store, table, dir) = fresh_dir();
        // Slot 0 is the header, so one block holds 63 entries.
        for i in 0..63 {
            table
                .insert(&mut store, dir, &format!("f{}", i), i + 1, 0o100644)
                .unwrap();
        }
        assert_eq!(table.nodes.get(&store, dir).size as usize, BLOCK_SIZE);
        assert_eq!(header_of(&table, &store, dir, 0).free_count(), 0);

        table.insert(&mut store, dir, "f63", 64, 0o100644).unwrap();
        assert_eq!(table.nodes.get(&store, dir).size as usize, 2 * BLOCK_SIZE);
        assert_eq!(header_of(&table, &store, dir, 1).free_count(), 62);

        let handle = table.lookup(&store, dir, "f63").unwrap();
        assert_eq!(
            handle,
            EntryHandle::Slot {
                dir,
                block: 1,
                slot: 1
            }
        );
    }

    #[test]
    fn freed_slots_are_reused_before_new_blocks() {
        let (mut store, table, dir) = fresh_dir();
        for i in 0..63 {
            table
                .insert(&mut store, dir, &format!("f{}", i), i + 1, 0o100644)
                .unwrap();
        }
        table.remove(&mut store, dir, "f10").unwrap();

        table.insert(&mut store, dir, "again", 99, 0o100644).unwrap();
        // No second block was appended; the freed slot got recycled.
        assert_eq!(table.nodes.get(&store, dir).size as usize, BLOCK_SIZE);
        match table.lookup(&store, dir, "again").unwrap() {
            EntryHandle::Slot { block: 0, slot, .. } => assert_eq!(slot, 11),
            other => panic!("unexpected handle {:?}", other),
        }
    }

    #[test]
    fn emptied_directories_keep_their_blocks() {
        let (mut store, table, dir) = fresh_dir();
        table.insert(&mut store, dir, "only", 5, 0o100644).unwrap();
        assert!(!table.is_empty(&store, dir));

        table.remove(&mut store, dir, "only").unwrap();
        assert!(table.is_empty(&store, dir));
        // The block stays allocated even though nothing occupies it.
        assert_eq!(table.nodes.get(&store, dir).size as usize, BLOCK_SIZE);
    }

    #[test]
    fn names_iterates_in_slot_order_and_restarts() {
        let (mut store, table, dir) = fresh_dir();
        for name in &["one", "two", "three"] {
            table.insert(&mut store, dir, name, 1, 0o100644).unwrap();
        }

        let listed: Vec<String> = table.names(&store, dir).collect();
        assert_eq!(listed, vec!["one", "two", "three"]);
        // Restartable: a second pass sees the same sequence.
        let again: Vec<String> = table.names(&store, dir).collect();
        assert_eq!(listed, again);
    }

    #[test]
    fn over_long_names_are_truncated_consistently() {
        let (mut store, table, dir) = fresh_dir();
        let long = "x".repeat(NAME_MAX + 20);
        table.insert(&mut store, dir, &long, 4, 0o100644).unwrap();

        // Lookup with the same over-long name applies the same truncation.
        let handle = table.lookup(&store, dir, &long).unwrap();
        let entry = table.entry(&store, handle).unwrap();
        assert_eq!(entry.name().len(), NAME_MAX);
        assert_eq!(entry.name(), "x".repeat(NAME_MAX));
    }

    #[test]
    fn paths_resolve_segment_by_segment() {
        let layout = DiskLayout::with_block_count(64);
        let mut store = BlockStore::blank(layout);
        store.reserve_metadata();
        let nodes = InodeTable::new(layout);
        let table = DirTable::new(nodes);

        // Root occupies inode 0 by convention; build it by hand.
        crate::alloc::set_used(store.inode_map_mut(), ROOT_INUM as usize);
        nodes.put(&mut store, ROOT_INUM, &Inode::empty(MODE_DIR | 0o755));
        table.format(&mut store, ROOT_INUM).unwrap();
        store
            .root_entry_mut()
            .copy_from_slice(DirEnt::new(ROOT_NAME, ROOT_INUM, MODE_DIR | 0o755).as_bytes());

        let sub = nodes.allocate(&mut store).unwrap();
        table.format(&mut store, sub).unwrap();
        table
            .insert(&mut store, ROOT_INUM, "sub", sub, MODE_DIR | 0o755)
            .unwrap();
        table
            .insert(&mut store, sub, "leaf.txt", 2, 0o100644)
            .unwrap();

        assert_eq!(table.resolve(&store, ""), Some(EntryHandle::Root));
        assert_eq!(table.resolve(&store, "/"), Some(EntryHandle::Root));

        let leaf = table.resolve(&store, "/sub/leaf.txt").unwrap();
        assert_eq!(table.entry(&store, leaf).unwrap().inum, 2);
        // Doubled separators are tolerated.
        assert_eq!(table.resolve(&store, "/sub//leaf.txt"), Some(leaf));

        assert!(table.resolve(&store, "/sub/missing").is_none());
        assert!(table.resolve(&store, "/missing/leaf.txt").is_none());
        // A file used as an intermediate segment fails cleanly.
        assert!(table.resolve(&store, "/sub/leaf.txt/deeper").is_none());
    }

    #[test]
    fn patched_entries_read_back_updated() {
        let (mut store, table, dir) = fresh_dir();
        table.insert(&mut store, dir, "f", 3, 0o100644).unwrap();
        let handle = table.lookup(&store, dir, "f").unwrap();

        table
            .patch(&mut store, handle, |entry| entry.mode = 0o100600)
            .unwrap();
        assert_eq!(table.entry(&store, handle).unwrap().mode, 0o100600);
    }
}
