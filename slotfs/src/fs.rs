//! The filesystem surface the OS-facing adaptor consumes: path-based
//! create/remove/link/list/truncate/read/write over the inode and directory
//! layers. Single caller, synchronous; the facade performs no locking.

use crate::alloc;
use crate::dir::{
    DirEnt, DirTable, EntryHandle, MODE_DIR, MODE_FILE, MODE_KIND_MASK, ROOT_INUM, ROOT_NAME,
};
use crate::io::BlockStorage;
use crate::node::{Inode, InodeTable};
use crate::sb::{DiskLayout, SuperBlock, SB_BYTES};
use crate::store::BlockStore;
use crate::BLOCK_SIZE;
use log::info;
use thiserror::Error;
use zerocopy::AsBytes;

const ROOT_MODE: u32 = MODE_DIR | 0o755;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("found no entry at path")]
    NotFound,
    #[error("no free inode or data block available")]
    Exhausted,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("volume image IO failed")]
    Io(#[from] std::io::Error),
}

/// Attributes of one filesystem object, as reported by [`SlotFs::stat`] and
/// directory listings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub inum: u32,
    pub mode: u32,
    pub size: u32,
    pub refs: u32,
    pub is_dir: bool,
}

/// Splits a path into its parent directory and final name. The name is
/// empty only for the root itself.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
        None => ("", trimmed),
    }
}

/// A mounted single-volume filesystem over owned block storage.
///
/// All state lives in an in-memory image of the volume; [`sync`] writes the
/// image back to the device. One `SlotFs` expects to be the only party
/// touching its device.
///
/// [`sync`]: SlotFs::sync
pub struct SlotFs<T: BlockStorage> {
    dev: T,
    store: BlockStore,
    nodes: InodeTable,
    dirs: DirTable,
}

impl<T: BlockStorage> SlotFs<T> {
    /// Formats the device and mounts the empty filesystem.
    ///
    /// # Layout
    /// ==========================================================================
    /// | SuperBlock | block bitmap | inode bitmap | root entry | Inode table | Data |
    /// ==========================================================================
    /// (the first four regions share block 0)
    pub fn create(dev: T, layout: DiskLayout) -> Result<Self, FsError> {
        let mut store = BlockStore::blank(layout);
        store.block_mut(0)[..SB_BYTES].copy_from_slice(&SuperBlock::from_layout(&layout).serialize());
        store.reserve_metadata();

        let nodes = InodeTable::new(layout);
        let dirs = DirTable::new(nodes);

        // Inode 0 is the root directory, claimed outside normal allocation.
        alloc::set_used(store.inode_map_mut(), ROOT_INUM as usize);
        nodes.put(&mut store, ROOT_INUM, &Inode::empty(ROOT_MODE));
        dirs.format(&mut store, ROOT_INUM)?;
        store
            .root_entry_mut()
            .copy_from_slice(DirEnt::new(ROOT_NAME, ROOT_INUM, ROOT_MODE).as_bytes());

        let mut fs = SlotFs {
            dev,
            store,
            nodes,
            dirs,
        };
        fs.sync()?;
        info!("formatted volume: {} blocks", layout.block_count);
        Ok(fs)
    }

    /// Mounts an already formatted device, rebuilding the layout from the
    /// superblock. Panics if the image was never formatted.
    pub fn open(mut dev: T) -> Result<Self, FsError> {
        let mut first = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut first)?;
        let layout = SuperBlock::parse(&first[..SB_BYTES]).layout();

        let store = BlockStore::load(&mut dev, layout)?;
        let nodes = InodeTable::new(layout);
        Ok(SlotFs {
            dev,
            store,
            nodes,
            dirs: DirTable::new(nodes),
        })
    }

    /// Writes the in-memory image back to the device.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.store.sync(&mut self.dev)?;
        Ok(())
    }

    pub fn layout(&self) -> &DiskLayout {
        self.store.layout()
    }

    fn resolve(&self, path: &str) -> Result<(EntryHandle, DirEnt), FsError> {
        let handle = self
            .dirs
            .resolve(&self.store, path)
            .ok_or(FsError::NotFound)?;
        let entry = self.dirs.entry(&self.store, handle).ok_or(FsError::NotFound)?;
        Ok((handle, entry))
    }

    /// Resolves a path that must name a directory, yielding its inode.
    fn dir_inum(&self, path: &str) -> Result<u32, FsError> {
        let (handle, entry) = self.resolve(path)?;
        if handle == EntryHandle::Root {
            return Ok(ROOT_INUM);
        }
        if !entry.is_dir() {
            return Err(FsError::InvalidOperation("not a directory"));
        }
        Ok(entry.inum)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dirs.resolve(&self.store, path).is_some()
    }

    pub fn stat(&self, path: &str) -> Result<Attr, FsError> {
        let (_, entry) = self.resolve(path)?;
        let node = self.nodes.get(&self.store, entry.inum);
        Ok(Attr {
            inum: entry.inum,
            mode: entry.mode,
            size: node.size,
            refs: node.refs,
            is_dir: entry.is_dir(),
        })
    }

    /// Creates a regular file. Permission bits are kept; the kind bits are
    /// forced to "regular file".
    pub fn create_file(&mut self, path: &str, mode: u32) -> Result<u32, FsError> {
        self.create_node(path, (mode & !MODE_KIND_MASK) | MODE_FILE)
    }

    /// Creates a directory with one formatted directory block.
    pub fn create_dir(&mut self, path: &str, mode: u32) -> Result<u32, FsError> {
        self.create_node(path, (mode & !MODE_KIND_MASK) | MODE_DIR)
    }

    fn create_node(&mut self, path: &str, mode: u32) -> Result<u32, FsError> {
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Err(FsError::InvalidOperation("cannot create the root entry"));
        }
        let dir = self.dir_inum(parent)?;
        if self.dirs.lookup(&self.store, dir, name).is_some() {
            return Err(FsError::InvalidOperation("name already exists"));
        }

        let inum = self.nodes.allocate(&mut self.store)?;
        let mut node = self.nodes.get(&self.store, inum);
        node.mode = mode;
        self.nodes.put(&mut self.store, inum, &node);

        let prepared = if mode & MODE_KIND_MASK == MODE_DIR {
            self.dirs.format(&mut self.store, inum)
        } else {
            Ok(())
        };
        let outcome = prepared.and_then(|_| self.dirs.insert(&mut self.store, dir, name, inum, mode));
        if let Err(err) = outcome {
            // Unwind: the name never appeared, so the inode must not stay.
            self.nodes.release(&mut self.store, inum);
            return Err(err);
        }
        info!("created {:?} as inode {} (mode {:o})", path, inum, mode);
        Ok(inum)
    }

    /// Reads a byte range of a file. Requests past the end short-read.
    pub fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let (_, entry) = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("cannot read directory data"));
        }
        let node = self.nodes.get(&self.store, entry.inum);
        Ok(self.nodes.read(&self.store, &node, offset, buf))
    }

    /// Writes a byte range of a file, growing it as needed. Returns the
    /// bytes actually written; a short count means the volume ran out of
    /// blocks part-way.
    pub fn write(&mut self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let (_, entry) = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("cannot write directory data"));
        }
        let mut node = self.nodes.get(&self.store, entry.inum);
        let written = self.nodes.write(&mut self.store, &mut node, offset, data)?;
        self.nodes.put(&mut self.store, entry.inum, &node);
        Ok(written)
    }

    /// Sets a file's length exactly: shrinks from the tail or extends with
    /// zeroed blocks. Fails with [`FsError::Exhausted`] if extension cannot
    /// be fully satisfied (the partially reached length is kept).
    pub fn truncate(&mut self, path: &str, size: u32) -> Result<(), FsError> {
        let (_, entry) = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("cannot truncate a directory"));
        }
        let mut node = self.nodes.get(&self.store, entry.inum);
        self.nodes.shrink(&mut self.store, &mut node, size);
        let achieved = self.nodes.grow(&mut self.store, &mut node, size);
        self.nodes.put(&mut self.store, entry.inum, &node);
        if achieved < size {
            return Err(FsError::Exhausted);
        }
        Ok(())
    }

    /// Binds an additional name to an existing file's inode.
    pub fn link(&mut self, existing: &str, new_path: &str) -> Result<(), FsError> {
        let (_, entry) = self.resolve(existing)?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("cannot hard-link a directory"));
        }
        let (parent, name) = split_path(new_path);
        if name.is_empty() {
            return Err(FsError::InvalidOperation("cannot link over the root entry"));
        }
        let dir = self.dir_inum(parent)?;
        if self.dirs.lookup(&self.store, dir, name).is_some() {
            return Err(FsError::InvalidOperation("name already exists"));
        }
        self.dirs
            .insert(&mut self.store, dir, name, entry.inum, entry.mode)?;

        let mut node = self.nodes.get(&self.store, entry.inum);
        node.refs += 1;
        self.nodes.put(&mut self.store, entry.inum, &node);
        Ok(())
    }

    /// Removes a file's name from its directory and drops the inode
    /// reference it held.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Err(FsError::InvalidOperation("cannot unlink the root entry"));
        }
        let (_, entry) = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("is a directory"));
        }
        let dir = self.dir_inum(parent)?;
        self.dirs.remove(&mut self.store, dir, name)?;
        self.nodes.release(&mut self.store, entry.inum);
        Ok(())
    }

    /// Removes an empty directory. A directory with any occupied slot in
    /// any of its blocks stays put.
    pub fn remove_dir(&mut self, path: &str) -> Result<(), FsError> {
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Err(FsError::InvalidOperation("cannot remove the root entry"));
        }
        let (_, entry) = self.resolve(path)?;
        if !entry.is_dir() {
            return Err(FsError::InvalidOperation("not a directory"));
        }
        if !self.dirs.is_empty(&self.store, entry.inum) {
            return Err(FsError::NotEmpty);
        }
        let dir = self.dir_inum(parent)?;
        self.dirs.remove(&mut self.store, dir, name)?;
        self.nodes.release(&mut self.store, entry.inum);
        Ok(())
    }

    /// Moves an entry to a new parent and/or name. An existing destination
    /// entry is replaced and its inode released; a non-empty destination
    /// directory refuses the move. Renaming an entry onto itself, under any
    /// spelling of its path, changes nothing.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let (from_parent, from_name) = split_path(from);
        let (to_parent, to_name) = split_path(to);
        if from_name.is_empty() || to_name.is_empty() {
            return Err(FsError::InvalidOperation("cannot rename the root entry"));
        }
        let (src, entry) = self.resolve(from)?;
        let src_dir = self.dir_inum(from_parent)?;
        let dst_dir = self.dir_inum(to_parent)?;

        if let Some(existing) = self.dirs.lookup(&self.store, dst_dir, to_name) {
            if existing == src {
                // Both paths spell the same entry; moving it would destroy
                // it, since the destination "replacement" is the source.
                return Ok(());
            }
            let old = self.dirs.entry(&self.store, existing).ok_or(FsError::NotFound)?;
            if old.is_dir() && !self.dirs.is_empty(&self.store, old.inum) {
                return Err(FsError::NotEmpty);
            }
            self.dirs.remove(&mut self.store, dst_dir, to_name)?;
            self.nodes.release(&mut self.store, old.inum);
        }

        self.dirs
            .insert(&mut self.store, dst_dir, to_name, entry.inum, entry.mode)?;
        self.dirs.remove(&mut self.store, src_dir, from_name)?;
        info!("renamed {:?} -> {:?}", from, to);
        Ok(())
    }

    /// Replaces the permission bits of an entry, keeping its kind bits. The
    /// inode's stored mode is kept in step.
    pub fn set_mode(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let (handle, entry) = self.resolve(path)?;
        let updated = (entry.mode & MODE_KIND_MASK) | (mode & !MODE_KIND_MASK);
        self.dirs
            .patch(&mut self.store, handle, |e| e.mode = updated)?;

        let mut node = self.nodes.get(&self.store, entry.inum);
        node.mode = updated;
        self.nodes.put(&mut self.store, entry.inum, &node);
        Ok(())
    }

    /// Lists a directory's children with their attributes, in physical
    /// block/slot order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<(String, Attr)>, FsError> {
        let dir = self.dir_inum(path)?;
        let mut listing = Vec::new();
        for (_, _, entry) in self.dirs.entries(&self.store, dir) {
            let node = self.nodes.get(&self.store, entry.inum);
            listing.push((
                entry.name(),
                Attr {
                    inum: entry.inum,
                    mode: entry.mode,
                    size: node.size,
                    refs: node.refs,
                    is_dir: entry.is_dir(),
                },
            ));
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileBlockEmulator, FileBlockEmulatorBuilder};

    fn create_test_fs(blocks: u32) -> SlotFs<FileBlockEmulator> {
        let dev = FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
            .with_block_count(blocks as usize)
            .build()
            .expect("could not initialize disk emulator");
        SlotFs::create(dev, DiskLayout::with_block_count(blocks)).unwrap()
    }

    #[test]
    fn the_root_always_resolves() {
        let fs = create_test_fs(64);
        let root = fs.stat("/").unwrap();
        assert_eq!(root.inum, ROOT_INUM);
        assert!(root.is_dir);
        assert_eq!(fs.stat("").unwrap(), root);
        assert!(fs.exists("/"));
    }

    #[test]
    fn missing_paths_report_not_found() {
        let fs = create_test_fs(64);
        match fs.stat("/nope") {
            Err(FsError::NotFound) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!fs.exists("/nope"));
    }

    #[test]
    fn created_files_get_fresh_inodes_and_kind_bits() {
        let mut fs = create_test_fs(64);
        let first = fs.create_file("/a", 0o644).unwrap();
        let second = fs.create_file("/b", 0o600).unwrap();
        assert_ne!(first, second);

        let attr = fs.stat("/a").unwrap();
        assert_eq!(attr.mode, MODE_FILE | 0o644);
        assert!(!attr.is_dir);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.refs, 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut fs = create_test_fs(64);
        fs.create_file("/a", 0o644).unwrap();
        match fs.create_file("/a", 0o644) {
            Err(FsError::InvalidOperation(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn directories_nest_and_list_their_children() {
        let mut fs = create_test_fs(64);
        fs.create_dir("/docs", 0o755).unwrap();
        fs.create_file("/docs/a.txt", 0o644).unwrap();
        fs.create_file("/docs/b.txt", 0o644).unwrap();

        let listing = fs.read_dir("/docs").unwrap();
        let names: Vec<&str> = listing.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(listing.iter().all(|(_, attr)| !attr.is_dir));

        // A directory's own attributes report one formatted block.
        let docs = fs.stat("/docs").unwrap();
        assert!(docs.is_dir);
        assert_eq!(docs.size as usize, BLOCK_SIZE);
    }

    #[test]
    fn set_mode_keeps_the_kind_bits() {
        let mut fs = create_test_fs(64);
        fs.create_file("/a", 0o644).unwrap();
        fs.set_mode("/a", 0o400).unwrap();
        let attr = fs.stat("/a").unwrap();
        assert_eq!(attr.mode, MODE_FILE | 0o400);
        assert!(!attr.is_dir);
    }

    #[test]
    fn writing_through_a_dangling_parent_fails() {
        let mut fs = create_test_fs(64);
        match fs.create_file("/missing/a", 0o644) {
            Err(FsError::NotFound) => (),
            other => panic!("unexpected result {:?}", other),
        }
        match fs.write("/missing/a", 0, b"data") {
            Err(FsError::NotFound) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn files_cannot_serve_as_directories() {
        let mut fs = create_test_fs(64);
        fs.create_file("/plain", 0o644).unwrap();
        match fs.create_file("/plain/child", 0o644) {
            // Resolution of the parent path walks through a non-directory.
            Err(FsError::InvalidOperation(_)) | Err(FsError::NotFound) => (),
            other => panic!("unexpected result {:?}", other),
        }
        match fs.read_dir("/plain") {
            Err(FsError::InvalidOperation(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
