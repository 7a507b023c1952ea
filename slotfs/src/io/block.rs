use std::path::Path;

/// The block number to access ranging from 0 (the first block) to n - 1 (the
/// last block) where n is the number of blocks available.
pub type BlockNumber = usize;

/// The raw block device the filesystem sits on: a fixed number of fixed-size
/// blocks addressed by number. The filesystem never touches the host
/// filesystem through any other door.
pub trait BlockStorage {
    /// Opens a disk at the specified path. This method does not validate the
    /// storage blocks, it is up to clients to ensure disks are appropriately
    /// initialized.
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Reads disk block number into the provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes the provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must be
    /// guaranteed the disk writes actually occurred, for instance, if being
    /// re-read from disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
