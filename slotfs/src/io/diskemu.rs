use crate::io::{BlockNumber, BlockStorage};
use crate::BLOCK_SIZE;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// Emulates block disk/flash storage in userspace using a file as block
/// storage. This is only meant to be used for file system development and
/// testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of
    /// a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return an error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        Ok(FileBlockEmulator {
            fd: file,
            block_count: nblocks,
        })
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if blocknr > (self.block_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }

        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        self.fd.read_exact(&mut buf[0..BLOCK_SIZE])?;
        Ok(())
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if blocknr > (self.block_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        self.fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;

        let max = if BLOCK_SIZE < buf.len() {
            BLOCK_SIZE
        } else {
            buf.len()
        };
        let bytes_written = self.fd.write(&buf[0..max])?;
        debug_assert!(bytes_written == max);
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded
            // down to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Controls whether building zeroes the backing file. Pass `false` when
    /// reopening an already initialized image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally,
    /// ownership of the file is transferred to the emulator meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.block_count > 0);
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        bfd.seek(SeekFrom::Start(0))?;
        // Zero out the "disk" blocks, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(vec![0x00; BLOCK_SIZE].as_slice())?;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(4)
            .build()
            .expect("failed to allocate file block");
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            (4 * BLOCK_SIZE) as u64
        );
    }

    #[test]
    fn can_read_and_write_blocks() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(4)
            .build()
            .expect("failed to allocate file block");

        // Fill a block with a non-zero character.
        let mut block = vec![0x55; BLOCK_SIZE];
        disk_emu.write_block(2, block.as_mut_slice()).unwrap();
        disk_emu.sync_disk().unwrap();

        // A different block stays zeroed.
        let mut read_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(3, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x00; BLOCK_SIZE]);

        let mut filled_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(2, filled_block.as_mut_slice()).unwrap();
        assert_eq!(filled_block, vec![0x55; BLOCK_SIZE]);
    }

    #[test]
    fn read_block_beyond_range_returns_error() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(1)
            .build()
            .expect("failed to allocate file block");

        let mut block = vec![0x55; BLOCK_SIZE];
        assert!(disk_emu.write_block(1, block.as_mut_slice()).is_err());
        assert!(disk_emu.read_block(1, block.as_mut_slice()).is_err());
    }

    #[test]
    fn writing_to_block_with_short_buffer_succeeds() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(1)
            .build()
            .expect("failed to allocate file block");

        // Fill half the block with meaningful data.
        let mut block = vec![0x55; BLOCK_SIZE / 2];
        disk_emu
            .write_block(0, block.as_mut_slice())
            .expect("failed to write block");
        disk_emu.sync_disk().unwrap();
    }
}
