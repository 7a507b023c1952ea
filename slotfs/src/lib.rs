//! A single-volume, user-space filesystem backed by a fixed array of
//! uniformly sized storage blocks.
//!
//! The volume layout, front to back:
//!
//! ==========================================================================
//! | SuperBlock + bitmaps + root entry | Inode table | Data region          |
//! ==========================================================================
//!
//! Files and directories are inodes holding four direct block pointers plus
//! one single-level indirect block. Directory data is a run of fixed-size
//! blocks of 64 entry slots each; slot 0 of every block is a header carrying
//! that block's occupancy bitmap and free-slot count.
//!
//! The crate performs no locking; a single caller is expected to serialize
//! all operations (see [`SlotFs`]).

mod alloc;
mod dir;
mod fs;
pub mod io;
mod node;
mod sb;
mod store;

pub use crate::dir::{MODE_DIR, MODE_FILE, NAME_MAX, ROOT_INUM, ROOT_NAME};
pub use crate::fs::{Attr, FsError, SlotFs};
pub use crate::sb::DiskLayout;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const BLOCK_SIZE: usize = 4096;

/// Default number of blocks in a volume (1 MiB image).
pub const BLOCK_COUNT: usize = 256;
