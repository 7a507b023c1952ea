//! Formats a volume on a temporary file, populates a small tree, and prints
//! a listing. Run with `RUST_LOG=debug` to watch the allocator work.

use slotfs::io::FileBlockEmulatorBuilder;
use slotfs::{DiskLayout, FsError, SlotFs, BLOCK_COUNT};

fn main() -> Result<(), FsError> {
    env_logger::init();

    let image = tempfile::tempfile()?;
    let dev = FileBlockEmulatorBuilder::from(image)
        .with_block_count(BLOCK_COUNT)
        .build()?;
    let mut fs = SlotFs::create(dev, DiskLayout::with_block_count(BLOCK_COUNT as u32))?;

    fs.create_dir("/notes", 0o755)?;
    fs.create_file("/notes/hello.txt", 0o644)?;
    fs.write("/notes/hello.txt", 0, b"hello from a tiny filesystem\n")?;
    fs.link("/notes/hello.txt", "/notes/alias.txt")?;
    fs.sync()?;

    for (name, attr) in fs.read_dir("/notes")? {
        println!(
            "{:>6} bytes  inode {:>3}  refs {}  {}{}",
            attr.size,
            attr.inum,
            attr.refs,
            name,
            if attr.is_dir { "/" } else { "" }
        );
    }

    let mut buf = [0u8; 64];
    let got = fs.read("/notes/alias.txt", 0, &mut buf)?;
    print!("{}", String::from_utf8_lossy(&buf[..got]));
    Ok(())
}
