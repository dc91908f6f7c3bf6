use std::env;

use blockfs::{FileStore, Geometry};

/// Opens (or creates) a disk image and walks through the five store operations.
/// Pass a path to keep the image around between runs.
pub fn main() -> blockfs::Result<()> {
    let tmp = tempfile::NamedTempFile::new()?;
    let path = env::args()
        .nth(1)
        .map(Into::into)
        .unwrap_or_else(|| tmp.path().to_path_buf());

    let fs = FileStore::open_path(&path, Geometry::default())?;
    let geometry = fs.geometry();
    println!(
        "image: {} ({} files, {} blocks of {} bytes)",
        path.display(),
        geometry.max_files,
        geometry.max_blocks,
        geometry.block_size
    );
    println!("existing files: {:?}", fs.list_files());

    match fs.create_file("hello.txt") {
        Ok(()) | Err(blockfs::FsError::AlreadyExists(_)) => (),
        Err(err) => return Err(err),
    }
    fs.write_file("hello.txt", b"hello, block store")?;
    let data = fs.read_file("hello.txt")?;
    println!("hello.txt: {}", String::from_utf8_lossy(&data));
    println!("files: {:?}, free blocks: {}", fs.list_files(), fs.free_blocks());

    fs.close()?;
    Ok(())
}
