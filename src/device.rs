use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Fixed-size random-access store of whole blocks.
///
/// `read` and `write` are synchronous and assumed durable on return. The
/// buffer length selects the block count, so it must be a non-zero
/// multiple of [`block_size`](BlockDevice::block_size). The backing store
/// is accessed by at most one process at a time; intra-process sharing is
/// the cache's business.
pub trait BlockDevice: Send {
    fn block_size(&self) -> u32;
    fn total_bytes(&self) -> u64;

    fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, block: u64, buf: &[u8]) -> Result<()>;

    fn total_blocks(&self) -> u64 {
        self.total_bytes() / u64::from(self.block_size())
    }
}

fn check_range(dev: &impl BlockDevice, block: u64, len: usize) -> Result<()> {
    let bs = dev.block_size() as usize;
    if len == 0 || len % bs != 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {len} bytes is not a whole number of {bs}-byte blocks"),
        )));
    }
    let end = block
        .checked_mul(bs as u64)
        .and_then(|ofs| ofs.checked_add(len as u64));
    match end {
        Some(end) if end <= dev.total_bytes() => Ok(()),
        _ => Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block range {block}+{} outside container", len / bs),
        ))),
    }
}

/// RAM-backed container. Clones share the same buffer, which is what a
/// remount wants.
#[derive(Clone)]
pub struct MemDevice {
    buf: Arc<Mutex<Vec<u8>>>,
    block_size: u32,
}

impl MemDevice {
    pub fn new(blocks: u64, block_size: u32) -> MemDevice {
        MemDevice {
            buf: Arc::new(Mutex::new(vec![0; (blocks * u64::from(block_size)) as usize])),
            block_size,
        }
    }

    /// Snapshot of the raw container bytes.
    pub fn image(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Overwrite one raw byte, bypassing every layer. Test hook for
    /// corruption scenarios.
    pub fn poke(&self, offset: usize, value: u8) {
        self.buf.lock()[offset] = value;
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_bytes(&self) -> u64 {
        self.buf.lock().len() as u64
    }

    fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self, block, buf.len())?;
        let ofs = (block * u64::from(self.block_size)) as usize;
        buf.copy_from_slice(&self.buf.lock()[ofs..ofs + buf.len()]);
        Ok(())
    }

    fn write(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        check_range(self, block, buf.len())?;
        let ofs = (block * u64::from(self.block_size)) as usize;
        self.buf.lock()[ofs..ofs + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Container in a local file. The file size is fixed at creation; there
/// is no online resize.
pub struct FileDevice {
    file: File,
    block_size: u32,
    total_bytes: u64,
}

impl FileDevice {
    /// Create a zeroed container of `blocks` blocks, truncating anything
    /// already at `path`.
    pub fn create<P: AsRef<Path>>(path: P, blocks: u64, block_size: u32) -> Result<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total_bytes = blocks * u64::from(block_size);
        file.set_len(total_bytes)?;
        Ok(FileDevice {
            file,
            block_size,
            total_bytes,
        })
    }

    /// Open an existing container.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<FileDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let total_bytes = file.metadata()?.len();
        if total_bytes == 0 || total_bytes % u64::from(block_size) != 0 {
            return Err(Error::CorruptVolume(
                "container size is not a whole number of blocks",
            ));
        }
        Ok(FileDevice {
            file,
            block_size,
            total_bytes,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self, block, buf.len())?;
        self.file
            .seek(SeekFrom::Start(block * u64::from(self.block_size)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        check_range(self, block, buf.len())?;
        self.file
            .seek(SeekFrom::Start(block * u64::from(self.block_size)))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_round_trip() {
        let mut dev = MemDevice::new(8, 1024);
        assert_eq!(dev.total_blocks(), 8);

        let block = vec![0xa5u8; 1024];
        dev.write(3, &block).unwrap();

        let mut out = vec![0u8; 1024];
        dev.read(3, &mut out).unwrap();
        assert_eq!(out, block);

        // clones see the same bytes
        let mut other = dev.clone();
        other.read(3, &mut out).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn mem_multi_block() {
        let mut dev = MemDevice::new(8, 1024);
        let two: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        dev.write(2, &two).unwrap();
        let mut out = vec![0u8; 2048];
        dev.read(2, &mut out).unwrap();
        assert_eq!(out, two);
    }

    #[test]
    fn mem_out_of_range() {
        let mut dev = MemDevice::new(4, 1024);
        let mut buf = vec![0u8; 1024];
        assert!(dev.read(4, &mut buf).is_err());
        assert!(dev.write(3, &vec![0u8; 2048]).is_err());
        assert!(dev.read(0, &mut buf[..100]).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut dev = FileDevice::create(&path, 16, 1024).unwrap();
        let block = vec![0x42u8; 1024];
        dev.write(7, &block).unwrap();
        drop(dev);

        let mut dev = FileDevice::open(&path, 1024).unwrap();
        assert_eq!(dev.total_bytes(), 16 * 1024);
        let mut out = vec![0u8; 1024];
        dev.read(7, &mut out).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn file_rejects_ragged_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged");
        std::fs::write(&path, vec![0u8; 1500]).unwrap();
        assert!(matches!(
            FileDevice::open(&path, 1024),
            Err(Error::CorruptVolume(_))
        ));
    }
}
