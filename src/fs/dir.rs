//! Directory access on top of plain inode reads and writes.
//!
//! A directory's payload is an array of fixed-size records and grows a
//! whole block at a time, each new block pre-filled with tombstones. The
//! array never shrinks: removing an entry overwrites its record with a
//! tombstone, and an insert reuses the first tombstone before growing.
//! Nothing here takes an inode lock itself; each read/write goes through
//! the engine, which does.

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::sys::dir_entry::{DirEntry, DIR_ENTRY_SIZE};

use super::{CoverFs, NodeHandle};

/// A directory inode viewed as an entry table.
pub struct Directory<'a, D: BlockDevice> {
    fs: &'a CoverFs<D>,
    node: NodeHandle,
}

impl<'a, D: BlockDevice> Directory<'a, D> {
    pub(super) fn new(fs: &'a CoverFs<D>, node: NodeHandle) -> Directory<'a, D> {
        Directory { fs, node }
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    fn read_records(&self) -> Result<Vec<u8>> {
        let size = self.node.size();
        let mut buf = vec![0u8; size as usize];
        let got = self.fs.read(&self.node, 0, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    /// All live entries, in table order.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        let buf = self.read_records()?;
        Ok(buf
            .chunks_exact(DIR_ENTRY_SIZE)
            .map(DirEntry::decode)
            .filter(|e| !e.is_free())
            .collect())
    }

    /// Look a name up, also reporting its record offset.
    fn find_at(&self, name: &str) -> Result<Option<(u64, DirEntry)>> {
        let buf = self.read_records()?;
        for (i, chunk) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let entry = DirEntry::decode(chunk);
            if !entry.is_free() && entry.name == name {
                return Ok(Some(((i * DIR_ENTRY_SIZE) as u64, entry)));
            }
        }
        Ok(None)
    }

    pub fn find(&self, name: &str) -> Result<Option<DirEntry>> {
        Ok(self.find_at(name)?.map(|(_, e)| e))
    }

    /// Insert an entry, reusing the first tombstone. A full table grows
    /// by one block of tombstones whose first record becomes the entry.
    pub fn add(&self, entry: &DirEntry) -> Result<()> {
        let buf = self.read_records()?;
        let slot = buf
            .chunks_exact(DIR_ENTRY_SIZE)
            .position(|chunk| DirEntry::decode(chunk).is_free());
        if let Some(i) = slot {
            return self.fs.write(&self.node, (i * DIR_ENTRY_SIZE) as u64, &entry.encode());
        }

        let ofs = self.node.size();
        let per_block = self.fs.block_size() as usize / DIR_ENTRY_SIZE;
        let tombstone = DirEntry::tombstone().encode();
        let mut block = Vec::with_capacity(per_block * DIR_ENTRY_SIZE);
        for _ in 0..per_block {
            block.extend_from_slice(&tombstone);
        }
        block[..DIR_ENTRY_SIZE].copy_from_slice(&entry.encode());
        self.fs.write(&self.node, ofs, &block)
    }

    /// Overwrite the named entry with a tombstone.
    pub fn remove(&self, name: &str) -> Result<()> {
        let (ofs, _) = self.find_at(name)?.ok_or(Error::NotFound)?;
        self.fs.write(&self.node, ofs, &DirEntry::tombstone().encode())
    }
}
