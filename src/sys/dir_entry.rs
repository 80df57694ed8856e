//! Directory records. A directory is an ordinary inode whose payload is
//! an array of these fixed-size records; nothing below the directory
//! layer knows about them.

use crate::error::{Error, Result};

/// Encoded size of one record.
pub const DIR_ENTRY_SIZE: usize = 128;

/// Longest permitted name in bytes; the record stores a trailing NUL.
pub const NAME_MAX: usize = 119;

/// Id stored in a record whose slot is unused.
pub const FREE_ENTRY_ID: i32 = -1;

/// What an inode is, as recorded by its parent directory entry. The
/// fragment table does not know; an inode opened by bare id starts out
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Unknown = 0,
    Dir = 1,
    File = 2,
}

impl InodeKind {
    pub fn from_raw(raw: i32) -> InodeKind {
        match raw {
            1 => InodeKind::Dir,
            2 => InodeKind::File,
            _ => InodeKind::Unknown,
        }
    }
}

/// One decoded directory record: `i32` id, `i32` kind, then the
/// NUL-terminated name, little endian, 128 bytes in all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: i32,
    pub kind: InodeKind,
    pub name: String,
}

impl DirEntry {
    pub fn new(id: i32, kind: InodeKind, name: &str) -> Result<DirEntry> {
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong(NAME_MAX));
        }
        Ok(DirEntry {
            id,
            kind,
            name: name.to_owned(),
        })
    }

    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.kind as i32).to_le_bytes());
        buf[8..8 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> DirEntry {
        let id = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let kind = InodeKind::from_raw(i32::from_le_bytes(buf[4..8].try_into().unwrap()));
        let name_bytes = &buf[8..DIR_ENTRY_SIZE];
        let len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();
        DirEntry { id, kind, name }
    }

    /// Marker written over a removed record.
    pub fn tombstone() -> DirEntry {
        DirEntry {
            id: FREE_ENTRY_ID,
            kind: InodeKind::Unknown,
            name: String::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.id == FREE_ENTRY_ID
    }
}
