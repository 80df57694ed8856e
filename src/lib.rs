//! An encrypted filesystem in a single container file.
//!
//! The container is a flat array of fixed-size blocks. Block 0 carries
//! the clear-text volume header (salt plus the passphrase-wrapped master
//! key); everything else is AES-256-CBC ciphertext keyed per block
//! index. On top of the raw device sit a write-back block cache with a
//! dedicated flusher thread and a fragment allocator that packs
//! variable-length inodes into the block space; directories are inodes
//! holding fixed-size entry records.
//!
//! ```no_run
//! use coverfs::{CoverFs, FileDevice, MountOptions};
//!
//! # fn main() -> coverfs::Result<()> {
//! let dev = FileDevice::create("volume.cfs", 16384, 4096)?;
//! let fs = CoverFs::mount(dev, MountOptions::default(), |_| "hunter2".into())?;
//! let root = fs.open_node("")?;
//! let file = fs.create_file(&root, "hello")?;
//! fs.write(&file, 0, b"Hello world\n")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod crypt;
pub mod device;
pub mod error;
pub mod fs;
pub mod sys;

pub use crate::crypt::PassphraseContext;
pub use crate::device::{BlockDevice, FileDevice, MemDevice};
pub use crate::error::{Error, Result};
pub use crate::fs::{CoverFs, MountOptions, Node, NodeHandle, VolumeStat};
pub use crate::sys::dir_entry::{DirEntry, InodeKind};

#[cfg(test)]
mod tests {
    use crate::sys::dir_entry::{DirEntry, InodeKind, DIR_ENTRY_SIZE};
    use crate::sys::fragment::{FragmentDesc, FRAGMENT_DESC_SIZE};
    use crate::sys::header::{HEADER_SIZE, USER_SLOT_SIZE};

    #[test]
    fn sizes() {
        assert_eq!(FRAGMENT_DESC_SIZE, 16);
        assert_eq!(DIR_ENTRY_SIZE, 128);
        assert_eq!(USER_SLOT_SIZE, 228);
        assert_eq!(HEADER_SIZE, 4 + 8 + 4 + 32 + (128 + 32 + 32 + 32 + 4) * 4);

        assert_eq!(FragmentDesc::free().encode().len(), FRAGMENT_DESC_SIZE);
        assert_eq!(
            DirEntry::new(1, InodeKind::File, "x").unwrap().encode().len(),
            DIR_ENTRY_SIZE
        );
    }
}
