//! The volume header occupying block 0, the only block kept in clear on
//! disk. It carries the salt and the per-user wrapped key material; the
//! rest of the container is ciphertext.

use crate::error::{Error, Result};

/// Header magic, bytes 4..12 of block 0.
pub const HEADER_MAGIC: &[u8; 8] = b"coverfs\0";

/// On-disk format version written by this crate.
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// Number of user slots in the header. Only slot 0 is populated; the
/// others are reserved for multi-user volumes.
pub const USER_SLOTS: usize = 4;

/// Passphrase-stretching rounds written into fresh slots. Stored per slot
/// so it can be raised later without breaking old volumes.
pub const DEFAULT_KDF_ITERATIONS: u32 = 1000;

/// Encoded size of one user slot.
pub const USER_SLOT_SIZE: usize = 228;

/// Encoded size of the header up to the end of the last slot. The
/// remainder of block 0 is zero but still covered by the CRC.
pub const HEADER_SIZE: usize = 48 + USER_SLOTS * USER_SLOT_SIZE;

/// One key slot: a user name, the master key wrapped under this user's
/// wrapping key, and the passphrase check pair. `check_token` is random;
/// `check_token_enc` is its encryption under the wrapping key, so a
/// candidate passphrase is verified without touching the master key.
#[derive(Clone, Copy)]
pub struct UserSlot {
    pub name: [u8; 128],
    pub wrapped_key: [u8; 32],
    pub check_token: [u8; 32],
    pub check_token_enc: [u8; 32],
    pub kdf_iterations: u32,
}

impl UserSlot {
    pub fn empty() -> UserSlot {
        UserSlot {
            name: [0; 128],
            wrapped_key: [0; 32],
            check_token: [0; 32],
            check_token_enc: [0; 32],
            kdf_iterations: 0,
        }
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..128].copy_from_slice(&self.name);
        buf[128..160].copy_from_slice(&self.wrapped_key);
        buf[160..192].copy_from_slice(&self.check_token);
        buf[192..224].copy_from_slice(&self.check_token_enc);
        buf[224..228].copy_from_slice(&self.kdf_iterations.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> UserSlot {
        let mut slot = UserSlot::empty();
        slot.name.copy_from_slice(&buf[0..128]);
        slot.wrapped_key.copy_from_slice(&buf[128..160]);
        slot.check_token.copy_from_slice(&buf[160..192]);
        slot.check_token_enc.copy_from_slice(&buf[192..224]);
        slot.kdf_iterations = u32::from_le_bytes(buf[224..228].try_into().unwrap());
        slot
    }
}

/// Decoded block 0.
#[derive(Clone)]
pub struct VolumeHeader {
    pub major: u16,
    pub minor: u16,
    pub salt: [u8; 32],
    pub slots: [UserSlot; USER_SLOTS],
}

impl VolumeHeader {
    pub fn new(salt: [u8; 32]) -> VolumeHeader {
        VolumeHeader {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            salt,
            slots: [UserSlot::empty(); USER_SLOTS],
        }
    }

    /// True when `block` starts with the header magic. A fresh container
    /// fails this and goes down the creation path instead of being
    /// rejected for its (zero) checksum.
    pub fn magic_present(block: &[u8]) -> bool {
        block.len() >= 12 && &block[4..12] == HEADER_MAGIC
    }

    /// Serialize into a whole block. Everything past the fields is
    /// zeroed, and the CRC over bytes 4.. is stamped into bytes 0..4.
    pub fn encode_into(&self, block: &mut [u8]) {
        assert!(block.len() >= 1024, "block too small for the volume header");
        block.fill(0);
        block[4..12].copy_from_slice(HEADER_MAGIC);
        block[12..14].copy_from_slice(&self.major.to_le_bytes());
        block[14..16].copy_from_slice(&self.minor.to_le_bytes());
        block[16..48].copy_from_slice(&self.salt);
        for (i, slot) in self.slots.iter().enumerate() {
            let ofs = 48 + i * USER_SLOT_SIZE;
            slot.encode_into(&mut block[ofs..ofs + USER_SLOT_SIZE]);
        }
        let crc = crc32fast::hash(&block[4..]);
        block[0..4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Parse and validate a whole block 0.
    pub fn decode(block: &[u8]) -> Result<VolumeHeader> {
        if block.len() < HEADER_SIZE {
            return Err(Error::CorruptVolume("header block truncated"));
        }
        if !Self::magic_present(block) {
            return Err(Error::CorruptVolume("bad header magic"));
        }
        let stored = u32::from_le_bytes(block[0..4].try_into().unwrap());
        if crc32fast::hash(&block[4..]) != stored {
            return Err(Error::CorruptVolume("header checksum mismatch"));
        }
        let major = u16::from_le_bytes(block[12..14].try_into().unwrap());
        let minor = u16::from_le_bytes(block[14..16].try_into().unwrap());
        if major != MAJOR_VERSION || minor != MINOR_VERSION {
            return Err(Error::CorruptVolume("unsupported volume version"));
        }
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&block[16..48]);
        let mut header = VolumeHeader::new(salt);
        header.major = major;
        header.minor = minor;
        for i in 0..USER_SLOTS {
            let ofs = 48 + i * USER_SLOT_SIZE;
            header.slots[i] = UserSlot::decode(&block[ofs..ofs + USER_SLOT_SIZE]);
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VolumeHeader {
        let mut header = VolumeHeader::new([7u8; 32]);
        let slot = &mut header.slots[0];
        slot.name[..4].copy_from_slice(b"test");
        slot.wrapped_key = [1; 32];
        slot.check_token = [2; 32];
        slot.check_token_enc = [3; 32];
        slot.kdf_iterations = DEFAULT_KDF_ITERATIONS;
        header
    }

    #[test]
    fn round_trip() {
        let mut block = vec![0u8; 4096];
        sample().encode_into(&mut block);

        assert!(VolumeHeader::magic_present(&block));
        let decoded = VolumeHeader::decode(&block).unwrap();
        assert_eq!(decoded.major, MAJOR_VERSION);
        assert_eq!(decoded.salt, [7u8; 32]);
        assert_eq!(decoded.slots[0].wrapped_key, [1; 32]);
        assert_eq!(decoded.slots[0].kdf_iterations, DEFAULT_KDF_ITERATIONS);
        assert_eq!(&decoded.slots[0].name[..4], b"test");
    }

    #[test]
    fn zeroed_block_has_no_magic() {
        let block = vec![0u8; 4096];
        assert!(!VolumeHeader::magic_present(&block));
        assert!(matches!(
            VolumeHeader::decode(&block),
            Err(Error::CorruptVolume("bad header magic"))
        ));
    }

    #[test]
    fn single_byte_corruption_detected() {
        let mut block = vec![0u8; 4096];
        sample().encode_into(&mut block);

        // every byte of the block is covered, including the zero tail
        for &ofs in &[4usize, 13, 40, 500, 959, 2048, 4095] {
            let mut bad = block.clone();
            bad[ofs] ^= 0x01;
            assert!(
                matches!(VolumeHeader::decode(&bad), Err(Error::CorruptVolume(_))),
                "corruption at byte {ofs} went undetected"
            );
        }
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut header = sample();
        header.major = 2;
        let mut block = vec![0u8; 4096];
        header.encode_into(&mut block);
        assert!(matches!(
            VolumeHeader::decode(&block),
            Err(Error::CorruptVolume("unsupported volume version"))
        ));
    }
}
