//! Key handling and the per-block cipher.
//!
//! A passphrase never touches block data. It is stretched into a wrapping
//! key (PBKDF2-HMAC-SHA256, salted, per-slot iteration count), which
//! wraps the randomly generated 256-bit master key via AES-256-ECB over
//! 32-byte inputs. All blocks from index 1 upward are AES-256-CBC under
//! the master key with an IV derived from the block index; block 0 holds
//! the key material and stays in clear.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    block_padding::NoPadding, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use aes::Aes256;
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::sys::header::{UserSlot, VolumeHeader, DEFAULT_KDF_ITERATIONS};

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;

/// Why the passphrase callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseContext {
    /// The container is blank; the callback sets the volume passphrase.
    NewVolume,
    /// An existing volume is being unlocked.
    Unlock,
}

/// Name written into slot 0 of fresh volumes.
const SLOT0_NAME: &[u8] = b"default";

fn derive_wrapping_key(passphrase: &str, salt: &[u8; 32], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut *key);
    key
}

/// AES-256-ECB over a 32-byte buffer: two independent cipher blocks.
fn ecb_encrypt(key: &[u8; 32], data: &mut [u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    for chunk in data.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

fn ecb_decrypt(key: &[u8; 32], data: &mut [u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    for chunk in data.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

/// Whole-block transform keyed by block index. Stateless: a CBC context
/// is built per call from the immutable key, so concurrent callers need
/// no serialisation.
pub struct BlockCrypt {
    master_key: Zeroizing<[u8; 32]>,
}

impl BlockCrypt {
    pub fn new(master_key: [u8; 32]) -> BlockCrypt {
        BlockCrypt {
            master_key: Zeroizing::new(master_key),
        }
    }

    /// 16-byte IV with the block index in the first 4 bytes, little
    /// endian, zeros elsewhere.
    fn iv(block: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[0..4].copy_from_slice(&(block as u32).to_le_bytes());
        iv
    }

    pub fn encrypt(&self, block: u64, buf: &mut [u8]) {
        if block == 0 {
            return;
        }
        let len = buf.len();
        let iv = Self::iv(block);
        CbcEnc::new(
            GenericArray::from_slice(&*self.master_key),
            GenericArray::from_slice(&iv),
        )
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .expect("block buffers are cipher-aligned");
    }

    pub fn decrypt(&self, block: u64, buf: &mut [u8]) {
        if block == 0 {
            return;
        }
        let iv = Self::iv(block);
        CbcDec::new(
            GenericArray::from_slice(&*self.master_key),
            GenericArray::from_slice(&iv),
        )
        .decrypt_padded_mut::<NoPadding>(buf)
        .expect("block buffers are cipher-aligned");
    }
}

/// Read block 0 and produce the block cipher for the rest of the
/// container. A blank container is initialised: salt, check token and
/// master key are drawn from the OS random source and the header is
/// written back before anything else touches the device.
///
/// Unlocking re-encrypts the stored check token under the derived
/// wrapping key; only on a match is the master key unwrapped. A failed
/// check leaves the container untouched.
pub fn open_volume<D, F>(dev: &mut D, get_passphrase: F) -> Result<BlockCrypt>
where
    D: BlockDevice,
    F: FnOnce(PassphraseContext) -> String,
{
    let mut block = vec![0u8; dev.block_size() as usize];
    dev.read(0, &mut block)?;

    if VolumeHeader::magic_present(&block) {
        let header = VolumeHeader::decode(&block)?;
        let slot = &header.slots[0];
        let passphrase = Zeroizing::new(get_passphrase(PassphraseContext::Unlock));
        let wrapping = derive_wrapping_key(&passphrase, &header.salt, slot.kdf_iterations);

        let mut check = slot.check_token;
        ecb_encrypt(&wrapping, &mut check);
        if check != slot.check_token_enc {
            return Err(Error::BadPassphrase);
        }

        let mut master = slot.wrapped_key;
        ecb_decrypt(&wrapping, &mut master);
        Ok(BlockCrypt::new(master))
    } else {
        log::info!("no volume header found, initialising a fresh volume");

        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        let mut master = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *master);
        let mut check_token = [0u8; 32];
        OsRng.fill_bytes(&mut check_token);

        let passphrase = Zeroizing::new(get_passphrase(PassphraseContext::NewVolume));
        let wrapping = derive_wrapping_key(&passphrase, &salt, DEFAULT_KDF_ITERATIONS);

        let mut slot = UserSlot::empty();
        slot.name[..SLOT0_NAME.len()].copy_from_slice(SLOT0_NAME);
        slot.kdf_iterations = DEFAULT_KDF_ITERATIONS;
        slot.check_token = check_token;
        slot.check_token_enc = check_token;
        ecb_encrypt(&wrapping, &mut slot.check_token_enc);
        slot.wrapped_key = *master;
        ecb_encrypt(&wrapping, &mut slot.wrapped_key);

        let mut header = VolumeHeader::new(salt);
        header.slots[0] = slot;
        header.encode_into(&mut block);
        dev.write(0, &block)?;

        Ok(BlockCrypt::new(*master))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn derivation_is_salted_and_deterministic() {
        let a = derive_wrapping_key("hunter2", &[1; 32], 1000);
        let b = derive_wrapping_key("hunter2", &[1; 32], 1000);
        let c = derive_wrapping_key("hunter2", &[2; 32], 1000);
        let d = derive_wrapping_key("hunter3", &[1; 32], 1000);
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);
    }

    #[test]
    fn ecb_round_trip() {
        let key = [9u8; 32];
        let plain = *b"0123456789abcdef0123456789abcdef";
        let mut data = plain;
        ecb_encrypt(&key, &mut data);
        assert_ne!(data, plain);
        ecb_decrypt(&key, &mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn block_round_trip() {
        let crypt = BlockCrypt::new([3u8; 32]);
        let plain: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();

        let mut buf = plain.clone();
        crypt.encrypt(5, &mut buf);
        assert_ne!(buf, plain);
        crypt.decrypt(5, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn iv_depends_on_block_index() {
        let crypt = BlockCrypt::new([3u8; 32]);
        let plain = vec![0x55u8; 4096];

        let mut at_one = plain.clone();
        let mut at_two = plain.clone();
        crypt.encrypt(1, &mut at_one);
        crypt.encrypt(2, &mut at_two);
        assert_ne!(at_one, at_two);

        // same index, same ciphertext
        let mut again = plain.clone();
        crypt.encrypt(1, &mut again);
        assert_eq!(at_one, again);
    }

    #[test]
    fn block_zero_is_never_touched() {
        let crypt = BlockCrypt::new([3u8; 32]);
        let plain = vec![0x55u8; 4096];
        let mut buf = plain.clone();
        crypt.encrypt(0, &mut buf);
        assert_eq!(buf, plain);
        crypt.decrypt(0, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn create_then_unlock() {
        let dev = MemDevice::new(16, 4096);

        let crypt = open_volume(&mut dev.clone(), |ctx| {
            assert_eq!(ctx, PassphraseContext::NewVolume);
            "secret".to_owned()
        })
        .unwrap();

        // the same passphrase yields the same master key
        let again = open_volume(&mut dev.clone(), |ctx| {
            assert_eq!(ctx, PassphraseContext::Unlock);
            "secret".to_owned()
        })
        .unwrap();

        let plain = vec![7u8; 4096];
        let mut a = plain.clone();
        let mut b = plain.clone();
        crypt.encrypt(3, &mut a);
        again.encrypt(3, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_passphrase_rejected_without_mutation() {
        let dev = MemDevice::new(16, 4096);
        open_volume(&mut dev.clone(), |_| "secret".to_owned()).unwrap();

        let before = dev.image();
        let err = open_volume(&mut dev.clone(), |_| "Secret".to_owned());
        assert!(matches!(err, Err(Error::BadPassphrase)));
        assert_eq!(dev.image(), before);
    }

    #[test]
    fn corrupt_header_rejected() {
        let dev = MemDevice::new(16, 4096);
        open_volume(&mut dev.clone(), |_| "secret".to_owned()).unwrap();

        dev.poke(20, 0xff); // inside the salt
        let err = open_volume(&mut dev.clone(), |_| "secret".to_owned());
        assert!(matches!(err, Err(Error::CorruptVolume(_))));
    }
}
