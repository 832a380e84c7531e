//! Encryption of container payloads.
//!
//! Payloads are encrypted with AES-256 in OFB mode. OFB turns the block
//! cipher into a synchronous stream cipher: the keystream does not depend on
//! the plaintext, so arbitrary-length streams encrypt in a single pass with
//! no padding, and decryption applies the exact same keystream.
//!
//! Two key-derivation variants exist, both password based:
//!
//! - **Salted** (the default, interoperable with `openssl enc -md SHA256`):
//!   the ciphertext is preceded by the 8-byte ASCII marker `Salted__` and an
//!   8-byte random salt. Key and IV are derived as
//!   `key = SHA256(password || salt)` and
//!   `iv = SHA256(key || password || salt)[..16]`, i.e. `EVP_BytesToKey`
//!   with SHA-256 and one round.
//! - **Simple**: `key = SHA256(password)`; a fresh random 16-byte IV is
//!   written in the clear before the ciphertext.
//!
//! An empty password is accepted in both variants (legacy behavior). The
//! only failure at derivation time is an unavailable system random source,
//! which is fatal.

mod io;

pub use io::{DecryptingWriter, EncryptingWriter};

use {
    aes::Aes256,
    anyhow::{Context as _, Result},
    ofb::{
        cipher::{KeyIvInit, StreamCipher},
        Ofb,
    },
    rand::{rngs::OsRng, TryRngCore},
    sha2::{Digest, Sha256},
};

pub const KEY_LEN: usize = 32;
/// AES block size; OFB IVs are exactly one block.
pub const IV_LEN: usize = 16;
pub const SALT_LEN: usize = 8;
/// Marker preceding the salt in the OpenSSL salted stream format.
pub const SALT_MAGIC: &[u8; 8] = b"Salted__";

type Aes256Ofb = Ofb<Aes256>;

/// Which preamble and derivation a cipher stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherVariant {
    /// `Salted__` marker + salt preamble; key and IV derived from
    /// password + salt.
    #[default]
    Salted,
    /// Clear random IV preamble; key derived from the password alone.
    ClearIv,
}

/// Derives key and IV from a password and salt, bit-compatible with
/// `EVP_BytesToKey(SHA256, count = 1)`.
#[must_use]
pub fn derive_salted(password: &[u8], salt: &[u8; SALT_LEN]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    let key: [u8; KEY_LEN] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(password);
    hasher.update(salt);
    let block: [u8; 32] = hasher.finalize().into();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&block[..IV_LEN]);
    (key, iv)
}

/// Derives a key from the password alone (the IV travels in the clear).
#[must_use]
pub fn derive_simple(password: &[u8]) -> [u8; KEY_LEN] {
    Sha256::digest(password).into()
}

/// Fills an array from the OS random source. Failure means the random
/// source is unavailable and is propagated as fatal.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .context("system random source unavailable")?;
    Ok(buf)
}

/// AES-256-OFB keystream generator. Identical for encryption and
/// decryption.
pub struct Cipher {
    inner: Aes256Ofb,
}

impl Cipher {
    /// Constructs a cipher from raw key and IV. Wrong lengths are a fatal
    /// setup error, surfaced before any bytes are transformed.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        let inner = Aes256Ofb::new_from_slices(key, iv)
            .context("invalid cipher key or IV length")?;
        Ok(Self { inner })
    }

    #[must_use]
    pub fn from_password_salted(password: &[u8], salt: &[u8; SALT_LEN]) -> Self {
        let (key, iv) = derive_salted(password, salt);
        Self {
            inner: Aes256Ofb::new(&key.into(), &iv.into()),
        }
    }

    #[must_use]
    pub fn from_password_iv(password: &[u8], iv: &[u8; IV_LEN]) -> Self {
        let key = derive_simple(password);
        Self {
            inner: Aes256Ofb::new(&key.into(), &(*iv).into()),
        }
    }

    /// XORs the next keystream bytes into `buf`, advancing the stream.
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference output of
    // `openssl enc -aes-256-cbc -P -pass pass:test -S F6818CAE131872BD -md SHA256`.
    #[test]
    fn openssl_derivation_vector() {
        let salt = [0xf6, 0x81, 0x8c, 0xae, 0x13, 0x18, 0x72, 0xbd];
        let (key, iv) = derive_salted(b"test", &salt);
        assert_eq!(
            hex::encode(key),
            "109ae1c21965e57876731402d8dc5276a59b8782aec354d7bf387a2dc77450f1"
        );
        assert_eq!(hex::encode(iv), "0899f50c65f644985c9cead9773aeea5");
    }

    #[test]
    fn empty_password_accepted() {
        let salt = [0u8; SALT_LEN];
        let (key, iv) = derive_salted(b"", &salt);
        assert_ne!(key, [0u8; KEY_LEN]);
        assert_ne!(iv, [0u8; IV_LEN]);
        let _ = derive_simple(b"");
    }

    #[test]
    fn keystream_is_symmetric() {
        let salt = random_array::<SALT_LEN>().unwrap();
        let mut data = b"synchronous stream cipher".to_vec();
        let original = data.clone();

        let mut encryptor = Cipher::from_password_salted(b"pw", &salt);
        encryptor.apply_keystream(&mut data);
        assert_ne!(data, original);

        let mut decryptor = Cipher::from_password_salted(b"pw", &salt);
        decryptor.apply_keystream(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(Cipher::new(&[0u8; 7], &[0u8; IV_LEN]).is_err());
        assert!(Cipher::new(&[0u8; KEY_LEN], &[0u8; 3]).is_err());
    }
}
