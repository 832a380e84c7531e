use {
    super::{
        random_array, Cipher, CipherVariant, IV_LEN, SALT_LEN, SALT_MAGIC,
    },
    anyhow::Result,
    std::io::{self, Write},
};

/// Length of the clear-text preamble preceding the ciphertext. Both
/// variants use the same length: marker + salt, or one IV block.
const PREAMBLE_LEN: usize = IV_LEN;

/// Encrypts everything written through it and forwards the ciphertext.
///
/// The preamble (marker + salt, or the clear IV) is written on
/// construction, so a construction failure surfaces before any payload
/// bytes are transformed.
pub struct EncryptingWriter<W> {
    cipher: Cipher,
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, password: &[u8], variant: CipherVariant) -> Result<Self> {
        let cipher = match variant {
            CipherVariant::Salted => {
                let salt = random_array::<SALT_LEN>()?;
                inner.write_all(SALT_MAGIC)?;
                inner.write_all(&salt)?;
                Cipher::from_password_salted(password, &salt)
            }
            CipherVariant::ClearIv => {
                let iv = random_array::<IV_LEN>()?;
                inner.write_all(&iv)?;
                Cipher::from_password_iv(password, &iv)
            }
        };
        Ok(Self {
            cipher,
            inner,
            scratch: Vec::new(),
        })
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        // The keystream advanced for the whole buffer, so a partial write
        // cannot be reported upwards.
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts everything written through it and forwards the plaintext.
///
/// Buffers the clear-text preamble first; the cipher is only constructed
/// once all [`PREAMBLE_LEN`] bytes have arrived. For the salted variant a
/// wrong marker is a fatal format error, never a silent fallback.
pub struct DecryptingWriter<W> {
    inner: W,
    password: Vec<u8>,
    variant: CipherVariant,
    preamble: Vec<u8>,
    cipher: Option<Cipher>,
    scratch: Vec<u8>,
}

impl<W: Write> DecryptingWriter<W> {
    pub fn new(inner: W, password: &[u8], variant: CipherVariant) -> Self {
        Self {
            inner,
            password: password.to_vec(),
            variant,
            preamble: Vec::with_capacity(PREAMBLE_LEN),
            cipher: None,
            scratch: Vec::new(),
        }
    }

    fn setup_cipher(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.preamble.len(), PREAMBLE_LEN);
        let cipher = match self.variant {
            CipherVariant::Salted => {
                if &self.preamble[..SALT_MAGIC.len()] != SALT_MAGIC {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "stream does not start with the Salted__ marker",
                    ));
                }
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&self.preamble[SALT_MAGIC.len()..]);
                Cipher::from_password_salted(&self.password, &salt)
            }
            CipherVariant::ClearIv => {
                let mut iv = [0u8; IV_LEN];
                iv.copy_from_slice(&self.preamble);
                Cipher::from_password_iv(&self.password, &iv)
            }
        };
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        if self.cipher.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated cipher preamble",
            ));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        if self.cipher.is_none() {
            let missing = PREAMBLE_LEN - self.preamble.len();
            let take = missing.min(rest.len());
            self.preamble.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.preamble.len() < PREAMBLE_LEN {
                return Ok(buf.len());
            }
            self.setup_cipher()?;
        }
        if !rest.is_empty() {
            self.scratch.clear();
            self.scratch.extend_from_slice(rest);
            if let Some(cipher) = &mut self.cipher {
                cipher.apply_keystream(&mut self.scratch);
            }
            self.inner.write_all(&self.scratch)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
