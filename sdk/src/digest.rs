//! Checksum decorators.
//!
//! The checksum always covers the outermost container bytes, header
//! included, so the reported digest describes exactly what crossed the
//! transport boundary.

use {
    sha2::{Digest, Sha256},
    std::{
        fmt,
        io::{self, Read, Write},
    },
};

/// SHA-256 digest of a full container stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDigest([u8; 32]);

impl ContainerDigest {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContainerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Passes through any writes and accumulates the SHA-256 hash and size of
/// the written data.
pub struct HashingWriter<W> {
    hasher: Sha256,
    size: u64,
    inner: W,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            hasher: Sha256::new(),
            size: 0,
            inner,
        }
    }

    pub fn finish(mut self) -> io::Result<(W, ContainerDigest, u64)>
    where
        W: Write,
    {
        self.inner.flush()?;
        Ok((self.inner, ContainerDigest(self.hasher.finalize().into()), self.size))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.hasher.update(&buf[..len]);
        self.size += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read-side counterpart of [`HashingWriter`]: forwards reads and hashes
/// the bytes actually produced by the inner reader.
pub struct HashingReader<R> {
    hasher: Sha256,
    size: u64,
    inner: R,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            hasher: Sha256::new(),
            size: 0,
            inner,
        }
    }

    pub fn finish(self) -> (R, ContainerDigest, u64) {
        (self.inner, ContainerDigest(self.hasher.finalize().into()), self.size)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.inner.read(buf)?;
        self.hasher.update(&buf[..len]);
        self.size += len as u64;
        Ok(len)
    }
}
