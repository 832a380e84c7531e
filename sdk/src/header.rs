//! Container header.
//!
//! Every container stream starts with a 16-bit little-endian flag word
//! declaring which transforms were applied to the payload. The flags are the
//! source of truth on decode; the decoder never guesses from the caller's
//! configuration.

use {
    byteorder::{ReadBytesExt, WriteBytesExt, LE},
    std::io::{self, Read, Write},
};

/// Set of transforms recorded in a container header.
///
/// Bit assignment is stable and part of the wire format:
/// bit 0 - deflate compression, bit 1 - AES-256-OFB encryption,
/// bit 2 - payload is a ustar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerFlags(u16);

impl ContainerFlags {
    pub const COMPRESSED: Self = Self(1 << 0);
    pub const ENCRYPTED: Self = Self(1 << 1);
    pub const ARCHIVED: Self = Self(1 << 2);

    const KNOWN_BITS: u16 = 0b111;

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    /// Serialized size of the header in bytes.
    pub const LEN: usize = 2;

    pub fn write_to(self, mut output: impl Write) -> io::Result<()> {
        output.write_u16::<LE>(self.0)
    }

    /// Reads the flag word from the start of a container stream.
    ///
    /// Unknown bits are a fatal format error: they mean the container was
    /// produced by a newer encoder and cannot be decoded faithfully.
    pub fn read_from(mut input: impl Read) -> io::Result<Self> {
        let bits = input.read_u16::<LE>().map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated container header")
            } else {
                err
            }
        })?;
        if bits & !Self::KNOWN_BITS != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown container flags: {bits:#06x}"),
            ));
        }
        Ok(Self(bits))
    }
}
