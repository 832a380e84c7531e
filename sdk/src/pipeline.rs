//! Container encode/decode orchestration.
//!
//! The transform nesting order is fixed: the archive (or raw stream) is the
//! innermost content, deflate compression comes next, and encryption is the
//! outermost layer right after the header - i.e. data is compressed first
//! and the smaller result encrypted. The header flags record which layers
//! ran, and decoding trusts them exclusively: it unwraps the cipher, then
//! the compressor, then extracts or raw-copies.
//!
//! Layers are composed as `Write` decorators. Each optional layer is a
//! two-variant enum with an explicit `finish` returning its inner writer,
//! so the chain is always finalized inner-to-outer on success and simply
//! dropped on error.

use {
    crate::{
        archive::{total_size, ArchiveReader, ArchiveWriter, EntryKind, WalkedEntry},
        crypto::{CipherVariant, DecryptingWriter, EncryptingWriter},
        digest::{ContainerDigest, HashingReader, HashingWriter},
        header::ContainerFlags,
        pipe,
        progress::{Progress, ProgressReader},
    },
    anyhow::{bail, format_err, Context as _, Result},
    deflate::{write::DeflateEncoder, CompressionOptions},
    fs_err as fs,
    inflate::InflateWriter,
    std::{
        io::{self, Read, Write},
        path::PathBuf,
        sync::Arc,
        thread,
    },
    tracing::warn,
};

/// Max number of in-flight chunks between the decode pump and the archive
/// extraction thread.
const PIPE_CAPACITY: usize = 16;

/// Which transforms to apply on encode. Whether the payload is archived
/// follows from the input shape, not from an option.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    pub compress: bool,
    pub encrypt: bool,
    pub cipher_variant: CipherVariant,
}

impl TransformOptions {
    fn flags(self, archived: bool) -> ContainerFlags {
        let mut flags = ContainerFlags::default();
        if self.compress {
            flags.insert(ContainerFlags::COMPRESSED);
        }
        if self.encrypt {
            flags.insert(ContainerFlags::ENCRYPTED);
        }
        if archived {
            flags.insert(ContainerFlags::ARCHIVED);
        }
        flags
    }
}

/// Source of an encode run: a single byte stream, or a walked entry list
/// to be bundled into one archive.
pub enum EncodeInput<'a> {
    Stream {
        reader: &'a mut dyn Read,
        /// Original size when known; drives progress reporting.
        size: Option<u64>,
    },
    Archive(&'a [WalkedEntry]),
}

#[derive(Debug)]
pub struct EncodeReport {
    pub flags: ContainerFlags,
    /// Digest of the exact container bytes handed to the transport.
    pub digest: ContainerDigest,
    pub container_size: u64,
}

#[derive(Debug)]
pub struct DecodeReport {
    pub flags: ContainerFlags,
    pub digest: ContainerDigest,
    pub container_size: u64,
}

/// Where decoded plaintext goes.
pub enum DecodeOutput {
    /// Raw streams become `dir/file_name`; archives extract under `dir`.
    Disk { dir: PathBuf, file_name: String },
    /// Raw stream sink (e.g. stdout). Rejected for archived containers.
    Writer(Box<dyn Write + Send>),
}

enum Encryptor<W: Write> {
    Plain(W),
    Cipher(EncryptingWriter<W>),
}

impl<W: Write> Encryptor<W> {
    fn new(
        inner: W,
        enabled: bool,
        password: Option<&[u8]>,
        variant: CipherVariant,
    ) -> Result<Self> {
        if !enabled {
            return Ok(Self::Plain(inner));
        }
        let password = password.context("encryption requested, but no password was provided")?;
        Ok(Self::Cipher(EncryptingWriter::new(inner, password, variant)?))
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Cipher(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for Encryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Cipher(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Cipher(writer) => writer.flush(),
        }
    }
}

enum Compressor<W: Write> {
    Plain(W),
    Deflate(DeflateEncoder<W>),
}

impl<W: Write> Compressor<W> {
    fn new(inner: W, enabled: bool) -> Self {
        if enabled {
            Self::Deflate(DeflateEncoder::new(inner, CompressionOptions::high()))
        } else {
            Self::Plain(inner)
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Deflate(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Deflate(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Deflate(encoder) => encoder.flush(),
        }
    }
}

enum Decryptor<W: Write> {
    Plain(W),
    Cipher(DecryptingWriter<W>),
}

impl<W: Write> Decryptor<W> {
    fn new(inner: W, enabled: bool, password: &[u8], variant: CipherVariant) -> Self {
        if enabled {
            Self::Cipher(DecryptingWriter::new(inner, password, variant))
        } else {
            Self::Plain(inner)
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Cipher(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for Decryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Cipher(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Cipher(writer) => writer.flush(),
        }
    }
}

enum Inflater<W: Write> {
    Plain(W),
    Inflate(InflateWriter<W>),
}

impl<W: Write> Inflater<W> {
    fn new(inner: W, enabled: bool) -> Self {
        if enabled {
            Self::Inflate(InflateWriter::new(inner))
        } else {
            Self::Plain(inner)
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Inflate(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for Inflater<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(inner) => inner.write(buf),
            Self::Inflate(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(inner) => inner.flush(),
            Self::Inflate(writer) => writer.flush(),
        }
    }
}

/// Encodes `input` into a container written to `output`.
///
/// The checksum covers everything written to `output`, header included.
pub fn encode<W: Write>(
    input: EncodeInput<'_>,
    options: TransformOptions,
    password: Option<&[u8]>,
    progress: &Arc<dyn Progress>,
    output: W,
) -> Result<EncodeReport> {
    let archived = matches!(input, EncodeInput::Archive(_));
    let flags = options.flags(archived);

    let mut hashing = HashingWriter::new(output);
    flags.write_to(&mut hashing)?;
    let encryptor = Encryptor::new(hashing, options.encrypt, password, options.cipher_variant)?;
    let mut compressor = Compressor::new(encryptor, options.compress);

    match input {
        EncodeInput::Stream { reader, size } => {
            if let Some(total) = size {
                let mut reader = ProgressReader::new(reader, total, Arc::clone(progress));
                io::copy(&mut reader, &mut compressor)?;
            } else {
                io::copy(reader, &mut compressor)?;
            }
        }
        EncodeInput::Archive(entries) => {
            let total = total_size(entries);
            let mut done = 0;
            let mut archive = ArchiveWriter::new(compressor);
            for entry in entries {
                match entry.header.kind {
                    EntryKind::Directory => {
                        archive.append_dir(&entry.header.path, entry.header.mode)?;
                    }
                    EntryKind::File => {
                        let file = fs::File::open(&entry.source)?;
                        let mut reader =
                            ProgressReader::resume(file, done, total, Arc::clone(progress));
                        archive.append_file(
                            &entry.header.path,
                            entry.header.mode,
                            entry.header.size,
                            &mut reader,
                        )?;
                        done = reader.current();
                    }
                    // The walk never produces other kinds.
                    EntryKind::Other(_) => {}
                }
            }
            compressor = archive.finish()?;
        }
    }

    let encryptor = compressor.finish()?;
    let hashing = encryptor.finish()?;
    let (_, digest, container_size) = hashing.finish()?;
    progress.finish();
    Ok(EncodeReport {
        flags,
        digest,
        container_size,
    })
}

/// Decodes a container from `input`, applying exactly the transforms its
/// header declares, and writes the plaintext to `output`.
///
/// On failure, partial output already written to disk is not rolled back.
pub fn decode(
    input: impl Read,
    password: Option<&[u8]>,
    variant: CipherVariant,
    output: DecodeOutput,
) -> Result<DecodeReport> {
    let mut hashing = HashingReader::new(input);
    let flags = ContainerFlags::read_from(&mut hashing)?;

    let encrypted = flags.contains(ContainerFlags::ENCRYPTED);
    if encrypted && password.is_none() {
        bail!("container is encrypted, but no password was provided");
    }
    if !encrypted && password.is_some() {
        warn!("a password was provided, but the container is not encrypted; ignoring it");
    }
    let password = if encrypted { password.unwrap_or(b"") } else { b"" };

    if flags.contains(ContainerFlags::ARCHIVED) {
        let dir = match output {
            DecodeOutput::Disk { dir, .. } => dir,
            DecodeOutput::Writer(_) => {
                bail!("cannot extract an archive into a raw output stream")
            }
        };
        fs::create_dir_all(&dir)?;
        let (pipe_writer, pipe_reader) = pipe::bounded(PIPE_CAPACITY);
        // The extraction side pulls from the pipe on its own thread;
        // dropping the write end on a pump failure unblocks it.
        let extractor =
            thread::spawn(move || ArchiveReader::new(pipe_reader).unpack_to(&dir));
        let pumped = pump(&mut hashing, flags, password, variant, pipe_writer);
        let Ok(extracted) = extractor.join() else {
            return Err(format_err!("archive extraction thread panicked"));
        };
        match (pumped, extracted) {
            (Ok(()), Ok(())) => {}
            (Err(err), Ok(())) => return Err(err),
            (Ok(()), Err(err)) => return Err(err),
            (Err(pump_err), Err(extract_err)) => {
                // A broken pipe on the pump side means the extractor bailed
                // first, so its error is the root cause.
                let broken_pipe = pump_err
                    .downcast_ref::<io::Error>()
                    .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe);
                return Err(if broken_pipe { extract_err } else { pump_err });
            }
        }
    } else {
        match output {
            DecodeOutput::Disk { dir, file_name } => {
                fs::create_dir_all(&dir)?;
                let file = fs::File::create(dir.join(file_name))?;
                pump(&mut hashing, flags, password, variant, file)?;
            }
            DecodeOutput::Writer(writer) => {
                pump(&mut hashing, flags, password, variant, writer)?;
            }
        }
    }

    let (_, digest, container_size) = hashing.finish();
    Ok(DecodeReport {
        flags,
        digest,
        container_size,
    })
}

/// Pumps container payload bytes through the decode chain into `sink`,
/// finalizing every layer inner-to-outer.
fn pump(
    input: &mut impl Read,
    flags: ContainerFlags,
    password: &[u8],
    variant: CipherVariant,
    sink: impl Write,
) -> Result<()> {
    let inflater = Inflater::new(sink, flags.contains(ContainerFlags::COMPRESSED));
    let mut decryptor = Decryptor::new(
        inflater,
        flags.contains(ContainerFlags::ENCRYPTED),
        password,
        variant,
    );
    io::copy(input, &mut decryptor)?;
    let inflater = decryptor.finish()?;
    let mut sink = inflater.finish()?;
    sink.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::progress::NoProgress,
        sha2::{Digest, Sha256},
        tempfile::TempDir,
    };

    fn no_progress() -> Arc<dyn Progress> {
        Arc::new(NoProgress)
    }

    fn encode_bytes(data: &[u8], options: TransformOptions, password: Option<&[u8]>) -> (Vec<u8>, EncodeReport) {
        let mut container = Vec::new();
        let mut reader = data;
        let report = encode(
            EncodeInput::Stream {
                reader: &mut reader,
                size: Some(data.len() as u64),
            },
            options,
            password,
            &no_progress(),
            &mut container,
        )
        .unwrap();
        (container, report)
    }

    #[test]
    fn stream_roundtrip_all_transform_subsets() {
        let data: Vec<u8> = b"A long time ago in a galaxy far, far away...\n".repeat(40);
        for compress in [false, true] {
            for encrypt in [false, true] {
                let options = TransformOptions {
                    compress,
                    encrypt,
                    cipher_variant: CipherVariant::Salted,
                };
                let password = encrypt.then_some(&b"TestPassword123"[..]);
                let (container, report) = encode_bytes(&data, options, password);
                assert_eq!(report.container_size, container.len() as u64);

                let dest = TempDir::new().unwrap();
                let decode_report = decode(
                    container.as_slice(),
                    password,
                    CipherVariant::Salted,
                    DecodeOutput::Disk {
                        dir: dest.path().to_path_buf(),
                        file_name: "out.bin".into(),
                    },
                )
                .unwrap();
                assert_eq!(decode_report.flags, report.flags);
                assert_eq!(decode_report.digest, report.digest);
                let output = fs::read(dest.path().join("out.bin")).unwrap();
                assert_eq!(output, data, "compress={compress} encrypt={encrypt}");
            }
        }
    }

    #[test]
    fn header_records_applied_transforms() {
        let (container, report) = encode_bytes(
            b"payload",
            TransformOptions {
                compress: true,
                encrypt: true,
                cipher_variant: CipherVariant::Salted,
            },
            Some(b"pw"),
        );
        assert!(report.flags.contains(ContainerFlags::COMPRESSED));
        assert!(report.flags.contains(ContainerFlags::ENCRYPTED));
        assert!(!report.flags.contains(ContainerFlags::ARCHIVED));
        let read_back = ContainerFlags::read_from(container.as_slice()).unwrap();
        assert_eq!(read_back, report.flags);
    }

    #[test]
    fn digest_covers_exact_container_bytes() {
        let (container, report) = encode_bytes(
            b"checksummed payload",
            TransformOptions {
                compress: true,
                ..TransformOptions::default()
            },
            None,
        );
        let expected: [u8; 32] = Sha256::digest(&container).into();
        assert_eq!(report.digest.as_bytes(), &expected);
    }

    #[test]
    fn encrypted_payload_is_not_plaintext() {
        let data = b"very secret words that must not appear on the wire";
        let (container, _) = encode_bytes(
            data,
            TransformOptions {
                encrypt: true,
                ..TransformOptions::default()
            },
            Some(b"pw"),
        );
        assert!(!container
            .windows(10)
            .any(|window| window == &data[..10]));
        // Salted preamble right after the header.
        assert_eq!(&container[ContainerFlags::LEN..ContainerFlags::LEN + 8], b"Salted__");
    }

    #[test]
    fn missing_password_for_encrypted_container() {
        let (container, _) = encode_bytes(
            b"data",
            TransformOptions {
                encrypt: true,
                ..TransformOptions::default()
            },
            Some(b"pw"),
        );
        let err = decode(
            container.as_slice(),
            None,
            CipherVariant::Salted,
            DecodeOutput::Writer(Box::new(io::sink())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn encrypt_without_password_is_setup_error() {
        let mut reader: &[u8] = b"data";
        let err = encode(
            EncodeInput::Stream {
                reader: &mut reader,
                size: None,
            },
            TransformOptions {
                encrypt: true,
                ..TransformOptions::default()
            },
            None,
            &no_progress(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn archive_to_raw_writer_rejected() {
        let root = TempDir::new().unwrap();
        let tree = root.path().join("tree");
        fs::create_dir(&tree).unwrap();
        fs::write(tree.join("file.txt"), b"content").unwrap();
        let entries = crate::archive::walk(&tree).unwrap();

        let mut container = Vec::new();
        encode(
            EncodeInput::Archive(&entries),
            TransformOptions::default(),
            None,
            &no_progress(),
            &mut container,
        )
        .unwrap();

        let err = decode(
            container.as_slice(),
            None,
            CipherVariant::Salted,
            DecodeOutput::Writer(Box::new(io::sink())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("raw output stream"));
    }

    #[test]
    fn corrupted_compressed_payload_is_fatal() {
        let (mut container, _) = encode_bytes(
            &b"compressible compressible compressible".repeat(100),
            TransformOptions {
                compress: true,
                ..TransformOptions::default()
            },
            None,
        );
        // Corrupt the deflate stream past the header.
        let mid = container.len() / 2;
        container[mid] ^= 0xff;
        container.truncate(mid + 1);
        let result = decode(
            container.as_slice(),
            None,
            CipherVariant::Salted,
            DecodeOutput::Writer(Box::new(io::sink())),
        );
        assert!(result.is_err());
    }
}
