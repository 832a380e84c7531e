//! Tape-archive (ustar) serialization of file trees.
//!
//! An archive is an ordered sequence of entries, each a 512-byte header
//! block followed by the entry content padded to a block boundary, and is
//! terminated by two zero blocks. Directories precede the entries they
//! contain. The reader yields entries lazily in stream order and never
//! restarts; extraction is last-write-wins for duplicate paths.

use {
    anyhow::{bail, Context as _, Result},
    fs_err as fs,
    std::{
        io::{self, Read, Write},
        path::{Component, Path, PathBuf},
    },
    tracing::{debug, warn},
};

pub const BLOCK_LEN: usize = 512;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

// Field offsets within a header block.
const NAME_OFFSET: usize = 0;
const MODE_OFFSET: usize = 100;
const UID_OFFSET: usize = 108;
const GID_OFFSET: usize = 116;
const SIZE_OFFSET: usize = 124;
const MTIME_OFFSET: usize = 136;
const CHKSUM_OFFSET: usize = 148;
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;
const PREFIX_OFFSET: usize = 345;

const TYPEFLAG_FILE: u8 = b'0';
const TYPEFLAG_FILE_OLD: u8 = 0;
const TYPEFLAG_DIR: u8 = b'5';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Entry types that are not round-tripped (symlinks, devices, ...).
    /// Carried so the reader can skip their content.
    Other(u8),
}

/// Metadata of one archive entry.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    /// Relative path, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
    /// Unix permission bits.
    pub mode: u32,
    /// Content size in bytes; always 0 for directories.
    pub size: u64,
}

fn write_octal(field: &mut [u8], value: u64) -> io::Result<()> {
    // Leaves one byte for the terminating NUL, as ustar requires.
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    if text.len() > digits {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("value {value} does not fit archive header field"),
        ));
    }
    field[..text.len()].copy_from_slice(text.as_bytes());
    field[text.len()] = 0;
    Ok(())
}

fn read_octal(field: &[u8]) -> io::Result<u64> {
    let text = field
        .iter()
        .position(|&b| b == 0)
        .map_or(field, |end| &field[..end]);
    let text = std::str::from_utf8(text)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ASCII numeric field"))?
        .trim_matches(|c| c == ' ');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid octal field"))
}

/// Header checksum: the sum of all header bytes with the checksum field
/// itself counted as spaces.
fn block_checksum(block: &[u8; BLOCK_LEN]) -> u64 {
    let mut sum = 0u64;
    for (index, &byte) in block.iter().enumerate() {
        if (CHKSUM_OFFSET..CHKSUM_OFFSET + 8).contains(&index) {
            sum += u64::from(b' ');
        } else {
            sum += u64::from(byte);
        }
    }
    sum
}

/// Splits a path into ustar (prefix, name) parts. Paths up to 100 bytes fit
/// in the name field alone; longer ones are split at a `/` so that the tail
/// fits the name field and the head fits the 155-byte prefix field.
fn split_path(path: &str) -> io::Result<(&str, &str)> {
    if path.len() <= NAME_LEN {
        return Ok(("", path));
    }
    for (index, byte) in path.bytes().enumerate() {
        if byte == b'/' && index <= PREFIX_LEN && path.len() - index - 1 <= NAME_LEN {
            return Ok((&path[..index], &path[index + 1..]));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("path too long for archive header: {path}"),
    ))
}

/// Serializes entries into tape-archive format.
pub struct ArchiveWriter<W> {
    inner: W,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn write_header(
        &mut self,
        path: &str,
        typeflag: u8,
        mode: u32,
        size: u64,
    ) -> io::Result<()> {
        let mut block = [0u8; BLOCK_LEN];
        let (prefix, name) = split_path(path)?;
        if name.len() > NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry name too long: {name}"),
            ));
        }
        block[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        block[PREFIX_OFFSET..PREFIX_OFFSET + prefix.len()].copy_from_slice(prefix.as_bytes());
        write_octal(&mut block[MODE_OFFSET..MODE_OFFSET + 8], u64::from(mode))?;
        write_octal(&mut block[UID_OFFSET..UID_OFFSET + 8], 0)?;
        write_octal(&mut block[GID_OFFSET..GID_OFFSET + 8], 0)?;
        write_octal(&mut block[SIZE_OFFSET..SIZE_OFFSET + 12], size)?;
        write_octal(&mut block[MTIME_OFFSET..MTIME_OFFSET + 12], 0)?;
        block[TYPEFLAG_OFFSET] = typeflag;
        block[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(b"ustar\x0000");
        let checksum = block_checksum(&block);
        let text = format!("{checksum:06o}");
        block[CHKSUM_OFFSET..CHKSUM_OFFSET + 6].copy_from_slice(text.as_bytes());
        block[CHKSUM_OFFSET + 6] = 0;
        block[CHKSUM_OFFSET + 7] = b' ';
        self.inner.write_all(&block)
    }

    pub fn append_dir(&mut self, path: &str, mode: u32) -> io::Result<()> {
        let path = if path.ends_with('/') {
            path.to_owned()
        } else {
            format!("{path}/")
        };
        self.write_header(&path, TYPEFLAG_DIR, mode, 0)
    }

    /// Appends a regular file entry, copying exactly `size` bytes from
    /// `content`. A short read is an error: the declared size must equal
    /// the number of content bytes actually embedded.
    pub fn append_file(
        &mut self,
        path: &str,
        mode: u32,
        size: u64,
        content: &mut impl Read,
    ) -> io::Result<()> {
        self.write_header(path, TYPEFLAG_FILE, mode, size)?;
        let copied = io::copy(&mut content.take(size), &mut self.inner)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file {path} shrank while archiving: expected {size} bytes, got {copied}"),
            ));
        }
        let padding = (BLOCK_LEN - (size as usize % BLOCK_LEN)) % BLOCK_LEN;
        self.inner.write_all(&[0u8; BLOCK_LEN][..padding])
    }

    /// Writes the end-of-archive marker (two zero blocks) and returns the
    /// inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(&[0u8; BLOCK_LEN * 2])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Deserializes a tape-archive stream into a lazy, finite, non-restartable
/// sequence of entries.
pub struct ArchiveReader<R> {
    inner: R,
    // Unconsumed content bytes of the current entry plus its block padding.
    remaining: u64,
    padding: u64,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            done: false,
        }
    }

    /// Advances to the next entry, skipping any unconsumed content of the
    /// current one. `Ok(None)` means the end-of-archive marker was reached,
    /// which is success, not an error.
    pub fn next_entry(&mut self) -> io::Result<Option<EntryHeader>> {
        if self.done {
            return Ok(None);
        }
        self.skip_content()?;

        let mut block = [0u8; BLOCK_LEN];
        self.inner.read_exact(&mut block).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated archive: missing header block",
                )
            } else {
                err
            }
        })?;

        if block.iter().all(|&b| b == 0) {
            // End-of-archive marker. The second zero block may be missing
            // in streams produced by lax writers; tolerate that.
            let mut second = [0u8; BLOCK_LEN];
            let _ = self.inner.read_exact(&mut second);
            self.done = true;
            return Ok(None);
        }

        if &block[MAGIC_OFFSET..MAGIC_OFFSET + 5] != b"ustar" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unreadable archive header: bad magic",
            ));
        }
        let declared = read_octal(&block[CHKSUM_OFFSET..CHKSUM_OFFSET + 8])?;
        if declared != block_checksum(&block) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "archive header checksum mismatch",
            ));
        }

        let name = field_str(&block[NAME_OFFSET..NAME_OFFSET + NAME_LEN])?;
        let prefix = field_str(&block[PREFIX_OFFSET..PREFIX_OFFSET + PREFIX_LEN])?;
        let path = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}/{name}")
        };
        let mode = read_octal(&block[MODE_OFFSET..MODE_OFFSET + 8])? as u32;
        let size = read_octal(&block[SIZE_OFFSET..SIZE_OFFSET + 12])?;
        let kind = match block[TYPEFLAG_OFFSET] {
            TYPEFLAG_FILE | TYPEFLAG_FILE_OLD => EntryKind::File,
            TYPEFLAG_DIR => EntryKind::Directory,
            other => EntryKind::Other(other),
        };
        let (path, size) = match kind {
            EntryKind::Directory => (path.trim_end_matches('/').to_owned(), 0),
            EntryKind::File | EntryKind::Other(_) => (path, size),
        };
        self.remaining = size;
        self.padding = (BLOCK_LEN as u64 - size % BLOCK_LEN as u64) % BLOCK_LEN as u64;
        Ok(Some(EntryHeader {
            path,
            kind,
            mode,
            size,
        }))
    }

    /// Copies the current entry's remaining content into `output` and
    /// consumes the block padding.
    pub fn copy_content(&mut self, output: &mut impl Write) -> io::Result<u64> {
        let expected = self.remaining;
        let copied = io::copy(&mut (&mut self.inner).take(expected), output)?;
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated archive entry content",
            ));
        }
        self.remaining = 0;
        self.consume_padding()?;
        Ok(copied)
    }

    fn skip_content(&mut self) -> io::Result<()> {
        if self.remaining > 0 {
            let skipped = io::copy(&mut (&mut self.inner).take(self.remaining), &mut io::sink())?;
            if skipped != self.remaining {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated archive entry content",
                ));
            }
            self.remaining = 0;
        }
        self.consume_padding()
    }

    fn consume_padding(&mut self) -> io::Result<()> {
        if self.padding > 0 {
            let skipped = io::copy(&mut (&mut self.inner).take(self.padding), &mut io::sink())?;
            if skipped != self.padding {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated archive entry padding",
                ));
            }
            self.padding = 0;
        }
        Ok(())
    }

    /// Extracts all entries under `dest` in stream order. Directories are
    /// created if absent (intermediates included); regular files are
    /// created or truncated, so a later duplicate path overwrites an
    /// earlier one. Entry types other than files and directories are
    /// skipped.
    pub fn unpack_to(&mut self, dest: &Path) -> Result<()> {
        while let Some(entry) = self.next_entry()? {
            let target = safe_join(dest, &entry.path)
                .with_context(|| format!("invalid entry path: {}", entry.path))?;
            match entry.kind {
                EntryKind::Directory => {
                    if !target.exists() {
                        fs::create_dir_all(&target)?;
                    }
                    set_unix_mode(&target, entry.mode)?;
                }
                EntryKind::File => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut file = fs::File::create(&target)?;
                    self.copy_content(&mut file)?;
                    file.flush()?;
                    drop(file);
                    set_unix_mode(&target, entry.mode)?;
                }
                EntryKind::Other(typeflag) => {
                    debug!(path = entry.path, typeflag, "skipping unsupported entry type");
                }
            }
        }
        Ok(())
    }
}

fn field_str(field: &[u8]) -> io::Result<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 entry path"))
}

/// Joins an archive-relative path onto `dest`, rejecting absolute paths and
/// parent-directory components so extraction cannot escape the destination.
fn safe_join(dest: &Path, relative: &str) -> Result<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                bail!("path escapes the destination directory")
            }
        }
    }
    Ok(target)
}

#[cfg(target_family = "unix")]
fn set_unix_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt};

    if mode != 0 {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(target_family = "unix"))]
fn set_unix_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(target_family = "unix")]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o7777
}

#[cfg(not(target_family = "unix"))]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// One filesystem entry scheduled for archiving.
#[derive(Debug, Clone)]
pub struct WalkedEntry {
    /// Where the content comes from on the local filesystem.
    pub source: PathBuf,
    pub header: EntryHeader,
}

/// Walks `root` depth-first, a directory entry preceding its children, and
/// returns the ordered entry list for archiving. Entry paths are relative
/// to the parent of `root`, so the archive reproduces the `root` directory
/// itself. Symlinks are skipped.
pub fn walk(root: &Path) -> Result<Vec<WalkedEntry>> {
    let name = root
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("unsupported root path: {}", root.display()))?;
    let mut entries = Vec::new();
    walk_into(root, name, &mut entries)?;
    Ok(entries)
}

fn walk_into(path: &Path, relative: &str, entries: &mut Vec<WalkedEntry>) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_symlink() {
        warn!(path = %path.display(), "skipping symlink");
        return Ok(());
    }
    if metadata.is_dir() {
        entries.push(WalkedEntry {
            source: path.to_path_buf(),
            header: EntryHeader {
                path: relative.to_owned(),
                kind: EntryKind::Directory,
                mode: unix_mode(&metadata),
                size: 0,
            },
        });
        let mut children: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|entry| entry.file_name());
        for child in children {
            let file_name = child.file_name();
            let Some(name) = file_name.to_str() else {
                bail!("unsupported file name: {:?}", child.path());
            };
            walk_into(&child.path(), &format!("{relative}/{name}"), entries)?;
        }
    } else {
        entries.push(WalkedEntry {
            source: path.to_path_buf(),
            header: EntryHeader {
                path: relative.to_owned(),
                kind: EntryKind::File,
                mode: unix_mode(&metadata),
                size: metadata.len(),
            },
        });
    }
    Ok(())
}

/// Sum of the file content sizes of `entries`, used as the progress total.
#[must_use]
pub fn total_size(entries: &[WalkedEntry]) -> u64 {
    entries.iter().map(|entry| entry.header.size).sum()
}
