//! Archive extractor
//!
//! Reads ZIP archives entry by entry. Nothing is decompressed until an
//! entry is read, and entries come out in archive order.
//!
//! Guards, applied to every entry before it is handed out:
//! - names that are absolute or contain `..` fail with [`ArchiveError::PathTraversal`]
//! - entries whose declared size exceeds the per-entry ceiling, or that
//!   decompress to more than they declare, fail with [`ArchiveError::ZipBomb`]
//!
//! Since no entry may expand past its declared size, [`total_declared`] over
//! a scan bounds everything extraction can write.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tokio::sync::mpsc;
use zip::result::ZipError;
use zip::ZipArchive;

/// Spooled entries waiting for the consumer
const STREAM_BUFFER: usize = 4;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive is corrupt or truncated: {0}")]
    Corrupt(String),

    #[error("entry '{path}' expands beyond the {limit} byte limit")]
    ZipBomb { path: String, limit: u64 },

    #[error("entry '{0}' escapes the archive root")]
    PathTraversal(String),

    #[error("archive contents total {total} bytes, above the {limit} byte dataset limit")]
    TooLarge { total: u64, limit: u64 },

    #[error("reading archive failed: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveError::Corrupt(_) => "corrupt",
            ArchiveError::ZipBomb { .. } => "zip_bomb",
            ArchiveError::PathTraversal(_) => "path_traversal",
            ArchiveError::TooLarge { .. } => "size_exceeded",
            ArchiveError::Io(_) => "io",
        }
    }
}

fn from_zip(err: ZipError) -> ArchiveError {
    match err {
        ZipError::Io(e) => ArchiveError::Corrupt(e.to_string()),
        other => ArchiveError::Corrupt(other.to_string()),
    }
}

/// Normalize an entry name to a relative `/`-separated path.
///
/// `Ok(None)` for names with no file component (the root, `./`).
pub fn normalize_entry_path(name: &str) -> Result<Option<String>, ArchiveError> {
    let unified = name.replace('\\', "/");
    let has_drive = unified.as_bytes().get(1) == Some(&b':');
    if unified.starts_with('/') || has_drive {
        return Err(ArchiveError::PathTraversal(name.to_string()));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(ArchiveError::PathTraversal(name.to_string())),
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// Central-directory facts about one file entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: String,
    pub declared_size: u64,
}

/// Sum of declared entry sizes
pub fn total_declared(entries: &[EntryInfo]) -> u64 {
    entries
        .iter()
        .fold(0u64, |total, entry| total.saturating_add(entry.declared_size))
}

#[derive(Debug)]
struct EntryTooLarge;

impl std::fmt::Display for EntryTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("entry exceeds size limit")
    }
}

impl std::error::Error for EntryTooLarge {}

/// Reader that errors once more than `limit` bytes come out
struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Ask for one byte past the limit so overruns are detected
        let allowed = (self.remaining.saturating_add(1)).min(buf.len() as u64) as usize;
        let read = self.inner.read(&mut buf[..allowed])?;
        if read as u64 > self.remaining {
            return Err(io::Error::new(io::ErrorKind::InvalidData, EntryTooLarge));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// One file entry, readable once
pub struct ArchiveEntry<'a> {
    path: String,
    declared_size: u64,
    limit: u64,
    reader: BoundedReader<zip::read::ZipFile<'a>>,
}

impl ArchiveEntry<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Copy the decompressed bytes into `sink`
    pub fn copy_to<W: Write>(&mut self, sink: &mut W) -> Result<u64, ArchiveError> {
        io::copy(&mut self.reader, sink).map_err(|e| self.read_error(e))
    }

    /// Decompress into a temp file under `dir`
    pub fn spool(&mut self, dir: &Path) -> Result<SpooledEntry, ArchiveError> {
        let mut file = NamedTempFile::new_in(dir)?;
        let size = self.copy_to(file.as_file_mut())?;
        file.as_file_mut().flush()?;
        Ok(SpooledEntry {
            path: self.path.clone(),
            declared_size: self.declared_size,
            size,
            file: file.into_temp_path(),
        })
    }

    fn read_error(&self, err: io::Error) -> ArchiveError {
        let too_large = err
            .get_ref()
            .map(|inner| inner.is::<EntryTooLarge>())
            .unwrap_or(false);
        if too_large {
            ArchiveError::ZipBomb {
                path: self.path.clone(),
                limit: self.limit,
            }
        } else {
            ArchiveError::Corrupt(format!("entry '{}': {}", self.path, err))
        }
    }
}

/// Lazy cursor over the file entries of a ZIP archive
pub struct ZipEntries<R: Read + Seek> {
    archive: ZipArchive<R>,
    next_index: usize,
    max_entry_bytes: u64,
}

impl ZipEntries<BufReader<File>> {
    pub fn open(path: &Path, max_entry_bytes: u64) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file), max_entry_bytes)
    }
}

impl<R: Read + Seek> ZipEntries<R> {
    /// Reads the central directory; a truncated archive fails here
    pub fn new(reader: R, max_entry_bytes: u64) -> Result<Self, ArchiveError> {
        let archive = ZipArchive::new(reader).map_err(from_zip)?;
        Ok(Self {
            archive,
            next_index: 0,
            max_entry_bytes,
        })
    }

    /// Raw entry count, directories included
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    /// Guarded metadata for entry `index`; `None` for directories
    fn inspect(&mut self, index: usize) -> Result<Option<EntryInfo>, ArchiveError> {
        let raw = self.archive.by_index_raw(index).map_err(from_zip)?;
        if raw.is_dir() {
            return Ok(None);
        }
        let Some(path) = normalize_entry_path(raw.name())? else {
            return Ok(None);
        };
        let declared_size = raw.size();
        if declared_size > self.max_entry_bytes {
            return Err(ArchiveError::ZipBomb {
                path,
                limit: self.max_entry_bytes,
            });
        }
        Ok(Some(EntryInfo {
            path,
            declared_size,
        }))
    }

    /// List every file entry, applying the guards, without decompressing
    pub fn scan(&mut self) -> Result<Vec<EntryInfo>, ArchiveError> {
        let mut entries = Vec::with_capacity(self.archive.len());
        for index in 0..self.archive.len() {
            if let Some(info) = self.inspect(index)? {
                entries.push(info);
            }
        }
        Ok(entries)
    }

    /// Advance to the next file entry
    pub fn next_entry(&mut self) -> Option<Result<ArchiveEntry<'_>, ArchiveError>> {
        loop {
            if self.next_index >= self.archive.len() {
                return None;
            }
            let index = self.next_index;
            self.next_index += 1;

            let info = match self.inspect(index) {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };

            let limit = info.declared_size;
            return Some(
                self.archive
                    .by_index(index)
                    .map(|file| ArchiveEntry {
                        path: info.path,
                        declared_size: info.declared_size,
                        limit,
                        reader: BoundedReader {
                            inner: file,
                            remaining: limit,
                        },
                    })
                    .map_err(from_zip),
            );
        }
    }
}

/// Entry decompressed to local scratch; the file goes away on drop
#[derive(Debug)]
pub struct SpooledEntry {
    pub path: String,
    pub declared_size: u64,
    pub size: u64,
    pub file: TempPath,
}

/// Async side of [`stream_entries`]
pub struct EntryStream {
    rx: mpsc::Receiver<Result<SpooledEntry, ArchiveError>>,
}

impl EntryStream {
    /// Next spooled entry; after an error the stream ends
    pub async fn next(&mut self) -> Option<Result<SpooledEntry, ArchiveError>> {
        self.rx.recv().await
    }
}

/// Decompress the entries of `archive` accepted by `filter` on a blocking
/// thread, one at a time, into temp files under `scratch`.
///
/// At most a few spooled entries exist at once. Dropping the stream stops
/// extraction.
pub fn stream_entries<F>(
    archive: PathBuf,
    max_entry_bytes: u64,
    scratch: PathBuf,
    filter: F,
) -> EntryStream
where
    F: Fn(&str) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::task::spawn_blocking(move || {
        let produce = || -> Result<(), ArchiveError> {
            let mut entries = ZipEntries::open(&archive, max_entry_bytes)?;
            while let Some(entry) = entries.next_entry() {
                let mut entry = entry?;
                if !filter(entry.path()) {
                    continue;
                }
                let spooled = entry.spool(&scratch)?;
                if tx.blocking_send(Ok(spooled)).is_err() {
                    // Consumer gave up
                    return Ok(());
                }
            }
            Ok(())
        };

        if let Err(e) = produce() {
            let _ = tx.blocking_send(Err(e));
        }
    });

    EntryStream { rx }
}

/// Scan an archive's central directory on a blocking thread
pub async fn scan_archive(archive: PathBuf, max_entry_bytes: u64) -> Result<Vec<EntryInfo>, ArchiveError> {
    tokio::task::spawn_blocking(move || ZipEntries::open(&archive, max_entry_bytes)?.scan())
        .await
        .map_err(|e| ArchiveError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
}
