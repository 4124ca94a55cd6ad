//! Binary cache of prebuilt model arrays.
//!
//! Parsing a large grid CSV dominates model opening time, so the finalised
//! arrays are kept in a single container file (`cache.h5` in the model base
//! directory) keyed by logical path. Each entry stores a fingerprint string
//! alongside the data; a lookup only hits when the caller's fingerprint -
//! source file names, modification times, and shape metadata - matches the
//! stored one exactly, so stale entries simply miss.
//!
//! The cache is strictly best-effort: if the file cannot be opened
//! read-write it degrades to read-only, and failing that to a null cache
//! where every lookup misses and every store is a no-op. Cache trouble is
//! logged, never surfaced as an error.
//!
//! Container layout: an 8-byte magic, then a sequence of entries
//! `[u32 path len][path][u32 fingerprint len][fingerprint][u64 rows]
//! [u64 cols][rows*cols little-endian f64]`. Writes append; the entry
//! nearest the end of the file wins, so a rewrite is just another append.

use log::{trace, warn};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"dfmcach1";
// Refuse absurd sizes rather than attempting a huge allocation on a
// corrupt file
const MAX_TEXT: u32 = 4096;
const MAX_ELEMENTS: u64 = 1 << 28;

/// A dense array retrieved from the cache
#[derive(Clone, Debug, PartialEq)]
pub struct CachedArray {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

struct IndexEntry {
    offset: u64, // of the rows field, i.e. past path and fingerprint
    fingerprint: String,
    rows: u64,
    cols: u64,
}

/// Content-addressed store of dense arrays in a single container file
pub struct Cache {
    file: Option<File>,
    writable: bool,
    index: BTreeMap<String, IndexEntry>,
}

impl Cache {
    /// Open (or create) the cache file, degrading silently on failure
    pub fn open(path: &Path) -> Cache {
        let mut writable = true;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .or_else(|_| {
                writable = false;
                OpenOptions::new().read(true).open(path)
            });

        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!("Deformation cache {} unavailable: {e}", path.display());
                return Cache {
                    file: None,
                    writable: false,
                    index: BTreeMap::new(),
                };
            }
        };

        let index = match Self::scan(&mut file, writable) {
            Ok(index) => index,
            Err(e) => {
                warn!("Deformation cache {} unreadable: {e}", path.display());
                return Cache {
                    file: None,
                    writable: false,
                    index: BTreeMap::new(),
                };
            }
        };

        Cache {
            file: Some(file),
            writable,
            index,
        }
    }

    /// A cache that never hits and never stores
    pub fn null() -> Cache {
        Cache {
            file: None,
            writable: false,
            index: BTreeMap::new(),
        }
    }

    /// Read the container, building the path index. A torn final entry
    /// (interrupted writer) is dropped; the file is truncated back to the
    /// last complete entry when we hold write access.
    fn scan(file: &mut File, writable: bool) -> io::Result<BTreeMap<String, IndexEntry>> {
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        if len == 0 {
            if writable {
                file.write_all(MAGIC)?;
                file.flush()?;
            }
            return Ok(BTreeMap::new());
        }

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a deformation cache file",
            ));
        }

        let mut index = BTreeMap::new();
        let mut good = 8u64;
        loop {
            match Self::scan_entry(file, len) {
                Ok(Some((path, entry, end))) => {
                    index.insert(path, entry);
                    good = end;
                }
                Ok(None) => break,
                Err(_) => {
                    // Torn tail: forget it, and cut it off if we can
                    if writable {
                        file.set_len(good)?;
                    }
                    break;
                }
            }
        }
        Ok(index)
    }

    fn scan_entry(file: &mut File, len: u64) -> io::Result<Option<(String, IndexEntry, u64)>> {
        let pos = file.stream_position()?;
        if pos >= len {
            return Ok(None);
        }
        let path = read_text(file)?;
        let fingerprint = read_text(file)?;
        let offset = file.stream_position()?;
        let rows = read_u64(file)?;
        let cols = read_u64(file)?;
        if rows.checked_mul(cols).map_or(true, |n| n > MAX_ELEMENTS) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad shape"));
        }
        let end = offset + 16 + rows * cols * 8;
        if end > len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "torn entry"));
        }
        file.seek(SeekFrom::Start(end))?;
        Ok(Some((
            path,
            IndexEntry {
                offset,
                fingerprint,
                rows,
                cols,
            },
            end,
        )))
    }

    /// Look up an array; hits only when the stored fingerprint matches
    pub fn get(&mut self, path: &str, fingerprint: &str) -> Option<CachedArray> {
        let file = self.file.as_mut()?;
        let entry = self.index.get(path)?;
        if entry.fingerprint != fingerprint {
            trace!("Cache entry {path} stale");
            return None;
        }

        match read_array(file, entry) {
            Ok(array) => {
                trace!("Cache hit for {path}");
                Some(array)
            }
            Err(e) => {
                warn!("Cache entry {path} unreadable: {e}");
                None
            }
        }
    }

    /// Store an array, replacing any previous entry for the path
    pub fn set(&mut self, path: &str, fingerprint: &str, rows: usize, cols: usize, values: &[f64]) {
        if !self.writable || values.len() != rows * cols {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };

        match write_entry(file, path, fingerprint, rows, cols, values) {
            Ok(offset) => {
                trace!("Cached {path} ({rows} x {cols})");
                self.index.insert(
                    path.to_string(),
                    IndexEntry {
                        offset,
                        fingerprint: fingerprint.to_string(),
                        rows: rows as u64,
                        cols: cols as u64,
                    },
                );
            }
            Err(e) => {
                warn!("Cannot cache {path}: {e}");
                // The file tail is now suspect; stop writing to it
                self.writable = false;
            }
        }
    }

    /// Flush and drop the file handle. Called by `Model::close`, and by
    /// `Drop` as a backstop, so an open cache never outlives the process.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if self.writable {
                if let Err(e) = file.flush() {
                    warn!("Cannot flush deformation cache: {e}");
                }
            }
        }
        self.index.clear();
        self.writable = false;
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_u32(file: &mut File) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_text(file: &mut File) -> io::Result<String> {
    let len = read_u32(file)?;
    if len > MAX_TEXT {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized text"));
    }
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf-8"))
}

fn read_array(file: &mut File, entry: &IndexEntry) -> io::Result<CachedArray> {
    file.seek(SeekFrom::Start(entry.offset + 16))?;
    let n = (entry.rows * entry.cols) as usize;
    let mut buf = vec![0u8; n * 8];
    file.read_exact(&mut buf)?;
    let values = buf
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    Ok(CachedArray {
        rows: entry.rows as usize,
        cols: entry.cols as usize,
        values,
    })
}

fn write_entry(
    file: &mut File,
    path: &str,
    fingerprint: &str,
    rows: usize,
    cols: usize,
    values: &[f64],
) -> io::Result<u64> {
    file.seek(SeekFrom::End(0))?;
    file.write_all(&(path.len() as u32).to_le_bytes())?;
    file.write_all(path.as_bytes())?;
    file.write_all(&(fingerprint.len() as u32).to_le_bytes())?;
    file.write_all(fingerprint.as_bytes())?;
    let offset = file.stream_position()?;
    file.write_all(&(rows as u64).to_le_bytes())?;
    file.write_all(&(cols as u64).to_le_bytes())?;
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    file.write_all(&buf)?;
    file.flush()?;
    Ok(offset)
}

// ----- T E S T S ------------------------------------------------------------------
