//! The d2p archive codec.
//!
//! A d2p archive is a seek-indexed bundle: a 2-byte version header, the
//! concatenated file bodies, an index region naming each body with its
//! offset and size, a properties region of key/value pairs, and a 24-byte
//! trailer locating the regions. All integers are big-endian; strings are
//! UTF-8 with a 2-byte length prefix.
//!
//! ```text
//! ┌─────────┬──────────────┬─────────────┬────────────┬─────────┐
//! │ 2.1     │ file bodies  │ indexes     │ properties │ trailer │
//! │ (2 B)   │              │ name,off,sz │ key,value  │ (24 B)  │
//! └─────────┴──────────────┴─────────────┴────────────┴─────────┘
//! ```
//!
//! Index offsets are relative to the start of the data region, so bodies can
//! be re-emitted without rewriting the index layout logic. Archives built
//! from an extraction with unchanged entries are bytewise identical to the
//! original, which is what makes in-place patching safe.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{UpdateError, UpdateResult};

/// Supported archive format version.
const VERSION_MAJOR: u8 = 2;
const VERSION_MINOR: u8 = 1;

/// Size of the fixed trailer: six big-endian i32 fields.
const TRAILER_LEN: usize = 24;

/// A key/value property attached to an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct D2pProperty {
    pub key: String,
    pub value: String,
}

/// One named file inside an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct D2pEntry {
    /// Archive-relative name, as stored in the index.
    pub name: String,
    /// File body.
    pub data: Bytes,
}

/// An in-memory d2p archive.
///
/// Entries keep their index order so that a build after an extract
/// reproduces the source archive bytewise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct D2pArchive {
    entries: Vec<D2pEntry>,
    properties: Vec<D2pProperty>,
}

impl D2pArchive {
    /// Creates an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses an archive from disk.
    pub async fn read(path: &Path) -> UpdateResult<Self> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|_| UpdateError::D2pNotFound {
                path: path.to_path_buf(),
            })?;
        Self::parse(Bytes::from(raw), path)
    }

    /// Parses an archive from bytes. `path` only labels errors.
    pub fn parse(raw: Bytes, path: &Path) -> UpdateResult<Self> {
        let malformed = |reason: &str| UpdateError::D2pMalformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if raw.len() < 2 + TRAILER_LEN {
            return Err(malformed("shorter than header plus trailer"));
        }
        if raw[0] != VERSION_MAJOR || raw[1] != VERSION_MINOR {
            return Err(UpdateError::D2pWrongVersion {
                major: raw[0],
                minor: raw[1],
            });
        }

        let mut trailer = &raw[raw.len() - TRAILER_LEN..];
        let data_offset = read_u31(&mut trailer)?;
        let _data_count = read_u31(&mut trailer)?;
        let index_offset = read_u31(&mut trailer)?;
        let index_count = read_u31(&mut trailer)?;
        let properties_offset = read_u31(&mut trailer)?;
        let properties_count = read_u31(&mut trailer)?;

        if index_offset > raw.len() || properties_offset > raw.len() {
            return Err(malformed("region offset past end of file"));
        }

        let mut entries = Vec::with_capacity(index_count);
        let mut index = &raw[index_offset..];
        for _ in 0..index_count {
            let name = read_utf(&mut index).ok_or_else(|| malformed("truncated index"))?;
            if index.remaining() < 8 {
                return Err(malformed("truncated index"));
            }
            let offset = index.get_i32();
            let size = index.get_i32();
            if offset < 0 || size < 0 {
                return Err(malformed("negative index field"));
            }

            let start = data_offset + offset as usize;
            let end = start + size as usize;
            if end > raw.len() {
                return Err(malformed("index entry past end of file"));
            }
            entries.push(D2pEntry {
                name,
                data: raw.slice(start..end),
            });
        }

        let mut properties = Vec::with_capacity(properties_count);
        let mut props = &raw[properties_offset..];
        for _ in 0..properties_count {
            let key = read_utf(&mut props).ok_or_else(|| malformed("truncated properties"))?;
            let value = read_utf(&mut props).ok_or_else(|| malformed("truncated properties"))?;
            properties.push(D2pProperty { key, value });
        }

        Ok(Self {
            entries,
            properties,
        })
    }

    /// Encodes the archive, recomputing all offsets.
    pub fn encode(&self) -> UpdateResult<Bytes> {
        let mut out = BytesMut::new();
        out.put_u8(VERSION_MAJOR);
        out.put_u8(VERSION_MINOR);

        let data_offset = out.len();
        let mut offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            offsets.push(out.len() - data_offset);
            out.put_slice(&entry.data);
        }
        let data_count = out.len() - data_offset;

        let index_offset = out.len();
        for (entry, offset) in self.entries.iter().zip(&offsets) {
            put_utf(&mut out, &entry.name)?;
            out.put_i32(as_i32(*offset)?);
            out.put_i32(as_i32(entry.data.len())?);
        }

        let properties_offset = out.len();
        for property in &self.properties {
            put_utf(&mut out, &property.key)?;
            put_utf(&mut out, &property.value)?;
        }

        out.put_i32(as_i32(data_offset)?);
        out.put_i32(as_i32(data_count)?);
        out.put_i32(as_i32(index_offset)?);
        out.put_i32(as_i32(self.entries.len())?);
        out.put_i32(as_i32(properties_offset)?);
        out.put_i32(as_i32(self.properties.len())?);

        Ok(out.freeze())
    }

    /// Encodes and writes the archive to disk.
    pub async fn write(&self, path: &Path) -> UpdateResult<()> {
        let encoded = self.encode()?;
        tokio::fs::write(path, &encoded)
            .await
            .map_err(|e| UpdateError::io(path, e))
    }

    /// Entry names in index order.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Looks up an entry body by name.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.data)
    }

    /// Replaces an entry in place, or appends it if absent.
    ///
    /// Replacement keeps the entry's index position; patching an archive
    /// only moves bytes inside the data region.
    pub fn put(&mut self, name: impl Into<String>, data: Bytes) {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.data = data,
            None => self.entries.push(D2pEntry { name, data }),
        }
    }

    /// Removes an entry by name. Returns true if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[D2pEntry] {
        &self.entries
    }

    pub fn properties(&self) -> &[D2pProperty] {
        &self.properties
    }

    pub fn set_properties(&mut self, properties: Vec<D2pProperty>) {
        self.properties = properties;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads a big-endian i32 that must be non-negative, as a usize.
fn read_u31(buf: &mut &[u8]) -> UpdateResult<usize> {
    if buf.remaining() < 4 {
        return Err(UpdateError::D2pMalformed {
            path: PathBuf::new(),
            reason: "truncated trailer".to_string(),
        });
    }
    let value = buf.get_i32();
    usize::try_from(value).map_err(|_| UpdateError::D2pMalformed {
        path: PathBuf::new(),
        reason: "negative trailer field".to_string(),
    })
}

/// Reads an i16-length-prefixed UTF-8 string.
fn read_utf(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = usize::try_from(buf.get_i16()).ok()?;
    if buf.remaining() < len {
        return None;
    }
    let raw = &buf[..len];
    let text = std::str::from_utf8(raw).ok()?.to_string();
    buf.advance(len);
    Some(text)
}

/// Writes an i16-length-prefixed UTF-8 string.
fn put_utf(out: &mut BytesMut, text: &str) -> UpdateResult<()> {
    let len = i16::try_from(text.len()).map_err(|_| UpdateError::Internal {
        message: format!("d2p string too long: {} bytes", text.len()),
    })?;
    out.put_i16(len);
    out.put_slice(text.as_bytes());
    Ok(())
}

fn as_i32(value: usize) -> UpdateResult<i32> {
    i32::try_from(value).map_err(|_| UpdateError::Internal {
        message: format!("d2p region exceeds i32 range: {value}"),
    })
}
