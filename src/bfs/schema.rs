use crate::hash::HASH_LEN;
use bytes::{Buf, BufMut};
use std::io::{Error as IoError, ErrorKind};

/// Size in bytes of one serialized [`BlockSchema`] record in an index file.
pub const SCHEMA_SIZE: usize = HASH_LEN // hash, zero padded
    + 8 // offset
    + 4 // reference count
    + 4 // size
    + 1 // encrypted flag
    + 8 // created timestamp
    + 8; // modified timestamp

/// BlockSchema is the fixed width index record of one stored block.
///
/// All integers are written big endian. The hash occupies exactly
/// [`HASH_LEN`] bytes, shorter hashes are padded with zeros and longer ones
/// are truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSchema {
    pub hash: String,
    /// offset of the payload inside the sibling data file
    pub offset: u64,
    pub reference_count: u32,
    /// length of the stored (possibly encrypted) payload
    pub size: u32,
    pub encrypted: bool,
    /// unix timestamps in milliseconds
    pub created: i64,
    pub modified: i64,
}

impl BlockSchema {
    pub fn new<S: Into<String>>(hash: S, size: u32, encrypted: bool) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            hash: hash.into(),
            offset: 0,
            reference_count: 1,
            size,
            encrypted,
            created: now,
            modified: now,
        }
    }

    pub fn touch(&mut self) {
        self.modified = chrono::Utc::now().timestamp_millis();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SCHEMA_SIZE);

        let mut hash = [0u8; HASH_LEN];
        let raw = self.hash.as_bytes();
        let len = raw.len().min(HASH_LEN);
        hash[..len].copy_from_slice(&raw[..len]);

        buf.put_slice(&hash);
        buf.put_u64(self.offset);
        buf.put_u32(self.reference_count);
        buf.put_u32(self.size);
        buf.put_u8(self.encrypted as u8);
        buf.put_i64(self.created);
        buf.put_i64(self.modified);

        buf
    }

    pub fn decode(mut buf: &[u8]) -> std::io::Result<Self> {
        if buf.len() < SCHEMA_SIZE {
            return Err(IoError::new(
                ErrorKind::UnexpectedEof,
                format!("short index record ({} bytes)", buf.len()),
            ));
        }

        let raw = &buf[..HASH_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(HASH_LEN);
        let hash = std::str::from_utf8(&raw[..end])
            .map_err(|_| IoError::new(ErrorKind::InvalidData, "index record hash is not utf8"))?
            .trim()
            .to_owned();
        buf.advance(HASH_LEN);

        Ok(Self {
            hash,
            offset: buf.get_u64(),
            reference_count: buf.get_u32(),
            size: buf.get_u32(),
            encrypted: buf.get_u8() != 0,
            created: buf.get_i64(),
            modified: buf.get_i64(),
        })
    }
}
