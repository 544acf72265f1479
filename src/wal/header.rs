//! WAL file header and metadata blob.
//!
//! File layout: `[header | metadata | record*]`.
//!
//! Header: `{ metadata_length: i64-LE, revision: u64-LE }`, 16 bytes.
//! Metadata: a `serde_json`-encoded `{ header_string, version_string }`
//! blob, `metadata_length` bytes long.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::consts::{WAL_HEADER_STRING, WAL_VERSION_STRING};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalMetadata {
    pub header_string: String,
    pub version_string: String,
}

impl WalMetadata {
    pub fn current() -> Self {
        WalMetadata {
            header_string: WAL_HEADER_STRING.to_string(),
            version_string: WAL_VERSION_STRING.to_string(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.header_string == WAL_HEADER_STRING && self.version_string == WAL_VERSION_STRING
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub metadata_length: i64,
    pub revision: u64,
}

pub const HEADER_LEN: u64 = 16;

impl WalHeader {
    pub fn write<W: Write>(w: &mut W, metadata_length: i64, revision: u64) -> io::Result<()> {
        w.write_i64::<LittleEndian>(metadata_length)?;
        w.write_u64::<LittleEndian>(revision)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let metadata_length = r.read_i64::<LittleEndian>()?;
        let revision = r.read_u64::<LittleEndian>()?;
        Ok(WalHeader { metadata_length, revision })
    }
}

/// Writes header + metadata blob to `w`, returning the byte offset of
/// the first record (i.e. `HEADER_LEN + metadata_length`).
pub fn write_header_and_metadata<W: Write>(w: &mut W, revision: u64) -> io::Result<u64> {
    let metadata = WalMetadata::current();
    let encoded = serde_json::to_vec(&metadata)?;
    WalHeader::write(w, encoded.len() as i64, revision)?;
    w.write_all(&encoded)?;
    Ok(HEADER_LEN + encoded.len() as u64)
}

/// Reads header + metadata blob from `r`, returning `(header, metadata,
/// offset of first record)`.
pub fn read_header_and_metadata<R: Read>(r: &mut R) -> io::Result<(WalHeader, WalMetadata, u64)> {
    let header = WalHeader::read(r)?;
    if header.metadata_length < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "negative metadata length"));
    }
    let mut buf = vec![0u8; header.metadata_length as usize];
    r.read_exact(&mut buf)?;
    let metadata: WalMetadata = serde_json::from_slice(&buf)?;
    Ok((header, metadata, HEADER_LEN + header.metadata_length as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_roundtrip() {
        let mut buf = Vec::new();
        let offset = write_header_and_metadata(&mut buf, 7).unwrap();
        let mut cursor = Cursor::new(buf);
        let (header, metadata, read_offset) = read_header_and_metadata(&mut cursor).unwrap();
        assert_eq!(header.revision, 7);
        assert!(metadata.is_current());
        assert_eq!(offset, read_offset);
    }
}
