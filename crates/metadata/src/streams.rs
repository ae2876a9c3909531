//! Metadata root and heap streams.
//!
//! The metadata root (ECMA-335 §II.24.2.1) starts with the `BSJB` signature
//! and names a small set of streams. The compiler needs the tables stream
//! (`#~`, handled in [`crate::tables`]) and the four heaps wrapped here.

use crate::error::{MetadataError, Result};
use crate::reader::Reader;

const METADATA_SIGNATURE: u32 = 0x424A_5342; // "BSJB"

/// Parsed metadata root: version string plus (offset, size) per stream,
/// relative to the metadata region.
pub struct MetadataRoot {
    pub version: String,
    streams: Vec<(String, usize, usize)>,
}

impl MetadataRoot {
    pub fn parse(meta: &[u8]) -> Result<MetadataRoot> {
        let mut r = Reader::new(meta);
        if r.u32()? != METADATA_SIGNATURE {
            return Err(MetadataError::malformed("missing BSJB metadata signature"));
        }
        let _major = r.u16()?;
        let _minor = r.u16()?;
        let _reserved = r.u32()?;
        let version_len = r.u32()? as usize;
        let version_bytes = r.bytes(version_len)?;
        let end = version_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(version_len);
        let version = std::str::from_utf8(&version_bytes[..end])
            .map_err(|_| MetadataError::malformed("metadata version is not UTF-8"))?
            .to_string();

        let _flags = r.u16()?;
        let stream_count = r.u16()? as usize;
        let mut streams = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            let offset = r.u32()? as usize;
            let size = r.u32()? as usize;
            // Stream names are ASCII, null-terminated, padded to 4 bytes.
            let mut name = String::new();
            loop {
                let b = r.u8()?;
                if b == 0 {
                    break;
                }
                name.push(b as char);
                if name.len() > 32 {
                    return Err(MetadataError::malformed("unterminated stream name"));
                }
            }
            r.align(4)?;
            if offset + size > meta.len() {
                return Err(MetadataError::malformed(format!(
                    "stream {name} runs past end of metadata"
                )));
            }
            streams.push((name, offset, size));
        }
        Ok(MetadataRoot { version, streams })
    }

    /// Look up a stream by name, returning (offset, size) within the
    /// metadata region.
    pub fn stream(&self, name: &str) -> Option<(usize, usize)> {
        self.streams
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, off, size)| (*off, *size))
    }
}

/// The `#Strings` heap: null-terminated UTF-8 names.
pub struct StringHeap<'a>(&'a [u8]);

impl<'a> StringHeap<'a> {
    pub fn new(data: &'a [u8]) -> StringHeap<'a> {
        StringHeap(data)
    }

    pub fn get(&self, offset: u32) -> Result<&'a str> {
        let start = offset as usize;
        if start >= self.0.len() {
            return Err(MetadataError::malformed(format!(
                "string heap offset {offset:#x} out of range"
            )));
        }
        let tail = &self.0[start..];
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| MetadataError::malformed("unterminated string heap entry"))?;
        std::str::from_utf8(&tail[..end])
            .map_err(|_| MetadataError::malformed("string heap entry is not UTF-8"))
    }
}

/// The `#Blob` heap: length-prefixed byte runs.
pub struct BlobHeap<'a>(&'a [u8]);

impl<'a> BlobHeap<'a> {
    pub fn new(data: &'a [u8]) -> BlobHeap<'a> {
        BlobHeap(data)
    }

    pub fn get(&self, offset: u32) -> Result<&'a [u8]> {
        let start = offset as usize;
        if start >= self.0.len() {
            return Err(MetadataError::malformed(format!(
                "blob heap offset {offset:#x} out of range"
            )));
        }
        let mut r = Reader::new(self.0);
        r.seek(start)?;
        let len = r.compressed_u32()? as usize;
        r.bytes(len)
    }
}

/// The `#US` heap: length-prefixed UTF-16 literals with a trailing kind byte.
pub struct UserStringHeap<'a>(&'a [u8]);

impl<'a> UserStringHeap<'a> {
    pub fn new(data: &'a [u8]) -> UserStringHeap<'a> {
        UserStringHeap(data)
    }

    /// Decode a user string into UTF-16 code units. Offsets come from the
    /// low 24 bits of `ldstr` tokens.
    pub fn get(&self, offset: u32) -> Result<Vec<u16>> {
        let start = offset as usize;
        if start >= self.0.len() {
            return Err(MetadataError::malformed(format!(
                "user string offset {offset:#x} out of range"
            )));
        }
        let mut r = Reader::new(self.0);
        r.seek(start)?;
        let byte_len = r.compressed_u32()? as usize;
        let payload = r.bytes(byte_len)?;
        // The final byte flags whether any unit needs special handling; the
        // UTF-16 payload is everything before it.
        let utf16_bytes = if byte_len % 2 == 1 {
            &payload[..byte_len - 1]
        } else {
            payload
        };
        let mut units = Vec::with_capacity(utf16_bytes.len() / 2);
        for pair in utf16_bytes.chunks_exact(2) {
            units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
        Ok(units)
    }
}

/// The `#GUID` heap: raw 16-byte entries, 1-based index.
pub struct GuidHeap<'a>(&'a [u8]);

impl<'a> GuidHeap<'a> {
    pub fn new(data: &'a [u8]) -> GuidHeap<'a> {
        GuidHeap(data)
    }

    pub fn get(&self, index: u32) -> Result<[u8; 16]> {
        if index == 0 {
            return Err(MetadataError::malformed("GUID heap index 0"));
        }
        let start = (index as usize - 1) * 16;
        if start + 16 > self.0.len() {
            return Err(MetadataError::malformed(format!(
                "GUID heap index {index} out of range"
            )));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&self.0[start..start + 16]);
        Ok(guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_heap_reads_null_terminated_entries() {
        let heap = StringHeap::new(b"\0Object\0System\0");
        assert_eq!(heap.get(0).unwrap(), "");
        assert_eq!(heap.get(1).unwrap(), "Object");
        assert_eq!(heap.get(8).unwrap(), "System");
        assert!(heap.get(99).is_err());
    }

    #[test]
    fn user_string_heap_decodes_utf16() {
        // "Hi" = 48 00 69 00, plus the trailing kind byte; length prefix 5.
        let heap = UserStringHeap::new(&[0x00, 0x05, 0x48, 0x00, 0x69, 0x00, 0x00]);
        assert_eq!(heap.get(1).unwrap(), vec![0x48, 0x69]);
    }

    #[test]
    fn blob_heap_honors_length_prefix() {
        let heap = BlobHeap::new(&[0x00, 0x03, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(heap.get(1).unwrap(), &[0xAA, 0xBB, 0xCC]);
    }
}
