//! ECMA-335 assembly reader.
//!
//! This crate exposes raw-but-typed views over a single managed assembly:
//! the PE envelope, the CLI header, the metadata streams and tables, blob
//! signatures, and decoded IL method bodies. It knows nothing about the
//! compilation pipeline; `cil2cpp` builds its world model on top of it.
//!
//! The layering mirrors the physical file format:
//!
//! - [`pe`] locates the CLI header inside the PE/COFF envelope and resolves
//!   RVAs through the section table.
//! - [`streams`] parses the metadata root and wraps the `#Strings`, `#Blob`,
//!   `#US` and `#GUID` heaps.
//! - [`tables`] reads the `#~` stream into typed rows.
//! - [`signatures`] decodes blob signatures into a [`signatures::TypeSig`] tree.
//! - [`il`] decodes method bodies into instruction lists plus exception
//!   regions.
//!
//! All offsets and integers in the format are little-endian; compressed
//! integers follow ECMA-335 §II.23.2.

pub mod error;
pub mod flags;
pub mod il;
pub mod pe;
mod reader;
pub mod signatures;
pub mod streams;
pub mod tables;

pub use error::{MetadataError, Result};
pub use pe::PeFile;
pub use tables::{MetadataToken, TableId};

use std::path::Path;

use streams::{BlobHeap, GuidHeap, MetadataRoot, StringHeap, UserStringHeap};
use tables::Tables;

/// A fully opened assembly: the file bytes, the parsed PE envelope, the
/// metadata heaps, and the typed table rows.
///
/// The struct owns the file contents; heap accessors borrow from it.
pub struct AssemblyFile {
    path: std::path::PathBuf,
    pe: PeFile,
    string_heap_range: (usize, usize),
    blob_heap_range: (usize, usize),
    user_string_range: (usize, usize),
    guid_heap_range: (usize, usize),
    tables: Tables,
    metadata_version: String,
}

impl AssemblyFile {
    /// Open and parse an assembly from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<AssemblyFile> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        Self::from_bytes(path, bytes)
    }

    /// Parse an assembly from bytes already in memory.
    pub fn from_bytes(path: impl AsRef<Path>, bytes: Vec<u8>) -> Result<AssemblyFile> {
        let pe = PeFile::parse(bytes)?;
        let meta = pe.metadata()?;
        let meta_base = meta.as_ptr() as usize - pe.bytes().as_ptr() as usize;
        let root = MetadataRoot::parse(meta)?;

        let range_of = |name: &str| -> (usize, usize) {
            match root.stream(name) {
                Some((off, len)) => (meta_base + off, len),
                None => (0, 0),
            }
        };

        let string_heap_range = range_of("#Strings");
        let blob_heap_range = range_of("#Blob");
        let user_string_range = range_of("#US");
        let guid_heap_range = range_of("#GUID");

        let (tables_off, tables_len) = root
            .stream("#~")
            .or_else(|| root.stream("#-"))
            .ok_or_else(|| MetadataError::malformed("assembly has no #~ tables stream"))?;
        let tables_slice = &meta[tables_off..tables_off + tables_len];
        let tables = Tables::parse(tables_slice)?;

        Ok(AssemblyFile {
            path: path.as_ref().to_path_buf(),
            pe,
            string_heap_range,
            blob_heap_range,
            user_string_range,
            guid_heap_range,
            tables,
            metadata_version: root.version,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pe(&self) -> &PeFile {
        &self.pe
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn metadata_version(&self) -> &str {
        &self.metadata_version
    }

    fn heap(&self, range: (usize, usize)) -> &[u8] {
        let (off, len) = range;
        &self.pe.bytes()[off..off + len]
    }

    pub fn strings(&self) -> StringHeap<'_> {
        StringHeap::new(self.heap(self.string_heap_range))
    }

    pub fn blobs(&self) -> BlobHeap<'_> {
        BlobHeap::new(self.heap(self.blob_heap_range))
    }

    pub fn user_strings(&self) -> UserStringHeap<'_> {
        UserStringHeap::new(self.heap(self.user_string_range))
    }

    pub fn guids(&self) -> GuidHeap<'_> {
        GuidHeap::new(self.heap(self.guid_heap_range))
    }

    /// The entry-point token from the CLI header, if the assembly has one.
    pub fn entry_point(&self) -> Option<MetadataToken> {
        let token = self.pe.cli_header().entry_point_token;
        if token == 0 {
            None
        } else {
            Some(MetadataToken(token))
        }
    }

    /// Read bytes at an RVA, e.g. a method body or RVA-backed field data.
    pub fn data_at_rva(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let off = self.pe.resolve_rva(rva)?;
        let bytes = self.pe.bytes();
        if off + len > bytes.len() {
            return Err(MetadataError::malformed(format!(
                "RVA {rva:#x} + {len} bytes runs past end of file"
            )));
        }
        Ok(&bytes[off..off + len])
    }

    /// Decode the IL body of a method given its RVA.
    pub fn method_body(&self, rva: u32) -> Result<il::MethodBody> {
        let off = self.pe.resolve_rva(rva)?;
        il::MethodBody::parse(&self.pe.bytes()[off..])
    }
}
