//! PE/COFF envelope parsing.
//!
//! Managed assemblies are ordinary PE images whose data directory 14 points
//! at the CLI header. We parse just enough of the envelope to resolve RVAs
//! through the section table and to find the metadata root; everything else
//! in the image (imports, relocations, resources) is irrelevant to an AOT
//! compiler and is skipped.

use crate::error::{MetadataError, Result};
use crate::reader::Reader;

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPTIONAL_MAGIC_PE32: u16 = 0x010B;
const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x020B;
const CLI_HEADER_DIRECTORY: usize = 14;

/// One entry of the section table.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
}

impl Section {
    fn contains_rva(&self, rva: u32) -> bool {
        // Virtual size may exceed raw size (zero-filled tail); either bound
        // can be the larger one in files produced by different linkers.
        let span = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva < self.virtual_address + span
    }
}

/// The CLI header (ECMA-335 §II.25.3.3).
#[derive(Debug, Clone)]
pub struct CliHeader {
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata_rva: u32,
    pub metadata_size: u32,
    pub flags: u32,
    pub entry_point_token: u32,
}

/// A parsed PE image holding the raw bytes and the pieces the compiler needs.
pub struct PeFile {
    bytes: Vec<u8>,
    sections: Vec<Section>,
    cli: CliHeader,
}

impl PeFile {
    pub fn parse(bytes: Vec<u8>) -> Result<PeFile> {
        let mut r = Reader::new(&bytes);

        if r.u16()? != DOS_MAGIC {
            return Err(MetadataError::malformed("missing MZ signature"));
        }
        r.seek(0x3C)?;
        let pe_offset = r.u32()? as usize;
        r.seek(pe_offset)?;
        if r.u32()? != PE_SIGNATURE {
            return Err(MetadataError::malformed("missing PE signature"));
        }

        // COFF header.
        let _machine = r.u16()?;
        let section_count = r.u16()? as usize;
        r.skip(12)?; // timestamp, symbol table pointer, symbol count
        let optional_size = r.u16()? as usize;
        let _characteristics = r.u16()?;

        let optional_start = r.pos();
        let magic = r.u16()?;
        let dir_count_offset = match magic {
            OPTIONAL_MAGIC_PE32 => 92,
            OPTIONAL_MAGIC_PE32_PLUS => 108,
            other => {
                return Err(MetadataError::malformed(format!(
                    "unknown optional-header magic {other:#06x}"
                )));
            }
        };
        r.seek(optional_start + dir_count_offset)?;
        let dir_count = r.u32()? as usize;
        if dir_count <= CLI_HEADER_DIRECTORY {
            return Err(MetadataError::malformed(
                "image has no CLI header directory; not a managed assembly",
            ));
        }
        r.seek(optional_start + dir_count_offset + 4 + CLI_HEADER_DIRECTORY * 8)?;
        let cli_rva = r.u32()?;
        let cli_size = r.u32()?;
        if cli_rva == 0 || cli_size == 0 {
            return Err(MetadataError::malformed(
                "empty CLI header directory; not a managed assembly",
            ));
        }

        // Section table sits right after the optional header.
        r.seek(optional_start + optional_size)?;
        let mut sections = Vec::with_capacity(section_count);
        for _ in 0..section_count {
            let name_bytes = r.bytes(8)?;
            let end = name_bytes.iter().position(|b| *b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            let virtual_size = r.u32()?;
            let virtual_address = r.u32()?;
            let raw_size = r.u32()?;
            let raw_offset = r.u32()?;
            r.skip(16)?; // relocations, line numbers, characteristics
            sections.push(Section {
                name,
                virtual_size,
                virtual_address,
                raw_size,
                raw_offset,
            });
        }

        let cli = Self::parse_cli_header(&bytes, &sections, cli_rva)?;
        Ok(PeFile {
            bytes,
            sections,
            cli,
        })
    }

    fn parse_cli_header(bytes: &[u8], sections: &[Section], rva: u32) -> Result<CliHeader> {
        let off = resolve_rva(sections, rva)?;
        let mut r = Reader::new(bytes);
        r.seek(off)?;
        let cb = r.u32()?;
        if cb < 72 {
            return Err(MetadataError::malformed(format!(
                "CLI header too small ({cb} bytes)"
            )));
        }
        let major_runtime_version = r.u16()?;
        let minor_runtime_version = r.u16()?;
        let metadata_rva = r.u32()?;
        let metadata_size = r.u32()?;
        let flags = r.u32()?;
        let entry_point_token = r.u32()?;
        Ok(CliHeader {
            major_runtime_version,
            minor_runtime_version,
            metadata_rva,
            metadata_size,
            flags,
            entry_point_token,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn cli_header(&self) -> &CliHeader {
        &self.cli
    }

    /// Translate an RVA into a file offset through the section table.
    pub fn resolve_rva(&self, rva: u32) -> Result<usize> {
        resolve_rva(&self.sections, rva)
    }

    /// The metadata root region named by the CLI header.
    pub fn metadata(&self) -> Result<&[u8]> {
        let off = self.resolve_rva(self.cli.metadata_rva)?;
        let len = self.cli.metadata_size as usize;
        if off + len > self.bytes.len() {
            return Err(MetadataError::malformed(
                "metadata directory runs past end of file",
            ));
        }
        Ok(&self.bytes[off..off + len])
    }
}

fn resolve_rva(sections: &[Section], rva: u32) -> Result<usize> {
    for section in sections {
        if section.contains_rva(rva) {
            return Ok((rva - section.virtual_address + section.raw_offset) as usize);
        }
    }
    Err(MetadataError::malformed(format!(
        "RVA {rva:#x} not covered by any section"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rva_resolution_picks_the_covering_section() {
        let sections = vec![
            Section {
                name: ".text".into(),
                virtual_size: 0x1000,
                virtual_address: 0x2000,
                raw_size: 0x0E00,
                raw_offset: 0x0400,
            },
            Section {
                name: ".rsrc".into(),
                virtual_size: 0x200,
                virtual_address: 0x4000,
                raw_size: 0x200,
                raw_offset: 0x1400,
            },
        ];
        assert_eq!(resolve_rva(&sections, 0x2010).unwrap(), 0x0410);
        assert_eq!(resolve_rva(&sections, 0x4000).unwrap(), 0x1400);
        assert!(resolve_rva(&sections, 0x8000).is_err());
    }

    #[test]
    fn truncated_image_is_rejected() {
        assert!(PeFile::parse(vec![0x4D, 0x5A, 0x00]).is_err());
        assert!(PeFile::parse(Vec::new()).is_err());
    }
}
