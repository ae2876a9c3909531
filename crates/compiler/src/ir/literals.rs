//! Pass 7: string-literal pool and array-init blobs.
//!
//! Lowering collected raw UTF-16 payloads and RVA field references under
//! provisional ids. This pass dedups them, assigns stable symbols derived
//! from the content hash, orders the pools by symbol, and rewrites every
//! operand to the final ids. Identical content shares one entry.

use std::collections::BTreeMap;

use fxhash::FxHashMap;

use super::builder::IrBuilder;
use super::{BlobId, DataBlob, InstrKind, StringId, StringLiteral};

pub fn run(b: &mut IrBuilder<'_, '_>) {
    let string_remap = build_string_pool(b);
    let blob_remap = build_blob_pool(b);
    rewrite_operands(b, &string_remap, &blob_remap);
}

fn build_string_pool(b: &mut IrBuilder<'_, '_>) -> Vec<StringId> {
    let raw = std::mem::take(&mut b.raw_strings);
    // Symbol per unique content; BTreeMap gives symbol-ordered emission.
    let mut by_symbol: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    let mut symbols: Vec<String> = Vec::with_capacity(raw.len());
    for units in &raw {
        let symbol = string_symbol(units);
        by_symbol.entry(symbol.clone()).or_insert_with(|| units.clone());
        symbols.push(symbol);
    }
    let mut id_by_symbol = BTreeMap::new();
    for (index, (symbol, units)) in by_symbol.into_iter().enumerate() {
        let id = StringId(index as u32);
        id_by_symbol.insert(symbol.clone(), id);
        b.module.strings.push(StringLiteral { id, symbol, units });
    }
    symbols
        .into_iter()
        .map(|s| id_by_symbol[&s])
        .collect()
}

fn build_blob_pool(b: &mut IrBuilder<'_, '_>) -> FxHashMap<u32, BlobId> {
    let rva_fields = std::mem::take(&mut b.rva_fields);
    let mut by_symbol: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut field_symbol: Vec<(u32, String)> = Vec::new();
    for (fid, assembly, rva) in rva_fields {
        let size = {
            let field = b.module.field(fid);
            b.module.ty(field.ty).instance_size as usize
        };
        if size == 0 {
            continue;
        }
        let asm = b.world.set.assembly(assembly);
        let Ok(bytes) = asm.file.data_at_rva(rva, size) else {
            continue;
        };
        let bytes = bytes.to_vec();
        let symbol = blob_symbol(&bytes);
        by_symbol.entry(symbol.clone()).or_insert(bytes);
        field_symbol.push((fid.0, symbol));
    }
    let mut id_by_symbol = BTreeMap::new();
    for (index, (symbol, bytes)) in by_symbol.into_iter().enumerate() {
        let id = BlobId(index as u32);
        id_by_symbol.insert(symbol.clone(), id);
        b.module.blobs.push(DataBlob {
            id,
            symbol,
            bytes,
            alignment: 8,
        });
    }
    let mut remap = FxHashMap::default();
    for (field_raw, symbol) in field_symbol {
        let blob = id_by_symbol[&symbol];
        remap.insert(field_raw, blob);
        b.module
            .field_mut(super::FieldId(field_raw))
            .rva_blob = Some(blob);
    }
    remap
}

fn rewrite_operands(
    b: &mut IrBuilder<'_, '_>,
    string_remap: &[StringId],
    blob_remap: &FxHashMap<u32, BlobId>,
) {
    for method in &mut b.module.methods {
        for block in &mut method.blocks {
            for instr in &mut block.instrs {
                match &mut instr.kind {
                    InstrKind::ConstString(id) => {
                        if let Some(final_id) = string_remap.get(id.0 as usize) {
                            *id = *final_id;
                        }
                    }
                    InstrKind::InitArrayData { blob, .. } => {
                        // Provisional blob ids carry the raw field index.
                        if let Some(final_id) = blob_remap.get(&blob.0) {
                            *blob = *final_id;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Stable pool symbol from the literal's content hash.
fn string_symbol(units: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(units.len() * 2);
    for u in units {
        bytes.extend_from_slice(&u.to_le_bytes());
    }
    format!("str_{:016x}", fxhash::hash64(&bytes))
}

fn blob_symbol(bytes: &[u8]) -> String {
    format!("blob_{:016x}", fxhash::hash64(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_shares_a_symbol() {
        let a: Vec<u16> = "Hello".encode_utf16().collect();
        let b: Vec<u16> = "Hello".encode_utf16().collect();
        let c: Vec<u16> = "World".encode_utf16().collect();
        assert_eq!(string_symbol(&a), string_symbol(&b));
        assert_ne!(string_symbol(&a), string_symbol(&c));
    }

    #[test]
    fn symbols_are_identifier_safe() {
        let sym = string_symbol(&[0xD83D, 0xDE00]);
        assert!(sym.starts_with("str_"));
        assert!(sym.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
