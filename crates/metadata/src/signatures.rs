//! Blob signature parsing (ECMA-335 §II.23.2).
//!
//! Field, method, local-variable and type-spec blobs all share one grammar
//! over element-type bytes; the parser produces a [`TypeSig`] tree with
//! metadata tokens at the class/valuetype leaves. Custom modifiers are
//! consumed and dropped — the AOT pipeline has no use for them.

use crate::error::{MetadataError, Result};
use crate::reader::Reader;
use crate::tables::{MetadataToken, TableId};

/// Element-type constants (§II.23.1.16).
pub mod element_type {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1B;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const MVAR: u8 = 0x1E;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
    pub const INTERNAL: u8 = 0x21;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// Calling-convention byte of a signature blob (§II.23.2.3).
pub mod calling_convention {
    pub const DEFAULT: u8 = 0x00;
    pub const VARARG: u8 = 0x05;
    pub const FIELD: u8 = 0x06;
    pub const LOCAL_SIG: u8 = 0x07;
    pub const PROPERTY: u8 = 0x08;
    pub const GENERICINST: u8 = 0x0A;
    pub const MASK: u8 = 0x0F;
    pub const GENERIC: u8 = 0x10;
    pub const HASTHIS: u8 = 0x20;
    pub const EXPLICITTHIS: u8 = 0x40;
}

/// A decoded type reference.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native-width signed integer.
    IntPtr,
    /// Native-width unsigned integer.
    UIntPtr,
    String,
    Object,
    /// Reference type named by token.
    Class(MetadataToken),
    /// Value type named by token.
    ValueType(MetadataToken),
    /// Single-dimension zero-based array.
    SzArray(Box<TypeSig>),
    /// General array with rank (bounds are parsed and dropped).
    Array { element: Box<TypeSig>, rank: u32 },
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    /// Instantiated generic type.
    GenericInst {
        value_type: bool,
        definition: MetadataToken,
        args: Vec<TypeSig>,
    },
    /// Generic parameter of the declaring type.
    Var(u32),
    /// Generic parameter of the method.
    MVar(u32),
    FnPtr(Box<MethodSig>),
    TypedByRef,
}

/// A parsed method signature.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub has_this: bool,
    pub explicit_this: bool,
    pub vararg: bool,
    pub generic_param_count: u32,
    pub return_type: TypeSig,
    pub params: Vec<TypeSig>,
}

/// One local variable slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSig {
    pub ty: TypeSig,
    pub pinned: bool,
}

pub fn parse_field_sig(blob: &[u8]) -> Result<TypeSig> {
    let mut r = Reader::new(blob);
    let conv = r.u8()?;
    if conv & calling_convention::MASK != calling_convention::FIELD {
        return Err(MetadataError::malformed(format!(
            "field signature has calling convention {conv:#04x}"
        )));
    }
    skip_custom_mods(&mut r)?;
    parse_type(&mut r)
}

pub fn parse_method_sig(blob: &[u8]) -> Result<MethodSig> {
    let mut r = Reader::new(blob);
    parse_method_sig_inner(&mut r)
}

fn parse_method_sig_inner(r: &mut Reader<'_>) -> Result<MethodSig> {
    let conv = r.u8()?;
    let has_this = conv & calling_convention::HASTHIS != 0;
    let explicit_this = conv & calling_convention::EXPLICITTHIS != 0;
    let vararg = conv & calling_convention::MASK == calling_convention::VARARG;
    let generic_param_count = if conv & calling_convention::GENERIC != 0 {
        r.compressed_u32()?
    } else {
        0
    };
    let param_count = r.compressed_u32()?;
    skip_custom_mods(r)?;
    let return_type = parse_type(r)?;
    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        skip_custom_mods(r)?;
        if r.remaining() > 0 {
            // Vararg sentinel separates fixed from variable parameters; the
            // AOT pipeline only models the fixed part.
            let peek = r.bytes(1)?[0];
            if peek == element_type::SENTINEL {
                break;
            }
            r.seek(r.pos() - 1)?;
        }
        params.push(parse_type(r)?);
    }
    Ok(MethodSig {
        has_this,
        explicit_this,
        vararg,
        generic_param_count,
        return_type,
        params,
    })
}

pub fn parse_locals_sig(blob: &[u8]) -> Result<Vec<LocalSig>> {
    let mut r = Reader::new(blob);
    let conv = r.u8()?;
    if conv & calling_convention::MASK != calling_convention::LOCAL_SIG {
        return Err(MetadataError::malformed(format!(
            "locals signature has calling convention {conv:#04x}"
        )));
    }
    let count = r.compressed_u32()?;
    let mut locals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        skip_custom_mods(&mut r)?;
        let mut pinned = false;
        loop {
            let peek = r.bytes(1)?[0];
            if peek == element_type::PINNED {
                pinned = true;
                skip_custom_mods(&mut r)?;
            } else {
                r.seek(r.pos() - 1)?;
                break;
            }
        }
        locals.push(LocalSig {
            ty: parse_type(&mut r)?,
            pinned,
        });
    }
    Ok(locals)
}

/// TypeSpec blobs are a bare type.
pub fn parse_type_spec(blob: &[u8]) -> Result<TypeSig> {
    let mut r = Reader::new(blob);
    skip_custom_mods(&mut r)?;
    parse_type(&mut r)
}

/// MethodSpec blobs: GENERICINST convention then the argument list.
pub fn parse_method_spec(blob: &[u8]) -> Result<Vec<TypeSig>> {
    let mut r = Reader::new(blob);
    let conv = r.u8()?;
    if conv != calling_convention::GENERICINST {
        return Err(MetadataError::malformed(format!(
            "method-spec blob has convention {conv:#04x}"
        )));
    }
    let count = r.compressed_u32()?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        skip_custom_mods(&mut r)?;
        args.push(parse_type(&mut r)?);
    }
    Ok(args)
}

fn skip_custom_mods(r: &mut Reader<'_>) -> Result<()> {
    loop {
        if r.remaining() == 0 {
            return Ok(());
        }
        let peek = r.bytes(1)?[0];
        if peek == element_type::CMOD_REQD || peek == element_type::CMOD_OPT {
            let _token = read_type_def_or_ref(r)?;
        } else {
            r.seek(r.pos() - 1)?;
            return Ok(());
        }
    }
}

/// TypeDefOrRefOrSpecEncoded: compressed (rid << 2 | tag).
fn read_type_def_or_ref(r: &mut Reader<'_>) -> Result<MetadataToken> {
    let encoded = r.compressed_u32()?;
    let table = match encoded & 0x3 {
        0 => TableId::TypeDef,
        1 => TableId::TypeRef,
        2 => TableId::TypeSpec,
        _ => {
            return Err(MetadataError::malformed(
                "invalid TypeDefOrRef encoding tag 3",
            ));
        }
    };
    Ok(MetadataToken::new(table, encoded >> 2))
}

fn parse_type(r: &mut Reader<'_>) -> Result<TypeSig> {
    use element_type as et;
    let b = r.u8()?;
    let sig = match b {
        et::VOID => TypeSig::Void,
        et::BOOLEAN => TypeSig::Boolean,
        et::CHAR => TypeSig::Char,
        et::I1 => TypeSig::I1,
        et::U1 => TypeSig::U1,
        et::I2 => TypeSig::I2,
        et::U2 => TypeSig::U2,
        et::I4 => TypeSig::I4,
        et::U4 => TypeSig::U4,
        et::I8 => TypeSig::I8,
        et::U8 => TypeSig::U8,
        et::R4 => TypeSig::R4,
        et::R8 => TypeSig::R8,
        et::I => TypeSig::IntPtr,
        et::U => TypeSig::UIntPtr,
        et::STRING => TypeSig::String,
        et::OBJECT => TypeSig::Object,
        et::TYPEDBYREF => TypeSig::TypedByRef,
        et::CLASS => TypeSig::Class(read_type_def_or_ref(r)?),
        et::VALUETYPE => TypeSig::ValueType(read_type_def_or_ref(r)?),
        et::SZARRAY => {
            skip_custom_mods(r)?;
            TypeSig::SzArray(Box::new(parse_type(r)?))
        }
        et::ARRAY => {
            let element = parse_type(r)?;
            let rank = r.compressed_u32()?;
            let num_sizes = r.compressed_u32()?;
            for _ in 0..num_sizes {
                let _size = r.compressed_u32()?;
            }
            let num_lo_bounds = r.compressed_u32()?;
            for _ in 0..num_lo_bounds {
                let _bound = r.compressed_i32()?;
            }
            TypeSig::Array {
                element: Box::new(element),
                rank,
            }
        }
        et::PTR => {
            skip_custom_mods(r)?;
            TypeSig::Ptr(Box::new(parse_type(r)?))
        }
        et::BYREF => TypeSig::ByRef(Box::new(parse_type(r)?)),
        et::GENERICINST => {
            let kind = r.u8()?;
            let value_type = match kind {
                et::CLASS => false,
                et::VALUETYPE => true,
                other => {
                    return Err(MetadataError::malformed(format!(
                        "generic instantiation of element kind {other:#04x}"
                    )));
                }
            };
            let definition = read_type_def_or_ref(r)?;
            let arg_count = r.compressed_u32()?;
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                skip_custom_mods(r)?;
                args.push(parse_type(r)?);
            }
            TypeSig::GenericInst {
                value_type,
                definition,
                args,
            }
        }
        et::VAR => TypeSig::Var(r.compressed_u32()?),
        et::MVAR => TypeSig::MVar(r.compressed_u32()?),
        et::FNPTR => TypeSig::FnPtr(Box::new(parse_method_sig_inner(r)?)),
        other => {
            return Err(MetadataError::malformed(format!(
                "unexpected element type {other:#04x} in signature"
            )));
        }
    };
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_sig_of_int() {
        // FIELD convention, ELEMENT_TYPE_I4.
        let sig = parse_field_sig(&[0x06, 0x08]).unwrap();
        assert_eq!(sig, TypeSig::I4);
    }

    #[test]
    fn instance_method_sig() {
        // HASTHIS | DEFAULT, 2 params, returns I4, params (I4, I4).
        let sig = parse_method_sig(&[0x20, 0x02, 0x08, 0x08, 0x08]).unwrap();
        assert!(sig.has_this);
        assert_eq!(sig.params, vec![TypeSig::I4, TypeSig::I4]);
        assert_eq!(sig.return_type, TypeSig::I4);
    }

    #[test]
    fn generic_method_sig_counts_type_params() {
        // GENERIC | DEFAULT, 1 generic param, 1 param, returns MVAR 0, param MVAR 0.
        let sig = parse_method_sig(&[0x10, 0x01, 0x01, 0x1E, 0x00, 0x1E, 0x00]).unwrap();
        assert_eq!(sig.generic_param_count, 1);
        assert_eq!(sig.return_type, TypeSig::MVar(0));
        assert_eq!(sig.params, vec![TypeSig::MVar(0)]);
    }

    #[test]
    fn locals_with_pinned_slot() {
        // LOCAL_SIG, 2 locals: pinned I, then SZARRAY of STRING.
        let locals = parse_locals_sig(&[0x07, 0x02, 0x45, 0x18, 0x1D, 0x0E]).unwrap();
        assert_eq!(locals.len(), 2);
        assert!(locals[0].pinned);
        assert_eq!(locals[0].ty, TypeSig::IntPtr);
        assert_eq!(locals[1].ty, TypeSig::SzArray(Box::new(TypeSig::String)));
    }

    #[test]
    fn generic_inst_of_list_of_int() {
        // GENERICINST CLASS TypeRef#3 <I4>.
        let encoded_ref = (3u8 << 2) | 1; // rid 3, tag TypeRef
        let sig = parse_type_spec(&[0x15, 0x12, encoded_ref, 0x01, 0x08]).unwrap();
        match sig {
            TypeSig::GenericInst {
                value_type,
                definition,
                args,
            } => {
                assert!(!value_type);
                assert_eq!(definition.table(), Some(TableId::TypeRef));
                assert_eq!(definition.rid(), 3);
                assert_eq!(args, vec![TypeSig::I4]);
            }
            other => panic!("expected generic inst, got {other:?}"),
        }
    }
}
