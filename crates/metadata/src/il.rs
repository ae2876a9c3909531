//! IL method-body decoding (ECMA-335 §II.25.4).
//!
//! Bodies come in a tiny format (code only, ≤63 bytes) and a fat format
//! (locals signature, init flag, trailing exception-clause sections). The
//! decoder normalizes the short/long opcode forms: `ldarg.2`, `ldarg.s` and
//! `ldarg` all become [`IlOp::LdArg`], and every branch target is rewritten
//! as an absolute offset into the method's code.

use crate::error::{MetadataError, Result};
use crate::reader::Reader;
use crate::tables::MetadataToken;

/// Scalar access kinds shared by `ldind`/`stind`, `ldelem`/`stelem` and the
/// conversion family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    /// Native-width signed.
    I,
    /// Native-width unsigned.
    U,
    R4,
    R8,
    /// Object reference.
    Ref,
}

/// One decoded instruction, short forms already normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum IlOp {
    Nop,
    Break,
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Dup,
    Pop,
    Jmp(MetadataToken),
    Call(MetadataToken),
    CallVirt(MetadataToken),
    CallI(MetadataToken),
    Ret,
    /// Unconditional branch to an absolute code offset.
    Br(u32),
    BrFalse(u32),
    BrTrue(u32),
    Beq(u32),
    Bge(u32),
    Bgt(u32),
    Ble(u32),
    Blt(u32),
    BneUn(u32),
    BgeUn(u32),
    BgtUn(u32),
    BleUn(u32),
    BltUn(u32),
    Switch(Vec<u32>),
    LdInd(ScalarKind),
    StInd(ScalarKind),
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
    Conv(ScalarKind),
    ConvOvf(ScalarKind),
    /// Overflow-checked conversion treating the source as unsigned.
    ConvOvfUn(ScalarKind),
    ConvRUn,
    CpObj(MetadataToken),
    LdObj(MetadataToken),
    StObj(MetadataToken),
    LdStr(MetadataToken),
    NewObj(MetadataToken),
    CastClass(MetadataToken),
    IsInst(MetadataToken),
    Unbox(MetadataToken),
    UnboxAny(MetadataToken),
    Box(MetadataToken),
    Throw,
    Rethrow,
    LdFld(MetadataToken),
    LdFldA(MetadataToken),
    StFld(MetadataToken),
    LdSFld(MetadataToken),
    LdSFldA(MetadataToken),
    StSFld(MetadataToken),
    NewArr(MetadataToken),
    LdLen,
    LdElemA(MetadataToken),
    LdElem(ScalarKind),
    LdElemTok(MetadataToken),
    StElem(ScalarKind),
    StElemTok(MetadataToken),
    CkFinite,
    MkRefAny(MetadataToken),
    RefAnyVal(MetadataToken),
    RefAnyType,
    ArgList,
    LdToken(MetadataToken),
    Leave(u32),
    EndFinally,
    EndFilter,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    LdFtn(MetadataToken),
    LdVirtFtn(MetadataToken),
    LocAlloc,
    InitObj(MetadataToken),
    CpBlk,
    InitBlk,
    SizeOf(MetadataToken),
    /// `constrained.` prefix; applies to the following `callvirt`.
    Constrained(MetadataToken),
    Tail,
    Volatile,
    Unaligned(u8),
    ReadOnly,
    NoCheck(u8),
}

/// Instruction plus its code offset (branch targets point at these).
#[derive(Debug, Clone, PartialEq)]
pub struct IlInstruction {
    pub offset: u32,
    pub op: IlOp,
}

/// Exception-clause kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    /// Catch with the exception type token.
    Catch(MetadataToken),
    /// Filter clause; the value is the filter expression's code offset.
    Filter(u32),
    Finally,
    Fault,
}

/// One protected region of a fat method body.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRegion {
    pub kind: HandlerKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
}

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub max_stack: u16,
    pub init_locals: bool,
    pub locals_token: Option<MetadataToken>,
    pub instructions: Vec<IlInstruction>,
    pub exception_regions: Vec<ExceptionRegion>,
}

const TINY_FORMAT: u8 = 0x2;
const FAT_FORMAT: u8 = 0x3;
const FAT_FLAG_INIT_LOCALS: u16 = 0x10;
const FAT_FLAG_MORE_SECTIONS: u16 = 0x8;
const SECTION_EH_TABLE: u8 = 0x1;
const SECTION_FAT_FORMAT: u8 = 0x40;
const SECTION_MORE_SECTIONS: u8 = 0x80;

impl MethodBody {
    /// Parse a body starting at the method's RVA target.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        let mut r = Reader::new(data);
        let first = r.u8()?;
        match first & 0x3 {
            TINY_FORMAT => {
                let code_size = (first >> 2) as usize;
                let code = r.bytes(code_size)?;
                Ok(MethodBody {
                    max_stack: 8,
                    init_locals: false,
                    locals_token: None,
                    instructions: decode(code)?,
                    exception_regions: Vec::new(),
                })
            }
            FAT_FORMAT => {
                let second = r.u8()?;
                let flags = u16::from_le_bytes([first, second]) & 0x0FFF;
                let header_size = (second >> 4) as usize * 4;
                if header_size < 12 {
                    return Err(MetadataError::malformed(format!(
                        "fat body header size {header_size}"
                    )));
                }
                let max_stack = r.u16()?;
                let code_size = r.u32()? as usize;
                let locals_raw = r.u32()?;
                let locals_token = if locals_raw == 0 {
                    None
                } else {
                    Some(MetadataToken(locals_raw))
                };
                r.seek(header_size)?;
                let code = r.bytes(code_size)?;
                let instructions = decode(code)?;
                let exception_regions = if flags & FAT_FLAG_MORE_SECTIONS != 0 {
                    r.align(4)?;
                    parse_sections(&mut r)?
                } else {
                    Vec::new()
                };
                Ok(MethodBody {
                    max_stack,
                    init_locals: flags & FAT_FLAG_INIT_LOCALS != 0,
                    locals_token,
                    instructions,
                    exception_regions,
                })
            }
            other => Err(MetadataError::malformed(format!(
                "unknown method body format {other:#x}"
            ))),
        }
    }
}

fn parse_sections(r: &mut Reader<'_>) -> Result<Vec<ExceptionRegion>> {
    let mut regions = Vec::new();
    loop {
        let kind = r.u8()?;
        let is_eh = kind & SECTION_EH_TABLE != 0;
        let is_fat = kind & SECTION_FAT_FORMAT != 0;
        if is_fat {
            let b = r.bytes(3)?;
            let data_size = u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize;
            let count = (data_size - 4) / 24;
            for _ in 0..count {
                let flags = r.u32()?;
                let try_offset = r.u32()?;
                let try_length = r.u32()?;
                let handler_offset = r.u32()?;
                let handler_length = r.u32()?;
                let class_or_filter = r.u32()?;
                if is_eh {
                    regions.push(make_region(
                        flags,
                        try_offset,
                        try_length,
                        handler_offset,
                        handler_length,
                        class_or_filter,
                    )?);
                }
            }
        } else {
            let data_size = r.u8()? as usize;
            let _reserved = r.u16()?;
            let count = (data_size - 4) / 12;
            for _ in 0..count {
                let flags = r.u16()? as u32;
                let try_offset = r.u16()? as u32;
                let try_length = r.u8()? as u32;
                let handler_offset = r.u16()? as u32;
                let handler_length = r.u8()? as u32;
                let class_or_filter = r.u32()?;
                if is_eh {
                    regions.push(make_region(
                        flags,
                        try_offset,
                        try_length,
                        handler_offset,
                        handler_length,
                        class_or_filter,
                    )?);
                }
            }
        }
        if kind & SECTION_MORE_SECTIONS == 0 {
            break;
        }
        r.align(4)?;
    }
    Ok(regions)
}

fn make_region(
    flags: u32,
    try_offset: u32,
    try_length: u32,
    handler_offset: u32,
    handler_length: u32,
    class_or_filter: u32,
) -> Result<ExceptionRegion> {
    let kind = match flags {
        0x0 => HandlerKind::Catch(MetadataToken(class_or_filter)),
        0x1 => HandlerKind::Filter(class_or_filter),
        0x2 => HandlerKind::Finally,
        0x4 => HandlerKind::Fault,
        other => {
            return Err(MetadataError::malformed(format!(
                "unknown exception clause flags {other:#x}"
            )));
        }
    };
    Ok(ExceptionRegion {
        kind,
        try_offset,
        try_length,
        handler_offset,
        handler_length,
    })
}

/// Decode a code region into instructions with absolute branch targets.
pub fn decode(code: &[u8]) -> Result<Vec<IlInstruction>> {
    use IlOp::*;
    let mut r = Reader::new(code);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        let offset = r.pos() as u32;
        let byte = r.u8()?;
        let op = match byte {
            0x00 => Nop,
            0x01 => Break,
            0x02..=0x05 => LdArg((byte - 0x02) as u16),
            0x06..=0x09 => LdLoc((byte - 0x06) as u16),
            0x0A..=0x0D => StLoc((byte - 0x0A) as u16),
            0x0E => LdArg(r.u8()? as u16),
            0x0F => LdArgA(r.u8()? as u16),
            0x10 => StArg(r.u8()? as u16),
            0x11 => LdLoc(r.u8()? as u16),
            0x12 => LdLocA(r.u8()? as u16),
            0x13 => StLoc(r.u8()? as u16),
            0x14 => LdNull,
            0x15 => LdcI4(-1),
            0x16..=0x1E => LdcI4((byte - 0x16) as i32),
            0x1F => LdcI4(r.i8()? as i32),
            0x20 => LdcI4(r.i32()?),
            0x21 => LdcI8(r.i64()?),
            0x22 => LdcR4(r.f32()?),
            0x23 => LdcR8(r.f64()?),
            0x25 => Dup,
            0x26 => Pop,
            0x27 => Jmp(token(&mut r)?),
            0x28 => Call(token(&mut r)?),
            0x29 => CallI(token(&mut r)?),
            0x2A => Ret,
            0x2B => Br(short_target(&mut r)?),
            0x2C => BrFalse(short_target(&mut r)?),
            0x2D => BrTrue(short_target(&mut r)?),
            0x2E => Beq(short_target(&mut r)?),
            0x2F => Bge(short_target(&mut r)?),
            0x30 => Bgt(short_target(&mut r)?),
            0x31 => Ble(short_target(&mut r)?),
            0x32 => Blt(short_target(&mut r)?),
            0x33 => BneUn(short_target(&mut r)?),
            0x34 => BgeUn(short_target(&mut r)?),
            0x35 => BgtUn(short_target(&mut r)?),
            0x36 => BleUn(short_target(&mut r)?),
            0x37 => BltUn(short_target(&mut r)?),
            0x38 => Br(long_target(&mut r)?),
            0x39 => BrFalse(long_target(&mut r)?),
            0x3A => BrTrue(long_target(&mut r)?),
            0x3B => Beq(long_target(&mut r)?),
            0x3C => Bge(long_target(&mut r)?),
            0x3D => Bgt(long_target(&mut r)?),
            0x3E => Ble(long_target(&mut r)?),
            0x3F => Blt(long_target(&mut r)?),
            0x40 => BneUn(long_target(&mut r)?),
            0x41 => BgeUn(long_target(&mut r)?),
            0x42 => BgtUn(long_target(&mut r)?),
            0x43 => BleUn(long_target(&mut r)?),
            0x44 => BltUn(long_target(&mut r)?),
            0x45 => {
                let count = r.u32()? as usize;
                let mut rels = Vec::with_capacity(count);
                for _ in 0..count {
                    rels.push(r.i32()?);
                }
                let base = r.pos() as i64;
                let targets = rels
                    .into_iter()
                    .map(|rel| (base + rel as i64) as u32)
                    .collect();
                Switch(targets)
            }
            0x46 => LdInd(ScalarKind::I1),
            0x47 => LdInd(ScalarKind::U1),
            0x48 => LdInd(ScalarKind::I2),
            0x49 => LdInd(ScalarKind::U2),
            0x4A => LdInd(ScalarKind::I4),
            0x4B => LdInd(ScalarKind::U4),
            0x4C => LdInd(ScalarKind::I8),
            0x4D => LdInd(ScalarKind::I),
            0x4E => LdInd(ScalarKind::R4),
            0x4F => LdInd(ScalarKind::R8),
            0x50 => LdInd(ScalarKind::Ref),
            0x51 => StInd(ScalarKind::Ref),
            0x52 => StInd(ScalarKind::I1),
            0x53 => StInd(ScalarKind::I2),
            0x54 => StInd(ScalarKind::I4),
            0x55 => StInd(ScalarKind::I8),
            0x56 => StInd(ScalarKind::R4),
            0x57 => StInd(ScalarKind::R8),
            0x58 => Add,
            0x59 => Sub,
            0x5A => Mul,
            0x5B => Div,
            0x5C => DivUn,
            0x5D => Rem,
            0x5E => RemUn,
            0x5F => And,
            0x60 => Or,
            0x61 => Xor,
            0x62 => Shl,
            0x63 => Shr,
            0x64 => ShrUn,
            0x65 => Neg,
            0x66 => Not,
            0x67 => Conv(ScalarKind::I1),
            0x68 => Conv(ScalarKind::I2),
            0x69 => Conv(ScalarKind::I4),
            0x6A => Conv(ScalarKind::I8),
            0x6B => Conv(ScalarKind::R4),
            0x6C => Conv(ScalarKind::R8),
            0x6D => Conv(ScalarKind::U4),
            0x6E => Conv(ScalarKind::U8),
            0x6F => CallVirt(token(&mut r)?),
            0x70 => CpObj(token(&mut r)?),
            0x71 => LdObj(token(&mut r)?),
            0x72 => LdStr(token(&mut r)?),
            0x73 => NewObj(token(&mut r)?),
            0x74 => CastClass(token(&mut r)?),
            0x75 => IsInst(token(&mut r)?),
            0x76 => ConvRUn,
            0x79 => Unbox(token(&mut r)?),
            0x7A => Throw,
            0x7B => LdFld(token(&mut r)?),
            0x7C => LdFldA(token(&mut r)?),
            0x7D => StFld(token(&mut r)?),
            0x7E => LdSFld(token(&mut r)?),
            0x7F => LdSFldA(token(&mut r)?),
            0x80 => StSFld(token(&mut r)?),
            0x81 => StObj(token(&mut r)?),
            0x82 => ConvOvfUn(ScalarKind::I1),
            0x83 => ConvOvfUn(ScalarKind::I2),
            0x84 => ConvOvfUn(ScalarKind::I4),
            0x85 => ConvOvfUn(ScalarKind::I8),
            0x86 => ConvOvfUn(ScalarKind::U1),
            0x87 => ConvOvfUn(ScalarKind::U2),
            0x88 => ConvOvfUn(ScalarKind::U4),
            0x89 => ConvOvfUn(ScalarKind::U8),
            0x8A => ConvOvfUn(ScalarKind::I),
            0x8B => ConvOvfUn(ScalarKind::U),
            0x8C => Box(token(&mut r)?),
            0x8D => NewArr(token(&mut r)?),
            0x8E => LdLen,
            0x8F => LdElemA(token(&mut r)?),
            0x90 => LdElem(ScalarKind::I1),
            0x91 => LdElem(ScalarKind::U1),
            0x92 => LdElem(ScalarKind::I2),
            0x93 => LdElem(ScalarKind::U2),
            0x94 => LdElem(ScalarKind::I4),
            0x95 => LdElem(ScalarKind::U4),
            0x96 => LdElem(ScalarKind::I8),
            0x97 => LdElem(ScalarKind::I),
            0x98 => LdElem(ScalarKind::R4),
            0x99 => LdElem(ScalarKind::R8),
            0x9A => LdElem(ScalarKind::Ref),
            0x9B => StElem(ScalarKind::I),
            0x9C => StElem(ScalarKind::I1),
            0x9D => StElem(ScalarKind::I2),
            0x9E => StElem(ScalarKind::I4),
            0x9F => StElem(ScalarKind::I8),
            0xA0 => StElem(ScalarKind::R4),
            0xA1 => StElem(ScalarKind::R8),
            0xA2 => StElem(ScalarKind::Ref),
            0xA3 => LdElemTok(token(&mut r)?),
            0xA4 => StElemTok(token(&mut r)?),
            0xA5 => UnboxAny(token(&mut r)?),
            0xB3 => ConvOvf(ScalarKind::I1),
            0xB4 => ConvOvf(ScalarKind::U1),
            0xB5 => ConvOvf(ScalarKind::I2),
            0xB6 => ConvOvf(ScalarKind::U2),
            0xB7 => ConvOvf(ScalarKind::I4),
            0xB8 => ConvOvf(ScalarKind::U4),
            0xB9 => ConvOvf(ScalarKind::I8),
            0xBA => ConvOvf(ScalarKind::U8),
            0xC2 => RefAnyVal(token(&mut r)?),
            0xC3 => CkFinite,
            0xC6 => MkRefAny(token(&mut r)?),
            0xD0 => LdToken(token(&mut r)?),
            0xD1 => Conv(ScalarKind::U2),
            0xD2 => Conv(ScalarKind::U1),
            0xD3 => Conv(ScalarKind::I),
            0xD4 => ConvOvf(ScalarKind::I),
            0xD5 => ConvOvf(ScalarKind::U),
            0xD6 => AddOvf,
            0xD7 => AddOvfUn,
            0xD8 => MulOvf,
            0xD9 => MulOvfUn,
            0xDA => SubOvf,
            0xDB => SubOvfUn,
            0xDC => EndFinally,
            0xDD => Leave(long_target(&mut r)?),
            0xDE => Leave(short_target(&mut r)?),
            0xDF => StInd(ScalarKind::I),
            0xE0 => Conv(ScalarKind::U),
            0xFE => {
                let second = r.u8()?;
                match second {
                    0x00 => ArgList,
                    0x01 => Ceq,
                    0x02 => Cgt,
                    0x03 => CgtUn,
                    0x04 => Clt,
                    0x05 => CltUn,
                    0x06 => LdFtn(token(&mut r)?),
                    0x07 => LdVirtFtn(token(&mut r)?),
                    0x09 => LdArg(r.u16()?),
                    0x0A => LdArgA(r.u16()?),
                    0x0B => StArg(r.u16()?),
                    0x0C => LdLoc(r.u16()?),
                    0x0D => LdLocA(r.u16()?),
                    0x0E => StLoc(r.u16()?),
                    0x0F => LocAlloc,
                    0x11 => EndFilter,
                    0x12 => Unaligned(r.u8()?),
                    0x13 => Volatile,
                    0x14 => Tail,
                    0x15 => InitObj(token(&mut r)?),
                    0x16 => Constrained(token(&mut r)?),
                    0x17 => CpBlk,
                    0x18 => InitBlk,
                    0x19 => NoCheck(r.u8()?),
                    0x1A => Rethrow,
                    0x1C => SizeOf(token(&mut r)?),
                    0x1D => RefAnyType,
                    other => {
                        return Err(MetadataError::unsupported(format!(
                            "opcode 0xFE {other:#04x} at offset {offset}"
                        )));
                    }
                }
            }
            other => {
                return Err(MetadataError::unsupported(format!(
                    "opcode {other:#04x} at offset {offset}"
                )));
            }
        };
        out.push(IlInstruction { offset, op });
    }
    Ok(out)
}

fn token(r: &mut Reader<'_>) -> Result<MetadataToken> {
    Ok(MetadataToken(r.u32()?))
}

fn short_target(r: &mut Reader<'_>) -> Result<u32> {
    let rel = r.i8()? as i64;
    Ok((r.pos() as i64 + rel) as u32)
}

fn long_target(r: &mut Reader<'_>) -> Result<u32> {
    let rel = r.i32()? as i64;
    Ok((r.pos() as i64 + rel) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_tiny_add_body() {
        // ldarg.1; ldarg.2; add; ret -- 4 bytes, tiny header (4 << 2) | 0x2.
        let body = MethodBody::parse(&[0x12, 0x03, 0x04, 0x58, 0x2A]).unwrap();
        assert_eq!(body.max_stack, 8);
        let ops: Vec<&IlOp> = body.instructions.iter().map(|i| &i.op).collect();
        assert_eq!(
            ops,
            vec![&IlOp::LdArg(1), &IlOp::LdArg(2), &IlOp::Add, &IlOp::Ret]
        );
    }

    #[test]
    fn short_branch_targets_become_absolute() {
        // 0: br.s +2 (to 4); 2: ldc.i4.0; 3: ret; 4: ldc.i4.1; 5: ret
        let code = [0x2B, 0x02, 0x16, 0x2A, 0x17, 0x2A];
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[0].op, IlOp::Br(4));
        assert_eq!(instrs[0].offset, 0);
        assert_eq!(instrs[3].offset, 4);
    }

    #[test]
    fn switch_targets_are_relative_to_instruction_end() {
        // switch with two targets, both +1 past the 13-byte instruction.
        let mut code = vec![0x45];
        code.extend_from_slice(&2u32.to_le_bytes());
        code.extend_from_slice(&1i32.to_le_bytes());
        code.extend_from_slice(&2i32.to_le_bytes());
        code.extend_from_slice(&[0x00, 0x00, 0x2A]); // nop; nop; ret
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[0].op, IlOp::Switch(vec![14, 15]));
    }

    #[test]
    fn normalizes_wide_variable_forms() {
        // FE 0C 05 00 = ldloc 5
        let instrs = decode(&[0xFE, 0x0C, 0x05, 0x00]).unwrap();
        assert_eq!(instrs[0].op, IlOp::LdLoc(5));
    }

    #[test]
    fn fat_body_with_finally_clause() {
        let mut body = Vec::new();
        // Fat header: flags = fat | more sections | init locals, size 3 dwords.
        let flags: u16 = 0x3 | FAT_FLAG_MORE_SECTIONS | FAT_FLAG_INIT_LOCALS;
        let header = flags | (3 << 12);
        body.extend_from_slice(&header.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes()); // max stack
        body.extend_from_slice(&4u32.to_le_bytes()); // code size
        body.extend_from_slice(&0u32.to_le_bytes()); // no locals token
        body.extend_from_slice(&[0x00, 0x2A, 0xDC, 0x2A]); // nop; ret; endfinally; ret
        // Small EH section: kind 0x01, size 16, reserved, one clause.
        body.push(SECTION_EH_TABLE);
        body.push(16);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0x2u16.to_le_bytes()); // finally
        body.extend_from_slice(&0u16.to_le_bytes()); // try offset
        body.push(2); // try length
        body.extend_from_slice(&2u16.to_le_bytes()); // handler offset
        body.push(1); // handler length
        body.extend_from_slice(&0u32.to_le_bytes());
        let parsed = MethodBody::parse(&body).unwrap();
        assert!(parsed.init_locals);
        assert_eq!(parsed.exception_regions.len(), 1);
        assert_eq!(parsed.exception_regions[0].kind, HandlerKind::Finally);
        assert_eq!(parsed.exception_regions[0].handler_offset, 2);
    }
}
