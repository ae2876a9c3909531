//! Pass 3: control-flow graphs.
//!
//! Decodes each lowerable method's IL into basic blocks. Block leaders are
//! the entry, every branch target, every instruction after a terminator,
//! and the starts of try regions, handlers and filter expressions. The
//! decoded block bodies keep their IL form here; pass 4 translates them.

use cil2cpp_metadata::il::{HandlerKind, IlInstruction, IlOp, MethodBody};
use fxhash::FxHashMap;

use super::builder::IrBuilder;
use super::{MethodFlags, MethodId};

/// One undigested basic block: IL instructions, leader offset, and the
/// offset of the instruction after the block (for region mapping).
#[derive(Debug, Clone)]
pub struct CfgBlock {
    pub start: u32,
    pub il: Vec<IlInstruction>,
}

/// A protected region in offset form; pass 4 rewrites it to block ids.
#[derive(Debug, Clone)]
pub struct CfgRegion {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

#[derive(Debug, Default, Clone)]
pub struct MethodCfg {
    pub blocks: Vec<CfgBlock>,
    pub regions: Vec<CfgRegion>,
    pub max_stack: u16,
    pub locals_token: Option<cil2cpp_metadata::MetadataToken>,
    /// Block index by leader offset.
    pub block_at: FxHashMap<u32, usize>,
}

/// Build CFGs for every method that has IL to lower. Indexed by MethodId.
pub fn run(b: &mut IrBuilder<'_, '_>) -> Vec<Option<MethodCfg>> {
    let mut cfgs: Vec<Option<MethodCfg>> = vec![None; b.module.methods.len()];
    for id in 0..b.module.methods.len() {
        cfgs[id] = build_for(b, MethodId(id as u32));
    }
    cfgs
}

/// CFG for one method, or `None` when it has nothing to lower.
pub fn build_for(b: &mut IrBuilder<'_, '_>, mid: MethodId) -> Option<MethodCfg> {
    let method = b.module.method(mid);
    if method.flags.intersects(
        MethodFlags::ABSTRACT
            | MethodFlags::INTERNAL_CALL
            | MethodFlags::PINVOKE
            | MethodFlags::RUNTIME,
    ) || method.icall.is_some()
        || method.stub_reason.is_some()
        || !method.blocks.is_empty()
    {
        return None;
    }
    let source = method.source?;
    let asm = b.world.set.assembly(source.assembly);
    let row = asm
        .file
        .tables()
        .method_def
        .get(source.method_def as usize - 1)?;
    if row.rva == 0 {
        return None;
    }
    match asm.file.method_body(row.rva) {
        Ok(body) => Some(split_blocks(&body)),
        Err(e) => {
            let key = b.module.method_key_string(mid);
            b.diag(&key, format!("undecodable body: {e}"));
            None
        }
    }
}

fn split_blocks(body: &MethodBody) -> MethodCfg {
    let mut leaders: Vec<u32> = vec![0];
    for (i, instr) in body.instructions.iter().enumerate() {
        match &instr.op {
            IlOp::Br(t)
            | IlOp::BrTrue(t)
            | IlOp::BrFalse(t)
            | IlOp::Beq(t)
            | IlOp::Bge(t)
            | IlOp::Bgt(t)
            | IlOp::Ble(t)
            | IlOp::Blt(t)
            | IlOp::BneUn(t)
            | IlOp::BgeUn(t)
            | IlOp::BgtUn(t)
            | IlOp::BleUn(t)
            | IlOp::BltUn(t)
            | IlOp::Leave(t) => {
                leaders.push(*t);
                push_next_offset(&mut leaders, body, i);
            }
            IlOp::Switch(targets) => {
                leaders.extend_from_slice(targets);
                push_next_offset(&mut leaders, body, i);
            }
            IlOp::Ret | IlOp::Throw | IlOp::Rethrow | IlOp::EndFinally | IlOp::EndFilter => {
                push_next_offset(&mut leaders, body, i);
            }
            _ => {}
        }
    }
    for region in &body.exception_regions {
        leaders.push(region.try_offset);
        leaders.push(region.try_offset + region.try_length);
        leaders.push(region.handler_offset);
        leaders.push(region.handler_offset + region.handler_length);
        if let HandlerKind::Filter(filter_offset) = region.kind {
            leaders.push(filter_offset);
        }
    }
    leaders.sort_unstable();
    leaders.dedup();

    let mut blocks: Vec<CfgBlock> = Vec::with_capacity(leaders.len());
    let mut block_at = FxHashMap::default();
    let mut current: Option<CfgBlock> = None;
    let mut leader_idx = 0usize;
    for instr in &body.instructions {
        while leader_idx < leaders.len() && leaders[leader_idx] <= instr.offset {
            if leaders[leader_idx] == instr.offset {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                block_at.insert(instr.offset, blocks.len());
                current = Some(CfgBlock {
                    start: instr.offset,
                    il: Vec::new(),
                });
            }
            leader_idx += 1;
        }
        if current.is_none() {
            // First instruction is always a leader; anything else here is
            // dead padding after a terminator.
            block_at.insert(instr.offset, blocks.len());
            current = Some(CfgBlock {
                start: instr.offset,
                il: Vec::new(),
            });
        }
        current.as_mut().unwrap().il.push(instr.clone());
    }
    if let Some(block) = current.take() {
        blocks.push(block);
    }

    let regions = body
        .exception_regions
        .iter()
        .map(|r| CfgRegion {
            kind: r.kind.clone(),
            try_start: r.try_offset,
            try_end: r.try_offset + r.try_length,
            handler_start: r.handler_offset,
            handler_end: r.handler_offset + r.handler_length,
        })
        .collect();

    MethodCfg {
        blocks,
        regions,
        max_stack: body.max_stack,
        locals_token: body.locals_token,
        block_at,
    }
}

fn push_next_offset(leaders: &mut Vec<u32>, body: &MethodBody, index: usize) {
    if let Some(next) = body.instructions.get(index + 1) {
        leaders.push(next.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cil2cpp_metadata::il::decode;

    fn cfg_of(code: &[u8]) -> MethodCfg {
        let body = MethodBody {
            max_stack: 8,
            init_locals: false,
            locals_token: None,
            instructions: decode(code).unwrap(),
            exception_regions: Vec::new(),
        };
        split_blocks(&body)
    }

    #[test]
    fn straight_line_code_is_one_block() {
        // ldc.i4.1; ldc.i4.2; add; ret
        let cfg = cfg_of(&[0x17, 0x18, 0x58, 0x2A]);
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].il.len(), 4);
    }

    #[test]
    fn branches_split_blocks_at_targets_and_fallthrough() {
        // 0: ldc.i4.0; 1: brtrue.s +1 (to 4); 3: ret; 4: ret
        let cfg = cfg_of(&[0x16, 0x2D, 0x01, 0x2A, 0x2A]);
        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.blocks[0].start, 0);
        assert_eq!(cfg.blocks[1].start, 3);
        assert_eq!(cfg.blocks[2].start, 4);
        assert_eq!(cfg.block_at[&4], 2);
    }
}
