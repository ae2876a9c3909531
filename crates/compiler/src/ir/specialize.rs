//! Pass 6: specialization fixpoint.
//!
//! Instantiated generics were lowered with their bindings in pass 4; what
//! remains here is the fixpoint over methods discovered *during* lowering
//! (a substituted body can name an instantiation reachability never saw),
//! plus the clr-internal classification for methods whose representation
//! lives only inside the source runtime.

use cil2cpp_metadata::signatures;
use cil2cpp_metadata::tables::TableId;
use tracing::debug;

use crate::runtime::is_clr_internal;
use crate::world::MethodRefInfo;

use super::builder::IrBuilder;
use super::{MethodId, MethodSource, StubReason};

pub fn run(b: &mut IrBuilder<'_, '_>) {
    let mut rounds = 0usize;
    loop {
        // Denylist classification first: anything touching a clr-internal
        // type is stubbed before we try to complete it.
        classify_internal(b);

        let pending = std::mem::take(&mut b.pending);
        if pending.is_empty() {
            break;
        }
        rounds += 1;
        debug!(round = rounds, discovered = pending.len(), "specialization round");
        for id in pending {
            complete_method(b, id);
        }
    }
    classify_internal(b);
}

fn classify_internal(b: &mut IrBuilder<'_, '_>) {
    for index in 0..b.module.methods.len() {
        let id = MethodId(index as u32);
        let hit = {
            let m = b.module.method(id);
            if m.stub_reason.is_some() {
                None
            } else {
                let mut hit = None;
                let declaring = &b.module.ty(m.declaring).name;
                if is_clr_internal(declaring) {
                    hit = Some(declaring.clone());
                }
                for p in &m.params {
                    let name = &b.module.ty(p.ty).name;
                    if hit.is_none() && is_clr_internal(name) {
                        hit = Some(name.clone());
                    }
                }
                let ret = &b.module.ty(m.return_type).name;
                if hit.is_none() && is_clr_internal(ret) {
                    hit = Some(ret.clone());
                }
                hit
            }
        };
        if let Some(name) = hit {
            b.stub(id, StubReason::ClrInternalType(name));
        }
    }
}

/// Try to locate and lower a method shell created during pass 4.
fn complete_method(b: &mut IrBuilder<'_, '_>, id: MethodId) {
    {
        let m = b.module.method(id);
        if m.stub_reason.is_some()
            || !m.blocks.is_empty()
            || m.is_declared_only()
            || m.source.is_some()
        {
            return;
        }
        if m.is_open_generic() {
            // Open generics never reach emission; pass 8 reports them.
            return;
        }
    }

    if let Some((assembly, rid)) = locate_definition(b, id) {
        b.module.method_mut(id).source = Some(MethodSource {
            assembly,
            method_def: rid,
        });
        if let Some(cfg) = super::cfg::build_for(b, id) {
            super::lower::lower_method(b, id, &cfg);
        }
    }
}

fn locate_definition(b: &mut IrBuilder<'_, '_>, id: MethodId) -> Option<(usize, u32)> {
    let (declaring_name, name, method_args, key) = {
        let m = b.module.method(id);
        let margs: Vec<String> = m
            .generic_args
            .iter()
            .map(|t| b.module.ty(*t).name.clone())
            .collect();
        (
            b.module.ty(m.declaring).name.clone(),
            m.name.clone(),
            margs,
            b.module.method_key_string(id),
        )
    };
    let handle = b.world.find_type(&declaring_name)?;
    let asm = b.world.set.assembly(handle.assembly);
    let tables = asm.file.tables();
    let row = tables.type_def.get(handle.rid as usize - 1)?;
    let method_end = tables.list_end(
        TableId::TypeDef,
        handle.rid,
        |t, r| t.type_def[r as usize - 1].method_list,
        TableId::MethodDef,
    );
    for m in row.method_list..method_end {
        let method = tables.method_def.get(m as usize - 1)?;
        let Ok(candidate_name) = asm.file.strings().get(method.name) else {
            continue;
        };
        if candidate_name != name {
            continue;
        }
        let Ok(blob) = asm.file.blobs().get(method.signature) else {
            continue;
        };
        let Ok(sig) = signatures::parse_method_sig(blob) else {
            continue;
        };
        let info = MethodRefInfo {
            declaring: declaring_name.clone(),
            name: name.clone(),
            sig,
            sig_assembly: handle.assembly,
            method_args: method_args.clone(),
        };
        if let Ok(candidate_key) = b.world.method_key(&info) {
            if candidate_key == key {
                return Some((handle.assembly, m));
            }
        }
    }
    None
}
