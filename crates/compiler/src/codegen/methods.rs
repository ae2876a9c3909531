//! Method partitioning and emission.
//!
//! Bodies accumulate into a partition until its cumulative IR-instruction
//! count reaches the configured threshold, then the partition closes and
//! the next begins — the downstream C++ toolchain compiles partitions in
//! parallel, and the shared header parse amortizes over enough code per
//! translation unit. Boundaries depend only on the IR, so they are stable
//! across runs.

use std::fmt::Write as _;

use crate::error::Result;
use crate::ir::{MethodFlags, MethodId, StubReason};

use super::gates::{self, GateDecision};
use super::{body, CodeUnit, CppGen};

/// Emit all method partitions. Returns the files plus the count of bodies
/// actually rendered (stubs excluded).
pub fn emit(g: &mut CppGen<'_>) -> Result<(Vec<CodeUnit>, usize)> {
    // Emission order: method symbol order — deterministic and independent
    // of discovery order.
    let mut ids: Vec<MethodId> = (0..g.module.methods.len())
        .map(|i| MethodId(i as u32))
        .collect();
    ids.sort_by_key(|id| g.method_symbol(*id).to_string());

    // Call graph first, one edge per IR call instruction — including the
    // bodies the gates are about to reject, so cascade tracing sees
    // through stubs.
    for id in &ids {
        collect_call_edges(g, *id);
    }

    let mut files = Vec::new();
    let mut current = String::new();
    let mut current_weight = 0usize;
    let mut rendered = 0usize;
    let threshold = g.options.partition_instruction_budget;

    for id in ids {
        if !g.is_emitted(id) {
            continue;
        }
        let m = g.module.method(id);
        if m.is_declared_only() || m.flags.contains(MethodFlags::ABSTRACT) {
            continue;
        }
        let weight = m.instruction_count.max(1);

        match gates::check(g, id) {
            GateDecision::Stub(reason) => {
                // Definition lives in the stub file; record and move on.
                g.record_stub(id, reason);
                continue;
            }
            GateDecision::Render => {}
        }

        match body::render_method(g, id) {
            Ok(text) => {
                if current_weight + weight > threshold && !current.is_empty() {
                    files.push(close_partition(g, files.len(), std::mem::take(&mut current)));
                    current_weight = 0;
                }
                current.push_str(&text);
                current.push('\n');
                current_weight += weight;
                rendered += 1;
            }
            Err(detail) => {
                g.record_stub(id, StubReason::RenderedBodyError(detail));
            }
        }
    }
    if !current.is_empty() {
        files.push(close_partition(g, files.len(), current));
    }
    if files.is_empty() {
        // Always at least one partition so the manifest has a stable shape.
        files.push(close_partition(g, 0, String::new()));
    }
    Ok((files, rendered))
}

fn collect_call_edges(g: &mut CppGen<'_>, id: MethodId) {
    use crate::ir::InstrKind;
    let caller = g.method_symbol(id).to_string();
    if caller.is_empty() {
        return;
    }
    let mut callees = Vec::new();
    for block in &g.module.method(id).blocks {
        for instr in &block.instrs {
            match &instr.kind {
                InstrKind::Call { callee, .. }
                | InstrKind::NewObject { ctor: callee, .. }
                | InstrKind::LoadFunction(callee) => {
                    let symbol = g.method_symbol(*callee);
                    if !symbol.is_empty() {
                        callees.push(symbol.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    for callee in callees {
        g.add_call_edge(&caller, &callee);
    }
}

fn close_partition(g: &CppGen<'_>, index: usize, text: String) -> CodeUnit {
    let mut out = String::with_capacity(text.len() + 256);
    let _ = writeln!(
        out,
        "// Generated by cil2cpp from {}. Method partition {index}.",
        g.module.name
    );
    let _ = writeln!(out, "#include \"{}.h\"", g.module.name);
    let _ = writeln!(out);
    out.push_str(&text);
    CodeUnit {
        file_name: format!("{}_methods_{index}.cpp", g.module.name),
        text: out,
    }
}
