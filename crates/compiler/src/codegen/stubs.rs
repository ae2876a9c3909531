//! Stub-file emission.
//!
//! One translation unit holding a body for every method the gates (or the
//! IR passes) declined to render. Each stub traps with its method name and
//! classified root cause, so a stubbed path failing at run time names the
//! exact maintenance item instead of crashing opaquely.

use std::fmt::Write as _;

use crate::error::Result;
use crate::ir::MethodId;

use super::{CodeUnit, CppGen};

pub fn emit(g: &mut CppGen<'_>) -> Result<CodeUnit> {
    let mut out = String::with_capacity(16 * 1024);
    let _ = writeln!(
        out,
        "// Generated by cil2cpp from {}. Stub bodies for un-lowerable methods.",
        g.module.name
    );
    let _ = writeln!(out, "#include \"{}.h\"", g.module.name);
    let _ = writeln!(out);

    // Stable order: record order follows emission order, which follows
    // method-symbol order.
    let records: Vec<(MethodId, String, String, String)> = g
        .stub_records()
        .iter()
        .map(|r| {
            (
                r.method,
                r.symbol.clone(),
                r.method_key.clone(),
                format!("{}: {}", r.reason.category(), r.reason.detail()),
            )
        })
        .collect();

    let mut seen = std::collections::BTreeSet::new();
    for (id, symbol, key, reason) in records {
        if symbol.is_empty() || !seen.insert(symbol.clone()) {
            continue;
        }
        let (sig, _) = g.fn_signature(id);
        let _ = writeln!(out, "{sig} {{");
        let _ = writeln!(
            out,
            "    c2c_stub_trap(\"{}\", \"{}\");",
            key.replace('"', "\\\""),
            reason.replace('"', "\\\"")
        );
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);
    }

    Ok(CodeUnit {
        file_name: format!("{}_stubs.cpp", g.module.name),
        text: out,
    })
}
