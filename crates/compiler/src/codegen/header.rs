//! Header emission (one per module).
//!
//! Declarations only: forward declarations for every reachable type, then
//! aliases, then struct bodies in dependency order (a struct can only
//! embed a type whose body already appeared), then extern declarations for
//! TypeInfos, v-tables, the string pool, array-init blobs, static-field
//! roots, runtime functions and every emitted method. Types that are only
//! forward-declared land in `header_forward_declared` so the unknown-type
//! gate can refuse value uses of them.

use std::fmt::Write as _;

use crate::error::Result;
use crate::ir::{MethodFlags, MethodId, TypeId, TypeKind};
use crate::runtime;

use super::{CodeUnit, CppGen, TypeEmission};

pub fn emit(g: &mut CppGen<'_>) -> Result<CodeUnit> {
    let mut out = String::with_capacity(64 * 1024);
    let module_name = &g.module.name;
    let _ = writeln!(out, "// Generated by cil2cpp from {module_name}. Do not edit.");
    let _ = writeln!(out, "#pragma once");
    let _ = writeln!(out);
    let _ = writeln!(out, "#include <cstdint>");
    let _ = writeln!(out, "#include <cstddef>");
    let _ = writeln!(out, "#include <cstring>");
    let _ = writeln!(out, "#include \"cil2cpp_runtime.h\"");
    let _ = writeln!(out);

    let order: Vec<TypeId> = g.module.types_by_name.values().copied().collect();

    // Forward declarations first; cyclic type graphs depend on it.
    let _ = writeln!(out, "// Forward declarations");
    for id in &order {
        match g.type_emission(*id) {
            TypeEmission::Struct | TypeEmission::ForwardOnly => {
                let _ = writeln!(out, "struct {};", g.type_ident(*id));
            }
            _ => {}
        }
    }
    let _ = writeln!(out);

    // Aliases: runtime-provided types, interfaces, arrays, enums.
    let _ = writeln!(out, "// Runtime-provided and storage aliases");
    for id in &order {
        if g.type_emission(*id) != TypeEmission::Alias {
            continue;
        }
        let ty = g.module.ty(*id);
        let target = match &ty.kind {
            TypeKind::Array { .. } => "c2c_array".to_string(),
            TypeKind::Interface => "c2c_object".to_string(),
            TypeKind::Enum(under) => g.cpp_type(*under),
            _ => runtime::runtime_alias(&ty.name)
                .map(|r| r.alias.to_string())
                .unwrap_or_else(|| "c2c_object".to_string()),
        };
        let _ = writeln!(out, "using {} = {};", g.type_ident(*id), target);
    }
    let _ = writeln!(out);

    // Struct bodies in embed-dependency order.
    let _ = writeln!(out, "// Type layouts");
    let mut emitted = vec![false; g.module.types.len()];
    for id in &order {
        emit_struct(g, &mut out, *id, &mut emitted);
    }
    let _ = writeln!(out);

    // TypeInfo and v-table externs.
    let _ = writeln!(out, "// Type metadata");
    for id in &order {
        if g.needs_typeinfo(*id) {
            let _ = writeln!(out, "extern const c2c_typeinfo {};", g.typeinfo_ident(*id));
        }
    }
    for id in &order {
        let ty = g.module.ty(*id);
        if !ty.vtable.is_empty() && !g.type_ident(*id).is_empty() {
            let _ = writeln!(
                out,
                "extern void* const {}[{}];",
                g.vtable_ident(*id),
                ty.vtable.len()
            );
        }
    }
    let _ = writeln!(out);

    // String pool and array-init blobs.
    if !g.module.strings.is_empty() {
        let _ = writeln!(out, "// String-literal pool");
        for lit in &g.module.strings {
            let _ = writeln!(out, "extern c2c_string* {};", lit.symbol);
        }
        let _ = writeln!(out, "void {}_strings_init();", module_prefix(g));
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "void {}_register_roots();", module_prefix(g));
    let _ = writeln!(out);
    if !g.module.blobs.is_empty() {
        let _ = writeln!(out, "// Array-initializer data");
        for blob in &g.module.blobs {
            let _ = writeln!(
                out,
                "extern const uint8_t {}[{}];",
                blob.symbol,
                blob.bytes.len()
            );
        }
        let _ = writeln!(out);
    }

    // Static fields. Reference-typed ones are GC roots, registered by the
    // data file at startup.
    let mut any_static = false;
    for field in &g.module.fields {
        if field.is_static && !field.is_literal && !g.static_ident(field.id).is_empty() {
            if !any_static {
                let _ = writeln!(out, "// Static fields");
                any_static = true;
            }
            let _ = writeln!(
                out,
                "extern {} {};",
                g.cpp_type(field.ty),
                g.static_ident(field.id)
            );
        }
    }
    if any_static {
        let _ = writeln!(out);
    }

    // Static-constructor shims.
    let mut any_cctor = false;
    for id in &order {
        let ty = g.module.ty(*id);
        if ty.cctor.is_some() && !g.type_ident(*id).is_empty() {
            if !any_cctor {
                let _ = writeln!(out, "// Static-constructor shims");
                any_cctor = true;
            }
            let ident = g.ensure_cctor_ident(*id);
            let _ = writeln!(out, "void {ident}();");
            g.declare(&ident, 0);
        }
    }
    if any_cctor {
        let _ = writeln!(out);
    }

    // Runtime surface.
    let _ = writeln!(out, "// Runtime functions");
    for decl in runtime::RUNTIME_DECLARATIONS.iter() {
        if let Some(category) = decl.category {
            let _ = writeln!(out, "{category}");
        }
        let _ = writeln!(out, "{}", decl.decl);
    }
    let _ = writeln!(out);

    // Method declarations: every emitted, non-declared-only method.
    let _ = writeln!(out, "// Methods");
    let mut ids: Vec<MethodId> = (0..g.module.methods.len())
        .map(|i| MethodId(i as u32))
        .collect();
    ids.sort_by_key(|id| g.method_symbol(*id).to_string());
    for id in ids {
        if !g.is_emitted(id) {
            continue;
        }
        let m = g.module.method(id);
        if m.icall.is_some() || m.flags.contains(MethodFlags::RUNTIME) {
            continue; // declared through the runtime surface
        }
        if m.flags.contains(MethodFlags::ABSTRACT) {
            continue;
        }
        if m.flags.contains(MethodFlags::PINVOKE) {
            // Trampoline declaration; the wrapper body lives in the data
            // file next to the extern native declaration.
            let (sig, arity) = g.fn_signature(id);
            let _ = writeln!(out, "{sig};");
            let symbol = g.method_symbol(id).to_string();
            g.declare(&symbol, arity);
            continue;
        }
        let (sig, arity) = g.fn_signature(id);
        let _ = writeln!(out, "{sig};");
        let symbol = g.method_symbol(id).to_string();
        g.declare(&symbol, arity);
    }

    Ok(CodeUnit {
        file_name: format!("{}.h", g.module.name),
        text: out,
    })
}

pub fn module_prefix(g: &CppGen<'_>) -> String {
    crate::names::mangle(&g.module.name)
}

/// Emit a struct body, its base and by-value field types first.
fn emit_struct(g: &CppGen<'_>, out: &mut String, id: TypeId, emitted: &mut Vec<bool>) {
    if emitted[id.0 as usize] || g.type_emission(id) != TypeEmission::Struct {
        return;
    }
    emitted[id.0 as usize] = true;

    let ty = g.module.ty(id);
    if let Some(base) = ty.base {
        emit_struct(g, out, base, emitted);
    }
    for f in &ty.fields {
        let field = g.module.field(*f);
        if !field.is_static && g.module.ty(field.ty).is_value_like() {
            emit_struct(g, out, field.ty, emitted);
        }
    }

    let is_value = ty.is_value_like();
    let _ = writeln!(out, "struct {} {{", g.type_ident(id));
    if !is_value {
        match ty.base {
            Some(base) if g.is_defined(base) => {
                let base_name = match g.type_emission(base) {
                    TypeEmission::Struct | TypeEmission::Alias => g.type_ident(base).to_string(),
                    _ => "c2c_object".to_string(),
                };
                let _ = writeln!(out, "    {base_name} __base;");
            }
            _ => {
                let _ = writeln!(out, "    c2c_object __base;");
            }
        }
    }
    let mut instance_fields = 0usize;
    for f in &ty.fields {
        let field = g.module.field(*f);
        if field.is_static {
            continue;
        }
        instance_fields += 1;
        let _ = writeln!(
            out,
            "    {} {};",
            g.cpp_type(field.ty),
            g.field_member(*f)
        );
    }
    if instance_fields == 0 {
        if let Some(size) = ty.explicit_size {
            // Opaque explicit-size blobs (array-initializer carriers).
            let _ = writeln!(out, "    uint8_t __data[{size}];");
        }
    }
    let _ = writeln!(out, "}};");
}
