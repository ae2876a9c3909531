//! Data-file emission.
//!
//! One translation unit holding every TypeInfo definition, every v-table
//! and per-interface table, the static-field storage (GC roots registered
//! at startup), the string-literal pool with its module initializer, every
//! array-init blob, the static-constructor shims, and the P/Invoke
//! trampolines. TypeInfo addresses are link-time constants, so everything
//! that dispatches or allocates points straight into this file.

use std::fmt::Write as _;

use crate::error::Result;
use crate::ir::{MethodFlags, MethodId, TypeId, TypeKind};

use super::header::module_prefix;
use super::{CodeUnit, CppGen};

pub fn emit(g: &mut CppGen<'_>) -> Result<CodeUnit> {
    let mut out = String::with_capacity(64 * 1024);
    let _ = writeln!(
        out,
        "// Generated by cil2cpp from {}. Type metadata and module data.",
        g.module.name
    );
    let _ = writeln!(out, "#include \"{}.h\"", g.module.name);
    let _ = writeln!(out);

    let order: Vec<TypeId> = g.module.types_by_name.values().copied().collect();

    emit_vtables(g, &order, &mut out);
    emit_interface_tables(g, &order, &mut out);
    emit_typeinfos(g, &order, &mut out);
    emit_statics(g, &mut out);
    emit_string_pool(g, &mut out);
    emit_blobs(g, &mut out);
    emit_cctor_shims(g, &order, &mut out);
    emit_pinvoke_trampolines(g, &mut out);

    Ok(CodeUnit {
        file_name: format!("{}_data.cpp", g.module.name),
        text: out,
    })
}

/// A v-table slot expression: the override's symbol, a runtime default for
/// Object's virtuals, or null for abstract slots.
fn slot_expr(g: &CppGen<'_>, method: MethodId) -> String {
    let m = g.module.method(method);
    if m.flags.contains(MethodFlags::ABSTRACT) {
        return "nullptr".to_string();
    }
    let symbol = g.method_symbol(method);
    if symbol.is_empty() {
        return "nullptr".to_string();
    }
    format!("(void*)&{symbol}")
}

fn emit_vtables(g: &CppGen<'_>, order: &[TypeId], out: &mut String) {
    let _ = writeln!(out, "// Virtual dispatch tables");
    for id in order {
        let ty = g.module.ty(*id);
        if ty.vtable.is_empty() || g.type_ident(*id).is_empty() {
            continue;
        }
        let _ = writeln!(out, "void* const {}[{}] = {{", g.vtable_ident(*id), ty.vtable.len());
        for slot in &ty.vtable {
            let _ = writeln!(out, "    {},", slot_expr(g, *slot));
        }
        let _ = writeln!(out, "}};");
    }
    let _ = writeln!(out);
}

fn iface_table_ident(g: &CppGen<'_>, ty: TypeId, iface: TypeId) -> String {
    format!("ivt_{}_{}", g.type_ident(ty), g.type_ident(iface))
}

fn emit_interface_tables(g: &CppGen<'_>, order: &[TypeId], out: &mut String) {
    let _ = writeln!(out, "// Interface dispatch tables");
    for id in order {
        let ty = g.module.ty(*id);
        if g.type_ident(*id).is_empty() {
            continue;
        }
        for table in &ty.interface_tables {
            if g.type_ident(table.interface).is_empty() {
                continue;
            }
            let ident = iface_table_ident(g, *id, table.interface);
            let _ = writeln!(out, "static void* const {ident}[{}] = {{", table.slots.len().max(1));
            if table.slots.is_empty() {
                let _ = writeln!(out, "    nullptr,");
            }
            for slot in &table.slots {
                let _ = writeln!(out, "    {},", slot_expr(g, *slot));
            }
            let _ = writeln!(out, "}};");
        }
        if !ty.interface_tables.is_empty() {
            let ident = format!("ifaces_{}", g.type_ident(*id));
            let _ = writeln!(
                out,
                "static const c2c_interface_entry {ident}[{}] = {{",
                ty.interface_tables.len()
            );
            for table in &ty.interface_tables {
                if g.type_ident(table.interface).is_empty() {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "    {{ &{}, {} }},",
                    g.typeinfo_ident(table.interface),
                    iface_table_ident(g, *id, table.interface)
                );
            }
            let _ = writeln!(out, "}};");
        }
    }
    let _ = writeln!(out);
}

fn typeinfo_flags(g: &CppGen<'_>, id: TypeId) -> String {
    let ty = g.module.ty(id);
    let mut flags: Vec<&str> = Vec::new();
    if ty.is_value_like() {
        flags.push("C2C_TF_VALUE_TYPE");
    }
    if matches!(ty.kind, TypeKind::Interface) {
        flags.push("C2C_TF_INTERFACE");
    }
    if ty.is_abstract {
        flags.push("C2C_TF_ABSTRACT");
    }
    if ty.is_sealed {
        flags.push("C2C_TF_SEALED");
    }
    if matches!(ty.kind, TypeKind::Array { .. }) {
        flags.push("C2C_TF_ARRAY");
    }
    if matches!(ty.kind, TypeKind::Primitive(_)) {
        flags.push("C2C_TF_PRIMITIVE");
    }
    if flags.is_empty() {
        "0".to_string()
    } else {
        flags.join(" | ")
    }
}

fn emit_typeinfos(g: &CppGen<'_>, order: &[TypeId], out: &mut String) {
    let _ = writeln!(out, "// TypeInfo records");

    // Field and method metadata arrays come first so the TypeInfo
    // aggregates can point at them.
    for id in order {
        if !g.needs_typeinfo(*id) {
            continue;
        }
        let ty = g.module.ty(*id);
        let ti = g.typeinfo_ident(*id);
        let instance_fields: Vec<_> = ty
            .fields
            .iter()
            .filter(|f| !g.module.field(**f).is_static)
            .collect();
        if !instance_fields.is_empty() {
            let _ = writeln!(
                out,
                "static const c2c_field_meta {ti}_fields[{}] = {{",
                instance_fields.len()
            );
            for f in &instance_fields {
                let field = g.module.field(**f);
                let _ = writeln!(
                    out,
                    "    {{ \"{}\", {} }},",
                    field.name, field.offset
                );
            }
            let _ = writeln!(out, "}};");
        }
        if !ty.methods.is_empty() {
            let _ = writeln!(
                out,
                "static const c2c_method_meta {ti}_methods[{}] = {{",
                ty.methods.len()
            );
            for m in &ty.methods {
                let method = g.module.method(*m);
                let slot = method
                    .vtable_slot
                    .map(|s| s as i32)
                    .unwrap_or(-1);
                let _ = writeln!(out, "    {{ \"{}\", {} }},", method.name, slot);
            }
            let _ = writeln!(out, "}};");
        }
    }
    let _ = writeln!(out);

    for id in order {
        if !g.needs_typeinfo(*id) {
            continue;
        }
        let ty = g.module.ty(*id);
        let ti = g.typeinfo_ident(*id);
        let base = match ty.base {
            Some(base) if g.needs_typeinfo(base) => format!("&{}", g.typeinfo_ident(base)),
            _ => "nullptr".to_string(),
        };
        let ifaces = if ty.interface_tables.is_empty() {
            ("nullptr".to_string(), 0)
        } else {
            (
                format!("ifaces_{}", g.type_ident(*id)),
                ty.interface_tables.len(),
            )
        };
        let vtable = if ty.vtable.is_empty() || g.type_ident(*id).is_empty() {
            "nullptr".to_string()
        } else {
            g.vtable_ident(*id)
        };
        let instance_field_count = ty
            .fields
            .iter()
            .filter(|f| !g.module.field(**f).is_static)
            .count();
        let fields_ref = if instance_field_count == 0 {
            "nullptr".to_string()
        } else {
            format!("{ti}_fields")
        };
        let methods_ref = if ty.methods.is_empty() {
            "nullptr".to_string()
        } else {
            format!("{ti}_methods")
        };
        let element_ti = match &ty.kind {
            TypeKind::Array { element, .. } if g.needs_typeinfo(*element) => {
                format!("&{}", g.typeinfo_ident(*element))
            }
            _ => "nullptr".to_string(),
        };
        let default_ctor = ty
            .default_ctor
            .map(|m| slot_expr(g, m))
            .unwrap_or_else(|| "nullptr".to_string());
        let finalizer = ty
            .finalizer
            .map(|m| slot_expr(g, m))
            .unwrap_or_else(|| "nullptr".to_string());

        let _ = writeln!(out, "const c2c_typeinfo {ti} = {{");
        let _ = writeln!(out, "    \"{}\",", ty.simple_name);
        let _ = writeln!(out, "    \"{}\",", ty.namespace);
        let _ = writeln!(out, "    \"{}\",", ty.name.replace('"', "\\\""));
        let _ = writeln!(out, "    {base},");
        let _ = writeln!(out, "    {}, {},", ifaces.0, ifaces.1);
        let _ = writeln!(out, "    {}, {},", ty.instance_size, ty.element_size);
        let _ = writeln!(out, "    {},", typeinfo_flags(g, *id));
        let _ = writeln!(out, "    {vtable},");
        let _ = writeln!(out, "    {fields_ref}, {instance_field_count},");
        let _ = writeln!(out, "    {methods_ref}, {},", ty.methods.len());
        let _ = writeln!(out, "    {default_ctor},");
        let _ = writeln!(out, "    {finalizer},");
        let _ = writeln!(out, "    {element_ti},");
        let _ = writeln!(out, "}};");
    }
    let _ = writeln!(out);
}

fn emit_statics(g: &CppGen<'_>, out: &mut String) {
    let _ = writeln!(out, "// Static-field storage (zero-initialized)");
    let mut roots: Vec<String> = Vec::new();
    for field in &g.module.fields {
        if !field.is_static || field.is_literal || g.static_ident(field.id).is_empty() {
            continue;
        }
        let ident = g.static_ident(field.id);
        let _ = writeln!(out, "{} {ident}{{}};", g.cpp_type(field.ty));
        let fty = g.module.ty(field.ty);
        let is_ref = !fty.is_value_like()
            && !matches!(fty.kind, TypeKind::Pointer(_) | TypeKind::ByRef(_));
        if is_ref {
            roots.push(ident.to_string());
        }
    }
    let prefix = module_prefix(g);
    let _ = writeln!(out, "void {prefix}_register_roots() {{");
    for root in &roots {
        let _ = writeln!(out, "    c2c_gc_register_root((void*)&{root});");
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
}

fn emit_string_pool(g: &CppGen<'_>, out: &mut String) {
    if g.module.strings.is_empty() {
        return;
    }
    let _ = writeln!(out, "// String-literal pool (UTF-16 code units)");
    for lit in &g.module.strings {
        let _ = write!(
            out,
            "static const char16_t {}_data[{}] = {{",
            lit.symbol,
            lit.units.len().max(1)
        );
        if lit.units.is_empty() {
            let _ = write!(out, "0");
        }
        for (i, unit) in lit.units.iter().enumerate() {
            if i % 12 == 0 {
                let _ = write!(out, "\n    ");
            }
            let _ = write!(out, "0x{unit:04x}, ");
        }
        let _ = writeln!(out, "\n}};");
        let _ = writeln!(out, "c2c_string* {} = nullptr;", lit.symbol);
    }
    let prefix = module_prefix(g);
    let _ = writeln!(out, "void {prefix}_strings_init() {{");
    for lit in &g.module.strings {
        let _ = writeln!(
            out,
            "    {} = c2c_string_intern({}_data, {});",
            lit.symbol,
            lit.symbol,
            lit.units.len()
        );
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
}

fn emit_blobs(g: &CppGen<'_>, out: &mut String) {
    if g.module.blobs.is_empty() {
        return;
    }
    let _ = writeln!(out, "// Array-initializer data");
    for blob in &g.module.blobs {
        let _ = write!(
            out,
            "alignas({}) const uint8_t {}[{}] = {{",
            blob.alignment,
            blob.symbol,
            blob.bytes.len()
        );
        for (i, byte) in blob.bytes.iter().enumerate() {
            if i % 16 == 0 {
                let _ = write!(out, "\n    ");
            }
            let _ = write!(out, "0x{byte:02x}, ");
        }
        let _ = writeln!(out, "\n}};");
    }
    let _ = writeln!(out);
}

fn emit_cctor_shims(g: &CppGen<'_>, order: &[TypeId], out: &mut String) {
    let _ = writeln!(out, "// Static-constructor shims (at-most-once, thread-safe)");
    for id in order {
        let ty = g.module.ty(*id);
        let Some(cctor) = ty.cctor else { continue };
        if g.type_ident(*id).is_empty() {
            continue;
        }
        let guard = g.cctor_guard_ident(*id);
        let ensure = g.ensure_cctor_ident(*id);
        let symbol = g.method_symbol(cctor);
        let _ = writeln!(out, "static c2c_once {guard};");
        let _ = writeln!(out, "void {ensure}() {{");
        let _ = writeln!(out, "    c2c_ensure_cctor(&{guard}, &{symbol});");
        let _ = writeln!(out, "}}");
    }
    let _ = writeln!(out);
}

fn emit_pinvoke_trampolines(g: &mut CppGen<'_>, out: &mut String) {
    let mut ids: Vec<MethodId> = (0..g.module.methods.len())
        .map(|i| MethodId(i as u32))
        .collect();
    ids.sort_by_key(|id| g.method_symbol(*id).to_string());

    let mut any = false;
    let mut seen = std::collections::BTreeSet::new();
    for id in ids {
        let m = g.module.method(id);
        if !m.flags.contains(MethodFlags::PINVOKE) || !g.is_emitted(id) {
            continue;
        }
        let entry = m.pinvoke_entry.clone().unwrap_or_else(|| m.name.clone());
        let wrapper = g.method_symbol(id).to_string();
        if !seen.insert(wrapper.clone()) {
            continue;
        }
        if !any {
            let _ = writeln!(out, "// P/Invoke trampolines");
            any = true;
        }
        let ret = g.cpp_type(m.return_type);
        let params: Vec<(String, String)> = m
            .params
            .iter()
            .map(|p| (g.cpp_type(p.ty), p.name.clone()))
            .collect();
        let param_decls: Vec<String> = params
            .iter()
            .map(|(t, n)| format!("{t} {n}"))
            .collect();
        let param_tys: Vec<String> = params.iter().map(|(t, _)| t.clone()).collect();
        let args: Vec<String> = params.iter().map(|(_, n)| n.clone()).collect();
        let _ = writeln!(
            out,
            "extern \"C\" {ret} {entry}({});",
            param_tys.join(", ")
        );
        let _ = writeln!(out, "{ret} {wrapper}({}) {{", param_decls.join(", "));
        if ret == "void" {
            let _ = writeln!(out, "    {entry}({});", args.join(", "));
            let _ = writeln!(out, "    c2c_pinvoke_capture_last_error();");
        } else {
            let _ = writeln!(out, "    {ret} __r = {entry}({});", args.join(", "));
            let _ = writeln!(out, "    c2c_pinvoke_capture_last_error();");
            let _ = writeln!(out, "    return __r;");
        }
        let _ = writeln!(out, "}}");
    }
    if any {
        let _ = writeln!(out);
    }
}
