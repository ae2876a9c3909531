//! The four stub gates (the totality guarantee).
//!
//! Every method that reaches emission passes through these in order; the
//! first rejection wins and the method gets a classified stub body instead
//! of a rendered one. The gates return decisions as data — no gate ever
//! errors — which is what keeps the emitter a total function.
//!
//! Order matters: each gate presumes the earlier ones passed. A method
//! whose parameter type is CLR-internal is `ClrInternalType`, not
//! `UnknownParameterTypes`, even though both would fire.

use crate::ir::{InstrKind, IrMethod, MethodId, StubReason, TypeId, TypeKind};
use crate::runtime;

use super::{CppGen, TypeEmission};

/// Outcome of gating one method.
pub enum GateDecision {
    Render,
    Stub(StubReason),
}

pub fn check(g: &CppGen<'_>, id: MethodId) -> GateDecision {
    let method = g.module.method(id);

    // IR-level stubs (pass 6 and pass 8) carry their reason through.
    if let Some(reason) = &method.stub_reason {
        return GateDecision::Stub(reason.clone());
    }

    // Gate 1: CLR-internal types in the signature or body.
    if let Some(name) = internal_type_hit(g, method) {
        return GateDecision::Stub(StubReason::ClrInternalType(name));
    }

    // Gate 2: unknown types. Signature types and value locals must have
    // full definitions; pointer-shaped locals may be merely forward-
    // declared.
    if let Some(name) = unknown_signature_type(g, method) {
        return GateDecision::Stub(StubReason::UnknownParameterTypes(name));
    }
    if let Some(name) = unknown_local_type(g, method) {
        return GateDecision::Stub(StubReason::UnknownBodyReferences(name));
    }
    if let Some(name) = opaque_member_access(g, method) {
        return GateDecision::Stub(StubReason::UnknownBodyReferences(name));
    }

    // Gate 3: named patterns known to render invalid C++.
    let declaring = &g.module.ty(method.declaring).name;
    if let Some(label) = runtime::broken_pattern(declaring, &method.name) {
        return GateDecision::Stub(StubReason::KnownBrokenPattern(label.to_string()));
    }

    // Gate 4: every callee must be declared, with a declared arity.
    if let Some(detail) = undeclared_callee(g, method) {
        return GateDecision::Stub(StubReason::UndeclaredFunction(detail));
    }

    GateDecision::Render
}

fn internal_type_hit(g: &CppGen<'_>, method: &IrMethod) -> Option<String> {
    let check = |ty: TypeId| -> Option<String> {
        let name = &g.module.ty(ty).name;
        runtime::is_clr_internal(name).then(|| name.clone())
    };
    if let Some(hit) = check(method.declaring) {
        return Some(hit);
    }
    for p in &method.params {
        if let Some(hit) = check(p.ty) {
            return Some(hit);
        }
    }
    if let Some(hit) = check(method.return_type) {
        return Some(hit);
    }
    for local in &method.locals {
        if let Some(hit) = check(local.ty) {
            return Some(hit);
        }
    }
    for block in &method.blocks {
        for instr in &block.instrs {
            if let Some(ty) = instr_type_ref(&instr.kind) {
                if let Some(hit) = check(ty) {
                    return Some(hit);
                }
            }
        }
    }
    None
}

fn instr_type_ref(kind: &InstrKind) -> Option<TypeId> {
    match kind {
        InstrKind::NewArray { element, .. } => Some(*element),
        InstrKind::Box { ty, .. }
        | InstrKind::UnboxPtr { ty, .. }
        | InstrKind::UnboxValue { ty, .. }
        | InstrKind::IsInstance { ty, .. }
        | InstrKind::Cast { ty, .. }
        | InstrKind::InitValue { ty, .. }
        | InstrKind::CopyValue { ty, .. }
        | InstrKind::MakeTypedRef { ty, .. }
        | InstrKind::TypedRefValue { ty, .. } => Some(*ty),
        InstrKind::LoadTypeHandle(ty) | InstrKind::SizeOf(ty) => Some(*ty),
        _ => None,
    }
}

/// Is a type usable by value in emitted code?
fn value_usable(g: &CppGen<'_>, ty: TypeId) -> bool {
    match g.type_emission(ty) {
        TypeEmission::Struct | TypeEmission::Alias | TypeEmission::Primitive => true,
        TypeEmission::Inline => true, // pointers and byrefs render inline
        TypeEmission::ForwardOnly | TypeEmission::Skipped => false,
    }
}

/// Pointer-shaped uses only need a forward declaration.
fn pointer_usable(g: &CppGen<'_>, ty: TypeId) -> bool {
    let t = g.module.ty(ty);
    match &t.kind {
        TypeKind::Class | TypeKind::Interface | TypeKind::Delegate | TypeKind::Array { .. } => {
            // Rendered as `X*`; a forward declaration suffices.
            !matches!(g.type_emission(ty), TypeEmission::Skipped)
        }
        TypeKind::Pointer(inner) | TypeKind::ByRef(inner) => pointer_usable(g, *inner) || value_usable(g, *inner),
        _ => value_usable(g, ty),
    }
}

fn unknown_signature_type(g: &CppGen<'_>, method: &IrMethod) -> Option<String> {
    let check = |ty: TypeId| -> Option<String> {
        if pointer_usable(g, ty) {
            None
        } else {
            Some(g.module.ty(ty).name.clone())
        }
    };
    for p in &method.params {
        if let Some(hit) = check(p.ty) {
            return Some(hit);
        }
    }
    check(method.return_type)
}

fn unknown_local_type(g: &CppGen<'_>, method: &IrMethod) -> Option<String> {
    for local in &method.locals {
        let t = g.module.ty(local.ty);
        let ok = match &t.kind {
            // Value locals need the full definition.
            TypeKind::ValueType | TypeKind::Enum(_) | TypeKind::Primitive(_) => {
                value_usable(g, local.ty)
            }
            _ => pointer_usable(g, local.ty),
        };
        if !ok {
            return Some(t.name.clone());
        }
    }
    None
}

/// Instance-field access needs the declaring type's struct body; types
/// emitted as runtime aliases or mere forward declarations have no members
/// to name.
fn opaque_member_access(g: &CppGen<'_>, method: &IrMethod) -> Option<String> {
    for block in &method.blocks {
        for instr in &block.instrs {
            let field = match &instr.kind {
                InstrKind::LoadField { field, .. }
                | InstrKind::StoreField { field, .. }
                | InstrKind::FieldAddr { field, .. } => *field,
                _ => continue,
            };
            let declaring = g.module.field(field).declaring;
            if g.type_emission(declaring) != TypeEmission::Struct {
                let ty = g.module.ty(declaring);
                return Some(format!(
                    "instance field {}.{} has no emitted layout",
                    ty.name,
                    g.module.field(field).name
                ));
            }
        }
    }
    None
}

fn undeclared_callee(g: &CppGen<'_>, method: &IrMethod) -> Option<String> {
    for block in &method.blocks {
        for instr in &block.instrs {
            let (callee, explicit_arity) = match &instr.kind {
                InstrKind::Call { callee, args, kind } => {
                    // Virtual and interface dispatch goes through tables,
                    // not through the callee's direct symbol.
                    match kind {
                        crate::ir::CallKind::Virtual | crate::ir::CallKind::Interface => continue,
                        _ => (*callee, args.len()),
                    }
                }
                InstrKind::NewObject { ctor, args } => (*ctor, args.len() + 1),
                InstrKind::LoadFunction(m) => {
                    let target = g.module.method(*m);
                    (*m, target.params.len() + usize::from(!target.is_static()))
                }
                _ => continue,
            };
            let target = g.module.method(callee);
            if target.flags.contains(crate::ir::MethodFlags::ABSTRACT) {
                continue; // dispatched, never named directly
            }
            let symbol = g.method_symbol(callee);
            if symbol.is_empty() {
                return Some(format!("{} (no symbol)", g.module.method_key_string(callee)));
            }
            // Delegate plumbing is rendered inline, not called by name.
            if matches!(
                g.module.ty(target.declaring).kind,
                TypeKind::Delegate
            ) && (target.name == "Invoke" || target.name == ".ctor")
            {
                continue;
            }
            if !g.is_declared(symbol, explicit_arity) {
                return Some(format!("{symbol}/{explicit_arity}"));
            }
        }
    }
    None
}
