//! Pass 5: virtual and interface dispatch tables.
//!
//! Each type's v-table extends its base's slot for slot; a virtual marked
//! new-slot (or with no matching base slot) appends, an override rewrites
//! the inherited slot in place. Interface tables map each interface's
//! methods, in the interface's declared order, to the implementing method
//! found by explicit `MethodImpl` override first, then by name-and-
//! signature search up the chain.

use std::collections::BTreeMap;

use super::builder::IrBuilder;
use super::{InterfaceTable, MethodId, TypeId, TypeKind};

pub fn run(b: &mut IrBuilder<'_, '_>) {
    // Methods were interned in key order; dispatch slots follow declared
    // (row) order, so sort each type's method list first.
    for ty_index in 0..b.module.types.len() {
        let id = TypeId(ty_index as u32);
        let mut methods = b.module.ty(id).methods.clone();
        methods.sort_by_key(|m| {
            let method = b.module.method(*m);
            (
                method.source.map(|s| s.method_def).unwrap_or(u32::MAX),
                method.name.clone(),
            )
        });
        b.module.ty_mut(id).methods = methods;
    }

    let order: Vec<TypeId> = b.module.types_by_name.values().copied().collect();
    let mut built = vec![false; b.module.types.len()];
    for id in &order {
        build_vtable(b, *id, &mut built);
    }
    for id in &order {
        build_interface_tables(b, *id);
    }
}

fn is_dispatchable(kind: &TypeKind) -> bool {
    matches!(
        kind,
        TypeKind::Class | TypeKind::ValueType | TypeKind::Delegate | TypeKind::Enum(_)
    )
}

fn build_vtable(b: &mut IrBuilder<'_, '_>, id: TypeId, built: &mut Vec<bool>) {
    if built[id.0 as usize] {
        return;
    }
    built[id.0 as usize] = true;

    let (kind, base) = {
        let ty = b.module.ty(id);
        (ty.kind.clone(), ty.base)
    };
    if !is_dispatchable(&kind) {
        return;
    }
    let base_vtable = match base {
        Some(base_id) => {
            build_vtable(b, base_id, built);
            b.module.ty(base_id).vtable.clone()
        }
        None => Vec::new(),
    };
    let vtable = extend_vtable(&mut b.module, id, base_vtable);
    b.module.ty_mut(id).vtable = vtable;
}

/// Extend an inherited v-table with one type's virtuals, recording each
/// method's slot. Overrides rewrite in place; new virtuals append, so the
/// result is never shorter than the base's.
fn extend_vtable(
    module: &mut super::IrModule,
    id: TypeId,
    mut vtable: Vec<MethodId>,
) -> Vec<MethodId> {
    let methods = module.ty(id).methods.clone();
    for mid in methods {
        let (is_virtual, new_slot, name, params) = {
            let m = module.method(mid);
            (
                m.is_virtual(),
                m.flags.contains(super::MethodFlags::NEW_SLOT),
                m.name.clone(),
                method_param_types(module, mid),
            )
        };
        if !is_virtual {
            continue;
        }
        let inherited = if new_slot {
            None
        } else {
            vtable.iter().position(|slot_method| {
                let sm = module.method(*slot_method);
                sm.name == name && method_param_types(module, *slot_method) == params
            })
        };
        let slot = match inherited {
            Some(slot) => {
                vtable[slot] = mid;
                slot as u32
            }
            None => {
                vtable.push(mid);
                vtable.len() as u32 - 1
            }
        };
        module.method_mut(mid).vtable_slot = Some(slot);
    }
    vtable
}

fn method_param_types(module: &super::IrModule, id: MethodId) -> Vec<TypeId> {
    module.method(id).params.iter().map(|p| p.ty).collect()
}

fn param_types(b: &IrBuilder<'_, '_>, id: MethodId) -> Vec<TypeId> {
    method_param_types(&b.module, id)
}

fn build_interface_tables(b: &mut IrBuilder<'_, '_>, id: TypeId) {
    let (kind, is_abstract) = {
        let ty = b.module.ty(id);
        (ty.kind.clone(), ty.is_abstract)
    };
    if !is_dispatchable(&kind) || is_abstract {
        return;
    }

    // Transitive interface set: own declarations plus the base chain's.
    let mut interfaces: Vec<TypeId> = Vec::new();
    let mut cursor = Some(id);
    while let Some(t) = cursor {
        let ty = b.module.ty(t);
        for iface in &ty.interfaces {
            if !interfaces.contains(iface) {
                interfaces.push(*iface);
            }
        }
        cursor = ty.base;
    }
    if interfaces.is_empty() {
        return;
    }

    let explicit = explicit_overrides(b, id);

    let mut tables = Vec::with_capacity(interfaces.len());
    for iface in interfaces {
        let iface_methods = b.module.ty(iface).methods.clone();
        let mut slots = Vec::with_capacity(iface_methods.len());
        for imid in iface_methods {
            let impl_method = explicit
                .get(&imid)
                .copied()
                .or_else(|| find_implementation(b, id, imid));
            // An interface method with no implementation in an instantiable
            // type is a metadata defect; point the slot at the interface
            // method itself and let the stub machinery report it.
            slots.push(impl_method.unwrap_or(imid));
        }
        tables.push(InterfaceTable {
            interface: iface,
            slots,
        });
    }
    tables.sort_by(|a, b2| {
        let an = &b.module.ty(a.interface).name;
        let bn = &b.module.ty(b2.interface).name;
        an.cmp(bn)
    });
    b.module.ty_mut(id).interface_tables = tables;
}

/// Explicit `MethodImpl` rows of this type: interface/base declaration
/// method -> body method.
fn explicit_overrides(b: &mut IrBuilder<'_, '_>, id: TypeId) -> BTreeMap<MethodId, MethodId> {
    let mut out = BTreeMap::new();
    let Some(source) = b.module.ty(id).source else {
        return out;
    };
    let ctx = crate::world::GenericContext::for_type(crate::world::generic_args_of(
        &b.module.ty(id).name.clone(),
    ));
    let rows: Vec<_> = {
        let asm = b.world.set.assembly(source.assembly);
        asm.file
            .tables()
            .method_impl
            .iter()
            .filter(|r| r.class == source.type_def)
            .cloned()
            .collect()
    };
    for row in rows {
        let decl = b
            .world
            .resolve_method_token(source.assembly, row.method_declaration.token(), &ctx)
            .ok()
            .and_then(|info| b.world.method_key(&info).ok())
            .and_then(|key| b.module.lookup_method(&key));
        let body = b
            .world
            .resolve_method_token(source.assembly, row.method_body.token(), &ctx)
            .ok()
            .and_then(|info| b.world.method_key(&info).ok())
            .and_then(|key| b.module.lookup_method(&key));
        if let (Some(decl), Some(body)) = (decl, body) {
            out.insert(decl, body);
        }
    }
    out
}

/// Name-and-signature search for an interface method's implementation,
/// most-derived type first.
fn find_implementation(b: &IrBuilder<'_, '_>, id: TypeId, iface_method: MethodId) -> Option<MethodId> {
    let (name, params) = {
        let m = b.module.method(iface_method);
        (m.name.clone(), param_types(b, iface_method))
    };
    let mut cursor = Some(id);
    while let Some(t) = cursor {
        let ty = b.module.ty(t);
        for mid in &ty.methods {
            let m = b.module.method(*mid);
            if m.is_virtual() && m.name == name && param_types(b, *mid) == params {
                return Some(*mid);
            }
        }
        cursor = ty.base;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrModule, MethodFlags, TypeKind};

    fn virt(module: &mut IrModule, ty: TypeId, key: &str, name: &str, new_slot: bool) -> MethodId {
        let id = module.intern_method(key, ty, name);
        let m = module.method_mut(id);
        m.flags |= MethodFlags::VIRTUAL;
        if new_slot {
            m.flags |= MethodFlags::NEW_SLOT;
        }
        id
    }

    #[test]
    fn overrides_reuse_base_slots_and_new_virtuals_append() {
        let mut module = IrModule::new("t");
        let base = module.intern_type("NS.A", TypeKind::Class);
        let derived = module.intern_type("NS.B", TypeKind::Class);
        let f_base = virt(&mut module, base, "NS.A::F()", "F", true);
        let f_override = virt(&mut module, derived, "NS.B::F()", "F", false);
        let g_new = virt(&mut module, derived, "NS.B::G()", "G", true);
        module.ty_mut(derived).base = Some(base);

        let base_vtable = extend_vtable(&mut module, base, Vec::new());
        assert_eq!(base_vtable, vec![f_base]);
        let derived_vtable = extend_vtable(&mut module, derived, base_vtable.clone());
        assert_eq!(derived_vtable, vec![f_override, g_new]);
        assert!(derived_vtable.len() >= base_vtable.len());
        assert_eq!(module.method(f_base).vtable_slot, Some(0));
        assert_eq!(module.method(f_override).vtable_slot, Some(0));
        assert_eq!(module.method(g_new).vtable_slot, Some(1));
    }

    #[test]
    fn overloads_do_not_collide_in_slots() {
        let mut module = IrModule::new("t");
        let base = module.intern_type("NS.A", TypeKind::Class);
        let derived = module.intern_type("NS.B", TypeKind::Class);
        let int_ty = module.intern_type("System.Int32", TypeKind::Primitive(crate::ir::Primitive::I4));
        let f0 = virt(&mut module, base, "NS.A::F()", "F", true);
        let f1 = virt(&mut module, derived, "NS.B::F(System.Int32)", "F", false);
        module.method_mut(f1).params.push(crate::ir::IrParam {
            name: "a0".into(),
            ty: int_ty,
            byref: false,
        });
        module.ty_mut(derived).base = Some(base);

        let base_vtable = extend_vtable(&mut module, base, Vec::new());
        let derived_vtable = extend_vtable(&mut module, derived, base_vtable);
        // Different parameter lists: no override, a fresh slot instead.
        assert_eq!(derived_vtable, vec![f0, f1]);
    }
}
