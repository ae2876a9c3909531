//! Pass 1: field layout and instance sizes.
//!
//! Classes carry a two-slot object header (type-info pointer + sync word)
//! and extend their base's layout; value types are bare field bags. Fields
//! are laid out in declared order with natural alignment, capped by the
//! type's packing override; explicit layouts keep their metadata offsets
//! and honor a declared class size. Reference-typed fields are pointer
//! sized. Offsets depend only on the module contents, so they are stable
//! across runs.

use super::builder::IrBuilder;
use super::{Primitive, TypeId, TypeKind};

/// Object header: type-info pointer + sync-block word.
pub const OBJECT_HEADER_SIZE: u32 = 16;
pub const POINTER_SIZE: u32 = 8;

pub fn run(b: &mut IrBuilder<'_, '_>) {
    let count = b.module.types.len();
    let mut done = vec![false; count];
    let mut in_progress = vec![false; count];
    for i in 0..count {
        layout_type(b, TypeId(i as u32), &mut done, &mut in_progress);
    }
}

/// Size and alignment of a field holding `ty` by value.
pub fn field_size_align(b: &IrBuilder<'_, '_>, ty: TypeId) -> (u32, u32) {
    let t = b.module.ty(ty);
    match &t.kind {
        TypeKind::Primitive(p) => (p.size().max(1), p.size().max(1)),
        TypeKind::Enum(under) => field_size_align(b, *under),
        TypeKind::ValueType => (t.instance_size.max(1), t.alignment.max(1)),
        // Everything else is held through a pointer.
        _ => (POINTER_SIZE, POINTER_SIZE),
    }
}

fn layout_type(
    b: &mut IrBuilder<'_, '_>,
    id: TypeId,
    done: &mut Vec<bool>,
    in_progress: &mut Vec<bool>,
) {
    let idx = id.0 as usize;
    if done[idx] {
        return;
    }
    if in_progress[idx] {
        // A value-type cycle is malformed input; break it with a pointer-
        // sized placeholder rather than recursing forever.
        return;
    }
    in_progress[idx] = true;

    // Lay out dependencies first: base chain and by-value field types.
    let deps: Vec<TypeId> = {
        let ty = b.module.ty(id);
        let mut deps: Vec<TypeId> = ty.base.into_iter().collect();
        match &ty.kind {
            TypeKind::Enum(under) => deps.push(*under),
            TypeKind::Array { element, .. } => deps.push(*element),
            _ => {}
        }
        for f in &ty.fields {
            let field = b.module.field(*f);
            if !field.is_static {
                let ft = b.module.ty(field.ty);
                if ft.is_value_like() {
                    deps.push(field.ty);
                }
            }
        }
        deps
    };
    for dep in deps {
        layout_type(b, dep, done, in_progress);
    }

    let kind = b.module.ty(id).kind.clone();
    match kind {
        TypeKind::Primitive(p) => {
            let ty = b.module.ty_mut(id);
            ty.instance_size = p.size();
            ty.element_size = p.size();
            ty.alignment = p.size().max(1);
        }
        TypeKind::Enum(under) => {
            let (size, align) = field_size_align(b, under);
            let ty = b.module.ty_mut(id);
            ty.instance_size = size;
            ty.element_size = size;
            ty.alignment = align;
        }
        TypeKind::Pointer(_) | TypeKind::ByRef(_) | TypeKind::GenericParam { .. } => {
            let ty = b.module.ty_mut(id);
            ty.instance_size = POINTER_SIZE;
            ty.element_size = POINTER_SIZE;
            ty.alignment = POINTER_SIZE;
        }
        TypeKind::Array { element, .. } => {
            let (elem_size, _) = field_size_align(b, element);
            let elem_is_ref = !b.module.ty(element).is_value_like();
            let ty = b.module.ty_mut(id);
            // The array object itself is runtime-provided; element size
            // feeds indexing and allocation.
            ty.instance_size = crate::runtime::runtime_alias("System.Array")
                .map(|r| r.instance_size)
                .unwrap_or(32);
            ty.element_size = if elem_is_ref { POINTER_SIZE } else { elem_size };
            ty.alignment = POINTER_SIZE;
            ty.has_references = true;
        }
        TypeKind::ValueType | TypeKind::Class | TypeKind::Interface | TypeKind::Delegate => {
            layout_fields(b, id);
        }
    }

    done[idx] = true;
    in_progress[idx] = false;
}

fn layout_fields(b: &mut IrBuilder<'_, '_>, id: TypeId) {
    let (is_value, explicit_layout, pack, explicit_size, base, fields, runtime_provided) = {
        let ty = b.module.ty(id);
        (
            ty.is_value_like(),
            ty.explicit_layout,
            ty.pack.map(u32::from).unwrap_or(POINTER_SIZE).max(1),
            ty.explicit_size,
            ty.base,
            ty.fields.clone(),
            ty.runtime_provided,
        )
    };

    let base_size = match base {
        Some(base_id) if !is_value => {
            let bt = b.module.ty(base_id);
            if bt.instance_size > 0 {
                bt.instance_size
            } else {
                OBJECT_HEADER_SIZE
            }
        }
        _ if !is_value => OBJECT_HEADER_SIZE,
        _ => 0,
    };
    let base_has_refs = base
        .map(|base_id| b.module.ty(base_id).has_references)
        .unwrap_or(false);

    let mut offset = base_size;
    let mut max_align = if is_value { 1 } else { POINTER_SIZE };
    let mut max_end = base_size;
    let mut has_references = base_has_refs;

    for fid in fields {
        let (fty, is_static, preset_offset) = {
            let f = b.module.field(fid);
            (f.ty, f.is_static, f.offset)
        };
        if is_static {
            continue;
        }
        let (size, natural_align) = field_size_align(b, fty);
        let align = natural_align.min(pack);
        max_align = max_align.max(align);
        let field_has_ref = {
            let ft = b.module.ty(fty);
            !ft.is_value_like() && !matches!(ft.kind, TypeKind::Pointer(_) | TypeKind::ByRef(_))
                || ft.has_references
        };
        has_references |= field_has_ref;

        let field_offset = if explicit_layout {
            base_size + preset_offset
        } else {
            round_up(offset, align)
        };
        {
            let f = b.module.field_mut(fid);
            f.offset = field_offset;
        }
        offset = offset.max(field_offset + size);
        max_end = max_end.max(field_offset + size);
    }

    let mut size = round_up(max_end, max_align.max(1));
    if let Some(declared) = explicit_size {
        size = size.max(declared + if is_value { 0 } else { base_size });
    }
    if is_value {
        size = size.max(1);
    } else {
        size = size.max(OBJECT_HEADER_SIZE);
    }

    let ty = b.module.ty_mut(id);
    if !runtime_provided || ty.instance_size == 0 {
        ty.instance_size = size;
    }
    ty.element_size = if is_value { ty.instance_size } else { POINTER_SIZE };
    ty.alignment = max_align.max(1);
    ty.has_references = has_references;
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_exact_on_multiples() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_up(16, 8), 16);
    }

    #[test]
    fn primitive_sizes_match_storage() {
        assert_eq!(Primitive::I4.size(), 4);
        assert_eq!(Primitive::F8.size(), 8);
        assert_eq!(Primitive::Bool.size(), 1);
    }
}
