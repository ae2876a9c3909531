//! IR construction: the eight ordered passes.
//!
//! Pass 1 — type graph and field layout ([`super::layout`]).
//! Pass 2 — method signatures (here, during materialization).
//! Pass 3 — control-flow graphs ([`super::cfg`]).
//! Pass 4 — instruction lowering ([`super::lower`]).
//! Pass 5 — v-table and interface-table layout ([`super::vtable`]).
//! Pass 6 — specialization fixpoint ([`super::specialize`]).
//! Pass 7 — string literals and array-init blobs ([`super::literals`]).
//! Pass 8 — reference-integrity verification ([`super::verify`]).
//!
//! Each pass reads the previous pass's output and produces a strictly
//! richer module; none reaches back.

use std::collections::BTreeMap;

use cil2cpp_metadata::flags::{
    FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes, TypeLayout,
};
use cil2cpp_metadata::signatures::{self, TypeSig};
use cil2cpp_metadata::tables::TableId;
use tracing::{debug, info};

use crate::assembly_set::TypeDefHandle;
use crate::icalls;
use crate::reachability::ReachabilitySet;
use crate::runtime;
use crate::world::{
    GenericContext, World, arity_of, definition_of, format_field_key, generic_args_of,
};

use super::{
    FieldId, IrLocal, IrModule, IrParam, MethodFlags, MethodId, MethodSource, Primitive,
    StubReason, TypeId, TypeKind, TypeSource,
};

/// Builder-local state threaded between passes.
pub struct IrBuilder<'w, 'a> {
    pub world: &'w World<'a>,
    pub module: IrModule,
    /// Raw UTF-16 payloads collected during lowering; pass 7 dedups them.
    pub raw_strings: Vec<Vec<u16>>,
    /// (field, assembly, rva) for RVA-backed initializers; pass 7 reads them.
    pub rva_fields: Vec<(FieldId, usize, u32)>,
    /// Method key -> lowering diagnostics, merged with reachability's in
    /// pass 8.
    pub diagnostics: BTreeMap<String, Vec<String>>,
    /// Methods whose bodies still need lowering (key, id); pass 6 drains
    /// the stragglers discovered during pass 4.
    pub pending: Vec<MethodId>,
}

impl<'w, 'a> IrBuilder<'w, 'a> {
    pub fn build(
        world: &'w World<'a>,
        reach: &ReachabilitySet,
        module_name: &str,
    ) -> IrModule {
        let mut b = IrBuilder {
            world,
            module: IrModule::new(module_name),
            raw_strings: Vec::new(),
            rva_fields: Vec::new(),
            diagnostics: reach.diagnostics.clone(),
            pending: Vec::new(),
        };

        // Materialize type shells, fields and method signatures from the
        // closure (passes 1 and 2 operate over these).
        for name in &reach.types {
            b.intern_type_by_name(name);
        }
        for name in &reach.types {
            b.populate_type(name);
        }
        b.materialize_methods(reach);
        info!(
            types = b.module.types.len(),
            methods = b.module.methods.len(),
            "IR shells materialized"
        );

        super::layout::run(&mut b); // pass 1
        debug!("pass 1 (layout) done");
        // Pass 2 (signatures) ran inside materialize_methods.
        let cfgs = super::cfg::run(&mut b); // pass 3
        debug!("pass 3 (control flow) done");
        super::lower::run(&mut b, &cfgs); // pass 4
        debug!("pass 4 (lowering) done");
        super::vtable::run(&mut b); // pass 5
        debug!("pass 5 (dispatch tables) done");
        super::specialize::run(&mut b); // pass 6
        debug!("pass 6 (specialization fixpoint) done");
        super::literals::run(&mut b); // pass 7
        debug!("pass 7 (literal pools) done");
        super::verify::run(&mut b); // pass 8
        debug!("pass 8 (verification) done");

        if let Some(entry_key) = &reach.entry_method {
            b.module.entry_point = b.module.lookup_method(entry_key);
        }
        b.module
    }

    /// Map a canonical name to a TypeId, creating the shell on first use.
    pub fn intern_type_by_name(&mut self, canonical: &str) -> TypeId {
        if let Some(id) = self.module.lookup_type(canonical) {
            return id;
        }
        let kind = self.classify(canonical);
        let id = self.module.intern_type(canonical, kind);
        // Structural kinds are complete already; definition-backed kinds are
        // populated by `populate_type`.
        id
    }

    fn classify(&mut self, canonical: &str) -> TypeKind {
        if let Some(prim) = primitive_of(canonical) {
            return TypeKind::Primitive(prim);
        }
        if let Some(inner) = canonical.strip_suffix('&') {
            let inner_id = self.intern_type_by_name(inner);
            return TypeKind::ByRef(inner_id);
        }
        if let Some(inner) = canonical.strip_suffix('*') {
            let inner_id = self.intern_type_by_name(inner);
            return TypeKind::Pointer(inner_id);
        }
        if canonical.ends_with(']') {
            if let Some(open) = canonical.rfind('[') {
                let element = self.intern_type_by_name(&canonical[..open]);
                let rank = canonical[open..].matches(',').count() as u32 + 1;
                return TypeKind::Array { element, rank };
            }
        }
        if canonical.starts_with("fnptr<") {
            let inner = self.intern_type_by_name("System.Void");
            return TypeKind::Pointer(inner);
        }

        let Some(handle) = self.world.find_type(canonical) else {
            // Unknown: keep a class shell; the unknown-type gate owns it.
            return TypeKind::Class;
        };
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let row = &tables.type_def[handle.rid as usize - 1];
        let flags = TypeAttributes::from_bits_retain(row.flags);
        if flags.contains(TypeAttributes::INTERFACE) {
            return TypeKind::Interface;
        }
        let ctx = GenericContext::for_type(generic_args_of(canonical));
        let base = if row.extends.is_null() {
            None
        } else {
            self.world
                .token_type_name(handle.assembly, row.extends.token(), &ctx)
                .ok()
        };
        match base.as_deref() {
            Some("System.Enum") => {
                let underlying = self
                    .enum_underlying(handle)
                    .unwrap_or_else(|| "System.Int32".to_string());
                let under_id = self.intern_type_by_name(&underlying);
                TypeKind::Enum(under_id)
            }
            Some("System.ValueType") => TypeKind::ValueType,
            Some("System.MulticastDelegate") | Some("System.Delegate") => TypeKind::Delegate,
            _ => TypeKind::Class,
        }
    }

    fn enum_underlying(&self, handle: TypeDefHandle) -> Option<String> {
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let row = tables.type_def.get(handle.rid as usize - 1)?;
        let field_end = tables.list_end(
            TableId::TypeDef,
            handle.rid,
            |t, r| t.type_def[r as usize - 1].field_list,
            TableId::Field,
        );
        for f in row.field_list..field_end {
            let field = tables.field.get(f as usize - 1)?;
            let flags = FieldAttributes::from_bits_retain(field.flags);
            if flags.contains(FieldAttributes::STATIC) {
                continue;
            }
            let blob = asm.file.blobs().get(field.signature).ok()?;
            let sig = signatures::parse_field_sig(blob).ok()?;
            return self
                .world
                .type_sig_name(handle.assembly, &sig, &GenericContext::default())
                .ok();
        }
        None
    }

    /// Fill a definition-backed shell: flags, base, interfaces, fields.
    fn populate_type(&mut self, canonical: &str) {
        let Some(id) = self.module.lookup_type(canonical) else {
            return;
        };
        if let Some(rt) = runtime::runtime_alias(canonical) {
            let ty = self.module.ty_mut(id);
            ty.runtime_provided = true;
            ty.instance_size = rt.instance_size;
        }
        let Some(handle) = self.world.find_type(canonical) else {
            return;
        };
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let row = tables.type_def[handle.rid as usize - 1].clone();
        let flags = TypeAttributes::from_bits_retain(row.flags);
        let ctx = GenericContext::for_type(generic_args_of(canonical));

        let base_id = if row.extends.is_null() {
            None
        } else {
            self.world
                .token_type_name(handle.assembly, row.extends.token(), &ctx)
                .ok()
                .map(|n| self.intern_type_by_name(&n))
        };
        let interface_ids: Vec<TypeId> = tables
            .interface_impl
            .iter()
            .filter(|r| r.class == handle.rid)
            .filter_map(|r| {
                self.world
                    .token_type_name(handle.assembly, r.interface.token(), &ctx)
                    .ok()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|n| self.intern_type_by_name(&n))
            .collect();

        let generic_arg_ids: Vec<TypeId> = generic_args_of(canonical)
            .iter()
            .map(|n| self.intern_type_by_name(n))
            .collect();

        let layout_row = tables
            .class_layout
            .iter()
            .find(|r| r.parent == handle.rid)
            .cloned();

        {
            let ty = self.module.ty_mut(id);
            ty.base = base_id;
            ty.interfaces = interface_ids;
            ty.generic_args = generic_arg_ids;
            ty.generic_param_count = arity_of(definition_of(canonical));
            ty.is_abstract = flags.contains(TypeAttributes::ABSTRACT);
            ty.is_sealed = flags.contains(TypeAttributes::SEALED);
            ty.is_public = flags.is_public();
            ty.explicit_layout = flags.layout() == TypeLayout::Explicit;
            ty.source = Some(TypeSource {
                assembly: handle.assembly,
                type_def: handle.rid,
            });
            if let Some(l) = &layout_row {
                if l.packing_size != 0 {
                    ty.pack = Some(l.packing_size);
                }
                if l.class_size != 0 {
                    ty.explicit_size = Some(l.class_size);
                }
            }
        }

        self.populate_fields(canonical, id, handle, &ctx);
    }

    fn populate_fields(
        &mut self,
        canonical: &str,
        id: TypeId,
        handle: TypeDefHandle,
        ctx: &GenericContext,
    ) {
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let row = &tables.type_def[handle.rid as usize - 1];
        let field_end = tables.list_end(
            TableId::TypeDef,
            handle.rid,
            |t, r| t.type_def[r as usize - 1].field_list,
            TableId::Field,
        );
        let mut collected = Vec::new();
        for f in row.field_list..field_end {
            let Some(field) = tables.field.get(f as usize - 1) else {
                continue;
            };
            let Ok(name) = asm.file.strings().get(field.name) else {
                continue;
            };
            let flags = FieldAttributes::from_bits_retain(field.flags);
            let Ok(blob) = asm.file.blobs().get(field.signature) else {
                continue;
            };
            let Ok(sig) = signatures::parse_field_sig(blob) else {
                continue;
            };
            let ty_name = match self.world.type_sig_name(handle.assembly, &sig, ctx) {
                Ok(n) => n,
                Err(_) => "System.Object".to_string(),
            };
            let explicit_offset = tables
                .field_layout
                .iter()
                .find(|r| r.field == f)
                .map(|r| r.offset);
            let rva = tables.field_rva.iter().find(|r| r.field == f).map(|r| r.rva);
            collected.push((
                f,
                name.to_string(),
                ty_name,
                flags,
                explicit_offset,
                rva,
            ));
        }
        for (_f, name, ty_name, flags, explicit_offset, rva) in collected {
            let field_ty = self.intern_type_by_name(&ty_name);
            let key = format_field_key(canonical, &name);
            let fid = self.module.intern_field(&key, id, &name);
            let field = self.module.field_mut(fid);
            field.ty = field_ty;
            field.is_static = flags.contains(FieldAttributes::STATIC);
            field.is_literal = flags.contains(FieldAttributes::LITERAL);
            if let Some(off) = explicit_offset {
                field.offset = off;
            }
            if let Some(rva) = rva {
                self.rva_fields.push((fid, handle.assembly, rva));
            }
        }
    }

    /// Pass 2: turn every reachable method into a signed IR method shell.
    fn materialize_methods(&mut self, reach: &ReachabilitySet) {
        for (key, seed) in &reach.methods {
            let declaring = self.intern_type_by_name(&seed.declaring);
            let id = self.module.intern_method(key, declaring, &seed.name);

            let params: Vec<IrParam> = seed
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let byref = p.ends_with('&');
                    IrParam {
                        name: format!("a{i}"),
                        ty: self.intern_type_by_name(p),
                        byref,
                    }
                })
                .collect();
            let ret = self.intern_type_by_name(&seed.ret);
            let generic_args: Vec<TypeId> = seed
                .method_args
                .iter()
                .map(|n| self.intern_type_by_name(n))
                .collect();

            let mut flags = MethodFlags::empty();
            if !seed.has_this {
                flags |= MethodFlags::STATIC;
            }
            let mut pinvoke = None;
            let mut source = None;
            if let Some((asm_index, rid)) = seed.def {
                source = Some(MethodSource {
                    assembly: asm_index,
                    method_def: rid,
                });
                let asm = self.world.set.assembly(asm_index);
                let tables = asm.file.tables();
                if let Some(row) = tables.method_def.get(rid as usize - 1) {
                    let mflags = MethodAttributes::from_bits_retain(row.flags);
                    let iflags = MethodImplAttributes::from_bits_retain(row.impl_flags);
                    if mflags.contains(MethodAttributes::VIRTUAL) {
                        flags |= MethodFlags::VIRTUAL;
                    }
                    if mflags.contains(MethodAttributes::ABSTRACT) {
                        flags |= MethodFlags::ABSTRACT;
                    }
                    if mflags.contains(MethodAttributes::NEW_SLOT) {
                        flags |= MethodFlags::NEW_SLOT;
                    }
                    if mflags.contains(MethodAttributes::FINAL) {
                        flags |= MethodFlags::FINAL;
                    }
                    if mflags.contains(MethodAttributes::SPECIAL_NAME) {
                        flags |= MethodFlags::SPECIAL_NAME;
                    }
                    if iflags.contains(MethodImplAttributes::INTERNAL_CALL) {
                        flags |= MethodFlags::INTERNAL_CALL;
                    }
                    if iflags.is_runtime() {
                        flags |= MethodFlags::RUNTIME;
                    }
                    if mflags.contains(MethodAttributes::PINVOKE_IMPL) {
                        flags |= MethodFlags::PINVOKE;
                        pinvoke = self.pinvoke_info(asm_index, rid);
                    }
                }
            }

            // Internal calls map through the registry; runtime-flagged
            // methods on allowlisted types do too (String.get_Length and
            // friends carry no IL anywhere).
            let lookup_type = definition_of(&seed.declaring);
            let first_param = seed.params.first().map(String::as_str);
            let icall = icalls::lookup(lookup_type, &seed.name, seed.params.len(), first_param)
                .map(str::to_string);

            if Some(key.as_str()) == reach.entry_method.as_deref() {
                flags |= MethodFlags::ENTRY_POINT;
            }

            let method = self.module.method_mut(id);
            method.params = params;
            method.return_type = ret;
            method.generic_args = generic_args;
            method.generic_param_count = seed.method_args.len() as u32;
            method.flags = flags;
            method.icall = icall;
            method.source = source;
            if let Some((module, entry)) = pinvoke {
                method.pinvoke_module = Some(module);
                method.pinvoke_entry = Some(entry);
            }

            // Bookkeeping handles on the declaring type.
            match seed.name.as_str() {
                ".cctor" => self.module.ty_mut(declaring).cctor = Some(id),
                ".ctor" if seed.params.is_empty() => {
                    self.module.ty_mut(declaring).default_ctor = Some(id)
                }
                "Finalize" if seed.params.is_empty() => {
                    self.module.ty_mut(declaring).finalizer = Some(id)
                }
                _ => {}
            }
        }
    }

    fn pinvoke_info(&self, asm_index: usize, method_rid: u32) -> Option<(String, String)> {
        let asm = self.world.set.assembly(asm_index);
        let tables = asm.file.tables();
        let row = tables.impl_map.iter().find(|r| {
            r.member_forwarded.table == TableId::MethodDef && r.member_forwarded.rid == method_rid
        })?;
        let entry = asm.file.strings().get(row.import_name).ok()?.to_string();
        let module_row = tables
            .module_ref
            .get((row.import_scope as usize).checked_sub(1)?)?;
        let module = asm.file.strings().get(module_row.name).ok()?.to_string();
        Some((module, entry))
    }

    /// Resolve locals for a method definition (used by pass 4).
    pub fn locals_of(
        &mut self,
        asm_index: usize,
        locals_token: cil2cpp_metadata::MetadataToken,
        ctx: &GenericContext,
    ) -> Vec<IrLocal> {
        let asm = self.world.set.assembly(asm_index);
        let Some(row) = asm
            .file
            .tables()
            .stand_alone_sig
            .get(locals_token.rid() as usize - 1)
        else {
            return Vec::new();
        };
        let Ok(blob) = asm.file.blobs().get(row.signature) else {
            return Vec::new();
        };
        let Ok(locals) = signatures::parse_locals_sig(blob) else {
            return Vec::new();
        };
        locals
            .iter()
            .map(|l| {
                let byref = matches!(l.ty, TypeSig::ByRef(_));
                let name = self
                    .world
                    .type_sig_name(asm_index, &l.ty, ctx)
                    .unwrap_or_else(|_| "System.Object".to_string());
                IrLocal {
                    ty: self.intern_type_by_name(&name),
                    byref,
                    pinned: l.pinned,
                }
            })
            .collect()
    }

    pub fn diag(&mut self, key: &str, message: String) {
        self.diagnostics
            .entry(key.to_string())
            .or_default()
            .push(message);
    }

    /// Shared helper: mark a method as stubbed unless it already is.
    pub fn stub(&mut self, id: MethodId, reason: StubReason) {
        let method = self.module.method_mut(id);
        if method.stub_reason.is_none() {
            method.stub_reason = Some(reason);
            method.blocks.clear();
        }
    }
}

fn primitive_of(canonical: &str) -> Option<Primitive> {
    Some(match canonical {
        "System.Void" => Primitive::Void,
        "System.Boolean" => Primitive::Bool,
        "System.Char" => Primitive::Char,
        "System.SByte" => Primitive::I1,
        "System.Byte" => Primitive::U1,
        "System.Int16" => Primitive::I2,
        "System.UInt16" => Primitive::U2,
        "System.Int32" => Primitive::I4,
        "System.UInt32" => Primitive::U4,
        "System.Int64" => Primitive::I8,
        "System.UInt64" => Primitive::U8,
        "System.IntPtr" => Primitive::ISize,
        "System.UIntPtr" => Primitive::USize,
        "System.Single" => Primitive::F4,
        "System.Double" => Primitive::F8,
        _ => return None,
    })
}
