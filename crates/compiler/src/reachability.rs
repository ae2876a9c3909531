//! Whole-program reachability.
//!
//! Worklist closure from the entry point (executable mode) or the public
//! surface (library mode), plus the always-keep set, the runtime-provided
//! allowlist, and RVA-backed fields of the primary assembly. The analysis
//! is total: unresolvable references become diagnostics on the referring
//! method, never errors, and the method is left as a stub candidate for
//! the classifier.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cil2cpp_metadata::flags::{MethodAttributes, TypeAttributes};
use cil2cpp_metadata::il::IlOp;
use cil2cpp_metadata::signatures;
use cil2cpp_metadata::tables::{MetadataToken, TableId};
use tracing::{debug, info};

use crate::assembly_set::TypeDefHandle;
use crate::options::{CompilerOptions, OutputKind};
use crate::runtime;
use crate::world::{
    self, GenericContext, MethodRefInfo, World, format_field_key, format_method_key,
    generic_args_of,
};

/// A reachable method: its identity plus where (if anywhere) its
/// definition rows live.
#[derive(Debug, Clone)]
pub struct MethodSeed {
    pub declaring: String,
    pub name: String,
    pub params: Vec<String>,
    /// Canonical name of the return type.
    pub ret: String,
    pub has_this: bool,
    pub method_args: Vec<String>,
    /// (assembly, MethodDef rid) when the definition was found.
    pub def: Option<(usize, u32)>,
}

/// Output of the analyzer, closed under reference.
#[derive(Debug, Default)]
pub struct ReachabilitySet {
    pub types: BTreeSet<String>,
    pub methods: BTreeMap<String, MethodSeed>,
    pub fields: BTreeSet<String>,
    /// Method key -> unresolved references found in its body.
    pub diagnostics: BTreeMap<String, Vec<String>>,
    pub entry_method: Option<String>,
}

pub struct ReachabilityAnalyzer<'w, 'a> {
    world: &'w World<'a>,
    set: ReachabilitySet,
    worklist: VecDeque<String>,
    /// (declaring, name, params) of every virtual call site seen.
    virtual_targets: BTreeSet<(String, String, Vec<String>)>,
    types_order: Vec<String>,
}

impl<'w, 'a> ReachabilityAnalyzer<'w, 'a> {
    pub fn analyze(world: &'w World<'a>, options: &CompilerOptions) -> ReachabilitySet {
        let mut analyzer = ReachabilityAnalyzer {
            world,
            set: ReachabilitySet::default(),
            worklist: VecDeque::new(),
            virtual_targets: BTreeSet::new(),
            types_order: Vec::new(),
        };
        analyzer.seed_roots(options);
        analyzer.run();
        info!(
            types = analyzer.set.types.len(),
            methods = analyzer.set.methods.len(),
            fields = analyzer.set.fields.len(),
            "reachability closure complete"
        );
        analyzer.set
    }

    fn seed_roots(&mut self, options: &CompilerOptions) {
        for name in runtime::ALWAYS_KEEP_TYPES {
            self.add_type(name);
        }
        for ty in runtime::RUNTIME_PROVIDED_TYPES {
            self.add_type(ty.canonical);
        }

        match options.output_kind {
            OutputKind::Executable => self.seed_entry_point(),
            OutputKind::Library => self.seed_public_surface(),
        }

        // RVA-backed fields of the primary assembly feed array-init
        // lowering even when only their declaring cctor touches them.
        let primary = self.world.set.primary();
        let tables = primary.file.tables();
        for row in &tables.field_rva {
            if let Some(owner) = self.world.field_owner(0, row.field) {
                let declaring = primary.type_names[owner as usize - 1].clone();
                if world::arity_of(&declaring) > 0 {
                    continue;
                }
                if let Some(field) = tables.field.get(row.field as usize - 1) {
                    if let Ok(name) = primary.file.strings().get(field.name) {
                        self.add_type(&declaring);
                        self.set
                            .fields
                            .insert(format_field_key(&declaring, name));
                    }
                }
            }
        }
    }

    fn seed_entry_point(&mut self) {
        let primary = self.world.set.primary();
        let Some(token) = primary.file.entry_point() else {
            return;
        };
        if token.table() != Some(TableId::MethodDef) {
            return;
        }
        let ctx = GenericContext::default();
        if let Ok(info) = self.world.resolve_method_token(0, token, &ctx) {
            if let Ok(key) = self.world.method_key(&info) {
                self.enqueue_method(&key, &info);
                self.set.entry_method = Some(key);
            }
        }
    }

    fn seed_public_surface(&mut self) {
        let primary = self.world.set.primary();
        let tables = primary.file.tables();
        for (i, row) in tables.type_def.iter().enumerate() {
            let flags = TypeAttributes::from_bits_retain(row.flags);
            if !flags.is_public() {
                continue;
            }
            let declaring = primary.type_names[i].clone();
            if world::arity_of(&declaring) > 0 {
                continue;
            }
            let rid = i as u32 + 1;
            let method_end = tables.list_end(
                TableId::TypeDef,
                rid,
                |t, r| t.type_def[r as usize - 1].method_list,
                TableId::MethodDef,
            );
            let mut any_public = false;
            for m in row.method_list..method_end {
                let Some(method) = tables.method_def.get(m as usize - 1) else {
                    continue;
                };
                if !MethodAttributes::from_bits_retain(method.flags).is_public() {
                    continue;
                }
                any_public = true;
                let token = MetadataToken::new(TableId::MethodDef, m);
                let ctx = GenericContext::default();
                if let Ok(info) = self.world.resolve_method_token(0, token, &ctx) {
                    if info.sig.generic_param_count > 0 {
                        continue;
                    }
                    if let Ok(key) = self.world.method_key(&info) {
                        self.enqueue_method(&key, &info);
                    }
                }
            }
            if any_public {
                self.add_type(&declaring);
            }
        }
    }

    fn run(&mut self) {
        while let Some(key) = self.worklist.pop_front() {
            self.process_method(&key);
        }
    }

    fn enqueue_method(&mut self, key: &str, info: &MethodRefInfo) {
        if self.set.methods.contains_key(key) {
            return;
        }
        let callee_ctx = GenericContext {
            type_args: generic_args_of(&info.declaring),
            method_args: info.method_args.clone(),
        };
        let params: Vec<String> = info
            .sig
            .params
            .iter()
            .filter_map(|p| {
                self.world
                    .type_sig_name(info.sig_assembly, p, &callee_ctx)
                    .ok()
            })
            .collect();
        let ret = self
            .world
            .type_sig_name(info.sig_assembly, &info.sig.return_type, &callee_ctx)
            .unwrap_or_else(|_| "System.Void".to_string());
        for ty in params.iter().chain(std::iter::once(&ret)) {
            self.add_type(ty);
        }
        self.set.methods.insert(
            key.to_string(),
            MethodSeed {
                declaring: info.declaring.clone(),
                name: info.name.clone(),
                params,
                ret,
                has_this: info.sig.has_this,
                method_args: info.method_args.clone(),
                def: None,
            },
        );
        self.add_type(&info.declaring);
        self.worklist.push_back(key.to_string());
    }

    /// Add one canonical type name (and its structural parts, base chain
    /// and interfaces) to the closure.
    fn add_type(&mut self, canonical: &str) {
        if canonical.is_empty() || self.set.types.contains(canonical) {
            return;
        }
        if world::is_open_name(canonical) {
            // Open generics never enter the set; instantiations do.
            return;
        }
        self.set.types.insert(canonical.to_string());
        self.types_order.push(canonical.to_string());

        if let Some(inner) = canonical.strip_suffix('&') {
            self.add_type(inner);
            return;
        }
        if let Some(inner) = canonical.strip_suffix('*') {
            self.add_type(inner);
            return;
        }
        if let Some(open) = canonical.rfind('[') {
            if canonical.ends_with(']') {
                self.add_type(&canonical[..open]);
                return;
            }
        }

        // Generic arguments are types of their own.
        for arg in generic_args_of(canonical) {
            self.add_type(&arg);
        }

        if let Some(handle) = self.world.find_type(canonical) {
            if let Some(base) = self.base_of(canonical, handle) {
                self.add_type(&base);
            }
            for iface in self.interfaces_of(canonical, handle) {
                self.add_type(&iface);
            }
            // A newly reachable type may supply overrides for virtual
            // calls that were discovered before it was.
            let targets: Vec<_> = self.virtual_targets.iter().cloned().collect();
            for (decl, name, params) in targets {
                self.match_override(canonical, &decl, &name, &params);
            }
        }
    }

    fn base_of(&self, closed: &str, handle: TypeDefHandle) -> Option<String> {
        let asm = self.world.set.assembly(handle.assembly);
        let row = asm.file.tables().type_def.get(handle.rid as usize - 1)?;
        if row.extends.is_null() {
            return None;
        }
        let ctx = GenericContext::for_type(generic_args_of(closed));
        self.world
            .token_type_name(handle.assembly, row.extends.token(), &ctx)
            .ok()
    }

    fn interfaces_of(&self, closed: &str, handle: TypeDefHandle) -> Vec<String> {
        let asm = self.world.set.assembly(handle.assembly);
        let ctx = GenericContext::for_type(generic_args_of(closed));
        asm.file
            .tables()
            .interface_impl
            .iter()
            .filter(|row| row.class == handle.rid)
            .filter_map(|row| {
                self.world
                    .token_type_name(handle.assembly, row.interface.token(), &ctx)
                    .ok()
            })
            .collect()
    }

    fn is_subtype_of(&self, candidate: &str, ancestor: &str) -> bool {
        if candidate == ancestor {
            return true;
        }
        let mut current = candidate.to_string();
        for _ in 0..64 {
            let Some(handle) = self.world.find_type(&current) else {
                return false;
            };
            for iface in self.interfaces_of(&current, handle) {
                if iface == ancestor {
                    return true;
                }
            }
            match self.base_of(&current, handle) {
                Some(base) if base == ancestor => return true,
                Some(base) => current = base,
                None => return false,
            }
        }
        false
    }

    /// If `subtype` declares an override matching the virtual target, make
    /// it reachable.
    fn match_override(&mut self, subtype: &str, decl: &str, name: &str, params: &[String]) {
        if !self.is_subtype_of(subtype, decl) || subtype == decl {
            return;
        }
        let Some(handle) = self.world.find_type(subtype) else {
            return;
        };
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let Some(row) = tables.type_def.get(handle.rid as usize - 1) else {
            return;
        };
        let method_end = tables.list_end(
            TableId::TypeDef,
            handle.rid,
            |t, r| t.type_def[r as usize - 1].method_list,
            TableId::MethodDef,
        );
        let ctx = GenericContext::for_type(generic_args_of(subtype));
        for m in row.method_list..method_end {
            let Some(method) = tables.method_def.get(m as usize - 1) else {
                continue;
            };
            let flags = MethodAttributes::from_bits_retain(method.flags);
            if !flags.contains(MethodAttributes::VIRTUAL) {
                continue;
            }
            let Ok(mname) = asm.file.strings().get(method.name) else {
                continue;
            };
            if mname != name {
                continue;
            }
            let Ok(blob) = asm.file.blobs().get(method.signature) else {
                continue;
            };
            let Ok(sig) = signatures::parse_method_sig(blob) else {
                continue;
            };
            let mparams: Vec<String> = sig
                .params
                .iter()
                .filter_map(|p| {
                    self.world.type_sig_name(handle.assembly, p, &ctx).ok()
                })
                .collect();
            if mparams == params {
                let info = MethodRefInfo {
                    declaring: subtype.to_string(),
                    name: name.to_string(),
                    sig,
                    sig_assembly: handle.assembly,
                    method_args: Vec::new(),
                };
                let key = format_method_key(subtype, name, &mparams, &[]);
                self.enqueue_method(&key, &info);
            }
        }
    }

    /// Locate the MethodDef rows for a seed and walk its body.
    fn process_method(&mut self, key: &str) {
        let seed = self.set.methods.get(key).cloned().expect("seed exists");
        let Some(handle) = self.world.find_type(&seed.declaring) else {
            // Arrays, pointers and runtime-only types have no rows; their
            // methods are runtime-provided.
            return;
        };

        let Some((asm_index, method_rid)) = self.find_method_def(handle, &seed, key) else {
            self.set
                .diagnostics
                .entry(key.to_string())
                .or_default()
                .push(format!(
                    "no definition for {key} in {}",
                    self.world.set.assembly(handle.assembly).name
                ));
            return;
        };
        if let Some(entry) = self.set.methods.get_mut(key) {
            entry.def = Some((asm_index, method_rid));
        }

        debug!(method = key, "walking body");
        self.walk_body(key, &seed, asm_index, method_rid);
    }

    fn find_method_def(
        &self,
        handle: TypeDefHandle,
        seed: &MethodSeed,
        key: &str,
    ) -> Option<(usize, u32)> {
        let asm = self.world.set.assembly(handle.assembly);
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
            let Ok(name) = asm.file.strings().get(method.name) else {
                continue;
            };
            if name != seed.name {
                continue;
            }
            let Ok(blob) = asm.file.blobs().get(method.signature) else {
                continue;
            };
            let Ok(sig) = signatures::parse_method_sig(blob) else {
                continue;
            };
            let info = MethodRefInfo {
                declaring: seed.declaring.clone(),
                name: seed.name.clone(),
                sig,
                sig_assembly: handle.assembly,
                method_args: seed.method_args.clone(),
            };
            if let Ok(candidate_key) = self.world.method_key(&info) {
                if candidate_key == key {
                    return Some((handle.assembly, m));
                }
            }
        }
        None
    }

    fn walk_body(&mut self, key: &str, seed: &MethodSeed, asm_index: usize, method_rid: u32) {
        let asm = self.world.set.assembly(asm_index);
        let tables = asm.file.tables();
        let Some(row) = tables.method_def.get(method_rid as usize - 1) else {
            return;
        };
        if row.rva == 0 {
            return;
        }
        let ctx = GenericContext {
            type_args: generic_args_of(&seed.declaring),
            method_args: seed.method_args.clone(),
        };

        let body = match asm.file.method_body(row.rva) {
            Ok(b) => b,
            Err(e) => {
                self.diag(key, format!("undecodable body: {e}"));
                return;
            }
        };

        if let Some(locals_token) = body.locals_token {
            self.add_locals(key, asm_index, locals_token, &ctx);
        }
        for region in &body.exception_regions {
            if let cil2cpp_metadata::il::HandlerKind::Catch(token) = region.kind {
                self.add_type_token(key, asm_index, token, &ctx);
            }
        }

        for instr in &body.instructions {
            match &instr.op {
                IlOp::Call(t) | IlOp::Jmp(t) | IlOp::LdFtn(t) => {
                    self.add_method_token(key, asm_index, *t, &ctx, false);
                }
                IlOp::NewObj(t) => {
                    self.add_method_token(key, asm_index, *t, &ctx, false);
                }
                IlOp::CallVirt(t) | IlOp::LdVirtFtn(t) => {
                    self.add_method_token(key, asm_index, *t, &ctx, true);
                }
                IlOp::CallI(t) => {
                    // Stand-alone signature: only types appear.
                    self.add_standalone_sig(key, asm_index, *t, &ctx);
                }
                IlOp::LdFld(t) | IlOp::LdFldA(t) | IlOp::StFld(t) => {
                    self.add_field_token(key, asm_index, *t, &ctx, false);
                }
                IlOp::LdSFld(t) | IlOp::LdSFldA(t) | IlOp::StSFld(t) => {
                    self.add_field_token(key, asm_index, *t, &ctx, true);
                }
                IlOp::NewArr(t)
                | IlOp::Box(t)
                | IlOp::Unbox(t)
                | IlOp::UnboxAny(t)
                | IlOp::CastClass(t)
                | IlOp::IsInst(t)
                | IlOp::CpObj(t)
                | IlOp::LdObj(t)
                | IlOp::StObj(t)
                | IlOp::InitObj(t)
                | IlOp::Constrained(t)
                | IlOp::SizeOf(t)
                | IlOp::MkRefAny(t)
                | IlOp::RefAnyVal(t)
                | IlOp::LdElemA(t)
                | IlOp::LdElemTok(t)
                | IlOp::StElemTok(t) => {
                    self.add_type_token(key, asm_index, *t, &ctx);
                    if matches!(&instr.op, IlOp::NewArr(_)) {
                        if let Ok(elem) = self.world.token_type_name(asm_index, *t, &ctx) {
                            self.add_type(&format!("{elem}[]"));
                        }
                    }
                }
                IlOp::LdToken(t) => {
                    self.add_any_token(key, asm_index, *t, &ctx);
                }
                _ => {}
            }
        }
    }

    fn diag(&mut self, key: &str, message: String) {
        self.set
            .diagnostics
            .entry(key.to_string())
            .or_default()
            .push(message);
    }

    fn add_locals(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) {
        if token.table() != Some(TableId::StandAloneSig) {
            return;
        }
        let asm = self.world.set.assembly(asm_index);
        let Some(row) = asm
            .file
            .tables()
            .stand_alone_sig
            .get(token.rid() as usize - 1)
        else {
            return;
        };
        let Ok(blob) = asm.file.blobs().get(row.signature) else {
            return;
        };
        match signatures::parse_locals_sig(blob) {
            Ok(locals) => {
                for local in locals {
                    match self.world.type_sig_name(asm_index, &local.ty, ctx) {
                        Ok(name) => self.add_type(&name),
                        Err(e) => self.diag(key, e),
                    }
                }
            }
            Err(e) => self.diag(key, e.to_string()),
        }
    }

    fn add_standalone_sig(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) {
        if token.table() != Some(TableId::StandAloneSig) {
            return;
        }
        let asm = self.world.set.assembly(asm_index);
        let Some(row) = asm
            .file
            .tables()
            .stand_alone_sig
            .get(token.rid() as usize - 1)
        else {
            return;
        };
        let Ok(blob) = asm.file.blobs().get(row.signature) else {
            return;
        };
        if let Ok(sig) = signatures::parse_method_sig(blob) {
            for p in sig.params.iter().chain(std::iter::once(&sig.return_type)) {
                match self.world.type_sig_name(asm_index, p, ctx) {
                    Ok(name) => self.add_type(&name),
                    Err(e) => self.diag(key, e),
                }
            }
        }
    }

    fn add_method_token(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
        virtual_call: bool,
    ) {
        match self.world.resolve_method_token(asm_index, token, ctx) {
            Ok(info) => match self.world.method_key(&info) {
                Ok(callee_key) => {
                    self.enqueue_method(&callee_key, &info);
                    let params = self.set.methods[&callee_key].params.clone();
                    if !info.sig.has_this {
                        self.add_cctor(&info.declaring);
                    }
                    if virtual_call {
                        let target = (info.declaring.clone(), info.name.clone(), params);
                        if self.virtual_targets.insert(target.clone()) {
                            let types: Vec<String> = self.types_order.clone();
                            for ty in types {
                                self.match_override(&ty, &target.0, &target.1, &target.2);
                            }
                        }
                    }
                }
                Err(e) => self.diag(key, e),
            },
            Err(e) => self.diag(key, e),
        }
    }

    fn add_field_token(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
        is_static: bool,
    ) {
        match self.world.resolve_field_token(asm_index, token, ctx) {
            Ok(info) => {
                self.add_type(&info.declaring);
                self.add_type(&info.ty);
                self.set
                    .fields
                    .insert(format_field_key(&info.declaring, &info.name));
                if is_static {
                    self.add_cctor(&info.declaring);
                }
            }
            Err(e) => self.diag(key, e),
        }
    }

    fn add_type_token(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) {
        match self.world.token_type_name(asm_index, token, ctx) {
            Ok(name) => self.add_type(&name),
            Err(e) => self.diag(key, e),
        }
    }

    fn add_any_token(
        &mut self,
        key: &str,
        asm_index: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) {
        match token.table() {
            Some(TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec) => {
                self.add_type_token(key, asm_index, token, ctx);
            }
            Some(TableId::MethodDef | TableId::MethodSpec) => {
                self.add_method_token(key, asm_index, token, ctx, false);
            }
            Some(TableId::Field) => {
                self.add_field_token(key, asm_index, token, ctx, false);
            }
            Some(TableId::MemberRef) => {
                // Could be either; try the method reading first, then field.
                if self
                    .world
                    .resolve_method_token(asm_index, token, ctx)
                    .is_ok()
                {
                    self.add_method_token(key, asm_index, token, ctx, false);
                } else {
                    self.add_field_token(key, asm_index, token, ctx, false);
                }
            }
            _ => self.diag(key, format!("ldtoken target {token} unsupported")),
        }
    }

    /// Reference to any static member pulls in the declaring type's static
    /// constructor.
    fn add_cctor(&mut self, declaring: &str) {
        let Some(handle) = self.world.find_type(declaring) else {
            return;
        };
        let asm = self.world.set.assembly(handle.assembly);
        let tables = asm.file.tables();
        let Some(row) = tables.type_def.get(handle.rid as usize - 1) else {
            return;
        };
        let method_end = tables.list_end(
            TableId::TypeDef,
            handle.rid,
            |t, r| t.type_def[r as usize - 1].method_list,
            TableId::MethodDef,
        );
        for m in row.method_list..method_end {
            let Some(method) = tables.method_def.get(m as usize - 1) else {
                continue;
            };
            let Ok(name) = asm.file.strings().get(method.name) else {
                continue;
            };
            if name != ".cctor" {
                continue;
            }
            let key = format_method_key(declaring, ".cctor", &[], &[]);
            if self.set.methods.contains_key(&key) {
                return;
            }
            let Ok(blob) = asm.file.blobs().get(method.signature) else {
                continue;
            };
            let Ok(sig) = signatures::parse_method_sig(blob) else {
                continue;
            };
            let info = MethodRefInfo {
                declaring: declaring.to_string(),
                name: ".cctor".to_string(),
                sig,
                sig_assembly: handle.assembly,
                method_args: Vec::new(),
            };
            self.enqueue_method(&key, &info);
            return;
        }
    }
}
