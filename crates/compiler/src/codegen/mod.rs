//! C++ code generation.
//!
//! The generator walks a finished [`IrModule`] and renders text artifacts:
//! one header, one data file (TypeInfos, v-tables, string pool, blobs,
//! static fields, cctor shims, P/Invoke trampolines), method partitions,
//! a stub file, optionally a main file, and the build manifest. All output
//! is accumulated in string buffers through `std::fmt::Write`; nothing
//! touches the filesystem here.
//!
//! The generator is total: every reachable method contributes exactly one
//! definition. Methods that fail a gate get a classified stub body instead
//! of being dropped, so the artifact always builds.

mod body;
mod data;
mod gates;
mod header;
mod mainfile;
mod methods;
mod stubs;

use std::collections::{BTreeMap, BTreeSet};

use fxhash::FxHashSet;
use tracing::info;

use crate::error::{CompileError, Result};
use crate::ir::{
    IrModule, MethodId, Primitive, StubReason, TypeId, TypeKind,
};
use crate::names::NameMapper;
use crate::options::{CompilerOptions, OutputKind};
use crate::runtime;

/// One output file.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub file_name: String,
    pub text: String,
}

/// A stub decided at IR time or by the emission gates.
#[derive(Debug, Clone)]
pub struct StubRecord {
    pub method: MethodId,
    pub method_key: String,
    pub symbol: String,
    pub reason: StubReason,
}

/// Everything the generator hands back to the driver.
pub struct GeneratedOutput {
    pub header: CodeUnit,
    pub data: CodeUnit,
    pub method_files: Vec<CodeUnit>,
    pub stub_file: CodeUnit,
    pub main_file: Option<CodeUnit>,
    pub manifest: CodeUnit,
    pub stubs: Vec<StubRecord>,
    /// Caller symbol -> callee symbols, one edge per IR call instruction.
    pub call_graph: BTreeMap<String, BTreeSet<String>>,
}

/// How a type appears in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeEmission {
    /// Full struct body.
    Struct,
    /// `using X = <alias>;`
    Alias,
    /// Primitive storage; no declaration needed.
    Primitive,
    /// Rendered inline (`T*`, byref); no declaration of its own.
    Inline,
    /// Only a forward declaration could be produced (unknown type).
    ForwardOnly,
    /// Never emitted (open generic, generic parameter).
    Skipped,
}

pub struct CppGen<'m> {
    pub module: &'m IrModule,
    pub options: &'m CompilerOptions,
    names: NameMapper,
    /// Per-TypeId identifier (struct/alias name); empty for inline kinds.
    type_idents: Vec<String>,
    type_emission: Vec<TypeEmission>,
    /// Per-MethodId function symbol (icall/pinvoke symbols included).
    method_idents: Vec<String>,
    /// Per-FieldId global identifier for statics; empty for instance.
    static_idents: Vec<String>,
    /// Function name -> declared arities, for the undeclared-callee gate.
    declared: BTreeMap<String, BTreeSet<usize>>,
    /// Types that got a full definition (gate 2 rejects value use of the
    /// rest).
    defined_types: FxHashSet<TypeId>,
    /// Types only forward-declared.
    pub header_forward_declared: FxHashSet<TypeId>,
    stubs: Vec<StubRecord>,
    call_graph: BTreeMap<String, BTreeSet<String>>,
}

impl<'m> CppGen<'m> {
    pub fn new(module: &'m IrModule, options: &'m CompilerOptions) -> CppGen<'m> {
        CppGen {
            module,
            options,
            names: NameMapper::new(),
            type_idents: vec![String::new(); module.types.len()],
            type_emission: vec![TypeEmission::Skipped; module.types.len()],
            method_idents: vec![String::new(); module.methods.len()],
            static_idents: vec![String::new(); module.fields.len()],
            declared: BTreeMap::new(),
            defined_types: FxHashSet::default(),
            header_forward_declared: FxHashSet::default(),
            stubs: Vec::new(),
            call_graph: BTreeMap::new(),
        }
    }

    pub fn emit(mut self) -> Result<GeneratedOutput> {
        self.prepare()?;

        let header = header::emit(&mut self)?;
        let (method_files, rendered) = methods::emit(&mut self)?;
        let data = data::emit(&mut self)?;
        let stub_file = stubs::emit(&mut self)?;
        let main_file = match self.options.output_kind {
            OutputKind::Executable => Some(mainfile::emit_main(&mut self)?),
            OutputKind::Library => None,
        };
        let manifest = mainfile::emit_manifest(&self, &method_files);

        info!(
            partitions = method_files.len(),
            rendered,
            stubs = self.stubs.len(),
            "emission complete"
        );
        Ok(GeneratedOutput {
            header,
            data,
            method_files,
            stub_file,
            main_file,
            manifest,
            stubs: self.stubs,
            call_graph: self.call_graph,
        })
    }

    /// Assign identifiers and emission forms for every entity, in
    /// deterministic (canonical name) order.
    fn prepare(&mut self) -> Result<()> {
        let ids: Vec<TypeId> = self.module.types_by_name.values().copied().collect();
        for id in ids {
            let (name, kind, runtime_provided, has_source, open) = {
                let ty = self.module.ty(id);
                (
                    ty.name.clone(),
                    ty.kind.clone(),
                    ty.runtime_provided,
                    ty.source.is_some(),
                    ty.is_open(),
                )
            };
            let emission = if open {
                return Err(CompileError::OpenGeneric { name });
            } else {
                match kind {
                    TypeKind::GenericParam { .. } => TypeEmission::Skipped,
                    TypeKind::Primitive(_) => TypeEmission::Primitive,
                    TypeKind::Pointer(_) | TypeKind::ByRef(_) => TypeEmission::Inline,
                    TypeKind::Array { .. } | TypeKind::Interface => TypeEmission::Alias,
                    TypeKind::Enum(_) => TypeEmission::Alias,
                    _ if runtime_provided => TypeEmission::Alias,
                    TypeKind::Class | TypeKind::ValueType | TypeKind::Delegate => {
                        if has_source {
                            TypeEmission::Struct
                        } else {
                            TypeEmission::ForwardOnly
                        }
                    }
                }
            };
            self.type_emission[id.0 as usize] = emission;
            // Even inline-rendered kinds (primitives, pointers) carry an
            // identifier: their TypeInfo symbols derive from it.
            if !matches!(emission, TypeEmission::Skipped) {
                self.type_idents[id.0 as usize] = self.names.type_name(&name)?;
            }
            match emission {
                TypeEmission::Struct | TypeEmission::Alias | TypeEmission::Primitive => {
                    self.defined_types.insert(id);
                }
                TypeEmission::ForwardOnly => {
                    self.header_forward_declared.insert(id);
                }
                _ => {}
            }
        }

        // Method symbols, key order for determinism.
        let mut method_ids: Vec<MethodId> = (0..self.module.methods.len())
            .map(|i| MethodId(i as u32))
            .collect();
        method_ids.sort_by_key(|id| self.module.method_key_string(*id));
        for id in method_ids {
            let m = self.module.method(id);
            if m.is_open_generic() {
                continue;
            }
            let symbol = if let Some(icall) = &m.icall {
                icall.clone()
            } else if m.flags.contains(crate::ir::MethodFlags::PINVOKE) {
                let entry = m.pinvoke_entry.clone().unwrap_or_else(|| m.name.clone());
                let sig: String = m
                    .params
                    .iter()
                    .map(|p| self.module.ty(p.ty).name.clone())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("pinv_{}_{}", crate::names::mangle(&entry), crate::names::hash_suffix(&sig))
            } else {
                let declaring = self.module.ty(m.declaring).name.clone();
                let mut sig: String = m
                    .params
                    .iter()
                    .map(|p| self.module.ty(p.ty).name.clone())
                    .collect::<Vec<_>>()
                    .join(",");
                if !m.generic_args.is_empty() {
                    sig.push('|');
                    sig.push_str(
                        &m.generic_args
                            .iter()
                            .map(|t| self.module.ty(*t).name.clone())
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
                self.names.method_name(&declaring, &m.name, &sig)?
            };
            self.method_idents[id.0 as usize] = symbol;
        }

        // Static-field globals.
        for field in &self.module.fields {
            if field.is_static && !field.is_literal {
                let declaring = self.module.ty(field.declaring).name.clone();
                self.static_idents[field.id.0 as usize] =
                    self.names.field_name(&declaring, &field.name)?;
            }
        }

        // Runtime functions are declared by the emitted header's include.
        for decl in runtime::RUNTIME_DECLARATIONS.iter() {
            self.declared.entry(decl.name.to_string()).or_default();
        }
        Ok(())
    }

    pub fn type_ident(&self, id: TypeId) -> &str {
        &self.type_idents[id.0 as usize]
    }

    pub fn type_emission(&self, id: TypeId) -> TypeEmission {
        self.type_emission[id.0 as usize]
    }

    pub fn method_symbol(&self, id: MethodId) -> &str {
        &self.method_idents[id.0 as usize]
    }

    pub fn static_ident(&self, id: crate::ir::FieldId) -> &str {
        &self.static_idents[id.0 as usize]
    }

    pub fn is_defined(&self, id: TypeId) -> bool {
        self.defined_types.contains(&id)
    }

    /// Record a declared function and its arity (receiver included).
    pub fn declare(&mut self, name: &str, arity: usize) {
        self.declared.entry(name.to_string()).or_default().insert(arity);
    }

    /// Gate-4 query: is `name` declared, and if arity sets were recorded,
    /// does this arity appear? (Runtime functions register with an empty
    /// set, which matches every arity — varargs live there.)
    pub fn is_declared(&self, name: &str, arity: usize) -> bool {
        match self.declared.get(name) {
            None => false,
            Some(set) => set.is_empty() || set.contains(&arity),
        }
    }

    pub fn record_stub(&mut self, id: MethodId, reason: StubReason) {
        self.stubs.push(StubRecord {
            method: id,
            method_key: self.module.method_key_string(id),
            symbol: self.method_symbol(id).to_string(),
            reason,
        });
    }

    pub fn stub_records(&self) -> &[StubRecord] {
        &self.stubs
    }

    pub fn add_call_edge(&mut self, caller: &str, callee: &str) {
        self.call_graph
            .entry(caller.to_string())
            .or_default()
            .insert(callee.to_string());
    }

    /// The C++ type expression for values of `id`.
    pub fn cpp_type(&self, id: TypeId) -> String {
        let ty = self.module.ty(id);
        match &ty.kind {
            TypeKind::Primitive(p) => p.cpp_name().to_string(),
            TypeKind::Enum(_) | TypeKind::ValueType => self.type_ident(id).to_string(),
            TypeKind::Pointer(inner) | TypeKind::ByRef(inner) => {
                format!("{}*", self.cpp_type(*inner))
            }
            TypeKind::GenericParam { .. } => "void*".to_string(),
            TypeKind::Array { .. } => "c2c_array*".to_string(),
            TypeKind::Class | TypeKind::Interface | TypeKind::Delegate => {
                if ty.runtime_provided {
                    format!(
                        "{}*",
                        runtime::runtime_alias(&ty.name)
                            .map(|r| r.alias)
                            .unwrap_or("c2c_object")
                    )
                } else if self.type_idents[id.0 as usize].is_empty() {
                    "c2c_object*".to_string()
                } else {
                    format!("{}*", self.type_ident(id))
                }
            }
        }
    }

    /// TypeInfo symbol for a type.
    pub fn typeinfo_ident(&self, id: TypeId) -> String {
        let ident = self.type_ident(id);
        if ident.is_empty() {
            format!("ti_anon_{}", id.0)
        } else {
            format!("ti_{ident}")
        }
    }

    pub fn vtable_ident(&self, id: TypeId) -> String {
        format!("vt_{}", self.type_ident(id))
    }

    pub fn cctor_guard_ident(&self, id: TypeId) -> String {
        format!("cctor_once_{}", self.type_ident(id))
    }

    pub fn ensure_cctor_ident(&self, id: TypeId) -> String {
        format!("ensure_cctor_{}", self.type_ident(id))
    }

    /// Struct member name for an instance field.
    pub fn field_member(&self, field: crate::ir::FieldId) -> String {
        format!("f_{}", crate::names::mangle(&self.module.field(field).name))
    }

    /// True when the type needs a TypeInfo record. Byrefs, bare generic
    /// parameters and function pointers never do.
    pub fn needs_typeinfo(&self, id: TypeId) -> bool {
        let ty = self.module.ty(id);
        !matches!(
            ty.kind,
            TypeKind::ByRef(_) | TypeKind::GenericParam { .. }
        ) && !matches!(
            self.type_emission(id),
            TypeEmission::Skipped
        ) && !ty.name.starts_with("fnptr<")
            && !matches!(ty.kind, TypeKind::Primitive(Primitive::Void))
    }

    /// Is this method emitted at all (body, stub or declaration)?
    pub fn is_emitted(&self, id: MethodId) -> bool {
        !self.module.method(id).is_open_generic()
    }

    /// Receiver type expression for instance methods: always a pointer,
    /// including value-type receivers.
    pub fn receiver_type(&self, declaring: TypeId) -> String {
        let ty = self.module.ty(declaring);
        if ty.is_value_like() {
            format!("{}*", self.cpp_type(declaring))
        } else {
            self.cpp_type(declaring)
        }
    }

    /// `RET sym(params)` for a method, plus the parameter count including
    /// the receiver (the declared arity for gate 4).
    pub fn fn_signature(&self, id: MethodId) -> (String, usize) {
        let m = self.module.method(id);
        let ret = self.cpp_type(m.return_type);
        let mut params: Vec<String> = Vec::with_capacity(m.params.len() + 1);
        if !m.is_static() {
            params.push(format!("{} self", self.receiver_type(m.declaring)));
        }
        for p in &m.params {
            params.push(format!("{} {}", self.cpp_type(p.ty), p.name));
        }
        let arity = params.len();
        (
            format!("{} {}({})", ret, self.method_symbol(id), params.join(", ")),
            arity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BasicBlock, BinOp, BlockId, Instr, InstrKind, IrParam, MethodFlags, Primitive,
        Terminator, TypeSource, Value,
    };
    use crate::world::format_field_key;

    /// A small self-consistent module: one value type with a cctor, a
    /// static field, an entry point doing a checked add and a static load.
    fn demo_module() -> IrModule {
        let mut m = IrModule::new("Demo");
        let void = m.intern_type("System.Void", TypeKind::Primitive(Primitive::Void));
        let i4 = m.intern_type("System.Int32", TypeKind::Primitive(Primitive::I4));
        let counter = m.intern_type("Demo.Counter", TypeKind::ValueType);
        {
            let ty = m.ty_mut(counter);
            ty.source = Some(TypeSource {
                assembly: 0,
                type_def: 1,
            });
            ty.instance_size = 4;
            ty.element_size = 4;
            ty.alignment = 4;
        }
        let sf = m.intern_field(&format_field_key("Demo.Counter", "Count"), counter, "Count");
        {
            let f = m.field_mut(sf);
            f.ty = i4;
            f.is_static = true;
        }

        let cctor = m.intern_method("Demo.Counter::.cctor()", counter, ".cctor");
        {
            let method = m.method_mut(cctor);
            method.flags = MethodFlags::STATIC;
            method.return_type = void;
            method.blocks = vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![],
                terminator: Terminator::Return(None),
            }];
            method.instruction_count = 1;
        }
        m.ty_mut(counter).cctor = Some(cctor);

        let add = m.intern_method("Demo.Counter::Add(System.Int32,System.Int32)", counter, "Add");
        {
            let v0 = Value { id: 0, ty: i4 };
            let v1 = Value { id: 1, ty: i4 };
            let v2 = Value { id: 2, ty: i4 };
            let method = m.method_mut(add);
            method.flags = MethodFlags::STATIC;
            method.return_type = i4;
            method.params = vec![
                IrParam {
                    name: "a0".into(),
                    ty: i4,
                    byref: false,
                },
                IrParam {
                    name: "a1".into(),
                    ty: i4,
                    byref: false,
                },
            ];
            method.blocks = vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![
                    Instr {
                        dest: Some(v0),
                        kind: InstrKind::LoadParam(0),
                    },
                    Instr {
                        dest: Some(v1),
                        kind: InstrKind::LoadParam(1),
                    },
                    Instr {
                        dest: Some(v2),
                        kind: InstrKind::Binary {
                            op: BinOp::Add,
                            checked: true,
                            unsigned: false,
                            lhs: v0,
                            rhs: v1,
                        },
                    },
                ],
                terminator: Terminator::Return(Some(v2)),
            }];
            method.instruction_count = 4;
        }

        let main = m.intern_method("Demo.Counter::Main()", counter, "Main");
        {
            let v0 = Value { id: 0, ty: i4 };
            let method = m.method_mut(main);
            method.flags = MethodFlags::STATIC | MethodFlags::ENTRY_POINT;
            method.return_type = i4;
            method.blocks = vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![Instr {
                    dest: Some(v0),
                    kind: InstrKind::LoadStatic(sf),
                }],
                terminator: Terminator::Return(Some(v0)),
            }];
            method.instruction_count = 2;
        }
        m.entry_point = Some(main);
        m
    }

    fn emit_demo() -> GeneratedOutput {
        let module = demo_module();
        let options = CompilerOptions::new("Demo.dll");
        // The module is leaked so the generator's borrows live long enough
        // for the test body; fine in tests.
        let module: &'static IrModule = Box::leak(Box::new(module));
        let options: &'static CompilerOptions = Box::leak(Box::new(options));
        CppGen::new(module, options).emit().unwrap()
    }

    #[test]
    fn exactly_one_struct_and_typeinfo_per_type() {
        let out = emit_demo();
        assert_eq!(out.header.text.matches("struct Demo_Counter {").count(), 1);
        assert_eq!(
            out.data
                .text
                .matches("const c2c_typeinfo ti_Demo_Counter =")
                .count(),
            1
        );
        // Primitives get TypeInfos too, exactly once each.
        assert_eq!(
            out.data
                .text
                .matches("const c2c_typeinfo ti_System_Int32 =")
                .count(),
            1
        );
    }

    #[test]
    fn checked_add_maps_to_the_overflow_template() {
        let out = emit_demo();
        let methods: String = out
            .method_files
            .iter()
            .map(|f| f.text.clone())
            .collect();
        assert!(methods.contains("c2c_add_ovf<int32_t>"));
        assert!(!methods.contains("t2 = t0 + t1"));
    }

    #[test]
    fn static_access_is_preceded_by_the_cctor_shim() {
        let out = emit_demo();
        let methods: String = out
            .method_files
            .iter()
            .map(|f| f.text.clone())
            .collect();
        let ensure = methods.find("ensure_cctor_Demo_Counter();").unwrap();
        let load = methods.find("= Demo_Counter_f_Count;").unwrap();
        assert!(ensure < load);
        // And the shim itself runs the cctor at most once.
        assert!(out.data.text.contains("c2c_ensure_cctor(&cctor_once_Demo_Counter"));
    }

    #[test]
    fn emission_is_deterministic() {
        let a = emit_demo();
        let b = emit_demo();
        assert_eq!(a.header.text, b.header.text);
        assert_eq!(a.data.text, b.data.text);
        assert_eq!(a.stub_file.text, b.stub_file.text);
        let files_a: Vec<_> = a.method_files.iter().map(|f| &f.text).collect();
        let files_b: Vec<_> = b.method_files.iter().map(|f| &f.text).collect();
        assert_eq!(files_a, files_b);
    }

    #[test]
    fn every_emitted_identifier_is_legal() {
        let out = emit_demo();
        for unit in [&out.header, &out.data] {
            for token in unit.text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
                if let Some(rest) = token.strip_prefix("ti_") {
                    assert!(crate::names::verify_identifier(&format!("ti_{rest}")).is_ok());
                }
            }
        }
    }

    #[test]
    fn ir_level_stubs_land_in_the_stub_file_with_their_reason() {
        let mut module = demo_module();
        let add = module
            .lookup_method("Demo.Counter::Add(System.Int32,System.Int32)")
            .unwrap();
        {
            let method = module.method_mut(add);
            method.stub_reason = Some(crate::ir::StubReason::KnownBrokenPattern(
                "simd-intrinsic".to_string(),
            ));
            method.blocks.clear();
        }
        let module: &'static IrModule = Box::leak(Box::new(module));
        let options: &'static CompilerOptions =
            Box::leak(Box::new(CompilerOptions::new("Demo.dll")));
        let out = CppGen::new(module, options).emit().unwrap();

        // Exactly one definition: the stub file has it, the partitions do
        // not, and the header still declares it.
        assert!(out.stub_file.text.contains("KnownBrokenPattern: simd-intrinsic"));
        assert_eq!(out.stubs.len(), 1);
        let methods: String = out
            .method_files
            .iter()
            .map(|f| f.text.clone())
            .collect();
        assert!(!methods.contains("c2c_add_ovf"));
        assert!(out.header.text.contains("Demo_Counter_Add_o"));
    }

    #[test]
    fn manifest_names_every_source_file() {
        let out = emit_demo();
        for unit in out.method_files.iter() {
            assert!(out.manifest.text.contains(&unit.file_name));
        }
        assert!(out.manifest.text.contains("Demo_data.cpp"));
        assert!(out.manifest.text.contains("Demo_stubs.cpp"));
        assert!(out.manifest.text.contains("Demo_main.cpp"));
        assert!(out.manifest.text.contains("cil2cpp_runtime"));
    }
}
