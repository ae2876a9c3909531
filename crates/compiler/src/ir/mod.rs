//! The typed intermediate representation.
//!
//! Everything downstream of reachability lives in one [`IrModule`] arena:
//! types, methods and fields are interned by canonical name and addressed
//! by index newtypes. The module is built up by the eight passes in
//! [`crate::ir::builder`] and is immutable once handed to the generator.

pub mod builder;
mod cfg;
mod layout;
mod literals;
mod lower;
mod specialize;
mod verify;
mod vtable;

use fxhash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(pub u32);

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ty{}", self.0)
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// What a type is, structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    ValueType,
    /// Enum with its underlying primitive.
    Enum(TypeId),
    Interface,
    Delegate,
    Array { element: TypeId, rank: u32 },
    Pointer(TypeId),
    ByRef(TypeId),
    /// Unbound `Var`/`MVar`; only open definitions carry these.
    GenericParam { index: u32, method: bool },
    /// Primitive kept distinct from ValueType so layout and rendering can
    /// special-case it without string comparisons.
    Primitive(Primitive),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    ISize,
    USize,
    F4,
    F8,
}

impl Primitive {
    pub fn size(self) -> u32 {
        match self {
            Primitive::Void => 0,
            Primitive::Bool | Primitive::I1 | Primitive::U1 => 1,
            Primitive::Char | Primitive::I2 | Primitive::U2 => 2,
            Primitive::I4 | Primitive::U4 | Primitive::F4 => 4,
            Primitive::I8
            | Primitive::U8
            | Primitive::ISize
            | Primitive::USize
            | Primitive::F8 => 8,
        }
    }

    pub fn cpp_name(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "int32_t",
            Primitive::Char => "char16_t",
            Primitive::I1 => "int8_t",
            Primitive::U1 => "uint8_t",
            Primitive::I2 => "int16_t",
            Primitive::U2 => "uint16_t",
            Primitive::I4 => "int32_t",
            Primitive::U4 => "uint32_t",
            Primitive::I8 => "int64_t",
            Primitive::U8 => "uint64_t",
            Primitive::ISize => "intptr_t",
            Primitive::USize => "uintptr_t",
            Primitive::F4 => "float",
            Primitive::F8 => "double",
        }
    }
}

/// Where an IR type's rows live, for types read from metadata.
#[derive(Debug, Clone, Copy)]
pub struct TypeSource {
    pub assembly: usize,
    /// 1-based TypeDef rid.
    pub type_def: u32,
}

#[derive(Debug, Clone)]
pub struct InterfaceTable {
    pub interface: TypeId,
    /// One implementing method per interface slot.
    pub slots: Vec<MethodId>,
}

#[derive(Debug, Clone)]
pub struct IrType {
    pub id: TypeId,
    /// Canonical full name, generic arguments bound.
    pub name: String,
    pub namespace: String,
    pub simple_name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    /// Declared order; determines v-table slots for new virtuals.
    pub methods: Vec<MethodId>,
    pub fields: Vec<FieldId>,
    pub generic_args: Vec<TypeId>,
    pub generic_param_count: u32,
    pub instance_size: u32,
    /// Array element or primitive storage size.
    pub element_size: u32,
    pub alignment: u32,
    pub pack: Option<u16>,
    pub explicit_size: Option<u32>,
    pub explicit_layout: bool,
    pub is_abstract: bool,
    pub is_sealed: bool,
    pub is_public: bool,
    pub has_references: bool,
    pub runtime_provided: bool,
    pub vtable: Vec<MethodId>,
    pub interface_tables: Vec<InterfaceTable>,
    pub cctor: Option<MethodId>,
    pub finalizer: Option<MethodId>,
    pub default_ctor: Option<MethodId>,
    pub source: Option<TypeSource>,
}

impl IrType {
    pub fn is_value_like(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::ValueType | TypeKind::Enum(_) | TypeKind::Primitive(_)
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.kind, TypeKind::GenericParam { .. })
            || (self.generic_param_count > 0 && self.generic_args.is_empty())
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        const STATIC = 1 << 0;
        const VIRTUAL = 1 << 1;
        const ABSTRACT = 1 << 2;
        const NEW_SLOT = 1 << 3;
        const FINAL = 1 << 4;
        const SPECIAL_NAME = 1 << 5;
        const ENTRY_POINT = 1 << 6;
        const INTERNAL_CALL = 1 << 7;
        const PINVOKE = 1 << 8;
        /// Body supplied by the runtime (delegate ctor/Invoke and friends).
        const RUNTIME = 1 << 9;
    }
}

#[derive(Debug, Clone)]
pub struct IrParam {
    pub name: String,
    pub ty: TypeId,
    pub byref: bool,
}

#[derive(Debug, Clone)]
pub struct IrLocal {
    pub ty: TypeId,
    pub byref: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PInvokeInfo<'a> {
    pub module: &'a str,
    pub entry: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodSource {
    pub assembly: usize,
    /// 1-based MethodDef rid.
    pub method_def: u32,
}

/// Why a method could not be lowered. `Cascade` exists only in the
/// analyzer; lowering always records a primary cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReason {
    ClrInternalType(String),
    UnknownParameterTypes(String),
    UnknownBodyReferences(String),
    UndeclaredFunction(String),
    KnownBrokenPattern(String),
    RenderedBodyError(String),
    MissingBody,
}

impl StubReason {
    pub fn category(&self) -> &'static str {
        match self {
            StubReason::ClrInternalType(_) => "ClrInternalType",
            StubReason::UnknownParameterTypes(_) => "UnknownParameterTypes",
            StubReason::UnknownBodyReferences(_) => "UnknownBodyReferences",
            StubReason::UndeclaredFunction(_) => "UndeclaredFunction",
            StubReason::KnownBrokenPattern(_) => "KnownBrokenPattern",
            StubReason::RenderedBodyError(_) => "RenderedBodyError",
            StubReason::MissingBody => "MissingBody",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            StubReason::ClrInternalType(s)
            | StubReason::UnknownParameterTypes(s)
            | StubReason::UnknownBodyReferences(s)
            | StubReason::UndeclaredFunction(s)
            | StubReason::KnownBrokenPattern(s)
            | StubReason::RenderedBodyError(s) => s,
            StubReason::MissingBody => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrMethod {
    pub id: MethodId,
    pub name: String,
    pub declaring: TypeId,
    /// Excludes the receiver.
    pub params: Vec<IrParam>,
    pub return_type: TypeId,
    pub flags: MethodFlags,
    pub generic_args: Vec<TypeId>,
    pub generic_param_count: u32,
    pub locals: Vec<IrLocal>,
    pub blocks: Vec<BasicBlock>,
    pub exception_regions: Vec<IrExceptionRegion>,
    pub vtable_slot: Option<u32>,
    pub pinvoke_module: Option<String>,
    pub pinvoke_entry: Option<String>,
    pub icall: Option<String>,
    pub stub_reason: Option<StubReason>,
    pub instruction_count: usize,
    pub source: Option<MethodSource>,
}

impl IrMethod {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodFlags::VIRTUAL)
    }

    /// Declared-only methods get no body of their own in the output.
    pub fn is_declared_only(&self) -> bool {
        self.icall.is_some()
            || self.flags.contains(MethodFlags::PINVOKE)
            || self.flags.contains(MethodFlags::RUNTIME)
    }

    pub fn is_open_generic(&self) -> bool {
        self.generic_param_count > 0 && self.generic_args.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IrField {
    pub id: FieldId,
    pub name: String,
    pub declaring: TypeId,
    pub ty: TypeId,
    pub is_static: bool,
    pub is_literal: bool,
    /// Instance fields only; relative to the struct start (object header
    /// included for classes).
    pub offset: u32,
    /// RVA-backed initializer blob, if any.
    pub rva_blob: Option<BlobId>,
}

/// An SSA-ish value handle: every producing instruction names one, every
/// operand carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub id: u32,
    pub ty: TypeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    CheckFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Static,
    Instance,
    Virtual,
    Interface,
    /// `constrained.` prefix carrying the constraint type.
    Constrained(TypeId),
}

/// Signature for indirect calls through a function pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnSig {
    pub params: Vec<TypeId>,
    pub ret: TypeId,
}

/// The instruction set. One variant per semantic operation of the source
/// instruction stream; overflow and signedness survive as explicit flags
/// rather than being folded away.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    ConstI32(i32),
    ConstI64(i64),
    ConstF32(f32),
    ConstF64(f64),
    ConstNull,
    ConstString(StringId),
    LoadLocal(u16),
    StoreLocal(u16, Value),
    LoadParam(u16),
    StoreParam(u16, Value),
    LocalAddr(u16),
    ParamAddr(u16),
    LoadField { object: Value, field: FieldId },
    StoreField { object: Value, field: FieldId, value: Value },
    FieldAddr { object: Value, field: FieldId },
    LoadStatic(FieldId),
    StoreStatic { field: FieldId, value: Value },
    StaticAddr(FieldId),
    NewArray { element: TypeId, length: Value },
    ArrayLength(Value),
    LoadElement { array: Value, index: Value, element: TypeId },
    StoreElement { array: Value, index: Value, value: Value, element: TypeId },
    ElementAddr { array: Value, index: Value, element: TypeId },
    InitArrayData { array: Value, blob: BlobId },
    Call { callee: MethodId, args: Vec<Value>, kind: CallKind },
    CallIndirect { function: Value, args: Vec<Value>, sig: FnSig },
    InvokeDelegate { delegate: Value, args: Vec<Value> },
    NewObject { ctor: MethodId, args: Vec<Value> },
    Box { value: Value, ty: TypeId },
    /// `unbox`: null-check then interior pointer to the payload.
    UnboxPtr { object: Value, ty: TypeId },
    /// `unbox.any`: payload copied out by value.
    UnboxValue { object: Value, ty: TypeId },
    IsInstance { object: Value, ty: TypeId },
    Cast { object: Value, ty: TypeId },
    Binary { op: BinOp, checked: bool, unsigned: bool, lhs: Value, rhs: Value },
    /// `unordered` doubles as "unsigned" for integer operands, per the
    /// source instruction set.
    Compare { op: CmpOp, unordered: bool, lhs: Value, rhs: Value },
    Unary { op: UnOp, value: Value },
    Convert { to: TypeId, value: Value, checked: bool, source_unsigned: bool },
    LoadIndirect { address: Value, ty: TypeId },
    StoreIndirect { address: Value, value: Value, ty: TypeId },
    LoadFunction(MethodId),
    LoadVirtualFunction { object: Value, method: MethodId },
    LoadTypeHandle(TypeId),
    LoadMethodHandle(MethodId),
    LoadFieldHandle(FieldId),
    InitValue { address: Value, ty: TypeId },
    CopyValue { dest: Value, src: Value, ty: TypeId },
    SizeOf(TypeId),
    StackAlloc(Value),
    MakeTypedRef { address: Value, ty: TypeId },
    TypedRefValue { typed_ref: Value, ty: TypeId },
    TypedRefType(Value),
    ArgumentList,
    /// Escape hatch: opaque target-language text with an optional result
    /// type, for constructs no higher-level variant expresses faithfully.
    /// `{0}`, `{1}`, … in the text splice in the rendered operands.
    Raw { ty: Option<TypeId>, text: String, args: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub dest: Option<Value>,
    pub kind: InstrKind,
}

/// Block terminators; only these transfer control.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Goto(BlockId),
    Branch { condition: Value, if_true: BlockId, if_false: BlockId },
    Switch { value: Value, targets: Vec<BlockId>, default: BlockId },
    Return(Option<Value>),
    Throw(Value),
    Rethrow,
    /// Exit of one or more protected regions toward a join block.
    Leave(BlockId),
    EndFinally,
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn successors(&self) -> Vec<BlockId> {
        match &self.terminator {
            Terminator::Goto(b) | Terminator::Leave(b) => vec![*b],
            Terminator::Branch {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminator::Switch {
                targets, default, ..
            } => {
                let mut out = targets.clone();
                out.push(*default);
                out
            }
            Terminator::Return(_)
            | Terminator::Throw(_)
            | Terminator::Rethrow
            | Terminator::EndFinally
            | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Catch(TypeId),
    Finally,
    Fault,
}

/// A protected region over contiguous block ranges (inclusive).
#[derive(Debug, Clone)]
pub struct IrExceptionRegion {
    pub kind: RegionKind,
    pub try_start: BlockId,
    pub try_end: BlockId,
    pub handler_start: BlockId,
    pub handler_end: BlockId,
}

/// A pooled UTF-16 literal.
#[derive(Debug, Clone)]
pub struct StringLiteral {
    pub id: StringId,
    /// Mangled symbol, stable across runs (derived from the content hash).
    pub symbol: String,
    pub units: Vec<u16>,
}

/// An RVA-backed array initializer.
#[derive(Debug, Clone)]
pub struct DataBlob {
    pub id: BlobId,
    pub symbol: String,
    pub bytes: Vec<u8>,
    pub alignment: u32,
}

/// The finished module.
pub struct IrModule {
    pub name: String,
    pub types: Vec<IrType>,
    pub methods: Vec<IrMethod>,
    pub fields: Vec<IrField>,
    pub strings: Vec<StringLiteral>,
    pub blobs: Vec<DataBlob>,
    pub entry_point: Option<MethodId>,
    /// Canonical name -> id, in deterministic order for emission walks.
    pub types_by_name: BTreeMap<String, TypeId>,
    method_keys: FxHashMap<String, MethodId>,
    field_keys: FxHashMap<String, FieldId>,
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> IrModule {
        IrModule {
            name: name.into(),
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            strings: Vec::new(),
            blobs: Vec::new(),
            entry_point: None,
            types_by_name: BTreeMap::new(),
            method_keys: FxHashMap::default(),
            field_keys: FxHashMap::default(),
        }
    }

    pub fn ty(&self, id: TypeId) -> &IrType {
        &self.types[id.0 as usize]
    }

    pub fn ty_mut(&mut self, id: TypeId) -> &mut IrType {
        &mut self.types[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &IrMethod {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut IrMethod {
        &mut self.methods[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &IrField {
        &self.fields[id.0 as usize]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut IrField {
        &mut self.fields[id.0 as usize]
    }

    pub fn lookup_type(&self, canonical: &str) -> Option<TypeId> {
        self.types_by_name.get(canonical).copied()
    }

    /// Intern a type shell by canonical name. The caller fills in the rest.
    pub fn intern_type(&mut self, canonical: &str, kind: TypeKind) -> TypeId {
        if let Some(id) = self.types_by_name.get(canonical) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        let (namespace, simple_name) = split_canonical(canonical);
        self.types.push(IrType {
            id,
            name: canonical.to_string(),
            namespace,
            simple_name,
            kind,
            base: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            generic_args: Vec::new(),
            generic_param_count: 0,
            instance_size: 0,
            element_size: 0,
            alignment: 1,
            pack: None,
            explicit_size: None,
            explicit_layout: false,
            is_abstract: false,
            is_sealed: false,
            is_public: false,
            has_references: false,
            runtime_provided: false,
            vtable: Vec::new(),
            interface_tables: Vec::new(),
            cctor: None,
            finalizer: None,
            default_ctor: None,
            source: None,
        });
        self.types_by_name.insert(canonical.to_string(), id);
        id
    }

    pub fn lookup_method(&self, key: &str) -> Option<MethodId> {
        self.method_keys.get(key).copied()
    }

    /// Intern a method shell under its canonical key
    /// (`Type::Name(sig)<margs>`).
    pub fn intern_method(&mut self, key: &str, declaring: TypeId, name: &str) -> MethodId {
        if let Some(id) = self.method_keys.get(key) {
            return *id;
        }
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(IrMethod {
            id,
            name: name.to_string(),
            declaring,
            params: Vec::new(),
            return_type: TypeId(0),
            flags: MethodFlags::empty(),
            generic_args: Vec::new(),
            generic_param_count: 0,
            locals: Vec::new(),
            blocks: Vec::new(),
            exception_regions: Vec::new(),
            vtable_slot: None,
            pinvoke_module: None,
            pinvoke_entry: None,
            icall: None,
            stub_reason: None,
            instruction_count: 0,
            source: None,
        });
        self.method_keys.insert(key.to_string(), id);
        self.types[declaring.0 as usize].methods.push(id);
        id
    }

    pub fn lookup_field(&self, key: &str) -> Option<FieldId> {
        self.field_keys.get(key).copied()
    }

    pub fn intern_field(&mut self, key: &str, declaring: TypeId, name: &str) -> FieldId {
        if let Some(id) = self.field_keys.get(key) {
            return *id;
        }
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(IrField {
            id,
            name: name.to_string(),
            declaring,
            ty: TypeId(0),
            is_static: false,
            is_literal: false,
            offset: 0,
            rva_blob: None,
        });
        self.field_keys.insert(key.to_string(), id);
        self.types[declaring.0 as usize].fields.push(id);
        id
    }

    /// Deterministic emission order: canonical-name order.
    pub fn types_in_order(&self) -> impl Iterator<Item = &IrType> {
        self.types_by_name.values().map(|id| self.ty(*id))
    }

    /// Reconstruct the canonical method key (`Type::Name(params)<margs>`)
    /// from an interned method. Byref markers live in the parameter types'
    /// canonical names, so overloads stay distinct.
    pub fn method_key_string(&self, id: MethodId) -> String {
        let m = self.method(id);
        let declaring = &self.ty(m.declaring).name;
        let params = m
            .params
            .iter()
            .map(|p| self.ty(p.ty).name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut key = format!("{declaring}::{}({params})", m.name);
        if !m.generic_args.is_empty() {
            let margs = m
                .generic_args
                .iter()
                .map(|t| self.ty(*t).name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            key.push('<');
            key.push_str(&margs);
            key.push('>');
        }
        key
    }
}

fn split_canonical(canonical: &str) -> (String, String) {
    // Strip generic arguments before splitting off the namespace.
    let head = canonical.split('<').next().unwrap_or(canonical);
    match head.rsplit_once('.') {
        Some((ns, simple)) => (ns.to_string(), simple.to_string()),
        None => (String::new(), head.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut module = IrModule::new("test");
        let a = module.intern_type("NS.Foo", TypeKind::Class);
        let b = module.intern_type("NS.Foo", TypeKind::Class);
        assert_eq!(a, b);
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.ty(a).namespace, "NS");
        assert_eq!(module.ty(a).simple_name, "Foo");
    }

    #[test]
    fn canonical_split_ignores_generic_arguments() {
        let (ns, simple) = split_canonical("System.Collections.Generic.List`1<A.B>");
        assert_eq!(ns, "System.Collections.Generic");
        assert_eq!(simple, "List`1");
    }

    #[test]
    fn method_interning_attaches_to_declaring_type() {
        let mut module = IrModule::new("test");
        let t = module.intern_type("NS.Foo", TypeKind::Class);
        let m = module.intern_method("NS.Foo::Run()", t, "Run");
        assert_eq!(module.ty(t).methods, vec![m]);
        assert_eq!(module.lookup_method("NS.Foo::Run()"), Some(m));
    }

    #[test]
    fn successors_cover_all_terminators() {
        let block = BasicBlock {
            id: BlockId(0),
            instrs: Vec::new(),
            terminator: Terminator::Switch {
                value: Value {
                    id: 0,
                    ty: TypeId(0),
                },
                targets: vec![BlockId(1), BlockId(2)],
                default: BlockId(3),
            },
        };
        assert_eq!(
            block.successors(),
            vec![BlockId(1), BlockId(2), BlockId(3)]
        );
    }
}
