//! Canonical names and token resolution over the assembly set.
//!
//! Everything in the pipeline is keyed by canonical name: types as
//! `Namespace.Name`, nested types as `Enclosing/Nested`, constructed
//! generics as `` Def`N<Arg,...> ``, arrays/pointers/byrefs as suffixes.
//! This module turns metadata tokens — with a generic binding context —
//! into those names. Resolution failures come back as plain strings; the
//! callers (reachability, lowering) record them as diagnostics and keep
//! going, because per-method failures must never abort the pipeline.

use cil2cpp_metadata::signatures::{self, MethodSig, TypeSig};
use cil2cpp_metadata::tables::{MetadataToken, TableId};

use crate::assembly_set::{AssemblySet, TypeDefHandle};

/// Bound generic arguments for the position being resolved.
#[derive(Debug, Clone, Default)]
pub struct GenericContext {
    /// Canonical names bound to `Var` slots.
    pub type_args: Vec<String>,
    /// Canonical names bound to `MVar` slots.
    pub method_args: Vec<String>,
}

impl GenericContext {
    pub fn for_type(type_args: Vec<String>) -> GenericContext {
        GenericContext {
            type_args,
            method_args: Vec::new(),
        }
    }
}

/// A resolved method reference, ready to be turned into a method key.
#[derive(Debug, Clone)]
pub struct MethodRefInfo {
    /// Closed canonical name of the declaring type.
    pub declaring: String,
    pub name: String,
    pub sig: MethodSig,
    /// Assembly whose token space the signature blob references.
    pub sig_assembly: usize,
    /// Bound method generic arguments (canonical names).
    pub method_args: Vec<String>,
}

/// A resolved field reference.
#[derive(Debug, Clone)]
pub struct FieldRefInfo {
    pub declaring: String,
    pub name: String,
    /// Canonical name of the field's type, context already applied.
    pub ty: String,
}

/// Read-only resolution façade. Owner tables (method/field rid → declaring
/// TypeDef) are precomputed per assembly at construction.
pub struct World<'a> {
    pub set: &'a AssemblySet,
    method_owner: Vec<Vec<u32>>,
    field_owner: Vec<Vec<u32>>,
}

impl<'a> World<'a> {
    pub fn new(set: &'a AssemblySet) -> World<'a> {
        let mut method_owner = Vec::with_capacity(set.assemblies().len());
        let mut field_owner = Vec::with_capacity(set.assemblies().len());
        for asm in set.assemblies() {
            let tables = asm.file.tables();
            let mut methods = vec![0u32; tables.method_def.len()];
            let mut fields = vec![0u32; tables.field.len()];
            for (i, row) in tables.type_def.iter().enumerate() {
                let rid = i as u32 + 1;
                let method_end = if rid < tables.type_def.len() as u32 {
                    tables.type_def[i + 1].method_list
                } else {
                    tables.method_def.len() as u32 + 1
                };
                for m in row.method_list..method_end {
                    if m >= 1 && m as usize <= methods.len() {
                        methods[m as usize - 1] = rid;
                    }
                }
                let field_end = if rid < tables.type_def.len() as u32 {
                    tables.type_def[i + 1].field_list
                } else {
                    tables.field.len() as u32 + 1
                };
                for f in row.field_list..field_end {
                    if f >= 1 && f as usize <= fields.len() {
                        fields[f as usize - 1] = rid;
                    }
                }
            }
            method_owner.push(methods);
            field_owner.push(fields);
        }
        World {
            set,
            method_owner,
            field_owner,
        }
    }

    /// Declaring TypeDef rid of a MethodDef row.
    pub fn method_owner(&self, assembly: usize, method_rid: u32) -> Option<u32> {
        let rid = *self.method_owner[assembly].get(method_rid as usize - 1)?;
        (rid != 0).then_some(rid)
    }

    /// Declaring TypeDef rid of a Field row.
    pub fn field_owner(&self, assembly: usize, field_rid: u32) -> Option<u32> {
        let rid = *self.field_owner[assembly].get(field_rid as usize - 1)?;
        (rid != 0).then_some(rid)
    }

    /// Find a TypeDef by canonical name, stripping generic arguments first.
    pub fn find_type(&self, canonical: &str) -> Option<TypeDefHandle> {
        self.set.find_type(definition_of(canonical))
    }

    /// Canonical name of a TypeRef row, following nesting through the
    /// resolution scope.
    pub fn type_ref_name(&self, assembly: usize, rid: u32) -> Result<String, String> {
        let asm = self.set.assembly(assembly);
        let tables = asm.file.tables();
        let row = tables
            .type_ref
            .get(rid as usize - 1)
            .ok_or_else(|| format!("TypeRef rid {rid} out of range"))?;
        let strings = asm.file.strings();
        let simple = strings
            .get(row.name)
            .map_err(|e| e.to_string())?
            .to_string();
        let namespace = strings
            .get(row.namespace)
            .map_err(|e| e.to_string())?
            .to_string();
        if row.resolution_scope.table == TableId::TypeRef && !row.resolution_scope.is_null() {
            let parent = self.type_ref_name(assembly, row.resolution_scope.rid)?;
            return Ok(format!("{parent}/{simple}"));
        }
        if namespace.is_empty() {
            Ok(simple)
        } else {
            Ok(format!("{namespace}.{simple}"))
        }
    }

    /// Canonical name of any type token (TypeDef / TypeRef / TypeSpec).
    pub fn token_type_name(
        &self,
        assembly: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) -> Result<String, String> {
        match token.table() {
            Some(TableId::TypeDef) => {
                let handle = TypeDefHandle {
                    assembly,
                    rid: token.rid(),
                };
                if token.rid() == 0
                    || token.rid() as usize
                        > self.set.assembly(assembly).type_names.len()
                {
                    return Err(format!("TypeDef token {token} out of range"));
                }
                Ok(self.set.type_name(handle).to_string())
            }
            Some(TableId::TypeRef) => self.type_ref_name(assembly, token.rid()),
            Some(TableId::TypeSpec) => {
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .type_spec
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("TypeSpec token {token} out of range"))?;
                let blob = asm
                    .file
                    .blobs()
                    .get(row.signature)
                    .map_err(|e| e.to_string())?;
                let sig = signatures::parse_type_spec(blob).map_err(|e| e.to_string())?;
                self.type_sig_name(assembly, &sig, ctx)
            }
            other => Err(format!("token {token} ({other:?}) does not name a type")),
        }
    }

    /// Canonical name of a parsed signature type, with generic binding.
    pub fn type_sig_name(
        &self,
        assembly: usize,
        sig: &TypeSig,
        ctx: &GenericContext,
    ) -> Result<String, String> {
        let name = match sig {
            TypeSig::Void => "System.Void".to_string(),
            TypeSig::Boolean => "System.Boolean".to_string(),
            TypeSig::Char => "System.Char".to_string(),
            TypeSig::I1 => "System.SByte".to_string(),
            TypeSig::U1 => "System.Byte".to_string(),
            TypeSig::I2 => "System.Int16".to_string(),
            TypeSig::U2 => "System.UInt16".to_string(),
            TypeSig::I4 => "System.Int32".to_string(),
            TypeSig::U4 => "System.UInt32".to_string(),
            TypeSig::I8 => "System.Int64".to_string(),
            TypeSig::U8 => "System.UInt64".to_string(),
            TypeSig::R4 => "System.Single".to_string(),
            TypeSig::R8 => "System.Double".to_string(),
            TypeSig::IntPtr => "System.IntPtr".to_string(),
            TypeSig::UIntPtr => "System.UIntPtr".to_string(),
            TypeSig::String => "System.String".to_string(),
            TypeSig::Object => "System.Object".to_string(),
            TypeSig::TypedByRef => "System.TypedReference".to_string(),
            TypeSig::Class(token) | TypeSig::ValueType(token) => {
                self.token_type_name(assembly, *token, ctx)?
            }
            TypeSig::SzArray(elem) => {
                format!("{}[]", self.type_sig_name(assembly, elem, ctx)?)
            }
            TypeSig::Array { element, rank } => {
                let commas = ",".repeat((*rank as usize).saturating_sub(1));
                format!("{}[{commas}]", self.type_sig_name(assembly, element, ctx)?)
            }
            TypeSig::Ptr(inner) => format!("{}*", self.type_sig_name(assembly, inner, ctx)?),
            TypeSig::ByRef(inner) => {
                format!("{}&", self.type_sig_name(assembly, inner, ctx)?)
            }
            TypeSig::GenericInst {
                definition, args, ..
            } => {
                let head = self.token_type_name(assembly, *definition, ctx)?;
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(self.type_sig_name(assembly, arg, ctx)?);
                }
                format!("{head}<{}>", parts.join(","))
            }
            TypeSig::Var(i) => ctx
                .type_args
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| format!("unbound type parameter !{i}"))?,
            TypeSig::MVar(i) => ctx
                .method_args
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| format!("unbound method type parameter !!{i}"))?,
            TypeSig::FnPtr(inner) => {
                let mut parts = Vec::with_capacity(inner.params.len() + 1);
                parts.push(self.type_sig_name(assembly, &inner.return_type, ctx)?);
                for p in &inner.params {
                    parts.push(self.type_sig_name(assembly, p, ctx)?);
                }
                format!("fnptr<{}>", parts.join(","))
            }
        };
        Ok(name)
    }

    /// Resolve a call/field-parent token into a method reference.
    pub fn resolve_method_token(
        &self,
        assembly: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) -> Result<MethodRefInfo, String> {
        match token.table() {
            Some(TableId::MethodDef) => {
                let owner = self
                    .method_owner(assembly, token.rid())
                    .ok_or_else(|| format!("MethodDef token {token} has no owner"))?;
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .method_def
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("MethodDef token {token} out of range"))?;
                let name = asm
                    .file
                    .strings()
                    .get(row.name)
                    .map_err(|e| e.to_string())?
                    .to_string();
                let blob = asm
                    .file
                    .blobs()
                    .get(row.signature)
                    .map_err(|e| e.to_string())?;
                let sig = signatures::parse_method_sig(blob).map_err(|e| e.to_string())?;
                let def_name = self
                    .set
                    .type_name(TypeDefHandle {
                        assembly,
                        rid: owner,
                    })
                    .to_string();
                // A MethodDef token on a generic type only appears from
                // inside that type; bind its parameters from the context.
                let declaring = bind_definition(&def_name, &ctx.type_args);
                Ok(MethodRefInfo {
                    declaring,
                    name,
                    sig,
                    sig_assembly: assembly,
                    method_args: Vec::new(),
                })
            }
            Some(TableId::MemberRef) => {
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .member_ref
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("MemberRef token {token} out of range"))?;
                let name = asm
                    .file
                    .strings()
                    .get(row.name)
                    .map_err(|e| e.to_string())?
                    .to_string();
                let blob = asm
                    .file
                    .blobs()
                    .get(row.signature)
                    .map_err(|e| e.to_string())?;
                let sig = signatures::parse_method_sig(blob).map_err(|e| e.to_string())?;
                let declaring =
                    self.token_type_name(assembly, row.class.token(), ctx)?;
                Ok(MethodRefInfo {
                    declaring,
                    name,
                    sig,
                    sig_assembly: assembly,
                    method_args: Vec::new(),
                })
            }
            Some(TableId::MethodSpec) => {
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .method_spec
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("MethodSpec token {token} out of range"))?;
                let blob = asm
                    .file
                    .blobs()
                    .get(row.instantiation)
                    .map_err(|e| e.to_string())?;
                let arg_sigs = signatures::parse_method_spec(blob).map_err(|e| e.to_string())?;
                let mut method_args = Vec::with_capacity(arg_sigs.len());
                for arg in &arg_sigs {
                    method_args.push(self.type_sig_name(assembly, arg, ctx)?);
                }
                let mut inner =
                    self.resolve_method_token(assembly, row.method.token(), ctx)?;
                inner.method_args = method_args;
                Ok(inner)
            }
            other => Err(format!("token {token} ({other:?}) does not name a method")),
        }
    }

    /// Resolve a field token (Field or MemberRef with a field signature).
    pub fn resolve_field_token(
        &self,
        assembly: usize,
        token: MetadataToken,
        ctx: &GenericContext,
    ) -> Result<FieldRefInfo, String> {
        match token.table() {
            Some(TableId::Field) => {
                let owner = self
                    .field_owner(assembly, token.rid())
                    .ok_or_else(|| format!("Field token {token} has no owner"))?;
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .field
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("Field token {token} out of range"))?;
                let name = asm
                    .file
                    .strings()
                    .get(row.name)
                    .map_err(|e| e.to_string())?
                    .to_string();
                let blob = asm
                    .file
                    .blobs()
                    .get(row.signature)
                    .map_err(|e| e.to_string())?;
                let sig = signatures::parse_field_sig(blob).map_err(|e| e.to_string())?;
                let def_name = self
                    .set
                    .type_name(TypeDefHandle {
                        assembly,
                        rid: owner,
                    })
                    .to_string();
                let declaring = bind_definition(&def_name, &ctx.type_args);
                let field_ctx =
                    GenericContext::for_type(generic_args_of(&declaring));
                let ty = self.type_sig_name(assembly, &sig, &field_ctx)?;
                Ok(FieldRefInfo {
                    declaring,
                    name,
                    ty,
                })
            }
            Some(TableId::MemberRef) => {
                let asm = self.set.assembly(assembly);
                let row = asm
                    .file
                    .tables()
                    .member_ref
                    .get(token.rid() as usize - 1)
                    .ok_or_else(|| format!("MemberRef token {token} out of range"))?;
                let name = asm
                    .file
                    .strings()
                    .get(row.name)
                    .map_err(|e| e.to_string())?
                    .to_string();
                let blob = asm
                    .file
                    .blobs()
                    .get(row.signature)
                    .map_err(|e| e.to_string())?;
                let sig = signatures::parse_field_sig(blob).map_err(|e| e.to_string())?;
                let declaring =
                    self.token_type_name(assembly, row.class.token(), ctx)?;
                let field_ctx =
                    GenericContext::for_type(generic_args_of(&declaring));
                let ty = self.type_sig_name(assembly, &sig, &field_ctx)?;
                Ok(FieldRefInfo {
                    declaring,
                    name,
                    ty,
                })
            }
            other => Err(format!("token {token} ({other:?}) does not name a field")),
        }
    }

    /// Build the canonical method key. Parameter names are resolved with
    /// the declaring type's bound arguments plus the method instantiation,
    /// so the key is closed whenever the reference is.
    pub fn method_key(&self, info: &MethodRefInfo) -> Result<String, String> {
        let callee_ctx = GenericContext {
            type_args: generic_args_of(&info.declaring),
            method_args: info.method_args.clone(),
        };
        let mut params = Vec::with_capacity(info.sig.params.len());
        for p in &info.sig.params {
            params.push(self.type_sig_name(info.sig_assembly, p, &callee_ctx)?);
        }
        Ok(format_method_key(
            &info.declaring,
            &info.name,
            &params,
            &info.method_args,
        ))
    }
}

/// `Type::Name(p1,p2)` plus `<margs>` when the method itself is generic.
pub fn format_method_key(
    declaring: &str,
    name: &str,
    params: &[String],
    method_args: &[String],
) -> String {
    let mut key = format!("{declaring}::{name}({})", params.join(","));
    if !method_args.is_empty() {
        key.push('<');
        key.push_str(&method_args.join(","));
        key.push('>');
    }
    key
}

pub fn format_field_key(declaring: &str, name: &str) -> String {
    format!("{declaring}::{name}")
}

/// The definition head of a possibly-constructed name: `` A.B`1<C> `` → `` A.B`1 ``.
pub fn definition_of(canonical: &str) -> &str {
    match canonical.find('<') {
        Some(i) => &canonical[..i],
        None => canonical,
    }
}

/// Top-level generic arguments of a constructed name, respecting nesting.
pub fn generic_args_of(canonical: &str) -> Vec<String> {
    let Some(start) = canonical.find('<') else {
        return Vec::new();
    };
    let inner = &canonical[start + 1..canonical.len() - 1];
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '<' => {
                depth += 1;
                current.push(c);
            }
            '>' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Generic arity encoded in a definition name's `` `N `` suffix.
pub fn arity_of(definition: &str) -> u32 {
    let simple = definition
        .rsplit(['.', '/'])
        .next()
        .unwrap_or(definition);
    match simple.rsplit_once('`') {
        Some((_, digits)) => digits.parse().unwrap_or(0),
        None => 0,
    }
}

/// Close a definition name over the given arguments when arities line up.
fn bind_definition(definition: &str, type_args: &[String]) -> String {
    let arity = arity_of(definition);
    if arity > 0 && type_args.len() == arity as usize {
        format!("{definition}<{}>", type_args.join(","))
    } else {
        definition.to_string()
    }
}

/// True when a canonical name still mentions an unbound parameter.
pub fn is_open_name(canonical: &str) -> bool {
    let arity = arity_of(definition_of(canonical));
    arity > 0 && !canonical.contains('<')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_nested_generic_arguments() {
        assert_eq!(
            generic_args_of("A.Map`2<A.List`1<System.Int32>,System.String>"),
            vec!["A.List`1<System.Int32>", "System.String"]
        );
        assert!(generic_args_of("System.Int32").is_empty());
    }

    #[test]
    fn arity_reads_the_backtick_suffix() {
        assert_eq!(arity_of("System.Collections.Generic.List`1"), 1);
        assert_eq!(arity_of("A.B.Dictionary`2"), 2);
        assert_eq!(arity_of("System.Int32"), 0);
    }

    #[test]
    fn open_names_are_detected() {
        assert!(is_open_name("A.List`1"));
        assert!(!is_open_name("A.List`1<System.Int32>"));
        assert!(!is_open_name("System.Int32"));
    }

    #[test]
    fn method_keys_carry_overload_and_instantiation() {
        let key = format_method_key(
            "NS.T",
            "Run",
            &["System.Int32".into(), "System.Int32&".into()],
            &["System.String".into()],
        );
        assert_eq!(key, "NS.T::Run(System.Int32,System.Int32&)<System.String>");
    }
}
