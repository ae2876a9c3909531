//! The `#~` tables stream (ECMA-335 §II.24.2.6).
//!
//! Rows are materialized for the tables the pipeline consumes; the rest are
//! parsed and discarded so the stream stays in sync. Index widths depend on
//! the heap-size bits and on row counts, so every table up to
//! `GenericParamConstraint` must be decodable even when its contents are
//! irrelevant — a guessed width would corrupt every later table.

use crate::error::{MetadataError, Result};
use crate::reader::Reader;

/// Physical table identifiers (§II.22).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

impl TableId {
    pub fn from_index(index: u8) -> Option<TableId> {
        if index <= 0x2C {
            // Discriminants are the physical indices, contiguous.
            Some(unsafe { std::mem::transmute::<u8, TableId>(index) })
        } else {
            None
        }
    }
}

/// A metadata token: table id in the top byte, 1-based row id below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetadataToken(pub u32);

impl MetadataToken {
    pub fn new(table: TableId, rid: u32) -> MetadataToken {
        MetadataToken(((table as u32) << 24) | (rid & 0x00FF_FFFF))
    }

    pub fn table(&self) -> Option<TableId> {
        TableId::from_index((self.0 >> 24) as u8)
    }

    /// 1-based row id; 0 is the null token.
    pub fn rid(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn is_null(&self) -> bool {
        self.rid() == 0
    }
}

impl std::fmt::Display for MetadataToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A decoded table reference: coded indices and plain table indices both
/// land here. `rid == 0` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub table: TableId,
    pub rid: u32,
}

impl TableRef {
    pub fn is_null(&self) -> bool {
        self.rid == 0
    }

    pub fn token(&self) -> MetadataToken {
        MetadataToken::new(self.table, self.rid)
    }
}

/// Coded-index families (§II.24.2.6). The table list order is the tag order.
#[derive(Debug, Clone, Copy)]
enum CodedFamily {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedFamily {
    fn tables(&self) -> &'static [Option<TableId>] {
        use TableId::*;
        match self {
            CodedFamily::TypeDefOrRef => &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)],
            CodedFamily::HasConstant => &[Some(Field), Some(Param), Some(Property)],
            CodedFamily::HasCustomAttribute => &[
                Some(MethodDef),
                Some(Field),
                Some(TypeRef),
                Some(TypeDef),
                Some(Param),
                Some(InterfaceImpl),
                Some(MemberRef),
                Some(Module),
                Some(DeclSecurity),
                Some(Property),
                Some(Event),
                Some(StandAloneSig),
                Some(ModuleRef),
                Some(TypeSpec),
                Some(Assembly),
                Some(AssemblyRef),
                Some(File),
                Some(ExportedType),
                Some(ManifestResource),
                Some(GenericParam),
                Some(GenericParamConstraint),
                Some(MethodSpec),
            ],
            CodedFamily::HasFieldMarshal => &[Some(Field), Some(Param)],
            CodedFamily::HasDeclSecurity => &[Some(TypeDef), Some(MethodDef), Some(Assembly)],
            CodedFamily::MemberRefParent => &[
                Some(TypeDef),
                Some(TypeRef),
                Some(ModuleRef),
                Some(MethodDef),
                Some(TypeSpec),
            ],
            CodedFamily::HasSemantics => &[Some(Event), Some(Property)],
            CodedFamily::MethodDefOrRef => &[Some(MethodDef), Some(MemberRef)],
            CodedFamily::MemberForwarded => &[Some(Field), Some(MethodDef)],
            CodedFamily::Implementation => &[Some(File), Some(AssemblyRef), Some(ExportedType)],
            CodedFamily::CustomAttributeType => {
                &[None, None, Some(MethodDef), Some(MemberRef), None]
            }
            CodedFamily::ResolutionScope => {
                &[Some(Module), Some(ModuleRef), Some(AssemblyRef), Some(TypeRef)]
            }
            CodedFamily::TypeOrMethodDef => &[Some(TypeDef), Some(MethodDef)],
        }
    }

    fn tag_bits(&self) -> u32 {
        let n = self.tables().len() as u32;
        32 - (n - 1).leading_zeros()
    }
}

// Row structs. Heap offsets stay raw (`u32` into the owning heap); table
// references are decoded into `TableRef` at parse time.

#[derive(Debug, Clone)]
pub struct ModuleRow {
    pub name: u32,
    pub mvid: u32,
}

#[derive(Debug, Clone)]
pub struct TypeRefRow {
    pub resolution_scope: TableRef,
    pub name: u32,
    pub namespace: u32,
}

#[derive(Debug, Clone)]
pub struct TypeDefRow {
    pub flags: u32,
    pub name: u32,
    pub namespace: u32,
    pub extends: TableRef,
    pub field_list: u32,
    pub method_list: u32,
}

#[derive(Debug, Clone)]
pub struct FieldRow {
    pub flags: u16,
    pub name: u32,
    pub signature: u32,
}

#[derive(Debug, Clone)]
pub struct MethodDefRow {
    pub rva: u32,
    pub impl_flags: u16,
    pub flags: u16,
    pub name: u32,
    pub signature: u32,
    pub param_list: u32,
}

#[derive(Debug, Clone)]
pub struct ParamRow {
    pub flags: u16,
    pub sequence: u16,
    pub name: u32,
}

#[derive(Debug, Clone)]
pub struct InterfaceImplRow {
    pub class: u32,
    pub interface: TableRef,
}

#[derive(Debug, Clone)]
pub struct MemberRefRow {
    pub class: TableRef,
    pub name: u32,
    pub signature: u32,
}

#[derive(Debug, Clone)]
pub struct ConstantRow {
    pub kind: u8,
    pub parent: TableRef,
    pub value: u32,
}

#[derive(Debug, Clone)]
pub struct ClassLayoutRow {
    pub packing_size: u16,
    pub class_size: u32,
    pub parent: u32,
}

#[derive(Debug, Clone)]
pub struct FieldLayoutRow {
    pub offset: u32,
    pub field: u32,
}

#[derive(Debug, Clone)]
pub struct StandAloneSigRow {
    pub signature: u32,
}

#[derive(Debug, Clone)]
pub struct MethodImplRow {
    pub class: u32,
    pub method_body: TableRef,
    pub method_declaration: TableRef,
}

#[derive(Debug, Clone)]
pub struct ModuleRefRow {
    pub name: u32,
}

#[derive(Debug, Clone)]
pub struct TypeSpecRow {
    pub signature: u32,
}

#[derive(Debug, Clone)]
pub struct ImplMapRow {
    pub mapping_flags: u16,
    pub member_forwarded: TableRef,
    pub import_name: u32,
    pub import_scope: u32,
}

#[derive(Debug, Clone)]
pub struct FieldRvaRow {
    pub rva: u32,
    pub field: u32,
}

#[derive(Debug, Clone)]
pub struct AssemblyRow {
    pub version: [u16; 4],
    pub flags: u32,
    pub public_key: u32,
    pub name: u32,
    pub culture: u32,
}

#[derive(Debug, Clone)]
pub struct AssemblyRefRow {
    pub version: [u16; 4],
    pub flags: u32,
    pub public_key_or_token: u32,
    pub name: u32,
    pub culture: u32,
}

#[derive(Debug, Clone)]
pub struct NestedClassRow {
    pub nested_class: u32,
    pub enclosing_class: u32,
}

#[derive(Debug, Clone)]
pub struct GenericParamRow {
    pub number: u16,
    pub flags: u16,
    pub owner: TableRef,
    pub name: u32,
}

#[derive(Debug, Clone)]
pub struct MethodSpecRow {
    pub method: TableRef,
    pub instantiation: u32,
}

#[derive(Debug, Clone)]
pub struct GenericParamConstraintRow {
    pub owner: u32,
    pub constraint: TableRef,
}

/// All materialized tables of one module, plus the row counts of every
/// physical table (used for `*_list` run ends and index decoding).
pub struct Tables {
    pub row_counts: [u32; 64],
    pub module: Vec<ModuleRow>,
    pub type_ref: Vec<TypeRefRow>,
    pub type_def: Vec<TypeDefRow>,
    pub field: Vec<FieldRow>,
    pub method_def: Vec<MethodDefRow>,
    pub param: Vec<ParamRow>,
    pub interface_impl: Vec<InterfaceImplRow>,
    pub member_ref: Vec<MemberRefRow>,
    pub constant: Vec<ConstantRow>,
    pub class_layout: Vec<ClassLayoutRow>,
    pub field_layout: Vec<FieldLayoutRow>,
    pub stand_alone_sig: Vec<StandAloneSigRow>,
    pub method_impl: Vec<MethodImplRow>,
    pub module_ref: Vec<ModuleRefRow>,
    pub type_spec: Vec<TypeSpecRow>,
    pub impl_map: Vec<ImplMapRow>,
    pub field_rva: Vec<FieldRvaRow>,
    pub assembly: Vec<AssemblyRow>,
    pub assembly_ref: Vec<AssemblyRefRow>,
    pub nested_class: Vec<NestedClassRow>,
    pub generic_param: Vec<GenericParamRow>,
    pub method_spec: Vec<MethodSpecRow>,
    pub generic_param_constraint: Vec<GenericParamConstraintRow>,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            row_counts: [0u32; 64],
            module: Default::default(),
            type_ref: Default::default(),
            type_def: Default::default(),
            field: Default::default(),
            method_def: Default::default(),
            param: Default::default(),
            interface_impl: Default::default(),
            member_ref: Default::default(),
            constant: Default::default(),
            class_layout: Default::default(),
            field_layout: Default::default(),
            stand_alone_sig: Default::default(),
            method_impl: Default::default(),
            module_ref: Default::default(),
            type_spec: Default::default(),
            impl_map: Default::default(),
            field_rva: Default::default(),
            assembly: Default::default(),
            assembly_ref: Default::default(),
            nested_class: Default::default(),
            generic_param: Default::default(),
            method_spec: Default::default(),
            generic_param_constraint: Default::default(),
        }
    }
}

impl Tables {
    pub fn parse(data: &[u8]) -> Result<Tables> {
        let mut r = Reader::new(data);
        let _reserved = r.u32()?;
        let _major = r.u8()?;
        let _minor = r.u8()?;
        let heap_sizes = r.u8()?;
        let _reserved2 = r.u8()?;
        let valid = r.u64()?;
        let _sorted = r.u64()?;

        let mut row_counts = [0u32; 64];
        for (i, count) in row_counts.iter_mut().enumerate() {
            if valid & (1u64 << i) != 0 {
                *count = r.u32()?;
            }
        }
        for i in 0x2D..64 {
            if row_counts[i] != 0 {
                return Err(MetadataError::unsupported(format!(
                    "metadata table {i:#04x} present; row width unknown"
                )));
            }
        }

        let mut tables = Tables {
            row_counts,
            ..Tables::default()
        };
        let ctx = RowContext {
            heap_sizes,
            row_counts: &row_counts,
        };

        for index in 0u8..=0x2C {
            let count = row_counts[index as usize];
            if count == 0 {
                continue;
            }
            let id = TableId::from_index(index).expect("index <= 0x2C");
            for _ in 0..count {
                tables.parse_row(id, &mut r, &ctx)?;
            }
        }
        Ok(tables)
    }

    fn parse_row(&mut self, id: TableId, r: &mut Reader<'_>, ctx: &RowContext<'_>) -> Result<()> {
        use TableId::*;
        match id {
            Module => {
                let _generation = r.u16()?;
                let name = ctx.str_idx(r)?;
                let mvid = ctx.guid_idx(r)?;
                let _enc_id = ctx.guid_idx(r)?;
                let _enc_base_id = ctx.guid_idx(r)?;
                self.module.push(ModuleRow { name, mvid });
            }
            TypeRef => {
                let resolution_scope = ctx.coded(r, CodedFamily::ResolutionScope)?;
                let name = ctx.str_idx(r)?;
                let namespace = ctx.str_idx(r)?;
                self.type_ref.push(TypeRefRow {
                    resolution_scope,
                    name,
                    namespace,
                });
            }
            TypeDef => {
                let flags = r.u32()?;
                let name = ctx.str_idx(r)?;
                let namespace = ctx.str_idx(r)?;
                let extends = ctx.coded(r, CodedFamily::TypeDefOrRef)?;
                let field_list = ctx.table_idx(r, Field)?;
                let method_list = ctx.table_idx(r, MethodDef)?;
                self.type_def.push(TypeDefRow {
                    flags,
                    name,
                    namespace,
                    extends,
                    field_list,
                    method_list,
                });
            }
            FieldPtr => {
                let _field = ctx.table_idx(r, Field)?;
            }
            Field => {
                let flags = r.u16()?;
                let name = ctx.str_idx(r)?;
                let signature = ctx.blob_idx(r)?;
                self.field.push(FieldRow {
                    flags,
                    name,
                    signature,
                });
            }
            MethodPtr => {
                let _method = ctx.table_idx(r, MethodDef)?;
            }
            MethodDef => {
                let rva = r.u32()?;
                let impl_flags = r.u16()?;
                let flags = r.u16()?;
                let name = ctx.str_idx(r)?;
                let signature = ctx.blob_idx(r)?;
                let param_list = ctx.table_idx(r, Param)?;
                self.method_def.push(MethodDefRow {
                    rva,
                    impl_flags,
                    flags,
                    name,
                    signature,
                    param_list,
                });
            }
            ParamPtr => {
                let _param = ctx.table_idx(r, Param)?;
            }
            Param => {
                let flags = r.u16()?;
                let sequence = r.u16()?;
                let name = ctx.str_idx(r)?;
                self.param.push(ParamRow {
                    flags,
                    sequence,
                    name,
                });
            }
            InterfaceImpl => {
                let class = ctx.table_idx(r, TypeDef)?;
                let interface = ctx.coded(r, CodedFamily::TypeDefOrRef)?;
                self.interface_impl.push(InterfaceImplRow { class, interface });
            }
            MemberRef => {
                let class = ctx.coded(r, CodedFamily::MemberRefParent)?;
                let name = ctx.str_idx(r)?;
                let signature = ctx.blob_idx(r)?;
                self.member_ref.push(MemberRefRow {
                    class,
                    name,
                    signature,
                });
            }
            Constant => {
                let kind = r.u8()?;
                let _pad = r.u8()?;
                let parent = ctx.coded(r, CodedFamily::HasConstant)?;
                let value = ctx.blob_idx(r)?;
                self.constant.push(ConstantRow {
                    kind,
                    parent,
                    value,
                });
            }
            CustomAttribute => {
                let _parent = ctx.coded(r, CodedFamily::HasCustomAttribute)?;
                let _ctor = ctx.coded(r, CodedFamily::CustomAttributeType)?;
                let _value = ctx.blob_idx(r)?;
            }
            FieldMarshal => {
                let _parent = ctx.coded(r, CodedFamily::HasFieldMarshal)?;
                let _native_type = ctx.blob_idx(r)?;
            }
            DeclSecurity => {
                let _action = r.u16()?;
                let _parent = ctx.coded(r, CodedFamily::HasDeclSecurity)?;
                let _permission_set = ctx.blob_idx(r)?;
            }
            ClassLayout => {
                let packing_size = r.u16()?;
                let class_size = r.u32()?;
                let parent = ctx.table_idx(r, TypeDef)?;
                self.class_layout.push(ClassLayoutRow {
                    packing_size,
                    class_size,
                    parent,
                });
            }
            FieldLayout => {
                let offset = r.u32()?;
                let field = ctx.table_idx(r, Field)?;
                self.field_layout.push(FieldLayoutRow { offset, field });
            }
            StandAloneSig => {
                let signature = ctx.blob_idx(r)?;
                self.stand_alone_sig.push(StandAloneSigRow { signature });
            }
            EventMap => {
                let _parent = ctx.table_idx(r, TypeDef)?;
                let _event_list = ctx.table_idx(r, Event)?;
            }
            EventPtr => {
                let _event = ctx.table_idx(r, Event)?;
            }
            Event => {
                let _flags = r.u16()?;
                let _name = ctx.str_idx(r)?;
                let _event_type = ctx.coded(r, CodedFamily::TypeDefOrRef)?;
            }
            PropertyMap => {
                let _parent = ctx.table_idx(r, TypeDef)?;
                let _property_list = ctx.table_idx(r, Property)?;
            }
            PropertyPtr => {
                let _property = ctx.table_idx(r, Property)?;
            }
            Property => {
                let _flags = r.u16()?;
                let _name = ctx.str_idx(r)?;
                let _signature = ctx.blob_idx(r)?;
            }
            MethodSemantics => {
                let _semantics = r.u16()?;
                let _method = ctx.table_idx(r, MethodDef)?;
                let _association = ctx.coded(r, CodedFamily::HasSemantics)?;
            }
            MethodImpl => {
                let class = ctx.table_idx(r, TypeDef)?;
                let method_body = ctx.coded(r, CodedFamily::MethodDefOrRef)?;
                let method_declaration = ctx.coded(r, CodedFamily::MethodDefOrRef)?;
                self.method_impl.push(MethodImplRow {
                    class,
                    method_body,
                    method_declaration,
                });
            }
            ModuleRef => {
                let name = ctx.str_idx(r)?;
                self.module_ref.push(ModuleRefRow { name });
            }
            TypeSpec => {
                let signature = ctx.blob_idx(r)?;
                self.type_spec.push(TypeSpecRow { signature });
            }
            ImplMap => {
                let mapping_flags = r.u16()?;
                let member_forwarded = ctx.coded(r, CodedFamily::MemberForwarded)?;
                let import_name = ctx.str_idx(r)?;
                let import_scope = ctx.table_idx(r, ModuleRef)?;
                self.impl_map.push(ImplMapRow {
                    mapping_flags,
                    member_forwarded,
                    import_name,
                    import_scope,
                });
            }
            FieldRva => {
                let rva = r.u32()?;
                let field = ctx.table_idx(r, Field)?;
                self.field_rva.push(FieldRvaRow { rva, field });
            }
            EncLog => {
                let _token = r.u32()?;
                let _func_code = r.u32()?;
            }
            EncMap => {
                let _token = r.u32()?;
            }
            Assembly => {
                let _hash_alg = r.u32()?;
                let version = [r.u16()?, r.u16()?, r.u16()?, r.u16()?];
                let flags = r.u32()?;
                let public_key = ctx.blob_idx(r)?;
                let name = ctx.str_idx(r)?;
                let culture = ctx.str_idx(r)?;
                self.assembly.push(AssemblyRow {
                    version,
                    flags,
                    public_key,
                    name,
                    culture,
                });
            }
            AssemblyProcessor => {
                let _processor = r.u32()?;
            }
            AssemblyOs => {
                let _platform = r.u32()?;
                let _major = r.u32()?;
                let _minor = r.u32()?;
            }
            AssemblyRef => {
                let version = [r.u16()?, r.u16()?, r.u16()?, r.u16()?];
                let flags = r.u32()?;
                let public_key_or_token = ctx.blob_idx(r)?;
                let name = ctx.str_idx(r)?;
                let culture = ctx.str_idx(r)?;
                let _hash_value = ctx.blob_idx(r)?;
                self.assembly_ref.push(AssemblyRefRow {
                    version,
                    flags,
                    public_key_or_token,
                    name,
                    culture,
                });
            }
            AssemblyRefProcessor => {
                let _processor = r.u32()?;
                let _assembly_ref = ctx.table_idx(r, AssemblyRef)?;
            }
            AssemblyRefOs => {
                let _platform = r.u32()?;
                let _major = r.u32()?;
                let _minor = r.u32()?;
                let _assembly_ref = ctx.table_idx(r, AssemblyRef)?;
            }
            File => {
                let _flags = r.u32()?;
                let _name = ctx.str_idx(r)?;
                let _hash_value = ctx.blob_idx(r)?;
            }
            ExportedType => {
                let _flags = r.u32()?;
                let _type_def_id = r.u32()?;
                let _name = ctx.str_idx(r)?;
                let _namespace = ctx.str_idx(r)?;
                let _implementation = ctx.coded(r, CodedFamily::Implementation)?;
            }
            ManifestResource => {
                let _offset = r.u32()?;
                let _flags = r.u32()?;
                let _name = ctx.str_idx(r)?;
                let _implementation = ctx.coded(r, CodedFamily::Implementation)?;
            }
            NestedClass => {
                let nested_class = ctx.table_idx(r, TypeDef)?;
                let enclosing_class = ctx.table_idx(r, TypeDef)?;
                self.nested_class.push(NestedClassRow {
                    nested_class,
                    enclosing_class,
                });
            }
            GenericParam => {
                let number = r.u16()?;
                let flags = r.u16()?;
                let owner = ctx.coded(r, CodedFamily::TypeOrMethodDef)?;
                let name = ctx.str_idx(r)?;
                self.generic_param.push(GenericParamRow {
                    number,
                    flags,
                    owner,
                    name,
                });
            }
            MethodSpec => {
                let method = ctx.coded(r, CodedFamily::MethodDefOrRef)?;
                let instantiation = ctx.blob_idx(r)?;
                self.method_spec.push(MethodSpecRow {
                    method,
                    instantiation,
                });
            }
            GenericParamConstraint => {
                let owner = ctx.table_idx(r, GenericParam)?;
                let constraint = ctx.coded(r, CodedFamily::TypeDefOrRef)?;
                self.generic_param_constraint
                    .push(GenericParamConstraintRow { owner, constraint });
            }
        }
        Ok(())
    }

    pub fn row_count(&self, id: TableId) -> u32 {
        self.row_counts[id as usize]
    }

    /// End of a `field_list`/`method_list`/`param_list` run: the next row's
    /// start, or one past the target table's last row.
    pub fn list_end(&self, owner: TableId, owner_rid: u32, list: fn(&Self, u32) -> u32, target: TableId) -> u32 {
        if owner_rid < self.row_count(owner) {
            list(self, owner_rid + 1)
        } else {
            self.row_count(target) + 1
        }
    }
}

struct RowContext<'a> {
    heap_sizes: u8,
    row_counts: &'a [u32; 64],
}

impl RowContext<'_> {
    fn str_idx(&self, r: &mut Reader<'_>) -> Result<u32> {
        r.index(self.heap_sizes & 0x1 != 0)
    }

    fn guid_idx(&self, r: &mut Reader<'_>) -> Result<u32> {
        r.index(self.heap_sizes & 0x2 != 0)
    }

    fn blob_idx(&self, r: &mut Reader<'_>) -> Result<u32> {
        r.index(self.heap_sizes & 0x4 != 0)
    }

    fn table_idx(&self, r: &mut Reader<'_>, table: TableId) -> Result<u32> {
        r.index(self.row_counts[table as usize] > 0xFFFF)
    }

    fn coded(&self, r: &mut Reader<'_>, family: CodedFamily) -> Result<TableRef> {
        let tables = family.tables();
        let bits = family.tag_bits();
        let max_rows = tables
            .iter()
            .flatten()
            .map(|t| self.row_counts[*t as usize])
            .max()
            .unwrap_or(0);
        let wide = max_rows > (0xFFFF >> bits);
        let raw = r.index(wide)?;
        let tag = (raw & ((1 << bits) - 1)) as usize;
        let rid = raw >> bits;
        let table = tables
            .get(tag)
            .copied()
            .flatten()
            .ok_or_else(|| MetadataError::malformed(format!("invalid coded-index tag {tag}")))?;
        Ok(TableRef { table, rid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal #~ stream: one Module row, two TypeDef rows, small heaps.
    fn tiny_tables_stream() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.push(2); // major
        out.push(0); // minor
        out.push(0); // heap sizes: all narrow
        out.push(1); // reserved
        let valid: u64 = (1 << 0x00) | (1 << 0x02);
        out.extend_from_slice(&valid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // sorted
        out.extend_from_slice(&1u32.to_le_bytes()); // Module rows
        out.extend_from_slice(&2u32.to_le_bytes()); // TypeDef rows

        // Module: generation, name, mvid, encid, encbaseid (all narrow u16)
        for v in [0u16, 1, 1, 0, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        // TypeDef rows: flags u32, name u16, ns u16, extends coded u16,
        // field_list u16, method_list u16.
        for (name, extends) in [(1u16, 0u16), (9, 1 << 2)] {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&extends.to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes());
        }
        out
    }

    #[test]
    fn parses_a_minimal_stream() {
        let tables = Tables::parse(&tiny_tables_stream()).unwrap();
        assert_eq!(tables.module.len(), 1);
        assert_eq!(tables.type_def.len(), 2);
        assert_eq!(tables.row_count(TableId::TypeDef), 2);
        // Second row extends TypeDef rid 1 (coded tag 0).
        let extends = tables.type_def[1].extends;
        assert_eq!(extends.table, TableId::TypeDef);
        assert_eq!(extends.rid, 1);
        assert!(tables.type_def[0].extends.is_null());
    }

    #[test]
    fn tokens_round_trip() {
        let token = MetadataToken::new(TableId::MethodDef, 42);
        assert_eq!(token.0, 0x0600_002A);
        assert_eq!(token.table(), Some(TableId::MethodDef));
        assert_eq!(token.rid(), 42);
    }

    #[test]
    fn unknown_table_is_unsupported() {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(2);
        out.push(0);
        out.push(0);
        out.push(1);
        let valid: u64 = 1 << 0x30;
        out.extend_from_slice(&valid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            Tables::parse(&out),
            Err(MetadataError::Unsupported(_))
        ));
    }
}
