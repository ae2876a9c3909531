//! Pass 4: instruction lowering.
//!
//! Translates each CFG's IL into typed IR instructions, tracking an
//! abstract evaluation stack so every instruction gets a typed result
//! handle. Values that cross block boundaries are spilled into synthetic
//! locals; a join whose incoming types disagree widens to the least common
//! supertype (unrelated references widen to `System.Object`). Overflow and
//! signedness survive as explicit flags on the IR, never folded into plain
//! arithmetic.

use cil2cpp_metadata::il::{HandlerKind, IlOp, ScalarKind};
use cil2cpp_metadata::tables::{MetadataToken, TableId};
use fxhash::FxHashMap;

use crate::world::{GenericContext, format_field_key, generic_args_of};

use super::builder::IrBuilder;
use super::cfg::MethodCfg;
use super::{
    BasicBlock, BinOp, BlobId, BlockId, CallKind, CmpOp, FieldId, FnSig, Instr, InstrKind,
    IrExceptionRegion, MethodFlags, MethodId, Primitive, RegionKind, StringId, StubReason,
    Terminator, TypeId, TypeKind, UnOp, Value,
};

pub fn run(b: &mut IrBuilder<'_, '_>, cfgs: &[Option<MethodCfg>]) {
    for (index, cfg) in cfgs.iter().enumerate() {
        let Some(cfg) = cfg else { continue };
        lower_method(b, MethodId(index as u32), cfg);
    }
}

pub(super) fn lower_method(b: &mut IrBuilder<'_, '_>, id: MethodId, cfg: &MethodCfg) {
    let (declaring_name, method_args, source, key) = {
        let m = b.module.method(id);
        let declaring = b.module.ty(m.declaring);
        let margs: Vec<String> = m
            .generic_args
            .iter()
            .map(|t| b.module.ty(*t).name.clone())
            .collect();
        (
            declaring.name.clone(),
            margs,
            m.source.expect("cfg implies source"),
            b.module.method_key_string(id),
        )
    };
    let ctx = GenericContext {
        type_args: generic_args_of(&declaring_name),
        method_args,
    };

    let locals = match cfg.locals_token {
        Some(token) => b.locals_of(source.assembly, token, &ctx),
        None => Vec::new(),
    };
    b.module.method_mut(id).locals = locals;

    let mut lowering = Lowering {
        b,
        id,
        key,
        asm: source.assembly,
        ctx,
        value_counter: 0,
        blocks_out: Vec::new(),
        entry_stacks: FxHashMap::default(),
        spill_types: Vec::new(),
        handle_sources: FxHashMap::default(),
        pending_constraint: None,
        failure: None,
    };
    lowering.run(cfg);
}

struct Lowering<'l, 'w, 'a> {
    b: &'l mut IrBuilder<'w, 'a>,
    id: MethodId,
    key: String,
    asm: usize,
    ctx: GenericContext,
    value_counter: u32,
    blocks_out: Vec<BasicBlock>,
    /// Stack types expected at each block's entry.
    entry_stacks: FxHashMap<usize, Vec<TypeId>>,
    /// Types of the spill locals appended after the real locals.
    spill_types: Vec<TypeId>,
    /// Value id -> field it was `ldtoken`'d from (array-init detection).
    handle_sources: FxHashMap<u32, FieldId>,
    pending_constraint: Option<TypeId>,
    failure: Option<StubReason>,
}

impl Lowering<'_, '_, '_> {
    fn run(mut self, cfg: &MethodCfg) {
        // Catch/filter handler entries begin with the exception on the
        // stack; pre-seed those entry stacks.
        let object = self.ty("System.Object");
        for region in &cfg.regions {
            if let Some(&idx) = cfg.block_at.get(&region.handler_start) {
                match &region.kind {
                    HandlerKind::Catch(token) => {
                        let ty = self
                            .type_of_token(*token)
                            .unwrap_or(object);
                        self.entry_stacks.insert(idx, vec![ty]);
                    }
                    HandlerKind::Filter(_) => {
                        self.entry_stacks.insert(idx, vec![object]);
                    }
                    _ => {}
                }
            }
        }

        for (index, block) in cfg.blocks.iter().enumerate() {
            if self.failure.is_some() {
                break;
            }
            self.lower_block(cfg, index, block);
        }

        if let Some(reason) = self.failure.take() {
            self.b.stub(self.id, reason);
            return;
        }

        // Append spill locals and attach blocks plus region block ranges.
        let spill_types = std::mem::take(&mut self.spill_types);
        let blocks = std::mem::take(&mut self.blocks_out);
        let instruction_count: usize = blocks.iter().map(|bl| bl.instrs.len() + 1).sum();
        let regions = map_regions(cfg, &blocks);
        let method = self.b.module.method_mut(self.id);
        for ty in spill_types {
            method.locals.push(super::IrLocal {
                ty,
                byref: false,
                pinned: false,
            });
        }
        method.blocks = blocks;
        method.exception_regions = regions;
        method.instruction_count = instruction_count;
    }

    fn fail(&mut self, reason: StubReason) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    fn ty(&mut self, canonical: &str) -> TypeId {
        self.b.intern_type_by_name(canonical)
    }

    fn prim(&mut self, p: Primitive) -> TypeId {
        let name = match p {
            Primitive::Void => "System.Void",
            Primitive::Bool => "System.Boolean",
            Primitive::Char => "System.Char",
            Primitive::I1 => "System.SByte",
            Primitive::U1 => "System.Byte",
            Primitive::I2 => "System.Int16",
            Primitive::U2 => "System.UInt16",
            Primitive::I4 => "System.Int32",
            Primitive::U4 => "System.UInt32",
            Primitive::I8 => "System.Int64",
            Primitive::U8 => "System.UInt64",
            Primitive::ISize => "System.IntPtr",
            Primitive::USize => "System.UIntPtr",
            Primitive::F4 => "System.Single",
            Primitive::F8 => "System.Double",
        };
        self.ty(name)
    }

    fn byref_of(&mut self, inner: TypeId) -> TypeId {
        let name = format!("{}&", self.b.module.ty(inner).name);
        self.ty(&name)
    }

    fn type_of_token(&mut self, token: MetadataToken) -> Option<TypeId> {
        match self.b.world.token_type_name(self.asm, token, &self.ctx) {
            Ok(name) => Some(self.ty(&name)),
            Err(e) => {
                let key = self.key.clone();
                self.b.diag(&key, e);
                None
            }
        }
    }

    fn method_of_token(&mut self, token: MetadataToken) -> Option<MethodId> {
        let info = match self.b.world.resolve_method_token(self.asm, token, &self.ctx) {
            Ok(info) => info,
            Err(e) => {
                let key = self.key.clone();
                self.b.diag(&key, e);
                return None;
            }
        };
        let mkey = match self.b.world.method_key(&info) {
            Ok(k) => k,
            Err(e) => {
                let key = self.key.clone();
                self.b.diag(&key, e);
                return None;
            }
        };
        if let Some(existing) = self.b.module.lookup_method(&mkey) {
            return Some(existing);
        }
        // Reachability missed it (resolution asymmetry); make a shell and
        // let pass 6 try to complete it.
        let declaring = self.b.intern_type_by_name(&info.declaring);
        let id = self.b.module.intern_method(&mkey, declaring, &info.name);
        let callee_ctx = GenericContext {
            type_args: generic_args_of(&info.declaring),
            method_args: info.method_args.clone(),
        };
        let mut params = Vec::with_capacity(info.sig.params.len());
        for p in &info.sig.params {
            let name = self
                .b
                .world
                .type_sig_name(info.sig_assembly, p, &callee_ctx)
                .unwrap_or_else(|_| "System.Object".to_string());
            params.push(super::IrParam {
                name: format!("a{}", params.len()),
                byref: name.ends_with('&'),
                ty: self.b.intern_type_by_name(&name),
            });
        }
        let ret_name = self
            .b
            .world
            .type_sig_name(info.sig_assembly, &info.sig.return_type, &callee_ctx)
            .unwrap_or_else(|_| "System.Void".to_string());
        let ret = self.b.intern_type_by_name(&ret_name);
        let method = self.b.module.method_mut(id);
        method.params = params;
        method.return_type = ret;
        if !info.sig.has_this {
            method.flags |= MethodFlags::STATIC;
        }
        self.b.pending.push(id);
        Some(id)
    }

    fn field_of_token(&mut self, token: MetadataToken) -> Option<FieldId> {
        let info = match self.b.world.resolve_field_token(self.asm, token, &self.ctx) {
            Ok(info) => info,
            Err(e) => {
                let key = self.key.clone();
                self.b.diag(&key, e);
                return None;
            }
        };
        let fkey = format_field_key(&info.declaring, &info.name);
        if let Some(existing) = self.b.module.lookup_field(&fkey) {
            return Some(existing);
        }
        let declaring = self.b.intern_type_by_name(&info.declaring);
        let ty = self.b.intern_type_by_name(&info.ty);
        let id = self.b.module.intern_field(&fkey, declaring, &info.name);
        self.b.module.field_mut(id).ty = ty;
        Some(id)
    }

    fn lower_block(&mut self, cfg: &MethodCfg, index: usize, block: &super::cfg::CfgBlock) {
        let mut instrs: Vec<Instr> = Vec::with_capacity(block.il.len());
        let mut stack: Vec<Value> = Vec::new();

        // Reload whatever the predecessors spilled.
        let entry = self.entry_stacks.get(&index).cloned().unwrap_or_default();
        let is_handler_entry = cfg.regions.iter().any(|r| {
            cfg.block_at.get(&r.handler_start) == Some(&index)
                && matches!(r.kind, HandlerKind::Catch(_) | HandlerKind::Filter(_))
        });
        if is_handler_entry {
            // The runtime binds the in-flight exception to `__exc` inside
            // the handler scope.
            let ty = entry.first().copied().unwrap_or_else(|| self.ty("System.Object"));
            let v = self.fresh(ty);
            instrs.push(Instr {
                dest: Some(v),
                kind: InstrKind::Raw {
                    ty: Some(ty),
                    text: "__exc".to_string(),
                    args: Vec::new(),
                },
            });
            stack.push(v);
        } else {
            for (depth, ty) in entry.iter().enumerate() {
                let v = self.fresh(*ty);
                instrs.push(Instr {
                    dest: Some(v),
                    kind: InstrKind::LoadLocal(self.spill_index(depth)),
                });
                stack.push(v);
            }
        }

        let mut terminator: Option<Terminator> = None;
        for il in &block.il {
            if self.failure.is_some() {
                return;
            }
            if terminator.is_some() {
                break; // unreachable padding inside the block
            }
            terminator = self.lower_op(&il.op, cfg, index, &mut instrs, &mut stack);
        }

        let terminator = match terminator {
            Some(t) => t,
            None => {
                // Fallthrough into the textually next block.
                if index + 1 < cfg.blocks.len() {
                    self.spill(&mut instrs, &stack, cfg, index + 1);
                    Terminator::Goto(BlockId(index as u32 + 1))
                } else {
                    Terminator::Unreachable
                }
            }
        };

        self.blocks_out.push(BasicBlock {
            id: BlockId(index as u32),
            instrs,
            terminator,
        });
    }

    fn fresh(&mut self, ty: TypeId) -> Value {
        let v = Value {
            id: self.value_counter,
            ty,
        };
        self.value_counter += 1;
        v
    }

    fn spill_index(&self, depth: usize) -> u16 {
        let method = self.b.module.method(self.id);
        (method.locals.len() + depth) as u16
    }

    /// Record/merge the entry stack of a branch target and store the
    /// current stack into the spill locals.
    fn spill(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &[Value],
        cfg: &MethodCfg,
        target_index: usize,
    ) {
        let types: Vec<TypeId> = stack.iter().map(|v| v.ty).collect();
        match self.entry_stacks.get(&target_index).cloned() {
            None => {
                if !types.is_empty() && target_index <= self.blocks_out.len() {
                    // A stack-carrying back edge into a block already
                    // lowered with an empty entry stack cannot be patched.
                    self.fail(StubReason::RenderedBodyError(format!(
                        "stack-carrying back edge into block {target_index}"
                    )));
                    return;
                }
                self.entry_stacks.insert(target_index, types.clone());
            }
            Some(existing) => {
                if existing.len() != types.len() {
                    self.fail(StubReason::RenderedBodyError(format!(
                        "inconsistent stack depth at join block {target_index}"
                    )));
                    return;
                }
                let merged: Vec<TypeId> = existing
                    .iter()
                    .zip(&types)
                    .map(|(a, b)| self.merge_type(*a, *b))
                    .collect();
                self.entry_stacks.insert(target_index, merged);
            }
        }
        let _ = cfg;
        for depth in (0..stack.len()).rev() {
            while self.spill_types.len() <= depth {
                let object = self.ty("System.Object");
                self.spill_types.push(object);
            }
            instrs.push(Instr {
                dest: None,
                kind: InstrKind::StoreLocal(self.spill_index(depth), stack[depth]),
            });
        }
    }

    /// Least common supertype of two stack types.
    fn merge_type(&mut self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        let (ka, kb) = (
            self.b.module.ty(a).kind.clone(),
            self.b.module.ty(b).kind.clone(),
        );
        match (&ka, &kb) {
            (TypeKind::Primitive(pa), TypeKind::Primitive(pb)) => {
                let wider = if pa.size() >= pb.size() { *pa } else { *pb };
                self.prim(wider)
            }
            _ if self.b.module.ty(a).is_value_like() || self.b.module.ty(b).is_value_like() => {
                // Unrelated value merges keep the first type; the verifier
                // would reject this IL anyway.
                a
            }
            _ => self.ty("System.Object"),
        }
    }

    fn param_type(&mut self, n: u16) -> TypeId {
        let m = self.b.module.method(self.id);
        if !m.is_static() {
            if n == 0 {
                let declaring = m.declaring;
                let declaring_is_value = self.b.module.ty(declaring).is_value_like();
                return if declaring_is_value {
                    self.byref_of(declaring)
                } else {
                    declaring
                };
            }
            return self
                .b
                .module
                .method(self.id)
                .params
                .get(n as usize - 1)
                .map(|p| p.ty)
                .unwrap_or_else(|| TypeId(0));
        }
        m.params.get(n as usize).map(|p| p.ty).unwrap_or(TypeId(0))
    }

    fn local_type(&mut self, n: u16) -> TypeId {
        self.b
            .module
            .method(self.id)
            .locals
            .get(n as usize)
            .map(|l| l.ty)
            .unwrap_or_else(|| self.ty("System.Object"))
    }

    fn promote(&mut self, l: TypeId, r: TypeId) -> TypeId {
        if l == r {
            return l;
        }
        let (kl, kr) = (
            self.b.module.ty(l).kind.clone(),
            self.b.module.ty(r).kind.clone(),
        );
        if matches!(kl, TypeKind::Pointer(_) | TypeKind::ByRef(_)) {
            return l;
        }
        if matches!(kr, TypeKind::Pointer(_) | TypeKind::ByRef(_)) {
            return r;
        }
        match (kl, kr) {
            (TypeKind::Primitive(a), TypeKind::Primitive(b)) => {
                use Primitive::*;
                if a == F8 || b == F8 {
                    self.prim(F8)
                } else if a == F4 || b == F4 {
                    self.prim(F4)
                } else if a == I8 || a == U8 || b == I8 || b == U8 {
                    self.prim(I8)
                } else if a == ISize || a == USize || b == ISize || b == USize {
                    self.prim(ISize)
                } else {
                    self.prim(I4)
                }
            }
            _ => l,
        }
    }

    fn scalar_type(&mut self, kind: ScalarKind, context: Option<TypeId>) -> TypeId {
        match kind {
            ScalarKind::I1 => self.prim(Primitive::I1),
            ScalarKind::U1 => self.prim(Primitive::U1),
            ScalarKind::I2 => self.prim(Primitive::I2),
            ScalarKind::U2 => self.prim(Primitive::U2),
            ScalarKind::I4 => self.prim(Primitive::I4),
            ScalarKind::U4 => self.prim(Primitive::U4),
            ScalarKind::I8 => self.prim(Primitive::I8),
            ScalarKind::U8 => self.prim(Primitive::U8),
            ScalarKind::I => self.prim(Primitive::ISize),
            ScalarKind::U => self.prim(Primitive::USize),
            ScalarKind::R4 => self.prim(Primitive::F4),
            ScalarKind::R8 => self.prim(Primitive::F8),
            ScalarKind::Ref => context.unwrap_or_else(|| self.ty("System.Object")),
        }
    }

    /// Element type behind a pointer/byref/array value, for `Ref`-kinded
    /// accesses.
    fn pointee(&mut self, v: Value) -> Option<TypeId> {
        match self.b.module.ty(v.ty).kind.clone() {
            TypeKind::Pointer(t) | TypeKind::ByRef(t) => Some(t),
            TypeKind::Array { element, .. } => Some(element),
            _ => None,
        }
    }

    fn block_id_at(&mut self, cfg: &MethodCfg, offset: u32) -> Option<BlockId> {
        match cfg.block_at.get(&offset) {
            Some(i) => Some(BlockId(*i as u32)),
            None => {
                self.fail(StubReason::RenderedBodyError(format!(
                    "branch target {offset:#x} is not a block leader"
                )));
                None
            }
        }
    }

    fn push(&mut self, instrs: &mut Vec<Instr>, stack: &mut Vec<Value>, ty: TypeId, kind: InstrKind) -> Value {
        let v = self.fresh(ty);
        instrs.push(Instr {
            dest: Some(v),
            kind,
        });
        stack.push(v);
        v
    }

    fn emit(&mut self, instrs: &mut Vec<Instr>, kind: InstrKind) {
        instrs.push(Instr { dest: None, kind });
    }

    fn pop(&mut self, stack: &mut Vec<Value>) -> Value {
        match stack.pop() {
            Some(v) => v,
            None => {
                self.fail(StubReason::RenderedBodyError(
                    "evaluation stack underflow".to_string(),
                ));
                Value {
                    id: u32::MAX,
                    ty: self.ty("System.Object"),
                }
            }
        }
    }

    fn binary(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
        op: BinOp,
        checked: bool,
        unsigned: bool,
    ) {
        let rhs = self.pop(stack);
        let lhs = self.pop(stack);
        let ty = if matches!(op, BinOp::Shl | BinOp::Shr) {
            lhs.ty
        } else {
            self.promote(lhs.ty, rhs.ty)
        };
        self.push(
            instrs,
            stack,
            ty,
            InstrKind::Binary {
                op,
                checked,
                unsigned,
                lhs,
                rhs,
            },
        );
    }

    fn compare(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
        op: CmpOp,
        unordered: bool,
    ) {
        let rhs = self.pop(stack);
        let lhs = self.pop(stack);
        let i4 = self.prim(Primitive::I4);
        self.push(
            instrs,
            stack,
            i4,
            InstrKind::Compare {
                op,
                unordered,
                lhs,
                rhs,
            },
        );
    }

    fn convert(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
        kind: ScalarKind,
        checked: bool,
        source_unsigned: bool,
    ) {
        let value = self.pop(stack);
        let to = self.scalar_type(kind, None);
        self.push(
            instrs,
            stack,
            to,
            InstrKind::Convert {
                to,
                value,
                checked,
                source_unsigned,
            },
        );
    }

    fn branch_compare(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
        cfg: &MethodCfg,
        index: usize,
        target: u32,
        op: CmpOp,
        unordered: bool,
    ) -> Option<Terminator> {
        self.compare(instrs, stack, op, unordered);
        let condition = self.pop(stack);
        self.conditional(instrs, stack, cfg, index, target, condition, false)
    }

    fn conditional(
        &mut self,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
        cfg: &MethodCfg,
        index: usize,
        target: u32,
        condition: Value,
        negate: bool,
    ) -> Option<Terminator> {
        let taken = self.block_id_at(cfg, target)?;
        let fallthrough = BlockId(index as u32 + 1);
        self.spill(instrs, stack, cfg, taken.0 as usize);
        self.spill(instrs, stack, cfg, fallthrough.0 as usize);
        let (if_true, if_false) = if negate {
            (fallthrough, taken)
        } else {
            (taken, fallthrough)
        };
        Some(Terminator::Branch {
            condition,
            if_true,
            if_false,
        })
    }

    /// Lower one IL operation. Returns a terminator when the op ends the
    /// block.
    fn lower_op(
        &mut self,
        op: &IlOp,
        cfg: &MethodCfg,
        index: usize,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
    ) -> Option<Terminator> {
        use IlOp::*;
        match op {
            Nop | Break | Volatile | Tail | ReadOnly | Unaligned(_) | NoCheck(_) => {}

            LdArg(n) => {
                let ty = self.param_type(*n);
                self.push(instrs, stack, ty, InstrKind::LoadParam(*n));
            }
            LdArgA(n) => {
                let inner = self.param_type(*n);
                let ty = self.byref_of(inner);
                self.push(instrs, stack, ty, InstrKind::ParamAddr(*n));
            }
            StArg(n) => {
                let v = self.pop(stack);
                self.emit(instrs, InstrKind::StoreParam(*n, v));
            }
            LdLoc(n) => {
                let ty = self.local_type(*n);
                self.push(instrs, stack, ty, InstrKind::LoadLocal(*n));
            }
            LdLocA(n) => {
                let inner = self.local_type(*n);
                let ty = self.byref_of(inner);
                self.push(instrs, stack, ty, InstrKind::LocalAddr(*n));
            }
            StLoc(n) => {
                let v = self.pop(stack);
                self.emit(instrs, InstrKind::StoreLocal(*n, v));
            }

            LdNull => {
                let ty = self.ty("System.Object");
                self.push(instrs, stack, ty, InstrKind::ConstNull);
            }
            LdcI4(v) => {
                let ty = self.prim(Primitive::I4);
                self.push(instrs, stack, ty, InstrKind::ConstI32(*v));
            }
            LdcI8(v) => {
                let ty = self.prim(Primitive::I8);
                self.push(instrs, stack, ty, InstrKind::ConstI64(*v));
            }
            LdcR4(v) => {
                let ty = self.prim(Primitive::F4);
                self.push(instrs, stack, ty, InstrKind::ConstF32(*v));
            }
            LdcR8(v) => {
                let ty = self.prim(Primitive::F8);
                self.push(instrs, stack, ty, InstrKind::ConstF64(*v));
            }
            LdStr(token) => {
                let provisional = StringId(self.b.raw_strings.len() as u32);
                let offset = token.0 & 0x00FF_FFFF;
                let units = self
                    .b
                    .world
                    .set
                    .assembly(self.asm)
                    .file
                    .user_strings()
                    .get(offset)
                    .unwrap_or_default();
                self.b.raw_strings.push(units);
                let ty = self.ty("System.String");
                self.push(instrs, stack, ty, InstrKind::ConstString(provisional));
            }

            Dup => {
                if let Some(top) = stack.last().copied() {
                    stack.push(top);
                } else {
                    self.fail(StubReason::RenderedBodyError(
                        "dup on empty stack".to_string(),
                    ));
                }
            }
            Pop => {
                self.pop(stack);
            }

            Call(token) | CallVirt(token) => {
                let virtual_call = matches!(op, CallVirt(_));
                self.lower_call(*token, virtual_call, instrs, stack);
            }
            NewObj(token) => {
                self.lower_newobj(*token, instrs, stack);
            }
            CallI(token) => {
                self.lower_calli(*token, instrs, stack);
            }
            Jmp(_) => {
                self.fail(StubReason::KnownBrokenPattern("il-jmp".to_string()));
            }

            Ret => {
                let m = self.b.module.method(self.id);
                let ret_void = {
                    let rt = self.b.module.ty(m.return_type);
                    matches!(rt.kind, TypeKind::Primitive(Primitive::Void))
                };
                let value = if ret_void {
                    None
                } else {
                    Some(self.pop(stack))
                };
                return Some(Terminator::Return(value));
            }
            Br(target) => {
                let taken = self.block_id_at(cfg, *target)?;
                self.spill(instrs, stack, cfg, taken.0 as usize);
                return Some(Terminator::Goto(taken));
            }
            BrTrue(target) => {
                let condition = self.pop(stack);
                return self.conditional(instrs, stack, cfg, index, *target, condition, false);
            }
            BrFalse(target) => {
                let condition = self.pop(stack);
                return self.conditional(instrs, stack, cfg, index, *target, condition, true);
            }
            Beq(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Eq, false),
            Bge(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Ge, false),
            Bgt(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Gt, false),
            Ble(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Le, false),
            Blt(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Lt, false),
            BneUn(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Ne, true),
            BgeUn(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Ge, true),
            BgtUn(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Gt, true),
            BleUn(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Le, true),
            BltUn(t) => return self.branch_compare(instrs, stack, cfg, index, *t, CmpOp::Lt, true),
            Switch(targets) => {
                let value = self.pop(stack);
                let default = BlockId(index as u32 + 1);
                self.spill(instrs, stack, cfg, default.0 as usize);
                let mut blocks = Vec::with_capacity(targets.len());
                for t in targets {
                    let bid = self.block_id_at(cfg, *t)?;
                    self.spill(instrs, stack, cfg, bid.0 as usize);
                    blocks.push(bid);
                }
                return Some(Terminator::Switch {
                    value,
                    targets: blocks,
                    default,
                });
            }
            Leave(target) => {
                // `leave` empties the evaluation stack.
                stack.clear();
                let taken = self.block_id_at(cfg, *target)?;
                self.entry_stacks.entry(taken.0 as usize).or_default();
                return Some(Terminator::Leave(taken));
            }
            EndFinally => {
                stack.clear();
                return Some(Terminator::EndFinally);
            }
            EndFilter => {
                self.fail(StubReason::KnownBrokenPattern(
                    "exception-filter".to_string(),
                ));
            }
            Throw => {
                let v = self.pop(stack);
                return Some(Terminator::Throw(v));
            }
            Rethrow => return Some(Terminator::Rethrow),

            LdInd(kind) => {
                let address = self.pop(stack);
                let pointee = self.pointee(address);
                let ty = self.scalar_type(*kind, pointee);
                self.push(instrs, stack, ty, InstrKind::LoadIndirect { address, ty });
            }
            StInd(kind) => {
                let value = self.pop(stack);
                let address = self.pop(stack);
                let pointee = self.pointee(address);
                let ty = self.scalar_type(*kind, pointee);
                self.emit(instrs, InstrKind::StoreIndirect { address, value, ty });
            }

            Add => self.binary(instrs, stack, BinOp::Add, false, false),
            Sub => self.binary(instrs, stack, BinOp::Sub, false, false),
            Mul => self.binary(instrs, stack, BinOp::Mul, false, false),
            Div => self.binary(instrs, stack, BinOp::Div, false, false),
            DivUn => self.binary(instrs, stack, BinOp::Div, false, true),
            Rem => self.binary(instrs, stack, BinOp::Rem, false, false),
            RemUn => self.binary(instrs, stack, BinOp::Rem, false, true),
            And => self.binary(instrs, stack, BinOp::And, false, false),
            Or => self.binary(instrs, stack, BinOp::Or, false, false),
            Xor => self.binary(instrs, stack, BinOp::Xor, false, false),
            Shl => self.binary(instrs, stack, BinOp::Shl, false, false),
            Shr => self.binary(instrs, stack, BinOp::Shr, false, false),
            ShrUn => self.binary(instrs, stack, BinOp::Shr, false, true),
            AddOvf => self.binary(instrs, stack, BinOp::Add, true, false),
            AddOvfUn => self.binary(instrs, stack, BinOp::Add, true, true),
            SubOvf => self.binary(instrs, stack, BinOp::Sub, true, false),
            SubOvfUn => self.binary(instrs, stack, BinOp::Sub, true, true),
            MulOvf => self.binary(instrs, stack, BinOp::Mul, true, false),
            MulOvfUn => self.binary(instrs, stack, BinOp::Mul, true, true),
            Neg => {
                let value = self.pop(stack);
                self.push(
                    instrs,
                    stack,
                    value.ty,
                    InstrKind::Unary {
                        op: UnOp::Neg,
                        value,
                    },
                );
            }
            Not => {
                let value = self.pop(stack);
                self.push(
                    instrs,
                    stack,
                    value.ty,
                    InstrKind::Unary {
                        op: UnOp::Not,
                        value,
                    },
                );
            }
            CkFinite => {
                let value = self.pop(stack);
                self.push(
                    instrs,
                    stack,
                    value.ty,
                    InstrKind::Unary {
                        op: UnOp::CheckFinite,
                        value,
                    },
                );
            }

            Ceq => self.compare(instrs, stack, CmpOp::Eq, false),
            Cgt => self.compare(instrs, stack, CmpOp::Gt, false),
            CgtUn => self.compare(instrs, stack, CmpOp::Gt, true),
            Clt => self.compare(instrs, stack, CmpOp::Lt, false),
            CltUn => self.compare(instrs, stack, CmpOp::Lt, true),

            Conv(kind) => self.convert(instrs, stack, *kind, false, false),
            ConvOvf(kind) => self.convert(instrs, stack, *kind, true, false),
            ConvOvfUn(kind) => self.convert(instrs, stack, *kind, true, true),
            ConvRUn => self.convert(instrs, stack, ScalarKind::R8, false, true),

            LdFld(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                let ty = self.b.module.field(field).ty;
                self.push(instrs, stack, ty, InstrKind::LoadField { object, field });
            }
            LdFldA(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                let inner = self.b.module.field(field).ty;
                let ty = self.byref_of(inner);
                self.push(instrs, stack, ty, InstrKind::FieldAddr { object, field });
            }
            StFld(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let value = self.pop(stack);
                let object = self.pop(stack);
                self.emit(
                    instrs,
                    InstrKind::StoreField {
                        object,
                        field,
                        value,
                    },
                );
            }
            LdSFld(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let ty = self.b.module.field(field).ty;
                self.push(instrs, stack, ty, InstrKind::LoadStatic(field));
            }
            LdSFldA(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let inner = self.b.module.field(field).ty;
                let ty = self.byref_of(inner);
                self.push(instrs, stack, ty, InstrKind::StaticAddr(field));
            }
            StSFld(token) => {
                let Some(field) = self.field_of_token(*token) else {
                    return None;
                };
                let value = self.pop(stack);
                self.emit(instrs, InstrKind::StoreStatic { field, value });
            }

            LdObj(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let address = self.pop(stack);
                self.push(instrs, stack, ty, InstrKind::LoadIndirect { address, ty });
            }
            StObj(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let value = self.pop(stack);
                let address = self.pop(stack);
                self.emit(instrs, InstrKind::StoreIndirect { address, value, ty });
            }
            CpObj(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let src = self.pop(stack);
                let dest = self.pop(stack);
                self.emit(instrs, InstrKind::CopyValue { dest, src, ty });
            }
            InitObj(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let address = self.pop(stack);
                self.emit(instrs, InstrKind::InitValue { address, ty });
            }

            CastClass(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                self.push(instrs, stack, ty, InstrKind::Cast { object, ty });
            }
            IsInst(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                self.push(instrs, stack, ty, InstrKind::IsInstance { object, ty });
            }
            Box(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                if self.b.module.ty(ty).is_value_like() {
                    let value = self.pop(stack);
                    let object = self.ty("System.Object");
                    self.push(instrs, stack, object, InstrKind::Box { value, ty });
                }
                // Boxing a reference type is the identity.
            }
            Unbox(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                let result = self.byref_of(ty);
                self.push(instrs, stack, result, InstrKind::UnboxPtr { object, ty });
            }
            UnboxAny(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                if self.b.module.ty(ty).is_value_like() {
                    self.push(instrs, stack, ty, InstrKind::UnboxValue { object, ty });
                } else {
                    self.push(instrs, stack, ty, InstrKind::Cast { object, ty });
                }
            }

            NewArr(token) => {
                let Some(element) = self.type_of_token(*token) else {
                    return None;
                };
                let length = self.pop(stack);
                let array_name = format!("{}[]", self.b.module.ty(element).name);
                let ty = self.ty(&array_name);
                self.push(instrs, stack, ty, InstrKind::NewArray { element, length });
            }
            LdLen => {
                let array = self.pop(stack);
                let ty = self.prim(Primitive::ISize);
                self.push(instrs, stack, ty, InstrKind::ArrayLength(array));
            }
            LdElem(kind) => {
                let index_v = self.pop(stack);
                let array = self.pop(stack);
                let context = self.pointee(array);
                let element = self.scalar_type(*kind, context);
                self.push(
                    instrs,
                    stack,
                    element,
                    InstrKind::LoadElement {
                        array,
                        index: index_v,
                        element,
                    },
                );
            }
            LdElemTok(token) => {
                let Some(element) = self.type_of_token(*token) else {
                    return None;
                };
                let index_v = self.pop(stack);
                let array = self.pop(stack);
                self.push(
                    instrs,
                    stack,
                    element,
                    InstrKind::LoadElement {
                        array,
                        index: index_v,
                        element,
                    },
                );
            }
            StElem(kind) => {
                let value = self.pop(stack);
                let index_v = self.pop(stack);
                let array = self.pop(stack);
                let context = self.pointee(array);
                let element = self.scalar_type(*kind, context);
                self.emit(
                    instrs,
                    InstrKind::StoreElement {
                        array,
                        index: index_v,
                        value,
                        element,
                    },
                );
            }
            StElemTok(token) => {
                let Some(element) = self.type_of_token(*token) else {
                    return None;
                };
                let value = self.pop(stack);
                let index_v = self.pop(stack);
                let array = self.pop(stack);
                self.emit(
                    instrs,
                    InstrKind::StoreElement {
                        array,
                        index: index_v,
                        value,
                        element,
                    },
                );
            }
            LdElemA(token) => {
                let Some(element) = self.type_of_token(*token) else {
                    return None;
                };
                let index_v = self.pop(stack);
                let array = self.pop(stack);
                let ty = self.byref_of(element);
                self.push(
                    instrs,
                    stack,
                    ty,
                    InstrKind::ElementAddr {
                        array,
                        index: index_v,
                        element,
                    },
                );
            }

            LdToken(token) => self.lower_ldtoken(*token, instrs, stack),
            LdFtn(token) => {
                let Some(method) = self.method_of_token(*token) else {
                    return None;
                };
                let ty = self.prim(Primitive::ISize);
                self.push(instrs, stack, ty, InstrKind::LoadFunction(method));
            }
            LdVirtFtn(token) => {
                let Some(method) = self.method_of_token(*token) else {
                    return None;
                };
                let object = self.pop(stack);
                let ty = self.prim(Primitive::ISize);
                self.push(
                    instrs,
                    stack,
                    ty,
                    InstrKind::LoadVirtualFunction { object, method },
                );
            }

            SizeOf(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let u4 = self.prim(Primitive::U4);
                self.push(instrs, stack, u4, InstrKind::SizeOf(ty));
            }
            LocAlloc => {
                let size = self.pop(stack);
                let ty = self.ty("System.Byte*");
                self.push(instrs, stack, ty, InstrKind::StackAlloc(size));
            }
            CpBlk => {
                let size = self.pop(stack);
                let src = self.pop(stack);
                let dest = self.pop(stack);
                self.emit(
                    instrs,
                    InstrKind::Raw {
                        ty: None,
                        text: "memcpy((void*){0}, (const void*){1}, (size_t){2})".to_string(),
                        args: vec![dest, src, size],
                    },
                );
            }
            InitBlk => {
                let size = self.pop(stack);
                let value = self.pop(stack);
                let dest = self.pop(stack);
                self.emit(
                    instrs,
                    InstrKind::Raw {
                        ty: None,
                        text: "memset((void*){0}, (int){1}, (size_t){2})".to_string(),
                        args: vec![dest, value, size],
                    },
                );
            }

            MkRefAny(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let address = self.pop(stack);
                let tr = self.ty("System.TypedReference");
                self.push(instrs, stack, tr, InstrKind::MakeTypedRef { address, ty });
            }
            RefAnyVal(token) => {
                let Some(ty) = self.type_of_token(*token) else {
                    return None;
                };
                let typed_ref = self.pop(stack);
                let out = self.byref_of(ty);
                self.push(instrs, stack, out, InstrKind::TypedRefValue { typed_ref, ty });
            }
            RefAnyType => {
                let typed_ref = self.pop(stack);
                let handle = self.ty("System.RuntimeTypeHandle");
                self.push(instrs, stack, handle, InstrKind::TypedRefType(typed_ref));
            }
            ArgList => {
                let ty = self.prim(Primitive::ISize);
                self.push(instrs, stack, ty, InstrKind::ArgumentList);
            }

            Constrained(token) => {
                self.pending_constraint = self.type_of_token(*token);
            }
        }
        None
    }

    fn lower_call(
        &mut self,
        token: MetadataToken,
        virtual_call: bool,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
    ) {
        let constraint = self.pending_constraint.take();
        let Some(callee) = self.method_of_token(token) else {
            return;
        };
        let (param_count, has_this, ret, declaring, name) = {
            let m = self.b.module.method(callee);
            (
                m.params.len(),
                !m.is_static(),
                m.return_type,
                m.declaring,
                m.name.clone(),
            )
        };
        let mut args = Vec::with_capacity(param_count + 1);
        for _ in 0..param_count {
            args.push(self.pop(stack));
        }
        if has_this {
            args.push(self.pop(stack));
        }
        args.reverse();

        let declaring_kind = self.b.module.ty(declaring).kind.clone();
        if virtual_call && matches!(declaring_kind, TypeKind::Delegate) && name == "Invoke" {
            let delegate = args.remove(0);
            let ret_void = self.is_void(ret);
            if ret_void {
                self.emit(instrs, InstrKind::InvokeDelegate { delegate, args });
            } else {
                self.push(instrs, stack, ret, InstrKind::InvokeDelegate { delegate, args });
            }
            return;
        }

        // Array-initializer intrinsic: the handle operand traces back to an
        // RVA-backed field; rewrite to a blob reference.
        if !has_this
            && name == "InitializeArray"
            && self.b.module.ty(declaring).name
                == "System.Runtime.CompilerServices.RuntimeHelpers"
            && args.len() == 2
        {
            if let Some(field) = self.handle_sources.get(&args[1].id).copied() {
                let array = args[0];
                self.emit(
                    instrs,
                    InstrKind::InitArrayData {
                        array,
                        blob: BlobId(field.0),
                    },
                );
                return;
            }
        }

        let kind = if !has_this {
            CallKind::Static
        } else if let Some(c) = constraint {
            CallKind::Constrained(c)
        } else if virtual_call {
            if matches!(declaring_kind, TypeKind::Interface) {
                CallKind::Interface
            } else {
                CallKind::Virtual
            }
        } else {
            CallKind::Instance
        };

        if self.is_void(ret) {
            self.emit(instrs, InstrKind::Call { callee, args, kind });
        } else {
            self.push(instrs, stack, ret, InstrKind::Call { callee, args, kind });
        }
    }

    fn lower_newobj(
        &mut self,
        token: MetadataToken,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
    ) {
        let Some(ctor) = self.method_of_token(token) else {
            return;
        };
        let (param_count, declaring) = {
            let m = self.b.module.method(ctor);
            (m.params.len(), m.declaring)
        };
        let mut args = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            args.push(self.pop(stack));
        }
        args.reverse();
        self.push(instrs, stack, declaring, InstrKind::NewObject { ctor, args });
    }

    fn lower_calli(
        &mut self,
        token: MetadataToken,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
    ) {
        if token.table() != Some(TableId::StandAloneSig) {
            self.fail(StubReason::RenderedBodyError(
                "calli with a non-signature token".to_string(),
            ));
            return;
        }
        let asm = self.b.world.set.assembly(self.asm);
        let sig = asm
            .file
            .tables()
            .stand_alone_sig
            .get(token.rid() as usize - 1)
            .and_then(|row| asm.file.blobs().get(row.signature).ok())
            .and_then(|blob| cil2cpp_metadata::signatures::parse_method_sig(blob).ok());
        let Some(sig) = sig else {
            self.fail(StubReason::RenderedBodyError(
                "calli signature unreadable".to_string(),
            ));
            return;
        };
        let function = self.pop(stack);
        let mut args = Vec::with_capacity(sig.params.len());
        for _ in 0..sig.params.len() {
            args.push(self.pop(stack));
        }
        args.reverse();
        let mut params = Vec::with_capacity(sig.params.len());
        for p in &sig.params {
            let name = self
                .b
                .world
                .type_sig_name(self.asm, p, &self.ctx.clone())
                .unwrap_or_else(|_| "System.Object".to_string());
            params.push(self.ty(&name));
        }
        let ret_name = self
            .b
            .world
            .type_sig_name(self.asm, &sig.return_type, &self.ctx.clone())
            .unwrap_or_else(|_| "System.Void".to_string());
        let ret = self.ty(&ret_name);
        let fnsig = FnSig { params, ret };
        if self.is_void(ret) {
            self.emit(
                instrs,
                InstrKind::CallIndirect {
                    function,
                    args,
                    sig: fnsig,
                },
            );
        } else {
            self.push(
                instrs,
                stack,
                ret,
                InstrKind::CallIndirect {
                    function,
                    args,
                    sig: fnsig,
                },
            );
        }
    }

    fn lower_ldtoken(
        &mut self,
        token: MetadataToken,
        instrs: &mut Vec<Instr>,
        stack: &mut Vec<Value>,
    ) {
        match token.table() {
            Some(TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec) => {
                if let Some(ty) = self.type_of_token(token) {
                    let handle = self.ty("System.RuntimeTypeHandle");
                    self.push(instrs, stack, handle, InstrKind::LoadTypeHandle(ty));
                }
            }
            Some(TableId::Field) => {
                if let Some(field) = self.field_of_token(token) {
                    let handle = self.ty("System.RuntimeFieldHandle");
                    let v = self.push(instrs, stack, handle, InstrKind::LoadFieldHandle(field));
                    self.handle_sources.insert(v.id, field);
                }
            }
            Some(TableId::MethodDef | TableId::MethodSpec) => {
                if let Some(method) = self.method_of_token(token) {
                    let handle = self.ty("System.RuntimeMethodHandle");
                    self.push(instrs, stack, handle, InstrKind::LoadMethodHandle(method));
                }
            }
            Some(TableId::MemberRef) => {
                if self
                    .b
                    .world
                    .resolve_method_token(self.asm, token, &self.ctx)
                    .is_ok()
                {
                    if let Some(method) = self.method_of_token(token) {
                        let handle = self.ty("System.RuntimeMethodHandle");
                        self.push(instrs, stack, handle, InstrKind::LoadMethodHandle(method));
                    }
                } else if let Some(field) = self.field_of_token(token) {
                    let handle = self.ty("System.RuntimeFieldHandle");
                    let v = self.push(instrs, stack, handle, InstrKind::LoadFieldHandle(field));
                    self.handle_sources.insert(v.id, field);
                }
            }
            _ => {
                let key = self.key.clone();
                self.b.diag(&key, format!("ldtoken target {token} unsupported"));
            }
        }
    }

    fn is_void(&mut self, ty: TypeId) -> bool {
        matches!(
            self.b.module.ty(ty).kind,
            TypeKind::Primitive(Primitive::Void)
        )
    }
}

/// Map region offsets onto block-id ranges (inclusive).
fn map_regions(cfg: &MethodCfg, blocks: &[BasicBlock]) -> Vec<IrExceptionRegion> {
    let block_index = |offset: u32, end: bool| -> u32 {
        if let Some(i) = cfg.block_at.get(&offset) {
            if end {
                (*i as u32).saturating_sub(1)
            } else {
                *i as u32
            }
        } else if end {
            blocks.len() as u32 - 1
        } else {
            0
        }
    };
    cfg.regions
        .iter()
        .filter_map(|r| {
            let kind = match &r.kind {
                HandlerKind::Catch(_) => {
                    // The catch type was interned during lowering; recover
                    // it from the handler entry block's seeded stack via the
                    // first instruction's type.
                    let handler = *cfg.block_at.get(&r.handler_start)? as usize;
                    let ty = blocks
                        .get(handler)
                        .and_then(|b| b.instrs.first())
                        .and_then(|i| i.dest)
                        .map(|v| v.ty)?;
                    RegionKind::Catch(ty)
                }
                HandlerKind::Finally => RegionKind::Finally,
                HandlerKind::Fault => RegionKind::Fault,
                HandlerKind::Filter(_) => return None,
            };
            Some(IrExceptionRegion {
                kind,
                try_start: BlockId(block_index(r.try_start, false)),
                try_end: BlockId(block_index(r.try_end, true)),
                handler_start: BlockId(block_index(r.handler_start, false)),
                handler_end: BlockId(block_index(r.handler_end, true)),
            })
        })
        .collect()
}
