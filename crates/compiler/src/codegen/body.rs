//! Method-body rendering.
//!
//! Each basic block becomes a labeled block of statements; every IR value
//! becomes a local `t<n>`. Exception regions render through the runtime's
//! setjmp/longjmp macros with an explicit leave-target variable, so control
//! never jumps over anything that owns a destructor — emitted bodies hold
//! only scalars and raw pointers.
//!
//! Rendering returns `Err` with a description when a construct cannot be
//! expressed; the caller records a `RenderedBodyError` stub. The emitter
//! stays total either way.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::ir::{
    BasicBlock, BinOp, BlockId, CallKind, CmpOp, InstrKind, IrExceptionRegion, MethodId,
    Primitive, RegionKind, Terminator, TypeId, TypeKind, UnOp, Value,
};

use super::CppGen;

type RenderResult<T> = std::result::Result<T, String>;

pub fn render_method(g: &mut CppGen<'_>, id: MethodId) -> RenderResult<String> {
    let (sig, _) = g.fn_signature(id);
    let mut out = String::with_capacity(1024);
    let _ = writeln!(out, "{sig} {{");

    let locals = g.module.method(id).locals.clone();
    for (i, local) in locals.iter().enumerate() {
        let _ = writeln!(out, "    {} loc{i}{{}};", g.cpp_type(local.ty));
    }

    let regions = g.module.method(id).exception_regions.clone();
    let has_regions = !regions.is_empty();
    if has_regions {
        let _ = writeln!(out, "    int32_t __leave_tgt = -1;");
        let _ = writeln!(out, "    (void)__leave_tgt;");
        let _ = writeln!(out, "    c2c_object* __exc = nullptr;");
        let _ = writeln!(out, "    (void)__exc;");
    }

    let blocks = g.module.method(id).blocks.clone();

    // Every value is declared up front; blocks only assign. Jumping over
    // an initialized declaration is ill-formed C++, and these bodies are
    // all labels and gotos.
    {
        let mut declared = std::collections::BTreeSet::new();
        for block in &blocks {
            for instr in &block.instrs {
                if let Some(d) = instr.dest {
                    if declared.insert(d.id) {
                        let _ = writeln!(out, "    {} {}{{}};", g.cpp_type(d.ty), val(d));
                    }
                }
            }
        }
    }

    let leave_targets = collect_leave_targets(&blocks, &regions);
    let groups = group_regions(&regions);

    for (index, block) in blocks.iter().enumerate() {
        let bid = BlockId(index as u32);
        // Open protected regions whose try range starts here, widest first.
        for _group in groups.iter().filter(|gr| gr.try_start == bid) {
            let _ = writeln!(out, "    C2C_TRY {{");
        }

        let _ = writeln!(out, "BB{index}: ;");
        for instr in &block.instrs {
            render_instr(g, id, instr, &mut out)?;
        }
        render_terminator(g, id, bid, &block.terminator, &regions, &leave_targets, &mut out)?;

        // Close try ranges that end here and emit the handler dispatch,
        // innermost first so the macro scopes unnest in order.
        for group in groups.iter().rev().filter(|gr| gr.try_end == bid) {
            render_handler_intro(g, group, &mut out)?;
        }
    }

    let _ = writeln!(out, "}}");
    Ok(out)
}

/// Regions grouped by try extent: multiple catch clauses over one try
/// render as a single dispatch chain.
struct RegionGroup {
    try_start: BlockId,
    try_end: BlockId,
    catches: Vec<(TypeId, BlockId)>,
    finallys: Vec<BlockId>,
    faults: Vec<BlockId>,
}

fn group_regions(regions: &[IrExceptionRegion]) -> Vec<RegionGroup> {
    let mut groups: Vec<RegionGroup> = Vec::new();
    for region in regions {
        let slot = groups
            .iter_mut()
            .find(|gr| gr.try_start == region.try_start && gr.try_end == region.try_end);
        let group = match slot {
            Some(gr) => gr,
            None => {
                groups.push(RegionGroup {
                    try_start: region.try_start,
                    try_end: region.try_end,
                    catches: Vec::new(),
                    finallys: Vec::new(),
                    faults: Vec::new(),
                });
                groups.last_mut().unwrap()
            }
        };
        match &region.kind {
            RegionKind::Catch(ty) => group.catches.push((*ty, region.handler_start)),
            RegionKind::Finally => group.finallys.push(region.handler_start),
            RegionKind::Fault => group.faults.push(region.handler_start),
        }
    }
    // Widest try first, so openings at a shared leader nest correctly.
    groups.sort_by_key(|gr| (gr.try_start, std::cmp::Reverse(gr.try_end)));
    groups
}

fn render_handler_intro(
    g: &CppGen<'_>,
    group: &RegionGroup,
    out: &mut String,
) -> RenderResult<()> {
    if !group.catches.is_empty() {
        let _ = writeln!(out, "    }} C2C_CATCH(__exc_obj) {{");
        for (ty, handler) in &group.catches {
            let ti = g.typeinfo_ident(*ty);
            let _ = writeln!(
                out,
                "        if (c2c_isinst(__exc_obj, &{ti})) {{ __exc = __exc_obj; goto BB{}; }}",
                handler.0
            );
        }
        let _ = writeln!(out, "        C2C_RETHROW;");
        let _ = writeln!(out, "    }} C2C_END_TRY;");
    } else if let Some(handler) = group.finallys.first() {
        let _ = writeln!(
            out,
            "    }} C2C_FINALLY {{ __leave_tgt = -1; goto BB{}; }} C2C_END_TRY;",
            handler.0
        );
    } else if let Some(handler) = group.faults.first() {
        let _ = writeln!(
            out,
            "    }} C2C_FAULT {{ goto BB{}; }} C2C_END_TRY;",
            handler.0
        );
    } else {
        let _ = writeln!(out, "    }} C2C_END_TRY;");
    }
    Ok(())
}

/// Leave targets routed through each finally region (indexed like
/// `regions`).
fn collect_leave_targets(
    blocks: &[BasicBlock],
    regions: &[IrExceptionRegion],
) -> Vec<BTreeSet<u32>> {
    let mut per_region: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); regions.len()];
    for block in blocks {
        if let Terminator::Leave(target) = &block.terminator {
            for (i, region) in regions.iter().enumerate() {
                if !matches!(region.kind, RegionKind::Finally | RegionKind::Fault) {
                    continue;
                }
                let in_try = block.id >= region.try_start && block.id <= region.try_end;
                let target_inside = *target >= region.try_start && *target <= region.handler_end;
                if in_try && !target_inside {
                    per_region[i].insert(target.0);
                }
            }
        }
    }
    per_region
}

fn in_range(b: BlockId, start: BlockId, end: BlockId) -> bool {
    b >= start && b <= end
}

fn render_terminator(
    g: &mut CppGen<'_>,
    id: MethodId,
    block: BlockId,
    terminator: &Terminator,
    regions: &[IrExceptionRegion],
    leave_targets: &[BTreeSet<u32>],
    out: &mut String,
) -> RenderResult<()> {
    match terminator {
        Terminator::Goto(t) => {
            let _ = writeln!(out, "    goto BB{};", t.0);
        }
        Terminator::Branch {
            condition,
            if_true,
            if_false,
        } => {
            let _ = writeln!(
                out,
                "    if ({}) goto BB{}; else goto BB{};",
                val(*condition),
                if_true.0,
                if_false.0
            );
        }
        Terminator::Switch {
            value,
            targets,
            default,
        } => {
            let _ = writeln!(out, "    switch ((int32_t){}) {{", val(*value));
            for (i, t) in targets.iter().enumerate() {
                let _ = writeln!(out, "    case {i}: goto BB{};", t.0);
            }
            let _ = writeln!(out, "    default: goto BB{};", default.0);
            let _ = writeln!(out, "    }}");
        }
        Terminator::Return(v) => match v {
            Some(v) => {
                let _ = writeln!(out, "    return {};", val(*v));
            }
            None => {
                let _ = writeln!(out, "    return;");
            }
        },
        Terminator::Throw(v) => {
            let _ = writeln!(out, "    c2c_throw((c2c_object*){});", val(*v));
        }
        Terminator::Rethrow => {
            let _ = writeln!(out, "    C2C_RETHROW;");
        }
        Terminator::Leave(target) => {
            render_leave(block, *target, regions, out)?;
        }
        Terminator::EndFinally => {
            // Which finally is this? The one whose handler range holds us.
            let owner = regions.iter().position(|r| {
                matches!(r.kind, RegionKind::Finally | RegionKind::Fault)
                    && in_range(block, r.handler_start, r.handler_end)
            });
            if let Some(owner) = owner {
                let targets = &leave_targets[owner];
                if !targets.is_empty() {
                    let _ = writeln!(out, "    switch (__leave_tgt) {{");
                    for t in targets {
                        let _ = writeln!(
                            out,
                            "    case {t}: __leave_tgt = -1; goto BB{t};"
                        );
                    }
                    let _ = writeln!(out, "    default: break;");
                    let _ = writeln!(out, "    }}");
                }
            }
            let _ = writeln!(out, "    C2C_FINALLY_CONTINUE;");
        }
        Terminator::Unreachable => {
            let key = g.module.method_key_string(id);
            let _ = writeln!(out, "    c2c_stub_trap(\"{key}\", \"unreachable\");");
        }
    }
    Ok(())
}

fn render_leave(
    block: BlockId,
    target: BlockId,
    regions: &[IrExceptionRegion],
    out: &mut String,
) -> RenderResult<()> {
    // Regions whose try range holds this block but not the target are the
    // ones being exited.
    let mut crossed_finallys: Vec<&IrExceptionRegion> = Vec::new();
    let mut crossed_catch_tries = 0usize;
    for region in regions {
        let in_try = in_range(block, region.try_start, region.try_end);
        let target_inside =
            in_range(target, region.try_start, region.try_end)
                || in_range(target, region.handler_start, region.handler_end);
        if in_try && !target_inside {
            match region.kind {
                RegionKind::Finally | RegionKind::Fault => crossed_finallys.push(region),
                RegionKind::Catch(_) => crossed_catch_tries += 1,
            }
        }
    }
    if crossed_finallys.len() > 1 {
        return Err("leave crosses nested finally regions".to_string());
    }
    // Pop one EH context per protected region being exited from inside its
    // try range.
    for _ in 0..crossed_catch_tries {
        let _ = writeln!(out, "    C2C_LEAVE_TRY;");
    }
    match crossed_finallys.first() {
        Some(region) => {
            let _ = writeln!(out, "    C2C_LEAVE_TRY;");
            let _ = writeln!(out, "    __leave_tgt = {};", target.0);
            let _ = writeln!(out, "    goto BB{};", region.handler_start.0);
        }
        None => {
            let _ = writeln!(out, "    goto BB{};", target.0);
        }
    }
    Ok(())
}

fn val(v: Value) -> String {
    format!("t{}", v.id)
}

/// Unsigned C++ counterpart for unsigned-flavored operations.
fn unsigned_cast(g: &CppGen<'_>, ty: TypeId) -> &'static str {
    match g.module.ty(ty).kind {
        TypeKind::Primitive(Primitive::I8 | Primitive::U8) => "uint64_t",
        TypeKind::Primitive(Primitive::ISize | Primitive::USize) => "uintptr_t",
        _ => "uint32_t",
    }
}

fn is_float(g: &CppGen<'_>, ty: TypeId) -> bool {
    matches!(
        g.module.ty(ty).kind,
        TypeKind::Primitive(Primitive::F4 | Primitive::F8)
    )
}

fn is_pointerish(g: &CppGen<'_>, ty: TypeId) -> bool {
    matches!(
        g.module.ty(ty).kind,
        TypeKind::Pointer(_) | TypeKind::ByRef(_)
    )
}

/// `ensure_cctor` call preceding a static access, unless we are inside the
/// very cctor being guarded.
fn ensure_cctor(g: &CppGen<'_>, method: MethodId, declaring: TypeId, out: &mut String) {
    let ty = g.module.ty(declaring);
    let Some(cctor) = ty.cctor else { return };
    if cctor == method {
        return;
    }
    if g.type_ident(declaring).is_empty() {
        return;
    }
    let _ = writeln!(out, "    {}();", g.ensure_cctor_ident(declaring));
}

fn member_access(g: &CppGen<'_>, object: Value, field: crate::ir::FieldId) -> String {
    let member = g.field_member(field);
    let declaring = g.module.field(field).declaring;
    let obj_ty = g.module.ty(object.ty);
    // Fields inherited from a base land inside nested `__base` embeds;
    // casting to the declaring struct keeps the access flat.
    let base = if obj_ty.is_value_like() && !is_pointerish(g, object.ty) {
        return format!("{}.{}", val(object), member);
    } else if object.ty == declaring {
        val(object)
    } else {
        format!("(({}*) {})", g.type_ident(declaring), val(object))
    };
    format!("{base}->{member}")
}

fn render_instr(
    g: &mut CppGen<'_>,
    id: MethodId,
    instr: &crate::ir::Instr,
    out: &mut String,
) -> RenderResult<()> {
    let dest = instr.dest;
    // Destinations were declared at the top of the function; statements
    // here only assign.
    let assign = |_g: &CppGen<'_>, expr: String, out: &mut String| {
        if let Some(d) = dest {
            let _ = writeln!(out, "    {} = {};", val(d), expr);
        } else {
            let _ = writeln!(out, "    {expr};");
        }
    };

    match &instr.kind {
        InstrKind::ConstI32(v) => {
            let expr = if *v == i32::MIN {
                "(-2147483647 - 1)".to_string()
            } else {
                format!("INT32_C({v})")
            };
            assign(g, expr, out);
        }
        InstrKind::ConstI64(v) => {
            let expr = if *v == i64::MIN {
                "(-INT64_C(9223372036854775807) - 1)".to_string()
            } else {
                format!("INT64_C({v})")
            };
            assign(g, expr, out);
        }
        InstrKind::ConstF32(v) => {
            if v.is_finite() {
                assign(g, format!("{v:?}f"), out)
            } else {
                assign(g, float_bits_expr_f32(*v), out)
            }
        }
        InstrKind::ConstF64(v) => {
            if v.is_finite() {
                assign(g, format!("{v:?}"), out)
            } else {
                assign(g, float_bits_expr_f64(*v), out)
            }
        }
        InstrKind::ConstNull => assign(g, "nullptr".to_string(), out),
        InstrKind::ConstString(sid) => {
            let symbol = g
                .module
                .strings
                .get(sid.0 as usize)
                .map(|s| s.symbol.clone())
                .ok_or_else(|| format!("string literal {} missing from pool", sid.0))?;
            assign(g, symbol, out);
        }

        InstrKind::LoadLocal(n) => assign(g, format!("loc{n}"), out),
        InstrKind::StoreLocal(n, v) => {
            let _ = writeln!(out, "    loc{n} = {};", val(*v));
        }
        InstrKind::LocalAddr(n) => assign(g, format!("&loc{n}"), out),
        InstrKind::LoadParam(n) => assign(g, param_name(g, id, *n), out),
        InstrKind::StoreParam(n, v) => {
            let _ = writeln!(out, "    {} = {};", param_name(g, id, *n), val(*v));
        }
        InstrKind::ParamAddr(n) => assign(g, format!("&{}", param_name(g, id, *n)), out),

        InstrKind::LoadField { object, field } => {
            assign(g, member_access(g, *object, *field), out)
        }
        InstrKind::StoreField {
            object,
            field,
            value,
        } => {
            let _ = writeln!(out, "    {} = {};", member_access(g, *object, *field), val(*value));
        }
        InstrKind::FieldAddr { object, field } => {
            assign(g, format!("&{}", member_access(g, *object, *field)), out)
        }
        InstrKind::LoadStatic(field) => {
            ensure_cctor(g, id, g.module.field(*field).declaring, out);
            assign(g, g.static_ident(*field).to_string(), out);
        }
        InstrKind::StoreStatic { field, value } => {
            ensure_cctor(g, id, g.module.field(*field).declaring, out);
            let _ = writeln!(out, "    {} = {};", g.static_ident(*field), val(*value));
        }
        InstrKind::StaticAddr(field) => {
            ensure_cctor(g, id, g.module.field(*field).declaring, out);
            assign(g, format!("&{}", g.static_ident(*field)), out);
        }

        InstrKind::NewArray { element, length } => {
            let ti = g.typeinfo_ident(*element);
            assign(
                g,
                format!("c2c_array_alloc(&{ti}, (int32_t){})", val(*length)),
                out,
            );
        }
        InstrKind::ArrayLength(array) => {
            assign(g, format!("(intptr_t)c2c_array_length({})", val(*array)), out)
        }
        InstrKind::LoadElement {
            array,
            index,
            element,
        } => {
            let elem = g.cpp_type(*element);
            assign(
                g,
                format!(
                    "*({elem}*)c2c_array_at({}, (int32_t){}, sizeof({elem}))",
                    val(*array),
                    val(*index)
                ),
                out,
            );
        }
        InstrKind::StoreElement {
            array,
            index,
            value,
            element,
        } => {
            let elem_is_ref = {
                let t = g.module.ty(*element);
                !t.is_value_like() && !is_pointerish(g, *element)
            };
            if elem_is_ref {
                let _ = writeln!(
                    out,
                    "    c2c_array_store_ref({}, (int32_t){}, (c2c_object*){});",
                    val(*array),
                    val(*index),
                    val(*value)
                );
            } else {
                let elem = g.cpp_type(*element);
                let _ = writeln!(
                    out,
                    "    *({elem}*)c2c_array_at({}, (int32_t){}, sizeof({elem})) = {};",
                    val(*array),
                    val(*index),
                    val(*value)
                );
            }
        }
        InstrKind::ElementAddr {
            array,
            index,
            element,
        } => {
            let elem = g.cpp_type(*element);
            assign(
                g,
                format!(
                    "({elem}*)c2c_array_at({}, (int32_t){}, sizeof({elem}))",
                    val(*array),
                    val(*index)
                ),
                out,
            );
        }
        InstrKind::InitArrayData { array, blob } => {
            let symbol = g
                .module
                .blobs
                .get(blob.0 as usize)
                .map(|b| b.symbol.clone())
                .ok_or_else(|| format!("array-init blob {} missing", blob.0))?;
            let _ = writeln!(
                out,
                "    c2c_array_init_from_blob({}, {symbol}, sizeof({symbol}));",
                val(*array)
            );
        }

        InstrKind::Call { callee, args, kind } => {
            render_call(g, id, dest, *callee, args, *kind, out)?;
        }
        InstrKind::CallIndirect {
            function,
            args,
            sig,
        } => {
            let ret = g.cpp_type(sig.ret);
            let param_tys: Vec<String> = sig.params.iter().map(|p| g.cpp_type(*p)).collect();
            let arg_list: Vec<String> = args.iter().map(|a| val(*a)).collect();
            let expr = format!(
                "(({ret}(*)({}))(void*){})({})",
                param_tys.join(", "),
                val(*function),
                arg_list.join(", ")
            );
            assign(g, expr, out);
        }
        InstrKind::InvokeDelegate { delegate, args } => {
            render_delegate_invoke(g, dest, *delegate, args, out);
        }
        InstrKind::NewObject { ctor, args } => {
            render_newobj(g, id, dest, *ctor, args, out)?;
        }

        InstrKind::Box { value, ty } => {
            // Braced so the temporary's initialization cannot be jumped
            // over by a later goto.
            let d = dest.ok_or_else(|| "box without destination".to_string())?;
            let ti = g.typeinfo_ident(*ty);
            let tmp = format!("__box_src{}", d.id);
            let _ = writeln!(
                out,
                "    {{ {} {tmp} = {}; {} = c2c_box(&{ti}, &{tmp}, sizeof({tmp})); }}",
                g.cpp_type(*ty),
                val(*value),
                val(d)
            );
        }
        InstrKind::UnboxPtr { object, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!(
                    "({}*)c2c_unbox((c2c_object*){}, &{ti})",
                    g.cpp_type(*ty),
                    val(*object)
                ),
                out,
            );
        }
        InstrKind::UnboxValue { object, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!(
                    "*({}*)c2c_unbox((c2c_object*){}, &{ti})",
                    g.cpp_type(*ty),
                    val(*object)
                ),
                out,
            );
        }
        InstrKind::IsInstance { object, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!(
                    "({})c2c_isinst((c2c_object*){}, &{ti})",
                    g.cpp_type(instr.dest.map(|d| d.ty).unwrap_or(*ty)),
                    val(*object)
                ),
                out,
            );
        }
        InstrKind::Cast { object, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!(
                    "({})c2c_castclass((c2c_object*){}, &{ti})",
                    g.cpp_type(instr.dest.map(|d| d.ty).unwrap_or(*ty)),
                    val(*object)
                ),
                out,
            );
        }

        InstrKind::Binary {
            op,
            checked,
            unsigned,
            lhs,
            rhs,
        } => {
            let expr = render_binary(g, *op, *checked, *unsigned, *lhs, *rhs, dest)?;
            assign(g, expr, out);
        }
        InstrKind::Compare {
            op,
            unordered,
            lhs,
            rhs,
        } => {
            let expr = render_compare(g, *op, *unordered, *lhs, *rhs);
            assign(g, expr, out);
        }
        InstrKind::Unary { op, value } => {
            let expr = match op {
                UnOp::Neg => format!("-({})", val(*value)),
                UnOp::Not => format!("~({})", val(*value)),
                UnOp::CheckFinite => format!("c2c_ckfinite({})", val(*value)),
            };
            assign(g, expr, out);
        }
        InstrKind::Convert {
            to,
            value,
            checked,
            source_unsigned,
        } => {
            let to_c = g.cpp_type(*to);
            let src = if *source_unsigned {
                format!("({})({})", unsigned_cast(g, value.ty), val(*value))
            } else {
                val(*value)
            };
            let expr = if *checked {
                format!("c2c_conv_ovf<{to_c}>({src})")
            } else {
                format!("({to_c})({src})")
            };
            assign(g, expr, out);
        }

        InstrKind::LoadIndirect { address, ty } => {
            assign(
                g,
                format!("*({}*)({})", g.cpp_type(*ty), val(*address)),
                out,
            );
        }
        InstrKind::StoreIndirect { address, value, ty } => {
            let _ = writeln!(
                out,
                "    *({}*)({}) = {};",
                g.cpp_type(*ty),
                val(*address),
                val(*value)
            );
        }
        InstrKind::InitValue { address, ty } => {
            let t = g.module.ty(*ty);
            if t.is_value_like() {
                let _ = writeln!(
                    out,
                    "    memset((void*){}, 0, sizeof({}));",
                    val(*address),
                    g.cpp_type(*ty)
                );
            } else {
                let _ = writeln!(out, "    *(void**){} = nullptr;", val(*address));
            }
        }
        InstrKind::CopyValue { dest: d, src, ty } => {
            let c = g.cpp_type(*ty);
            let _ = writeln!(out, "    *({c}*){} = *({c}*){};", val(*d), val(*src));
        }
        InstrKind::SizeOf(ty) => {
            let t = g.module.ty(*ty);
            let expr = if t.is_value_like() {
                format!("(uint32_t)sizeof({})", g.cpp_type(*ty))
            } else {
                "(uint32_t)sizeof(void*)".to_string()
            };
            assign(g, expr, out);
        }
        InstrKind::StackAlloc(size) => {
            assign(g, format!("(uint8_t*)c2c_alloca((size_t){})", val(*size)), out)
        }

        InstrKind::LoadFunction(m) => {
            let symbol = g.method_symbol(*m).to_string();
            let caller = g.method_symbol(id).to_string();
            g.add_call_edge(&caller, &symbol);
            assign(g, format!("(intptr_t)&{symbol}"), out);
        }
        InstrKind::LoadVirtualFunction { object, method } => {
            let slot = g
                .module
                .method(*method)
                .vtable_slot
                .ok_or_else(|| "ldvirtftn on a non-virtual method".to_string())?;
            assign(
                g,
                format!(
                    "(intptr_t)((c2c_object*){})->__ti->vtable[{slot}]",
                    val(*object)
                ),
                out,
            );
        }
        InstrKind::LoadTypeHandle(ty) => {
            let ti = g.typeinfo_ident(*ty);
            assign(g, format!("c2c_type_handle{{ &{ti} }}"), out);
        }
        InstrKind::LoadMethodHandle(_) | InstrKind::LoadFieldHandle(_) => {
            assign(g, "{}".to_string(), out);
        }

        InstrKind::MakeTypedRef { address, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!("c2c_make_typed_ref((void*){}, &{ti})", val(*address)),
                out,
            );
        }
        InstrKind::TypedRefValue { typed_ref, ty } => {
            let ti = g.typeinfo_ident(*ty);
            assign(
                g,
                format!(
                    "({}*)c2c_typed_ref_value({}, &{ti})",
                    g.cpp_type(*ty),
                    val(*typed_ref)
                ),
                out,
            );
        }
        InstrKind::TypedRefType(typed_ref) => {
            assign(g, format!("c2c_typed_ref_type({})", val(*typed_ref)), out);
        }
        InstrKind::ArgumentList => {
            return Err("arglist requires a vararg frame".to_string());
        }

        InstrKind::Raw { text, args, .. } => {
            let mut expr = text.clone();
            for (i, a) in args.iter().enumerate() {
                expr = expr.replace(&format!("{{{i}}}"), &val(*a));
            }
            // A pointer-typed destination takes a cast; raw text cannot
            // know the emitted type names (the catch-entry `__exc` binding
            // lands here as a `c2c_object*`).
            if let Some(d) = dest {
                let ty = g.cpp_type(d.ty);
                if ty.ends_with('*') {
                    expr = format!("({ty})({expr})");
                }
            }
            assign(g, expr, out);
        }
    }
    Ok(())
}

fn param_name(g: &CppGen<'_>, id: MethodId, n: u16) -> String {
    let m = g.module.method(id);
    if !m.is_static() {
        if n == 0 {
            return "self".to_string();
        }
        return m
            .params
            .get(n as usize - 1)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("a{}", n - 1));
    }
    m.params
        .get(n as usize)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| format!("a{n}"))
}

fn render_binary(
    g: &CppGen<'_>,
    op: BinOp,
    checked: bool,
    unsigned: bool,
    lhs: Value,
    rhs: Value,
    dest: Option<Value>,
) -> RenderResult<String> {
    let result_ty = dest.map(|d| d.ty).unwrap_or(lhs.ty);
    let result_c = g.cpp_type(result_ty);

    // Managed-pointer arithmetic is byte arithmetic.
    if is_pointerish(g, lhs.ty) && matches!(op, BinOp::Add | BinOp::Sub) {
        let sign = if matches!(op, BinOp::Add) { "+" } else { "-" };
        return Ok(format!(
            "({result_c})((uint8_t*){} {sign} (intptr_t){})",
            val(lhs),
            val(rhs)
        ));
    }

    if checked {
        let helper = match op {
            BinOp::Add => "c2c_add_ovf",
            BinOp::Sub => "c2c_sub_ovf",
            BinOp::Mul => "c2c_mul_ovf",
            _ => return Err(format!("checked {op:?} has no overflow template")),
        };
        if unsigned {
            let u = unsigned_cast(g, result_ty);
            return Ok(format!(
                "({result_c}){helper}<{u}>(({u}){}, ({u}){})",
                val(lhs),
                val(rhs)
            ));
        }
        return Ok(format!("{helper}<{result_c}>({}, {})", val(lhs), val(rhs)));
    }

    let float = is_float(g, lhs.ty) || is_float(g, rhs.ty);
    match op {
        BinOp::Div if float => Ok(format!("{} / {}", val(lhs), val(rhs))),
        BinOp::Rem if float => Ok(format!("c2c_frem({}, {})", val(lhs), val(rhs))),
        BinOp::Div | BinOp::Rem => {
            let helper = if matches!(op, BinOp::Div) {
                "c2c_div"
            } else {
                "c2c_rem"
            };
            if unsigned {
                let u = unsigned_cast(g, result_ty);
                Ok(format!(
                    "({result_c}){helper}<{u}>(({u}){}, ({u}){})",
                    val(lhs),
                    val(rhs)
                ))
            } else {
                Ok(format!("{helper}<{result_c}>({}, {})", val(lhs), val(rhs)))
            }
        }
        BinOp::Shr if unsigned => {
            let u = unsigned_cast(g, lhs.ty);
            Ok(format!(
                "({result_c})((({u}){}) >> ((uint32_t){} & 63))",
                val(lhs),
                val(rhs)
            ))
        }
        BinOp::Shl => Ok(format!(
            "({result_c})({} << ((uint32_t){} & 63))",
            val(lhs),
            val(rhs)
        )),
        BinOp::Shr => Ok(format!(
            "({result_c})({} >> ((uint32_t){} & 63))",
            val(lhs),
            val(rhs)
        )),
        BinOp::Add => Ok(format!("{} + {}", val(lhs), val(rhs))),
        BinOp::Sub => Ok(format!("{} - {}", val(lhs), val(rhs))),
        BinOp::Mul => Ok(format!("{} * {}", val(lhs), val(rhs))),
        BinOp::And => Ok(format!("{} & {}", val(lhs), val(rhs))),
        BinOp::Or => Ok(format!("{} | {}", val(lhs), val(rhs))),
        BinOp::Xor => Ok(format!("{} ^ {}", val(lhs), val(rhs))),
    }
}

fn render_compare(g: &CppGen<'_>, op: CmpOp, unordered: bool, lhs: Value, rhs: Value) -> String {
    let float = is_float(g, lhs.ty) || is_float(g, rhs.ty);
    let symbol = match op {
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    };
    if float && unordered {
        // Unordered comparisons succeed when either operand is NaN.
        let name = match op {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        };
        return format!("c2c_fcmp_{name}_un({}, {})", val(lhs), val(rhs));
    }
    if !float && unordered {
        // Unordered over integers means unsigned.
        let u = unsigned_cast(g, lhs.ty);
        return format!(
            "((({u}){}) {symbol} (({u}){})) ? 1 : 0",
            val(lhs),
            val(rhs)
        );
    }
    format!("({} {symbol} {}) ? 1 : 0", val(lhs), val(rhs))
}

fn render_call(
    g: &mut CppGen<'_>,
    id: MethodId,
    dest: Option<Value>,
    callee: MethodId,
    args: &[Value],
    kind: CallKind,
    out: &mut String,
) -> RenderResult<()> {
    let target = g.module.method(callee);
    let is_static_call = target.is_static();
    let declaring = target.declaring;
    let symbol = g.method_symbol(callee).to_string();
    let caller = g.method_symbol(id).to_string();
    g.add_call_edge(&caller, &symbol);

    if is_static_call {
        ensure_cctor(g, id, declaring, out);
    }

    // Arguments cast to the callee's parameter types; pointer params take
    // C-style casts so derived-to-base and null conversions compile.
    let arg_list = cast_args(g, callee, args);
    let assign_expr = |_g: &CppGen<'_>, expr: String, out: &mut String| {
        if let Some(d) = dest {
            let _ = writeln!(out, "    {} = {};", val(d), expr);
        } else {
            let _ = writeln!(out, "    {expr};");
        }
    };

    match kind {
        CallKind::Static | CallKind::Instance => {
            // Vararg concat takes an explicit count up front.
            let expr = if symbol == "c2c_string_concat" {
                format!("c2c_string_concat({}, {})", arg_list.len(), arg_list.join(", "))
            } else {
                format!("{symbol}({})", arg_list.join(", "))
            };
            assign_expr(g, expr, out);
        }
        CallKind::Virtual => {
            let slot = g
                .module
                .method(callee)
                .vtable_slot
                .ok_or_else(|| format!("virtual call to slotless {symbol}"))?;
            let receiver = args
                .first()
                .ok_or_else(|| "virtual call without receiver".to_string())?;
            let sig = fn_ptr_sig(g, callee);
            let expr = format!(
                "(({sig})((c2c_object*){})->__ti->vtable[{slot}])({})",
                val(*receiver),
                arg_list.join(", ")
            );
            assign_expr(g, expr, out);
        }
        CallKind::Interface => {
            let iface_ti = g.typeinfo_ident(declaring);
            let slot = g
                .module
                .ty(declaring)
                .methods
                .iter()
                .position(|m| *m == callee)
                .ok_or_else(|| format!("interface slot for {symbol} not found"))?;
            let receiver = args
                .first()
                .ok_or_else(|| "interface call without receiver".to_string())?;
            let sig = fn_ptr_sig(g, callee);
            let expr = format!(
                "(({sig})c2c_iface_lookup(((c2c_object*){})->__ti, &{iface_ti}, {slot}))({})",
                val(*receiver),
                arg_list.join(", ")
            );
            assign_expr(g, expr, out);
        }
        CallKind::Constrained(constraint) => {
            // Value-type receiver: a direct call when the constraint
            // implements the method itself, otherwise box and dispatch.
            let impl_method = g.module.ty(constraint).methods.iter().copied().find(|m| {
                let cand = g.module.method(*m);
                let tgt = g.module.method(callee);
                cand.name == tgt.name && cand.params.len() == tgt.params.len()
            });
            let receiver = args
                .first()
                .ok_or_else(|| "constrained call without receiver".to_string())?;
            match impl_method {
                Some(direct) => {
                    let direct_symbol = g.method_symbol(direct).to_string();
                    g.add_call_edge(&caller, &direct_symbol);
                    let mut list = arg_list.clone();
                    list[0] = format!("({}*){}", g.cpp_type(constraint), val(*receiver));
                    assign_expr(g, format!("{direct_symbol}({})", list.join(", ")), out);
                }
                None => {
                    let ti = g.typeinfo_ident(constraint);
                    let slot = g
                        .module
                        .method(callee)
                        .vtable_slot
                        .ok_or_else(|| format!("constrained call to slotless {symbol}"))?;
                    // Braced scope keeps the boxed temporary jumpable-over.
                    let boxed = match dest {
                        Some(d) => format!("__boxed{}", d.id),
                        None => format!("__boxed_r{}_s{slot}", receiver.id),
                    };
                    let sig = fn_ptr_sig_boxed(g, callee);
                    let mut list = arg_list.clone();
                    list[0] = boxed.clone();
                    let call = format!(
                        "(({sig}){boxed}->__ti->vtable[{slot}])({})",
                        list.join(", ")
                    );
                    let alloc = format!(
                        "c2c_object* {boxed} = c2c_box(&{ti}, (const void*){}, sizeof({}));",
                        val(*receiver),
                        g.cpp_type(constraint)
                    );
                    match dest {
                        Some(d) => {
                            let _ = writeln!(out, "    {{ {alloc} {} = {call}; }}", val(d));
                        }
                        None => {
                            let _ = writeln!(out, "    {{ {alloc} {call}; }}");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Render arguments with casts to the callee's declared parameter types.
fn cast_args(g: &CppGen<'_>, callee: MethodId, args: &[Value]) -> Vec<String> {
    let m = g.module.method(callee);
    let mut expected: Vec<String> = Vec::with_capacity(args.len());
    if !m.is_static() {
        expected.push(g.receiver_type(m.declaring));
    }
    for p in &m.params {
        expected.push(g.cpp_type(p.ty));
    }
    args.iter()
        .enumerate()
        .map(|(i, a)| match expected.get(i) {
            Some(ty) if ty.ends_with('*') => format!("({ty}){}", val(*a)),
            _ => val(*a),
        })
        .collect()
}

/// Cast type for loading a v-table slot: `RET(*)(RECV, ARGS)`.
fn fn_ptr_sig(g: &CppGen<'_>, callee: MethodId) -> String {
    let m = g.module.method(callee);
    let ret = g.cpp_type(m.return_type);
    let mut params = Vec::with_capacity(m.params.len() + 1);
    if !m.is_static() {
        params.push(g.receiver_type(m.declaring));
    }
    for p in &m.params {
        params.push(g.cpp_type(p.ty));
    }
    format!("{ret}(*)({})", params.join(", "))
}

fn fn_ptr_sig_boxed(g: &CppGen<'_>, callee: MethodId) -> String {
    let m = g.module.method(callee);
    let ret = g.cpp_type(m.return_type);
    let mut params = Vec::with_capacity(m.params.len() + 1);
    params.push("c2c_object*".to_string());
    for p in &m.params {
        params.push(g.cpp_type(p.ty));
    }
    format!("{ret}(*)({})", params.join(", "))
}

fn render_delegate_invoke(
    g: &CppGen<'_>,
    dest: Option<Value>,
    delegate: Value,
    args: &[Value],
    out: &mut String,
) {
    let d = val(delegate);
    let ret = dest.map(|dv| g.cpp_type(dv.ty)).unwrap_or_else(|| "void".to_string());
    let mut param_tys = vec!["c2c_object*".to_string()];
    for a in args {
        param_tys.push(g.cpp_type(a.ty));
    }
    let mut call_args = vec![format!("c2c_delegate_target(__d{})", delegate.id)];
    for a in args {
        call_args.push(val(*a));
    }
    // Walk the combined invocation list; the last target's result wins.
    let _ = writeln!(
        out,
        "    for (c2c_delegate* __d{id} = (c2c_delegate*){d}; __d{id}; __d{id} = c2c_delegate_next(__d{id})) {{",
        id = delegate.id
    );
    let fnptr = format!(
        "(({ret}(*)({}))c2c_delegate_fnptr(__d{}))",
        param_tys.join(", "),
        delegate.id
    );
    match dest {
        Some(dv) => {
            let _ = writeln!(out, "        {} = {fnptr}({});", val(dv), call_args.join(", "));
        }
        None => {
            let _ = writeln!(out, "        {fnptr}({});", call_args.join(", "));
        }
    }
    let _ = writeln!(out, "    }}");
}

fn render_newobj(
    g: &mut CppGen<'_>,
    id: MethodId,
    dest: Option<Value>,
    ctor: MethodId,
    args: &[Value],
    out: &mut String,
) -> RenderResult<()> {
    let declaring = g.module.method(ctor).declaring;
    let dest = dest.ok_or_else(|| "newobj without destination".to_string())?;
    let kind = g.module.ty(declaring).kind.clone();
    let symbol = g.method_symbol(ctor).to_string();
    let caller = g.method_symbol(id).to_string();
    let ti = g.typeinfo_ident(declaring);
    // Skip the receiver slot when casting: it is synthesized below.
    let m = g.module.method(ctor);
    let arg_list: Vec<String> = args
        .iter()
        .zip(&m.params)
        .map(|(a, p)| {
            let ty = g.cpp_type(p.ty);
            if ty.ends_with('*') {
                format!("({ty}){}", val(*a))
            } else {
                val(*a)
            }
        })
        .collect();

    match kind {
        TypeKind::Delegate => {
            // args are (target, fnptr) from the compiler-emitted pattern.
            if args.len() != 2 {
                return Err("delegate constructor without (target, fnptr)".to_string());
            }
            let _ = writeln!(
                out,
                "    {} = ({})c2c_delegate_alloc(&{ti}, (c2c_object*){}, (void*){});",
                val(dest),
                g.cpp_type(dest.ty),
                val(args[0]),
                val(args[1])
            );
        }
        TypeKind::ValueType | TypeKind::Enum(_) | TypeKind::Primitive(_) => {
            g.add_call_edge(&caller, &symbol);
            let mut list = vec![format!("&{}", val(dest))];
            list.extend(arg_list);
            let _ = writeln!(out, "    {symbol}({});", list.join(", "));
        }
        _ => {
            g.add_call_edge(&caller, &symbol);
            let size = g.module.ty(declaring).instance_size.max(16);
            let _ = writeln!(
                out,
                "    {} = ({})c2c_gc_alloc(&{ti}, {size});",
                val(dest),
                g.cpp_type(dest.ty)
            );
            let mut list = vec![val(dest)];
            list.extend(arg_list);
            let _ = writeln!(out, "    {symbol}({});", list.join(", "));
        }
    }
    Ok(())
}

fn float_bits_expr_f32(v: f32) -> String {
    format!("c2c_f32_from_bits(UINT32_C({:#010x}))", v.to_bits())
}

fn float_bits_expr_f64(v: f64) -> String {
    format!("c2c_f64_from_bits(UINT64_C({:#018x}))", v.to_bits())
}
