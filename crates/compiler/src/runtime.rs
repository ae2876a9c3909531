//! The runtime surface the generated code targets.
//!
//! Three fixed tables live here, all consulted by the generator and the
//! stub gates:
//!
//! - the runtime-provided types allowlist (emitted as aliases, never as
//!   struct bodies),
//! - the CLR-internal type denylist (types whose semantics exist only
//!   inside the source ecosystem's runtime; any method touching one is
//!   stubbed),
//! - the runtime function declarations emitted into every generated header.

use std::sync::LazyLock;

/// Alias target for a runtime-provided type.
pub struct RuntimeType {
    pub canonical: &'static str,
    pub alias: &'static str,
    /// Instance size the layout pass assumes for fields of this type held
    /// by value (references are always pointer-sized).
    pub instance_size: u32,
}

/// Types whose definitions come from the runtime library. The generator
/// emits `using X = alias;` instead of a struct body for each.
pub static RUNTIME_PROVIDED_TYPES: &[RuntimeType] = &[
    RuntimeType { canonical: "System.Object", alias: "c2c_object", instance_size: 16 },
    RuntimeType { canonical: "System.String", alias: "c2c_string", instance_size: 24 },
    RuntimeType { canonical: "System.Array", alias: "c2c_array", instance_size: 32 },
    RuntimeType { canonical: "System.Type", alias: "c2c_type", instance_size: 24 },
    RuntimeType { canonical: "System.Exception", alias: "c2c_exception", instance_size: 56 },
    RuntimeType { canonical: "System.Delegate", alias: "c2c_delegate", instance_size: 48 },
    RuntimeType { canonical: "System.MulticastDelegate", alias: "c2c_delegate", instance_size: 48 },
    RuntimeType { canonical: "System.RuntimeTypeHandle", alias: "c2c_type_handle", instance_size: 8 },
    RuntimeType { canonical: "System.RuntimeMethodHandle", alias: "c2c_method_handle", instance_size: 8 },
    RuntimeType { canonical: "System.RuntimeFieldHandle", alias: "c2c_field_handle", instance_size: 8 },
    RuntimeType { canonical: "System.TypedReference", alias: "c2c_typed_ref", instance_size: 16 },
];

pub fn runtime_alias(canonical: &str) -> Option<&'static RuntimeType> {
    RUNTIME_PROVIDED_TYPES
        .iter()
        .find(|t| t.canonical == canonical)
}

/// Types that must survive reachability no matter what the program touches:
/// primitives (their TypeInfos back boxing and arrays), the core exception
/// set the lowered code throws, and the delegate base.
pub static ALWAYS_KEEP_TYPES: &[&str] = &[
    "System.Object",
    "System.ValueType",
    "System.Enum",
    "System.String",
    "System.Array",
    "System.Type",
    "System.Void",
    "System.Boolean",
    "System.Char",
    "System.SByte",
    "System.Byte",
    "System.Int16",
    "System.UInt16",
    "System.Int32",
    "System.UInt32",
    "System.Int64",
    "System.UInt64",
    "System.IntPtr",
    "System.UIntPtr",
    "System.Single",
    "System.Double",
    "System.Exception",
    "System.SystemException",
    "System.ArithmeticException",
    "System.OverflowException",
    "System.DivideByZeroException",
    "System.NullReferenceException",
    "System.InvalidCastException",
    "System.IndexOutOfRangeException",
    "System.OutOfMemoryException",
    "System.Delegate",
    "System.MulticastDelegate",
    "System.RuntimeTypeHandle",
    "System.RuntimeMethodHandle",
    "System.RuntimeFieldHandle",
];

/// CLR-internal types: meaningful only inside the source runtime, with no
/// lowerable representation here. Any method whose signature or body
/// touches one is stubbed with a `ClrInternalType` reason. Namespace
/// prefixes (trailing `.`) match whole namespaces.
pub static CLR_INTERNAL_TYPES: &[&str] = &[
    "System.RuntimeType",
    "System.__Canon",
    "System.Reflection.Emit.",
    "System.Reflection.MethodBase",
    "System.Reflection.MethodInfo",
    "System.Reflection.ConstructorInfo",
    "System.Reflection.FieldInfo",
    "System.Reflection.PropertyInfo",
    "System.Reflection.Assembly",
    "System.Reflection.Module",
    "System.Reflection.Metadata.",
    "System.Runtime.Loader.",
    "System.Runtime.Remoting.",
    "System.Runtime.Intrinsics.",
    "System.Numerics.Vector",
    "System.ArgIterator",
    "System.RuntimeArgumentHandle",
    "System.Threading.Tasks.",
    "System.Linq.Expressions.",
    "System.AppDomain",
    "System.AppContext",
    "System.Diagnostics.StackTrace",
    "System.Diagnostics.StackFrame",
    "System.Globalization.CultureInfo",
    "System.Globalization.CompareInfo",
];

pub fn is_clr_internal(canonical: &str) -> bool {
    CLR_INTERNAL_TYPES.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('.') {
            canonical.starts_with(prefix)
                && canonical[prefix.len()..].starts_with('.')
        } else {
            canonical == *entry
                || canonical
                    .strip_prefix(entry)
                    .is_some_and(|rest| rest.starts_with('`'))
        }
    })
}

/// Method patterns empirically known to produce invalid C++. Matched by
/// (declaring-type prefix, method name); an empty method name matches every
/// method of the type.
pub struct BrokenPattern {
    pub type_prefix: &'static str,
    pub method: &'static str,
    pub label: &'static str,
}

pub static KNOWN_BROKEN_PATTERNS: &[BrokenPattern] = &[
    BrokenPattern {
        type_prefix: "System.Runtime.CompilerServices.Unsafe",
        method: "",
        label: "unsafe-intrinsic-self-expansion",
    },
    BrokenPattern {
        type_prefix: "System.Runtime.Intrinsics",
        method: "",
        label: "simd-intrinsic",
    },
    BrokenPattern {
        type_prefix: "System.Type",
        method: "GetType",
        label: "typehandle-table-helper",
    },
    BrokenPattern {
        type_prefix: "System.Activator",
        method: "CreateInstance",
        label: "late-bound-construction",
    },
    BrokenPattern {
        type_prefix: "System.Buffers.",
        method: "",
        label: "pinned-buffer-pool",
    },
];

pub fn broken_pattern(declaring: &str, method: &str) -> Option<&'static str> {
    KNOWN_BROKEN_PATTERNS
        .iter()
        .find(|p| {
            declaring.starts_with(p.type_prefix) && (p.method.is_empty() || p.method == method)
        })
        .map(|p| p.label)
}

/// A runtime function declaration emitted into the generated header.
pub struct RuntimeDecl {
    /// Function name, also the key for the undeclared-callee gate.
    pub name: &'static str,
    /// Full C++ declaration text.
    pub decl: &'static str,
    /// Section comment emitted before this declaration, if it opens one.
    pub category: Option<&'static str>,
}

const fn decl(name: &'static str, text: &'static str) -> RuntimeDecl {
    RuntimeDecl {
        name,
        decl: text,
        category: None,
    }
}

const fn decl_cat(name: &'static str, text: &'static str, cat: &'static str) -> RuntimeDecl {
    RuntimeDecl {
        name,
        decl: text,
        category: Some(cat),
    }
}

/// Everything the generated code may call from the runtime package, in one
/// data-driven table so the header and the undeclared-callee gate cannot
/// drift apart.
pub static RUNTIME_DECLARATIONS: LazyLock<Vec<RuntimeDecl>> = LazyLock::new(|| {
    vec![
        decl_cat("c2c_runtime_init", "void c2c_runtime_init(int argc, char** argv);", "// Runtime lifecycle"),
        decl("c2c_runtime_shutdown", "void c2c_runtime_shutdown();"),
        decl("c2c_runtime_args", "c2c_array* c2c_runtime_args();"),
        decl("c2c_runtime_exit", "void c2c_runtime_exit(int32_t code);"),
        decl_cat("c2c_gc_alloc", "c2c_object* c2c_gc_alloc(const c2c_typeinfo* ti, size_t size);", "// GC and allocation"),
        decl("c2c_gc_register_root", "void c2c_gc_register_root(void* slot);"),
        decl("c2c_gc_collect", "void c2c_gc_collect();"),
        decl("c2c_gc_suppress_finalize", "void c2c_gc_suppress_finalize(c2c_object* obj);"),
        decl_cat("c2c_box", "c2c_object* c2c_box(const c2c_typeinfo* ti, const void* src, size_t size);", "// Boxing and casts"),
        decl("c2c_unbox", "void* c2c_unbox(c2c_object* obj, const c2c_typeinfo* ti);"),
        decl("c2c_isinst", "c2c_object* c2c_isinst(c2c_object* obj, const c2c_typeinfo* ti);"),
        decl("c2c_castclass", "c2c_object* c2c_castclass(c2c_object* obj, const c2c_typeinfo* ti);"),
        decl("c2c_object_get_type", "c2c_type* c2c_object_get_type(c2c_object* obj);"),
        decl("c2c_object_clone", "c2c_object* c2c_object_clone(c2c_object* obj);"),
        decl("c2c_object_hash", "int32_t c2c_object_hash(c2c_object* obj);"),
        decl("c2c_object_equals", "int32_t c2c_object_equals(c2c_object* a, c2c_object* b);"),
        decl("c2c_object_to_string", "c2c_string* c2c_object_to_string(c2c_object* obj);"),
        decl("c2c_object_finalize_default", "void c2c_object_finalize_default(c2c_object* obj);"),
        decl("c2c_object_ctor_nop", "void c2c_object_ctor_nop(c2c_object* obj);"),
        decl_cat("c2c_string_intern", "c2c_string* c2c_string_intern(const char16_t* units, int32_t count);", "// Strings"),
        decl("c2c_string_alloc", "c2c_string* c2c_string_alloc(int32_t count);"),
        decl("c2c_string_length", "int32_t c2c_string_length(c2c_string* s);"),
        decl("c2c_string_char_at", "char16_t c2c_string_char_at(c2c_string* s, int32_t index);"),
        decl("c2c_string_concat", "c2c_string* c2c_string_concat(int32_t count, ...);"),
        decl("c2c_string_equals", "int32_t c2c_string_equals(c2c_string* a, c2c_string* b);"),
        decl("c2c_string_not_equals", "int32_t c2c_string_not_equals(c2c_string* a, c2c_string* b);"),
        decl("c2c_string_substring", "c2c_string* c2c_string_substring(c2c_string* s, int32_t start, int32_t len);"),
        decl("c2c_string_index_of_char", "int32_t c2c_string_index_of_char(c2c_string* s, char16_t c);"),
        decl("c2c_string_from_i32", "c2c_string* c2c_string_from_i32(int32_t v);"),
        decl_cat("c2c_array_alloc", "c2c_array* c2c_array_alloc(const c2c_typeinfo* element_ti, int32_t length);", "// Arrays"),
        decl("c2c_array_length", "int32_t c2c_array_length(c2c_array* a);"),
        decl("c2c_array_rank", "int32_t c2c_array_rank(c2c_array* a);"),
        decl("c2c_array_data", "void* c2c_array_data(c2c_array* a);"),
        decl("c2c_array_at", "void* c2c_array_at(c2c_array* a, int32_t index, size_t elem_size);"),
        decl("c2c_array_copy", "void c2c_array_copy(c2c_array* src, c2c_array* dst, int32_t len);"),
        decl("c2c_array_copy_range", "void c2c_array_copy_range(c2c_array* src, int32_t si, c2c_array* dst, int32_t di, int32_t len);"),
        decl("c2c_array_clear", "void c2c_array_clear(c2c_array* a, int32_t index, int32_t len);"),
        decl("c2c_array_init_from_blob", "void c2c_array_init_from_blob(c2c_array* a, const uint8_t* data, size_t bytes);"),
        decl("c2c_array_store_ref", "void c2c_array_store_ref(c2c_array* a, int32_t index, c2c_object* value);"),
        decl_cat("c2c_throw", "[[noreturn]] void c2c_throw(c2c_object* exception);", "// Exceptions"),
        decl("c2c_rethrow", "[[noreturn]] void c2c_rethrow();"),
        decl("c2c_throw_overflow", "[[noreturn]] void c2c_throw_overflow();"),
        decl("c2c_throw_null_reference", "[[noreturn]] void c2c_throw_null_reference();"),
        decl("c2c_throw_index_out_of_range", "[[noreturn]] void c2c_throw_index_out_of_range();"),
        decl("c2c_throw_divide_by_zero", "[[noreturn]] void c2c_throw_divide_by_zero();"),
        decl("c2c_throw_invalid_cast", "[[noreturn]] void c2c_throw_invalid_cast();"),
        decl("c2c_eh_leave", "void c2c_eh_leave(int32_t depth);"),
        decl("c2c_exception_alloc", "c2c_object* c2c_exception_alloc(const c2c_typeinfo* ti, c2c_string* message);"),
        decl_cat("c2c_ensure_cctor", "void c2c_ensure_cctor(c2c_once* guard, void (*cctor)());", "// Static constructors"),
        decl_cat("c2c_delegate_alloc", "c2c_delegate* c2c_delegate_alloc(const c2c_typeinfo* ti, c2c_object* target, void* fnptr);", "// Delegates"),
        decl("c2c_delegate_combine", "c2c_delegate* c2c_delegate_combine(c2c_delegate* a, c2c_delegate* b);"),
        decl("c2c_delegate_remove", "c2c_delegate* c2c_delegate_remove(c2c_delegate* a, c2c_delegate* b);"),
        decl("c2c_delegate_target", "c2c_object* c2c_delegate_target(c2c_delegate* d);"),
        decl("c2c_delegate_fnptr", "void* c2c_delegate_fnptr(c2c_delegate* d);"),
        decl("c2c_delegate_next", "c2c_delegate* c2c_delegate_next(c2c_delegate* d);"),
        decl_cat("c2c_monitor_enter", "void c2c_monitor_enter(c2c_object* obj);", "// Threading"),
        decl("c2c_monitor_exit", "void c2c_monitor_exit(c2c_object* obj);"),
        decl("c2c_thread_sleep", "void c2c_thread_sleep(int32_t ms);"),
        decl_cat("c2c_console_write_line_string", "void c2c_console_write_line_string(c2c_string* s);", "// Console"),
        decl("c2c_console_write_line_i32", "void c2c_console_write_line_i32(int32_t v);"),
        decl("c2c_console_write_line_i64", "void c2c_console_write_line_i64(int64_t v);"),
        decl("c2c_console_write_line_f64", "void c2c_console_write_line_f64(double v);"),
        decl("c2c_console_write_line_bool", "void c2c_console_write_line_bool(int32_t v);"),
        decl("c2c_console_write_line_char", "void c2c_console_write_line_char(char16_t v);"),
        decl("c2c_console_write_line_object", "void c2c_console_write_line_object(c2c_object* v);"),
        decl("c2c_console_write_line_empty", "void c2c_console_write_line_empty();"),
        decl("c2c_console_write_string", "void c2c_console_write_string(c2c_string* s);"),
        decl("c2c_console_write_i32", "void c2c_console_write_i32(int32_t v);"),
        decl("c2c_console_write_char", "void c2c_console_write_char(char16_t v);"),
        decl("c2c_console_read_line", "c2c_string* c2c_console_read_line();"),
        decl_cat("c2c_type_from_handle", "c2c_type* c2c_type_from_handle(c2c_type_handle h);", "// Reflection surface"),
        decl("c2c_type_name", "c2c_string* c2c_type_name(c2c_type* t);"),
        decl("c2c_type_full_name", "c2c_string* c2c_type_full_name(c2c_type* t);"),
        decl_cat("c2c_iface_lookup", "void* c2c_iface_lookup(const c2c_typeinfo* ti, const c2c_typeinfo* iface, int32_t slot);", "// Dispatch support"),
        decl_cat("c2c_make_typed_ref", "c2c_typed_ref c2c_make_typed_ref(void* address, const c2c_typeinfo* ti);", "// Typed references"),
        decl("c2c_typed_ref_value", "void* c2c_typed_ref_value(c2c_typed_ref tr, const c2c_typeinfo* ti);"),
        decl("c2c_typed_ref_type", "c2c_type_handle c2c_typed_ref_type(c2c_typed_ref tr);"),
        decl_cat("c2c_f32_from_bits", "float c2c_f32_from_bits(uint32_t bits);", "// Float plumbing"),
        decl("c2c_f64_from_bits", "double c2c_f64_from_bits(uint64_t bits);"),
        decl_cat("c2c_math_sqrt", "double c2c_math_sqrt(double v);", "// Math"),
        decl("c2c_math_abs_f64", "double c2c_math_abs_f64(double v);"),
        decl("c2c_math_abs_i32", "int32_t c2c_math_abs_i32(int32_t v);"),
        decl("c2c_math_pow", "double c2c_math_pow(double a, double b);"),
        decl("c2c_math_floor", "double c2c_math_floor(double v);"),
        decl("c2c_math_ceiling", "double c2c_math_ceiling(double v);"),
        decl_cat("c2c_tick_count", "int32_t c2c_tick_count();", "// Environment"),
        decl_cat("c2c_pinvoke_capture_last_error", "void c2c_pinvoke_capture_last_error();", "// P/Invoke support"),
        decl("c2c_pinvoke_last_error", "int32_t c2c_pinvoke_last_error();"),
        decl_cat("c2c_stub_trap", "[[noreturn]] void c2c_stub_trap(const char* method, const char* reason);", "// Stub support"),
    ]
});

pub fn runtime_function_names() -> impl Iterator<Item = &'static str> {
    RUNTIME_DECLARATIONS.iter().map(|d| d.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_denylist_matches_namespaces_and_generics() {
        assert!(is_clr_internal("System.Reflection.Emit.ILGenerator"));
        assert!(is_clr_internal("System.RuntimeType"));
        assert!(is_clr_internal("System.Numerics.Vector`1<System.Single>"));
        assert!(!is_clr_internal("System.String"));
        assert!(!is_clr_internal("System.ReflectionHelpersForMyApp"));
    }

    #[test]
    fn broken_patterns_match_by_prefix_and_name() {
        assert_eq!(
            broken_pattern("System.Runtime.CompilerServices.Unsafe", "As"),
            Some("unsafe-intrinsic-self-expansion")
        );
        assert_eq!(
            broken_pattern("System.Activator", "CreateInstance"),
            Some("late-bound-construction")
        );
        assert_eq!(broken_pattern("System.Activator", "Other"), None);
        assert_eq!(broken_pattern("My.App.Type", "Run"), None);
    }

    #[test]
    fn runtime_declarations_have_unique_names() {
        let mut names: Vec<_> = runtime_function_names().collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn aliases_cover_the_object_core() {
        assert_eq!(runtime_alias("System.Object").unwrap().alias, "c2c_object");
        assert_eq!(runtime_alias("System.String").unwrap().alias, "c2c_string");
        assert!(runtime_alias("My.Type").is_none());
    }
}
