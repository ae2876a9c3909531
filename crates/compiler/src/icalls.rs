//! Internal-call registry.
//!
//! Methods marked `[MethodImpl(MethodImplOptions.InternalCall)]` (and a few
//! runtime-flagged ones) have no IL body; the runtime library implements
//! them. This table maps (declaring type, method name, parameter count) —
//! optionally refined by the first parameter's type — to the runtime symbol
//! the generated code calls. Lookups are exact; `ANY_ARITY` matches every
//! parameter count.

use std::sync::LazyLock;

/// Wildcard for the parameter-count column.
pub const ANY_ARITY: usize = usize::MAX;

/// One registry row.
pub struct ICallEntry {
    pub declaring_type: &'static str,
    pub method: &'static str,
    /// Parameter count excluding the receiver, or [`ANY_ARITY`].
    pub arity: usize,
    /// Canonical name of the first parameter's type, when one overload per
    /// parameter type exists.
    pub first_param: Option<&'static str>,
    /// Runtime implementation symbol.
    pub symbol: &'static str,
}

const fn entry(
    declaring_type: &'static str,
    method: &'static str,
    arity: usize,
    first_param: Option<&'static str>,
    symbol: &'static str,
) -> ICallEntry {
    ICallEntry {
        declaring_type,
        method,
        arity,
        first_param,
        symbol,
    }
}

/// The registry. Rows are matched top to bottom; the first hit wins, so
/// first-parameter-refined rows must precede their arity-only fallbacks.
pub static ICALL_REGISTRY: LazyLock<Vec<ICallEntry>> = LazyLock::new(|| {
    vec![
        // Object
        entry("System.Object", "GetType", 0, None, "c2c_object_get_type"),
        entry("System.Object", "MemberwiseClone", 0, None, "c2c_object_clone"),
        entry("System.Object", "GetHashCode", 0, None, "c2c_object_hash"),
        entry("System.Object", "Equals", 1, None, "c2c_object_equals"),
        entry("System.Object", "ToString", 0, None, "c2c_object_to_string"),
        entry("System.Object", "Finalize", 0, None, "c2c_object_finalize_default"),
        entry("System.Object", ".ctor", 0, None, "c2c_object_ctor_nop"),
        // String
        entry("System.String", "get_Length", 0, None, "c2c_string_length"),
        entry("System.String", "get_Chars", 1, None, "c2c_string_char_at"),
        entry("System.String", "Concat", ANY_ARITY, None, "c2c_string_concat"),
        entry("System.String", "Equals", 2, None, "c2c_string_equals"),
        entry("System.String", "op_Equality", 2, None, "c2c_string_equals"),
        entry("System.String", "op_Inequality", 2, None, "c2c_string_not_equals"),
        entry("System.String", "Substring", 2, None, "c2c_string_substring"),
        entry("System.String", "IndexOf", 1, Some("System.Char"), "c2c_string_index_of_char"),
        entry("System.String", "FastAllocateString", 1, None, "c2c_string_alloc"),
        // Array
        entry("System.Array", "get_Length", 0, None, "c2c_array_length"),
        entry("System.Array", "get_Rank", 0, None, "c2c_array_rank"),
        entry("System.Array", "Copy", 3, None, "c2c_array_copy"),
        entry("System.Array", "Copy", 5, None, "c2c_array_copy_range"),
        entry("System.Array", "Clear", 3, None, "c2c_array_clear"),
        entry(
            "System.Runtime.CompilerServices.RuntimeHelpers",
            "InitializeArray",
            2,
            None,
            "c2c_array_init_from_blob",
        ),
        // Console; the first-parameter tag picks the runtime overload.
        entry("System.Console", "WriteLine", 1, Some("System.String"), "c2c_console_write_line_string"),
        entry("System.Console", "WriteLine", 1, Some("System.Int32"), "c2c_console_write_line_i32"),
        entry("System.Console", "WriteLine", 1, Some("System.Int64"), "c2c_console_write_line_i64"),
        entry("System.Console", "WriteLine", 1, Some("System.Double"), "c2c_console_write_line_f64"),
        entry("System.Console", "WriteLine", 1, Some("System.Boolean"), "c2c_console_write_line_bool"),
        entry("System.Console", "WriteLine", 1, Some("System.Char"), "c2c_console_write_line_char"),
        entry("System.Console", "WriteLine", 1, Some("System.Object"), "c2c_console_write_line_object"),
        entry("System.Console", "WriteLine", 0, None, "c2c_console_write_line_empty"),
        entry("System.Console", "Write", 1, Some("System.String"), "c2c_console_write_string"),
        entry("System.Console", "Write", 1, Some("System.Int32"), "c2c_console_write_i32"),
        entry("System.Console", "Write", 1, Some("System.Char"), "c2c_console_write_char"),
        entry("System.Console", "ReadLine", 0, None, "c2c_console_read_line"),
        // Type / reflection handles
        entry(
            "System.Type",
            "GetTypeFromHandle",
            1,
            None,
            "c2c_type_from_handle",
        ),
        entry("System.Type", "get_Name", 0, None, "c2c_type_name"),
        entry("System.Type", "get_FullName", 0, None, "c2c_type_full_name"),
        // Math; runtime wraps libm so float semantics stay in one place.
        entry("System.Math", "Sqrt", 1, Some("System.Double"), "c2c_math_sqrt"),
        entry("System.Math", "Abs", 1, Some("System.Double"), "c2c_math_abs_f64"),
        entry("System.Math", "Abs", 1, Some("System.Int32"), "c2c_math_abs_i32"),
        entry("System.Math", "Pow", 2, None, "c2c_math_pow"),
        entry("System.Math", "Floor", 1, Some("System.Double"), "c2c_math_floor"),
        entry("System.Math", "Ceiling", 1, Some("System.Double"), "c2c_math_ceiling"),
        // Environment
        entry(
            "System.Environment",
            "GetCommandLineArgs",
            0,
            None,
            "c2c_runtime_args",
        ),
        entry("System.Environment", "get_TickCount", 0, None, "c2c_tick_count"),
        entry("System.Environment", "Exit", 1, None, "c2c_runtime_exit"),
        // GC
        entry("System.GC", "Collect", 0, None, "c2c_gc_collect"),
        entry("System.GC", "SuppressFinalize", 1, None, "c2c_gc_suppress_finalize"),
        // Delegate plumbing
        entry("System.Delegate", "Combine", 2, None, "c2c_delegate_combine"),
        entry("System.Delegate", "Remove", 2, None, "c2c_delegate_remove"),
        // Threading
        entry("System.Threading.Monitor", "Enter", ANY_ARITY, None, "c2c_monitor_enter"),
        entry("System.Threading.Monitor", "Exit", 1, None, "c2c_monitor_exit"),
        entry("System.Threading.Thread", "Sleep", 1, None, "c2c_thread_sleep"),
        // Interop
        entry(
            "System.Runtime.InteropServices.Marshal",
            "GetLastWin32Error",
            0,
            None,
            "c2c_pinvoke_last_error",
        ),
    ]
});

/// Look up an internal-call implementation.
///
/// `first_param` is the canonical name of the first parameter's type, if
/// the method has one; rows without a tag match regardless.
pub fn lookup(
    declaring_type: &str,
    method: &str,
    arity: usize,
    first_param: Option<&str>,
) -> Option<&'static str> {
    ICALL_REGISTRY
        .iter()
        .find(|e| {
            e.declaring_type == declaring_type
                && e.method == method
                && (e.arity == ANY_ARITY || e.arity == arity)
                && match e.first_param {
                    None => true,
                    Some(tag) => first_param == Some(tag),
                }
        })
        .map(|e| e.symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_param_tag_selects_the_overload() {
        assert_eq!(
            lookup("System.Console", "WriteLine", 1, Some("System.Int32")),
            Some("c2c_console_write_line_i32")
        );
        assert_eq!(
            lookup("System.Console", "WriteLine", 1, Some("System.String")),
            Some("c2c_console_write_line_string")
        );
        assert_eq!(
            lookup("System.Console", "WriteLine", 0, None),
            Some("c2c_console_write_line_empty")
        );
    }

    #[test]
    fn wildcard_arity_matches_everything() {
        for arity in [1usize, 2, 4] {
            assert_eq!(
                lookup("System.String", "Concat", arity, Some("System.String")),
                Some("c2c_string_concat")
            );
        }
    }

    #[test]
    fn misses_return_none() {
        assert_eq!(lookup("System.Console", "WriteLine", 3, None), None);
        assert_eq!(lookup("NS.NotAType", "M", 0, None), None);
    }
}
