//! Deterministic mapping from canonical IL names to C++ identifiers.
//!
//! Canonical names carry characters C++ identifiers cannot (`.`, `/`, `` ` ``,
//! `<>` for generic argument lists, `[]`, `*`, `&`). Each is rewritten by a
//! fixed textual scheme so that re-running the compiler on the same input
//! yields byte-identical identifiers. Injectivity over the reachable set is
//! enforced at registration time: a second distinct source name mapping to
//! an already-issued identifier aborts the build.

use crate::error::{CompileError, Result};
use fxhash::FxHashMap;

/// Longest identifier we will emit. Beyond this the tail is replaced by a
/// hash so MSVC's identifier limit stays comfortably out of reach.
const MAX_IDENTIFIER_LEN: usize = 200;

/// Issues identifiers and remembers every (source, identifier) pair.
#[derive(Default)]
pub struct NameMapper {
    issued: FxHashMap<String, String>,
    reverse: FxHashMap<String, String>,
}

impl NameMapper {
    pub fn new() -> NameMapper {
        NameMapper::default()
    }

    /// Map a canonical type name to its struct/alias identifier.
    pub fn type_name(&mut self, canonical: &str) -> Result<String> {
        self.issue(canonical, mangle(canonical))
    }

    /// Map a method to its function identifier. Overloads are disambiguated
    /// by a suffix derived from the mangled parameter list; byref markers
    /// participate, so overloads differing only in byref stay distinct.
    pub fn method_name(
        &mut self,
        declaring: &str,
        method: &str,
        param_sig: &str,
    ) -> Result<String> {
        let source = format!("{declaring}::{method}({param_sig})");
        let mut base = format!("{}_{}", mangle(declaring), mangle(method));
        if !param_sig.is_empty() {
            base.push_str("_o");
            base.push_str(&hash_suffix(param_sig));
        }
        self.issue(&source, base)
    }

    /// Map a static field to its global identifier.
    pub fn field_name(&mut self, declaring: &str, field: &str) -> Result<String> {
        let source = format!("{declaring}::{field}");
        self.issue(&source, format!("{}_f_{}", mangle(declaring), mangle(field)))
    }

    fn issue(&mut self, source: &str, candidate: String) -> Result<String> {
        if let Some(existing) = self.issued.get(source) {
            return Ok(existing.clone());
        }
        let clamped = clamp(candidate);
        verify_identifier(&clamped)?;
        if let Some(prior_source) = self.reverse.get(&clamped) {
            if prior_source != source {
                return Err(CompileError::IllegalIdentifier {
                    identifier: clamped,
                    reason: format!("collision between '{prior_source}' and '{source}'"),
                });
            }
        }
        self.issued.insert(source.to_string(), clamped.clone());
        self.reverse.insert(clamped.clone(), source.to_string());
        Ok(clamped)
    }
}

/// Rewrite one canonical name into the identifier alphabet.
///
/// `.` and `/` (namespace and nesting) become `_`; `` `N `` arity markers
/// become `_gN`; generic argument lists `<A,B>` become `_I<args>_E`; array,
/// pointer and byref suffixes become `_arr`/`_arrN`, `_ptr`, `_ref`.
/// Anything else outside `[A-Za-z0-9_]` is hex-escaped.
pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' | '/' => out.push('_'),
            '`' => {
                out.push_str("_g");
                while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                    out.push(chars.next().unwrap());
                }
            }
            '<' => out.push_str("_I"),
            '>' => out.push_str("_E"),
            ',' => out.push('_'),
            ' ' => {}
            '[' => {
                // "[]" rank 1, "[,]" rank 2, ...
                let mut rank = 1;
                for d in chars.by_ref() {
                    match d {
                        ',' => rank += 1,
                        ']' => break,
                        _ => {}
                    }
                }
                if rank == 1 {
                    out.push_str("_arr");
                } else {
                    out.push_str(&format!("_arr{rank}"));
                }
            }
            '*' => out.push_str("_ptr"),
            '&' => out.push_str("_ref"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            other => out.push_str(&format!("_x{:04X}", other as u32)),
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Stable short hash used for overload suffixes and identifier clamping.
pub fn hash_suffix(text: &str) -> String {
    format!("{:08x}", fxhash::hash32(text.as_bytes()))
}

fn clamp(identifier: String) -> String {
    if identifier.len() <= MAX_IDENTIFIER_LEN {
        return identifier;
    }
    let digest = hash_suffix(&identifier);
    let mut out: String = identifier
        .chars()
        .take(MAX_IDENTIFIER_LEN - digest.len() - 1)
        .collect();
    out.push('_');
    out.push_str(&digest);
    out
}

/// The secondary alphabet check: every emitted identifier must satisfy this
/// or the build aborts.
pub fn verify_identifier(identifier: &str) -> Result<()> {
    let ok = !identifier.is_empty()
        && identifier.len() <= MAX_IDENTIFIER_LEN
        && !identifier.starts_with(|c: char| c.is_ascii_digit())
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CompileError::IllegalIdentifier {
            identifier: identifier.to_string(),
            reason: "character outside the C++ identifier alphabet".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_namespaces_and_nesting() {
        assert_eq!(mangle("System.Int32"), "System_Int32");
        assert_eq!(mangle("Foo.Outer/Inner"), "Foo_Outer_Inner");
    }

    #[test]
    fn mangles_generics_arrays_pointers() {
        assert_eq!(
            mangle("System.Collections.Generic.List`1<System.Int32>"),
            "System_Collections_Generic_List_g1_ISystem_Int32_E"
        );
        assert_eq!(mangle("System.Int32[]"), "System_Int32_arr");
        assert_eq!(mangle("System.Int32[,]"), "System_Int32_arr2");
        assert_eq!(mangle("System.Byte*"), "System_Byte_ptr");
        assert_eq!(mangle("System.Int32&"), "System_Int32_ref");
    }

    #[test]
    fn deterministic_and_injective() {
        let mut a = NameMapper::new();
        let mut b = NameMapper::new();
        let n1 = a.type_name("A.B`1<C.D>").unwrap();
        let n2 = b.type_name("A.B`1<C.D>").unwrap();
        assert_eq!(n1, n2);
        // Same source twice is fine and stable.
        assert_eq!(a.type_name("A.B`1<C.D>").unwrap(), n1);
    }

    #[test]
    fn overloads_get_distinct_suffixes() {
        let mut m = NameMapper::new();
        let plain = m.method_name("NS.T", "Run", "System.Int32").unwrap();
        let byref = m.method_name("NS.T", "Run", "System.Int32&").unwrap();
        assert_ne!(plain, byref);
        verify_identifier(&plain).unwrap();
        verify_identifier(&byref).unwrap();
    }

    #[test]
    fn collisions_abort() {
        let mut m = NameMapper::new();
        // Two sources engineered to mangle identically.
        m.type_name("A.B").unwrap();
        assert!(matches!(
            m.type_name("A/B"),
            Err(CompileError::IllegalIdentifier { .. })
        ));
    }

    #[test]
    fn long_names_are_clamped_but_stable() {
        let long = format!("NS.{}", "X".repeat(400));
        let mut m = NameMapper::new();
        let id = m.type_name(&long).unwrap();
        assert!(id.len() <= MAX_IDENTIFIER_LEN);
        verify_identifier(&id).unwrap();
        assert_eq!(NameMapper::new().type_name(&long).unwrap(), id);
    }

    #[test]
    fn alphabet_check_rejects_bad_identifiers() {
        assert!(verify_identifier("ok_name_0").is_ok());
        assert!(verify_identifier("bad-name").is_err());
        assert!(verify_identifier("1leading").is_err());
        assert!(verify_identifier("").is_err());
    }
}
