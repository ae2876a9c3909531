//! Main-entry and build-manifest emission.
//!
//! Executable modules get a `main` that boots the runtime, registers the
//! GC roots and command-line arguments, interns the string pool, runs the
//! entry method and shuts down. The manifest is a `CMakeLists.txt` naming
//! every emitted source, linking the runtime package, and carrying the
//! per-configuration compile options; standard-library-internal P/Invoke
//! modules stay off the link line.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::error::{CompileError, Result};
use crate::ir::{MethodFlags, Primitive, TypeKind};
use crate::options::EmissionProfile;

use super::header::module_prefix;
use super::{CodeUnit, CppGen};

/// P/Invoke modules implemented by the runtime package itself; they never
/// reach the link list.
const INTERNAL_PINVOKE_MODULES: &[&str] = &[
    "libSystem.Native",
    "libSystem.Globalization.Native",
    "libSystem.Security.Cryptography.Native.OpenSsl",
    "libSystem.IO.Compression.Native",
    "libSystem.Net.Security.Native",
];

pub fn emit_main(g: &mut CppGen<'_>) -> Result<CodeUnit> {
    let entry = g
        .module
        .entry_point
        .ok_or_else(|| CompileError::MissingRootType {
            name: "<entry point>".to_string(),
        })?;
    let entry_method = g.module.method(entry);
    debug_assert!(entry_method.flags.contains(MethodFlags::ENTRY_POINT));
    let symbol = g.method_symbol(entry).to_string();
    let prefix = module_prefix(g);

    let returns_int = matches!(
        g.module.ty(entry_method.return_type).kind,
        TypeKind::Primitive(Primitive::I4)
    );
    let takes_args = entry_method.params.len() == 1;

    let mut out = String::with_capacity(2048);
    let _ = writeln!(
        out,
        "// Generated by cil2cpp from {}. Program entry point.",
        g.module.name
    );
    let _ = writeln!(out, "#include \"{}.h\"", g.module.name);
    let _ = writeln!(out);
    let _ = writeln!(out, "int main(int argc, char** argv) {{");
    let _ = writeln!(out, "    c2c_runtime_init(argc, argv);");
    let _ = writeln!(out, "    {prefix}_register_roots();");
    if !g.module.strings.is_empty() {
        let _ = writeln!(out, "    {prefix}_strings_init();");
    }
    let _ = writeln!(out, "    int32_t __exit_code = 0;");
    let call = if takes_args {
        format!("{symbol}(c2c_runtime_args())")
    } else {
        format!("{symbol}()")
    };
    if returns_int {
        let _ = writeln!(out, "    __exit_code = {call};");
    } else {
        let _ = writeln!(out, "    {call};");
    }
    let _ = writeln!(out, "    c2c_runtime_shutdown();");
    let _ = writeln!(out, "    return (int)__exit_code;");
    let _ = writeln!(out, "}}");

    Ok(CodeUnit {
        file_name: format!("{}_main.cpp", g.module.name),
        text: out,
    })
}

pub fn emit_manifest(g: &CppGen<'_>, method_files: &[CodeUnit]) -> CodeUnit {
    let name = &g.module.name;
    let executable = g.module.entry_point.is_some()
        && matches!(
            g.options.output_kind,
            crate::options::OutputKind::Executable
        );

    let mut sources: Vec<String> = Vec::new();
    sources.push(format!("{name}_data.cpp"));
    for file in method_files {
        sources.push(file.file_name.clone());
    }
    sources.push(format!("{name}_stubs.cpp"));
    if executable {
        sources.push(format!("{name}_main.cpp"));
    }

    // User P/Invoke libraries: unique modules minus the runtime-internal
    // set, normalized to linkable names.
    let mut user_libs: BTreeSet<String> = BTreeSet::new();
    for method in &g.module.methods {
        let Some(module) = &method.pinvoke_module else {
            continue;
        };
        let trimmed = module
            .trim_end_matches(".dll")
            .trim_end_matches(".so")
            .to_string();
        if INTERNAL_PINVOKE_MODULES
            .iter()
            .any(|m| trimmed.eq_ignore_ascii_case(m))
        {
            continue;
        }
        user_libs.insert(trimmed.trim_start_matches("lib").to_string());
    }

    let release_macro = match g.options.profile {
        EmissionProfile::Release => "C2C_RELEASE",
        EmissionProfile::Debug => "C2C_DEBUG",
    };

    let mut out = String::with_capacity(2048);
    let _ = writeln!(out, "# Generated by cil2cpp from {name}. Do not edit.");
    let _ = writeln!(out, "cmake_minimum_required(VERSION 3.16)");
    let _ = writeln!(out, "project({name}_cpp CXX)");
    let _ = writeln!(out, "set(CMAKE_CXX_STANDARD 17)");
    let _ = writeln!(out, "set(CMAKE_CXX_STANDARD_REQUIRED ON)");
    let _ = writeln!(out);
    let _ = writeln!(out, "set(C2C_SOURCES");
    for source in &sources {
        let _ = writeln!(out, "    {source}");
    }
    let _ = writeln!(out, ")");
    let _ = writeln!(out);
    if executable {
        let _ = writeln!(out, "add_executable({name} ${{C2C_SOURCES}})");
    } else {
        let _ = writeln!(out, "add_library({name} STATIC ${{C2C_SOURCES}})");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "find_package(cil2cpp_runtime REQUIRED)");
    let _ = writeln!(
        out,
        "target_link_libraries({name} PRIVATE cil2cpp::runtime)"
    );
    for lib in &user_libs {
        let _ = writeln!(out, "target_link_libraries({name} PRIVATE {lib})");
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "target_compile_definitions({name} PRIVATE {release_macro}=1)"
    );
    let _ = writeln!(
        out,
        "target_compile_options({name} PRIVATE $<$<CONFIG:Release>:-O2> $<$<CONFIG:Debug>:-g>)"
    );

    CodeUnit {
        file_name: "CMakeLists.txt".to_string(),
        text: out,
    }
}
