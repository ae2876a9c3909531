//! Assembly resolution and the closed type universe.
//!
//! Opens the primary assembly, walks its `AssemblyRef` table transitively,
//! and indexes every TypeDef by canonical name. Resolution probes, in
//! order: the primary's directory, the file names listed by the side-car
//! dependency manifest (`*.deps.json`), and the standard-library install
//! location. Each assembly is opened exactly once; after construction the
//! set is read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cil2cpp_metadata::AssemblyFile;
use tracing::{debug, info};

use crate::error::{CompileError, Result};
use crate::options::CompilerOptions;

/// (assembly index, 1-based TypeDef rid) — the universal type handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDefHandle {
    pub assembly: usize,
    pub rid: u32,
}

pub struct LoadedAssembly {
    pub name: String,
    pub version: [u16; 4],
    pub path: PathBuf,
    /// A side-car `.pdb` was found next to the file.
    pub has_debug_info: bool,
    pub file: AssemblyFile,
    /// Canonical name per TypeDef row (index = rid - 1).
    pub type_names: Vec<String>,
}

pub struct AssemblySet {
    assemblies: Vec<LoadedAssembly>,
    types_by_name: BTreeMap<String, TypeDefHandle>,
}

impl AssemblySet {
    /// Load the primary assembly and the transitive reference closure.
    pub fn load(options: &CompilerOptions) -> Result<AssemblySet> {
        let primary_dir = options
            .input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let manifest_files = read_deps_manifest(&options.input);

        let mut set = AssemblySet {
            assemblies: Vec::new(),
            types_by_name: BTreeMap::new(),
        };
        set.open(&options.input, None)?;

        // Worklist over AssemblyRef rows; names are resolved case-sensitively
        // first, then case-insensitively against the probe directories.
        let mut next = 0;
        while next < set.assemblies.len() {
            let refs: Vec<(String, [u16; 4])> = {
                let asm = &set.assemblies[next];
                let tables = asm.file.tables();
                let strings = asm.file.strings();
                tables
                    .assembly_ref
                    .iter()
                    .map(|row| {
                        let name = strings.get(row.name).unwrap_or("").to_string();
                        (name, row.version)
                    })
                    .collect()
            };
            next += 1;

            for (name, version) in refs {
                if set.find_assembly(&name).is_some() {
                    continue;
                }
                let path = resolve_reference(
                    &name,
                    &primary_dir,
                    &manifest_files,
                    options.stdlib_dir.as_deref(),
                )
                .ok_or_else(|| CompileError::MissingAssembly {
                    name: name.clone(),
                    searched: probe_dirs(&primary_dir, options.stdlib_dir.as_deref()),
                })?;
                set.open(&path, Some((&name, version)))?;
            }
        }

        info!(
            assemblies = set.assemblies.len(),
            types = set.types_by_name.len(),
            "assembly set loaded"
        );
        Ok(set)
    }

    fn open(&mut self, path: &Path, expected: Option<(&str, [u16; 4])>) -> Result<()> {
        debug!(path = %path.display(), "opening assembly");
        let file = AssemblyFile::open(path)?;
        let tables = file.tables();
        let strings = file.strings();

        let (name, version) = match tables.assembly.first() {
            Some(row) => (
                strings.get(row.name).unwrap_or("").to_string(),
                row.version,
            ),
            None => (
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                [0; 4],
            ),
        };
        if let Some((expected_name, expected_version)) = expected {
            // Major version must match; newer minor/build is acceptable.
            if version[0] != expected_version[0] {
                return Err(CompileError::VersionMismatch {
                    name: expected_name.to_string(),
                    requested: expected_version,
                    found: version,
                });
            }
        }

        let type_names = canonical_type_names(&file)?;
        let index = self.assemblies.len();
        for (i, canonical) in type_names.iter().enumerate() {
            if canonical == "<Module>" {
                continue;
            }
            let handle = TypeDefHandle {
                assembly: index,
                rid: i as u32 + 1,
            };
            if self
                .types_by_name
                .insert(canonical.clone(), handle)
                .is_some()
            {
                return Err(CompileError::DuplicateType {
                    name: canonical.clone(),
                });
            }
        }

        let has_debug_info = path.with_extension("pdb").exists();
        self.assemblies.push(LoadedAssembly {
            name,
            version,
            path: path.to_path_buf(),
            has_debug_info,
            file,
            type_names,
        });
        Ok(())
    }

    pub fn primary(&self) -> &LoadedAssembly {
        &self.assemblies[0]
    }

    pub fn assembly(&self, index: usize) -> &LoadedAssembly {
        &self.assemblies[index]
    }

    pub fn assemblies(&self) -> &[LoadedAssembly] {
        &self.assemblies
    }

    pub fn find_assembly(&self, name: &str) -> Option<usize> {
        self.assemblies
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Look up a TypeDef by canonical name across the whole set.
    pub fn find_type(&self, canonical: &str) -> Option<TypeDefHandle> {
        self.types_by_name.get(canonical).copied()
    }

    /// Canonical name of a TypeDef row.
    pub fn type_name(&self, handle: TypeDefHandle) -> &str {
        &self.assemblies[handle.assembly].type_names[handle.rid as usize - 1]
    }

    /// Iterate every (canonical name, handle) in name order.
    pub fn all_types(&self) -> impl Iterator<Item = (&str, TypeDefHandle)> {
        self.types_by_name.iter().map(|(n, h)| (n.as_str(), *h))
    }
}

/// Canonical names for every TypeDef row: `Namespace.Name`, nested types as
/// `Enclosing/Nested` (full enclosing name first).
fn canonical_type_names(file: &AssemblyFile) -> Result<Vec<String>> {
    let tables = file.tables();
    let strings = file.strings();
    let count = tables.type_def.len();

    let mut enclosing: Vec<Option<u32>> = vec![None; count];
    for row in &tables.nested_class {
        if row.nested_class >= 1 && row.nested_class as usize <= count {
            enclosing[row.nested_class as usize - 1] = Some(row.enclosing_class);
        }
    }

    let mut names = vec![String::new(); count];
    for rid in 1..=count as u32 {
        build_name(rid, tables, &strings, &enclosing, &mut names)?;
    }
    Ok(names)
}

fn build_name(
    rid: u32,
    tables: &cil2cpp_metadata::tables::Tables,
    strings: &cil2cpp_metadata::streams::StringHeap<'_>,
    enclosing: &[Option<u32>],
    names: &mut [String],
) -> Result<()> {
    let idx = rid as usize - 1;
    if !names[idx].is_empty() {
        return Ok(());
    }
    let row = &tables.type_def[idx];
    let simple = strings.get(row.name)?;
    let namespace = strings.get(row.namespace)?;
    let name = match enclosing[idx] {
        Some(parent_rid) => {
            build_name(parent_rid, tables, strings, enclosing, names)?;
            format!("{}/{}", names[parent_rid as usize - 1], simple)
        }
        None if namespace.is_empty() => simple.to_string(),
        None => format!("{namespace}.{simple}"),
    };
    names[idx] = name;
    Ok(())
}

fn probe_dirs(primary_dir: &Path, stdlib_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = vec![primary_dir.to_path_buf()];
    if let Some(d) = stdlib_dir {
        dirs.push(d.to_path_buf());
    }
    dirs
}

fn resolve_reference(
    name: &str,
    primary_dir: &Path,
    manifest_files: &[String],
    stdlib_dir: Option<&Path>,
) -> Option<PathBuf> {
    let file_name = format!("{name}.dll");

    let candidate = primary_dir.join(&file_name);
    if candidate.exists() {
        return Some(candidate);
    }

    // The manifest names runtime files relative to package roots; only the
    // basename is probeable here, against both directories.
    for entry in manifest_files {
        let base = Path::new(entry).file_name()?.to_string_lossy().into_owned();
        if base.eq_ignore_ascii_case(&file_name) {
            let local = primary_dir.join(&base);
            if local.exists() {
                return Some(local);
            }
            if let Some(dir) = stdlib_dir {
                let shared = dir.join(&base);
                if shared.exists() {
                    return Some(shared);
                }
            }
        }
    }

    if let Some(dir) = stdlib_dir {
        let candidate = dir.join(&file_name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Collect runtime file names from the side-car `<app>.deps.json`, if any.
fn read_deps_manifest(input: &Path) -> Vec<String> {
    let deps_path = input.with_extension("deps.json");
    let Ok(text) = std::fs::read_to_string(&deps_path) else {
        return Vec::new();
    };
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(&text) else {
        return Vec::new();
    };
    let mut files = Vec::new();
    if let Some(targets) = doc.get("targets").and_then(|t| t.as_object()) {
        for target in targets.values() {
            let Some(packages) = target.as_object() else {
                continue;
            };
            for package in packages.values() {
                if let Some(runtime) = package.get("runtime").and_then(|r| r.as_object()) {
                    files.extend(runtime.keys().cloned());
                }
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_manifest_collects_runtime_entries() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("App.dll");
        std::fs::write(&app, b"").unwrap();
        std::fs::write(
            dir.path().join("App.deps.json"),
            r#"{
                "targets": {
                    "net8.0": {
                        "App/1.0.0": {
                            "runtime": { "App.dll": {} }
                        },
                        "Helper/2.1.0": {
                            "runtime": { "lib/net8.0/Helper.dll": {} }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        let files = read_deps_manifest(&app);
        assert_eq!(files, vec!["App.dll", "lib/net8.0/Helper.dll"]);
    }

    #[test]
    fn reference_resolution_prefers_the_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let stdlib = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Helper.dll"), b"x").unwrap();
        std::fs::write(stdlib.path().join("Helper.dll"), b"y").unwrap();
        let found =
            resolve_reference("Helper", dir.path(), &[], Some(stdlib.path())).unwrap();
        assert_eq!(found, dir.path().join("Helper.dll"));

        let shared_only =
            resolve_reference("Shared", dir.path(), &[], Some(stdlib.path()));
        assert_eq!(shared_only, None);
        std::fs::write(stdlib.path().join("Shared.dll"), b"z").unwrap();
        let shared_only =
            resolve_reference("Shared", dir.path(), &[], Some(stdlib.path())).unwrap();
        assert_eq!(shared_only, stdlib.path().join("Shared.dll"));
    }

    #[test]
    fn missing_reference_reports_probe_dirs() {
        let dirs = probe_dirs(Path::new("/app"), Some(Path::new("/stdlib")));
        assert_eq!(dirs.len(), 2);
    }
}
