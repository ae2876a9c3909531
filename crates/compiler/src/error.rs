//! Pipeline error types.
//!
//! Only pipeline-level failures live here: a missing assembly, an
//! unresolvable always-keep root, an illegal identifier escaping the
//! NameMapper, a budget overrun, a write failure. Per-method lowering
//! failures are never errors — they become classified stubs and the build
//! keeps going.

use std::path::PathBuf;

/// Fatal pipeline failure. No output files are produced when one of these
/// is returned.
#[derive(Debug)]
pub enum CompileError {
    /// The primary assembly or a referenced assembly could not be found.
    MissingAssembly { name: String, searched: Vec<PathBuf> },
    /// A referenced assembly resolved to an incompatible version.
    VersionMismatch {
        name: String,
        requested: [u16; 4],
        found: [u16; 4],
    },
    /// Two assemblies in the closure define the same canonical type name.
    DuplicateType { name: String },
    /// A type on the always-keep list is missing from the closure.
    MissingRootType { name: String },
    /// The NameMapper produced (or was about to reuse) an illegal identifier.
    IllegalIdentifier { identifier: String, reason: String },
    /// An open generic survived to code generation.
    OpenGeneric { name: String },
    /// A stub category exceeded its persisted budget.
    BudgetExceeded { overruns: Vec<String> },
    /// Reading the input or writing an artifact failed.
    Io(std::io::Error),
    /// The metadata reader rejected the input file.
    Metadata(cil2cpp_metadata::MetadataError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::MissingAssembly { name, searched } => {
                write!(f, "cannot resolve assembly '{}'; searched", name)?;
                for path in searched {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
            CompileError::VersionMismatch {
                name,
                requested,
                found,
            } => write!(
                f,
                "assembly '{}' resolved to version {}.{}.{}.{}, reference requires {}.{}.{}.{}",
                name,
                found[0],
                found[1],
                found[2],
                found[3],
                requested[0],
                requested[1],
                requested[2],
                requested[3],
            ),
            CompileError::DuplicateType { name } => {
                write!(f, "duplicate canonical type name '{}' in closure", name)
            }
            CompileError::MissingRootType { name } => {
                write!(f, "always-keep type '{}' not found in any assembly", name)
            }
            CompileError::IllegalIdentifier { identifier, reason } => {
                write!(f, "illegal emitted identifier '{}': {}", identifier, reason)
            }
            CompileError::OpenGeneric { name } => {
                write!(f, "open generic '{}' reached code generation", name)
            }
            CompileError::BudgetExceeded { overruns } => {
                write!(f, "stub budget exceeded: {}", overruns.join("; "))
            }
            CompileError::Io(e) => write!(f, "I/O error: {}", e),
            CompileError::Metadata(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

impl From<cil2cpp_metadata::MetadataError> for CompileError {
    fn from(e: cil2cpp_metadata::MetadataError) -> Self {
        CompileError::Metadata(e)
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
