//! Compiler options.
//!
//! Builder-style configuration consumed by [`crate::compile`]. The defaults
//! match what the CLI passes for a plain `cil2cpp build Foo.dll`.

use std::path::PathBuf;

/// What kind of artifact the build manifest declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Roots are the entry point; a `main.cpp` is emitted.
    Executable,
    /// Roots are the public surface; no `main.cpp`.
    Library,
}

/// Release vs. debug only affects the emitted compile options and one macro
/// in the build manifest, never the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionProfile {
    Debug,
    Release,
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Path to the primary assembly.
    pub input: PathBuf,
    pub output_kind: OutputKind,
    pub profile: EmissionProfile,
    /// Where `compile_to_dir` writes artifacts.
    pub output_dir: PathBuf,
    /// Override for the standard-library install location probed during
    /// assembly resolution.
    pub stdlib_dir: Option<PathBuf>,
    /// Path to the stub-budget side-car. `None` disables the ratchet.
    pub budget_path: Option<PathBuf>,
    /// A method partition closes once its cumulative IR instruction count
    /// reaches this threshold.
    pub partition_instruction_budget: usize,
}

impl CompilerOptions {
    pub fn new(input: impl Into<PathBuf>) -> CompilerOptions {
        CompilerOptions {
            input: input.into(),
            output_kind: OutputKind::Executable,
            profile: EmissionProfile::Debug,
            output_dir: PathBuf::from("cpp-out"),
            stdlib_dir: None,
            budget_path: None,
            partition_instruction_budget: 4000,
        }
    }

    pub fn with_output_kind(mut self, kind: OutputKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn with_profile(mut self, profile: EmissionProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_stdlib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stdlib_dir = Some(dir.into());
        self
    }

    pub fn with_budget_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.budget_path = Some(path.into());
        self
    }

    pub fn with_partition_instruction_budget(mut self, budget: usize) -> Self {
        self.partition_instruction_budget = budget.max(1);
        self
    }
}
