//! cil2cpp compiler library.
//!
//! Translates an ECMA-335 assembly into portable C++ source plus the
//! reports and budget bookkeeping around it. The pipeline is strictly
//! staged; each stage is a pure transformation over the previous stage's
//! immutable output:
//!
//! 1. [`assembly_set`] — open the primary assembly, its reference closure
//!    and the standard library.
//! 2. [`reachability`] — worklist closure of types, methods, fields and
//!    generic instantiations.
//! 3. [`ir`] — eight ordered passes building the typed IR.
//! 4. [`codegen`] — header, data file, method partitions, stub file,
//!    main file and build manifest.
//! 5. [`analysis`] + [`budget`] — stub classification, reports, and the
//!    monotone budget ratchet.
//!
//! The pipeline runs single-threaded within one invocation; determinism
//! is load-bearing (byte-identical inputs produce byte-identical
//! artifacts).

pub mod analysis;
pub mod assembly_set;
pub mod budget;
pub mod codegen;
pub mod error;
pub mod icalls;
pub mod ir;
pub mod names;
pub mod options;
pub mod reachability;
pub mod runtime;
pub mod world;

pub use analysis::StubAnalysis;
pub use budget::RatchetOutcome;
pub use error::{CompileError, Result};
pub use options::{CompilerOptions, EmissionProfile, OutputKind};

use std::path::PathBuf;
use std::time::Instant;

use tracing::info;

use assembly_set::AssemblySet;
use codegen::{CodeUnit, CppGen};
use ir::builder::IrBuilder;
use reachability::ReachabilityAnalyzer;
use world::World;

/// Everything a compilation produces, in memory.
pub struct CompileResult {
    pub module_name: String,
    pub header: CodeUnit,
    pub data: CodeUnit,
    pub method_files: Vec<CodeUnit>,
    pub stub_file: CodeUnit,
    pub main_file: Option<CodeUnit>,
    pub manifest: CodeUnit,
    pub analysis: StubAnalysis,
    pub ratchet: Option<RatchetOutcome>,
    /// (stage name, elapsed) in pipeline order.
    pub timings: Vec<(&'static str, std::time::Duration)>,
}

impl CompileResult {
    /// All text artifacts in emission order.
    pub fn artifacts(&self) -> Vec<&CodeUnit> {
        let mut files = vec![&self.header, &self.data];
        files.extend(self.method_files.iter());
        files.push(&self.stub_file);
        if let Some(main) = &self.main_file {
            files.push(main);
        }
        files.push(&self.manifest);
        files
    }
}

/// Run the whole pipeline, returning artifacts without writing them.
pub fn compile(options: &CompilerOptions) -> Result<CompileResult> {
    let mut timings = Vec::new();
    let module_name = options
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());

    let started = Instant::now();
    let set = AssemblySet::load(options)?;
    timings.push(("assemblies", started.elapsed()));

    let world = World::new(&set);

    let started = Instant::now();
    let reach = ReachabilityAnalyzer::analyze(&world, options);
    timings.push(("reachability", started.elapsed()));

    let started = Instant::now();
    let module = IrBuilder::build(&world, &reach, &module_name);
    timings.push(("ir", started.elapsed()));

    let started = Instant::now();
    let generated = CppGen::new(&module, options).emit()?;
    timings.push(("codegen", started.elapsed()));

    let started = Instant::now();
    let analysis = analysis::analyze(&module_name, &generated.stubs, &generated.call_graph);
    let ratchet = match &options.budget_path {
        Some(path) => Some(budget::check_and_ratchet(path, &module_name, &analysis)?),
        None => None,
    };
    timings.push(("analysis", started.elapsed()));

    info!(
        module = %module_name,
        stubs = analysis.total,
        "compilation pipeline finished"
    );
    Ok(CompileResult {
        module_name,
        header: generated.header,
        data: generated.data,
        method_files: generated.method_files,
        stub_file: generated.stub_file,
        main_file: generated.main_file,
        manifest: generated.manifest,
        analysis,
        ratchet,
        timings,
    })
}

/// Run the pipeline and write every artifact plus both reports under the
/// output directory. A write failure is a pipeline failure: partial output
/// directories are not success.
pub fn compile_to_dir(options: &CompilerOptions) -> Result<CompileResult> {
    let result = compile(options)?;
    std::fs::create_dir_all(&options.output_dir)?;
    for unit in result.artifacts() {
        let path: PathBuf = options.output_dir.join(&unit.file_name);
        std::fs::write(&path, &unit.text)?;
    }
    std::fs::write(
        options
            .output_dir
            .join(format!("{}.stubs.txt", result.module_name)),
        &result.analysis.stub_report,
    )?;
    std::fs::write(
        options
            .output_dir
            .join(format!("{}.analysis.txt", result.module_name)),
        &result.analysis.analysis_report,
    )?;
    Ok(result)
}
