//! cil2cpp CLI.
//!
//! `build` runs the pipeline and writes the C++ artifacts; `completions`
//! generates shell completion scripts. Exit codes: 0 on success (including
//! a clean ratchet), 1 on any pipeline failure.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::PathBuf;
use std::process;

use cil2cpp::{CompilerOptions, EmissionProfile, OutputKind, RatchetOutcome};

#[derive(ClapParser)]
#[command(name = "cil2cpp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "AOT compiler from .NET assemblies to portable C++", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an assembly to C++ source
    Build {
        /// Input assembly (.dll or .exe)
        input: PathBuf,

        /// Output directory for the generated sources
        #[arg(short, long, default_value = "cpp-out")]
        out_dir: PathBuf,

        /// Build a static library from the public surface instead of an
        /// executable from the entry point
        #[arg(long)]
        lib: bool,

        /// Release emission profile (affects generated compile options,
        /// never the IR)
        #[arg(long)]
        release: bool,

        /// Standard-library install directory to probe during assembly
        /// resolution
        #[arg(long, value_name = "DIR")]
        stdlib_dir: Option<PathBuf>,

        /// Stub-budget side-car; enables the ratchet
        #[arg(long, value_name = "PATH")]
        stub_budget: Option<PathBuf>,

        /// Print the stub analysis report after the build
        #[arg(long)]
        report: bool,

        /// Verbose pipeline logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            out_dir,
            lib,
            release,
            stdlib_dir,
            stub_budget,
            report,
            verbose,
        } => {
            init_tracing(verbose);
            run_build(
                input,
                out_dir,
                lib,
                release,
                stdlib_dir,
                stub_budget,
                report,
            );
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "cil2cpp", &mut io::stdout());
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    input: PathBuf,
    out_dir: PathBuf,
    lib: bool,
    release: bool,
    stdlib_dir: Option<PathBuf>,
    stub_budget: Option<PathBuf>,
    report: bool,
) {
    let mut options = CompilerOptions::new(input)
        .with_output_dir(out_dir)
        .with_output_kind(if lib {
            OutputKind::Library
        } else {
            OutputKind::Executable
        })
        .with_profile(if release {
            EmissionProfile::Release
        } else {
            EmissionProfile::Debug
        });
    if let Some(dir) = stdlib_dir {
        options = options.with_stdlib_dir(dir);
    }
    if let Some(path) = stub_budget {
        options = options.with_budget_path(path);
    }

    match cil2cpp::compile_to_dir(&options) {
        Ok(result) => {
            let files = result.artifacts().len() + 2;
            println!(
                "{}: {} files written to {} ({} stubbed methods)",
                result.module_name,
                files,
                options.output_dir.display(),
                result.analysis.total
            );
            for (stage, elapsed) in &result.timings {
                println!("  {stage:<12} {:.3}s", elapsed.as_secs_f64());
            }
            match result.ratchet {
                Some(RatchetOutcome::Ratcheted) => {
                    println!("stub budget ratcheted down");
                }
                Some(RatchetOutcome::Recorded) => {
                    println!("stub budget recorded");
                }
                _ => {}
            }
            if report {
                println!();
                print!("{}", result.analysis.analysis_report);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
