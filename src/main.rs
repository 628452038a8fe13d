// src/main.rs
//
// =============================================================================
// TDLC: COMMAND LINE (v 0.1 )
// =============================================================================
//
// Parses INPUT, selects what to run, resolves dependencies and writes either
// a workflow directory or a flat script to OUTPUT.
//
// Exit codes:
// 0  success
// 1  compilation error (one `file:line:` diagnostic on stderr)
// 2  usage error (clap), or OUTPUT already exists

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};

use tdlc::codegen::{self, Mode, Options, OutputKind};
use tdlc::{deps, CompilationUnit};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "tdlc",
    version,
    about = "Compiles TDL regression-test suites into Rocoto workflows or shell scripts"
)]
#[command(group(ArgGroup::new("output_kind").required(true).args(["workflow", "script"])))]
#[command(group(ArgGroup::new("mode").required(true).args(["baseline", "verify"])))]
struct Cli {
    /// Generate a Rocoto workflow directory.
    #[arg(long)]
    workflow: bool,

    /// Generate a single shell script.
    #[arg(long)]
    script: bool,

    /// Generate baseline outputs instead of comparing against them.
    #[arg(long)]
    baseline: bool,

    /// Compare outputs against existing baselines.
    #[arg(long)]
    verify: bool,

    /// Log intended writes; write nothing.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Numeric run id (default: process id).
    #[arg(long, value_name = "N")]
    run_id: Option<u64>,

    /// Log per-phase timings.
    #[arg(long)]
    profile: bool,

    /// Skip auto-detection and use this platform.
    #[arg(short, long, value_name = "NAME")]
    platform: Option<String>,

    /// Set-arithmetic selection, e.g. "minus(union(gfs, nam), slow)".
    #[arg(short = 'S', long, value_name = "EXPR")]
    select: Option<String>,

    /// Emit `set -x` in generated scripts.
    #[arg(short = 'x', long)]
    trace: bool,

    /// Top-level TDL file.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Workflow directory or script to create. Must not exist.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if cli.output.exists() {
        eprintln!("tdlc: {}: output already exists", cli.output.display());
        return ExitCode::from(2);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

/// Times one phase when `--profile` is on.
struct Phases {
    enabled: bool,
    started: Instant,
}

impl Phases {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
        }
    }

    fn done(&mut self, phase: &str) {
        if self.enabled {
            log::info!("[profile] {phase}: {:.3}s", self.started.elapsed().as_secs_f64());
        }
        self.started = Instant::now();
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    Ok(cwd.join(path))
}

fn run(cli: Cli) -> Result<()> {
    let mut phases = Phases::new(cli.profile);

    let mut unit = CompilationUnit::new().with_platform(cli.platform.clone());
    unit.parse_file(&cli.input)?;
    phases.done("parse");

    let selected = unit.select(cli.select.as_deref().unwrap_or(""))?;
    if selected.is_empty() {
        log::warn!("nothing selected; the output will contain no runnables");
    }
    let resolved = deps::resolve(&unit.arena, &selected)?;
    log::info!(
        "Selected {} runnable(s), {} with prerequisites",
        selected.len(),
        resolved.order.len()
    );
    phases.done("resolve");

    let options = Options {
        kind: if cli.workflow {
            OutputKind::Workflow
        } else {
            OutputKind::Script
        },
        mode: if cli.baseline { Mode::Baseline } else { Mode::Verify },
        run_id: cli.run_id.unwrap_or_else(|| u64::from(std::process::id())),
        trace: cli.trace,
        output: absolute(&cli.output)?,
        input: cli.input.display().to_string(),
    };
    let artifacts = codegen::generate(&unit, &resolved, &options)?;
    phases.done("generate");

    if cli.dry_run {
        artifacts.describe();
    } else {
        artifacts
            .write()
            .with_context(|| format!("writing {}", options.output.display()))?;
    }
    phases.done("write");
    Ok(())
}
