// src/codegen/mod.rs
//
// =============================================================================
// TDLC: CODE GENERATION (v 0.1 )
// =============================================================================
//
// Renders the resolved runnables into a `Plan` (everything in memory), then
// hands it to one of the two back ends.
//
// Responsibilities:
// 1. Resolve workflow-wide settings from the global scope.
// 2. Render each runnable's steps and resource request.
// 3. Dispatch to the workflow-document or flat-script generator.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::artifacts::Artifacts;
use crate::deps::Resolved;
use crate::error::{Result, TdlError};
use crate::model::{Arena, Runnable, Scalar, ScopeId, ScopeKind, TaskKind, Value};
use crate::resources::{Layout, NodeShape, SchedulerFamily};
use crate::unit::CompilationUnit;

pub mod script;
pub mod shell;
pub mod workflow;

use shell::{quote, sanitize, Launcher, StepContext};

// ============================================================================
// 1. OPTIONS & SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Workflow,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Baseline,
    Verify,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Baseline => "baseline",
            Mode::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub kind: OutputKind,
    pub mode: Mode,
    pub run_id: u64,
    pub trace: bool,
    /// The directory (workflow) or file (script) to create.
    pub output: PathBuf,
    /// Shown in generated headers.
    pub input: String,
}

impl Options {
    /// Directory that relative defaults (logs, scratch, baselines) hang off.
    fn base_dir(&self) -> PathBuf {
        match self.kind {
            OutputKind::Workflow => self.output.clone(),
            OutputKind::Script => self
                .output
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Workflow-wide settings, read from the global scope.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub account: Option<String>,
    pub queue: Option<String>,
    pub partition: Option<String>,
    pub scheduler: SchedulerFamily,
    pub log_dir: String,
    pub install_dir: String,
    pub task_retries: u32,
    pub walltime: String,
    pub scratch_dir: String,
    pub baseline_dir: String,
}

/// The text of `name` as seen from `scope`, or `None` when undefined.
fn setting(arena: &Arena, scope: ScopeId, name: &str) -> Result<Option<String>> {
    match arena.resolve_in(scope, name) {
        Ok(value) => arena.text(&value).map(Some),
        Err(TdlError::NameNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn setting_number(arena: &Arena, scope: ScopeId, name: &str) -> Result<Option<u32>> {
    match arena.resolve_in(scope, name) {
        Ok(value) => arena.whole_number(&value, name).map(Some),
        Err(TdlError::NameNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Walltimes given as numbers are minutes.
fn walltime(arena: &Arena, scope: ScopeId) -> Result<Option<String>> {
    let value = match arena.resolve_in(scope, "walltime") {
        Ok(v) => arena.deref(&v)?,
        Err(TdlError::NameNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if let Value::Scalar(Scalar::Number(_)) = value {
        let minutes = arena.whole_number(&value, "walltime")?;
        return Ok(Some(format!("{:02}:{:02}:00", minutes / 60, minutes % 60)));
    }
    arena.text(&value).map(Some)
}

impl Settings {
    pub fn resolve(unit: &CompilationUnit, options: &Options) -> Result<Self> {
        let arena = &unit.arena;
        let g = unit.global;
        let base = options.base_dir();
        let dir = |name: &str, default: PathBuf| -> Result<String> {
            Ok(setting(arena, g, name)?.unwrap_or_else(|| default.display().to_string()))
        };

        let scheduler = match setting(arena, g, "scheduler")? {
            None => SchedulerFamily::Slurm,
            Some(name) => SchedulerFamily::parse(&name).ok_or_else(|| {
                TdlError::generation(
                    format!(
                        "unknown scheduler `{name}`; expected slurm, lsf, pbspro or moabtorque"
                    ),
                    None,
                )
            })?,
        };

        Ok(Self {
            account: setting(arena, g, "account")?,
            queue: setting(arena, g, "queue")?,
            partition: setting(arena, g, "partition")?,
            scheduler,
            log_dir: dir("log_dir", base.join("log"))?,
            install_dir: dir("install_dir", base.clone())?,
            task_retries: setting_number(arena, g, "task_retries")?.unwrap_or(2),
            walltime: walltime(arena, g)?.unwrap_or_else(|| "00:30:00".into()),
            scratch_dir: dir("scratch_dir", base.join("scratch"))?,
            baseline_dir: dir("baseline_dir", base.join("baseline"))?,
        })
    }

    /// `export TDL_*=...` lines shared by every generated entry point.
    pub fn environment(&self, options: &Options) -> String {
        let vars = [
            ("TDL_RUN_ID", options.run_id.to_string()),
            ("TDL_MODE", options.mode.as_str().to_string()),
            ("TDL_HOME", self.install_dir.clone()),
            ("TDL_LOG", self.log_dir.clone()),
            ("TDL_SCRATCH", self.scratch_dir.clone()),
            ("TDL_BASELINE_DIR", self.baseline_dir.clone()),
        ];
        vars.iter()
            .map(|(k, v)| format!("export {k}={}\n", quote(v)))
            .collect()
    }
}

// ============================================================================
// 2. THE PLAN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Build,
    Test,
    Task,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resources {
    pub walltime: String,
    pub queue: Option<String>,
    pub partition: Option<String>,
    pub native: Option<String>,
    /// Core count for jobs without a spawn.
    pub cores: u32,
    /// Node layout for jobs whose `execute` step is a spawn.
    pub layout: Option<Layout>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub name: String,
    /// Scheduler task name, e.g. `build_fv3` or `test_control`.
    pub task: String,
    pub kind: JobKind,
    pub prerequisites: Vec<String>,
    pub resources: Resources,
    pub target: Option<String>,
    #[serde(skip)]
    pub body: String,
    #[serde(skip)]
    pub uninstall: Option<String>,
}

impl Job {
    /// File stem shared by `jobs/J<STEM>` and `scripts/ex<stem>.sh`.
    pub fn stem(&self) -> String {
        sanitize(&self.name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub generated: String,
    pub generator: String,
    pub input: String,
    pub mode: Mode,
    pub run_id: u64,
    pub settings: Settings,
    pub jobs: Vec<Job>,
}

impl Plan {
    pub fn builds(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.kind == JobKind::Build)
    }

    pub fn tests(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.kind != JobKind::Build)
    }
}

const TEST_SETUP: &[&str] = &["prep", "input", "prerun"];

fn task_name(kind: JobKind, name: &str) -> String {
    match kind {
        JobKind::Build => format!("build_{}", sanitize(name)),
        JobKind::Test | JobKind::Task => format!("test_{}", sanitize(name)),
    }
}

fn job_kind(arena: &Arena, r: Runnable) -> Result<(JobKind, String)> {
    let scope = arena.get(r.scope());
    match &scope.kind {
        ScopeKind::Task(info) => {
            let kind = match info.kind {
                TaskKind::Build => JobKind::Build,
                TaskKind::Test => JobKind::Test,
                TaskKind::Job => JobKind::Task,
            };
            Ok((kind, info.name.clone()))
        }
        _ => Err(TdlError::generation(
            format!("`{}` is not a build or test", scope.name()),
            Some(&scope.loc),
        )),
    }
}

fn push_step(body: &mut String, step: &str, text: &str) {
    body.push_str(&format!("# {step}\n{}\n", text.trim_end()));
}

fn render_job(
    unit: &CompilationUnit,
    resolved: &Resolved,
    r: Runnable,
    settings: &Settings,
    options: &Options,
) -> Result<Job> {
    let arena = &unit.arena;
    let scope = r.scope();
    let loc = arena.get(scope).loc.clone();
    let (kind, name) = job_kind(arena, r)?;

    let shape = NodeShape {
        cores_per_node: setting_number(arena, scope, "cores_per_node")?.unwrap_or(1),
        cpus_per_core: setting_number(arena, scope, "cpus_per_core")?.unwrap_or(1),
    };
    let launcher = match setting(arena, scope, "mpi")? {
        None => Launcher::Mpirun,
        Some(m) => Launcher::parse(&m).ok_or_else(|| {
            TdlError::generation(
                format!("unknown mpi launcher `{m}`; expected mpirun or srun"),
                Some(&loc),
            )
        })?,
    };
    let ctx = StepContext {
        arena,
        mode: options.mode,
        owner: &name,
        shape,
        launcher,
    };
    let step = |step: &str| arena.local(scope, step).cloned();
    let render = |step_name: &str, value: &Value| {
        ctx.render(step_name, value).map_err(|e| e.or_at(&loc))
    };

    let mut body = String::new();
    let mut layout = None;
    let mut target = None;
    let mut uninstall = None;

    match kind {
        JobKind::Build => {
            body.push_str("cd \"$TDL_HOME\"\n");
            let build = step("build").ok_or_else(|| {
                TdlError::generation(format!("build `{name}` has no `build` step"), Some(&loc))
            })?;
            push_step(&mut body, "build", &render("build", &build)?);
            let target_value = step("target").ok_or_else(|| {
                TdlError::generation(format!("build `{name}` has no `target`"), Some(&loc))
            })?;
            let target_text = arena.text(&target_value).map_err(|e| e.or_at(&loc))?;
            uninstall = Some(match step("uninstall") {
                Some(v) => render("uninstall", &v)?,
                None => format!("rm -f {}", quote(&target_text)),
            });
            target = Some(target_text);
        }
        JobKind::Test | JobKind::Task => {
            let work = format!("\"$TDL_SCRATCH\"/{}", quote(&name));
            body.push_str(&format!("mkdir -p {work}\ncd {work}\n"));
            for s in TEST_SETUP {
                if let Some(v) = step(s) {
                    push_step(&mut body, s, &render(s, &v)?);
                }
            }
            let execute = step("execute").ok_or_else(|| {
                TdlError::generation(format!("`{name}` has no `execute` step"), Some(&loc))
            })?;
            layout = ctx.layout_of(&execute).map_err(|e| e.or_at(&loc))?;
            push_step(&mut body, "execute", &render("execute", &execute)?);

            let check = match options.mode {
                Mode::Baseline => "make_baseline",
                Mode::Verify => "verify",
            };
            match (step(check), step("output")) {
                (Some(v), _) => push_step(&mut body, check, &render(check, &v)?),
                (None, Some(v)) => push_step(&mut body, "output", &render("output", &v)?),
                (None, None) if kind == JobKind::Task => {}
                (None, None) => {
                    return Err(TdlError::generation(
                        format!("test `{name}` has no `{check}` or `output` step"),
                        Some(&loc),
                    ))
                }
            }
        }
    }

    // The user's own flags come first; the scheduler hint follows them.
    let native = match (
        setting(arena, scope, "native")?,
        settings.scheduler.native_hint(layout.as_ref()),
    ) {
        (Some(user), Some(hint)) => Some(format!("{user} {hint}")),
        (user, hint) => user.or(hint),
    };
    let resources = Resources {
        walltime: walltime(arena, scope)?.unwrap_or_else(|| settings.walltime.clone()),
        queue: setting(arena, scope, "queue")?,
        partition: setting(arena, scope, "partition")?,
        native,
        cores: setting_number(arena, scope, "cores")?.unwrap_or(1),
        layout,
    };

    let prerequisites = resolved
        .prerequisites_of(r)
        .iter()
        .map(|&d| job_kind(arena, d).map(|(k, n)| task_name(k, &n)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Job {
        task: task_name(kind, &name),
        name,
        kind,
        prerequisites,
        resources,
        target,
        body,
        uninstall,
    })
}

/// Renders every runnable. Nothing is written here.
pub fn plan(unit: &CompilationUnit, resolved: &Resolved, options: &Options) -> Result<Plan> {
    let settings = Settings::resolve(unit, options)?;
    let jobs = resolved
        .order
        .iter()
        .map(|&r| render_job(unit, resolved, r, &settings, options))
        .collect::<Result<Vec<_>>>()?;
    log::info!(
        "Planned {} job(s) in {} mode for scheduler {}",
        jobs.len(),
        options.mode.as_str(),
        settings.scheduler
    );
    Ok(Plan {
        generated: chrono::Utc::now().to_rfc3339(),
        generator: format!("tdlc {}", env!("CARGO_PKG_VERSION")),
        input: options.input.clone(),
        mode: options.mode,
        run_id: options.run_id,
        settings,
        jobs,
    })
}

/// Renders the selected output kind into an in-memory artifact set.
pub fn generate(
    unit: &CompilationUnit,
    resolved: &Resolved,
    options: &Options,
) -> Result<Artifacts> {
    let plan = plan(unit, resolved, options)?;
    match options.kind {
        OutputKind::Workflow => workflow::render(&plan, options),
        OutputKind::Script => script::render(&plan, options),
    }
}

/// Section that prepares baseline directories, or `None` in verify mode.
pub(crate) fn prep_baseline(plan: &Plan) -> Option<String> {
    if plan.mode != Mode::Baseline {
        return None;
    }
    let mut out = String::from("mkdir -p \"$TDL_BASELINE_DIR\"\n");
    for job in plan.tests() {
        out.push_str(&format!(
            "rm -rf \"$TDL_BASELINE_DIR\"/{name}\nmkdir -p \"$TDL_BASELINE_DIR\"/{name}\n",
            name = quote(&job.name)
        ));
    }
    Some(out)
}
