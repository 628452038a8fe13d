// src/unit.rs
//
// =============================================================================
// TDLC: COMPILATION UNIT (v 0.1 )
// =============================================================================
//
// Everything one compiler invocation knows, threaded through parsing.
//
// Responsibilities:
// 1. Own the scope arena and the global (file-level) scope.
// 2. Read and parse the input file and everything it `load`s.
// 3. Collect `run` requests and turn them into run-sets once parsing is done.
// 4. Answer selection queries against those run-sets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::detect::{self, BashRunner, Candidate, ScriptRunner};
use crate::error::{Location, Result, TdlError};
use crate::lexer;
use crate::model::{Arena, Runnable, ScopeId, Value};
use crate::parser;
use crate::setarith::SetCatalog;

/// A `run NAME @ ...` statement, resolved after all files are parsed.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub path: String,
    pub chain: Vec<ScopeId>,
    pub sets: Vec<String>,
    /// `var == value` guards; all must hold for the request to count.
    pub guards: Vec<(String, Value)>,
    pub loc: Location,
}

pub struct CompilationUnit {
    pub arena: Arena,
    pub global: ScopeId,
    runner: Box<dyn ScriptRunner>,
    platform_override: Option<String>,
    loading: Vec<PathBuf>,
    requests: Vec<RunRequest>,
    catalog: SetCatalog,
    registered: BTreeMap<String, Runnable>,
    finished: bool,
}

impl Default for CompilationUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationUnit {
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let global = arena.create_global(Location::internal());
        Self {
            arena,
            global,
            runner: Box::new(BashRunner),
            platform_override: None,
            loading: Vec::new(),
            requests: Vec::new(),
            catalog: SetCatalog::new(),
            registered: BTreeMap::new(),
            finished: false,
        }
    }

    /// Replaces the runner used for `detect` scripts.
    pub fn with_runner(mut self, runner: impl ScriptRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    /// Bypasses auto-detection: every `autodetect` picks this platform.
    pub fn with_platform(mut self, name: Option<String>) -> Self {
        self.platform_override = name;
        self
    }

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        self.load(path, None)
    }

    /// Parses in-memory source. `name` is used for diagnostics and as the
    /// base for relative `load` paths.
    pub fn parse_str(&mut self, src: &str, name: &str) -> Result<()> {
        let tokens = lexer::lex(src, name)?;
        parser::parse(self, tokens, PathBuf::from(name))
    }

    pub(crate) fn load(&mut self, path: &Path, from: Option<&Location>) -> Result<()> {
        let display = path.display().to_string();
        let canonical = path
            .canonicalize()
            .map_err(|e| TdlError::io(display.clone(), e))?;
        if self.loading.contains(&canonical) {
            let loc = from.cloned().unwrap_or_else(Location::internal);
            return Err(TdlError::parse(
                loc,
                format!("recursive load of `{display}`"),
            ));
        }
        let src = fs::read_to_string(path).map_err(|e| TdlError::io(display.clone(), e))?;
        log::info!("Parsing {display}");

        self.loading.push(canonical);
        let result = lexer::lex(&src, &display)
            .and_then(|tokens| parser::parse(self, tokens, path.to_path_buf()));
        self.loading.pop();
        result
    }

    pub(crate) fn detect(&self, candidates: &[Candidate], loc: &Location) -> Result<ScopeId> {
        detect::autodetect(
            &self.arena,
            candidates,
            self.runner.as_ref(),
            self.platform_override.as_deref(),
            loc,
        )
    }

    pub(crate) fn request_run(&mut self, request: RunRequest) {
        self.requests.push(request);
    }

    // ------------------------------------------------------------------
    // Run-sets
    // ------------------------------------------------------------------

    fn guard_holds(&self, request: &RunRequest, var: &str, expected: &Value) -> Result<bool> {
        let actual = self
            .arena
            .resolve(var, &request.chain)
            .and_then(|v| self.arena.text(&v))
            .map_err(|e| e.or_at(&request.loc))?;
        let expected = self.arena.text(expected).map_err(|e| e.or_at(&request.loc))?;
        Ok(actual == expected)
    }

    /// Records `runnable` under its own name. A copy made by a call or `use`
    /// shares its original's name; when that name is taken the copy is
    /// renamed to the path it was requested by (`intel%b`).
    fn register(&mut self, runnable: Runnable, request: &RunRequest) -> Result<String> {
        let mut name = crate::deps::runnable_name(&self.arena, runnable);
        if matches!(self.registered.get(&name), Some(&existing) if existing != runnable) {
            name = request.path.clone();
            if matches!(self.registered.get(&name), Some(&existing) if existing != runnable) {
                return Err(TdlError::eval(
                    format!("two different runnables named `{name}` are requested"),
                    Some(&request.loc),
                ));
            }
            self.arena.rename_task(runnable.scope(), &name)?;
            log::debug!("{}: registered copy as `{name}`", request.loc);
        }
        self.registered.insert(name.clone(), runnable);
        Ok(name)
    }

    /// Resolves every `run` request into the run-set catalog. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let requests = std::mem::take(&mut self.requests);
        for request in &requests {
            let value = self
                .arena
                .resolve(&request.path, &request.chain)
                .and_then(|v| self.arena.deref(&v))
                .map_err(|e| e.or_at(&request.loc))?;
            let runnable = match value {
                Value::Runnable(r @ (Runnable::Build(_) | Runnable::Test(_))) => r,
                other => {
                    return Err(TdlError::eval(
                        format!(
                            "`run {}`: a {} cannot be run; expected a build or test",
                            request.path,
                            other.kind_name()
                        ),
                        Some(&request.loc),
                    ))
                }
            };

            let mut enabled = true;
            for (var, expected) in &request.guards {
                if !self.guard_holds(request, var, expected)? {
                    log::info!(
                        "{}: skipping `run {}`: guard on `{var}` does not hold",
                        request.loc,
                        request.path
                    );
                    enabled = false;
                    break;
                }
            }
            if !enabled {
                continue;
            }

            let name = self.register(runnable, request)?;
            self.catalog.add_element(&name);
            for set in &request.sets {
                self.catalog.add_to_set(set, &name);
            }
        }
        self.arena.seal(self.global);
        self.finished = true;
        log::info!(
            "{} runnable(s) requested across {} run-set(s)",
            self.registered.len(),
            self.catalog.set_names().count()
        );
        Ok(())
    }

    pub fn catalog(&self) -> &SetCatalog {
        &self.catalog
    }

    /// The runnables selected by `expr` (blank selects every run request),
    /// ordered by name.
    pub fn select(&mut self, expr: &str) -> Result<Vec<Runnable>> {
        self.finish()?;
        let names = self.catalog.evaluate(expr)?;
        Ok(names
            .iter()
            .filter_map(|n| self.registered.get(n).copied())
            .collect())
    }

    /// A setting from the global scope, if defined.
    pub fn global_setting(&self, name: &str) -> Option<Value> {
        self.arena.resolve(name, &[self.global]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(src: &str) -> CompilationUnit {
        let mut u = CompilationUnit::new().with_runner(|_: &str| true);
        u.parse_str(src, "unit.tdl").unwrap();
        u
    }

    const SUITE: &str = r#"
COMPILER = 'gnu'
build fv3 { target = 'fv3.exe', build = [[[ make fv3 ]]] }
test control : fv3 { execute = 'run control' verify = 'cmp' }
test debug { execute = 'run debug', verify = 'cmp' }
run control @ fast, gfs
run debug @ COMPILER=='intel'
run fv3
"#;

    #[test]
    fn run_requests_become_run_sets() {
        let mut u = unit(SUITE);
        u.finish().unwrap();
        let elements: Vec<&str> = u.catalog().elements().iter().map(String::as_str).collect();
        // `debug` is guarded out.
        assert_eq!(elements, vec!["control", "fv3"]);
        let fast = u.select("fast").unwrap();
        assert_eq!(fast.len(), 1);
        assert_eq!(crate::deps::runnable_name(&u.arena, fast[0]), "control");
        assert_eq!(u.select("").unwrap().len(), 2);
    }

    #[test]
    fn running_a_hash_is_an_error() {
        let mut u = unit("hash h { x = 1 }\nrun h\n");
        let err = u.finish().unwrap_err();
        assert!(err.to_string().contains("cannot be run"), "{err}");
    }

    #[test]
    fn copies_of_one_build_register_under_their_paths() {
        let mut u = unit(
            "hash suite(comp) { build b { target = 'x', build = \"make @[comp]\" } }\n\
             gnu = suite(comp = 'gnu')\n\
             intel = suite(comp = 'intel')\n\
             run gnu%b @ compilers\n\
             run intel%b @ compilers\n",
        );
        u.finish().unwrap();
        let elements: Vec<&str> = u.catalog().elements().iter().map(String::as_str).collect();
        assert_eq!(elements, vec!["b", "intel%b"]);

        let mut steps = Vec::new();
        for r in u.select("compilers").unwrap() {
            let step = u.arena.resolve_in(r.scope(), "build").unwrap();
            steps.push(u.arena.text(&step).unwrap());
        }
        steps.sort();
        assert_eq!(steps, vec!["make gnu", "make intel"]);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut u = unit(SUITE);
        u.finish().unwrap();
        u.finish().unwrap();
        assert_eq!(u.select("*").unwrap().len(), 2);
    }
}
