// src/detect.rs
//
// =============================================================================
// TDLC: PLATFORM AUTO-DETECTION (v 0.1 )
// =============================================================================
//
// `autodetect NAME (/ p1, p2, ... /)` picks the one platform whose `detect`
// script succeeds on this machine.
//
// Responsibilities:
// 1. Define the `ScriptRunner` trait (how a detection script is executed).
// 2. Provide `BashRunner`, the real implementation.
// 3. Enforce "exactly one match" or honour an explicit override.

use std::process::{Command, Stdio};

use crate::codegen::shell::embed_script;
use crate::error::{Location, Result, TdlError};
use crate::model::{Arena, Runnable, ScopeId, Value};

// ============================================================================
// 1. THE RUNNER TRAIT
// ============================================================================

pub trait ScriptRunner {
    /// Runs `script` and reports whether it exited with status zero.
    fn run(&self, script: &str) -> Result<bool>;
}

/// Runs detection scripts with `bash -c`, synchronously and without timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct BashRunner;

impl ScriptRunner for BashRunner {
    fn run(&self, script: &str) -> Result<bool> {
        let status = Command::new("bash")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| TdlError::io("bash", e))?;
        Ok(status.success())
    }
}

/// A fixed answer per script, for tests and for `--platform`-only builds.
impl<F> ScriptRunner for F
where
    F: Fn(&str) -> bool,
{
    fn run(&self, script: &str) -> Result<bool> {
        Ok(self(script))
    }
}

// ============================================================================
// 2. SELECTION
// ============================================================================

/// One `(/ ... /)` entry, already resolved to a platform scope.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub scope: ScopeId,
}

/// The text of a platform's `detect` step.
fn detection_script(arena: &Arena, platform: &Candidate, loc: &Location) -> Result<String> {
    let detect = arena
        .local(platform.scope, "detect")
        .ok_or_else(|| {
            TdlError::PlatformDetection {
                message: format!("platform `{}` has no `detect` step", platform.name),
                loc: Some(loc.clone()),
            }
        })?;
    match arena.deref(detect)? {
        Value::Runnable(Runnable::Embed(embed)) => embed_script(arena, embed),
        other if other.is_scalar() => arena.text(&other),
        other => Err(TdlError::PlatformDetection {
            message: format!(
                "`{}%detect` is a {}, not a script",
                platform.name,
                other.kind_name()
            ),
            loc: Some(loc.clone()),
        }),
    }
}

/// Chooses exactly one platform among `candidates`.
pub fn autodetect(
    arena: &Arena,
    candidates: &[Candidate],
    runner: &dyn ScriptRunner,
    platform_override: Option<&str>,
    loc: &Location,
) -> Result<ScopeId> {
    if let Some(wanted) = platform_override {
        return candidates
            .iter()
            .find(|c| c.name == wanted)
            .map(|c| {
                log::info!("Platform `{wanted}` selected by override");
                c.scope
            })
            .ok_or_else(|| TdlError::PlatformDetection {
                message: format!(
                    "`{wanted}` is not one of the candidates: {}",
                    names(candidates.iter())
                ),
                loc: Some(loc.clone()),
            });
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into());

    let mut matches = Vec::new();
    for candidate in candidates {
        let script = detection_script(arena, candidate, loc)?;
        let hit = runner.run(&script).map_err(|e| e.or_at(loc))?;
        log::debug!("detect `{}` on {host}: {hit}", candidate.name);
        if hit {
            matches.push(candidate);
        }
    }

    match matches.as_slice() {
        [one] => {
            log::info!("Detected platform `{}` on {host}", one.name);
            Ok(one.scope)
        }
        [] => Err(TdlError::PlatformDetection {
            message: format!(
                "unknown platform: none of {} matched host {host}",
                names(candidates.iter())
            ),
            loc: Some(loc.clone()),
        }),
        many => Err(TdlError::PlatformDetection {
            message: format!("ambiguous platform: {}", names(many.iter().copied())),
            loc: Some(loc.clone()),
        }),
    }
}

fn names<'a>(it: impl Iterator<Item = &'a Candidate>) -> String {
    it.map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScopeKind;

    fn loc() -> Location {
        Location::new("d.tdl", 2)
    }

    fn platforms(arena: &mut Arena) -> Vec<Candidate> {
        let g = arena.create_global(loc());
        ["hera", "orion"]
            .iter()
            .map(|name| {
                let kind = ScopeKind::Platform { name: name.to_string() };
                let p = arena.create(kind, vec![g], loc());
                let detect = Value::literal(&format!("is {name}"), loc());
                arena.define_variable(p, "detect", detect, &loc()).unwrap();
                Candidate {
                    name: name.to_string(),
                    scope: p,
                }
            })
            .collect()
    }

    #[test]
    fn exactly_one_match_wins() {
        let mut arena = Arena::new();
        let cands = platforms(&mut arena);
        let runner = |s: &str| s == "is orion";
        let got = autodetect(&arena, &cands, &runner, None, &loc()).unwrap();
        assert_eq!(got, cands[1].scope);
    }

    #[test]
    fn zero_or_many_matches_fail() {
        let mut arena = Arena::new();
        let cands = platforms(&mut arena);

        let none = |_: &str| false;
        let err = autodetect(&arena, &cands, &none, None, &loc()).unwrap_err();
        assert!(err.to_string().contains("unknown platform"), "{err}");

        let all = |_: &str| true;
        let err = autodetect(&arena, &cands, &all, None, &loc()).unwrap_err();
        assert!(err.to_string().contains("ambiguous platform: hera, orion"), "{err}");
    }

    #[test]
    fn override_skips_scripts_but_must_name_a_candidate() {
        let mut arena = Arena::new();
        let cands = platforms(&mut arena);
        let never = |_: &str| -> bool { panic!("detection must not run") };
        let got = autodetect(&arena, &cands, &never, Some("hera"), &loc()).unwrap();
        assert_eq!(got, cands[0].scope);
        assert!(autodetect(&arena, &cands, &never, Some("jet"), &loc()).is_err());
    }
}
