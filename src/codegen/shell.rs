// src/codegen/shell.rs
//
// =============================================================================
// TDLC: SHELL RENDERING (v 0.1 )
// =============================================================================
//
// Turns step values into bash text. Shared by both generators and by
// platform detection.
//
// Responsibilities:
// 1. Quote and assign shell values.
// 2. Render embedded scripts as subshells.
// 3. Render spawns as MPI launch lines.
// 4. Render filters/criteria as calls into the `tdl_*` helper library.

use crate::error::{Result, TdlError};
use crate::model::{Arena, Runnable, ScopeId, ScopeKind, Value};
use crate::resources::{self, Layout, NodeShape};

use super::Mode;

/// Helper library sourced by every generated script.
pub const UTILS: &str = r#"# tdl_utils.sh: runtime helpers for generated TDL scripts.

tdl_log() {
    echo "[tdl $(date +%Y-%m-%dT%H:%M:%S)] $*" >&2
}

tdl_status() {
    mkdir -p "$TDL_LOG"
    echo "$1 $2 $(date +%s)" >> "$TDL_LOG/status.$TDL_RUN_ID"
}

tdl_report_start() {
    tdl_log "START $1"
    tdl_status "$1" started
}

tdl_report_finish() {
    tdl_log "FINISH $1"
    tdl_status "$1" finished
}

tdl_report_failure() {
    tdl_log "FAILED $1 (status ${2:-1})"
    tdl_status "$1" "failed:${2:-1}"
}

# tdl_deliver copy|link SOURCE DEST
tdl_deliver() {
    local how=$1 src=$2 dest=$3
    mkdir -p "$(dirname "$dest")"
    case "$how" in
        copy) cp -rp "$src" "$dest" ;;
        link) ln -sfn "$src" "$dest" ;;
        *) tdl_log "tdl_deliver: unknown method '$how'"; return 1 ;;
    esac
}

# tdl_atparse TEMPLATE DEST: replaces @[NAME] with the shell variable NAME.
tdl_atparse() {
    local src=$1 dest=$2 line name passes
    mkdir -p "$(dirname "$dest")"
    : > "$dest"
    while IFS= read -r line || [[ -n "$line" ]]; do
        passes=0
        while [[ "$line" =~ @\[([A-Za-z_][A-Za-z0-9_]*)\] ]] && (( passes < 100 )); do
            name=${BASH_REMATCH[1]}
            line=${line//"@[$name]"/${!name}}
            passes=$((passes + 1))
        done
        printf '%s\n' "$line" >> "$dest"
    done < "$src"
}

# tdl_compare bitcmp|metacmp OUTPUT REFERENCE
tdl_compare() {
    local how=$1 out=$2 ref=$3
    case "$how" in
        bitcmp) cmp -s "$out" "$ref" ;;
        metacmp) ${TDL_METACMP:-cmp -s} "$out" "$ref" ;;
        *) tdl_log "tdl_compare: unknown method '$how'"; return 1 ;;
    esac || {
        tdl_log "MISMATCH ($how): $out vs $ref"
        return 1
    }
}
"#;

/// Single-quotes `s` for bash.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `[A-Za-z0-9_]` only, as scheduler task and file names require.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ============================================================================
// 1. EMBEDDED SCRIPTS
// ============================================================================

/// An embedded script as a subshell: scalar bindings first, then the body.
pub fn embed_script(arena: &Arena, embed: ScopeId) -> Result<String> {
    let scope = arena.get(embed);
    let ScopeKind::Embed(info) = &scope.kind else {
        return Err(TdlError::generation(
            format!("`{}` is not an embedded script", scope.name()),
            Some(&scope.loc),
        ));
    };
    if !scope.params().is_empty() {
        return Err(TdlError::generation(
            format!("embedded script `{}` has parameters and must be called first", info.name),
            Some(&scope.loc),
        ));
    }
    let template = info.template.as_ref().ok_or_else(|| {
        TdlError::generation(
            format!("embedded script `{}` has no text", info.name),
            Some(&scope.loc),
        )
    })?;

    let mut out = String::from("(\n");
    for (name, value) in scope.bindings() {
        if !is_shell_identifier(name) || !arena.is_scalar_like(value) {
            continue;
        }
        let text = arena.text(value).map_err(|e| e.or_at(&scope.loc))?;
        out.push_str(&format!("{name}={}\n", quote(&text)));
    }
    let body = if template.interpolate {
        arena.interpolate(&template.text, &template.chain, &template.loc)?
    } else {
        template.text.to_string()
    };
    out.push_str(body.trim_matches('\n'));
    out.push_str("\n)");
    Ok(out)
}

// ============================================================================
// 2. MPI LAUNCH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    /// `mpirun -np N prog : -np M prog2`
    Mpirun,
    /// `srun --multi-prog` with a generated configuration file.
    Srun,
}

impl Launcher {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "mpirun" | "mpiexec" => Some(Self::Mpirun),
            "srun" => Some(Self::Srun),
            _ => None,
        }
    }
}

fn block_command(threads: u32, command: &[String]) -> String {
    let mut parts = vec![format!("env OMP_NUM_THREADS={threads}")];
    parts.extend(command.iter().map(|c| quote(c)));
    parts.join(" ")
}

pub fn launch_line(layout: &Layout, launcher: Launcher) -> String {
    match launcher {
        Launcher::Mpirun => {
            let blocks: Vec<String> = layout
                .blocks
                .iter()
                .map(|b| {
                    format!(
                        "-np {} {}",
                        b.block.ranks,
                        block_command(b.block.threads, &b.block.command)
                    )
                })
                .collect();
            format!("mpirun {}", blocks.join(" : "))
        }
        Launcher::Srun => {
            let mut conf = String::new();
            let mut first = 0u64;
            for b in &layout.blocks {
                let last = first + u64::from(b.block.ranks).saturating_sub(1);
                conf.push_str(&format!(
                    "{first}-{last} {}\n",
                    block_command(b.block.threads, &b.block.command)
                ));
                first = last + 1;
            }
            format!(
                "cat > tdl_multiprog.conf <<'TDL_EOF'\n{conf}TDL_EOF\n\
                 srun --ntasks={} --multi-prog tdl_multiprog.conf",
                layout.total_ranks()
            )
        }
    }
}

// ============================================================================
// 3. STEPS
// ============================================================================

/// What a step needs to know about the runnable it belongs to.
pub struct StepContext<'a> {
    pub arena: &'a Arena,
    pub mode: Mode,
    /// Runnable name, used for the baseline subdirectory.
    pub owner: &'a str,
    pub shape: NodeShape,
    pub launcher: Launcher,
}

impl StepContext<'_> {
    pub fn layout_of(&self, value: &Value) -> Result<Option<Layout>> {
        match self.arena.deref(value)? {
            Value::Spawn(spawn) => {
                let blocks = resources::rank_blocks(self.arena, &spawn)?;
                resources::layout(blocks, self.shape, Some(&spawn.loc)).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn baseline_path(&self, relative: &str) -> String {
        format!("\"$TDL_BASELINE_DIR\"/{}/{}", quote(self.owner), quote(relative))
    }

    /// Renders one step value.
    pub fn render(&self, step: &str, value: &Value) -> Result<String> {
        let arena = self.arena;
        let resolved = arena.deref(value)?;
        match &resolved {
            Value::Scalar(_) => arena.text(&resolved),
            Value::Runnable(Runnable::Embed(id)) => embed_script(arena, *id),
            Value::Spawn(_) => {
                let layout = self.layout_of(&resolved)?.ok_or_else(|| {
                    TdlError::generation(format!("step `{step}`: empty spawn"), resolved.location())
                })?;
                let mut out = String::new();
                for note in layout.blocks.iter().filter_map(|b| b.note.as_deref()) {
                    out.push_str(&format!("# note: {note}\n"));
                }
                out.push_str(&launch_line(&layout, self.launcher));
                Ok(out)
            }
            Value::Filters(chain) => {
                let mut lines = Vec::with_capacity(chain.ops.len());
                for op in &chain.ops {
                    let target = arena.text(&op.target).map_err(|e| e.or_at(&op.loc))?;
                    let source = arena.text(&op.source).map_err(|e| e.or_at(&op.loc))?;
                    lines.push(match op.op.as_str() {
                        "atparse" => format!("tdl_atparse {} {}", quote(&source), quote(&target)),
                        how => format!("tdl_deliver {how} {} {}", quote(&source), quote(&target)),
                    });
                }
                Ok(lines.join("\n"))
            }
            Value::Criteria(chain) => {
                let mut lines = Vec::with_capacity(chain.ops.len() + 1);
                if self.mode == Mode::Baseline {
                    lines.push(format!("mkdir -p \"$TDL_BASELINE_DIR\"/{}", quote(self.owner)));
                }
                for op in &chain.ops {
                    let target = arena.text(&op.target).map_err(|e| e.or_at(&op.loc))?;
                    let source = arena.text(&op.source).map_err(|e| e.or_at(&op.loc))?;
                    let baseline = self.baseline_path(&source);
                    lines.push(match self.mode {
                        Mode::Baseline => format!("tdl_deliver copy {} {baseline}", quote(&target)),
                        Mode::Verify => {
                            format!("tdl_compare {} {} {baseline}", op.op, quote(&target))
                        }
                    });
                }
                Ok(lines.join("\n"))
            }
            other => Err(TdlError::generation(
                format!(
                    "step `{step}` of `{}` is a {}, which cannot be run",
                    self.owner,
                    other.kind_name()
                ),
                value.location(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{layout, RankBlock};

    #[test]
    fn quoting_and_identifiers() {
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert!(is_shell_identifier("FV3_DIR"));
        assert!(!is_shell_identifier("2x"));
        assert!(!is_shell_identifier("a.b"));
        assert_eq!(sanitize("gfs-v16.p8"), "gfs_v16_p8");
    }

    fn two_blocks() -> Layout {
        let blocks = vec![
            RankBlock {
                command: vec!["fv3.exe".into()],
                ranks: 4,
                ppn: None,
                threads: 2,
                hyperthreads: None,
            },
            RankBlock {
                command: vec!["io.exe".into(), "-v".into()],
                ranks: 2,
                ppn: None,
                threads: 1,
                hyperthreads: None,
            },
        ];
        let shape = NodeShape {
            cores_per_node: 4,
            cpus_per_core: 1,
        };
        layout(blocks, shape, None).unwrap()
    }

    #[test]
    fn mpirun_uses_mpmd_colons() {
        let line = launch_line(&two_blocks(), Launcher::Mpirun);
        assert_eq!(
            line,
            "mpirun -np 4 env OMP_NUM_THREADS=2 'fv3.exe' : -np 2 env OMP_NUM_THREADS=1 'io.exe' '-v'"
        );
    }

    #[test]
    fn srun_writes_a_multi_prog_file() {
        let text = launch_line(&two_blocks(), Launcher::Srun);
        assert!(text.contains(
            "0-3 env OMP_NUM_THREADS=2 'fv3.exe'\n4-5 env OMP_NUM_THREADS=1 'io.exe' '-v'\n"
        ));
        assert!(text.ends_with("srun --ntasks=6 --multi-prog tdl_multiprog.conf"));
    }

    #[test]
    fn srun_rank_ranges_may_pass_u32() {
        let wide = |cmd: &str| RankBlock {
            command: vec![cmd.into()],
            ranks: u32::MAX,
            ppn: None,
            threads: 1,
            hyperthreads: None,
        };
        let l = layout(vec![wide("a"), wide("b")], NodeShape::default(), None).unwrap();
        let text = launch_line(&l, Launcher::Srun);
        assert!(text.contains("\n4294967295-8589934589 env OMP_NUM_THREADS=1 'b'\n"), "{text}");
        assert!(text.ends_with("srun --ntasks=8589934590 --multi-prog tdl_multiprog.conf"));
    }
}
