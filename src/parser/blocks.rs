// src/parser/blocks.rs
//
// Keyword statements. Keyword definitions bind constants in the enclosing
// scope; `spawn`, `filters` and `criteria` bind variables.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::Parser;
use crate::detect::Candidate;
use crate::error::{Location, Result, TdlError};
use crate::lexer::TokenKind;
use crate::model::{
    EmbedInfo, OpChain, Operation, Rank, Reference, Runnable, ScopeId, ScopeKind, Spawn, Str,
    TaskInfo, TaskKind, Value, CRITERIA_OPS, FILTER_OPS,
};
use crate::unit::RunRequest;

const RANK_KEYS: &[&str] = &["ranks", "ppn", "threads", "hyperthreads"];

/// `referenced` relative to the directory of `including`.
fn resolve_relative(including: &Path, referenced: &str) -> PathBuf {
    let p = PathBuf::from(referenced);
    if p.is_absolute() {
        p
    } else {
        including
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(p)
    }
}

impl Parser<'_> {
    fn require_local(&self, scope: ScopeId, step: &str, what: &str, loc: &Location) -> Result<()> {
        if self.unit.arena.local(scope, step).is_none() {
            return Err(TdlError::parse(
                loc.clone(),
                format!("{what} must define `{step}`"),
            ));
        }
        Ok(())
    }

    pub(super) fn hash_block(&mut self) -> Result<()> {
        self.advance();
        let (name, loc) = self.expect_ident("a hash name")?;
        let id = self.enter(ScopeKind::Hash { name: name.clone() }, loc.clone());
        if *self.peek() == TokenKind::LParen {
            self.params(id)?;
        }
        self.eat(&TokenKind::Assign);
        self.skip_eols();
        self.expect(TokenKind::LBrace, "`{`")?;
        self.body()?;
        self.leave();
        self.bind_constant(&name, Value::Scope(id), &loc)
    }

    pub(super) fn platform_block(&mut self) -> Result<()> {
        self.advance();
        let (name, loc) = self.expect_ident("a platform name")?;
        let id = self.enter(ScopeKind::Platform { name: name.clone() }, loc.clone());
        self.skip_eols();
        self.expect(TokenKind::LBrace, "`{`")?;
        self.body()?;
        self.require_local(id, "detect", &format!("platform `{name}`"), &loc)?;
        self.leave();
        self.bind_constant(&name, Value::Runnable(Runnable::Platform(id)), &loc)
    }

    /// `build|test|compset|task NAME [: dep, ...] { ... }`
    pub(super) fn task_block(&mut self, kind: TaskKind) -> Result<()> {
        let TokenKind::Ident(keyword) = self.advance().kind else {
            return Err(self.expected("`build`, `test`, `compset` or `task`"));
        };
        let (name, loc) = self.expect_ident(&format!("a {keyword} name"))?;

        let mut deps = Vec::new();
        if self.eat(&TokenKind::Colon) {
            let chain = self.chain();
            loop {
                let (path, dep_loc) = self.expect_ident("a dependency name")?;
                deps.push(Value::Ref(Reference {
                    path,
                    chain: chain.clone(),
                    loc: dep_loc,
                }));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let info = TaskInfo {
            kind,
            name: name.clone(),
            deps,
        };
        let id = self.enter(ScopeKind::Task(info), loc.clone());
        self.skip_eols();
        self.expect(TokenKind::LBrace, "`{`")?;
        self.body()?;

        let what = format!("{keyword} `{name}`");
        let runnable = match kind {
            TaskKind::Build => {
                self.require_local(id, "target", &what, &loc)?;
                self.require_local(id, "build", &what, &loc)?;
                Runnable::Build(id)
            }
            TaskKind::Test | TaskKind::Job => {
                self.require_local(id, "execute", &what, &loc)?;
                Runnable::Test(id)
            }
        };
        self.leave();
        log::debug!("{loc}: registered {what}");
        self.bind_constant(&name, Value::Runnable(runnable), &loc)
    }

    pub(super) fn use_statement(&mut self) -> Result<()> {
        let use_loc = self.loc();
        if self.at_file_level() {
            return Err(self.err("`use` is only allowed inside a block"));
        }
        self.advance();
        let (path, loc) = self.expect_ident("a name to use")?;
        let arena = &self.unit.arena;
        let source = arena
            .resolve(&path, &self.chain())
            .and_then(|v| arena.deref(&v))
            .map_err(|e| e.or_at(&loc))?;
        let src = arena.scope_handle(&source).ok_or_else(|| {
            TdlError::parse(
                loc.clone(),
                format!("cannot `use` `{path}`: it is a {}", source.kind_name()),
            )
        })?;
        let only_scalars = self.in_embed();
        let here = self.current();
        self.unit
            .arena
            .use_from(here, src, only_scalars, &use_loc)
            .map(|_| ())
    }

    /// `autodetect NAME (/ p1, p2, ... /)`
    pub(super) fn autodetect(&mut self) -> Result<()> {
        self.advance();
        let (name, loc) = self.expect_ident("a name for the detected platform")?;
        self.expect(TokenKind::LArray, "`(/`")?;
        let mut candidates = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RArray) {
                break;
            }
            let (path, cand_loc) = self.expect_ident("a platform name or `/)`")?;
            let arena = &self.unit.arena;
            let value = arena
                .resolve(&path, &self.chain())
                .and_then(|v| arena.deref(&v))
                .map_err(|e| e.or_at(&cand_loc))?;
            let Value::Runnable(Runnable::Platform(scope)) = value else {
                return Err(TdlError::parse(
                    cand_loc,
                    format!("`{path}` is a {}, not a platform", value.kind_name()),
                ));
            };
            candidates.push(Candidate {
                name: arena.get(scope).name().to_string(),
                scope,
            });
        }
        if candidates.is_empty() {
            return Err(TdlError::parse(loc, "autodetect needs at least one platform"));
        }
        let chosen = self.unit.detect(&candidates, &loc)?;
        self.bind_constant(&name, Value::Runnable(Runnable::Platform(chosen)), &loc)
    }

    /// `spawn NAME { {prog, arg..., ranks=N, ppn=N, threads=N, hyperthreads=N} ... }`
    pub(super) fn spawn_block(&mut self) -> Result<()> {
        self.advance();
        let (name, loc) = self.expect_ident("a spawn name")?;
        self.skip_eols();
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut ranks = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RBrace) {
                break;
            }
            let rank_loc = self.expect(TokenKind::LBrace, "`{` starting a rank entry or `}`")?;
            ranks.push(self.rank_entry(rank_loc)?);
        }
        if ranks.is_empty() {
            return Err(TdlError::parse(loc, format!("spawn `{name}` has no ranks")));
        }
        let spawn = Spawn {
            ranks,
            loc: loc.clone(),
        };
        self.bind_variable(&name, Value::Spawn(Rc::new(spawn)), &loc)
    }

    fn rank_entry(&mut self, loc: Location) -> Result<Rank> {
        let mut positional = Vec::new();
        let mut keyed: [Option<Value>; 4] = Default::default();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RBrace) {
                break;
            }
            let key = match (self.peek(), self.peek_at(1)) {
                (TokenKind::Ident(key), TokenKind::Assign) => Some(key.clone()),
                _ => None,
            };
            if let Some(key) = key {
                let Some(slot) = RANK_KEYS.iter().position(|k| *k == key) else {
                    return Err(self.err(format!(
                        "unknown rank attribute `{key}`; expected one of {}",
                        RANK_KEYS.join(", ")
                    )));
                };
                self.advance();
                self.advance();
                keyed[slot] = Some(self.rvalue()?);
                continue;
            }
            positional.push(self.rvalue()?);
        }
        let mut positional = positional.into_iter();
        let program = positional
            .next()
            .ok_or_else(|| TdlError::parse(loc.clone(), "rank entry needs a program"))?;
        let [ranks, ppn, threads, hyperthreads] = keyed;
        Ok(Rank {
            program,
            args: positional.collect(),
            ranks,
            ppn,
            threads,
            hyperthreads,
            loc,
        })
    }

    /// `filters NAME { target .op. source, ... }` or the same for `criteria`.
    pub(super) fn op_block(&mut self, criteria: bool) -> Result<()> {
        self.advance();
        let (name, loc) = self.expect_ident("a name")?;
        let allowed = if criteria { CRITERIA_OPS } else { FILTER_OPS };
        self.skip_eols();
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut ops = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RBrace) {
                break;
            }
            let op_loc = self.loc();
            let target = self.rvalue()?;
            let op = match self.peek() {
                TokenKind::Operator(op) if allowed.contains(&op.as_str()) => op.clone(),
                TokenKind::Operator(op) => {
                    return Err(self.err(format!(
                        "operator `.{op}.` is not allowed here; expected one of {}",
                        allowed
                            .iter()
                            .map(|o| format!(".{o}."))
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                }
                _ => return Err(self.expected("an operator such as `.copy.`")),
            };
            self.advance();
            let source = self.rvalue()?;
            ops.push(Operation {
                target,
                op,
                source,
                loc: op_loc,
            });
        }
        let chain = Rc::new(OpChain {
            ops,
            loc: loc.clone(),
        });
        let value = if criteria {
            Value::Criteria(chain)
        } else {
            Value::Filters(chain)
        };
        self.bind_variable(&name, value, &loc)
    }

    /// `embed bash NAME [(params)] [{vars}] TEMPLATE`
    pub(super) fn embed_block(&mut self) -> Result<()> {
        self.advance();
        let (language, lang_loc) = self.expect_ident("an embedded language")?;
        if language != "bash" {
            return Err(TdlError::parse(
                lang_loc,
                format!("unsupported embedded language `{language}`; only `bash` is accepted"),
            ));
        }
        let (name, loc) = self.expect_ident("an embedded script name")?;
        let info = EmbedInfo {
            language,
            name: name.clone(),
            template: None,
        };
        let id = self.enter(ScopeKind::Embed(info), loc.clone());
        if *self.peek() == TokenKind::LParen {
            self.params(id)?;
        }
        self.skip_eols();
        if self.eat(&TokenKind::LBrace) {
            self.body()?;
            self.skip_eols();
        }

        let template_loc = self.loc();
        let (text, interpolate) = match self.peek() {
            TokenKind::Block(s) | TokenKind::Quoted(s) => (s.clone(), true),
            TokenKind::Literal(s) => (s.clone(), false),
            _ => return Err(self.expected("the script text, e.g. `[[[ ... ]]]`")),
        };
        self.advance();
        let template = Str {
            text: Rc::from(text.as_str()),
            interpolate,
            chain: self.chain(),
            loc: template_loc,
        };
        self.unit.arena.set_template(id, template)?;
        self.leave();
        self.bind_constant(&name, Value::Runnable(Runnable::Embed(id)), &loc)
    }

    /// `load 'path'`
    pub(super) fn load_statement(&mut self) -> Result<()> {
        let loc = self.loc();
        if !self.at_file_level() {
            return Err(self.err("`load` is only allowed at file level"));
        }
        if self.seen_run {
            return Err(self.err("`load` is not allowed after `run`"));
        }
        self.advance();
        let file = match self.peek() {
            TokenKind::Literal(s) => s.clone(),
            TokenKind::Quoted(s) | TokenKind::Block(s) => {
                let chain = self.chain();
                let s = s.clone();
                self.unit.arena.interpolate(&s, &chain, &loc)?
            }
            _ => return Err(self.expected("a file name")),
        };
        self.advance();
        let target = resolve_relative(&self.path, &file);
        self.unit.load(&target, Some(&loc)).map_err(|e| match e {
            TdlError::Io { path, source } => TdlError::parse(
                loc.clone(),
                format!("cannot load `{path}`: {source}"),
            ),
            other => other,
        })
    }

    /// `run NAME [@ item, ...]` or `run NAME @ (/ item, ... /)`, where an item
    /// is a run-set name or a `var == value` guard.
    pub(super) fn run_statement(&mut self) -> Result<()> {
        if !self.at_file_level() {
            return Err(self.err("`run` is only allowed at file level"));
        }
        self.advance();
        self.seen_run = true;
        let (path, loc) = self.expect_ident("the name of a build or test")?;
        let mut request = RunRequest {
            path,
            chain: self.chain(),
            sets: Vec::new(),
            guards: Vec::new(),
            loc,
        };
        if !self.eat(&TokenKind::At) {
            self.unit.request_run(request);
            return Ok(());
        }

        let bracketed = self.eat(&TokenKind::LArray);
        loop {
            if bracketed {
                self.skip_separators();
                if self.eat(&TokenKind::RArray) {
                    break;
                }
            }
            let (item, item_loc) = self.expect_ident("a run-set name or `var == value`")?;
            if self.eat(&TokenKind::EqEq) {
                let expected = match self.peek().clone() {
                    // A bare word on the right-hand side is plain text.
                    TokenKind::Ident(word) => {
                        self.advance();
                        Value::literal(&word, item_loc)
                    }
                    _ => self.rvalue()?,
                };
                request.guards.push((item, expected));
            } else {
                request.sets.push(item);
            }
            if !bracketed && !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.unit.request_run(request);
        Ok(())
    }
}
