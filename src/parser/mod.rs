//! Recursive-descent parser for TDL.
//!
//! The parser does not build an AST. It evaluates definitions straight into
//! the [`CompilationUnit`]'s scope arena, keeping an explicit stack of the
//! scopes it is currently inside (file scope at the bottom).
//!
//! - `mod.rs`: token cursor, scope stack, statement dispatch
//! - `blocks.rs`: keyword statements (`hash`, `build`, `spawn`, `run`, ...)
//! - `rvalue.rs`: right-hand sides, calls, parameter lists

use std::path::PathBuf;

use crate::error::{Location, Result, TdlError};
use crate::lexer::{Token, TokenKind};
use crate::model::{ScopeId, ScopeKind, TaskKind, Value};
use crate::unit::CompilationUnit;

mod blocks;
mod rvalue;

/// Parses one file's tokens into the unit's global scope.
pub(crate) fn parse(unit: &mut CompilationUnit, tokens: Vec<Token>, path: PathBuf) -> Result<()> {
    let global = unit.global;
    let mut parser = Parser {
        unit,
        tokens,
        pos: 0,
        path,
        stack: vec![global],
        seen_run: false,
    };
    parser.program()
}

pub(crate) struct Parser<'u> {
    unit: &'u mut CompilationUnit,
    tokens: Vec<Token>,
    pos: usize,
    /// File being parsed; base for relative `load` paths.
    path: PathBuf,
    /// Open scopes, innermost last.
    stack: Vec<ScopeId>,
    seen_run: bool,
}

impl<'u> Parser<'u> {
    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &TokenKind {
        &self.cur().kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i].kind
    }

    fn advance(&mut self) -> Token {
        let t = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn loc(&self) -> Location {
        self.cur().location()
    }

    fn err(&self, msg: impl Into<String>) -> TdlError {
        TdlError::parse(self.loc(), msg)
    }

    fn expected(&self, what: &str) -> TdlError {
        self.err(format!("expected {what}, found {}", self.peek()))
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Location> {
        if *self.peek() == kind {
            Ok(self.advance().location())
        } else {
            Err(self.expected(what))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Location)> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                let loc = self.advance().location();
                Ok((name, loc))
            }
            _ => Err(self.expected(what)),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_eols(&mut self) {
        while *self.peek() == TokenKind::Eol {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::Eol | TokenKind::Comma) {
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Scope stack
    // ------------------------------------------------------------------

    fn current(&self) -> ScopeId {
        self.stack[self.stack.len() - 1]
    }

    fn at_file_level(&self) -> bool {
        self.stack.len() == 1
    }

    /// Innermost-first chain of the open scopes.
    fn chain(&self) -> Vec<ScopeId> {
        self.stack.iter().rev().copied().collect()
    }

    fn enter(&mut self, kind: ScopeKind, loc: Location) -> ScopeId {
        let chain = self.chain();
        let id = self.unit.arena.create(kind, chain, loc);
        self.stack.push(id);
        id
    }

    fn leave(&mut self) -> ScopeId {
        let id = self.current();
        self.stack.pop();
        self.unit.arena.seal(id);
        id
    }

    fn in_embed(&self) -> bool {
        matches!(self.unit.arena.get(self.current()).kind, ScopeKind::Embed(_))
    }

    fn bind_constant(&mut self, name: &str, value: Value, loc: &Location) -> Result<()> {
        let here = self.current();
        self.unit.arena.define_constant(here, name, value, loc)
    }

    fn bind_variable(&mut self, name: &str, value: Value, loc: &Location) -> Result<()> {
        let here = self.current();
        self.unit.arena.define_variable(here, name, value, loc)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn program(&mut self) -> Result<()> {
        loop {
            self.skip_separators();
            if *self.peek() == TokenKind::Eof {
                return Ok(());
            }
            self.statement()?;
        }
    }

    /// Statements up to and including the closing `}`.
    fn body(&mut self) -> Result<()> {
        loop {
            self.skip_separators();
            match self.peek() {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(());
                }
                TokenKind::Eof => return Err(self.expected("`}`")),
                _ => self.statement()?,
            }
        }
    }

    fn statement(&mut self) -> Result<()> {
        let TokenKind::Ident(word) = self.peek().clone() else {
            return Err(self.expected("a statement"));
        };
        // `name = ...` is an assignment even when `name` spells a keyword.
        if *self.peek_at(1) == TokenKind::Assign {
            return self.assignment();
        }
        match word.as_str() {
            "hash" => self.hash_block(),
            "platform" => self.platform_block(),
            "build" => self.task_block(TaskKind::Build),
            "test" | "compset" => self.task_block(TaskKind::Test),
            "task" => self.task_block(TaskKind::Job),
            "use" => self.use_statement(),
            "autodetect" => self.autodetect(),
            "spawn" => self.spawn_block(),
            "filters" => self.op_block(false),
            "criteria" => self.op_block(true),
            "embed" => self.embed_block(),
            "load" => self.load_statement(),
            "run" => self.run_statement(),
            _ => Err(self.err(format!(
                "unexpected `{word}`; expected a definition or `name = value`"
            ))),
        }
    }

    fn assignment(&mut self) -> Result<()> {
        let (name, loc) = self.expect_ident("a name")?;
        self.expect(TokenKind::Assign, "`=`")?;
        self.skip_eols();
        let value = self.rvalue()?;
        self.bind_variable(&name, value, &loc)
    }
}
