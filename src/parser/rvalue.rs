// src/parser/rvalue.rs
//
// Right-hand sides: numbers, strings, lazy references, calls and anonymous
// hashes. Also parameter lists, which share the same value grammar.

use super::Parser;
use crate::error::{Result, TdlError};
use crate::lexer::TokenKind;
use crate::model::{Param, Reference, Runnable, ScopeId, ScopeKind, Value};

impl Parser<'_> {
    pub(super) fn rvalue(&mut self) -> Result<Value> {
        let loc = self.loc();
        let value = match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Value::number(n)
            }
            TokenKind::Literal(s) => {
                self.advance();
                Value::literal(&s, loc)
            }
            TokenKind::Quoted(s) | TokenKind::Block(s) => {
                self.advance();
                Value::interpolated(&s, self.chain(), loc)
            }
            TokenKind::LBrace => {
                self.advance();
                let id = self.enter(
                    ScopeKind::Hash {
                        name: "<anonymous>".into(),
                    },
                    loc,
                );
                self.body()?;
                self.leave();
                Value::Scope(id)
            }
            TokenKind::Ident(path) => {
                self.advance();
                if *self.peek() == TokenKind::LParen {
                    return self.call(&path, loc);
                }
                Value::Ref(Reference {
                    path,
                    chain: self.chain(),
                    loc,
                })
            }
            _ => return Err(self.expected("a value")),
        };
        Ok(value)
    }

    /// `name(arg = value, ...)` on a parameterized hash or embedded script.
    fn call(&mut self, path: &str, loc: crate::error::Location) -> Result<Value> {
        let arena = &self.unit.arena;
        let callee = arena
            .resolve(path, &self.chain())
            .and_then(|v| arena.deref(&v))
            .map_err(|e| e.or_at(&loc))?;
        let wrap: fn(ScopeId) -> Value = match callee {
            Value::Scope(_) => Value::Scope,
            Value::Runnable(Runnable::Embed(_)) => |id| Value::Runnable(Runnable::Embed(id)),
            ref other => {
                return Err(TdlError::parse(
                    loc,
                    format!("`{path}` is a {} and cannot be called", other.kind_name()),
                ))
            }
        };
        let callee_id = arena.scope_handle(&callee).ok_or_else(|| {
            TdlError::parse(loc.clone(), format!("`{path}` cannot be called"))
        })?;

        self.expect(TokenKind::LParen, "`(`")?;
        let mut args: Vec<(String, Value)> = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RParen) {
                break;
            }
            let (name, arg_loc) = self.expect_ident("an argument name or `)`")?;
            if args.iter().any(|(n, _)| *n == name) {
                return Err(TdlError::parse(
                    arg_loc,
                    format!("argument `{name}` given twice"),
                ));
            }
            self.expect(TokenKind::Assign, "`=` after argument name")?;
            self.skip_eols();
            args.push((name, self.rvalue()?));
        }

        let applied = self
            .unit
            .arena
            .apply(callee_id, args, &loc)
            .map_err(|e| e.or_at(&loc))?;
        Ok(wrap(applied))
    }

    /// `(name, name = default, ...)` after a hash or embed name.
    pub(super) fn params(&mut self, scope: ScopeId) -> Result<()> {
        self.expect(TokenKind::LParen, "`(`")?;
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RParen) {
                return Ok(());
            }
            let (name, loc) = self.expect_ident("a parameter name or `)`")?;
            let default = if self.eat(&TokenKind::Assign) {
                self.skip_eols();
                Some(self.rvalue()?)
            } else {
                None
            };
            self.unit
                .arena
                .add_param(scope, Param { name, default }, &loc)?;
        }
    }
}
