// src/model/value.rs
//
// =============================================================================
// TDLC: VALUES (v 0.1 )
// =============================================================================
//
// The closed set of things a TDL name can be bound to.
//
// Scope-backed values (hashes, platforms, builds, tests, embedded scripts)
// only hold a handle into the `Arena`; everything else is plain data that
// carries its own captured chain of enclosing scopes.

use super::ScopeId;
use crate::error::Location;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Scalar),
    Ref(Reference),
    Scope(ScopeId),
    Runnable(Runnable),
    Spawn(Rc<Spawn>),
    Filters(Rc<OpChain>),
    Criteria(Rc<OpChain>),
}

#[derive(Debug, Clone)]
pub enum Scalar {
    Number(f64),
    Str(Str),
}

/// A string value. Interpolating strings resolve `@[...]` lazily against
/// `chain`, the scopes that enclosed the definition.
#[derive(Debug, Clone)]
pub struct Str {
    pub text: Rc<str>,
    pub interpolate: bool,
    pub chain: Vec<ScopeId>,
    pub loc: Location,
}

/// A lazily resolved `%`-path. Never cached.
#[derive(Debug, Clone)]
pub struct Reference {
    pub path: String,
    pub chain: Vec<ScopeId>,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runnable {
    Platform(ScopeId),
    Build(ScopeId),
    Test(ScopeId),
    Embed(ScopeId),
}

impl Runnable {
    pub fn scope(self) -> ScopeId {
        match self {
            Runnable::Platform(s)
            | Runnable::Build(s)
            | Runnable::Test(s)
            | Runnable::Embed(s) => s,
        }
    }
}

/// One block of identically configured MPI/OpenMP processes.
#[derive(Debug, Clone)]
pub struct Rank {
    pub program: Value,
    pub args: Vec<Value>,
    pub ranks: Option<Value>,
    pub ppn: Option<Value>,
    pub threads: Option<Value>,
    pub hyperthreads: Option<Value>,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub struct Spawn {
    pub ranks: Vec<Rank>,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub target: Value,
    pub op: String,
    pub source: Value,
    pub loc: Location,
}

/// Ordered `(target, operator, source)` triples of a `filters` or
/// `criteria` block.
#[derive(Debug, Clone)]
pub struct OpChain {
    pub ops: Vec<Operation>,
    pub loc: Location,
}

pub const FILTER_OPS: &[&str] = &["copy", "link", "atparse"];
pub const CRITERIA_OPS: &[&str] = &["bitcmp", "metacmp"];

impl Value {
    pub fn number(n: f64) -> Self {
        Value::Scalar(Scalar::Number(n))
    }

    /// A non-interpolating string with no captured chain.
    pub fn literal(text: &str, loc: Location) -> Self {
        Value::Scalar(Scalar::Str(Str {
            text: Rc::from(text),
            interpolate: false,
            chain: Vec::new(),
            loc,
        }))
    }

    pub fn interpolated(text: &str, chain: Vec<ScopeId>, loc: Location) -> Self {
        Value::Scalar(Scalar::Str(Str {
            text: Rc::from(text),
            interpolate: true,
            chain,
            loc,
        }))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Scalar(_))
    }

    /// Human-readable kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Scalar(Scalar::Number(_)) => "number",
            Value::Scalar(Scalar::Str(_)) => "string",
            Value::Ref(_) => "reference",
            Value::Scope(_) => "hash",
            Value::Runnable(Runnable::Platform(_)) => "platform",
            Value::Runnable(Runnable::Build(_)) => "build",
            Value::Runnable(Runnable::Test(_)) => "test",
            Value::Runnable(Runnable::Embed(_)) => "embedded script",
            Value::Spawn(_) => "spawn",
            Value::Filters(_) => "filters",
            Value::Criteria(_) => "criteria",
        }
    }

    /// Source location, when the value remembers one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Value::Scalar(Scalar::Str(s)) => Some(&s.loc),
            Value::Ref(r) => Some(&r.loc),
            Value::Spawn(s) => Some(&s.loc),
            Value::Filters(c) | Value::Criteria(c) => Some(&c.loc),
            _ => None,
        }
    }
}
