//! Scope arena and name resolution.
//!
//! Every scope the parser creates lives in one [`Arena`] and is addressed by a
//! [`ScopeId`]. Scope equality is handle identity: two scopes with identical
//! bindings are still different scopes.
//!
//! Values never own scopes. They hold handles, and strings/references capture
//! the chain of enclosing scopes (innermost first) that was active where they
//! were written. Copying a value into another owner (`use`, call application)
//! rewrites those captured chains through a handle-substitution map; see
//! [`Arena::use_from`] and [`Arena::apply`].

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Location, Result, TdlError};

mod interp;
pub mod value;

pub use interp::format_number;
pub use value::{
    OpChain, Operation, Rank, Reference, Runnable, Scalar, Spawn, Str, Value, CRITERIA_OPS,
    FILTER_OPS,
};

/// Limit on nested dereferencing, so `x = x` fails instead of overflowing.
pub(crate) const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(usize);

impl ScopeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Build,
    Test,
    /// `task`: a test-like job that is not required to verify anything.
    Job,
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub kind: TaskKind,
    pub name: String,
    pub deps: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct EmbedInfo {
    pub language: String,
    pub name: String,
    pub template: Option<Str>,
}

#[derive(Debug, Clone)]
pub enum ScopeKind {
    Global,
    Hash { name: String },
    Platform { name: String },
    Task(TaskInfo),
    Embed(EmbedInfo),
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub loc: Location,
    params: Vec<Param>,
    constants: Vec<(String, Value)>,
    variables: Vec<(String, Value)>,
    chain: Vec<ScopeId>,
    sealed: bool,
    allow_overwrite: bool,
}

impl Scope {
    pub fn name(&self) -> &str {
        match &self.kind {
            ScopeKind::Global => "<global>",
            ScopeKind::Hash { name } | ScopeKind::Platform { name } => name,
            ScopeKind::Task(t) => &t.name,
            ScopeKind::Embed(e) => &e.name,
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn chain(&self) -> &[ScopeId] {
        &self.chain
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Constants first, then variables, each in definition order.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.constants
            .iter()
            .chain(self.variables.iter())
            .map(|(n, v)| (n.as_str(), v))
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.constants
            .iter()
            .chain(self.variables.iter())
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn is_constant(&self, name: &str) -> bool {
        self.constants.iter().any(|(n, _)| n == name)
    }
}

/// Handle substitution used while copying values into a new owner.
struct Rescope {
    map: HashMap<ScopeId, ScopeId>,
    /// The scope being replaced. Chains that reach it continue with `tail`.
    root: ScopeId,
    tail: Vec<ScopeId>,
}

impl Rescope {
    fn new(root: ScopeId, replacement: ScopeId, tail: Vec<ScopeId>) -> Self {
        let mut map = HashMap::new();
        map.insert(root, replacement);
        Self { map, root, tail }
    }

    fn chain(&self, chain: &[ScopeId]) -> Vec<ScopeId> {
        let mut out = Vec::with_capacity(chain.len() + self.tail.len());
        for &s in chain {
            if s == self.root {
                out.push(self.map[&s]);
                out.extend(self.tail.iter().copied());
                return out;
            }
            out.push(self.map.get(&s).copied().unwrap_or(s));
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct Arena {
    scopes: Vec<Scope>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the file-level scope: open, but redefinition is forbidden.
    pub fn create_global(&mut self, loc: Location) -> ScopeId {
        let id = self.create(ScopeKind::Global, Vec::new(), loc);
        self.scopes[id.0].allow_overwrite = false;
        id
    }

    pub fn create(&mut self, kind: ScopeKind, chain: Vec<ScopeId>, loc: Location) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            kind,
            loc,
            params: Vec::new(),
            constants: Vec::new(),
            variables: Vec::new(),
            chain,
            sealed: false,
            allow_overwrite: true,
        });
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// `[id, id's chain...]`: everything visible from inside `id`.
    pub fn full_chain(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::with_capacity(self.scopes[id.0].chain.len() + 1);
        chain.push(id);
        chain.extend(self.scopes[id.0].chain.iter().copied());
        chain
    }

    pub fn local(&self, id: ScopeId, name: &str) -> Option<&Value> {
        self.scopes[id.0].local(name)
    }

    pub fn seal(&mut self, id: ScopeId) {
        self.scopes[id.0].sealed = true;
    }

    fn check_open(&self, id: ScopeId) -> Result<()> {
        let scope = &self.scopes[id.0];
        if scope.sealed {
            return Err(TdlError::ScopeSealed {
                scope: scope.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn set_kind(&mut self, id: ScopeId, kind: ScopeKind) -> Result<()> {
        self.check_open(id)?;
        self.scopes[id.0].kind = kind;
        Ok(())
    }

    /// Gives a build or test a new name. Allowed on sealed scopes: the name
    /// is how the job is addressed, not part of what it binds.
    pub fn rename_task(&mut self, id: ScopeId, name: &str) -> Result<()> {
        match &mut self.scopes[id.0].kind {
            ScopeKind::Task(info) => {
                info.name = name.to_string();
                Ok(())
            }
            _ => Err(TdlError::eval(
                format!("cannot rename `{name}`: not a build or test"),
                None,
            )),
        }
    }

    pub fn set_template(&mut self, id: ScopeId, template: Str) -> Result<()> {
        self.check_open(id)?;
        match &mut self.scopes[id.0].kind {
            ScopeKind::Embed(info) => {
                info.template = Some(template);
                Ok(())
            }
            _ => Err(TdlError::eval("only embedded scripts have templates", Some(&template.loc))),
        }
    }

    pub fn add_param(&mut self, id: ScopeId, param: Param, loc: &Location) -> Result<()> {
        self.check_open(id)?;
        let scope = &mut self.scopes[id.0];
        if scope.params.iter().any(|p| p.name == param.name) {
            return Err(TdlError::parse(
                loc.clone(),
                format!("duplicate parameter `{}`", param.name),
            ));
        }
        scope.params.push(param);
        Ok(())
    }

    pub fn define_constant(
        &mut self,
        id: ScopeId,
        name: &str,
        value: Value,
        loc: &Location,
    ) -> Result<()> {
        self.check_open(id)?;
        let scope = &mut self.scopes[id.0];
        if scope.local(name).is_some() {
            return Err(TdlError::parse(
                loc.clone(),
                format!("`{name}` is already defined in `{}`", scope.name()),
            ));
        }
        scope.constants.push((name.to_string(), value));
        Ok(())
    }

    pub fn define_variable(
        &mut self,
        id: ScopeId,
        name: &str,
        value: Value,
        loc: &Location,
    ) -> Result<()> {
        self.check_open(id)?;
        let scope = &mut self.scopes[id.0];
        if scope.is_constant(name) {
            return Err(TdlError::parse(
                loc.clone(),
                format!("cannot redefine constant `{name}`"),
            ));
        }
        if let Some(slot) = scope.variables.iter_mut().find(|(n, _)| n == name) {
            if !scope.allow_overwrite {
                return Err(TdlError::parse(
                    loc.clone(),
                    format!("`{name}` is already defined; global names cannot be redefined"),
                ));
            }
            slot.1 = value;
            return Ok(());
        }
        scope.variables.push((name.to_string(), value));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str, chain: &[ScopeId]) -> Option<Value> {
        chain
            .iter()
            .find_map(|&s| self.scopes[s.0].local(name))
            .cloned()
    }

    /// Resolves a `%`-path against `chain` (innermost first).
    pub fn resolve(&self, path: &str, chain: &[ScopeId]) -> Result<Value> {
        self.resolve_depth(path, chain, 0)
    }

    /// Resolves a `%`-path as seen from inside scope `id`.
    pub fn resolve_in(&self, id: ScopeId, path: &str) -> Result<Value> {
        self.resolve(path, &self.full_chain(id))
    }

    pub(crate) fn resolve_depth(
        &self,
        path: &str,
        chain: &[ScopeId],
        depth: usize,
    ) -> Result<Value> {
        let not_found = || TdlError::NameNotFound {
            path: path.to_string(),
            loc: None,
        };
        let mut segments = path.split('%');
        let first = segments.next().filter(|s| !s.is_empty()).ok_or_else(not_found)?;
        let mut value = self.lookup(first, chain).ok_or_else(not_found)?;
        for segment in segments {
            let target = self.deref_depth(&value, depth + 1)?;
            let scope = self.scope_handle(&target).ok_or_else(|| {
                TdlError::eval(
                    format!(
                        "cannot look up `{segment}` in `{path}`: a {} has no members",
                        target.kind_name()
                    ),
                    None,
                )
            })?;
            let owner = &self.scopes[scope.0];
            if !owner.params.is_empty() {
                return Err(TdlError::eval(
                    format!(
                        "cannot look up `{segment}` in `{path}`: `{}` has parameters \
                         and must be called first",
                        owner.name()
                    ),
                    None,
                ));
            }
            value = self
                .lookup(segment, &self.full_chain(scope))
                .ok_or_else(not_found)?;
        }
        Ok(value)
    }

    /// Follows references until a concrete value is reached.
    pub fn deref(&self, value: &Value) -> Result<Value> {
        self.deref_depth(value, 0)
    }

    pub(crate) fn deref_depth(&self, value: &Value, depth: usize) -> Result<Value> {
        let mut current = value.clone();
        let mut depth = depth;
        while let Value::Ref(r) = &current {
            if depth > MAX_DEPTH {
                return Err(TdlError::eval(
                    format!("reference loop while resolving `{}`", r.path),
                    Some(&r.loc),
                ));
            }
            let next = self
                .resolve_depth(&r.path, &r.chain, depth + 1)
                .map_err(|e| e.or_at(&r.loc))?;
            current = next;
            depth += 1;
        }
        Ok(current)
    }

    /// The scope behind a scope-backed value.
    pub fn scope_handle(&self, value: &Value) -> Option<ScopeId> {
        match value {
            Value::Scope(id) => Some(*id),
            Value::Runnable(r) => Some(r.scope()),
            _ => None,
        }
    }

    /// True for scalars and for references that currently resolve to one.
    pub fn is_scalar_like(&self, value: &Value) -> bool {
        match value {
            Value::Scalar(_) => true,
            Value::Ref(_) => self.deref(value).map(|v| v.is_scalar()).unwrap_or(false),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // use / apply
    // ------------------------------------------------------------------

    /// Merges the bindings of `src` into `dest`.
    ///
    /// Names that are constants in `dest` are skipped. Merged values are
    /// rescoped so that anything that resolved through `src` now resolves
    /// through `dest` and its chain. Returns whether any merged value was
    /// non-scalar; with `only_scalars` such a value is an error instead.
    pub fn use_from(
        &mut self,
        dest: ScopeId,
        src: ScopeId,
        only_scalars: bool,
        loc: &Location,
    ) -> Result<bool> {
        self.check_open(dest)?;
        let source = &self.scopes[src.0];
        if !source.params.is_empty() {
            return Err(TdlError::eval(
                format!(
                    "cannot `use` `{}`: it has parameters and must be called first",
                    source.name()
                ),
                Some(loc),
            ));
        }
        let target = &self.scopes[dest.0];
        let merged: Vec<(String, Value)> = source
            .bindings()
            .filter(|(name, _)| !target.is_constant(name))
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();

        let mut non_scalar = false;
        for (name, value) in &merged {
            if !self.is_scalar_like(value) {
                if only_scalars {
                    return Err(TdlError::eval(
                        format!(
                            "`use {}` would import `{name}`, a {}; only scalars are allowed here",
                            self.scopes[src.0].name(),
                            value.kind_name()
                        ),
                        Some(loc),
                    ));
                }
                non_scalar = true;
            }
        }

        let mut rs = Rescope::new(src, dest, self.scopes[dest.0].chain.clone());
        for (name, value) in merged {
            let copied = self.rescope_value(&value, &mut rs);
            self.define_variable(dest, &name, copied, loc)?;
        }
        log::debug!(
            "use: merged `{}` into `{}`",
            self.scopes[src.0].name(),
            self.scopes[dest.0].name()
        );
        Ok(non_scalar)
    }

    /// Applies a parameterized scope to arguments, producing a sealed,
    /// parameter-free copy. Argument values keep the caller's chains.
    pub fn apply(
        &mut self,
        callee: ScopeId,
        args: Vec<(String, Value)>,
        loc: &Location,
    ) -> Result<ScopeId> {
        let source = self.scopes[callee.0].clone();
        let callee_name = source.name().to_string();
        if source.params.is_empty() {
            return Err(TdlError::eval(
                format!("`{callee_name}` takes no arguments"),
                Some(loc),
            ));
        }
        for (name, _) in &args {
            if !source.params.iter().any(|p| &p.name == name) {
                return Err(TdlError::UnknownArgument {
                    name: name.clone(),
                    callee: callee_name,
                    loc: Some(loc.clone()),
                });
            }
        }

        let applied = self.create(ScopeKind::Global, source.chain.clone(), loc.clone());
        let mut rs = Rescope::new(callee, applied, source.chain.clone());
        let kind = self.rescope_kind(&source.kind, &mut rs);
        self.scopes[applied.0].kind = kind;

        for param in &source.params {
            let value = match args.iter().find(|(n, _)| n == &param.name) {
                Some((_, v)) => v.clone(),
                None => match &param.default {
                    Some(d) => self.rescope_value(d, &mut rs),
                    None => {
                        return Err(TdlError::MissingArgument {
                            name: param.name.clone(),
                            callee: callee_name,
                            loc: Some(loc.clone()),
                        })
                    }
                },
            };
            self.scopes[applied.0].variables.push((param.name.clone(), value));
        }
        for (name, value) in &source.constants {
            let copied = self.rescope_value(value, &mut rs);
            self.scopes[applied.0].constants.push((name.clone(), copied));
        }
        for (name, value) in &source.variables {
            if source.params.iter().any(|p| &p.name == name) {
                continue;
            }
            let copied = self.rescope_value(value, &mut rs);
            self.scopes[applied.0].variables.push((name.clone(), copied));
        }
        self.seal(applied);
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // Rescoping
    // ------------------------------------------------------------------

    fn rescope_value(&mut self, value: &Value, rs: &mut Rescope) -> Value {
        match value {
            Value::Scalar(Scalar::Number(_)) => value.clone(),
            Value::Scalar(Scalar::Str(s)) => Value::Scalar(Scalar::Str(self.rescope_str(s, rs))),
            Value::Ref(r) => Value::Ref(Reference {
                path: r.path.clone(),
                chain: rs.chain(&r.chain),
                loc: r.loc.clone(),
            }),
            Value::Scope(id) => Value::Scope(self.rescope_scope(*id, rs)),
            Value::Runnable(Runnable::Platform(id)) => {
                Value::Runnable(Runnable::Platform(self.rescope_scope(*id, rs)))
            }
            Value::Runnable(Runnable::Embed(id)) => {
                Value::Runnable(Runnable::Embed(self.rescope_scope(*id, rs)))
            }
            Value::Runnable(Runnable::Build(id)) => {
                Value::Runnable(Runnable::Build(self.rescope_scope(*id, rs)))
            }
            Value::Runnable(Runnable::Test(id)) => {
                Value::Runnable(Runnable::Test(self.rescope_scope(*id, rs)))
            }
            Value::Spawn(spawn) => {
                let ranks = spawn
                    .ranks
                    .iter()
                    .map(|r| Rank {
                        program: self.rescope_value(&r.program, rs),
                        args: r.args.iter().map(|a| self.rescope_value(a, rs)).collect(),
                        ranks: r.ranks.as_ref().map(|v| self.rescope_value(v, rs)),
                        ppn: r.ppn.as_ref().map(|v| self.rescope_value(v, rs)),
                        threads: r.threads.as_ref().map(|v| self.rescope_value(v, rs)),
                        hyperthreads: r.hyperthreads.as_ref().map(|v| self.rescope_value(v, rs)),
                        loc: r.loc.clone(),
                    })
                    .collect();
                Value::Spawn(Rc::new(Spawn {
                    ranks,
                    loc: spawn.loc.clone(),
                }))
            }
            Value::Filters(chain) => Value::Filters(Rc::new(self.rescope_ops(chain, rs))),
            Value::Criteria(chain) => Value::Criteria(Rc::new(self.rescope_ops(chain, rs))),
        }
    }

    fn rescope_str(&self, s: &Str, rs: &Rescope) -> Str {
        Str {
            text: s.text.clone(),
            interpolate: s.interpolate,
            chain: rs.chain(&s.chain),
            loc: s.loc.clone(),
        }
    }

    fn rescope_ops(&mut self, chain: &OpChain, rs: &mut Rescope) -> OpChain {
        OpChain {
            ops: chain
                .ops
                .iter()
                .map(|op| Operation {
                    target: self.rescope_value(&op.target, rs),
                    op: op.op.clone(),
                    source: self.rescope_value(&op.source, rs),
                    loc: op.loc.clone(),
                })
                .collect(),
            loc: chain.loc.clone(),
        }
    }

    fn rescope_kind(&mut self, kind: &ScopeKind, rs: &mut Rescope) -> ScopeKind {
        match kind {
            ScopeKind::Task(info) => ScopeKind::Task(TaskInfo {
                kind: info.kind,
                name: info.name.clone(),
                deps: info.deps.iter().map(|d| self.rescope_value(d, rs)).collect(),
            }),
            ScopeKind::Embed(info) => ScopeKind::Embed(EmbedInfo {
                language: info.language.clone(),
                name: info.name.clone(),
                template: info.template.as_ref().map(|t| self.rescope_str(t, rs)),
            }),
            other => other.clone(),
        }
    }

    /// Deep-copies a scope nested inside the rescoped root. Scopes defined
    /// elsewhere keep their identity.
    fn rescope_scope(&mut self, id: ScopeId, rs: &mut Rescope) -> ScopeId {
        if let Some(&done) = rs.map.get(&id) {
            return done;
        }
        let source = self.scopes[id.0].clone();
        if !source.chain.iter().any(|c| rs.map.contains_key(c)) {
            return id;
        }

        let copy = self.create(ScopeKind::Global, rs.chain(&source.chain), source.loc.clone());
        rs.map.insert(id, copy);

        let kind = self.rescope_kind(&source.kind, rs);
        let params: Vec<Param> = source
            .params
            .iter()
            .map(|p| Param {
                name: p.name.clone(),
                default: p.default.as_ref().map(|d| self.rescope_value(d, rs)),
            })
            .collect();
        let constants: Vec<(String, Value)> = source
            .constants
            .iter()
            .map(|(n, v)| (n.clone(), self.rescope_value(v, rs)))
            .collect();
        let variables: Vec<(String, Value)> = source
            .variables
            .iter()
            .map(|(n, v)| (n.clone(), self.rescope_value(v, rs)))
            .collect();

        let scope = &mut self.scopes[copy.0];
        scope.kind = kind;
        scope.params = params;
        scope.constants = constants;
        scope.variables = variables;
        scope.sealed = source.sealed;
        scope.allow_overwrite = source.allow_overwrite;
        copy
    }
}
