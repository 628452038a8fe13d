// src/setarith.rs
//
// =============================================================================
// TDLC: SET ARITHMETIC (v 0.1 )
// =============================================================================
//
// The selection sub-language used by `--select` and by run-set guards.
//
//   expr := name
//         | '{' name (',' name)* '}'
//         | ('union' | 'inter' | 'minus') '(' [expr (',' expr)*] ')'
//
// A name is a run-set, an element (runnable name) or `*` (every element).
// When a name is both, the set wins.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TdlError};

pub type NameSet = BTreeSet<String>;

#[derive(Debug, Clone, Default)]
pub struct SetCatalog {
    sets: BTreeMap<String, NameSet>,
    elements: NameSet,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' | '}' | '(' | ')' | ',' => {
                chars.next();
                toks.push(match c {
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    _ => Tok::Comma,
                });
            }
            c if c.is_alphanumeric() || "_.%*-".contains(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || "_.%*-".contains(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Name(name));
            }
            other => {
                return Err(TdlError::SetArithmetic {
                    message: format!("unexpected character `{other}` in `{expr}`"),
                })
            }
        }
    }
    Ok(toks)
}

struct Eval<'a> {
    catalog: &'a SetCatalog,
    toks: Vec<Tok>,
    pos: usize,
    src: &'a str,
}

impl Eval<'_> {
    fn err(&self, message: impl std::fmt::Display) -> TdlError {
        TdlError::SetArithmetic {
            message: format!("{message} in `{}`", self.src),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<NameSet> {
        match self.advance() {
            Some(Tok::LBrace) => {
                let mut out = NameSet::new();
                loop {
                    match self.advance() {
                        Some(Tok::Name(n)) => out.extend(self.catalog.lookup(&n)?),
                        _ => return Err(self.err("expected a name inside `{ }`")),
                    }
                    match self.advance() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RBrace) => return Ok(out),
                        _ => return Err(self.err("expected `,` or `}`")),
                    }
                }
            }
            Some(Tok::Name(n)) if self.peek() == Some(&Tok::LParen) => {
                self.advance();
                let args = self.args()?;
                let mut args = args.into_iter();
                match n.as_str() {
                    "union" => Ok(args.flatten().collect()),
                    "inter" => Ok(args
                        .reduce(|acc, s| acc.intersection(&s).cloned().collect())
                        .unwrap_or_default()),
                    "minus" => Ok(args
                        .reduce(|acc, s| acc.difference(&s).cloned().collect())
                        .unwrap_or_default()),
                    other => Err(self.err(format!(
                        "unknown operator `{other}` (expected union, inter or minus)"
                    ))),
                }
            }
            Some(Tok::Name(n)) => self.catalog.lookup(&n),
            _ => Err(self.err("expected a set expression")),
        }
    }

    fn args(&mut self) -> Result<Vec<NameSet>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Tok::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.advance() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => return Ok(args),
                _ => return Err(self.err("expected `,` or `)`")),
            }
        }
    }
}

impl SetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runnable name as an element of the universal set.
    pub fn add_element(&mut self, element: &str) {
        self.elements.insert(element.to_string());
    }

    /// Adds `element` to the named run-set (and to the universe).
    pub fn add_to_set(&mut self, set: &str, element: &str) {
        self.add_element(element);
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(element.to_string());
    }

    pub fn elements(&self) -> &NameSet {
        &self.elements
    }

    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    fn lookup(&self, name: &str) -> Result<NameSet> {
        if name == "*" {
            return Ok(self.elements.clone());
        }
        if let Some(set) = self.sets.get(name) {
            return Ok(set.clone());
        }
        if self.elements.contains(name) {
            return Ok(NameSet::from([name.to_string()]));
        }
        let valid: Vec<&str> = self
            .sets
            .keys()
            .chain(self.elements.iter())
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Err(TdlError::SetArithmetic {
            message: format!(
                "unknown set or element `{name}`; valid names: *, {}",
                valid.join(", ")
            ),
        })
    }

    /// Evaluates a selection expression. Blank input selects everything.
    pub fn evaluate(&self, expr: &str) -> Result<NameSet> {
        if expr.trim().is_empty() {
            return Ok(self.elements.clone());
        }
        let mut eval = Eval {
            catalog: self,
            toks: tokenize(expr)?,
            pos: 0,
            src: expr,
        };
        let result = eval.expr()?;
        if eval.pos < eval.toks.len() {
            return Err(eval.err("trailing input after expression"));
        }
        log::debug!("selection `{expr}` -> {} runnable(s)", result.len());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn catalog() -> SetCatalog {
        let mut c = SetCatalog::new();
        for t in ["a", "b", "c", "d"] {
            c.add_element(t);
        }
        c.add_to_set("fast", "a");
        c.add_to_set("fast", "b");
        c.add_to_set("gnu", "b");
        c.add_to_set("gnu", "c");
        c
    }

    fn names(items: &[&str]) -> NameSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn basic_forms() {
        let c = catalog();
        assert_eq!(c.evaluate("fast").unwrap(), names(&["a", "b"]));
        assert_eq!(c.evaluate("{a, d}").unwrap(), names(&["a", "d"]));
        assert_eq!(c.evaluate("*").unwrap(), names(&["a", "b", "c", "d"]));
        assert_eq!(c.evaluate("   ").unwrap(), names(&["a", "b", "c", "d"]));
        assert_eq!(c.evaluate("union(fast, gnu)").unwrap(), names(&["a", "b", "c"]));
        assert_eq!(c.evaluate("inter(fast,gnu)").unwrap(), names(&["b"]));
        assert_eq!(c.evaluate("minus(*, fast, {c})").unwrap(), names(&["d"]));
    }

    #[test]
    fn empty_operator_calls_are_empty() {
        let c = catalog();
        assert!(c.evaluate("union()").unwrap().is_empty());
        assert!(c.evaluate("inter()").unwrap().is_empty());
    }

    #[test]
    fn set_name_shadows_element_name() {
        let mut c = catalog();
        c.add_to_set("a", "d");
        assert_eq!(c.evaluate("a").unwrap(), names(&["d"]));
    }

    #[test]
    fn unknown_names_list_the_valid_ones() {
        let err = catalog().evaluate("union(fast, nope)").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("`nope`"), "{msg}");
        assert!(msg.contains("fast, gnu"), "{msg}");
    }

    #[test]
    fn malformed_expressions_fail() {
        let c = catalog();
        assert!(c.evaluate("union(fast").is_err());
        assert!(c.evaluate("{a,}").is_err());
        assert!(c.evaluate("fast gnu").is_err());
        assert!(c.evaluate("xor(fast)").is_err());
    }

    fn subset_expr(mask: &[bool]) -> String {
        let picked: Vec<&str> = ["a", "b", "c", "d"]
            .iter()
            .zip(mask)
            .filter(|(_, m)| **m)
            .map(|(n, _)| *n)
            .collect();
        if picked.is_empty() {
            "union()".to_string()
        } else {
            format!("{{{}}}", picked.join(","))
        }
    }

    proptest! {
        #[test]
        fn set_laws(x in prop::collection::vec(any::<bool>(), 4),
                    y in prop::collection::vec(any::<bool>(), 4)) {
            let c = catalog();
            let (ex, ey) = (subset_expr(&x), subset_expr(&y));
            let sx = c.evaluate(&ex).unwrap();
            let sy = c.evaluate(&ey).unwrap();

            let u1 = c.evaluate(&format!("union({ex},{ey})")).unwrap();
            let u2 = c.evaluate(&format!("union({ey},{ex})")).unwrap();
            prop_assert_eq!(&u1, &u2);

            let i = c.evaluate(&format!("inter({ex},{ey})")).unwrap();
            prop_assert!(i.is_subset(&sx) && i.is_subset(&sy));

            let m = c.evaluate(&format!("minus({ex},{ey})")).unwrap();
            prop_assert!(m.is_disjoint(&sy));
            prop_assert!(m.is_subset(&sx));

            let rebuilt: NameSet = m.union(&i).cloned().collect();
            prop_assert_eq!(rebuilt, sx);
        }
    }
}
