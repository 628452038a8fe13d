// src/model/interp.rs
//
// Text conversion and `@[...]` interpolation.
//
//   @[@]        a literal `@`
//   @['text']   `text`, verbatim
//   @[path]     the text of the value `path` resolves to
//
// Interpolation is lazy: it runs only when generated output needs the text.

use super::{Arena, Scalar, ScopeId, Value, MAX_DEPTH};
use crate::error::{Location, Result, TdlError};

/// Integral numbers print without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl Arena {
    /// The text of a scalar (or of a reference to one).
    pub fn text(&self, value: &Value) -> Result<String> {
        self.text_depth(value, 0)
    }

    /// Interpolates `text` against `chain`.
    pub fn interpolate(&self, text: &str, chain: &[ScopeId], loc: &Location) -> Result<String> {
        self.interpolate_depth(text, chain, loc, 0)
    }

    /// A non-negative whole number, e.g. a rank count.
    pub fn whole_number(&self, value: &Value, what: &str) -> Result<u32> {
        let text = self.text(value)?;
        let loc = value.location();
        let n: f64 = text.trim().parse().map_err(|_| {
            TdlError::eval(format!("{what} must be a number, not `{text}`"), loc)
        })?;
        if n < 0.0 || n.fract() != 0.0 || n > f64::from(u32::MAX) {
            return Err(TdlError::eval(
                format!("{what} must be a non-negative whole number, not `{text}`"),
                loc,
            ));
        }
        Ok(n as u32)
    }

    fn text_depth(&self, value: &Value, depth: usize) -> Result<String> {
        if depth > MAX_DEPTH {
            return Err(TdlError::eval(
                "interpolation nested too deeply (reference loop?)",
                value.location(),
            ));
        }
        match value {
            Value::Scalar(Scalar::Number(n)) => Ok(format_number(*n)),
            Value::Scalar(Scalar::Str(s)) if s.interpolate => {
                self.interpolate_depth(&s.text, &s.chain, &s.loc, depth + 1)
            }
            Value::Scalar(Scalar::Str(s)) => Ok(s.text.to_string()),
            Value::Ref(r) => {
                let target = self
                    .resolve_depth(&r.path, &r.chain, depth + 1)
                    .map_err(|e| e.or_at(&r.loc))?;
                self.text_depth(&target, depth + 1)
            }
            other => Err(TdlError::eval(
                format!("a {} cannot be used as text", other.kind_name()),
                other.location(),
            )),
        }
    }

    fn interpolate_depth(
        &self,
        text: &str,
        chain: &[ScopeId],
        loc: &Location,
        depth: usize,
    ) -> Result<String> {
        let unterminated = || TdlError::eval("unterminated `@[` in string", Some(loc));
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("@[") {
            out.push_str(&rest[..start]);
            let body = &rest[start + 2..];

            if let Some(quoted) = body.strip_prefix('\'') {
                let end = quoted.find('\'').ok_or_else(unterminated)?;
                out.push_str(&quoted[..end]);
                rest = quoted[end + 1..].strip_prefix(']').ok_or_else(|| {
                    TdlError::eval("expected `]` after quoted text in `@['...']`", Some(loc))
                })?;
                continue;
            }

            let close = body.find(']').ok_or_else(unterminated)?;
            let path = body[..close].trim();
            match path {
                "@" => out.push('@'),
                "" => return Err(TdlError::eval("empty `@[]` in string", Some(loc))),
                _ => {
                    let value = self
                        .resolve_depth(path, chain, depth + 1)
                        .map_err(|e| e.or_at(loc))?;
                    out.push_str(&self.text_depth(&value, depth + 1)?);
                }
            }
            rest = &body[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScopeKind;

    fn loc() -> Location {
        Location::new("t.tdl", 4)
    }

    fn setup() -> (Arena, ScopeId) {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        arena.define_variable(g, "name", Value::literal("fv3", loc()), &loc()).unwrap();
        arena.define_variable(g, "n", Value::number(12.0), &loc()).unwrap();
        (arena, g)
    }

    #[test]
    fn numbers_print_without_trailing_zero() {
        assert_eq!(format_number(12.0), "12");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.25), "0.25");
    }

    #[test]
    fn interpolation_forms() {
        let (arena, g) = setup();
        let out = arena
            .interpolate("@[name] x@[n] @[@] @['@[raw]']", &[g], &loc())
            .unwrap();
        assert_eq!(out, "fv3 x12 @ @[raw]");
        // A bare `@` is not special.
        assert_eq!(arena.interpolate("a@b", &[g], &loc()).unwrap(), "a@b");
    }

    #[test]
    fn interpolation_errors_carry_location() {
        let (arena, g) = setup();
        let err = arena.interpolate("x @[name", &[g], &loc()).unwrap_err();
        assert!(err.to_string().starts_with("t.tdl:4:"));
        let err = arena.interpolate("@[nope]", &[g], &loc()).unwrap_err();
        assert_eq!(err.to_string(), "t.tdl:4: name not found: nope");
    }

    #[test]
    fn self_reference_is_reported_not_overflowed() {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        let h = arena.create(ScopeKind::Hash { name: "h".into() }, vec![g], loc());
        arena
            .define_variable(h, "x", Value::interpolated("@[x]", vec![h, g], loc()), &loc())
            .unwrap();
        let v = arena.resolve_in(h, "x").unwrap();
        assert!(arena.text(&v).is_err());
    }

    #[test]
    fn whole_numbers() {
        let (arena, _) = setup();
        assert_eq!(arena.whole_number(&Value::number(4.0), "ranks").unwrap(), 4);
        assert!(arena.whole_number(&Value::number(1.5), "ranks").is_err());
        assert!(arena
            .whole_number(&Value::literal("many", loc()), "ranks")
            .is_err());
    }
}
