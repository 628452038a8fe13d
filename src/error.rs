// src/error.rs
//
// =============================================================================
// TDLC: ERROR TAXONOMY (v 0.1 )
// =============================================================================
//
// Every failure the compiler can report. All of them are fatal: the compiler
// never continues past the first error and never writes partial output.
//
// Messages are prefixed with `file:line:` whenever the origin is known, so the
// CLI can print them verbatim as a single diagnostic line.

use std::fmt;
use std::sync::Arc;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, TdlError>;

/// A position in a TDL source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: Arc<str>,
    pub line: u32,
}

impl Location {
    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Location used for values synthesized by the compiler itself.
    pub fn internal() -> Self {
        Self::new("<internal>", 0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

fn at(loc: &Option<Location>) -> String {
    match loc {
        Some(l) => format!("{l}: "),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TdlError {
    /// Unrecognized character or unterminated literal.
    #[error("{loc}: lexical error: {message}")]
    Lexical { loc: Location, message: String },

    /// Malformed construct, missing required step, misplaced `load`/`run`.
    #[error("{loc}: parse error: {message}")]
    Parse { loc: Location, message: String },

    #[error("{}name not found: {path}", at(.loc))]
    NameNotFound { path: String, loc: Option<Location> },

    #[error("{}unknown argument `{name}` in call to `{callee}`", at(.loc))]
    UnknownArgument {
        name: String,
        callee: String,
        loc: Option<Location>,
    },

    #[error("{}missing argument `{name}` in call to `{callee}`", at(.loc))]
    MissingArgument {
        name: String,
        callee: String,
        loc: Option<Location>,
    },

    /// A value was used in a way its kind does not support.
    #[error("{}{message}", at(.loc))]
    Evaluation {
        message: String,
        loc: Option<Location>,
    },

    /// Mutation of a scope after it was sealed. Always a compiler bug.
    #[error("internal error: scope `{scope}` is sealed and cannot be modified")]
    ScopeSealed { scope: String },

    #[error("{}platform detection failed: {message}", at(.loc))]
    PlatformDetection {
        message: String,
        loc: Option<Location>,
    },

    #[error("set arithmetic: {message}")]
    SetArithmetic { message: String },

    #[error("{}resource layout: {message}", at(.loc))]
    ResourceLayout {
        message: String,
        loc: Option<Location>,
    },

    #[error("dependency cycle: {}", .members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    #[error("{}code generation: {message}", at(.loc))]
    Generation {
        message: String,
        loc: Option<Location>,
    },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TdlError {
    pub fn lexical(loc: Location, message: impl Into<String>) -> Self {
        Self::Lexical {
            loc,
            message: message.into(),
        }
    }

    pub fn parse(loc: Location, message: impl Into<String>) -> Self {
        Self::Parse {
            loc,
            message: message.into(),
        }
    }

    pub fn eval(message: impl Into<String>, loc: Option<&Location>) -> Self {
        Self::Evaluation {
            message: message.into(),
            loc: loc.cloned(),
        }
    }

    pub fn generation(message: impl Into<String>, loc: Option<&Location>) -> Self {
        Self::Generation {
            message: message.into(),
            loc: loc.cloned(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attaches a location to errors that were raised without one.
    ///
    /// Errors that already carry a location keep it: the innermost origin is
    /// the most useful one for the user.
    pub fn or_at(mut self, here: &Location) -> Self {
        match &mut self {
            Self::NameNotFound { loc, .. }
            | Self::UnknownArgument { loc, .. }
            | Self::MissingArgument { loc, .. }
            | Self::Evaluation { loc, .. }
            | Self::PlatformDetection { loc, .. }
            | Self::ResourceLayout { loc, .. }
            | Self::Generation { loc, .. } => {
                if loc.is_none() {
                    *loc = Some(here.clone());
                }
            }
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_file_and_line() {
        let e = TdlError::parse(Location::new("suite.tdl", 12), "expected `}`");
        assert_eq!(e.to_string(), "suite.tdl:12: parse error: expected `}`");

        let e = TdlError::NameNotFound {
            path: "plat%EXEC".into(),
            loc: None,
        }
        .or_at(&Location::new("a.tdl", 3));
        assert_eq!(e.to_string(), "a.tdl:3: name not found: plat%EXEC");
    }

    #[test]
    fn existing_location_wins() {
        let e = TdlError::eval("bad", Some(&Location::new("inner.tdl", 1)))
            .or_at(&Location::new("outer.tdl", 9));
        assert_eq!(e.to_string(), "inner.tdl:1: bad");
    }
}
