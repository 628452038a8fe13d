// src/lexer.rs
//
// =============================================================================
// TDLC: LEXER (v 0.1 )
// =============================================================================
//
// Raw TDL text -> token stream.
//
// Every token carries the file and line it came from. The stream always ends
// with a single `Eof`. Lexing is restartable per file: `load` simply lexes the
// next file with a fresh call.

use crate::error::{Location, Result, TdlError};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or `%`-separated path (`plat%EXECrt`).
    Ident(String),
    Number(f64),
    /// `'...'`: no interpolation.
    Literal(String),
    /// `"..."`: escapes resolved, interpolated at evaluation time.
    Quoted(String),
    /// `[[[ ... ]]]`: raw text, interpolated at evaluation time.
    Block(String),
    /// Dotted operator name, stored without the dots (`.copy.` -> `copy`).
    Operator(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    /// `(/`
    LArray,
    /// `/)`
    RArray,
    Comma,
    Colon,
    Assign,
    EqEq,
    At,
    Eol,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier `{s}`"),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Literal(_) | TokenKind::Quoted(_) => f.write_str("string"),
            TokenKind::Block(_) => f.write_str("[[[ block string ]]]"),
            TokenKind::Operator(op) => write!(f, "operator `.{op}.`"),
            TokenKind::LBrace => f.write_str("`{`"),
            TokenKind::RBrace => f.write_str("`}`"),
            TokenKind::LParen => f.write_str("`(`"),
            TokenKind::RParen => f.write_str("`)`"),
            TokenKind::LArray => f.write_str("`(/`"),
            TokenKind::RArray => f.write_str("`/)`"),
            TokenKind::Comma => f.write_str("`,`"),
            TokenKind::Colon => f.write_str("`:`"),
            TokenKind::Assign => f.write_str("`=`"),
            TokenKind::EqEq => f.write_str("`==`"),
            TokenKind::At => f.write_str("`@`"),
            TokenKind::Eol => f.write_str("end of line"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub file: Arc<str>,
    pub line: u32,
}

impl Token {
    pub fn location(&self) -> Location {
        Location {
            file: self.file.clone(),
            line: self.line,
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Tokenizes one source file.
pub fn lex(src: &str, filename: &str) -> Result<Vec<Token>> {
    let file: Arc<str> = Arc::from(filename);
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut pos = 0usize;
    let mut line: u32 = 1;

    let err = |line: u32, msg: String| TdlError::lexical(Location::new(file.clone(), line), msg);

    macro_rules! push {
        ($kind:expr, $line:expr) => {
            tokens.push(Token {
                kind: $kind,
                file: file.clone(),
                line: $line,
            })
        };
    }

    while pos < chars.len() {
        let c = chars[pos];
        let tok_line = line;

        if c == '\n' {
            if !matches!(tokens.last(), Some(t) if t.kind == TokenKind::Eol) {
                push!(TokenKind::Eol, tok_line);
            }
            line += 1;
            pos += 1;
            continue;
        }

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        // Line comment
        if c == '#' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        // Block string
        if c == '[' && chars.get(pos + 1) == Some(&'[') && chars.get(pos + 2) == Some(&'[') {
            pos += 3;
            let start = pos;
            loop {
                if pos >= chars.len() {
                    return Err(err(tok_line, "unterminated [[[ block string".into()));
                }
                match chars[pos] {
                    ']' if chars.get(pos + 1) == Some(&']') && chars.get(pos + 2) == Some(&']') => {
                        break;
                    }
                    '@' if chars.get(pos + 1) == Some(&'[') => {
                        pos = skip_interpolation(&chars, pos + 2, &mut line)
                            .ok_or_else(|| err(line, "unterminated @[ in block string".into()))?;
                    }
                    '\n' => {
                        line += 1;
                        pos += 1;
                    }
                    _ => pos += 1,
                }
            }
            let text: String = chars[start..pos].iter().collect();
            pos += 3;
            push!(TokenKind::Block(text), tok_line);
            continue;
        }

        // Quoted strings
        if c == '\'' || c == '"' {
            let quote = c;
            pos += 1;
            let mut s = String::new();
            loop {
                let Some(&sc) = chars.get(pos) else {
                    return Err(err(tok_line, "unterminated string literal".into()));
                };
                if sc == quote {
                    pos += 1;
                    break;
                }
                if sc == '\n' {
                    return Err(err(tok_line, "unterminated string literal".into()));
                }
                if sc == '\\' {
                    let Some(&next) = chars.get(pos + 1) else {
                        return Err(err(tok_line, "unterminated escape in string".into()));
                    };
                    match (quote, next) {
                        (_, '\\') => s.push('\\'),
                        (q, n) if n == q => s.push(q),
                        ('"', 'n') => s.push('\n'),
                        ('"', 't') => s.push('\t'),
                        (_, other) => {
                            s.push('\\');
                            s.push(other);
                        }
                    }
                    pos += 2;
                    continue;
                }
                s.push(sc);
                pos += 1;
            }
            let kind = if quote == '\'' {
                TokenKind::Literal(s)
            } else {
                TokenKind::Quoted(s)
            };
            push!(kind, tok_line);
            continue;
        }

        // Number
        let signed =
            (c == '-' || c == '+') && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit());
        if c.is_ascii_digit() || signed {
            let start = pos;
            pos += 1;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            if chars.get(pos) == Some(&'.')
                && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit())
            {
                pos += 1;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            if matches!(chars.get(pos), Some('e') | Some('E')) {
                let mut look = pos + 1;
                if matches!(chars.get(look), Some('+') | Some('-')) {
                    look += 1;
                }
                if chars.get(look).is_some_and(|d| d.is_ascii_digit()) {
                    pos = look;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let n: f64 = text
                .parse()
                .map_err(|_| err(tok_line, format!("invalid number `{text}`")))?;
            push!(TokenKind::Number(n), tok_line);
            continue;
        }

        // Identifier / path
        if is_ident_start(c) {
            let start = pos;
            loop {
                while pos < chars.len() && is_ident_char(chars[pos]) {
                    pos += 1;
                }
                if chars.get(pos) == Some(&'%')
                    && chars.get(pos + 1).is_some_and(|&n| is_ident_start(n))
                {
                    pos += 1;
                    continue;
                }
                break;
            }
            let text: String = chars[start..pos].iter().collect();
            push!(TokenKind::Ident(text), tok_line);
            continue;
        }

        // Operator name: .copy.
        if c == '.' {
            let start = pos + 1;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if end > start && chars.get(end) == Some(&'.') {
                let name: String = chars[start..end].iter().collect();
                pos = end + 1;
                push!(TokenKind::Operator(name), tok_line);
                continue;
            }
            return Err(err(tok_line, "malformed operator name; expected `.name.`".into()));
        }

        let (kind, width) = match (c, chars.get(pos + 1).copied()) {
            ('(', Some('/')) => (TokenKind::LArray, 2),
            ('/', Some(')')) => (TokenKind::RArray, 2),
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('=', _) => (TokenKind::Assign, 1),
            ('@', _) => (TokenKind::At, 1),
            (other, _) => {
                return Err(err(tok_line, format!("unexpected character `{other}`")));
            }
        };
        pos += width;
        push!(kind, tok_line);
    }

    push!(TokenKind::Eof, line);
    Ok(tokens)
}

/// Skips an `@[...]` segment starting just after `@[`.
/// Returns the position after the closing `]`, or `None` if unterminated.
fn skip_interpolation(chars: &[char], mut pos: usize, line: &mut u32) -> Option<usize> {
    if chars.get(pos) == Some(&'\'') {
        pos += 1;
        while *chars.get(pos)? != '\'' {
            if chars[pos] == '\n' {
                *line += 1;
            }
            pos += 1;
        }
        pos += 1;
    }
    while *chars.get(pos)? != ']' {
        if chars[pos] == '\n' {
            *line += 1;
        }
        pos += 1;
    }
    Some(pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src, "t.tdl").unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn paths_numbers_and_punctuation() {
        assert_eq!(
            kinds("x = plat%EXECrt\n(/ a, -2.5e1 /) == @"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Ident("plat%EXECrt".into()),
                TokenKind::Eol,
                TokenKind::LArray,
                TokenKind::Ident("a".into()),
                TokenKind::Comma,
                TokenKind::Number(-25.0),
                TokenKind::RArray,
                TokenKind::EqEq,
                TokenKind::At,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn dotted_names_and_operators() {
        assert_eq!(
            kinds("wcoss.phase1 .copy. 'x'"),
            vec![
                TokenKind::Ident("wcoss.phase1".into()),
                TokenKind::Operator("copy".into()),
                TokenKind::Literal("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#"'it\'s' "a\tb\"c" 'a\nb'"#),
            vec![
                TokenKind::Literal("it's".into()),
                TokenKind::Quoted("a\tb\"c".into()),
                TokenKind::Literal("a\\nb".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn block_strings_span_lines_and_skip_interpolations() {
        let toks = lex("a=[[[ echo @[x]\n # not a comment ]]]\nb=1", "t.tdl").unwrap();
        assert_eq!(
            toks[2].kind,
            TokenKind::Block(" echo @[x]\n # not a comment ".into())
        );
        // `b` sits on line 3 even though the block spanned a newline.
        let b = toks.iter().find(|t| t.kind == TokenKind::Ident("b".into())).unwrap();
        assert_eq!(b.line, 3);

        let toks = kinds("[[[@[']]]']]]]");
        assert_eq!(toks[0], TokenKind::Block("@[']]]']".into()));
    }

    #[test]
    fn comments_and_blank_lines_collapse() {
        assert_eq!(
            kinds("# header\n\n\nx # trailing\n"),
            vec![
                TokenKind::Eol,
                TokenKind::Ident("x".into()),
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn bad_character_reports_line() {
        let e = lex("a = 1\nb = $", "suite.tdl").unwrap_err();
        assert_eq!(e.to_string(), "suite.tdl:2: lexical error: unexpected character `$`");
    }

    #[test]
    fn unterminated_block_is_an_error() {
        assert!(lex("x = [[[ never closed", "t.tdl").is_err());
    }
}
