//! Minimal S-expression support for the KiCad text formats: a parser for
//! whole documents (library tables, small queries) and quote-aware byte-span
//! scanning for the surgical text edits the merge engine performs.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SexpError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unclosed string literal")]
    UnclosedString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SExp {
    Atom(String),
    List(Vec<SExp>),
}

impl SExp {
    pub fn parse(input: &str) -> Result<SExp, SexpError> {
        let mut parser = Parser {
            chars: input.chars().collect(),
            pos: 0,
        };
        parser.skip_whitespace();
        let expr = parser.parse_expr()?;
        Ok(expr)
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            SExp::Atom(value) => Some(value.as_str()),
            SExp::List(_) => None,
        }
    }

    pub fn items(&self) -> &[SExp] {
        match self {
            SExp::Atom(_) => &[],
            SExp::List(items) => items,
        }
    }

    /// First atom of a list, the conventional node tag.
    pub fn tag(&self) -> Option<&str> {
        self.items().first().and_then(SExp::as_atom)
    }

    /// Child lists tagged `tag`, e.g. every `(lib …)` inside a lib table.
    pub fn children<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a SExp> {
        self.items()
            .iter()
            .filter(move |child| child.tag() == Some(tag))
    }

    /// Value atom of a `(key "value")` style child, if present. Iterates the
    /// items directly so the returned borrow is tied to `self`, not the tag.
    pub fn child_value(&self, tag: &str) -> Option<&str> {
        self.items()
            .iter()
            .find(|child| child.tag() == Some(tag))
            .and_then(|child| child.items().get(1))
            .and_then(SExp::as_atom)
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(ch) if ch.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_expr(&mut self) -> Result<SExp, SexpError> {
        match self.peek() {
            Some('(') => self.parse_list(),
            Some('"') => self.parse_string(),
            Some(')') => Err(SexpError::UnexpectedChar(')')),
            Some(_) => self.parse_symbol(),
            None => Err(SexpError::UnexpectedEof),
        }
    }

    fn parse_list(&mut self) -> Result<SExp, SexpError> {
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(')') => {
                    self.advance();
                    return Ok(SExp::List(items));
                }
                Some(_) => items.push(self.parse_expr()?),
                None => return Err(SexpError::UnexpectedEof),
            }
        }
    }

    fn parse_string(&mut self) -> Result<SExp, SexpError> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(SExp::Atom(value)),
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(escaped) => value.push(escaped),
                    None => return Err(SexpError::UnclosedString),
                },
                Some(ch) => value.push(ch),
                None => return Err(SexpError::UnclosedString),
            }
        }
    }

    fn parse_symbol(&mut self) -> Result<SExp, SexpError> {
        let mut value = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || ch == '(' || ch == ')' || ch == '"' {
                break;
            }
            value.push(ch);
            self.pos += 1;
        }
        if value.is_empty() {
            return Err(SexpError::UnexpectedEof);
        }
        Ok(SExp::Atom(value))
    }
}

impl fmt::Display for SExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExp::Atom(value) => {
                let needs_quotes = value.is_empty()
                    || value
                        .chars()
                        .any(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '"'));
                if needs_quotes {
                    write!(f, "\"")?;
                    for ch in value.chars() {
                        match ch {
                            '"' => write!(f, "\\\"")?,
                            '\\' => write!(f, "\\\\")?,
                            other => write!(f, "{other}")?,
                        }
                    }
                    write!(f, "\"")
                } else {
                    write!(f, "{value}")
                }
            }
            SExp::List(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Half-open byte range of one sub-expression within a larger document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Byte offset of the `)` matching the `(` at `open`. Parens inside quoted
/// strings never unbalance the scan.
pub fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[open..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Span of the first depth-1 entry `(keyword …)` inside the document's
/// outermost list, optionally requiring its first argument to equal `name`.
/// Nested lists with the same keyword (e.g. the sub-symbols of a symbol) are
/// not considered.
pub fn find_entry_span(text: &str, keyword: &str, name: Option<&str>) -> Option<Span> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut pos = 0usize;
    while pos < bytes.len() {
        let byte = bytes[pos];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            pos += 1;
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'(' => {
                if depth == 1 && entry_matches(text, pos, keyword, name) {
                    let close = matching_paren(text, pos)?;
                    return Some(Span {
                        start: pos,
                        end: close + 1,
                    });
                }
                depth += 1;
            }
            b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
        pos += 1;
    }
    None
}

/// All depth-1 entries `(keyword …)` inside the document's outermost list,
/// in document order. Each found entry is skipped wholesale, so its nested
/// lists are never revisited.
pub fn entry_spans(text: &str, keyword: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut pos = 0usize;
    while pos < bytes.len() {
        let byte = bytes[pos];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            pos += 1;
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'(' => {
                if depth == 1 && entry_matches(text, pos, keyword, None) {
                    if let Some(close) = matching_paren(text, pos) {
                        spans.push(Span {
                            start: pos,
                            end: close + 1,
                        });
                        pos = close + 1;
                        continue;
                    }
                }
                depth += 1;
            }
            b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
        pos += 1;
    }
    spans
}

fn entry_matches(text: &str, open: usize, keyword: &str, name: Option<&str>) -> bool {
    let rest = &text[open + 1..];
    let rest = rest.trim_start();
    if !rest.starts_with(keyword) {
        return false;
    }
    let after = &rest[keyword.len()..];
    if !after.starts_with(|ch: char| ch.is_whitespace() || ch == '(' || ch == ')') {
        return false;
    }
    let Some(expected) = name else {
        return true;
    };
    bare_or_quoted_token(after.trim_start()).is_some_and(|token| token == expected)
}

/// Reads one token at the start of `text`: the contents of a quoted string,
/// or a run of non-delimiter characters.
fn bare_or_quoted_token(text: &str) -> Option<&str> {
    if let Some(rest) = text.strip_prefix('"') {
        let mut escaped = false;
        for (idx, ch) in rest.char_indices() {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                return Some(&rest[..idx]);
            }
        }
        return None;
    }
    let end = text
        .find(|ch: char| ch.is_whitespace() || matches!(ch, '(' | ')' | '"'))
        .unwrap_or(text.len());
    if end == 0 {
        None
    } else {
        Some(&text[..end])
    }
}

/// First argument of an entry: for `(keyword "NAME" …)` or `(keyword NAME …)`
/// returns `NAME`. `entry` must start at the opening paren.
pub fn first_argument(entry: &str) -> Option<&str> {
    let rest = entry.strip_prefix('(')?.trim_start();
    let keyword_end = rest
        .find(|ch: char| ch.is_whitespace() || matches!(ch, '(' | ')' | '"'))
        .unwrap_or(rest.len());
    bare_or_quoted_token(rest[keyword_end..].trim_start())
}

/// Byte offset of the document's final closing paren.
pub fn final_close_paren(text: &str) -> Option<usize> {
    text.rfind(')')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_lists() {
        let expr = SExp::parse("(a (b c) \"d e\")").unwrap();
        assert_eq!(expr.tag(), Some("a"));
        assert_eq!(expr.items().len(), 3);
        assert_eq!(expr.items()[2].as_atom(), Some("d e"));
    }

    #[test]
    fn parses_escaped_strings() {
        let expr = SExp::parse(r#"(descr "a \"b\" c")"#).unwrap();
        assert_eq!(expr.items()[1].as_atom(), Some("a \"b\" c"));
    }

    #[test]
    fn rejects_unbalanced_input() {
        assert_eq!(SExp::parse("(a (b)").unwrap_err(), SexpError::UnexpectedEof);
        assert_eq!(
            SExp::parse(")").unwrap_err(),
            SexpError::UnexpectedChar(')')
        );
    }

    #[test]
    fn display_round_trips_and_quotes_where_needed() {
        // Quoting is driven by content, not by how the source spelled the
        // atom: values with whitespace or parens re-print quoted, plain
        // values print bare. Both survive a re-parse unchanged.
        let expr = SExp::parse("(lib (uri \"${DIR}/4xxx.kicad_sym\") (descr \"quad (4x) gate\"))")
            .unwrap();
        let printed = expr.to_string();
        assert_eq!(SExp::parse(&printed).unwrap(), expr);
        assert!(printed.contains("${DIR}/4xxx.kicad_sym"));
        assert!(printed.contains("\"quad (4x) gate\""));
    }

    #[test]
    fn child_value_reads_key_value_pairs() {
        let expr = SExp::parse("(lib (name \"Octopart\") (type \"KiCad\"))").unwrap();
        assert_eq!(expr.child_value("name"), Some("Octopart"));
        assert_eq!(expr.child_value("uri"), None);
    }

    #[test]
    fn child_value_borrow_outlives_the_tag() {
        let expr = SExp::parse("(lib (name \"Octopart\"))").unwrap();
        let value = {
            let tag = String::from("name");
            expr.child_value(&tag)
        };
        assert_eq!(value, Some("Octopart"));
    }

    #[test]
    fn matching_paren_ignores_parens_in_strings() {
        let text = r#"(symbol "FOO(1)" (pin "a)b"))"#;
        let close = matching_paren(text, 0).unwrap();
        assert_eq!(close, text.len() - 1);
    }

    #[test]
    fn find_entry_span_skips_nested_symbols() {
        let text = concat!(
            "(kicad_symbol_lib (version 20211014)\n",
            "  (symbol \"FOO\" (in_bom yes)\n",
            "    (symbol \"FOO_0_1\" (rectangle))\n",
            "  )\n",
            "  (symbol \"BAR\" (in_bom yes))\n",
            ")\n",
        );
        let span = find_entry_span(text, "symbol", Some("BAR")).unwrap();
        assert!(text[span.start..span.end].starts_with("(symbol \"BAR\""));
        assert!(text[span.start..span.end].ends_with(')'));

        let first = find_entry_span(text, "symbol", None).unwrap();
        assert!(text[first.start..first.end].contains("FOO_0_1"));
        assert!(text[first.start..first.end].starts_with("(symbol \"FOO\""));
    }

    #[test]
    fn find_entry_span_requires_full_keyword() {
        let text = "(root (symbols (a)) (symbol \"X\"))";
        let span = find_entry_span(text, "symbol", None).unwrap();
        assert_eq!(&text[span.start..span.end], "(symbol \"X\")");
    }

    #[test]
    fn first_argument_handles_quoted_and_bare_names() {
        assert_eq!(first_argument("(symbol \"FOO 1\" (pin))"), Some("FOO 1"));
        assert_eq!(first_argument("(module REL-16 (layer))"), Some("REL-16"));
        assert_eq!(first_argument("(kicad_symbol_lib)"), None);
    }

    #[test]
    fn entry_spans_lists_top_level_entries_only() {
        let text = concat!(
            "(kicad_symbol_lib\n",
            "  (symbol \"FOO\" (symbol \"FOO_0_1\" (rectangle)))\n",
            "  (symbol \"BAR\")\n",
            ")\n",
        );
        let spans = entry_spans(text, "symbol");
        assert_eq!(spans.len(), 2);
        assert!(text[spans[0].start..spans[0].end].starts_with("(symbol \"FOO\""));
        assert!(text[spans[1].start..spans[1].end].starts_with("(symbol \"BAR\""));
    }
}
