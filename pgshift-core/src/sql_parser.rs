//! Statement splitting and comment handling for migration SQL.
//!
//! Used by the executor (numbered, one-at-a-time execution) and by the
//! offline replay.

use std::sync::LazyLock;

use regex_lite::Regex;

static CONCURRENTLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:CREATE\s+(?:UNIQUE\s+)?INDEX|DROP\s+INDEX|REINDEX(?:\s+\w+)*|REFRESH\s+MATERIALIZED\s+VIEW)\s+CONCURRENTLY\b").unwrap()
});

static NON_TRANSACTIONAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:VACUUM|CREATE\s+DATABASE|DROP\s+DATABASE|ALTER\s+SYSTEM|CREATE\s+TABLESPACE|DROP\s+TABLESPACE)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Code,
    Comment,
    /// String literal, quoted identifier or dollar-quoted body.
    Quoted,
}

/// Walks SQL text as byte ranges of code, comments and quoted text.
struct Lexer<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a str) -> Self {
        Lexer { sql, pos: 0 }
    }
}

impl Iterator for Lexer<'_> {
    type Item = (Lexeme, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.sql.as_bytes();
        let start = self.pos;
        if start >= bytes.len() {
            return None;
        }
        let next = bytes.get(start + 1).copied();
        let (kind, end) = match bytes[start] {
            b'-' if next == Some(b'-') => (Lexeme::Comment, line_end(bytes, start)),
            b'/' if next == Some(b'*') => (Lexeme::Comment, block_comment_end(bytes, start)),
            b'\'' => (
                Lexeme::Quoted,
                quoted_end(bytes, start, b'\'', is_escape_string(bytes, start)),
            ),
            b'"' => (Lexeme::Quoted, quoted_end(bytes, start, b'"', false)),
            b'$' => match dollar_tag(self.sql, start) {
                Some(tag) => (Lexeme::Quoted, dollar_end(self.sql, start, tag)),
                None => (Lexeme::Code, code_end(bytes, start + 1)),
            },
            _ => (Lexeme::Code, code_end(bytes, start + 1)),
        };
        self.pos = end;
        Some((kind, start, end))
    }
}

fn code_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        match bytes[i] {
            b'\'' | b'"' | b'$' => break,
            b'-' if next == Some(b'-') => break,
            b'/' if next == Some(b'*') => break,
            _ => i += 1,
        }
    }
    i
}

fn line_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p)
}

/// Block comments nest in PostgreSQL.
fn block_comment_end(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `E'...'` strings allow backslash escapes.
fn is_escape_string(bytes: &[u8], quote: usize) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    quote > 0
        && matches!(bytes[quote - 1], b'E' | b'e')
        && (quote < 2 || !is_word(bytes[quote - 2]))
}

/// End of a quoted run; a doubled quote is an escaped quote.
fn quoted_end(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
        } else if b == quote && bytes.get(i + 1) == Some(&quote) {
            i += 2;
        } else if b == quote {
            return i + 1;
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// The `$tag$` opening at `start`, if any. Tags cannot start with a digit,
/// which keeps `$1` parameters out.
fn dollar_tag(sql: &str, start: usize) -> Option<&str> {
    let rest = &sql[start + 1..];
    let len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if rest.as_bytes().first().is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    (rest.as_bytes().get(len) == Some(&b'$')).then(|| &sql[start..start + len + 2])
}

fn dollar_end(sql: &str, start: usize, tag: &str) -> usize {
    let body = start + tag.len();
    sql[body..]
        .find(tag)
        .map_or(sql.len(), |p| body + p + tag.len())
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, chunk: &'a str) {
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        out.push(chunk);
    }
}

/// Split SQL on top-level semicolons. Semicolons inside literals, quoted
/// identifiers, dollar-quoted bodies and comments do not count.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    for (kind, from, to) in Lexer::new(sql) {
        if kind != Lexeme::Code {
            continue;
        }
        for (offset, _) in sql[from..to].match_indices(';') {
            push_trimmed(&mut statements, &sql[start..from + offset]);
            start = from + offset + 1;
        }
    }
    push_trimmed(&mut statements, &sql[start..]);
    statements
}

/// Remove `--` and `/* */` comments outside of literals, keeping everything else.
/// Block comments become a single space.
pub fn strip_comments(sql: &str) -> String {
    Lexer::new(sql)
        .map(|(kind, from, to)| match kind {
            Lexeme::Comment if sql[from..].starts_with("/*") => " ",
            Lexeme::Comment => "",
            _ => &sql[from..to],
        })
        .collect()
}

/// True when a chunk holds nothing but comments and whitespace.
pub fn is_comment_only(stmt: &str) -> bool {
    strip_comments(stmt).trim().is_empty()
}

/// Split a migration into the statements that actually reach the server.
///
/// Comment-only chunks are dropped, so the position of a statement in
/// the returned list is its 1-based statement number minus one.
pub fn executable_statements(sql: &str) -> Vec<&str> {
    split_statements(sql)
        .into_iter()
        .filter(|s| !is_comment_only(s))
        .collect()
}

/// Return the first statement that PostgreSQL refuses to run inside a transaction block.
pub fn find_non_transactional(sql: &str) -> Option<String> {
    executable_statements(sql).into_iter().find_map(|stmt| {
        let code = strip_comments(stmt);
        if CONCURRENTLY_RE.is_match(&code) || NON_TRANSACTIONAL_RE.is_match(&code) {
            Some(code.trim().to_string())
        } else {
            None
        }
    })
}
