//! Recursive-descent parser for catalog-rendered index DDL
//! (`pg_get_indexdef()` output and hand-written `CREATE INDEX`).
//!
//! The lexer and the balanced-paren / top-level-comma helpers are shared
//! with the offline migration replay.

use crate::db::RESERVED_KEYWORDS;
use crate::error::{PgshiftError, Result};
use crate::model::{Index, IndexColumnOrder, IndexTarget, NullsOrder, SortDirection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Unquoted identifier or key word, as written.
    Word(String),
    /// `"quoted identifier"` with `""` unescaped.
    Quoted(String),
    /// `'string literal'` with `''` unescaped.
    Str(String),
    Number(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    /// Any other run of operator characters (`::`, `=`, `>=`, ...).
    Op(String),
}

impl Token {
    /// Case-insensitive key word check; quoted identifiers never match.
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    /// Identifier text: folded to lower case when unquoted, verbatim when quoted.
    pub fn identifier(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_lowercase()),
            Token::Quoted(q) => Some(q.clone()),
            _ => None,
        }
    }
}

/// A token with its byte span in the source.
#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Split SQL text into tokens, respecting quotes.
pub fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        let start = i;
        let token = match c {
            b if b.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                Token::LParen
            }
            b')' => {
                i += 1;
                Token::RParen
            }
            b',' => {
                i += 1;
                Token::Comma
            }
            b'.' if !(i + 1 < len && bytes[i + 1].is_ascii_digit()) => {
                i += 1;
                Token::Dot
            }
            b';' => {
                i += 1;
                Token::Semicolon
            }
            b'"' => {
                let (text, next) = read_quoted(src, i, b'"')?;
                i = next;
                Token::Quoted(text)
            }
            b'\'' => {
                let (text, next) = read_quoted(src, i, b'\'')?;
                i = next;
                Token::Str(text)
            }
            b if b.is_ascii_digit() || b == b'.' => {
                while i < len && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                Token::Number(src[start..i].to_string())
            }
            b if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 => {
                while i < len
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'$'
                        || bytes[i] >= 0x80)
                {
                    i += 1;
                }
                Token::Word(src[start..i].to_string())
            }
            _ => {
                while i < len && is_operator_byte(bytes[i]) {
                    i += 1;
                }
                if i == start {
                    return Err(PgshiftError::DdlParseError(format!(
                        "unexpected character '{}' at offset {}",
                        c as char, start
                    )));
                }
                Token::Op(src[start..i].to_string())
            }
        };
        out.push(Spanned {
            token,
            start,
            end: i,
        });
    }

    Ok(out)
}

fn is_operator_byte(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b'*' | b'/' | b'<' | b'>' | b'=' | b'~' | b'!' | b'@' | b'#' | b'%'
            | b'^' | b'&' | b'|' | b'`' | b'?' | b':' | b'[' | b']'
    )
}

/// Read a quoted run starting at `start` (which holds the quote byte).
/// Doubled quotes are unescaped. Returns the text and the offset after the closing quote.
fn read_quoted(src: &str, start: usize, quote: u8) -> Result<(String, usize)> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    let mut text = String::new();
    let mut seg_start = i;
    while i < bytes.len() {
        if bytes[i] == quote {
            if i + 1 < bytes.len() && bytes[i + 1] == quote {
                text.push_str(&src[seg_start..=i]);
                i += 2;
                seg_start = i;
                continue;
            }
            text.push_str(&src[seg_start..i]);
            return Ok((text, i + 1));
        }
        i += 1;
    }
    Err(PgshiftError::DdlParseError(format!(
        "unterminated {} starting at offset {}",
        if quote == b'"' { "identifier" } else { "string" },
        start
    )))
}

/// Return the text between the parenthesis at byte `open` and its match,
/// plus the offset just past the closing parenthesis.
pub fn extract_balanced(src: &str, open: usize) -> Option<(&str, usize)> {
    let bytes = src.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let q = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == q {
                        if i + 1 < bytes.len() && bytes[i + 1] == q {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&src[open + 1..i], i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split on `sep` only at parenthesis depth zero and outside quotes.
pub fn split_top_level(src: &str, sep: u8) -> Vec<&str> {
    let bytes = src.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let q = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == q {
                        if i + 1 < bytes.len() && bytes[i + 1] == q {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            b'(' => depth += 1,
            b')' => depth -= 1,
            b if b == sep && depth == 0 => {
                parts.push(src[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let last = src[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Unwrap a `pg_get_constraintdef()` CHECK definition to its expression.
///
/// `CHECK ((price > 0)) NOT VALID` becomes `(price > 0)`. Returns `None`
/// when the text is not a CHECK definition.
pub fn unwrap_check(def: &str) -> Option<String> {
    let trimmed = def.trim();
    if !trimmed.get(..5)?.eq_ignore_ascii_case("check") {
        return None;
    }
    let open = trimmed.find('(')?;
    if !trimmed[5..open].trim().is_empty() {
        return None;
    }
    let (inner, _) = extract_balanced(trimmed, open)?;
    Some(inner.trim().to_string())
}

/// A parsed `CREATE INDEX` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub schema: Option<String>,
    pub table: String,
    pub if_not_exists: bool,
    pub index: Index,
}

/// Token cursor over one statement.
pub(crate) struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Spanned>,
    pub(crate) pos: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(src: &'a str) -> Result<Self> {
        Ok(Self {
            src,
            tokens: tokenize(src)?,
            pos: 0,
        })
    }

    pub(crate) fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    pub(crate) fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", kw)))
        }
    }

    pub(crate) fn identifier(&mut self) -> Result<String> {
        match self.peek().and_then(Token::identifier) {
            Some(id) => {
                self.pos += 1;
                Ok(id)
            }
            None => Err(self.error("expected identifier")),
        }
    }

    /// `name` or `schema.name`.
    pub(crate) fn qualified_name(&mut self) -> Result<(Option<String>, String)> {
        let first = self.identifier()?;
        if self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let second = self.identifier()?;
            Ok((Some(first), second))
        } else {
            Ok((None, first))
        }
    }

    /// Consume a parenthesised group and return its raw inner text.
    pub(crate) fn paren_group(&mut self) -> Result<&'a str> {
        let open = match self.tokens.get(self.pos) {
            Some(Spanned {
                token: Token::LParen,
                start,
                ..
            }) => *start,
            _ => return Err(self.error("expected '('")),
        };
        let (inner, end) = extract_balanced(self.src, open)
            .ok_or_else(|| self.error("unbalanced parentheses"))?;
        while self.tokens.get(self.pos).is_some_and(|t| t.start < end) {
            self.pos += 1;
        }
        Ok(inner)
    }

    /// Raw source text from the current token to the end.
    pub(crate) fn rest(&mut self) -> &'a str {
        let start = self
            .tokens
            .get(self.pos)
            .map(|t| t.start)
            .unwrap_or(self.src.len());
        self.pos = self.tokens.len();
        self.src[start..].trim().trim_end_matches(';').trim()
    }

    pub(crate) fn at_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::Semicolon))
    }

    /// Consume a run of key words only if all of them match.
    pub(crate) fn eat_keywords(&mut self, kws: &[&str]) -> bool {
        let matched = kws.iter().enumerate().all(|(i, kw)| {
            self.tokens
                .get(self.pos + i)
                .is_some_and(|t| t.token.is_keyword(kw))
        });
        if matched {
            self.pos += kws.len();
        }
        matched
    }

    pub(crate) fn string_literal(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.error("expected string literal")),
        }
    }

    /// Raw text from the current token up to (not including) the first
    /// depth-zero token for which `stop` holds, or the end.
    pub(crate) fn text_until(&mut self, stop: impl Fn(&Token) -> bool) -> &'a str {
        let start = match self.tokens.get(self.pos) {
            Some(t) => t.start,
            None => return "",
        };
        let mut depth = 0i32;
        let mut end = start;
        while let Some(t) = self.tokens.get(self.pos) {
            match t.token {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                Token::Semicolon if depth == 0 => break,
                _ if depth == 0 && stop(&t.token) => break,
                _ => {}
            }
            end = t.end;
            self.pos += 1;
        }
        self.src[start..end].trim()
    }

    pub(crate) fn error(&self, msg: &str) -> PgshiftError {
        let at = self
            .tokens
            .get(self.pos)
            .map(|t| t.start)
            .unwrap_or(self.src.len());
        PgshiftError::DdlParseError(format!("{} at offset {} in: {}", msg, at, self.src))
    }
}

/// Parse a `CREATE [UNIQUE] INDEX ...` definition.
pub fn parse_index_definition(def: &str) -> Result<IndexDefinition> {
    let mut p = Parser::new(def)?;

    p.expect_keyword("create")?;
    let unique = p.eat_keyword("unique");
    p.expect_keyword("index")?;
    let concurrently = p.eat_keyword("concurrently");
    let mut if_not_exists = false;
    if p.peek().is_some_and(|t| t.is_keyword("if")) {
        p.pos += 1;
        p.expect_keyword("not")?;
        p.expect_keyword("exists")?;
        if_not_exists = true;
    }

    if p.peek().is_some_and(|t| t.is_keyword("on")) {
        return Err(p.error("index name is required"));
    }
    let (_, name) = p.qualified_name()?;

    p.expect_keyword("on")?;
    p.eat_keyword("only");
    let (schema, table) = p.qualified_name()?;

    let method = if p.eat_keyword("using") {
        p.identifier()?
    } else {
        String::new()
    };

    let column_list = p.paren_group()?;
    let (target, orderings) = parse_column_list(column_list)?;

    let mut include = Vec::new();
    let mut predicate = None;
    while let Some(tok) = p.peek().cloned() {
        if tok.is_keyword("include") {
            p.pos += 1;
            let inner = p.paren_group()?;
            include = split_top_level(inner, b',')
                .into_iter()
                .map(parse_plain_identifier)
                .collect::<Result<Vec<_>>>()?;
        } else if tok.is_keyword("nulls") {
            // NULLS [NOT] DISTINCT
            p.pos += 1;
            p.eat_keyword("not");
            p.expect_keyword("distinct")?;
        } else if tok.is_keyword("with") {
            p.pos += 1;
            p.paren_group()?;
        } else if tok.is_keyword("tablespace") {
            p.pos += 1;
            p.identifier()?;
        } else if tok.is_keyword("where") {
            p.pos += 1;
            let text = p.rest();
            if text.is_empty() {
                return Err(p.error("empty WHERE predicate"));
            }
            predicate = Some(text.to_string());
        } else if tok == Token::Semicolon {
            p.pos += 1;
        } else {
            return Err(p.error("unexpected token after column list"));
        }
    }

    let method = if method.eq_ignore_ascii_case("btree") {
        String::new()
    } else {
        method
    };

    Ok(IndexDefinition {
        schema,
        table,
        if_not_exists,
        index: Index {
            name,
            target,
            method,
            unique,
            include,
            predicate,
            orderings,
            concurrently,
            unparsed: false,
        },
    })
}

fn parse_plain_identifier(text: &str) -> Result<String> {
    let tokens = tokenize(text)?;
    match tokens.as_slice() {
        [single] => single.token.identifier().ok_or_else(|| {
            PgshiftError::DdlParseError(format!("expected identifier, found '{}'", text))
        }),
        _ => Err(PgshiftError::DdlParseError(format!(
            "expected identifier, found '{}'",
            text
        ))),
    }
}

/// Parse the contents of the index column list.
///
/// Any entry that is not `column [trailing options]` turns the whole list
/// into a single opaque expression.
fn parse_column_list(list: &str) -> Result<(IndexTarget, Vec<IndexColumnOrder>)> {
    let entries = split_top_level(list, b',');
    if entries.is_empty() {
        return Err(PgshiftError::DdlParseError(
            "empty index column list".to_string(),
        ));
    }

    let mut columns = Vec::with_capacity(entries.len());
    let mut orderings = Vec::new();
    for entry in &entries {
        match parse_column_entry(entry)? {
            Some(order) => {
                columns.push(order.column.clone());
                if !order.is_default() {
                    orderings.push(order);
                }
            }
            None => {
                return Ok((IndexTarget::Expression(list.trim().to_string()), Vec::new()));
            }
        }
    }
    Ok((IndexTarget::Columns(columns), orderings))
}

/// Classify one column-list entry. Returns `None` for expression entries.
fn parse_column_entry(entry: &str) -> Result<Option<IndexColumnOrder>> {
    let tokens = tokenize(entry)?;
    let mut it = tokens.iter().map(|s| &s.token).peekable();

    let column = match it.next() {
        Some(t) => match t.identifier() {
            Some(id) => id,
            None => return Ok(None),
        },
        None => return Ok(None),
    };
    // A function call or operator right after the name means an expression.
    if matches!(it.peek(), Some(Token::LParen | Token::Op(_) | Token::Dot)) {
        return Ok(None);
    }

    let mut order = IndexColumnOrder {
        column,
        ..Default::default()
    };

    while let Some(tok) = it.next() {
        if tok.is_keyword("asc") {
            order.direction = SortDirection::Asc;
        } else if tok.is_keyword("desc") {
            order.direction = SortDirection::Desc;
        } else if tok.is_keyword("nulls") {
            match it.next() {
                Some(t) if t.is_keyword("first") => order.nulls = Some(NullsOrder::First),
                Some(t) if t.is_keyword("last") => order.nulls = Some(NullsOrder::Last),
                _ => {
                    return Err(PgshiftError::DdlParseError(format!(
                        "expected FIRST or LAST after NULLS in '{}'",
                        entry
                    )))
                }
            }
        } else if tok.is_keyword("collate") {
            let collation = match it.next() {
                Some(Token::Quoted(q)) => q.clone(),
                Some(Token::Word(w)) => w.to_lowercase(),
                _ => {
                    return Err(PgshiftError::DdlParseError(format!(
                        "expected collation name in '{}'",
                        entry
                    )))
                }
            };
            // pg_catalog."C" style qualification
            if it.peek() == Some(&&Token::Dot) {
                it.next();
                match it.next().and_then(Token::identifier) {
                    Some(name) => order.collation = Some(name),
                    None => {
                        return Err(PgshiftError::DdlParseError(format!(
                            "bad qualified collation in '{}'",
                            entry
                        )))
                    }
                }
            } else {
                order.collation = Some(collation);
            }
        } else if let Token::Word(w) = tok {
            if RESERVED_KEYWORDS.contains(&w.to_lowercase().as_str()) {
                return Ok(None);
            }
            let mut opclass = w.to_lowercase();
            if it.peek() == Some(&&Token::Dot) {
                it.next();
                match it.next().and_then(Token::identifier) {
                    Some(name) => {
                        opclass.push('.');
                        opclass.push_str(&name);
                    }
                    None => return Ok(None),
                }
            }
            if order.opclass.is_some() {
                return Ok(None);
            }
            order.opclass = Some(opclass);
        } else {
            return Ok(None);
        }
    }

    Ok(Some(order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_catalog_definition() {
        let def = parse_index_definition(
            "CREATE INDEX idx_users_email ON public.users USING btree (email)",
        )
        .unwrap();
        assert_eq!(def.schema.as_deref(), Some("public"));
        assert_eq!(def.table, "users");
        assert_eq!(def.index.name, "idx_users_email");
        assert_eq!(def.index.columns(), &["email".to_string()]);
        assert_eq!(def.index.method, "");
        assert!(!def.index.unique);
        assert!(def.index.orderings.is_empty());
    }

    #[test]
    fn test_unique_with_include_and_predicate() {
        let def = parse_index_definition(
            "CREATE UNIQUE INDEX uq_orders_ref ON public.orders USING btree (customer_id, reference) INCLUDE (total) WHERE (deleted_at IS NULL)",
        )
        .unwrap();
        assert!(def.index.unique);
        assert_eq!(
            def.index.columns(),
            &["customer_id".to_string(), "reference".to_string()]
        );
        assert_eq!(def.index.include, vec!["total".to_string()]);
        assert_eq!(def.index.predicate.as_deref(), Some("(deleted_at IS NULL)"));
    }

    #[test]
    fn test_ordering_opclass_and_collation() {
        let def = parse_index_definition(
            r#"CREATE INDEX idx_name ON public.people USING btree (last_name COLLATE "C" text_pattern_ops DESC NULLS LAST, first_name)"#,
        )
        .unwrap();
        assert_eq!(def.index.orderings.len(), 1);
        let o = &def.index.orderings[0];
        assert_eq!(o.column, "last_name");
        assert_eq!(o.collation.as_deref(), Some("C"));
        assert_eq!(o.opclass.as_deref(), Some("text_pattern_ops"));
        assert_eq!(o.direction, SortDirection::Desc);
        assert_eq!(o.nulls, Some(NullsOrder::Last));
    }

    #[test]
    fn test_opclass_before_collate() {
        let def = parse_index_definition(
            "CREATE INDEX i ON t (name varchar_pattern_ops COLLATE \"en_US\" ASC)",
        )
        .unwrap();
        let o = &def.index.orderings[0];
        assert_eq!(o.opclass.as_deref(), Some("varchar_pattern_ops"));
        assert_eq!(o.collation.as_deref(), Some("en_US"));
        assert_eq!(o.direction, SortDirection::Asc);
    }

    #[test]
    fn test_expression_index() {
        let def = parse_index_definition(
            "CREATE INDEX idx_lower_email ON public.users USING btree (lower((email)::text))",
        )
        .unwrap();
        assert_eq!(def.index.expression(), Some("lower((email)::text)"));
        assert!(def.index.columns().is_empty());
        assert!(def.index.orderings.is_empty());
    }

    #[test]
    fn test_gin_method_and_quoted_table() {
        let def = parse_index_definition(
            r#"CREATE INDEX "Idx_Tags" ON ONLY app."Posts" USING gin (tags)"#,
        )
        .unwrap();
        assert_eq!(def.index.name, "Idx_Tags");
        assert_eq!(def.schema.as_deref(), Some("app"));
        assert_eq!(def.table, "Posts");
        assert_eq!(def.index.method, "gin");
    }

    #[test]
    fn test_handwritten_if_not_exists_concurrently() {
        let def = parse_index_definition(
            "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS idx_a ON a (x) WITH (fillfactor = 70);",
        )
        .unwrap();
        assert!(def.if_not_exists);
        assert!(def.index.concurrently);
        assert!(def.index.unique);
        assert_eq!(def.schema, None);
        assert_eq!(def.table, "a");
    }

    #[test]
    fn test_default_ordering_entries_dropped() {
        let def =
            parse_index_definition("CREATE INDEX i ON t (a ASC NULLS LAST, b DESC NULLS FIRST)")
                .unwrap();
        assert_eq!(def.index.orderings.len(), 1);
        assert_eq!(def.index.orderings[0].column, "b");
    }

    #[test]
    fn test_schema_qualified_opclass() {
        let def = parse_index_definition(
            "CREATE INDEX i ON t USING gin (title public.gin_trgm_ops)",
        )
        .unwrap();
        assert_eq!(
            def.index.orderings[0].opclass.as_deref(),
            Some("public.gin_trgm_ops")
        );
    }

    #[test]
    fn test_malformed_definitions_fail() {
        assert!(parse_index_definition("CREATE INDEX ON t (a)").is_err());
        assert!(parse_index_definition("CREATE INDEX i ON t (a").is_err());
        assert!(parse_index_definition("CREATE TABLE t (a int)").is_err());
        assert!(parse_index_definition("CREATE INDEX i ON \"t (a)").is_err());
    }

    #[test]
    fn test_split_top_level_respects_nesting_and_quotes() {
        let parts = split_top_level("a numeric(10,2), b text DEFAULT 'x,y', c int", b',');
        assert_eq!(
            parts,
            vec!["a numeric(10,2)", "b text DEFAULT 'x,y'", "c int"]
        );
    }

    #[test]
    fn test_extract_balanced() {
        let src = "f(a, (b), ')') tail";
        let (inner, end) = extract_balanced(src, 1).unwrap();
        assert_eq!(inner, "a, (b), ')'");
        assert_eq!(&src[end..], " tail");
    }

    #[test]
    fn test_unwrap_check() {
        assert_eq!(
            unwrap_check("CHECK ((price > (0)::numeric))").as_deref(),
            Some("(price > (0)::numeric)")
        );
        assert_eq!(
            unwrap_check("CHECK (qty >= 0) NOT VALID").as_deref(),
            Some("qty >= 0")
        );
        assert_eq!(unwrap_check("UNIQUE (a)"), None);
    }

    #[test]
    fn test_tokenize_quotes() {
        let toks = tokenize(r#"a "b""c" 'it''s' 1.5 ::"#).unwrap();
        let kinds: Vec<Token> = toks.into_iter().map(|s| s.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Word("a".into()),
                Token::Quoted("b\"c".into()),
                Token::Str("it's".into()),
                Token::Number("1.5".into()),
                Token::Op("::".into()),
            ]
        );
    }
}
