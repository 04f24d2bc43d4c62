//! PostgreSQL-aware normalization of type names, default expressions and
//! free-form SQL expressions, used when comparing two schema models.

use std::sync::LazyLock;

use regex_lite::Regex;

/// Trailing `::type` cast, including multi-word and array types.
static TRAILING_CAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"::\s*(?:"[^"]+"|[a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?(?: varying| precision| with(?:out)? time zone)?)(?:\(\d+(?:,\s*\d+)?\))?(?:\[\])*\s*$"#,
    )
    .unwrap()
});

/// Any `::type` cast inside an expression.
static CAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"::\s*(?:"[^"]+"|[a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?(?: varying| precision| with(?:out)? time zone)?)(?:\(\d+(?:,\s*\d+)?\))?(?:\[\])*"#,
    )
    .unwrap()
});

/// A parenthesised literal or bare column, e.g. `(0)`, `('x')`, `(status)`,
/// not preceded by a function name.
static PAREN_ATOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^a-z0-9_.])\((-?[0-9]+(?:\.[0-9]+)?|'[^']*'|[a-z_][a-z0-9_]*)\)").unwrap()
});

static NEXTVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^nextval\(\s*'[^']*_seq[^']*'"#).unwrap());

/// Normalize a SQL type for comparison.
///
/// Aliases collapse to their canonical spelling (`int4` -> `integer`,
/// `character varying(n)` -> `varchar(n)`, `serial` -> `integer`, ...).
/// Zone-aware and zone-naive time types stay distinct.
pub fn normalize_type(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase().replace('"', "");

    let mut array_dims = 0;
    loop {
        let trimmed = s.trim_end();
        if let Some(stripped) = trimmed.strip_suffix("[]") {
            s = stripped.to_string();
            array_dims += 1;
        } else {
            s = trimmed.to_string();
            break;
        }
    }

    // Pull out a parameter list wherever it sits ("timestamp(3) with time zone").
    let (base, params) = match (s.find('('), s.find(')')) {
        (Some(open), Some(close)) if close > open => {
            let params: String = s[open + 1..close]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let base = format!("{} {}", &s[..open], &s[close + 1..]);
            (collapse_whitespace(&base), Some(params))
        }
        _ => (collapse_whitespace(&s), None),
    };

    let canonical = match base.as_str() {
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer",
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallint" | "smallserial" | "serial2" => "smallint",
        "bool" | "boolean" => "boolean",
        "decimal" | "numeric" => "numeric",
        "float8" | "double precision" => "double precision",
        "float" if params.is_none() => "double precision",
        "float4" | "real" => "real",
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "char",
        "timestamp" | "timestamp without time zone" => "timestamp",
        "timestamptz" | "timestamp with time zone" => "timestamptz",
        "time" | "time without time zone" => "time",
        "timetz" | "time with time zone" => "timetz",
        other => other,
    };

    let mut out = canonical.to_string();
    if let Some(p) = params {
        out.push('(');
        out.push_str(&p);
        out.push(')');
    }
    for _ in 0..array_dims {
        out.push_str("[]");
    }
    out
}

/// True for the `serial` family of pseudo-types.
pub fn is_serial_type(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2"
    )
}

/// True for a sequence-backed default such as `nextval('users_id_seq'::regclass)`.
pub fn is_nextval_default(default: &str) -> bool {
    NEXTVAL_RE.is_match(default.trim())
}

/// Split a (normalized) array type into its element type.
pub fn array_element_type(normalized: &str) -> Option<&str> {
    normalized.strip_suffix("[]")
}

/// Normalize a column default for comparison.
///
/// Lower-cases, collapses whitespace, and repeatedly strips outer
/// parentheses and trailing `::type` casts.
pub fn normalize_default(raw: &str) -> String {
    let mut s = collapse_whitespace(&raw.to_lowercase());
    loop {
        let before = s.clone();
        s = TRAILING_CAST_RE.replace(&s, "").trim().to_string();
        s = strip_outer_parens(&s).to_string();
        if s == before {
            return s;
        }
    }
}

/// Normalize a CHECK / predicate / index expression for comparison.
///
/// In addition to the default normalization, removes every cast, unwraps
/// parenthesised atoms and drops whitespace next to parentheses, so
/// `(price > (0)::numeric)` and `price > 0` agree.
pub fn normalize_expression(raw: &str) -> String {
    let lowered = collapse_whitespace(&raw.to_lowercase());
    let mut s = CAST_RE
        .replace_all(&lowered, "")
        .replace("( ", "(")
        .replace(" )", ")")
        .replace('"', "");
    loop {
        let next = PAREN_ATOM_RE.replace_all(&s, "${1}${2}").to_string();
        if next == s {
            break;
        }
        s = next;
    }
    let mut s = collapse_whitespace(&s);
    loop {
        let stripped = strip_outer_parens(&s).to_string();
        if stripped == s {
            return s;
        }
        s = stripped;
    }
}

/// Remove one pair of parentheses that encloses the whole string.
pub fn strip_outer_parens(s: &str) -> &str {
    let t = s.trim();
    if !(t.starts_with('(') && t.ends_with(')')) {
        return t;
    }
    let mut depth = 0i32;
    let mut in_quote = false;
    for (i, c) in t.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 && i != t.len() - 1 {
                    return t;
                }
            }
            _ => {}
        }
    }
    t[1..t.len() - 1].trim()
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
