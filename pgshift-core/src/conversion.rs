//! Column type conversion safety.
//!
//! Every column type change is classified before the planner emits
//! `ALTER COLUMN ... TYPE`. PostgreSQL only accepts a bare type change when
//! an assignment cast exists; a handful of common text conversions get a
//! registered `USING` expression, and everything else becomes a commented
//! placeholder the executor refuses to apply until someone edits it.

use crate::db::ident;
use crate::normalize::{array_element_type, normalize_type};

/// Marker line that blocks a migration from being applied.
pub const MANUAL_REVIEW_MARKER: &str = "-- pgshift:manual-review";

const INTEGER_TYPES: &[&str] = &["smallint", "integer", "bigint"];
const FLOAT_TYPES: &[&str] = &["real", "double precision"];
const STRING_TYPES: &[&str] = &["text", "varchar", "char"];
const JSON_TYPES: &[&str] = &["json", "jsonb"];

/// How a type change is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionKind {
    /// An assignment cast exists; no `USING` clause needed.
    Implicit,
    /// Wrap the text value in a one-element array; empty text becomes an empty array.
    TextToArray,
    /// Parse text as JSON; empty text becomes `'{}'`.
    TextToJson,
    /// Keep values that look like integers, map the rest to NULL.
    TextToInteger,
    /// Cast text to the target enum type.
    TextToEnum,
    /// Cast between `json` and `jsonb`.
    JsonCast,
    /// No safe conversion is known.
    ManualReview,
}

/// Strip a parameter list (`varchar(20)` -> `varchar`).
fn base_type(normalized: &str) -> &str {
    match normalized.find('(') {
        Some(i) => normalized[..i].trim_end(),
        None => normalized,
    }
}

fn is_string(normalized: &str) -> bool {
    !normalized.ends_with("[]") && STRING_TYPES.contains(&base_type(normalized))
}

/// Numeric parameters of a normalized type (`numeric(10,2)` -> `[10, 2]`).
fn type_params(normalized: &str) -> Vec<u32> {
    match (normalized.find('('), normalized.find(')')) {
        (Some(open), Some(close)) if close > open => normalized[open + 1..close]
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Maximum length of a string type; `None` when unbounded. Bare `char` is `char(1)`.
fn string_length(normalized: &str) -> Option<u32> {
    let declared = type_params(normalized).first().copied();
    match base_type(normalized) {
        "char" => declared.or(Some(1)),
        "text" => None,
        _ => declared,
    }
}

/// Decimal digits an integer type can hold.
fn integer_digits(base: &str) -> Option<u32> {
    match base {
        "smallint" => Some(5),
        "integer" => Some(10),
        "bigint" => Some(19),
        _ => None,
    }
}

/// Digits left of the decimal point a `numeric` holds; `None` when unbounded.
fn numeric_capacity(normalized: &str) -> Option<u32> {
    match type_params(normalized).as_slice() {
        [] => None,
        [precision] => Some(*precision),
        [precision, scale, ..] => Some(precision.saturating_sub(*scale)),
    }
}

/// True when every value of `from` is representable in `to`.
fn numeric_widens(from: &str, to: &str) -> bool {
    let (f, t) = (base_type(from), base_type(to));
    if let (Some(a), Some(b)) = (integer_digits(f), integer_digits(t)) {
        return a <= b;
    }
    match t {
        "numeric" => match (integer_digits(f), numeric_capacity(to)) {
            (_, None) => true,
            (Some(digits), Some(cap)) => digits <= cap,
            (None, Some(cap)) => f == "numeric" && numeric_capacity(from).is_some_and(|c| c <= cap),
        },
        "double precision" => {
            integer_digits(f).is_some()
                || f == "real"
                || (f == "numeric" && numeric_capacity(from).is_some_and(|c| c <= 308))
        }
        "real" => integer_digits(f).is_some(),
        _ => false,
    }
}

/// True when PostgreSQL changes the column type without `USING` and no
/// existing value can make the change fail. Narrowing changes are excluded.
fn converts_in_place(from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    if is_string(to) {
        return match string_length(to) {
            None => true,
            Some(limit) => !is_string(from) || string_length(from).is_some_and(|n| n <= limit),
        };
    }
    match (array_element_type(from), array_element_type(to)) {
        (Some(f), Some(t)) => return converts_in_place(f, t),
        (None, None) => {}
        _ => return false,
    }

    let (f, t) = (base_type(from), base_type(to));
    let numeric_like = |ty: &str| {
        INTEGER_TYPES.contains(&ty) || FLOAT_TYPES.contains(&ty) || ty == "numeric"
    };
    if numeric_like(f) && numeric_like(t) {
        return numeric_widens(from, to);
    }
    if f == t {
        return true;
    }
    matches!(
        (f, t),
        ("timestamp", "timestamptz")
            | ("timestamptz", "timestamp")
            | ("timestamp", "date")
            | ("timestamptz", "date")
            | ("date", "timestamp")
            | ("date", "timestamptz")
            | ("timestamp", "time")
            | ("time", "timetz")
            | ("timetz", "time")
    )
}

/// Classify a change from `from` to `to` (raw type strings).
///
/// `to_enum` says the target is a user-defined enum type.
pub fn classify(from: &str, to: &str, to_enum: bool) -> ConversionKind {
    let from = normalize_type(from);
    let to = normalize_type(to);

    if to_enum {
        if from == to {
            return ConversionKind::Implicit;
        }
        return if is_string(&from) {
            ConversionKind::TextToEnum
        } else {
            ConversionKind::ManualReview
        };
    }

    if converts_in_place(&from, &to) {
        return ConversionKind::Implicit;
    }

    let to_base = base_type(&to);
    if JSON_TYPES.contains(&base_type(&from)) && JSON_TYPES.contains(&to_base) {
        return ConversionKind::JsonCast;
    }
    if !is_string(&from) {
        return ConversionKind::ManualReview;
    }
    if to.ends_with("[]") {
        ConversionKind::TextToArray
    } else if JSON_TYPES.contains(&to_base) {
        ConversionKind::TextToJson
    } else if INTEGER_TYPES.contains(&to_base) {
        ConversionKind::TextToInteger
    } else {
        ConversionKind::ManualReview
    }
}

/// Value range of an integer type; other targets get the `bigint` range.
fn integer_bounds(normalized: &str) -> (i64, i64) {
    match base_type(normalized) {
        "smallint" => (i16::MIN.into(), i16::MAX.into()),
        "integer" => (i32::MIN.into(), i32::MAX.into()),
        _ => (i64::MIN, i64::MAX),
    }
}

/// The `USING` expression for a registered conversion.
///
/// `column` must already be rendered as an identifier and `target` as SQL
/// type text.
pub fn using_expression(kind: ConversionKind, column: &str, target: &str) -> Option<String> {
    let expr = match kind {
        ConversionKind::Implicit | ConversionKind::ManualReview => return None,
        ConversionKind::TextToArray => format!(
            "CASE WHEN {c} IS NULL THEN NULL WHEN {c} = '' THEN ARRAY[]::{t} ELSE ARRAY[{c}]::{t} END",
            c = column,
            t = target
        ),
        ConversionKind::TextToJson => format!(
            "CASE WHEN {c} IS NULL THEN NULL WHEN {c} = '' THEN '{{}}'::{t} ELSE {c}::{t} END",
            c = column,
            t = target
        ),
        ConversionKind::TextToInteger => {
            let (min, max) = integer_bounds(&normalize_type(target));
            format!(
                "CASE WHEN {c} !~ '^\\s*-?[0-9]+\\s*$' THEN NULL \
                 WHEN trim({c})::numeric BETWEEN {min} AND {max} THEN trim({c})::{t} ELSE NULL END",
                c = column,
                t = target,
                min = min,
                max = max
            )
        }
        ConversionKind::TextToEnum | ConversionKind::JsonCast => {
            format!("{}::{}", column, target)
        }
    };
    Some(expr)
}

/// Render the statement (or manual-review placeholder) for a column type change.
///
/// `target_sql` is the type as it should appear in DDL; `from`/`to` are
/// used for classification only.
pub fn alter_column_type(
    table: &str,
    column: &str,
    from: &str,
    to: &str,
    target_sql: &str,
    to_enum: bool,
) -> String {
    let kind = classify(from, to, to_enum);
    let col = ident(column);
    let head = format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
        ident(table),
        col,
        target_sql
    );
    match kind {
        ConversionKind::Implicit => format!("{};", head),
        ConversionKind::ManualReview => {
            log::warn!(
                "No safe conversion, manual review required; table={}, column={}, from={}, to={}",
                table,
                column,
                from,
                to
            );
            format!(
                "{} column {}.{}: no safe conversion from {} to {}\n-- {} USING {}::{};",
                MANUAL_REVIEW_MARKER, table, column, from, to, head, col, target_sql
            )
        }
        _ => match using_expression(kind, &col, target_sql) {
            Some(expr) => format!("{} USING {};", head, expr),
            None => format!("{};", head),
        },
    }
}

/// True when a migration still carries a manual-review placeholder.
pub fn requires_manual_review(sql: &str) -> bool {
    sql.lines()
        .any(|line| line.trim_start().starts_with(MANUAL_REVIEW_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_and_aliases_are_implicit() {
        assert_eq!(classify("integer", "bigint", false), ConversionKind::Implicit);
        assert_eq!(classify("int2", "int4", false), ConversionKind::Implicit);
        assert_eq!(classify("integer", "numeric(12,2)", false), ConversionKind::Implicit);
        assert_eq!(classify("real", "float8", false), ConversionKind::Implicit);
        assert_eq!(
            classify("varchar(50)", "character varying(100)", false),
            ConversionKind::Implicit
        );
        assert_eq!(classify("timestamp", "timestamptz", false), ConversionKind::Implicit);
        assert_eq!(classify("timestamp", "date", false), ConversionKind::Implicit);
        assert_eq!(classify("date", "timestamp", false), ConversionKind::Implicit);
    }

    #[test]
    fn test_anything_to_text_is_implicit() {
        assert_eq!(classify("jsonb", "text", false), ConversionKind::Implicit);
        assert_eq!(classify("integer[]", "text", false), ConversionKind::Implicit);
        assert_eq!(classify("uuid", "varchar(36)", false), ConversionKind::Implicit);
    }

    #[test]
    fn test_registered_text_conversions() {
        assert_eq!(classify("text", "text[]", false), ConversionKind::TextToArray);
        assert_eq!(classify("varchar(20)", "jsonb", false), ConversionKind::TextToJson);
        assert_eq!(classify("text", "int8", false), ConversionKind::TextToInteger);
        assert_eq!(classify("text", "mood", true), ConversionKind::TextToEnum);
        assert_eq!(classify("json", "jsonb", false), ConversionKind::JsonCast);
    }

    #[test]
    fn test_unknown_conversions_need_review() {
        assert_eq!(classify("boolean", "integer", false), ConversionKind::ManualReview);
        assert_eq!(classify("text", "uuid", false), ConversionKind::ManualReview);
        assert_eq!(classify("integer", "mood", true), ConversionKind::ManualReview);
        assert_eq!(classify("integer[]", "integer", false), ConversionKind::ManualReview);
    }

    #[test]
    fn test_text_to_array_statement() {
        let sql = alter_column_type("posts", "tags", "text", "text[]", "text[]", false);
        assert_eq!(
            sql,
            "ALTER TABLE posts ALTER COLUMN tags TYPE text[] USING CASE WHEN tags IS NULL THEN NULL WHEN tags = '' THEN ARRAY[]::text[] ELSE ARRAY[tags]::text[] END;"
        );
    }

    #[test]
    fn test_text_to_integer_statement_guards_values() {
        let sql = alter_column_type("t", "n", "text", "integer", "integer", false);
        assert!(sql.contains(r"CASE WHEN n !~ '^\s*-?[0-9]+\s*$' THEN NULL"));
        assert!(sql.contains(
            "WHEN trim(n)::numeric BETWEEN -2147483648 AND 2147483647 THEN trim(n)::integer ELSE NULL END"
        ));

        let small = alter_column_type("t", "n", "text", "int2", "smallint", false);
        assert!(small.contains("BETWEEN -32768 AND 32767"));
        let big = alter_column_type("t", "n", "varchar(30)", "bigint", "bigint", false);
        assert!(big.contains("BETWEEN -9223372036854775808 AND 9223372036854775807"));
    }

    #[test]
    fn test_narrowing_numeric_changes_need_review() {
        assert_eq!(classify("bigint", "integer", false), ConversionKind::ManualReview);
        assert_eq!(classify("integer", "smallint", false), ConversionKind::ManualReview);
        assert_eq!(classify("numeric", "integer", false), ConversionKind::ManualReview);
        assert_eq!(classify("double precision", "bigint", false), ConversionKind::ManualReview);
        assert_eq!(classify("numeric(12,2)", "numeric(10,2)", false), ConversionKind::ManualReview);
        assert_eq!(classify("numeric", "numeric(10,2)", false), ConversionKind::ManualReview);
        assert_eq!(classify("integer", "numeric(5,0)", false), ConversionKind::ManualReview);
        assert_eq!(classify("double precision", "real", false), ConversionKind::ManualReview);

        assert_eq!(classify("numeric(10,2)", "numeric(12,4)", false), ConversionKind::Implicit);
        assert_eq!(classify("numeric(10,2)", "numeric", false), ConversionKind::Implicit);
        assert_eq!(classify("bigint", "double precision", false), ConversionKind::Implicit);
    }

    #[test]
    fn test_shrinking_strings_need_review() {
        assert_eq!(
            classify("varchar(100)", "varchar(10)", false),
            ConversionKind::ManualReview
        );
        assert_eq!(classify("text", "varchar(10)", false), ConversionKind::ManualReview);
        assert_eq!(classify("varchar", "char(2)", false), ConversionKind::ManualReview);
        assert_eq!(classify("char(2)", "varchar(2)", false), ConversionKind::Implicit);
        assert_eq!(classify("varchar(10)[]", "varchar(5)[]", false), ConversionKind::ManualReview);
        assert_eq!(classify("varchar(5)[]", "text[]", false), ConversionKind::Implicit);
    }

    #[test]
    fn test_implicit_statement_has_no_using() {
        let sql = alter_column_type("t", "n", "integer", "bigint", "bigint", false);
        assert_eq!(sql, "ALTER TABLE t ALTER COLUMN n TYPE bigint;");
    }

    #[test]
    fn test_manual_review_placeholder_is_commented_out() {
        let sql = alter_column_type("t", "flag", "boolean", "integer", "integer", false);
        assert!(sql.starts_with(MANUAL_REVIEW_MARKER));
        assert!(requires_manual_review(&sql));
        assert!(sql.lines().all(|l| l.starts_with("--")));
        assert!(crate::sql_parser::executable_statements(&sql).is_empty());
    }

    #[test]
    fn test_requires_manual_review_ignores_plain_sql() {
        assert!(!requires_manual_review("ALTER TABLE t ADD COLUMN a int;"));
    }
}
