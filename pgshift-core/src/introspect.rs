//! Live schema introspection from the PostgreSQL catalog.
//!
//! Each table is resolved with one query per category (columns, primary
//! key, foreign keys, indexes, constraints, enum types). The per-table
//! queries are issued together and pipelined over the single connection.

use std::collections::BTreeMap;

use tokio_postgres::Client;

use crate::ddl_parser::{parse_index_definition, unwrap_check};
use crate::error::Result;
use crate::model::{
    Column, Constraint, EnumType, ForeignKey, GeneratedColumn, GeneratedKind, IdentityKind, Index,
    PrimaryKey, ReferentialAction, SchemaModel, Table,
};
use crate::normalize::is_nextval_default;

/// Read every user table in `schema` into a model, skipping the bookkeeping table.
pub async fn introspect(client: &Client, schema: &str, bookkeeping_table: &str) -> Result<SchemaModel> {
    let rows = client
        .query(
            "SELECT c.relname::text
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relkind IN ('r', 'p')
               AND NOT c.relispartition
               AND c.relname <> $2
             ORDER BY c.relname",
            &[&schema, &bookkeeping_table],
        )
        .await?;

    let mut model = SchemaModel::new();
    for row in &rows {
        let name: String = row.get(0);
        let table = introspect_table(client, schema, &name).await?;
        model.insert(table);
    }

    log::debug!(
        "Introspected schema; schema={}, tables={}",
        schema,
        model.tables.len()
    );
    Ok(model)
}

/// Read one table.
pub async fn introspect_table(client: &Client, schema: &str, table: &str) -> Result<Table> {
    let (columns, primary_key, foreign_keys, indexes, constraints, enum_types) = tokio::try_join!(
        query_columns(client, schema, table),
        query_primary_key(client, schema, table),
        query_foreign_keys(client, schema, table),
        query_indexes(client, schema, table),
        query_constraints(client, schema, table),
        query_enum_types(client, schema, table),
    )?;

    let enum_names: Vec<&str> = enum_types.iter().map(|e| e.name.as_str()).collect();
    let columns = columns
        .into_iter()
        .map(|raw| raw.into_column(&enum_names))
        .collect();

    Ok(Table {
        name: table.to_string(),
        columns,
        primary_key,
        indexes,
        foreign_keys,
        constraints,
        enum_types,
    })
}

/// A column row as the catalog reports it.
#[derive(Debug, Clone, Default)]
struct RawColumn {
    name: String,
    data_type: String,
    udt_name: String,
    /// `format_type(atttypid, atttypmod)`; carries typmods that
    /// `information_schema` drops (time precision, array elements).
    formatted: Option<String>,
    char_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
    nullable: bool,
    default: Option<String>,
    identity: Option<String>,
    generation_expression: Option<String>,
}

impl RawColumn {
    fn into_column(self, enum_names: &[&str]) -> Column {
        let data_type = reconstruct_type(
            &self.data_type,
            &self.udt_name,
            self.formatted.as_deref(),
            self.char_length,
            self.precision,
            self.scale,
        );
        let element = self.udt_name.trim_start_matches('_');
        let enum_type = match self.data_type.as_str() {
            "USER-DEFINED" | "ARRAY" if enum_names.contains(&element) => Some(element.to_string()),
            _ => None,
        };
        let auto_increment = self
            .default
            .as_deref()
            .is_some_and(|d| is_nextval_default(d) && d.contains("_seq"));
        let identity = self.identity.as_deref().map(|g| {
            if g.eq_ignore_ascii_case("ALWAYS") {
                IdentityKind::Always
            } else {
                IdentityKind::ByDefault
            }
        });
        let generated = self.generation_expression.map(|expression| GeneratedColumn {
            expression,
            kind: GeneratedKind::Stored,
        });

        Column {
            name: self.name,
            data_type,
            nullable: self.nullable,
            default: self.default,
            unique: false,
            auto_increment,
            generated,
            identity,
            enum_type,
        }
    }
}

/// Rebuild a DDL type string from `information_schema.columns` fields.
///
/// `formatted` is the catalog's `format_type()` rendering. When present it is
/// used for arrays and for types not spelled out here, so typmods such as
/// `timestamptz(3)` or `varchar(20)[]` survive. Schema qualifiers are dropped.
pub fn reconstruct_type(
    data_type: &str,
    udt_name: &str,
    formatted: Option<&str>,
    char_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    match data_type {
        "character varying" => match char_length {
            Some(n) => format!("varchar({})", n),
            None => "varchar".to_string(),
        },
        "character" => match char_length {
            Some(n) => format!("char({})", n),
            None => "char".to_string(),
        },
        "numeric" => match (precision, scale) {
            (Some(p), Some(s)) => format!("numeric({},{})", p, s),
            (Some(p), None) => format!("numeric({})", p),
            _ => "numeric".to_string(),
        },
        "ARRAY" => match formatted {
            Some(f) => strip_schema(f).to_string(),
            None => format!("{}[]", udt_name.trim_start_matches('_')),
        },
        "USER-DEFINED" => udt_name.to_string(),
        other => formatted.map_or(other, strip_schema).to_string(),
    }
}

/// `app.mood[]` -> `mood[]`; a dot inside a typmod is left alone.
fn strip_schema(type_name: &str) -> &str {
    let head = type_name.find('(').unwrap_or(type_name.len());
    match type_name[..head].rfind('.') {
        Some(dot) => &type_name[dot + 1..],
        None => type_name,
    }
}

async fn query_columns(client: &Client, schema: &str, table: &str) -> Result<Vec<RawColumn>> {
    let rows = client
        .query(
            "SELECT c.column_name::text,
                    c.data_type::text,
                    c.udt_name::text,
                    c.character_maximum_length::int,
                    c.numeric_precision::int,
                    c.numeric_scale::int,
                    c.is_nullable::text,
                    c.column_default::text,
                    c.is_identity::text,
                    c.identity_generation::text,
                    c.is_generated::text,
                    c.generation_expression::text,
                    format_type(a.atttypid, a.atttypmod)::text
             FROM information_schema.columns c
             JOIN pg_namespace n ON n.nspname = c.table_schema
             JOIN pg_class t ON t.relnamespace = n.oid AND t.relname = c.table_name
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
             WHERE c.table_schema = $1 AND c.table_name = $2
             ORDER BY c.ordinal_position",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| {
            let is_identity: Option<String> = r.get(8);
            let is_generated: Option<String> = r.get(10);
            RawColumn {
                name: r.get(0),
                data_type: r.get(1),
                udt_name: r.get(2),
                formatted: r.get(12),
                char_length: r.get(3),
                precision: r.get(4),
                scale: r.get(5),
                nullable: r.get::<_, String>(6) == "YES",
                default: r.get(7),
                identity: if is_identity.as_deref() == Some("YES") {
                    r.get(9)
                } else {
                    None
                },
                generation_expression: if is_generated.as_deref() == Some("ALWAYS") {
                    r.get(11)
                } else {
                    None
                },
            }
        })
        .collect())
}

async fn query_primary_key(client: &Client, schema: &str, table: &str) -> Result<Option<PrimaryKey>> {
    let row = client
        .query_opt(
            "SELECT con.conname::text,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    )
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'p'",
            &[&schema, &table],
        )
        .await?;

    Ok(row.map(|r| PrimaryKey {
        name: Some(r.get(0)),
        columns: r.get(1),
    }))
}

async fn query_foreign_keys(client: &Client, schema: &str, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = client
        .query(
            "SELECT con.conname::text,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    ),
                    ref.relname::text,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    ),
                    con.confupdtype::text,
                    con.confdeltype::text
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_class ref ON ref.oid = con.confrelid
             WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'f'
             ORDER BY con.conname",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| ForeignKey {
            name: r.get(0),
            columns: r.get(1),
            referenced_table: r.get(2),
            referenced_columns: r.get(3),
            on_update: ReferentialAction::from_catalog_code(&r.get::<_, String>(4)),
            on_delete: ReferentialAction::from_catalog_code(&r.get::<_, String>(5)),
        })
        .collect())
}

/// Standalone indexes only: indexes backing a primary key, UNIQUE or
/// exclusion constraint are left to the constraint queries.
async fn query_indexes(client: &Client, schema: &str, table: &str) -> Result<Vec<Index>> {
    let rows = client
        .query(
            "SELECT i.relname::text, pg_get_indexdef(i.oid), am.amname::text, ix.indisunique
             FROM pg_index ix
             JOIN pg_class i ON i.oid = ix.indexrelid
             JOIN pg_class c ON c.oid = ix.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_am am ON am.oid = i.relam
             WHERE n.nspname = $1 AND c.relname = $2
               AND NOT ix.indisprimary
               AND NOT EXISTS (
                   SELECT 1 FROM pg_constraint con
                   WHERE con.conindid = ix.indexrelid AND con.contype IN ('p', 'u', 'x')
               )
             ORDER BY i.relname",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| index_from_definition(r.get(0), &r.get::<_, String>(1), r.get(2), r.get(3)))
        .collect())
}

/// Parse a `pg_get_indexdef()` result, degrading to an unparsed descriptor.
pub fn index_from_definition(name: String, definition: &str, method: String, unique: bool) -> Index {
    match parse_index_definition(definition) {
        Ok(parsed) => Index {
            name,
            ..parsed.index
        },
        Err(e) => {
            log::warn!(
                "Could not parse index definition, treating as unchanged; index={}, error={}",
                name,
                e
            );
            Index {
                name,
                method: if method == "btree" { String::new() } else { method },
                unique,
                unparsed: true,
                ..Default::default()
            }
        }
    }
}

async fn query_constraints(client: &Client, schema: &str, table: &str) -> Result<Vec<Constraint>> {
    let rows = client
        .query(
            "SELECT con.conname::text,
                    con.contype::text,
                    pg_get_constraintdef(con.oid),
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    )
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2 AND con.contype IN ('c', 'u')
             ORDER BY con.conname",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| {
            let name: String = r.get(0);
            let kind: String = r.get(1);
            if kind == "u" {
                let columns: Vec<String> = r.get(3);
                let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
                Constraint::unique(name, &cols)
            } else {
                check_from_definition(name, &r.get::<_, String>(2))
            }
        })
        .collect())
}

/// Build a CHECK constraint from `pg_get_constraintdef()`, keeping the raw
/// text when it cannot be unwrapped.
pub fn check_from_definition(name: String, definition: &str) -> Constraint {
    match unwrap_check(definition) {
        Some(expression) => Constraint::check(name, expression),
        None => {
            log::warn!(
                "Could not unwrap CHECK definition, keeping raw text; constraint={}",
                name
            );
            Constraint::check(name, definition.trim())
        }
    }
}

/// Enum types used by the table's columns, directly or as array elements.
async fn query_enum_types(client: &Client, schema: &str, table: &str) -> Result<Vec<EnumType>> {
    let rows = client
        .query(
            "SELECT t.typname::text,
                    ARRAY(
                        SELECT e.enumlabel::text FROM pg_enum e
                        WHERE e.enumtypid = t.oid
                        ORDER BY e.enumsortorder
                    )
             FROM pg_type t
             WHERE t.typtype = 'e'
               AND t.oid IN (
                   SELECT CASE WHEN at.typcategory = 'A' THEN at.typelem ELSE at.oid END
                   FROM pg_attribute a
                   JOIN pg_class c ON c.oid = a.attrelid
                   JOIN pg_namespace n ON n.oid = c.relnamespace
                   JOIN pg_type at ON at.oid = a.atttypid
                   WHERE n.nspname = $1 AND c.relname = $2
                     AND a.attnum > 0 AND NOT a.attisdropped
               )
             ORDER BY t.typname",
            &[&schema, &table],
        )
        .await?;

    let mut seen: BTreeMap<String, EnumType> = BTreeMap::new();
    for r in &rows {
        let name: String = r.get(0);
        let values: Vec<String> = r.get(1);
        seen.entry(name.clone())
            .or_insert(EnumType { name, values });
    }
    Ok(seen.into_values().collect())
}
