//! Turn a `SchemaDiff` into ordered up/down SQL.
//!
//! Up order: create enum types, append enum values, create tables (each
//! followed by its indexes, referenced tables first), alter tables, drop
//! tables (dependents first), drop enum types. The down plan is the plan
//! of the inverted diff.

use serde::Serialize;

use crate::conversion::{alter_column_type, MANUAL_REVIEW_MARKER};
use crate::db::{ident, quote_ident};
use crate::dependency::DependencyGraph;
use crate::diff::{ColumnChange, SchemaDiff, TableDiff};
use crate::model::{
    Column, Constraint, ConstraintKind, EnumType, ForeignKey, Index, IndexTarget, PrimaryKey,
    NullsOrder, ReferentialAction, SortDirection, Table,
};
use crate::normalize::{is_serial_type, normalize_type};

/// Forward and reverse SQL for one migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub up: Vec<String>,
    pub down: Vec<String>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.up.is_empty() && self.down.is_empty()
    }

    pub fn up_sql(&self) -> String {
        render(&self.up)
    }

    pub fn down_sql(&self) -> String {
        render(&self.down)
    }
}

/// Join statements into file content, one statement per line.
pub fn render(statements: &[String]) -> String {
    if statements.is_empty() {
        return String::new();
    }
    let mut out = statements.join("\n");
    out.push('\n');
    out
}

/// SQL generator. With `idempotent` set, every statement that PostgreSQL
/// allows to be guarded gets `IF [NOT] EXISTS`.
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    pub idempotent: bool,
}

impl Default for Planner {
    fn default() -> Self {
        Planner { idempotent: true }
    }
}

/// Where a column's default comes from.
enum DefaultSource<'a> {
    None,
    Expression(&'a str),
    Sequence,
}

fn default_source(column: &Column) -> DefaultSource<'_> {
    if column.is_implicit() {
        return DefaultSource::None;
    }
    match column.default.as_deref() {
        Some(d) => DefaultSource::Expression(d),
        None if column.auto_increment || is_serial_type(&column.data_type) => {
            DefaultSource::Sequence
        }
        None => DefaultSource::None,
    }
}

/// `'it''s'`
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ident_list(names: &[String]) -> String {
    names.iter().map(|n| ident(n)).collect::<Vec<_>>().join(", ")
}

fn render_collation(collation: &str) -> String {
    if collation.contains('.') || collation.starts_with('"') {
        collation.to_string()
    } else {
        quote_ident(collation)
    }
}

/// Column type as written in DDL. Enum columns use the (possibly quoted)
/// type name.
fn declared_type(column: &Column) -> String {
    match &column.enum_type {
        Some(name) => {
            let mut t = ident(name);
            let mut rest = column.data_type.trim();
            while let Some(stripped) = rest.strip_suffix("[]") {
                t.push_str("[]");
                rest = stripped.trim_end();
            }
            t
        }
        None => column.data_type.clone(),
    }
}

/// Type for `CREATE TABLE` / `ADD COLUMN`; auto-increment integers become serials.
fn create_type(column: &Column) -> String {
    if column.auto_increment && column.identity.is_none() && column.generated.is_none() {
        match normalize_type(&column.data_type).as_str() {
            "integer" => return "serial".to_string(),
            "bigint" => return "bigserial".to_string(),
            "smallint" => return "smallserial".to_string(),
            _ => {}
        }
    }
    declared_type(column)
}

/// Type for `ALTER COLUMN ... TYPE`; serial pseudo-types are not valid there.
fn alter_type(column: &Column) -> String {
    if is_serial_type(&column.data_type) {
        normalize_type(&column.data_type)
    } else {
        declared_type(column)
    }
}

fn referential_clause(fk: &ForeignKey) -> String {
    let mut out = String::new();
    if fk.on_update != ReferentialAction::NoAction {
        out.push_str(&format!(" ON UPDATE {}", fk.on_update.as_sql()));
    }
    if fk.on_delete != ReferentialAction::NoAction {
        out.push_str(&format!(" ON DELETE {}", fk.on_delete.as_sql()));
    }
    out
}

fn foreign_key_body(fk: &ForeignKey) -> String {
    format!(
        "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
        ident(&fk.name),
        ident_list(&fk.columns),
        ident(&fk.referenced_table),
        ident_list(&fk.referenced_columns),
        referential_clause(fk)
    )
}

fn constraint_body(constraint: &Constraint) -> String {
    match &constraint.kind {
        ConstraintKind::Check { expression } => format!(
            "CONSTRAINT {} CHECK ({})",
            ident(&constraint.name),
            expression
        ),
        ConstraintKind::Unique { columns } => format!(
            "CONSTRAINT {} UNIQUE ({})",
            ident(&constraint.name),
            ident_list(columns)
        ),
    }
}

fn primary_key_body(pk: &PrimaryKey) -> String {
    match &pk.name {
        Some(name) => format!(
            "CONSTRAINT {} PRIMARY KEY ({})",
            ident(name),
            ident_list(&pk.columns)
        ),
        None => format!("PRIMARY KEY ({})", ident_list(&pk.columns)),
    }
}

fn primary_key_name(table: &str, pk: &PrimaryKey) -> String {
    pk.name
        .clone()
        .unwrap_or_else(|| format!("{}_pkey", table))
}

/// Single-column UNIQUE constraints render inline on the column.
fn inline_unique_column(constraint: &Constraint) -> Option<&str> {
    match &constraint.kind {
        ConstraintKind::Unique { columns } if columns.len() == 1 => Some(columns[0].as_str()),
        _ => None,
    }
}

impl Planner {
    pub fn new(idempotent: bool) -> Self {
        Planner { idempotent }
    }

    fn if_not_exists(&self) -> &'static str {
        if self.idempotent {
            " IF NOT EXISTS"
        } else {
            ""
        }
    }

    fn if_exists(&self) -> &'static str {
        if self.idempotent {
            " IF EXISTS"
        } else {
            ""
        }
    }

    /// Plan both directions of a diff.
    pub fn plan(&self, diff: &SchemaDiff) -> MigrationPlan {
        let plan = MigrationPlan {
            up: self.statements(diff),
            down: self.statements(&diff.inverse()),
        };
        log::debug!(
            "Planned migration; up_statements={}, down_statements={}",
            plan.up.len(),
            plan.down.len()
        );
        plan
    }

    /// Forward statements for a diff, in dependency-safe order.
    pub fn statements(&self, diff: &SchemaDiff) -> Vec<String> {
        let mut out = Vec::new();

        for e in &diff.enum_types_added {
            out.push(self.create_enum(e));
        }
        for e in &diff.enum_types_modified {
            for v in &e.new_values {
                out.push(self.add_enum_value(&e.name, v));
            }
            for v in &e.removed_values {
                out.push(format!(
                    "{} enum {}: PostgreSQL cannot remove value {}; recreate the type by hand",
                    MANUAL_REVIEW_MARKER,
                    e.name,
                    quote_literal(v)
                ));
            }
        }

        if !diff.tables_added.is_empty() {
            let order = DependencyGraph::build(&diff.tables_added).topological_sort();
            let by_name = |name: &str| diff.tables_added.iter().find(|t| t.name == name);
            for name in &order.ordered {
                if let Some(table) = by_name(name) {
                    out.push(self.create_table(table));
                    for idx in &table.indexes {
                        out.push(self.create_index(&table.name, idx));
                    }
                }
            }
            // Tables in a foreign-key cycle are created bare; their keys follow.
            for name in &order.cyclic {
                if let Some(table) = by_name(name) {
                    out.push(self.create_table_with(table, false));
                    for idx in &table.indexes {
                        out.push(self.create_index(&table.name, idx));
                    }
                }
            }
            for name in &order.cyclic {
                if let Some(table) = by_name(name) {
                    for fk in &table.foreign_keys {
                        out.push(self.add_foreign_key(&table.name, fk));
                    }
                }
            }
        }

        for td in &diff.tables_modified {
            out.extend(self.alter_table(td));
        }

        if !diff.tables_dropped.is_empty() {
            let order = DependencyGraph::build(&diff.tables_dropped).topological_sort();
            for name in &order.cyclic {
                if let Some(table) = diff.tables_dropped.iter().find(|t| &t.name == name) {
                    for fk in &table.foreign_keys {
                        if order.cyclic.contains(&fk.referenced_table) {
                            out.push(self.drop_constraint(&table.name, &fk.name));
                        }
                    }
                }
            }
            for name in order.cyclic.iter().rev() {
                out.push(self.drop_table(name));
            }
            for name in order.ordered.iter().rev() {
                out.push(self.drop_table(name));
            }
        }

        for e in &diff.enum_types_dropped {
            out.push(self.drop_enum(&e.name));
        }

        out
    }

    /// `CREATE TABLE` including foreign keys.
    pub fn create_table(&self, table: &Table) -> String {
        self.create_table_with(table, true)
    }

    fn create_table_with(&self, table: &Table, with_foreign_keys: bool) -> String {
        let inline_pk = table
            .primary_key
            .as_ref()
            .filter(|pk| pk.columns.len() == 1);
        let inline_unique: Vec<&str> = table
            .constraints
            .iter()
            .filter_map(inline_unique_column)
            .collect();

        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut def = self.column_definition(c);
                if let Some(pk) = inline_pk.filter(|pk| pk.columns[0] == c.name) {
                    match &pk.name {
                        Some(name) if *name != format!("{}_pkey", table.name) => {
                            def.push_str(&format!(" CONSTRAINT {} PRIMARY KEY", ident(name)));
                        }
                        _ => def.push_str(" PRIMARY KEY"),
                    }
                }
                if !c.unique && inline_unique.contains(&c.name.as_str()) {
                    def.push_str(" UNIQUE");
                }
                format!("    {}", def)
            })
            .collect();

        if let Some(pk) = table.primary_key.as_ref().filter(|pk| pk.columns.len() > 1) {
            lines.push(format!("    {}", primary_key_body(pk)));
        }
        for c in &table.constraints {
            if inline_unique_column(c).is_none() {
                lines.push(format!("    {}", constraint_body(c)));
            }
        }
        if with_foreign_keys {
            for fk in &table.foreign_keys {
                lines.push(format!("    {}", foreign_key_body(fk)));
            }
        }

        format!(
            "CREATE TABLE{} {} (\n{}\n);",
            self.if_not_exists(),
            ident(&table.name),
            lines.join(",\n")
        )
    }

    /// Column definition without primary-key clauses.
    fn column_definition(&self, column: &Column) -> String {
        let mut def = format!("{} {}", ident(&column.name), create_type(column));
        if let Some(generated) = &column.generated {
            def.push_str(&format!(
                " GENERATED ALWAYS AS ({}) {}",
                generated.expression,
                generated.kind.as_sql()
            ));
        } else if let Some(identity) = &column.identity {
            def.push_str(&format!(" GENERATED {} AS IDENTITY", identity.as_sql()));
        } else {
            if !column.nullable {
                def.push_str(" NOT NULL");
            }
            let serial = create_type(column).ends_with("serial");
            if let DefaultSource::Expression(d) = default_source(column) {
                if !serial {
                    def.push_str(&format!(" DEFAULT {}", d));
                }
            }
        }
        if column.unique {
            def.push_str(" UNIQUE");
        }
        def
    }

    /// Always quoted and always guarded.
    pub fn drop_table(&self, name: &str) -> String {
        format!("DROP TABLE IF EXISTS {};", quote_ident(name))
    }

    pub fn create_index(&self, table: &str, index: &Index) -> String {
        let mut sql = String::from("CREATE ");
        if index.unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX");
        if index.concurrently {
            sql.push_str(" CONCURRENTLY");
        }
        sql.push_str(self.if_not_exists());
        sql.push_str(&format!(" {} ON {}", ident(&index.name), ident(table)));
        if !index.effective_method().eq_ignore_ascii_case("btree") {
            sql.push_str(&format!(" USING {}", index.effective_method()));
        }

        let target = match &index.target {
            IndexTarget::Expression(expr) => expr.clone(),
            IndexTarget::Columns(cols) => cols
                .iter()
                .map(|c| {
                    let mut entry = ident(c);
                    if let Some(o) = index.ordering_for(c) {
                        if let Some(collation) = &o.collation {
                            entry.push_str(&format!(" COLLATE {}", render_collation(collation)));
                        }
                        if let Some(opclass) = &o.opclass {
                            entry.push(' ');
                            entry.push_str(opclass);
                        }
                        if o.direction == SortDirection::Desc {
                            entry.push_str(" DESC");
                        }
                        match o.explicit_nulls() {
                            Some(NullsOrder::First) => entry.push_str(" NULLS FIRST"),
                            Some(NullsOrder::Last) => entry.push_str(" NULLS LAST"),
                            None => {}
                        }
                    }
                    entry
                })
                .collect::<Vec<_>>()
                .join(", "),
        };
        sql.push_str(&format!(" ({})", target));

        if !index.include.is_empty() {
            sql.push_str(&format!(" INCLUDE ({})", ident_list(&index.include)));
        }
        if let Some(predicate) = &index.predicate {
            sql.push_str(&format!(" WHERE {}", predicate));
        }
        sql.push(';');
        sql
    }

    pub fn drop_index(&self, name: &str) -> String {
        format!("DROP INDEX{} {};", self.if_exists(), ident(name))
    }

    pub fn create_enum(&self, enum_type: &EnumType) -> String {
        let values = enum_type
            .values
            .iter()
            .map(|v| quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        let create = format!("CREATE TYPE {} AS ENUM ({});", ident(&enum_type.name), values);
        if self.idempotent {
            format!(
                "DO $$ BEGIN {} EXCEPTION WHEN duplicate_object THEN null; END $$;",
                create
            )
        } else {
            create
        }
    }

    pub fn add_enum_value(&self, enum_name: &str, value: &str) -> String {
        format!(
            "ALTER TYPE {} ADD VALUE IF NOT EXISTS {};",
            ident(enum_name),
            quote_literal(value)
        )
    }

    pub fn drop_enum(&self, enum_name: &str) -> String {
        format!("DROP TYPE{} {};", self.if_exists(), ident(enum_name))
    }

    pub fn add_column(&self, table: &str, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN{} {};",
            ident(table),
            self.if_not_exists(),
            self.column_definition(column)
        )
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN{} {};",
            ident(table),
            self.if_exists(),
            ident(column)
        )
    }

    /// Statements for one modified column: drop the old default, change the
    /// type, set the new default, then nullability.
    pub fn alter_column(&self, table: &str, change: &ColumnChange) -> Vec<String> {
        let mut out = Vec::new();
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            ident(table),
            ident(&change.name)
        );
        let (from, to) = (&change.from, &change.to);

        let had_default = !matches!(default_source(from), DefaultSource::None);
        let reset_default = change.default_changed || (change.type_changed && had_default);

        if reset_default && had_default {
            out.push(format!("{} DROP DEFAULT;", prefix));
        }
        if change.type_changed {
            out.push(alter_column_type(
                table,
                &change.name,
                &from.data_type,
                &to.data_type,
                &alter_type(to),
                to.enum_type.is_some(),
            ));
        }
        if reset_default {
            match default_source(to) {
                DefaultSource::Expression(d) => {
                    out.push(format!("{} SET DEFAULT {};", prefix, d));
                }
                DefaultSource::Sequence => {
                    let seq = format!("{}_{}_seq", table, change.name);
                    out.push(format!(
                        "CREATE SEQUENCE{} {} OWNED BY {}.{};",
                        self.if_not_exists(),
                        ident(&seq),
                        ident(table),
                        ident(&change.name)
                    ));
                    out.push(format!(
                        "{} SET DEFAULT nextval({});",
                        prefix,
                        quote_literal(&ident(&seq))
                    ));
                }
                DefaultSource::None => {}
            }
        }
        if change.nullable_changed {
            if to.nullable {
                out.push(format!("{} DROP NOT NULL;", prefix));
            } else {
                out.push(format!("{} SET NOT NULL;", prefix));
            }
        }
        out
    }

    pub fn add_constraint(&self, table: &str, constraint: &Constraint) -> String {
        format!(
            "ALTER TABLE {} ADD {};",
            ident(table),
            constraint_body(constraint)
        )
    }

    pub fn drop_constraint(&self, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT{} {};",
            ident(table),
            self.if_exists(),
            ident(name)
        )
    }

    pub fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> String {
        format!("ALTER TABLE {} ADD {};", ident(table), foreign_key_body(fk))
    }

    fn add_primary_key(&self, table: &str, pk: &PrimaryKey) -> String {
        format!("ALTER TABLE {} ADD {};", ident(table), primary_key_body(pk))
    }

    /// Statements for one modified table.
    pub fn alter_table(&self, td: &TableDiff) -> Vec<String> {
        let t = td.name.as_str();
        let mut out = Vec::new();

        // 1. drop what depends on columns that may change
        for fk in &td.foreign_keys_dropped {
            out.push(self.drop_constraint(t, &fk.name));
        }
        for change in &td.foreign_keys_modified {
            out.push(self.drop_constraint(t, &change.from.name));
        }
        for c in &td.constraints_dropped {
            out.push(self.drop_constraint(t, &c.name));
        }
        for change in &td.constraints_modified {
            out.push(self.drop_constraint(t, &change.from.name));
        }
        for idx in &td.indexes_dropped {
            out.push(self.drop_index(&idx.name));
        }
        for change in &td.indexes_modified {
            out.push(self.drop_index(&change.from.name));
        }
        if let Some(pk) = td.primary_key_change.as_ref().and_then(|c| c.from.as_ref()) {
            out.push(self.drop_constraint(t, &primary_key_name(t, pk)));
        }

        // 2-4. columns
        for c in &td.columns_added {
            out.push(self.add_column(t, c));
        }
        for change in &td.columns_modified {
            out.extend(self.alter_column(t, change));
        }
        for c in &td.columns_dropped {
            out.push(self.drop_column(t, &c.name));
        }

        // 5. re-add
        if let Some(pk) = td.primary_key_change.as_ref().and_then(|c| c.to.as_ref()) {
            out.push(self.add_primary_key(t, pk));
        }
        for c in &td.constraints_added {
            out.push(self.add_constraint(t, c));
        }
        for change in &td.constraints_modified {
            out.push(self.add_constraint(t, &change.to));
        }
        for idx in &td.indexes_added {
            out.push(self.create_index(t, idx));
        }
        for change in &td.indexes_modified {
            out.push(self.create_index(t, &change.to));
        }
        for fk in &td.foreign_keys_added {
            out.push(self.add_foreign_key(t, fk));
        }
        for change in &td.foreign_keys_modified {
            out.push(self.add_foreign_key(t, &change.to));
        }

        out
    }
}
