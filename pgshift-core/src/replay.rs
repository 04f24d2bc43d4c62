//! Offline introspection: rebuild the schema model by replaying forward
//! migration files in version order against an in-memory model.
//!
//! Only the DDL that shapes tables and enum types is understood:
//! `CREATE/DROP TABLE`, `ALTER TABLE` column and constraint actions,
//! `CREATE/DROP INDEX`, and `CREATE/ALTER/DROP TYPE ... ENUM` (including
//! the `DO $$ ... $$` wrapper the planner emits). Anything else is skipped.
//! A statement that looks supported but cannot be parsed is logged and
//! skipped; replay never aborts on one statement.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::ddl_parser::{
    extract_balanced, parse_index_definition, split_top_level, tokenize, Parser, Token,
};
use crate::error::Result;
use crate::migration::{scan_migrations, Migration};
use crate::model::{
    Column, Constraint, ConstraintKind, EnumType, ForeignKey, GeneratedColumn, GeneratedKind,
    IdentityKind, IndexTarget, PrimaryKey, ReferentialAction, SchemaModel, Table,
};
use crate::normalize::{collapse_whitespace, is_nextval_default, is_serial_type, normalize_type};
use crate::sql_parser::{executable_statements, strip_comments};

static DO_CREATE_ENUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bcreate\s+type\s+.+?\s+as\s+enum\s*\(").unwrap()
});

/// Key words that end a column's type (and a DEFAULT expression).
const COLUMN_CONSTRAINT_WORDS: &[&str] = &[
    "constraint",
    "not",
    "null",
    "default",
    "primary",
    "unique",
    "check",
    "references",
    "generated",
    "collate",
    "deferrable",
    "initially",
];

fn is_constraint_word(t: &Token) -> bool {
    COLUMN_CONSTRAINT_WORDS.iter().any(|kw| t.is_keyword(kw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    CreateTable,
    CreateIndex,
    CreateType,
    AlterTable,
    AlterType,
    DropTable,
    DropIndex,
    DropType,
    DoBlock,
    Other,
}

fn statement_kind(stmt: &str) -> StatementKind {
    let words: Vec<String> = stmt
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|w| !w.is_empty())
        .take(4)
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let w = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

    match (w(0), w(1)) {
        ("create", "table") => StatementKind::CreateTable,
        ("create", "index") => StatementKind::CreateIndex,
        ("create", "unique") if w(2) == "index" => StatementKind::CreateIndex,
        ("create", "type") => StatementKind::CreateType,
        ("alter", "table") => StatementKind::AlterTable,
        ("alter", "type") => StatementKind::AlterType,
        ("drop", "table") => StatementKind::DropTable,
        ("drop", "index") => StatementKind::DropIndex,
        ("drop", "type") => StatementKind::DropType,
        ("do", _) => StatementKind::DoBlock,
        _ => StatementKind::Other,
    }
}

/// Replay every forward migration in `dir`.
pub fn replay_directory(dir: &Path) -> Result<SchemaModel> {
    let migrations = scan_migrations(dir)?;
    Ok(replay_migrations(&migrations))
}

/// Replay forward SQL in version order.
pub fn replay_migrations(migrations: &[Migration]) -> SchemaModel {
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by(|a, b| a.version.cmp(&b.version));

    let mut replayer = Replayer::new();
    for m in ordered {
        log::debug!("Replaying migration; version={}, name={}", m.version, m.name);
        replayer.apply_sql(&m.up_sql);
    }
    replayer.finish()
}

/// In-memory model that DDL statements are applied to.
#[derive(Debug, Default)]
pub struct Replayer {
    tables: BTreeMap<String, Table>,
    enums: BTreeMap<String, EnumType>,
}

impl Replayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every statement of a SQL script.
    pub fn apply_sql(&mut self, sql: &str) {
        for stmt in executable_statements(sql) {
            let code = strip_comments(stmt);
            if let Err(e) = self.apply_statement(code.trim()) {
                log::warn!(
                    "Could not replay statement, skipping; statement={}, error={}",
                    first_line(&code),
                    e
                );
            }
        }
    }

    /// Apply one statement without comments.
    pub fn apply_statement(&mut self, stmt: &str) -> Result<()> {
        match statement_kind(stmt) {
            StatementKind::CreateTable => self.create_table(stmt),
            StatementKind::CreateIndex => self.create_index(stmt),
            StatementKind::CreateType => self.create_type(stmt),
            StatementKind::AlterTable => self.alter_table(stmt),
            StatementKind::AlterType => self.alter_type(stmt),
            StatementKind::DropTable => self.drop_tables(stmt),
            StatementKind::DropIndex => self.drop_indexes(stmt),
            StatementKind::DropType => self.drop_types(stmt),
            StatementKind::DoBlock => self.do_block(stmt),
            StatementKind::Other => {
                log::debug!("Skipping unsupported statement; statement={}", first_line(stmt));
                Ok(())
            }
        }
    }

    /// The replayed model, with enum references resolved.
    pub fn finish(self) -> SchemaModel {
        let mut model = SchemaModel::new();
        for (_, mut table) in self.tables {
            let mut used: Vec<EnumType> = Vec::new();
            for col in &mut table.columns {
                let base = col.data_type.trim_end_matches("[]").trim();
                col.enum_type = match self.enums.get(base) {
                    Some(e) => {
                        if !used.iter().any(|u| u.name == e.name) {
                            used.push(e.clone());
                        }
                        Some(e.name.clone())
                    }
                    None => None,
                };
            }
            table.enum_types = used;
            model.insert(table);
        }
        model
    }

    fn create_table(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("create")?;
        p.eat_keyword("global");
        p.eat_keyword("local");
        if p.eat_keyword("temporary") || p.eat_keyword("temp") {
            log::debug!("Skipping temporary table; statement={}", first_line(stmt));
            return Ok(());
        }
        p.eat_keyword("unlogged");
        p.expect_keyword("table")?;
        let if_not_exists = p.eat_keywords(&["if", "not", "exists"]);
        let (_, name) = p.qualified_name()?;

        if self.tables.contains_key(&name) {
            if if_not_exists {
                return Ok(());
            }
            log::warn!("CREATE TABLE replaces an existing table; table={}", name);
        }

        let body = p.paren_group()?;
        let mut table = Table::new(&name);
        for element in split_top_level(body, b',') {
            self.table_element(&mut table, element)?;
        }
        self.tables.insert(name, table);
        Ok(())
    }

    fn table_element(&self, table: &mut Table, element: &str) -> Result<()> {
        let mut p = Parser::new(element)?;
        if p.eat_keyword("constraint") {
            let name = p.identifier()?;
            return self.table_constraint(table, Some(name), &mut p);
        }
        if starts_table_constraint(&p) {
            return self.table_constraint(table, None, &mut p);
        }
        if p.peek().is_some_and(|t| t.is_keyword("like") || t.is_keyword("exclude")) {
            log::debug!("Skipping table element; element={}", element);
            return Ok(());
        }
        let column = self.column_definition(table, &mut p)?;
        table.columns.push(column);
        Ok(())
    }

    /// `PRIMARY KEY (...)`, `UNIQUE (...)`, `CHECK (...)` or `FOREIGN KEY (...) REFERENCES ...`.
    fn table_constraint(&self, table: &mut Table, name: Option<String>, p: &mut Parser) -> Result<()> {
        if p.eat_keywords(&["primary", "key"]) {
            let columns = ident_list(p.paren_group()?)?;
            for c in &columns {
                if let Some(col) = table.column_mut(c) {
                    col.nullable = false;
                }
            }
            table.primary_key = Some(PrimaryKey {
                name: Some(name.unwrap_or_else(|| format!("{}_pkey", table.name))),
                columns,
            });
        } else if p.eat_keyword("unique") {
            p.eat_keywords(&["nulls", "not", "distinct"]);
            p.eat_keywords(&["nulls", "distinct"]);
            let columns = ident_list(p.paren_group()?)?;
            let name =
                name.unwrap_or_else(|| format!("{}_{}_key", table.name, columns.join("_")));
            table.constraints.retain(|c| c.name != name);
            table.constraints.push(Constraint {
                name,
                kind: ConstraintKind::Unique { columns },
            });
        } else if p.eat_keyword("check") {
            let expression = p.paren_group()?.trim().to_string();
            let name = name.unwrap_or_else(|| format!("{}_check", table.name));
            table.constraints.retain(|c| c.name != name);
            table.constraints.push(Constraint::check(name, expression));
        } else if p.eat_keywords(&["foreign", "key"]) {
            let columns = ident_list(p.paren_group()?)?;
            let (referenced_table, referenced_columns, on_update, on_delete) =
                self.references(table, p)?;
            let name =
                name.unwrap_or_else(|| format!("{}_{}_fkey", table.name, columns.join("_")));
            table.foreign_keys.retain(|fk| fk.name != name);
            table.foreign_keys.push(ForeignKey {
                name,
                columns,
                referenced_table,
                referenced_columns,
                on_update,
                on_delete,
            });
        } else {
            return Err(p.error("unsupported table constraint"));
        }
        Ok(())
    }

    /// `name type [column constraints...]`. Constraints that live on the
    /// table (primary key, named UNIQUE, CHECK, REFERENCES) are added to `table`.
    fn column_definition(&self, table: &mut Table, p: &mut Parser) -> Result<Column> {
        let name = p.identifier()?;
        let raw_type = p.text_until(is_constraint_word);
        if raw_type.is_empty() {
            return Err(p.error("expected column type"));
        }
        let data_type = clean_type(raw_type);

        let mut col = Column::new(&name, data_type.as_str());
        if is_serial_type(&data_type) {
            col.data_type = normalize_type(&data_type);
            col.auto_increment = true;
            col.nullable = false;
        }

        let mut pending: Option<String> = None;
        while !p.at_end() {
            if p.eat_keyword("constraint") {
                pending = Some(p.identifier()?);
            } else if p.eat_keywords(&["not", "null"]) {
                col.nullable = false;
            } else if p.eat_keyword("null") {
                col.nullable = true;
            } else if p.eat_keyword("default") {
                let expr = p.text_until(is_constraint_word);
                set_default(&mut col, expr);
            } else if p.eat_keywords(&["primary", "key"]) {
                col.nullable = false;
                table.primary_key = Some(PrimaryKey {
                    name: Some(
                        pending
                            .take()
                            .unwrap_or_else(|| format!("{}_pkey", table.name)),
                    ),
                    columns: vec![name.clone()],
                });
            } else if p.eat_keyword("unique") {
                p.eat_keywords(&["nulls", "not", "distinct"]);
                match pending.take() {
                    Some(cname) => table.constraints.push(Constraint::unique(cname, &[&name])),
                    None => col.unique = true,
                }
            } else if p.eat_keyword("check") {
                let expression = p.paren_group()?.trim().to_string();
                let cname = pending
                    .take()
                    .unwrap_or_else(|| format!("{}_{}_check", table.name, name));
                table.constraints.push(Constraint::check(cname, expression));
            } else if p.peek().is_some_and(|t| t.is_keyword("references")) {
                let (referenced_table, referenced_columns, on_update, on_delete) =
                    self.references(table, p)?;
                let fname = pending
                    .take()
                    .unwrap_or_else(|| format!("{}_{}_fkey", table.name, name));
                table.foreign_keys.push(ForeignKey {
                    name: fname,
                    columns: vec![name.clone()],
                    referenced_table,
                    referenced_columns,
                    on_update,
                    on_delete,
                });
            } else if p.eat_keyword("generated") {
                if p.eat_keywords(&["always", "as", "identity"]) {
                    col.identity = Some(IdentityKind::Always);
                    skip_paren_group(p)?;
                } else if p.eat_keywords(&["by", "default", "as", "identity"]) {
                    col.identity = Some(IdentityKind::ByDefault);
                    skip_paren_group(p)?;
                } else if p.eat_keywords(&["always", "as"]) {
                    let expression = p.paren_group()?.trim().to_string();
                    let kind = if p.eat_keyword("virtual") {
                        GeneratedKind::Virtual
                    } else {
                        p.eat_keyword("stored");
                        GeneratedKind::Stored
                    };
                    col.generated = Some(GeneratedColumn { expression, kind });
                } else {
                    return Err(p.error("unsupported GENERATED clause"));
                }
                col.default = None;
            } else if p.eat_keyword("collate") {
                p.qualified_name()?;
            } else if p.eat_keyword("deferrable")
                || p.eat_keywords(&["not", "deferrable"])
                || p.eat_keywords(&["initially", "deferred"])
                || p.eat_keywords(&["initially", "immediate"])
            {
            } else {
                return Err(p.error("unexpected token in column definition"));
            }
        }
        Ok(col)
    }

    /// `REFERENCES table [(cols)] [MATCH x] [ON DELETE a] [ON UPDATE a]`.
    /// Without a column list the referenced table's primary key is used.
    fn references(
        &self,
        current: &Table,
        p: &mut Parser,
    ) -> Result<(String, Vec<String>, ReferentialAction, ReferentialAction)> {
        p.expect_keyword("references")?;
        let (_, referenced_table) = p.qualified_name()?;
        let referenced_columns = if p.peek() == Some(&Token::LParen) {
            ident_list(p.paren_group()?)?
        } else {
            let target = if referenced_table == current.name {
                Some(current)
            } else {
                self.tables.get(&referenced_table)
            };
            target
                .and_then(|t| t.primary_key.as_ref())
                .map(|pk| pk.columns.clone())
                .unwrap_or_else(|| vec!["id".to_string()])
        };

        let mut on_update = ReferentialAction::NoAction;
        let mut on_delete = ReferentialAction::NoAction;
        loop {
            if p.eat_keyword("match") {
                p.identifier()?;
            } else if p.eat_keywords(&["on", "delete"]) {
                on_delete = referential_action(p)?;
            } else if p.eat_keywords(&["on", "update"]) {
                on_update = referential_action(p)?;
            } else {
                break;
            }
        }
        Ok((referenced_table, referenced_columns, on_update, on_delete))
    }

    fn alter_table(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("alter")?;
        p.expect_keyword("table")?;
        p.eat_keywords(&["if", "exists"]);
        p.eat_keyword("only");
        let (_, name) = p.qualified_name()?;

        if p.eat_keywords(&["rename", "to"]) {
            let new_name = p.identifier()?;
            return self.rename_table(&name, new_name);
        }

        let Some(mut table) = self.tables.remove(&name) else {
            log::warn!("ALTER TABLE on unknown table, skipping; table={}", name);
            return Ok(());
        };
        let actions = p.rest();
        let result = split_top_level(actions, b',')
            .into_iter()
            .try_for_each(|action| self.alter_action(&mut table, action));
        self.tables.insert(name, table);
        result
    }

    fn alter_action(&self, table: &mut Table, action: &str) -> Result<()> {
        let mut p = Parser::new(action)?;

        if p.eat_keyword("add") {
            let explicit_column = p.eat_keyword("column");
            if !explicit_column {
                if p.eat_keyword("constraint") {
                    let name = p.identifier()?;
                    return self.table_constraint(table, Some(name), &mut p);
                }
                if starts_table_constraint(&p) {
                    return self.table_constraint(table, None, &mut p);
                }
            }
            let if_not_exists = p.eat_keywords(&["if", "not", "exists"]);
            if let Some(existing) = p.peek().and_then(Token::identifier) {
                if table.column(&existing).is_some() {
                    if !if_not_exists {
                        log::warn!(
                            "ADD COLUMN for an existing column, skipping; table={}, column={}",
                            table.name,
                            existing
                        );
                    }
                    return Ok(());
                }
            }
            let column = self.column_definition(table, &mut p)?;
            table.columns.push(column);
        } else if p.eat_keyword("drop") {
            if p.eat_keyword("constraint") {
                p.eat_keywords(&["if", "exists"]);
                let name = p.identifier()?;
                drop_constraint(table, &name);
            } else {
                p.eat_keyword("column");
                p.eat_keywords(&["if", "exists"]);
                let name = p.identifier()?;
                drop_column(table, &name)?;
            }
        } else if p.eat_keyword("alter") {
            p.eat_keyword("column");
            let name = p.identifier()?;
            let Some(col) = table.column_mut(&name) else {
                log::warn!(
                    "ALTER COLUMN on unknown column, skipping; table={}, column={}",
                    table.name,
                    name
                );
                return Ok(());
            };
            if p.eat_keyword("type") || p.eat_keywords(&["set", "data", "type"]) {
                let raw = p.text_until(|t| t.is_keyword("using") || t.is_keyword("collate"));
                col.data_type = clean_type(raw);
            } else if p.eat_keywords(&["set", "not", "null"]) {
                col.nullable = false;
            } else if p.eat_keywords(&["drop", "not", "null"]) {
                col.nullable = true;
            } else if p.eat_keywords(&["set", "default"]) {
                let expr = p.rest();
                set_default(col, expr);
            } else if p.eat_keywords(&["drop", "default"]) {
                col.default = None;
                col.auto_increment = false;
            } else if p.eat_keyword("drop") && p.eat_keyword("identity") {
                col.identity = None;
            } else {
                log::debug!("Skipping unsupported ALTER COLUMN action; action={}", action);
            }
        } else if p.eat_keyword("rename") {
            if p.eat_keyword("constraint") {
                let old = p.identifier()?;
                p.expect_keyword("to")?;
                let new = p.identifier()?;
                rename_constraint(table, &old, new);
            } else {
                p.eat_keyword("column");
                let old = p.identifier()?;
                p.expect_keyword("to")?;
                let new = p.identifier()?;
                rename_column(table, &old, &new);
            }
        } else {
            log::debug!("Skipping unsupported ALTER TABLE action; action={}", action);
        }
        Ok(())
    }

    fn rename_table(&mut self, old: &str, new: String) -> Result<()> {
        let Some(mut table) = self.tables.remove(old) else {
            log::warn!("RENAME of unknown table, skipping; table={}", old);
            return Ok(());
        };
        table.name = new.clone();
        for t in self.tables.values_mut() {
            for fk in &mut t.foreign_keys {
                if fk.referenced_table == old {
                    fk.referenced_table = new.clone();
                }
            }
        }
        for fk in &mut table.foreign_keys {
            if fk.referenced_table == old {
                fk.referenced_table = new.clone();
            }
        }
        self.tables.insert(new, table);
        Ok(())
    }

    fn create_index(&mut self, stmt: &str) -> Result<()> {
        let def = parse_index_definition(stmt)?;
        let Some(table) = self.tables.get_mut(&def.table) else {
            log::warn!(
                "CREATE INDEX on unknown table, skipping; table={}, index={}",
                def.table,
                def.index.name
            );
            return Ok(());
        };
        if table.indexes.iter().any(|i| i.name == def.index.name) {
            if def.if_not_exists {
                return Ok(());
            }
            table.indexes.retain(|i| i.name != def.index.name);
        }
        table.indexes.push(def.index);
        Ok(())
    }

    fn drop_indexes(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("drop")?;
        p.expect_keyword("index")?;
        p.eat_keyword("concurrently");
        p.eat_keywords(&["if", "exists"]);
        for name in name_list(&mut p)? {
            for table in self.tables.values_mut() {
                table.indexes.retain(|i| i.name != name);
            }
        }
        Ok(())
    }

    fn drop_tables(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("drop")?;
        p.expect_keyword("table")?;
        p.eat_keywords(&["if", "exists"]);
        let names = name_list(&mut p)?;
        for name in &names {
            if self.tables.remove(name).is_none() {
                log::debug!("DROP TABLE of unknown table; table={}", name);
            }
        }
        // Dropping a referenced table removes the referencing keys (CASCADE,
        // or the statement would have failed).
        for table in self.tables.values_mut() {
            table
                .foreign_keys
                .retain(|fk| !names.contains(&fk.referenced_table));
        }
        Ok(())
    }

    fn create_type(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("create")?;
        p.expect_keyword("type")?;
        let (_, name) = p.qualified_name()?;
        if !p.eat_keywords(&["as", "enum"]) {
            log::debug!("Skipping non-enum type; type={}", name);
            return Ok(());
        }
        let values = string_list(p.paren_group()?)?;
        if self.enums.contains_key(&name) {
            log::warn!("CREATE TYPE for an existing enum, keeping the first; type={}", name);
            return Ok(());
        }
        self.enums.insert(name.clone(), EnumType { name, values });
        Ok(())
    }

    /// Only the planner's guarded `CREATE TYPE ... AS ENUM` wrapper is understood.
    fn do_block(&mut self, stmt: &str) -> Result<()> {
        let Some(m) = DO_CREATE_ENUM_RE.find(stmt) else {
            log::debug!("Skipping DO block; statement={}", first_line(stmt));
            return Ok(());
        };
        let open = m.end() - 1;
        let Some((_, end)) = extract_balanced(stmt, open) else {
            return Err(crate::error::PgshiftError::DdlParseError(
                "unbalanced enum value list in DO block".to_string(),
            ));
        };
        self.create_type(&stmt[m.start()..end])
    }

    fn alter_type(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("alter")?;
        p.expect_keyword("type")?;
        let (_, name) = p.qualified_name()?;

        if p.eat_keywords(&["rename", "to"]) {
            let new_name = p.identifier()?;
            if let Some(mut e) = self.enums.remove(&name) {
                e.name = new_name.clone();
                self.enums.insert(new_name.clone(), e);
                for table in self.tables.values_mut() {
                    for col in &mut table.columns {
                        let base = col.data_type.trim_end_matches("[]");
                        if base == name {
                            let suffix = &col.data_type[base.len()..];
                            col.data_type = format!("{}{}", new_name, suffix);
                        }
                    }
                }
            }
            return Ok(());
        }

        let Some(e) = self.enums.get_mut(&name) else {
            log::debug!("ALTER TYPE on unknown enum, skipping; type={}", name);
            return Ok(());
        };

        if p.eat_keywords(&["add", "value"]) {
            let if_not_exists = p.eat_keywords(&["if", "not", "exists"]);
            let value = p.string_literal()?;
            if e.values.contains(&value) {
                if !if_not_exists {
                    log::warn!("Enum value already present; type={}, value={}", name, value);
                }
                return Ok(());
            }
            let position = if p.eat_keyword("before") {
                let anchor = p.string_literal()?;
                e.values.iter().position(|v| *v == anchor)
            } else if p.eat_keyword("after") {
                let anchor = p.string_literal()?;
                e.values.iter().position(|v| *v == anchor).map(|i| i + 1)
            } else {
                None
            };
            match position {
                Some(i) => e.values.insert(i, value),
                None => e.values.push(value),
            }
        } else if p.eat_keywords(&["rename", "value"]) {
            let old = p.string_literal()?;
            p.expect_keyword("to")?;
            let new = p.string_literal()?;
            if let Some(v) = e.values.iter_mut().find(|v| **v == old) {
                *v = new;
            }
        } else {
            log::debug!("Skipping unsupported ALTER TYPE; statement={}", first_line(stmt));
        }
        Ok(())
    }

    fn drop_types(&mut self, stmt: &str) -> Result<()> {
        let mut p = Parser::new(stmt)?;
        p.expect_keyword("drop")?;
        p.expect_keyword("type")?;
        p.eat_keywords(&["if", "exists"]);
        for name in name_list(&mut p)? {
            self.enums.remove(&name);
        }
        Ok(())
    }
}

fn first_line(stmt: &str) -> &str {
    stmt.trim().lines().next().unwrap_or("")
}

fn starts_table_constraint(p: &Parser) -> bool {
    p.peek().is_some_and(|t| {
        t.is_keyword("primary")
            || t.is_keyword("unique")
            || t.is_keyword("check")
            || t.is_keyword("foreign")
    })
}

fn skip_paren_group(p: &mut Parser) -> Result<()> {
    if p.peek() == Some(&Token::LParen) {
        p.paren_group()?;
    }
    Ok(())
}

/// Comma-separated (possibly qualified) names, ignoring a trailing CASCADE/RESTRICT.
fn name_list(p: &mut Parser) -> Result<Vec<String>> {
    let mut names = Vec::new();
    loop {
        let (_, name) = p.qualified_name()?;
        names.push(name);
        if p.peek() == Some(&Token::Comma) {
            p.pos += 1;
        } else {
            break;
        }
    }
    Ok(names)
}

fn ident_list(inner: &str) -> Result<Vec<String>> {
    split_top_level(inner, b',')
        .into_iter()
        .map(|part| {
            let mut p = Parser::new(part)?;
            p.identifier()
        })
        .collect()
}

fn string_list(inner: &str) -> Result<Vec<String>> {
    split_top_level(inner, b',')
        .into_iter()
        .map(|part| {
            let mut p = Parser::new(part)?;
            p.string_literal()
        })
        .collect()
}

fn referential_action(p: &mut Parser) -> Result<ReferentialAction> {
    if p.eat_keyword("cascade") {
        Ok(ReferentialAction::Cascade)
    } else if p.eat_keyword("restrict") {
        Ok(ReferentialAction::Restrict)
    } else if p.eat_keywords(&["set", "null"]) {
        Ok(ReferentialAction::SetNull)
    } else if p.eat_keywords(&["set", "default"]) {
        Ok(ReferentialAction::SetDefault)
    } else if p.eat_keywords(&["no", "action"]) {
        Ok(ReferentialAction::NoAction)
    } else {
        Err(p.error("expected referential action"))
    }
}

/// A sequence default marks the column auto-increment instead of storing the text.
fn set_default(col: &mut Column, expr: &str) {
    if is_nextval_default(expr) {
        col.auto_increment = true;
        col.default = None;
    } else {
        col.default = Some(expr.to_string());
    }
}

/// Type text as PostgreSQL would fold it: unquoted parts lower-cased,
/// quotes removed, schema qualifier dropped.
fn clean_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if in_quotes => out.push(c),
            c => out.extend(c.to_lowercase()),
        }
    }
    let out = collapse_whitespace(&out);
    let head_end = out.find('(').unwrap_or(out.len());
    match out[..head_end].rfind('.') {
        Some(dot) => out[dot + 1..].to_string(),
        None => out,
    }
}

fn drop_column(table: &mut Table, name: &str) -> Result<()> {
    let before = table.columns.len();
    table.columns.retain(|c| c.name != name);
    if table.columns.len() == before {
        log::debug!(
            "DROP COLUMN of unknown column; table={}, column={}",
            table.name,
            name
        );
        return Ok(());
    }

    let owns = |cols: &[String]| cols.iter().any(|c| c == name);
    if table.primary_key.as_ref().is_some_and(|pk| owns(&pk.columns)) {
        table.primary_key = None;
    }
    table
        .indexes
        .retain(|i| !owns(i.columns()) && !owns(&i.include) && !expression_mentions(i.expression(), name));
    table.foreign_keys.retain(|fk| !owns(&fk.columns));
    let mut keep = Vec::with_capacity(table.constraints.len());
    for c in table.constraints.drain(..) {
        let dropped = match &c.kind {
            ConstraintKind::Unique { columns } => owns(columns),
            ConstraintKind::Check { expression } => expression_mentions(Some(expression), name),
        };
        if !dropped {
            keep.push(c);
        }
    }
    table.constraints = keep;
    Ok(())
}

fn expression_mentions(expression: Option<&str>, column: &str) -> bool {
    let Some(expression) = expression else {
        return false;
    };
    match tokenize(expression) {
        Ok(tokens) => tokens
            .iter()
            .any(|t| t.token.identifier().as_deref() == Some(column)),
        Err(_) => false,
    }
}

fn drop_constraint(table: &mut Table, name: &str) {
    let pk_name = format!("{}_pkey", table.name);
    if table
        .primary_key
        .as_ref()
        .is_some_and(|pk| pk.name.as_deref().unwrap_or(&pk_name) == name)
    {
        table.primary_key = None;
        return;
    }
    let before = table.constraints.len() + table.foreign_keys.len();
    table.constraints.retain(|c| c.name != name);
    table.foreign_keys.retain(|fk| fk.name != name);
    if table.constraints.len() + table.foreign_keys.len() < before {
        return;
    }
    // Inline UNIQUE gets PostgreSQL's default name.
    let table_name = table.name.clone();
    if let Some(col) = table
        .columns
        .iter_mut()
        .find(|c| c.unique && format!("{}_{}_key", table_name, c.name) == name)
    {
        col.unique = false;
    }
}

fn rename_constraint(table: &mut Table, old: &str, new: String) {
    if let Some(pk) = table.primary_key.as_mut() {
        if pk.name.as_deref() == Some(old) {
            pk.name = Some(new);
            return;
        }
    }
    if let Some(c) = table.constraints.iter_mut().find(|c| c.name == old) {
        c.name = new;
    } else if let Some(fk) = table.foreign_keys.iter_mut().find(|fk| fk.name == old) {
        fk.name = new;
    }
}

fn rename_column(table: &mut Table, old: &str, new: &str) {
    let rename = |cols: &mut Vec<String>| {
        for c in cols.iter_mut() {
            if c == old {
                *c = new.to_string();
            }
        }
    };
    if let Some(col) = table.column_mut(old) {
        col.name = new.to_string();
    }
    if let Some(pk) = table.primary_key.as_mut() {
        rename(&mut pk.columns);
    }
    for idx in &mut table.indexes {
        if let IndexTarget::Columns(cols) = &mut idx.target {
            rename(cols);
        }
        rename(&mut idx.include);
        for o in &mut idx.orderings {
            if o.column == old {
                o.column = new.to_string();
            }
        }
    }
    for fk in &mut table.foreign_keys {
        rename(&mut fk.columns);
    }
    for c in &mut table.constraints {
        if let ConstraintKind::Unique { columns } = &mut c.kind {
            rename(columns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::compare;
    use crate::model::{Index, IndexColumnOrder, SortDirection};
    use crate::plan::Planner;

    fn replay(sql: &str) -> SchemaModel {
        let mut r = Replayer::new();
        r.apply_sql(sql);
        r.finish()
    }

    #[test]
    fn test_create_table_inline_constraints() {
        let model = replay(
            "CREATE TABLE users (
                id serial PRIMARY KEY,
                email VARCHAR(255) NOT NULL UNIQUE,
                age integer CHECK (age >= 0),
                org_id integer REFERENCES orgs (id) ON DELETE SET NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            );",
        );
        let users = model.table("users").unwrap();

        let id = users.column("id").unwrap();
        assert_eq!(id.data_type, "integer");
        assert!(id.auto_increment);
        assert!(!id.nullable);
        assert_eq!(
            users.primary_key,
            Some(PrimaryKey {
                name: Some("users_pkey".to_string()),
                columns: vec!["id".to_string()],
            })
        );

        let email = users.column("email").unwrap();
        assert_eq!(email.data_type, "varchar(255)");
        assert!(email.unique);
        assert!(!email.nullable);

        assert_eq!(
            users.constraints,
            vec![Constraint::check("users_age_check", "age >= 0")]
        );
        assert_eq!(users.foreign_keys[0].name, "users_org_id_fkey");
        assert_eq!(users.foreign_keys[0].on_delete, ReferentialAction::SetNull);
        assert_eq!(
            users.column("created_at").unwrap().default.as_deref(),
            Some("now()")
        );
    }

    #[test]
    fn test_table_level_constraints_and_default_names() {
        let model = replay(
            r#"CREATE TABLE "Line Items" (
                order_id bigint,
                sku text,
                qty int NOT NULL,
                PRIMARY KEY (order_id, sku),
                UNIQUE (sku, qty),
                CONSTRAINT qty_positive CHECK ((qty > 0)),
                FOREIGN KEY (order_id) REFERENCES orders ON UPDATE CASCADE
            );"#,
        );
        let t = model.table("Line Items").unwrap();
        let pk = t.primary_key.as_ref().unwrap();
        assert_eq!(pk.name.as_deref(), Some("Line Items_pkey"));
        assert_eq!(pk.columns, vec!["order_id", "sku"]);
        assert!(!t.column("sku").unwrap().nullable);
        assert_eq!(t.constraints[0], Constraint::unique("Line Items_sku_qty_key", &["sku", "qty"]));
        assert_eq!(t.constraints[1], Constraint::check("qty_positive", "(qty > 0)"));
        let fk = &t.foreign_keys[0];
        assert_eq!(fk.referenced_columns, vec!["id"]);
        assert_eq!(fk.on_update, ReferentialAction::Cascade);
    }

    #[test]
    fn test_alter_table_actions() {
        let model = replay(
            "CREATE TABLE t (id int PRIMARY KEY, a text, b text UNIQUE);
             ALTER TABLE t ADD COLUMN IF NOT EXISTS c integer NOT NULL DEFAULT 0;
             ALTER TABLE t ADD COLUMN IF NOT EXISTS c integer;
             ALTER TABLE t ALTER COLUMN a TYPE varchar(20) USING a::varchar(20);
             ALTER TABLE t ALTER COLUMN a SET NOT NULL, ALTER COLUMN c DROP DEFAULT;
             ALTER TABLE t DROP CONSTRAINT t_b_key;
             ALTER TABLE t ADD CONSTRAINT t_a_key UNIQUE (a);
             ALTER TABLE t DROP COLUMN IF EXISTS b;",
        );
        let t = model.table("t").unwrap();
        let names: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "a", "c"]);

        let a = t.column("a").unwrap();
        assert_eq!(a.data_type, "varchar(20)");
        assert!(!a.nullable);
        let c = t.column("c").unwrap();
        assert!(!c.nullable);
        assert_eq!(c.default, None);
        assert_eq!(t.constraints, vec![Constraint::unique("t_a_key", &["a"])]);
    }

    #[test]
    fn test_drop_column_takes_dependents() {
        let model = replay(
            "CREATE TABLE t (id int, a int, b int, CONSTRAINT a_pos CHECK (a > 0));
             CREATE INDEX t_a_b_idx ON t (a, b);
             CREATE INDEX t_b_idx ON t (b);
             ALTER TABLE t DROP COLUMN a;",
        );
        let t = model.table("t").unwrap();
        assert!(t.constraints.is_empty());
        assert_eq!(t.indexes.len(), 1);
        assert_eq!(t.indexes[0].name, "t_b_idx");
    }

    #[test]
    fn test_sequence_default_becomes_auto_increment() {
        let model = replay(
            "CREATE TABLE t (id integer NOT NULL);
             CREATE SEQUENCE IF NOT EXISTS t_id_seq OWNED BY t.id;
             ALTER TABLE t ALTER COLUMN id SET DEFAULT nextval('t_id_seq');",
        );
        let id = model.table("t").unwrap().column("id").unwrap().clone();
        assert!(id.auto_increment);
        assert_eq!(id.default, None);
    }

    #[test]
    fn test_enum_lifecycle() {
        let model = replay(
            "DO $$ BEGIN CREATE TYPE mood AS ENUM ('happy', 'sad'); EXCEPTION WHEN duplicate_object THEN null; END $$;
             ALTER TYPE mood ADD VALUE IF NOT EXISTS 'meh' BEFORE 'sad';
             ALTER TYPE mood ADD VALUE IF NOT EXISTS 'happy';
             CREATE TYPE unused AS ENUM ('x');
             CREATE TABLE people (id int, feeling mood, history mood[]);
             DROP TYPE IF EXISTS unused;",
        );
        let people = model.table("people").unwrap();
        assert_eq!(
            people.enum_types,
            vec![EnumType::new("mood", &["happy", "meh", "sad"])]
        );
        assert_eq!(people.column("feeling").unwrap().enum_type.as_deref(), Some("mood"));
        assert_eq!(people.column("history").unwrap().enum_type.as_deref(), Some("mood"));
        assert_eq!(people.column("id").unwrap().enum_type, None);
    }

    #[test]
    fn test_indexes_and_drops() {
        let model = replay(
            "CREATE TABLE a (id int PRIMARY KEY);
             CREATE TABLE b (id int PRIMARY KEY, a_id int REFERENCES a);
             CREATE UNIQUE INDEX IF NOT EXISTS b_a_idx ON public.b USING hash (a_id);
             CREATE INDEX IF NOT EXISTS b_a_idx ON b (id);
             DROP TABLE IF EXISTS \"a\" CASCADE;",
        );
        assert!(model.table("a").is_none());
        let b = model.table("b").unwrap();
        assert!(b.foreign_keys.is_empty());
        assert_eq!(b.indexes.len(), 1);
        assert_eq!(b.indexes[0].method, "hash");
        assert!(b.indexes[0].unique);

        let model = replay(
            "CREATE TABLE b (id int);
             CREATE INDEX b_id_idx ON b (id);
             DROP INDEX IF EXISTS b_id_idx;",
        );
        assert!(model.table("b").unwrap().indexes.is_empty());
    }

    #[test]
    fn test_unsupported_and_broken_statements_are_skipped() {
        let model = replay(
            "CREATE EXTENSION IF NOT EXISTS pgcrypto;
             CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;
             CREATE TABLE broken (id int, CONSTRAINT);
             CREATE TABLE ok (id int);
             INSERT INTO ok VALUES (1);",
        );
        assert_eq!(model.tables.keys().collect::<Vec<_>>(), vec!["ok"]);
    }

    #[test]
    fn test_rename_column_and_table() {
        let model = replay(
            "CREATE TABLE a (id int PRIMARY KEY, nm text);
             CREATE TABLE b (a_id int REFERENCES a (id));
             ALTER TABLE a RENAME COLUMN nm TO name;
             ALTER TABLE a RENAME TO accounts;",
        );
        assert!(model.table("accounts").unwrap().column("name").is_some());
        assert_eq!(model.table("b").unwrap().foreign_keys[0].referenced_table, "accounts");
    }

    fn declared_model() -> SchemaModel {
        let mut users = Table::new("users");
        users.columns = vec![
            Column::new("id", "serial"),
            Column::new("email", "varchar(255)").not_null(),
            Column::new("feeling", "mood"),
            Column::new("created_at", "timestamptz")
                .not_null()
                .with_default("now()"),
        ];
        users.columns[1].unique = true;
        users.columns[2].enum_type = Some("mood".to_string());
        users.primary_key = Some(PrimaryKey {
            name: None,
            columns: vec!["id".to_string()],
        });
        users.enum_types = vec![EnumType::new("mood", &["happy", "sad"])];

        let mut posts = Table::new("posts");
        posts.columns = vec![
            Column::new("id", "bigserial"),
            Column::new("user_id", "integer").not_null(),
            Column::new("title", "text").not_null(),
        ];
        posts.primary_key = Some(PrimaryKey {
            name: None,
            columns: vec!["id".to_string()],
        });
        posts.foreign_keys = vec![ForeignKey {
            name: "posts_user_id_fkey".to_string(),
            columns: vec!["user_id".to_string()],
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::Cascade,
        }];
        posts.constraints = vec![
            Constraint::check("posts_title_check", "char_length(title) > 0"),
            Constraint::unique("posts_user_title_key", &["user_id", "title"]),
        ];
        let mut recent = Index::on_columns("posts_recent_idx", &["user_id", "id"]);
        recent.orderings = vec![IndexColumnOrder {
            column: "id".to_string(),
            direction: SortDirection::Desc,
            ..Default::default()
        }];
        posts.indexes = vec![recent];

        let mut m = SchemaModel::new();
        m.insert(users);
        m.insert(posts);
        m
    }

    #[test]
    fn test_generated_migration_replays_to_declared_model() {
        let declared = declared_model();
        let planner = Planner::default();
        let plan = planner.plan(&compare(&declared, &SchemaModel::new()));

        let replayed = replay(&plan.up_sql());
        let diff = compare(&declared, &replayed);
        assert!(!diff.has_changes(), "unexpected diff:\n{}", diff);

        let mut r = Replayer::new();
        r.apply_sql(&plan.up_sql());
        r.apply_sql(&plan.down_sql());
        assert!(r.finish().tables.is_empty());
    }

    #[test]
    fn test_replay_migrations_sorts_by_version() {
        let later = Migration::new("20240102000000", "add_col", "ALTER TABLE t ADD COLUMN b int;", None);
        let first = Migration::new("20240101000000", "create", "CREATE TABLE t (a int);", None);
        let model = replay_migrations(&[later, first]);
        assert!(model.table("t").unwrap().column("b").is_some());
    }

    #[test]
    fn test_clean_type() {
        assert_eq!(clean_type("VARCHAR ( 255 )"), "varchar ( 255 )");
        assert_eq!(clean_type(r#"public."Mood""#), "Mood");
        assert_eq!(clean_type("Timestamp   With Time Zone"), "timestamp with time zone");
        assert_eq!(clean_type("numeric(10,2)"), "numeric(10,2)");
    }
}
