//! Semantic comparison of a declared schema against an introspected one.
//!
//! `compare` partitions tables, columns, indexes, foreign keys and
//! constraints into added / dropped / modified using PostgreSQL-aware
//! equivalence rules, so that two spellings of the same schema produce an
//! empty diff. In every change pair `from` is the introspected state and
//! `to` is the declared state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{
    Column, Constraint, ConstraintKind, EnumType, ForeignKey, Index, IndexTarget, PrimaryKey,
    SchemaModel, Table,
};
use crate::normalize::{
    is_nextval_default, is_serial_type, normalize_default, normalize_expression, normalize_type,
};

/// Every difference between two schema snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub tables_added: Vec<Table>,
    pub tables_dropped: Vec<Table>,
    pub tables_modified: Vec<TableDiff>,
    pub enum_types_added: Vec<EnumType>,
    pub enum_types_dropped: Vec<EnumType>,
    pub enum_types_modified: Vec<EnumTypeChange>,
}

/// Values appended to (or, in an inverted diff, removed from) an enum type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumTypeChange {
    pub name: String,
    /// The declared value list.
    pub values: Vec<String>,
    pub new_values: Vec<String>,
    #[serde(default)]
    pub removed_values: Vec<String>,
}

/// Differences inside one table present on both sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub name: String,
    pub columns_added: Vec<Column>,
    pub columns_dropped: Vec<Column>,
    pub columns_modified: Vec<ColumnChange>,
    pub indexes_added: Vec<Index>,
    pub indexes_dropped: Vec<Index>,
    pub indexes_modified: Vec<IndexChange>,
    pub foreign_keys_added: Vec<ForeignKey>,
    pub foreign_keys_dropped: Vec<ForeignKey>,
    pub foreign_keys_modified: Vec<ForeignKeyChange>,
    pub constraints_added: Vec<Constraint>,
    pub constraints_dropped: Vec<Constraint>,
    pub constraints_modified: Vec<ConstraintChange>,
    pub primary_key_change: Option<PrimaryKeyChange>,
}

/// A column whose type, nullability or default differs.
///
/// `nullable` on both sides holds the effective nullability (primary-key
/// and serial columns are never nullable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub name: String,
    pub from: Column,
    pub to: Column,
    pub type_changed: bool,
    pub nullable_changed: bool,
    pub default_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub from: Index,
    pub to: Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyChange {
    pub from: ForeignKey,
    pub to: ForeignKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintChange {
    pub from: Constraint,
    pub to: Constraint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyChange {
    pub from: Option<PrimaryKey>,
    pub to: Option<PrimaryKey>,
}

impl SchemaDiff {
    pub fn has_changes(&self) -> bool {
        !self.tables_added.is_empty()
            || !self.tables_dropped.is_empty()
            || !self.tables_modified.is_empty()
            || !self.enum_types_added.is_empty()
            || !self.enum_types_dropped.is_empty()
            || !self.enum_types_modified.is_empty()
    }

    /// The diff that undoes this one. Used to build down migrations.
    pub fn inverse(&self) -> SchemaDiff {
        SchemaDiff {
            tables_added: self.tables_dropped.clone(),
            tables_dropped: self.tables_added.clone(),
            tables_modified: self.tables_modified.iter().map(TableDiff::inverse).collect(),
            enum_types_added: self.enum_types_dropped.clone(),
            enum_types_dropped: self.enum_types_added.clone(),
            enum_types_modified: self
                .enum_types_modified
                .iter()
                .map(|e| EnumTypeChange {
                    name: e.name.clone(),
                    values: e.values.clone(),
                    new_values: e.removed_values.clone(),
                    removed_values: e.new_values.clone(),
                })
                .collect(),
        }
    }
}

impl TableDiff {
    fn new(name: &str) -> Self {
        TableDiff {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns_added.is_empty()
            && self.columns_dropped.is_empty()
            && self.columns_modified.is_empty()
            && self.indexes_added.is_empty()
            && self.indexes_dropped.is_empty()
            && self.indexes_modified.is_empty()
            && self.foreign_keys_added.is_empty()
            && self.foreign_keys_dropped.is_empty()
            && self.foreign_keys_modified.is_empty()
            && self.constraints_added.is_empty()
            && self.constraints_dropped.is_empty()
            && self.constraints_modified.is_empty()
            && self.primary_key_change.is_none()
    }

    pub fn inverse(&self) -> TableDiff {
        TableDiff {
            name: self.name.clone(),
            columns_added: self.columns_dropped.clone(),
            columns_dropped: self.columns_added.clone(),
            columns_modified: self
                .columns_modified
                .iter()
                .map(|c| ColumnChange {
                    name: c.name.clone(),
                    from: c.to.clone(),
                    to: c.from.clone(),
                    type_changed: c.type_changed,
                    nullable_changed: c.nullable_changed,
                    default_changed: c.default_changed,
                })
                .collect(),
            indexes_added: self.indexes_dropped.clone(),
            indexes_dropped: self.indexes_added.clone(),
            indexes_modified: self
                .indexes_modified
                .iter()
                .map(|c| IndexChange {
                    from: c.to.clone(),
                    to: c.from.clone(),
                })
                .collect(),
            foreign_keys_added: self.foreign_keys_dropped.clone(),
            foreign_keys_dropped: self.foreign_keys_added.clone(),
            foreign_keys_modified: self
                .foreign_keys_modified
                .iter()
                .map(|c| ForeignKeyChange {
                    from: c.to.clone(),
                    to: c.from.clone(),
                })
                .collect(),
            constraints_added: self.constraints_dropped.clone(),
            constraints_dropped: self.constraints_added.clone(),
            constraints_modified: self
                .constraints_modified
                .iter()
                .map(|c| ConstraintChange {
                    from: c.to.clone(),
                    to: c.from.clone(),
                })
                .collect(),
            primary_key_change: self.primary_key_change.as_ref().map(|c| PrimaryKeyChange {
                from: c.to.clone(),
                to: c.from.clone(),
            }),
        }
    }
}

impl std::fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for e in &self.enum_types_added {
            writeln!(f, "+ TYPE {} (enum)", e.name)?;
        }
        for e in &self.enum_types_modified {
            if !e.new_values.is_empty() {
                writeln!(f, "~ TYPE {} (+ {})", e.name, e.new_values.join(", "))?;
            }
            if !e.removed_values.is_empty() {
                writeln!(f, "~ TYPE {} (- {})", e.name, e.removed_values.join(", "))?;
            }
        }
        for t in &self.tables_added {
            writeln!(f, "+ TABLE {}", t.name)?;
        }
        for t in &self.tables_modified {
            writeln!(f, "~ TABLE {}", t.name)?;
            for c in &t.columns_added {
                writeln!(f, "    + COLUMN {} ({})", c.name, c.data_type)?;
            }
            for c in &t.columns_dropped {
                writeln!(f, "    - COLUMN {}", c.name)?;
            }
            for c in &t.columns_modified {
                writeln!(f, "    ~ COLUMN {}", c.name)?;
            }
            if t.primary_key_change.is_some() {
                writeln!(f, "    ~ PRIMARY KEY")?;
            }
            for i in &t.indexes_added {
                writeln!(f, "    + INDEX {}", i.name)?;
            }
            for i in &t.indexes_dropped {
                writeln!(f, "    - INDEX {}", i.name)?;
            }
            for i in &t.indexes_modified {
                writeln!(f, "    ~ INDEX {}", i.to.name)?;
            }
            for fk in &t.foreign_keys_added {
                writeln!(f, "    + FOREIGN KEY {}", fk.name)?;
            }
            for fk in &t.foreign_keys_dropped {
                writeln!(f, "    - FOREIGN KEY {}", fk.name)?;
            }
            for fk in &t.foreign_keys_modified {
                writeln!(f, "    ~ FOREIGN KEY {}", fk.to.name)?;
            }
            for c in &t.constraints_added {
                writeln!(f, "    + CONSTRAINT {}", c.name)?;
            }
            for c in &t.constraints_dropped {
                writeln!(f, "    - CONSTRAINT {}", c.name)?;
            }
            for c in &t.constraints_modified {
                writeln!(f, "    ~ CONSTRAINT {}", c.to.name)?;
            }
        }
        for t in &self.tables_dropped {
            writeln!(f, "- TABLE {}", t.name)?;
        }
        for e in &self.enum_types_dropped {
            writeln!(f, "- TYPE {} (enum)", e.name)?;
        }
        Ok(())
    }
}

/// Compare a declared schema against an introspected one.
pub fn compare(declared: &SchemaModel, introspected: &SchemaModel) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for (name, table) in &declared.tables {
        match introspected.tables.get(name) {
            None => diff.tables_added.push(table.clone()),
            Some(existing) => {
                let td = compare_tables(table, existing);
                if !td.is_empty() {
                    diff.tables_modified.push(td);
                }
            }
        }
    }
    for (name, table) in &introspected.tables {
        if !declared.tables.contains_key(name) {
            diff.tables_dropped.push(table.clone());
        }
    }

    let declared_enums = declared.enum_types();
    let introspected_enums = introspected.enum_types();
    for (name, e) in &declared_enums {
        match introspected_enums.get(name) {
            None => diff.enum_types_added.push(e.clone()),
            Some(existing) => {
                let new_values: Vec<String> = e
                    .values
                    .iter()
                    .filter(|v| !existing.values.contains(v))
                    .cloned()
                    .collect();
                if !new_values.is_empty() {
                    diff.enum_types_modified.push(EnumTypeChange {
                        name: name.clone(),
                        values: e.values.clone(),
                        new_values,
                        removed_values: Vec::new(),
                    });
                }
            }
        }
    }
    for (name, e) in &introspected_enums {
        if !declared_enums.contains_key(name) {
            diff.enum_types_dropped.push(e.clone());
        }
    }

    log::debug!(
        "Compared schemas; tables_added={}, tables_dropped={}, tables_modified={}",
        diff.tables_added.len(),
        diff.tables_dropped.len(),
        diff.tables_modified.len()
    );

    diff
}

fn compare_tables(declared: &Table, introspected: &Table) -> TableDiff {
    let mut td = TableDiff::new(&declared.name);

    // Columns, in declared order.
    for col in &declared.columns {
        match introspected.column(&col.name) {
            None => td.columns_added.push(col.clone()),
            Some(existing) => {
                if let Some(change) = compare_columns(declared, col, introspected, existing) {
                    td.columns_modified.push(change);
                }
            }
        }
    }
    for col in &introspected.columns {
        if declared.column(&col.name).is_none() {
            td.columns_dropped.push(col.clone());
        }
    }

    // Indexes, keyed by name.
    for idx in &declared.indexes {
        match introspected.indexes.iter().find(|i| i.name == idx.name) {
            None => td.indexes_added.push(idx.clone()),
            Some(existing) => {
                if !indexes_equivalent(idx, existing) {
                    td.indexes_modified.push(IndexChange {
                        from: existing.clone(),
                        to: idx.clone(),
                    });
                }
            }
        }
    }
    for idx in &introspected.indexes {
        if !declared.indexes.iter().any(|i| i.name == idx.name) {
            td.indexes_dropped.push(idx.clone());
        }
    }

    // Foreign keys, keyed by name.
    for fk in &declared.foreign_keys {
        match introspected.foreign_keys.iter().find(|f| f.name == fk.name) {
            None => td.foreign_keys_added.push(fk.clone()),
            Some(existing) => {
                if existing != fk {
                    td.foreign_keys_modified.push(ForeignKeyChange {
                        from: existing.clone(),
                        to: fk.clone(),
                    });
                }
            }
        }
    }
    for fk in &introspected.foreign_keys {
        if !declared.foreign_keys.iter().any(|f| f.name == fk.name) {
            td.foreign_keys_dropped.push(fk.clone());
        }
    }

    compare_checks(&mut td, declared, introspected);
    compare_uniques(&mut td, declared, introspected);

    td.primary_key_change = compare_primary_keys(declared, introspected);
    td
}

/// Nullability as PostgreSQL enforces it.
fn effective_nullable(table: &Table, column: &Column) -> bool {
    column.nullable
        && !table.is_primary_key_column(&column.name)
        && !column.auto_increment
        && !is_serial_type(&column.data_type)
}

/// Sequence-backed columns: serial types, auto-increment, or a `nextval` default.
fn is_sequence_backed(column: &Column) -> bool {
    column.auto_increment
        || is_serial_type(&column.data_type)
        || column.default.as_deref().is_some_and(is_nextval_default)
}

fn defaults_equivalent(declared: &Column, introspected: &Column) -> bool {
    if declared.is_implicit() || introspected.is_implicit() {
        return true;
    }
    let declared_seq = is_sequence_backed(declared);
    let introspected_seq = is_sequence_backed(introspected);
    if declared_seq || introspected_seq {
        return declared_seq == introspected_seq;
    }
    match (&declared.default, &introspected.default) {
        (None, None) => true,
        (Some(a), Some(b)) => normalize_default(a) == normalize_default(b),
        _ => false,
    }
}

fn compare_columns(
    declared_table: &Table,
    declared: &Column,
    introspected_table: &Table,
    introspected: &Column,
) -> Option<ColumnChange> {
    let type_changed = normalize_type(&declared.data_type) != normalize_type(&introspected.data_type);

    let to_nullable = effective_nullable(declared_table, declared);
    let from_nullable = effective_nullable(introspected_table, introspected);
    let nullable_changed = !declared.is_implicit()
        && !introspected.is_implicit()
        && to_nullable != from_nullable;

    let default_changed = !defaults_equivalent(declared, introspected);

    if !(type_changed || nullable_changed || default_changed) {
        return None;
    }

    let mut from = introspected.clone();
    from.nullable = from_nullable;
    let mut to = declared.clone();
    to.nullable = to_nullable;

    Some(ColumnChange {
        name: declared.name.clone(),
        from,
        to,
        type_changed,
        nullable_changed,
        default_changed,
    })
}

fn normalized_opt(expr: &Option<String>) -> Option<String> {
    expr.as_deref().map(normalize_expression)
}

/// Non-default ordering entries as comparable keys.
fn ordering_keys(index: &Index) -> BTreeSet<String> {
    index
        .orderings
        .iter()
        .filter(|o| !o.is_default())
        .map(|o| {
            format!(
                "{}|{:?}|{:?}|{}|{}",
                o.column,
                o.direction,
                o.explicit_nulls(),
                o.opclass.as_deref().unwrap_or("").to_lowercase(),
                o.collation.as_deref().unwrap_or("")
            )
        })
        .collect()
}

/// Structural index equivalence. The concurrent-build flag is not compared.
pub fn indexes_equivalent(a: &Index, b: &Index) -> bool {
    if a.unparsed || b.unparsed {
        return a.unique == b.unique;
    }
    if a.unique != b.unique || !a.effective_method().eq_ignore_ascii_case(b.effective_method()) {
        return false;
    }
    let targets_match = match (&a.target, &b.target) {
        (IndexTarget::Columns(x), IndexTarget::Columns(y)) => x == y,
        (IndexTarget::Expression(x), IndexTarget::Expression(y)) => {
            normalize_expression(x) == normalize_expression(y)
        }
        _ => false,
    };
    targets_match
        && normalized_opt(&a.predicate) == normalized_opt(&b.predicate)
        && a.include == b.include
        && ordering_keys(a) == ordering_keys(b)
}

fn compare_checks(td: &mut TableDiff, declared: &Table, introspected: &Table) {
    let checks = |t: &Table| -> BTreeMap<String, Constraint> {
        t.constraints
            .iter()
            .filter(|c| matches!(c.kind, ConstraintKind::Check { .. }))
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    };
    let declared_checks = checks(declared);
    let introspected_checks = checks(introspected);

    for (name, c) in &declared_checks {
        match introspected_checks.get(name) {
            None => td.constraints_added.push(c.clone()),
            Some(existing) => {
                if let (
                    ConstraintKind::Check { expression: a },
                    ConstraintKind::Check { expression: b },
                ) = (&c.kind, &existing.kind)
                {
                    if normalize_expression(a) != normalize_expression(b) {
                        td.constraints_modified.push(ConstraintChange {
                            from: existing.clone(),
                            to: c.clone(),
                        });
                    }
                }
            }
        }
    }
    for (name, c) in &introspected_checks {
        if !declared_checks.contains_key(name) {
            td.constraints_dropped.push(c.clone());
        }
    }
}

struct UniqueEntry {
    constraint: Constraint,
    /// Set when the key comes from a column's `unique` flag.
    column_flag: Option<String>,
}

/// UNIQUE constraints and column `unique` flags, keyed by sorted column set.
fn unique_keys(table: &Table) -> BTreeMap<Vec<String>, UniqueEntry> {
    let mut out = BTreeMap::new();
    for c in &table.constraints {
        if let ConstraintKind::Unique { columns } = &c.kind {
            let mut key = columns.clone();
            key.sort();
            out.entry(key).or_insert_with(|| UniqueEntry {
                constraint: c.clone(),
                column_flag: None,
            });
        }
    }
    for col in table.columns.iter().filter(|c| c.unique) {
        out.entry(vec![col.name.clone()])
            .or_insert_with(|| UniqueEntry {
                constraint: Constraint::unique(
                    format!("{}_{}_key", table.name, col.name),
                    &[col.name.as_str()],
                ),
                column_flag: Some(col.name.clone()),
            });
    }
    out
}

fn compare_uniques(td: &mut TableDiff, declared: &Table, introspected: &Table) {
    let declared_keys = unique_keys(declared);
    let introspected_keys = unique_keys(introspected);

    for (key, entry) in &declared_keys {
        if introspected_keys.contains_key(key) {
            continue;
        }
        // A newly added column carries its inline UNIQUE.
        let inline = entry
            .column_flag
            .as_ref()
            .is_some_and(|c| td.columns_added.iter().any(|a| &a.name == c));
        if !inline {
            td.constraints_added.push(entry.constraint.clone());
        }
    }
    for (key, entry) in &introspected_keys {
        if declared_keys.contains_key(key) {
            continue;
        }
        let inline = entry
            .column_flag
            .as_ref()
            .is_some_and(|c| td.columns_dropped.iter().any(|d| &d.name == c));
        if !inline {
            td.constraints_dropped.push(entry.constraint.clone());
        }
    }
}

fn compare_primary_keys(declared: &Table, introspected: &Table) -> Option<PrimaryKeyChange> {
    match (&declared.primary_key, &introspected.primary_key) {
        (None, None) => None,
        (Some(a), Some(b)) => {
            let names_match = match (&a.name, &b.name) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            };
            if a.columns == b.columns && names_match {
                None
            } else {
                Some(PrimaryKeyChange {
                    from: Some(b.clone()),
                    to: Some(a.clone()),
                })
            }
        }
        (to, from) => Some(PrimaryKeyChange {
            from: from.clone(),
            to: to.clone(),
        }),
    }
}
