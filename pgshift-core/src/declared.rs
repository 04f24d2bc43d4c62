//! Declared-model input.
//!
//! The application describes its desired schema in a JSON document. Two
//! shapes are accepted:
//!
//! ```json
//! { "tables": [ { "type": "User", "table": "users", "columns": [...] } ],
//!   "enum_types": [ { "name": "mood", "values": ["happy", "sad"] } ] }
//! ```
//!
//! where each declaration's table name goes through the
//! [`TableNameResolver`](crate::naming::TableNameResolver), or the
//! introspector's own shape, a `name -> Table` map:
//!
//! ```json
//! { "tables": { "users": { "columns": [...] } } }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::{PgshiftError, Result};
use crate::model::{
    Column, Constraint, EnumType, ForeignKey, Index, PrimaryKey, SchemaModel, Table,
};
use crate::naming::TableNameResolver;

/// One table declaration, named by the declaring type.
#[derive(Debug, Clone, Deserialize)]
pub struct TableDeclaration {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Table name directive; used unless the type is registered explicitly.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    /// `referenced_table` may name a declared type instead of a table.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DeclaredTables {
    List(Vec<TableDeclaration>),
    Map(BTreeMap<String, Table>),
}

impl Default for DeclaredTables {
    fn default() -> Self {
        DeclaredTables::List(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeclaredSchema {
    #[serde(default)]
    pub tables: DeclaredTables,
    #[serde(default)]
    pub enum_types: Vec<EnumType>,
}

impl DeclaredSchema {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Resolve names and enum references into a model.
    pub fn into_model(self, resolver: &TableNameResolver) -> Result<SchemaModel> {
        let mut enums: BTreeMap<String, EnumType> = BTreeMap::new();
        for e in self.enum_types {
            if enums.contains_key(&e.name) {
                return Err(PgshiftError::MigrationParseError(format!(
                    "Enum type '{}' is declared twice",
                    e.name
                )));
            }
            enums.insert(e.name.clone(), e);
        }

        let tables = match self.tables {
            DeclaredTables::List(decls) => resolve_declarations(decls, resolver)?,
            DeclaredTables::Map(map) => map
                .into_iter()
                .map(|(name, mut table)| {
                    table.name = name;
                    for e in &table.enum_types {
                        enums.entry(e.name.clone()).or_insert_with(|| e.clone());
                    }
                    table
                })
                .collect(),
        };

        let mut model = SchemaModel::new();
        for mut table in tables {
            validate_table(&table)?;
            table.enum_types = attach_enums(&table, &enums)?;
            if model.tables.contains_key(&table.name) {
                return Err(PgshiftError::MigrationParseError(format!(
                    "Table '{}' is declared twice",
                    table.name
                )));
            }
            model.insert(table);
        }

        log::debug!(
            "Loaded declared model; tables={}, enum_types={}",
            model.tables.len(),
            enums.len()
        );
        Ok(model)
    }
}

/// Parse a declared-model JSON document.
pub fn parse_declared(json: &str, resolver: &TableNameResolver) -> Result<SchemaModel> {
    DeclaredSchema::from_json(json)?.into_model(resolver)
}

/// Read and parse a declared-model JSON file.
pub fn load_declared(path: &Path, resolver: &TableNameResolver) -> Result<SchemaModel> {
    let content = std::fs::read_to_string(path)?;
    parse_declared(&content, resolver).map_err(|e| match e {
        PgshiftError::JsonError(inner) => PgshiftError::MigrationParseError(format!(
            "Invalid declared model {}: {}",
            path.display(),
            inner
        )),
        other => other,
    })
}

fn resolve_declarations(
    decls: Vec<TableDeclaration>,
    resolver: &TableNameResolver,
) -> Result<Vec<Table>> {
    let mut type_to_table: BTreeMap<String, String> = BTreeMap::new();
    for decl in &decls {
        let resolved = resolver.resolve(&decl.type_name, decl.table.as_deref())?;
        type_to_table.insert(decl.type_name.clone(), resolved.table);
    }

    Ok(decls
        .into_iter()
        .map(|decl| {
            let name = type_to_table
                .get(&decl.type_name)
                .cloned()
                .unwrap_or_default();
            let foreign_keys = decl
                .foreign_keys
                .into_iter()
                .map(|mut fk| {
                    if let Some(table) = type_to_table.get(&fk.referenced_table) {
                        fk.referenced_table = table.clone();
                    }
                    fk
                })
                .collect();
            Table {
                name,
                columns: decl.columns,
                primary_key: decl.primary_key,
                indexes: decl.indexes,
                foreign_keys,
                constraints: decl.constraints,
                enum_types: Vec::new(),
            }
        })
        .collect())
}

fn validate_table(table: &Table) -> Result<()> {
    let mut seen = BTreeSet::new();
    for col in &table.columns {
        if !seen.insert(col.name.as_str()) {
            return Err(PgshiftError::MigrationParseError(format!(
                "Column '{}' is declared twice on table '{}'",
                col.name, table.name
            )));
        }
        if col.generated.is_some() && col.identity.is_some() {
            return Err(PgshiftError::MigrationParseError(format!(
                "Column '{}.{}' cannot be both generated and identity",
                table.name, col.name
            )));
        }
    }
    if let Some(pk) = &table.primary_key {
        if let Some(missing) = pk.columns.iter().find(|c| !seen.contains(c.as_str())) {
            return Err(PgshiftError::MigrationParseError(format!(
                "Primary key of '{}' names unknown column '{}'",
                table.name, missing
            )));
        }
    }
    Ok(())
}

/// The enum types a table's columns use, in column order.
fn attach_enums(table: &Table, enums: &BTreeMap<String, EnumType>) -> Result<Vec<EnumType>> {
    let mut out: Vec<EnumType> = Vec::new();
    for col in &table.columns {
        let Some(name) = &col.enum_type else { continue };
        let e = enums.get(name).ok_or_else(|| {
            PgshiftError::MigrationParseError(format!(
                "Column '{}.{}' uses undeclared enum type '{}'",
                table.name, col.name, name
            ))
        })?;
        if !out.iter().any(|x| x.name == e.name) {
            out.push(e.clone());
        }
    }
    Ok(out)
}
