//! Schema model shared by every stage: tables, columns, indexes,
//! constraints, foreign keys and enum types.
//!
//! Both the declared model and the introspected model use these types.
//! Type strings are stored verbatim; normalization only happens when
//! two models are compared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A snapshot of every table in one schema, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    pub tables: BTreeMap<String, Table>,
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a table, keyed by its name.
    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// All enum types referenced by any table, deduplicated by name.
    ///
    /// Enum types are database-global; when two tables carry the same type
    /// the first occurrence in table-name order wins.
    pub fn enum_types(&self) -> BTreeMap<String, EnumType> {
        let mut out = BTreeMap::new();
        for table in self.tables.values() {
            for e in &table.enum_types {
                out.entry(e.name.clone()).or_insert_with(|| e.clone());
            }
        }
        out
    }
}

/// A single table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// May be omitted when the table is keyed by name in a map.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Enum types used by this table's columns.
    #[serde(default)]
    pub enum_types: Vec<EnumType>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn is_primary_key_column(&self, name: &str) -> bool {
        self.primary_key
            .as_ref()
            .is_some_and(|pk| pk.columns.iter().any(|c| c == name))
    }

    /// Names of tables this table references through foreign keys, excluding itself.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .foreign_keys
            .iter()
            .map(|fk| fk.referenced_table.as_str())
            .filter(|t| *t != self.name)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub generated: Option<GeneratedColumn>,
    #[serde(default)]
    pub identity: Option<IdentityKind>,
    /// Name of the enum type this column uses, if any.
    #[serde(default)]
    pub enum_type: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            unique: false,
            auto_increment: false,
            generated: None,
            identity: None,
            enum_type: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Generated and identity columns have their default and nullability implied.
    pub fn is_implicit(&self) -> bool {
        self.generated.is_some() || self.identity.is_some()
    }
}

/// `GENERATED ALWAYS AS (expr) STORED|VIRTUAL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedColumn {
    pub expression: String,
    #[serde(default)]
    pub kind: GeneratedKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedKind {
    #[default]
    Stored,
    Virtual,
}

impl GeneratedKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            GeneratedKind::Stored => "STORED",
            GeneratedKind::Virtual => "VIRTUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Always,
    ByDefault,
}

impl IdentityKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IdentityKind::Always => "ALWAYS",
            IdentityKind::ByDefault => "BY DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Constraint name; `None` lets PostgreSQL pick `{table}_pkey`.
    #[serde(default)]
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// What an index is built over: a column list or one opaque expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexTarget {
    Columns(Vec<String>),
    Expression(String),
}

impl Default for IndexTarget {
    fn default() -> Self {
        IndexTarget::Columns(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    #[serde(default)]
    pub target: IndexTarget,
    /// Access method; empty means `btree`.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub orderings: Vec<IndexColumnOrder>,
    #[serde(default)]
    pub concurrently: bool,
    /// Set when the catalog definition could not be parsed; only name,
    /// method and uniqueness are meaningful.
    #[serde(default)]
    pub unparsed: bool,
}

impl Index {
    pub fn on_columns(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            target: IndexTarget::Columns(columns.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn columns(&self) -> &[String] {
        match &self.target {
            IndexTarget::Columns(cols) => cols,
            IndexTarget::Expression(_) => &[],
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match &self.target {
            IndexTarget::Expression(e) => Some(e),
            IndexTarget::Columns(_) => None,
        }
    }

    /// Access method with the empty string mapped to `btree`.
    pub fn effective_method(&self) -> &str {
        if self.method.is_empty() {
            "btree"
        } else {
            &self.method
        }
    }

    pub fn ordering_for(&self, column: &str) -> Option<&IndexColumnOrder> {
        self.orderings.iter().find(|o| o.column == column)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullsOrder {
    First,
    Last,
}

/// Per-column ordering details of an index entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumnOrder {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub nulls: Option<NullsOrder>,
    #[serde(default)]
    pub opclass: Option<String>,
    #[serde(default)]
    pub collation: Option<String>,
}

impl IndexColumnOrder {
    /// Nulls ordering with PostgreSQL's implicit default removed
    /// (`ASC NULLS LAST`, `DESC NULLS FIRST`).
    pub fn explicit_nulls(&self) -> Option<NullsOrder> {
        match (self.direction, self.nulls) {
            (SortDirection::Asc, Some(NullsOrder::Last)) => None,
            (SortDirection::Desc, Some(NullsOrder::First)) => None,
            (_, n) => n,
        }
    }

    /// True when the entry says nothing beyond the plain column name.
    pub fn is_default(&self) -> bool {
        self.direction == SortDirection::Asc
            && self.explicit_nulls().is_none()
            && self.opclass.is_none()
            && self.collation.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKind {
    Check { expression: String },
    Unique { columns: Vec<String> },
}

impl Constraint {
    pub fn check(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Check {
                expression: expression.into(),
            },
        }
    }

    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Unique {
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Decode `pg_constraint.confupdtype` / `confdeltype`.
    pub fn from_catalog_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    /// Parse the SQL spelling (`ON DELETE <action>`), case-insensitively.
    pub fn from_sql(s: &str) -> Option<Self> {
        let words: Vec<String> = s.split_whitespace().map(|w| w.to_uppercase()).collect();
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["NO", "ACTION"] => Some(ReferentialAction::NoAction),
            ["RESTRICT"] => Some(ReferentialAction::Restrict),
            ["CASCADE"] => Some(ReferentialAction::Cascade),
            ["SET", "NULL"] => Some(ReferentialAction::SetNull),
            ["SET", "DEFAULT"] => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumType {
    pub name: String,
    pub values: Vec<String>,
}

impl EnumType {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}
