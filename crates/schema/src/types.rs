//! The stored schema data model: data types, write dispositions, column
//! hints, tables and their columns, schema settings, and the normalizer
//! configuration block. These types serialize 1:1 into `schema.yaml`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage-facing data types. The enum is stable: the snake_case spellings
/// appear in schema files and in every client type map.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Double,
    Bool,
    Timestamp,
    Bigint,
    Binary,
    Complex,
    Decimal,
    /// Arbitrary-precision integer; maps to the widest numeric a destination
    /// supports.
    Wei,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Double => "double",
            DataType::Bool => "bool",
            DataType::Timestamp => "timestamp",
            DataType::Bigint => "bigint",
            DataType::Binary => "binary",
            DataType::Complex => "complex",
            DataType::Decimal => "decimal",
            DataType::Wei => "wei",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table instruction to the destination.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    Skip,
    #[default]
    Append,
    Replace,
    Merge,
    Upsert,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Skip => "skip",
            WriteDisposition::Append => "append",
            WriteDisposition::Replace => "replace",
            WriteDisposition::Merge => "merge",
            WriteDisposition::Upsert => "upsert",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-type column properties that guide physical layout at the destination.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnHint {
    Partition,
    Cluster,
    PrimaryKey,
    ForeignKey,
    Sort,
    Unique,
}

pub const COLUMN_HINTS: [ColumnHint; 6] = [
    ColumnHint::Partition,
    ColumnHint::Cluster,
    ColumnHint::PrimaryKey,
    ColumnHint::ForeignKey,
    ColumnHint::Sort,
    ColumnHint::Unique,
];

fn default_nullable() -> bool {
    true
}

/// A single column. Hints are only honored when the column is first created;
/// later hint changes are dropped by the schema merge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub partition: bool,
    #[serde(default)]
    pub cluster: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub foreign_key: bool,
    #[serde(default)]
    pub sort: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Column {
            name: name.into(),
            data_type,
            nullable: true,
            partition: false,
            cluster: false,
            primary_key: false,
            foreign_key: false,
            sort: false,
            unique: false,
            description: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_hint(mut self, hint: ColumnHint) -> Self {
        self.set_hint(hint, true);
        self
    }

    pub fn hint(&self, hint: ColumnHint) -> bool {
        match hint {
            ColumnHint::Partition => self.partition,
            ColumnHint::Cluster => self.cluster,
            ColumnHint::PrimaryKey => self.primary_key,
            ColumnHint::ForeignKey => self.foreign_key,
            ColumnHint::Sort => self.sort,
            ColumnHint::Unique => self.unique,
        }
    }

    pub fn set_hint(&mut self, hint: ColumnHint, value: bool) {
        match hint {
            ColumnHint::Partition => self.partition = value,
            ColumnHint::Cluster => self.cluster = value,
            ColumnHint::PrimaryKey => self.primary_key = value,
            ColumnHint::ForeignKey => self.foreign_key = value,
            ColumnHint::Sort => self.sort = value,
            ColumnHint::Unique => self.unique = value,
        }
    }

    pub fn has_hints(&self) -> bool {
        COLUMN_HINTS.iter().any(|h| self.hint(*h))
    }
}

/// Row filters: `re:`-prefixed regexes (or literal paths) matched against
/// flattened column paths. Excludes apply first, includes re-admit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RowFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
}

impl RowFilters {
    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty() && self.includes.is_empty()
    }
}

/// A table definition. `parent` is set exactly when the table was produced by
/// nested-record unwinding; a child with no `write_disposition` inherits its
/// root's.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_disposition: Option<WriteDisposition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<RowFilters>,
    #[serde(default)]
    pub columns: IndexMap<String, Column>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            description: None,
            parent: None,
            write_disposition: None,
            filters: None,
            columns: IndexMap::new(),
        }
    }

    pub fn with_write_disposition(mut self, disposition: WriteDisposition) -> Self {
        self.write_disposition = Some(disposition);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.push_column(column);
        self
    }

    pub fn push_column(&mut self, column: Column) {
        self.columns.insert(column.name.clone(), column);
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }
}

/// Schema-wide settings: sealing, default hints by path regex, and preferred
/// types by path regex.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SchemaSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_sealed: Option<bool>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub default_hints: IndexMap<ColumnHint, Vec<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub preferred_types: IndexMap<String, DataType>,
}

impl SchemaSettings {
    pub fn is_empty(&self) -> bool {
        self.schema_sealed.is_none()
            && self.default_hints.is_empty()
            && self.preferred_types.is_empty()
    }

    pub fn sealed(&self) -> bool {
        self.schema_sealed.unwrap_or(false)
    }
}

/// Registered value detections, run in order before the base type mapping.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Detection {
    Timestamp,
    IsoTimestamp,
}

/// Configuration of the JSON normalizer module attached to a schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonNormalizerConfig {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// The `normalizers` block of a stored schema: which naming convention and
/// which JSON unwinding module produced (and must keep producing) its tables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NormalizersConfig {
    pub names: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    pub json: JsonNormalizerConfig,
}

impl Default for NormalizersConfig {
    fn default() -> Self {
        NormalizersConfig {
            names: "snake_case".to_string(),
            detections: Some(vec![Detection::Timestamp, Detection::IsoTimestamp]),
            json: JsonNormalizerConfig {
                module: "relational".to_string(),
                config: None,
            },
        }
    }
}

/// The serialized form of a schema, exactly as written to `schema.yaml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredSchema {
    pub version: u64,
    pub engine_version: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "SchemaSettings::is_empty")]
    pub settings: SchemaSettings,
    #[serde(default)]
    pub tables: IndexMap<String, Table>,
    #[serde(default)]
    pub normalizers: NormalizersConfig,
}

/// Accumulated schema evolution: table name to the partial tables (new tables
/// or newly added columns) applied while normalizing a package.
pub type SchemaUpdate = IndexMap<String, Vec<Table>>;
