pub mod inference;
pub mod names;
mod schema;
mod types;

pub use self::schema::{Schema, ENGINE_VERSION, SIMPLE_REGEX_PREFIX};
pub use self::types::{
    Column, ColumnHint, DataType, Detection, JsonNormalizerConfig, NormalizersConfig, RowFilters,
    SchemaSettings, SchemaUpdate, StoredSchema, Table, WriteDisposition, COLUMN_HINTS,
};

/// Returns a unique, lowercase hex id suitable for row ids and file stems.
pub fn uniq_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Error type for every schema operation.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("name {0:?} cannot be normalized to a valid identifier")]
    InvalidName(String),

    #[error("invalid simple regex {0:?}")]
    InvalidRegex(String, #[source] regex::Error),

    #[error(
        "cannot coerce column {table}.{column}: declared {declared}, observed {observed}"
    )]
    CannotCoerceColumn {
        table: String,
        column: String,
        declared: types::DataType,
        observed: types::DataType,
    },

    #[error("schema {0:?} is sealed and accepts no new tables or columns")]
    SchemaSealed(String),

    #[error("table {0:?} is not defined in this schema")]
    UnknownTable(String),

    #[error("table {table:?} references unknown parent table {parent:?}")]
    UnknownParentTable { table: String, parent: String },

    #[error("stored schema has engine version {0}, which this build cannot migrate")]
    UnsupportedEngineVersion(u64),

    #[error("failed to serialize schema: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to serialize schema: {0}")]
    Json(#[from] serde_json::Error),
}
