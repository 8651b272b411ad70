//! SQL dialects: identifier escaping, the type map in both directions, hint
//! attributes, and the statement-building for schema reconciliation. The
//! dialect is a plain value injected into the insert-values client so the
//! same reconciliation logic serves postgres- and redshift-shaped engines.

use crate::LoadError;
use indexmap::IndexMap;
use schema::{Column, ColumnHint, DataType, Table, COLUMN_HINTS};
use storage::writers::escape_identifier;

/// Columns of a destination table as reported by introspection.
pub type StorageColumns = IndexMap<String, Column>;

/// Side table recording which schema version reached the destination.
pub const VERSION_TABLE_NAME: &str = "_dlt_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Postgres,
    Redshift,
}

#[derive(Debug, Clone)]
pub struct Dialect {
    flavor: Flavor,
    pub name: &'static str,
    pub max_identifier_length: usize,
    pub max_statement_bytes: usize,
    hint_attributes: &'static [(ColumnHint, &'static str)],
}

impl Dialect {
    pub fn postgres() -> Self {
        Dialect {
            flavor: Flavor::Postgres,
            name: "postgres",
            max_identifier_length: 63,
            // Statements are sent over the simple protocol; anything near
            // this size should have been chunked by the normalizer.
            max_statement_bytes: 1024 * 1024 * 1024,
            hint_attributes: &[],
        }
    }

    pub fn redshift() -> Self {
        Dialect {
            flavor: Flavor::Redshift,
            name: "redshift",
            max_identifier_length: 127,
            max_statement_bytes: 16 * 1024 * 1024,
            hint_attributes: &[(ColumnHint::Cluster, "DISTKEY"), (ColumnHint::Sort, "SORTKEY")],
        }
    }

    pub fn escape_identifier(&self, ident: &str) -> String {
        escape_identifier(ident)
    }

    pub fn qualified_table_name(&self, dataset: &str, table: &str) -> String {
        format!(
            "{}.{}",
            self.escape_identifier(dataset),
            self.escape_identifier(table)
        )
    }

    pub fn data_type_sql(&self, data_type: DataType) -> &'static str {
        match (self.flavor, data_type) {
            (_, DataType::Double) => "double precision",
            (_, DataType::Bool) => "boolean",
            (_, DataType::Timestamp) => "timestamp with time zone",
            (_, DataType::Bigint) => "bigint",
            (_, DataType::Decimal) => "numeric(38,9)",

            (Flavor::Postgres, DataType::Text) => "varchar",
            (Flavor::Postgres, DataType::Complex) => "jsonb",
            (Flavor::Postgres, DataType::Binary) => "bytea",
            (Flavor::Postgres, DataType::Wei) => "numeric(78,0)",

            (Flavor::Redshift, DataType::Text) => "varchar(max)",
            (Flavor::Redshift, DataType::Complex) => "varchar(max)",
            (Flavor::Redshift, DataType::Binary) => "varbinary",
            // The widest numeric redshift offers.
            (Flavor::Redshift, DataType::Wei) => "numeric(38,0)",
        }
    }

    /// Maps an introspected SQL type back to the schema type. `numeric`
    /// disambiguates wei from decimal by precision and scale.
    pub fn data_type_from_sql(
        &self,
        sql_type: &str,
        precision: Option<i64>,
        scale: Option<i64>,
    ) -> DataType {
        match sql_type {
            "numeric" => match (self.flavor, precision, scale) {
                (Flavor::Postgres, Some(78), Some(0)) => DataType::Wei,
                (Flavor::Redshift, Some(38), Some(0)) => DataType::Wei,
                _ => DataType::Decimal,
            },
            "double precision" => DataType::Double,
            "boolean" => DataType::Bool,
            "timestamp with time zone" => DataType::Timestamp,
            "bigint" => DataType::Bigint,
            "jsonb" => DataType::Complex,
            "bytea" | "binary varying" => DataType::Binary,
            _ => DataType::Text,
        }
    }

    /// Renders one column definition, with hint attributes and nullability.
    pub fn column_sql(&self, column: &Column) -> String {
        let mut parts = vec![
            self.escape_identifier(&column.name),
            self.data_type_sql(column.data_type).to_string(),
        ];
        for (hint, attribute) in self.hint_attributes {
            if column.hint(*hint) {
                parts.push(attribute.to_string());
            }
        }
        if !column.nullable {
            parts.push("NOT NULL".to_string());
        }
        parts.join(" ")
    }
}

/// Builds the reconciliation statement for one table, or `None` when the
/// destination already matches.
///
/// A missing destination table becomes `CREATE TABLE` with hints
/// materialized; an existing one gets one `ALTER TABLE ... ADD COLUMN` per
/// new column. Hints on columns added to an existing table are refused with
/// `SchemaWillNotUpdate` before any statement runs.
pub fn build_table_update_sql(
    dialect: &Dialect,
    dataset: &str,
    table: &Table,
    storage_columns: Option<&StorageColumns>,
) -> Result<Option<String>, LoadError> {
    let new_columns: Vec<&Column> = table
        .columns
        .values()
        .filter(|c| !storage_columns.map_or(false, |cols| cols.contains_key(&c.name)))
        .collect();
    if new_columns.is_empty() {
        return Ok(None);
    }
    let canonical_name = dialect.qualified_table_name(dataset, &table.name);

    if storage_columns.is_some() {
        let hinted: Vec<String> = new_columns
            .iter()
            .filter(|c| COLUMN_HINTS.iter().any(|h| c.hint(*h)))
            .map(|c| c.name.clone())
            .collect();
        if !hinted.is_empty() {
            return Err(LoadError::SchemaWillNotUpdate {
                table: canonical_name,
                columns: hinted,
                reason: "hints requested after the table was created".to_string(),
            });
        }
        let sql = new_columns
            .iter()
            .map(|c| {
                format!(
                    "ALTER TABLE {} ADD COLUMN {};",
                    canonical_name,
                    dialect.column_sql(c)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(Some(sql));
    }

    let defs = new_columns
        .iter()
        .map(|c| dialect.column_sql(c))
        .collect::<Vec<_>>()
        .join(",\n");
    Ok(Some(format!("CREATE TABLE {} (\n{});", canonical_name, defs)))
}

/// Bootstraps the version side-table.
pub fn build_version_table_sql(dialect: &Dialect, dataset: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (schema_name varchar NOT NULL, version bigint NOT NULL, inserted_at timestamp with time zone NOT NULL);",
        dialect.qualified_table_name(dataset, VERSION_TABLE_NAME)
    )
}

pub fn build_select_version_sql(dialect: &Dialect, dataset: &str, schema_name: &str) -> String {
    format!(
        "SELECT version FROM {} WHERE schema_name = {} ORDER BY inserted_at DESC LIMIT 1;",
        dialect.qualified_table_name(dataset, VERSION_TABLE_NAME),
        storage::writers::escape_string_literal(schema_name)
    )
}

pub fn build_insert_version_sql(
    dialect: &Dialect,
    dataset: &str,
    schema_name: &str,
    version: u64,
) -> String {
    format!(
        "INSERT INTO {}(schema_name, version, inserted_at) VALUES ({}, {}, now());",
        dialect.qualified_table_name(dataset, VERSION_TABLE_NAME),
        storage::writers::escape_string_literal(schema_name),
        version
    )
}

/// The destination dataset name: the configured prefix, suffixed with the
/// schema name when one is set.
pub fn make_dataset_name(schema_prefix: &str, schema_name: &str) -> String {
    if schema_name.is_empty() {
        schema_prefix.to_string()
    } else {
        format!("{}_{}", schema_prefix, schema_name)
    }
}
