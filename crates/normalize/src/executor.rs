//! The normalize executor: turns extracted files into committed load
//! packages, evolving and persisting the schema as it goes. Chunks of a file
//! are normalized on blocking workers against a schema snapshot; their
//! schema updates are merged in order on the live schema, so a type conflict
//! aborts the file before any package becomes visible.

use crate::json::{normalize_record, NormalizedRow};
use crate::NormalizeError;
use futures::stream::{self, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use schema::names::normalize_identifier;
use schema::{Schema, SchemaUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use storage::writers::{write_insert_values, write_jsonl};
use storage::{
    build_job_file_name, parse_extracted_file_name, FileFormat, LoadStorage, NormalizeStorage,
    RunMetrics, SchemaStorage,
};

/// Per-record routing metadata stamped by the extract stage.
pub const METADATA_FIELD: &str = "_dlt_meta";
const METADATA_TABLE_KEY: &str = "table_name";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NormalizeConfig {
    /// Blocking workers normalizing chunks concurrently.
    pub workers: usize,
    /// Records per worker chunk.
    pub max_chunk: usize,
    /// Identifier cap applied to flattened paths.
    pub max_identifier_length: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        NormalizeConfig {
            workers: 1,
            max_chunk: 100_000,
            max_identifier_length: schema::names::DEFAULT_MAX_IDENTIFIER_LENGTH,
        }
    }
}

impl NormalizeConfig {
    /// Overrides fields from same-named, upper-cased environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse("MAX_CHUNK") {
            self.max_chunk = v;
        }
        if let Some(v) = env_parse("MAX_IDENTIFIER_LENGTH") {
            self.max_identifier_length = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

pub struct NormalizeExecutor {
    normalize_storage: Arc<NormalizeStorage>,
    load_storage: Arc<LoadStorage>,
    schema_storage: Arc<SchemaStorage>,
    config: NormalizeConfig,
}

impl NormalizeExecutor {
    pub fn new(
        normalize_storage: Arc<NormalizeStorage>,
        load_storage: Arc<LoadStorage>,
        schema_storage: Arc<SchemaStorage>,
        config: NormalizeConfig,
    ) -> Self {
        NormalizeExecutor {
            normalize_storage,
            load_storage,
            schema_storage,
            config,
        }
    }

    /// Processes every pending extracted file in lexicographic order. The
    /// first failing file aborts the run; it stays in `extracted/` and its
    /// package is never committed.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<RunMetrics, NormalizeError> {
        let files = self.normalize_storage.list_extracted_files()?;
        if files.is_empty() {
            return Ok(RunMetrics::idle());
        }
        tracing::info!(count = files.len(), "found extracted files to normalize");
        for file_name in files {
            self.process_file(&file_name).await?;
        }
        Ok(RunMetrics::pending(
            self.normalize_storage.list_extracted_files()?.len(),
        ))
    }

    async fn process_file(&self, file_name: &str) -> Result<(), NormalizeError> {
        let parsed = parse_extracted_file_name(file_name)?;
        let mut schema = if self.schema_storage.has_schema(&parsed.schema_name) {
            self.schema_storage.load_schema(&parsed.schema_name)?
        } else {
            Schema::new(&parsed.schema_name)?
        };
        let records = self.normalize_storage.read_extracted_file(file_name)?;
        let default_table = normalize_identifier(&parsed.stem)?;
        tracing::info!(
            file = file_name,
            records = records.len(),
            schema = %schema.name(),
            "normalizing extracted file"
        );

        // Normalize chunks concurrently against a snapshot of the schema.
        let snapshot = schema.clone();
        let max_chunk = self.config.max_chunk.max(1);
        let chunks: Vec<Vec<Value>> = records
            .chunks(max_chunk)
            .map(|c| c.to_vec())
            .collect();
        let results: Vec<(Vec<NormalizedRow>, SchemaUpdate)> = stream::iter(
            chunks.into_iter().map(|chunk| {
                let snapshot = snapshot.clone();
                let default_table = default_table.clone();
                let max_ident = self.config.max_identifier_length;
                async move {
                    tokio::task::spawn_blocking(move || {
                        normalize_chunk(snapshot, chunk, &default_table, max_ident)
                    })
                    .await
                    .map_err(|_| NormalizeError::WorkerPanic)?
                }
            }),
        )
        .buffered(self.config.workers.max(1))
        .try_collect()
        .await?;

        // Merge chunk updates in order on the live schema. Conflicts between
        // chunks surface here, before anything is committed.
        let mut merged_update = SchemaUpdate::new();
        let mut tables: IndexMap<String, Vec<Map<String, Value>>> = IndexMap::new();
        for (rows, update) in results {
            for (table, partials) in update {
                for partial in partials {
                    if let Some(diff) = schema.update_schema(partial)? {
                        merged_update.entry(table.clone()).or_default().push(diff);
                    }
                }
            }
            for row in rows {
                tables.entry(row.table).or_default().push(row.row);
            }
        }

        // Assemble the package out of sight and flip it visible only after
        // the evolved schema is durable.
        let load_id = &parsed.load_id;
        self.load_storage.discard_temp_package(load_id)?;
        self.load_storage.create_temp_package(load_id)?;
        let format = self.load_storage.preferred_format();
        for (table, rows) in &tables {
            let file = build_job_file_name(table, "0000", format)?;
            let contents = self.write_rows(&schema, table, rows, format)?;
            self.load_storage.save_temp_job(load_id, &file, &contents)?;
            metrics::counter!("normalize_row_counter", "table" => table.clone())
                .increment(rows.len() as u64);
        }
        self.schema_storage.save_schema(&mut schema)?;
        self.load_storage.save_temp_schema(load_id, &schema)?;
        self.load_storage
            .save_temp_schema_update(load_id, &merged_update)?;
        self.load_storage.commit_package(load_id)?;
        self.normalize_storage.delete_extracted_file(file_name)?;

        metrics::counter!("normalize_load_package_counter").increment(1);
        tracing::info!(load_id = %load_id, tables = tables.len(), "committed load package");
        Ok(())
    }

    fn write_rows(
        &self,
        schema: &Schema,
        table: &str,
        rows: &[Map<String, Value>],
        format: FileFormat,
    ) -> Result<Vec<u8>, NormalizeError> {
        let mut out = Vec::new();
        match format {
            FileFormat::Jsonl => write_jsonl(&mut out, rows)?,
            FileFormat::InsertValues => {
                // Stable column order comes from the schema, not the rows.
                let columns: Vec<String> = schema
                    .table(table)
                    .map(|t| t.columns.keys().cloned().collect())
                    .unwrap_or_default();
                write_insert_values(&mut out, rows, &columns)?;
            }
            FileFormat::Json => {
                return Err(NormalizeError::UnsupportedLoaderFormat(format));
            }
        }
        Ok(out)
    }
}

fn normalize_chunk(
    mut schema: Schema,
    records: Vec<Value>,
    default_table: &str,
    max_identifier_length: usize,
) -> Result<(Vec<NormalizedRow>, SchemaUpdate), NormalizeError> {
    let mut rows = Vec::new();
    let mut updates = SchemaUpdate::new();
    for mut record in records {
        let table = take_table_name(&mut record, default_table)?;
        let (record_rows, update) =
            normalize_record(&mut schema, record, &table, max_identifier_length)?;
        rows.extend(record_rows);
        for (table, partials) in update {
            updates.entry(table).or_default().extend(partials);
        }
    }
    Ok((rows, updates))
}

/// Pops the routing metadata off a record, returning the target root table.
fn take_table_name(record: &mut Value, default_table: &str) -> Result<String, NormalizeError> {
    let meta = record
        .as_object_mut()
        .and_then(|o| o.remove(METADATA_FIELD));
    let table = meta
        .as_ref()
        .and_then(|m| m.get(METADATA_TABLE_KEY))
        .and_then(Value::as_str)
        .map(|t| normalize_identifier(t))
        .transpose()?;
    Ok(table.unwrap_or_else(|| default_table.to_string()))
}
