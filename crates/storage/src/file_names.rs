//! The staged-file name grammar. Stage transitions are encoded in directory
//! moves, so the file name is the only durable identity a batch has:
//! `<schema>.<stem>.<count>.<load_id>.<ext>` for extracted files and
//! `<table>.<stem>.<ext>` for load-package jobs.

use crate::StorageError;
use schema::names::RE_SCHEMA_NAME;
use serde::{Deserialize, Serialize};
use std::fmt;

/// File formats carried through the stores. `Json` is the raw extract
/// encoding; `Jsonl` and `InsertValues` are the loader-facing formats.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Json,
    Jsonl,
    InsertValues,
}

impl FileFormat {
    pub fn as_ext(&self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Jsonl => "jsonl",
            FileFormat::InsertValues => "insert_values",
        }
    }

    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(FileFormat::Json),
            "jsonl" => Some(FileFormat::Jsonl),
            "insert_values" => Some(FileFormat::InsertValues),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ext())
    }
}

/// Parsed form of an extracted-file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFileName {
    pub schema_name: String,
    pub stem: String,
    pub count: usize,
    pub load_id: String,
}

/// Builds `<schema>.<stem>.<count>.<load_id>.json`. The schema segment may
/// be empty; every other segment must be non-empty and dot-free.
pub fn build_extracted_file_name(
    schema_name: &str,
    stem: &str,
    count: usize,
    load_id: &str,
) -> Result<String, StorageError> {
    if !schema_name.is_empty() && !RE_SCHEMA_NAME.is_match(schema_name) {
        return Err(StorageError::InvalidFileName(schema_name.to_string()));
    }
    for segment in [stem, load_id] {
        if segment.is_empty() || segment.contains('.') {
            return Err(StorageError::InvalidFileName(segment.to_string()));
        }
    }
    Ok(format!(
        "{}.{}.{}.{}.{}",
        schema_name,
        stem,
        count,
        load_id,
        FileFormat::Json.as_ext()
    ))
}

pub fn parse_extracted_file_name(name: &str) -> Result<ExtractedFileName, StorageError> {
    let parts: Vec<&str> = name.split('.').collect();
    let (schema_name, stem, count, load_id, ext) = match parts.as_slice() {
        &[schema_name, stem, count, load_id, ext] => (schema_name, stem, count, load_id, ext),
        _ => return Err(StorageError::InvalidFileName(name.to_string())),
    };
    if ext != FileFormat::Json.as_ext() {
        return Err(StorageError::InvalidFileName(name.to_string()));
    }
    if !schema_name.is_empty() && !RE_SCHEMA_NAME.is_match(schema_name) {
        return Err(StorageError::InvalidFileName(name.to_string()));
    }
    let count: usize = count
        .parse()
        .map_err(|_| StorageError::InvalidFileName(name.to_string()))?;
    if stem.is_empty() || load_id.is_empty() {
        return Err(StorageError::InvalidFileName(name.to_string()));
    }
    Ok(ExtractedFileName {
        schema_name: schema_name.to_string(),
        stem: stem.to_string(),
        count,
        load_id: load_id.to_string(),
    })
}

/// Parsed form of a load-package job file name, `<table>.<stem>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFileName {
    pub table: String,
    pub stem: String,
    pub format: FileFormat,
}

pub fn build_job_file_name(
    table: &str,
    stem: &str,
    format: FileFormat,
) -> Result<String, StorageError> {
    for segment in [table, stem] {
        if segment.is_empty() || segment.contains('.') {
            return Err(StorageError::InvalidFileName(segment.to_string()));
        }
    }
    Ok(format!("{}.{}.{}", table, stem, format.as_ext()))
}

pub fn parse_job_file_name(name: &str) -> Result<JobFileName, StorageError> {
    let parts: Vec<&str> = name.split('.').collect();
    let (table, stem, ext) = match parts.as_slice() {
        &[table, stem, ext] => (table, stem, ext),
        _ => return Err(StorageError::InvalidFileName(name.to_string())),
    };
    let format = FileFormat::from_ext(ext)
        .ok_or_else(|| StorageError::InvalidFileName(name.to_string()))?;
    if table.is_empty() || stem.is_empty() {
        return Err(StorageError::InvalidFileName(name.to_string()));
    }
    Ok(JobFileName {
        table: table.to_string(),
        stem: stem.to_string(),
        format,
    })
}

/// Returns a lexicographically sortable load id: zero-padded epoch seconds
/// followed by a random suffix, with no grammar delimiters.
pub fn new_load_id() -> String {
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let suffix = schema::uniq_id();
    format!("{:010}{}", epoch, &suffix[..16])
}
