mod extract;
pub mod file_names;
mod file_storage;
mod load;
mod normalize_store;
mod schemas;
pub mod versioned;
pub mod writers;

pub use self::extract::{ExtractStorage, COMMITTED_FOLDER, NEW_FOLDER};
pub use self::file_names::{
    build_extracted_file_name, build_job_file_name, new_load_id, parse_extracted_file_name,
    parse_job_file_name, ExtractedFileName, FileFormat, JobFileName,
};
pub use self::file_storage::FileStorage;
pub use self::load::{
    LoadStorage, ARCHIVE_FOLDER, COMPLETED_JOBS_FOLDER, EXCEPTION_FILE_SUFFIX, FAILED_JOBS_FOLDER,
    NEW_JOBS_FOLDER, PACKAGE_SCHEMA_FILE, SCHEMA_UPDATES_FILE, STARTED_JOBS_FOLDER,
};
pub use self::normalize_store::{NormalizeStorage, EXTRACTED_FOLDER};
pub use self::schemas::{SchemaStorage, SCHEMA_FILE_SUFFIX};

use serde::{Deserialize, Serialize};

/// Outcome of one executor run, reported by every stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMetrics {
    pub was_idle: bool,
    pub has_failed: bool,
    pub pending_items: usize,
}

impl RunMetrics {
    pub fn idle() -> Self {
        RunMetrics {
            was_idle: true,
            has_failed: false,
            pending_items: 0,
        }
    }

    pub fn pending(pending_items: usize) -> Self {
        RunMetrics {
            was_idle: false,
            has_failed: false,
            pending_items,
        }
    }
}

/// Error type shared by all stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage directory {0} does not exist")]
    MissingStorage(std::path::PathBuf),

    #[error("no migration path from storage version {from} to {to}")]
    NoMigrationPath { from: String, to: String },

    #[error("invalid storage version marker {0:?}")]
    InvalidVersion(String),

    #[error("file name {0:?} does not match the staged-file grammar")]
    InvalidFileName(String),

    #[error("file format {0} is not supported by this storage")]
    UnsupportedFormat(FileFormat),

    #[error(transparent)]
    Schema(#[from] schema::SchemaError),

    #[error("failed to serialize: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
