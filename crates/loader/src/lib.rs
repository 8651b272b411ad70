mod client;
pub mod dialect;
mod dummy;
mod executor;
mod postgres;

pub use self::client::{
    Capabilities, Credentials, JobClient, JobStatus, LoadJob, StaticJob,
};
pub use self::dummy::{DummyClient, DummyConfig};
pub use self::executor::{LoadExecutor, LoaderConfig};
pub use self::postgres::{PostgresClient, PostgresCredentials};

use schema::WriteDisposition;
use storage::FileFormat;

/// Load failures, classified along the transient/terminal axis surfaced to
/// the executor. Anything not explicitly transient is final for its job.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("transient load error: {message}")]
    Transient { message: String },

    #[error("terminal load error: {message}")]
    Terminal { message: String },

    #[error("table {table:?} does not exist at the destination ({file})")]
    UnknownTable { table: String, file: String },

    #[error("write disposition {disposition} is not supported for table {table:?} ({file})")]
    UnsupportedWriteDisposition {
        table: String,
        disposition: WriteDisposition,
        file: String,
    },

    #[error("file format {format} is not among the supported formats {supported:?}")]
    UnsupportedFileFormat {
        format: FileFormat,
        supported: Vec<FileFormat>,
    },

    #[error("destination schema for {table} will not update: {reason} (columns {columns:?})")]
    SchemaWillNotUpdate {
        table: String,
        columns: Vec<String>,
        reason: String,
    },

    #[error("load job for {file} does not exist at the destination")]
    JobNotFound { file: String },

    #[error("file {file} exceeds the maximum statement size of {max_bytes} bytes")]
    FileTooBig { file: String, max_bytes: usize },

    #[error(transparent)]
    Schema(#[from] schema::SchemaError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Whether leaving state untouched and retrying later is the right
    /// reaction.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::Transient { .. } | LoadError::Io(_)
        )
    }
}
