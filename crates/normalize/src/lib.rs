mod executor;
pub mod json;

pub use self::executor::{NormalizeConfig, NormalizeExecutor, METADATA_FIELD};
pub use self::json::{
    normalize_record, to_canonical_json, NormalizedRow, LIST_IDX_COLUMN, PARENT_ID_COLUMN,
    ROW_ID_COLUMN, VALUE_COLUMN,
};

use storage::FileFormat;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Schema(#[from] schema::SchemaError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error("loader file format {0} cannot carry normalized rows")]
    UnsupportedLoaderFormat(FileFormat),

    #[error("a normalize worker panicked")]
    WorkerPanic,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
