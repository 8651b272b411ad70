//! The normalize store: the `extracted/` folder is the durable queue between
//! the extract and normalize stages.

use crate::versioned::{initialize_version, Migration};
use crate::{FileStorage, StorageError};
use lazy_static::lazy_static;
use semver::Version;
use serde_json::Value;
use std::path::PathBuf;

pub const EXTRACTED_FOLDER: &str = "extracted";

lazy_static! {
    static ref STORAGE_VERSION: Version = Version::new(1, 0, 0);
}

const MIGRATIONS: &[Migration] = &[];

#[derive(Debug)]
pub struct NormalizeStorage {
    storage: FileStorage,
}

impl NormalizeStorage {
    pub fn new(root: impl Into<PathBuf>, is_owner: bool) -> Result<Self, StorageError> {
        let storage = FileStorage::new(root, is_owner)?;
        if is_owner {
            storage.create_folder(EXTRACTED_FOLDER)?;
        }
        initialize_version(&storage, &STORAGE_VERSION, is_owner, MIGRATIONS)?;
        Ok(NormalizeStorage { storage })
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// Extracted files pending normalization, in lexicographic order. Only
    /// names matching the staged-file grammar are returned, which hides the
    /// temp files of in-flight cross-storage copies.
    pub fn list_extracted_files(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .list_folder_files(EXTRACTED_FOLDER)?
            .into_iter()
            .filter(|name| crate::file_names::parse_extracted_file_name(name).is_ok())
            .collect())
    }

    /// Reads an extracted batch back into records.
    pub fn read_extracted_file(&self, file_name: &str) -> Result<Vec<Value>, StorageError> {
        let raw = self
            .storage
            .load(&format!("{}/{}", EXTRACTED_FOLDER, file_name))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn delete_extracted_file(&self, file_name: &str) -> Result<(), StorageError> {
        self.storage
            .delete(&format!("{}/{}", EXTRACTED_FOLDER, file_name))
    }
}
