//! The extract store: raw record batches land in `new/` and move to
//! `committed/` once their copy has been handed to the normalize store.

use crate::file_names::build_extracted_file_name;
use crate::normalize_store::{NormalizeStorage, EXTRACTED_FOLDER};
use crate::versioned::{initialize_version, Migration};
use crate::{FileStorage, StorageError};
use lazy_static::lazy_static;
use semver::Version;
use serde_json::Value;
use std::path::PathBuf;

pub const NEW_FOLDER: &str = "new";
pub const COMMITTED_FOLDER: &str = "committed";

lazy_static! {
    static ref STORAGE_VERSION: Version = Version::new(1, 0, 0);
}

const MIGRATIONS: &[Migration] = &[];

#[derive(Debug)]
pub struct ExtractStorage {
    storage: FileStorage,
}

impl ExtractStorage {
    pub fn new(root: impl Into<PathBuf>, is_owner: bool) -> Result<Self, StorageError> {
        let storage = FileStorage::new(root, is_owner)?;
        if is_owner {
            storage.create_folder(NEW_FOLDER)?;
            storage.create_folder(COMMITTED_FOLDER)?;
        }
        initialize_version(&storage, &STORAGE_VERSION, is_owner, MIGRATIONS)?;
        Ok(ExtractStorage { storage })
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// Saves a raw batch into `new/` as a single JSON document.
    pub fn save_json(&self, name: &str, items: &[Value]) -> Result<PathBuf, StorageError> {
        let contents = serde_json::to_vec(items)?;
        self.storage
            .save(&format!("{}/{}", NEW_FOLDER, name), &contents)
    }

    /// Commits a batch to the normalize stage: the file is copied atomically
    /// into the normalize store's `extracted/` folder under its grammar name
    /// (the copy supports crossing filesystems), then the local original
    /// moves `new/` to `committed/`. Returns the committed grammar name.
    pub fn commit_extracted(
        &self,
        normalize: &NormalizeStorage,
        schema_name: &str,
        file_name: &str,
        stem: &str,
        count: usize,
        load_id: &str,
    ) -> Result<String, StorageError> {
        let dest_name = build_extracted_file_name(schema_name, stem, count, load_id)?;
        if count > 0 {
            self.storage.copy_cross_storage_atomically(
                normalize.storage().root(),
                EXTRACTED_FOLDER,
                &format!("{}/{}", NEW_FOLDER, file_name),
                &dest_name,
            )?;
        }
        self.storage.atomic_rename(
            &format!("{}/{}", NEW_FOLDER, file_name),
            &format!("{}/{}", COMMITTED_FOLDER, file_name),
        )?;
        tracing::debug!(file = %dest_name, count, "committed extracted batch");
        Ok(dest_name)
    }

    pub fn list_new(&self) -> Result<Vec<String>, StorageError> {
        self.storage.list_folder_files(NEW_FOLDER)
    }

    pub fn list_committed(&self) -> Result<Vec<String>, StorageError> {
        self.storage.list_folder_files(COMMITTED_FOLDER)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracted_batches_move_to_committed() {
        let extract_dir = tempfile::tempdir().unwrap();
        let normalize_dir = tempfile::tempdir().unwrap();
        let extract = ExtractStorage::new(extract_dir.path(), true).unwrap();
        let normalize = NormalizeStorage::new(normalize_dir.path(), true).unwrap();

        extract
            .save_json("batch.json", &[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        let name = extract
            .commit_extracted(&normalize, "event", "batch.json", "events", 2, "loadid")
            .unwrap();

        assert_eq!("event.events.2.loadid.json", name);
        assert_eq!(vec![name], normalize.list_extracted_files().unwrap());
        assert!(extract.list_new().unwrap().is_empty());
        assert_eq!(vec!["batch.json".to_string()], extract.list_committed().unwrap());
    }

    #[test]
    fn empty_batches_are_not_forwarded() {
        let extract_dir = tempfile::tempdir().unwrap();
        let normalize_dir = tempfile::tempdir().unwrap();
        let extract = ExtractStorage::new(extract_dir.path(), true).unwrap();
        let normalize = NormalizeStorage::new(normalize_dir.path(), true).unwrap();

        extract.save_json("batch.json", &[]).unwrap();
        extract
            .commit_extracted(&normalize, "event", "batch.json", "events", 0, "loadid")
            .unwrap();

        assert!(normalize.list_extracted_files().unwrap().is_empty());
        assert_eq!(vec!["batch.json".to_string()], extract.list_committed().unwrap());
    }
}
