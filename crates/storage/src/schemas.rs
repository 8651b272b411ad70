//! The pipeline schema store: `<name>.schema.yaml` files under the working
//! directory's `schemas/` folder.

use crate::{FileStorage, StorageError};
use schema::Schema;
use std::path::PathBuf;

pub const SCHEMA_FILE_SUFFIX: &str = ".schema.yaml";

#[derive(Debug)]
pub struct SchemaStorage {
    storage: FileStorage,
}

impl SchemaStorage {
    pub fn new(root: impl Into<PathBuf>, make_dirs: bool) -> Result<Self, StorageError> {
        Ok(SchemaStorage {
            storage: FileStorage::new(root, make_dirs)?,
        })
    }

    fn file_name(name: &str) -> String {
        format!("{}{}", name, SCHEMA_FILE_SUFFIX)
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.storage.has_file(&Self::file_name(name))
    }

    /// Persists a schema with defaults removed and marks it clean, so the
    /// next mutation bumps its version.
    pub fn save_schema(&self, schema: &mut Schema) -> Result<(), StorageError> {
        let yaml = schema.to_yaml(true)?;
        self.storage
            .save(&Self::file_name(schema.name()), yaml.as_bytes())?;
        schema.mark_persisted();
        Ok(())
    }

    pub fn load_schema(&self, name: &str) -> Result<Schema, StorageError> {
        let yaml = self.storage.load_string(&Self::file_name(name))?;
        Ok(Schema::from_yaml(&yaml)?)
    }

    pub fn remove_schema(&self, name: &str) -> Result<(), StorageError> {
        self.storage.delete(&Self::file_name(name))
    }

    pub fn list_schemas(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .list_folder_files("")?
            .into_iter()
            .filter_map(|f| f.strip_suffix(SCHEMA_FILE_SUFFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use schema::{Column, DataType, Table};

    #[test]
    fn schemas_persist_and_version_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SchemaStorage::new(dir.path(), false).unwrap();

        let mut schema = Schema::new("event").unwrap();
        schema
            .update_schema(Table::new("events").with_column(Column::new("id", DataType::Bigint)))
            .unwrap();
        storage.save_schema(&mut schema).unwrap();
        assert_eq!(1, schema.version());

        let mut restored = storage.load_schema("event").unwrap();
        assert_eq!(1, restored.version());

        // A mutation after persist starts version 2.
        restored
            .update_schema(Table::new("events").with_column(Column::new("ev", DataType::Text)))
            .unwrap();
        assert_eq!(2, restored.version());

        assert_eq!(vec!["event".to_string()], storage.list_schemas().unwrap());
        storage.remove_schema("event").unwrap();
        assert!(!storage.has_schema("event"));
    }

    #[test]
    fn empty_schema_name_is_storable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SchemaStorage::new(dir.path(), false).unwrap();
        let mut schema = Schema::new("").unwrap();
        storage.save_schema(&mut schema).unwrap();
        assert!(storage.has_schema(""));
        assert_eq!("", storage.load_schema("").unwrap().name());
    }
}
