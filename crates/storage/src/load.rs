//! The load store. Each load package is a directory named by its `load_id`
//! holding the frozen schema, the one-shot schema-update sentinel, and job
//! files advancing `new -> started -> {completed | failed | retry}` purely
//! by atomic renames.

use crate::file_names::FileFormat;
use crate::versioned::{initialize_version, Migration};
use crate::{FileStorage, StorageError};
use lazy_static::lazy_static;
use schema::{Schema, SchemaUpdate};
use semver::Version;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const NEW_JOBS_FOLDER: &str = "new";
pub const STARTED_JOBS_FOLDER: &str = "started";
pub const FAILED_JOBS_FOLDER: &str = "failed";
pub const COMPLETED_JOBS_FOLDER: &str = "completed";

/// Top-level folder archived packages move into. Load ids are digit-prefixed
/// hex, so the name cannot collide with a package.
pub const ARCHIVE_FOLDER: &str = "completed";

pub const PACKAGE_SCHEMA_FILE: &str = "schema.yaml";
pub const SCHEMA_UPDATES_FILE: &str = "schema_updates.json";
pub const EXCEPTION_FILE_SUFFIX: &str = ".exception";

/// Suffix of not-yet-committed packages. It contains a dot, so in-progress
/// packages can never appear in `list_packages`.
const TEMP_PACKAGE_SUFFIX: &str = ".tmp";

const JOB_FOLDERS: [&str; 4] = [
    NEW_JOBS_FOLDER,
    STARTED_JOBS_FOLDER,
    FAILED_JOBS_FOLDER,
    COMPLETED_JOBS_FOLDER,
];

lazy_static! {
    static ref STORAGE_VERSION: Version = Version::new(1, 0, 0);
}

const MIGRATIONS: &[Migration] = &[];

#[derive(Debug)]
pub struct LoadStorage {
    storage: FileStorage,
    preferred_format: FileFormat,
    supported_formats: Vec<FileFormat>,
}

impl LoadStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        is_owner: bool,
        preferred_format: FileFormat,
        supported_formats: Vec<FileFormat>,
    ) -> Result<Self, StorageError> {
        if !supported_formats.contains(&preferred_format) {
            return Err(StorageError::UnsupportedFormat(preferred_format));
        }
        let storage = FileStorage::new(root, is_owner)?;
        if is_owner {
            storage.create_folder(ARCHIVE_FOLDER)?;
        }
        initialize_version(&storage, &STORAGE_VERSION, is_owner, MIGRATIONS)?;
        Ok(LoadStorage {
            storage,
            preferred_format,
            supported_formats,
        })
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn preferred_format(&self) -> FileFormat {
        self.preferred_format
    }

    pub fn supported_formats(&self) -> &[FileFormat] {
        &self.supported_formats
    }

    // --- package assembly -------------------------------------------------

    /// Creates the scaffolding of a not-yet-visible package.
    pub fn create_temp_package(&self, load_id: &str) -> Result<(), StorageError> {
        for folder in JOB_FOLDERS {
            self.storage
                .create_folder(&format!("{}{}/{}", load_id, TEMP_PACKAGE_SUFFIX, folder))?;
        }
        Ok(())
    }

    pub fn save_temp_job(
        &self,
        load_id: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        self.storage.save(
            &format!(
                "{}{}/{}/{}",
                load_id, TEMP_PACKAGE_SUFFIX, NEW_JOBS_FOLDER, file_name
            ),
            contents,
        )?;
        Ok(())
    }

    pub fn save_temp_schema(&self, load_id: &str, schema: &Schema) -> Result<(), StorageError> {
        let yaml = schema.to_yaml(false)?;
        self.storage.save(
            &format!("{}{}/{}", load_id, TEMP_PACKAGE_SUFFIX, PACKAGE_SCHEMA_FILE),
            yaml.as_bytes(),
        )?;
        Ok(())
    }

    pub fn save_temp_schema_update(
        &self,
        load_id: &str,
        update: &SchemaUpdate,
    ) -> Result<(), StorageError> {
        self.storage.save(
            &format!("{}{}/{}", load_id, TEMP_PACKAGE_SUFFIX, SCHEMA_UPDATES_FILE),
            &serde_json::to_vec(update)?,
        )?;
        Ok(())
    }

    /// Makes an assembled package visible to the loader in one rename.
    pub fn commit_package(&self, load_id: &str) -> Result<(), StorageError> {
        self.storage
            .atomic_rename(&format!("{}{}", load_id, TEMP_PACKAGE_SUFFIX), load_id)?;
        tracing::info!(load_id, "committed load package");
        Ok(())
    }

    /// Drops an abandoned temp package, if any.
    pub fn discard_temp_package(&self, load_id: &str) -> Result<(), StorageError> {
        let rel = format!("{}{}", load_id, TEMP_PACKAGE_SUFFIX);
        if self.storage.has_folder(&rel) {
            self.storage.delete_folder(&rel)?;
        }
        Ok(())
    }

    // --- package discovery ------------------------------------------------

    /// Committed, not yet archived packages in lexicographic `load_id`
    /// order. The archive folder and temp packages are excluded.
    pub fn list_packages(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .list_folder_dirs("")?
            .into_iter()
            .filter(|name| name != ARCHIVE_FOLDER && !name.contains('.'))
            .collect())
    }

    pub fn list_archived_packages(&self) -> Result<Vec<String>, StorageError> {
        self.storage.list_folder_dirs(ARCHIVE_FOLDER)
    }

    pub fn package_schema(&self, load_id: &str) -> Result<Schema, StorageError> {
        let yaml = self
            .storage
            .load_string(&format!("{}/{}", load_id, PACKAGE_SCHEMA_FILE))?;
        Ok(Schema::from_yaml(&yaml)?)
    }

    /// Reads the schema-update sentinel, or `None` when it was already
    /// consumed by a previous attempt.
    pub fn begin_schema_update(
        &self,
        load_id: &str,
    ) -> Result<Option<SchemaUpdate>, StorageError> {
        let rel = format!("{}/{}", load_id, SCHEMA_UPDATES_FILE);
        if !self.storage.has_file(&rel) {
            return Ok(None);
        }
        let raw = self.storage.load(&rel)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Deletes the sentinel: the commit point of the schema evolution.
    pub fn commit_schema_update(&self, load_id: &str) -> Result<(), StorageError> {
        self.storage
            .delete(&format!("{}/{}", load_id, SCHEMA_UPDATES_FILE))
    }

    // --- job lifecycle ----------------------------------------------------

    pub fn list_new_jobs(&self, load_id: &str) -> Result<Vec<String>, StorageError> {
        self.storage
            .list_folder_files(&format!("{}/{}", load_id, NEW_JOBS_FOLDER))
    }

    pub fn list_started_jobs(&self, load_id: &str) -> Result<Vec<String>, StorageError> {
        self.storage
            .list_folder_files(&format!("{}/{}", load_id, STARTED_JOBS_FOLDER))
    }

    pub fn list_failed_jobs(&self, load_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .list_folder_files(&format!("{}/{}", load_id, FAILED_JOBS_FOLDER))?
            .into_iter()
            .filter(|name| !name.ends_with(EXCEPTION_FILE_SUFFIX))
            .collect())
    }

    pub fn list_completed_jobs(&self, load_id: &str) -> Result<Vec<String>, StorageError> {
        self.storage
            .list_folder_files(&format!("{}/{}", load_id, COMPLETED_JOBS_FOLDER))
    }

    /// Failed jobs of an archived package, with the contents of their
    /// `.exception` siblings when present.
    pub fn list_archived_failed_jobs(
        &self,
        load_id: &str,
    ) -> Result<Vec<(String, Option<String>)>, StorageError> {
        let folder = format!("{}/{}/{}", ARCHIVE_FOLDER, load_id, FAILED_JOBS_FOLDER);
        let mut jobs = Vec::new();
        for name in self.storage.list_folder_files(&folder)? {
            if name.ends_with(EXCEPTION_FILE_SUFFIX) {
                continue;
            }
            let exception = self
                .storage
                .load_string(&format!("{}/{}{}", folder, name, EXCEPTION_FILE_SUFFIX))
                .ok();
            jobs.push((name, exception));
        }
        Ok(jobs)
    }

    pub fn job_path(&self, load_id: &str, folder: &str, file_name: &str) -> PathBuf {
        self.storage
            .make_path(&format!("{}/{}/{}", load_id, folder, file_name))
    }

    /// `new -> started`; returns the started path.
    pub fn start_job(&self, load_id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        self.move_job(load_id, file_name, NEW_JOBS_FOLDER, STARTED_JOBS_FOLDER)
    }

    /// `started -> completed`.
    pub fn complete_job(&self, load_id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        self.move_job(load_id, file_name, STARTED_JOBS_FOLDER, COMPLETED_JOBS_FOLDER)
    }

    /// `started -> new`, to be picked up by a later spool round.
    pub fn retry_job(&self, load_id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        self.move_job(load_id, file_name, STARTED_JOBS_FOLDER, NEW_JOBS_FOLDER)
    }

    /// `started -> failed`, writing the terminal error next to the file.
    pub fn fail_job(
        &self,
        load_id: &str,
        file_name: &str,
        failed_message: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        if let Some(message) = failed_message {
            self.storage.save(
                &format!(
                    "{}/{}/{}{}",
                    load_id, FAILED_JOBS_FOLDER, file_name, EXCEPTION_FILE_SUFFIX
                ),
                message.as_bytes(),
            )?;
        }
        self.move_job(load_id, file_name, STARTED_JOBS_FOLDER, FAILED_JOBS_FOLDER)
    }

    fn move_job(
        &self,
        load_id: &str,
        file_name: &str,
        from: &str,
        to: &str,
    ) -> Result<PathBuf, StorageError> {
        self.storage.atomic_rename(
            &format!("{}/{}/{}", load_id, from, file_name),
            &format!("{}/{}/{}", load_id, to, file_name),
        )
    }

    /// Seconds since the file was last moved; used for the job wait summary.
    pub fn job_elapsed_seconds(&self, path: &Path) -> Result<f64, StorageError> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0))
    }

    /// Retires a fully processed package: deleted when requested and clean,
    /// otherwise moved under the archive folder.
    pub fn archive_package(
        &self,
        load_id: &str,
        delete_completed: bool,
    ) -> Result<(), StorageError> {
        let has_failures = !self.list_failed_jobs(load_id)?.is_empty();
        if delete_completed && !has_failures {
            self.storage.delete_folder(load_id)?;
            tracing::info!(load_id, "deleted completed load package");
        } else {
            self.storage
                .atomic_rename(load_id, &format!("{}/{}", ARCHIVE_FOLDER, load_id))?;
            tracing::info!(load_id, has_failures, "archived load package");
        }
        Ok(())
    }
}
