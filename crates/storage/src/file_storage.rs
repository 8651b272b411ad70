//! Directory-rooted file access shared by every store. All mutation goes
//! through fsync'd writes and same-filesystem renames so that a crash leaves
//! either the old state or the new state, never a torn file.

use crate::StorageError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, make_dirs: bool) -> Result<Self, StorageError> {
        let root = root.into();
        if make_dirs {
            fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(StorageError::MissingStorage(root));
        }
        Ok(FileStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a root-relative path.
    pub fn make_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn has_file(&self, rel: &str) -> bool {
        self.make_path(rel).is_file()
    }

    pub fn has_folder(&self, rel: &str) -> bool {
        self.make_path(rel).is_dir()
    }

    /// Writes `contents` to a temporary sibling, fsyncs, and renames into
    /// place. Overwrites any existing file atomically.
    pub fn save(&self, rel: &str, contents: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.make_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_file_name(format!(
            ".{}.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
            schema::uniq_id()
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load(&self, rel: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.make_path(rel))?)
    }

    pub fn load_string(&self, rel: &str) -> Result<String, StorageError> {
        Ok(fs::read_to_string(self.make_path(rel))?)
    }

    pub fn delete(&self, rel: &str) -> Result<(), StorageError> {
        Ok(fs::remove_file(self.make_path(rel))?)
    }

    pub fn create_folder(&self, rel: &str) -> Result<(), StorageError> {
        Ok(fs::create_dir_all(self.make_path(rel))?)
    }

    pub fn delete_folder(&self, rel: &str) -> Result<(), StorageError> {
        Ok(fs::remove_dir_all(self.make_path(rel))?)
    }

    /// Lists file names directly under `rel`, lexicographically sorted.
    pub fn list_folder_files(&self, rel: &str) -> Result<Vec<String>, StorageError> {
        self.list_folder(rel, false)
    }

    /// Lists directory names directly under `rel`, lexicographically sorted.
    pub fn list_folder_dirs(&self, rel: &str) -> Result<Vec<String>, StorageError> {
        self.list_folder(rel, true)
    }

    fn list_folder(&self, rel: &str, dirs: bool) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.make_path(rel))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() == dirs {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Same-filesystem rename: the one atomic primitive stage transitions
    /// are built from.
    pub fn atomic_rename(&self, src_rel: &str, dst_rel: &str) -> Result<PathBuf, StorageError> {
        let src = self.make_path(src_rel);
        let dst = self.make_path(dst_rel);
        fs::rename(&src, &dst)?;
        Ok(dst)
    }

    /// Moves a file into another storage that may live on a different
    /// filesystem: copy to a temporary name in the destination folder, fsync,
    /// rename into place. The source is left for the caller to retire, so a
    /// crash at any point leaves at most a stray temp file.
    pub fn copy_cross_storage_atomically(
        &self,
        dst_root: &Path,
        dst_folder: &str,
        src_rel: &str,
        dst_name: &str,
    ) -> Result<PathBuf, StorageError> {
        let src = self.make_path(src_rel);
        let dst_dir = dst_root.join(dst_folder);
        let tmp = dst_dir.join(format!(".{}.{}", dst_name, schema::uniq_id()));
        let dst = dst_dir.join(dst_name);

        fs::copy(&src, &tmp)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &dst)?;
        Ok(dst)
    }
}
