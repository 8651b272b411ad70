//! On-disk storage versioning. Every store carries a `version` file with a
//! semver string; openers either accept it, migrate it forward along a
//! registered chain, or refuse the directory.

use crate::{FileStorage, StorageError};
use semver::Version;

pub const VERSION_FILE: &str = "version";

/// One hop of a storage migration chain.
pub struct Migration {
    pub from: Version,
    pub to: Version,
    pub apply: fn(&FileStorage) -> Result<(), StorageError>,
}

/// Reads the version marker, or `None` when the storage was never
/// initialized.
pub fn read_version(storage: &FileStorage) -> Result<Option<Version>, StorageError> {
    if !storage.has_file(VERSION_FILE) {
        return Ok(None);
    }
    let text = storage.load_string(VERSION_FILE)?;
    let version = Version::parse(text.trim())
        .map_err(|_| StorageError::InvalidVersion(text.trim().to_string()))?;
    Ok(Some(version))
}

pub fn write_version(storage: &FileStorage, version: &Version) -> Result<(), StorageError> {
    storage.save(VERSION_FILE, version.to_string().as_bytes())?;
    Ok(())
}

/// Brings the storage to `current`. An owner initializes a missing marker;
/// an older marker walks the migration chain, rewriting the marker after
/// each hop so an interrupted migration resumes where it stopped; a newer
/// marker, or a gap in the chain, fails with `NoMigrationPath`.
pub fn initialize_version(
    storage: &FileStorage,
    current: &Version,
    is_owner: bool,
    migrations: &[Migration],
) -> Result<Version, StorageError> {
    let mut version = match read_version(storage)? {
        Some(version) => version,
        None if is_owner => {
            write_version(storage, current)?;
            return Ok(current.clone());
        }
        None => {
            return Err(StorageError::NoMigrationPath {
                from: "uninitialized".to_string(),
                to: current.to_string(),
            })
        }
    };

    while version < *current {
        let Some(step) = migrations.iter().find(|m| m.from == version) else {
            return Err(StorageError::NoMigrationPath {
                from: version.to_string(),
                to: current.to_string(),
            });
        };
        tracing::info!(from = %step.from, to = %step.to, root = %storage.root().display(), "migrating storage");
        (step.apply)(storage)?;
        write_version(storage, &step.to)?;
        version = step.to.clone();
    }

    if version > *current {
        return Err(StorageError::NoMigrationPath {
            from: version.to_string(),
            to: current.to_string(),
        });
    }
    Ok(version)
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop(_: &FileStorage) -> Result<(), StorageError> {
        Ok(())
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn owner_initializes_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), false).unwrap();
        let got = initialize_version(&storage, &v("1.0.0"), true, &[]).unwrap();
        assert_eq!(v("1.0.0"), got);
        assert_eq!(Some(v("1.0.0")), read_version(&storage).unwrap());
    }

    #[test]
    fn non_owner_requires_existing_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), false).unwrap();
        assert!(matches!(
            initialize_version(&storage, &v("1.0.0"), false, &[]),
            Err(StorageError::NoMigrationPath { .. })
        ));
    }

    #[test]
    fn full_migration_path_is_walked() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), false).unwrap();
        write_version(&storage, &v("1.0.0")).unwrap();

        let chain = [
            Migration { from: v("1.0.0"), to: v("1.1.0"), apply: noop },
            Migration { from: v("1.1.0"), to: v("2.0.0"), apply: noop },
        ];
        let got = initialize_version(&storage, &v("2.0.0"), true, &chain).unwrap();
        assert_eq!(v("2.0.0"), got);
        assert_eq!(Some(v("2.0.0")), read_version(&storage).unwrap());
    }

    #[test]
    fn unknown_migration_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), false).unwrap();

        // A marker from the future cannot be migrated down.
        write_version(&storage, &v("10.0.0")).unwrap();
        assert!(matches!(
            initialize_version(&storage, &v("1.0.0"), false, &[]),
            Err(StorageError::NoMigrationPath { .. })
        ));

        // An old marker with a gap in the chain is no better.
        write_version(&storage, &v("0.5.0")).unwrap();
        assert!(matches!(
            initialize_version(&storage, &v("1.0.0"), true, &[]),
            Err(StorageError::NoMigrationPath { .. })
        ));
    }
}
