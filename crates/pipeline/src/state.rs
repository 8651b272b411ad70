//! Durable pipeline state: a small record persisted as `state.json` in the
//! working directory, written with fsync and restored wholesale on any
//! failed operation.

use serde::{Deserialize, Serialize};
use storage::{FileStorage, StorageError};

pub const STATE_FILE: &str = "state.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub pipeline_name: String,
    pub default_schema_name: String,
    pub client_type: String,
    pub schema_prefix: String,
}

impl PipelineState {
    pub fn save(&self, root: &FileStorage) -> Result<(), StorageError> {
        root.save(STATE_FILE, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(root: &FileStorage) -> Result<Option<Self>, StorageError> {
        if !root.has_file(STATE_FILE) {
            return Ok(None);
        }
        let raw = root.load(STATE_FILE)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
