//! The job-client contract every destination satisfies, plus the credential
//! records that open concrete clients.

use crate::dummy::{DummyClient, DummyConfig};
use crate::postgres::{PostgresClient, PostgresCredentials};
use crate::LoadError;
use async_trait::async_trait;
use schema::{Schema, Table, WriteDisposition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use storage::FileFormat;

/// State of one load job as reported by the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Retry,
}

/// Handle to a single file load. Server-managed backends poll the remote on
/// `status`; insert-statement backends finish inside `start_file_load` and
/// report a terminal status forever after.
#[async_trait]
pub trait LoadJob: Send + std::fmt::Debug {
    fn file_name(&self) -> &str;

    async fn status(&mut self) -> Result<JobStatus, LoadError>;

    /// The serialized failure, present once `status` reported `Failed`.
    fn exception(&self) -> Option<String>;
}

/// A job whose outcome is already decided, used for synchronous backends and
/// for synthesizing terminal failures.
#[derive(Debug)]
pub struct StaticJob {
    file_name: String,
    status: JobStatus,
    exception: Option<String>,
}

impl StaticJob {
    pub fn completed(file_name: impl Into<String>) -> Self {
        StaticJob {
            file_name: file_name.into(),
            status: JobStatus::Completed,
            exception: None,
        }
    }

    pub fn failed(file_name: impl Into<String>, exception: impl Into<String>) -> Self {
        StaticJob {
            file_name: file_name.into(),
            status: JobStatus::Failed,
            exception: Some(exception.into()),
        }
    }
}

#[async_trait]
impl LoadJob for StaticJob {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    async fn status(&mut self) -> Result<JobStatus, LoadError> {
        Ok(self.status)
    }

    fn exception(&self) -> Option<String> {
        self.exception.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub preferred_loader_file_format: FileFormat,
    pub supported_loader_file_formats: Vec<FileFormat>,
}

/// The destination contract. One client serves one load package schema; the
/// executor opens a fresh client per job, so implementations hold their own
/// connection.
#[async_trait]
pub trait JobClient: Send {
    fn capabilities(&self) -> Capabilities;

    /// Idempotent creation of the destination namespace.
    async fn initialize_storage(&mut self) -> Result<(), LoadError>;

    /// Reconciles the package schema against the destination: missing tables
    /// are created (with hints), missing columns are appended (never with
    /// hints), and the schema version lands in the version side-table.
    async fn update_storage_schema(&mut self) -> Result<(), LoadError>;

    async fn start_file_load(
        &mut self,
        table: &Table,
        disposition: WriteDisposition,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError>;

    /// Rebinds to a previously started load by its deterministic job id.
    async fn restore_file_load(
        &mut self,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError>;

    /// Post-package work, e.g. cleanup of temp tables.
    async fn complete_load(&mut self, load_id: &str) -> Result<(), LoadError>;
}

/// Plain credential records, one per backend. `schema_prefix` aliases the
/// backend-specific dataset or schema name.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "client_type", rename_all = "snake_case")]
pub enum Credentials {
    Postgres(PostgresCredentials),
    Dummy(DummyConfig),
}

impl Credentials {
    pub fn client_type(&self) -> &'static str {
        match self {
            Credentials::Postgres(_) => "postgres",
            Credentials::Dummy(_) => "dummy",
        }
    }

    /// Capabilities are a static property of the backend; they are needed
    /// before any connection exists.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Credentials::Postgres(_) => PostgresClient::capabilities(),
            Credentials::Dummy(config) => DummyClient::capabilities_for(config),
        }
    }

    pub fn schema_prefix(&self) -> &str {
        match self {
            Credentials::Postgres(c) => &c.schema_prefix,
            Credentials::Dummy(_) => "",
        }
    }

    pub fn set_schema_prefix(&mut self, prefix: &str) {
        if let Credentials::Postgres(c) = self {
            c.schema_prefix = prefix.to_string();
        }
    }

    /// Overrides credential fields from same-named, upper-cased environment
    /// variables.
    pub fn apply_env(&mut self) {
        match self {
            Credentials::Postgres(c) => c.apply_env(),
            Credentials::Dummy(c) => c.apply_env(),
        }
    }

    /// Opens a connected client bound to `schema`.
    pub async fn open_client(
        &self,
        schema: Arc<Schema>,
    ) -> Result<Box<dyn JobClient>, LoadError> {
        match self {
            Credentials::Postgres(c) => {
                Ok(Box::new(PostgresClient::connect(c.clone(), schema).await?))
            }
            Credentials::Dummy(c) => Ok(Box::new(DummyClient::new(c.clone()))),
        }
    }
}
