//! The pipeline façade. A pipeline owns a working directory that functions
//! as a durable queue between the extract, normalize and load stages; each
//! stage can crash and resume without losing or duplicating work the
//! destination cannot tolerate.

mod state;

pub use self::state::{PipelineState, STATE_FILE};
pub use loader::{Credentials, DummyConfig, LoaderConfig, PostgresCredentials};
pub use normalize::NormalizeConfig;
pub use storage::RunMetrics;

use lazy_static::lazy_static;
use loader::{LoadError, LoadExecutor};
use normalize::{NormalizeExecutor, METADATA_FIELD};
use schema::names::{normalize_identifier, normalize_schema_name};
use schema::{Schema, SchemaError};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use storage::{
    new_load_id, ExtractStorage, FileStorage, LoadStorage, NormalizeStorage, SchemaStorage,
    StorageError,
};
use tokio_util::sync::CancellationToken;

lazy_static! {
    /// Per-directory pipeline generations. Creating or restoring a pipeline
    /// at a directory makes every previously obtained handle for it stale,
    /// mirroring the exclusive ownership of the on-disk stores.
    static ref GENERATIONS: Mutex<HashMap<PathBuf, u64>> = Mutex::new(HashMap::new());
}

/// A step that aborted, with whatever metrics the run produced before dying.
#[derive(Debug, thiserror::Error)]
#[error("pipeline step {step} failed: {source}")]
pub struct PipelineStepFailed {
    pub step: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
    pub last_metrics: RunMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot restore pipeline: {0}")]
    CannotRestorePipeline(String),

    #[error("this pipeline handle was superseded by another pipeline in this process")]
    InvalidPipelineContext,

    #[error("more than one worker is not supported in an interactive terminal")]
    Interactive,

    #[error(transparent)]
    Step(#[from] PipelineStepFailed),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct Stores {
    extract: ExtractStorage,
    normalize_storage: Arc<NormalizeStorage>,
    load_storage: Arc<LoadStorage>,
    schema_storage: Arc<SchemaStorage>,
}

#[derive(Debug)]
pub struct Pipeline {
    name: String,
    credentials: Credentials,
    root: FileStorage,
    canonical_root: PathBuf,
    state: PipelineState,
    stores: Stores,
    cancel: CancellationToken,
    generation: u64,
}

impl Pipeline {
    /// Creates a fresh pipeline at `working_dir` (a temp directory when not
    /// given). A previous pipeline at the same directory is wiped first.
    pub fn create(
        name: &str,
        credentials: Credentials,
        working_dir: Option<&Path>,
        schema: Option<Schema>,
    ) -> Result<Self, PipelineError> {
        let root_path = match working_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir().join(format!("pipeline_{}", schema::uniq_id())),
        };
        // Only a directory holding a restorable pipeline is wiped.
        if root_path.is_dir() {
            let existing = FileStorage::new(&root_path, false)?;
            if PipelineState::load(&existing)?.is_some() {
                tracing::info!(dir = %root_path.display(), "wiping previous pipeline");
                std::fs::remove_dir_all(&root_path)?;
            }
        }
        let root = FileStorage::new(&root_path, true)?;
        let stores = Self::open_stores(&root_path, &credentials)?;

        let mut schema = match schema {
            Some(schema) => schema,
            None => Schema::new(&normalize_schema_name(name)?)?,
        };
        stores.schema_storage.save_schema(&mut schema)?;

        let state = PipelineState {
            pipeline_name: name.to_string(),
            default_schema_name: schema.name().to_string(),
            client_type: credentials.client_type().to_string(),
            schema_prefix: credentials.schema_prefix().to_string(),
        };
        state.save(&root)?;

        let canonical_root = root_path.canonicalize()?;
        tracing::info!(pipeline = name, dir = %root_path.display(), "created pipeline");
        Ok(Pipeline {
            name: name.to_string(),
            credentials,
            root,
            generation: next_generation(&canonical_root),
            canonical_root,
            state,
            stores,
            cancel: CancellationToken::new(),
        })
    }

    /// Re-attaches to an existing working directory. Fails with
    /// `CannotRestorePipeline` when the directory, its state, or its default
    /// schema is missing or belongs to another pipeline.
    pub fn restore(
        name: &str,
        mut credentials: Credentials,
        working_dir: &Path,
    ) -> Result<Self, PipelineError> {
        let root = FileStorage::new(working_dir, false).map_err(|_| {
            PipelineError::CannotRestorePipeline(format!(
                "no pipeline directory at {}",
                working_dir.display()
            ))
        })?;
        let state = PipelineState::load(&root)?.ok_or_else(|| {
            PipelineError::CannotRestorePipeline(format!(
                "cannot find a valid pipeline in {}",
                working_dir.display()
            ))
        })?;
        if state.pipeline_name != name {
            return Err(PipelineError::CannotRestorePipeline(format!(
                "expected pipeline {:?}, found {:?} instead",
                name, state.pipeline_name
            )));
        }
        credentials.set_schema_prefix(&state.schema_prefix);

        let stores = Self::open_stores(working_dir, &credentials)?;
        if !stores.schema_storage.has_schema(&state.default_schema_name) {
            return Err(PipelineError::CannotRestorePipeline(format!(
                "default schema {:?} not found",
                state.default_schema_name
            )));
        }

        let canonical_root = working_dir.canonicalize()?;
        tracing::info!(pipeline = name, dir = %working_dir.display(), "restored pipeline");
        Ok(Pipeline {
            name: name.to_string(),
            credentials,
            root,
            generation: next_generation(&canonical_root),
            canonical_root,
            state,
            stores,
            cancel: CancellationToken::new(),
        })
    }

    fn open_stores(root: &Path, credentials: &Credentials) -> Result<Stores, PipelineError> {
        let capabilities = credentials.capabilities();
        Ok(Stores {
            extract: ExtractStorage::new(root.join("extract"), true)?,
            normalize_storage: Arc::new(NormalizeStorage::new(root.join("normalize"), true)?),
            load_storage: Arc::new(LoadStorage::new(
                root.join("load"),
                true,
                capabilities.preferred_loader_file_format,
                capabilities.supported_loader_file_formats,
            )?),
            schema_storage: Arc::new(SchemaStorage::new(root.join("schemas"), true)?),
        })
    }

    pub fn working_dir(&self) -> &Path {
        self.root.root()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative cancellation of running executors.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Materializes records into the extract store and atomically commits
    /// the batch to the normalize stage. Non-mapping items are wrapped as
    /// `{"v": ...}`; sequences are flattened; items without routing metadata
    /// are stamped with the target table.
    pub fn extract<I>(&mut self, items: I, table_name: Option<&str>) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.verify_context()?;
        let default_table = normalize_identifier(table_name.unwrap_or(&self.name))
            .map_err(|e| step_failed("extract", e, failed_metrics(0)))?;

        let mut records = Vec::new();
        for item in items {
            match item {
                Value::Array(nested) => {
                    records.extend(nested.into_iter().map(|v| prepare_record(v, &default_table)))
                }
                other => records.push(prepare_record(other, &default_table)),
            }
        }

        let load_id = new_load_id();
        let result = self.with_state(|p| {
            let file_name = format!("{}.json", load_id);
            p.stores.extract.save_json(&file_name, &records)?;
            p.stores.extract.commit_extracted(
                &p.stores.normalize_storage,
                &p.state.default_schema_name,
                &file_name,
                &default_table,
                records.len(),
                &load_id,
            )?;
            Ok(())
        });
        result.map_err(|e| step_failed("extract", e, failed_metrics(0)))?;
        tracing::info!(count = records.len(), table = %default_table, load_id = %load_id, "extracted batch");
        Ok(())
    }

    /// Normalizes all pending extracted files into load packages.
    pub async fn normalize(
        &mut self,
        workers: usize,
        max_chunk: usize,
    ) -> Result<RunMetrics, PipelineError> {
        self.verify_context()?;
        if workers > 1 && atty::is(atty::Stream::Stdout) {
            return Err(PipelineError::Interactive);
        }
        let config = NormalizeConfig {
            workers,
            max_chunk,
            ..Default::default()
        };
        let executor = NormalizeExecutor::new(
            self.stores.normalize_storage.clone(),
            self.stores.load_storage.clone(),
            self.stores.schema_storage.clone(),
            config,
        );
        executor.run().await.map_err(|e| {
            let pending = self.pending_extracted();
            step_failed("normalize", e, failed_metrics(pending)).into()
        })
    }

    /// Loads all pending packages into the destination.
    pub async fn load(&mut self, workers: usize) -> Result<RunMetrics, PipelineError> {
        self.verify_context()?;
        let config = LoaderConfig {
            workers,
            ..Default::default()
        };
        let executor = LoadExecutor::new(
            self.stores.load_storage.clone(),
            self.credentials.clone(),
            config,
            self.cancel.clone(),
        );
        executor.run().await.map_err(|e| {
            let pending = self
                .stores
                .load_storage
                .list_packages()
                .map(|p| p.len())
                .unwrap_or(0);
            step_failed("load", e, failed_metrics(pending)).into()
        })
    }

    /// `normalize` then `load`, with default worker counts.
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        let normalize_defaults = NormalizeConfig::default();
        self.normalize(normalize_defaults.workers, normalize_defaults.max_chunk)
            .await?;
        self.load(LoaderConfig::default().workers).await?;
        Ok(())
    }

    /// Pushes the default schema to the destination without loading data.
    pub async fn sync_schema(&self) -> Result<(), PipelineError> {
        self.verify_context()?;
        let schema = Arc::new(self.default_schema()?);
        let mut client = self
            .credentials
            .open_client(schema)
            .await
            .map_err(|e| step_failed("sync_schema", e, RunMetrics::idle()))?;
        let result: Result<(), LoadError> = async {
            client.initialize_storage().await?;
            client.update_storage_schema().await?;
            Ok(())
        }
        .await;
        result.map_err(|e| step_failed("sync_schema", e, RunMetrics::idle()))?;
        Ok(())
    }

    pub fn default_schema(&self) -> Result<Schema, PipelineError> {
        Ok(self
            .stores
            .schema_storage
            .load_schema(&self.state.default_schema_name)?)
    }

    /// Replaces the default schema, removing the previous one.
    pub fn set_default_schema(&mut self, mut schema: Schema) -> Result<(), PipelineError> {
        self.verify_context()?;
        let previous = self.state.default_schema_name.clone();
        self.stores.schema_storage.save_schema(&mut schema)?;
        let name = schema.name().to_string();
        self.with_state(|p| {
            if p.state.default_schema_name != name
                && p.stores.schema_storage.has_schema(&previous)
            {
                p.stores.schema_storage.remove_schema(&previous)?;
            }
            p.state.default_schema_name = name.clone();
            Ok(())
        })?;
        Ok(())
    }

    /// Extracted batches waiting for normalization.
    pub fn list_extracted_loads(&self) -> Result<Vec<String>, PipelineError> {
        self.verify_context()?;
        Ok(self.stores.normalize_storage.list_extracted_files()?)
    }

    /// Committed load packages waiting for the loader.
    pub fn list_normalized_loads(&self) -> Result<Vec<String>, PipelineError> {
        self.verify_context()?;
        Ok(self.stores.load_storage.list_packages()?)
    }

    /// Archived packages.
    pub fn list_completed_loads(&self) -> Result<Vec<String>, PipelineError> {
        self.verify_context()?;
        Ok(self.stores.load_storage.list_archived_packages()?)
    }

    /// Failed jobs of an archived package with their recorded exceptions.
    pub fn list_failed_jobs(
        &self,
        load_id: &str,
    ) -> Result<Vec<(String, Option<String>)>, PipelineError> {
        self.verify_context()?;
        Ok(self.stores.load_storage.list_archived_failed_jobs(load_id)?)
    }

    fn pending_extracted(&self) -> usize {
        self.stores
            .normalize_storage
            .list_extracted_files()
            .map(|f| f.len())
            .unwrap_or(0)
    }

    /// Runs `f` under scoped state: on failure the in-memory state rolls
    /// back, on success it is persisted with fsync.
    fn with_state<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let backup = self.state.clone();
        match f(self) {
            Ok(value) => {
                self.state.save(&self.root)?;
                Ok(value)
            }
            Err(err) => {
                self.state = backup;
                Err(err)
            }
        }
    }

    fn verify_context(&self) -> Result<(), PipelineError> {
        let generations = GENERATIONS.lock().expect("generation registry poisoned");
        if generations.get(&self.canonical_root) != Some(&self.generation) {
            return Err(PipelineError::InvalidPipelineContext);
        }
        Ok(())
    }
}

fn next_generation(canonical_root: &Path) -> u64 {
    let mut generations = GENERATIONS.lock().expect("generation registry poisoned");
    let generation = generations.entry(canonical_root.to_path_buf()).or_insert(0);
    *generation += 1;
    *generation
}

/// Wraps a record for extraction: non-mappings become `{"v": ...}` and
/// records without routing metadata are stamped with the default table.
fn prepare_record(item: Value, default_table: &str) -> Value {
    let mut object = match item {
        Value::Object(map) => map,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("v".to_string(), other);
            wrapped
        }
    };
    if !object.contains_key(METADATA_FIELD) {
        object.insert(
            METADATA_FIELD.to_string(),
            json!({ "table_name": default_table }),
        );
    }
    Value::Object(object)
}

fn step_failed(
    step: &'static str,
    source: impl std::error::Error + Send + Sync + 'static,
    last_metrics: RunMetrics,
) -> PipelineStepFailed {
    PipelineStepFailed {
        step,
        source: Box::new(source),
        last_metrics,
    }
}

fn failed_metrics(pending_items: usize) -> RunMetrics {
    RunMetrics {
        was_idle: false,
        has_failed: true,
        pending_items,
    }
}
