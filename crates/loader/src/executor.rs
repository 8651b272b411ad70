//! The load executor. One tick drives the first pending package: restore
//! started jobs, spool new ones onto a bounded worker pool, poll the live
//! set through the job state machine, and archive the package once nothing
//! is left. Packages are strictly consumed in lexicographic `load_id`
//! order, so schema evolution at the destination is serialized.

use crate::client::{Credentials, JobClient, JobStatus, LoadJob, StaticJob};
use crate::LoadError;
use futures::stream::{self, StreamExt};
use schema::{Schema, WriteDisposition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::{parse_job_file_name, LoadStorage, RunMetrics, NEW_JOBS_FOLDER, STARTED_JOBS_FOLDER};
use tokio_util::sync::CancellationToken;

/// Fixed pause between poll rounds over running jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoaderConfig {
    /// Upper bound on concurrently spooled jobs.
    pub workers: usize,
    /// Delete fully successful packages instead of archiving them.
    pub delete_completed_jobs: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            workers: 20,
            delete_completed_jobs: false,
        }
    }
}

impl LoaderConfig {
    /// Overrides fields from same-named, upper-cased environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse("DELETE_COMPLETED_JOBS") {
            self.delete_completed_jobs = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

pub struct LoadExecutor {
    load_storage: Arc<LoadStorage>,
    credentials: Credentials,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl LoadExecutor {
    pub fn new(
        load_storage: Arc<LoadStorage>,
        credentials: Credentials,
        config: LoaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        LoadExecutor {
            load_storage,
            credentials,
            config,
            cancel,
        }
    }

    /// Runs ticks until the store is drained or cancellation is requested.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<RunMetrics, LoadError> {
        loop {
            let metrics = self.load_tick().await?;
            if metrics.was_idle || metrics.pending_items == 0 || self.cancel.is_cancelled() {
                return Ok(metrics);
            }
        }
    }

    /// One pipeline tick over the first pending package.
    pub async fn load_tick(&self) -> Result<RunMetrics, LoadError> {
        let packages = self.load_storage.list_packages()?;
        let Some(load_id) = packages.first() else {
            return Ok(RunMetrics::idle());
        };
        let schema = Arc::new(self.load_storage.package_schema(load_id)?);
        tracing::info!(
            load_id = %load_id,
            schema = %schema.name(),
            version = schema.version(),
            "loading package"
        );

        let mut client = self.credentials.open_client(schema.clone()).await?;
        client.initialize_storage().await?;
        if self.load_storage.begin_schema_update(load_id)?.is_some() {
            client.update_storage_schema().await?;
            // Deleting the sentinel is the commit point of the evolution.
            self.load_storage.commit_schema_update(load_id)?;
        }
        let mut jobs = self.retrieve_jobs(&mut *client, load_id).await?;
        drop(client);

        if jobs.is_empty() {
            jobs = self.spool_new_jobs(load_id, &schema).await?;
        }

        if jobs.is_empty()
            && self.load_storage.list_new_jobs(load_id)?.is_empty()
            && self.load_storage.list_started_jobs(load_id)?.is_empty()
        {
            let mut client = self.credentials.open_client(schema.clone()).await?;
            client.complete_load(load_id).await?;
            self.load_storage
                .archive_package(load_id, self.config.delete_completed_jobs)?;
            metrics::counter!("loader_load_package_counter").increment(1);
            tracing::info!(load_id = %load_id, "all jobs completed, archived package");
        } else {
            self.complete_jobs(load_id, jobs).await?;
        }

        Ok(RunMetrics::pending(self.load_storage.list_packages()?.len()))
    }

    /// Rebinds every job left in `started/` by a previous run. Transient
    /// restore errors abort the tick (the next one retries); terminal ones
    /// become failed jobs.
    async fn retrieve_jobs(
        &self,
        client: &mut dyn JobClient,
        load_id: &str,
    ) -> Result<Vec<Box<dyn LoadJob>>, LoadError> {
        let started = self.load_storage.list_started_jobs(load_id)?;
        if started.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = started.len(), "retrieving started jobs");

        let mut jobs: Vec<Box<dyn LoadJob>> = Vec::with_capacity(started.len());
        for file_name in started {
            let path = self
                .load_storage
                .job_path(load_id, STARTED_JOBS_FOLDER, &file_name);
            let job = match client.restore_file_load(&path).await {
                Ok(job) => job,
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    tracing::error!(file = %file_name, %err, "job retrieval failed terminally");
                    Box::new(StaticJob::failed(file_name, err.to_string()))
                }
            };
            metrics::counter!("loader_jobs_counter", "status" => "retrieved").increment(1);
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Takes up to `workers` files from `new/` and starts each on its own
    /// client connection.
    async fn spool_new_jobs(
        &self,
        load_id: &str,
        schema: &Arc<Schema>,
    ) -> Result<Vec<Box<dyn LoadJob>>, LoadError> {
        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let mut files = self.load_storage.list_new_jobs(load_id)?;
        files.truncate(self.config.workers.max(1));
        if files.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = files.len(), "spooling new jobs");

        let spooled: Vec<Option<Box<dyn LoadJob>>> = stream::iter(
            files
                .into_iter()
                .map(|file_name| self.spool_job(load_id, file_name, schema.clone())),
        )
        .buffer_unordered(self.config.workers.max(1))
        .collect()
        .await;

        let jobs: Vec<Box<dyn LoadJob>> = spooled.into_iter().flatten().collect();
        metrics::gauge!("loader_last_package_jobs_counter", "status" => "running")
            .set(jobs.len() as f64);
        metrics::counter!("loader_jobs_counter", "status" => "running")
            .increment(jobs.len() as u64);
        Ok(jobs)
    }

    /// Starts one file. Terminal problems yield a synthetic failed job (the
    /// file still advances to `started/` so the poll loop can fail it in
    /// place); transient problems leave the file in `new/` and yield
    /// nothing.
    async fn spool_job(
        &self,
        load_id: &str,
        file_name: String,
        schema: Arc<Schema>,
    ) -> Option<Box<dyn LoadJob>> {
        let outcome = self.try_spool(load_id, &file_name, &schema).await;
        match outcome {
            Ok(job) => {
                if let Err(err) = self.load_storage.start_job(load_id, &file_name) {
                    tracing::error!(file = %file_name, %err, "failed to advance spooled job");
                    return None;
                }
                Some(job)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(file = %file_name, %err, "temporary problem spooling job");
                None
            }
            Err(err) => {
                tracing::error!(file = %file_name, %err, "terminal problem spooling job");
                if let Err(move_err) = self.load_storage.start_job(load_id, &file_name) {
                    tracing::error!(file = %file_name, %move_err, "failed to advance failed job");
                    return None;
                }
                Some(Box::new(StaticJob::failed(file_name, err.to_string())))
            }
        }
    }

    async fn try_spool(
        &self,
        load_id: &str,
        file_name: &str,
        schema: &Arc<Schema>,
    ) -> Result<Box<dyn LoadJob>, LoadError> {
        let job_file = parse_job_file_name(file_name).map_err(|err| LoadError::Terminal {
            message: err.to_string(),
        })?;
        let capabilities = self.credentials.capabilities();
        if !capabilities
            .supported_loader_file_formats
            .contains(&job_file.format)
        {
            return Err(LoadError::UnsupportedFileFormat {
                format: job_file.format,
                supported: capabilities.supported_loader_file_formats,
            });
        }
        let table = schema
            .table(&job_file.table)
            .ok_or_else(|| LoadError::UnknownTable {
                table: job_file.table.clone(),
                file: file_name.to_string(),
            })?;
        let disposition = schema
            .write_disposition(&job_file.table)
            .map_err(|_| LoadError::UnknownTable {
                table: job_file.table.clone(),
                file: file_name.to_string(),
            })?;
        if !matches!(
            disposition,
            WriteDisposition::Append | WriteDisposition::Replace
        ) {
            return Err(LoadError::UnsupportedWriteDisposition {
                table: job_file.table.clone(),
                disposition,
                file: file_name.to_string(),
            });
        }

        tracing::info!(file = file_name, table = %table.name, "starting file load");
        // Every job gets its own connection.
        let mut client = self.credentials.open_client(schema.clone()).await?;
        let path = self
            .load_storage
            .job_path(load_id, NEW_JOBS_FOLDER, file_name);
        client.start_file_load(table, disposition, &path).await
    }

    /// Polls the live set to completion. Completed, failed and retried jobs
    /// leave `started/` through their respective renames; running jobs are
    /// polled again after a cancellable sleep.
    async fn complete_jobs(
        &self,
        load_id: &str,
        mut jobs: Vec<Box<dyn LoadJob>>,
    ) -> Result<(), LoadError> {
        tracing::info!(count = jobs.len(), load_id = %load_id, "completing jobs");
        while !jobs.is_empty() {
            let mut remaining = Vec::new();
            for mut job in jobs {
                let file_name = job.file_name().to_string();
                let status = match job.status().await {
                    Ok(status) => status,
                    Err(err) if err.is_transient() => return Err(err),
                    Err(err) => {
                        tracing::error!(file = %file_name, %err, "job status failed terminally");
                        let path = self.load_storage.fail_job(
                            load_id,
                            &file_name,
                            Some(&err.to_string()),
                        )?;
                        self.observe_wait(&path);
                        self.count_job("failed");
                        continue;
                    }
                };
                match status {
                    JobStatus::Running => {
                        remaining.push(job);
                        continue;
                    }
                    JobStatus::Completed => {
                        let path = self.load_storage.complete_job(load_id, &file_name)?;
                        self.observe_wait(&path);
                        tracing::info!(file = %file_name, load_id = %load_id, "job completed");
                        self.count_job("completed");
                    }
                    JobStatus::Failed => {
                        let exception = job.exception();
                        let path = self.load_storage.fail_job(
                            load_id,
                            &file_name,
                            exception.as_deref(),
                        )?;
                        self.observe_wait(&path);
                        tracing::error!(
                            file = %file_name,
                            load_id = %load_id,
                            exception = exception.as_deref().unwrap_or(""),
                            "job failed terminally"
                        );
                        self.count_job("failed");
                    }
                    JobStatus::Retry => {
                        let path = self.load_storage.retry_job(load_id, &file_name)?;
                        self.observe_wait(&path);
                        tracing::warn!(file = %file_name, load_id = %load_id, "job sent back for retry");
                        self.count_job("retry");
                    }
                }
            }
            if remaining.is_empty() {
                break;
            }
            jobs = remaining;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(load_id = %load_id, "cancelled while polling jobs");
                    return Ok(());
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        Ok(())
    }

    fn count_job(&self, status: &'static str) {
        metrics::counter!("loader_jobs_counter", "status" => status).increment(1);
        metrics::gauge!("loader_last_package_jobs_counter", "status" => status).increment(1.0);
    }

    fn observe_wait(&self, path: &std::path::Path) {
        if let Ok(elapsed) = self.load_storage.job_elapsed_seconds(path) {
            metrics::histogram!("loader_jobs_wait_seconds").record(elapsed);
        }
    }
}
