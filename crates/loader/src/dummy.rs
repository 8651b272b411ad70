//! A destination that loads nothing: jobs roll their status from threshold
//! probabilities, which makes the executor's whole state machine drivable
//! from tests (and from a dry-run configuration) without a warehouse.

use crate::client::{Capabilities, JobClient, JobStatus, LoadJob, StaticJob};
use crate::LoadError;
use async_trait::async_trait;
use schema::{Table, WriteDisposition};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Instant;
use storage::FileFormat;

fn default_format() -> FileFormat {
    FileFormat::Jsonl
}

fn default_timeout() -> f64 {
    10.0
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DummyConfig {
    #[serde(default = "default_format")]
    pub loader_file_format: FileFormat,
    /// Probability thresholds rolled on every poll, in order: fail, retry,
    /// complete. With 0.0/1.0 values the client is fully deterministic.
    #[serde(default)]
    pub fail_prob: f64,
    #[serde(default)]
    pub retry_prob: f64,
    #[serde(default)]
    pub completed_prob: f64,
    /// Seconds a job may stay running before it fails on its own.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Whether `restore_file_load` rebinds started jobs as completed, the
    /// way a synchronous backend would, instead of failing `JobNotFound`.
    #[serde(default)]
    pub retrieve_completed_jobs: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        DummyConfig {
            loader_file_format: default_format(),
            fail_prob: 0.0,
            retry_prob: 0.0,
            completed_prob: 0.0,
            timeout: default_timeout(),
            retrieve_completed_jobs: false,
        }
    }
}

impl DummyConfig {
    /// Overrides fields from same-named, upper-cased environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("FAIL_PROB") {
            self.fail_prob = v;
        }
        if let Some(v) = env_parse("RETRY_PROB") {
            self.retry_prob = v;
        }
        if let Some(v) = env_parse("COMPLETED_PROB") {
            self.completed_prob = v;
        }
        if let Some(v) = env_parse("TIMEOUT") {
            self.timeout = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

pub struct DummyClient {
    config: DummyConfig,
}

impl DummyClient {
    pub fn new(config: DummyConfig) -> Self {
        DummyClient { config }
    }

    pub fn capabilities_for(config: &DummyConfig) -> Capabilities {
        Capabilities {
            preferred_loader_file_format: config.loader_file_format,
            supported_loader_file_formats: vec![config.loader_file_format],
        }
    }
}

#[async_trait]
impl JobClient for DummyClient {
    fn capabilities(&self) -> Capabilities {
        Self::capabilities_for(&self.config)
    }

    async fn initialize_storage(&mut self) -> Result<(), LoadError> {
        Ok(())
    }

    async fn update_storage_schema(&mut self) -> Result<(), LoadError> {
        Ok(())
    }

    async fn start_file_load(
        &mut self,
        _table: &Table,
        _disposition: WriteDisposition,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError> {
        Ok(Box::new(DummyJob::new(file_path, self.config.clone())))
    }

    async fn restore_file_load(
        &mut self,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError> {
        let file_name = file_name_of(file_path);
        if self.config.retrieve_completed_jobs {
            Ok(Box::new(StaticJob::completed(file_name)))
        } else {
            Err(LoadError::JobNotFound { file: file_name })
        }
    }

    async fn complete_load(&mut self, _load_id: &str) -> Result<(), LoadError> {
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug)]
struct DummyJob {
    file_name: String,
    config: DummyConfig,
    started: Instant,
    polls: u64,
    state: JobStatus,
    exception: Option<String>,
}

impl DummyJob {
    fn new(file_path: &Path, config: DummyConfig) -> Self {
        DummyJob {
            file_name: file_name_of(file_path),
            config,
            started: Instant::now(),
            polls: 0,
            state: JobStatus::Running,
            exception: None,
        }
    }

    /// Deterministic stand-in for a random draw: hashes the file name and
    /// poll count into [0, 1).
    fn roll(&self) -> f64 {
        let mut hasher = DefaultHasher::new();
        self.file_name.hash(&mut hasher);
        self.polls.hash(&mut hasher);
        (hasher.finish() as f64) / (u64::MAX as f64 + 1.0)
    }
}

#[async_trait]
impl LoadJob for DummyJob {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    async fn status(&mut self) -> Result<JobStatus, LoadError> {
        if self.state != JobStatus::Running {
            return Ok(self.state);
        }
        self.polls += 1;
        let roll = self.roll();
        let c = &self.config;
        self.state = if roll < c.fail_prob {
            self.exception = Some("a configured failure occurred".to_string());
            JobStatus::Failed
        } else if roll < c.fail_prob + c.retry_prob {
            self.exception = Some("a configured retry occurred".to_string());
            JobStatus::Retry
        } else if roll < c.fail_prob + c.retry_prob + c.completed_prob {
            JobStatus::Completed
        } else if self.started.elapsed().as_secs_f64() > c.timeout {
            self.exception = Some("job timed out".to_string());
            JobStatus::Failed
        } else {
            JobStatus::Running
        };
        Ok(self.state)
    }

    fn exception(&self) -> Option<String> {
        self.exception.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn job(config: DummyConfig) -> DummyJob {
        DummyJob::new(Path::new("/tmp/events.0000.jsonl"), config)
    }

    #[tokio::test]
    async fn thresholds_decide_the_outcome() {
        let mut completed = job(DummyConfig {
            completed_prob: 1.0,
            ..Default::default()
        });
        assert_eq!(JobStatus::Completed, completed.status().await.unwrap());
        // Terminal states are sticky.
        assert_eq!(JobStatus::Completed, completed.status().await.unwrap());

        let mut failed = job(DummyConfig {
            fail_prob: 1.0,
            ..Default::default()
        });
        assert_eq!(JobStatus::Failed, failed.status().await.unwrap());
        assert!(failed.exception().is_some());

        let mut retried = job(DummyConfig {
            retry_prob: 1.0,
            ..Default::default()
        });
        assert_eq!(JobStatus::Retry, retried.status().await.unwrap());
    }

    #[tokio::test]
    async fn zero_probabilities_keep_the_job_running() {
        let mut running = job(DummyConfig {
            timeout: 3600.0,
            ..Default::default()
        });
        assert_eq!(JobStatus::Running, running.status().await.unwrap());
        assert_eq!(JobStatus::Running, running.status().await.unwrap());
    }

    #[tokio::test]
    async fn restore_depends_on_configuration() {
        let mut client = DummyClient::new(DummyConfig::default());
        let err = client
            .restore_file_load(Path::new("/x/events.0000.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::JobNotFound { .. }));

        let mut client = DummyClient::new(DummyConfig {
            retrieve_completed_jobs: true,
            ..Default::default()
        });
        let mut restored = client
            .restore_file_load(Path::new("/x/events.0000.jsonl"))
            .await
            .unwrap();
        assert_eq!(JobStatus::Completed, restored.status().await.unwrap());
    }
}
