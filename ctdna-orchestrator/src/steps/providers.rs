//! Interfaces of the external services steps call.
//!
//! Each provider is an opaque request/response service. Implementations
//! for tests and local runs live in [`crate::testing`].

use crate::errors::ProviderError;
use crate::events::EventBus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// A library record from the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryRecord {
    /// Lab library id.
    pub library_id: String,
    /// Metadata service id.
    pub orcabus_id: String,
    /// Owning subject.
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Owning individual.
    #[serde(default)]
    pub individual_id: Option<String>,
}

/// One row of a fastq list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FastqListRow {
    /// Read group id, `<i7>+<i5>.<lane>.<instrumentRunId>`.
    pub rgid: String,
    /// Read group library.
    pub rglb: String,
    /// Read group sample.
    pub rgsm: String,
    /// Lane number.
    pub lane: u32,
    /// Read 1 URI.
    pub read1_file_uri: String,
    /// Read 2 URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read2_file_uri: Option<String>,
}

/// Pre-launch QC estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QcSummary {
    /// Estimated coverage.
    pub coverage_estimate: Option<f64>,
    /// Estimated duplicate fraction.
    pub duplication_fraction_estimate: Option<f64>,
    /// Estimated insert size.
    pub insert_size_estimate: Option<f64>,
}

/// Metadata and fastq catalogue.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Fetches a library by orcabus id or library id.
    async fn get_library(&self, id: &str) -> Result<LibraryRecord, ProviderError>;

    /// Lists the read group ids of a library's active fastqs.
    async fn get_fastq_rgids(&self, library_id: &str) -> Result<Vec<String>, ProviderError>;

    /// Resolves read group ids to fastq ids.
    async fn get_fastq_ids(&self, rgids: &[String]) -> Result<Vec<String>, ProviderError>;

    /// Fetches fastq list rows for fastq ids.
    async fn get_fastq_list_rows(&self, fastq_ids: &[String]) -> Result<Vec<FastqListRow>, ProviderError>;

    /// Summarises pre-launch QC for read groups.
    async fn get_qc_summary(&self, rgids: &[String]) -> Result<QcSummary, ProviderError>;

    /// Returns the instrument run id of a fastq.
    async fn get_instrument_run_id(&self, fastq_id: &str) -> Result<String, ProviderError>;
}

/// Hierarchical parameter store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Reads a parameter by path.
    async fn get_parameter(&self, path: &str) -> Result<String, ProviderError>;
}

/// Versioned schema validation.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Validates a document; returns violated field paths (empty on pass).
    async fn validate(
        &self,
        schema_name: &str,
        version: &str,
        document: &Value,
    ) -> Result<Vec<String>, ProviderError>;
}

/// Object storage addressed by URI.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Lists object URIs under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError>;

    /// Reads an object as text.
    async fn read_text(&self, uri: &str) -> Result<String, ProviderError>;

    /// Writes (or overwrites) an object.
    async fn put_text(&self, uri: &str, body: &str) -> Result<(), ProviderError>;

    /// Deletes every object under a prefix and returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, ProviderError>;
}

/// Free-text comments attached to a run.
#[async_trait]
pub trait CommentService: Send + Sync {
    /// Adds a comment.
    async fn add_comment(&self, portal_run_id: &str, comment: &str, author: &str) -> Result<(), ProviderError>;
}

/// Request to run the bounded post-processing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTaskRequest {
    /// Task family.
    pub task_name: String,
    /// vCPUs.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mib: u32,
    /// Input object.
    pub input_uri: String,
    /// Expected output object.
    pub output_uri: String,
    /// Environment passed to the container.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Failure of a container task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The container never started; safe to retry.
    #[error("task launch failed: {0}")]
    Launch(String),

    /// The container ran and failed; not retried.
    #[error("task failed with exit code {exit_code}: {reason}")]
    Failed {
        /// Exit code.
        exit_code: i32,
        /// Reason reported by the task.
        reason: String,
    },
}

/// Launches container tasks and waits for them to finish.
#[async_trait]
pub trait ContainerTaskRunner: Send + Sync {
    /// Runs the task; returns the produced output URI.
    async fn run(&self, request: &ContainerTaskRequest) -> Result<String, TaskError>;
}

/// Every external service a step may call.
#[derive(Clone)]
pub struct Providers {
    /// Metadata and fastq catalogue.
    pub metadata: Arc<dyn MetadataService>,
    /// Parameter store.
    pub parameters: Arc<dyn ParameterStore>,
    /// Schema registry.
    pub schemas: Arc<dyn SchemaRegistry>,
    /// Object storage.
    pub storage: Arc<dyn StorageService>,
    /// Run comments.
    pub comments: Arc<dyn CommentService>,
    /// Container tasks.
    pub tasks: Arc<dyn ContainerTaskRunner>,
    /// Event bus.
    pub bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}
