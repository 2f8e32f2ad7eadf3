//! In-memory providers for tests and local runs.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ParameterPaths;
use crate::core::lookup_path;
use crate::errors::ProviderError;
use crate::steps::{
    CommentService, ContainerTaskRequest, ContainerTaskRunner, FastqListRow, LibraryRecord,
    MetadataService, ParameterStore, QcSummary, SchemaRegistry, StorageService, TaskError,
};
use serde_json::Value;

/// Orcabus id of the standard library.
pub const STANDARD_ORCABUS_ID: &str = "lib.01J5M2JFE1JPYV62RYQEG99CP5";
/// Lab id of the standard library.
pub const STANDARD_LIBRARY_ID: &str = "L2401531";
/// Subject of the standard library.
pub const STANDARD_SUBJECT_ID: &str = "SBJ05828";
/// Instrument run of the standard fastqs.
pub const STANDARD_INSTRUMENT_RUN_ID: &str = "250620_A01052_0123_BHXXXX";
/// Read group of the standard fastq.
pub const STANDARD_RGID: &str = "GAATTCGT+TTATGAGT.1.250620_A01052_0123_BHXXXX";
/// Fastq id of the standard read group.
pub const STANDARD_FASTQ_ID: &str = "fqr.01JQ3BEKS05C74XWT5PYED6KV5";

/// Root under which the standard parameter store places run directories.
pub const STANDARD_BUCKET: &str = "s3://pipeline-cache-503977275616/byob-icav2";

/// Metadata service backed by maps.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    libraries: HashMap<String, LibraryRecord>,
    rgids: HashMap<String, Vec<String>>,
    fastq_ids: HashMap<String, String>,
    rows: HashMap<String, FastqListRow>,
    qc: HashMap<String, QcSummary>,
    instrument_runs: HashMap<String, String>,
    calls: AtomicUsize,
}

impl InMemoryMetadata {
    /// Creates an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One ctDNA library with one ORA-compressed read group.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_library(LibraryRecord {
                library_id: STANDARD_LIBRARY_ID.to_string(),
                orcabus_id: STANDARD_ORCABUS_ID.to_string(),
                subject_id: Some(STANDARD_SUBJECT_ID.to_string()),
                individual_id: Some("SBJ05828".to_string()),
            })
            .with_fastq(
                STANDARD_LIBRARY_ID,
                STANDARD_FASTQ_ID,
                FastqListRow {
                    rgid: STANDARD_RGID.to_string(),
                    rglb: STANDARD_LIBRARY_ID.to_string(),
                    rgsm: STANDARD_LIBRARY_ID.to_string(),
                    lane: 1,
                    read1_file_uri: "s3://fastq-archive/250620_A01052_0123_BHXXXX/L2401531_S1_L001_R1_001.fastq.ora"
                        .to_string(),
                    read2_file_uri: Some(
                        "s3://fastq-archive/250620_A01052_0123_BHXXXX/L2401531_S1_L001_R2_001.fastq.ora"
                            .to_string(),
                    ),
                },
                STANDARD_INSTRUMENT_RUN_ID,
            )
            .with_qc(
                STANDARD_RGID,
                QcSummary {
                    coverage_estimate: Some(1210.5),
                    duplication_fraction_estimate: Some(0.42),
                    insert_size_estimate: Some(167.0),
                },
            )
    }

    /// Adds a library, addressable by both ids.
    #[must_use]
    pub fn with_library(mut self, record: LibraryRecord) -> Self {
        self.libraries.insert(record.library_id.clone(), record.clone());
        self.libraries.insert(record.orcabus_id.clone(), record);
        self
    }

    /// Adds a fastq of a library.
    #[must_use]
    pub fn with_fastq(
        mut self,
        library_id: &str,
        fastq_id: &str,
        row: FastqListRow,
        instrument_run_id: &str,
    ) -> Self {
        self.rgids
            .entry(library_id.to_string())
            .or_default()
            .push(row.rgid.clone());
        self.fastq_ids.insert(row.rgid.clone(), fastq_id.to_string());
        self.instrument_runs
            .insert(fastq_id.to_string(), instrument_run_id.to_string());
        self.rows.insert(fastq_id.to_string(), row);
        self
    }

    /// Adds QC estimates for a read group.
    #[must_use]
    pub fn with_qc(mut self, rgid: &str, qc: QcSummary) -> Self {
        self.qc.insert(rgid.to_string(), qc);
        self
    }

    /// Number of calls served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn not_found(what: &str, id: &str) -> ProviderError {
    ProviderError::NotFound(format!("{what} '{id}'"))
}

#[async_trait]
impl MetadataService for InMemoryMetadata {
    async fn get_library(&self, id: &str) -> Result<LibraryRecord, ProviderError> {
        self.record_call();
        self.libraries
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("library", id))
    }

    async fn get_fastq_rgids(&self, library_id: &str) -> Result<Vec<String>, ProviderError> {
        self.record_call();
        Ok(self.rgids.get(library_id).cloned().unwrap_or_default())
    }

    async fn get_fastq_ids(&self, rgids: &[String]) -> Result<Vec<String>, ProviderError> {
        self.record_call();
        rgids
            .iter()
            .map(|rgid| {
                self.fastq_ids
                    .get(rgid)
                    .cloned()
                    .ok_or_else(|| not_found("read group", rgid))
            })
            .collect()
    }

    async fn get_fastq_list_rows(&self, fastq_ids: &[String]) -> Result<Vec<FastqListRow>, ProviderError> {
        self.record_call();
        fastq_ids
            .iter()
            .map(|id| self.rows.get(id).cloned().ok_or_else(|| not_found("fastq", id)))
            .collect()
    }

    async fn get_qc_summary(&self, rgids: &[String]) -> Result<QcSummary, ProviderError> {
        self.record_call();
        Ok(rgids
            .iter()
            .find_map(|rgid| self.qc.get(rgid).cloned())
            .unwrap_or_default())
    }

    async fn get_instrument_run_id(&self, fastq_id: &str) -> Result<String, ProviderError> {
        self.record_call();
        self.instrument_runs
            .get(fastq_id)
            .cloned()
            .ok_or_else(|| not_found("fastq", fastq_id))
    }
}

/// Parameter store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl InMemoryParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Project, output, logs and cache locations under `paths`.
    ///
    /// Pipeline ids are left out so the configured fallback applies.
    #[must_use]
    pub fn standard(paths: &ParameterPaths) -> Self {
        Self::new()
            .with(paths.project_id(), "ea19a3f5-ec7c-4940-a474-c31cd91dbad4")
            .with(paths.output_prefix(), format!("{STANDARD_BUCKET}/analysis/dragen-tso500-ctdna"))
            .with(paths.logs_prefix(), format!("{STANDARD_BUCKET}/logs/dragen-tso500-ctdna/"))
            .with(paths.cache_prefix(), format!("{STANDARD_BUCKET}/cache/dragen-tso500-ctdna/"))
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with(self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.write().insert(path.into(), value.into());
        self
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get_parameter(&self, path: &str) -> Result<String, ProviderError> {
        self.values
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("parameter", path))
    }
}

/// Schema registry that checks a list of required paths.
///
/// Null values, empty strings and empty arrays count as missing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySchemaRegistry {
    required: Vec<String>,
}

impl InMemorySchemaRegistry {
    /// Requires the given paths.
    #[must_use]
    pub fn requiring<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// The fields a complete ctDNA draft must carry.
    #[must_use]
    pub fn standard() -> Self {
        Self::requiring([
            "inputs.fastqListRows",
            "engineParameters.pipelineId",
            "engineParameters.projectId",
            "engineParameters.outputUri",
            "engineParameters.logsUri",
            "engineParameters.cacheUri",
            "tags.libraryId",
        ])
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn validate(
        &self,
        _schema_name: &str,
        _version: &str,
        document: &Value,
    ) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .required
            .iter()
            .filter(|path| match lookup_path(document, path) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            })
            .cloned()
            .collect())
    }
}

/// Object storage backed by a sorted map.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: RwLock<BTreeMap<String, String>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an object.
    pub fn insert(&self, uri: impl Into<String>, body: impl Into<String>) {
        self.objects.write().insert(uri.into(), body.into());
    }

    /// Reads an object.
    #[must_use]
    pub fn object(&self, uri: &str) -> Option<String> {
        self.objects.read().get(uri).cloned()
    }

    /// Every stored URI, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageService for InMemoryStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|uri| uri.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read_text(&self, uri: &str) -> Result<String, ProviderError> {
        self.object(uri).ok_or_else(|| not_found("object", uri))
    }

    async fn put_text(&self, uri: &str, body: &str) -> Result<(), ProviderError> {
        self.insert(uri, body);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, ProviderError> {
        let mut objects = self.objects.write();
        let before = objects.len();
        objects.retain(|uri, _| !uri.starts_with(prefix));
        match before - objects.len() {
            0 => Err(not_found("prefix", prefix)),
            removed => Ok(removed),
        }
    }
}

/// A comment posted on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedComment {
    /// The run.
    pub portal_run_id: String,
    /// Comment text.
    pub comment: String,
    /// Author.
    pub author: String,
}

/// Comment service that records comments.
#[derive(Debug, Default)]
pub struct InMemoryComments {
    comments: Mutex<Vec<RecordedComment>>,
    fail_next: AtomicUsize,
}

impl InMemoryComments {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All comments, in posting order.
    #[must_use]
    pub fn comments(&self) -> Vec<RecordedComment> {
        self.comments.lock().clone()
    }

    /// Comments of one run.
    #[must_use]
    pub fn comments_for(&self, portal_run_id: &str) -> Vec<RecordedComment> {
        self.comments
            .lock()
            .iter()
            .filter(|c| c.portal_run_id == portal_run_id)
            .cloned()
            .collect()
    }

    /// Rejects the next `n` comments with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommentService for InMemoryComments {
    async fn add_comment(&self, portal_run_id: &str, comment: &str, author: &str) -> Result<(), ProviderError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Transient("comment service unavailable".to_string()));
        }
        self.comments.lock().push(RecordedComment {
            portal_run_id: portal_run_id.to_string(),
            comment: comment.to_string(),
            author: author.to_string(),
        });
        Ok(())
    }
}

/// Container task runner with scripted failures.
///
/// Launch failures are consumed first, then run failures; afterwards every
/// task succeeds and reports its requested output URI.
#[derive(Debug, Default)]
pub struct ScriptedTaskRunner {
    launch_failures: AtomicUsize,
    run_failures: AtomicUsize,
    launch_attempts: AtomicUsize,
    requests: Mutex<Vec<ContainerTaskRequest>>,
}

impl ScriptedTaskRunner {
    /// A runner on which every task succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` launches.
    #[must_use]
    pub fn fail_launches(self, n: usize) -> Self {
        self.launch_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fails the next `n` started tasks.
    #[must_use]
    pub fn fail_runs(self, n: usize) -> Self {
        self.run_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Number of launch attempts.
    #[must_use]
    pub fn launch_attempts(&self) -> usize {
        self.launch_attempts.load(Ordering::SeqCst)
    }

    /// Requests of tasks that started.
    #[must_use]
    pub fn requests(&self) -> Vec<ContainerTaskRequest> {
        self.requests.lock().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ContainerTaskRunner for ScriptedTaskRunner {
    async fn run(&self, request: &ContainerTaskRequest) -> Result<String, TaskError> {
        self.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.launch_failures) {
            return Err(TaskError::Launch("no capacity in compute environment".to_string()));
        }
        self.requests.lock().push(request.clone());
        if take_one(&self.run_failures) {
            return Err(TaskError::Failed {
                exit_code: 1,
                reason: format!("bgzip failed on '{}'", request.input_uri),
            });
        }
        Ok(request.output_uri.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_standard_metadata_chain() {
        let metadata = InMemoryMetadata::standard();
        let library = metadata.get_library(STANDARD_ORCABUS_ID).await.unwrap();
        let rgids = metadata.get_fastq_rgids(&library.library_id).await.unwrap();
        let ids = metadata.get_fastq_ids(&rgids).await.unwrap();
        let rows = metadata.get_fastq_list_rows(&ids).await.unwrap();

        assert_eq!(rows[0].rgsm, STANDARD_LIBRARY_ID);
        assert_eq!(
            metadata.get_instrument_run_id(&ids[0]).await.unwrap(),
            STANDARD_INSTRUMENT_RUN_ID
        );
        assert_eq!(metadata.calls(), 5);
        assert!(metadata.get_library("lib.unknown").await.is_err());
    }

    #[tokio::test]
    async fn test_schema_registry_reports_missing_paths() {
        let schemas = InMemorySchemaRegistry::requiring(["inputs.fastqListRows", "tags.libraryId"]);
        let violations = schemas
            .validate("completeDataDraft", "2025.07.29", &json!({"inputs": {"fastqListRows": []}, "tags": {"libraryId": "L1"}}))
            .await
            .unwrap();
        assert_eq!(violations, vec!["inputs.fastqListRows".to_string()]);
    }

    #[tokio::test]
    async fn test_storage_prefix_operations() {
        let storage = InMemoryStorage::new();
        storage.insert("s3://cache/r1/SampleSheet.csv", "x");
        storage.insert("s3://cache/r1/a.txt", "y");
        storage.insert("s3://cache/r2/a.txt", "z");

        assert_eq!(storage.list("s3://cache/r1/").await.unwrap().len(), 2);
        assert_eq!(storage.delete_prefix("s3://cache/r1/").await.unwrap(), 2);
        assert!(matches!(
            storage.delete_prefix("s3://cache/r1/").await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(storage.uris(), vec!["s3://cache/r2/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_comment_failures_are_scripted() {
        let comments = InMemoryComments::new();
        comments.fail_next(1);
        assert!(comments.add_comment("r1", "first", "bot").await.is_err());
        comments.add_comment("r1", "second", "bot").await.unwrap();
        assert_eq!(comments.comments_for("r1").len(), 1);
    }
}
