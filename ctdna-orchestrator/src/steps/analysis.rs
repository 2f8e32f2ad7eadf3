//! Steps reacting to engine analysis state changes.

use super::providers::{ContainerTaskRequest, ContainerTaskRunner, StorageService, TaskError};
use super::{first_sample_id, Step, StepContext, StepOutput};
use crate::core::WorkflowRunStatus;
use crate::errors::{reasons, ProviderError, StepError};
use crate::pipeline::{with_retry_if, RetryOutcome};
use crate::registry::StepId;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Metrics file whose `FAILED_STEPS` row reports per-sample failures.
pub const METRICS_OUTPUT_PATH: &str = "Results/MetricsOutput.tsv";

/// Container task family used for compression.
pub const COMPRESSION_TASK: &str = "compress-vcf";

const NOT_SUCCEEDED: &str = "analysis did not succeed";

/// Maps an engine status to a lifecycle status.
pub(crate) fn map_engine_status(status: &str) -> Option<WorkflowRunStatus> {
    match status.to_ascii_uppercase().as_str() {
        "SUBMITTED" | "PENDING" | "RUNNABLE" | "STARTING" | "INITIALIZING" => {
            Some(WorkflowRunStatus::Submitted)
        }
        "RUNNING" | "IN_PROGRESS" => Some(WorkflowRunStatus::Running),
        "SUCCEEDED" => Some(WorkflowRunStatus::Succeeded),
        "FAILED" | "ABORTED" => Some(WorkflowRunStatus::Failed),
        _ => None,
    }
}

fn success_only(ctx: &StepContext<'_>) -> Option<String> {
    (!ctx.analysis_succeeded()).then(|| NOT_SUCCEEDED.to_string())
}

/// Translates the engine event into a lifecycle status and, on success,
/// the output locations.
#[derive(Debug, Clone, Copy)]
pub struct ConvertIcav2WesToWrscEvent;

#[async_trait]
impl Step for ConvertIcav2WesToWrscEvent {
    fn id(&self) -> StepId {
        StepId::ConvertIcav2WesToWrscEvent
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let engine_status = ctx.require_str("analysis.status")?;
        let status = map_engine_status(&engine_status).ok_or_else(|| {
            StepError::fatal(
                reasons::BAD_INPUT,
                format!("unknown engine status '{engine_status}'"),
            )
        })?;

        if status != WorkflowRunStatus::Succeeded {
            return Ok(StepOutput::ok_empty().with_status(status));
        }

        let sample_id = first_sample_id(ctx)
            .ok_or_else(|| StepError::missing_input("inputs.fastqListRows"))?;
        Ok(StepOutput::fragment(json!({
            "outputs": {
                "sampleResultsDirRelPath": format!("Results/{sample_id}/"),
                "tso500NextflowLogsRelPath": "TSO500_Nextflow_Logs/",
                "LogsIntermediatesRelPath": "Logs_Intermediates/",
            }
        }))
        .with_status(status))
    }
}

/// Reads the `FAILED_STEPS` row from a metrics table.
///
/// Returns `None` when the row is absent or reads `NA`.
#[must_use]
pub fn failed_steps(metrics: &str) -> Option<String> {
    metrics
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .find(|(key, _)| key.trim() == "FAILED_STEPS")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && value != "NA")
}

/// Fails the run if the engine reported failed steps for the sample.
pub struct CheckSampleHasSucceeded {
    storage: Arc<dyn StorageService>,
}

impl CheckSampleHasSucceeded {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }
}

impl std::fmt::Debug for CheckSampleHasSucceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CheckSampleHasSucceeded")
    }
}

#[async_trait]
impl Step for CheckSampleHasSucceeded {
    fn id(&self) -> StepId {
        StepId::CheckSampleHasSucceeded
    }

    fn skip_reason(&self, ctx: &StepContext<'_>) -> Option<String> {
        success_only(ctx)
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let output_uri = ctx.require_str("engineParameters.outputUri")?;
        let metrics = self
            .storage
            .read_text(&format!("{output_uri}{METRICS_OUTPUT_PATH}"))
            .await?;
        match failed_steps(&metrics) {
            None => Ok(StepOutput::ok_empty()),
            Some(steps) => Err(StepError::fatal(
                reasons::ANALYSIS_FAILED,
                format!("sample failed analysis steps: {steps}"),
            )),
        }
    }
}

/// Lists uncompressed variant files under the sample results directory.
pub struct FindVcfFiles {
    storage: Arc<dyn StorageService>,
}

impl FindVcfFiles {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }
}

impl std::fmt::Debug for FindVcfFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FindVcfFiles")
    }
}

/// Returns the `.vcf` and `.gvcf` objects lacking a `.gz` sibling.
#[must_use]
pub fn uncompressed_vcfs(objects: &[String]) -> Vec<String> {
    let present: BTreeSet<&str> = objects.iter().map(String::as_str).collect();
    objects
        .iter()
        .filter(|uri| {
            std::path::Path::new(uri.as_str())
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("vcf") || ext.eq_ignore_ascii_case("gvcf"))
        })
        .filter(|uri| !present.contains(format!("{uri}.gz").as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl Step for FindVcfFiles {
    fn id(&self) -> StepId {
        StepId::FindVcfFiles
    }

    fn skip_reason(&self, ctx: &StepContext<'_>) -> Option<String> {
        success_only(ctx)
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let output_uri = ctx.require_str("engineParameters.outputUri")?;
        let results_dir = ctx.require_str("outputs.sampleResultsDirRelPath")?;
        let objects = self.storage.list(&format!("{output_uri}{results_dir}")).await?;
        let vcfs = uncompressed_vcfs(&objects);
        tracing::debug!(found = vcfs.len(), "Located uncompressed variant files");
        Ok(StepOutput::ok_empty().with_scratch("vcfFiles", json!(vcfs)))
    }
}

/// Compresses each variant file in a bounded container task.
///
/// Launch failures are retried; a task that ran and failed is not.
pub struct CompressVcfFiles {
    tasks: Arc<dyn ContainerTaskRunner>,
}

impl CompressVcfFiles {
    pub fn new(tasks: Arc<dyn ContainerTaskRunner>) -> Self {
        Self { tasks }
    }

    async fn compress(&self, ctx: &StepContext<'_>, vcf: &str) -> Result<String, StepError> {
        let task = &ctx.config.container_task;
        let request = ContainerTaskRequest {
            task_name: COMPRESSION_TASK.to_string(),
            cpu: task.cpu,
            memory_mib: task.memory_mib,
            input_uri: vcf.to_string(),
            output_uri: format!("{vcf}.gz"),
            environment: BTreeMap::from([(
                "PORTAL_RUN_ID".to_string(),
                ctx.run.portal_run_id().to_string(),
            )]),
        };

        let attempt = with_retry_if(
            &task.launch_retry,
            vcf,
            || self.tasks.run(&request),
            |e: &TaskError| matches!(e, TaskError::Launch(_)),
        );
        let RetryOutcome { result, attempts, exhausted } = tokio::time::timeout(task.timeout(), attempt)
            .await
            .map_err(|_| {
                StepError::fatal(
                    reasons::STEP_TIMEOUT,
                    format!("compression of '{vcf}' exceeded {}s", task.timeout_seconds),
                )
            })?;

        result.map_err(|e| match e {
            TaskError::Launch(reason) if exhausted => StepError::fatal(
                reasons::TASK_LAUNCH_FAILED,
                format!("could not launch compression of '{vcf}' after {attempts} attempts: {reason}"),
            ),
            TaskError::Launch(reason) => StepError::fatal(reasons::TASK_LAUNCH_FAILED, reason),
            TaskError::Failed { exit_code, reason } => StepError::fatal(
                reasons::TASK_FAILED,
                format!("compression of '{vcf}' exited with {exit_code}: {reason}"),
            ),
        })
    }
}

impl std::fmt::Debug for CompressVcfFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompressVcfFiles")
    }
}

#[async_trait]
impl Step for CompressVcfFiles {
    fn id(&self) -> StepId {
        StepId::CompressVcfFiles
    }

    fn skip_reason(&self, ctx: &StepContext<'_>) -> Option<String> {
        success_only(ctx)
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let vcfs = ctx.require_strings("scratch.vcfFiles")?;
        if vcfs.is_empty() {
            return Ok(StepOutput::skip("no uncompressed variant files"));
        }

        let mut compressed = Vec::with_capacity(vcfs.len());
        for vcf in &vcfs {
            compressed.push(self.compress(ctx, vcf).await?);
        }
        tracing::info!(files = compressed.len(), "Compressed variant files");
        Ok(StepOutput::fragment(json!({"outputs": {"compressedVcfUris": compressed}})))
    }
}

/// Removes the run's cache directory.
pub struct DeleteCacheUri {
    storage: Arc<dyn StorageService>,
}

impl DeleteCacheUri {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }
}

impl std::fmt::Debug for DeleteCacheUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeleteCacheUri")
    }
}

#[async_trait]
impl Step for DeleteCacheUri {
    fn id(&self) -> StepId {
        StepId::DeleteCacheUri
    }

    fn skip_reason(&self, ctx: &StepContext<'_>) -> Option<String> {
        success_only(ctx)
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let cache_uri = ctx.require_str("engineParameters.cacheUri")?;
        match self.storage.delete_prefix(&cache_uri).await {
            Ok(removed) => {
                tracing::debug!(removed, cache_uri = %cache_uri, "Deleted cache directory");
                Ok(StepOutput::ok_empty())
            }
            // Already gone.
            Err(ProviderError::NotFound(_)) => Ok(StepOutput::ok_empty()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::core::{Icav2WesStateChange, Payload, WorkflowRun};
    use crate::registry::StageId;
    use crate::testing::{InMemoryStorage, ScriptedTaskRunner};
    use pretty_assertions::assert_eq;
    use serde_json::{Map, Value};

    fn run() -> WorkflowRun {
        WorkflowRun::new(
            "20250620abcd6789",
            "dragen-tso500-ctdna",
            "2.6.0",
            Payload::with_data(
                "2025.07.29",
                json!({
                    "inputs": {"fastqListRows": [{"rgsm": "L2401531"}]},
                    "engineParameters": {
                        "outputUri": "s3://out/20250620abcd6789/",
                        "cacheUri": "s3://cache/20250620abcd6789/"
                    },
                    "outputs": {"sampleResultsDirRelPath": "Results/L2401531/"}
                }),
            ),
        )
    }

    fn analysis(status: &str) -> Icav2WesStateChange {
        serde_json::from_value(json!({
            "id": "iwa.01J",
            "name": "umccr--automated--dragen-tso500-ctdna--2-6-0--20250620abcd6789",
            "status": status
        }))
        .unwrap()
    }

    fn ctx<'a>(
        run: &'a WorkflowRun,
        analysis: &'a Icav2WesStateChange,
        scratch: &'a Map<String, Value>,
        config: &'a OrchestratorConfig,
    ) -> StepContext<'a> {
        StepContext {
            stage: StageId::HandleIcav2AnalysisStateChangeEvent,
            run,
            incoming: None,
            analysis: Some(analysis),
            scratch,
            config,
        }
    }

    #[test]
    fn test_map_engine_status() {
        assert_eq!(map_engine_status("PENDING"), Some(WorkflowRunStatus::Submitted));
        assert_eq!(map_engine_status("running"), Some(WorkflowRunStatus::Running));
        assert_eq!(map_engine_status("ABORTED"), Some(WorkflowRunStatus::Failed));
        assert_eq!(map_engine_status("PAUSED"), None);
    }

    #[test]
    fn test_failed_steps() {
        assert_eq!(failed_steps("SAMPLE\tL2401531\nFAILED_STEPS\tNA\n"), None);
        assert_eq!(
            failed_steps("FAILED_STEPS\tSmallVariantCaller\n").as_deref(),
            Some("SmallVariantCaller")
        );
        assert_eq!(failed_steps("nothing here"), None);
    }

    #[test]
    fn test_uncompressed_vcfs() {
        let objects = vec![
            "s3://o/a.vcf".to_string(),
            "s3://o/a.vcf.gz".to_string(),
            "s3://o/b.gvcf".to_string(),
            "s3://o/c.bam".to_string(),
        ];
        assert_eq!(uncompressed_vcfs(&objects), vec!["s3://o/b.gvcf".to_string()]);
    }

    #[tokio::test]
    async fn test_convert_success_adds_outputs() {
        let config = OrchestratorConfig::default();
        let run = run();
        let event = analysis("SUCCEEDED");
        let scratch = Map::new();

        let output = ConvertIcav2WesToWrscEvent
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap();
        assert_eq!(output.status, Some(WorkflowRunStatus::Succeeded));
        assert_eq!(
            output.fragment.unwrap()["outputs"]["sampleResultsDirRelPath"],
            "Results/L2401531/"
        );
    }

    #[tokio::test]
    async fn test_convert_running_has_no_outputs() {
        let config = OrchestratorConfig::default();
        let run = run();
        let event = analysis("RUNNING");
        let scratch = Map::new();

        let context = ctx(&run, &event, &scratch, &config);
        let output = ConvertIcav2WesToWrscEvent.execute(&context).await.unwrap();
        assert_eq!(output.status, Some(WorkflowRunStatus::Running));
        assert!(output.fragment.is_none());
        assert!(CheckSampleHasSucceeded::new(Arc::new(InMemoryStorage::new()))
            .skip_reason(&context)
            .is_some());
    }

    #[tokio::test]
    async fn test_check_sample_failure() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert(
            "s3://out/20250620abcd6789/Results/MetricsOutput.tsv",
            "FAILED_STEPS\tTMB\n",
        );
        let config = OrchestratorConfig::default();
        let run = run();
        let event = analysis("SUCCEEDED");
        let scratch = Map::new();

        let err = CheckSampleHasSucceeded::new(storage)
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal { ref reason_code, .. } if reason_code == reasons::ANALYSIS_FAILED));
    }

    #[tokio::test]
    async fn test_compress_retries_launch_failures() {
        let tasks = Arc::new(ScriptedTaskRunner::new().fail_launches(2));
        let config = OrchestratorConfig::default().with_container_task(
            crate::config::ContainerTaskConfig::default()
                .with_launch_retry(crate::pipeline::RetryConfig::immediate(3)),
        );
        let run = run();
        let event = analysis("SUCCEEDED");
        let mut scratch = Map::new();
        scratch.insert("vcfFiles".into(), json!(["s3://out/a.vcf"]));

        let output = CompressVcfFiles::new(tasks.clone())
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap();
        assert_eq!(
            output.fragment.unwrap()["outputs"]["compressedVcfUris"],
            json!(["s3://out/a.vcf.gz"])
        );
        assert_eq!(tasks.launch_attempts(), 3);
    }

    #[tokio::test]
    async fn test_compress_launch_exhaustion() {
        let tasks = Arc::new(ScriptedTaskRunner::new().fail_launches(5));
        let config = OrchestratorConfig::default().with_container_task(
            crate::config::ContainerTaskConfig::default()
                .with_launch_retry(crate::pipeline::RetryConfig::immediate(2)),
        );
        let run = run();
        let event = analysis("SUCCEEDED");
        let mut scratch = Map::new();
        scratch.insert("vcfFiles".into(), json!(["s3://out/a.vcf"]));

        let err = CompressVcfFiles::new(tasks)
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal { ref reason_code, .. } if reason_code == reasons::TASK_LAUNCH_FAILED));
    }

    #[tokio::test]
    async fn test_compress_task_failure_not_retried() {
        let tasks = Arc::new(ScriptedTaskRunner::new().fail_runs(1));
        let config = OrchestratorConfig::default();
        let run = run();
        let event = analysis("SUCCEEDED");
        let mut scratch = Map::new();
        scratch.insert("vcfFiles".into(), json!(["s3://out/a.vcf"]));

        let err = CompressVcfFiles::new(tasks.clone())
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal { ref reason_code, .. } if reason_code == reasons::TASK_FAILED));
        assert_eq!(tasks.launch_attempts(), 1);
    }

    #[tokio::test]
    async fn test_delete_cache_tolerates_missing() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = OrchestratorConfig::default();
        let run = run();
        let event = analysis("SUCCEEDED");
        let scratch = Map::new();

        DeleteCacheUri::new(storage)
            .execute(&ctx(&run, &event, &scratch, &config))
            .await
            .unwrap();
    }
}
