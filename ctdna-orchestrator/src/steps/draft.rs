//! Steps of the draft stages: enrichment and validation.

use super::providers::{MetadataService, ParameterStore, SchemaRegistry};
use super::{Step, StepContext, StepOutput};
use crate::config::ParameterPaths;
use crate::core::{diff_paths, LinkedLibrary, Payload};
use crate::errors::{reasons, ProviderError, StepError};
use crate::registry::StepId;
use crate::utils::ensure_trailing_slash;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

macro_rules! metadata_step {
    ($name:ident) => {
        #[derive(Clone)]
        pub struct $name {
            metadata: Arc<dyn MetadataService>,
        }

        impl $name {
            pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
                Self { metadata }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

pub(crate) use metadata_step;

metadata_step!(GetLibraries);
metadata_step!(GetMetadataTags);
metadata_step!(GetFastqListRgidsFromLibrary);
metadata_step!(GetFastqIdListFromFastqRgidList);
metadata_step!(GetFastqListRowsFromFastqIdList);
metadata_step!(GetQcSummaryStatsFromRgidList);

#[async_trait]
impl Step for GetLibraries {
    fn id(&self) -> StepId {
        StepId::GetLibraries
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let mut libraries = Vec::with_capacity(ctx.run.linked_libraries.len());
        for linked in &ctx.run.linked_libraries {
            let lookup_id = if linked.orcabus_id.is_empty() {
                &linked.library_id
            } else {
                &linked.orcabus_id
            };
            let record = self.metadata.get_library(lookup_id).await?;
            libraries.push(LinkedLibrary {
                library_id: record.library_id,
                orcabus_id: record.orcabus_id,
                readsets: linked.readsets.clone(),
            });
        }
        Ok(StepOutput::ok_empty().with_libraries(libraries))
    }
}

#[async_trait]
impl Step for GetMetadataTags {
    fn id(&self) -> StepId {
        StepId::GetMetadataTags
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let library = ctx
            .run
            .linked_libraries
            .first()
            .ok_or_else(|| StepError::missing_input("linkedLibraries"))?;
        let record = self.metadata.get_library(&library.orcabus_id).await?;
        Ok(StepOutput::fragment(json!({
            "tags": {
                "libraryId": record.library_id,
                "subjectId": record.subject_id,
                "individualId": record.individual_id,
            }
        })))
    }
}

#[async_trait]
impl Step for GetFastqListRgidsFromLibrary {
    fn id(&self) -> StepId {
        StepId::GetFastqListRgidsFromLibrary
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let library_id = ctx.require_str("tags.libraryId")?;
        let rgids = self.metadata.get_fastq_rgids(&library_id).await?;
        if rgids.is_empty() {
            return Err(StepError::fatal(
                reasons::BAD_INPUT,
                format!("library '{library_id}' has no fastq read groups"),
            ));
        }
        Ok(StepOutput::fragment(json!({"tags": {"fastqRgidList": rgids}})))
    }
}

#[async_trait]
impl Step for GetFastqIdListFromFastqRgidList {
    fn id(&self) -> StepId {
        StepId::GetFastqIdListFromFastqRgidList
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let rgids = ctx.require_strings("tags.fastqRgidList")?;
        let fastq_ids = self.metadata.get_fastq_ids(&rgids).await?;
        Ok(StepOutput::ok_empty().with_scratch("fastqIdList", json!(fastq_ids)))
    }
}

#[async_trait]
impl Step for GetFastqListRowsFromFastqIdList {
    fn id(&self) -> StepId {
        StepId::GetFastqListRowsFromFastqIdList
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let fastq_ids = ctx.require_strings("scratch.fastqIdList")?;
        let rows = self.metadata.get_fastq_list_rows(&fastq_ids).await?;
        let rows = serde_json::to_value(rows)
            .map_err(|e| StepError::fatal(reasons::BAD_INPUT, e.to_string()))?;
        Ok(StepOutput::fragment(json!({"inputs": {"fastqListRows": rows}})))
    }
}

#[async_trait]
impl Step for GetQcSummaryStatsFromRgidList {
    fn id(&self) -> StepId {
        StepId::GetQcSummaryStatsFromRgidList
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let rgids = ctx.require_strings("tags.fastqRgidList")?;
        let qc = self.metadata.get_qc_summary(&rgids).await?;
        Ok(StepOutput::fragment(json!({
            "tags": {
                "preLaunchCoverageEst": qc.coverage_estimate,
                "preLaunchDupFracEst": qc.duplication_fraction_estimate,
                "preLaunchInsertSizeEst": qc.insert_size_estimate,
            }
        })))
    }
}

/// Resolves engine parameters from the parameter store.
pub struct ResolveEngineParameters {
    parameters: Arc<dyn ParameterStore>,
    paths: ParameterPaths,
}

impl ResolveEngineParameters {
    pub fn new(parameters: Arc<dyn ParameterStore>, paths: ParameterPaths) -> Self {
        Self { parameters, paths }
    }

    async fn pipeline_id(&self, ctx: &StepContext<'_>, version: &str) -> Result<String, StepError> {
        match self.parameters.get_parameter(&self.paths.pipeline_id(version)).await {
            Ok(id) => Ok(id),
            Err(ProviderError::NotFound(_)) => ctx
                .config
                .pipeline_ids_by_version
                .get(version)
                .cloned()
                .ok_or_else(|| {
                    StepError::fatal(
                        reasons::NOT_FOUND,
                        format!("no pipeline id for workflow version '{version}'"),
                    )
                }),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ResolveEngineParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveEngineParameters")
            .field("prefix", &self.paths.prefix)
            .finish()
    }
}

#[async_trait]
impl Step for ResolveEngineParameters {
    fn id(&self) -> StepId {
        StepId::ResolveEngineParameters
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let portal_run_id = ctx.require_str("portalRunId")?;
        let version = ctx.require_str("workflowVersion")?;

        let pipeline_id = self.pipeline_id(ctx, &version).await?;
        let project_id = self.parameters.get_parameter(&self.paths.project_id()).await?;
        let run_uri = |prefix: String| format!("{}{portal_run_id}/", ensure_trailing_slash(&prefix));
        let output_uri = run_uri(self.parameters.get_parameter(&self.paths.output_prefix()).await?);
        let logs_uri = run_uri(self.parameters.get_parameter(&self.paths.logs_prefix()).await?);
        let cache_uri = run_uri(self.parameters.get_parameter(&self.paths.cache_prefix()).await?);

        Ok(StepOutput::fragment(json!({
            "engineParameters": {
                "pipelineId": pipeline_id,
                "projectId": project_id,
                "outputUri": output_uri,
                "logsUri": logs_uri,
                "cacheUri": cache_uri,
            }
        })))
    }
}

/// Lists the payload fields enrichment changed relative to the incoming draft.
#[derive(Debug, Clone, Copy)]
pub struct ComparePayload;

#[async_trait]
impl Step for ComparePayload {
    fn id(&self) -> StepId {
        StepId::ComparePayload
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let empty = Value::Object(Map::new());
        let before = ctx.incoming.map_or(&empty, |p| &p.data);
        let changed = diff_paths(before, &ctx.run.payload.data);
        tracing::debug!(changed = changed.len(), "Compared payloads");
        Ok(StepOutput::ok_empty().with_scratch("changedFields", json!(changed)))
    }
}

/// Finalizes the merged payload for re-emission.
#[derive(Debug, Clone, Copy)]
pub struct GenerateWruEventObjectWithMergedData;

#[async_trait]
impl Step for GenerateWruEventObjectWithMergedData {
    fn id(&self) -> StepId {
        StepId::GenerateWruEventObjectWithMergedData
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let mut payload = Payload::with_data(
            ctx.config.default_payload_version.clone(),
            ctx.run.payload.data.clone(),
        );
        payload.drop_null_sections();
        Ok(StepOutput::ok_empty().with_payload(payload))
    }
}

/// Validates the draft payload against the configured schema.
pub struct ValidateDraftPayload {
    schemas: Arc<dyn SchemaRegistry>,
}

impl ValidateDraftPayload {
    pub fn new(schemas: Arc<dyn SchemaRegistry>) -> Self {
        Self { schemas }
    }
}

impl std::fmt::Debug for ValidateDraftPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValidateDraftPayload")
    }
}

#[async_trait]
impl Step for ValidateDraftPayload {
    fn id(&self) -> StepId {
        StepId::ValidateDraftPayload
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let payload = &ctx.run.payload;
        let violations = self
            .schemas
            .validate(&ctx.config.draft_schema_name, &payload.version, &payload.data)
            .await?;
        if violations.is_empty() {
            Ok(StepOutput::ok_empty())
        } else {
            Err(StepError::Validation { violations })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::core::WorkflowRun;
    use crate::registry::StageId;
    use crate::steps::MockParameterStore;
    use crate::testing::{InMemoryMetadata, InMemorySchemaRegistry};
    use pretty_assertions::assert_eq;

    fn run_with(data: Value) -> WorkflowRun {
        WorkflowRun::new(
            "20250620abcd6789",
            "dragen-tso500-ctdna",
            "2.6.0",
            Payload::with_data("2025.07.29", data),
        )
        .with_libraries(vec![LinkedLibrary::new("L2401531", "lib.01J5M2JFE1JPYV62RYQEG99CP5")])
    }

    fn ctx<'a>(run: &'a WorkflowRun, scratch: &'a Map<String, Value>, config: &'a OrchestratorConfig) -> StepContext<'a> {
        StepContext {
            stage: StageId::PopulateDraftData,
            run,
            incoming: None,
            analysis: None,
            scratch,
            config,
        }
    }

    #[tokio::test]
    async fn test_get_metadata_tags() {
        let metadata = Arc::new(InMemoryMetadata::standard());
        let config = OrchestratorConfig::default();
        let run = run_with(json!({}));
        let scratch = Map::new();

        let output = GetMetadataTags::new(metadata)
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap();
        assert_eq!(
            output.fragment.unwrap()["tags"]["libraryId"],
            json!("L2401531")
        );
    }

    #[tokio::test]
    async fn test_rgids_empty_is_bad_input() {
        let metadata = Arc::new(InMemoryMetadata::new());
        let config = OrchestratorConfig::default();
        let run = run_with(json!({"tags": {"libraryId": "L0000000"}}));
        let scratch = Map::new();

        let err = GetFastqListRgidsFromLibrary::new(metadata)
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal { ref reason_code, .. } if reason_code == reasons::BAD_INPUT));
    }

    #[tokio::test]
    async fn test_resolve_engine_parameters() {
        let mut store = MockParameterStore::new();
        store.expect_get_parameter().returning(|path| {
            if path.contains("pipeline-ids-by-workflow-version") {
                Err(ProviderError::NotFound(path.to_string()))
            } else if path.ends_with("icav2-project-id") {
                Ok("project-123".to_string())
            } else if path.ends_with("output-prefix") {
                Ok("s3://bucket/analysis/dragen-tso500-ctdna".to_string())
            } else if path.ends_with("logs-prefix") {
                Ok("s3://bucket/logs/dragen-tso500-ctdna/".to_string())
            } else {
                Ok("s3://bucket/cache/dragen-tso500-ctdna/".to_string())
            }
        });
        let config = OrchestratorConfig::default();
        let run = run_with(json!({}));
        let scratch = Map::new();

        let output = ResolveEngineParameters::new(Arc::new(store), config.parameters())
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap();
        let params = &output.fragment.unwrap()["engineParameters"];
        assert_eq!(params["pipelineId"], "63dc920c-adde-4891-8aae-84a6b9569f37");
        assert_eq!(params["projectId"], "project-123");
        assert_eq!(
            params["outputUri"],
            "s3://bucket/analysis/dragen-tso500-ctdna/20250620abcd6789/"
        );
        assert_eq!(
            params["cacheUri"],
            "s3://bucket/cache/dragen-tso500-ctdna/20250620abcd6789/"
        );
    }

    #[tokio::test]
    async fn test_resolve_engine_parameters_propagates_transient() {
        let mut store = MockParameterStore::new();
        store
            .expect_get_parameter()
            .returning(|_| Err(ProviderError::Transient("throttled".into())));
        let config = OrchestratorConfig::default();
        let run = run_with(json!({}));
        let scratch = Map::new();

        let err = ResolveEngineParameters::new(Arc::new(store), config.parameters())
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_compare_payload_reports_new_fields() {
        let config = OrchestratorConfig::default();
        let incoming = Payload::with_data("2025.07.29", json!({"tags": {"libraryId": "L2401531"}}));
        let run = run_with(json!({"tags": {"libraryId": "L2401531", "subjectId": "SBJ1"}}));
        let scratch = Map::new();
        let mut context = ctx(&run, &scratch, &config);
        context.incoming = Some(&incoming);

        let output = ComparePayload.execute(&context).await.unwrap();
        assert_eq!(output.scratch["changedFields"], json!(["tags.subjectId"]));
    }

    #[tokio::test]
    async fn test_generate_drops_null_sections() {
        let config = OrchestratorConfig::default();
        let mut run = run_with(json!({"tags": {"libraryId": "L1"}, "outputs": null}));
        run.payload.version = "old".into();
        let scratch = Map::new();

        let output = GenerateWruEventObjectWithMergedData
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap();
        let payload = output.payload.unwrap();
        assert_eq!(payload.version, "2025.07.29");
        assert_eq!(payload.data, json!({"tags": {"libraryId": "L1"}}));
    }

    #[tokio::test]
    async fn test_validate_reports_violations() {
        let config = OrchestratorConfig::default();
        let run = run_with(json!({"tags": {"libraryId": "L1"}}));
        let scratch = Map::new();

        let err = ValidateDraftPayload::new(Arc::new(InMemorySchemaRegistry::standard()))
            .execute(&ctx(&run, &scratch, &config))
            .await
            .unwrap_err();
        match err {
            StepError::Validation { violations } => {
                assert!(violations.contains(&"inputs.fastqListRows".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
