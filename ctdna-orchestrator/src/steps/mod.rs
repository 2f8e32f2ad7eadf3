//! Step contract and the step catalogue.
//!
//! A step receives a read-only [`StepContext`] (the run as merged so far,
//! scratch values from earlier steps of the same stage and the triggering
//! event) and returns a [`StepOutput`] describing what to merge. Steps never
//! mutate the run directly; the stage executor applies outputs in order.

mod analysis;
mod draft;
mod providers;
mod submission;

pub use providers::{
    CommentService, ContainerTaskRequest, ContainerTaskRunner, FastqListRow, LibraryRecord,
    MetadataService, ParameterStore, Providers, QcSummary, SchemaRegistry, StorageService,
    TaskError,
};

#[cfg(test)]
pub use providers::MockParameterStore;

use crate::config::OrchestratorConfig;
use crate::core::{lookup_path, Icav2WesStateChange, LinkedLibrary, Payload, WorkflowRun, WorkflowRunStatus};
use crate::errors::StepError;
use crate::registry::{StageId, StepId};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Read-only view a step executes against.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Stage being executed.
    pub stage: StageId,
    /// Run as merged so far.
    pub run: &'a WorkflowRun,
    /// Payload carried by the triggering event, if any.
    pub incoming: Option<&'a Payload>,
    /// Engine event, for the analysis stage.
    pub analysis: Option<&'a Icav2WesStateChange>,
    /// Values produced by earlier steps of this stage.
    pub scratch: &'a Map<String, Value>,
    /// Orchestrator configuration.
    pub config: &'a OrchestratorConfig,
}

impl StepContext<'_> {
    /// Resolves a contract path.
    ///
    /// Null values, empty strings and empty linked-library lists count as
    /// absent.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let value = match path {
            "portalRunId" => Some(Value::String(self.run.portal_run_id().to_string())),
            "workflowVersion" => Some(Value::String(self.run.workflow_version.clone())),
            "linkedLibraries" if self.run.linked_libraries.is_empty() => None,
            "linkedLibraries" => serde_json::to_value(&self.run.linked_libraries).ok(),
            _ => {
                if let Some(key) = path.strip_prefix("scratch.") {
                    lookup_path(&Value::Object(self.scratch.clone()), key).cloned()
                } else if let Some(key) = path.strip_prefix("analysis.") {
                    self.analysis
                        .and_then(|a| serde_json::to_value(a).ok())
                        .and_then(|v| lookup_path(&v, key).cloned())
                } else {
                    self.run.payload.get(path).cloned()
                }
            }
        };
        value.filter(|v| !v.is_null() && v.as_str() != Some(""))
    }

    /// Resolves a required value.
    ///
    /// # Errors
    ///
    /// Returns a `MISSING_INPUT` failure if the path is absent.
    pub fn require(&self, path: &str) -> Result<Value, StepError> {
        self.resolve(path).ok_or_else(|| StepError::missing_input(path))
    }

    /// Resolves a required string.
    ///
    /// # Errors
    ///
    /// Returns a `MISSING_INPUT` failure if the path is absent or not a string.
    pub fn require_str(&self, path: &str) -> Result<String, StepError> {
        self.require(path)?
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| StepError::missing_input(path))
    }

    /// Resolves a required list of strings.
    ///
    /// # Errors
    ///
    /// Returns a `MISSING_INPUT` failure if the path is absent or not a list
    /// of strings.
    pub fn require_strings(&self, path: &str) -> Result<Vec<String>, StepError> {
        let value = self.require(path)?;
        let items = value.as_array().ok_or_else(|| StepError::missing_input(path))?;
        items
            .iter()
            .map(|v| v.as_str().map(ToString::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StepError::missing_input(path))
    }

    /// Returns the first contract path that cannot be resolved.
    #[must_use]
    pub fn first_missing(&self, contract: &[&str]) -> Option<String> {
        contract
            .iter()
            .find(|path| self.resolve(path).is_none())
            .map(|path| (*path).to_string())
    }

    /// Returns true if the engine event reports success.
    #[must_use]
    pub fn analysis_succeeded(&self) -> bool {
        self.analysis
            .is_some_and(|a| analysis::map_engine_status(&a.status) == Some(WorkflowRunStatus::Succeeded))
    }
}

/// What a step asks the executor to apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Fields to fill into the payload (existing values win).
    pub fragment: Option<Value>,
    /// Replacement payload.
    pub payload: Option<Payload>,
    /// Values for later steps of this stage.
    pub scratch: HashMap<String, Value>,
    /// Replacement linked libraries.
    pub libraries: Option<Vec<LinkedLibrary>>,
    /// Lifecycle status the stage should emit.
    pub status: Option<WorkflowRunStatus>,
    /// External tracking handle.
    pub tracking_handle: Option<String>,
    /// Set when the step did not apply.
    pub skip_reason: Option<String>,
}

impl StepOutput {
    /// An output that changes nothing.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::default()
    }

    /// An output carrying a payload fragment.
    #[must_use]
    pub fn fragment(fragment: Value) -> Self {
        Self {
            fragment: Some(fragment),
            ..Self::default()
        }
    }

    /// A skipped step.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Adds a scratch value.
    #[must_use]
    pub fn with_scratch(mut self, key: impl Into<String>, value: Value) -> Self {
        self.scratch.insert(key.into(), value);
        self
    }

    /// Replaces the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Replaces the linked libraries.
    #[must_use]
    pub fn with_libraries(mut self, libraries: Vec<LinkedLibrary>) -> Self {
        self.libraries = Some(libraries);
        self
    }

    /// Sets the status to emit.
    #[must_use]
    pub const fn with_status(mut self, status: WorkflowRunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the tracking handle.
    #[must_use]
    pub fn with_tracking_handle(mut self, handle: impl Into<String>) -> Self {
        self.tracking_handle = Some(handle.into());
        self
    }

    /// Returns true if the step was skipped.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

/// An executable step.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// The step this implements.
    fn id(&self) -> StepId;

    /// Returns a reason to skip the step for this context, if any.
    fn skip_reason(&self, _ctx: &StepContext<'_>) -> Option<String> {
        None
    }

    /// Executes the step.
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError>;
}

/// Maps every step id to its implementation.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    steps: HashMap<StepId, Arc<dyn Step>>,
}

impl StepCatalog {
    /// Wires every step against the given providers.
    #[must_use]
    pub fn new(providers: &Providers, config: &OrchestratorConfig) -> Self {
        let steps = StepId::ALL
            .into_iter()
            .map(|id| (id, build_step(id, providers, config)))
            .collect();
        Self { steps }
    }

    /// Replaces one implementation.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.id(), step);
        self
    }

    /// Returns the implementation of a step.
    #[must_use]
    pub fn get(&self, id: StepId) -> Option<Arc<dyn Step>> {
        self.steps.get(&id).cloned()
    }
}

fn build_step(id: StepId, p: &Providers, config: &OrchestratorConfig) -> Arc<dyn Step> {
    match id {
        StepId::GetLibraries => Arc::new(draft::GetLibraries::new(p.metadata.clone())),
        StepId::GetMetadataTags => Arc::new(draft::GetMetadataTags::new(p.metadata.clone())),
        StepId::GetFastqListRgidsFromLibrary => {
            Arc::new(draft::GetFastqListRgidsFromLibrary::new(p.metadata.clone()))
        }
        StepId::GetFastqIdListFromFastqRgidList => {
            Arc::new(draft::GetFastqIdListFromFastqRgidList::new(p.metadata.clone()))
        }
        StepId::GetFastqListRowsFromFastqIdList => {
            Arc::new(draft::GetFastqListRowsFromFastqIdList::new(p.metadata.clone()))
        }
        StepId::GetQcSummaryStatsFromRgidList => {
            Arc::new(draft::GetQcSummaryStatsFromRgidList::new(p.metadata.clone()))
        }
        StepId::ResolveEngineParameters => {
            Arc::new(draft::ResolveEngineParameters::new(p.parameters.clone(), config.parameters()))
        }
        StepId::ComparePayload => Arc::new(draft::ComparePayload),
        StepId::GenerateWruEventObjectWithMergedData => {
            Arc::new(draft::GenerateWruEventObjectWithMergedData)
        }
        StepId::ValidateDraftPayload => Arc::new(draft::ValidateDraftPayload::new(p.schemas.clone())),
        StepId::DetermineCompressionType => Arc::new(submission::DetermineCompressionType),
        StepId::GetInstrumentRunIdFromFastqId => {
            Arc::new(submission::GetInstrumentRunIdFromFastqId::new(p.metadata.clone()))
        }
        StepId::GenerateMinimalSamplesheetFromFastqListRows => {
            Arc::new(submission::GenerateMinimalSamplesheetFromFastqListRows)
        }
        StepId::UploadSamplesheetToCacheDirectory => {
            Arc::new(submission::UploadSamplesheetToCacheDirectory::new(p.storage.clone()))
        }
        StepId::SubmitIcav2WesRequest => Arc::new(submission::SubmitIcav2WesRequest::new(p.bus.clone())),
        StepId::ConvertIcav2WesToWrscEvent => Arc::new(analysis::ConvertIcav2WesToWrscEvent),
        StepId::CheckSampleHasSucceeded => {
            Arc::new(analysis::CheckSampleHasSucceeded::new(p.storage.clone()))
        }
        StepId::FindVcfFiles => Arc::new(analysis::FindVcfFiles::new(p.storage.clone())),
        StepId::CompressVcfFiles => Arc::new(analysis::CompressVcfFiles::new(p.tasks.clone())),
        StepId::DeleteCacheUri => Arc::new(analysis::DeleteCacheUri::new(p.storage.clone())),
    }
}

/// First sample id of the run: `rgsm` of the first fastq list row, else
/// the library id tag.
pub(crate) fn first_sample_id(ctx: &StepContext<'_>) -> Option<String> {
    ctx.run
        .payload
        .get("inputs.fastqListRows")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("rgsm"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .or_else(|| ctx.run.payload.get_str("tags.libraryId").map(ToString::to_string))
}
