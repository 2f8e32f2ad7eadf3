//! Stage and step identifiers and static stage definitions.

use super::capability::{Capability, CapabilitySet};
use crate::errors::ConfigurationError;
use crate::routing::EventPattern;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// The lifecycle stages of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageId {
    /// Enrich a DRAFT from the workflow manager.
    #[serde(rename = "populateDraftData")]
    PopulateDraftData,
    /// Validate an enriched DRAFT and emit READY.
    #[serde(rename = "validateDraftDataAndPutReadyEvent")]
    ValidateDraftDataAndPutReadyEvent,
    /// Turn READY into an engine submission.
    #[serde(rename = "readyEventToIcav2WesRequestEvent")]
    ReadyEventToIcav2WesRequestEvent,
    /// React to engine state changes.
    #[serde(rename = "handleIcav2AnalysisStateChangeEvent")]
    HandleIcav2AnalysisStateChangeEvent,
}

impl StageId {
    /// Every stage, in pipeline order.
    pub const ALL: [Self; 4] = [
        Self::PopulateDraftData,
        Self::ValidateDraftDataAndPutReadyEvent,
        Self::ReadyEventToIcav2WesRequestEvent,
        Self::HandleIcav2AnalysisStateChangeEvent,
    ];

    /// Canonical stage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PopulateDraftData => "populateDraftData",
            Self::ValidateDraftDataAndPutReadyEvent => "validateDraftDataAndPutReadyEvent",
            Self::ReadyEventToIcav2WesRequestEvent => "readyEventToIcav2WesRequestEvent",
            Self::HandleIcav2AnalysisStateChangeEvent => "handleIcav2AnalysisStateChangeEvent",
        }
    }

    /// Resolves a canonical stage name.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-005-UNKNOWN_STAGE` for unknown names.
    pub fn from_name(name: &str) -> Result<Self, ConfigurationError> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == name)
            .ok_or_else(|| ConfigurationError::unknown_stage(name))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract family a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Idempotent read against an external service; retried on transient failure.
    Lookup,
    /// Pure, deterministic computation over the payload.
    Transform,
    /// Schema check; failure annotates rather than fails the run.
    Validation,
    /// Hands work to the external engine and returns a tracking handle.
    ExternalSubmission,
    /// Bounded container task with a hard timeout.
    ContainerTask,
    /// Idempotent write to storage.
    Effect,
}

/// Every step the stages use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum StepId {
    GetLibraries,
    GetMetadataTags,
    GetFastqListRgidsFromLibrary,
    GetFastqIdListFromFastqRgidList,
    GetFastqListRowsFromFastqIdList,
    GetQcSummaryStatsFromRgidList,
    ResolveEngineParameters,
    ComparePayload,
    GenerateWruEventObjectWithMergedData,
    ValidateDraftPayload,
    DetermineCompressionType,
    GetInstrumentRunIdFromFastqId,
    GenerateMinimalSamplesheetFromFastqListRows,
    UploadSamplesheetToCacheDirectory,
    SubmitIcav2WesRequest,
    ConvertIcav2WesToWrscEvent,
    CheckSampleHasSucceeded,
    FindVcfFiles,
    CompressVcfFiles,
    DeleteCacheUri,
}

impl StepId {
    /// Every step.
    pub const ALL: [Self; 20] = [
        Self::GetLibraries,
        Self::GetMetadataTags,
        Self::GetFastqListRgidsFromLibrary,
        Self::GetFastqIdListFromFastqRgidList,
        Self::GetFastqListRowsFromFastqIdList,
        Self::GetQcSummaryStatsFromRgidList,
        Self::ResolveEngineParameters,
        Self::ComparePayload,
        Self::GenerateWruEventObjectWithMergedData,
        Self::ValidateDraftPayload,
        Self::DetermineCompressionType,
        Self::GetInstrumentRunIdFromFastqId,
        Self::GenerateMinimalSamplesheetFromFastqListRows,
        Self::UploadSamplesheetToCacheDirectory,
        Self::SubmitIcav2WesRequest,
        Self::ConvertIcav2WesToWrscEvent,
        Self::CheckSampleHasSucceeded,
        Self::FindVcfFiles,
        Self::CompressVcfFiles,
        Self::DeleteCacheUri,
    ];

    /// Canonical step name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GetLibraries => "getLibraries",
            Self::GetMetadataTags => "getMetadataTags",
            Self::GetFastqListRgidsFromLibrary => "getFastqListRgidsFromLibrary",
            Self::GetFastqIdListFromFastqRgidList => "getFastqIdListFromFastqRgidList",
            Self::GetFastqListRowsFromFastqIdList => "getFastqListRowsFromFastqIdList",
            Self::GetQcSummaryStatsFromRgidList => "getQcSummaryStatsFromRgidList",
            Self::ResolveEngineParameters => "resolveEngineParameters",
            Self::ComparePayload => "comparePayload",
            Self::GenerateWruEventObjectWithMergedData => "generateWruEventObjectWithMergedData",
            Self::ValidateDraftPayload => "validateDraftPayload",
            Self::DetermineCompressionType => "determineCompressionType",
            Self::GetInstrumentRunIdFromFastqId => "getInstrumentRunIdFromFastqId",
            Self::GenerateMinimalSamplesheetFromFastqListRows => {
                "generateMinimalSamplesheetFromFastqListRows"
            }
            Self::UploadSamplesheetToCacheDirectory => "uploadSamplesheetToCacheDirectory",
            Self::SubmitIcav2WesRequest => "submitIcav2WesRequest",
            Self::ConvertIcav2WesToWrscEvent => "convertIcav2WesToWrscEvent",
            Self::CheckSampleHasSucceeded => "checkSampleHasSucceeded",
            Self::FindVcfFiles => "findVcfFiles",
            Self::CompressVcfFiles => "compressVcfFiles",
            Self::DeleteCacheUri => "deleteCacheUri",
        }
    }

    /// The contract family.
    #[must_use]
    pub const fn kind(&self) -> StepKind {
        match self {
            Self::GetLibraries
            | Self::GetMetadataTags
            | Self::GetFastqListRgidsFromLibrary
            | Self::GetFastqIdListFromFastqRgidList
            | Self::GetFastqListRowsFromFastqIdList
            | Self::GetQcSummaryStatsFromRgidList
            | Self::ResolveEngineParameters
            | Self::GetInstrumentRunIdFromFastqId
            | Self::CheckSampleHasSucceeded
            | Self::FindVcfFiles => StepKind::Lookup,
            Self::ComparePayload
            | Self::GenerateWruEventObjectWithMergedData
            | Self::DetermineCompressionType
            | Self::GenerateMinimalSamplesheetFromFastqListRows
            | Self::ConvertIcav2WesToWrscEvent => StepKind::Transform,
            Self::ValidateDraftPayload => StepKind::Validation,
            Self::SubmitIcav2WesRequest => StepKind::ExternalSubmission,
            Self::CompressVcfFiles => StepKind::ContainerTask,
            Self::UploadSamplesheetToCacheDirectory | Self::DeleteCacheUri => StepKind::Effect,
        }
    }

    /// Capabilities the step needs.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        let caps: &[Capability] = match self {
            Self::GetLibraries
            | Self::GetMetadataTags
            | Self::GetFastqListRgidsFromLibrary
            | Self::GetFastqIdListFromFastqRgidList
            | Self::GetFastqListRowsFromFastqIdList
            | Self::GetQcSummaryStatsFromRgidList
            | Self::GetInstrumentRunIdFromFastqId => &[Capability::MetadataRead],
            Self::ResolveEngineParameters => &[Capability::ParameterRead],
            Self::ComparePayload
            | Self::GenerateWruEventObjectWithMergedData
            | Self::DetermineCompressionType
            | Self::GenerateMinimalSamplesheetFromFastqListRows
            | Self::ConvertIcav2WesToWrscEvent => &[],
            Self::ValidateDraftPayload => &[Capability::SchemaRead],
            Self::UploadSamplesheetToCacheDirectory | Self::DeleteCacheUri => {
                &[Capability::StorageWrite]
            }
            Self::SubmitIcav2WesRequest => &[Capability::EventPut],
            Self::CheckSampleHasSucceeded | Self::FindVcfFiles => &[Capability::StorageRead],
            Self::CompressVcfFiles => &[Capability::TaskRun],
        };
        caps.iter().copied().collect()
    }

    /// Fields the step expects to be resolvable before it runs.
    ///
    /// Paths are resolved by the step context: `scratch.*` from earlier
    /// steps, `analysis.*` from the engine event, `portalRunId`,
    /// `workflowVersion` and `linkedLibraries` from the run, anything else
    /// from the payload data.
    #[must_use]
    pub const fn input_contract(&self) -> &'static [&'static str] {
        match self {
            Self::GetLibraries | Self::GetMetadataTags => &["linkedLibraries"],
            Self::GetFastqListRgidsFromLibrary => &["tags.libraryId"],
            Self::GetFastqIdListFromFastqRgidList | Self::GetQcSummaryStatsFromRgidList => {
                &["tags.fastqRgidList"]
            }
            Self::GetFastqListRowsFromFastqIdList | Self::GetInstrumentRunIdFromFastqId => {
                &["scratch.fastqIdList"]
            }
            Self::ResolveEngineParameters => &["portalRunId", "workflowVersion"],
            Self::ComparePayload
            | Self::GenerateWruEventObjectWithMergedData
            | Self::ValidateDraftPayload => &[],
            Self::DetermineCompressionType => &["inputs.fastqListRows"],
            Self::GenerateMinimalSamplesheetFromFastqListRows => {
                &["inputs.fastqListRows", "scratch.instrumentRunId"]
            }
            Self::UploadSamplesheetToCacheDirectory => {
                &["engineParameters.cacheUri", "scratch.samplesheet"]
            }
            Self::SubmitIcav2WesRequest => &[
                "engineParameters.pipelineId",
                "engineParameters.projectId",
                "engineParameters.outputUri",
            ],
            Self::ConvertIcav2WesToWrscEvent => &["analysis.status"],
            Self::CheckSampleHasSucceeded => &["engineParameters.outputUri"],
            Self::FindVcfFiles => &["engineParameters.outputUri", "outputs.sampleResultsDirRelPath"],
            Self::CompressVcfFiles => &["scratch.vcfFiles"],
            Self::DeleteCacheUri => &["engineParameters.cacheUri"],
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a step within a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    /// Step identifier.
    pub id: StepId,
    /// Contract family.
    pub kind: StepKind,
    /// Fields expected before the step runs.
    pub input_contract: &'static [&'static str],
    /// Capabilities needed.
    pub capabilities: CapabilitySet,
}

impl StepRef {
    /// Step name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.id.as_str()
    }
}

impl From<StepId> for StepRef {
    fn from(id: StepId) -> Self {
        Self {
            id,
            kind: id.kind(),
            input_contract: id.input_contract(),
            capabilities: id.capabilities(),
        }
    }
}

/// Static description of one lifecycle stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    /// Stage identifier.
    pub id: StageId,
    /// Unique registry key.
    pub name: String,
    /// Trigger pattern.
    pub trigger: EventPattern,
    /// Ordered steps.
    pub steps: Vec<StepRef>,
    /// Union of the step capabilities plus `EventPut`.
    pub required_capabilities: CapabilitySet,
}

impl StageDefinition {
    /// Creates a stage named after its id.
    #[must_use]
    pub fn new(id: StageId, trigger: EventPattern, steps: impl IntoIterator<Item = StepId>) -> Self {
        let steps: Vec<StepRef> = steps.into_iter().map(StepRef::from).collect();
        let mut required_capabilities: CapabilitySet =
            steps.iter().flat_map(|s| s.capabilities.iter().copied()).collect();
        required_capabilities.insert(Capability::EventPut);
        Self {
            id,
            name: id.as_str().to_string(),
            trigger,
            steps,
            required_capabilities,
        }
    }

    /// Overrides the registry key.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Step ids in order.
    #[must_use]
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id).collect()
    }

    /// Describes the stage as JSON.
    #[must_use]
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "trigger": self.trigger.to_rule(),
            "steps": self.steps.iter().map(|s| json!({
                "name": s.name(),
                "kind": s.kind,
                "inputContract": s.input_contract,
                "capabilities": s.capabilities,
            })).collect::<Vec<_>>(),
            "requiredCapabilities": self.required_capabilities,
        })
    }
}
