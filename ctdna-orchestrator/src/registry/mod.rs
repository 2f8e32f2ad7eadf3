//! Stage registry.
//!
//! The registry is built once at process start and is read-only afterwards.
//! Registration rejects empty stages, duplicate names, overlapping triggers
//! and stages needing capabilities the environment does not grant.

mod capability;
mod stage;

pub use capability::{Capability, CapabilityProvider, CapabilitySet, GrantedCapabilities};
pub use stage::{StageDefinition, StageId, StepId, StepKind, StepRef};

use crate::config::OrchestratorConfig;
use crate::core::detail_types;
use crate::errors::ConfigurationError;
use crate::routing::{EventPattern, FieldPredicate};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable table of stage definitions.
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
    by_name: HashMap<String, usize>,
    capabilities: Arc<dyn CapabilityProvider>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StageRegistry {
    /// Creates an empty registry checking grants against `capabilities`.
    #[must_use]
    pub fn new(capabilities: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            stages: Vec::new(),
            by_name: HashMap::new(),
            capabilities,
        }
    }

    /// Registers a stage.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` (`CONFIG-001` to `CONFIG-004`) if the
    /// stage is empty, duplicated, overlaps an existing trigger or needs an
    /// ungranted capability.
    pub fn register(&mut self, stage: StageDefinition) -> Result<(), ConfigurationError> {
        if stage.steps.is_empty() {
            return Err(ConfigurationError::empty_steps(&stage.name));
        }
        if self.by_name.contains_key(&stage.name) {
            return Err(ConfigurationError::duplicate_stage(&stage.name));
        }
        if let Some(existing) = self
            .stages
            .iter()
            .find(|existing| existing.trigger.overlaps(&stage.trigger))
        {
            return Err(ConfigurationError::overlapping_trigger(&existing.name, &stage.name));
        }
        if let Some(missing) = self.capabilities.first_missing(&stage.required_capabilities) {
            return Err(ConfigurationError::capability_not_granted(
                &stage.name,
                missing.as_str(),
            ));
        }

        tracing::debug!(
            stage = %stage.name,
            steps = stage.steps.len(),
            "Registered stage"
        );
        self.by_name.insert(stage.name.clone(), self.stages.len());
        self.stages.push(stage);
        Ok(())
    }

    /// Builds the standard ctDNA stage table.
    ///
    /// # Errors
    ///
    /// Fails fast with the first `ConfigurationError` encountered.
    pub fn standard(
        config: &OrchestratorConfig,
        capabilities: Arc<dyn CapabilityProvider>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let mut registry = Self::new(capabilities);
        for stage in standard_stages(config)? {
            registry.register(stage)?;
        }
        Ok(registry)
    }

    /// Looks up a stage by name.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-005-UNKNOWN_STAGE` if no stage has that name.
    pub fn lookup(&self, name: &str) -> Result<&StageDefinition, ConfigurationError> {
        self.by_name
            .get(name)
            .and_then(|idx| self.stages.get(*idx))
            .ok_or_else(|| ConfigurationError::unknown_stage(name))
    }

    /// Returns the stage with the given id, if registered.
    #[must_use]
    pub fn get(&self, id: StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// All stages in registration order.
    #[must_use]
    pub fn all(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn lifecycle_trigger(config: &OrchestratorConfig, status: &str) -> EventPattern {
    EventPattern::new()
        .with_detail_type(detail_types::WORKFLOW_RUN_STATE_CHANGE)
        .with_field("workflow.name", FieldPredicate::equals(&config.workflow_name))
        .with_field("status", FieldPredicate::equals(status))
}

/// The four stage definitions of the ctDNA workflow, in pipeline order.
///
/// # Errors
///
/// Returns `CONFIG-006-INVALID_PATTERN` if the workflow name yields an
/// invalid analysis-name wildcard.
pub fn standard_stages(config: &OrchestratorConfig) -> Result<Vec<StageDefinition>, ConfigurationError> {
    let analysis_name = FieldPredicate::wildcard(&format!("*--{}--*", config.workflow_name))?;

    Ok(vec![
        StageDefinition::new(
            StageId::PopulateDraftData,
            lifecycle_trigger(config, "DRAFT").with_source(&config.workflow_manager_source),
            [
                StepId::GetLibraries,
                StepId::GetMetadataTags,
                StepId::GetFastqListRgidsFromLibrary,
                StepId::GetFastqIdListFromFastqRgidList,
                StepId::GetFastqListRowsFromFastqIdList,
                StepId::GetQcSummaryStatsFromRgidList,
                StepId::ResolveEngineParameters,
                StepId::ComparePayload,
                StepId::GenerateWruEventObjectWithMergedData,
            ],
        ),
        StageDefinition::new(
            StageId::ValidateDraftDataAndPutReadyEvent,
            lifecycle_trigger(config, "DRAFT").with_source(&config.event_source),
            [StepId::ValidateDraftPayload],
        ),
        StageDefinition::new(
            StageId::ReadyEventToIcav2WesRequestEvent,
            lifecycle_trigger(config, "READY")
                .with_source(&config.workflow_manager_source)
                .with_source(&config.event_source),
            [
                StepId::GetFastqIdListFromFastqRgidList,
                StepId::DetermineCompressionType,
                StepId::GetInstrumentRunIdFromFastqId,
                StepId::GenerateMinimalSamplesheetFromFastqListRows,
                StepId::UploadSamplesheetToCacheDirectory,
                StepId::SubmitIcav2WesRequest,
            ],
        ),
        StageDefinition::new(
            StageId::HandleIcav2AnalysisStateChangeEvent,
            EventPattern::new()
                .with_source(&config.icav2_wes_source)
                .with_detail_type(detail_types::ICAV2_WES_ANALYSIS_STATE_CHANGE)
                .with_field("name", analysis_name),
            [
                StepId::ConvertIcav2WesToWrscEvent,
                StepId::CheckSampleHasSucceeded,
                StepId::FindVcfFiles,
                StepId::CompressVcfFiles,
                StepId::DeleteCacheUri,
            ],
        ),
    ])
}
