//! Detail formats carried by inbound and outbound envelopes.
//!
//! Lifecycle details exist in two shapes during the migration window: the
//! current nested format (`workflow.name`, `libraries`) and the legacy
//! flattened format (`workflowName`, `linkedLibraries`). Both are decoded
//! at the boundary into [`RunStateChange`]; nothing past this module looks
//! at field presence to tell them apart.

use super::envelope::{detail_types, EventEnvelope};
use super::{LinkedLibrary, Payload, WorkflowRun, WorkflowRunStatus};
use crate::errors::RouterError;
use crate::utils::format_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow reference in the current format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// Workflow name.
    pub name: String,
    /// Workflow version; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Current (nested) lifecycle detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStateChange {
    /// Run id; empty when the event names no run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub portal_run_id: String,
    /// Lifecycle status.
    pub status: WorkflowRunStatus,
    /// Event timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Workflow reference.
    pub workflow: WorkflowRef,
    /// Run name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_name: Option<String>,
    /// Linked libraries.
    #[serde(default)]
    pub libraries: Vec<LinkedLibrary>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

/// Legacy (flattened) lifecycle detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWorkflowRunStateChange {
    /// Run id; empty when the event names no run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub portal_run_id: String,
    /// Lifecycle status.
    pub status: WorkflowRunStatus,
    /// Event timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Workflow name.
    pub workflow_name: String,
    /// Workflow version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<String>,
    /// Run name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_name: Option<String>,
    /// Linked libraries.
    #[serde(default)]
    pub linked_libraries: Vec<LinkedLibrary>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

/// Wire format of a lifecycle detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailFormat {
    /// Nested format.
    Current,
    /// Flattened format.
    Legacy,
}

/// A lifecycle detail in either wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleDetail {
    /// Nested format.
    Current(WorkflowRunStateChange),
    /// Flattened format.
    Legacy(LegacyWorkflowRunStateChange),
}

impl LifecycleDetail {
    /// Decodes a detail value.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::MalformedEvent` if neither format fits.
    pub fn decode(detail_type: &str, detail: &Value) -> Result<Self, RouterError> {
        serde_json::from_value(detail.clone()).map_err(|e| RouterError::malformed(detail_type, e))
    }

    /// Returns the wire format.
    #[must_use]
    pub const fn format(&self) -> DetailFormat {
        match self {
            Self::Current(_) => DetailFormat::Current,
            Self::Legacy(_) => DetailFormat::Legacy,
        }
    }

    /// Normalizes into the internal representation.
    #[must_use]
    pub fn normalize(self) -> RunStateChange {
        match self {
            Self::Current(d) => RunStateChange {
                portal_run_id: d.portal_run_id,
                status: d.status,
                timestamp: d.timestamp,
                workflow_name: d.workflow.name,
                workflow_version: d.workflow.version,
                workflow_run_name: d.workflow_run_name,
                libraries: d.libraries,
                payload: d.payload,
            },
            Self::Legacy(d) => RunStateChange {
                portal_run_id: d.portal_run_id,
                status: d.status,
                timestamp: d.timestamp,
                workflow_name: d.workflow_name,
                workflow_version: d.workflow_version,
                workflow_run_name: d.workflow_run_name,
                libraries: d.linked_libraries,
                payload: d.payload,
            },
        }
    }
}

/// Format-independent lifecycle state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateChange {
    /// Run id.
    pub portal_run_id: String,
    /// Lifecycle status.
    pub status: WorkflowRunStatus,
    /// Event timestamp.
    pub timestamp: Option<String>,
    /// Workflow name.
    pub workflow_name: String,
    /// Workflow version, if the event carried one.
    pub workflow_version: Option<String>,
    /// Run name.
    pub workflow_run_name: Option<String>,
    /// Linked libraries.
    pub libraries: Vec<LinkedLibrary>,
    /// Payload.
    pub payload: Option<Payload>,
}

impl RunStateChange {
    /// Projects a workflow run at the given status.
    #[must_use]
    pub fn from_run(run: &WorkflowRun, status: WorkflowRunStatus) -> Self {
        Self {
            portal_run_id: run.portal_run_id().to_string(),
            status,
            timestamp: Some(format_timestamp(&run.timestamp)),
            workflow_name: run.workflow_name.clone(),
            workflow_version: Some(run.workflow_version.clone()),
            workflow_run_name: Some(run.workflow_run_name.clone()),
            libraries: run.linked_libraries.clone(),
            payload: Some(run.payload.clone()),
        }
    }

    /// Renders the current wire format.
    #[must_use]
    pub fn to_current(&self) -> WorkflowRunStateChange {
        WorkflowRunStateChange {
            portal_run_id: self.portal_run_id.clone(),
            status: self.status,
            timestamp: self.timestamp.clone(),
            workflow: WorkflowRef {
                name: self.workflow_name.clone(),
                version: self.workflow_version.clone(),
            },
            workflow_run_name: self.workflow_run_name.clone(),
            libraries: self.libraries.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Renders the legacy wire format.
    #[must_use]
    pub fn to_legacy(&self) -> LegacyWorkflowRunStateChange {
        LegacyWorkflowRunStateChange {
            portal_run_id: self.portal_run_id.clone(),
            status: self.status,
            timestamp: self.timestamp.clone(),
            workflow_name: self.workflow_name.clone(),
            workflow_version: self.workflow_version.clone(),
            workflow_run_name: self.workflow_run_name.clone(),
            linked_libraries: self.libraries.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Rejects payloads whose version is not in `supported`.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::UnsupportedPayloadVersion`.
    pub fn check_payload_version(&self, supported: &[String]) -> Result<(), RouterError> {
        match &self.payload {
            Some(payload) if !supported.iter().any(|v| v == &payload.version) => {
                Err(RouterError::UnsupportedPayloadVersion {
                    portal_run_id: self.portal_run_id.clone(),
                    version: payload.version.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// State change reported by the external execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icav2WesStateChange {
    /// Engine-side analysis id.
    #[serde(default)]
    pub id: String,
    /// Analysis name, `umccr--automated--<workflow>--<version>--<portalRunId>`.
    pub name: String,
    /// Engine status (`RUNNING`, `SUCCEEDED`, ...).
    pub status: String,
    /// Inputs echoed by the engine.
    #[serde(default)]
    pub inputs: Value,
    /// Engine parameters echoed by the engine.
    #[serde(default)]
    pub engine_parameters: Value,
    /// Tags, expected to carry `portalRunId`.
    #[serde(default)]
    pub tags: Value,
}

impl Icav2WesStateChange {
    /// Resolves the run id from tags, falling back to the name suffix.
    #[must_use]
    pub fn portal_run_id(&self) -> Option<&str> {
        self.tags
            .get("portalRunId")
            .and_then(Value::as_str)
            .or_else(|| self.name.rsplit("--").next())
            .filter(|id| !id.is_empty())
    }
}

/// Inbound event decoded at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Lifecycle state change in either wire format.
    Lifecycle {
        /// Wire format it arrived in.
        format: DetailFormat,
        /// Normalized state change.
        change: RunStateChange,
    },
    /// External engine state change.
    AnalysisStateChange(Icav2WesStateChange),
}

impl InboundEvent {
    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::MalformedEvent` for undecodable details or
    /// detail types this router does not consume.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self, RouterError> {
        if envelope.is_lifecycle() {
            let detail = LifecycleDetail::decode(&envelope.detail_type, &envelope.detail)?;
            return Ok(Self::Lifecycle {
                format: detail.format(),
                change: detail.normalize(),
            });
        }
        if envelope.detail_type == detail_types::ICAV2_WES_ANALYSIS_STATE_CHANGE {
            let change: Icav2WesStateChange = serde_json::from_value(envelope.detail.clone())
                .map_err(|e| RouterError::malformed(&envelope.detail_type, e))?;
            return Ok(Self::AnalysisStateChange(change));
        }
        Err(RouterError::malformed(
            &envelope.detail_type,
            "detail type is not consumed by this router",
        ))
    }

    /// Run the event refers to.
    #[must_use]
    pub fn portal_run_id(&self) -> Option<&str> {
        match self {
            Self::Lifecycle { change, .. } => Some(change.portal_run_id.as_str()).filter(|id| !id.is_empty()),
            Self::AnalysisStateChange(change) => change.portal_run_id(),
        }
    }
}

/// Returns the detail in current format for pattern matching.
///
/// Legacy lifecycle details are converted; anything else (including
/// undecodable lifecycle details) is returned unchanged.
#[must_use]
pub fn canonical_detail(envelope: &EventEnvelope) -> Value {
    if !envelope.is_lifecycle() {
        return envelope.detail.clone();
    }
    LifecycleDetail::decode(&envelope.detail_type, &envelope.detail)
        .ok()
        .and_then(|d| serde_json::to_value(d.normalize().to_current()).ok())
        .unwrap_or_else(|| envelope.detail.clone())
}
