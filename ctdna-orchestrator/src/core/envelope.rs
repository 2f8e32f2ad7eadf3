//! Bus envelope and the fixed detail-type vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Detail types exchanged on the bus.
pub mod detail_types {
    /// Lifecycle status change of a workflow run.
    pub const WORKFLOW_RUN_STATE_CHANGE: &str = "WorkflowRunStateChange";
    /// Payload update of a workflow run without a status change.
    pub const WORKFLOW_RUN_UPDATE: &str = "WorkflowRunUpdate";
    /// Submission request to the external execution engine.
    pub const ICAV2_WES_REQUEST: &str = "Icav2WesRequest";
    /// State change reported by the external execution engine.
    pub const ICAV2_WES_ANALYSIS_STATE_CHANGE: &str = "Icav2WesAnalysisStateChange";

    /// Returns true for detail types carrying a lifecycle detail.
    #[must_use]
    pub fn is_lifecycle(detail_type: &str) -> bool {
        detail_type == WORKFLOW_RUN_STATE_CHANGE || detail_type == WORKFLOW_RUN_UPDATE
    }
}

/// Wire representation of a bus message. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique message id.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Emitting domain (e.g. `orcabus.workflowmanager`).
    pub source: String,
    /// Detail type.
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    /// Publication time.
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    /// Event body.
    pub detail: Value,
}

impl EventEnvelope {
    /// Creates a new envelope stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            detail_type: detail_type.into(),
            time: Utc::now(),
            detail,
        }
    }

    /// Returns true if this is a lifecycle envelope.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        detail_types::is_lifecycle(&self.detail_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_names() {
        let envelope = EventEnvelope::new(
            "orcabus.workflowmanager",
            detail_types::WORKFLOW_RUN_STATE_CHANGE,
            json!({"status": "DRAFT"}),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["detail-type"], "WorkflowRunStateChange");
        assert!(envelope.is_lifecycle());
    }

    #[test]
    fn test_envelope_defaults_on_decode() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "source": "orcabus.icav2wesmanager",
            "detail-type": "Icav2WesAnalysisStateChange",
            "detail": {}
        }))
        .unwrap();
        assert!(!envelope.is_lifecycle());
        assert!(!envelope.id.is_nil());
    }
}
