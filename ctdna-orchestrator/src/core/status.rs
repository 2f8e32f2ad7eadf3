//! Workflow run status and router phase enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    /// Run has been drafted and may still be incomplete.
    Draft,
    /// Draft is complete and validated.
    Ready,
    /// Work has been handed to the external execution engine.
    Submitted,
    /// The external engine reports the analysis as running.
    Running,
    /// Analysis finished successfully.
    Succeeded,
    /// Analysis or orchestration failed.
    Failed,
}

impl WorkflowRunStatus {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Ready => "READY",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(Self::Draft),
            "READY" => Some(Self::Ready),
            "SUBMITTED" => Some(Self::Submitted),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router-side position of a run in the stage graph.
///
/// Phases only move forward; the one exception is that a draft may be
/// re-populated and re-validated while it sits in `DraftComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Draft received, enrichment in progress.
    DraftPending,
    /// Draft enriched, awaiting validation.
    DraftComplete,
    /// Draft validated and READY emitted.
    ReadyPending,
    /// Submission sent to the external engine.
    Submitted,
    /// External engine reports progress.
    AnalysisRunning,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

impl RunPhase {
    /// Returns true for terminal phases.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Maps a lifecycle status to the phase reached after emitting it.
    #[must_use]
    pub const fn after_emitting(status: WorkflowRunStatus) -> Self {
        match status {
            WorkflowRunStatus::Draft => Self::DraftComplete,
            WorkflowRunStatus::Ready => Self::ReadyPending,
            WorkflowRunStatus::Submitted => Self::Submitted,
            WorkflowRunStatus::Running => Self::AnalysisRunning,
            WorkflowRunStatus::Succeeded => Self::Succeeded,
            WorkflowRunStatus::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DraftPending => "draft_pending",
            Self::DraftComplete => "draft_complete",
            Self::ReadyPending => "ready_pending",
            Self::Submitted => "submitted",
            Self::AnalysisRunning => "analysis_running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(WorkflowRunStatus::Draft.to_string(), "DRAFT");
        let json = serde_json::to_string(&WorkflowRunStatus::Succeeded).unwrap();
        assert_eq!(json, r#""SUCCEEDED""#);
        assert_eq!(WorkflowRunStatus::parse("READY"), Some(WorkflowRunStatus::Ready));
        assert_eq!(WorkflowRunStatus::parse("ready"), None);
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(WorkflowRunStatus::Succeeded.is_terminal());
        assert!(WorkflowRunStatus::Failed.is_terminal());
        assert!(!WorkflowRunStatus::Running.is_terminal());
    }

    #[test]
    fn test_phase_order_is_monotonic() {
        assert!(RunPhase::DraftPending < RunPhase::DraftComplete);
        assert!(RunPhase::ReadyPending < RunPhase::Submitted);
        assert!(RunPhase::Submitted < RunPhase::AnalysisRunning);
        assert_eq!(
            RunPhase::after_emitting(WorkflowRunStatus::Ready),
            RunPhase::ReadyPending
        );
    }
}
