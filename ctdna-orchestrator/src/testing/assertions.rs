//! Assertions over route outcomes and published events.

use crate::core::{detail_types, EventEnvelope, InboundEvent, WorkflowRunStatus};
use crate::registry::StageId;
use crate::router::RouteOutcome;

/// Asserts that the outcome advanced `stage` and returns the emitted event.
pub fn assert_advanced(outcome: &RouteOutcome, expected: StageId) -> Option<&EventEnvelope> {
    match outcome {
        RouteOutcome::Advanced { stage, emitted, .. } => {
            assert_eq!(*stage, expected, "Expected stage {expected}, got {stage}");
            emitted.as_ref()
        }
        other => panic!("Expected {expected} to advance, got {other:?}"),
    }
}

/// Asserts that the outcome is a dropped duplicate delivery.
pub fn assert_duplicate(outcome: &RouteOutcome) {
    assert!(
        matches!(outcome, RouteOutcome::Duplicate { .. }),
        "Expected duplicate, got {outcome:?}"
    );
}

/// Asserts that the outcome failed the run with `reason_code`.
pub fn assert_failed_with(outcome: &RouteOutcome, expected: &str) {
    match outcome {
        RouteOutcome::Failed { reason_code, .. } => assert_eq!(
            reason_code, expected,
            "Expected reason {expected}, got {reason_code}"
        ),
        other => panic!("Expected failure {expected}, got {other:?}"),
    }
}

/// Lifecycle statuses in the order they were published.
///
/// Envelopes that do not decode as lifecycle events are ignored.
#[must_use]
pub fn emitted_statuses(published: &[EventEnvelope]) -> Vec<WorkflowRunStatus> {
    published
        .iter()
        .filter(|e| e.detail_type == detail_types::WORKFLOW_RUN_STATE_CHANGE)
        .filter_map(|e| match InboundEvent::decode(e) {
            Ok(InboundEvent::Lifecycle { change, .. }) => Some(change.status),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn advanced() -> RouteOutcome {
        RouteOutcome::Advanced {
            stage: StageId::PopulateDraftData,
            portal_run_id: "r1".into(),
            emitted: None,
        }
    }

    #[test]
    fn test_assert_advanced() {
        assert!(assert_advanced(&advanced(), StageId::PopulateDraftData).is_none());
    }

    #[test]
    #[should_panic(expected = "Expected stage")]
    fn test_assert_advanced_wrong_stage() {
        assert_advanced(&advanced(), StageId::ValidateDraftDataAndPutReadyEvent);
    }

    #[test]
    #[should_panic(expected = "Expected duplicate")]
    fn test_assert_duplicate_fails() {
        assert_duplicate(&RouteOutcome::Unmatched);
    }

    #[test]
    fn test_emitted_statuses_skips_other_detail_types() {
        let published = vec![
            EventEnvelope::new(
                "orcabus.dragentso500ctdna",
                detail_types::WORKFLOW_RUN_STATE_CHANGE,
                json!({
                    "portalRunId": "r1",
                    "status": "READY",
                    "workflow": {"name": "dragen-tso500-ctdna", "version": "2.6.0"}
                }),
            ),
            EventEnvelope::new("orcabus.dragentso500ctdna", detail_types::ICAV2_WES_REQUEST, json!({})),
        ];
        assert_eq!(emitted_statuses(&published), vec![WorkflowRunStatus::Ready]);
    }
}
