//! Builds and publishes lifecycle events.

use super::EventBus;
use crate::config::OrchestratorConfig;
use crate::core::{detail_types, EventEnvelope, RunStateChange, WorkflowRun, WorkflowRunStatus};
use crate::errors::PublishError;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Which lifecycle detail format(s) to publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFormat {
    /// Nested format only.
    #[default]
    Current,
    /// Flattened format only.
    Legacy,
    /// Both formats, current first.
    Dual,
}

impl PublishFormat {
    /// Parses `current`, `legacy` or `dual` (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "current" => Some(Self::Current),
            "legacy" => Some(Self::Legacy),
            "dual" => Some(Self::Dual),
            _ => None,
        }
    }
}

/// Publishes the lifecycle event that follows a completed stage.
#[derive(Clone)]
pub struct LifecycleEmitter {
    bus: Arc<dyn EventBus>,
    source: String,
    format: PublishFormat,
}

impl std::fmt::Debug for LifecycleEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEmitter")
            .field("source", &self.source)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl LifecycleEmitter {
    /// Creates an emitter publishing as `config.event_source`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, config: &OrchestratorConfig) -> Self {
        Self {
            bus,
            source: config.event_source.clone(),
            format: config.publish_format,
        }
    }

    /// Overrides the publish format.
    #[must_use]
    pub const fn with_format(mut self, format: PublishFormat) -> Self {
        self.format = format;
        self
    }

    /// Builds the envelopes for `run` at `status`, primary first.
    #[must_use]
    pub fn envelopes(&self, run: &WorkflowRun, status: WorkflowRunStatus) -> Vec<EventEnvelope> {
        let change = RunStateChange::from_run(run, status);
        let current = || serde_json::to_value(change.to_current()).unwrap_or(Value::Null);
        let legacy = || serde_json::to_value(change.to_legacy()).unwrap_or(Value::Null);
        let details = match self.format {
            PublishFormat::Current => vec![current()],
            PublishFormat::Legacy => vec![legacy()],
            PublishFormat::Dual => vec![current(), legacy()],
        };
        details
            .into_iter()
            .map(|detail| {
                EventEnvelope::new(
                    self.source.clone(),
                    detail_types::WORKFLOW_RUN_STATE_CHANGE,
                    detail,
                )
            })
            .collect()
    }

    /// Publishes the lifecycle event and returns the primary envelope.
    ///
    /// # Errors
    ///
    /// Returns the first publish failure. In dual mode the other format may
    /// already have been published; consumers deduplicate.
    pub async fn emit(&self, run: &WorkflowRun, status: WorkflowRunStatus) -> Result<EventEnvelope, PublishError> {
        let envelopes = self.envelopes(run, status);
        try_join_all(envelopes.iter().map(|e| self.bus.publish(e))).await?;

        tracing::info!(
            portal_run_id = %run.portal_run_id(),
            status = %status,
            format = ?self.format,
            "Emitted lifecycle event"
        );

        envelopes.into_iter().next().ok_or_else(|| PublishError {
            bus: self.source.clone(),
            detail_type: detail_types::WORKFLOW_RUN_STATE_CHANGE.to_string(),
            reason: "no envelope built".to_string(),
        })
    }
}
