//! Event bus trait and implementations.

use crate::core::EventEnvelope;
use crate::errors::PublishError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, Level};

/// A bus envelopes are published to.
///
/// Publishing is at-least-once: consumers deduplicate re-deliveries.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an envelope.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

/// A bus that discards every envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventBus;

#[async_trait]
impl EventBus for NoOpEventBus {
    async fn publish(&self, _envelope: &EventEnvelope) -> Result<(), PublishError> {
        Ok(())
    }
}

/// A bus that logs envelopes using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventBus {
    bus_name: String,
    level: Level,
}

impl Default for LoggingEventBus {
    fn default() -> Self {
        Self::new("OrcaBusMain", Level::INFO)
    }
}

impl LoggingEventBus {
    /// Creates a logging bus with the specified name and level.
    #[must_use]
    pub fn new(bus_name: impl Into<String>, level: Level) -> Self {
        Self {
            bus_name: bus_name.into(),
            level,
        }
    }

    /// Creates a debug-level logging bus.
    #[must_use]
    pub fn debug(bus_name: impl Into<String>) -> Self {
        Self::new(bus_name, Level::DEBUG)
    }

    fn log_envelope(&self, envelope: &EventEnvelope) {
        if self.level == Level::DEBUG {
            debug!(
                bus = %self.bus_name,
                source = %envelope.source,
                detail_type = %envelope.detail_type,
                detail = %envelope.detail,
                "Published {}", envelope.detail_type
            );
        } else {
            info!(
                bus = %self.bus_name,
                source = %envelope.source,
                detail_type = %envelope.detail_type,
                detail = %envelope.detail,
                "Published {}", envelope.detail_type
            );
        }
    }
}

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.log_envelope(envelope);
        Ok(())
    }
}

/// A bus that records envelopes, for tests and dry runs.
#[derive(Debug, Default)]
pub struct CollectingEventBus {
    envelopes: RwLock<Vec<EventEnvelope>>,
    failures_remaining: AtomicUsize,
}

impl CollectingEventBus {
    /// Creates an empty collecting bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns every published envelope.
    #[must_use]
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.envelopes.read().clone()
    }

    /// Returns envelopes with the given detail type.
    #[must_use]
    pub fn of_detail_type(&self, detail_type: &str) -> Vec<EventEnvelope> {
        self.envelopes
            .read()
            .iter()
            .filter(|e| e.detail_type == detail_type)
            .cloned()
            .collect()
    }

    /// Removes and returns every published envelope.
    pub fn drain(&self) -> Vec<EventEnvelope> {
        std::mem::take(&mut *self.envelopes.write())
    }

    /// Returns the number of published envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.read().len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.read().is_empty()
    }

    /// Clears all recorded envelopes.
    pub fn clear(&self) {
        self.envelopes.write().clear();
    }
}

#[async_trait]
impl EventBus for CollectingEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError {
                bus: "collecting".into(),
                detail_type: envelope.detail_type.clone(),
                reason: "injected failure".into(),
            });
        }
        self.envelopes.write().push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(detail_type: &str) -> EventEnvelope {
        EventEnvelope::new("orcabus.dragentso500ctdna", detail_type, json!({"status": "DRAFT"}))
    }

    #[tokio::test]
    async fn test_noop_and_logging_buses() {
        NoOpEventBus.publish(&envelope("WorkflowRunStateChange")).await.unwrap();
        LoggingEventBus::default()
            .publish(&envelope("WorkflowRunStateChange"))
            .await
            .unwrap();
        LoggingEventBus::debug("OrcaBusMain")
            .publish(&envelope("WorkflowRunUpdate"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collecting_bus() {
        let bus = CollectingEventBus::new();
        assert!(bus.is_empty());

        bus.publish(&envelope("WorkflowRunStateChange")).await.unwrap();
        bus.publish(&envelope("Icav2WesRequest")).await.unwrap();

        assert_eq!(bus.len(), 2);
        assert_eq!(bus.of_detail_type("Icav2WesRequest").len(), 1);
        assert_eq!(bus.drain().len(), 2);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = CollectingEventBus::new();
        bus.fail_next(1);

        let err = bus.publish(&envelope("WorkflowRunStateChange")).await.unwrap_err();
        assert_eq!(err.detail_type, "WorkflowRunStateChange");
        bus.publish(&envelope("WorkflowRunStateChange")).await.unwrap();
        assert_eq!(bus.len(), 1);
    }
}
