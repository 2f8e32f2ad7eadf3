//! Span attributes and timing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Attributes of a routed event or step, flattened for export.
///
/// The keys mirror the fields the router and executor put on their spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Portal run id.
    pub portal_run_id: Option<String>,
    /// Stage name.
    pub stage: Option<String>,
    /// Step id.
    pub step: Option<String>,
    /// Outcome or lifecycle status.
    pub status: Option<String>,
    /// Attempt number, 1-based.
    pub attempt: Option<u32>,
    /// Reason code of a failure.
    pub reason_code: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
}

impl RunSpanAttributes {
    /// Creates empty attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run.
    #[must_use]
    pub fn with_portal_run_id(mut self, id: impl Into<String>) -> Self {
        self.portal_run_id = Some(id.into());
        self
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the step.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the attempt.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Sets the reason code.
    #[must_use]
    pub fn with_reason_code(mut self, code: impl Into<String>) -> Self {
        self.reason_code = Some(code.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Flattens into dotted keys; unset attributes are left out.
    #[must_use]
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        if let Some(ref v) = self.portal_run_id {
            attrs.insert("run.portal_run_id".to_string(), v.clone());
        }
        if let Some(ref v) = self.stage {
            attrs.insert("run.stage".to_string(), v.clone());
        }
        if let Some(ref v) = self.step {
            attrs.insert("run.step".to_string(), v.clone());
        }
        if let Some(ref v) = self.status {
            attrs.insert("run.status".to_string(), v.clone());
        }
        if let Some(v) = self.attempt {
            attrs.insert("run.attempt".to_string(), v.to_string());
        }
        if let Some(ref v) = self.reason_code {
            attrs.insert("run.reason_code".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("run.duration_ms".to_string(), format!("{v:.3}"));
        }

        attrs
    }
}

/// Wall-clock timer for a span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Milliseconds since start.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
