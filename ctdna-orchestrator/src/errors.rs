//! Error types for the orchestration router.
//!
//! The taxonomy separates boot-time configuration faults (fatal), provider
//! and step failures (retried or stage-fatal) and router-level failures
//! raised while normalizing or persisting a routed event.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Metadata describing a configuration fault for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-002-OVERLAPPING_TRIGGER").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Configuration error codes.
pub mod codes {
    /// Two stages share a name.
    pub const DUPLICATE_STAGE: &str = "CONFIG-001-DUPLICATE_STAGE";
    /// Two stage trigger patterns can match the same event.
    pub const OVERLAPPING_TRIGGER: &str = "CONFIG-002-OVERLAPPING_TRIGGER";
    /// A stage declares no steps.
    pub const EMPTY_STEPS: &str = "CONFIG-003-EMPTY_STEPS";
    /// A stage needs a capability the environment does not grant.
    pub const CAPABILITY_NOT_GRANTED: &str = "CONFIG-004-CAPABILITY_NOT_GRANTED";
    /// A stage name does not resolve to a known stage.
    pub const UNKNOWN_STAGE: &str = "CONFIG-005-UNKNOWN_STAGE";
    /// A trigger pattern could not be compiled.
    pub const INVALID_PATTERN: &str = "CONFIG-006-INVALID_PATTERN";
    /// The orchestrator configuration is unusable.
    pub const INVALID_CONFIG: &str = "CONFIG-007-INVALID_CONFIG";
}

/// Fatal error raised while wiring the router at process start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Structured diagnostic info.
    pub info: ErrorInfo,
}

impl ConfigurationError {
    /// Creates a configuration error with the given code.
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            info: ErrorInfo::new(code, message.clone()),
            message,
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.info = self.info.with_fix_hint(hint);
        self
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.info.code
    }

    /// Duplicate stage name.
    #[must_use]
    pub fn duplicate_stage(name: &str) -> Self {
        Self::new(
            codes::DUPLICATE_STAGE,
            format!("Stage '{name}' is already registered"),
        )
        .with_stages([name])
        .with_fix_hint("Each stage must be registered exactly once.")
    }

    /// Two trigger patterns overlap.
    #[must_use]
    pub fn overlapping_trigger(existing: &str, candidate: &str) -> Self {
        Self::new(
            codes::OVERLAPPING_TRIGGER,
            format!("Trigger of stage '{candidate}' overlaps trigger of stage '{existing}'"),
        )
        .with_stages([existing, candidate])
        .with_fix_hint("Constrain source, detail-type or a shared detail field so at most one stage matches any event.")
    }

    /// Stage with no steps.
    #[must_use]
    pub fn empty_steps(name: &str) -> Self {
        Self::new(codes::EMPTY_STEPS, format!("Stage '{name}' declares no steps"))
            .with_stages([name])
    }

    /// Capability not granted.
    #[must_use]
    pub fn capability_not_granted(stage: &str, capability: &str) -> Self {
        let mut err = Self::new(
            codes::CAPABILITY_NOT_GRANTED,
            format!("Stage '{stage}' requires capability '{capability}' which is not granted"),
        )
        .with_stages([stage]);
        err.info = err.info.with_context_entry("capability", capability);
        err
    }

    /// Unknown stage name.
    #[must_use]
    pub fn unknown_stage(name: &str) -> Self {
        Self::new(codes::UNKNOWN_STAGE, format!("Unknown stage '{name}'"))
            .with_stages([name])
            .with_fix_hint("Check the stage name for typos; stage names are case sensitive.")
    }

    /// Pattern compile failure.
    #[must_use]
    pub fn invalid_pattern(pattern: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            codes::INVALID_PATTERN,
            format!("Invalid trigger pattern '{pattern}': {reason}"),
        )
    }

    /// Invalid configuration value.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::new(codes::INVALID_CONFIG, reason)
    }
}

/// Error returned by an external capability provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The service is temporarily unavailable; the call may be retried.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request cannot succeed; retrying will not help.
    #[error("provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Returns true if the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Reason codes carried by stage-fatal step failures.
pub mod reasons {
    /// Transient failures persisted past the retry budget.
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
    /// The step exceeded its invocation timeout.
    pub const STEP_TIMEOUT: &str = "STEP_TIMEOUT";
    /// A required input field was missing.
    pub const MISSING_INPUT: &str = "MISSING_INPUT";
    /// A provider rejected the request.
    pub const PROVIDER_REJECTED: &str = "PROVIDER_REJECTED";
    /// A looked-up record does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The input was structurally valid but logically unusable.
    pub const BAD_INPUT: &str = "BAD_INPUT";
    /// The container task could not be launched.
    pub const TASK_LAUNCH_FAILED: &str = "TASK_LAUNCH_FAILED";
    /// The container task ran and failed.
    pub const TASK_FAILED: &str = "TASK_FAILED";
    /// The external analysis reported failure.
    pub const ANALYSIS_FAILED: &str = "ANALYSIS_FAILED";
}

/// Error returned by a step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Retryable failure (service unavailable, container launch failure).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The payload failed a schema check.
    #[error("validation failed: {}", violations.join(", "))]
    Validation {
        /// Violated field paths with messages.
        violations: Vec<String>,
    },

    /// Non-retryable failure.
    #[error("{reason_code}: {message}")]
    Fatal {
        /// Machine readable reason code.
        reason_code: String,
        /// Human readable message.
        message: String,
    },
}

impl StepError {
    /// Creates a fatal step error.
    #[must_use]
    pub fn fatal(reason_code: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            reason_code: reason_code.to_string(),
            message: message.into(),
        }
    }

    /// Creates a missing-input error for the named field.
    #[must_use]
    pub fn missing_input(field: &str) -> Self {
        Self::fatal(reasons::MISSING_INPUT, format!("required input '{field}' is missing"))
    }

    /// Returns true if the failure should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ProviderError> for StepError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => Self::Transient(msg),
            ProviderError::NotFound(msg) => Self::fatal(reasons::NOT_FOUND, msg),
            ProviderError::Permanent(msg) => Self::fatal(reasons::PROVIDER_REJECTED, msg),
        }
    }
}

/// Failure of the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer persisted a newer revision first.
    #[error("revision conflict for run '{portal_run_id}': expected {expected:?}, found {found:?}")]
    Conflict {
        /// The run.
        portal_run_id: String,
        /// Revision the writer started from.
        expected: Option<u64>,
        /// Revision currently stored.
        found: Option<u64>,
    },

    /// The run id cannot name a document.
    #[error("run id '{portal_run_id}' is not a valid document name")]
    InvalidRunId {
        /// The rejected id.
        portal_run_id: String,
    },

    /// A document holds a different run than its name says.
    #[error("document for run '{requested}' holds run '{found}'")]
    Mismatch {
        /// The run asked for.
        requested: String,
        /// The run found in the document.
        found: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure publishing to the event bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to publish '{detail_type}' to bus '{bus}': {reason}")]
pub struct PublishError {
    /// Bus name.
    pub bus: String,
    /// Detail type of the rejected envelope.
    pub detail_type: String,
    /// Reason for the failure.
    pub reason: String,
}

/// Top-level error for routing an event.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Boot-time wiring fault.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The event could not be decoded into a known detail format.
    #[error("malformed '{detail_type}' event: {reason}")]
    MalformedEvent {
        /// Detail type of the envelope.
        detail_type: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The payload carries a version this router does not understand.
    #[error("unsupported payload version '{version}' for run '{portal_run_id}'")]
    UnsupportedPayloadVersion {
        /// The run.
        portal_run_id: String,
        /// The rejected version.
        version: String,
    },

    /// Run persistence failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Publishing failed.
    #[error("{0}")]
    Publish(#[from] PublishError),

    /// A provider call outside a step failed (e.g. posting a comment).
    #[error("{0}")]
    Provider(#[from] ProviderError),
}

impl RouterError {
    /// Creates a malformed event error.
    #[must_use]
    pub fn malformed(detail_type: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::MalformedEvent {
            detail_type: detail_type.into(),
            reason: reason.to_string(),
        }
    }
}
