//! # ctdna-orchestrator
//!
//! Event-driven orchestration of DRAGEN TSO500 ctDNA workflow runs.
//!
//! The orchestrator listens on the event bus for workflow run state changes
//! and analysis engine updates, and drives each run through four stages:
//!
//! - **populateDraftData**: complete a DRAFT payload from metadata services
//! - **validateDraftDataAndPutReadyEvent**: check the draft and promote it to READY
//! - **readyEventToIcav2WesRequestEvent**: submit the analysis request
//! - **handleIcav2AnalysisStateChangeEvent**: track the engine and post-process results
//!
//! Stages are declared in a [`registry::StageRegistry`] and matched against
//! inbound envelopes by [`routing::match_event`]. The [`router::WorkflowRouter`]
//! serialises work per run, executes the selected stage and publishes the
//! resulting lifecycle event.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ctdna_orchestrator::prelude::*;
//!
//! let router = WorkflowRouter::new(
//!     OrchestratorConfig::default().apply_env_overrides()?,
//!     &providers,
//!     Arc::new(InMemoryRunStore::new()),
//!     Arc::new(InMemoryDeliveryLedger::new()),
//! )?;
//!
//! match router.route(&envelope).await? {
//!     RouteOutcome::Advanced { emitted, .. } => { /* ... */ }
//!     other => tracing::info!(?other, "Event not advanced"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod routing;
pub mod steps;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{OrchestratorConfig, ParameterPaths};
    pub use crate::core::{
        EventEnvelope, InboundEvent, Payload, RunPhase, WorkflowRun, WorkflowRunStatus,
    };
    pub use crate::errors::{ConfigurationError, RouterError, StepError};
    pub use crate::events::{EventBus, LifecycleEmitter, PublishFormat};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{DeliveryLedger, InMemoryDeliveryLedger, RetryConfig};
    pub use crate::registry::{Capability, GrantedCapabilities, StageDefinition, StageId, StageRegistry, StepId};
    pub use crate::router::{InMemoryRunStore, RouteOutcome, RunStore, WorkflowRouter};
    pub use crate::routing::match_event;
    pub use crate::steps::{Providers, Step, StepCatalog};
    pub use crate::utils::{utc_timestamp, Timestamp};
}
