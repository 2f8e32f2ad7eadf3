//! Core domain model.
//!
//! - Workflow run status and router phase
//! - The workflow run record and payload helpers
//! - Bus envelopes and the two lifecycle detail formats

mod detail;
mod envelope;
mod run;
mod status;

pub use detail::{
    canonical_detail, DetailFormat, Icav2WesStateChange, InboundEvent,
    LegacyWorkflowRunStateChange, LifecycleDetail, RunStateChange, WorkflowRef,
    WorkflowRunStateChange,
};
pub use envelope::{detail_types, EventEnvelope};
pub use run::{
    diff_paths, lookup_path, merge_missing, LinkedLibrary, Payload, RunAnnotation, WorkflowRun,
};
pub use status::{RunPhase, WorkflowRunStatus};
