//! Testing utilities.
//!
//! This module provides:
//! - In-memory implementations of every provider
//! - Bus event builders and a wired router harness
//! - Assertions over route outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_advanced, assert_duplicate, assert_failed_with, emitted_statuses};
pub use fixtures::{
    analysis_state_change, draft_event, legacy_draft_event, ready_event, standard_cache_uri,
    standard_output_uri, TestHarness, PORTAL_RUN_ID,
};
pub use mocks::{
    InMemoryComments, InMemoryMetadata, InMemoryParameterStore, InMemorySchemaRegistry,
    InMemoryStorage, RecordedComment, ScriptedTaskRunner, STANDARD_BUCKET, STANDARD_FASTQ_ID,
    STANDARD_INSTRUMENT_RUN_ID, STANDARD_LIBRARY_ID, STANDARD_ORCABUS_ID, STANDARD_RGID,
    STANDARD_SUBJECT_ID,
};
