//! Event builders and a wired test harness.

use std::sync::Arc;

use serde_json::{json, Value};

use super::mocks::{
    InMemoryComments, InMemoryMetadata, InMemoryParameterStore, InMemorySchemaRegistry,
    InMemoryStorage, ScriptedTaskRunner, STANDARD_BUCKET, STANDARD_LIBRARY_ID, STANDARD_ORCABUS_ID,
};
use crate::config::OrchestratorConfig;
use crate::core::{detail_types, EventEnvelope};
use crate::errors::{ConfigurationError, RouterError};
use crate::events::CollectingEventBus;
use crate::pipeline::InMemoryDeliveryLedger;
use crate::router::{InMemoryRunStore, RouteOutcome, WorkflowRouter};
use crate::steps::{Providers, StepCatalog};
use crate::utils::workflow_run_name;

/// Run id used by the fixtures.
pub const PORTAL_RUN_ID: &str = "20250620abcd6789";

const WORKFLOW_NAME: &str = "dragen-tso500-ctdna";
const WORKFLOW_VERSION: &str = "2.6.0";
const WORKFLOW_MANAGER_SOURCE: &str = "orcabus.workflowmanager";
const ICAV2_WES_SOURCE: &str = "orcabus.icav2wesmanager";

/// Follow-up rounds `drive` allows before giving up.
const MAX_DRIVE_ROUNDS: usize = 32;

fn linked_libraries() -> Value {
    json!([{"libraryId": STANDARD_LIBRARY_ID, "orcabusId": STANDARD_ORCABUS_ID}])
}

/// A DRAFT from the workflow manager, nested format, without payload.
#[must_use]
pub fn draft_event(portal_run_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        WORKFLOW_MANAGER_SOURCE,
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        json!({
            "portalRunId": portal_run_id,
            "status": "DRAFT",
            "timestamp": "2025-06-20T01:02:03Z",
            "workflow": {"name": WORKFLOW_NAME, "version": WORKFLOW_VERSION},
            "libraries": linked_libraries(),
        }),
    )
}

/// The same DRAFT in the flattened legacy format.
#[must_use]
pub fn legacy_draft_event(portal_run_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        WORKFLOW_MANAGER_SOURCE,
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        json!({
            "portalRunId": portal_run_id,
            "status": "DRAFT",
            "timestamp": "2025-06-20T01:02:03Z",
            "workflowName": WORKFLOW_NAME,
            "workflowVersion": WORKFLOW_VERSION,
            "linkedLibraries": linked_libraries(),
        }),
    )
}

/// A READY from the workflow manager carrying a complete payload.
#[must_use]
pub fn ready_event(portal_run_id: &str, payload_data: Value) -> EventEnvelope {
    EventEnvelope::new(
        WORKFLOW_MANAGER_SOURCE,
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        json!({
            "portalRunId": portal_run_id,
            "status": "READY",
            "timestamp": "2025-06-20T02:00:00Z",
            "workflow": {"name": WORKFLOW_NAME, "version": WORKFLOW_VERSION},
            "libraries": linked_libraries(),
            "payload": {"version": "2025.07.29", "data": payload_data},
        }),
    )
}

/// An engine state change for a run of the default workflow.
#[must_use]
pub fn analysis_state_change(portal_run_id: &str, status: &str) -> EventEnvelope {
    EventEnvelope::new(
        ICAV2_WES_SOURCE,
        detail_types::ICAV2_WES_ANALYSIS_STATE_CHANGE,
        json!({
            "id": "iwa.01JXYZANALYSIS0000000000",
            "name": workflow_run_name(WORKFLOW_NAME, WORKFLOW_VERSION, portal_run_id),
            "status": status,
            "tags": {"portalRunId": portal_run_id},
        }),
    )
}

/// Output directory the standard parameters give a run.
#[must_use]
pub fn standard_output_uri(portal_run_id: &str) -> String {
    format!("{STANDARD_BUCKET}/analysis/{WORKFLOW_NAME}/{portal_run_id}/")
}

/// Cache directory the standard parameters give a run.
#[must_use]
pub fn standard_cache_uri(portal_run_id: &str) -> String {
    format!("{STANDARD_BUCKET}/cache/{WORKFLOW_NAME}/{portal_run_id}/")
}

/// In-memory providers plus helpers to wire and drive a router.
#[derive(Debug, Clone)]
pub struct TestHarness {
    /// Metadata service.
    pub metadata: Arc<InMemoryMetadata>,
    /// Parameter store.
    pub parameters: Arc<InMemoryParameterStore>,
    /// Schema registry.
    pub schemas: Arc<InMemorySchemaRegistry>,
    /// Object storage.
    pub storage: Arc<InMemoryStorage>,
    /// Comment recorder.
    pub comments: Arc<InMemoryComments>,
    /// Container tasks.
    pub tasks: Arc<ScriptedTaskRunner>,
    /// Event bus.
    pub bus: Arc<CollectingEventBus>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Standard catalogue, parameters and schema; empty storage and bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metadata(InMemoryMetadata::standard())
    }

    /// Like `new` with a custom metadata catalogue.
    #[must_use]
    pub fn with_metadata(metadata: InMemoryMetadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            parameters: Arc::new(InMemoryParameterStore::standard(
                &OrchestratorConfig::default().parameters(),
            )),
            schemas: Arc::new(InMemorySchemaRegistry::standard()),
            storage: Arc::new(InMemoryStorage::new()),
            comments: Arc::new(InMemoryComments::new()),
            tasks: Arc::new(ScriptedTaskRunner::new()),
            bus: Arc::new(CollectingEventBus::new()),
        }
    }

    /// Replaces the schema registry.
    #[must_use]
    pub fn with_schemas(mut self, schemas: InMemorySchemaRegistry) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }

    /// Replaces the task runner.
    #[must_use]
    pub fn with_tasks(mut self, tasks: ScriptedTaskRunner) -> Self {
        self.tasks = Arc::new(tasks);
        self
    }

    /// The providers as trait objects.
    #[must_use]
    pub fn providers(&self) -> Providers {
        Providers {
            metadata: self.metadata.clone(),
            parameters: self.parameters.clone(),
            schemas: self.schemas.clone(),
            storage: self.storage.clone(),
            comments: self.comments.clone(),
            tasks: self.tasks.clone(),
            bus: self.bus.clone(),
        }
    }

    /// A step catalogue wired to the providers.
    #[must_use]
    pub fn catalog(&self, config: &OrchestratorConfig) -> StepCatalog {
        StepCatalog::new(&self.providers(), config)
    }

    /// A router over in-memory store and ledger.
    ///
    /// # Errors
    ///
    /// Returns the registry's `ConfigurationError`.
    pub fn router(&self, config: OrchestratorConfig) -> Result<WorkflowRouter, ConfigurationError> {
        WorkflowRouter::new(
            config,
            &self.providers(),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(InMemoryDeliveryLedger::new()),
        )
    }

    /// Writes the engine results a successful analysis leaves behind.
    pub fn seed_results(&self, portal_run_id: &str, failed_steps: Option<&str>) {
        let output = standard_output_uri(portal_run_id);
        self.storage.insert(
            format!("{output}Results/MetricsOutput.tsv"),
            format!(
                "[Run QC Metrics]\nSAMPLE\t{STANDARD_LIBRARY_ID}\nFAILED_STEPS\t{}\n",
                failed_steps.unwrap_or("NA")
            ),
        );
        let sample_dir = format!("{output}Results/{STANDARD_LIBRARY_ID}/");
        self.storage
            .insert(format!("{sample_dir}{STANDARD_LIBRARY_ID}.hard-filtered.vcf"), "##fileformat=VCFv4.2\n");
        self.storage
            .insert(format!("{sample_dir}{STANDARD_LIBRARY_ID}.hard-filtered.gvcf"), "##fileformat=VCFv4.2\n");
        self.storage.insert(
            format!("{sample_dir}{STANDARD_LIBRARY_ID}.MergedSmallVariants.vcf"),
            "##fileformat=VCFv4.2\n",
        );
        self.storage.insert(
            format!("{sample_dir}{STANDARD_LIBRARY_ID}.MergedSmallVariants.vcf.gz"),
            "\u{1f}\u{8b}",
        );
    }

    /// Routes `envelope`, then every event the router published in
    /// response, until the bus is quiet. The bus keeps its history.
    ///
    /// # Errors
    ///
    /// Returns the first `RouterError`.
    pub async fn drive(
        &self,
        router: &WorkflowRouter,
        envelope: EventEnvelope,
    ) -> Result<Vec<RouteOutcome>, RouterError> {
        let mut seen = self.bus.len();
        let mut outcomes = vec![router.route(&envelope).await?];
        for _ in 0..MAX_DRIVE_ROUNDS {
            let published = self.bus.published();
            if published.len() == seen {
                break;
            }
            for event in &published[seen..] {
                outcomes.push(router.route(event).await?);
            }
            seen = published.len();
        }
        Ok(outcomes)
    }
}
