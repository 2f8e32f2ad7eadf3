//! The workflow router.
//!
//! For every inbound envelope the router selects at most one stage, decodes
//! the detail, takes the per-run lock, checks the run's phase and the
//! delivery ledger, executes the stage and finally emits, persists and
//! records the delivery. Emission happens before persistence so that a
//! failed write leads to a retried delivery (and a duplicate emission that
//! consumers drop) rather than a run that advanced without telling anyone.

mod lock;
mod store;

#[cfg(test)]
mod integration_tests;

pub use lock::{RunLockGuard, RunLocks};
pub use store::{FileRunStore, InMemoryRunStore, RunStore};

use crate::config::OrchestratorConfig;
use crate::core::{
    EventEnvelope, Icav2WesStateChange, InboundEvent, Payload, RunPhase, RunStateChange, WorkflowRun,
    WorkflowRunStatus,
};
use crate::errors::{ConfigurationError, RouterError};
use crate::events::LifecycleEmitter;
use crate::observability::{RunSpanAttributes, SpanTimer};
use crate::pipeline::{
    check_delivery, delivery_key, hash_content, DeliveryCheck, DeliveryLedger, LedgerEntry,
    StageExecutor, StageInput, StageOutcome,
};
use crate::registry::{GrantedCapabilities, StageDefinition, StageId, StageRegistry, StepId};
use crate::routing::match_event;
use crate::steps::{CommentService, Providers, Step, StepCatalog};
use crate::utils::comment_author;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

/// Why an event was dropped without running its stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The event names no run.
    MissingRunId,
    /// The run is SUCCEEDED or FAILED.
    TerminalRun,
    /// The stage needs a run that does not exist.
    UnknownRun,
    /// The run is not in a phase this stage applies to.
    OutOfOrder {
        /// Phase the run is in.
        phase: RunPhase,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRunId => f.write_str("event carries no portalRunId"),
            Self::TerminalRun => f.write_str("run is terminal"),
            Self::UnknownRun => f.write_str("run is unknown"),
            Self::OutOfOrder { phase } => write!(f, "run is in phase {phase}"),
        }
    }
}

/// What routing an envelope did.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// No stage matched.
    Unmatched,
    /// The stage completed.
    Advanced {
        /// The stage.
        stage: StageId,
        /// The run.
        portal_run_id: String,
        /// Emitted lifecycle event, if the status changed.
        emitted: Option<EventEnvelope>,
    },
    /// Validation failed; the run stays in its phase with an annotation.
    ValidationRejected {
        /// The stage.
        stage: StageId,
        /// The run.
        portal_run_id: String,
        /// Violated field paths.
        violations: Vec<String>,
    },
    /// A step failed; the run is FAILED.
    Failed {
        /// The stage.
        stage: StageId,
        /// The run.
        portal_run_id: String,
        /// The failing step.
        step: StepId,
        /// Machine readable reason code.
        reason_code: String,
    },
    /// The delivery was seen before.
    Duplicate {
        /// The stage.
        stage: StageId,
        /// The run.
        portal_run_id: String,
    },
    /// The event was dropped.
    Dropped {
        /// The stage.
        stage: StageId,
        /// The run, if known.
        portal_run_id: Option<String>,
        /// Why.
        reason: DropReason,
    },
}

impl RouteOutcome {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Advanced { .. } => "advanced",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::Failed { .. } => "failed",
            Self::Duplicate { .. } => "duplicate",
            Self::Dropped { .. } => "dropped",
        }
    }

    /// Span attributes describing this outcome.
    #[must_use]
    pub fn span_attributes(&self) -> RunSpanAttributes {
        let attrs = RunSpanAttributes::new().with_status(self.label());
        match self {
            Self::Unmatched => attrs,
            Self::Advanced { stage, portal_run_id, .. }
            | Self::ValidationRejected { stage, portal_run_id, .. }
            | Self::Duplicate { stage, portal_run_id } => {
                attrs.with_stage(stage.as_str()).with_portal_run_id(portal_run_id.as_str())
            }
            Self::Failed {
                stage,
                portal_run_id,
                step,
                reason_code,
            } => attrs
                .with_stage(stage.as_str())
                .with_portal_run_id(portal_run_id.as_str())
                .with_step(step.as_str())
                .with_reason_code(reason_code.as_str()),
            Self::Dropped {
                stage, portal_run_id, ..
            } => {
                let attrs = attrs.with_stage(stage.as_str());
                match portal_run_id {
                    Some(id) => attrs.with_portal_run_id(id.as_str()),
                    None => attrs,
                }
            }
        }
    }
}

/// Routes bus events through the stage graph.
pub struct WorkflowRouter {
    config: Arc<OrchestratorConfig>,
    registry: Arc<StageRegistry>,
    catalog: StepCatalog,
    executor: StageExecutor,
    emitter: LifecycleEmitter,
    comments: Arc<dyn CommentService>,
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn DeliveryLedger>,
    locks: RunLocks,
}

impl fmt::Debug for WorkflowRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRouter")
            .field("workflow", &self.config.workflow_name)
            .field("stages", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowRouter {
    /// Wires the router from configuration and providers.
    ///
    /// # Errors
    ///
    /// Fails fast with the first `ConfigurationError` of the stage table.
    pub fn new(
        config: OrchestratorConfig,
        providers: &Providers,
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Result<Self, ConfigurationError> {
        let capabilities = Arc::new(GrantedCapabilities::new(config.granted_capabilities.iter().copied()));
        let registry = Arc::new(StageRegistry::standard(&config, capabilities)?);
        let config = Arc::new(config);
        let catalog = StepCatalog::new(providers, &config);

        Ok(Self {
            executor: StageExecutor::new(catalog.clone(), config.clone()),
            emitter: LifecycleEmitter::new(providers.bus.clone(), &config),
            comments: providers.comments.clone(),
            config,
            registry,
            catalog,
            store,
            ledger,
            locks: RunLocks::new(),
        })
    }

    /// Replaces one step implementation.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.catalog = self.catalog.with_step(step);
        self.executor = StageExecutor::new(self.catalog.clone(), self.config.clone());
        self
    }

    /// Replaces the lifecycle emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: LifecycleEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The run store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// The delivery ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.ledger
    }

    /// Routes one envelope.
    ///
    /// # Errors
    ///
    /// Returns `RouterError` for undecodable details, unsupported payload
    /// versions and store, bus or comment failures. Nothing is recorded in
    /// the ledger on error, so a re-delivery retries the stage.
    pub async fn route(&self, envelope: &EventEnvelope) -> Result<RouteOutcome, RouterError> {
        let span = tracing::info_span!(
            "route",
            event_id = %envelope.id,
            source = %envelope.source,
            detail_type = %envelope.detail_type,
        );
        let timer = SpanTimer::start("route");
        let outcome = self.route_inner(envelope).instrument(span).await?;
        tracing::debug!(
            attributes = ?outcome.span_attributes().with_duration_ms(timer.elapsed_ms()).to_attributes(),
            "Routed event"
        );
        Ok(outcome)
    }

    async fn route_inner(&self, envelope: &EventEnvelope) -> Result<RouteOutcome, RouterError> {
        let Some(stage) = match_event(&self.registry, envelope) else {
            tracing::debug!("No stage matched");
            return Ok(RouteOutcome::Unmatched);
        };

        let event = InboundEvent::decode(envelope)?;
        if let InboundEvent::Lifecycle { change, .. } = &event {
            change.check_payload_version(&self.config.supported_payload_versions)?;
        }
        let Some(portal_run_id) = event.portal_run_id().map(ToString::to_string) else {
            return Ok(dropped(stage, None, DropReason::MissingRunId));
        };

        let _guard = self.locks.acquire(&portal_run_id).await;
        let existing = self.store.get(&portal_run_id).await?;

        let (status_key, content) = delivery_content(&event);
        let key = delivery_key(&portal_run_id, &status_key, &stage.name);
        let content_hash = hash_content(&content);
        match check_delivery(self.ledger.as_ref(), &key, &content_hash).await {
            DeliveryCheck::Duplicate(_) => {
                tracing::info!(portal_run_id = %portal_run_id, stage = %stage.name, "Duplicate delivery dropped");
                return Ok(RouteOutcome::Duplicate {
                    stage: stage.id,
                    portal_run_id,
                });
            }
            DeliveryCheck::ContentChanged { .. } => {
                tracing::debug!(portal_run_id = %portal_run_id, "Delivery content changed; processing again");
            }
            DeliveryCheck::New => {}
        }

        let run = match admit(stage.id, existing.as_ref(), &event, &self.config) {
            Ok(run) => run,
            Err(reason) => {
                tracing::info!(portal_run_id = %portal_run_id, stage = %stage.name, %reason, "Dropped event");
                return Ok(dropped(stage, Some(portal_run_id), reason));
            }
        };

        tracing::info!(portal_run_id = %portal_run_id, stage = %stage.name, phase = %run.phase, "Executing stage");
        let expected = existing.as_ref().map(|r| r.revision);
        let input = match &event {
            InboundEvent::Lifecycle { change, .. } => StageInput {
                incoming: change.payload.as_ref(),
                analysis: None,
            },
            InboundEvent::AnalysisStateChange(change) => StageInput {
                incoming: None,
                analysis: Some(change),
            },
        };
        let outcome = self.executor.execute(stage, run.clone(), input).await;

        let result = match outcome {
            StageOutcome::Completed { run: updated, status, .. } => {
                let previous = run.status;
                self.complete(stage, updated, previous, status, input.analysis, expected)
                    .await?
            }
            StageOutcome::ValidationFailed { step, violations } => {
                self.reject(stage, run, step, violations, expected).await?
            }
            StageOutcome::Failed {
                step,
                reason_code,
                message,
            } => self.fail(stage, run, step, reason_code, &message, expected).await?,
        };

        self.ledger
            .record(&key, LedgerEntry::new(content_hash).with_ttl(self.config.ledger_ttl()))
            .await;
        Ok(result)
    }

    async fn complete(
        &self,
        stage: &StageDefinition,
        mut run: WorkflowRun,
        previous: WorkflowRunStatus,
        status: Option<WorkflowRunStatus>,
        analysis: Option<&Icav2WesStateChange>,
        expected: Option<u64>,
    ) -> Result<RouteOutcome, RouterError> {
        let next = match stage.id {
            StageId::PopulateDraftData => Some(WorkflowRunStatus::Draft),
            StageId::ValidateDraftDataAndPutReadyEvent => Some(WorkflowRunStatus::Ready),
            StageId::ReadyEventToIcav2WesRequestEvent => status.or(Some(WorkflowRunStatus::Submitted)),
            // Progress reports repeating the current status are absorbed.
            StageId::HandleIcav2AnalysisStateChangeEvent => status.filter(|s| *s != previous),
        };

        if next == Some(WorkflowRunStatus::Failed) {
            if let Some(analysis) = analysis {
                let comment = format!(
                    "The workflow has failed with error type '{}'. See analysis '{}' for details.",
                    analysis.status, analysis.id
                );
                self.comment(&run, &comment).await?;
            }
        }

        let emitted = match next {
            Some(status) => {
                run.transition(status);
                Some(self.emitter.emit(&run, status).await?)
            }
            None => None,
        };
        let run = self.store.put(run, expected).await?;

        tracing::info!(
            portal_run_id = %run.portal_run_id(),
            stage = %stage.name,
            status = %run.status,
            phase = %run.phase,
            "Stage completed"
        );
        Ok(RouteOutcome::Advanced {
            stage: stage.id,
            portal_run_id: run.portal_run_id().to_string(),
            emitted,
        })
    }

    async fn reject(
        &self,
        stage: &StageDefinition,
        mut run: WorkflowRun,
        step: StepId,
        violations: Vec<String>,
        expected: Option<u64>,
    ) -> Result<RouteOutcome, RouterError> {
        let comment = format!(
            "Draft payload failed validation at step '{step}'. Violated fields: {}",
            violations.join(", ")
        );
        self.comment(&run, &comment).await?;
        run.annotate(&stage.name, comment, violations.clone());
        let run = self.store.put(run, expected).await?;

        tracing::warn!(
            portal_run_id = %run.portal_run_id(),
            stage = %stage.name,
            violations = violations.len(),
            "Validation rejected draft"
        );
        Ok(RouteOutcome::ValidationRejected {
            stage: stage.id,
            portal_run_id: run.portal_run_id().to_string(),
            violations,
        })
    }

    async fn fail(
        &self,
        stage: &StageDefinition,
        mut run: WorkflowRun,
        step: StepId,
        reason_code: String,
        message: &str,
        expected: Option<u64>,
    ) -> Result<RouteOutcome, RouterError> {
        let comment = format!("Stage '{}' failed at step '{step}' ({reason_code}): {message}", stage.name);
        self.comment(&run, &comment).await?;
        run.annotate(&stage.name, comment, Vec::new());
        run.transition(WorkflowRunStatus::Failed);
        self.emitter.emit(&run, WorkflowRunStatus::Failed).await?;
        let run = self.store.put(run, expected).await?;

        tracing::error!(
            portal_run_id = %run.portal_run_id(),
            stage = %stage.name,
            step = %step,
            reason_code = %reason_code,
            "Stage failed; run is FAILED"
        );
        Ok(RouteOutcome::Failed {
            stage: stage.id,
            portal_run_id: run.portal_run_id().to_string(),
            step,
            reason_code,
        })
    }

    async fn comment(&self, run: &WorkflowRun, comment: &str) -> Result<(), RouterError> {
        self.comments
            .add_comment(run.portal_run_id(), comment, &comment_author(&run.workflow_name))
            .await?;
        Ok(())
    }
}

fn dropped(stage: &StageDefinition, portal_run_id: Option<String>, reason: DropReason) -> RouteOutcome {
    RouteOutcome::Dropped {
        stage: stage.id,
        portal_run_id,
        reason,
    }
}

/// Decides whether `stage` may run for the stored run and returns the run to
/// execute against.
fn admit(
    stage: StageId,
    existing: Option<&WorkflowRun>,
    event: &InboundEvent,
    config: &OrchestratorConfig,
) -> Result<WorkflowRun, DropReason> {
    if existing.is_some_and(WorkflowRun::is_terminal) {
        return Err(DropReason::TerminalRun);
    }
    let out_of_order = |run: &WorkflowRun| DropReason::OutOfOrder { phase: run.phase };

    match (stage, event) {
        (StageId::PopulateDraftData, InboundEvent::Lifecycle { change, .. }) => match existing {
            None => Ok(new_run(change, config)),
            Some(run) if run.phase <= RunPhase::DraftComplete => Ok(absorb(run.clone(), change)),
            Some(run) => Err(out_of_order(run)),
        },
        (StageId::ValidateDraftDataAndPutReadyEvent, InboundEvent::Lifecycle { .. }) => match existing {
            None => Err(DropReason::UnknownRun),
            Some(run) if run.phase == RunPhase::DraftComplete => Ok(run.clone()),
            Some(run) => Err(out_of_order(run)),
        },
        (StageId::ReadyEventToIcav2WesRequestEvent, InboundEvent::Lifecycle { change, .. }) => match existing {
            None => {
                let mut run = new_run(change, config);
                run.phase = RunPhase::ReadyPending;
                run.status = WorkflowRunStatus::Ready;
                Ok(run)
            }
            Some(run) if matches!(run.phase, RunPhase::DraftComplete | RunPhase::ReadyPending) => {
                Ok(absorb(run.clone(), change))
            }
            Some(run) => Err(out_of_order(run)),
        },
        (StageId::HandleIcav2AnalysisStateChangeEvent, InboundEvent::AnalysisStateChange(_)) => match existing {
            None => Err(DropReason::UnknownRun),
            Some(run) if run.phase >= RunPhase::Submitted => Ok(run.clone()),
            Some(run) => Err(out_of_order(run)),
        },
        (_, _) => Err(existing.map_or(DropReason::UnknownRun, out_of_order)),
    }
}

fn new_run(change: &RunStateChange, config: &OrchestratorConfig) -> WorkflowRun {
    let payload = change
        .payload
        .clone()
        .unwrap_or_else(|| Payload::new(config.default_payload_version.clone()));
    let mut run = WorkflowRun::new(
        change.portal_run_id.clone(),
        change.workflow_name.clone(),
        change
            .workflow_version
            .clone()
            .unwrap_or_else(|| config.default_workflow_version.clone()),
        payload,
    )
    .with_libraries(change.libraries.clone());
    if let Some(name) = &change.workflow_run_name {
        run = run.with_run_name(name.clone());
    }
    run
}

/// Folds an inbound lifecycle change into a stored run: inbound values win,
/// stored values fill what the event leaves out.
fn absorb(mut run: WorkflowRun, change: &RunStateChange) -> WorkflowRun {
    if let Some(incoming) = &change.payload {
        let mut payload = incoming.clone();
        payload.merge_missing(&run.payload.data);
        run.payload = payload;
    }
    if !change.libraries.is_empty() {
        run.linked_libraries = change.libraries.clone();
    }
    run
}

/// Ledger status and normalized content of a delivery.
fn delivery_content(event: &InboundEvent) -> (String, Value) {
    match event {
        InboundEvent::Lifecycle { change, .. } => {
            let mut normalized = change.clone();
            normalized.timestamp = None;
            (
                change.status.as_str().to_string(),
                serde_json::to_value(normalized).unwrap_or(Value::Null),
            )
        }
        InboundEvent::AnalysisStateChange(change) => (
            change.status.to_ascii_uppercase(),
            serde_json::to_value(change).unwrap_or(Value::Null),
        ),
    }
}
