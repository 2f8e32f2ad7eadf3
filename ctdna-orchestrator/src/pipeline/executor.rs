//! Sequential stage execution.
//!
//! Steps of a stage run strictly in declared order. A failure at step *i*
//! aborts the remaining steps; outputs of completed steps are applied to a
//! working copy of the run and only returned on success.

use super::retry::with_retry_if;
use crate::config::OrchestratorConfig;
use crate::core::{Icav2WesStateChange, Payload, WorkflowRun, WorkflowRunStatus};
use crate::errors::{reasons, StepError};
use crate::observability::SpanTimer;
use crate::registry::{StageDefinition, StepId, StepKind, StepRef};
use crate::steps::{Step, StepCatalog, StepContext, StepOutput};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Event-derived inputs of a stage run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageInput<'a> {
    /// Payload carried by the triggering lifecycle event.
    pub incoming: Option<&'a Payload>,
    /// Engine event, for the analysis stage.
    pub analysis: Option<&'a Icav2WesStateChange>,
}

/// Result of executing one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Every step completed or was skipped.
    Completed {
        /// The run with all step outputs applied.
        run: WorkflowRun,
        /// Status the stage asks to emit, if any step set one.
        status: Option<WorkflowRunStatus>,
        /// Steps that did not apply.
        skipped: Vec<StepId>,
    },
    /// A validation step rejected the payload.
    ValidationFailed {
        /// The rejecting step.
        step: StepId,
        /// Violated field paths.
        violations: Vec<String>,
    },
    /// A step failed for good.
    Failed {
        /// The failing step.
        step: StepId,
        /// Machine readable reason code.
        reason_code: String,
        /// Human readable message.
        message: String,
    },
}

impl StageOutcome {
    /// Returns true if the stage completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Executes stage definitions against the step catalogue.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    catalog: StepCatalog,
    config: Arc<OrchestratorConfig>,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(catalog: StepCatalog, config: Arc<OrchestratorConfig>) -> Self {
        Self { catalog, config }
    }

    /// The configuration steps see.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs every step of `stage` against `run`.
    pub async fn execute(&self, stage: &StageDefinition, run: WorkflowRun, input: StageInput<'_>) -> StageOutcome {
        let timer = SpanTimer::start(stage.name.clone());
        let mut run = run;
        let mut scratch = Map::new();
        let mut status = None;
        let mut skipped = Vec::new();

        for step_ref in &stage.steps {
            let Some(step) = self.catalog.get(step_ref.id) else {
                return StageOutcome::Failed {
                    step: step_ref.id,
                    reason_code: reasons::NOT_FOUND.to_string(),
                    message: format!("no implementation for step '{}'", step_ref.id),
                };
            };

            let span = tracing::debug_span!(
                "step",
                stage = %stage.name,
                step = %step_ref.id,
                portal_run_id = %run.portal_run_id(),
            );
            let result = {
                let ctx = StepContext {
                    stage: stage.id,
                    run: &run,
                    incoming: input.incoming,
                    analysis: input.analysis,
                    scratch: &scratch,
                    config: &self.config,
                };
                self.run_step(step.as_ref(), step_ref, &ctx).instrument(span).await
            };

            let output = match result {
                Ok(output) => output,
                Err(StepError::Validation { violations }) => {
                    tracing::warn!(step = %step_ref.id, violations = violations.len(), "Validation failed");
                    return StageOutcome::ValidationFailed {
                        step: step_ref.id,
                        violations,
                    };
                }
                Err(StepError::Fatal { reason_code, message }) => {
                    tracing::error!(step = %step_ref.id, reason_code = %reason_code, "{message}");
                    return StageOutcome::Failed {
                        step: step_ref.id,
                        reason_code,
                        message,
                    };
                }
                Err(StepError::Transient(message)) => {
                    return StageOutcome::Failed {
                        step: step_ref.id,
                        reason_code: reasons::RETRIES_EXHAUSTED.to_string(),
                        message,
                    };
                }
            };

            if let Some(reason) = &output.skip_reason {
                tracing::debug!(step = %step_ref.id, reason = %reason, "Step skipped");
                skipped.push(step_ref.id);
                continue;
            }
            status = output.status.or(status);
            apply(&mut run, &mut scratch, output);
        }

        tracing::debug!(
            stage = %stage.name,
            duration_ms = timer.elapsed_ms(),
            skipped = skipped.len(),
            "Stage completed"
        );
        StageOutcome::Completed { run, status, skipped }
    }

    async fn run_step(&self, step: &dyn Step, step_ref: &StepRef, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        if let Some(reason) = step.skip_reason(ctx) {
            return Ok(StepOutput::skip(reason));
        }
        if let Some(missing) = ctx.first_missing(step_ref.input_contract) {
            return Err(StepError::missing_input(&missing));
        }
        // Container tasks carry their own timeout and launch retry.
        if step_ref.kind == StepKind::ContainerTask {
            return step.execute(ctx).await;
        }

        let timeout = self.config.step_timeout();
        let outcome = with_retry_if(
            &self.config.step_retry,
            step_ref.name(),
            || execute_with_timeout(step, ctx, timeout),
            StepError::is_transient,
        )
        .await;

        match outcome.result {
            Err(StepError::Transient(message)) => Err(StepError::fatal(
                reasons::RETRIES_EXHAUSTED,
                format!("{message} (after {} attempts)", outcome.attempts),
            )),
            other => other,
        }
    }
}

async fn execute_with_timeout(step: &dyn Step, ctx: &StepContext<'_>, timeout: Duration) -> Result<StepOutput, StepError> {
    tokio::time::timeout(timeout, step.execute(ctx))
        .await
        .unwrap_or_else(|_| {
            Err(StepError::fatal(
                reasons::STEP_TIMEOUT,
                format!("step '{}' exceeded {}s", step.id(), timeout.as_secs()),
            ))
        })
}

fn apply(run: &mut WorkflowRun, scratch: &mut Map<String, serde_json::Value>, output: StepOutput) {
    if let Some(payload) = output.payload {
        run.payload = payload;
    }
    if let Some(fragment) = &output.fragment {
        run.payload.merge_missing(fragment);
    }
    if let Some(libraries) = output.libraries {
        run.linked_libraries = libraries;
    }
    scratch.extend(output.scratch);
    if let Some(handle) = output.tracking_handle {
        run.tracking_handle = Some(handle);
    }
}
