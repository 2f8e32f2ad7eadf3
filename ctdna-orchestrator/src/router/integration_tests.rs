//! End-to-end routing through the four stages with in-memory providers.

use super::*;
use crate::config::ContainerTaskConfig;
use crate::core::detail_types;
use crate::errors::reasons;
use crate::events::PublishFormat;
use crate::pipeline::{InMemoryDeliveryLedger, RetryConfig};
use crate::registry::{Capability, GrantedCapabilities};
use crate::routing::candidates;
use crate::testing::{
    self, analysis_state_change, assert_advanced, assert_duplicate, assert_failed_with,
    draft_event, emitted_statuses, legacy_draft_event, ready_event, InMemorySchemaRegistry,
    ScriptedTaskRunner, TestHarness, PORTAL_RUN_ID, STANDARD_LIBRARY_ID,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

fn config() -> OrchestratorConfig {
    OrchestratorConfig::default()
}

async fn stored(router: &WorkflowRouter, portal_run_id: &str) -> WorkflowRun {
    router
        .store()
        .get(portal_run_id)
        .await
        .unwrap()
        .expect("run should be stored")
}

/// Drives a DRAFT through to SUBMITTED.
async fn submit(harness: &TestHarness, router: &WorkflowRouter) {
    let outcomes = harness.drive(router, draft_event(PORTAL_RUN_ID)).await.unwrap();
    assert_advanced(&outcomes[0], StageId::PopulateDraftData);
    assert_advanced(&outcomes[1], StageId::ValidateDraftDataAndPutReadyEvent);
    assert_advanced(&outcomes[2], StageId::ReadyEventToIcav2WesRequestEvent);
}

#[tokio::test]
async fn test_draft_to_succeeded() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();

    let outcomes = harness.drive(&router, draft_event(PORTAL_RUN_ID)).await.unwrap();
    assert_eq!(outcomes.len(), 5);
    let draft = assert_advanced(&outcomes[0], StageId::PopulateDraftData).unwrap();
    assert_eq!(draft.source, "orcabus.dragentso500ctdna");
    assert_eq!(draft.detail["payload"]["data"]["tags"]["libraryId"], STANDARD_LIBRARY_ID);
    assert_advanced(&outcomes[1], StageId::ValidateDraftDataAndPutReadyEvent);
    assert_advanced(&outcomes[2], StageId::ReadyEventToIcav2WesRequestEvent);
    // The engine request and the SUBMITTED event trigger nothing here.
    assert_eq!(&outcomes[3..], &[RouteOutcome::Unmatched, RouteOutcome::Unmatched]);

    let requests = harness.bus.of_detail_type(detail_types::ICAV2_WES_REQUEST);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].detail["inputs"]["isOra"], true);
    assert_eq!(requests[0].detail["tags"]["sampleId"], STANDARD_LIBRARY_ID);
    let samplesheet_uri = format!("{}SampleSheet.csv", testing::standard_cache_uri(PORTAL_RUN_ID));
    assert!(harness.storage.object(&samplesheet_uri).is_some());

    let run = stored(&router, PORTAL_RUN_ID).await;
    assert_eq!(run.status, WorkflowRunStatus::Submitted);
    assert_eq!(run.tracking_handle.as_deref(), Some(run.workflow_run_name.as_str()));
    assert_eq!(run.revision, 3);

    harness
        .drive(&router, analysis_state_change(PORTAL_RUN_ID, "RUNNING"))
        .await
        .unwrap();
    assert_eq!(stored(&router, PORTAL_RUN_ID).await.phase, RunPhase::AnalysisRunning);

    harness.seed_results(PORTAL_RUN_ID, None);
    let outcomes = harness
        .drive(&router, analysis_state_change(PORTAL_RUN_ID, "SUCCEEDED"))
        .await
        .unwrap();
    let emitted = assert_advanced(&outcomes[0], StageId::HandleIcav2AnalysisStateChangeEvent).unwrap();
    assert_eq!(emitted.detail["status"], "SUCCEEDED");

    let run = stored(&router, PORTAL_RUN_ID).await;
    assert!(run.is_terminal());
    assert_eq!(
        run.payload.get_str("outputs.sampleResultsDirRelPath"),
        Some("Results/L2401531/")
    );
    assert_eq!(
        run.payload.get("outputs.compressedVcfUris").and_then(Value::as_array).map(Vec::len),
        Some(2)
    );
    assert!(harness.storage.object(&samplesheet_uri).is_none());

    assert_eq!(
        emitted_statuses(&harness.bus.published()),
        vec![
            WorkflowRunStatus::Draft,
            WorkflowRunStatus::Ready,
            WorkflowRunStatus::Submitted,
            WorkflowRunStatus::Running,
            WorkflowRunStatus::Succeeded,
        ]
    );
    assert!(harness.comments.comments().is_empty());
}

#[tokio::test]
async fn test_validation_failure_annotates_without_advancing() {
    let harness = TestHarness::new().with_schemas(InMemorySchemaRegistry::requiring([
        "inputs.fastqListRows",
        "tags.normalLibraryId",
    ]));
    let router = harness.router(config()).unwrap();

    let outcomes = harness.drive(&router, draft_event(PORTAL_RUN_ID)).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[1],
        RouteOutcome::ValidationRejected {
            stage: StageId::ValidateDraftDataAndPutReadyEvent,
            portal_run_id: PORTAL_RUN_ID.to_string(),
            violations: vec!["tags.normalLibraryId".to_string()],
        }
    );

    let run = stored(&router, PORTAL_RUN_ID).await;
    assert_eq!(run.phase, RunPhase::DraftComplete);
    assert_eq!(run.status, WorkflowRunStatus::Draft);
    assert_eq!(run.annotations.len(), 1);
    assert_eq!(run.annotations[0].violations, vec!["tags.normalLibraryId".to_string()]);

    let comments = harness.comments.comments_for(PORTAL_RUN_ID);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].comment.contains("tags.normalLibraryId"));
    assert_eq!(comments[0].author, "dragen-tso500-ctdna-workflow-orchestration-service");
    assert_eq!(emitted_statuses(&harness.bus.published()), vec![WorkflowRunStatus::Draft]);
}

#[tokio::test]
async fn test_engine_failure_is_commented_and_terminal() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    submit(&harness, &router).await;

    let outcome = router
        .route(&analysis_state_change(PORTAL_RUN_ID, "FAILED"))
        .await
        .unwrap();
    let emitted = assert_advanced(&outcome, StageId::HandleIcav2AnalysisStateChangeEvent).unwrap();
    assert_eq!(emitted.detail["status"], "FAILED");

    let comments = harness.comments.comments_for(PORTAL_RUN_ID);
    assert_eq!(comments.len(), 1);
    assert!(comments[0]
        .comment
        .starts_with("The workflow has failed with error type 'FAILED'"));

    let late = router
        .route(&analysis_state_change(PORTAL_RUN_ID, "SUCCEEDED"))
        .await
        .unwrap();
    assert_eq!(
        late,
        RouteOutcome::Dropped {
            stage: StageId::HandleIcav2AnalysisStateChangeEvent,
            portal_run_id: Some(PORTAL_RUN_ID.to_string()),
            reason: DropReason::TerminalRun,
        }
    );
    assert_eq!(stored(&router, PORTAL_RUN_ID).await.status, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn test_failed_sample_fails_run() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    submit(&harness, &router).await;
    harness.seed_results(PORTAL_RUN_ID, Some("TMB"));

    let outcome = router
        .route(&analysis_state_change(PORTAL_RUN_ID, "SUCCEEDED"))
        .await
        .unwrap();
    assert_failed_with(&outcome, reasons::ANALYSIS_FAILED);

    let run = stored(&router, PORTAL_RUN_ID).await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.annotations.len(), 1);
    assert_eq!(
        emitted_statuses(&harness.bus.published()).last(),
        Some(&WorkflowRunStatus::Failed)
    );
    assert_eq!(harness.comments.comments_for(PORTAL_RUN_ID).len(), 1);
}

#[tokio::test]
async fn test_task_launch_exhaustion_fails_run() {
    let harness = TestHarness::new().with_tasks(ScriptedTaskRunner::new().fail_launches(100));
    let config = config().with_container_task(
        ContainerTaskConfig::default().with_launch_retry(RetryConfig::immediate(2)),
    );
    let router = harness.router(config).unwrap();
    submit(&harness, &router).await;
    harness.seed_results(PORTAL_RUN_ID, None);

    let outcome = router
        .route(&analysis_state_change(PORTAL_RUN_ID, "SUCCEEDED"))
        .await
        .unwrap();
    assert_failed_with(&outcome, reasons::TASK_LAUNCH_FAILED);
    assert_eq!(harness.tasks.launch_attempts(), 2);
    assert_eq!(stored(&router, PORTAL_RUN_ID).await.phase, RunPhase::Failed);
}

#[tokio::test]
async fn test_missing_libraries_fail_populate() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let mut envelope = draft_event(PORTAL_RUN_ID);
    envelope.detail["libraries"] = json!([]);

    let outcome = router.route(&envelope).await.unwrap();
    assert_failed_with(&outcome, reasons::MISSING_INPUT);
    assert_eq!(harness.metadata.calls(), 0);
    assert_eq!(emitted_statuses(&harness.bus.published()), vec![WorkflowRunStatus::Failed]);
}

#[tokio::test]
async fn test_redelivery_is_dropped() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let envelope = draft_event(PORTAL_RUN_ID);

    assert_advanced(&router.route(&envelope).await.unwrap(), StageId::PopulateDraftData);
    assert_duplicate(&router.route(&envelope).await.unwrap());
    // Same change in the other wire format, delivered later.
    assert_duplicate(&router.route(&legacy_draft_event(PORTAL_RUN_ID)).await.unwrap());
    assert_eq!(harness.bus.len(), 1);
}

#[tokio::test]
async fn test_repopulate_is_idempotent() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();

    router.route(&draft_event(PORTAL_RUN_ID)).await.unwrap();
    let first = stored(&router, PORTAL_RUN_ID).await;

    router.ledger().clear().await;
    let outcome = router.route(&draft_event(PORTAL_RUN_ID)).await.unwrap();
    assert_advanced(&outcome, StageId::PopulateDraftData);
    let second = stored(&router, PORTAL_RUN_ID).await;

    assert_eq!(second.payload, first.payload);
    assert_eq!(second.linked_libraries, first.linked_libraries);
    assert_eq!(second.revision, first.revision + 1);
}

#[tokio::test]
async fn test_legacy_and_current_drafts_reach_same_state() {
    async fn run_from(envelope: EventEnvelope) -> WorkflowRun {
        let harness = TestHarness::new();
        let router = harness.router(config()).unwrap();
        harness.drive(&router, envelope).await.unwrap();
        stored(&router, PORTAL_RUN_ID).await
    }

    let current = run_from(draft_event(PORTAL_RUN_ID)).await;
    let legacy = run_from(legacy_draft_event(PORTAL_RUN_ID)).await;

    assert_eq!(legacy.status, WorkflowRunStatus::Submitted);
    assert_eq!(legacy.status, current.status);
    assert_eq!(legacy.payload, current.payload);
    assert_eq!(legacy.linked_libraries, current.linked_libraries);
    assert_eq!(legacy.workflow_run_name, current.workflow_run_name);
}

#[tokio::test]
async fn test_dual_publish_is_consumed_once() {
    let harness = TestHarness::new();
    let router = harness
        .router(config().with_publish_format(PublishFormat::Dual))
        .unwrap();

    let outcomes = harness.drive(&router, draft_event(PORTAL_RUN_ID)).await.unwrap();
    let advanced: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, RouteOutcome::Advanced { .. }))
        .collect();
    assert_eq!(advanced.len(), 3);
    assert!(outcomes.iter().any(|o| matches!(o, RouteOutcome::Duplicate { .. })));
    assert_eq!(harness.bus.of_detail_type(detail_types::ICAV2_WES_REQUEST).len(), 1);
}

#[tokio::test]
async fn test_ready_without_prior_draft_submits() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let output_uri = testing::standard_output_uri(PORTAL_RUN_ID);
    let payload = json!({
        "inputs": {"fastqListRows": [{
            "rgid": testing::STANDARD_RGID,
            "rglb": STANDARD_LIBRARY_ID,
            "rgsm": STANDARD_LIBRARY_ID,
            "lane": 1,
            "read1FileUri": "s3://fastq/L2401531_R1.fastq.gz"
        }]},
        "engineParameters": {
            "pipelineId": "63dc920c-adde-4891-8aae-84a6b9569f37",
            "projectId": "ea19a3f5-ec7c-4940-a474-c31cd91dbad4",
            "outputUri": output_uri,
            "cacheUri": testing::standard_cache_uri(PORTAL_RUN_ID)
        },
        "tags": {"libraryId": STANDARD_LIBRARY_ID, "fastqRgidList": [testing::STANDARD_RGID]}
    });

    let outcome = router.route(&ready_event(PORTAL_RUN_ID, payload)).await.unwrap();
    let emitted = assert_advanced(&outcome, StageId::ReadyEventToIcav2WesRequestEvent).unwrap();
    assert_eq!(emitted.detail["status"], "SUBMITTED");

    let requests = harness.bus.of_detail_type(detail_types::ICAV2_WES_REQUEST);
    assert_eq!(requests[0].detail["inputs"]["isOra"], false);
    assert_eq!(requests[0].detail["engineParameters"]["outputUri"], output_uri);
}

#[tokio::test]
async fn test_unsupported_payload_version_is_rejected() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let mut envelope = ready_event(PORTAL_RUN_ID, json!({}));
    envelope.detail["payload"]["version"] = json!("2023.01.01");

    let err = router.route(&envelope).await.unwrap_err();
    assert!(matches!(err, RouterError::UnsupportedPayloadVersion { ref version, .. } if version == "2023.01.01"));
    assert!(router.store().get(PORTAL_RUN_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_out_of_order_events_are_dropped() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();

    let outcome = router
        .route(&analysis_state_change("20250620ffff0000", "RUNNING"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RouteOutcome::Dropped {
            reason: DropReason::UnknownRun,
            ..
        }
    ));

    router.route(&draft_event(PORTAL_RUN_ID)).await.unwrap();
    let outcome = router
        .route(&analysis_state_change(PORTAL_RUN_ID, "RUNNING"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Dropped {
            stage: StageId::HandleIcav2AnalysisStateChangeEvent,
            portal_run_id: Some(PORTAL_RUN_ID.to_string()),
            reason: DropReason::OutOfOrder {
                phase: RunPhase::DraftComplete
            },
        }
    );
}

#[tokio::test]
async fn test_repeated_progress_is_absorbed() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    submit(&harness, &router).await;
    let published = harness.bus.len();

    let mut pending = analysis_state_change(PORTAL_RUN_ID, "PENDING");
    pending.detail["id"] = json!("iwa.other");
    let outcome = router.route(&pending).await.unwrap();
    assert!(assert_advanced(&outcome, StageId::HandleIcav2AnalysisStateChangeEvent).is_none());
    assert_eq!(harness.bus.len(), published);
}

#[tokio::test]
async fn test_comment_failure_leaves_delivery_retryable() {
    let harness = TestHarness::new().with_schemas(InMemorySchemaRegistry::requiring(["tags.missing"]));
    let router = harness.router(config()).unwrap();
    router.route(&draft_event(PORTAL_RUN_ID)).await.unwrap();
    let draft = harness.bus.published().remove(0);

    harness.comments.fail_next(1);
    assert!(matches!(router.route(&draft).await, Err(RouterError::Provider(_))));

    let outcome = router.route(&draft).await.unwrap();
    assert!(matches!(outcome, RouteOutcome::ValidationRejected { .. }));
}

#[tokio::test]
async fn test_unknown_detail_types_are_unmatched() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let envelope = EventEnvelope::new("orcabus.other", "SomethingElse", json!({"portalRunId": "x"}));
    assert_eq!(router.route(&envelope).await.unwrap(), RouteOutcome::Unmatched);
}

#[tokio::test]
async fn test_runs_are_routed_concurrently() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();

    let first = draft_event("20250620aaaa0001");
    let second = draft_event("20250620bbbb0002");
    let (a, b) = tokio::join!(router.route(&first), router.route(&second));
    assert_advanced(&a.unwrap(), StageId::PopulateDraftData);
    assert_advanced(&b.unwrap(), StageId::PopulateDraftData);
    assert_eq!(router.store().list().await.unwrap().len(), 2);
    assert!(router.locks.is_empty());
}

#[tokio::test]
async fn test_lock_table_is_empty_after_many_runs() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();

    for n in 0..20 {
        let portal_run_id = format!("20250620run{n:05}");
        let outcomes = harness.drive(&router, draft_event(&portal_run_id)).await.unwrap();
        assert_advanced(&outcomes[2], StageId::ReadyEventToIcav2WesRequestEvent);
    }
    assert_eq!(router.store().list().await.unwrap().len(), 20);
    assert!(router.locks.is_empty());
}

#[tokio::test]
async fn test_minimal_draft_uses_default_workflow_version() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let envelope = EventEnvelope::new(
        "orcabus.workflowmanager",
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        json!({
            "portalRunId": "r-min",
            "workflow": {"name": "dragen-tso500-ctdna"},
            "status": "DRAFT",
            "libraries": [{"libraryId": STANDARD_LIBRARY_ID, "orcabusId": testing::STANDARD_ORCABUS_ID}],
        }),
    );

    let outcome = router.route(&envelope).await.unwrap();
    let emitted = assert_advanced(&outcome, StageId::PopulateDraftData).unwrap();
    assert_eq!(emitted.detail["workflow"]["name"], "dragen-tso500-ctdna");
    assert_eq!(emitted.detail["workflow"]["version"], "2.6.0");
    assert_eq!(stored(&router, "r-min").await.workflow_version, "2.6.0");
}

#[tokio::test]
async fn test_minimal_draft_without_run_id_is_dropped() {
    let harness = TestHarness::new();
    let router = harness.router(config()).unwrap();
    let envelope = EventEnvelope::new(
        "orcabus.workflowmanager",
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        json!({"workflow": {"name": "dragen-tso500-ctdna"}, "status": "DRAFT"}),
    );

    assert_eq!(
        router.route(&envelope).await.unwrap(),
        RouteOutcome::Dropped {
            stage: StageId::PopulateDraftData,
            portal_run_id: None,
            reason: DropReason::MissingRunId,
        }
    );
    assert!(harness.bus.is_empty());
}

async fn file_backed_router(harness: &TestHarness, root: &std::path::Path) -> WorkflowRouter {
    WorkflowRouter::new(
        config(),
        &harness.providers(),
        Arc::new(FileRunStore::open(root).await.unwrap()),
        Arc::new(InMemoryDeliveryLedger::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_submitted_run_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new();

    let before = file_backed_router(&harness, dir.path()).await;
    submit(&harness, &before).await;
    drop(before);

    let after = file_backed_router(&harness, dir.path()).await;
    harness.seed_results(PORTAL_RUN_ID, None);
    let outcome = after
        .route(&analysis_state_change(PORTAL_RUN_ID, "SUCCEEDED"))
        .await
        .unwrap();
    assert_advanced(&outcome, StageId::HandleIcav2AnalysisStateChangeEvent);
    assert_eq!(stored(&after, PORTAL_RUN_ID).await.status, WorkflowRunStatus::Succeeded);
}

#[test]
fn test_missing_capability_is_a_boot_error() {
    let harness = TestHarness::new();
    let config = config().with_granted_capabilities(
        Capability::ALL
            .into_iter()
            .filter(|c| *c != Capability::TaskRun),
    );
    let err = harness.router(config).unwrap_err();
    assert!(err.to_string().contains("handleIcav2AnalysisStateChangeEvent"));
}

fn arbitrary_envelope() -> impl Strategy<Value = EventEnvelope> {
    let source = prop::sample::select(vec![
        "orcabus.workflowmanager",
        "orcabus.dragentso500ctdna",
        "orcabus.icav2wesmanager",
        "orcabus.fastqmanager",
    ]);
    let detail_type = prop::sample::select(vec![
        detail_types::WORKFLOW_RUN_STATE_CHANGE,
        detail_types::WORKFLOW_RUN_UPDATE,
        detail_types::ICAV2_WES_REQUEST,
        detail_types::ICAV2_WES_ANALYSIS_STATE_CHANGE,
    ]);
    let statuses = vec!["DRAFT", "READY", "SUBMITTED", "RUNNING", "SUCCEEDED", "FAILED"];
    let status = prop_oneof![
        prop::sample::select(statuses.clone()).prop_map(|s| json!(s)),
        prop::sample::subsequence(statuses, 1..=3).prop_map(|s| json!(s)),
    ];
    let workflow = prop::sample::select(vec!["dragen-tso500-ctdna", "dragen-wgts-dna", "tumor-normal"]);
    let legacy = any::<bool>();

    (source, detail_type, status, workflow, legacy).prop_map(|(source, detail_type, status, workflow, legacy)| {
        let detail = if detail_type == detail_types::ICAV2_WES_ANALYSIS_STATE_CHANGE {
            json!({
                "name": format!("umccr--automated--{workflow}--2-6-0--20250620abcd6789"),
                "status": status,
            })
        } else if legacy {
            json!({
                "portalRunId": "20250620abcd6789",
                "status": status,
                "workflowName": workflow,
                "workflowVersion": "2.6.0",
            })
        } else {
            json!({
                "portalRunId": "20250620abcd6789",
                "status": status,
                "workflow": {"name": workflow, "version": "2.6.0"},
            })
        };
        EventEnvelope::new(source, detail_type, detail)
    })
}

proptest! {
    #[test]
    fn prop_every_event_matches_at_most_one_stage(envelope in arbitrary_envelope()) {
        let registry = StageRegistry::standard(&config(), Arc::new(GrantedCapabilities::all())).unwrap();
        prop_assert!(candidates(&registry, &envelope).len() <= 1);
    }
}
