//! Benchmarks for stage matching.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ctdna_orchestrator::config::OrchestratorConfig;
use ctdna_orchestrator::core::EventEnvelope;
use ctdna_orchestrator::registry::{GrantedCapabilities, StageRegistry};
use ctdna_orchestrator::routing::match_event;
use ctdna_orchestrator::testing::{analysis_state_change, draft_event, PORTAL_RUN_ID};
use serde_json::json;

fn registry() -> StageRegistry {
    let config = OrchestratorConfig::default();
    let capabilities = Arc::new(GrantedCapabilities::all());
    match StageRegistry::standard(&config, capabilities) {
        Ok(registry) => registry,
        Err(e) => panic!("standard registry: {e}"),
    }
}

fn matcher_benchmark(c: &mut Criterion) {
    let registry = registry();
    let draft = draft_event(PORTAL_RUN_ID);
    let analysis = analysis_state_change(PORTAL_RUN_ID, "INPROGRESS");
    let unrelated = EventEnvelope::new(
        "orcabus.fastqmanager",
        "FastqListRowStateChange",
        json!({"status": "READY"}),
    );

    c.bench_function("match_draft", |b| {
        b.iter(|| black_box(match_event(&registry, black_box(&draft))));
    });
    c.bench_function("match_analysis_wildcard", |b| {
        b.iter(|| black_box(match_event(&registry, black_box(&analysis))));
    });
    c.bench_function("match_unrelated", |b| {
        b.iter(|| black_box(match_event(&registry, black_box(&unrelated))));
    });
}

criterion_group!(benches, matcher_benchmark);
criterion_main!(benches);
