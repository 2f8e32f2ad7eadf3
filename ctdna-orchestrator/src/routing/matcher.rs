//! Selects the stage an envelope triggers.

use crate::core::{canonical_detail, EventEnvelope};
use crate::registry::{StageDefinition, StageRegistry};

/// Returns every stage whose trigger matches the envelope.
///
/// Legacy lifecycle details are normalized before matching.
#[must_use]
pub fn candidates<'r>(registry: &'r StageRegistry, envelope: &EventEnvelope) -> Vec<&'r StageDefinition> {
    let detail = canonical_detail(envelope);
    registry
        .all()
        .iter()
        .filter(|stage| {
            stage
                .trigger
                .matches(&envelope.source, &envelope.detail_type, &detail)
        })
        .collect()
}

/// Returns the single stage the envelope triggers, if any.
///
/// Registration rules out overlapping triggers; should two stages still
/// match, nothing is selected and the conflict is logged.
#[must_use]
pub fn match_event<'r>(registry: &'r StageRegistry, envelope: &EventEnvelope) -> Option<&'r StageDefinition> {
    let mut matched = candidates(registry, envelope);
    match matched.len() {
        0 => None,
        1 => matched.pop(),
        _ => {
            tracing::error!(
                source = %envelope.source,
                detail_type = %envelope.detail_type,
                stages = ?matched.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "Envelope matched more than one stage"
            );
            None
        }
    }
}
