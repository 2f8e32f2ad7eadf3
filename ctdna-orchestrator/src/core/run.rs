//! The workflow run record and its versioned payload.

use super::{RunPhase, WorkflowRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A library linked to a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedLibrary {
    /// Lab library identifier (e.g. `L2401531`).
    pub library_id: String,
    /// Metadata service identifier.
    pub orcabus_id: String,
    /// Readsets attached to the library, if known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readsets: Vec<Value>,
}

impl LinkedLibrary {
    /// Creates a linked library without readsets.
    #[must_use]
    pub fn new(library_id: impl Into<String>, orcabus_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            orcabus_id: orcabus_id.into(),
            readsets: Vec::new(),
        }
    }
}

/// Versioned, schema-validated run payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Payload schema version.
    pub version: String,
    /// Payload body: `inputs`, `engineParameters`, `tags`, `outputs`.
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Payload {
    /// Creates an empty payload of the given version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            data: empty_object(),
        }
    }

    /// Creates a payload with data.
    #[must_use]
    pub fn with_data(version: impl Into<String>, data: Value) -> Self {
        Self {
            version: version.into(),
            data,
        }
    }

    /// Reads a value by dotted path (e.g. `tags.libraryId`).
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path).filter(|v| !v.is_null())
    }

    /// Reads a string value by dotted path.
    #[must_use]
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Fills fields absent from the payload with values from `fragment`.
    ///
    /// Existing non-null values win, so repeated merges of the same
    /// fragment leave the payload unchanged.
    pub fn merge_missing(&mut self, fragment: &Value) {
        merge_missing(&mut self.data, fragment);
    }

    /// Removes top-level keys whose value is null.
    pub fn drop_null_sections(&mut self) {
        if let Value::Object(map) = &mut self.data {
            map.retain(|_, v| !v.is_null());
        }
    }
}

/// Resolves a dotted path inside a JSON value.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Deep fill-missing merge of `fragment` into `target`.
pub fn merge_missing(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target_map), Value::Object(fragment_map)) => {
            for (key, incoming) in fragment_map {
                match target_map.get_mut(key) {
                    Some(existing) if !existing.is_null() => merge_missing(existing, incoming),
                    _ => {
                        target_map.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        (target, fragment) => {
            if target.is_null() {
                *target = fragment.clone();
            }
        }
    }
}

/// Lists dotted paths whose values differ between `before` and `after`.
#[must_use]
pub fn diff_paths(before: &Value, after: &Value) -> Vec<String> {
    let mut changed = Vec::new();
    collect_diff("", before, after, &mut changed);
    changed.sort();
    changed
}

fn collect_diff(prefix: &str, before: &Value, after: &Value, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let keys: std::collections::BTreeSet<&String> = b.keys().chain(a.keys()).collect();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (b.get(key), a.get(key)) {
                    (Some(bv), Some(av)) => collect_diff(&path, bv, av, out),
                    _ => out.push(path),
                }
            }
        }
        (b, a) if b != a => out.push(prefix.to_string()),
        _ => {}
    }
}

/// A note attached to a run that did not advance (e.g. failed validation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAnnotation {
    /// Stage that produced the note.
    pub stage: String,
    /// Human readable comment.
    pub comment: String,
    /// Violated field paths, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    /// When the note was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// One execution instance of the pipeline for one input unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    portal_run_id: String,
    /// Workflow name (e.g. `dragen-tso500-ctdna`).
    pub workflow_name: String,
    /// Workflow version (e.g. `2.6.0`).
    pub workflow_version: String,
    /// Human readable run name.
    pub workflow_run_name: String,
    /// Last lifecycle status emitted or observed.
    pub status: WorkflowRunStatus,
    /// Router phase.
    pub phase: RunPhase,
    /// Versioned payload.
    pub payload: Payload,
    /// Linked libraries, in order.
    #[serde(default)]
    pub linked_libraries: Vec<LinkedLibrary>,
    /// Time of the last transition.
    pub timestamp: DateTime<Utc>,
    /// External tracking handle once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_handle: Option<String>,
    /// Notes from non-advancing outcomes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<RunAnnotation>,
    /// Optimistic concurrency revision, bumped on every store write.
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowRun {
    /// Creates a new run in the `DraftPending` phase.
    #[must_use]
    pub fn new(
        portal_run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        payload: Payload,
    ) -> Self {
        let portal_run_id = portal_run_id.into();
        let workflow_name = workflow_name.into();
        let workflow_version = workflow_version.into();
        let workflow_run_name =
            crate::utils::workflow_run_name(&workflow_name, &workflow_version, &portal_run_id);
        Self {
            portal_run_id,
            workflow_name,
            workflow_version,
            workflow_run_name,
            status: WorkflowRunStatus::Draft,
            phase: RunPhase::DraftPending,
            payload,
            linked_libraries: Vec::new(),
            timestamp: Utc::now(),
            tracking_handle: None,
            annotations: Vec::new(),
            revision: 0,
        }
    }

    /// Sets the run name.
    #[must_use]
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_run_name = name.into();
        self
    }

    /// Sets the linked libraries.
    #[must_use]
    pub fn with_libraries(mut self, libraries: Vec<LinkedLibrary>) -> Self {
        self.linked_libraries = libraries;
        self
    }

    /// The immutable run identifier.
    #[must_use]
    pub fn portal_run_id(&self) -> &str {
        &self.portal_run_id
    }

    /// Returns true if the run reached a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Records a transition to `status`.
    pub fn transition(&mut self, status: WorkflowRunStatus) {
        self.status = status;
        self.phase = RunPhase::after_emitting(status);
        self.timestamp = Utc::now();
    }

    /// Attaches an annotation.
    pub fn annotate(&mut self, stage: &str, comment: impl Into<String>, violations: Vec<String>) {
        self.annotations.push(RunAnnotation {
            stage: stage.to_string(),
            comment: comment.into(),
            violations,
            recorded_at: Utc::now(),
        });
    }
}
