//! Trigger patterns over bus envelopes.
//!
//! A pattern accepts a set of sources, a set of detail types and a list of
//! predicates over dotted paths into the (normalized) detail. An empty
//! source or detail-type set accepts anything.

use crate::core::lookup_path;
use crate::errors::ConfigurationError;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::fmt;

/// A `*` glob compiled to an anchored regex.
#[derive(Clone)]
pub struct Wildcard {
    raw: String,
    regex: Regex,
}

impl Wildcard {
    /// Compiles a glob where `*` matches any run of characters.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-006-INVALID_PATTERN` for an empty glob.
    pub fn new(glob: &str) -> Result<Self, ConfigurationError> {
        if glob.is_empty() {
            return Err(ConfigurationError::invalid_pattern(glob, "wildcard must not be empty"));
        }
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|e| ConfigurationError::invalid_pattern(glob, e))?;
        Ok(Self {
            raw: glob.to_string(),
            regex,
        })
    }

    /// The glob text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Tests a string against the glob.
    #[must_use]
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

impl PartialEq for Wildcard {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Wildcard {}

impl fmt::Debug for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Wildcard").field(&self.raw).finish()
    }
}

/// Predicate over a single detail field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPredicate {
    /// Field equals the value.
    Equals(Value),
    /// Field equals one of the values.
    AnyOf(Vec<Value>),
    /// Field is a string matching the glob.
    Wildcard(Wildcard),
    /// Field is present and non-null (`true`) or absent/null (`false`).
    Exists(bool),
}

impl FieldPredicate {
    /// Equality with a string value.
    #[must_use]
    pub fn equals(value: impl Into<String>) -> Self {
        Self::Equals(Value::String(value.into()))
    }

    /// Membership in a set of string values.
    #[must_use]
    pub fn any_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyOf(values.into_iter().map(|v| Value::String(v.into())).collect())
    }

    /// Glob match.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-006-INVALID_PATTERN` if the glob is invalid.
    pub fn wildcard(glob: &str) -> Result<Self, ConfigurationError> {
        Wildcard::new(glob).map(Self::Wildcard)
    }

    /// Evaluates the predicate against the field value (if any).
    ///
    /// Trigger fields are scalars: an array or object only satisfies
    /// `Exists(true)`. This keeps distinct literals disjoint, which the
    /// registry's overlap check relies on.
    #[must_use]
    pub fn evaluate(&self, field: Option<&Value>) -> bool {
        let field = field.filter(|v| !v.is_null());
        match (self, field) {
            (Self::Exists(expected), field) => field.is_some() == *expected,
            (_, None | Some(Value::Array(_) | Value::Object(_))) => false,
            (_, Some(value)) => self.matches_scalar(value),
        }
    }

    fn matches_scalar(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => value == expected,
            Self::AnyOf(options) => options.contains(value),
            Self::Wildcard(glob) => value.as_str().is_some_and(|s| glob.is_match(s)),
            Self::Exists(expected) => !value.is_null() == *expected,
        }
    }

    fn literal_values(&self) -> Option<&[Value]> {
        match self {
            Self::Equals(v) => Some(std::slice::from_ref(v)),
            Self::AnyOf(values) => Some(values),
            Self::Wildcard(_) | Self::Exists(_) => None,
        }
    }

    /// Returns true if some field value can satisfy both predicates.
    ///
    /// Two globs are always considered jointly satisfiable. Distinct
    /// literals never are, since composite values match no literal.
    #[must_use]
    pub fn jointly_satisfiable(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exists(a), Self::Exists(b)) => a == b,
            (Self::Exists(present), _) | (_, Self::Exists(present)) => *present,
            (Self::Wildcard(_), Self::Wildcard(_)) => true,
            (Self::Wildcard(glob), literal) | (literal, Self::Wildcard(glob)) => literal
                .literal_values()
                .is_some_and(|values| {
                    values
                        .iter()
                        .any(|v| v.as_str().is_some_and(|s| glob.is_match(s)))
                }),
            (a, b) => match (a.literal_values(), b.literal_values()) {
                (Some(left), Some(right)) => left.iter().any(|v| right.contains(v)),
                _ => true,
            },
        }
    }

    fn to_rule_value(&self) -> Value {
        match self {
            Self::Equals(v) => json!([v]),
            Self::AnyOf(values) => Value::Array(values.clone()),
            Self::Wildcard(glob) => json!([{"wildcard": glob.as_str()}]),
            Self::Exists(present) => json!([{"exists": present}]),
        }
    }
}

/// Predicate over an envelope's source, detail type and detail fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPattern {
    sources: Vec<String>,
    detail_types: Vec<String>,
    fields: Vec<(String, FieldPredicate)>,
}

impl EventPattern {
    /// Creates a pattern that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts an additional source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Accepts an additional detail type.
    #[must_use]
    pub fn with_detail_type(mut self, detail_type: impl Into<String>) -> Self {
        self.detail_types.push(detail_type.into());
        self
    }

    /// Adds a field predicate on a dotted path.
    #[must_use]
    pub fn with_field(mut self, path: impl Into<String>, predicate: FieldPredicate) -> Self {
        self.fields.push((path.into(), predicate));
        self
    }

    /// Accepted sources.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Accepted detail types.
    #[must_use]
    pub fn detail_types(&self) -> &[String] {
        &self.detail_types
    }

    /// Field predicates.
    #[must_use]
    pub fn fields(&self) -> &[(String, FieldPredicate)] {
        &self.fields
    }

    /// Evaluates the pattern.
    #[must_use]
    pub fn matches(&self, source: &str, detail_type: &str, detail: &Value) -> bool {
        accepts(&self.sources, source)
            && accepts(&self.detail_types, detail_type)
            && self
                .fields
                .iter()
                .all(|(path, predicate)| predicate.evaluate(lookup_path(detail, path)))
    }

    /// Returns true if some envelope could match both patterns.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        intersects(&self.sources, &other.sources)
            && intersects(&self.detail_types, &other.detail_types)
            && self.fields.iter().all(|(path, mine)| {
                other
                    .fields
                    .iter()
                    .filter(|(other_path, _)| other_path == path)
                    .all(|(_, theirs)| mine.jointly_satisfiable(theirs))
            })
    }

    /// Renders the pattern as a bus rule document.
    #[must_use]
    pub fn to_rule(&self) -> Value {
        let mut rule = Map::new();
        if !self.sources.is_empty() {
            rule.insert("source".into(), json!(self.sources));
        }
        if !self.detail_types.is_empty() {
            rule.insert("detail-type".into(), json!(self.detail_types));
        }
        if !self.fields.is_empty() {
            let mut detail = Map::new();
            for (path, predicate) in &self.fields {
                let segments: Vec<&str> = path.split('.').collect();
                insert_path(&mut detail, &segments, predicate.to_rule_value());
            }
            rule.insert("detail".into(), Value::Object(detail));
        }
        Value::Object(rule)
    }
}

fn accepts(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| a == value)
}

fn intersects(left: &[String], right: &[String]) -> bool {
    left.is_empty() || right.is_empty() || left.iter().any(|l| right.contains(l))
}

fn insert_path(target: &mut Map<String, Value>, segments: &[&str], leaf: Value) {
    match segments {
        [] => {}
        [last] => {
            target.insert((*last).to_string(), leaf);
        }
        [head, rest @ ..] => {
            let child = target
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = child {
                insert_path(map, rest, leaf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn draft_pattern(source: &str) -> EventPattern {
        EventPattern::new()
            .with_source(source)
            .with_detail_type("WorkflowRunStateChange")
            .with_field("workflow.name", FieldPredicate::equals("dragen-tso500-ctdna"))
            .with_field("status", FieldPredicate::equals("DRAFT"))
    }

    #[test]
    fn test_wildcard_is_anchored_and_escaped() {
        let glob = Wildcard::new("*--dragen-tso500-ctdna--*").unwrap();
        assert!(glob.is_match("abc123--dragen-tso500-ctdna--xyz"));
        assert!(!glob.is_match("abc123--dragen-tso500-ctdna"));
        assert!(!glob.is_match("abc--dragen-wgts-dna--xyz"));

        let dotted = Wildcard::new("a.b*").unwrap();
        assert!(dotted.is_match("a.bc"));
        assert!(!dotted.is_match("axbc"));
    }

    #[test]
    fn test_empty_wildcard_is_rejected() {
        assert!(Wildcard::new("").is_err());
    }

    #[test]
    fn test_pattern_matches_fields() {
        let pattern = draft_pattern("orcabus.workflowmanager");
        let detail = json!({"status": "DRAFT", "workflow": {"name": "dragen-tso500-ctdna"}});
        assert!(pattern.matches("orcabus.workflowmanager", "WorkflowRunStateChange", &detail));
        assert!(!pattern.matches("orcabus.other", "WorkflowRunStateChange", &detail));

        let ready = json!({"status": "READY", "workflow": {"name": "dragen-tso500-ctdna"}});
        assert!(!pattern.matches("orcabus.workflowmanager", "WorkflowRunStateChange", &ready));
    }

    #[test]
    fn test_composite_values_match_no_literal() {
        let predicate = FieldPredicate::equals("DRAFT");
        assert!(predicate.evaluate(Some(&json!("DRAFT"))));
        assert!(!predicate.evaluate(Some(&json!(["DRAFT", "READY"]))));
        assert!(!predicate.evaluate(Some(&json!({"value": "DRAFT"}))));
        assert!(!FieldPredicate::any_of(["DRAFT", "READY"]).evaluate(Some(&json!(["READY"]))));
        assert!(!FieldPredicate::wildcard("*").unwrap().evaluate(Some(&json!(["x"]))));
        assert!(FieldPredicate::Exists(true).evaluate(Some(&json!(["DRAFT"]))));
    }

    #[test]
    fn test_disjoint_literals_never_match_together() {
        let draft = draft_pattern("orcabus.workflowmanager");
        let ready = EventPattern::new()
            .with_source("orcabus.workflowmanager")
            .with_detail_type("WorkflowRunStateChange")
            .with_field("status", FieldPredicate::equals("READY"));
        assert!(!draft.overlaps(&ready));

        let detail = json!({"status": ["DRAFT", "READY"], "workflow": {"name": "dragen-tso500-ctdna"}});
        let matched = [&draft, &ready]
            .iter()
            .filter(|p| p.matches("orcabus.workflowmanager", "WorkflowRunStateChange", &detail))
            .count();
        assert_eq!(matched, 0);
    }

    #[test]
    fn test_exists_predicate() {
        assert!(FieldPredicate::Exists(true).evaluate(Some(&json!("x"))));
        assert!(!FieldPredicate::Exists(true).evaluate(Some(&Value::Null)));
        assert!(FieldPredicate::Exists(false).evaluate(None));
    }

    #[test]
    fn test_overlap_detection() {
        let manager = draft_pattern("orcabus.workflowmanager");
        let own = draft_pattern("orcabus.dragentso500ctdna");
        assert!(manager.overlaps(&manager.clone()));
        assert!(!manager.overlaps(&own));

        let any_source = EventPattern::new()
            .with_detail_type("WorkflowRunStateChange")
            .with_field("status", FieldPredicate::any_of(["DRAFT", "READY"]));
        assert!(any_source.overlaps(&manager));

        let ready_only = EventPattern::new()
            .with_detail_type("WorkflowRunStateChange")
            .with_field("status", FieldPredicate::equals("READY"));
        assert!(!ready_only.overlaps(&manager));
    }

    #[test]
    fn test_wildcard_overlap() {
        let glob = FieldPredicate::wildcard("*--dragen-tso500-ctdna--*").unwrap();
        let other = FieldPredicate::wildcard("*--dragen-wgts-dna--*").unwrap();
        assert!(glob.jointly_satisfiable(&other));
        assert!(glob.jointly_satisfiable(&FieldPredicate::equals("a--dragen-tso500-ctdna--b")));
        assert!(!glob.jointly_satisfiable(&FieldPredicate::equals("nope")));
        assert!(!glob.jointly_satisfiable(&FieldPredicate::Exists(false)));
    }

    #[test]
    fn test_to_rule() {
        let rule = draft_pattern("orcabus.workflowmanager").to_rule();
        assert_eq!(
            rule,
            json!({
                "source": ["orcabus.workflowmanager"],
                "detail-type": ["WorkflowRunStateChange"],
                "detail": {
                    "workflow": {"name": ["dragen-tso500-ctdna"]},
                    "status": ["DRAFT"]
                }
            })
        );
    }
}
