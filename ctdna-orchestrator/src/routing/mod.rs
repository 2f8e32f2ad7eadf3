//! Event pattern matching.

mod matcher;
mod pattern;

pub use matcher::{candidates, match_event};
pub use pattern::{EventPattern, FieldPredicate, Wildcard};
