//! Timestamp and naming helpers.

mod naming;
pub mod timestamps;

pub use naming::{comment_author, ensure_trailing_slash, workflow_run_name, RUN_NAME_PREFIX};
pub use timestamps::{format_timestamp, utc_timestamp, Timestamp};
