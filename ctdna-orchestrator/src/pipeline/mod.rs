//! Stage execution machinery.
//!
//! This module provides:
//! - Retry with backoff and jitter for transient step failures
//! - The delivery ledger that drops re-delivered events
//! - The sequential stage executor

mod executor;
mod ledger;
mod retry;

pub use executor::{StageExecutor, StageInput, StageOutcome};
pub use ledger::{
    check_delivery, delivery_key, hash_content, DeliveryCheck, DeliveryLedger,
    InMemoryDeliveryLedger, LedgerEntry,
};
pub use retry::{
    should_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig,
    RetryDecision, RetryOutcome, RetryState,
};
