// Retry module - decides whether a failed call may run again and how long to wait
//
// - classifier: SQLSTATE / operation-class eligibility table
// - backoff: exponential backoff with jitter and the retry loop

pub mod backoff;
pub mod classifier;

pub use backoff::{Backoff, RetryState, retry_operation};
pub use classifier::{Failure, OperationClass, RetryPolicy, RetryScope, is_retryable};
