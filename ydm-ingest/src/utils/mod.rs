//! Utility modules

pub mod retry;

pub use retry::{is_lock_error, retry_on_lock, retry_with_backoff, RetryExhausted, RetryPolicy};
