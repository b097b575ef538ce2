//! Work queue for controller workers
//!
//! [`RateLimitingQueue`] deduplicates keys, guarantees a key is processed by
//! at most one worker at a time, and delays requeues using a [`RateLimiter`].

#![deny(missing_docs)]

mod queue;
pub mod rate_limiter;

pub use queue::RateLimitingQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
