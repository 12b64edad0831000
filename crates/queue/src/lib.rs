//! `queue` crate: the rate-limited work queue feeding reconciliation workers.

pub mod rate_limiter;
pub mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use work_queue::WorkQueue;
