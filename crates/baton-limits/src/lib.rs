//! # baton-limits
//!
//! Admission control for the gateway: per-user cost rate limiting with
//! progressive timeouts, and a per-`(function, user)` circuit breaker that
//! opens on error rate or estimated cost.

pub mod breaker;
pub mod ratelimit;

pub use breaker::{BreakerConfig, BreakerRegistry};
pub use ratelimit::{ProgressiveConfig, RateLimiter};
