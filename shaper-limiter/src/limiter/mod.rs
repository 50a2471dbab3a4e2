//! The rate-limiter hierarchy: a token-bucket core shared by the node-wide
//! and per-peer roles, and the global wrapper that cascades admissions
//! between them.

mod bucket;
mod core;
mod global;
mod queue;

pub(crate) use self::core::{Admission, RateLimiter};
pub(crate) use global::GlobalLimiter;
pub(crate) use queue::QueueFull;
