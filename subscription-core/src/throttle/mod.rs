//! Rate-limited action queues.
//!
//! A [`RateThrottle`] paces deferred actions through a periodic tick task. Each
//! subscription context carries two: one for subscription creation and initial
//! retries, and one for recap traffic, so recap floods never starve new
//! subscriptions.

mod rate_throttle;
pub use rate_throttle::{ActionHandle, Dispatch, RateThrottle, ThrottleGuard, ThrottleOwner};
