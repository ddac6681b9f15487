//! Timer runtime integration layer.
//!
//! Throttle ticks and image-request reply timers run on a tokio runtime that is
//! either borrowed from the caller or owned by a dedicated thread, so the rest of
//! the crate stays synchronous.
//!
//! ```
//! use subscription_core::TimerRuntime;
//!
//! let runtime = TimerRuntime::dedicated("doc-timer").unwrap();
//! let throttle = subscription_core::RateThrottle::new(
//!     "doc",
//!     subscription_core::config::ThrottleConfig::default(),
//!     runtime,
//! );
//! assert_eq!(throttle.queue_len(), 0);
//! ```

mod timer_runtime;
pub use timer_runtime::TimerRuntime;
