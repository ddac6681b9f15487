//! Structured logging vocabulary shared by every module.
//!
//! Events are emitted through `tracing` as
//! `level!(event = events::X, component = COMPONENT, ..., "message")`.

pub mod events;
pub mod fields;
