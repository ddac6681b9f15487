/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # subscription-core
//!
//! `subscription-core` is the middleware-agnostic subscription engine that sits
//! between application code and a pluggable messaging bridge.
//!
//! Applications allocate a [`Subscription`], set it up against a
//! [`SubscriptionEnv`] and activate it. The core paces bridge work through
//! [`RateThrottle`]s, fetches initial and recap images with [`ImageRequest`],
//! tracks per-topic quality, and reports everything through
//! [`SubscriptionCallbacks`]. A bridge plugs in by implementing the
//! capability traits in [`bridge`].
//!
//! ```
//! use std::sync::Arc;
//! use subscription_core::{Message, Subscription, SubscriptionCallbacks, SubscriptionState};
//! use subscription_core::ItemClosure;
//!
//! struct Printer;
//!
//! impl SubscriptionCallbacks for Printer {
//!     fn on_msg(&self, _: &Subscription, msg: &Message, _: Option<&ItemClosure>) {
//!         println!("{:?}", msg.msg_type());
//!     }
//! }
//!
//! let subscription = Subscription::allocate();
//! assert_eq!(subscription.state(), SubscriptionState::Allocated);
//! assert!(subscription.activate().is_err());
//! subscription.deallocate().unwrap();
//! assert_eq!(subscription.state(), SubscriptionState::Deallocated);
//! # let _callbacks: Arc<dyn SubscriptionCallbacks> = Arc::new(Printer);
//! ```
//!
//! ## Internal architecture map
//!
//! - Collections: generation-checked intrusive list with cursor fix-up
//! - Throttle: rate-limited action queue driven by a timer task
//! - Image requests: initial and recap fetches with timeout and retry
//! - Subscription: lifecycle state machine, delivery and quality tracking
//! - Endpoint pool: snapshot registry bridges use for inbound fan-out
//! - Runtime: tokio runtime boundary for timers
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events.
//! Library code emits events and does not initialize a global subscriber.
//! Binaries and tests are responsible for one-time `tracing_subscriber`
//! initialization at process boundaries.

pub mod bridge;
pub mod collections;
pub mod config;

mod endpoint_pool;
pub use endpoint_pool::EndpointPool;

mod image_request;
pub use image_request::{ImageRequest, ImageRequestOwner, Inbox};

mod message;
pub use message::{Message, MsgQualifier, MsgType};

#[doc(hidden)]
pub mod observability;

mod runtime;
pub use runtime::TimerRuntime;

mod status;
pub use status::{PlatformError, Status, StatusCode};

pub mod subscription;
pub use subscription::{
    BasicSetup, ItemClosure, Quality, ServiceLevel, Subscription, SubscriptionCallbacks,
    SubscriptionEnv, SubscriptionSetup, SubscriptionState, SubscriptionType,
};

pub mod throttle;
pub use throttle::{Dispatch, RateThrottle, ThrottleOwner};
