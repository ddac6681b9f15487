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

//! In-process bridge for exercising `subscription-core` without a broker.
//!
//! Every capability the core consumes has a loopback implementation here.
//! Messages published through [`LoopbackBridge::publish`] are fanned out to
//! the matching low-level subscriptions on the tokio runtime the bridge was
//! built with, never on the caller's thread. Image requests are answered the
//! same way unless replies are switched off.

mod bridge;
pub use bridge::{LoopbackBridge, LoopbackStats, SentMessage};
mod entitlements;
pub use entitlements::LoopbackEntitlements;
mod queue;
pub use queue::LoopbackQueue;
mod transport;
pub use transport::LoopbackTransport;
