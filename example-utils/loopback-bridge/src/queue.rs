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

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use subscription_core::bridge::Queue;
use subscription_core::Status;
use tokio::runtime::Handle;

/// Runs enqueued events as tasks on a tokio runtime and tracks live objects.
pub struct LoopbackQueue {
    handle: Handle,
    object_count: AtomicI64,
    enqueued: AtomicU64,
}

impl LoopbackQueue {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            object_count: AtomicI64::new(0),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Bridge-level subscriptions currently holding the queue open.
    pub fn object_count(&self) -> i64 {
        self.object_count.load(Ordering::SeqCst)
    }

    pub fn enqueued_events(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }
}

impl Queue for LoopbackQueue {
    fn enqueue_event(&self, event: Box<dyn FnOnce() + Send>) -> Result<(), Status> {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.handle.spawn(async move { event() });
        Ok(())
    }

    fn increment_object_count(&self) {
        self.object_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_object_count(&self) {
        self.object_count.fetch_sub(1, Ordering::SeqCst);
    }
}
