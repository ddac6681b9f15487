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

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use subscription_core::bridge::{EntitlementHandle, Entitlements};
use subscription_core::Status;
use tracing::debug;

const COMPONENT: &str = "loopback_entitlements";

/// Deny-list entitlements. Everything is allowed unless explicitly denied.
#[derive(Default)]
pub struct LoopbackEntitlements {
    deferred: AtomicBool,
    denied: RwLock<HashSet<String>>,
    next_handle: AtomicU64,
    live: Mutex<HashSet<EntitlementHandle>>,
    checks: AtomicU64,
}

impl LoopbackEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deferred entitlements make the core skip every local check.
    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::SeqCst);
    }

    pub fn deny(&self, subject: impl Into<String>) {
        self.denied.write().insert(subject.into());
    }

    pub fn allow(&self, subject: &str) {
        self.denied.write().remove(subject);
    }

    /// Entitlement subscriptions created and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    pub fn check_count(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl Entitlements for LoopbackEntitlements {
    fn are_entitlements_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    fn is_allowed(&self, handle: EntitlementHandle, subject: &str) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let allowed = !self.denied.read().contains(subject);
        if !allowed {
            debug!(
                component = COMPONENT,
                handle = handle.0,
                subject,
                "subject denied"
            );
        }
        allowed
    }

    fn create_subscription(&self, subject: &str) -> Result<EntitlementHandle, Status> {
        let handle = EntitlementHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.live.lock().insert(handle);
        debug!(
            component = COMPONENT,
            handle = handle.0,
            subject,
            "entitlement subscription created"
        );
        Ok(handle)
    }

    fn destroy_subscription(&self, handle: EntitlementHandle) {
        self.live.lock().remove(&handle);
    }
}
