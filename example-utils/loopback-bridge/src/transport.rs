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

use parking_lot::Mutex;
use std::collections::HashSet;
use subscription_core::bridge::Transport;

pub struct LoopbackTransport {
    name: String,
    group_size_hint: u32,
    listeners: Mutex<HashSet<u64>>,
}

impl LoopbackTransport {
    pub fn new(name: &str) -> Self {
        Self::with_group_size_hint(name, 0)
    }

    pub fn with_group_size_hint(name: &str, group_size_hint: u32) -> Self {
        Self {
            name: name.to_string(),
            group_size_hint,
            listeners: Mutex::new(HashSet::new()),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn has_listener(&self, subscription_id: u64) -> bool {
        self.listeners.lock().contains(&subscription_id)
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_subscription_listener(&self, subscription_id: u64) {
        self.listeners.lock().insert(subscription_id);
    }

    fn remove_subscription_listener(&self, subscription_id: u64) {
        self.listeners.lock().remove(&subscription_id);
    }

    fn group_size_hint(&self) -> u32 {
        self.group_size_hint
    }
}
