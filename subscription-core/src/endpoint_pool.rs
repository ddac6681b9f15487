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

//! Topic to endpoint registry used by bridges for inbound fan-out.
//!
//! Readers load an immutable snapshot and never block; writers build the next
//! snapshot under a writer lock and publish it atomically.

use crate::observability::events;
use crate::status::{Status, StatusCode};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

const COMPONENT: &str = "endpoint_pool";

struct TopicEndpoints<E> {
    entries: Vec<(String, Arc<E>)>,
    /// Cached fan-out view of `entries`, in registration order.
    endpoints: Arc<[Arc<E>]>,
}

impl<E> TopicEndpoints<E> {
    fn from_entries(entries: Vec<(String, Arc<E>)>) -> Self {
        let endpoints = entries
            .iter()
            .map(|(_, endpoint)| Arc::clone(endpoint))
            .collect::<Vec<_>>()
            .into();
        Self { entries, endpoints }
    }

    fn find(&self, identifier: &str) -> Option<&Arc<E>> {
        self.entries
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, endpoint)| endpoint)
    }
}

impl<E> Clone for TopicEndpoints<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            endpoints: Arc::clone(&self.endpoints),
        }
    }
}

struct PoolSnapshot<E> {
    version: u64,
    topics: HashMap<String, TopicEndpoints<E>>,
}

impl<E> PoolSnapshot<E> {
    fn empty() -> Self {
        Self {
            version: 0,
            topics: HashMap::new(),
        }
    }
}

/// Endpoints registered per topic under caller-chosen identifiers.
pub struct EndpointPool<E> {
    name: String,
    snapshot: ArcSwap<PoolSnapshot<E>>,
    writer: Mutex<()>,
}

impl<E> EndpointPool<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: ArcSwap::from_pointee(PoolSnapshot::empty()),
            writer: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of snapshots published so far.
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Registers `endpoint` for `topic`. Registering an identifier that is
    /// already present for the topic keeps the existing endpoint.
    pub fn register_with_identifier(
        &self,
        topic: &str,
        identifier: &str,
        endpoint: Arc<E>,
    ) -> Result<(), Status> {
        if topic.is_empty() || identifier.is_empty() {
            return Err(Status::fail_with_code(
                StatusCode::InvalidArgument,
                "topic and identifier must not be empty",
            ));
        }

        let _writer = self.writer.lock();
        let current = self.snapshot.load();
        if let Some(existing) = current.topics.get(topic) {
            if existing.find(identifier).is_some() {
                trace!(
                    event = events::ENDPOINT_REGISTER_REUSE,
                    component = COMPONENT,
                    pool = %self.name,
                    topic,
                    identifier,
                    "identifier already registered for topic"
                );
                return Ok(());
            }
        }

        let mut topics = current.topics.clone();
        let mut entries = topics
            .remove(topic)
            .map(|existing| existing.entries)
            .unwrap_or_default();
        entries.push((identifier.to_string(), endpoint));
        topics.insert(topic.to_string(), TopicEndpoints::from_entries(entries));
        self.publish(current.version, topics);

        debug!(
            event = events::ENDPOINT_REGISTER,
            component = COMPONENT,
            pool = %self.name,
            topic,
            identifier,
            "endpoint registered"
        );
        Ok(())
    }

    /// Registers under a freshly generated identifier and returns it.
    pub fn register_without_identifier(
        &self,
        topic: &str,
        endpoint: Arc<E>,
    ) -> Result<String, Status> {
        let identifier = Uuid::new_v4().to_string();
        self.register_with_identifier(topic, &identifier, endpoint)?;
        Ok(identifier)
    }

    /// Removes one registration. Returns `false` when nothing matched.
    pub fn unregister(&self, topic: &str, identifier: &str) -> bool {
        let _writer = self.writer.lock();
        let current = self.snapshot.load();
        let Some(existing) = current.topics.get(topic) else {
            return false;
        };
        if existing.find(identifier).is_none() {
            return false;
        }

        let mut topics = current.topics.clone();
        let remaining: Vec<_> = existing
            .entries
            .iter()
            .filter(|(id, _)| id != identifier)
            .cloned()
            .collect();
        if remaining.is_empty() {
            topics.remove(topic);
        } else {
            topics.insert(topic.to_string(), TopicEndpoints::from_entries(remaining));
        }
        self.publish(current.version, topics);

        debug!(
            event = events::ENDPOINT_UNREGISTER,
            component = COMPONENT,
            pool = %self.name,
            topic,
            identifier,
            "endpoint unregistered"
        );
        true
    }

    /// Endpoints registered for `topic` at the time of the call.
    pub fn get_registered(&self, topic: &str) -> Arc<[Arc<E>]> {
        match self.snapshot.load().topics.get(topic) {
            Some(existing) => Arc::clone(&existing.endpoints),
            None => Arc::from(Vec::new()),
        }
    }

    pub fn get_endpoint_by_identifiers(&self, topic: &str, identifier: &str) -> Option<Arc<E>> {
        self.snapshot
            .load()
            .topics
            .get(topic)
            .and_then(|existing| existing.find(identifier).cloned())
    }

    /// Whether this exact endpoint allocation is still registered for `topic`.
    pub fn is_registered_by_content(&self, topic: &str, endpoint: &Arc<E>) -> bool {
        self.snapshot
            .load()
            .topics
            .get(topic)
            .is_some_and(|existing| {
                existing
                    .entries
                    .iter()
                    .any(|(_, registered)| Arc::ptr_eq(registered, endpoint))
            })
    }

    /// Empties the pool, handing every registration to `callback` as
    /// `(topic, identifier, endpoint)`.
    pub fn destroy_with<F>(&self, mut callback: F)
    where
        F: FnMut(&str, &str, Arc<E>),
    {
        let drained = {
            let _writer = self.writer.lock();
            let current = self.snapshot.load_full();
            self.publish(current.version, HashMap::new());
            current
        };
        for (topic, existing) in &drained.topics {
            for (identifier, endpoint) in &existing.entries {
                callback(topic, identifier, Arc::clone(endpoint));
            }
        }
    }

    /// Caller holds the writer lock.
    fn publish(&self, current_version: u64, topics: HashMap<String, TopicEndpoints<E>>) {
        self.snapshot.store(Arc::new(PoolSnapshot {
            version: current_version + 1,
            topics,
        }));
    }
}
