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

use super::callbacks::ItemClosure;
use super::quality::DqContext;
use crate::bridge::{EntitlementHandle, Entitlements};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// State kept per delivered subject: quality, entitlement and item closure.
pub(crate) struct SubjectContext {
    symbol: String,
    /// Name entitlement checks run against.
    subject: String,
    entitlement: Option<EntitlementHandle>,
    pub(crate) dq: Mutex<DqContext>,
    item_closure: RwLock<Option<ItemClosure>>,
}

impl SubjectContext {
    pub(crate) fn new(
        symbol: impl Into<String>,
        subject: impl Into<String>,
        entitlement: Option<EntitlementHandle>,
        pre_initial_capacity: usize,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            subject: subject.into(),
            entitlement,
            dq: Mutex::new(DqContext::new(pre_initial_capacity)),
            item_closure: RwLock::new(None),
        }
    }

    pub(crate) fn symbol(&self) -> &str {
        &self.symbol
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn entitlement(&self) -> Option<EntitlementHandle> {
        self.entitlement
    }

    pub(crate) fn item_closure(&self) -> Option<ItemClosure> {
        self.item_closure.read().clone()
    }

    pub(crate) fn set_item_closure(&self, closure: Option<ItemClosure>) {
        *self.item_closure.write() = closure;
    }
}

/// Either the one context of a single-symbol subscription, or one context per
/// issue symbol for groups and wildcards. Never both.
pub(crate) enum SubjectContexts {
    Single(Arc<SubjectContext>),
    Multiple(HashMap<String, Arc<SubjectContext>>),
}

impl SubjectContexts {
    pub(crate) fn single(context: SubjectContext) -> Self {
        SubjectContexts::Single(Arc::new(context))
    }

    pub(crate) fn multiple(size_hint: u32) -> Self {
        SubjectContexts::Multiple(HashMap::with_capacity(size_hint as usize))
    }

    pub(crate) fn is_multiple(&self) -> bool {
        matches!(self, SubjectContexts::Multiple(_))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            SubjectContexts::Single(_) => 1,
            SubjectContexts::Multiple(contexts) => contexts.len(),
        }
    }

    /// The context for `symbol`. Only multi-topic subscriptions look up by symbol.
    pub(crate) fn get(&self, symbol: Option<&str>) -> Option<Arc<SubjectContext>> {
        match self {
            SubjectContexts::Single(context) => Some(Arc::clone(context)),
            SubjectContexts::Multiple(contexts) => symbol.and_then(|s| contexts.get(s).cloned()),
        }
    }

    pub(crate) fn insert(&mut self, context: SubjectContext) -> Arc<SubjectContext> {
        let context = Arc::new(context);
        match self {
            SubjectContexts::Single(single) => *single = Arc::clone(&context),
            SubjectContexts::Multiple(contexts) => {
                contexts.insert(context.symbol().to_string(), Arc::clone(&context));
            }
        }
        context
    }

    pub(crate) fn all(&self) -> Vec<Arc<SubjectContext>> {
        match self {
            SubjectContexts::Single(context) => vec![Arc::clone(context)],
            SubjectContexts::Multiple(contexts) => contexts.values().cloned().collect(),
        }
    }

    /// Returns every context's entitlement subscription to `entitlements`.
    pub(crate) fn release_entitlements(&self, entitlements: &dyn Entitlements) {
        for context in self.all() {
            if let Some(handle) = context.entitlement() {
                entitlements.destroy_subscription(handle);
            }
        }
    }
}

impl Default for SubjectContexts {
    fn default() -> Self {
        SubjectContexts::single(SubjectContext::new("", "", None, 0))
    }
}
