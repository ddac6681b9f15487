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

//! The subscription state machine.
//!
//! A [`Subscription`] is allocated, set up against a [`SubscriptionEnv`],
//! activated, and eventually destroyed and deallocated. Activation of
//! market-data subscriptions is paced by the environment's default
//! [`RateThrottle`](crate::throttle::RateThrottle); the low-level bridge
//! subscription is created when the throttle runs the queued action and torn
//! down asynchronously, acknowledged by the bridge through
//! [`Subscription::on_subscription_destroyed`].
//!
//! Every state change happens under the subscription's lock. Application
//! callbacks, bridge creates and destroys, and publisher sends are always
//! made after it is released, so a bridge may answer on the calling thread.

mod callbacks;
mod delivery;
mod lifecycle;
mod quality;
mod setup;
mod subject_context;
mod types;

pub use callbacks::{ItemClosure, SubscriptionCallbacks};
pub use quality::{DqContext, DqStrategy, DqVerdict, SequenceDqStrategy};
pub use setup::{BasicSetup, SubscriptionEnv, SubscriptionSetup};
pub use types::{
    MsgQualifierFilter, Quality, ServiceLevel, SubscMsgType, SubscriptionState,
    SubscriptionType, WildcardKind,
};

use crate::bridge::{BridgeSubscription, Entitlements, Publisher};
use crate::config::SubscriptionDefaults;
use crate::image_request::ImageRequest;
use crate::observability::events;
use crate::status::PlatformError;
use crate::throttle::{ActionHandle, ThrottleOwner};
use parking_lot::{Mutex, RwLock};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use subject_context::SubjectContexts;
use tracing::{debug, Level};
use types::AtomicState;

const COMPONENT: &str = "subscription";

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration fixed at setup or changed through setters.
///
/// Shared copy-on-write so the message path can snapshot it without cloning strings.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) sub_type: SubscriptionType,
    pub(crate) service_level: ServiceLevel,
    pub(crate) service_level_opt: i64,
    pub(crate) msg_type: SubscMsgType,
    pub(crate) wildcard: WildcardKind,
    pub(crate) source: Option<String>,
    pub(crate) symbol: Option<String>,
    pub(crate) wire_symbol: Option<String>,
    pub(crate) root: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) recap_timeout: Duration,
    pub(crate) retries: u32,
    pub(crate) group_size_hint: u32,
    pub(crate) pre_initial_cache_size: u32,
    pub(crate) requires_initial: bool,
    pub(crate) recover_gaps: bool,
    pub(crate) accept_multiple_initials: bool,
    pub(crate) qualifier_filter: MsgQualifierFilter,
    pub(crate) debug_level: Level,
}

impl Settings {
    fn from_defaults(defaults: &SubscriptionDefaults) -> Self {
        Self {
            sub_type: SubscriptionType::Normal,
            service_level: ServiceLevel::RealTime,
            service_level_opt: 0,
            msg_type: SubscMsgType::Subscribe,
            wildcard: WildcardKind::None,
            source: None,
            symbol: None,
            wire_symbol: None,
            root: None,
            timeout: defaults.timeout(),
            recap_timeout: defaults.recap_timeout(),
            retries: defaults.retries,
            group_size_hint: defaults.group_size_hint,
            pre_initial_cache_size: defaults.pre_initial_cache_size,
            requires_initial: defaults.requires_initial,
            recover_gaps: defaults.recover_gaps,
            accept_multiple_initials: false,
            qualifier_filter: MsgQualifierFilter::default(),
            debug_level: Level::WARN,
        }
    }
}

/// Everything guarded by the subscription lock.
pub(crate) struct Core {
    pub(crate) settings: Arc<Settings>,
    pub(crate) env: Option<SubscriptionEnv>,
    pub(crate) callbacks: Option<Arc<dyn SubscriptionCallbacks>>,
    /// Present only when the bridge checks entitlements locally.
    pub(crate) entitlements: Option<Arc<dyn Entitlements>>,
    pub(crate) publisher: Option<Arc<dyn Publisher>>,
    pub(crate) initial_request: Option<Arc<ImageRequest>>,
    pub(crate) recap_request: Option<Arc<ImageRequest>>,
    pub(crate) bridge_sub: Option<Box<dyn BridgeSubscription>>,
    pub(crate) pending_create: Option<ActionHandle>,
    /// Bumped on every move into ACTIVATING; a queued create only runs for its own epoch.
    pub(crate) activation_epoch: u64,
    pub(crate) listener_registered: bool,
    pub(crate) object_counted: bool,
}

pub(crate) struct SubscriptionInner {
    pub(crate) id: u64,
    pub(crate) this: Weak<SubscriptionInner>,
    pub(crate) state: AtomicState,
    pub(crate) throttle_owner: ThrottleOwner,
    pub(crate) core: Mutex<Core>,
    pub(crate) contexts: RwLock<SubjectContexts>,
    pub(crate) expecting_initial: AtomicBool,
    pub(crate) initial_images: AtomicU32,
    pub(crate) recap_images: AtomicU32,
    pub(crate) platform_error: Mutex<Option<PlatformError>>,
}

impl SubscriptionInner {
    /// Moves to `to`. Callers hold the core lock.
    pub(crate) fn transition(&self, to: SubscriptionState) -> SubscriptionState {
        let from = self.state.swap(to);
        debug!(
            event = events::SUBSCRIPTION_TRANSITION,
            component = COMPONENT,
            subscription_id = self.id,
            from_state = from.as_str(),
            to_state = to.as_str(),
            "subscription state changed"
        );
        from
    }

    pub(crate) fn handle(&self) -> Option<Subscription> {
        self.this.upgrade().map(|inner| Subscription { inner })
    }
}

/// Handle to one subscription. Clones share the same subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Allocates a subscription with the built-in defaults.
    pub fn allocate() -> Self {
        Self::allocate_with(&SubscriptionDefaults::default())
    }

    pub fn allocate_with(defaults: &SubscriptionDefaults) -> Self {
        let inner = Arc::new_cyclic(|this| SubscriptionInner {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            state: AtomicState::new(SubscriptionState::Allocated),
            throttle_owner: ThrottleOwner::next(),
            core: Mutex::new(Core {
                settings: Arc::new(Settings::from_defaults(defaults)),
                env: None,
                callbacks: None,
                entitlements: None,
                publisher: None,
                initial_request: None,
                recap_request: None,
                bridge_sub: None,
                pending_create: None,
                activation_epoch: 0,
                listener_registered: false,
                object_counted: false,
            }),
            contexts: RwLock::new(SubjectContexts::default()),
            expecting_initial: AtomicBool::new(false),
            initial_images: AtomicU32::new(0),
            recap_images: AtomicU32::new(0),
            platform_error: Mutex::new(None),
        });
        Self { inner }
    }

    /// Process-unique id, also handed to the bridge and transport.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state.load()
    }

    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Activated
    }

    fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.inner.core.lock().settings)
    }

    fn update_settings(&self, update: impl FnOnce(&mut Settings)) {
        let mut core = self.inner.core.lock();
        update(Arc::make_mut(&mut core.settings));
    }

    pub fn source(&self) -> Option<String> {
        self.settings().source.clone()
    }

    /// The symbol as given by the application.
    pub fn symbol(&self) -> Option<String> {
        self.settings().symbol.clone()
    }

    /// The symbol as sent on the wire.
    pub fn wire_symbol(&self) -> Option<String> {
        self.settings().wire_symbol.clone()
    }

    pub fn root(&self) -> Option<String> {
        self.settings().root.clone()
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.settings().sub_type
    }

    pub fn service_level(&self) -> ServiceLevel {
        self.settings().service_level
    }

    pub fn service_level_opt(&self) -> i64 {
        self.settings().service_level_opt
    }

    pub fn subsc_msg_type(&self) -> SubscMsgType {
        self.settings().msg_type
    }

    pub fn wildcard_kind(&self) -> WildcardKind {
        self.settings().wildcard
    }

    pub fn timeout(&self) -> Duration {
        self.settings().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.update_settings(|settings| settings.timeout = timeout);
    }

    pub fn recap_timeout(&self) -> Duration {
        self.settings().recap_timeout
    }

    pub fn set_recap_timeout(&self, timeout: Duration) {
        self.update_settings(|settings| settings.recap_timeout = timeout);
    }

    pub fn retries(&self) -> u32 {
        self.settings().retries
    }

    pub fn set_retries(&self, retries: u32) {
        self.update_settings(|settings| settings.retries = retries);
    }

    pub fn group_size_hint(&self) -> u32 {
        self.settings().group_size_hint
    }

    /// Takes effect at the next setup.
    pub fn set_group_size_hint(&self, hint: u32) {
        self.update_settings(|settings| settings.group_size_hint = hint);
    }

    pub fn requires_initial(&self) -> bool {
        self.settings().requires_initial
    }

    pub fn set_requires_initial(&self, requires_initial: bool) {
        self.update_settings(|settings| settings.requires_initial = requires_initial);
    }

    pub fn recover_gaps(&self) -> bool {
        self.settings().recover_gaps
    }

    pub fn set_recover_gaps(&self, recover_gaps: bool) {
        self.update_settings(|settings| settings.recover_gaps = recover_gaps);
    }

    pub fn pre_initial_cache_size(&self) -> u32 {
        self.settings().pre_initial_cache_size
    }

    pub fn set_pre_initial_cache_size(&self, size: u32) {
        self.update_settings(|settings| settings.pre_initial_cache_size = size);
    }

    pub fn accepts_multiple_initials(&self) -> bool {
        self.settings().accept_multiple_initials
    }

    pub fn msg_qualifier_filter(&self) -> MsgQualifierFilter {
        self.settings().qualifier_filter
    }

    pub fn set_msg_qualifier_filter(&self, filter: MsgQualifierFilter) {
        self.update_settings(|settings| settings.qualifier_filter = filter);
    }

    /// Level at which this subscription's per-message activity is logged.
    pub fn debug_level(&self) -> Level {
        self.settings().debug_level
    }

    pub fn set_debug_level(&self, level: Level) {
        self.update_settings(|settings| settings.debug_level = level);
    }

    /// Closure of the single-symbol context. `None` for multi-topic subscriptions.
    pub fn item_closure(&self) -> Option<ItemClosure> {
        match &*self.inner.contexts.read() {
            SubjectContexts::Single(context) => context.item_closure(),
            SubjectContexts::Multiple(_) => None,
        }
    }

    pub fn set_item_closure(&self, closure: Option<ItemClosure>) {
        if let SubjectContexts::Single(context) = &*self.inner.contexts.read() {
            context.set_item_closure(closure);
        }
    }

    /// Sets the closure delivered with messages for one symbol of a group.
    pub fn set_item_closure_for(&self, symbol: &str, closure: Option<ItemClosure>) -> bool {
        match self.inner.contexts.read().get(Some(symbol)) {
            Some(context) => {
                context.set_item_closure(closure);
                true
            }
            None => false,
        }
    }

    /// Quality of the single-symbol context, `Ok` for multi-topic subscriptions.
    pub fn quality(&self) -> Quality {
        match &*self.inner.contexts.read() {
            SubjectContexts::Single(context) => context.dq.lock().quality(),
            SubjectContexts::Multiple(_) => Quality::Ok,
        }
    }

    pub fn subject_context_count(&self) -> usize {
        self.inner.contexts.read().len()
    }

    pub fn is_expecting_initial(&self) -> bool {
        self.inner.expecting_initial.load(Ordering::Acquire)
    }

    /// Initial images received since the last initial request.
    pub fn initial_count(&self) -> u32 {
        self.inner.initial_images.load(Ordering::Acquire)
    }

    /// Last platform error reported by the bridge, if any.
    pub fn platform_error(&self) -> Option<PlatformError> {
        self.inner.platform_error.lock().clone()
    }

    pub fn has_wildcards(&self) -> bool {
        let core = self.inner.core.lock();
        match &core.bridge_sub {
            Some(bridge_sub) => bridge_sub.has_wildcards(),
            None => core.settings.wildcard != WildcardKind::None,
        }
    }

    /// `true` while a low-level bridge subscription exists and reports valid.
    pub fn is_valid(&self) -> bool {
        self.inner
            .core
            .lock()
            .bridge_sub
            .as_ref()
            .is_some_and(|bridge_sub| bridge_sub.is_valid())
    }

    pub fn callbacks(&self) -> Option<Arc<dyn SubscriptionCallbacks>> {
        self.inner.core.lock().callbacks.clone()
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
