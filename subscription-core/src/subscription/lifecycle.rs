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

use super::callbacks::SubscriptionCallbacks;
use super::delivery::ListenerHandle;
use super::subject_context::SubjectContexts;
use super::types::{SubscMsgType, SubscriptionState, SubscriptionType, WildcardKind};
use super::{Core, Settings, Subscription, SubscriptionEnv, SubscriptionInner, COMPONENT};
use crate::bridge::{BridgeListener, BridgeSubscription, Publisher, Queue, SubscriptionRequest};
use crate::image_request::ImageRequest;
use crate::message::{Message, MsgType};
use crate::observability::events;
use crate::status::Status;
use crate::throttle::Dispatch;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl Settings {
    /// A request addressed to this subscription's topic.
    pub(crate) fn request_message(&self, msg_type: MsgType) -> Message {
        let mut msg = Message::new(msg_type).with_field("sub_type", self.sub_type.as_str());
        if let Some(source) = &self.source {
            msg = msg.with_source(source.clone());
        }
        if let Some(symbol) = &self.wire_symbol {
            msg = msg.with_issue_symbol(symbol.clone());
        }
        msg
    }

    fn initial_request_type(&self) -> MsgType {
        match self.msg_type {
            SubscMsgType::Subscribe => MsgType::InitialRequest,
            SubscMsgType::Snapshot => MsgType::SnapshotRequest,
            SubscMsgType::DictionarySnapshot => MsgType::DictionaryRequest,
        }
    }
}

impl Subscription {
    /// Starts delivery.
    ///
    /// Market-data subscriptions queue their bridge creation on the default
    /// throttle and return before it runs; basic subscriptions are created
    /// before this returns. Activating an active subscription is a no-op, and
    /// activating one that is still deactivating re-activates it once the
    /// bridge acknowledges the teardown.
    pub fn activate(&self) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let from = inner.state.load();
        match from {
            SubscriptionState::Setup | SubscriptionState::Deactivated => {}
            SubscriptionState::Activating
            | SubscriptionState::Activated
            | SubscriptionState::Reactivating => return Ok(()),
            SubscriptionState::Deactivating => {
                inner.transition(SubscriptionState::Reactivating);
                return Ok(());
            }
            _ => return Err(self.reject("activate", from)),
        }
        let Some(env) = core.env.clone() else {
            return Err(self.reject("activate", from));
        };

        inner.transition(SubscriptionState::Activating);
        core.activation_epoch += 1;
        let epoch = core.activation_epoch;
        let basic = core.settings.sub_type == SubscriptionType::Basic;
        drop(core);
        self.reset_quality();

        if basic {
            self.create_bridge_subscription(epoch);
            return Ok(());
        }

        let weak = Arc::downgrade(inner);
        let dispatched = env
            .default_throttle
            .dispatch(inner.throttle_owner, false, move || {
                if let Some(inner) = weak.upgrade() {
                    Subscription { inner }.create_bridge_subscription(epoch);
                }
            });

        match dispatched {
            Ok(Dispatch::Executed) => Ok(()),
            Ok(Dispatch::Queued(handle)) => {
                let mut core = inner.core.lock();
                if inner.state.load() == SubscriptionState::Activating
                    && core.activation_epoch == epoch
                {
                    core.pending_create = Some(handle);
                } else {
                    drop(core);
                    env.default_throttle.remove_action(handle);
                }
                Ok(())
            }
            Err(err) => {
                let core = inner.core.lock();
                if inner.state.load() == SubscriptionState::Activating
                    && core.activation_epoch == epoch
                {
                    inner.transition(from);
                }
                Err(err)
            }
        }
    }

    /// Runs on the throttle: creates the bridge subscription and requests the initial image.
    ///
    /// The bridge, transport and publisher are called without the
    /// subscription lock, so they may answer inline. A deactivate or destroy
    /// that lands meanwhile bumps the activation epoch; the freshly created
    /// bridge subscription is then discarded instead of installed.
    fn create_bridge_subscription(&self, epoch: u64) {
        let inner = &self.inner;
        let (env, callbacks, settings) = {
            let mut core = inner.core.lock();
            if !is_current_activation(inner, &core, epoch) {
                trace!(
                    component = COMPONENT,
                    subscription_id = inner.id,
                    "stale subscription create skipped"
                );
                return;
            }
            core.pending_create = None;
            let (Some(env), Some(callbacks)) = (core.env.clone(), core.callbacks.clone()) else {
                return;
            };
            (env, callbacks, Arc::clone(&core.settings))
        };

        let mut created = None;
        if settings.msg_type.needs_bridge_subscription() {
            let request = SubscriptionRequest {
                subscription_id: inner.id,
                source: settings.source.clone(),
                symbol: settings.wire_symbol.clone(),
                root: settings.root.clone(),
            };
            let listener = Arc::new(ListenerHandle::new(inner));
            let bridge_listener: Arc<dyn BridgeListener> = listener.clone();
            debug!(
                event = events::SUBSCRIPTION_BRIDGE_CREATE,
                component = COMPONENT,
                subscription_id = inner.id,
                topic = %request.topic(),
                bridge = env.bridge.name(),
                "creating bridge subscription"
            );
            let result = match settings.wildcard {
                WildcardKind::None => env.bridge.create_subscription(&request, bridge_listener),
                _ => env.bridge.create_wildcard_subscription(&request, bridge_listener),
            };
            match result {
                Ok(bridge_sub) => {
                    env.queue.increment_object_count();
                    env.transport.add_subscription_listener(inner.id);
                    created = Some((bridge_sub, listener));
                }
                Err(err) => {
                    warn!(
                        event = events::SUBSCRIPTION_BRIDGE_CREATE_FAILED,
                        component = COMPONENT,
                        subscription_id = inner.id,
                        topic = %request.topic(),
                        err = %err,
                        "unable to create bridge subscription"
                    );
                    let core = inner.core.lock();
                    if !is_current_activation(inner, &core, epoch) {
                        return;
                    }
                    if let Some(platform_error) = err.platform_error() {
                        *inner.platform_error.lock() = Some(platform_error.clone());
                    }
                    inner.transition(SubscriptionState::Deactivated);
                    drop(core);
                    callbacks.on_error(self, &err, settings.symbol.as_deref());
                    return;
                }
            }
        }

        let mut core = inner.core.lock();
        if !is_current_activation(inner, &core, epoch) {
            drop(core);
            self.discard_bridge_subscription(&env, created);
            return;
        }
        let has_wildcards = settings.wildcard != WildcardKind::None
            || created
                .as_ref()
                .is_some_and(|(bridge_sub, _)| bridge_sub.has_wildcards());
        let bridge_valid = created
            .as_ref()
            .is_some_and(|(bridge_sub, _)| bridge_sub.is_valid());
        if let Some((bridge_sub, _)) = created {
            core.bridge_sub = Some(bridge_sub);
            core.object_counted = true;
            core.listener_registered = true;
        }
        let replaced = if has_wildcards || settings.sub_type == SubscriptionType::Group {
            self.switch_to_multiple_topics(settings.group_size_hint)
        } else {
            None
        };

        inner.transition(SubscriptionState::Activated);
        inner.recap_images.store(0, Ordering::Release);

        let first_request = if settings.requires_initial {
            core.initial_request.clone().map(FirstRequest::Initial)
        } else if settings.sub_type != SubscriptionType::Basic && !has_wildcards && bridge_valid {
            core.publisher.clone().map(FirstRequest::Subscribe)
        } else {
            None
        };
        if let Some(FirstRequest::Initial(_)) = &first_request {
            inner.expecting_initial.store(true, Ordering::Release);
        }
        let entitlements = core.entitlements.clone();
        drop(core);

        if let (Some(replaced), Some(entitlements)) = (replaced, entitlements) {
            replaced.release_entitlements(entitlements.as_ref());
        }
        match first_request {
            Some(FirstRequest::Initial(request)) => {
                let msg = settings.request_message(settings.initial_request_type());
                if let Err(err) =
                    request.send_request(msg, settings.timeout, settings.retries, false, false)
                {
                    warn!(
                        component = COMPONENT,
                        subscription_id = inner.id,
                        err = %err,
                        "unable to request initial image"
                    );
                }
                // Torn down while the request was going out: nobody waits for the reply.
                let core = inner.core.lock();
                if core.activation_epoch == epoch
                    && inner.state.load() != SubscriptionState::Activated
                {
                    drop(core);
                    request.cancel_request();
                }
            }
            Some(FirstRequest::Subscribe(publisher)) => {
                let msg = settings.request_message(MsgType::SubscribeRequest);
                if let Err(err) = publisher.send(&msg) {
                    warn!(
                        component = COMPONENT,
                        subscription_id = inner.id,
                        err = %err,
                        "unable to send subscribe message"
                    );
                }
            }
            None => {}
        }

        callbacks.on_create(self);
    }

    /// Releases a bridge subscription created for an activation that was
    /// cancelled while the bridge was working.
    fn discard_bridge_subscription(
        &self,
        env: &SubscriptionEnv,
        created: Option<(Box<dyn BridgeSubscription>, Arc<ListenerHandle>)>,
    ) {
        let Some((mut bridge_sub, listener)) = created else {
            return;
        };
        debug!(
            event = events::SUBSCRIPTION_BRIDGE_DESTROY,
            component = COMPONENT,
            subscription_id = self.inner.id,
            "discarding bridge subscription of a cancelled activation"
        );
        listener.detach();
        bridge_sub.mute();
        env.transport.remove_subscription_listener(self.inner.id);
        if let Err(err) = bridge_sub.destroy() {
            warn!(
                event = events::SUBSCRIPTION_BRIDGE_DESTROY_FAILED,
                component = COMPONENT,
                subscription_id = self.inner.id,
                err = %err,
                "unable to destroy discarded bridge subscription"
            );
        }
        env.queue.decrement_object_count();
    }

    /// Stops delivery and releases the bridge subscription. The subscription
    /// stays set up and can be activated again.
    pub fn deactivate(&self) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = inner.state.load();
        match state {
            SubscriptionState::Activating => {
                self.cancel_pending_create(&mut core);
                inner.transition(SubscriptionState::Deactivated);
                Ok(())
            }
            SubscriptionState::Activated => {
                self.begin_teardown(core, SubscriptionState::Deactivating);
                Ok(())
            }
            SubscriptionState::Reactivating => {
                inner.transition(SubscriptionState::Deactivating);
                Ok(())
            }
            SubscriptionState::Allocated
            | SubscriptionState::Setup
            | SubscriptionState::Deactivating
            | SubscriptionState::Deactivated
            | SubscriptionState::Destroyed => Ok(()),
            _ => Err(self.reject("deactivate", state)),
        }
    }

    /// Tears the subscription down to DESTROYED, after which it may be set up again.
    ///
    /// `on_destroy` fires once the subscription is DESTROYED, which is
    /// immediate unless a bridge subscription has to acknowledge first.
    pub fn destroy(&self) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = inner.state.load();
        match state {
            SubscriptionState::Setup | SubscriptionState::Deactivated => {
                self.finish_destroy(core, SubscriptionState::Destroyed, None);
                Ok(())
            }
            SubscriptionState::Activating => {
                self.cancel_pending_create(&mut core);
                self.finish_destroy(core, SubscriptionState::Destroyed, None);
                Ok(())
            }
            SubscriptionState::Activated => {
                self.begin_teardown(core, SubscriptionState::Destroying);
                Ok(())
            }
            SubscriptionState::Deactivating | SubscriptionState::Reactivating => {
                inner.transition(SubscriptionState::Destroying);
                Ok(())
            }
            SubscriptionState::Destroying | SubscriptionState::Destroyed => Ok(()),
            _ => Err(self.reject("destroy", state)),
        }
    }

    /// Destroys from the application's queue instead of the calling thread.
    pub fn destroy_deferred(&self) -> Result<(), Status> {
        let queue: Option<Arc<dyn Queue>> = self
            .inner
            .core
            .lock()
            .env
            .as_ref()
            .map(|env| Arc::clone(&env.queue));
        let Some(queue) = queue else {
            return Err(self.reject("destroy_deferred", self.state()));
        };
        let subscription = self.clone();
        queue.enqueue_event(Box::new(move || {
            if let Err(err) = subscription.destroy() {
                warn!(
                    component = COMPONENT,
                    subscription_id = subscription.id(),
                    err = %err,
                    "deferred destroy failed"
                );
            }
        }))
    }

    /// Releases the subscription for good.
    ///
    /// While a destroy is still waiting for the bridge, the subscription
    /// becomes DEALLOCATED when that acknowledgement arrives.
    pub fn deallocate(&self) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = inner.state.load();
        match state {
            SubscriptionState::Destroying => {
                inner.transition(SubscriptionState::Deallocating);
                Ok(())
            }
            SubscriptionState::Allocated | SubscriptionState::Destroyed => {
                let _ = self.release_resources(&mut core);
                inner.transition(SubscriptionState::Deallocated);
                Ok(())
            }
            _ => Err(self.reject("deallocate", state)),
        }
    }

    /// Bridge acknowledgement that the low-level subscription is gone.
    pub fn on_subscription_destroyed(&self) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = inner.state.load();
        debug!(
            event = events::SUBSCRIPTION_DESTROYED_CALLBACK,
            component = COMPONENT,
            subscription_id = inner.id,
            state = state.as_str(),
            "bridge subscription destroyed"
        );

        match state {
            SubscriptionState::Deactivating => {
                let counted = take_object_count(&mut core);
                inner.transition(SubscriptionState::Deactivated);
                drop(core);
                release_object_count(counted);
            }
            SubscriptionState::Reactivating => {
                let counted = take_object_count(&mut core);
                inner.transition(SubscriptionState::Deactivated);
                drop(core);
                release_object_count(counted);
                if let Err(err) = self.activate() {
                    warn!(
                        component = COMPONENT,
                        subscription_id = inner.id,
                        err = %err,
                        "re-activation failed"
                    );
                }
            }
            SubscriptionState::Destroying => {
                let counted = take_object_count(&mut core);
                self.finish_destroy(core, SubscriptionState::Destroyed, counted);
            }
            SubscriptionState::Deallocating => {
                let counted = take_object_count(&mut core);
                self.finish_destroy(core, SubscriptionState::Deallocated, counted);
            }
            SubscriptionState::Allocated => {}
            _ => {
                warn!(
                    event = events::SUBSCRIPTION_INVALID_STATE,
                    component = COMPONENT,
                    subscription_id = inner.id,
                    state = state.as_str(),
                    "bridge destroy acknowledged in an unexpected state"
                );
                let callbacks = core.callbacks.clone();
                let symbol = core.settings.symbol.clone();
                drop(core);
                if let Some(callbacks) = callbacks {
                    callbacks.on_error(
                        self,
                        &Status::invalid_state("on_subscription_destroyed", state),
                        symbol.as_deref(),
                    );
                }
            }
        }
    }

    /// Switches to one subject context per issue symbol.
    ///
    /// The single context's entitlement subscription is released; members
    /// get their own as their messages arrive.
    pub fn configure_for_multiple_topics(&self, size_hint: u32) {
        let entitlements = self.inner.core.lock().entitlements.clone();
        let replaced = self.switch_to_multiple_topics(size_hint);
        if let (Some(replaced), Some(entitlements)) = (replaced, entitlements) {
            replaced.release_entitlements(entitlements.as_ref());
        }
    }

    /// Returns the replaced single context, whose entitlement the caller releases.
    fn switch_to_multiple_topics(&self, size_hint: u32) -> Option<SubjectContexts> {
        let mut contexts = self.inner.contexts.write();
        if contexts.is_multiple() {
            return None;
        }
        Some(std::mem::replace(
            &mut *contexts,
            SubjectContexts::multiple(size_hint),
        ))
    }

    fn reset_quality(&self) {
        for context in self.inner.contexts.read().all() {
            context.dq.lock().reset();
        }
    }

    fn cancel_pending_create(&self, core: &mut Core) {
        core.activation_epoch += 1;
        let (Some(handle), Some(env)) = (core.pending_create.take(), core.env.as_ref()) else {
            return;
        };
        let mut guard = env.default_throttle.lock();
        guard.remove_action(handle);
    }

    /// Mutes and releases the bridge subscription, moving to `target`.
    fn begin_teardown(&self, mut core: MutexGuard<'_, Core>, target: SubscriptionState) {
        let inner = &self.inner;
        inner.transition(target);
        for request in [&core.initial_request, &core.recap_request]
            .into_iter()
            .flatten()
        {
            request.cancel_request();
        }
        inner.expecting_initial.store(false, Ordering::Release);
        if let Some(bridge_sub) = core.bridge_sub.as_mut() {
            bridge_sub.mute();
        }
        if core.listener_registered {
            if let Some(env) = &core.env {
                env.transport.remove_subscription_listener(inner.id);
            }
            core.listener_registered = false;
        }
        let bridge_sub = core.bridge_sub.take();
        drop(core);

        let Some(bridge_sub) = bridge_sub else {
            self.on_subscription_destroyed();
            return;
        };
        debug!(
            event = events::SUBSCRIPTION_BRIDGE_DESTROY,
            component = COMPONENT,
            subscription_id = inner.id,
            "destroying bridge subscription"
        );
        if let Err(err) = bridge_sub.destroy() {
            warn!(
                event = events::SUBSCRIPTION_BRIDGE_DESTROY_FAILED,
                component = COMPONENT,
                subscription_id = inner.id,
                err = %err,
                "bridge subscription destroy failed; completing locally"
            );
            self.on_subscription_destroyed();
        }
    }

    fn finish_destroy(
        &self,
        mut core: MutexGuard<'_, Core>,
        terminal: SubscriptionState,
        counted: Option<Arc<dyn Queue>>,
    ) {
        let callbacks = self.release_resources(&mut core);
        self.inner.transition(terminal);
        drop(core);
        release_object_count(counted);
        if let Some(callbacks) = callbacks {
            callbacks.on_destroy(self);
        }
    }

    /// Drops everything acquired at setup and returns the callbacks for a final `on_destroy`.
    fn release_resources(&self, core: &mut Core) -> Option<Arc<dyn SubscriptionCallbacks>> {
        let inner = &self.inner;
        core.activation_epoch += 1;
        core.pending_create = None;
        for request in [core.initial_request.take(), core.recap_request.take()]
            .into_iter()
            .flatten()
        {
            request.destroy();
        }
        inner.expecting_initial.store(false, Ordering::Release);
        if let Some(env) = &core.env {
            env.default_throttle
                .remove_messages_for_owner(inner.throttle_owner);
        }
        let contexts = std::mem::take(&mut *inner.contexts.write());
        if let Some(entitlements) = core.entitlements.take() {
            contexts.release_entitlements(entitlements.as_ref());
        }
        core.publisher = None;
        core.bridge_sub = None;
        core.env = None;
        core.callbacks.take()
    }

    pub(crate) fn reject(&self, operation: &str, state: SubscriptionState) -> Status {
        warn!(
            event = events::SUBSCRIPTION_INVALID_STATE,
            component = COMPONENT,
            subscription_id = self.inner.id,
            operation,
            state = state.as_str(),
            "operation not permitted in current state"
        );
        Status::invalid_state(operation, state)
    }
}

/// The first message sent once the bridge subscription exists.
enum FirstRequest {
    Initial(Arc<ImageRequest>),
    Subscribe(Arc<dyn Publisher>),
}

fn is_current_activation(inner: &SubscriptionInner, core: &Core, epoch: u64) -> bool {
    inner.state.load() == SubscriptionState::Activating && core.activation_epoch == epoch
}

fn take_object_count(core: &mut Core) -> Option<Arc<dyn Queue>> {
    if !core.object_counted {
        return None;
    }
    core.object_counted = false;
    core.env.as_ref().map(|env| Arc::clone(&env.queue))
}

fn release_object_count(queue: Option<Arc<dyn Queue>>) {
    if let Some(queue) = queue {
        queue.decrement_object_count();
    }
}
