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

//! Inbound message path: bridge and image-request replies to application callbacks.

use super::callbacks::SubscriptionCallbacks;
use super::quality::{DqStrategy, DqVerdict};
use super::subject_context::{SubjectContext, SubjectContexts};
use super::types::{Quality, SubscriptionState, SubscriptionType, WildcardKind};
use super::{Settings, Subscription, SubscriptionInner, COMPONENT};
use crate::bridge::{BridgeListener, Entitlements};
use crate::image_request::{ImageRequest, ImageRequestOwner};
use crate::message::{Message, MsgType};
use crate::observability::{events, fields};
use crate::status::{Status, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn, Level};

/// Listener registered with each bridge subscription.
///
/// Holds the subscription weakly; callbacks for a dropped subscription, or
/// for a bridge subscription that was abandoned mid-create, are ignored.
pub(crate) struct ListenerHandle {
    inner: Weak<SubscriptionInner>,
    detached: AtomicBool,
}

impl ListenerHandle {
    pub(crate) fn new(inner: &Arc<SubscriptionInner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn subscription(&self) -> Option<Subscription> {
        if self.detached.load(Ordering::Acquire) {
            return None;
        }
        self.inner.upgrade().map(|inner| Subscription { inner })
    }
}

impl BridgeListener for ListenerHandle {
    fn on_message(&self, msg: Message) {
        let Some(subscription) = self.subscription() else {
            return;
        };
        if let Err(err) = subscription.process_msg(msg) {
            trace!(
                component = COMPONENT,
                subscription_id = subscription.id(),
                err = %err,
                "bridge message not delivered"
            );
        }
    }

    fn on_wildcard_message(&self, msg: Message, topic: &str) {
        let Some(subscription) = self.subscription() else {
            return;
        };
        if let Err(err) = subscription.process_wildcard_msg(msg, topic) {
            trace!(
                component = COMPONENT,
                subscription_id = subscription.id(),
                topic,
                err = %err,
                "bridge wildcard message not delivered"
            );
        }
    }

    fn on_platform_error(&self, status: Status, deactivate: bool) {
        if let Some(subscription) = self.subscription() {
            subscription.process_error(status, deactivate);
        }
    }

    fn on_destroyed(&self) {
        if let Some(subscription) = self.subscription() {
            subscription.on_subscription_destroyed();
        }
    }
}

/// Snapshot of what the message path needs, taken under the lock and used without it.
struct DeliveryView {
    settings: Arc<Settings>,
    callbacks: Arc<dyn SubscriptionCallbacks>,
    entitlements: Option<Arc<dyn Entitlements>>,
    dq_strategy: Arc<dyn DqStrategy>,
    initial_request: Option<Arc<ImageRequest>>,
    recap_request: Option<Arc<ImageRequest>>,
}

impl Subscription {
    fn delivery_view(&self) -> Option<DeliveryView> {
        let core = self.inner.core.lock();
        Some(DeliveryView {
            settings: Arc::clone(&core.settings),
            callbacks: core.callbacks.clone()?,
            entitlements: core.entitlements.clone(),
            dq_strategy: Arc::clone(&core.env.as_ref()?.dq_strategy),
            initial_request: core.initial_request.clone(),
            recap_request: core.recap_request.clone(),
        })
    }

    /// Delivers one inbound message.
    ///
    /// Runs the qualifier filter, the entitlement check, initial-image
    /// bookkeeping and the data-quality strategy, then calls `on_msg`.
    /// Messages for a subscription that is not ACTIVATED are rejected.
    pub fn process_msg(&self, msg: Message) -> Result<(), Status> {
        let state = self.state();
        if state != SubscriptionState::Activated {
            return Err(Status::invalid_state("process_msg", state));
        }
        let view = self
            .delivery_view()
            .ok_or_else(|| Status::invalid_state("process_msg", state))?;
        let context = self.subject_context_for(&view, msg.issue_symbol())?;
        self.log_received(&view, &msg);

        if view.settings.sub_type != SubscriptionType::Basic {
            let mask = view.settings.qualifier_filter.mask();
            if !mask.is_empty() && msg.qualifier().is_some_and(|q| q.intersects(mask)) {
                trace!(
                    event = events::SUBSCRIPTION_MSG_FILTERED,
                    component = COMPONENT,
                    subscription_id = self.id(),
                    issue_symbol = %fields::format_issue_symbol(&msg),
                    "message discarded by qualifier filter"
                );
                return Ok(());
            }
        }

        if !is_entitled(&view, &context, &msg) {
            self.report_not_entitled(&view, &context);
            return Ok(());
        }

        let closure = context.item_closure();
        if view.settings.sub_type == SubscriptionType::Basic {
            view.callbacks.on_msg(self, &msg, closure.as_ref());
            return Ok(());
        }

        let msg_type = msg.msg_type();
        let awaiting_initial = self.is_expecting_initial();
        if msg_type.is_initial() {
            self.inner.initial_images.fetch_add(1, Ordering::AcqRel);
            if !view.settings.accept_multiple_initials {
                if let Some(request) = &view.initial_request {
                    request.stop_wait_for_response();
                }
            }
        } else if msg_type.is_recap() {
            self.inner.recap_images.fetch_add(1, Ordering::AcqRel);
            if let Some(request) = &view.recap_request {
                if request.is_waiting_for_response() {
                    request.stop_wait_for_response();
                }
            }
        }

        let verdict = if view.settings.recover_gaps || awaiting_initial {
            let mut dq = context.dq.lock();
            view.dq_strategy.check(&mut dq, &msg, awaiting_initial)
        } else {
            DqVerdict::Deliver
        };

        let symbol = Some(context.symbol());
        match verdict {
            DqVerdict::Deliver => view.callbacks.on_msg(self, &msg, closure.as_ref()),
            DqVerdict::Suppress => trace!(
                component = COMPONENT,
                subscription_id = self.id(),
                seq_num = ?msg.seq_num(),
                "duplicate or uncacheable update suppressed"
            ),
            DqVerdict::Cached => trace!(
                component = COMPONENT,
                subscription_id = self.id(),
                seq_num = ?msg.seq_num(),
                "update cached until initial arrives"
            ),
            DqVerdict::Gap {
                expected,
                received,
                newly_stale,
            } => {
                debug!(
                    component = COMPONENT,
                    subscription_id = self.id(),
                    symbol = context.symbol(),
                    expected,
                    received,
                    "sequence gap"
                );
                view.callbacks.on_gap(self, symbol);
                if newly_stale {
                    if view.settings.recover_gaps {
                        self.send_recap(&view, &context);
                    }
                    view.callbacks.on_quality(self, Quality::Stale, symbol);
                }
                view.callbacks.on_msg(self, &msg, closure.as_ref());
            }
            DqVerdict::Image { replay, recovered } => {
                view.callbacks.on_msg(self, &msg, closure.as_ref());
                for cached in &replay {
                    view.callbacks.on_msg(self, cached, closure.as_ref());
                }
                if recovered {
                    view.callbacks.on_quality(self, Quality::Ok, symbol);
                }
            }
        }

        if msg_type.is_initial()
            && !view.settings.service_level.expects_updates()
            && !view.settings.accept_multiple_initials
            && self.state() == SubscriptionState::Activated
        {
            self.deactivate()?;
        }
        Ok(())
    }

    /// Delivers a message received on a wildcard subscription for `topic`.
    pub fn process_wildcard_msg(&self, msg: Message, topic: &str) -> Result<(), Status> {
        let state = self.state();
        if state != SubscriptionState::Activated {
            return Err(Status::invalid_state("process_wildcard_msg", state));
        }
        let view = self
            .delivery_view()
            .ok_or_else(|| Status::invalid_state("process_wildcard_msg", state))?;
        let context = self.subject_context_for(&view, Some(topic))?;
        self.log_received(&view, &msg);

        if !is_entitled(&view, &context, &msg) {
            self.report_not_entitled(&view, &context);
            return Ok(());
        }
        view.callbacks
            .on_wildcard_msg(self, &msg, topic, context.item_closure().as_ref());
        Ok(())
    }

    /// Handles a bridge-reported failure, tearing down first when `deactivate` is set.
    pub fn process_error(&self, status: Status, deactivate: bool) {
        if let Some(platform_error) = status.platform_error() {
            *self.inner.platform_error.lock() = Some(platform_error.clone());
        }
        let (callbacks, symbol) = {
            let core = self.inner.core.lock();
            (core.callbacks.clone(), core.settings.symbol.clone())
        };
        warn!(
            component = COMPONENT,
            subscription_id = self.id(),
            err = %status,
            deactivate,
            "bridge reported an error"
        );
        if deactivate {
            if let Err(err) = self.deactivate() {
                warn!(
                    component = COMPONENT,
                    subscription_id = self.id(),
                    err = %err,
                    "unable to deactivate after bridge error"
                );
            }
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_error(self, &status, symbol.as_deref());
        }
    }

    /// Asks the publisher for a fresh image of this subscription's symbol.
    ///
    /// Groups recover per symbol on gaps and return `NotImplemented` here.
    pub fn request_recap(&self) -> Result<(), Status> {
        let state = self.state();
        let view = self
            .delivery_view()
            .ok_or_else(|| self.reject("request_recap", state))?;
        match view.settings.sub_type {
            SubscriptionType::Group => {
                return Err(Status::fail_with_code(
                    StatusCode::NotImplemented,
                    "recaps are requested per symbol for group subscriptions",
                ))
            }
            SubscriptionType::Basic => {
                return Err(Status::fail_with_code(
                    StatusCode::InvalidType,
                    "basic subscriptions have no recaps",
                ))
            }
            _ => {}
        }
        if state != SubscriptionState::Activated {
            return Err(self.reject("request_recap", state));
        }
        let Some(request) = &view.recap_request else {
            return Err(self.reject("request_recap", state));
        };

        let msg = view.settings.request_message(MsgType::RecapRequest);
        request.send_request(
            msg,
            view.settings.recap_timeout,
            view.settings.retries,
            true,
            true,
        )?;
        view.callbacks
            .on_recap_request(self, view.settings.symbol.as_deref());
        Ok(())
    }

    /// Marks every context whose quality is OK as possibly stale.
    pub fn set_possibly_stale(&self) {
        let Some(callbacks) = self.callbacks() else {
            return;
        };
        let contexts = self.inner.contexts.read().all();
        for context in contexts {
            let changed = {
                let mut dq = context.dq.lock();
                if dq.quality() == Quality::Ok {
                    dq.set_quality(Quality::MaybeStale);
                    true
                } else {
                    false
                }
            };
            if changed {
                callbacks.on_quality(self, Quality::MaybeStale, Some(context.symbol()));
            }
        }
    }

    fn send_recap(&self, view: &DeliveryView, context: &SubjectContext) {
        let Some(request) = &view.recap_request else {
            return;
        };
        if request.is_waiting_for_response() {
            return;
        }
        let mut msg = view.settings.request_message(MsgType::RecapRequest);
        if view.settings.sub_type == SubscriptionType::Group {
            msg = msg.with_issue_symbol(context.symbol().to_string());
        }
        match request.send_request(
            msg,
            view.settings.recap_timeout,
            view.settings.retries,
            true,
            true,
        ) {
            Ok(()) => view.callbacks.on_recap_request(self, Some(context.symbol())),
            Err(err) => warn!(
                component = COMPONENT,
                subscription_id = self.id(),
                symbol = context.symbol(),
                err = %err,
                "unable to request recap"
            ),
        }
    }

    /// The context a message belongs to, created on first sight for multi-topic subscriptions.
    fn subject_context_for(
        &self,
        view: &DeliveryView,
        symbol: Option<&str>,
    ) -> Result<Arc<SubjectContext>, Status> {
        let existing = self.inner.contexts.read().get(symbol);
        if let Some(context) = existing {
            return Ok(context);
        }
        let Some(symbol) = symbol else {
            return Err(Status::fail_with_code(
                StatusCode::InvalidArgument,
                "message carries no issue symbol",
            ));
        };

        let mut contexts = self.inner.contexts.write();
        if let Some(context) = contexts.get(Some(symbol)) {
            return Ok(context);
        }
        let subject = match &view.settings.source {
            Some(source) => format!("{source}.{symbol}"),
            None => symbol.to_string(),
        };
        let entitlement = match &view.entitlements {
            Some(entitlements) if view.settings.wildcard == WildcardKind::None => {
                Some(entitlements.create_subscription(&subject)?)
            }
            _ => None,
        };
        debug!(
            event = events::SUBSCRIPTION_CONTEXT_CREATE,
            component = COMPONENT,
            subscription_id = self.id(),
            symbol,
            subject = %subject,
            "subject context created"
        );
        Ok(contexts.insert(SubjectContext::new(
            symbol,
            subject,
            entitlement,
            view.settings.pre_initial_cache_size as usize,
        )))
    }

    fn log_received(&self, view: &DeliveryView, msg: &Message) {
        if view.settings.debug_level == Level::TRACE {
            debug!(
                event = events::SUBSCRIPTION_MSG_RECEIVED,
                component = COMPONENT,
                subscription_id = self.id(),
                msg_type = fields::format_message_type(msg),
                issue_symbol = %fields::format_issue_symbol(msg),
                "message received"
            );
        } else {
            trace!(
                event = events::SUBSCRIPTION_MSG_RECEIVED,
                component = COMPONENT,
                subscription_id = self.id(),
                msg_type = fields::format_message_type(msg),
                issue_symbol = %fields::format_issue_symbol(msg),
                "message received"
            );
        }
    }

    fn report_not_entitled(&self, view: &DeliveryView, context: &SubjectContext) {
        debug!(
            event = events::SUBSCRIPTION_NOT_ENTITLED,
            component = COMPONENT,
            subscription_id = self.id(),
            subject = context.subject(),
            "message for a subject the user is not entitled to"
        );
        view.callbacks.on_error(
            self,
            &Status::fail_with_code(StatusCode::NotEntitled, context.subject()),
            Some(context.symbol()),
        );
    }

    /// Delivers updates that were held for an image that is no longer expected.
    ///
    /// Group members that never received an image of their own, and
    /// subscriptions whose initial request timed out, would otherwise keep
    /// them cached until the next activation.
    fn release_cached_updates(&self, view: &DeliveryView) {
        let contexts = self.inner.contexts.read().all();
        for context in contexts {
            let released = context.dq.lock().release_pre_initial();
            if released.is_empty() {
                continue;
            }
            debug!(
                component = COMPONENT,
                subscription_id = self.id(),
                symbol = context.symbol(),
                released = released.len(),
                "releasing updates cached ahead of an image that did not arrive"
            );
            let closure = context.item_closure();
            for msg in &released {
                if self.state() != SubscriptionState::Activated {
                    return;
                }
                view.callbacks.on_msg(self, msg, closure.as_ref());
            }
        }
    }

    /// The reply timer ran out after images arrived.
    fn complete_image_request(&self, is_recap: bool) {
        if is_recap || self.state() != SubscriptionState::Activated {
            return;
        }
        let Some(view) = self.delivery_view() else {
            return;
        };
        self.release_cached_updates(&view);
        if self.state() != SubscriptionState::Activated {
            return;
        }
        let mut msg = Message::new(MsgType::EndOfInitials);
        if let Some(source) = &view.settings.source {
            msg = msg.with_source(source.clone());
        }
        if let Some(symbol) = &view.settings.symbol {
            msg = msg.with_issue_symbol(symbol.clone());
        }
        view.callbacks.on_msg(self, &msg, None);

        if !view.settings.service_level.expects_updates()
            && self.state() == SubscriptionState::Activated
        {
            if let Err(err) = self.deactivate() {
                warn!(
                    component = COMPONENT,
                    subscription_id = self.id(),
                    err = %err,
                    "unable to deactivate completed snapshot"
                );
            }
        }
    }

    /// Every attempt timed out. The subscription stays active.
    fn image_request_timed_out(&self, is_recap: bool) {
        let Some(view) = self.delivery_view() else {
            return;
        };
        if !is_recap {
            if let SubjectContexts::Single(context) = &*self.inner.contexts.read() {
                context.dq.lock().set_quality(Quality::Stale);
            }
            if self.state() == SubscriptionState::Activated {
                self.release_cached_updates(&view);
            }
        }
        let status = Status::fail_with_code(
            StatusCode::Timeout,
            if is_recap {
                "timed out waiting for recap"
            } else {
                "timed out waiting for initial value"
            },
        );
        view.callbacks
            .on_error(self, &status, view.settings.symbol.as_deref());
    }
}

fn is_entitled(view: &DeliveryView, context: &SubjectContext, msg: &Message) -> bool {
    if msg.entitle_code() != 0 {
        return false;
    }
    match (&view.entitlements, context.entitlement()) {
        (Some(entitlements), Some(handle)) => entitlements.is_allowed(handle, context.subject()),
        _ => true,
    }
}

impl ImageRequestOwner for SubscriptionInner {
    fn accepts_replies(&self) -> bool {
        self.state.load() == SubscriptionState::Activated
    }

    fn on_image_reply(&self, msg: Message) {
        let Some(subscription) = self.handle() else {
            return;
        };
        if let Err(err) = subscription.process_msg(msg) {
            trace!(
                component = COMPONENT,
                subscription_id = self.id,
                err = %err,
                "image reply not delivered"
            );
        }
    }

    fn received_images(&self, is_recap: bool) -> u32 {
        if is_recap {
            self.recap_images.load(Ordering::Acquire)
        } else {
            self.initial_images.load(Ordering::Acquire)
        }
    }

    fn reset_received_images(&self, is_recap: bool) {
        if is_recap {
            self.recap_images.store(0, Ordering::Release);
        } else {
            self.initial_images.store(0, Ordering::Release);
        }
    }

    fn on_request_complete(&self, is_recap: bool) {
        if let Some(subscription) = self.handle() {
            subscription.complete_image_request(is_recap);
        }
    }

    fn on_request_timeout(&self, is_recap: bool) {
        if let Some(subscription) = self.handle() {
            subscription.image_request_timed_out(is_recap);
        }
    }

    fn set_expecting_initial(&self, expecting: bool) {
        self.expecting_initial.store(expecting, Ordering::Release);
    }
}
