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
use super::quality::{DqStrategy, SequenceDqStrategy};
use super::subject_context::{SubjectContext, SubjectContexts};
use super::types::{ServiceLevel, SubscMsgType, SubscriptionState, SubscriptionType, WildcardKind};
use super::{Settings, Subscription, COMPONENT};
use crate::bridge::{
    Bridge, EntitlementHandle, Entitlements, Publisher, Queue, Transport,
};
use crate::config::{
    CoreConfig, DICTIONARY_SYMBOL, MINIMUM_GROUP_SIZE_HINT, ROOT_DICTIONARY, ROOT_NORMAL,
};
use crate::image_request::{ImageRequest, ImageRequestOwner};
use crate::observability::events;
use crate::runtime::TimerRuntime;
use crate::status::{Status, StatusCode};
use crate::throttle::RateThrottle;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Shared services a subscription is set up against.
///
/// One environment is normally shared by every subscription on a transport,
/// so they share its default and recap throttles.
#[derive(Clone)]
pub struct SubscriptionEnv {
    pub bridge: Arc<dyn Bridge>,
    pub transport: Arc<dyn Transport>,
    pub queue: Arc<dyn Queue>,
    /// Paces subscription creation and initial-request retries.
    pub default_throttle: RateThrottle,
    /// Paces recap requests.
    pub recap_throttle: RateThrottle,
    pub runtime: TimerRuntime,
    pub dq_strategy: Arc<dyn DqStrategy>,
}

impl SubscriptionEnv {
    pub fn new(
        bridge: Arc<dyn Bridge>,
        transport: Arc<dyn Transport>,
        queue: Arc<dyn Queue>,
        config: &CoreConfig,
        runtime: TimerRuntime,
    ) -> Self {
        let transport_name = transport.name().to_string();
        let default_throttle = RateThrottle::with_list_debug(
            &format!("{transport_name}-default"),
            config.default_throttle.clone(),
            runtime.clone(),
            config.list_debug,
        );
        let recap_throttle = RateThrottle::with_list_debug(
            &format!("{transport_name}-recap"),
            config.recap_throttle.clone(),
            runtime.clone(),
            config.list_debug,
        );
        Self {
            bridge,
            transport,
            queue,
            default_throttle,
            recap_throttle,
            runtime,
            dq_strategy: Arc::new(SequenceDqStrategy),
        }
    }

    pub fn with_dq_strategy(mut self, dq_strategy: Arc<dyn DqStrategy>) -> Self {
        self.dq_strategy = dq_strategy;
        self
    }

    /// The bridge's entitlement capability, unless it is absent or deferred.
    fn local_entitlements(&self) -> Option<Arc<dyn Entitlements>> {
        self.bridge
            .entitlements()
            .filter(|entitlements| !entitlements.are_entitlements_deferred())
    }
}

impl Debug for SubscriptionEnv {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEnv")
            .field("bridge", &self.bridge.name())
            .field("transport", &self.transport.name())
            .field("default_throttle", &self.default_throttle)
            .field("recap_throttle", &self.recap_throttle)
            .finish()
    }
}

/// Arguments for a market-data subscription.
pub struct SubscriptionSetup {
    pub env: SubscriptionEnv,
    pub callbacks: Arc<dyn SubscriptionCallbacks>,
    pub source: String,
    /// May be empty for dictionary subscriptions.
    pub symbol: String,
    pub sub_type: SubscriptionType,
    pub service_level: ServiceLevel,
    pub service_level_opt: i64,
}

impl SubscriptionSetup {
    pub fn new(
        env: SubscriptionEnv,
        callbacks: Arc<dyn SubscriptionCallbacks>,
        source: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            env,
            callbacks,
            source: source.into(),
            symbol: symbol.into(),
            sub_type: SubscriptionType::Normal,
            service_level: ServiceLevel::RealTime,
            service_level_opt: 0,
        }
    }

    pub fn with_type(mut self, sub_type: SubscriptionType) -> Self {
        self.sub_type = sub_type;
        self
    }

    pub fn with_service_level(mut self, service_level: ServiceLevel, opt: i64) -> Self {
        self.service_level = service_level;
        self.service_level_opt = opt;
        self
    }
}

/// Arguments for basic and wildcard subscriptions.
pub struct BasicSetup {
    pub env: SubscriptionEnv,
    pub callbacks: Arc<dyn SubscriptionCallbacks>,
    pub source: Option<String>,
    pub symbol: Option<String>,
}

impl BasicSetup {
    pub fn new(env: SubscriptionEnv, callbacks: Arc<dyn SubscriptionCallbacks>) -> Self {
        Self {
            env,
            callbacks,
            source: None,
            symbol: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

/// Resources produced by a successful setup, installed under the lock in one step.
struct Prepared {
    settings: Settings,
    env: SubscriptionEnv,
    callbacks: Arc<dyn SubscriptionCallbacks>,
    entitlements: Option<Arc<dyn Entitlements>>,
    publisher: Option<Arc<dyn Publisher>>,
    contexts: SubjectContexts,
}

impl Subscription {
    /// Binds a market-data subscription to `source.symbol`. State becomes SETUP.
    ///
    /// With local entitlements, a subject the user may not see fails with
    /// `NotEntitled` before any bridge resource is created.
    pub fn setup(&self, setup: SubscriptionSetup) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        self.ensure_can_setup("setup")?;

        let SubscriptionSetup {
            env,
            callbacks,
            source,
            symbol,
            sub_type,
            service_level,
            service_level_opt,
        } = setup;
        if sub_type == SubscriptionType::Basic {
            return Err(Status::fail_with_code(
                StatusCode::InvalidType,
                "basic subscriptions are set up with setup_basic",
            ));
        }
        if source.is_empty() {
            return Err(Status::fail_with_code(
                StatusCode::InvalidArgument,
                "source must not be empty",
            ));
        }
        let symbol = match (symbol.is_empty(), sub_type) {
            (true, SubscriptionType::Dictionary) => DICTIONARY_SYMBOL.to_string(),
            (true, _) => {
                return Err(Status::fail_with_code(
                    StatusCode::InvalidArgument,
                    "symbol must not be empty",
                ))
            }
            (false, _) => symbol,
        };

        let mut settings = (*core.settings).clone();
        settings.sub_type = sub_type;
        settings.service_level = service_level;
        settings.service_level_opt = service_level_opt;
        settings.wildcard = WildcardKind::None;
        verify_service_level(&mut settings)?;

        let entitlements = env.local_entitlements();
        let subject = format!("{source}.{symbol}");
        let entitlement = match &entitlements {
            Some(entitlements) => Some(check_entitlement(entitlements.as_ref(), &subject, inner.id)?),
            None => None,
        };

        let wire_symbol = sub_type
            .mapped_symbol()
            .map(str::to_string)
            .unwrap_or_else(|| env.transport.map_symbol(&symbol));
        let root = match sub_type {
            SubscriptionType::Dictionary => ROOT_DICTIONARY,
            _ => ROOT_NORMAL,
        };
        if settings.group_size_hint == 0 {
            settings.group_size_hint = env.transport.group_size_hint();
        }
        settings.group_size_hint = settings.group_size_hint.max(MINIMUM_GROUP_SIZE_HINT);

        let publisher = match env.bridge.create_publisher(
            &env.transport,
            &wire_symbol,
            Some(&source),
            Some(root),
        ) {
            Ok(publisher) => publisher,
            Err(err) => {
                if let (Some(entitlements), Some(handle)) = (&entitlements, entitlement) {
                    entitlements.destroy_subscription(handle);
                }
                warn!(
                    event = events::SUBSCRIPTION_SETUP_FAILED,
                    component = COMPONENT,
                    subscription_id = inner.id,
                    symbol = %symbol,
                    err = %err,
                    "unable to create publisher"
                );
                return Err(err);
            }
        };

        let contexts = SubjectContexts::single(SubjectContext::new(
            symbol.clone(),
            subject,
            entitlement,
            settings.pre_initial_cache_size as usize,
        ));
        settings.source = Some(source);
        settings.symbol = Some(symbol);
        settings.wire_symbol = Some(wire_symbol);
        settings.root = Some(root.to_string());

        let owner: Weak<dyn ImageRequestOwner> = inner.this.clone();
        let symbol_label = settings.symbol.clone().unwrap_or_default();
        core.initial_request = Some(Arc::new(ImageRequest::new(
            owner.clone(),
            symbol_label.clone(),
            Arc::clone(&publisher),
            env.default_throttle.clone(),
            env.runtime.clone(),
        )));
        core.recap_request = Some(Arc::new(ImageRequest::new(
            owner,
            symbol_label,
            Arc::clone(&publisher),
            env.recap_throttle.clone(),
            env.runtime.clone(),
        )));

        self.install(
            &mut core,
            Prepared {
                settings,
                env,
                callbacks,
                entitlements,
                publisher: Some(publisher),
                contexts,
            },
        );
        Ok(())
    }

    /// Binds a raw topic subscription: no initial image and no sequence checking.
    pub fn setup_basic(&self, setup: BasicSetup) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        self.ensure_can_setup("setup_basic")?;

        let BasicSetup {
            env,
            callbacks,
            source,
            symbol,
        } = setup;
        let Some(topic) = symbol.filter(|topic| !topic.is_empty()) else {
            return Err(Status::fail_with_code(
                StatusCode::InvalidArgument,
                "basic subscriptions need a topic",
            ));
        };

        let entitlements = env.local_entitlements();
        let entitlement = match &entitlements {
            Some(entitlements) => Some(check_entitlement(entitlements.as_ref(), &topic, inner.id)?),
            None => None,
        };

        let mut settings = basic_settings(&core.settings);
        settings.wire_symbol = Some(env.transport.map_symbol(&topic));
        settings.source = source;
        settings.symbol = Some(topic.clone());
        let contexts = SubjectContexts::single(SubjectContext::new(topic.clone(), topic, entitlement, 0));

        self.install(
            &mut core,
            Prepared {
                settings,
                env,
                callbacks,
                entitlements,
                publisher: None,
                contexts,
            },
        );
        Ok(())
    }

    /// Binds a wildcard subscription.
    ///
    /// Without a symbol every topic on `source` is delivered; otherwise the
    /// symbol is a pattern the bridge interprets.
    pub fn setup_wildcard(&self, setup: BasicSetup) -> Result<(), Status> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        self.ensure_can_setup("setup_wildcard")?;

        let BasicSetup {
            env,
            callbacks,
            source,
            symbol,
        } = setup;
        let source = source.filter(|source| !source.is_empty());
        let symbol = symbol.filter(|symbol| !symbol.is_empty());
        let wildcard = match (&source, &symbol) {
            (None, None) => {
                return Err(Status::fail_with_code(
                    StatusCode::InvalidArgument,
                    "wildcard subscriptions need a source or a pattern",
                ))
            }
            (_, None) => WildcardKind::Transport,
            (_, Some(_)) => WildcardKind::Wildcard,
        };

        let mut settings = basic_settings(&core.settings);
        settings.wildcard = wildcard;
        settings.wire_symbol = symbol.clone();
        settings.source = source;
        settings.symbol = symbol;
        let contexts = SubjectContexts::multiple(settings.group_size_hint);

        self.install(
            &mut core,
            Prepared {
                settings,
                entitlements: env.local_entitlements(),
                env,
                callbacks,
                publisher: None,
                contexts,
            },
        );
        Ok(())
    }

    fn ensure_can_setup(&self, operation: &str) -> Result<(), Status> {
        match self.state() {
            SubscriptionState::Allocated | SubscriptionState::Destroyed => Ok(()),
            state => Err(self.reject(operation, state)),
        }
    }

    fn install(&self, core: &mut super::Core, prepared: Prepared) {
        let inner = &self.inner;
        let Prepared {
            settings,
            env,
            callbacks,
            entitlements,
            publisher,
            contexts,
        } = prepared;

        info!(
            event = events::SUBSCRIPTION_SETUP,
            component = COMPONENT,
            subscription_id = inner.id,
            source = settings.source.as_deref().unwrap_or(""),
            symbol = settings.symbol.as_deref().unwrap_or(""),
            sub_type = settings.sub_type.as_str(),
            transport = env.transport.name(),
            "subscription set up"
        );
        *inner.contexts.write() = contexts;
        *inner.platform_error.lock() = None;
        core.settings = Arc::new(settings);
        core.env = Some(env);
        core.callbacks = Some(callbacks);
        core.entitlements = entitlements;
        core.publisher = publisher;
        inner.transition(SubscriptionState::Setup);
    }
}

fn basic_settings(current: &Settings) -> Settings {
    let mut settings = current.clone();
    settings.sub_type = SubscriptionType::Basic;
    settings.service_level = ServiceLevel::RealTime;
    settings.service_level_opt = 0;
    settings.msg_type = SubscMsgType::Subscribe;
    settings.wildcard = WildcardKind::None;
    settings.requires_initial = false;
    settings.recover_gaps = false;
    settings.accept_multiple_initials = false;
    settings.root = None;
    settings
}

/// Derives the request type and image handling from type and service level.
fn verify_service_level(settings: &mut Settings) -> Result<(), Status> {
    settings.accept_multiple_initials = matches!(
        settings.sub_type,
        SubscriptionType::Group
            | SubscriptionType::SymbolList
            | SubscriptionType::SymbolListNormal
            | SubscriptionType::SymbolListGroup
            | SubscriptionType::SymbolListBook
    );
    if settings.accept_multiple_initials && settings.sub_type != SubscriptionType::Group {
        settings.recover_gaps = false;
    }

    if settings.sub_type == SubscriptionType::Dictionary {
        settings.msg_type = SubscMsgType::DictionarySnapshot;
        settings.requires_initial = true;
        settings.recover_gaps = false;
        return Ok(());
    }

    match settings.service_level {
        ServiceLevel::RealTime => {
            settings.msg_type = SubscMsgType::Subscribe;
            Ok(())
        }
        ServiceLevel::Snapshot if settings.requires_initial => {
            settings.msg_type = SubscMsgType::Snapshot;
            Ok(())
        }
        ServiceLevel::Snapshot => Err(Status::fail_with_code(
            StatusCode::InvalidArgument,
            "snapshot subscriptions require an initial image",
        )),
        ServiceLevel::Conflated => Err(Status::fail_with_code(
            StatusCode::InvalidArgument,
            "conflated service level is not supported",
        )),
    }
}

fn check_entitlement(
    entitlements: &dyn Entitlements,
    subject: &str,
    subscription_id: u64,
) -> Result<EntitlementHandle, Status> {
    let handle = entitlements.create_subscription(subject)?;
    if entitlements.is_allowed(handle, subject) {
        return Ok(handle);
    }
    entitlements.destroy_subscription(handle);
    warn!(
        event = events::SUBSCRIPTION_NOT_ENTITLED,
        component = COMPONENT,
        subscription_id,
        subject,
        "not entitled to subject"
    );
    Err(Status::fail_with_code(StatusCode::NotEntitled, subject))
}
