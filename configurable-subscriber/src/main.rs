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

mod config;

use crate::config::{Config, SubscriptionConfig, SubscriptionKind};
use clap::Parser;
use loopback_bridge::{LoopbackBridge, LoopbackQueue, LoopbackTransport};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscription_core::{
    BasicSetup, ItemClosure, Message, MsgType, Quality, Status, StatusCode, Subscription,
    SubscriptionCallbacks, SubscriptionEnv, SubscriptionSetup, SubscriptionState, TimerRuntime,
};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TEARDOWN_POLL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command()]
struct SubscriberArgs {
    #[arg(short, long, value_name = "FILE")]
    config: String,

    /// Print the run summary as one JSON line on stdout.
    #[arg(long)]
    json_summary: bool,
}

#[derive(Serialize, Debug)]
struct RunSummary {
    opened: usize,
    messages: u64,
    errors: u64,
    gaps: u64,
    creates: u64,
    wildcard_creates: u64,
    destroys: u64,
    inbox_sends: u64,
    outstanding_objects: i64,
}

/// Logs every callback and keeps totals for the exit summary.
#[derive(Default)]
struct LoggingCallbacks {
    messages: AtomicU64,
    errors: AtomicU64,
    gaps: AtomicU64,
}

impl SubscriptionCallbacks for LoggingCallbacks {
    fn on_create(&self, subscription: &Subscription) {
        info!(
            subscription_id = subscription.id(),
            symbol = subscription.symbol().as_deref().unwrap_or(""),
            "subscription created"
        );
    }

    fn on_error(&self, subscription: &Subscription, status: &Status, subject: Option<&str>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription_id = subscription.id(),
            subject = subject.unwrap_or(""),
            code = status.code().as_str(),
            err = %status,
            "subscription error"
        );
    }

    fn on_msg(&self, subscription: &Subscription, msg: &Message, _item_closure: Option<&ItemClosure>) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        info!(
            subscription_id = subscription.id(),
            msg_type = msg.msg_type().as_str(),
            symbol = msg.issue_symbol().unwrap_or(""),
            seq_num = ?msg.seq_num(),
            last = msg.field("LAST").unwrap_or(""),
            "message"
        );
    }

    fn on_wildcard_msg(
        &self,
        subscription: &Subscription,
        msg: &Message,
        topic: &str,
        _item_closure: Option<&ItemClosure>,
    ) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        info!(
            subscription_id = subscription.id(),
            topic,
            msg_type = msg.msg_type().as_str(),
            "wildcard message"
        );
    }

    fn on_quality(&self, subscription: &Subscription, quality: Quality, symbol: Option<&str>) {
        info!(
            subscription_id = subscription.id(),
            symbol = symbol.unwrap_or(""),
            ?quality,
            "quality changed"
        );
    }

    fn on_gap(&self, subscription: &Subscription, symbol: Option<&str>) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription_id = subscription.id(),
            symbol = symbol.unwrap_or(""),
            "sequence gap"
        );
    }

    fn on_recap_request(&self, subscription: &Subscription, symbol: Option<&str>) {
        debug!(
            subscription_id = subscription.id(),
            symbol = symbol.unwrap_or(""),
            "recap requested"
        );
    }

    fn on_destroy(&self, subscription: &Subscription) {
        info!(subscription_id = subscription.id(), "subscription destroyed");
    }
}

fn open_subscription(
    env: &SubscriptionEnv,
    callbacks: &Arc<LoggingCallbacks>,
    config: &SubscriptionConfig,
) -> Result<Subscription, Status> {
    let callbacks: Arc<dyn SubscriptionCallbacks> = callbacks.clone();
    let subscription = Subscription::allocate();
    if let Some(timeout_secs) = config.timeout_secs {
        subscription.set_timeout(Duration::from_secs(timeout_secs));
    }
    if let Some(retries) = config.retries {
        subscription.set_retries(retries);
    }
    if let Some(requires_initial) = config.requires_initial {
        subscription.set_requires_initial(requires_initial);
    }

    let setup = match config.kind.market_data_type() {
        Some(sub_type) => subscription.setup(
            SubscriptionSetup::new(env.clone(), callbacks, &config.source, &config.symbol)
                .with_type(sub_type)
                .with_service_level(config.service_level.into(), 0),
        ),
        None => {
            let mut basic = BasicSetup::new(env.clone(), callbacks);
            if !config.source.is_empty() {
                basic = basic.with_source(&config.source);
            }
            if !config.symbol.is_empty() {
                basic = basic.with_symbol(&config.symbol);
            }
            if config.kind == SubscriptionKind::Wildcard {
                subscription.setup_wildcard(basic)
            } else {
                subscription.setup_basic(basic)
            }
        }
    };
    if let Err(err) = setup {
        let _ = subscription.deallocate();
        return Err(err);
    }
    subscription.activate()?;
    Ok(subscription)
}

/// Publishes a synthetic trade on every configured market-data symbol.
async fn publish_until(
    bridge: &LoopbackBridge,
    subscriptions: &[SubscriptionConfig],
    interval: Duration,
    deadline: Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut tick: u64 = 0;
    while Instant::now() < deadline {
        ticker.tick().await;
        tick += 1;
        for config in subscriptions {
            let update = Message::new(MsgType::Update)
                .with_field("LAST", format!("{}.{:02}", 100 + tick % 50, tick % 100));
            let routed = match config.kind {
                SubscriptionKind::Basic => bridge.publish_topic(&config.symbol, update),
                SubscriptionKind::Wildcard => continue,
                _ => bridge.publish(&config.source, &config.symbol, update),
            };
            debug!(topic = %config.symbol, routed, "synthetic update published");
        }
    }
}

/// Destroys every subscription and waits, bounded, for the bridge to acknowledge.
async fn tear_down(subscriptions: &[Subscription], limit: Duration) {
    for subscription in subscriptions {
        if let Err(err) = subscription.destroy() {
            warn!(subscription_id = subscription.id(), err = %err, "destroy failed");
        }
    }

    let deadline = Instant::now() + limit;
    while subscriptions
        .iter()
        .any(|subscription| subscription.state() != SubscriptionState::Destroyed)
    {
        if Instant::now() >= deadline {
            warn!("teardown timed out waiting for bridge acknowledgements");
            break;
        }
        tokio::time::sleep(TEARDOWN_POLL).await;
    }

    for subscription in subscriptions {
        if let Err(err) = subscription.deallocate() {
            warn!(
                subscription_id = subscription.id(),
                state = subscription.state_name(),
                err = %err,
                "deallocate failed"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Status> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    info!("Started configurable-subscriber");

    let args = SubscriberArgs::parse();
    let mut file = File::open(&args.config).map_err(|e| {
        Status::fail_with_code(StatusCode::NotFound, format!("File not found: {e:?}"))
    })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(|e| {
        Status::fail_with_code(
            StatusCode::InvalidArgument,
            format!("Unable to read config file: {e:?}"),
        )
    })?;
    let config = Config::from_json5_str(&contents)?;

    let handle = Handle::current();
    let bridge = LoopbackBridge::new(&config.bridge.name, handle.clone());
    bridge.set_image_replies(config.bridge.answer_image_requests);
    bridge.set_images_per_request(config.bridge.images_per_request);
    let entitlements = bridge.loopback_entitlements();
    for subject in &config.bridge.denied_subjects {
        entitlements.deny(subject.clone());
    }

    let transport = Arc::new(LoopbackTransport::new(&format!("{}-tport", config.bridge.name)));
    let queue = Arc::new(LoopbackQueue::new(handle));
    let env = SubscriptionEnv::new(
        Arc::new(bridge.clone()),
        transport,
        queue.clone(),
        &config.core,
        TimerRuntime::current()?,
    );

    let callbacks = Arc::new(LoggingCallbacks::default());
    let mut subscriptions = Vec::with_capacity(config.subscriptions.len());
    for subscription_config in &config.subscriptions {
        match open_subscription(&env, &callbacks, subscription_config) {
            Ok(subscription) => subscriptions.push(subscription),
            Err(err) => warn!(
                source = %subscription_config.source,
                symbol = %subscription_config.symbol,
                err = %err,
                "unable to open subscription"
            ),
        }
    }
    info!(
        opened = subscriptions.len(),
        configured = config.subscriptions.len(),
        "subscriptions opened"
    );

    let deadline = Instant::now() + config.run.duration();
    match config.run.publish_interval() {
        Some(interval) => publish_until(&bridge, &config.subscriptions, interval, deadline).await,
        None => tokio::time::sleep_until(deadline).await,
    }

    tear_down(&subscriptions, config.run.teardown()).await;
    env.default_throttle.destroy();
    env.recap_throttle.destroy();

    let stats = bridge.stats();
    let summary = RunSummary {
        opened: subscriptions.len(),
        messages: callbacks.messages.load(Ordering::Relaxed),
        errors: callbacks.errors.load(Ordering::Relaxed),
        gaps: callbacks.gaps.load(Ordering::Relaxed),
        creates: stats.creates,
        wildcard_creates: stats.wildcard_creates,
        destroys: stats.destroys,
        inbox_sends: stats.inbox_sends,
        outstanding_objects: queue.object_count(),
    };
    info!(?summary, "configurable-subscriber finished");
    if args.json_summary {
        let line = serde_json::to_string(&summary).map_err(|e| {
            Status::fail_with_code(
                StatusCode::InvalidArgument,
                format!("Unable to serialize summary: {e:?}"),
            )
        })?;
        println!("{line}");
    }
    Ok(())
}
