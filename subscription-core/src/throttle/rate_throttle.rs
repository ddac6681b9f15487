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

//! Rate throttle with a lazily created tick task.

use crate::collections::{ElementHandle, IntrusiveList, ListGuard, ListOptions};
use crate::config::ThrottleConfig;
use crate::observability::{events, fields::WorkerContext};
use crate::runtime::TimerRuntime;
use crate::status::{Status, StatusCode};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, Level};

const COMPONENT: &str = "rate_throttle";
const SLOW_RATE_THRESHOLD: f64 = 10.0;
const SLOW_RATE_INTERVAL: Duration = Duration::from_secs(1);

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity used to cancel every queued action of one owner at once.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ThrottleOwner(u64);

impl ThrottleOwner {
    pub fn next() -> Self {
        ThrottleOwner(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Handle to one queued action, valid until the action runs or is removed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ActionHandle(ElementHandle);

/// Outcome of [`RateThrottle::dispatch`].
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// The throttle is disabled and the action already ran on the caller's thread.
    Executed,
    /// The action will run on a later tick unless cancelled through the handle.
    Queued(ActionHandle),
}

struct QueuedAction {
    owner: ThrottleOwner,
    action: Box<dyn FnOnce() + Send>,
}

#[derive(Clone, Copy, Debug)]
struct RateSettings {
    rate: f64,
    configured_interval: Duration,
    interval: Duration,
    per_interval: u64,
}

impl RateSettings {
    fn new(rate: f64, configured_interval: Duration) -> Self {
        let mut settings = Self {
            rate: 0.0,
            configured_interval,
            interval: configured_interval,
            per_interval: 0,
        };
        settings.apply(rate);
        settings
    }

    fn apply(&mut self, rate: f64) {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 0.0 };
        self.rate = rate;
        if rate == 0.0 {
            self.interval = self.configured_interval;
            self.per_interval = 0;
        } else if rate < SLOW_RATE_THRESHOLD {
            self.interval = SLOW_RATE_INTERVAL;
            self.per_interval = (rate as u64).max(1);
        } else {
            self.interval = self.configured_interval;
            self.per_interval = ((rate * self.configured_interval.as_secs_f64()) as u64).max(1);
        }
    }

    fn is_disabled(&self) -> bool {
        self.rate == 0.0
    }
}

struct ThrottleShared {
    name: String,
    queue: IntrusiveList<QueuedAction>,
    settings: Mutex<RateSettings>,
    timer: Mutex<Option<JoinHandle<()>>>,
    runtime: TimerRuntime,
    destroyed: AtomicBool,
}

impl ThrottleShared {
    fn pop_next(&self) -> Option<QueuedAction> {
        let mut queue = self.queue.lock();
        let handle = queue.pop_front()?;
        queue.free_element(handle)
    }

    fn drain_all(&self) -> usize {
        let mut executed = 0;
        while let Some(queued) = self.pop_next() {
            (queued.action)();
            executed += 1;
        }
        executed
    }

    /// Stops the tick task when nothing is queued. Returns `true` when stopped.
    fn stop_timer_if_idle(&self) -> bool {
        let mut timer = self.timer.lock();
        if !self.queue.lock().is_empty() && !self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        timer.take();
        debug!(
            event = events::THROTTLE_TIMER_STOP,
            component = COMPONENT,
            throttle = %self.name,
            "throttle queue drained, stopping timer"
        );
        true
    }

    /// One timer tick. Returns `false` once the tick task should exit.
    fn on_tick(&self) -> bool {
        let settings = *self.settings.lock();

        if settings.is_disabled() {
            let drained = self.drain_all();
            if drained > 0 {
                debug!(
                    event = events::THROTTLE_DRAIN_DISABLED,
                    component = COMPONENT,
                    throttle = %self.name,
                    drained,
                    "throttle disabled, drained queued actions"
                );
            }
        }

        if self.stop_timer_if_idle() {
            return false;
        }

        let mut sent = 0;
        while sent < settings.per_interval {
            let Some(queued) = self.pop_next() else {
                break;
            };
            (queued.action)();
            sent += 1;
        }

        if tracing::enabled!(Level::TRACE) {
            trace!(
                component = COMPONENT,
                throttle = %self.name,
                sent,
                remaining = self.queue.len(),
                "throttle tick"
            );
        }
        true
    }

    fn ensure_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(self);
        let name = self.name.clone();
        *timer = Some(self.runtime.spawn(run_tick_loop(weak, name)));
    }
}

async fn run_tick_loop(shared: Weak<ThrottleShared>, name: String) {
    let worker = WorkerContext::with_current_thread(name);
    debug!(
        event = events::THROTTLE_TIMER_START,
        component = COMPONENT,
        worker_id = %worker.worker_id,
        worker_thread = %worker.worker_thread,
        "throttle timer started"
    );

    loop {
        let interval = match shared.upgrade() {
            Some(shared) => shared.settings.lock().interval,
            None => return,
        };
        tokio::time::sleep(interval).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.on_tick() {
            return;
        }
    }
}

/// Rate-limited FIFO of deferred actions.
///
/// A rate of zero disables throttling: `dispatch` then runs actions inline and
/// reports [`Dispatch::Executed`].
#[derive(Clone)]
pub struct RateThrottle {
    shared: Arc<ThrottleShared>,
}

impl RateThrottle {
    pub fn new(name: &str, config: ThrottleConfig, runtime: TimerRuntime) -> Self {
        Self::with_list_debug(name, config, runtime, false)
    }

    pub fn with_list_debug(
        name: &str,
        config: ThrottleConfig,
        runtime: TimerRuntime,
        list_debug: bool,
    ) -> Self {
        let settings = RateSettings::new(config.rate, config.interval());
        Self {
            shared: Arc::new(ThrottleShared {
                name: name.to_string(),
                queue: IntrusiveList::new(ListOptions {
                    name: format!("{name}-queue"),
                    debug: list_debug,
                    capacity_limit: None,
                }),
                settings: Mutex::new(settings),
                timer: Mutex::new(None),
                runtime,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Sets messages per second. Negative values clamp to zero, which disables throttling.
    pub fn set_rate(&self, rate: f64) {
        let settings = {
            let mut settings = self.shared.settings.lock();
            settings.apply(rate);
            *settings
        };
        info!(
            event = events::THROTTLE_RATE_SET,
            component = COMPONENT,
            throttle = %self.shared.name,
            rate = settings.rate,
            quota = settings.per_interval,
            interval_ms = settings.interval.as_millis() as u64,
            "throttle rate updated"
        );
    }

    pub fn rate(&self) -> f64 {
        self.shared.settings.lock().rate
    }

    /// Sets the tick interval used for rates of ten per second and above.
    pub fn set_interval(&self, interval: Duration) {
        let mut settings = self.shared.settings.lock();
        settings.configured_interval = interval;
        let rate = settings.rate;
        settings.apply(rate);
    }

    pub fn interval(&self) -> Duration {
        self.shared.settings.lock().interval
    }

    pub fn per_interval_quota(&self) -> u64 {
        self.shared.settings.lock().per_interval
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.settings.lock().is_disabled()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_timer_running(&self) -> bool {
        self.shared.timer.lock().is_some()
    }

    /// Runs `action` now when disabled, otherwise queues it for a later tick.
    ///
    /// `immediate` actions jump to the front of the queue. When disabled, any
    /// backlog left over from before the rate was set to zero runs first.
    pub fn dispatch<F>(
        &self,
        owner: ThrottleOwner,
        immediate: bool,
        action: F,
    ) -> Result<Dispatch, Status>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(Status::fail_with_code(
                StatusCode::InvalidState,
                format!("throttle {} has been destroyed", self.shared.name),
            ));
        }

        if self.is_disabled() {
            self.shared.drain_all();
            debug!(
                event = events::THROTTLE_DISPATCH_SYNC,
                component = COMPONENT,
                throttle = %self.shared.name,
                owner = owner.id(),
                "throttle disabled, running action inline"
            );
            action();
            return Ok(Dispatch::Executed);
        }

        let handle = {
            let mut queue = self.shared.queue.lock();
            let handle = queue
                .allocate_element(QueuedAction {
                    owner,
                    action: Box::new(action),
                })
                .ok_or_else(|| {
                    Status::fail_with_code(
                        StatusCode::ResourceExhausted,
                        format!("throttle {} could not allocate an action", self.shared.name),
                    )
                })?;
            if immediate {
                queue.push_front(handle);
            } else {
                queue.push_back(handle);
            }
            handle
        };

        self.shared.ensure_timer();

        trace!(
            event = events::THROTTLE_DISPATCH_QUEUED,
            component = COMPONENT,
            throttle = %self.shared.name,
            owner = owner.id(),
            immediate,
            "action queued"
        );
        Ok(Dispatch::Queued(ActionHandle(handle)))
    }

    /// Holds the queue lock so callers can check and cancel atomically.
    pub fn lock(&self) -> ThrottleGuard<'_> {
        ThrottleGuard {
            queue: self.shared.queue.lock(),
            throttle_name: &self.shared.name,
            removed: Vec::new(),
        }
    }

    /// Removes one pending action. Returns `false` if it already ran or was removed.
    pub fn remove_action(&self, handle: ActionHandle) -> bool {
        self.lock().remove_action(handle)
    }

    /// Removes every pending action queued by `owner`.
    pub fn remove_messages_for_owner(&self, owner: ThrottleOwner) -> usize {
        self.lock().remove_messages_for_owner(owner)
    }

    /// Stops the tick task and discards every pending action.
    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::Release);
        if let Some(timer) = self.shared.timer.lock().take() {
            timer.abort();
        }
        let mut discarded = Vec::new();
        self.shared
            .queue
            .clear(|queued| discarded.push(queued));
        debug!(
            event = events::THROTTLE_DESTROY,
            component = COMPONENT,
            throttle = %self.shared.name,
            discarded = discarded.len(),
            "throttle destroyed"
        );
    }
}

impl Debug for RateThrottle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let settings = *self.shared.settings.lock();
        f.debug_struct("RateThrottle")
            .field("name", &self.shared.name)
            .field("rate", &settings.rate)
            .field("per_interval", &settings.per_interval)
            .field("interval", &settings.interval)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a throttle's queue.
///
/// Actions removed through the guard are dropped after the queue lock is released.
pub struct ThrottleGuard<'a> {
    queue: ListGuard<'a, QueuedAction>,
    throttle_name: &'a str,
    removed: Vec<QueuedAction>,
}

impl<'a> ThrottleGuard<'a> {
    pub fn is_pending(&self, handle: ActionHandle) -> bool {
        self.queue.is_linked(handle.0)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn remove_action(&mut self, handle: ActionHandle) -> bool {
        if !self.queue.remove_element(handle.0) {
            return false;
        }
        if let Some(queued) = self.queue.free_element(handle.0) {
            self.removed.push(queued);
        }
        true
    }

    pub fn remove_messages_for_owner(&mut self, owner: ThrottleOwner) -> usize {
        let mut removed = Vec::new();
        self.queue.for_each(|queue, handle| {
            if queue.get(handle).is_some_and(|queued| queued.owner == owner) {
                queue.remove_element(handle);
                if let Some(queued) = queue.free_element(handle) {
                    removed.push(queued);
                }
            }
        });
        let count = removed.len();
        self.removed.extend(removed);

        if count > 0 {
            debug!(
                event = events::THROTTLE_OWNER_PURGE,
                component = COMPONENT,
                throttle = %self.throttle_name,
                owner = owner.id(),
                removed = count,
                "removed queued actions for owner"
            );
        }
        count
    }
}
