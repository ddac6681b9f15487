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

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Works with paused tokio time: each poll sleeps, which lets the clock
/// auto-advance to the next pending timer.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            debug!(?timeout, "condition not met before deadline");
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Waits until `count()` reaches at least `expected`.
pub async fn wait_for_count<F>(timeout: Duration, expected: usize, mut count: F) -> bool
where
    F: FnMut() -> usize,
{
    wait_until(timeout, || count() >= expected).await
}
