/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
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

//! JSON5-backed configuration for throttles and subscription defaults.

use crate::status::{Status, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_THROTTLE_RATE: f64 = 1000.0;
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SUBSCRIPTION_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_SUBSCRIPTION_RETRIES: u32 = 2;
pub const DEFAULT_PRE_INITIAL_CACHE_SIZE: u32 = 10;
pub const MINIMUM_GROUP_SIZE_HINT: u32 = 100;

pub const ROOT_NORMAL: &str = "_MD";
pub const ROOT_DICTIONARY: &str = "_MDDD";
pub const DICTIONARY_SYMBOL: &str = "DATA_DICT";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    #[serde(default = "default_throttle_rate")]
    pub rate: f64,
    #[serde(default = "default_throttle_interval_ms")]
    pub interval_ms: u64,
}

impl ThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// A throttle that runs every action inline.
    pub fn disabled() -> Self {
        Self {
            rate: 0.0,
            ..Self::default()
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_THROTTLE_RATE,
            interval_ms: DEFAULT_THROTTLE_INTERVAL_MS,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Recap requests reuse `timeout_secs` when unset.
    #[serde(default)]
    pub recap_timeout_secs: Option<f64>,
    /// Zero means "use the transport default".
    #[serde(default)]
    pub group_size_hint: u32,
    #[serde(default = "default_pre_initial_cache_size")]
    pub pre_initial_cache_size: u32,
    #[serde(default = "default_true")]
    pub requires_initial: bool,
    #[serde(default = "default_true")]
    pub recover_gaps: bool,
}

impl SubscriptionDefaults {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }

    pub fn recap_timeout(&self) -> Duration {
        secs_to_duration(self.recap_timeout_secs.unwrap_or(self.timeout_secs))
    }
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SUBSCRIPTION_TIMEOUT_SECS,
            retries: DEFAULT_SUBSCRIPTION_RETRIES,
            recap_timeout_secs: None,
            group_size_hint: 0,
            pre_initial_cache_size: DEFAULT_PRE_INITIAL_CACHE_SIZE,
            requires_initial: true,
            recover_gaps: true,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub default_throttle: ThrottleConfig,
    #[serde(default)]
    pub recap_throttle: ThrottleConfig,
    #[serde(default)]
    pub subscription: SubscriptionDefaults,
    /// Enables per-list trace logging for throttle queues.
    #[serde(default)]
    pub list_debug: bool,
}

impl CoreConfig {
    pub fn from_json5_str(contents: &str) -> Result<Self, Status> {
        json5::from_str(contents).map_err(|e| {
            Status::fail_with_code(
                StatusCode::InvalidArgument,
                format!("Unable to parse config: {e}"),
            )
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Status> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Status::fail_with_code(
                StatusCode::NotFound,
                format!("Unable to read config file {}: {e}", path.display()),
            )
        })?;
        Self::from_json5_str(&contents)
    }
}

pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

fn default_throttle_rate() -> f64 {
    DEFAULT_THROTTLE_RATE
}

fn default_throttle_interval_ms() -> u64 {
    DEFAULT_THROTTLE_INTERVAL_MS
}

fn default_timeout_secs() -> f64 {
    DEFAULT_SUBSCRIPTION_TIMEOUT_SECS
}

fn default_retries() -> u32 {
    DEFAULT_SUBSCRIPTION_RETRIES
}

fn default_pre_initial_cache_size() -> u32 {
    DEFAULT_PRE_INITIAL_CACHE_SIZE
}

fn default_true() -> bool {
    true
}
