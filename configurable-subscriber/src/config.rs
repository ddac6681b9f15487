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

use serde::{Deserialize, Serialize};
use std::time::Duration;
use subscription_core::config::CoreConfig;
use subscription_core::{ServiceLevel, Status, StatusCode, SubscriptionType};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub(crate) core: CoreConfig,
    #[serde(default)]
    pub(crate) bridge: BridgeConfig,
    pub(crate) run: RunConfig,
    pub(crate) subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_name")]
    pub(crate) name: String,
    #[serde(default = "default_true")]
    pub(crate) answer_image_requests: bool,
    #[serde(default = "default_images_per_request")]
    pub(crate) images_per_request: u32,
    /// `source.symbol` subjects the loopback entitlements refuse.
    #[serde(default)]
    pub(crate) denied_subjects: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            answer_image_requests: true,
            images_per_request: default_images_per_request(),
            denied_subjects: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub(crate) duration_secs: u64,
    /// Zero disables the synthetic publisher.
    #[serde(default)]
    pub(crate) publish_interval_ms: u64,
    #[serde(default = "default_teardown_secs")]
    pub(crate) teardown_secs: u64,
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn publish_interval(&self) -> Option<Duration> {
        (self.publish_interval_ms > 0).then(|| Duration::from_millis(self.publish_interval_ms))
    }

    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.teardown_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    pub(crate) source: String,
    #[serde(default)]
    pub(crate) symbol: String,
    #[serde(default)]
    pub(crate) kind: SubscriptionKind,
    #[serde(default)]
    pub(crate) service_level: ServiceLevelConfig,
    #[serde(default)]
    pub(crate) timeout_secs: Option<u64>,
    #[serde(default)]
    pub(crate) retries: Option<u32>,
    #[serde(default)]
    pub(crate) requires_initial: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    #[default]
    Normal,
    Group,
    Book,
    Dictionary,
    SymbolList,
    Basic,
    Wildcard,
}

impl SubscriptionKind {
    /// Kinds set up through `Subscription::setup`.
    pub fn market_data_type(&self) -> Option<SubscriptionType> {
        match self {
            SubscriptionKind::Normal => Some(SubscriptionType::Normal),
            SubscriptionKind::Group => Some(SubscriptionType::Group),
            SubscriptionKind::Book => Some(SubscriptionType::Book),
            SubscriptionKind::Dictionary => Some(SubscriptionType::Dictionary),
            SubscriptionKind::SymbolList => Some(SubscriptionType::SymbolList),
            SubscriptionKind::Basic | SubscriptionKind::Wildcard => None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevelConfig {
    #[default]
    RealTime,
    Snapshot,
}

impl From<ServiceLevelConfig> for ServiceLevel {
    fn from(level: ServiceLevelConfig) -> Self {
        match level {
            ServiceLevelConfig::RealTime => ServiceLevel::RealTime,
            ServiceLevelConfig::Snapshot => ServiceLevel::Snapshot,
        }
    }
}

impl Config {
    pub fn from_json5_str(contents: &str) -> Result<Self, Status> {
        let config: Config = json5::from_str(contents).map_err(|e| {
            Status::fail_with_code(
                StatusCode::InvalidArgument,
                format!("Unable to parse config file: {e:?}"),
            )
        })?;
        if config.subscriptions.is_empty() {
            return Err(Status::fail_with_code(
                StatusCode::InvalidArgument,
                "config lists no subscriptions",
            ));
        }
        Ok(config)
    }
}

fn default_bridge_name() -> String {
    "loopback".to_string()
}

fn default_true() -> bool {
    true
}

fn default_images_per_request() -> u32 {
    1
}

fn default_teardown_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::{Config, ServiceLevelConfig, SubscriptionKind};
    use subscription_core::StatusCode;

    #[test]
    fn sample_config_parses() {
        let config = Config::from_json5_str(include_str!("../DEFAULT_CONFIG.json5"))
            .expect("bundled config should parse");

        assert!(config.subscriptions.len() >= 3);
        assert_eq!(config.subscriptions[0].kind, SubscriptionKind::Normal);
        assert!(config
            .subscriptions
            .iter()
            .any(|subscription| subscription.service_level == ServiceLevelConfig::Snapshot));
        assert!(config.run.publish_interval().is_some());
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::from_json5_str(
            r#"{
                run: { duration_secs: 1 },
                subscriptions: [ { source: "NASDAQ", symbol: "MSFT" } ],
            }"#,
        )
        .expect("minimal config");

        assert_eq!(config.bridge.name, "loopback");
        assert!(config.bridge.answer_image_requests);
        assert_eq!(config.core.default_throttle.rate, 1000.0);
        assert!(config.run.publish_interval().is_none());
    }

    #[test]
    fn unknown_fields_and_empty_lists_are_rejected() {
        let unknown = Config::from_json5_str(
            r#"{ run: { duration_secs: 1 }, subscriptions: [], streamer: {} }"#,
        )
        .expect_err("unknown field");
        assert_eq!(unknown.code(), StatusCode::InvalidArgument);

        let empty = Config::from_json5_str(r#"{ run: { duration_secs: 1 }, subscriptions: [] }"#)
            .expect_err("no subscriptions");
        assert_eq!(empty.code(), StatusCode::InvalidArgument);
    }
}
