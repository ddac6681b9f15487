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

//! Status taxonomy shared by every synchronous operation and error callback.

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};

/// Coarse failure classes surfaced to callers and to `on_error` callbacks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StatusCode {
    InvalidArgument,
    InvalidState,
    InvalidType,
    ResourceExhausted,
    NotEntitled,
    Timeout,
    Platform,
    NotFound,
    NotImplemented,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::InvalidState => "INVALID_STATE",
            StatusCode::InvalidType => "INVALID_TYPE",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::NotEntitled => "NOT_ENTITLED",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::Platform => "PLATFORM",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge-defined failure detail. The core forwards it without interpreting it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlatformError {
    pub code: i64,
    pub text: String,
}

impl PlatformError {
    pub fn new(code: i64, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl Display for PlatformError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "platform error {}: {}", self.code, self.text)
    }
}

/// A failure with its class, a human readable message and an optional platform error.
#[derive(Clone, Eq, PartialEq)]
pub struct Status {
    code: StatusCode,
    message: String,
    platform_error: Option<PlatformError>,
}

impl Status {
    pub fn fail_with_code(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            platform_error: None,
        }
    }

    pub fn platform(error: PlatformError) -> Self {
        Self {
            code: StatusCode::Platform,
            message: error.text.clone(),
            platform_error: Some(error),
        }
    }

    pub(crate) fn invalid_state(operation: &str, state: impl Display) -> Self {
        Self::fail_with_code(
            StatusCode::InvalidState,
            format!("{operation} is not permitted in state {state}"),
        )
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn platform_error(&self) -> Option<&PlatformError> {
        self.platform_error.as_ref()
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("platform_error", &self.platform_error)
            .finish()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.platform_error {
            Some(platform) => write!(f, "{}: {} ({platform})", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl Error for Status {}

#[cfg(test)]
mod tests {
    use super::{PlatformError, Status, StatusCode};

    #[test]
    fn display_includes_code_and_message() {
        let status = Status::fail_with_code(StatusCode::NotEntitled, "NASDAQ.MSFT");

        assert_eq!(status.to_string(), "NOT_ENTITLED: NASDAQ.MSFT");
        assert!(status.platform_error().is_none());
    }

    #[test]
    fn platform_status_keeps_bridge_error_verbatim() {
        let status = Status::platform(PlatformError::new(-7, "socket reset"));

        assert_eq!(status.code(), StatusCode::Platform);
        assert_eq!(
            status.platform_error(),
            Some(&PlatformError::new(-7, "socket reset"))
        );
        assert_eq!(
            status.to_string(),
            "PLATFORM: socket reset (platform error -7: socket reset)"
        );
    }

    #[test]
    fn invalid_state_names_operation_and_state() {
        let status = Status::invalid_state("activate", "ALLOCATED");

        assert_eq!(status.code(), StatusCode::InvalidState);
        assert_eq!(
            status.message(),
            "activate is not permitted in state ALLOCATED"
        );
    }
}
