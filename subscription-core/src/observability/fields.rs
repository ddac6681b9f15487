/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
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

//! Canonical structured field keys and value-format helpers.

use crate::message::Message;

pub const EVENT: &str = "event";
pub const COMPONENT: &str = "component";
pub const WORKER_ID: &str = "worker_id";
pub const WORKER_THREAD: &str = "worker_thread";

pub const SUBSCRIPTION_ID: &str = "subscription_id";
pub const SYMBOL: &str = "symbol";
pub const SOURCE: &str = "source";
pub const FROM_STATE: &str = "from_state";
pub const TO_STATE: &str = "to_state";
pub const MSG_TYPE: &str = "msg_type";
pub const ISSUE_SYMBOL: &str = "issue_symbol";

pub const THROTTLE: &str = "throttle";
pub const RATE: &str = "rate";
pub const QUOTA: &str = "quota";
pub const QUEUED: &str = "queued";
pub const REMOVED: &str = "removed";

pub const TOPIC: &str = "topic";
pub const IDENTIFIER: &str = "identifier";
pub const REASON: &str = "reason";
pub const ERR: &str = "err";

pub const NONE: &str = "none";
pub const REASON_POSITION_NOT_LINKED: &str = "position_not_linked";
pub const REASON_ELEMENT_ALREADY_LINKED: &str = "element_already_linked";
pub const REASON_STALE_HANDLE: &str = "stale_handle";
pub const DEFAULT_WORKER_THREAD: &str = "unknown-thread";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerContext {
    pub worker_id: String,
    pub worker_thread: String,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>, worker_thread: Option<&str>) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_thread: thread_name_or_default(worker_thread),
        }
    }

    pub fn with_current_thread(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_thread: current_thread_name_or_default(),
        }
    }
}

pub fn thread_name_or_default(thread_name: Option<&str>) -> String {
    thread_name.unwrap_or(DEFAULT_WORKER_THREAD).to_string()
}

pub fn current_thread_name_or_default() -> String {
    thread_name_or_default(std::thread::current().name())
}

pub fn format_message_type(message: &Message) -> &'static str {
    message.msg_type().as_str()
}

pub fn format_issue_symbol(message: &Message) -> String {
    message
        .issue_symbol()
        .map(str::to_string)
        .unwrap_or_else(|| NONE.to_string())
}

#[cfg(test)]
mod tests {
    use super::{format_issue_symbol, thread_name_or_default, DEFAULT_WORKER_THREAD, NONE};
    use crate::message::{Message, MsgType};

    #[test]
    fn format_issue_symbol_returns_symbol_when_present() {
        let message = Message::new(MsgType::Update).with_issue_symbol("MSFT");

        assert_eq!(format_issue_symbol(&message), "MSFT");
    }

    #[test]
    fn format_issue_symbol_returns_none_when_absent() {
        let message = Message::new(MsgType::Update);

        assert_eq!(format_issue_symbol(&message), NONE);
    }

    #[test]
    fn thread_name_or_default_falls_back_when_absent() {
        assert_eq!(thread_name_or_default(None), DEFAULT_WORKER_THREAD);
        assert_eq!(thread_name_or_default(Some("named-thread")), "named-thread");
    }
}
