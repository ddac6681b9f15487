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

//! Transport-neutral message value exchanged with bridges and callbacks.
//!
//! Only the attributes the subscription core inspects are modelled
//! explicitly; everything else travels in an opaque string field map.

use std::collections::BTreeMap;
use std::ops::{BitAnd, BitOr};

/// Message classes the subscription core distinguishes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MsgType {
    Update,
    Initial,
    Recap,
    Snapshot,
    BookInitial,
    EndOfInitials,
    SubscribeRequest,
    InitialRequest,
    RecapRequest,
    SnapshotRequest,
    DictionaryRequest,
    Refresh,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Update => "UPDATE",
            MsgType::Initial => "INITIAL",
            MsgType::Recap => "RECAP",
            MsgType::Snapshot => "SNAPSHOT",
            MsgType::BookInitial => "BOOK_INITIAL",
            MsgType::EndOfInitials => "END_OF_INITIALS",
            MsgType::SubscribeRequest => "SUBSCRIBE_REQUEST",
            MsgType::InitialRequest => "INITIAL_REQUEST",
            MsgType::RecapRequest => "RECAP_REQUEST",
            MsgType::SnapshotRequest => "SNAPSHOT_REQUEST",
            MsgType::DictionaryRequest => "DICTIONARY_REQUEST",
            MsgType::Refresh => "REFRESH",
        }
    }

    /// Full-image replies that satisfy an outstanding initial request.
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            MsgType::Initial | MsgType::BookInitial | MsgType::Snapshot
        )
    }

    pub fn is_recap(&self) -> bool {
        matches!(self, MsgType::Recap)
    }
}

/// Bitmask of message qualifiers carried by inbound updates.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MsgQualifier(u16);

impl MsgQualifier {
    pub const NONE: MsgQualifier = MsgQualifier(0);
    pub const POSSIBLY_DUPLICATE: MsgQualifier = MsgQualifier(0x0001);
    pub const DEFINITELY_DUPLICATE: MsgQualifier = MsgQualifier(0x0002);
    pub const POSSIBLY_DELAYED: MsgQualifier = MsgQualifier(0x0004);
    pub const DEFINITELY_DELAYED: MsgQualifier = MsgQualifier(0x0008);
    pub const OUT_OF_SEQUENCE: MsgQualifier = MsgQualifier(0x0010);

    pub const fn from_bits(bits: u16) -> Self {
        MsgQualifier(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(&self, other: MsgQualifier) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: MsgQualifier) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MsgQualifier) {
        self.0 &= !other.0;
    }
}

impl BitOr for MsgQualifier {
    type Output = MsgQualifier;

    fn bitor(self, rhs: Self) -> Self::Output {
        MsgQualifier(self.0 | rhs.0)
    }
}

impl BitAnd for MsgQualifier {
    type Output = MsgQualifier;

    fn bitand(self, rhs: Self) -> Self::Output {
        MsgQualifier(self.0 & rhs.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    msg_type: MsgType,
    issue_symbol: Option<String>,
    source: Option<String>,
    seq_num: Option<u64>,
    qualifier: Option<MsgQualifier>,
    entitle_code: i32,
    fields: BTreeMap<String, String>,
}

impl Message {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            issue_symbol: None,
            source: None,
            seq_num: None,
            qualifier: None,
            entitle_code: 0,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_issue_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.issue_symbol = Some(symbol.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_seq_num(mut self, seq_num: u64) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    pub fn with_qualifier(mut self, qualifier: MsgQualifier) -> Self {
        self.qualifier = Some(qualifier);
        self
    }

    /// Non-zero codes mark the message as not entitled for the receiver.
    pub fn with_entitle_code(mut self, code: i32) -> Self {
        self.entitle_code = code;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn issue_symbol(&self) -> Option<&str> {
        self.issue_symbol.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn seq_num(&self) -> Option<u64> {
        self.seq_num
    }

    pub fn qualifier(&self) -> Option<MsgQualifier> {
        self.qualifier
    }

    pub fn entitle_code(&self) -> i32 {
        self.entitle_code
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, MsgQualifier, MsgType};

    #[test]
    fn qualifier_filter_matches_any_shared_bit() {
        let filter = MsgQualifier::DEFINITELY_DUPLICATE | MsgQualifier::OUT_OF_SEQUENCE;

        assert!(filter.intersects(MsgQualifier::OUT_OF_SEQUENCE));
        assert!(!filter.intersects(MsgQualifier::POSSIBLY_DELAYED));
        assert!(!MsgQualifier::NONE.intersects(filter));
    }

    #[test]
    fn qualifier_insert_and_remove_toggle_bits() {
        let mut filter = MsgQualifier::NONE;
        filter.insert(MsgQualifier::POSSIBLY_DUPLICATE);
        filter.insert(MsgQualifier::DEFINITELY_DELAYED);
        filter.remove(MsgQualifier::POSSIBLY_DUPLICATE);

        assert_eq!(filter, MsgQualifier::DEFINITELY_DELAYED);
    }

    #[test]
    fn builder_sets_attributes_and_fields() {
        let message = Message::new(MsgType::Initial)
            .with_issue_symbol("MSFT")
            .with_source("NASDAQ")
            .with_seq_num(7)
            .with_field("wBidPrice", "412.10");

        assert!(message.msg_type().is_initial());
        assert_eq!(message.issue_symbol(), Some("MSFT"));
        assert_eq!(message.source(), Some("NASDAQ"));
        assert_eq!(message.seq_num(), Some(7));
        assert_eq!(message.field("wBidPrice"), Some("412.10"));
        assert_eq!(message.entitle_code(), 0);
    }
}
