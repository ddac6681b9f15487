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

use crate::message::MsgQualifier;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`Subscription`](super::Subscription).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum SubscriptionState {
    Unknown = 0,
    Allocated = 1,
    Setup = 2,
    Activating = 3,
    Activated = 4,
    Deactivating = 5,
    Deactivated = 6,
    Reactivating = 7,
    Destroying = 8,
    Destroyed = 9,
    Deallocating = 10,
    Deallocated = 11,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SubscriptionState::Allocated,
            2 => SubscriptionState::Setup,
            3 => SubscriptionState::Activating,
            4 => SubscriptionState::Activated,
            5 => SubscriptionState::Deactivating,
            6 => SubscriptionState::Deactivated,
            7 => SubscriptionState::Reactivating,
            8 => SubscriptionState::Destroying,
            9 => SubscriptionState::Destroyed,
            10 => SubscriptionState::Deallocating,
            11 => SubscriptionState::Deallocated,
            _ => SubscriptionState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Unknown => "UNKNOWN",
            SubscriptionState::Allocated => "ALLOCATED",
            SubscriptionState::Setup => "SETUP",
            SubscriptionState::Activating => "ACTIVATING",
            SubscriptionState::Activated => "ACTIVATED",
            SubscriptionState::Deactivating => "DEACTIVATING",
            SubscriptionState::Deactivated => "DEACTIVATED",
            SubscriptionState::Reactivating => "REACTIVATING",
            SubscriptionState::Destroying => "DESTROYING",
            SubscriptionState::Destroyed => "DESTROYED",
            SubscriptionState::Deallocating => "DEALLOCATING",
            SubscriptionState::Deallocated => "DEALLOCATED",
        }
    }
}

impl Display for SubscriptionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic cell for the state field.
///
/// Single reads may use [`AtomicState::load`] without the subscription lock;
/// transitions that touch any other field must hold it.
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: SubscriptionState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn swap(&self, state: SubscriptionState) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SubscriptionType {
    /// Raw topic subscription: no initial image, no sequence checking.
    Basic,
    #[default]
    Normal,
    Group,
    Book,
    Dictionary,
    SymbolList,
    SymbolListNormal,
    SymbolListGroup,
    SymbolListBook,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Basic => "BASIC",
            SubscriptionType::Normal => "NORMAL",
            SubscriptionType::Group => "GROUP",
            SubscriptionType::Book => "BOOK",
            SubscriptionType::Dictionary => "DICTIONARY",
            SubscriptionType::SymbolList => "SYMBOL_LIST",
            SubscriptionType::SymbolListNormal => "SYMBOL_LIST_NORMAL",
            SubscriptionType::SymbolListGroup => "SYMBOL_LIST_GROUP",
            SubscriptionType::SymbolListBook => "SYMBOL_LIST_BOOK",
        }
    }

    /// Fixed wire symbol for symbol-list types.
    pub(crate) fn mapped_symbol(&self) -> Option<&'static str> {
        match self {
            SubscriptionType::SymbolList | SubscriptionType::SymbolListNormal => {
                Some("SYMBOL_LIST_NORMAL")
            }
            SubscriptionType::SymbolListGroup => Some("SYMBOL_LIST_GROUP"),
            SubscriptionType::SymbolListBook => Some("SYMBOL_LIST_BOOK"),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ServiceLevel {
    #[default]
    RealTime,
    /// One image, then the subscription deactivates itself.
    Snapshot,
    Conflated,
}

impl ServiceLevel {
    pub fn expects_updates(&self) -> bool {
        !matches!(self, ServiceLevel::Snapshot)
    }
}

/// What the subscription asks the publisher for when it activates.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SubscMsgType {
    #[default]
    Subscribe,
    Snapshot,
    DictionarySnapshot,
}

impl SubscMsgType {
    /// Snapshot requests are point-to-point and never create a bridge subscription.
    pub fn needs_bridge_subscription(&self) -> bool {
        matches!(self, SubscMsgType::Subscribe)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum WildcardKind {
    #[default]
    None,
    /// Every topic on the source.
    Transport,
    /// Pattern supplied as the symbol.
    Wildcard,
}

/// Data quality reported through `on_quality`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Quality {
    #[default]
    Ok,
    MaybeStale,
    Stale,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Ok => "OK",
            Quality::MaybeStale => "MAYBE_STALE",
            Quality::Stale => "STALE",
        }
    }
}

/// Which inbound message qualifiers cause a message to be discarded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MsgQualifierFilter {
    pub ignore_definitely_duplicate: bool,
    pub ignore_possibly_duplicate: bool,
    pub ignore_definitely_delayed: bool,
    pub ignore_possibly_delayed: bool,
    pub ignore_out_of_sequence: bool,
}

impl MsgQualifierFilter {
    pub fn mask(&self) -> MsgQualifier {
        let mut mask = MsgQualifier::NONE;
        for (enabled, bit) in [
            (
                self.ignore_definitely_duplicate,
                MsgQualifier::DEFINITELY_DUPLICATE,
            ),
            (
                self.ignore_possibly_duplicate,
                MsgQualifier::POSSIBLY_DUPLICATE,
            ),
            (
                self.ignore_definitely_delayed,
                MsgQualifier::DEFINITELY_DELAYED,
            ),
            (self.ignore_possibly_delayed, MsgQualifier::POSSIBLY_DELAYED),
            (self.ignore_out_of_sequence, MsgQualifier::OUT_OF_SEQUENCE),
        ] {
            if enabled {
                mask.insert(bit);
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicState, MsgQualifierFilter, SubscriptionState, SubscriptionType};
    use crate::message::MsgQualifier;

    #[test]
    fn atomic_state_round_trips_and_reports_previous() {
        let state = AtomicState::new(SubscriptionState::Allocated);

        assert_eq!(
            state.swap(SubscriptionState::Setup),
            SubscriptionState::Allocated
        );
        assert_eq!(state.load(), SubscriptionState::Setup);
        assert_eq!(state.load().to_string(), "SETUP");
    }

    #[test]
    fn out_of_range_state_reads_as_unknown() {
        assert_eq!(SubscriptionState::from_u8(200), SubscriptionState::Unknown);
    }

    #[test]
    fn symbol_list_types_use_fixed_wire_symbols() {
        assert_eq!(
            SubscriptionType::SymbolList.mapped_symbol(),
            Some("SYMBOL_LIST_NORMAL")
        );
        assert_eq!(
            SubscriptionType::SymbolListBook.mapped_symbol(),
            Some("SYMBOL_LIST_BOOK")
        );
        assert_eq!(SubscriptionType::Group.mapped_symbol(), None);
    }

    #[test]
    fn qualifier_filter_mask_collects_enabled_bits() {
        let filter = MsgQualifierFilter {
            ignore_definitely_duplicate: true,
            ignore_out_of_sequence: true,
            ..MsgQualifierFilter::default()
        };

        assert_eq!(
            filter.mask(),
            MsgQualifier::DEFINITELY_DUPLICATE | MsgQualifier::OUT_OF_SEQUENCE
        );
        assert!(MsgQualifierFilter::default().mask().is_empty());
    }
}
