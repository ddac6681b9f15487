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

//! Sequence, duplicate and quality tracking per subject.

use super::types::Quality;
use crate::message::{Message, MsgType};
use std::collections::VecDeque;

/// Per-subject data quality state.
#[derive(Debug, Default)]
pub struct DqContext {
    last_seq: Option<u64>,
    quality: Quality,
    image_arrived: bool,
    pre_initial: VecDeque<Message>,
    pre_initial_capacity: usize,
}

impl DqContext {
    pub fn new(pre_initial_capacity: usize) -> Self {
        Self {
            pre_initial_capacity,
            ..Self::default()
        }
    }

    /// Clears sequence and cache state for a fresh activation.
    pub fn reset(&mut self) {
        self.last_seq = None;
        self.quality = Quality::Ok;
        self.image_arrived = false;
        self.pre_initial.clear();
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn set_quality(&mut self, quality: Quality) {
        self.quality = quality;
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn image_arrived(&self) -> bool {
        self.image_arrived
    }

    pub fn cached_len(&self) -> usize {
        self.pre_initial.len()
    }

    /// Caches an update that arrived ahead of the initial image.
    pub fn cache_pre_initial(&mut self, msg: &Message) -> bool {
        if self.pre_initial.len() >= self.pre_initial_capacity {
            return false;
        }
        self.pre_initial.push_back(msg.clone());
        true
    }

    /// Releases cached updates newer than the image that just arrived.
    pub fn take_pre_initial(&mut self, image_seq: Option<u64>) -> Vec<Message> {
        let cached = self.pre_initial.drain(..);
        match image_seq {
            Some(image_seq) => cached
                .filter(|msg| msg.seq_num().map_or(true, |seq| seq > image_seq))
                .collect(),
            None => cached.collect(),
        }
    }

    /// Gives up on the image: hands back cached updates newer than anything
    /// already delivered, oldest first, and continues sequencing from them.
    pub fn release_pre_initial(&mut self) -> Vec<Message> {
        let last_seq = self.last_seq;
        let released: Vec<Message> = self
            .pre_initial
            .drain(..)
            .filter(|msg| match (msg.seq_num(), last_seq) {
                (Some(seq), Some(last)) => seq > last,
                _ => true,
            })
            .collect();
        if let Some(seq) = released.iter().filter_map(Message::seq_num).max() {
            self.last_seq = Some(last_seq.map_or(seq, |last| last.max(seq)));
        }
        released
    }

    fn record_image(&mut self, msg: &Message) -> bool {
        let recovered = self.quality != Quality::Ok;
        if let Some(seq) = msg.seq_num() {
            self.last_seq = Some(seq);
        }
        self.image_arrived = true;
        self.quality = Quality::Ok;
        recovered
    }
}

/// What the subscription should do with one inbound message.
#[derive(Debug, PartialEq)]
pub enum DqVerdict {
    Deliver,
    /// Duplicate, stale, or dropped because the pre-initial cache is full.
    Suppress,
    /// Held until the initial image arrives.
    Cached,
    /// Deliver, then report the gap. The context is now stale; `newly_stale`
    /// is set only for the first gap since the last image.
    Gap {
        expected: u64,
        received: u64,
        newly_stale: bool,
    },
    /// A full image: deliver it, then `replay` in order.
    Image { replay: Vec<Message>, recovered: bool },
}

/// Pluggable duplicate and gap detection.
pub trait DqStrategy: Send + Sync {
    fn check(&self, context: &mut DqContext, msg: &Message, awaiting_initial: bool) -> DqVerdict;
}

/// Strictly increasing sequence numbers, one apart.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceDqStrategy;

impl DqStrategy for SequenceDqStrategy {
    fn check(&self, context: &mut DqContext, msg: &Message, awaiting_initial: bool) -> DqVerdict {
        let msg_type = msg.msg_type();
        if msg_type.is_initial() || msg_type.is_recap() {
            let recovered = context.record_image(msg);
            let replay = context.take_pre_initial(msg.seq_num());
            return DqVerdict::Image { replay, recovered };
        }
        if msg_type != MsgType::Update {
            return DqVerdict::Deliver;
        }

        if awaiting_initial && !context.image_arrived {
            return if context.cache_pre_initial(msg) {
                DqVerdict::Cached
            } else {
                DqVerdict::Suppress
            };
        }

        let Some(seq) = msg.seq_num() else {
            return DqVerdict::Deliver;
        };
        match context.last_seq {
            None => {
                context.last_seq = Some(seq);
                DqVerdict::Deliver
            }
            Some(last) if seq <= last => DqVerdict::Suppress,
            Some(last) if seq == last + 1 => {
                context.last_seq = Some(seq);
                DqVerdict::Deliver
            }
            Some(last) => {
                let newly_stale = context.quality != Quality::Stale;
                context.last_seq = Some(seq);
                context.quality = Quality::Stale;
                DqVerdict::Gap {
                    expected: last + 1,
                    received: seq,
                    newly_stale,
                }
            }
        }
    }
}
