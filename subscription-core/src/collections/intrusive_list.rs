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

//! Lock-protected doubly linked list over an arena of typed slots.
//!
//! Every element lives in a slot addressed by an [`ElementHandle`]. A slot is
//! either free (on the recycle list), detached (allocated but unlinked) or
//! linked. Handles carry the slot generation, so a handle that outlives a
//! `free_element` call can never reach the slot's next occupant.
//!
//! Compound sequences ("is it still queued? then remove and free it") run
//! under a single [`ListGuard`] obtained from [`IntrusiveList::lock`].

use crate::observability::{events, fields};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use tracing::{trace, warn};

const COMPONENT: &str = "intrusive_list";

/// Stable, generation-checked reference to one list element.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ElementHandle {
    index: u32,
    generation: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub name: String,
    /// Emits a trace event for every link/unlink on this list.
    pub debug: bool,
    /// Maximum number of slots, `None` for unbounded.
    pub capacity_limit: Option<usize>,
}

impl ListOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Free,
    Detached,
    Linked,
}

struct Slot<T> {
    generation: u32,
    state: SlotState,
    prev: Option<u32>,
    next: Option<u32>,
    value: Option<T>,
}

struct ListState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    cursors: HashMap<u64, Option<u32>>,
    next_cursor_id: u64,
}

impl<T> ListState<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            cursors: HashMap::new(),
            next_cursor_id: 0,
        }
    }

    fn handle_at(&self, index: u32) -> ElementHandle {
        ElementHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn resolve(&self, handle: ElementHandle) -> Option<(u32, SlotState)> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation || slot.state == SlotState::Free {
            return None;
        }
        Some((handle.index, slot.state))
    }

    fn link_after_tail(&mut self, index: u32) {
        let old_tail = self.tail;
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = old_tail;
            slot.next = None;
            slot.state = SlotState::Linked;
        }
        match old_tail {
            Some(tail) => self.slots[tail as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn link_before_head(&mut self, index: u32) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = None;
            slot.next = old_head;
            slot.state = SlotState::Linked;
        }
        match old_head {
            Some(head) => self.slots[head as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
    }

    fn link_before(&mut self, position: u32, index: u32) {
        let before = self.slots[position as usize].prev;
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = before;
            slot.next = Some(position);
            slot.state = SlotState::Linked;
        }
        match before {
            Some(prev) => self.slots[prev as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.slots[position as usize].prev = Some(index);
        self.len += 1;
    }

    fn unlink(&mut self, index: u32) {
        let len_before = self.len;
        let (prev, next) = {
            let slot = &mut self.slots[index as usize];
            let links = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            slot.state = SlotState::Detached;
            links
        };
        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;

        // Cursors parked on the removed node move to its successor, wrapping to
        // the head when the tail was removed from a list that still has nodes.
        let replacement = match next {
            Some(next) => Some(next),
            None if len_before > 1 => self.head,
            None => None,
        };
        for current in self.cursors.values_mut() {
            if *current == Some(index) {
                *current = replacement;
            }
        }
    }
}

/// Exclusive access to the list for compound operations.
pub struct ListGuard<'a, T> {
    options: &'a ListOptions,
    state: MutexGuard<'a, ListState<T>>,
}

impl<'a, T> ListGuard<'a, T> {
    fn trace_op(&self, op: &'static str, index: u32) {
        if self.options.debug {
            trace!(
                event = events::LIST_TRACE,
                component = COMPONENT,
                list = %self.options.name,
                op,
                index,
                len = self.state.len,
                "list operation"
            );
        }
    }

    fn reject_insert(&self, op: &'static str, reason: &'static str) -> bool {
        warn!(
            event = events::LIST_INSERT_REJECTED,
            component = COMPONENT,
            list = %self.options.name,
            op,
            reason,
            "Unexpected: list insert failed"
        );
        false
    }

    /// Takes a slot from the recycle list, or grows the arena.
    ///
    /// Returns `None` when the configured capacity limit is reached.
    pub fn allocate_element(&mut self, value: T) -> Option<ElementHandle> {
        if let Some(index) = self.state.free.pop() {
            let slot = &mut self.state.slots[index as usize];
            slot.state = SlotState::Detached;
            slot.prev = None;
            slot.next = None;
            slot.value = Some(value);
            self.trace_op("allocate_reuse", index);
            return Some(self.state.handle_at(index));
        }

        let slot_count = self.state.slots.len();
        let over_limit = self
            .options
            .capacity_limit
            .is_some_and(|limit| slot_count >= limit);
        if over_limit || slot_count >= u32::MAX as usize {
            warn!(
                event = events::LIST_CAPACITY_EXHAUSTED,
                component = COMPONENT,
                list = %self.options.name,
                slots = slot_count,
                "unable to allocate list element"
            );
            return None;
        }

        let index = slot_count as u32;
        self.state.slots.push(Slot {
            generation: 0,
            state: SlotState::Detached,
            prev: None,
            next: None,
            value: Some(value),
        });
        self.trace_op("allocate_new", index);
        Some(self.state.handle_at(index))
    }

    pub fn push_back(&mut self, element: ElementHandle) -> bool {
        match self.state.resolve(element) {
            Some((index, SlotState::Detached)) => {
                self.state.link_after_tail(index);
                self.trace_op("push_back", index);
                true
            }
            Some(_) => self.reject_insert("push_back", fields::REASON_ELEMENT_ALREADY_LINKED),
            None => self.reject_insert("push_back", fields::REASON_STALE_HANDLE),
        }
    }

    pub fn push_front(&mut self, element: ElementHandle) -> bool {
        match self.state.resolve(element) {
            Some((index, SlotState::Detached)) => {
                self.state.link_before_head(index);
                self.trace_op("push_front", index);
                true
            }
            Some(_) => self.reject_insert("push_front", fields::REASON_ELEMENT_ALREADY_LINKED),
            None => self.reject_insert("push_front", fields::REASON_STALE_HANDLE),
        }
    }

    /// Links `element` immediately before `position`.
    ///
    /// Logs and does nothing when `position` is not linked or `element` is.
    pub fn insert_before(&mut self, position: ElementHandle, element: ElementHandle) -> bool {
        let Some((position_index, SlotState::Linked)) = self.state.resolve(position) else {
            return self.reject_insert("insert_before", fields::REASON_POSITION_NOT_LINKED);
        };
        match self.state.resolve(element) {
            Some((index, SlotState::Detached)) => {
                self.state.link_before(position_index, index);
                self.trace_op("insert_before", index);
                true
            }
            Some(_) => self.reject_insert("insert_before", fields::REASON_ELEMENT_ALREADY_LINKED),
            None => self.reject_insert("insert_before", fields::REASON_STALE_HANDLE),
        }
    }

    /// Unlinks and returns the head. The element stays allocated until freed.
    pub fn pop_front(&mut self) -> Option<ElementHandle> {
        let head = self.state.head?;
        let handle = self.state.handle_at(head);
        self.state.unlink(head);
        self.trace_op("pop_front", head);
        Some(handle)
    }

    /// Unlinks `element`. Removing an element that is not linked is a no-op.
    pub fn remove_element(&mut self, element: ElementHandle) -> bool {
        match self.state.resolve(element) {
            Some((index, SlotState::Linked)) => {
                self.state.unlink(index);
                self.trace_op("remove", index);
                true
            }
            _ => false,
        }
    }

    /// Returns a detached element to the recycle list and hands back its value.
    ///
    /// Linked, already freed and stale handles are rejected.
    pub fn free_element(&mut self, element: ElementHandle) -> Option<T> {
        match self.state.resolve(element) {
            Some((index, SlotState::Detached)) => {
                let value = {
                    let slot = &mut self.state.slots[index as usize];
                    slot.state = SlotState::Free;
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.value.take()
                };
                self.state.free.push(index);
                self.trace_op("free", index);
                value
            }
            Some((index, _)) => {
                warn!(
                    event = events::LIST_FREE_REJECTED,
                    component = COMPONENT,
                    list = %self.options.name,
                    index,
                    reason = fields::REASON_ELEMENT_ALREADY_LINKED,
                    "refusing to free a linked element"
                );
                None
            }
            None => None,
        }
    }

    /// Allocates and appends in one step.
    pub fn add_element(&mut self, value: T) -> Option<ElementHandle> {
        let handle = self.allocate_element(value)?;
        self.push_back(handle);
        Some(handle)
    }

    pub fn head(&self) -> Option<ElementHandle> {
        self.state.head.map(|index| self.state.handle_at(index))
    }

    pub fn tail(&self) -> Option<ElementHandle> {
        self.state.tail.map(|index| self.state.handle_at(index))
    }

    pub fn next(&self, element: ElementHandle) -> Option<ElementHandle> {
        match self.state.resolve(element) {
            Some((index, SlotState::Linked)) => self.state.slots[index as usize]
                .next
                .map(|next| self.state.handle_at(next)),
            _ => None,
        }
    }

    pub fn element_at_index(&self, position: usize) -> Option<ElementHandle> {
        let mut cursor = self.state.head;
        for _ in 0..position {
            cursor = self.state.slots[cursor? as usize].next;
        }
        cursor.map(|index| self.state.handle_at(index))
    }

    pub fn is_linked(&self, element: ElementHandle) -> bool {
        matches!(self.state.resolve(element), Some((_, SlotState::Linked)))
    }

    pub fn len(&self) -> usize {
        self.state.len
    }

    pub fn is_empty(&self) -> bool {
        self.state.len == 0
    }

    pub fn get(&self, element: ElementHandle) -> Option<&T> {
        let (index, _) = self.state.resolve(element)?;
        self.state.slots[index as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, element: ElementHandle) -> Option<&mut T> {
        let (index, _) = self.state.resolve(element)?;
        self.state.slots[index as usize].value.as_mut()
    }

    /// Visits every linked element in order.
    ///
    /// The successor is captured before `visit` runs, so the callback may
    /// remove (and free) the current element through the guard it receives.
    /// Traversal stops early if the callback unlinks the captured successor.
    pub fn for_each<F>(&mut self, mut visit: F)
    where
        F: FnMut(&mut ListGuard<'a, T>, ElementHandle),
    {
        let mut cursor = self.state.head;
        while let Some(index) = cursor {
            let next = self.state.slots[index as usize].next;
            let handle = self.state.handle_at(index);
            visit(self, handle);
            cursor = next.filter(|next| self.state.slots[*next as usize].state == SlotState::Linked);
        }
    }

    /// Drops every element, linked or detached, passing each value to `destructor`.
    pub fn clear<F>(&mut self, mut destructor: F)
    where
        F: FnMut(T),
    {
        let state = &mut *self.state;
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                destructor(value);
            }
            if slot.state != SlotState::Free {
                slot.state = SlotState::Free;
                slot.generation = slot.generation.wrapping_add(1);
                slot.prev = None;
                slot.next = None;
                state.free.push(index as u32);
            }
        }
        state.head = None;
        state.tail = None;
        state.len = 0;
        for current in state.cursors.values_mut() {
            *current = None;
        }
    }
}

/// Mutex-guarded list of `T` with O(1) link/unlink and slot recycling.
pub struct IntrusiveList<T> {
    options: ListOptions,
    state: Mutex<ListState<T>>,
}

impl<T> IntrusiveList<T> {
    pub fn new(options: ListOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ListState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn lock(&self) -> ListGuard<'_, T> {
        ListGuard {
            options: &self.options,
            state: self.state.lock(),
        }
    }

    pub fn allocate_element(&self, value: T) -> Option<ElementHandle> {
        self.lock().allocate_element(value)
    }

    pub fn push_back(&self, element: ElementHandle) -> bool {
        self.lock().push_back(element)
    }

    pub fn push_front(&self, element: ElementHandle) -> bool {
        self.lock().push_front(element)
    }

    pub fn insert_before(&self, position: ElementHandle, element: ElementHandle) -> bool {
        self.lock().insert_before(position, element)
    }

    pub fn pop_front(&self) -> Option<ElementHandle> {
        self.lock().pop_front()
    }

    pub fn remove_element(&self, element: ElementHandle) -> bool {
        self.lock().remove_element(element)
    }

    pub fn free_element(&self, element: ElementHandle) -> Option<T> {
        self.lock().free_element(element)
    }

    pub fn add_element(&self, value: T) -> Option<ElementHandle> {
        self.lock().add_element(value)
    }

    pub fn head(&self) -> Option<ElementHandle> {
        self.lock().head()
    }

    pub fn tail(&self) -> Option<ElementHandle> {
        self.lock().tail()
    }

    pub fn next(&self, element: ElementHandle) -> Option<ElementHandle> {
        self.lock().next(element)
    }

    pub fn element_at_index(&self, position: usize) -> Option<ElementHandle> {
        self.lock().element_at_index(position)
    }

    pub fn is_linked(&self, element: ElementHandle) -> bool {
        self.lock().is_linked(element)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn with_element<R>(&self, element: ElementHandle, read: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().get(element).map(read)
    }

    pub fn with_element_mut<R>(
        &self,
        element: ElementHandle,
        write: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        self.lock().get_mut(element).map(write)
    }

    pub fn for_each<F>(&self, visit: F)
    where
        F: for<'g> FnMut(&mut ListGuard<'g, T>, ElementHandle),
    {
        self.lock().for_each(visit)
    }

    pub fn clear<F>(&self, destructor: F)
    where
        F: FnMut(T),
    {
        self.lock().clear(destructor)
    }

    /// Creates a cursor positioned at the current head.
    pub fn cursor(&self) -> Cursor<'_, T> {
        let mut state = self.state.lock();
        let id = state.next_cursor_id;
        state.next_cursor_id += 1;
        let head = state.head;
        state.cursors.insert(id, head);
        Cursor { list: self, id }
    }
}

/// Position in a list that survives removal of the node it points at.
///
/// The list tracks every live cursor and moves it to the successor (or the
/// head, circularly) when its node is removed.
pub struct Cursor<'a, T> {
    list: &'a IntrusiveList<T>,
    id: u64,
}

impl<'a, T> Cursor<'a, T> {
    pub fn current(&self) -> Option<ElementHandle> {
        let state = self.list.state.lock();
        let index = state.cursors.get(&self.id).copied().flatten()?;
        Some(state.handle_at(index))
    }

    /// Moves to the successor, stopping at the end of the list.
    pub fn advance(&mut self) -> Option<ElementHandle> {
        self.step(false)
    }

    /// Moves to the successor, wrapping from the tail back to the head.
    pub fn advance_circular(&mut self) -> Option<ElementHandle> {
        self.step(true)
    }

    pub fn reset(&mut self) {
        let mut state = self.list.state.lock();
        let head = state.head;
        state.cursors.insert(self.id, head);
    }

    /// Links `element` before the cursor position, or at the back when the
    /// cursor is past the end.
    pub fn insert_before(&self, element: ElementHandle) -> bool {
        let mut guard = self.list.lock();
        let current = guard.state.cursors.get(&self.id).copied().flatten();
        match current {
            Some(index) => {
                let position = guard.state.handle_at(index);
                guard.insert_before(position, element)
            }
            None => guard.push_back(element),
        }
    }

    fn step(&mut self, circular: bool) -> Option<ElementHandle> {
        let mut state = self.list.state.lock();
        let current = state.cursors.get(&self.id).copied().flatten();
        let next = match current {
            Some(index) => state.slots[index as usize].next,
            None => None,
        };
        let next = match next {
            None if circular => state.head,
            other => other,
        };
        state.cursors.insert(self.id, next);
        next.map(|index| state.handle_at(index))
    }
}

impl<'a, T> Drop for Cursor<'a, T> {
    fn drop(&mut self) {
        self.list.state.lock().cursors.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{IntrusiveList, ListOptions};

    fn list_of(values: &[u32]) -> IntrusiveList<u32> {
        let list = IntrusiveList::new(ListOptions::named("test"));
        for value in values {
            list.add_element(*value).expect("allocation should succeed");
        }
        list
    }

    fn values(list: &IntrusiveList<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        list.for_each(|guard, handle| out.push(*guard.get(handle).expect("linked value")));
        out
    }

    #[test]
    fn push_front_and_back_keep_order() {
        let list = list_of(&[2, 3]);
        let first = list.allocate_element(1).expect("allocate");
        list.push_front(first);

        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.with_element(list.tail().expect("tail"), |v| *v), Some(3));
    }

    #[test]
    fn freeing_a_linked_element_is_rejected() {
        let list = list_of(&[]);
        let handle = list.add_element(7).expect("allocate");

        assert!(list.free_element(handle).is_none());
        assert_eq!(list.len(), 1);
        assert!(list.remove_element(handle));
        assert_eq!(list.free_element(handle), Some(7));
    }

    #[test]
    fn double_remove_and_double_free_are_noops() {
        let list = list_of(&[1, 2, 3]);
        let middle = list.element_at_index(1).expect("middle");

        assert!(list.remove_element(middle));
        assert!(!list.remove_element(middle));
        assert_eq!(list.free_element(middle), Some(2));
        assert!(list.free_element(middle).is_none());
        assert!(!list.remove_element(middle));

        assert_eq!(list.len(), 2);
        assert_eq!(values(&list), vec![1, 3]);
    }

    #[test]
    fn recycled_slot_does_not_honour_stale_handle() {
        let list = list_of(&[]);
        let stale = list.add_element(1).expect("allocate");
        list.remove_element(stale);
        list.free_element(stale);

        let fresh = list.add_element(2).expect("allocate reuses slot");

        assert_ne!(stale, fresh);
        assert!(!list.remove_element(stale));
        assert!(list.is_linked(fresh));
        assert_eq!(values(&list), vec![2]);
    }

    #[test]
    fn insert_before_rejects_unlinked_position_and_linked_element() {
        let list = list_of(&[1, 3]);
        let three = list.tail().expect("tail");
        let two = list.allocate_element(2).expect("allocate");
        let loose = list.allocate_element(9).expect("allocate");

        assert!(!list.insert_before(loose, two));
        assert!(!list.insert_before(three, three));
        assert!(list.insert_before(three, two));
        assert_eq!(values(&list), vec![1, 2, 3]);
    }

    #[test]
    fn pop_front_detaches_head() {
        let list = list_of(&[1, 2]);
        let head = list.pop_front().expect("head");

        assert!(!list.is_linked(head));
        assert_eq!(list.free_element(head), Some(1));
        assert_eq!(list.pop_front().and_then(|h| list.free_element(h)), Some(2));
        assert!(list.pop_front().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn for_each_allows_removing_current_node() {
        let list = list_of(&[1, 2, 3, 4]);

        list.for_each(|guard, handle| {
            if guard.get(handle).is_some_and(|v| v % 2 == 0) {
                guard.remove_element(handle);
                guard.free_element(handle);
            }
        });

        assert_eq!(values(&list), vec![1, 3]);
    }

    #[test]
    fn cursor_moves_to_successor_when_current_is_removed() {
        let list = list_of(&[0, 1, 2, 3]);
        let mut cursor = list.cursor();
        cursor.advance();
        let second = cursor.current().expect("positioned on 1");

        list.remove_element(second);

        let current = cursor.current().expect("moved to successor");
        assert_eq!(list.with_element(current, |v| *v), Some(2));
    }

    #[test]
    fn cursor_wraps_to_head_when_tail_is_removed() {
        let list = list_of(&[0, 1, 2]);
        let mut cursor = list.cursor();
        cursor.advance();
        cursor.advance();
        let tail = cursor.current().expect("on tail");

        list.remove_element(tail);
        list.free_element(tail);

        let current = cursor.current().expect("wrapped to head");
        assert_eq!(list.with_element(current, |v| *v), Some(0));
    }

    #[test]
    fn cursor_on_sole_element_ends_when_removed() {
        let list = list_of(&[5]);
        let cursor = list.cursor();

        list.pop_front();

        assert!(cursor.current().is_none());
    }

    #[test]
    fn circular_advance_wraps() {
        let list = list_of(&[0, 1]);
        let mut cursor = list.cursor();

        let seen: Vec<u32> = (0..4)
            .filter_map(|_| cursor.advance_circular())
            .filter_map(|h| list.with_element(h, |v| *v))
            .collect();

        assert_eq!(seen, vec![1, 0, 1, 0]);
        assert!({
            let mut linear = list.cursor();
            linear.advance();
            linear.advance().is_none()
        });
    }

    #[test]
    fn cursor_insert_before_links_ahead_of_position() {
        let list = list_of(&[1, 3]);
        let mut cursor = list.cursor();
        cursor.advance();
        let two = list.allocate_element(2).expect("allocate");

        assert!(cursor.insert_before(two));
        assert_eq!(values(&list), vec![1, 2, 3]);
    }

    #[test]
    fn capacity_limit_reports_exhaustion() {
        let list = IntrusiveList::new(ListOptions {
            name: "bounded".to_string(),
            debug: true,
            capacity_limit: Some(2),
        });

        assert!(list.add_element(1).is_some());
        let second = list.add_element(2).expect("second slot");
        assert!(list.allocate_element(3).is_none());

        list.remove_element(second);
        list.free_element(second);
        assert!(list.allocate_element(3).is_some());
    }

    #[test]
    fn clear_runs_destructor_for_every_value() {
        let list = list_of(&[1, 2]);
        list.allocate_element(3).expect("detached element");
        let mut destroyed = Vec::new();

        list.clear(|value| destroyed.push(value));
        destroyed.sort_unstable();

        assert_eq!(destroyed, vec![1, 2, 3]);
        assert!(list.is_empty());
        assert!(list.head().is_none());
    }
}
