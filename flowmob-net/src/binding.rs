//! Flow binding registry.
//!
//! A binding pairs a [`TrafficSelector`] with a priority and an ordered list
//! of targets (interfaces or devices). The registry owns every entry in a
//! single arena keyed by [`FlowId`]; the priority order, the exact-selector
//! index and the expiry deadlines only hold flow ids into that arena, so
//! removing an entry from the arena and from each view happens in one call.
//!
//! Expiry is data, not a callback: an entry with a non-zero lifetime has a
//! deadline in the registry's deadline set, and [`FlowBindingRegistry::expire`]
//! removes every entry whose deadline has passed. Removing an entry removes
//! its deadline in the same operation, so a cancelled deadline can never
//! fire against a freed entry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::BindingError;
use crate::selector::{FlowTuple, TrafficSelector, is_port_bearing};

/// Anything a binding can point at: an interface id or a device handle.
pub trait Target: Copy + Eq + Hash + fmt::Debug + fmt::Display {}

impl<T: Copy + Eq + Hash + fmt::Debug + fmt::Display> Target for T {}

/// Identifier of a binding entry, unique within its registry.
///
/// Ids are assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl FlowId {
    const MAX: FlowId = FlowId(u64::MAX);

    pub fn new(id: u64) -> Self {
        FlowId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binding priority. Higher values win; zero is not a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(NonZeroU32);

impl Priority {
    pub const fn new(value: u32) -> Option<Self> {
        match NonZeroU32::new(value) {
            Some(v) => Some(Priority(v)),
            None => None,
        }
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Move `target` to the front of `targets`, keeping the others in order.
///
/// A target not yet in the list is inserted at the front. Returns whether
/// the list changed.
pub fn promote<T: PartialEq>(targets: &mut Vec<T>, target: T) -> bool {
    match targets.iter().position(|t| *t == target) {
        Some(0) => false,
        Some(idx) => {
            let t = targets.remove(idx);
            targets.insert(0, t);
            true
        }
        None => {
            targets.insert(0, target);
            true
        }
    }
}

/// A single flow binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingEntry<T> {
    flow_id: FlowId,
    priority: Priority,
    selector: TrafficSelector,
    targets: Vec<T>,
    /// Zero means permanent.
    lifetime: Duration,
    expires_at: Option<Instant>,
}

impl<T: Target> BindingEntry<T> {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn selector(&self) -> &TrafficSelector {
        &self.selector
    }

    /// Targets in preference order.
    pub fn targets(&self) -> &[T] {
        &self.targets
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// No pending deadline: zero lifetime, or one too long to schedule.
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn matches(&self, flow: &FlowTuple) -> bool {
        self.selector.matches(flow)
    }
}

impl<T: Target> fmt::Display for BindingEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow Id: {} Priority: {} Targets:", self.flow_id, self.priority)?;
        for target in &self.targets {
            write!(f, " {target}")?;
        }
        write!(f, " Traffic Selector: {}", self.selector)?;
        if !self.lifetime.is_zero() {
            write!(f, " Lifetime: {:?}", self.lifetime)?;
        }
        Ok(())
    }
}

/// Priority-ordered collection of flow bindings.
pub struct FlowBindingRegistry<T> {
    last_flow_id: u64,
    /// Owning arena.
    entries: HashMap<FlowId, BindingEntry<T>>,
    /// Descending priority; among equals the most recently inserted first.
    order: Vec<FlowId>,
    /// Exact-selector index. Holds only the newest entry per selector.
    by_selector: HashMap<TrafficSelector, FlowId>,
    deadlines: BTreeSet<(Instant, FlowId)>,
}

impl<T: Target> FlowBindingRegistry<T> {
    pub fn new() -> Self {
        FlowBindingRegistry {
            last_flow_id: 0,
            entries: HashMap::new(),
            order: Vec::new(),
            by_selector: HashMap::new(),
            deadlines: BTreeSet::new(),
        }
    }

    /// Insert a binding and return its flow id.
    ///
    /// The entry is placed before the first existing entry whose priority is
    /// lower than or equal to its own. A non-zero `lifetime` arms an expiry
    /// deadline at `now + lifetime`.
    pub fn add(
        &mut self,
        selector: TrafficSelector,
        priority: Priority,
        targets: Vec<T>,
        lifetime: Duration,
        now: Instant,
    ) -> FlowId {
        self.last_flow_id += 1;
        let flow_id = FlowId(self.last_flow_id);

        let position = self.insert_position(priority);
        self.order.insert(position, flow_id);

        if let Some(previous) = self.by_selector.insert(selector, flow_id) {
            debug!(%flow_id, %previous, %selector, "Selector already bound, index now points at newest entry");
        }

        let expires_at = self.arm(flow_id, lifetime, now);
        let entry = BindingEntry {
            flow_id,
            priority,
            selector,
            targets,
            lifetime,
            expires_at,
        };
        debug!(%entry, "Added flow binding");
        self.entries.insert(flow_id, entry);
        flow_id
    }

    /// Remove a binding, cancelling its deadline. No-op for unknown ids.
    pub fn remove(&mut self, flow_id: FlowId) -> Option<BindingEntry<T>> {
        let entry = self.entries.remove(&flow_id)?;
        self.order.retain(|id| *id != flow_id);
        if self.by_selector.get(&entry.selector) == Some(&flow_id) {
            // Fall back to the newest surviving duplicate, if any.
            let survivor = self
                .entries
                .values()
                .filter(|e| e.selector == entry.selector)
                .map(|e| e.flow_id)
                .max();
            match survivor {
                Some(id) => {
                    self.by_selector.insert(entry.selector, id);
                }
                None => {
                    self.by_selector.remove(&entry.selector);
                }
            }
        }
        if let Some(at) = entry.expires_at {
            self.deadlines.remove(&(at, flow_id));
        }
        debug!(%flow_id, "Removed flow binding");
        Some(entry)
    }

    pub fn get(&self, flow_id: FlowId) -> Option<&BindingEntry<T>> {
        self.entries.get(&flow_id)
    }

    /// Exact-selector lookup.
    pub fn lookup(&self, selector: &TrafficSelector) -> Option<&BindingEntry<T>> {
        self.by_selector
            .get(selector)
            .and_then(|id| self.entries.get(id))
    }

    /// First entry, in priority order, whose selector matches `flow`.
    pub fn classify(&self, flow: &FlowTuple) -> Option<&BindingEntry<T>> {
        if !is_port_bearing(flow.protocol) {
            trace!(protocol = flow.protocol, "Unclassifiable protocol");
            return None;
        }
        let entry = self.iter().find(|entry| entry.matches(flow));
        match entry {
            Some(entry) => trace!(flow_id = %entry.flow_id, %flow, "Classified"),
            None => trace!(%flow, "No binding matches"),
        }
        entry
    }

    /// Classify a raw IPv6 datagram.
    pub fn classify_packet(&self, datagram: &[u8]) -> Option<&BindingEntry<T>> {
        let flow = crate::packet::peek_flow(datagram)?;
        self.classify(&flow)
    }

    /// Drop every entry and pending deadline.
    pub fn flush(&mut self) {
        debug!(count = self.entries.len(), "Flushing flow bindings");
        self.entries.clear();
        self.order.clear();
        self.by_selector.clear();
        self.deadlines.clear();
    }

    /// Renumber all entries in their current order.
    ///
    /// The last entry gets `start`, each earlier one `increment` more than
    /// its successor.
    pub fn reset_priorities(&mut self, start: Priority, increment: u32) -> Result<(), BindingError> {
        let overflow = || BindingError::PriorityOverflow {
            entries: self.order.len(),
            start: start.get(),
            increment,
        };

        let count = self.order.len();
        let mut priorities = Vec::with_capacity(count);
        for step in (0..count).rev() {
            let offset = u32::try_from(step)
                .ok()
                .and_then(|s| s.checked_mul(increment))
                .ok_or_else(overflow)?;
            let value = start.0.checked_add(offset).ok_or_else(overflow)?;
            priorities.push(Priority(value));
        }

        for (flow_id, priority) in self.order.iter().zip(priorities) {
            if let Some(entry) = self.entries.get_mut(flow_id) {
                entry.priority = priority;
            }
        }
        debug!(start = start.get(), increment, count, "Reset binding priorities");
        Ok(())
    }

    /// Change an entry's priority, moving it as a fresh insert would.
    pub fn set_priority(&mut self, flow_id: FlowId, priority: Priority) -> Result<(), BindingError> {
        if !self.entries.contains_key(&flow_id) {
            return Err(BindingError::UnknownFlow(flow_id));
        }
        self.order.retain(|id| *id != flow_id);
        let position = self.insert_position(priority);
        self.order.insert(position, flow_id);
        if let Some(entry) = self.entries.get_mut(&flow_id) {
            entry.priority = priority;
        }
        Ok(())
    }

    /// Replace an entry's target list.
    pub fn set_targets(&mut self, flow_id: FlowId, targets: Vec<T>) -> Result<(), BindingError> {
        let entry = self
            .entries
            .get_mut(&flow_id)
            .ok_or(BindingError::UnknownFlow(flow_id))?;
        debug!(%flow_id, ?targets, "Setting binding targets");
        entry.targets = targets;
        Ok(())
    }

    /// Move `target` to the front of an entry's target list.
    ///
    /// Returns whether the order changed.
    pub fn promote(&mut self, flow_id: FlowId, target: T) -> Result<bool, BindingError> {
        let entry = self
            .entries
            .get_mut(&flow_id)
            .ok_or(BindingError::UnknownFlow(flow_id))?;
        let changed = promote(&mut entry.targets, target);
        if changed {
            debug!(%flow_id, %target, targets = ?entry.targets, "Promoted binding target");
        }
        Ok(changed)
    }

    /// Cancel an entry's deadline and re-arm it for `lifetime` from `now`.
    ///
    /// A zero lifetime makes the entry permanent.
    pub fn refresh(&mut self, flow_id: FlowId, lifetime: Duration, now: Instant) -> Result<(), BindingError> {
        let previous = self
            .entries
            .get(&flow_id)
            .ok_or(BindingError::UnknownFlow(flow_id))?
            .expires_at;
        if let Some(at) = previous {
            self.deadlines.remove(&(at, flow_id));
        }
        let expires_at = self.arm(flow_id, lifetime, now);
        if let Some(entry) = self.entries.get_mut(&flow_id) {
            entry.lifetime = lifetime;
            entry.expires_at = expires_at;
        }
        trace!(%flow_id, ?lifetime, "Refreshed binding lifetime");
        Ok(())
    }

    /// Remove every entry whose deadline is at or before `now`.
    ///
    /// Due ids are collected before anything is erased.
    pub fn expire(&mut self, now: Instant) -> Vec<BindingEntry<T>> {
        let due: Vec<FlowId> = self
            .deadlines
            .range(..=(now, FlowId::MAX))
            .map(|(_, flow_id)| *flow_id)
            .collect();

        let expired: Vec<_> = due.into_iter().filter_map(|id| self.remove(id)).collect();
        for entry in &expired {
            debug!(flow_id = %entry.flow_id, selector = %entry.selector, "Flow binding expired");
        }
        expired
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _)| *at)
    }

    /// Entries in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &BindingEntry<T>> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Flow ids in priority order.
    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_position(&self, priority: Priority) -> usize {
        self.order
            .iter()
            .position(|id| self.entries.get(id).is_some_and(|e| e.priority <= priority))
            .unwrap_or(self.order.len())
    }

    fn arm(&mut self, flow_id: FlowId, lifetime: Duration, now: Instant) -> Option<Instant> {
        if lifetime.is_zero() {
            return None;
        }
        let Some(at) = now.checked_add(lifetime) else {
            debug!(%flow_id, ?lifetime, "Lifetime beyond the clock range, binding is permanent");
            return None;
        };
        self.deadlines.insert((at, flow_id));
        Some(at)
    }
}

impl<T: Target> Default for FlowBindingRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Target> fmt::Display for FlowBindingRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.iter() {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
