//! Flow-aware route selection.
//!
//! A [`FlowRouter`] owns a [`RouteTable`] and a [`FlowBindingRegistry`].
//! For a classified packet it collects every route whose prefix contains
//! the destination and picks the one owned by the earliest target in the
//! matching binding's target list. Reordering those targets moves the flow
//! to another access path without touching its addresses.

use std::fmt;
use std::net::Ipv6Addr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::binding::{BindingEntry, FlowBindingRegistry, FlowId, Target};
use crate::packet::{peek_flow, peek_ipv6};
use crate::routing::{Route, RouteTable};
use crate::selector::FlowTuple;

/// Anchor-side target: an access-technology tunnel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(pub u32);

impl From<u32> for InterfaceId {
    fn from(id: u32) -> Self {
        InterfaceId(id)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-side target: a local network device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        DeviceId(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Router at a mobility anchor; bindings are provisioned.
pub type AnchorRouter = FlowRouter<InterfaceId>;

/// Router on a multi-homed host; bindings are learned.
pub type HostRouter = FlowRouter<DeviceId>;

/// A route chosen by flow binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRoute<T> {
    /// Binding that governed the choice.
    pub flow_id: FlowId,
    pub route: Route<T>,
    pub source: Option<Ipv6Addr>,
}

impl<T: Target> SelectedRoute<T> {
    pub fn interface(&self) -> T {
        self.route.interface
    }
}

/// Outcome of routing an outgoing packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision<T> {
    /// A flow binding picked the route.
    Flow(SelectedRoute<T>),
    /// No binding applied; plain longest-prefix match.
    Fallback(Route<T>),
    /// Nothing routes this destination.
    NoRoute,
}

impl<T: Target> fmt::Display for RoutingDecision<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingDecision::Flow(selected) => {
                write!(f, "flow {} via {}", selected.flow_id, selected.route.interface)?;
                if let Some(source) = selected.source {
                    write!(f, " src {source}")?;
                }
                Ok(())
            }
            RoutingDecision::Fallback(route) => {
                write!(f, "fallback {} via {}", route.destination, route.interface)
            }
            RoutingDecision::NoRoute => write!(f, "no route"),
        }
    }
}

pub struct FlowRouter<T> {
    routes: RouteTable<T>,
    bindings: FlowBindingRegistry<T>,
}

impl<T: Target> FlowRouter<T> {
    pub fn new() -> Self {
        FlowRouter {
            routes: RouteTable::new(),
            bindings: FlowBindingRegistry::new(),
        }
    }

    pub fn routes(&self) -> &RouteTable<T> {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut RouteTable<T> {
        &mut self.routes
    }

    pub fn bindings(&self) -> &FlowBindingRegistry<T> {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut FlowBindingRegistry<T> {
        &mut self.bindings
    }

    /// Pick a route for `packet` by its flow binding.
    ///
    /// Returns `None` when the packet is not classifiable, no binding
    /// matches, or none of the binding's targets owns a route to
    /// `destination`.
    pub fn select_route(&self, packet: &[u8], destination: Ipv6Addr) -> Option<SelectedRoute<T>> {
        let flow = peek_flow(packet)?;
        self.select_route_for(&flow, destination, None)
    }

    /// Pick a route for an already-decoded flow, optionally restricted to
    /// one output interface.
    pub fn select_route_for(
        &self,
        flow: &FlowTuple,
        destination: Ipv6Addr,
        output_interface: Option<T>,
    ) -> Option<SelectedRoute<T>> {
        let entry = self.bindings.classify(flow)?;

        let candidates: Vec<&Route<T>> = self
            .routes
            .candidates(destination, output_interface)
            .collect();

        for target in entry.targets() {
            let best = candidates
                .iter()
                .filter(|r| r.interface == *target)
                .max_by_key(|r| (r.destination.prefix_len(), std::cmp::Reverse(r.metric)));
            if let Some(route) = best {
                trace!(flow_id = %entry.flow_id(), %target, %destination, "Flow route selected");
                return Some(SelectedRoute {
                    flow_id: entry.flow_id(),
                    route: (*route).clone(),
                    source: self.routes.select_source(route, destination),
                });
            }
        }

        trace!(flow_id = %entry.flow_id(), %destination, "No target owns a candidate route");
        None
    }

    /// Route an outgoing datagram, falling back to longest-prefix match when
    /// no binding applies.
    pub fn route_output(&self, packet: &[u8], output_interface: Option<T>) -> RoutingDecision<T> {
        let Some(header) = peek_ipv6(packet) else {
            return RoutingDecision::NoRoute;
        };
        let destination = header.destination;

        if let Some(flow) = peek_flow(packet)
            && let Some(selected) = self.select_route_for(&flow, destination, output_interface)
        {
            return RoutingDecision::Flow(selected);
        }

        let fallback = match output_interface {
            Some(_) => self
                .routes
                .candidates(destination, output_interface)
                .max_by_key(|r| (r.destination.prefix_len(), std::cmp::Reverse(r.metric))),
            None => self.routes.lookup(destination),
        };
        match fallback {
            Some(route) => RoutingDecision::Fallback(route.clone()),
            None => RoutingDecision::NoRoute,
        }
    }

    /// [`route_output`](Self::route_output) without an interface restriction.
    pub fn route(&self, packet: &[u8]) -> RoutingDecision<T> {
        self.route_output(packet, None)
    }

    /// Drop bindings whose lifetime ran out.
    pub fn expire(&mut self, now: Instant) -> Vec<BindingEntry<T>> {
        self.bindings.expire(now)
    }
}

impl<T: Target> Default for FlowRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Target> fmt::Display for FlowRouter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.routes)?;
        write!(f, "{}", self.bindings)
    }
}
