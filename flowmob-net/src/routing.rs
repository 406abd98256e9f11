//! Destination-prefix route table with LPM lookup.
//!
//! The table keeps every route (several routes may share a prefix, one per
//! access path) and a prefix trie over the distinct destination prefixes for
//! longest-prefix-match fallback lookups. It also remembers the addresses
//! configured on each interface for source address selection.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use prefix_trie::PrefixMap;
use tracing::{debug, warn};

use crate::binding::Target;

/// A single destination-prefix route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<T> {
    /// Destination prefix (host bits cleared).
    pub destination: Ipv6Net,
    /// Next hop. `None` for on-link destinations.
    pub gateway: Option<Ipv6Addr>,
    /// Owning interface or device.
    pub interface: T,
    /// Source address hint.
    pub prefix_to_use: Option<Ipv6Addr>,
    pub metric: u32,
}

impl<T: Target> Route<T> {
    pub fn is_host(&self) -> bool {
        self.destination.prefix_len() == 128
    }

    pub fn is_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    fn flags(&self) -> String {
        let mut flags = String::from("U");
        if self.is_host() {
            flags.push('H');
        } else if self.is_gateway() {
            flags.push('G');
        }
        flags
    }
}

impl<T: Target> fmt::Display for Route<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gateway = self.gateway.unwrap_or(Ipv6Addr::UNSPECIFIED);
        write!(
            f,
            "{:<31}{:<27}{:<5}{:<4}-   -   {}",
            self.destination.to_string(),
            gateway.to_string(),
            self.flags(),
            self.metric,
            self.interface
        )
    }
}

/// Route table over IPv6 destination prefixes.
#[derive(Clone)]
pub struct RouteTable<T> {
    routes: Vec<Route<T>>,
    /// Distinct destination prefixes, rebuilt on every change.
    prefixes: PrefixMap<Ipv6Net, ()>,
    addresses: HashMap<T, Vec<Ipv6Net>>,
}

impl<T: Target> RouteTable<T> {
    pub fn new() -> Self {
        RouteTable {
            routes: Vec::new(),
            prefixes: PrefixMap::new(),
            addresses: HashMap::new(),
        }
    }

    /// Install a route.
    ///
    /// A route with the same destination, interface and gateway as an
    /// existing one replaces it.
    pub fn add_route(&mut self, mut route: Route<T>) {
        route.destination = route.destination.trunc();
        debug!(
            destination = %route.destination,
            gateway = ?route.gateway,
            interface = %route.interface,
            metric = route.metric,
            "Adding route"
        );
        match self.routes.iter_mut().find(|r| {
            r.destination == route.destination
                && r.interface == route.interface
                && r.gateway == route.gateway
        }) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
        self.reindex();
    }

    pub fn add_network_route(
        &mut self,
        destination: Ipv6Net,
        gateway: Option<Ipv6Addr>,
        interface: T,
        prefix_to_use: Option<Ipv6Addr>,
        metric: u32,
    ) {
        self.add_route(Route {
            destination,
            gateway,
            interface,
            prefix_to_use,
            metric,
        });
    }

    /// Install a /128 route to a single host.
    pub fn add_host_route(
        &mut self,
        destination: Ipv6Addr,
        gateway: Option<Ipv6Addr>,
        interface: T,
        metric: u32,
    ) {
        self.add_network_route(Ipv6Net::from(destination), gateway, interface, None, metric);
    }

    /// Install a `::/0` route.
    pub fn set_default_route(
        &mut self,
        gateway: Ipv6Addr,
        interface: T,
        prefix_to_use: Option<Ipv6Addr>,
        metric: u32,
    ) {
        self.add_network_route(
            Ipv6Net::default(),
            Some(gateway),
            interface,
            prefix_to_use,
            metric,
        );
    }

    /// Remove every route to `destination` through `interface`.
    ///
    /// Returns the number of routes removed.
    pub fn remove_route(&mut self, destination: Ipv6Net, interface: T) -> usize {
        let destination = destination.trunc();
        let before = self.routes.len();
        self.routes
            .retain(|r| !(r.destination == destination && r.interface == interface));
        let removed = before - self.routes.len();
        if removed == 0 {
            warn!(%destination, %interface, "No such route");
        } else {
            self.reindex();
        }
        removed
    }

    /// Record an interface's addresses and install on-link routes for them.
    pub fn interface_up(&mut self, interface: T, addresses: Vec<Ipv6Net>) {
        debug!(%interface, ?addresses, "Interface up");
        for address in &addresses {
            self.add_network_route(address.trunc(), None, interface, None, 0);
        }
        self.addresses.insert(interface, addresses);
    }

    /// Forget an interface and every route through it.
    pub fn interface_down(&mut self, interface: T) -> usize {
        self.addresses.remove(&interface);
        let before = self.routes.len();
        self.routes.retain(|r| r.interface != interface);
        let removed = before - self.routes.len();
        debug!(%interface, removed, "Interface down");
        self.reindex();
        removed
    }

    /// Addresses configured on `interface`.
    pub fn addresses(&self, interface: T) -> &[Ipv6Net] {
        self.addresses
            .get(&interface)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Lowest-metric default route.
    pub fn default_route(&self) -> Option<&Route<T>> {
        self.routes
            .iter()
            .filter(|r| r.is_default())
            .min_by_key(|r| r.metric)
    }

    /// Longest-prefix-match lookup; lowest metric among routes sharing the prefix.
    pub fn lookup(&self, destination: Ipv6Addr) -> Option<&Route<T>> {
        let (prefix, _) = self.prefixes.get_lpm(&Ipv6Net::from(destination))?;
        self.routes
            .iter()
            .filter(|r| r.destination == *prefix)
            .min_by_key(|r| r.metric)
    }

    /// Every route whose prefix contains `destination`, optionally restricted
    /// to one output interface.
    pub fn candidates(
        &self,
        destination: Ipv6Addr,
        output_interface: Option<T>,
    ) -> impl Iterator<Item = &Route<T>> {
        self.routes.iter().filter(move |r| {
            r.destination.contains(&destination)
                && output_interface.is_none_or(|oif| oif == r.interface)
        })
    }

    /// Pick the source address for a packet to `destination` leaving via `route`.
    ///
    /// The reference address is the route's `prefix_to_use` if set, the
    /// packet destination for on-link and default routes, and the gateway
    /// otherwise. An interface address inside the reference's network wins;
    /// failing that, the first address whose scope (link-local or not)
    /// matches the reference.
    pub fn select_source(&self, route: &Route<T>, destination: Ipv6Addr) -> Option<Ipv6Addr> {
        let reference = match (route.prefix_to_use, route.gateway) {
            (Some(hint), _) => hint,
            (None, None) => destination,
            (None, Some(_)) if route.is_default() => destination,
            (None, Some(gateway)) => gateway,
        };

        let addresses = self.addresses(route.interface);
        addresses
            .iter()
            .find(|net| net.contains(&reference))
            .or_else(|| {
                addresses
                    .iter()
                    .find(|net| is_link_local(net.addr()) == is_link_local(reference))
            })
            .map(|net| net.addr())
    }

    pub fn routes(&self) -> &[Route<T>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn reindex(&mut self) {
        let mut prefixes = PrefixMap::new();
        for route in &self.routes {
            prefixes.insert(route.destination, ());
        }
        self.prefixes = prefixes;
    }
}

impl<T: Target> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Target> fmt::Display for RouteTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Destination                    Next Hop                   Flag Met Ref Use If"
        )?;
        for route in &self.routes {
            writeln!(f, "{route}")?;
        }
        Ok(())
    }
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
