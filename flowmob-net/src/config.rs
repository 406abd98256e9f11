//! Router configuration file.
//!
//! A JSON document describing one router: its interfaces and their
//! addresses, static routes, provisioned bindings, and the learning and
//! handover policies.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;
use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binding::{Priority, Target};
use crate::controller::{HandoverPolicy, HostLearner};
use crate::engine::DEFAULT_QUEUE_DEPTH;
use crate::error::ConfigError;
use crate::router::FlowRouter;
use crate::selector::{PROTO_TCP, PROTO_UDP, PortRange, TrafficSelector};

/// Deployment role of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Mobility anchor: bindings are provisioned.
    #[default]
    Anchor,
    /// Multi-homed host: bindings are learned from inbound traffic.
    Host,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anchor => "anchor",
            Role::Host => "host",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anchor" => Ok(Role::Anchor),
            "host" => Ok(Role::Host),
            _ => Err(()),
        }
    }
}

/// Port-bearing transport protocols a binding can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => PROTO_TCP,
            TransportProtocol::Udp => PROTO_UDP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<Ipv6Net>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub destination: Ipv6Net,
    #[serde(default)]
    pub gateway: Option<Ipv6Addr>,
    /// Interface name.
    pub interface: String,
    #[serde(default)]
    pub prefix_to_use: Option<Ipv6Addr>,
    #[serde(default)]
    pub metric: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingConfig {
    pub protocol: TransportProtocol,
    #[serde(default)]
    pub source: Ipv6Net,
    #[serde(default)]
    pub destination: Ipv6Net,
    #[serde(default)]
    pub source_ports: PortRange,
    #[serde(default)]
    pub destination_ports: PortRange,
    pub priority: u32,
    /// Interface names in preference order.
    pub targets: Vec<String>,
    /// Zero means permanent.
    #[serde(default)]
    pub lifetime_secs: u64,
}

impl BindingConfig {
    pub fn selector(&self) -> TrafficSelector {
        TrafficSelector::new(self.protocol.number())
            .with_source(self.source.trunc())
            .with_destination(self.destination.trunc())
            .with_source_ports(self.source_ports)
            .with_destination_ports(self.destination_ports)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LearningConfig {
    pub priority: u32,
    pub lifetime_ms: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            priority: 10000,
            lifetime_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HandoverConfig {
    pub history: usize,
    pub threshold_db: f64,
    pub hysteresis_db: f64,
    pub sample_ttl_ms: u64,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        let policy = HandoverPolicy::default();
        HandoverConfig {
            history: policy.history,
            threshold_db: policy.threshold_db,
            hysteresis_db: policy.hysteresis_db,
            sample_ttl_ms: policy.sample_ttl.as_millis() as u64,
        }
    }
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    pub name: String,
    #[serde(default)]
    pub role: Role,
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub handover: HandoverConfig,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl RouterConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RouterConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        debug!(path = %path.display(), name = %config.name, role = config.role.as_str(), "Loaded router config");
        Ok(config)
    }

    /// Check names and priorities without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interface_ids()?;
        self.resolve_routes()?;
        self.resolve_bindings()?;
        if self.learning.priority == 0 {
            return Err(ConfigError::ZeroPriority("learning".to_string()));
        }
        Ok(())
    }

    /// Interface id for a configured interface name.
    pub fn interface_id(&self, name: &str) -> Option<u32> {
        self.interfaces
            .iter()
            .find(|iface| iface.name == name)
            .map(|iface| iface.id)
    }

    /// Build a router with every interface, route and binding installed.
    pub fn build<T: Target + From<u32>>(&self, now: Instant) -> Result<FlowRouter<T>, ConfigError> {
        let mut router = FlowRouter::new();

        for iface in &self.interfaces {
            router
                .routes_mut()
                .interface_up(T::from(iface.id), iface.addresses.clone());
        }

        for (route, interface) in self.resolve_routes()? {
            router.routes_mut().add_network_route(
                route.destination,
                route.gateway,
                T::from(interface),
                route.prefix_to_use,
                route.metric,
            );
        }

        for (binding, priority, targets) in self.resolve_bindings()? {
            router.bindings_mut().add(
                binding.selector(),
                priority,
                targets.into_iter().map(T::from).collect(),
                Duration::from_secs(binding.lifetime_secs),
                now,
            );
        }

        Ok(router)
    }

    /// Learner over every configured interface, for the host role.
    pub fn learner<T: Target + From<u32>>(&self) -> Result<Option<HostLearner<T>>, ConfigError> {
        if self.role != Role::Host {
            return Ok(None);
        }
        let priority = Priority::new(self.learning.priority)
            .ok_or_else(|| ConfigError::ZeroPriority("learning".to_string()))?;
        let devices = self.interfaces.iter().map(|i| T::from(i.id)).collect();
        Ok(Some(
            HostLearner::new(devices)
                .with_priority(priority)
                .with_lifetime(Duration::from_millis(self.learning.lifetime_ms)),
        ))
    }

    pub fn handover_policy(&self) -> HandoverPolicy {
        HandoverPolicy {
            history: self.handover.history,
            threshold_db: self.handover.threshold_db,
            hysteresis_db: self.handover.hysteresis_db,
            sample_ttl: Duration::from_millis(self.handover.sample_ttl_ms),
        }
    }

    fn interface_ids(&self) -> Result<HashMap<&str, u32>, ConfigError> {
        let mut by_name = HashMap::new();
        let mut ids = HashSet::new();
        for iface in &self.interfaces {
            if by_name.insert(iface.name.as_str(), iface.id).is_some() || !ids.insert(iface.id) {
                return Err(ConfigError::DuplicateInterface(iface.name.clone()));
            }
        }
        Ok(by_name)
    }

    fn resolve_routes(&self) -> Result<Vec<(&RouteConfig, u32)>, ConfigError> {
        let ids = self.interface_ids()?;
        self.routes
            .iter()
            .map(|route| {
                ids.get(route.interface.as_str())
                    .map(|id| (route, *id))
                    .ok_or_else(|| ConfigError::UnknownInterface(route.interface.clone()))
            })
            .collect()
    }

    fn resolve_bindings(&self) -> Result<Vec<(&BindingConfig, Priority, Vec<u32>)>, ConfigError> {
        let ids = self.interface_ids()?;
        self.bindings
            .iter()
            .enumerate()
            .map(|(idx, binding)| {
                let priority = Priority::new(binding.priority)
                    .ok_or_else(|| ConfigError::ZeroPriority(format!("binding {idx}")))?;
                if binding.targets.is_empty() {
                    return Err(ConfigError::NoTargets(idx));
                }
                let targets = binding
                    .targets
                    .iter()
                    .map(|name| {
                        ids.get(name.as_str())
                            .copied()
                            .ok_or_else(|| ConfigError::UnknownInterface(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((binding, priority, targets))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{DeviceId, InterfaceId};
    use std::io::Write;

    const ANCHOR: &str = r#"{
        "name": "lma",
        "role": "anchor",
        "interfaces": [
            { "id": 4, "name": "wifi", "addresses": ["2001:db8:1::1/64"] },
            { "id": 8, "name": "lte", "addresses": ["2001:db8:2::1/64"] }
        ],
        "routes": [
            { "destination": "2001:db8:aa::/48", "interface": "wifi" },
            { "destination": "2001:db8:aa::/48", "interface": "lte", "metric": 5 }
        ],
        "bindings": [
            { "protocol": "tcp", "destination_ports": "80", "priority": 10, "targets": ["lte", "wifi"] },
            { "protocol": "udp", "priority": 5, "targets": ["wifi"], "lifetime_secs": 30 }
        ]
    }"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_build_anchor() {
        let file = write_config(ANCHOR);
        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.role, Role::Anchor);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.interface_id("lte"), Some(8));

        let router = config.build::<InterfaceId>(Instant::now()).unwrap();
        // Two on-link routes plus two configured routes.
        assert_eq!(router.routes().len(), 4);
        assert_eq!(router.bindings().len(), 2);

        let first = router.bindings().iter().next().unwrap();
        assert_eq!(first.priority().get(), 10);
        assert_eq!(first.targets(), &[InterfaceId(8), InterfaceId(4)]);
        assert_eq!(first.selector().destination_ports(), PortRange::single(80));
        assert!(router.bindings().next_deadline().is_some());

        assert!(config.learner::<InterfaceId>().unwrap().is_none());
    }

    #[test]
    fn test_huge_binding_lifetime_is_permanent() {
        let config: RouterConfig =
            serde_json::from_str(&ANCHOR.replace(r#""lifetime_secs": 30"#, r#""lifetime_secs": 18446744073709551615"#))
                .unwrap();
        config.validate().unwrap();
        let router = config.build::<InterfaceId>(Instant::now()).unwrap();
        assert_eq!(router.bindings().len(), 2);
        assert!(router.bindings().iter().all(|entry| entry.is_permanent()));
        assert!(router.bindings().next_deadline().is_none());
    }

    #[test]
    fn test_host_learner() {
        let config: RouterConfig = serde_json::from_str(
            r#"{
                "name": "mn",
                "role": "host",
                "interfaces": [{ "id": 1, "name": "eth0" }, { "id": 2, "name": "wlan0" }],
                "learning": { "lifetime_ms": 2000 }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        let learner = config.learner::<DeviceId>().unwrap().unwrap();
        assert_eq!(learner.devices(), &[DeviceId(1), DeviceId(2)]);
        assert_eq!(config.handover_policy(), HandoverPolicy::default());
    }

    #[test]
    fn test_unknown_interface() {
        let file = write_config(&ANCHOR.replace(r#""targets": ["wifi"]"#, r#""targets": ["wlan9"]"#));
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(ConfigError::UnknownInterface(name)) if name == "wlan9"
        ));
    }

    #[test]
    fn test_zero_priority() {
        let file = write_config(&ANCHOR.replace(r#""priority": 5"#, r#""priority": 0"#));
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(ConfigError::ZeroPriority(what)) if what == "binding 1"
        ));
    }

    #[test]
    fn test_empty_targets() {
        let file = write_config(&ANCHOR.replace(r#""targets": ["wifi"]"#, r#""targets": []"#));
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(ConfigError::NoTargets(1))
        ));
    }

    #[test]
    fn test_duplicate_interface() {
        let file = write_config(&ANCHOR.replace(r#""id": 8"#, r#""id": 4"#));
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(ConfigError::DuplicateInterface(name)) if name == "lte"
        ));
    }

    #[test]
    fn test_invalid_port_range() {
        let file = write_config(&ANCHOR.replace(r#""80""#, r#""90-80""#));
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RouterConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::Anchor, Role::Host] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("router".parse::<Role>().is_err());
    }
}
