// bgp-interop-lab: Scenario-driven interoperability testing for BGP speakers
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! The in-memory model of one scenario's topology: all speaker nodes and all virtual bridges,
//! keyed by logical name, together with the currently active address family.

use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

use ipnet::IpNet;
use thiserror::Error;
use tokio::time::sleep;

use crate::{
    runtime::ContainerRuntime,
    speaker::BgpSpeaker,
    LabError,
};

mod bridge;
pub use bridge::VirtualBridge;

/// The address family a bridge set (and the data plane built on it) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The address family of a subnet.
    pub fn of(subnet: IpNet) -> Self {
        match subnet {
            IpNet::V4(_) => Self::Ipv4,
            IpNet::V6(_) => Self::Ipv6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("ipv4"),
            Self::Ipv6 => f.write_str("ipv6"),
        }
    }
}

/// Owner of all [`BgpSpeaker`] nodes and all [`VirtualBridge`] instances of one scenario run.
///
/// Bridges are keyed by address family and logical name, so the same logical name (say, `br01`)
/// can exist once per family. The registry also records which family is currently built on the
/// wire. The registry is the only shared mutable resource of a run; the executor is
/// single-threaded, so no locking is needed.
#[derive(Default)]
pub struct TopologyRegistry {
    nodes: BTreeMap<String, Box<dyn BgpSpeaker>>,
    bridges: BTreeMap<(AddressFamily, String), VirtualBridge>,
    active: Option<AddressFamily>,
}

impl TopologyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Router identifiers must be unique across all nodes of a scenario.
    pub fn add_node(&mut self, node: Box<dyn BgpSpeaker>) -> Result<(), ConfigError> {
        if self.nodes.contains_key(node.name()) {
            return Err(ConfigError::DuplicateNode {
                node: node.name().to_string(),
            });
        }
        if let Some(existing) = self
            .nodes
            .values()
            .find(|n| n.router_id() == node.router_id())
        {
            return Err(ConfigError::RouterIdCollision {
                name: node.name().to_string(),
                router_id: node.router_id(),
                existing: existing.name().to_string(),
            });
        }
        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    /// Declare a bridge. Declaring the same name with the same subnet again is a no-op; the same
    /// name with a different subnet is a configuration error.
    pub fn create_bridge(
        &mut self,
        name: impl Into<String>,
        subnet: IpNet,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let family = AddressFamily::of(subnet);
        if let Some(existing) = self.bridges.get(&(family, name.clone())) {
            if existing.subnet() == subnet {
                return Ok(());
            }
            return Err(ConfigError::BridgeSubnetMismatch {
                bridge: name,
                existing: existing.subnet(),
                requested: subnet,
            });
        }
        self.bridges
            .insert((family, name.clone()), VirtualBridge::new(name, subnet));
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, name: &str) -> Result<&dyn BgpSpeaker, ConfigError> {
        self.nodes
            .get(name)
            .map(|n| n.as_ref())
            .ok_or_else(|| ConfigError::UnknownNode {
                node: name.to_string(),
            })
    }

    /// Look up a node for modification.
    pub fn node_mut(&mut self, name: &str) -> Result<&mut (dyn BgpSpeaker + 'static), ConfigError> {
        self.nodes
            .get_mut(name)
            .map(|n| n.as_mut())
            .ok_or_else(|| ConfigError::UnknownNode {
                node: name.to_string(),
            })
    }

    /// Look up a bridge.
    pub fn bridge(&self, family: AddressFamily, name: &str) -> Result<&VirtualBridge, ConfigError> {
        self.bridges
            .get(&(family, name.to_string()))
            .ok_or_else(|| ConfigError::UnknownBridge {
                bridge: name.to_string(),
            })
    }

    /// Names of all registered nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// The address family that is currently built on the wire, if any.
    pub fn active_family(&self) -> Option<AddressFamily> {
        self.active
    }

    /// Record which address family is currently built on the wire.
    pub fn set_active_family(&mut self, family: AddressFamily) {
        self.active = Some(family);
    }

    /// Attach a node to a bridge of the given family, assigning it the next unused address of the
    /// bridge's subnet.
    pub async fn attach(
        &mut self,
        runtime: &dyn ContainerRuntime,
        family: AddressFamily,
        bridge: &str,
        node: &str,
    ) -> Result<IpNet, LabError> {
        let b = self
            .bridges
            .get_mut(&(family, bridge.to_string()))
            .ok_or_else(|| ConfigError::UnknownBridge {
                bridge: bridge.to_string(),
            })?;
        let n = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| ConfigError::UnknownNode {
                node: node.to_string(),
            })?;
        b.attach(runtime, n.as_mut()).await
    }

    /// Start all nodes. The start calls are issued back to back, each node reports its own
    /// warm-up delay, and we sleep once for the maximum. This bounds total startup latency by the
    /// slowest node instead of the sum over all nodes.
    pub async fn start_all(&mut self) -> Result<(), LabError> {
        let mut warmup = Duration::ZERO;
        for node in self.nodes.values_mut() {
            let delay = node.start().await?;
            warmup = warmup.max(delay);
        }
        if !warmup.is_zero() {
            log::info!("waiting {}s for the daemons to warm up", warmup.as_secs());
            sleep(warmup).await;
        }
        Ok(())
    }

    /// Stop all nodes. Stopping drops each node's attachments and peer state, so a subsequent
    /// start rebuilds the topology from scratch.
    pub async fn stop_all(&mut self) -> Result<(), LabError> {
        for node in self.nodes.values_mut() {
            node.stop().await?;
        }
        Ok(())
    }

    /// Tear down every bridge of the given family. Idempotent.
    pub async fn teardown_bridges(
        &mut self,
        runtime: &dyn ContainerRuntime,
        family: AddressFamily,
    ) -> Result<(), LabError> {
        for ((f, _), bridge) in self.bridges.iter_mut() {
            if *f == family {
                bridge.teardown(runtime).await?;
            }
        }
        Ok(())
    }

    /// Best-effort teardown of everything the registry owns: all started nodes and all bridges,
    /// regardless of family. Failures are logged and do not stop the remaining cleanup, so a
    /// failed phase never leaks namespaces or segments across runs.
    pub async fn teardown(&mut self, runtime: &dyn ContainerRuntime) {
        for node in self.nodes.values_mut() {
            if let Err(e) = node.stop().await {
                log::warn!("[{}] cannot stop node during teardown: {e}", node.name());
            }
        }
        for bridge in self.bridges.values_mut() {
            if let Err(e) = bridge.teardown(runtime).await {
                log::warn!(
                    "[{}] cannot remove segment during teardown: {e}",
                    bridge.name()
                );
            }
        }
        self.active = None;
    }
}

/// Invalid or conflicting topology or peer configuration. Never retried; aborts the phase.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A bridge of this name already exists with a different subnet.
    #[error("bridge {bridge} already exists with subnet {existing} (requested {requested})")]
    BridgeSubnetMismatch {
        bridge: String,
        existing: IpNet,
        requested: IpNet,
    },
    /// The subnet of a bridge has no unused addresses left.
    #[error("subnet {subnet} of bridge {bridge} is exhausted")]
    SubnetExhausted { bridge: String, subnet: IpNet },
    /// A node of this name is already registered.
    #[error("node {node} is already registered")]
    DuplicateNode { node: String },
    /// Two distinct nodes or peers use the same router identifier.
    #[error("router id {router_id} of {name} collides with {existing}")]
    RouterIdCollision {
        name: String,
        router_id: Ipv4Addr,
        existing: String,
    },
    /// Two nodes that should peer do not share any bridge.
    #[error("{node} and {peer} share no bridge")]
    NoSharedBridge { node: String, peer: String },
    /// The named peer was never configured on this node.
    #[error("{node} has no configured peer named {peer}")]
    UnknownPeer { node: String, peer: String },
    /// No node of this name is registered.
    #[error("unknown node {node}")]
    UnknownNode { node: String },
    /// No bridge of this name is registered.
    #[error("unknown bridge {bridge}")]
    UnknownBridge { bridge: String },
    /// The operation requires the node to be running.
    #[error("node {node} is not running")]
    NotRunning { node: String },
}
