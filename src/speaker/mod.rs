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

//! The polymorphic speaker abstraction.
//!
//! A [`BgpSpeaker`] is one running BGP daemon in its own network namespace. Two families are
//! implemented with an identical external contract and divergent configuration mechanics:
//! [`gobgp::GoBgpNode`] is driven through a structured management interface, while
//! [`quagga::QuaggaNode`] is configured through rendered configuration files and queried over its
//! console protocol. The executor is written only against the trait.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

use crate::{
    runtime::{ContainerHandle, ContainerRuntime},
    topology::ConfigError,
    LabError,
};

pub mod gobgp;
pub mod quagga;

/// The BGP session establishment state machine stage of a peering relationship, as reported by
/// one side. The harness treats every state other than [`BgpState::Established`] uniformly as
/// "not yet converged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BgpState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl FromStr for BgpState {
    type Err = ParseError;

    /// Parse a session state, accepting the spellings of both daemon families (for example
    /// `Established`, `ESTABLISHED`, or `BGP_FSM_ESTABLISHED`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized
            .strip_prefix("bgp_fsm_")
            .unwrap_or(&normalized)
            .replace(['_', '-'], "");
        match normalized.as_str() {
            "idle" => Ok(Self::Idle),
            "connect" => Ok(Self::Connect),
            "active" => Ok(Self::Active),
            "opensent" => Ok(Self::OpenSent),
            "openconfirm" => Ok(Self::OpenConfirm),
            "established" => Ok(Self::Established),
            _ => Err(ParseError::UnknownState(s.to_string())),
        }
    }
}

impl std::fmt::Display for BgpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Connect => f.write_str("Connect"),
            Self::Active => f.write_str("Active"),
            Self::OpenSent => f.write_str("OpenSent"),
            Self::OpenConfirm => f.write_str("OpenConfirm"),
            Self::Established => f.write_str("Established"),
        }
    }
}

/// Process lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped,
}

/// One interface of a node: the bridge it attaches to and the assigned address with prefix
/// length. The order of a node's interfaces is its attachment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Logical name of the bridge the interface attaches to.
    pub bridge: String,
    /// Assigned address and prefix length, drawn from the bridge's subnet.
    pub addr: IpNet,
}

/// A configured peer, as recorded on one side of the peering relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Logical name of the peer node.
    pub name: String,
    /// The peer's autonomous-system number.
    pub asn: u32,
    /// The peer's router identifier.
    pub router_id: Ipv4Addr,
    /// The peer's address on the bridge shared with this node; the session is configured against
    /// this address.
    pub addr: IpAddr,
}

/// Everything one node needs to know about another to configure a session with it. Obtained from
/// [`BgpSpeaker::summary`] so that two nodes never need to borrow each other directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    /// Logical name of the node.
    pub name: String,
    /// Autonomous-system number.
    pub asn: u32,
    /// Router identifier.
    pub router_id: Ipv4Addr,
    /// Interface list, in attachment order.
    pub interfaces: Vec<Interface>,
}

/// Polymorphic interface over a running BGP daemon.
#[async_trait]
pub trait BgpSpeaker: Send + Sync {
    /// The logical name of the node.
    fn name(&self) -> &str;

    /// The autonomous-system number of the node.
    fn asn(&self) -> u32;

    /// The router identifier. This is a 4-octet, IPv4-shaped identifier regardless of the
    /// data-plane address family in use.
    fn router_id(&self) -> Ipv4Addr;

    /// Whether routes are redistributed into the local IP forwarding table.
    fn zebra_integrated(&self) -> bool;

    /// Current process lifecycle state.
    fn run_state(&self) -> RunState;

    /// The node's interfaces, in attachment order.
    fn interfaces(&self) -> &[Interface];

    /// Names of all configured peers.
    fn peer_names(&self) -> Vec<String>;

    /// A self-contained description of this node, for configuring it as a peer of another node.
    fn summary(&self) -> PeerSummary;

    /// Handle of the node's container, when it is running.
    fn container(&self) -> Option<&ContainerHandle>;

    /// Record an interface on the node. Called by [`crate::topology::VirtualBridge::attach`]
    /// after the attachment is recorded on the bridge; not intended for direct use.
    fn record_interface(&mut self, iface: Interface);

    /// Launch the node's process in its namespace and return the minimum time the caller must
    /// wait before issuing further operations against the daemon. Starting an already-running
    /// node is a no-op returning a zero delay.
    async fn start(&mut self) -> Result<Duration, LabError>;

    /// Terminate the process and release the namespace, dropping all recorded attachments and
    /// peer state. Idempotent; safe to call on a node that is not running.
    async fn stop(&mut self) -> Result<(), LabError>;

    /// Record a configured peer and apply it to the live daemon. Fails with a router-id collision
    /// when the summary's router identifier equals the identifier of a different existing peer.
    async fn add_peer(&mut self, peer: PeerSummary) -> Result<(), LabError>;

    /// Install a static route. When the node is zebra-integrated, the route is redistributed so
    /// that it becomes visible to the BGP process and the kernel forwarding path. Fails when no
    /// directly attached bridge covers `next_hop`.
    async fn add_static_route(
        &mut self,
        destination: IpNet,
        next_hop: IpAddr,
    ) -> Result<(), LabError>;

    /// The locally observed session state for the named peer. The two sides of a relationship
    /// may report different states at any instant; callers must treat the answer as one side's
    /// view only. Fails when no peer of that name is configured.
    async fn query_session_state(&mut self, peer: &str) -> Result<BgpState, LabError>;

    /// Issue up to `attempts` reachability probes toward `target` from inside the node's
    /// namespace. Returns `true` on the first success and `false` only after all attempts are
    /// exhausted. Routes that were just installed take a small, variable amount of time to appear
    /// in the forwarding path, which is why a single probe is insufficient by contract.
    async fn probe_reachability(
        &mut self,
        target: IpAddr,
        attempts: usize,
        per_attempt_timeout: Duration,
    ) -> Result<bool, LabError>;
}

/// State shared by all speaker variants.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) name: String,
    pub(crate) asn: u32,
    pub(crate) router_id: Ipv4Addr,
    pub(crate) zebra: bool,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) peers: BTreeMap<String, PeerConfig>,
    pub(crate) run_state: RunState,
    pub(crate) container: Option<ContainerHandle>,
}

impl NodeState {
    pub(crate) fn new(name: impl Into<String>, asn: u32, router_id: Ipv4Addr, zebra: bool) -> Self {
        Self {
            name: name.into(),
            asn,
            router_id,
            zebra,
            interfaces: Vec::new(),
            peers: BTreeMap::new(),
            run_state: RunState::NotStarted,
            container: None,
        }
    }

    pub(crate) fn summary(&self) -> PeerSummary {
        PeerSummary {
            name: self.name.clone(),
            asn: self.asn,
            router_id: self.router_id,
            interfaces: self.interfaces.clone(),
        }
    }

    pub(crate) fn container(&self) -> Result<&ContainerHandle, ConfigError> {
        self.container.as_ref().ok_or_else(|| ConfigError::NotRunning {
            node: self.name.clone(),
        })
    }

    /// Resolve the peer's address over a bridge shared with this node and record the peer.
    pub(crate) fn register_peer(&mut self, peer: PeerSummary) -> Result<PeerConfig, ConfigError> {
        if let Some(existing) = self
            .peers
            .values()
            .find(|p| p.router_id == peer.router_id && p.name != peer.name)
        {
            return Err(ConfigError::RouterIdCollision {
                name: peer.name,
                router_id: peer.router_id,
                existing: existing.name.clone(),
            });
        }
        let addr = self
            .interfaces
            .iter()
            .find_map(|mine| {
                peer.interfaces
                    .iter()
                    .find(|theirs| theirs.bridge == mine.bridge)
            })
            .map(|iface| iface.addr.addr())
            .ok_or_else(|| ConfigError::NoSharedBridge {
                node: self.name.clone(),
                peer: peer.name.clone(),
            })?;
        let config = PeerConfig {
            name: peer.name.clone(),
            asn: peer.asn,
            router_id: peer.router_id,
            addr,
        };
        self.peers.insert(peer.name, config.clone());
        Ok(config)
    }

    pub(crate) fn peer(&self, name: &str) -> Result<&PeerConfig, ConfigError> {
        self.peers.get(name).ok_or_else(|| ConfigError::UnknownPeer {
            node: self.name.clone(),
            peer: name.to_string(),
        })
    }

    /// Check that some directly attached bridge covers the next hop.
    pub(crate) fn validate_next_hop(&self, next_hop: IpAddr) -> Result<(), RoutingError> {
        if self.interfaces.iter().any(|i| i.addr.contains(&next_hop)) {
            Ok(())
        } else {
            Err(RoutingError::NextHopUnreachable {
                node: self.name.clone(),
                next_hop,
            })
        }
    }

    /// Forget everything tied to the running process: the container, all attachments, and all
    /// configured peers. A later start rebuilds the node from scratch, possibly under a
    /// different address family.
    pub(crate) fn reset(&mut self) {
        self.container = None;
        self.interfaces.clear();
        self.peers.clear();
        self.run_state = RunState::Stopped;
    }
}

/// Install a static route in the node's kernel forwarding table.
pub(crate) async fn install_kernel_route(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
    destination: IpNet,
    next_hop: IpAddr,
) -> Result<(), LabError> {
    let dest = destination.to_string();
    let nh = next_hop.to_string();
    let argv: Vec<&str> = match destination {
        IpNet::V4(_) => vec!["ip", "route", "add", &dest, "via", &nh],
        IpNet::V6(_) => vec!["ip", "-6", "route", "add", &dest, "via", &nh],
    };
    runtime.exec(container, &argv).await?;
    Ok(())
}

/// Issue up to `attempts` ICMP echo probes from the node's namespace, succeeding on the first
/// reply.
pub(crate) async fn probe_from(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
    name: &str,
    target: IpAddr,
    attempts: usize,
    per_attempt_timeout: Duration,
) -> Result<bool, LabError> {
    let target_str = target.to_string();
    let timeout_str = per_attempt_timeout.as_secs().max(1).to_string();
    let ping = match target {
        IpAddr::V4(_) => "ping",
        IpAddr::V6(_) => "ping6",
    };
    for attempt in 1..=attempts {
        let ok = runtime
            .exec_status(
                container,
                &[ping, "-c", "1", "-W", &timeout_str, &target_str],
            )
            .await?;
        if ok {
            log::debug!("[{name}] {target} is reachable (attempt {attempt}/{attempts})");
            return Ok(true);
        }
        log::debug!("[{name}] {target} did not answer (attempt {attempt}/{attempts})");
    }
    Ok(false)
}

/// A static route has no valid next hop. Never retried.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The next hop is not covered by any directly attached bridge.
    #[error("no directly attached bridge of {node} covers next hop {next_hop}")]
    NextHopUnreachable { node: String, next_hop: IpAddr },
}

/// Error while parsing output from a BGP daemon.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Read a session state that is not part of the BGP FSM.
    #[error("unknown BGP session state: {0}")]
    UnknownState(String),
    /// Cannot parse the structured management interface output.
    #[error("cannot parse management interface output: {0}")]
    Json(#[from] serde_json::Error),
    /// The console protocol output is missing an expected line.
    #[error("output of `{command}` is missing `{missing}`")]
    MissingField {
        command: String,
        missing: &'static str,
    },
}
