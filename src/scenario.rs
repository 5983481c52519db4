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

//! The ordered, stateful phase sequence of one interoperability run.
//!
//! The topology is a line: `o1 -- br01 -- g1 -- br02 -- q1 -- br03 -- o2`, with `g1` the node
//! under test and `q1` the independently implemented control. Only `g1` and `q1` peer over BGP;
//! `o1` and `o2` sit behind them as probe endpoints. The phases run strictly in order, each
//! consuming state the previous one established: session establishment, reachability across the
//! node under test, reachability across the control node, then the same three again under IPv6
//! after a full stop and rebuild. A phase failure aborts the remainder of the run, but everything
//! that was started is still torn down.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use ipnet::IpNet;
use lazy_static::lazy_static;

use crate::{
    config::CONFIG,
    convergence::wait_established,
    runtime::{ContainerRuntime, DockerRuntime},
    speaker::{gobgp::GoBgpNode, quagga::QuaggaNode},
    topology::{AddressFamily, ConfigError, TopologyRegistry},
    LabError,
};

const HUB: &str = "g1";
const CONTROL: &str = "q1";
const EDGE_HUB_SIDE: &str = "o1";
const EDGE_CONTROL_SIDE: &str = "o2";

/// Attachment edge list. The order is part of the contract: it fixes which address every node
/// receives on every bridge, and later phases address those interfaces positionally.
const EDGES: [(&str, [&str; 2]); 3] = [
    ("br01", [EDGE_HUB_SIDE, HUB]),
    ("br02", [HUB, CONTROL]),
    ("br03", [CONTROL, EDGE_CONTROL_SIDE]),
];

lazy_static! {
    /// Bridge subnets, one per address family.
    static ref SUBNETS: Vec<(&'static str, IpNet, IpNet)> = vec![
        ("br01", "192.168.10.0/24".parse().unwrap(), "2001:10::/32".parse().unwrap()),
        ("br02", "192.168.20.0/24".parse().unwrap(), "2001:20::/32".parse().unwrap()),
        ("br03", "192.168.30.0/24".parse().unwrap(), "2001:30::/32".parse().unwrap()),
    ];
}

/// Executor for the interoperability scenario.
///
/// Holds the shared [`TopologyRegistry`] that all phases mutate. Phases can be driven one by one
/// (for a test runner reporting per-phase results) or all at once with [`Scenario::run`].
pub struct Scenario {
    runtime: Arc<dyn ContainerRuntime>,
    topology: TopologyRegistry,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").finish_non_exhaustive()
    }
}

impl Scenario {
    /// Declare the fixed topology on the given runtime: all four nodes and all six bridges (both
    /// address families), without starting or attaching anything. Fails when the runtime is not
    /// usable at all; that is checked here, before any topology is built.
    pub async fn new(runtime: Arc<dyn ContainerRuntime>) -> Result<Self, LabError> {
        runtime.probe().await?;

        let mut topology = TopologyRegistry::new();
        topology.add_node(Box::new(GoBgpNode::new(
            runtime.clone(),
            HUB,
            65000,
            Ipv4Addr::new(192, 168, 0, 1),
            true,
        )))?;
        topology.add_node(Box::new(QuaggaNode::new(
            runtime.clone(),
            CONTROL,
            65001,
            Ipv4Addr::new(192, 168, 0, 2),
            true,
        )))?;
        topology.add_node(Box::new(QuaggaNode::new(
            runtime.clone(),
            EDGE_HUB_SIDE,
            65002,
            Ipv4Addr::new(192, 168, 0, 3),
            false,
        )))?;
        topology.add_node(Box::new(QuaggaNode::new(
            runtime.clone(),
            EDGE_CONTROL_SIDE,
            65002,
            Ipv4Addr::new(192, 168, 0, 4),
            false,
        )))?;

        for (name, v4, v6) in SUBNETS.iter() {
            topology.create_bridge(*name, *v4)?;
            topology.create_bridge(*name, *v6)?;
        }

        Ok(Self { runtime, topology })
    }

    /// Declare the scenario on the docker runtime.
    pub async fn with_docker() -> Result<Self, LabError> {
        Self::new(Arc::new(DockerRuntime::new())).await
    }

    /// The shared topology. Exposed for inspection between phases.
    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    /// The shared topology, for driving additional checks (say, polling the control node's view
    /// of a session) between phases.
    pub fn topology_mut(&mut self) -> &mut TopologyRegistry {
        &mut self.topology
    }

    /// Bring up the data plane of one address family and establish the BGP session.
    ///
    /// When a different family is currently built, all nodes are stopped and the old bridges torn
    /// down first, so attachments and peer state never leak across families. Then all nodes are
    /// started (sleeping once for the slowest warm-up), the bridges of the requested family are
    /// attached in the fixed edge order, the hub and control node are peered symmetrically, and we
    /// poll the hub's view of the session until it reaches `Established`.
    pub async fn establish_sessions(&mut self, family: AddressFamily) -> Result<(), LabError> {
        log::info!("building the {family} data plane");
        if let Some(old) = self.topology.active_family() {
            if old != family {
                self.topology.stop_all().await?;
                self.topology
                    .teardown_bridges(self.runtime.as_ref(), old)
                    .await?;
            }
        }

        self.topology.start_all().await?;
        for (bridge, nodes) in EDGES.iter() {
            for node in nodes {
                self.topology
                    .attach(self.runtime.as_ref(), family, bridge, node)
                    .await?;
            }
        }
        self.topology.set_active_family(family);

        let hub_summary = self.topology.node(HUB)?.summary();
        let control_summary = self.topology.node(CONTROL)?.summary();
        self.topology.node_mut(HUB)?.add_peer(control_summary).await?;
        self.topology.node_mut(CONTROL)?.add_peer(hub_summary).await?;

        wait_established(self.topology.node_mut(HUB)?, CONTROL).await?;
        log::info!("{family} session between {HUB} and {CONTROL} is established");
        Ok(())
    }

    /// Install a static route on the edge node behind the hub and probe across the hub from the
    /// control node. The route's next hop is the hub's address on the bridge it shares with the
    /// edge node; the probe targets the first allocated host of the far bridge.
    pub async fn reachability_via_hub(&mut self, family: AddressFamily) -> Result<(), LabError> {
        let next_hop = self.interface_on(HUB, "br01")?;
        let destination = self.topology.bridge(family, "br01")?.subnet();
        self.topology
            .node_mut(EDGE_HUB_SIDE)?
            .add_static_route(destination, next_hop)
            .await?;

        let target = self.first_host(family, "br03")?;
        self.probe(CONTROL, target).await
    }

    /// The mirror phase: install a static route on the edge node behind the control node and
    /// probe across it from the hub.
    pub async fn reachability_via_control(
        &mut self,
        family: AddressFamily,
    ) -> Result<(), LabError> {
        let next_hop = self.interface_on(CONTROL, "br03")?;
        let destination = self.topology.bridge(family, "br03")?.subnet();
        self.topology
            .node_mut(EDGE_CONTROL_SIDE)?
            .add_static_route(destination, next_hop)
            .await?;

        let target = self.first_host(family, "br01")?;
        self.probe(HUB, target).await
    }

    /// Run the full scenario: all three phases under IPv4, then all three again under IPv6 after
    /// a full rebuild. Regardless of the outcome, everything that was started is torn down before
    /// the result propagates.
    pub async fn run(&mut self) -> Result<(), LabError> {
        let result = self.run_phases().await;
        self.teardown().await;
        result
    }

    async fn run_phases(&mut self) -> Result<(), LabError> {
        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            self.establish_sessions(family).await?;
            self.reachability_via_hub(family).await?;
            self.reachability_via_control(family).await?;
        }
        Ok(())
    }

    /// Best-effort teardown of all nodes and bridges.
    pub async fn teardown(&mut self) {
        self.topology.teardown(self.runtime.as_ref()).await;
    }

    /// The address of `node` on `bridge`.
    fn interface_on(&self, node: &str, bridge: &str) -> Result<IpAddr, LabError> {
        let iface = self
            .topology
            .node(node)?
            .interfaces()
            .iter()
            .find(|i| i.bridge == bridge)
            .ok_or_else(|| ConfigError::UnknownBridge {
                bridge: bridge.to_string(),
            })?;
        Ok(iface.addr.addr())
    }

    /// The address of the first attached node on `bridge`.
    fn first_host(&self, family: AddressFamily, bridge: &str) -> Result<IpAddr, LabError> {
        let b = self.topology.bridge(family, bridge)?;
        let addr = b.host_addr(0).ok_or_else(|| ConfigError::SubnetExhausted {
            bridge: bridge.to_string(),
            subnet: b.subnet(),
        })?;
        Ok(addr.addr())
    }

    async fn probe(&mut self, node: &str, target: IpAddr) -> Result<(), LabError> {
        let attempts = CONFIG.timing.probe_attempts;
        let timeout = CONFIG.timing.probe_timeout();
        let ok = self
            .topology
            .node_mut(node)?
            .probe_reachability(target, attempts, timeout)
            .await?;
        if ok {
            log::info!("[{node}] {target} is reachable");
            Ok(())
        } else {
            Err(LabError::Unreachable {
                node: node.to_string(),
                target,
                attempts,
            })
        }
    }
}
