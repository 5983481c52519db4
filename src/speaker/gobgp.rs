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

//! Speaker variant driven through a structured management interface.
//!
//! The daemon is configured with a minimal bootstrap file at start. All later changes (peers,
//! routes) are applied live through its management CLI, and session state is read back as JSON.

use std::{
    fmt::Write,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;

use crate::{
    config::CONFIG,
    runtime::{ContainerHandle, ContainerRuntime},
    LabError,
};

use super::{
    install_kernel_route, probe_from, BgpSpeaker, BgpState, Interface, NodeState, PeerSummary,
    RunState,
};

const CONFIG_PATH: &str = "/etc/gobgp/gobgpd.conf";
const ZEBRA_CONFIG_PATH: &str = "/etc/quagga/zebra.conf";
const ZSERV_SOCKET: &str = "unix:/var/run/quagga/zserv.api";

/// Time to wait after launching the daemon before its management socket answers.
const WARMUP: Duration = Duration::from_secs(2);

/// A BGP speaker with a structured management interface.
pub struct GoBgpNode {
    runtime: Arc<dyn ContainerRuntime>,
    state: NodeState,
}

impl GoBgpNode {
    /// Declare a new node. Nothing is launched until [`BgpSpeaker::start`] is called.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        name: impl Into<String>,
        asn: u32,
        router_id: Ipv4Addr,
        zebra: bool,
    ) -> Self {
        Self {
            runtime,
            state: NodeState::new(name, asn, router_id, zebra),
        }
    }

    /// Render the bootstrap configuration file. Peers are not part of the bootstrap; they are
    /// added live once the topology is wired.
    pub(crate) fn bootstrap_config(&self) -> String {
        let mut cfg = String::new();
        writeln!(cfg, "[global.config]").unwrap();
        writeln!(cfg, "  as = {}", self.state.asn).unwrap();
        writeln!(cfg, "  router-id = \"{}\"", self.state.router_id).unwrap();
        if self.state.zebra {
            writeln!(cfg, "[zebra]").unwrap();
            writeln!(cfg, "  [zebra.config]").unwrap();
            writeln!(cfg, "    enabled = true").unwrap();
            writeln!(cfg, "    url = \"{ZSERV_SOCKET}\"").unwrap();
            writeln!(cfg, "    redistribute-route-type-list = [\"connect\", \"static\"]").unwrap();
        }
        cfg
    }

    /// Render the configuration of the routing manager that backs the zebra integration.
    pub(crate) fn zebra_config(&self) -> String {
        let mut cfg = String::new();
        writeln!(cfg, "hostname {}", self.state.name).unwrap();
        writeln!(cfg, "password zebra").unwrap();
        writeln!(cfg, "log file /var/log/quagga/zebra.log").unwrap();
        cfg
    }

    fn container(&self) -> Result<&ContainerHandle, LabError> {
        Ok(self.state.container()?)
    }
}

/// Session state as reported by the management interface, for example
/// `{"info": {"bgp_state": "BGP_FSM_ESTABLISHED"}}`. Everything else in the answer is ignored.
#[derive(Debug, Deserialize)]
struct NeighborReply {
    info: NeighborInfo,
}

#[derive(Debug, Deserialize)]
struct NeighborInfo {
    bgp_state: String,
}

#[async_trait]
impl BgpSpeaker for GoBgpNode {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn asn(&self) -> u32 {
        self.state.asn
    }

    fn router_id(&self) -> Ipv4Addr {
        self.state.router_id
    }

    fn zebra_integrated(&self) -> bool {
        self.state.zebra
    }

    fn run_state(&self) -> RunState {
        self.state.run_state
    }

    fn interfaces(&self) -> &[Interface] {
        &self.state.interfaces
    }

    fn peer_names(&self) -> Vec<String> {
        self.state.peers.keys().cloned().collect()
    }

    fn summary(&self) -> PeerSummary {
        self.state.summary()
    }

    fn container(&self) -> Option<&ContainerHandle> {
        self.state.container.as_ref()
    }

    fn record_interface(&mut self, iface: Interface) {
        self.state.interfaces.push(iface);
    }

    async fn start(&mut self) -> Result<Duration, LabError> {
        if self.state.run_state == RunState::Running {
            return Ok(Duration::ZERO);
        }
        log::info!("[{}] starting", self.state.name);

        let container = self
            .runtime
            .launch(&self.state.name, &CONFIG.images.gobgp, &["NET_ADMIN"])
            .await?;
        self.runtime
            .write_file(&container, CONFIG_PATH, &self.bootstrap_config())
            .await?;

        if self.state.zebra {
            self.runtime
                .write_file(&container, ZEBRA_CONFIG_PATH, &self.zebra_config())
                .await?;
            // the routing manager must be up before the daemon connects to its socket
            self.runtime
                .exec_detached(&container, &["zebra", "-f", ZEBRA_CONFIG_PATH])
                .await?;
        }
        self.runtime
            .exec_detached(
                &container,
                &[
                    "gobgpd",
                    "-f",
                    CONFIG_PATH,
                    "-l",
                    &CONFIG.daemon_log_level,
                ],
            )
            .await?;

        self.state.container = Some(container);
        self.state.run_state = RunState::Running;
        Ok(WARMUP)
    }

    async fn stop(&mut self) -> Result<(), LabError> {
        if let Some(container) = self.state.container.take() {
            log::info!("[{}] stopping", self.state.name);
            self.runtime.terminate(&container).await?;
        }
        self.state.reset();
        Ok(())
    }

    async fn add_peer(&mut self, peer: PeerSummary) -> Result<(), LabError> {
        let container = self.state.container()?.clone();
        let config = self.state.register_peer(peer)?;
        log::debug!(
            "[{}] adding peer {} at {} (AS{})",
            self.state.name,
            config.name,
            config.addr,
            config.asn
        );
        let addr = config.addr.to_string();
        let asn = config.asn.to_string();
        self.runtime
            .exec(&container, &["gobgp", "neighbor", "add", &addr, "as", &asn])
            .await?;
        Ok(())
    }

    async fn add_static_route(
        &mut self,
        destination: IpNet,
        next_hop: IpAddr,
    ) -> Result<(), LabError> {
        self.state.validate_next_hop(next_hop)?;
        let container = self.container()?.clone();
        log::debug!(
            "[{}] adding static route {destination} via {next_hop}",
            self.state.name
        );
        install_kernel_route(self.runtime.as_ref(), &container, destination, next_hop).await?;
        let dest = destination.to_string();
        let nh = next_hop.to_string();
        let mut argv = vec!["gobgp", "global", "rib", "add"];
        if matches!(destination, IpNet::V6(_)) {
            argv.extend(["-a", "ipv6"]);
        }
        argv.extend([dest.as_str(), "nexthop", nh.as_str()]);
        self.runtime.exec(&container, &argv).await?;
        Ok(())
    }

    async fn query_session_state(&mut self, peer: &str) -> Result<BgpState, LabError> {
        let addr = self.state.peer(peer)?.addr.to_string();
        let container = self.container()?.clone();
        let raw = self
            .runtime
            .exec(&container, &["gobgp", "-j", "neighbor", &addr])
            .await?;
        let reply: NeighborReply =
            serde_json::from_str(&raw).map_err(super::ParseError::from)?;
        let state: BgpState = reply.info.bgp_state.parse()?;
        log::trace!("[{}] session with {peer} is {state}", self.state.name);
        Ok(state)
    }

    async fn probe_reachability(
        &mut self,
        target: IpAddr,
        attempts: usize,
        per_attempt_timeout: Duration,
    ) -> Result<bool, LabError> {
        let container = self.container()?.clone();
        probe_from(
            self.runtime.as_ref(),
            &container,
            &self.state.name,
            target,
            attempts,
            per_attempt_timeout,
        )
        .await
    }
}
