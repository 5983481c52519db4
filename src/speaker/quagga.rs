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

//! Speaker variant configured through rendered configuration files.
//!
//! The daemon pair (routing manager plus BGP process) boots from configuration files written into
//! the namespace before launch. Later changes go through the line-oriented console protocol, and
//! session state is scraped out of its human-readable output with a regular expression.

use std::{
    fmt::Write,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    config::CONFIG,
    runtime::{ContainerHandle, ContainerRuntime},
    LabError,
};

use super::{
    probe_from, BgpSpeaker, BgpState, Interface, NodeState, ParseError, PeerSummary, RunState,
};

const ZEBRA_CONFIG_PATH: &str = "/etc/quagga/zebra.conf";
const BGPD_CONFIG_PATH: &str = "/etc/quagga/bgpd.conf";

/// Time to wait after launching the daemon pair before the console answers.
const WARMUP: Duration = Duration::from_secs(5);

lazy_static! {
    /// Extracts the FSM stage from `show bgp neighbors` output, which contains a line like
    /// `  BGP state = Established, up for 00:00:17`.
    static ref BGP_STATE: Regex = Regex::new(r"BGP state = ([a-zA-Z]+)").unwrap();
}

/// A BGP speaker configured through files and a console protocol.
pub struct QuaggaNode {
    runtime: Arc<dyn ContainerRuntime>,
    state: NodeState,
}

impl QuaggaNode {
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

    /// Render the routing manager configuration.
    pub(crate) fn zebra_config(&self) -> String {
        let mut cfg = String::new();
        writeln!(cfg, "hostname {}", self.state.name).unwrap();
        writeln!(cfg, "password zebra").unwrap();
        writeln!(cfg, "log file /var/log/quagga/zebra.log").unwrap();
        cfg
    }

    /// Render the BGP process bootstrap configuration. Peers are not part of the bootstrap; they
    /// are added over the console once the topology is wired.
    pub(crate) fn bgpd_config(&self) -> String {
        let mut cfg = String::new();
        writeln!(cfg, "hostname bgpd").unwrap();
        writeln!(cfg, "password zebra").unwrap();
        writeln!(cfg, "router bgp {}", self.state.asn).unwrap();
        writeln!(cfg, " bgp router-id {}", self.state.router_id).unwrap();
        if self.state.zebra {
            writeln!(cfg, " redistribute connected").unwrap();
            writeln!(cfg, " redistribute static").unwrap();
        }
        writeln!(cfg, "log file /var/log/quagga/bgpd.log {}", CONFIG.daemon_log_level).unwrap();
        cfg
    }

    fn container(&self) -> Result<&ContainerHandle, LabError> {
        Ok(self.state.container()?)
    }

    /// Apply a list of configuration-mode commands over the console.
    async fn configure(&self, commands: &[String]) -> Result<(), LabError> {
        let container = self.container()?.clone();
        let mut argv: Vec<&str> = vec!["vtysh", "-c", "configure terminal"];
        for cmd in commands {
            argv.push("-c");
            argv.push(cmd);
        }
        self.runtime.exec(&container, &argv).await?;
        Ok(())
    }
}

#[async_trait]
impl BgpSpeaker for QuaggaNode {
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
            .launch(&self.state.name, &CONFIG.images.quagga, &["NET_ADMIN"])
            .await?;
        self.runtime
            .write_file(&container, ZEBRA_CONFIG_PATH, &self.zebra_config())
            .await?;
        self.runtime
            .write_file(&container, BGPD_CONFIG_PATH, &self.bgpd_config())
            .await?;

        // the routing manager must be up before bgpd connects to its socket
        self.runtime
            .exec_detached(&container, &["zebra", "-f", ZEBRA_CONFIG_PATH])
            .await?;
        self.runtime
            .exec_detached(&container, &["bgpd", "-f", BGPD_CONFIG_PATH])
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
        self.state.container()?;
        let config = self.state.register_peer(peer)?;
        log::debug!(
            "[{}] adding peer {} at {} (AS{})",
            self.state.name,
            config.name,
            config.addr,
            config.asn
        );
        let mut commands = vec![
            format!("router bgp {}", self.state.asn),
            format!("neighbor {} remote-as {}", config.addr, config.asn),
        ];
        if config.addr.is_ipv6() {
            // v6 sessions carry no routes until the peer is activated in the v6 address family
            commands.push("address-family ipv6".to_string());
            commands.push(format!("neighbor {} activate", config.addr));
            commands.push("exit-address-family".to_string());
        }
        self.configure(&commands).await
    }

    async fn add_static_route(
        &mut self,
        destination: IpNet,
        next_hop: IpAddr,
    ) -> Result<(), LabError> {
        self.state.validate_next_hop(next_hop)?;
        log::debug!(
            "[{}] adding static route {destination} via {next_hop}",
            self.state.name
        );
        // the routing manager installs the route into the kernel and, with connected
        // redistribution, the BGP process picks it up from there
        let command = match destination {
            IpNet::V4(_) => format!("ip route {destination} {next_hop}"),
            IpNet::V6(_) => format!("ipv6 route {destination} {next_hop}"),
        };
        self.configure(&[command]).await
    }

    async fn query_session_state(&mut self, peer: &str) -> Result<BgpState, LabError> {
        let addr = self.state.peer(peer)?.addr.to_string();
        let container = self.container()?.clone();
        let command = format!("show bgp neighbors {addr}");
        let raw = self
            .runtime
            .exec(&container, &["vtysh", "-c", &command])
            .await?;
        let state = parse_neighbor_state(&command, &raw)?;
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

/// Extract the session state from `show bgp neighbors` console output.
pub(crate) fn parse_neighbor_state(command: &str, raw: &str) -> Result<BgpState, ParseError> {
    let captures = BGP_STATE
        .captures(raw)
        .ok_or_else(|| ParseError::MissingField {
            command: command.to_string(),
            missing: "BGP state",
        })?;
    captures[1].parse()
}
