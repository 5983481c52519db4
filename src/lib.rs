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

//! This library is a scenario-driven interoperability test harness for BGP speakers. It provisions
//! a set of isolated virtual network segments, launches independently implemented BGP daemons into
//! them, wires the daemons into a peering topology, and verifies two externally observable
//! properties: that every configured session converges to `Established`, and that the resulting
//! routed topology actually forwards packets end-to-end once routes are redistributed into the IP
//! forwarding layer.
//!
//! # Architecture
//!
//! The harness is written against two seams:
//!
//! - [`runtime::ContainerRuntime`] abstracts the container/namespace runtime (creating and
//!   destroying namespaces, executing commands inside them, wiring them to network segments). The
//!   default implementation is [`runtime::DockerRuntime`]; the test suite substitutes a fake.
//! - [`speaker::BgpSpeaker`] abstracts one running BGP daemon. Two families are implemented:
//!   [`speaker::gobgp::GoBgpNode`] is configured through a structured management interface, and
//!   [`speaker::quagga::QuaggaNode`] is configured by writing daemon configuration files and
//!   queried over its line-oriented console protocol. The executor only ever talks to the trait.
//!
//! All topology state for one run lives in a [`topology::TopologyRegistry`]; nothing is persisted
//! across runs. The [`scenario::Scenario`] executor drives the registry through an ordered
//! sequence of phases (bring-up, session establishment, reachability in both directions, then the
//! same again under IPv6 after a full rebuild). Each phase depends on the side effects of the
//! previous one; a phase failure aborts the remainder of the run, but the executor still tears
//! down every container and segment it created so that nothing leaks between runs.
//!
//! # Convergence
//!
//! BGP session establishment is asynchronous and paced by the implementations under test, so the
//! only reliable synchronization point is polling the observable session state with a bounded
//! deadline (see [`convergence::wait_for`]). Fixed sleeps are used in exactly one place: after
//! starting the daemons, where no management channel exists yet and no better signal is
//! observable. Every node reports its own warm-up delay and the executor sleeps once for the
//! maximum, so total startup latency is bounded by the slowest node instead of the sum.
//!
//! # Configuration
//!
//! Container image names, the name prefix applied to containers and networks, daemon log levels,
//! and the default polling parameters are read from the TOML file named by the `BGP_LAB_CONFIG`
//! environment variable, with built-in defaults (see [`config`]).

use std::net::IpAddr;

use thiserror::Error;

pub mod config;
pub mod convergence;
pub mod runtime;
pub mod scenario;
pub mod speaker;
pub mod topology;

#[cfg(test)]
mod test;

pub use convergence::{wait_for, ConvergenceError};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
pub use scenario::Scenario;
pub use speaker::{BgpSpeaker, BgpState, ParseError, RoutingError};
pub use topology::{AddressFamily, ConfigError, TopologyRegistry, VirtualBridge};

/// Error type thrown while running an interoperability scenario.
#[derive(Debug, Error)]
pub enum LabError {
    /// Invalid or conflicting topology or peer configuration. Never retried; aborts the phase.
    #[error("{0}")]
    Config(#[from] ConfigError),
    /// A static route has no valid next hop. Never retried.
    #[error("{0}")]
    Routing(#[from] RoutingError),
    /// A session failed to reach the expected state within its deadline.
    #[error("{0}")]
    Convergence(#[from] ConvergenceError),
    /// The external container runtime failed or is unavailable.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    /// Output of a daemon could not be parsed.
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// All reachability probes were exhausted without a single success.
    #[error("{target} is unreachable from {node} after {attempts} attempts")]
    Unreachable {
        /// The probing node.
        node: String,
        /// The probed address.
        target: IpAddr,
        /// Number of probe attempts that were made.
        attempts: usize,
    },
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
