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

//! One isolated L2/L3 network segment with a single subnet.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::{
    runtime::{ContainerRuntime, RuntimeError, SegmentHandle},
    speaker::{BgpSpeaker, Interface},
    LabError,
};

use super::{AddressFamily, ConfigError};

/// A virtual bridge: one isolated network segment with an associated subnet.
///
/// The bridge owns the address allocation for its subnet. The subnet's address family is fixed at
/// creation; every node attached to the bridge receives the next unused address, in attachment
/// order. The first host address is reserved for the segment gateway, so nodes are numbered from
/// the second host onwards. Allocation is strictly monotonic: addresses are never reused, and an
/// exhausted subnet is a configuration error.
#[derive(Debug)]
pub struct VirtualBridge {
    name: String,
    subnet: IpNet,
    /// Number of addresses handed out so far.
    allocated: u128,
    /// Names of the attached nodes, in attachment order.
    attached: Vec<String>,
    segment: Option<SegmentHandle>,
}

impl VirtualBridge {
    /// Create a new bridge. This only allocates the structure; the underlying network segment is
    /// created lazily on the first attachment.
    pub fn new(name: impl Into<String>, subnet: IpNet) -> Self {
        Self {
            name: name.into(),
            subnet,
            allocated: 0,
            attached: Vec::new(),
            segment: None,
        }
    }

    /// The logical name of the bridge.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The subnet associated with this bridge.
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// The address family of the bridge's subnet.
    pub fn family(&self) -> AddressFamily {
        match self.subnet {
            IpNet::V4(_) => AddressFamily::Ipv4,
            IpNet::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Names of the attached nodes, in attachment order.
    pub fn attached(&self) -> &[String] {
        &self.attached
    }

    /// The address that the `index`-th attached node receives (or received). Returns `None` when
    /// the subnet cannot hold that many hosts.
    pub fn host_addr(&self, index: u128) -> Option<IpNet> {
        // skip the network base and the gateway address
        let offset = index.checked_add(2)?;
        match self.subnet {
            IpNet::V4(net) => {
                let base = u32::from(net.network());
                let addr = base.checked_add(u32::try_from(offset).ok()?)?;
                // the broadcast address is not assignable
                if addr >= u32::from(net.broadcast()) {
                    return None;
                }
                IpNet::new(IpAddr::V4(addr.into()), net.prefix_len()).ok()
            }
            IpNet::V6(net) => {
                let base = u128::from(net.network());
                let addr = base.checked_add(offset)?;
                if addr > u128::from(net.broadcast()) {
                    return None;
                }
                IpNet::new(IpAddr::V6(addr.into()), net.prefix_len()).ok()
            }
        }
    }

    /// Hand out the next unused address of the subnet.
    fn allocate(&mut self) -> Result<IpNet, ConfigError> {
        let addr = self
            .host_addr(self.allocated)
            .ok_or_else(|| ConfigError::SubnetExhausted {
                bridge: self.name.clone(),
                subnet: self.subnet,
            })?;
        self.allocated += 1;
        Ok(addr)
    }

    /// Create the underlying network segment if it does not exist yet.
    async fn ensure_segment(
        &mut self,
        runtime: &dyn ContainerRuntime,
    ) -> Result<SegmentHandle, RuntimeError> {
        if let Some(segment) = &self.segment {
            return Ok(segment.clone());
        }
        let suffix = match self.family() {
            AddressFamily::Ipv4 => "v4",
            AddressFamily::Ipv6 => "v6",
        };
        let segment = runtime
            .create_network_segment(&format!("{}_{}", self.name, suffix), self.subnet)
            .await?;
        self.segment = Some(segment.clone());
        Ok(segment)
    }

    /// Attach a node to this bridge.
    ///
    /// Allocates the next unused address, connects the node's namespace to the segment, and
    /// records the attachment on the bridge first and on the node second. That fixed order keeps
    /// the node's interface list index stable across repeated attachments, which matters because
    /// later phases address interfaces positionally.
    pub async fn attach(
        &mut self,
        runtime: &dyn ContainerRuntime,
        node: &mut dyn BgpSpeaker,
    ) -> Result<IpNet, LabError> {
        let container = node
            .container()
            .ok_or_else(|| ConfigError::NotRunning {
                node: node.name().to_string(),
            })?
            .clone();

        let segment = self.ensure_segment(runtime).await?;
        let addr = self.allocate()?;
        runtime.attach(&segment, &container, addr).await?;

        log::debug!("[{}] attached {} with address {addr}", self.name, node.name());
        self.attached.push(node.name().to_string());
        node.record_interface(Interface {
            bridge: self.name.clone(),
            addr,
        });
        Ok(addr)
    }

    /// Remove the underlying segment and forget all attachments. Idempotent.
    pub async fn teardown(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), RuntimeError> {
        if let Some(segment) = self.segment.take() {
            runtime.remove_network_segment(&segment).await?;
        }
        self.attached.clear();
        self.allocated = 0;
        Ok(())
    }
}
