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

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use crate::{
    speaker::{
        gobgp::GoBgpNode,
        quagga::{parse_neighbor_state, QuaggaNode},
        BgpSpeaker, BgpState, Interface, NodeState, ParseError, PeerSummary, RunState,
    },
    topology::ConfigError,
    LabError,
};

use super::FakeRuntime;

fn summary(name: &str, asn: u32, last_octet: u8, bridge: &str, addr: &str) -> PeerSummary {
    PeerSummary {
        name: name.to_string(),
        asn,
        router_id: Ipv4Addr::new(192, 168, 0, last_octet),
        interfaces: vec![Interface {
            bridge: bridge.to_string(),
            addr: addr.parse().unwrap(),
        }],
    }
}

#[test]
fn session_state_spellings() {
    assert_eq!("Established".parse::<BgpState>().unwrap(), BgpState::Established);
    assert_eq!("BGP_FSM_ESTABLISHED".parse::<BgpState>().unwrap(), BgpState::Established);
    assert_eq!("BGP_FSM_OPENCONFIRM".parse::<BgpState>().unwrap(), BgpState::OpenConfirm);
    assert_eq!("active".parse::<BgpState>().unwrap(), BgpState::Active);
    assert_eq!("OpenSent".parse::<BgpState>().unwrap(), BgpState::OpenSent);
    assert_eq!("idle".parse::<BgpState>().unwrap(), BgpState::Idle);
    assert!(matches!(
        "Wedged".parse::<BgpState>(),
        Err(ParseError::UnknownState(_))
    ));
}

#[test]
fn console_neighbor_output() {
    let output = "\
BGP neighbor is 192.168.20.2, remote AS 65000, local AS 65001, external link
  BGP version 4, remote router ID 192.168.0.1
  BGP state = Established, up for 00:00:17
  Last read 00:00:17, hold time is 90, keepalive interval is 30 seconds
  Neighbor capabilities:
    4 Byte AS: advertised and received";
    assert_eq!(
        parse_neighbor_state("show bgp neighbors 192.168.20.2", output).unwrap(),
        BgpState::Established
    );

    let output = "  BGP state = Active\n";
    assert_eq!(
        parse_neighbor_state("show bgp neighbors 192.168.20.2", output).unwrap(),
        BgpState::Active
    );

    assert!(matches!(
        parse_neighbor_state("show bgp neighbors 192.168.20.2", "% No such neighbor\n"),
        Err(ParseError::MissingField { .. })
    ));
}

#[test]
fn gobgp_bootstrap_config() {
    let runtime = Arc::new(FakeRuntime::new());
    let g1 = GoBgpNode::new(runtime.clone(), "g1", 65000, Ipv4Addr::new(192, 168, 0, 1), true);
    let cfg = g1.bootstrap_config();
    assert!(cfg.contains("as = 65000"));
    assert!(cfg.contains("router-id = \"192.168.0.1\""));
    assert!(cfg.contains("[zebra]"));

    let plain = GoBgpNode::new(runtime, "g2", 65010, Ipv4Addr::new(192, 168, 0, 9), false);
    assert!(!plain.bootstrap_config().contains("[zebra]"));
}

#[test]
fn quagga_configs() {
    let runtime = Arc::new(FakeRuntime::new());
    let q1 = QuaggaNode::new(runtime.clone(), "q1", 65001, Ipv4Addr::new(192, 168, 0, 2), true);
    let cfg = q1.bgpd_config();
    assert!(cfg.contains("router bgp 65001"));
    assert!(cfg.contains(" bgp router-id 192.168.0.2"));
    assert!(cfg.contains(" redistribute connected"));
    assert!(q1.zebra_config().contains("hostname q1"));

    let o1 = QuaggaNode::new(runtime, "o1", 65002, Ipv4Addr::new(192, 168, 0, 3), false);
    assert!(!o1.bgpd_config().contains("redistribute connected"));
}

#[test]
fn peer_registration_resolves_shared_bridge() {
    let mut state = NodeState::new("g1", 65000, Ipv4Addr::new(192, 168, 0, 1), true);
    state.interfaces.push(Interface {
        bridge: "br01".to_string(),
        addr: "192.168.10.3/24".parse().unwrap(),
    });
    state.interfaces.push(Interface {
        bridge: "br02".to_string(),
        addr: "192.168.20.2/24".parse().unwrap(),
    });

    let config = state
        .register_peer(summary("q1", 65001, 2, "br02", "192.168.20.3/24"))
        .unwrap();
    assert_eq!(config.addr, "192.168.20.3".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(state.peer("q1").unwrap().asn, 65001);

    // a peer on a bridge we are not attached to cannot be resolved
    let err = state
        .register_peer(summary("x1", 65003, 7, "br09", "192.168.90.2/24"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::NoSharedBridge { .. }));

    // a different peer with q1's router identifier is rejected
    let err = state
        .register_peer(summary("q2", 65004, 2, "br02", "192.168.20.4/24"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::RouterIdCollision { .. }));

    // re-registering the same peer is allowed (rebuilds under a new family do this)
    state
        .register_peer(summary("q1", 65001, 2, "br02", "192.168.20.3/24"))
        .unwrap();

    assert!(matches!(
        state.peer("nobody"),
        Err(ConfigError::UnknownPeer { .. })
    ));
}

#[test]
fn next_hop_validation() {
    let mut state = NodeState::new("o1", 65002, Ipv4Addr::new(192, 168, 0, 3), false);
    state.interfaces.push(Interface {
        bridge: "br01".to_string(),
        addr: "192.168.10.2/24".parse().unwrap(),
    });
    assert!(state.validate_next_hop("192.168.10.3".parse().unwrap()).is_ok());
    assert!(state.validate_next_hop("192.168.20.3".parse().unwrap()).is_err());
}

#[tokio::test]
async fn managed_node_lifecycle() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut g1 = GoBgpNode::new(runtime.clone(), "g1", 65000, Ipv4Addr::new(192, 168, 0, 1), true);
    assert_eq!(g1.run_state(), RunState::NotStarted);

    let warmup = g1.start().await.unwrap();
    assert!(!warmup.is_zero());
    assert_eq!(g1.run_state(), RunState::Running);
    // starting a running node is a no-op with zero delay
    assert_eq!(g1.start().await.unwrap(), Duration::ZERO);

    assert!(runtime
        .file("g1", "/etc/gobgp/gobgpd.conf")
        .unwrap()
        .contains("as = 65000"));
    // zebra needs its config in place before the detached launch
    assert!(runtime
        .file("g1", "/etc/quagga/zebra.conf")
        .unwrap()
        .contains("hostname g1"));
    assert_eq!(runtime.daemons("g1"), vec!["zebra".to_string(), "gobgpd".to_string()]);

    g1.record_interface(Interface {
        bridge: "br02".to_string(),
        addr: "192.168.20.2/24".parse().unwrap(),
    });
    g1.add_peer(summary("q1", 65001, 2, "br02", "192.168.20.3/24"))
        .await
        .unwrap();

    // the session passes through Active before establishing
    assert_eq!(g1.query_session_state("q1").await.unwrap(), BgpState::Active);
    assert_eq!(g1.query_session_state("q1").await.unwrap(), BgpState::Active);
    assert_eq!(
        g1.query_session_state("q1").await.unwrap(),
        BgpState::Established
    );

    // an unconfigured peer is a lookup error, not a neutral state
    let err = g1.query_session_state("nobody").await.unwrap_err();
    assert!(matches!(
        err,
        LabError::Config(ConfigError::UnknownPeer { .. })
    ));

    // stopping drops attachments and peers
    g1.stop().await.unwrap();
    assert_eq!(g1.run_state(), RunState::Stopped);
    assert!(g1.interfaces().is_empty());
    assert!(g1.peer_names().is_empty());
    // a second stop is a no-op
    g1.stop().await.unwrap();
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn console_node_session_query() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut q1 = QuaggaNode::new(runtime, "q1", 65001, Ipv4Addr::new(192, 168, 0, 2), true);
    q1.start().await.unwrap();
    q1.record_interface(Interface {
        bridge: "br02".to_string(),
        addr: "192.168.20.3/24".parse().unwrap(),
    });
    q1.add_peer(summary("g1", 65000, 1, "br02", "192.168.20.2/24"))
        .await
        .unwrap();

    assert_eq!(q1.query_session_state("g1").await.unwrap(), BgpState::Active);
    assert_eq!(q1.query_session_state("g1").await.unwrap(), BgpState::Active);
    assert_eq!(
        q1.query_session_state("g1").await.unwrap(),
        BgpState::Established
    );
}

#[tokio::test]
async fn probe_reflects_route_state() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut bridge = crate::topology::VirtualBridge::new("br01", "192.168.10.0/24".parse().unwrap());
    let mut o1 = QuaggaNode::new(runtime.clone(), "o1", 65002, Ipv4Addr::new(192, 168, 0, 3), false);
    o1.start().await.unwrap();
    // even without redistribution, zebra runs so console-entered routes reach the kernel
    assert_eq!(runtime.daemons("o1"), vec!["zebra".to_string(), "bgpd".to_string()]);
    bridge.attach(runtime.as_ref(), &mut o1).await.unwrap();

    let target = "192.168.30.9".parse().unwrap();
    let attempts = 2;
    let timeout = Duration::from_secs(1);

    // no forwarding state toward the target yet
    assert!(!o1.probe_reachability(target, attempts, timeout).await.unwrap());

    // next hop outside every attached subnet is rejected
    let err = o1
        .add_static_route("192.168.30.0/24".parse().unwrap(), "192.168.20.1".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::Routing(_)));

    o1.add_static_route("192.168.30.0/24".parse().unwrap(), "192.168.10.3".parse().unwrap())
        .await
        .unwrap();
    assert!(o1.probe_reachability(target, attempts, timeout).await.unwrap());
}
