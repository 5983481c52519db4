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

use std::{sync::Arc, time::Duration};

use ipnet::IpNet;
use pretty_assertions::assert_eq;

use crate::{
    convergence::wait_for, scenario::Scenario, speaker::BgpState, topology::AddressFamily,
    LabError, RuntimeError,
};

use super::FakeRuntime;

#[tokio::test(start_paused = true)]
async fn full_run_passes() {
    super::init_logging();
    let runtime = Arc::new(FakeRuntime::new());
    let mut scenario = Scenario::new(runtime.clone()).await.unwrap();
    scenario.run().await.unwrap();

    // nothing may leak out of a run
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
}

#[tokio::test]
async fn unavailable_runtime_fails_before_any_topology() {
    let runtime = Arc::new(FakeRuntime::unavailable());
    let err = Scenario::new(runtime.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        LabError::Runtime(RuntimeError::Unavailable(_))
    ));
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn convergence_failure_still_tears_down() {
    super::init_logging();
    let runtime = Arc::new(FakeRuntime::never_converging());
    let mut scenario = Scenario::new(runtime.clone()).await.unwrap();
    let err = scenario.run().await.unwrap_err();
    assert!(matches!(err, LabError::Convergence(_)));

    // the failed phase must not leak namespaces or segments
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn family_switch_rebuilds_from_scratch() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut scenario = Scenario::new(runtime.clone()).await.unwrap();

    scenario.establish_sessions(AddressFamily::Ipv4).await.unwrap();
    scenario.reachability_via_hub(AddressFamily::Ipv4).await.unwrap();
    assert_eq!(
        scenario.topology().active_family(),
        Some(AddressFamily::Ipv4)
    );

    scenario.establish_sessions(AddressFamily::Ipv6).await.unwrap();
    assert_eq!(
        scenario.topology().active_family(),
        Some(AddressFamily::Ipv6)
    );

    // no stale v4 attachments survive the rebuild
    let g1 = scenario.topology().node("g1").unwrap();
    assert_eq!(g1.interfaces().len(), 2);
    assert!(g1
        .interfaces()
        .iter()
        .all(|i| matches!(i.addr, IpNet::V6(_))));
    assert!(runtime.network_names().iter().all(|n| n.ends_with("_v6")));

    scenario.reachability_via_hub(AddressFamily::Ipv6).await.unwrap();
    scenario.reachability_via_control(AddressFamily::Ipv6).await.unwrap();
    scenario.teardown().await;
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn convergence_is_bidirectional() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut scenario = Scenario::new(runtime).await.unwrap();
    scenario.establish_sessions(AddressFamily::Ipv4).await.unwrap();

    // the executor polls the hub's view; the control side must also reach Established
    let q1 = scenario.topology_mut().node_mut("q1").unwrap();
    wait_for(
        q1,
        "g1",
        BgpState::Established,
        Duration::from_secs(1),
        Duration::from_secs(120),
    )
    .await
    .unwrap();

    scenario.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn addressing_is_reproducible_across_runs() {
    for _ in 0..2 {
        let runtime = Arc::new(FakeRuntime::new());
        let mut scenario = Scenario::new(runtime.clone()).await.unwrap();
        scenario.establish_sessions(AddressFamily::Ipv4).await.unwrap();

        let g1 = scenario.topology().node("g1").unwrap();
        assert_eq!(g1.interfaces()[0].addr, "192.168.10.3/24".parse().unwrap());
        assert_eq!(g1.interfaces()[1].addr, "192.168.20.2/24".parse().unwrap());
        let q1 = scenario.topology().node("q1").unwrap();
        assert_eq!(q1.interfaces()[0].addr, "192.168.20.3/24".parse().unwrap());
        assert_eq!(q1.interfaces()[1].addr, "192.168.30.2/24".parse().unwrap());

        scenario.teardown().await;
    }
}
