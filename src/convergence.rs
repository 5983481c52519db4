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

//! Bounded waiting on BGP session state.
//!
//! Session establishment is asynchronous and paced by the implementations under test. The only
//! reliable synchronization point is polling the observable session state until it reaches the
//! expected stage or a deadline passes. A session that never converges within its deadline is a
//! test failure, not a hang.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::{
    config::CONFIG,
    speaker::{BgpSpeaker, BgpState},
    LabError,
};

/// Poll the session state of `node` toward `peer` until it reports `expected`.
///
/// One query is issued immediately, then one per `poll_interval` until the `deadline` (measured
/// from the call) passes. The answer reflects one side's view of the session only; the two sides
/// may pass through different states at different times.
///
/// Query errors are fatal and propagate immediately. A daemon that answers garbage will keep
/// answering garbage, so retrying the query would only convert a clear parse error into an
/// opaque timeout.
pub async fn wait_for(
    node: &mut dyn BgpSpeaker,
    peer: &str,
    expected: BgpState,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<(), LabError> {
    let end = Instant::now() + deadline;
    let mut last = None;
    loop {
        let state = node.query_session_state(peer).await?;
        if state == expected {
            log::debug!("[{}] session with {peer} reached {expected}", node.name());
            return Ok(());
        }
        if last != Some(state) {
            log::debug!(
                "[{}] session with {peer} is {state}, waiting for {expected}",
                node.name()
            );
            last = Some(state);
        }
        if Instant::now() + poll_interval > end {
            return Err(ConvergenceError::Timeout {
                node: node.name().to_string(),
                peer: peer.to_string(),
                expected,
                last,
                deadline,
            }
            .into());
        }
        sleep(poll_interval).await;
    }
}

/// Wait for the session of `node` toward `peer` to reach `Established`, using the configured
/// polling interval and deadline.
pub async fn wait_established(node: &mut dyn BgpSpeaker, peer: &str) -> Result<(), LabError> {
    wait_for(
        node,
        peer,
        BgpState::Established,
        CONFIG.timing.poll_interval(),
        CONFIG.timing.convergence_deadline(),
    )
    .await
}

/// A session failed to reach the expected state within its deadline.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// The deadline passed before the session reported the expected state.
    #[error(
        "session of {node} with {peer} did not reach {expected} within {}s (last observed: {})",
        deadline.as_secs(),
        last.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    Timeout {
        /// The queried node.
        node: String,
        /// The peer whose session was observed.
        peer: String,
        /// The state the session was expected to reach.
        expected: BgpState,
        /// The last state that was observed before the deadline, if any.
        last: Option<BgpState>,
        /// The deadline that passed.
        deadline: Duration,
    },
}
