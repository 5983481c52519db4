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

//! This module contains the code for reading the harness configuration.
//!
//! The configuration is read from the TOML file named by the environment variable
//! `BGP_LAB_CONFIG`. When the variable is not set, built-in defaults are used, which match the
//! published container images of the two daemon families.

use std::time::Duration;

use lazy_static::lazy_static;
use serde::Deserialize;

macro_rules! expect {
    ($result:expr, $($rest:tt)*) => {
        $result.unwrap_or_else(|e| {
            eprintln!("Error: {}: {}\n", format!($($rest)*), e);
            panic!()
        })
    };
}

lazy_static! {
    pub static ref CONFIG: Config = {
        match std::env::var("BGP_LAB_CONFIG") {
            Ok(path) => {
                let config_str = expect!(std::fs::read_to_string(&path), "Cannot read '{}'", path);
                expect!(toml::from_str(&config_str), "Cannot parse '{}'", path)
            }
            Err(_) => Config::default(),
        }
    };
}

/// Harness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix applied to every container and network segment name, so that parallel runs on the
    /// same host do not collide.
    pub name_prefix: String,
    /// Container images per daemon family.
    pub images: ImageConfig,
    /// Log verbosity passed to the daemons under test.
    pub daemon_log_level: String,
    /// Timing parameters for polling and probing.
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name_prefix: "bgplab".to_string(),
            images: Default::default(),
            daemon_log_level: "debug".to_string(),
            timing: Default::default(),
        }
    }
}

/// Container image identifiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image used for [`crate::speaker::gobgp::GoBgpNode`].
    pub gobgp: String,
    /// Image used for [`crate::speaker::quagga::QuaggaNode`].
    pub quagga: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            gobgp: "osrg/gobgp".to_string(),
            quagga: "osrg/quagga".to_string(),
        }
    }
}

/// Timing parameters for the convergence poller and the reachability probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between two session-state queries, in seconds.
    pub poll_interval_secs: u64,
    /// Deadline for a session to reach the expected state, in seconds.
    pub convergence_deadline_secs: u64,
    /// Number of reachability probe attempts before giving up.
    pub probe_attempts: usize,
    /// Timeout of a single reachability probe, in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            convergence_deadline_secs: 120,
            probe_attempts: 5,
            probe_timeout_secs: 1,
        }
    }
}

impl TimingConfig {
    /// Interval between two session-state queries.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Deadline for a session to reach the expected state.
    pub fn convergence_deadline(&self) -> Duration {
        Duration::from_secs(self.convergence_deadline_secs)
    }

    /// Timeout of a single reachability probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
