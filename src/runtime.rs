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

//! Module for managing the container/namespace runtime.
//!
//! The harness never talks to a runtime directly; everything goes through the
//! [`ContainerRuntime`] trait, which is injected into every node at construction time. This keeps
//! the orchestration logic testable without real containers. The production implementation is
//! [`DockerRuntime`], which drives the `docker` CLI through `tokio::process`.

use std::{process::Output, string::FromUtf8Error, time::Duration};

use async_trait::async_trait;
use ipnet::IpNet;
use itertools::Itertools;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

use crate::config::CONFIG;

/// Handle to a running container (an isolated network namespace plus a process tree).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

/// Handle to a network segment (an isolated L2 bridge with one subnet).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentHandle(pub String);

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Interface to the container runtime used by the harness.
///
/// All operations are asynchronous and must be cancel-safe; the harness wraps them in timeouts
/// where a stuck runtime would otherwise hang the whole run.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is usable at all. Called once, before any topology is built.
    async fn probe(&self) -> Result<(), RuntimeError>;

    /// Launch a new container running the given image with the given kernel capabilities. The
    /// container starts with no network attachments.
    async fn launch(
        &self,
        name: &str,
        image: &str,
        capabilities: &[&str],
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Terminate a container and release its namespace. Must succeed on an already-terminated
    /// container.
    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Execute a command inside the container and return its standard output. A non-zero exit
    /// code is an error.
    async fn exec(&self, handle: &ContainerHandle, argv: &[&str]) -> Result<String, RuntimeError>;

    /// Execute a command inside the container and return whether it exited successfully.
    async fn exec_status(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
    ) -> Result<bool, RuntimeError>;

    /// Execute a command inside the container without waiting for it to finish. Used to start
    /// long-running daemons.
    async fn exec_detached(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
    ) -> Result<(), RuntimeError>;

    /// Write a file inside the container.
    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        content: &str,
    ) -> Result<(), RuntimeError>;

    /// Create a new isolated network segment with the given subnet.
    async fn create_network_segment(
        &self,
        name: &str,
        subnet: IpNet,
    ) -> Result<SegmentHandle, RuntimeError>;

    /// Remove a network segment. Must succeed on an already-removed segment.
    async fn remove_network_segment(&self, handle: &SegmentHandle) -> Result<(), RuntimeError>;

    /// Attach a container to a network segment with the given interface address. The address is
    /// allocated by the caller (see [`crate::topology::VirtualBridge`]); the runtime only applies
    /// it.
    async fn attach(
        &self,
        segment: &SegmentHandle,
        container: &ContainerHandle,
        addr: IpNet,
    ) -> Result<(), RuntimeError>;
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Container runtime backed by the `docker` CLI.
///
/// Every container and network name is prefixed with the configured name prefix, so that parallel
/// runs on the same host do not collide.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    prefix: String,
}

impl DockerRuntime {
    /// Create a new docker-backed runtime using the configured name prefix.
    pub fn new() -> Self {
        Self {
            prefix: CONFIG.name_prefix.clone(),
        }
    }

    fn scoped(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Create a raw `docker` command with `kill_on_drop` set, so that a cancelled harness does not
    /// leave client processes behind.
    fn raw_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        log::trace!("[tokio::process::Command] {:?}", cmd);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.raw_command(args).output().await?;
        let (stdout, _) = check_output("docker", output, || args.iter().join(" "))?;
        Ok(String::from_utf8(stdout)?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn probe(&self) -> Result<(), RuntimeError> {
        let version = timeout(
            PROBE_TIMEOUT,
            self.run_checked(&["version", "--format", "{{.Server.Version}}"]),
        )
        .await
        .map_err(|_| RuntimeError::Unavailable("docker daemon did not answer".to_string()))?
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        log::debug!("[docker] server version {}", version.trim());
        Ok(())
    }

    async fn launch(
        &self,
        name: &str,
        image: &str,
        capabilities: &[&str],
    ) -> Result<ContainerHandle, RuntimeError> {
        let scoped = self.scoped(name);
        log::debug!("[{scoped}] launching container from image {image}");

        // remove any stale container of the same name from a previous, aborted run
        let _ = self
            .raw_command(&["rm", "-f", &scoped])
            .output()
            .await?;

        let caps = capabilities
            .iter()
            .map(|c| format!("--cap-add={c}"))
            .collect_vec();
        let mut args = vec!["run", "-d", "--net=none", "--name", &scoped];
        args.extend(caps.iter().map(String::as_str));
        args.extend(["--entrypoint", "tail", image, "-f", "/dev/null"]);
        self.run_checked(&args).await?;

        Ok(ContainerHandle(scoped))
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        log::debug!("[{handle}] terminating container");
        // `rm -f` also succeeds when the container is already gone
        let _ = self
            .raw_command(&["rm", "-f", &handle.0])
            .output()
            .await?;
        Ok(())
    }

    async fn exec(&self, handle: &ContainerHandle, argv: &[&str]) -> Result<String, RuntimeError> {
        log::trace!("[{handle}] `{}`", argv.iter().join(" "));
        let mut args = vec!["exec", handle.0.as_str()];
        args.extend_from_slice(argv);
        self.run_checked(&args).await
    }

    async fn exec_status(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
    ) -> Result<bool, RuntimeError> {
        log::trace!("[{handle}] `{}`", argv.iter().join(" "));
        let mut args = vec!["exec", handle.0.as_str()];
        args.extend_from_slice(argv);
        let output = self.raw_command(&args).output().await?;
        Ok(output.status.success())
    }

    async fn exec_detached(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
    ) -> Result<(), RuntimeError> {
        log::trace!("[{handle}] (detached) `{}`", argv.iter().join(" "));
        let mut args = vec!["exec", "-d", handle.0.as_str()];
        args.extend_from_slice(argv);
        let output = self.raw_command(&args).output().await?;
        check_output(&handle.0, output, || argv.iter().join(" "))?;
        Ok(())
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        content: &str,
    ) -> Result<(), RuntimeError> {
        log::trace!("[{handle}] write file {path}");
        let mut tee = self
            .raw_command(&["exec", "-i", &handle.0, "tee", path])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        tee.stdin
            .take()
            .expect("stdin was piped")
            .write_all(content.as_bytes())
            .await?;
        let result = tee.wait_with_output().await?;
        if result.status.success() {
            Ok(())
        } else {
            log::error!(
                "[{handle}] cannot write {path}:\n{}",
                String::from_utf8_lossy(&result.stderr)
            );
            Err(RuntimeError::CommandError(
                handle.0.clone(),
                format!("tee {path}"),
                result.status.code().unwrap_or_default(),
            ))
        }
    }

    async fn create_network_segment(
        &self,
        name: &str,
        subnet: IpNet,
    ) -> Result<SegmentHandle, RuntimeError> {
        let scoped = self.scoped(name);
        log::debug!("[{scoped}] creating network segment with subnet {subnet}");

        // remove a stale segment of the same name from a previous, aborted run
        let _ = self
            .raw_command(&["network", "rm", &scoped])
            .output()
            .await?;

        let subnet_str = subnet.to_string();
        let mut args = vec!["network", "create", "--driver", "bridge"];
        if matches!(subnet, IpNet::V6(_)) {
            args.push("--ipv6");
        }
        args.extend(["--subnet", &subnet_str, &scoped]);
        self.run_checked(&args).await?;

        Ok(SegmentHandle(scoped))
    }

    async fn remove_network_segment(&self, handle: &SegmentHandle) -> Result<(), RuntimeError> {
        log::debug!("[{handle}] removing network segment");
        let _ = self
            .raw_command(&["network", "rm", &handle.0])
            .output()
            .await?;
        Ok(())
    }

    async fn attach(
        &self,
        segment: &SegmentHandle,
        container: &ContainerHandle,
        addr: IpNet,
    ) -> Result<(), RuntimeError> {
        log::debug!("[{container}] attaching to {segment} with address {addr}");
        let ip = addr.addr().to_string();
        let flag = if matches!(addr, IpNet::V6(_)) {
            "--ip6"
        } else {
            "--ip"
        };
        self.run_checked(&["network", "connect", flag, &ip, &segment.0, &container.0])
            .await?;
        Ok(())
    }
}

/// Check the output for a successful exit code.
pub(crate) fn check_output<F, S>(
    host: &str,
    output: Output,
    cmd: F,
) -> Result<(Vec<u8>, Vec<u8>), RuntimeError>
where
    F: FnOnce() -> S,
    S: std::fmt::Display,
{
    if output.status.success() {
        Ok((output.stdout, output.stderr))
    } else {
        let cmd = cmd().to_string();
        log::error!(
            "[{}] {} exited with exit code {}{}{}",
            host,
            cmd,
            output.status.code().unwrap_or_default(),
            if !output.stdout.is_empty() {
                format!("\nSTDOUT:\n{}", String::from_utf8_lossy(&output.stdout))
            } else {
                String::new()
            },
            if !output.stderr.is_empty() {
                format!("\nSTDERR:\n{}", String::from_utf8_lossy(&output.stderr))
            } else {
                String::new()
            }
        );
        Err(RuntimeError::CommandError(
            host.to_string(),
            cmd,
            output.status.code().unwrap_or_default(),
        ))
    }
}

/// Error kind returned by a [`ContainerRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime is not usable at all. Fatal; raised before any topology is built.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// Error while interacting with the runtime client process.
    #[error("runtime client error: {0}")]
    Client(#[from] std::io::Error),
    /// A command exited with a non-zero exit code.
    #[error("non-zero exit code of command {1} on {0}: {2}")]
    CommandError(String, String, i32),
    /// Cannot parse output as UTF-8.
    #[error("cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}
