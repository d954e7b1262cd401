//! Podman container runtime
//!
//! Each job attempt gets one detached container whose entrypoint is
//! overridden to `/bin/sh`, so images with custom entrypoints behave the same.
//! All calls shell out to the `podman` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Command;
use tracing::{debug, info};

use crate::runtime::{ContainerHandle, ContainerRuntime, RuntimeError, render_script};

/// Seconds podman waits after SIGTERM before killing a stopped container
const STOP_GRACE_SECONDS: &str = "5";

/// Checks if podman is installed and available
pub fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// [`ContainerRuntime`] backed by the podman CLI
#[derive(Debug, Clone, Default)]
pub struct PodmanRuntime;

impl PodmanRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Runs one podman subcommand and returns its trimmed stdout
    async fn podman(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command = args.first().copied().unwrap_or_default().to_string();

        let output = tokio::process::Command::new("podman")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !stdout.is_empty() {
            debug!("podman {} stdout: {}", command, stdout);
        }
        if !stderr.is_empty() {
            debug!("podman {} stderr: {}", command, stderr);
        }

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn create(&self, name: &str, image: &str, script: &[String]) -> Result<ContainerHandle, RuntimeError> {
        info!("Creating container {} for image {}", name, image);

        let program = render_script(script);
        let id = self
            .podman(&[
                "run",
                "-d",
                "--name",
                name,
                "--entrypoint",
                "/bin/sh",
                image,
                "-c",
                &program,
            ])
            .await?;

        debug!("Container {} started with ID: {}", name, id);

        Ok(ContainerHandle {
            name: name.to_string(),
            id,
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i32, RuntimeError> {
        let output = self.podman(&["wait", &handle.name]).await?;

        let exit_code = output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i32>().ok());

        exit_code.ok_or(RuntimeError::UnexpectedOutput {
            command: "wait".to_string(),
            output,
        })
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        debug!("Stopping container {}", handle.name);
        self.podman(&["stop", "-t", STOP_GRACE_SECONDS, &handle.name])
            .await
            .map(|_| ())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.podman(&["rm", "-f", &handle.name]).await?;
        debug!("Container {} removed", handle.name);
        Ok(())
    }
}
