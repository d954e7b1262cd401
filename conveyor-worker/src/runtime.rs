//! Container runtime capability
//!
//! The coordinator only drives containers through [`ContainerRuntime`];
//! production uses podman (see [`crate::podman`]), tests use an in-memory fake.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// A created container owned by exactly one supervision task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Container name, unique per job attempt
    pub name: String,
    /// Runtime-assigned container id
    pub id: String,
}

/// Failure of the container runtime itself
///
/// Always reported as an infrastructure failure, never as a job failure.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to execute `podman {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`podman {command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("unexpected output from `podman {command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
}

/// Lifecycle operations on job containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts a detached container running the job's script
    async fn create(&self, name: &str, image: &str, script: &[String]) -> Result<ContainerHandle, RuntimeError>;

    /// Blocks until the container exits and returns its exit code
    async fn wait(&self, handle: &ContainerHandle) -> Result<i32, RuntimeError>;

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}

/// Container name for one attempt of a job
pub fn container_name(job_id: Uuid, attempt: u32) -> String {
    format!("conveyor-{}-{}", job_id, attempt)
}

/// Joins script lines into one shell program that stops at the first failing line
pub fn render_script(script: &[String]) -> String {
    let mut program = String::from("set -e");
    for line in script {
        program.push('\n');
        program.push_str(line);
    }
    program
}
