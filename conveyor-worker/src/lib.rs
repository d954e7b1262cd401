//! Conveyor Worker
//!
//! A worker node that runs dispatched jobs in containers and reports their
//! outcome to the orchestrator.
//!
//! Architecture:
//! - Coordinator: capacity slots, one supervision task per job
//! - Runtime: the container capability, backed by podman
//! - Report: terminal report delivery with bounded retries
//! - Heartbeat: registration and liveness towards the orchestrator
//! - API: dispatch, cancel and health endpoints

pub mod api;
pub mod config;
pub mod coordinator;
pub mod heartbeat;
pub mod podman;
pub mod report;
pub mod runtime;
