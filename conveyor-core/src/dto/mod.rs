//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between Conveyor services
//! (orchestrator, worker, submitters). DTOs are lightweight representations of
//! domain entities optimized for network transfer.

pub mod job;
pub mod pipeline;
pub mod worker;
