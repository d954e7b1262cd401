//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor CI/CD system.
//!
//! This crate contains:
//! - Domain types: Core business entities (pipeline runs, stages, jobs, workers)
//! - Model: Validation of submitted pipeline definitions into job graphs
//! - DTOs: Data transfer objects for inter-service communication

pub mod domain;
pub mod dto;
pub mod model;
