//! Core domain types
//!
//! This module contains the core domain structures used across Conveyor services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns and mutates them) and workers and clients (which
//! read them over the wire).

pub mod job;
pub mod pipeline;
pub mod stage;
pub mod status;
pub mod worker;
