//! Conveyor Orchestrator
//!
//! The control plane: accepts pipeline definitions, tracks every run in an
//! in-memory execution store, schedules runnable jobs onto workers and
//! applies their results.
//!
//! Architecture:
//! - Store: authoritative run state, one serialized section per pipeline
//! - Aggregate: pure stage and pipeline status rollup
//! - Scheduler: state machine, dispatch loop and liveness sweep
//! - Registry & Dispatcher: worker health, slot reservation and RPCs
//! - API: thin HTTP adapter over the scheduler
//! - Repository: optional Postgres run history

pub mod aggregate;
pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod store;
