//! Repository Module
//!
//! Data access layer for the orchestrator. The in-memory execution store is
//! authoritative; the database only keeps run history.

pub mod run;

// Re-export for convenience
pub use run as run_repository;
