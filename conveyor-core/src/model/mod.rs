//! Pipeline model and validation
//!
//! Turns a submitted `PipelineDefinition` into an immutable
//! `ValidatedPipeline`, or the complete list of problems with it.

pub mod graph;
pub mod validate;

pub use graph::JobGraph;
pub use validate::{ValidatedPipeline, ValidatedStage, ValidationError, ValidationErrors, validate};
