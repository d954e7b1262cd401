//! Pipeline definition validation
//!
//! Validation is total: every problem in a definition is collected and
//! returned together, and no pipeline instance is ever created from a
//! definition that produced one.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::pipeline::{JobDefinition, PipelineDefinition};
use crate::model::graph::JobGraph;

const MAX_NAME_LEN: usize = 255;

/// A single rule violation in a submitted definition
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("stage '{stage}' has no jobs")]
    EmptyStage { stage: String },

    #[error("invalid name '{name}': use 1-255 characters from [A-Za-z0-9_.-]")]
    InvalidName { name: String },

    #[error("stage '{stage}' is defined more than once")]
    DuplicateStage { stage: String },

    #[error("job '{job}' in stage '{stage}' is defined more than once")]
    DuplicateJob { stage: String, job: String },

    #[error("job '{job}' in stage '{stage}' has no image")]
    MissingImage { stage: String, job: String },

    #[error("job '{job}' in stage '{stage}' has an empty script")]
    EmptyScript { stage: String, job: String },

    #[error("job '{job}' in stage '{stage}' depends on unknown job '{dependency}'")]
    UnknownDependency {
        stage: String,
        job: String,
        dependency: String,
    },

    #[error(
        "job '{job}' in stage '{stage}' depends on '{dependency}' from stage '{dependency_stage}'"
    )]
    CrossStageDependency {
        stage: String,
        job: String,
        dependency: String,
        dependency_stage: String,
    },

    #[error("job '{job}' in stage '{stage}' depends on itself")]
    SelfDependency { stage: String, job: String },

    #[error("dependency cycle in stage '{stage}': {}", .path.join(" -> "))]
    Cycle { stage: String, path: Vec<String> },
}

/// Every violation found in a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// A definition that passed validation
///
/// Fields are private so the only way to obtain one is through [`validate`].
#[derive(Debug, Clone)]
pub struct ValidatedPipeline {
    name: String,
    stages: Vec<ValidatedStage>,
}

impl ValidatedPipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[ValidatedStage] {
        &self.stages
    }
}

/// A validated stage with its dependency graph
#[derive(Debug, Clone)]
pub struct ValidatedStage {
    name: String,
    allow_failure: bool,
    jobs: Vec<JobDefinition>,
    graph: JobGraph,
}

impl ValidatedStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow_failure(&self) -> bool {
        self.allow_failure
    }

    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Validates a pipeline definition
pub fn validate(def: &PipelineDefinition) -> Result<ValidatedPipeline, ValidationErrors> {
    let mut errors = Vec::new();

    if !valid_name(&def.name) {
        errors.push(ValidationError::InvalidName {
            name: def.name.clone(),
        });
    }
    if def.stages.is_empty() {
        errors.push(ValidationError::EmptyPipeline);
    }

    // Pipeline-wide job index, used to tell cross-stage from unknown references.
    // The first definition of a duplicated name wins.
    let mut job_stage: HashMap<&str, &str> = HashMap::new();
    let mut seen_stages = HashSet::new();

    for stage in &def.stages {
        if !valid_name(&stage.name) {
            errors.push(ValidationError::InvalidName {
                name: stage.name.clone(),
            });
        }
        if !seen_stages.insert(stage.name.as_str()) {
            errors.push(ValidationError::DuplicateStage {
                stage: stage.name.clone(),
            });
        }
        if stage.jobs.is_empty() {
            errors.push(ValidationError::EmptyStage {
                stage: stage.name.clone(),
            });
        }

        for job in &stage.jobs {
            if !valid_name(&job.name) {
                errors.push(ValidationError::InvalidName {
                    name: job.name.clone(),
                });
            }
            if job_stage.contains_key(job.name.as_str()) {
                errors.push(ValidationError::DuplicateJob {
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                });
            } else {
                job_stage.insert(&job.name, &stage.name);
            }
            if job.image.trim().is_empty() {
                errors.push(ValidationError::MissingImage {
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                });
            }
            if job.script.iter().all(|line| line.trim().is_empty()) {
                errors.push(ValidationError::EmptyScript {
                    stage: stage.name.clone(),
                    job: job.name.clone(),
                });
            }
        }
    }

    let mut stages = Vec::with_capacity(def.stages.len());

    for stage in &def.stages {
        let mut local: HashMap<&str, usize> = HashMap::new();
        for (idx, job) in stage.jobs.iter().enumerate() {
            local.entry(job.name.as_str()).or_insert(idx);
        }

        let mut edges = Vec::with_capacity(stage.jobs.len());
        for (idx, job) in stage.jobs.iter().enumerate() {
            let mut deps = Vec::new();
            for dep in &job.depends_on {
                if dep == &job.name {
                    errors.push(ValidationError::SelfDependency {
                        stage: stage.name.clone(),
                        job: job.name.clone(),
                    });
                    continue;
                }
                match local.get(dep.as_str()) {
                    Some(&target) if target != idx => {
                        if !deps.contains(&target) {
                            deps.push(target);
                        }
                    }
                    Some(_) => {}
                    None => match job_stage.get(dep.as_str()) {
                        Some(other) => errors.push(ValidationError::CrossStageDependency {
                            stage: stage.name.clone(),
                            job: job.name.clone(),
                            dependency: dep.clone(),
                            dependency_stage: other.to_string(),
                        }),
                        None => errors.push(ValidationError::UnknownDependency {
                            stage: stage.name.clone(),
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        }),
                    },
                }
            }
            edges.push(deps);
        }

        let names = stage.jobs.iter().map(|j| j.name.clone()).collect();
        let graph = JobGraph::new(names, edges);
        if let Some(path) = graph.find_cycle() {
            errors.push(ValidationError::Cycle {
                stage: stage.name.clone(),
                path,
            });
        }

        stages.push(ValidatedStage {
            name: stage.name.clone(),
            allow_failure: stage.allow_failure,
            jobs: stage.jobs.clone(),
            graph,
        });
    }

    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }

    Ok(ValidatedPipeline {
        name: def.name.clone(),
        stages,
    })
}
