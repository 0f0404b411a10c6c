//! Catalog integration
//!
//! The reconciler only talks to the `CatalogService` trait. `OpenMetadataClient`
//! implements it against the OpenMetadata REST API; tests use an in-memory
//! catalog instead.

mod openmetadata;
#[cfg(test)]
pub mod memory;

pub use openmetadata::OpenMetadataClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use super::model::{Endpoint, LineageEdge, PipelineModel, TaskModel};
use crate::error::CatalogError;

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Result of an ensure call that reached the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnsureOutcome {
    Created,
    AlreadyExisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub service_type: String,
}

impl ServiceSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            service_type: "CustomPipeline".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    pub fqn: String,
    pub description: Option<String>,
    pub source_line: usize,
}

impl From<&TaskModel> for TaskSpec {
    fn from(task: &TaskModel) -> Self {
        Self {
            name: task.name.clone(),
            fqn: task.fqn.clone(),
            description: task.description.clone(),
            source_line: task.line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub service: String,
    pub name: String,
    pub fqn: String,
    pub source_path: PathBuf,
    pub source_hash: String,
    pub tasks: Vec<TaskSpec>,
}

impl From<&PipelineModel> for PipelineSpec {
    fn from(pipeline: &PipelineModel) -> Self {
        Self {
            service: pipeline.service.clone(),
            name: pipeline.name.clone(),
            fqn: pipeline.fqn.clone(),
            source_path: pipeline.source_path.clone(),
            source_hash: pipeline.content_hash.clone(),
            tasks: pipeline.tasks.iter().map(TaskSpec::from).collect(),
        }
    }
}

/// A catalog entity a lineage edge attaches to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub fqn: String,
}

impl EntityRef {
    /// Tasks attach to their pipeline and columns to their asset
    pub fn anchor(endpoint: &Endpoint) -> Self {
        match endpoint {
            Endpoint::Task { pipeline_fqn, .. } => Self {
                entity_type: "pipeline".to_string(),
                fqn: pipeline_fqn.clone(),
            },
            Endpoint::Asset { entity_type, fqn } => Self {
                entity_type: entity_type.clone(),
                fqn: fqn.clone(),
            },
            Endpoint::Column {
                entity_type, asset_fqn, ..
            } => Self {
                entity_type: entity_type.clone(),
                fqn: asset_fqn.clone(),
            },
        }
    }
}

/// One catalog lineage edge: every model edge between the same pair of
/// catalog entities, with the union of their columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub from: EntityRef,
    pub to: EntityRef,
    /// Columns of `from` feeding the edge
    pub from_columns: BTreeSet<String>,
    /// Columns of `to` fed by the edge
    pub to_columns: BTreeSet<String>,
    /// Tasks whose declarations produced the edge
    pub tasks: Vec<String>,
    pub description: String,
}

impl EdgeSpec {
    pub fn identity(&self) -> String {
        format!("{} -> {}", self.from.fqn, self.to.fqn)
    }

    /// Group model edges by catalog entity pair, in first-seen order
    pub fn group<'a>(edges: impl IntoIterator<Item = &'a LineageEdge>) -> Vec<EdgeSpec> {
        let mut specs: Vec<EdgeSpec> = Vec::new();
        let mut declarations: Vec<Vec<String>> = Vec::new();

        for edge in edges {
            let from = EntityRef::anchor(&edge.from);
            let to = EntityRef::anchor(&edge.to);

            let idx = match specs.iter().position(|s| s.from == from && s.to == to) {
                Some(idx) => idx,
                None => {
                    specs.push(EdgeSpec {
                        from,
                        to,
                        from_columns: BTreeSet::new(),
                        to_columns: BTreeSet::new(),
                        tasks: Vec::new(),
                        description: String::new(),
                    });
                    declarations.push(Vec::new());
                    specs.len() - 1
                }
            };

            let spec = &mut specs[idx];
            if let Endpoint::Column { column_fqn, .. } = &edge.from {
                spec.from_columns.insert(column_fqn.clone());
            }
            if let Endpoint::Column { column_fqn, .. } = &edge.to {
                spec.to_columns.insert(column_fqn.clone());
            }
            for endpoint in [&edge.from, &edge.to] {
                if let Endpoint::Task { task_fqn, .. } = endpoint {
                    if !spec.tasks.contains(task_fqn) {
                        spec.tasks.push(task_fqn.clone());
                    }
                }
            }
            declarations[idx].push(edge.reference.to_string());
        }

        for (spec, declared) in specs.iter_mut().zip(declarations) {
            spec.description = format!("Declared in docstrings: {}", declared.join(", "));
        }
        specs
    }

    /// Whether an existing catalog edge already carries every column of this one
    pub fn is_carried_by(&self, existing: &ExistingEdge) -> bool {
        self.from_columns.is_subset(&existing.from_columns) && self.to_columns.is_subset(&existing.to_columns)
    }

    /// Lineage writes replace the stored columns, so keep the ones already there
    pub fn merged_with(&self, existing: &ExistingEdge) -> Self {
        let mut merged = self.clone();
        merged.from_columns.extend(existing.from_columns.iter().cloned());
        merged.to_columns.extend(existing.to_columns.iter().cloned());
        merged
    }
}

/// Column lineage stored on an existing catalog edge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingEdge {
    pub from_columns: BTreeSet<String>,
    pub to_columns: BTreeSet<String>,
}

/// A pipeline as the catalog currently knows it
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingPipeline {
    pub id: String,
    pub tasks: Vec<String>,
}

/// Operations the reconciler needs from a metadata catalog.
///
/// Implementations report what they did; callers decide whether to call.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Look up a pipeline service, returning its id
    async fn find_service(&self, name: &str) -> CatalogResult<Option<String>>;

    async fn ensure_service(&self, spec: &ServiceSpec) -> CatalogResult<EnsureOutcome>;

    async fn find_pipeline(&self, fqn: &str) -> CatalogResult<Option<ExistingPipeline>>;

    /// Create a pipeline together with its tasks
    async fn ensure_pipeline(&self, spec: &PipelineSpec) -> CatalogResult<EnsureOutcome>;

    /// Add one task to an existing pipeline
    async fn ensure_task(&self, pipeline_id: &str, spec: &TaskSpec) -> CatalogResult<EnsureOutcome>;

    /// Look up the edge between two catalog entities
    async fn find_edge(&self, from: &EntityRef, to: &EntityRef) -> CatalogResult<Option<ExistingEdge>>;

    /// Write an edge; the written columns replace any stored ones
    async fn ensure_edge(&self, spec: &EdgeSpec) -> CatalogResult<EnsureOutcome>;

    /// Human-readable name for logs
    fn name(&self) -> &str;
}
