//! Turns pipeline models into a dry-run dump, an offline intent list, or
//! live catalog mutations with ensure semantics.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use super::catalog::{CatalogResult, CatalogService, EdgeSpec, EnsureOutcome, PipelineSpec, ServiceSpec, TaskSpec};
use super::model::{LineageEdge, ModelWarning, PipelineModel};
use super::references::Reference;
use super::report::{EntityKind, EntityOutcome, OutcomeStatus};
use super::scanner::ScanFailure;
use crate::error::CatalogError;

/// Whether an ensure needs to create anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Noop,
    Create,
}

/// Ensure semantics: present means nothing to do
pub fn decide(already_present: bool) -> Decision {
    if already_present {
        Decision::Noop
    } else {
        Decision::Create
    }
}

/// Desired tasks the catalog does not know yet, in model order
pub fn missing_tasks<'a>(existing: &[String], desired: &'a [TaskSpec]) -> Vec<&'a TaskSpec> {
    desired
        .iter()
        .filter(|task| decide(existing.contains(&task.name)) == Decision::Create)
        .collect()
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunTask {
    pub name: String,
    pub line: usize,
    pub references: Vec<Reference>,
    pub edges: Vec<LineageEdge>,
    pub warnings: Vec<ModelWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunFile {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub tasks: Vec<DryRunTask>,
    /// Warnings from functions that produced no task
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<ModelWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full model dump; files that failed to scan are listed with their error
pub fn dry_run_artifact(models: &[PipelineModel], failures: &[ScanFailure]) -> Vec<DryRunFile> {
    let mut files: Vec<DryRunFile> = models
        .iter()
        .map(|model| DryRunFile {
            path: model.source_path.clone(),
            pipeline: Some(model.fqn.clone()),
            tasks: model
                .tasks
                .iter()
                .map(|task| DryRunTask {
                    name: task.name.clone(),
                    line: task.line,
                    references: task.references.clone(),
                    edges: task.edges.clone(),
                    warnings: task.warnings.clone(),
                })
                .collect(),
            warnings: model
                .unlinked
                .iter()
                .flat_map(|function| function.warnings.iter().cloned())
                .collect(),
            error: None,
        })
        .collect();

    files.extend(failures.iter().map(|failure| DryRunFile {
        path: failure.path.clone(),
        pipeline: None,
        tasks: Vec::new(),
        warnings: Vec::new(),
        error: Some(failure.error.clone()),
    }));

    files
}

// ---------------------------------------------------------------------------
// Offline plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    EnsureService,
    EnsurePipeline,
    EnsureTask,
    EnsureEdge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntentDetails {
    Service(ServiceSpec),
    Pipeline(PipelineSpec),
    Task(TaskSpec),
    Edge(EdgeSpec),
}

/// One catalog operation a run would apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub operation: Operation,
    pub target: String,
    pub details: IntentDetails,
}

/// Operations needed to realize the models, in application order, without
/// looking at the catalog.
///
/// The service comes first, then each pipeline (carrying its tasks) followed
/// by that pipeline's catalog edges.
pub fn plan(service_name: &str, models: &[PipelineModel]) -> Vec<Intent> {
    let pipelines: Vec<&PipelineModel> = models.iter().filter(|m| !m.tasks.is_empty()).collect();
    if pipelines.is_empty() {
        return Vec::new();
    }

    let mut intents = vec![Intent {
        operation: Operation::EnsureService,
        target: service_name.to_string(),
        details: IntentDetails::Service(ServiceSpec::new(service_name)),
    }];

    for model in pipelines {
        intents.push(Intent {
            operation: Operation::EnsurePipeline,
            target: model.fqn.clone(),
            details: IntentDetails::Pipeline(PipelineSpec::from(model)),
        });

        for spec in EdgeSpec::group(model.edges()) {
            intents.push(Intent {
                operation: Operation::EnsureEdge,
                target: spec.identity(),
                details: IntentDetails::Edge(spec),
            });
        }
    }

    intents
}

// ---------------------------------------------------------------------------
// Online
// ---------------------------------------------------------------------------

/// One async lock per entity identity, so a given entity is never ensured
/// twice at the same time
#[derive(Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    pub async fn acquire(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(identity.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Applies models to a catalog, creating only what is missing
pub struct Reconciler {
    catalog: Arc<dyn CatalogService>,
    timeout: Duration,
    locks: IdentityLocks,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CatalogService>, timeout: Duration) -> Self {
        Self {
            catalog,
            timeout,
            locks: IdentityLocks::default(),
        }
    }

    /// Bound a catalog call by the configured timeout
    async fn call<T, F>(&self, operation: &str, future: F) -> CatalogResult<T>
    where
        F: Future<Output = CatalogResult<T>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(CatalogError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }),
        }
    }

    pub async fn ensure_service(&self, name: &str) -> EntityOutcome {
        let _guard = self.locks.acquire(name).await;

        let existing = match self.call("find service", self.catalog.find_service(name)).await {
            Ok(existing) => existing,
            Err(e) => return EntityOutcome::failed(EntityKind::Service, name, e.to_string()),
        };

        match decide(existing.is_some()) {
            Decision::Noop => EntityOutcome::new(EntityKind::Service, name, OutcomeStatus::AlreadyExisted),
            Decision::Create => {
                let spec = ServiceSpec::new(name);
                let result = self.call("ensure service", self.catalog.ensure_service(&spec)).await;
                EntityOutcome::from_result(EntityKind::Service, name, result)
            }
        }
    }

    /// Ensure the pipeline, its tasks and its edges.
    ///
    /// Failures are reported per entity; nothing here aborts the run.
    pub async fn reconcile_pipeline(&self, model: &PipelineModel) -> Vec<EntityOutcome> {
        let mut outcomes = Vec::new();
        if model.tasks.is_empty() {
            return outcomes;
        }

        info!("🔗 Reconciling {} against {}", model.fqn, self.catalog.name());
        let spec = PipelineSpec::from(model);

        let (pipeline_outcome, task_outcomes) = self.ensure_pipeline(&spec).await;
        let pipeline_failed = pipeline_outcome.is_failed();
        outcomes.push(pipeline_outcome);
        outcomes.extend(task_outcomes);

        if pipeline_failed {
            let reason = format!("pipeline {} unavailable", model.fqn);
            outcomes.extend(
                EdgeSpec::group(model.edges())
                    .iter()
                    .map(|spec| EntityOutcome::failed(EntityKind::Edge, &spec.identity(), reason.clone())),
            );
            return outcomes;
        }

        let failed_tasks: HashSet<&str> = outcomes
            .iter()
            .filter(|o| o.kind == EntityKind::Task && o.is_failed())
            .map(|o| o.target.as_str())
            .collect();

        // Declarations of failed tasks are left out; an edge fed only by them fails
        let usable = EdgeSpec::group(
            model
                .tasks
                .iter()
                .filter(|task| !failed_tasks.contains(task.fqn.as_str()))
                .flat_map(|task| task.edges.iter()),
        );
        let mut edge_outcomes = Vec::new();
        for spec in EdgeSpec::group(model.edges()) {
            match usable.iter().find(|u| u.from == spec.from && u.to == spec.to) {
                Some(usable_spec) => edge_outcomes.push(self.ensure_edge(usable_spec).await),
                None => edge_outcomes.push(EntityOutcome::failed(
                    EntityKind::Edge,
                    &spec.identity(),
                    format!("tasks {} unavailable", spec.tasks.join(", ")),
                )),
            }
        }
        outcomes.extend(edge_outcomes);

        outcomes
    }

    /// Pipeline outcome plus one outcome per task
    async fn ensure_pipeline(&self, spec: &PipelineSpec) -> (EntityOutcome, Vec<EntityOutcome>) {
        let _guard = self.locks.acquire(&spec.fqn).await;

        let existing = match self.call("find pipeline", self.catalog.find_pipeline(&spec.fqn)).await {
            Ok(existing) => existing,
            Err(e) => return self.fail_pipeline(spec, e.to_string()),
        };

        match existing {
            None => {
                debug!("Creating pipeline {} with {} tasks", spec.fqn, spec.tasks.len());
                match self.call("ensure pipeline", self.catalog.ensure_pipeline(spec)).await {
                    Ok(outcome) => {
                        let status = match outcome {
                            EnsureOutcome::Created => OutcomeStatus::Created,
                            EnsureOutcome::AlreadyExisted => OutcomeStatus::AlreadyExisted,
                        };
                        // Tasks travel with the pipeline payload
                        let tasks = spec
                            .tasks
                            .iter()
                            .map(|task| EntityOutcome::new(EntityKind::Task, &task.fqn, status.clone()))
                            .collect();
                        (EntityOutcome::new(EntityKind::Pipeline, &spec.fqn, status), tasks)
                    }
                    Err(e) => self.fail_pipeline(spec, e.to_string()),
                }
            }
            Some(pipeline) => {
                let pipeline_outcome = EntityOutcome::new(EntityKind::Pipeline, &spec.fqn, OutcomeStatus::AlreadyExisted);
                let missing = missing_tasks(&pipeline.tasks, &spec.tasks);

                let mut tasks = Vec::with_capacity(spec.tasks.len());
                for task in &spec.tasks {
                    if !missing.iter().any(|m| m.name == task.name) {
                        tasks.push(EntityOutcome::new(EntityKind::Task, &task.fqn, OutcomeStatus::AlreadyExisted));
                        continue;
                    }

                    let _task_guard = self.locks.acquire(&task.fqn).await;
                    let result = self
                        .call("ensure task", self.catalog.ensure_task(&pipeline.id, task))
                        .await;
                    tasks.push(EntityOutcome::from_result(EntityKind::Task, &task.fqn, result));
                }

                (pipeline_outcome, tasks)
            }
        }
    }

    fn fail_pipeline(&self, spec: &PipelineSpec, reason: String) -> (EntityOutcome, Vec<EntityOutcome>) {
        let task_reason = format!("pipeline {} unavailable", spec.fqn);
        let tasks = spec
            .tasks
            .iter()
            .map(|task| EntityOutcome::failed(EntityKind::Task, &task.fqn, task_reason.clone()))
            .collect();
        (EntityOutcome::failed(EntityKind::Pipeline, &spec.fqn, reason), tasks)
    }

    async fn ensure_edge(&self, spec: &EdgeSpec) -> EntityOutcome {
        let identity = spec.identity();
        let _guard = self.locks.acquire(&identity).await;

        let existing = match self.call("find edge", self.catalog.find_edge(&spec.from, &spec.to)).await {
            Ok(existing) => existing,
            Err(e) => return EntityOutcome::failed(EntityKind::Edge, &identity, e.to_string()),
        };

        match decide(existing.as_ref().map_or(false, |edge| spec.is_carried_by(edge))) {
            Decision::Noop => EntityOutcome::new(EntityKind::Edge, &identity, OutcomeStatus::AlreadyExisted),
            Decision::Create => {
                let write = match &existing {
                    Some(edge) => spec.merged_with(edge),
                    None => spec.clone(),
                };
                debug!("Writing edge {} with {} columns", identity, write.from_columns.len() + write.to_columns.len());
                let result = self.call("ensure edge", self.catalog.ensure_edge(&write)).await;
                EntityOutcome::from_result(EntityKind::Edge, &identity, result)
            }
        }
    }
}
