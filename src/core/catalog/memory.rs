//! In-memory catalog for exercising the reconciler without a server

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    CatalogResult, CatalogService, EdgeSpec, EnsureOutcome, EntityRef, ExistingEdge, ExistingPipeline, PipelineSpec,
    ServiceSpec, TaskSpec,
};
use crate::error::CatalogError;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CatalogSnapshot {
    pub services: BTreeSet<String>,
    /// pipeline fqn -> task names
    pub pipelines: BTreeMap<String, Vec<String>>,
    /// (from entity fqn, to entity fqn) -> stored column lineage
    pub edges: BTreeMap<(String, String), ExistingEdge>,
}

#[derive(Default)]
struct CatalogState {
    snapshot: CatalogSnapshot,
    pipeline_ids: BTreeMap<String, String>,
    creations: usize,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
    failing: HashSet<String>,
    latency: Option<Duration>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call touching `identity` fails with a transport error
    pub fn failing_on(mut self, identity: &str) -> Self {
        self.failing.insert(identity.to_string());
        self
    }

    /// Every call sleeps this long first
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn creations(&self) -> usize {
        self.state.lock().unwrap().creations
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.state.lock().unwrap().snapshot.clone()
    }

    async fn enter(&self, identity: &str) -> CatalogResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.contains(identity) {
            return Err(CatalogError::Transport(format!("injected failure for {}", identity)));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn find_service(&self, name: &str) -> CatalogResult<Option<String>> {
        self.enter(name).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshot
            .services
            .contains(name)
            .then(|| format!("service-{}", name)))
    }

    async fn ensure_service(&self, spec: &ServiceSpec) -> CatalogResult<EnsureOutcome> {
        self.enter(&spec.name).await?;
        let mut state = self.state.lock().unwrap();
        if state.snapshot.services.insert(spec.name.clone()) {
            state.creations += 1;
            Ok(EnsureOutcome::Created)
        } else {
            Ok(EnsureOutcome::AlreadyExisted)
        }
    }

    async fn find_pipeline(&self, fqn: &str) -> CatalogResult<Option<ExistingPipeline>> {
        self.enter(fqn).await?;
        let state = self.state.lock().unwrap();
        Ok(state.pipeline_ids.get(fqn).map(|id| ExistingPipeline {
            id: id.clone(),
            tasks: state.snapshot.pipelines.get(fqn).cloned().unwrap_or_default(),
        }))
    }

    async fn ensure_pipeline(&self, spec: &PipelineSpec) -> CatalogResult<EnsureOutcome> {
        self.enter(&spec.fqn).await?;
        let mut state = self.state.lock().unwrap();
        if state.pipeline_ids.contains_key(&spec.fqn) {
            return Ok(EnsureOutcome::AlreadyExisted);
        }

        let id = format!("pipeline-{}", state.pipeline_ids.len() + 1);
        state.pipeline_ids.insert(spec.fqn.clone(), id);
        state
            .snapshot
            .pipelines
            .insert(spec.fqn.clone(), spec.tasks.iter().map(|t| t.name.clone()).collect());
        state.creations += 1;
        Ok(EnsureOutcome::Created)
    }

    async fn ensure_task(&self, pipeline_id: &str, spec: &TaskSpec) -> CatalogResult<EnsureOutcome> {
        self.enter(&spec.fqn).await?;
        let mut state = self.state.lock().unwrap();
        let fqn = state
            .pipeline_ids
            .iter()
            .find(|(_, id)| id.as_str() == pipeline_id)
            .map(|(fqn, _)| fqn.clone())
            .ok_or_else(|| CatalogError::MissingEntity(pipeline_id.to_string()))?;

        let tasks = state.snapshot.pipelines.entry(fqn).or_default();
        if tasks.contains(&spec.name) {
            return Ok(EnsureOutcome::AlreadyExisted);
        }
        tasks.push(spec.name.clone());
        state.creations += 1;
        Ok(EnsureOutcome::Created)
    }

    async fn find_edge(&self, from: &EntityRef, to: &EntityRef) -> CatalogResult<Option<ExistingEdge>> {
        self.enter(&format!("{} -> {}", from.fqn, to.fqn)).await?;
        let state = self.state.lock().unwrap();
        Ok(state.snapshot.edges.get(&(from.fqn.clone(), to.fqn.clone())).cloned())
    }

    /// Like the lineage API, a write replaces whatever columns were stored
    async fn ensure_edge(&self, spec: &EdgeSpec) -> CatalogResult<EnsureOutcome> {
        self.enter(&spec.identity()).await?;
        let stored = ExistingEdge {
            from_columns: spec.from_columns.clone(),
            to_columns: spec.to_columns.clone(),
        };
        let mut state = self.state.lock().unwrap();
        let key = (spec.from.fqn.clone(), spec.to.fqn.clone());
        if state.snapshot.edges.get(&key) == Some(&stored) {
            return Ok(EnsureOutcome::AlreadyExisted);
        }
        state.snapshot.edges.insert(key, stored);
        state.creations += 1;
        Ok(EnsureOutcome::Created)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
