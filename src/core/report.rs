use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::catalog::{CatalogResult, EnsureOutcome};
use super::model::{ModelWarning, PipelineModel};
use super::scanner::ScanFailure;
use crate::error::Result;

/// How a run interacts with the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Dump the model, touch nothing
    DryRun,
    /// Write the operations that would be applied
    Offline,
    /// Apply missing entities to the live catalog
    Online,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::DryRun => "dry-run",
            Mode::Offline => "offline",
            Mode::Online => "online",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Service,
    Pipeline,
    Task,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Created,
    AlreadyExisted,
    Failed { reason: String },
}

/// What happened to one catalog entity during an online run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub kind: EntityKind,
    pub target: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl EntityOutcome {
    pub fn new(kind: EntityKind, target: &str, status: OutcomeStatus) -> Self {
        Self {
            kind,
            target: target.to_string(),
            status,
        }
    }

    pub fn failed(kind: EntityKind, target: &str, reason: impl Into<String>) -> Self {
        Self::new(kind, target, OutcomeStatus::Failed { reason: reason.into() })
    }

    pub fn from_result(kind: EntityKind, target: &str, result: CatalogResult<EnsureOutcome>) -> Self {
        match result {
            Ok(EnsureOutcome::Created) => Self::new(kind, target, OutcomeStatus::Created),
            Ok(EnsureOutcome::AlreadyExisted) => Self::new(kind, target, OutcomeStatus::AlreadyExisted),
            Err(e) => Self::failed(kind, target, e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSummary {
    pub created: usize,
    pub already_existed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub service: KindSummary,
    pub pipeline: KindSummary,
    pub task: KindSummary,
    pub edge: KindSummary,
}

impl RunSummary {
    fn record(&mut self, outcome: &EntityOutcome) {
        let counts = match outcome.kind {
            EntityKind::Service => &mut self.service,
            EntityKind::Pipeline => &mut self.pipeline,
            EntityKind::Task => &mut self.task,
            EntityKind::Edge => &mut self.edge,
        };
        match outcome.status {
            OutcomeStatus::Created => counts.created += 1,
            OutcomeStatus::AlreadyExisted => counts.already_existed += 1,
            OutcomeStatus::Failed { .. } => counts.failed += 1,
        }
    }

    pub fn total_created(&self) -> usize {
        self.service.created + self.pipeline.created + self.task.created + self.edge.created
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionWarning {
    pub function: String,
    pub warning: ModelWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub path: PathBuf,
    pub pipeline: Option<String>,
    pub tasks: usize,
    pub edges: usize,
    pub warnings: Vec<FunctionWarning>,
    /// Set when the file could not be processed at all
    pub error: Option<String>,
}

impl FileReport {
    pub fn from_model(model: &PipelineModel) -> Self {
        Self {
            path: model.source_path.clone(),
            pipeline: Some(model.fqn.clone()),
            tasks: model.tasks.len(),
            edges: model.edges().count(),
            warnings: model
                .warnings()
                .map(|(function, warning)| FunctionWarning {
                    function: function.to_string(),
                    warning: warning.clone(),
                })
                .collect(),
            error: None,
        }
    }

    pub fn from_failure(failure: &ScanFailure) -> Self {
        Self {
            path: failure.path.clone(),
            pipeline: None,
            tasks: 0,
            edges: 0,
            warnings: Vec::new(),
            error: Some(failure.error.clone()),
        }
    }
}

/// Everything a run did, including everything that went wrong
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub mode: Mode,
    pub files: Vec<FileReport>,
    pub outcomes: Vec<EntityOutcome>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(mode: Mode) -> Self {
        Self {
            generated_at: Utc::now(),
            mode,
            files: Vec::new(),
            outcomes: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn add_outcome(&mut self, outcome: EntityOutcome) {
        if let OutcomeStatus::Failed { reason } = &outcome.status {
            warn!("Failed to ensure {:?} {}: {}", outcome.kind, outcome.target, reason);
        }
        self.summary.record(&outcome);
        self.outcomes.push(outcome);
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(EntityOutcome::is_failed) || self.files.iter().any(|f| f.error.is_some())
    }

    pub fn warning_count(&self) -> usize {
        self.files.iter().map(|f| f.warnings.len()).sum()
    }

    pub fn log_summary(&self) {
        let failed_files = self.files.iter().filter(|f| f.error.is_some()).count();
        info!(
            "📊 {} run complete: {} files ({} failed), {} warnings",
            self.mode,
            self.files.len(),
            failed_files,
            self.warning_count()
        );

        if self.mode == Mode::Online {
            for (label, counts) in [
                ("services", self.summary.service),
                ("pipelines", self.summary.pipeline),
                ("tasks", self.summary.task),
                ("edges", self.summary.edge),
            ] {
                info!(
                    "  - {}: {} created, {} already existed, {} failed",
                    label, counts.created, counts.already_existed, counts.failed
                );
            }
        }
    }
}

/// Write pretty JSON to `path`, or to stdout when no path is given
pub fn write_json_artifact<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
            info!("✅ Wrote {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}
