use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::{CatalogService, OpenMetadataClient};
use super::model::{LineageModelBuilder, PipelineModel};
use super::reconciler::{self, Reconciler};
use super::report::{write_json_artifact, EntityKind, EntityOutcome, FileReport, Mode, RunReport};
use super::scanner::{ScanFailure, SourceScanner};
use crate::config::Config;

/// Main orchestration engine: scan, model, then run one of the three modes
pub struct Engine {
    config: Config,
}

/// Models built from one scan of a source tree
struct ScannedTree {
    models: Vec<PipelineModel>,
    failures: Vec<ScanFailure>,
}

impl Engine {
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        config.validate()?;

        debug!("Loaded configuration: {:?}", config);
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    /// Dry run: dump the full model, write nothing to the catalog
    pub async fn scan(&self, root: &Path, output: Option<PathBuf>, report_path: Option<PathBuf>) -> Result<()> {
        info!("🔍 Dry run over {}", root.display());
        let tree = self.scan_tree(root)?;
        let report = self.start_report(Mode::DryRun, &tree);

        let artifact = reconciler::dry_run_artifact(&tree.models, &tree.failures);
        write_json_artifact(&artifact, output.as_deref())?;

        self.finish(&report, report_path.as_deref(), false)
    }

    /// Offline: write the ordered intents without contacting the catalog
    pub async fn plan(&self, root: &Path, output: Option<PathBuf>, report_path: Option<PathBuf>) -> Result<()> {
        info!("📝 Planning catalog operations for {}", root.display());
        let tree = self.scan_tree(root)?;
        let report = self.start_report(Mode::Offline, &tree);

        let intents = reconciler::plan(&self.config.pipeline_service_name, &tree.models);
        info!("Planned {} operations", intents.len());

        let output = output.unwrap_or_else(|| PathBuf::from(&self.config.requests_path));
        write_json_artifact(&intents, Some(&output))?;

        self.finish(&report, report_path.as_deref(), false)
    }

    /// Online: ensure every modelled entity exists in the live catalog
    pub async fn apply(&self, root: &Path, report_path: Option<PathBuf>, strict: bool) -> Result<()> {
        let client = OpenMetadataClient::new(&self.config.catalog_connection)?;
        self.apply_with(root, Arc::new(client), report_path, strict).await
    }

    pub async fn apply_with(
        &self,
        root: &Path,
        catalog: Arc<dyn CatalogService>,
        report_path: Option<PathBuf>,
        strict: bool,
    ) -> Result<()> {
        info!("🔗 Reconciling {} against {}", root.display(), catalog.name());
        let tree = self.scan_tree(root)?;
        let mut report = self.start_report(Mode::Online, &tree);

        let pipelines: Vec<PipelineModel> = tree.models.into_iter().filter(|m| !m.tasks.is_empty()).collect();
        if pipelines.is_empty() {
            info!("No lineage declarations found, nothing to reconcile");
            return self.finish(&report, report_path.as_deref(), strict);
        }

        let reconciler = Arc::new(Reconciler::new(catalog, self.config.catalog_connection.timeout()));

        let service = reconciler.ensure_service(&self.config.pipeline_service_name).await;
        let service_failed = service.is_failed();
        report.add_outcome(service);

        if service_failed {
            // Nothing can attach to a missing service
            let reason = format!("service {} unavailable", self.config.pipeline_service_name);
            for model in &pipelines {
                report.add_outcome(EntityOutcome::failed(EntityKind::Pipeline, &model.fqn, reason.clone()));
            }
            return self.finish(&report, report_path.as_deref(), strict);
        }

        for outcome in self.reconcile_all(reconciler, &pipelines).await {
            report.add_outcome(outcome);
        }

        self.finish(&report, report_path.as_deref(), strict)
    }

    /// Reconcile pipelines concurrently, keeping outcomes in model order
    async fn reconcile_all(&self, reconciler: Arc<Reconciler>, pipelines: &[PipelineModel]) -> Vec<EntityOutcome> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.catalog_connection.max_concurrency));
        let mut set = tokio::task::JoinSet::new();

        for (idx, model) in pipelines.iter().enumerate() {
            let reconciler = reconciler.clone();
            let sem = semaphore.clone();
            let model = model.clone();
            set.spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return (idx, Vec::new());
                };
                (idx, reconciler.reconcile_pipeline(&model).await)
            });
        }

        let mut slots: Vec<Option<Vec<EntityOutcome>>> = vec![None; pipelines.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcomes)) => slots[idx] = Some(outcomes),
                Err(e) => warn!("Reconciliation task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(pipelines)
            .flat_map(|(slot, model)| {
                slot.unwrap_or_else(|| {
                    vec![EntityOutcome::failed(
                        EntityKind::Pipeline,
                        &model.fqn,
                        "reconciliation task aborted",
                    )]
                })
            })
            .collect()
    }

    fn scan_tree(&self, root: &Path) -> Result<ScannedTree> {
        let mut scanner = SourceScanner::new(&self.config.scan)?;
        let result = scanner.scan(root)?;

        let builder = LineageModelBuilder::new(&self.config);
        let models: Vec<PipelineModel> = result.units.iter().map(|unit| builder.build(unit)).collect();

        info!(
            "Found {} source files ({} failed), {} tasks",
            models.len() + result.failures.len(),
            result.failures.len(),
            models.iter().map(|m| m.tasks.len()).sum::<usize>()
        );

        Ok(ScannedTree {
            models,
            failures: result.failures,
        })
    }

    fn start_report(&self, mode: Mode, tree: &ScannedTree) -> RunReport {
        let mut report = RunReport::new(mode);
        report.files.extend(tree.models.iter().map(FileReport::from_model));
        report.files.extend(tree.failures.iter().map(FileReport::from_failure));
        report
    }

    fn finish(&self, report: &RunReport, report_path: Option<&Path>, strict: bool) -> Result<()> {
        report.log_summary();
        if let Some(path) = report_path {
            write_json_artifact(report, Some(path))?;
        }

        if strict && report.has_failures() {
            anyhow::bail!("{} run finished with failures", report.mode);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplicationMapping;
    use crate::core::catalog::memory::InMemoryCatalog;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use predicates::prelude::*;
    use std::collections::BTreeMap;

    const SOURCE: &str = r#"
def load():
    """Load the raw records.

    OpenMetadata
    ------------
    - upstream: myapp:fieldA
    """

def untouched():
    """Nothing to see."""
"#;

    fn config() -> Config {
        let mut config = Config::default();
        let mut columns = BTreeMap::new();
        columns.insert("fieldA".to_string(), "svc.db.sch.myapp.field_a".to_string());
        config.applications.insert(
            "myapp".to_string(),
            ApplicationMapping {
                asset_type: "table".to_string(),
                fqn: "svc.db.sch.myapp".to_string(),
                columns,
            },
        );
        config
    }

    fn project() -> TempDir {
        let temp = TempDir::new().unwrap();
        temp.child("src/jobs/load.py").write_str(SOURCE).unwrap();
        temp.child("src/broken.py").write_str("def broken(:\n    pass\n").unwrap();
        temp
    }

    #[tokio::test]
    async fn test_plan_writes_ordered_intents() {
        let temp = project();
        let output = temp.child("out/requests.json");
        let engine = Engine::with_config(config());

        engine
            .plan(temp.path(), Some(output.path().to_path_buf()), None)
            .await
            .unwrap();

        output.assert(predicate::path::exists());
        output.assert(predicate::str::contains("ensure-service"));
        let intents: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.path()).unwrap()).unwrap();
        let operations: Vec<&str> = intents
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["operation"].as_str().unwrap())
            .collect();
        assert_eq!(operations, vec!["ensure-service", "ensure-pipeline", "ensure-edge"]);
    }

    #[tokio::test]
    async fn test_scan_writes_dry_run_and_report() {
        let temp = project();
        let output = temp.child("dry-run.json");
        let report = temp.child("report.json");
        let engine = Engine::with_config(config());

        engine
            .scan(
                temp.path(),
                Some(output.path().to_path_buf()),
                Some(report.path().to_path_buf()),
            )
            .await
            .unwrap();

        output.assert(predicate::str::contains("src_jobs_load.py"));
        report.assert(predicate::str::contains("\"mode\": \"dry-run\""));
        report.assert(predicate::str::contains("syntax error"));
    }

    #[tokio::test]
    async fn test_apply_with_in_memory_catalog_is_idempotent() {
        let temp = project();
        let catalog = Arc::new(InMemoryCatalog::new());
        let engine = Engine::with_config(config());

        engine.apply_with(temp.path(), catalog.clone(), None, false).await.unwrap();
        // service, pipeline with its task, one edge
        assert_eq!(catalog.creations(), 3);
        let snapshot = catalog.snapshot();

        engine.apply_with(temp.path(), catalog.clone(), None, false).await.unwrap();
        assert_eq!(catalog.creations(), 3);
        assert_eq!(catalog.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_strict_apply_fails_on_broken_file() {
        let temp = project();
        let catalog = Arc::new(InMemoryCatalog::new());
        let engine = Engine::with_config(config());

        let result = engine.apply_with(temp.path(), catalog, None, true).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_service_fails_every_pipeline() {
        let temp = project();
        let catalog = Arc::new(InMemoryCatalog::new().failing_on("code-service"));
        let report = temp.child("report.json");
        let engine = Engine::with_config(config());

        engine
            .apply_with(temp.path(), catalog.clone(), Some(report.path().to_path_buf()), false)
            .await
            .unwrap();

        assert_eq!(catalog.creations(), 0);
        report.assert(predicate::str::contains("service code-service unavailable"));
    }
}
