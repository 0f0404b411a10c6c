//! In-memory lineage model: one pipeline per source file, one task per
//! documented function that declares lineage, one edge per resolved reference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::references::{Direction, ParseWarning, ParsedReferences, Reference, ReferenceParser};
use super::scanner::SourceUnit;
use crate::config::{ApplicationMapping, Config};

/// One side of a lineage edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Endpoint {
    /// A pipeline task; the catalog anchors it on its pipeline
    #[serde(rename_all = "camelCase")]
    Task { pipeline_fqn: String, task_fqn: String },

    /// A whole data asset
    #[serde(rename_all = "camelCase")]
    Asset { entity_type: String, fqn: String },

    /// A column of a data asset
    #[serde(rename_all = "camelCase")]
    Column {
        entity_type: String,
        asset_fqn: String,
        column_fqn: String,
    },
}

impl Endpoint {
    /// The identity this endpoint contributes to an edge identity
    pub fn fqn(&self) -> &str {
        match self {
            Endpoint::Task { task_fqn, .. } => task_fqn,
            Endpoint::Asset { fqn, .. } => fqn,
            Endpoint::Column { column_fqn, .. } => column_fqn,
        }
    }

    pub fn is_column(&self) -> bool {
        matches!(self, Endpoint::Column { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fqn())
    }
}

/// A resolved, directed link between a task and a data asset or column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub direction: Direction,
    pub from: Endpoint,
    pub to: Endpoint,
    pub reference: Reference,
}

impl LineageEdge {
    pub fn identity(&self) -> String {
        format!("{} -> {}", self.from.fqn(), self.to.fqn())
    }
}

/// Something recorded while building the model; never fatal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModelWarning {
    /// A malformed token inside a recognized declaration
    Parse(ParseWarning),

    /// The application is not in the catalog mapping; no edge was produced
    UnresolvedApplication { reference: Reference },

    /// The field is not mapped; the edge falls back to the asset
    UnresolvedField { reference: Reference, fallback: String },
}

impl fmt::Display for ModelWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelWarning::Parse(warning) => write!(f, "{}", warning),
            ModelWarning::UnresolvedApplication { reference } => {
                write!(f, "no mapping for application '{}' ({})", reference.application, reference)
            }
            ModelWarning::UnresolvedField { reference, fallback } => write!(
                f,
                "no column mapping for {}:{}, using asset {}",
                reference.application,
                reference.field.as_deref().unwrap_or_default(),
                fallback
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModel {
    /// Qualified function name, unique within the pipeline
    pub name: String,
    pub fqn: String,
    pub line: usize,
    /// First line of the docstring
    pub description: Option<String>,
    pub references: Vec<Reference>,
    pub edges: Vec<LineageEdge>,
    pub warnings: Vec<ModelWarning>,
}

/// A documented function whose declarations produced no usable reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkedFunction {
    pub name: String,
    pub line: usize,
    pub warnings: Vec<ModelWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineModel {
    pub name: String,
    pub fqn: String,
    pub service: String,
    pub source_path: PathBuf,
    pub content_hash: String,
    pub tasks: Vec<TaskModel>,
    /// Functions that only produced warnings, kept so nothing is dropped silently
    pub unlinked: Vec<UnlinkedFunction>,
}

impl PipelineModel {
    /// Every warning in the pipeline, with the function it belongs to
    pub fn warnings(&self) -> impl Iterator<Item = (&str, &ModelWarning)> {
        let task_warnings = self
            .tasks
            .iter()
            .flat_map(|task| task.warnings.iter().map(move |w| (task.name.as_str(), w)));
        let unlinked_warnings = self
            .unlinked
            .iter()
            .flat_map(|function| function.warnings.iter().map(move |w| (function.name.as_str(), w)));
        task_warnings.chain(unlinked_warnings)
    }

    pub fn edges(&self) -> impl Iterator<Item = &LineageEdge> {
        self.tasks.iter().flat_map(|task| task.edges.iter())
    }
}

/// Joins extracted docstrings with the catalog mapping
pub struct LineageModelBuilder {
    applications: BTreeMap<String, ApplicationMapping>,
    service_name: String,
    parser: ReferenceParser,
}

impl LineageModelBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            applications: config.applications.clone(),
            service_name: config.pipeline_service_name.clone(),
            parser: ReferenceParser::new(),
        }
    }

    /// Build the pipeline model for one source file
    pub fn build(&self, unit: &SourceUnit) -> PipelineModel {
        let pipeline_fqn = format!(
            "{}.{}",
            quote_fqn_part(&self.service_name),
            quote_fqn_part(&unit.pipeline_name)
        );

        // Same qualified name twice (conditional redefinitions) -> one task
        let mut declarations: Vec<(String, usize, Option<String>, ParsedReferences)> = Vec::new();
        for function in &unit.functions {
            let parsed = self.parser.parse(&function.docstring);
            match declarations.iter_mut().find(|(name, ..)| *name == function.qualified_name) {
                Some((_, _, _, existing)) => {
                    for reference in parsed.references {
                        if !existing.references.contains(&reference) {
                            existing.references.push(reference);
                        }
                    }
                    existing.warnings.extend(parsed.warnings);
                }
                None => declarations.push((
                    function.qualified_name.clone(),
                    function.line,
                    summary_line(&function.docstring),
                    parsed,
                )),
            }
        }

        let mut tasks = Vec::new();
        let mut unlinked = Vec::new();

        for (name, line, description, parsed) in declarations {
            let mut warnings: Vec<ModelWarning> = parsed.warnings.into_iter().map(ModelWarning::Parse).collect();
            for warning in &warnings {
                warn!("{} in {}: {}", name, unit.relative_path.display(), warning);
            }

            if parsed.references.is_empty() {
                if !warnings.is_empty() {
                    unlinked.push(UnlinkedFunction { name, line, warnings });
                }
                continue;
            }

            let task_fqn = format!("{}.{}", pipeline_fqn, quote_fqn_part(&name));
            let task_endpoint = Endpoint::Task {
                pipeline_fqn: pipeline_fqn.clone(),
                task_fqn: task_fqn.clone(),
            };

            let mut edges: Vec<LineageEdge> = Vec::new();
            for reference in &parsed.references {
                let (edge, warning) = self.resolve(reference, &task_endpoint);
                if let Some(warning) = warning {
                    warn!("{} in {}: {}", name, unit.relative_path.display(), warning);
                    warnings.push(warning);
                }
                if let Some(edge) = edge {
                    if !edges.iter().any(|e| e.from == edge.from && e.to == edge.to) {
                        edges.push(edge);
                    }
                }
            }

            debug!("Task {} has {} edges", task_fqn, edges.len());

            tasks.push(TaskModel {
                name,
                fqn: task_fqn,
                line,
                description,
                references: parsed.references,
                edges,
                warnings,
            });
        }

        PipelineModel {
            name: unit.pipeline_name.clone(),
            fqn: pipeline_fqn,
            service: self.service_name.clone(),
            source_path: unit.relative_path.clone(),
            content_hash: unit.content_hash.clone(),
            tasks,
            unlinked,
        }
    }

    /// Resolve one reference against the mapping.
    ///
    /// Pure: the same reference and mapping always give the same answer.
    pub fn resolve(&self, reference: &Reference, task: &Endpoint) -> (Option<LineageEdge>, Option<ModelWarning>) {
        let app = match self.applications.get(&reference.application) {
            Some(app) => app,
            None => {
                return (
                    None,
                    Some(ModelWarning::UnresolvedApplication {
                        reference: reference.clone(),
                    }),
                )
            }
        };

        let asset = Endpoint::Asset {
            entity_type: app.asset_type.clone(),
            fqn: app.fqn.clone(),
        };

        let (data_endpoint, warning) = match &reference.field {
            None => (asset, None),
            Some(field) => match app.columns.get(field) {
                Some(column_fqn) => (
                    Endpoint::Column {
                        entity_type: app.asset_type.clone(),
                        asset_fqn: app.fqn.clone(),
                        column_fqn: column_fqn.clone(),
                    },
                    None,
                ),
                None => (
                    asset,
                    Some(ModelWarning::UnresolvedField {
                        reference: reference.clone(),
                        fallback: app.fqn.clone(),
                    }),
                ),
            },
        };

        let (from, to) = match reference.direction {
            Direction::Upstream => (data_endpoint, task.clone()),
            Direction::Downstream => (task.clone(), data_endpoint),
        };

        (
            Some(LineageEdge {
                direction: reference.direction,
                from,
                to,
                reference: reference.clone(),
            }),
            warning,
        )
    }
}

/// A name containing a dot is double-quoted inside an FQN
pub fn quote_fqn_part(part: &str) -> String {
    if part.contains('.') {
        format!("\"{}\"", part)
    } else {
        part.to_string()
    }
}

fn summary_line(docstring: &str) -> Option<String> {
    docstring
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}
