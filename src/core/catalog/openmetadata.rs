use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    CatalogResult, CatalogService, EdgeSpec, EnsureOutcome, EntityRef, ExistingEdge, ExistingPipeline, PipelineSpec,
    ServiceSpec, TaskSpec,
};
use crate::config::CatalogConnection;
use crate::error::{CatalogError, LinkerError, Result};

/// OpenMetadata REST client
pub struct OpenMetadataClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    timeout: Duration,
}

impl OpenMetadataClient {
    pub fn new(connection: &CatalogConnection) -> Result<Self> {
        let host_port = connection
            .host_port
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| LinkerError::Config("catalogConnection.hostPort is required for online mode".to_string()))?;
        let token = connection
            .jwt_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| LinkerError::Config("catalogConnection.jwtToken is required for online mode".to_string()))?;

        let base = host_port.trim_end_matches('/');
        let base = if base.ends_with("/api") {
            base.to_string()
        } else {
            format!("{}/api", base)
        };
        let base_url = Url::parse(&base)
            .map_err(|e| LinkerError::Config(format!("invalid catalogConnection.hostPort '{}': {}", host_port, e)))?;

        let client = reqwest::Client::builder()
            .timeout(connection.timeout())
            .build()
            .map_err(|e| LinkerError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
            timeout: connection.timeout(),
        })
    }

    /// `<base>/v1/<segments...>` with each segment percent-encoded
    fn url(&self, segments: &[&str]) -> CatalogResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::Transport(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    fn transport_error(&self, operation: &str, error: reqwest::Error) -> CatalogError {
        if error.is_timeout() {
            CatalogError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }
        } else {
            CatalogError::Transport(format!("{}: {}", operation, error))
        }
    }

    /// GET returning `None` on 404
    async fn get_json(&self, operation: &str, url: Url) -> CatalogResult<Option<Value>> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Status { status, body });
        }

        let value = response
            .json::<Value>()
            .await
            .map_err(|e| CatalogError::UnexpectedResponse(format!("{}: {}", operation, e)))?;
        Ok(Some(value))
    }

    async fn send_json(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        content_type: &str,
        body: &Value,
    ) -> CatalogResult<StatusCode> {
        debug!("{} {}", method, url);
        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Content-Type", content_type)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(status)
    }

    async fn entity_id(&self, entity_type: &str, fqn: &str) -> CatalogResult<Option<String>> {
        let mut segments: Vec<&str> = collection_for(entity_type);
        segments.push("name");
        segments.push(fqn);
        let url = self.url(&segments)?;

        match self.get_json("lookup entity", url).await? {
            Some(entity) => Ok(Some(id_of(&entity)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CatalogService for OpenMetadataClient {
    async fn find_service(&self, name: &str) -> CatalogResult<Option<String>> {
        let url = self.url(&["services", "pipelineServices", "name", name])?;
        match self.get_json("find pipeline service", url).await? {
            Some(service) => Ok(Some(id_of(&service)?)),
            None => Ok(None),
        }
    }

    async fn ensure_service(&self, spec: &ServiceSpec) -> CatalogResult<EnsureOutcome> {
        let url = self.url(&["services", "pipelineServices"])?;
        let body = json!({
            "name": spec.name,
            "serviceType": spec.service_type,
            "connection": { "config": { "type": spec.service_type } }
        });

        let status = self
            .send_json("ensure pipeline service", Method::PUT, url, "application/json", &body)
            .await?;
        Ok(outcome_for(status))
    }

    async fn find_pipeline(&self, fqn: &str) -> CatalogResult<Option<ExistingPipeline>> {
        let mut url = self.url(&["pipelines", "name", fqn])?;
        url.query_pairs_mut().append_pair("fields", "tasks");

        let pipeline = match self.get_json("find pipeline", url).await? {
            Some(pipeline) => pipeline,
            None => return Ok(None),
        };

        let tasks = pipeline["tasks"]
            .as_array()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|task| task["name"].as_str().map(|name| name.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(ExistingPipeline {
            id: id_of(&pipeline)?,
            tasks,
        }))
    }

    async fn ensure_pipeline(&self, spec: &PipelineSpec) -> CatalogResult<EnsureOutcome> {
        let url = self.url(&["pipelines"])?;
        let body = json!({
            "name": spec.name,
            "service": spec.service,
            "description": format!("Source file {} (sha256 {})", spec.source_path.display(), spec.source_hash),
            "tasks": spec.tasks.iter().map(task_payload).collect::<Vec<_>>(),
        });

        let status = self
            .send_json("ensure pipeline", Method::PUT, url, "application/json", &body)
            .await?;
        Ok(outcome_for(status))
    }

    async fn ensure_task(&self, pipeline_id: &str, spec: &TaskSpec) -> CatalogResult<EnsureOutcome> {
        let url = self.url(&["pipelines", pipeline_id])?;
        let patch = json!([{ "op": "add", "path": "/tasks/-", "value": task_payload(spec) }]);

        self.send_json("ensure task", Method::PATCH, url, "application/json-patch+json", &patch)
            .await?;
        Ok(EnsureOutcome::Created)
    }

    async fn find_edge(&self, from: &EntityRef, to: &EntityRef) -> CatalogResult<Option<ExistingEdge>> {
        let (from_id, to_id) = match (
            self.entity_id(&from.entity_type, &from.fqn).await?,
            self.entity_id(&to.entity_type, &to.fqn).await?,
        ) {
            (Some(from_id), Some(to_id)) => (from_id, to_id),
            // An edge cannot exist while one of its entities is missing
            _ => return Ok(None),
        };

        let url = self.url(&["lineage", "getLineageEdge", &from_id, &to_id])?;
        let edge = match self.get_json("find lineage edge", url).await? {
            Some(edge) => edge,
            None => return Ok(None),
        };

        let details = edge.get("edge").unwrap_or(&edge).get("lineageDetails");
        Ok(Some(details.map(existing_edge).unwrap_or_default()))
    }

    async fn ensure_edge(&self, spec: &EdgeSpec) -> CatalogResult<EnsureOutcome> {
        let from_id = self
            .entity_id(&spec.from.entity_type, &spec.from.fqn)
            .await?
            .ok_or_else(|| CatalogError::MissingEntity(spec.from.fqn.clone()))?;
        let to_id = self
            .entity_id(&spec.to.entity_type, &spec.to.fqn)
            .await?
            .ok_or_else(|| CatalogError::MissingEntity(spec.to.fqn.clone()))?;

        let mut details = json!({ "description": spec.description, "source": "Manual" });
        let columns = columns_lineage(spec);
        if !columns.is_empty() {
            details["columnsLineage"] = Value::Array(columns);
        }

        let body = json!({
            "edge": {
                "fromEntity": { "id": from_id, "type": spec.from.entity_type },
                "toEntity": { "id": to_id, "type": spec.to.entity_type },
                "lineageDetails": details,
            }
        });

        let url = self.url(&["lineage"])?;
        self.send_json("ensure lineage edge", Method::PUT, url, "application/json", &body)
            .await?;
        Ok(EnsureOutcome::Created)
    }

    fn name(&self) -> &str {
        "OpenMetadata"
    }
}

/// REST collection path for an entity type
fn collection_for(entity_type: &str) -> Vec<&'static str> {
    match entity_type {
        "table" => vec!["tables"],
        "topic" => vec!["topics"],
        "dashboard" => vec!["dashboards"],
        "pipeline" => vec!["pipelines"],
        "container" => vec!["containers"],
        "mlmodel" => vec!["mlmodels"],
        "chart" => vec!["charts"],
        "searchIndex" => vec!["searchIndexes"],
        "storedProcedure" => vec!["storedProcedures"],
        "dashboardDataModel" => vec!["dashboard", "datamodels"],
        _ => vec!["tables"],
    }
}

fn id_of(entity: &Value) -> CatalogResult<String> {
    entity["id"]
        .as_str()
        .map(|id| id.to_string())
        .ok_or_else(|| CatalogError::UnexpectedResponse("entity without id".to_string()))
}

/// PUT answers 201 when it created the entity and 200 when it updated one
fn outcome_for(status: StatusCode) -> EnsureOutcome {
    if status == StatusCode::CREATED {
        EnsureOutcome::Created
    } else {
        EnsureOutcome::AlreadyExisted
    }
}

fn task_payload(task: &TaskSpec) -> Value {
    json!({
        "name": task.name,
        "displayName": task.name,
        "description": task.description.clone().unwrap_or_default(),
        "sourceUrl": format!("#L{}", task.source_line),
    })
}

/// One entry per column: `from` columns feed the edge's target, `to` columns
/// are fed by its source
fn columns_lineage(spec: &EdgeSpec) -> Vec<Value> {
    let upstream = spec
        .from_columns
        .iter()
        .map(|column| json!({ "fromColumns": [column] }));
    let downstream = spec
        .to_columns
        .iter()
        .map(|column| json!({ "fromColumns": [], "toColumn": column }));
    upstream.chain(downstream).collect()
}

fn existing_edge(details: &Value) -> ExistingEdge {
    let mut edge = ExistingEdge::default();
    for entry in details["columnsLineage"].as_array().into_iter().flatten() {
        for column in entry["fromColumns"].as_array().into_iter().flatten() {
            if let Some(column) = column.as_str() {
                edge.from_columns.insert(column.to_string());
            }
        }
        if let Some(column) = entry["toColumn"].as_str() {
            edge.to_columns.insert(column.to_string());
        }
    }
    edge
}
