use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{LinkerError, Result};

/// Catalog identity of one logical application named in docstrings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMapping {
    /// Catalog entity type of the asset (table, topic, dashboard, ...)
    #[serde(rename = "type", default = "default_asset_type")]
    pub asset_type: String,

    /// Fully-qualified catalog name of the asset
    pub fqn: String,

    /// Field name -> fully-qualified column name
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogConnection {
    /// Catalog API base, e.g. `http://localhost:8585/api`
    pub host_port: Option<String>,

    /// Bearer token sent with every request
    pub jwt_token: Option<String>,

    /// Timeout applied to every catalog call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on pipelines reconciled concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Extra gitignore-style patterns to exclude
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Maximum file size to parse (in bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,

    /// Skip `__init__.py`, `__main__.py` and friends
    #[serde(default = "default_true")]
    pub skip_dunder_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Application name -> catalog mapping
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationMapping>,

    /// Pipeline service every generated pipeline belongs to
    #[serde(default = "default_service_name")]
    pub pipeline_service_name: String,

    /// Where offline mode writes its intent artifact
    #[serde(default = "default_requests_path")]
    pub requests_path: String,

    #[serde(default)]
    pub catalog_connection: CatalogConnection,

    #[serde(default)]
    pub scan: ScanConfig,
}

fn default_asset_type() -> String {
    "table".to_string()
}

fn default_service_name() -> String {
    "code-service".to_string()
}

fn default_requests_path() -> String {
    "openmetadata_requests.json".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_file_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_true() -> bool {
    true
}

impl Default for CatalogConnection {
    fn default() -> Self {
        Self {
            host_port: None,
            jwt_token: None,
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl CatalogConnection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![
                ".git/".to_string(),
                ".venv/".to_string(),
                "venv/".to_string(),
                "__pycache__/".to_string(),
            ],
            max_file_size: default_max_file_size(),
            skip_dunder_files: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            applications: BTreeMap::new(),
            pipeline_service_name: default_service_name(),
            requests_path: default_requests_path(),
            catalog_connection: CatalogConnection::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file; the extension picks the format
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content).map_err(|e| LinkerError::Config(e.to_string()))?,
        };
        Ok(config)
    }

    /// Save configuration to file as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LinkerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Err(LinkerError::Config(format!(
                        "config file {} does not exist",
                        p.as_ref().display()
                    )))
                }
            }
            None => {
                // Try common config file locations
                let candidates = [
                    "doclineage.toml",
                    ".doclineage.toml",
                    "doclineage.yaml",
                    "doclineage.yml",
                ];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default())
            }
        }
    }

    /// Structural checks that must hold before anything is resolved against the mapping
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_service_name.trim().is_empty() {
            return Err(LinkerError::Config("pipelineServiceName must not be empty".to_string()));
        }

        for (name, app) in &self.applications {
            if name.trim().is_empty() {
                return Err(LinkerError::Config("application names must not be empty".to_string()));
            }
            if app.fqn.trim().is_empty() {
                return Err(LinkerError::Config(format!("application '{}' has an empty fqn", name)));
            }
            if let Some((field, _)) = app.columns.iter().find(|(_, fqn)| fqn.trim().is_empty()) {
                return Err(LinkerError::Config(format!(
                    "application '{}' maps field '{}' to an empty column fqn",
                    name, field
                )));
            }
        }

        if self.catalog_connection.max_concurrency == 0 {
            return Err(LinkerError::Config("catalogConnection.maxConcurrency must be at least 1".to_string()));
        }

        Ok(())
    }
}
