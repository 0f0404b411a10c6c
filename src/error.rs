use std::time::Duration;

use thiserror::Error;

/// Main error type for doclineage operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parser error: {0}")]
    Parser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Failures reported by a catalog service call.
///
/// These never abort a run; the reconciler turns them into per-entity
/// failed outcomes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("catalog returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("entity not found in catalog: {0}")]
    MissingEntity(String),
}

pub type Result<T> = std::result::Result<T, LinkerError>;
