//! Collaborators the streaming core consumes from the cluster side. The
//! exec primitive lives next to its request types in [`crate::exec`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::logs::{LogFeed, LogOptions};
use crate::resources::ResourceKind;
use crate::watch::Subscription;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    #[error("cluster command failed: {0}")]
    Command(String),
}

impl ClusterError {
    /// Maps an API-server error message onto the taxonomy.
    pub fn classify(message: &str) -> Self {
        let message = message.trim();
        let lower = message.to_ascii_lowercase();
        if message.contains("(NotFound)") || lower.contains("not found") {
            ClusterError::NotFound(message.to_string())
        } else if message.contains("(AlreadyExists)") || lower.contains("already exists") {
            ClusterError::AlreadyExists(message.to_string())
        } else if message.contains("(Conflict)") {
            ClusterError::Conflict(message.to_string())
        } else if lower.contains("connection refused")
            || lower.contains("unable to connect")
            || lower.contains("no such host")
            || lower.contains("i/o timeout")
        {
            ClusterError::Unavailable(message.to_string())
        } else {
            ClusterError::Command(message.to_string())
        }
    }
}

/// CRUD over raw objects. `namespace` is ignored for cluster-scoped kinds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<Value, ClusterError>;

    /// `namespace: None` lists across all namespaces. `selector` uses label
    /// selector syntax.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError>;

    /// Fails with `AlreadyExists` when the name is taken.
    async fn create(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError>;

    /// Fails with `NotFound` for a missing object and `Conflict` when
    /// `metadata.resourceVersion` is stale.
    async fn update(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError>;

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<(), ClusterError>;
}

/// Name from `metadata.name`, required by create and update.
pub fn object_name(object: &Value) -> Result<&str, ClusterError> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ClusterError::Command("object has no metadata.name".into()))
}

#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn subscribe(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Subscription, ClusterError>;
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn stream_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> Result<LogFeed, ClusterError>;
}
