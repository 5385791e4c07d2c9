//! Data-access adapters.
//!
//! One adapter per access method, all behind the same trait with a uniform
//! `list` / `retrieve` / `listAndCount` contract, so the executor dispatches
//! on the step's classification and never branches on entity name.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{AccessMethod, ErrorCode};

/// Concrete filter predicates after back-reference resolution.
pub type FilterMap = serde_json::Map<String, serde_json::Value>;

/// Execution-configuration concern, passed beside the filters and never
/// inside them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pagination {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Raw payload as the backend returned it, plus the count when the
/// operation asked for one. Row extraction happens in the executor, driven
/// by the step's response expectation.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub payload: serde_json::Value,
    pub count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl AdapterError {
    /// Map onto the engine-wide error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            AdapterError::NotFound(_) => ErrorCode::EntityNotFound,
            AdapterError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            AdapterError::Timeout(_) => ErrorCode::Timeout,
            AdapterError::Upstream(_) => ErrorCode::ApiError,
        }
    }
}

/// Uniform data-access contract, one implementation per access method,
/// injected by the embedder.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    async fn list(
        &self,
        entity: &str,
        filters: &FilterMap,
        relations: &[String],
        pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError>;

    async fn retrieve(
        &self,
        entity: &str,
        filters: &FilterMap,
        relations: &[String],
        pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError>;

    async fn list_and_count(
        &self,
        entity: &str,
        filters: &FilterMap,
        relations: &[String],
        pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError>;
}

/// The closed set of adapters, one per access method.
#[derive(Clone)]
pub struct AdapterSet {
    http: Arc<dyn DataAdapter>,
    service: Arc<dyn DataAdapter>,
    graph: Arc<dyn DataAdapter>,
}

impl AdapterSet {
    pub fn new(
        http: Arc<dyn DataAdapter>,
        service: Arc<dyn DataAdapter>,
        graph: Arc<dyn DataAdapter>,
    ) -> Self {
        Self {
            http,
            service,
            graph,
        }
    }

    /// Same adapter for every access method; convenient for tests and
    /// single-backend deployments.
    pub fn uniform(adapter: Arc<dyn DataAdapter>) -> Self {
        Self {
            http: adapter.clone(),
            service: adapter.clone(),
            graph: adapter,
        }
    }

    pub fn for_method(&self, method: AccessMethod) -> &Arc<dyn DataAdapter> {
        match method {
            AccessMethod::HttpApi => &self.http,
            AccessMethod::InProcessService => &self.service,
            AccessMethod::GraphTraversal => &self.graph,
        }
    }
}
