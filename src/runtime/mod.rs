//! Narrow interface over the container engine.
//!
//! The orchestrator and the image resolver only ever talk to the engine
//! through [`ContainerRuntime`]. The production implementation lives in
//! [`docker`]; tests use the in-memory runtime from `mock`.

pub mod credentials;
pub mod docker;
#[cfg(test)]
pub mod mock;

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use serde::Serialize;

use crate::ports::{PortBinding, PortSpec};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// What the resolver and planner need to know about a local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub name: String,
    pub id: Option<String>,
    /// Declared ports, sorted and deduplicated.
    pub exposed_ports: Vec<PortSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainer {
    pub image: String,
    pub name: Option<String>,
    pub bindings: Vec<PortBinding>,
}

/// Summary of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Image")]
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub summary: ContainerSummary,
    pub running: bool,
    /// Host ports the container is published on.
    pub host_ports: Vec<(PortSpec, u16)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Looks up a local image. `RuntimeError::NotFound` when absent.
    async fn find_image(&self, name: &str) -> Result<ImageMetadata, RuntimeError>;

    /// Builds `tag` from a remote build context. Output is streamed and only
    /// inspected for the final success or failure.
    async fn build_image(&self, context: &str, tag: &str) -> Result<(), RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Returns the runtime-assigned container id.
    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stopping an already stopped container succeeds.
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// `RuntimeError::NotFound` if there is no such container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;
}

/// Runs a runtime call under a deadline. Running out of time is reported as
/// the runtime being unavailable.
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("{operation} did not complete within {limit:?}");
            Err(RuntimeError::Unavailable(format!(
                "{operation} timed out after {limit:?}"
            )))
        }
    }
}
