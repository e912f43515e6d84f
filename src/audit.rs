//! Container lifecycle audit trail.
//!
//! One event per container: written when the container has started, closed
//! with a destruction timestamp when it is removed. Writes are keyed by
//! container id; concurrent updates of the same event are last-write-wins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub container_id: String,
    /// Repository locator or registry reference the container was made from.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("No audit event for container {0}")]
    UnknownContainer(String),
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_creation(
        &self,
        container_id: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError>;

    async fn record_destruction(
        &self,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError>;

    /// Newest events first.
    async fn query_recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditLogError>;
}

fn append(events: &mut Vec<AuditEvent>, container_id: &str, source: &str, at: DateTime<Utc>) {
    events.push(AuditEvent {
        event_id: Uuid::now_v7(),
        container_id: container_id.to_string(),
        source: source.to_string(),
        created_at: at,
        destroyed_at: None,
    });
}

fn close(
    events: &mut [AuditEvent],
    container_id: &str,
    at: DateTime<Utc>,
) -> Result<(), AuditLogError> {
    let event = events
        .iter_mut()
        .rev()
        .find(|e| e.container_id == container_id)
        .ok_or_else(|| AuditLogError::UnknownContainer(container_id.to_string()))?;
    event.destroyed_at = Some(at);
    Ok(())
}

fn recent(events: &[AuditEvent], limit: usize) -> Vec<AuditEvent> {
    let mut events = events.to_vec();
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.event_id.cmp(&a.event_id))
    });
    events.truncate(limit);
    events
}

/// Audit log that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record_creation(
        &self,
        container_id: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError> {
        append(&mut *self.events.lock().await, container_id, source, at);
        Ok(())
    }

    async fn record_destruction(
        &self,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError> {
        close(&mut self.events.lock().await, container_id, at)
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditLogError> {
        Ok(recent(&self.events.lock().await, limit))
    }
}

/// Audit log persisted as a JSON array. Every change rewrites the file
/// through a temporary sibling and a rename.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    events: Mutex<Vec<AuditEvent>>,
}

impl FileAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref().to_path_buf();
        let events = match tokio::fs::read(&path).await {
            Ok(raw) if raw.is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(AuditLogError::Io { path, source }),
        };
        log::info!("Audit log at {path:?} holds {} events", events.len());
        Ok(Self {
            path,
            events: Mutex::new(events),
        })
    }

    async fn persist(&self, events: &[AuditEvent]) -> Result<(), AuditLogError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let raw = serde_json::to_vec_pretty(events)?;
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|source| AuditLogError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| AuditLogError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    async fn record_creation(
        &self,
        container_id: &str,
        source: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError> {
        let mut events = self.events.lock().await;
        append(&mut events, container_id, source, at);
        self.persist(&events).await
    }

    async fn record_destruction(
        &self,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuditLogError> {
        let mut events = self.events.lock().await;
        close(&mut events, container_id, at)?;
        self.persist(&events).await
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditLogError> {
        Ok(recent(&self.events.lock().await, limit))
    }
}
