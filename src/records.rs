//! Containers created by this service and where they are in their lifecycle.
//!
//! A record only exists once the runtime has accepted a `create`, and it is
//! dropped once the runtime has removed the container. One left in `Created`
//! means the container could not be started and could not be cleaned up
//! either.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::ports::PortBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub bindings: Vec<PortBinding>,
    pub state: LifecycleState,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContainerRecords: Send + Sync {
    async fn insert(&self, record: ContainerRecord);
    /// Returns false when there is no record for `id`.
    async fn set_state(&self, id: &str, state: LifecycleState) -> bool;
    async fn get(&self, id: &str) -> Option<ContainerRecord>;
    /// Forgets a container the runtime no longer has.
    async fn remove(&self, id: &str) -> Option<ContainerRecord>;
    async fn list(&self) -> Vec<ContainerRecord>;
}

#[derive(Debug, Default)]
pub struct InMemoryRecords {
    inner: RwLock<HashMap<String, ContainerRecord>>,
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRecords for InMemoryRecords {
    async fn insert(&self, record: ContainerRecord) {
        self.inner.write().await.insert(record.id.clone(), record);
    }

    async fn set_state(&self, id: &str, state: LifecycleState) -> bool {
        match self.inner.write().await.get_mut(id) {
            Some(record) => {
                record.state = state;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    async fn get(&self, id: &str) -> Option<ContainerRecord> {
        self.inner.read().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Option<ContainerRecord> {
        self.inner.write().await.remove(id)
    }

    async fn list(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self.inner.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        records
    }
}
