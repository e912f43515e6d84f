//! In-memory runtime that records every call, for orchestrator tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CreateContainer, ImageMetadata,
    RuntimeError,
};
use crate::ports::{PortBinding, PortSpec};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: Option<String>,
    pub image: String,
    pub bindings: Vec<PortBinding>,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    /// Images present locally.
    images: Mutex<HashMap<String, ImageMetadata>>,
    /// Ports a build of a given tag produces.
    buildable: Mutex<HashMap<String, Vec<PortSpec>>>,
    /// Images the registry can serve.
    registry: Mutex<HashMap<String, Vec<PortSpec>>>,
    containers: Mutex<HashMap<String, MockContainer>>,

    pub build_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,

    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    /// Builds report success without producing an image.
    pub build_produces_nothing: AtomicBool,
    pub unavailable: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_image(self, name: &str, ports: &[PortSpec]) -> Self {
        self.images
            .lock()
            .unwrap()
            .insert(name.to_string(), metadata(name, ports));
        self
    }

    pub fn with_buildable(self, tag: &str, ports: &[PortSpec]) -> Self {
        self.buildable
            .lock()
            .unwrap()
            .insert(tag.to_string(), ports.to_vec());
        self
    }

    pub fn with_registry_image(self, reference: &str, ports: &[PortSpec]) -> Self {
        self.registry
            .lock()
            .unwrap()
            .insert(reference.to_string(), ports.to_vec());
        self
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable(
                "mock daemon is down".to_string(),
            ));
        }
        Ok(())
    }
}

fn metadata(name: &str, ports: &[PortSpec]) -> ImageMetadata {
    let mut exposed_ports = ports.to_vec();
    exposed_ports.sort();
    exposed_ports.dedup();
    ImageMetadata {
        name: name.to_string(),
        id: Some(format!("sha256:{}", Uuid::now_v7().simple())),
        exposed_ports,
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn find_image(&self, name: &str) -> Result<ImageMetadata, RuntimeError> {
        self.check_available()?;
        self.images
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("image {name}")))
    }

    async fn build_image(&self, context: &str, tag: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        let ports = self
            .buildable
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| RuntimeError::Failed(format!("unable to prepare context {context}")))?;
        if !self.build_produces_nothing.load(Ordering::SeqCst) {
            self.images
                .lock()
                .unwrap()
                .insert(tag.to_string(), metadata(tag, &ports));
        }
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let ports = self
            .registry
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| RuntimeError::Failed(format!("manifest for {reference} unknown")))?;
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), metadata(reference, &ports));
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError> {
        self.check_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("create refused".to_string()));
        }
        if !self.images.lock().unwrap().contains_key(&spec.image) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image)));
        }
        let id = Uuid::now_v7().simple().to_string();
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                bindings: spec.bindings.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("port is already allocated".to_string()));
        }
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("container {id}"))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed(
                "cannot kill container: permission denied".to_string(),
            ));
        }
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("container {id}"))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("removal in progress".to_string()));
        }
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("container {id}"))),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        self.check_available()?;
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
        Ok(ContainerDetails {
            summary: summary(id, container),
            running: container.running,
            host_ports: container
                .bindings
                .iter()
                .map(|b| (b.container, b.host_port))
                .collect(),
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.check_available()?;
        let mut listed: Vec<ContainerSummary> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| summary(id, c))
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }
}

fn summary(id: &str, container: &MockContainer) -> ContainerSummary {
    let state = if container.running { "running" } else { "created" };
    ContainerSummary {
        id: id.to_string(),
        ip_address: "172.17.0.2".to_string(),
        name: format!("/{}", container.name.clone().unwrap_or_else(|| id[..12].to_string())),
        state: state.to_string(),
        status: state.to_string(),
        image: container.image.clone(),
    }
}
