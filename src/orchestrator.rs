//! Provisioning and teardown of workload containers.
//!
//! A provision runs strictly in order: resolve the image, plan host ports,
//! create, start, open the firewall, record the audit event. Any failing step
//! ends the request. A container that was created but could not be started is
//! removed again; if that removal fails too, its record stays in `Created` and
//! is reported by [`Orchestrator::orphans`].

use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;

use crate::{
    audit::{AuditEvent, AuditLog, AuditLogError, MemoryAuditLog},
    error::ProvisionError,
    firewall::{Disabled, Firewall},
    image::{ImageReference, ImageResolver},
    ports::{BindingPlanner, PortBinding, PortSpec, Protocol},
    records::{ContainerRecord, ContainerRecords, InMemoryRecords, LifecycleState},
    runtime::{
        ContainerRuntime, ContainerSummary, CreateContainer, ImageMetadata, RuntimeError, bounded,
    },
};

/// Names the engine accepts for a container.
static CONTAINER_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/?[a-zA-Z0-9][a-zA-Z0-9_.-]+$")
        .expect("Container name pattern is a constant and always compiles")
});

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Any single runtime call other than a build or pull.
    pub call: Duration,
    pub build: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(60),
            build: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    /// Registry reference or repository locator.
    pub reference: String,
    /// Container ports to publish. `None` publishes every port the image
    /// exposes.
    pub ports: Option<Vec<PortSpec>>,
    pub name: Option<String>,
    pub force_rebuild: bool,
}

impl ProvisionRequest {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub id: String,
    pub image: String,
    /// Container port (`80/tcp`) to host port.
    pub ports: BTreeMap<String, u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: ImageResolver,
    planner: BindingPlanner,
    firewall: Arc<dyn Firewall>,
    audit: Arc<dyn AuditLog>,
    records: Arc<dyn ContainerRecords>,
    call_timeout: Duration,
}

impl Orchestrator {
    /// Starts out with no firewall management, an in-memory audit log and
    /// in-memory container records.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        planner: BindingPlanner,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            resolver: ImageResolver::new(runtime.clone(), timeouts.call, timeouts.build),
            runtime,
            planner,
            firewall: Arc::new(Disabled),
            audit: Arc::new(MemoryAuditLog::new()),
            records: Arc::new(InMemoryRecords::new()),
            call_timeout: timeouts.call,
        }
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_records(mut self, records: Arc<dyn ContainerRecords>) -> Self {
        self.records = records;
        self
    }

    pub async fn provision(&self, request: ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        let reference = ImageReference::parse(&request.reference)?;
        if let Some(name) = request.name.as_deref()
            && !CONTAINER_NAME_RE.is_match(name)
        {
            return Err(ProvisionError::InvalidContainerName(name.to_string()));
        }
        log::info!("Provisioning a container from {reference}");

        let metadata = self
            .resolver
            .resolve(&reference, request.force_rebuild)
            .await?;
        let declared = request.ports.as_deref().unwrap_or(metadata.exposed_ports.as_slice());
        let bindings = self.planner.plan(declared)?;
        log::debug!(
            "Planned {} port bindings for {}",
            bindings.len(),
            reference.image_name()
        );

        let started = self
            .create_and_start(&reference, request.name, &bindings)
            .await;
        // The runtime owns the host ports from here on, or they are unused.
        self.planner.release(&bindings);
        log::debug!(
            "{} host ports still reserved",
            self.planner.allocator().reserved_count()
        );
        let id = started?;

        let mut warnings = Vec::new();
        for binding in &bindings {
            if let Err(e) = self
                .firewall
                .allow(binding.host_port, binding.container.protocol)
                .await
            {
                log::warn!("Unable to open host port {} for {id}: {e}", binding.host_port);
                warnings.push(format!(
                    "host port {}/{} was not opened in the firewall: {e}",
                    binding.host_port,
                    binding.container.protocol.name()
                ));
            }
        }

        if let Err(e) = self
            .audit
            .record_creation(&id, reference.origin(), Utc::now())
            .await
        {
            log::warn!("Unable to record creation of {id} in the audit log: {e}");
        }

        log::info!("Container {id} is running from {}", reference.image_name());
        Ok(Provisioned {
            id,
            image: reference.image_name().to_string(),
            ports: bindings
                .iter()
                .map(|b| (b.container.to_string(), b.host_port))
                .collect(),
            warnings,
        })
    }

    async fn create_and_start(
        &self,
        reference: &ImageReference,
        name: Option<String>,
        bindings: &[PortBinding],
    ) -> Result<String, ProvisionError> {
        let spec = CreateContainer {
            image: reference.image_name().to_string(),
            name,
            bindings: bindings.to_vec(),
        };

        let id = bounded(
            self.call_timeout,
            "container create",
            self.runtime.create_container(&spec),
        )
        .await
        .map_err(|source| {
            ProvisionError::from_runtime("create", source, |source| {
                ProvisionError::ContainerCreate {
                    image: spec.image.clone(),
                    source,
                }
            })
        })?;
        log::info!("Created container {id} from {}", spec.image);

        self.records
            .insert(ContainerRecord {
                id: id.clone(),
                name: spec.name,
                image: spec.image,
                bindings: spec.bindings,
                state: LifecycleState::Created,
                updated_at: Utc::now(),
            })
            .await;

        if let Err(source) = bounded(
            self.call_timeout,
            "container start",
            self.runtime.start_container(&id),
        )
        .await
        {
            log::warn!("Container {id} failed to start: {source}");
            self.discard_unstarted(&id).await;
            return Err(ProvisionError::from_runtime("start", source, |source| {
                ProvisionError::ContainerStart {
                    id: id.clone(),
                    source,
                }
            }));
        }

        self.records.set_state(&id, LifecycleState::Started).await;
        Ok(id)
    }

    async fn discard_unstarted(&self, id: &str) {
        match bounded(
            self.call_timeout,
            "container remove",
            self.runtime.remove_container(id),
        )
        .await
        {
            Ok(()) => {
                log::info!("Removed container {id} after its failed start");
                self.records.remove(id).await;
            }
            Err(e) => log::error!(
                "Container {id} was created but neither started nor removed and is now orphaned: {e}"
            ),
        }
    }

    /// Stops and removes a container. Stop failures are logged and the
    /// removal is attempted anyway; removal failures are returned.
    pub async fn deprovision(&self, id: &str) -> Result<(), ProvisionError> {
        log::info!("Deprovisioning container {id}");
        let (published, running) = self.inspect_for_teardown(id).await;

        if running {
            match bounded(
                self.call_timeout,
                "container stop",
                self.runtime.stop_container(id),
            )
            .await
            {
                Ok(()) => {
                    self.records.set_state(id, LifecycleState::Stopped).await;
                }
                Err(e) => log::warn!("Unable to stop container {id}, removing it anyway: {e}"),
            }
        } else {
            log::debug!("Container {id} is not running");
        }

        bounded(
            self.call_timeout,
            "container remove",
            self.runtime.remove_container(id),
        )
        .await
        .map_err(|source| {
            ProvisionError::from_runtime("remove", source, |source| {
                ProvisionError::ContainerLifecycle {
                    step: "remove",
                    id: id.to_string(),
                    source,
                }
            })
        })?;
        self.records.remove(id).await;

        for (port, protocol) in published {
            if let Err(e) = self.firewall.revoke(port, protocol).await {
                log::warn!("Unable to close host port {port} after removing {id}: {e}");
            }
        }

        match self.audit.record_destruction(id, Utc::now()).await {
            Ok(()) => {}
            Err(AuditLogError::UnknownContainer(_)) => {
                log::debug!("Container {id} has no audit event to close")
            }
            Err(e) => log::warn!("Unable to record destruction of {id} in the audit log: {e}"),
        }

        log::info!("Container {id} removed");
        Ok(())
    }

    /// Host ports a container is published on and whether it is running.
    /// Falls back to our own record, assumed running, when the runtime cannot
    /// inspect it.
    async fn inspect_for_teardown(&self, id: &str) -> (Vec<(u16, Protocol)>, bool) {
        match bounded(
            self.call_timeout,
            "container inspect",
            self.runtime.inspect_container(id),
        )
        .await
        {
            Ok(details) => (
                details
                    .host_ports
                    .into_iter()
                    .map(|(spec, port)| (port, spec.protocol))
                    .collect(),
                details.running,
            ),
            Err(e) => {
                log::debug!("Unable to inspect {id} before teardown: {e}");
                let published = self
                    .records
                    .get(id)
                    .await
                    .map(|record| {
                        record
                            .bindings
                            .iter()
                            .map(|b| (b.host_port, b.container.protocol))
                            .collect()
                    })
                    .unwrap_or_default();
                (published, true)
            }
        }
    }

    /// Builds (or rebuilds) the image for a repository locator without
    /// creating a container.
    pub async fn build(&self, locator: &str) -> Result<ImageMetadata, ProvisionError> {
        let reference = ImageReference::source(locator)?;
        log::info!("Building {} from {locator}", reference.image_name());
        Ok(self.resolver.resolve(&reference, true).await?)
    }

    pub async fn list(&self) -> Result<Vec<ContainerSummary>, ProvisionError> {
        bounded(
            self.call_timeout,
            "container list",
            self.runtime.list_containers(true),
        )
        .await
        .map_err(|source| ProvisionError::from_runtime("list", source, ProvisionError::Query))
    }

    pub async fn get(&self, id: &str) -> Result<ContainerSummary, ProvisionError> {
        match bounded(
            self.call_timeout,
            "container inspect",
            self.runtime.inspect_container(id),
        )
        .await
        {
            Ok(details) => Ok(details.summary),
            Err(RuntimeError::NotFound(_)) => Err(ProvisionError::UnknownContainer(id.to_string())),
            Err(source) => Err(ProvisionError::from_runtime(
                "inspect",
                source,
                ProvisionError::Query,
            )),
        }
    }

    /// Containers that were created but could neither be started nor cleaned
    /// up.
    pub async fn orphans(&self) -> Vec<ContainerRecord> {
        self.records
            .list()
            .await
            .into_iter()
            .filter(|record| record.state == LifecycleState::Created)
            .collect()
    }

    pub async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditLogError> {
        self.audit.query_recent(limit).await
    }
}
