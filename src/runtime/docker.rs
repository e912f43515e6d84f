//! [`ContainerRuntime`] backed by the Docker Engine API through bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding as DockerPortBinding};
use bollard::query_parameters::{
    BuildImageOptions, BuildImageOptionsBuilder, CreateContainerOptionsBuilder,
    CreateImageOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    InspectContainerOptionsBuilder, ListContainersOptions, ListContainersOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StartContainerOptionsBuilder, StopContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;

use super::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CreateContainer, ImageMetadata,
    RuntimeError, credentials,
};
use crate::ports::PortSpec;

/// Network whose address is reported for listed containers.
const BRIDGE_NETWORK: &str = "bridge";

pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i32,
}

impl DockerRuntime {
    /// Connects using the local defaults (Unix socket on Linux/macOS, named
    /// pipe on Windows, or `DOCKER_HOST`).
    pub fn connect(stop_timeout_secs: i32) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }
}

/// Maps bollard errors onto the runtime taxonomy. 404s become `NotFound`,
/// transport failures become `Unavailable`.
fn classify(err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        bollard::errors::Error::IOError { .. } | bollard::errors::Error::RequestTimeoutError => {
            RuntimeError::Unavailable(err.to_string())
        }
        e => RuntimeError::DockerApi(e),
    }
}

/// Parse an image reference into (image, tag) components
fn parse_image_reference(image: &str) -> (&str, &str) {
    // Handle digest references (image@sha256:...)
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos + 1..]);
    }

    // A colon followed by a slash belongs to a registry port
    // (localhost:5000/myimage), not to a tag.
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }

    // The Engine pulls every tag of the repository when `tag` is empty
    (image, "latest")
}

fn parse_port_key(key: &str) -> Option<PortSpec> {
    match key.parse() {
        Ok(spec) => Some(spec),
        Err(e) => {
            log::warn!("Ignoring unsupported port {key}: {e}");
            None
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_image(&self, name: &str) -> Result<ImageMetadata, RuntimeError> {
        let inspect = self.docker.inspect_image(name).await.map_err(classify)?;

        let mut exposed_ports: Vec<PortSpec> = inspect
            .config
            .and_then(|config| config.exposed_ports)
            .map(|ports| ports.keys().filter_map(|k| parse_port_key(k)).collect())
            .unwrap_or_default();
        exposed_ports.sort();
        exposed_ports.dedup();

        Ok(ImageMetadata {
            name: name.to_string(),
            id: inspect.id,
            exposed_ports,
        })
    }

    async fn build_image(&self, context: &str, tag: &str) -> Result<(), RuntimeError> {
        log::info!("Building image {tag} from {context}");

        let options: BuildImageOptions = BuildImageOptionsBuilder::new()
            .remote(context)
            .t(tag)
            .rm(true)
            .build();

        let mut stream = self.docker.build_image(options, None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        let message = detail
                            .message
                            .unwrap_or_else(|| "unknown build error".to_string());
                        log::error!("Failed to build image {tag}: {message}");
                        return Err(RuntimeError::Failed(message));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            log::debug!("Build {tag}: {line}");
                        }
                    }
                }
                Err(e) => {
                    log::error!("Failed to build image {tag}: {e}");
                    return Err(classify(e));
                }
            }
        }

        log::info!("Image {tag} built successfully");
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        log::info!("Pulling image: {reference}");

        let (image, tag) = parse_image_reference(reference);

        let lookup = reference.to_string();
        let credentials = tokio::task::spawn_blocking(move || credentials::credentials_for(&lookup))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Credential lookup for {reference} panicked: {e}");
                None
            });

        let options: CreateImageOptions = CreateImageOptionsBuilder::new()
            .from_image(image)
            .tag(tag)
            .build();

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        let message = detail
                            .message
                            .unwrap_or_else(|| "unknown pull error".to_string());
                        log::error!("Failed to pull image {reference}: {message}");
                        return Err(RuntimeError::Failed(message));
                    }
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::error!("Failed to pull image {reference}: {e}");
                    return Err(classify(e));
                }
            }
        }

        log::info!("Image {reference} pulled successfully");
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainer) -> Result<String, RuntimeError> {
        let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for binding in &spec.bindings {
            let container_port = binding.container.to_string();
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port,
                Some(vec![DockerPortBinding {
                    host_ip: Some(binding.host_ip.to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let mut options = CreateContainerOptionsBuilder::new();
        if let Some(name) = &spec.name {
            options = options.name(name);
        }

        let response = self
            .docker
            .create_container(Some(options.build()), config)
            .await
            .map_err(classify)?;

        for warning in response.warnings {
            log::warn!("Creating container {}: {warning}", response.id);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();

        self.docker
            .start_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(self.stop_timeout_secs)
            .build();

        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {id} already stopped");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(classify)?;

        let ip_address = info
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(BRIDGE_NETWORK))
            .and_then(|network| network.ip_address.clone())
            .unwrap_or_default();

        let (state, running) = match &info.state {
            Some(state) => (
                state.status.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                state.running.unwrap_or(false),
            ),
            None => (String::new(), false),
        };

        let mut host_ports = Vec::new();
        if let Some(bindings) = info
            .host_config
            .as_ref()
            .and_then(|host| host.port_bindings.as_ref())
        {
            for (key, published) in bindings {
                let Some(spec) = parse_port_key(key) else {
                    continue;
                };
                for binding in published.iter().flatten() {
                    if let Some(port) = binding
                        .host_port
                        .as_deref()
                        .and_then(|p| p.parse::<u16>().ok())
                    {
                        host_ports.push((spec, port));
                    }
                }
            }
        }
        host_ports.sort();

        let summary = ContainerSummary {
            id: info.id.unwrap_or_else(|| id.to_string()),
            ip_address,
            name: info.name.unwrap_or_default(),
            status: state.clone(),
            state,
            image: info
                .config
                .and_then(|config| config.image)
                .unwrap_or_default(),
        };

        Ok(ContainerDetails {
            summary,
            running,
            host_ports,
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(all).build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|container| ContainerSummary {
                id: container.id.unwrap_or_default(),
                ip_address: container
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .and_then(|networks| networks.get(BRIDGE_NETWORK).cloned())
                    .and_then(|network| network.ip_address)
                    .unwrap_or_default(),
                name: container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default(),
                state: container.state.map(|s| s.to_string()).unwrap_or_default(),
                status: container.status.unwrap_or_default(),
                image: container.image.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_reference() {
        assert_eq!(parse_image_reference("nginx"), ("nginx", "latest"));
        assert_eq!(parse_image_reference("nginx:1.27"), ("nginx", "1.27"));
        assert_eq!(
            parse_image_reference("localhost:5000/app"),
            ("localhost:5000/app", "latest")
        );
        assert_eq!(
            parse_image_reference("localhost:5000/app:v2"),
            ("localhost:5000/app", "v2")
        );
        assert_eq!(
            parse_image_reference("app@sha256:abcd"),
            ("app", "sha256:abcd")
        );
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image: app.git".to_string(),
        });
        assert!(err.is_not_found());

        let err = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(matches!(err, RuntimeError::DockerApi(_)));
    }

    #[test]
    fn test_parse_port_key() {
        assert_eq!(parse_port_key("8080/tcp"), Some(PortSpec::tcp(8080)));
        assert_eq!(parse_port_key("132/sctp"), None);
    }
}
