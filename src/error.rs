use crate::image::{InvalidReference, ResolveError};
use crate::ports::PortError;
use crate::runtime::RuntimeError;

/// Why a provisioning or teardown request failed. Each variant names the step
/// that failed.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidReference(#[from] InvalidReference),
    #[error("Invalid container name {0:?}: only [a-zA-Z0-9][a-zA-Z0-9_.-]+ is allowed")]
    InvalidContainerName(String),
    #[error("Image resolution failed: {0}")]
    ImageResolution(#[source] ResolveError),
    #[error("Port allocation failed: {0}")]
    PortAllocation(#[from] PortError),
    #[error("Unable to create container from {image}: {source}")]
    ContainerCreate {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Unable to start container {id}: {source}")]
    ContainerStart {
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Unable to {step} container {id}: {source}")]
    ContainerLifecycle {
        step: &'static str,
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Container {0} not found")]
    UnknownContainer(String),
    #[error("Unable to query containers: {0}")]
    Query(#[source] RuntimeError),
    #[error("Container runtime unavailable during {step}: {source}")]
    RuntimeUnavailable {
        step: &'static str,
        #[source]
        source: RuntimeError,
    },
}

impl ProvisionError {
    /// Stable, machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidReference(_) => "INVALID_REFERENCE",
            Self::InvalidContainerName(_) => "INVALID_CONTAINER_NAME",
            Self::ImageResolution(_) => "IMAGE_RESOLUTION_ERROR",
            Self::PortAllocation(_) => "PORT_ALLOCATION_ERROR",
            Self::ContainerCreate { .. } => "CONTAINER_CREATE_ERROR",
            Self::ContainerStart { .. } => "CONTAINER_START_ERROR",
            Self::ContainerLifecycle { .. } => "CONTAINER_LIFECYCLE_ERROR",
            Self::UnknownContainer(_) => "CONTAINER_NOT_FOUND",
            Self::Query(_) => "CONTAINER_QUERY_ERROR",
            Self::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
        }
    }

    /// Wraps a runtime failure, keeping unreachable-runtime errors distinct
    /// from the step-specific kind.
    pub(crate) fn from_runtime(
        step: &'static str,
        source: RuntimeError,
        step_error: impl FnOnce(RuntimeError) -> Self,
    ) -> Self {
        if source.is_unavailable() {
            Self::RuntimeUnavailable { step, source }
        } else {
            step_error(source)
        }
    }
}

impl From<ResolveError> for ProvisionError {
    fn from(err: ResolveError) -> Self {
        if err.is_unavailable() {
            let source = match err {
                ResolveError::Build { source, .. }
                | ResolveError::Pull { source, .. }
                | ResolveError::Inspect { source, .. } => source,
                ResolveError::StillMissing(image) => {
                    RuntimeError::Unavailable(format!("image {image} missing"))
                }
            };
            return Self::RuntimeUnavailable {
                step: "image resolution",
                source,
            };
        }
        Self::ImageResolution(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_resolution_becomes_runtime_unavailable() {
        let err: ProvisionError = ResolveError::Inspect {
            image: "nginx".to_string(),
            source: RuntimeError::Unavailable("connection refused".to_string()),
        }
        .into();
        assert_eq!(err.kind(), "RUNTIME_UNAVAILABLE");

        let err: ProvisionError = ResolveError::StillMissing("app.git".to_string()).into();
        assert_eq!(err.kind(), "IMAGE_RESOLUTION_ERROR");
    }

    #[test]
    fn test_from_runtime_keeps_step_kind() {
        let err = ProvisionError::from_runtime(
            "start",
            RuntimeError::Failed("port is already allocated".to_string()),
            |source| ProvisionError::ContainerStart {
                id: "abc".to_string(),
                source,
            },
        );
        assert_eq!(err.kind(), "CONTAINER_START_ERROR");
        assert!(err.to_string().contains("abc"));

        let err = ProvisionError::from_runtime(
            "start",
            RuntimeError::Unavailable("timed out".to_string()),
            |source| ProvisionError::ContainerStart {
                id: "abc".to_string(),
                source,
            },
        );
        assert_eq!(err.kind(), "RUNTIME_UNAVAILABLE");
    }
}
