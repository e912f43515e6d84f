//! Image references and pull-or-build resolution.

use std::{
    fmt,
    sync::{Arc, LazyLock},
    time::Duration,
};

use regex::Regex;
use url::Url;

use crate::runtime::{ContainerRuntime, ImageMetadata, RuntimeError, bounded};

const SOURCE_SCHEMES: [&str; 4] = ["http", "https", "git", "ssh"];

/// Longest repository name the engine accepts.
const MAX_NAME_LEN: usize = 255;

const PATH_COMPONENT: &str = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
const DOMAIN: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?";
const TAG: &str = r"[\w][\w.-]{0,127}";
const DIGEST: &str = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";

static PATH_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{PATH_COMPONENT}$"))
        .expect("Image name pattern is a constant and always compiles")
});

/// `[domain/]path[/path...][:tag][@digest]`, capturing the name part.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^(?P<name>(?:{DOMAIN}/)?{PATH_COMPONENT}(?:/{PATH_COMPONENT})*)(?::{TAG})?(?:@{DIGEST})?$"
    ))
    .expect("Image reference pattern is a constant and always compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid reference '{reference}': {reason}")]
pub struct InvalidReference {
    pub reference: String,
    pub reason: &'static str,
}

impl InvalidReference {
    fn new(reference: &str, reason: &'static str) -> Self {
        Self {
            reference: reference.to_string(),
            reason,
        }
    }
}

/// Where a container image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// A registry reference, pulled as-is. Tag defaulting is left to the
    /// runtime.
    Registry(String),
    /// A remote repository built into the image `image`.
    Source { locator: String, image: String },
}

impl ImageReference {
    pub fn registry(reference: &str) -> Result<Self, InvalidReference> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(InvalidReference::new(reference, "image name is empty"));
        }
        if trimmed.contains("://") {
            return Err(InvalidReference::new(
                reference,
                "image names cannot carry a URL scheme",
            ));
        }
        let name = REFERENCE_RE
            .captures(trimmed)
            .and_then(|captures| captures.name("name"))
            .ok_or_else(|| {
                InvalidReference::new(
                    reference,
                    "expected a lowercase repository with an optional tag or digest",
                )
            })?;
        // Only a component with a dot, a port or `localhost` is a registry host.
        if let Some((first, _)) = name.as_str().split_once('/')
            && !PATH_COMPONENT_RE.is_match(first)
            && !(first.contains(['.', ':']) || first == "localhost")
        {
            return Err(InvalidReference::new(
                reference,
                "repository path components must be lowercase",
            ));
        }
        if name.as_str().len() > MAX_NAME_LEN {
            return Err(InvalidReference::new(reference, "repository name is too long"));
        }
        Ok(Self::Registry(trimmed.to_string()))
    }

    /// Validates a repository locator and derives its image name.
    ///
    /// The name is the last path segment, lowercased, so
    /// `https://example.com/org/app.git` builds `app.git`. The lowercased
    /// segment must be a valid image path component. A `#ref:dir` fragment
    /// is kept for the build context but does not affect the name.
    pub fn source(locator: &str) -> Result<Self, InvalidReference> {
        let trimmed = locator.trim();
        let url = Url::parse(trimmed)
            .map_err(|_| InvalidReference::new(locator, "not an absolute URL"))?;

        if !SOURCE_SCHEMES.contains(&url.scheme()) {
            return Err(InvalidReference::new(
                locator,
                "unsupported repository scheme",
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(InvalidReference::new(locator, "repository host is missing"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() < 2 {
            return Err(InvalidReference::new(
                locator,
                "expected an owner and a repository in the path",
            ));
        }

        let name = segments[segments.len() - 1].to_ascii_lowercase();
        if name.len() > MAX_NAME_LEN || !PATH_COMPONENT_RE.is_match(&name) {
            return Err(InvalidReference::new(
                locator,
                "repository name is not a valid image name",
            ));
        }

        Ok(Self::Source {
            locator: trimmed.to_string(),
            image: name,
        })
    }

    /// Link-style input is treated as a repository, anything else as a
    /// registry reference.
    pub fn parse(raw: &str) -> Result<Self, InvalidReference> {
        if raw.contains("://") {
            Self::source(raw)
        } else {
            Self::registry(raw)
        }
    }

    pub fn image_name(&self) -> &str {
        match self {
            Self::Registry(reference) => reference,
            Self::Source { image, .. } => image,
        }
    }

    /// The locator or registry reference as the caller gave it.
    pub fn origin(&self) -> &str {
        match self {
            Self::Registry(reference) => reference,
            Self::Source { locator, .. } => locator,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.origin())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Unable to build {image} from {locator}: {source}")]
    Build {
        locator: String,
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Unable to pull {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Image {0} is still missing after resolution")]
    StillMissing(String),
    #[error("Unable to inspect image {image}: {source}")]
    Inspect {
        image: String,
        #[source]
        source: RuntimeError,
    },
}

impl ResolveError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Build { source, .. } | Self::Pull { source, .. } | Self::Inspect { source, .. } => {
                source.is_unavailable()
            }
            Self::StillMissing(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct ImageResolver {
    runtime: Arc<dyn ContainerRuntime>,
    call_timeout: Duration,
    build_timeout: Duration,
}

impl ImageResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        call_timeout: Duration,
        build_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            call_timeout,
            build_timeout,
        }
    }

    /// Makes sure the referenced image exists locally and returns its
    /// metadata. An image that is already present is reused unless
    /// `force_rebuild` is set.
    pub async fn resolve(
        &self,
        reference: &ImageReference,
        force_rebuild: bool,
    ) -> Result<ImageMetadata, ResolveError> {
        let image = reference.image_name();

        if !force_rebuild {
            match self.find(image).await? {
                Some(metadata) => {
                    log::debug!("Image {image} already present");
                    return Ok(metadata);
                }
                None => log::info!("Image {image} not found locally"),
            }
        }

        match reference {
            ImageReference::Source { locator, image } => {
                bounded(
                    self.build_timeout,
                    "image build",
                    self.runtime.build_image(locator, image),
                )
                .await
                .map_err(|source| ResolveError::Build {
                    locator: locator.clone(),
                    image: image.clone(),
                    source,
                })?;
            }
            ImageReference::Registry(reference) => {
                bounded(
                    self.build_timeout,
                    "image pull",
                    self.runtime.pull_image(reference),
                )
                .await
                .map_err(|source| ResolveError::Pull {
                    image: reference.clone(),
                    source,
                })?;
            }
        }

        self.find(image)
            .await?
            .ok_or_else(|| ResolveError::StillMissing(image.to_string()))
    }

    async fn find(&self, image: &str) -> Result<Option<ImageMetadata>, ResolveError> {
        match bounded(
            self.call_timeout,
            "image inspect",
            self.runtime.find_image(image),
        )
        .await
        {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(ResolveError::Inspect {
                image: image.to_string(),
                source,
            }),
        }
    }
}
