//! Service configuration.
//!
//! The config file is TOML, rendered first as a template with `${ VAR }`
//! placeholders filled from the process environment. Every key has a default,
//! so a missing file is not an error.

use std::{
    collections::HashMap,
    net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use minijinja::Environment;
use serde::Deserialize;

use crate::orchestrator::Timeouts;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("Invalid listen address '{value}': {source}")]
    InvalidListen {
        value: String,
        #[source]
        source: AddrParseError,
    },
}

fn default_listen() -> String {
    "0.0.0.0:80".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeConfig::default(),
            ports: PortsConfig::default(),
            firewall: FirewallConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub timeout_secs: u64,
    pub build_timeout_secs: u64,
    /// Grace period the engine gives a container before killing it.
    pub stop_timeout_secs: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            build_timeout_secs: 1800,
            stop_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            call: Duration::from_secs(self.timeout_secs),
            build: Duration::from_secs(self.build_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsConfig {
    pub host_ip: IpAddr,
    pub reservation_secs: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reservation_secs: 30,
        }
    }
}

impl PortsConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub open_listen_port: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(target_os = "linux"),
            open_listen_port: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// JSON file the audit log is kept in. In memory only when unset.
    pub path: Option<PathBuf>,
    pub recent_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            recent_limit: 5,
        }
    }
}

pub fn render_template(
    template_str: &str,
    vars: &HashMap<String, String>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

impl ProvisionerConfig {
    pub fn try_init_from_string(
        raw: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let rendered = render_template(raw, vars)?;
        Ok(toml::from_str(&rendered)?)
    }

    pub async fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::try_init_from_string(&raw, &vars)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                value: self.listen.clone(),
                source,
            })
    }
}
