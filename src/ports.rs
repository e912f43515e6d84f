//! Host port allocation and binding-table construction.
//!
//! Ports are obtained by binding an ephemeral socket to port 0 and reading
//! back the port the OS picked, then dropping the socket. Nothing holds the
//! port afterwards, so another process may grab it before the container
//! runtime binds it. To at least keep concurrent provisioning requests in this
//! process from colliding, every issued port is kept in a short-lived
//! reservation set until the orchestrator releases it (after the container has
//! been started, or the request failed) or the reservation expires.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket},
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// How many times the allocator re-probes when the OS hands back a port that
/// is still reserved by an in-flight request.
const MAX_PROBE_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl AsRef<str> for Protocol {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

/// A container-declared port plus its transport.
///
/// Displayed and parsed in the Docker form (`80/tcp`). A bare number parses as
/// tcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid port specification '{0}'")]
pub struct InvalidPortSpec(pub String);

impl FromStr for PortSpec {
    type Err = InvalidPortSpec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (port, protocol) = match raw.split_once('/') {
            Some((port, proto)) => (port, proto.trim().to_ascii_lowercase()),
            None => (raw, "tcp".to_string()),
        };
        let spec: fn(u16) -> Self = match protocol.as_str() {
            "tcp" => Self::tcp,
            "udp" => Self::udp,
            _ => return Err(InvalidPortSpec(s.to_string())),
        };
        match port.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(spec(port)),
            _ => Err(InvalidPortSpec(s.to_string())),
        }
    }
}

impl Serialize for PortSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A container port paired with the host address it is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container: PortSpec,
    pub host_ip: IpAddr,
    pub host_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Unable to bind an ephemeral {protocol} socket: {source}")]
    Bind {
        protocol: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("No unreserved port found after {0} attempts")]
    Exhausted(usize),
}

/// Source of candidate host ports.
///
/// The production implementation asks the OS; tests substitute a
/// deterministic sequence.
pub trait PortProbe: Send + Sync {
    fn probe(&self, protocol: Protocol, host_ip: IpAddr) -> Result<u16, PortError>;
}

/// Binds port 0 and immediately releases it.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn probe(&self, protocol: Protocol, host_ip: IpAddr) -> Result<u16, PortError> {
        let addr = SocketAddr::new(host_ip, 0);
        let port = match protocol {
            Protocol::Tcp => TcpListener::bind(addr)
                .and_then(|listener| listener.local_addr())
                .map_err(|source| PortError::Bind {
                    protocol: "tcp",
                    source,
                })?
                .port(),
            Protocol::Udp => UdpSocket::bind(addr)
                .and_then(|socket| socket.local_addr())
                .map_err(|source| PortError::Bind {
                    protocol: "udp",
                    source,
                })?
                .port(),
        };
        Ok(port)
    }
}

pub struct PortAllocator {
    probe: Box<dyn PortProbe>,
    host_ip: IpAddr,
    reservation_ttl: Duration,
    reserved: Mutex<HashMap<u16, Instant>>,
}

impl PortAllocator {
    pub fn new(probe: impl PortProbe + 'static, host_ip: IpAddr, reservation_ttl: Duration) -> Self {
        Self {
            probe: Box::new(probe),
            host_ip,
            reservation_ttl,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    /// Returns a port that was free at probe time and is not reserved by any
    /// other request in this process. The port stays reserved until
    /// [`PortAllocator::release`] or until the reservation expires.
    pub fn allocate(&self, protocol: Protocol) -> Result<u16, PortError> {
        for _ in 0..MAX_PROBE_ATTEMPTS {
            let port = self.probe.probe(protocol, self.host_ip)?;
            let now = Instant::now();
            let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
            reserved.retain(|_, issued| now.duration_since(*issued) < self.reservation_ttl);
            if reserved.contains_key(&port) {
                log::debug!("Port {port} is still reserved, probing again");
                continue;
            }
            reserved.insert(port, now);
            return Ok(port);
        }
        Err(PortError::Exhausted(MAX_PROBE_ATTEMPTS))
    }

    pub fn release(&self, ports: impl IntoIterator<Item = u16>) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        for port in ports {
            reserved.remove(&port);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(
            OsPortProbe,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Duration::from_secs(30),
        )
    }
}

/// Builds binding tables out of allocator-issued host ports.
#[derive(Clone)]
pub struct BindingPlanner {
    allocator: Arc<PortAllocator>,
}

impl BindingPlanner {
    pub fn new(allocator: Arc<PortAllocator>) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// One binding per declared port, in ascending port order. Either every
    /// port gets a host port or the whole plan fails; ports issued before the
    /// failure are handed back to the allocator.
    pub fn plan<'a>(
        &self,
        declared: impl IntoIterator<Item = &'a PortSpec>,
    ) -> Result<Vec<PortBinding>, PortError> {
        let mut specs: Vec<PortSpec> = declared.into_iter().copied().collect();
        specs.sort();
        specs.dedup();

        let mut bindings = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.allocator.allocate(spec.protocol) {
                Ok(host_port) => bindings.push(PortBinding {
                    container: spec,
                    host_ip: self.allocator.host_ip(),
                    host_port,
                }),
                Err(e) => {
                    self.release(&bindings);
                    return Err(e);
                }
            }
        }
        Ok(bindings)
    }

    pub fn release(&self, bindings: &[PortBinding]) {
        self.allocator.release(bindings.iter().map(|b| b.host_port));
    }
}
