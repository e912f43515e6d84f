//! Host firewall rules for published ports.
//!
//! Rule failures are returned to the caller, which reports them and carries
//! on. They never take the process down.

use async_trait::async_trait;
use tokio::process::Command;

use crate::ports::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("Unable to run iptables: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("iptables {action} for {port}/{protocol} exited with {status}: {stderr}")]
    Rule {
        action: &'static str,
        port: u16,
        protocol: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

#[async_trait]
pub trait Firewall: Send + Sync {
    /// Accept inbound traffic on `port`.
    async fn allow(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError>;
    /// Drop a rule previously added by [`Firewall::allow`].
    async fn revoke(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError>;
}

/// Appends/deletes `INPUT` accept rules with `iptables`.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl Iptables {
    fn rule_args(flag: &'static str, port: u16, protocol: Protocol) -> Vec<String> {
        vec![
            flag.to_string(),
            "INPUT".to_string(),
            "-p".to_string(),
            protocol.as_ref().to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }

    async fn run(
        &self,
        action: &'static str,
        flag: &'static str,
        port: u16,
        protocol: Protocol,
    ) -> Result<(), FirewallError> {
        let output = Command::new(&self.binary)
            .args(Self::rule_args(flag, port, protocol))
            .output()
            .await?;

        if output.status.success() {
            log::debug!("iptables {action} {port}/{}", protocol.as_ref());
            return Ok(());
        }

        Err(FirewallError::Rule {
            action,
            port,
            protocol: protocol.name(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Firewall for Iptables {
    async fn allow(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
        self.run("allow", "-A", port, protocol).await
    }

    async fn revoke(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
        self.run("revoke", "-D", port, protocol).await
    }
}

/// Used when firewall management is switched off, or on hosts without
/// iptables.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

#[async_trait]
impl Firewall for Disabled {
    async fn allow(&self, _port: u16, _protocol: Protocol) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn revoke(&self, _port: u16, _protocol: Protocol) -> Result<(), FirewallError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records rule changes and fails on demand.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingFirewall {
        pub(crate) allowed: Mutex<Vec<(u16, Protocol)>>,
        pub(crate) revoked: Mutex<Vec<(u16, Protocol)>>,
        pub(crate) fail: bool,
    }

    impl RecordingFirewall {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Firewall for RecordingFirewall {
        async fn allow(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
            if self.fail {
                return Err(FirewallError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "Permission denied (you must be root)",
                )));
            }
            self.allowed.lock().unwrap().push((port, protocol));
            Ok(())
        }

        async fn revoke(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
            self.revoked.lock().unwrap().push((port, protocol));
            Ok(())
        }
    }

    #[test]
    fn test_rule_args() {
        assert_eq!(
            Iptables::rule_args("-A", 32768, Protocol::Tcp).join(" "),
            "-A INPUT -p tcp --dport 32768 -j ACCEPT"
        );
        assert_eq!(
            Iptables::rule_args("-D", 53, Protocol::Udp).join(" "),
            "-D INPUT -p udp --dport 53 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let firewall = Iptables {
            binary: "/nonexistent/iptables".to_string(),
        };
        assert!(matches!(
            firewall.allow(8080, Protocol::Tcp).await,
            Err(FirewallError::Spawn(_))
        ));
    }
}
