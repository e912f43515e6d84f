//! Registry credentials for image pulls, read from the Docker client config.
//!
//! Lookup order follows the Docker CLI: a per-registry credential helper, then
//! the global credential store, then inline `auths` entries. Any failure
//! results in an anonymous pull.

use base64::Engine;
use bollard::auth::DockerCredentials;
use std::collections::HashMap;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Key Docker uses for Docker Hub in `config.json`.
const DOCKER_HUB_KEY: &str = "https://index.docker.io/v1/";

/// Username credential helpers return for identity tokens.
const IDENTITY_TOKEN_USERNAME: &str = "<token>";

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(serde::Deserialize, Debug)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug, Default)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credsHelpers")]
    creds_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn docker_config_path() -> Result<PathBuf, BoxError> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Ok(PathBuf::from(dir).join("config.json"));
    }
    let home_dir = std::env::var("HOME")?;
    Ok(PathBuf::from(home_dir).join(".docker").join("config.json"))
}

fn read_docker_config() -> Result<DockerConfig, BoxError> {
    let raw = std::fs::read_to_string(docker_config_path()?)?;
    Ok(serde_json::from_str(&raw)?)
}

/// The registry host an image reference is pulled from.
///
/// The first path component names a registry only if it looks like a host
/// (contains a `.` or `:`, or is `localhost`); otherwise the image lives on
/// Docker Hub.
pub fn registry_of(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DOCKER_HUB_KEY,
    }
}

fn call_credential_helper(helper: &str, registry: &str) -> Result<(String, String), BoxError> {
    let command = format!("docker-credential-{}", helper);
    let mut process = Command::new(command)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut stdin = process
        .stdin
        .take()
        .ok_or("Credential helper stdin unavailable")?;
    stdin.write_all(registry.as_bytes())?;
    drop(stdin);

    let output = process.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "docker-credential-{helper} exited with {}",
            output.status
        )
        .into());
    }
    let creds: CredStoreOutput = serde_json::from_slice(&output.stdout)?;
    Ok((creds.username, creds.secret))
}

fn decode_auth(auth: &str) -> Result<(String, String), BoxError> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;
    let (username, password) = decoded_str
        .split_once(':')
        .ok_or("Invalid auth format")?;
    Ok((username.to_string(), password.to_string()))
}

fn lookup(config: DockerConfig, registry: &str) -> Result<(String, String), BoxError> {
    if let Some(helper) = config
        .creds_helpers
        .as_ref()
        .and_then(|helpers| helpers.get(registry))
    {
        return call_credential_helper(helper, registry);
    }

    if let Some(helper) = config.creds_store.as_deref() {
        return call_credential_helper(helper, registry);
    }

    if let Some(auth) = config
        .auths
        .as_ref()
        .and_then(|auths| auths.get(registry))
        .and_then(|entry| entry.auth.as_deref())
    {
        return decode_auth(auth);
    }

    Err("No credentials found".into())
}

fn into_credentials(registry: &str, (username, secret): (String, String)) -> DockerCredentials {
    if username == IDENTITY_TOKEN_USERNAME {
        DockerCredentials {
            identitytoken: Some(secret),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }
    } else {
        DockerCredentials {
            username: Some(username),
            password: Some(secret),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }
    }
}

/// Credentials for pulling `reference`, if the local Docker config has any.
///
/// This may run a credential helper process, so call it off the async
/// executor.
pub fn credentials_for(reference: &str) -> Option<DockerCredentials> {
    let registry = registry_of(reference);
    let found = read_docker_config().and_then(|config| lookup(config, registry));
    match found {
        Ok(creds) => Some(into_credentials(registry, creds)),
        Err(e) => {
            log::debug!("No registry credentials for {registry}: {e}");
            None
        }
    }
}
