//! Instance address resolution.
//!
//! Turns an [`InstanceDescriptor`] into the address and login user of the
//! machine to connect to. The default implementation shells out to `gcloud`,
//! reusing whatever authentication the operator already has configured.

use std::future::Future;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;

/// Immutable identity of a Compute Engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub name: String,
    pub project: String,
    pub zone: String,
}

/// Where to connect for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    pub name: String,
    pub address: String,
    pub internal_address: Option<String>,
    pub login_user: String,
    pub status: String,
}

/// Errors from the instance lookup.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to run gcloud: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("gcloud command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("failed to parse gcloud output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("instance {0} does not have an external IP address")]
    NoExternalAddress(String),
}

/// Resolves an instance to a connection endpoint.
pub trait ConnectionResolver: Send + Sync {
    fn resolve(
        &self,
        instance: &InstanceDescriptor,
    ) -> impl Future<Output = Result<ConnectionEndpoint, ResolveError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterfaceJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceJson {
    #[serde(rename = "networkIP", default)]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfigJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfigJson {
    #[serde(rename = "natIP", default)]
    nat_ip: Option<String>,
}

/// Looks instances up with `gcloud compute instances describe`.
#[derive(Debug, Clone)]
pub struct GcloudResolver {
    program: String,
    credentials_path: Option<PathBuf>,
    user: Option<String>,
}

impl GcloudResolver {
    pub fn new(credentials_path: Option<PathBuf>, user: Option<String>) -> Self {
        Self {
            program: "gcloud".to_string(),
            credentials_path,
            user,
        }
    }

    /// Use a different executable instead of `gcloud` on `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, instance: &InstanceDescriptor) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "describe".to_string(),
            instance.name.clone(),
            "--zone".to_string(),
            instance.zone.clone(),
            "--project".to_string(),
            instance.project.clone(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if let Some(path) = &self.credentials_path {
            args.push(format!("--credential-file-override={}", path.display()));
        }
        args
    }
}

impl ConnectionResolver for GcloudResolver {
    async fn resolve(
        &self,
        instance: &InstanceDescriptor,
    ) -> Result<ConnectionEndpoint, ResolveError> {
        info!(
            instance = %instance.name,
            project = %instance.project,
            zone = %instance.zone,
            "Looking up instance"
        );

        let output = Command::new(&self.program)
            .args(self.args(instance))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ResolveError::Spawn)?;

        if !output.status.success() {
            return Err(ResolveError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let user = self.user.clone().unwrap_or_else(local_username);
        let endpoint = parse_instance(&output.stdout, &instance.name, user)?;
        debug!(address = %endpoint.address, status = %endpoint.status, "Instance resolved");
        Ok(endpoint)
    }
}

/// Always resolves to the same endpoint.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoint: ConnectionEndpoint,
}

impl StaticResolver {
    pub fn new(endpoint: ConnectionEndpoint) -> Self {
        Self { endpoint }
    }

    /// Endpoint for a fixed address, logging in as `user` or the local user.
    pub fn for_address(name: &str, address: &str, user: Option<String>) -> Self {
        Self::new(ConnectionEndpoint {
            name: name.to_string(),
            address: address.to_string(),
            internal_address: None,
            login_user: user.unwrap_or_else(local_username),
            status: "UNKNOWN".to_string(),
        })
    }
}

impl ConnectionResolver for StaticResolver {
    async fn resolve(
        &self,
        _instance: &InstanceDescriptor,
    ) -> Result<ConnectionEndpoint, ResolveError> {
        Ok(self.endpoint.clone())
    }
}

/// The resolver selected by the configuration file.
#[derive(Debug, Clone)]
pub enum ConfiguredResolver {
    Gcloud(GcloudResolver),
    Static(StaticResolver),
}

impl ConfiguredResolver {
    /// A fixed `[instance] address` skips the gcloud lookup.
    pub fn from_config(config: &Config) -> Self {
        match &config.instance.address {
            Some(address) if !address.is_empty() => Self::Static(StaticResolver::for_address(
                &config.instance.name,
                address,
                config.instance.user.clone(),
            )),
            _ => Self::Gcloud(GcloudResolver::new(
                config.credentials_path.clone(),
                config.instance.user.clone(),
            )),
        }
    }
}

impl ConnectionResolver for ConfiguredResolver {
    async fn resolve(
        &self,
        instance: &InstanceDescriptor,
    ) -> Result<ConnectionEndpoint, ResolveError> {
        match self {
            Self::Gcloud(r) => r.resolve(instance).await,
            Self::Static(r) => r.resolve(instance).await,
        }
    }
}

/// Parse `gcloud compute instances describe --format json` output.
fn parse_instance(
    json: &[u8],
    requested: &str,
    login_user: String,
) -> Result<ConnectionEndpoint, ResolveError> {
    let parsed: InstanceJson = serde_json::from_slice(json)?;

    let internal_address = parsed
        .network_interfaces
        .iter()
        .find_map(|nic| nic.network_ip.clone().filter(|ip| !ip.is_empty()));

    let address = parsed
        .network_interfaces
        .iter()
        .flat_map(|nic| nic.access_configs.iter())
        .find_map(|ac| ac.nat_ip.clone().filter(|ip| !ip.is_empty()))
        .ok_or_else(|| ResolveError::NoExternalAddress(requested.to_string()))?;

    let name = if parsed.name.is_empty() {
        requested.to_string()
    } else {
        parsed.name
    };

    Ok(ConnectionEndpoint {
        name,
        address,
        internal_address,
        login_user,
        status: parsed.status,
    })
}

/// Name of the local user, used as the remote login by default.
pub fn local_username() -> String {
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
        return user.name;
    }
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

/// Host name of this machine, for the local prompt.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
