//! Container engine capability and its Docker implementation

use crate::config::{parse_cpu_limit, parse_memory_limit, ContainerHostConfig};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot {op} container {target}: {message}")]
    Call {
        op: &'static str,
        target: String,
        message: String,
    },
    #[error("invalid container configuration: {0}")]
    InvalidSpec(String),
}

impl EngineError {
    pub fn call(op: &'static str, target: impl Into<String>, message: impl ToString) -> Self {
        EngineError::Call {
            op,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub host_config: ContainerHostConfig,
}

impl ContainerSpec {
    /// Container ports that must be declared exposed for the configured bindings
    pub fn exposed_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.host_config.port_bindings.keys().cloned().collect();
        ports.sort();
        ports
    }
}

/// Result of inspecting a started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub ip_address: String,
    pub created: DateTime<Utc>,
}

/// One entry of the engine's container list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
}

/// Filters for a log fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsQuery {
    /// Only entries at or after this unix timestamp
    pub since: Option<i64>,
    /// Number of trailing lines, or "all"
    pub tail: String,
}

/// Call contract the orchestrator drives. Every call is a network round trip.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create (but do not start) a container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    /// Stop with a grace period before the engine kills the container
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Containers the engine currently reports as existing
    async fn list(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Combined stdout/stderr as raw chunks, in emission order
    fn logs(&self, id: &str, query: &LogsQuery) -> BoxStream<'static, Result<Bytes, EngineError>>;
}

/// Docker-backed [`ContainerEngine`]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit endpoint
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(endpoint: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = endpoint {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker endpoint '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            debug!(path, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))
    }
}

/// Translate a [`ContainerSpec`] into bollard's creation config
fn container_config(spec: &ContainerSpec) -> Result<Config<String>, EngineError> {
    let hc = &spec.host_config;

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = hc
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.clone(),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    let mut host_config = HostConfig {
        network_mode: hc.network_mode.clone(),
        ..Default::default()
    };
    if !port_bindings.is_empty() {
        host_config.port_bindings = Some(port_bindings);
    }
    if let Some(ref memory) = hc.memory {
        host_config.memory =
            Some(parse_memory_limit(memory).map_err(|e| EngineError::InvalidSpec(e.to_string()))?);
    }
    if let Some(ref cpus) = hc.cpus {
        host_config.nano_cpus =
            Some(parse_cpu_limit(cpus).map_err(|e| EngineError::InvalidSpec(e.to_string()))?);
    }

    let exposed = spec.exposed_ports();
    let exposed_ports = if exposed.is_empty() {
        None
    } else {
        Some(exposed.into_iter().map(|p| (p, HashMap::new())).collect())
    };

    Ok(Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports,
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Pull the address and creation time out of an inspect response
fn container_details(id: &str, resp: ContainerInspectResponse) -> Result<ContainerDetails, EngineError> {
    let created = resp
        .created
        .as_deref()
        .ok_or_else(|| EngineError::call("inspect", id, "missing creation time"))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| EngineError::call("inspect", id, format!("bad creation time '{}': {}", raw, e)))
        })?;

    // Default bridge first, then any user-defined network
    let ip_address = resp
        .network_settings
        .and_then(|ns| {
            ns.ip_address.filter(|ip| !ip.is_empty()).or_else(|| {
                ns.networks.and_then(|networks| {
                    let mut names: Vec<_> = networks.keys().cloned().collect();
                    names.sort();
                    names
                        .into_iter()
                        .filter_map(|name| networks.get(&name).and_then(|n| n.ip_address.clone()))
                        .find(|ip| !ip.is_empty())
                })
            })
        })
        .unwrap_or_default();

    Ok(ContainerDetails {
        id: resp.id.unwrap_or_else(|| id.to_string()),
        ip_address,
        created,
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let config = container_config(spec)?;
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("Conflict") && err_str.contains("name") {
                    EngineError::call("create", &spec.name, "container name already in use")
                } else if err_str.contains("No such image") {
                    EngineError::call("create", &spec.name, format!("image '{}' not found", spec.image))
                } else {
                    EngineError::call("create", &spec.name, e)
                }
            })?;

        info!(container_id = %response.id, name = %spec.name, image = %spec.image, "Created Docker container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::call("start", id, e))?;
        info!(container_id = id, "Started Docker container");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let resp = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| EngineError::call("inspect", id, e))?;
        container_details(id, resp)
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        if id.is_empty() {
            return Err(EngineError::call("stop", id, "empty container id"));
        }

        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(EngineError::call("stop", id, e)),
        }
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| EngineError::call("list", "*", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .map(|id| ContainerSummary { id })
            .collect())
    }

    fn logs(&self, id: &str, query: &LogsQuery) -> BoxStream<'static, Result<Bytes, EngineError>> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            since: query.since.unwrap_or(0),
            tail: if query.tail.is_empty() {
                "all".to_string()
            } else {
                query.tail.clone()
            },
            ..Default::default()
        };

        let target = id.to_string();
        self.client
            .logs(id, Some(options))
            .filter_map(move |item| {
                let out = match item {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => Some(Ok(message)),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(EngineError::call("read logs of", target.clone(), e))),
                };
                futures::future::ready(out)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortBindingConfig;
    use bollard::models::{EndpointSettings, NetworkSettings};

    #[test]
    fn test_container_config_exposes_bound_ports() {
        let mut host_config = ContainerHostConfig {
            network_mode: Some("bridge".to_string()),
            memory: Some("256m".to_string()),
            ..Default::default()
        };
        host_config.port_bindings.insert(
            "5000/tcp".to_string(),
            vec![PortBindingConfig {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }],
        );
        let spec = ContainerSpec {
            name: "app1-c1".to_string(),
            image: "demo:latest".to_string(),
            env: vec!["SUBDOMAIN=app1".to_string()],
            host_config,
        };

        let config = container_config(&spec).unwrap();
        assert_eq!(config.image.as_deref(), Some("demo:latest"));
        assert!(config.exposed_ports.unwrap().contains_key("5000/tcp"));
        let hc = config.host_config.unwrap();
        assert_eq!(hc.memory, Some(256 * 1024 * 1024));
        assert_eq!(hc.network_mode.as_deref(), Some("bridge"));
        assert!(hc.port_bindings.unwrap().contains_key("5000/tcp"));
    }

    #[test]
    fn test_container_config_without_bindings() {
        let spec = ContainerSpec {
            name: "c".to_string(),
            image: "i".to_string(),
            ..Default::default()
        };
        let config = container_config(&spec).unwrap();
        assert!(config.exposed_ports.is_none());
        assert!(config.host_config.unwrap().port_bindings.is_none());
    }

    #[test]
    fn test_container_config_rejects_bad_limits() {
        let spec = ContainerSpec {
            host_config: ContainerHostConfig {
                cpus: Some("many".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(container_config(&spec), Err(EngineError::InvalidSpec(_))));
    }

    #[test]
    fn test_container_details_prefers_bridge_address() {
        let resp = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            created: Some("2024-05-01T12:00:00.123456789Z".to_string()),
            network_settings: Some(NetworkSettings {
                ip_address: Some("172.17.0.5".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let details = container_details("abc123", resp).unwrap();
        assert_eq!(details.ip_address, "172.17.0.5");
        assert_eq!(details.created.timestamp(), 1714564800);
    }

    #[test]
    fn test_container_details_falls_back_to_user_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "apps".to_string(),
            EndpointSettings {
                ip_address: Some("10.0.3.7".to_string()),
                ..Default::default()
            },
        );
        let resp = ContainerInspectResponse {
            created: Some("2024-05-01T12:00:00Z".to_string()),
            network_settings: Some(NetworkSettings {
                ip_address: Some(String::new()),
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let details = container_details("abc123", resp).unwrap();
        assert_eq!(details.id, "abc123");
        assert_eq!(details.ip_address, "10.0.3.7");
    }

    #[test]
    fn test_container_details_requires_created() {
        let resp = ContainerInspectResponse::default();
        assert!(container_details("abc", resp).is_err());
    }
}
