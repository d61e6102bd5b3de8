//! TOML configuration: listeners, hostnames, Docker settings, storage and
//! launch parameters

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Hostnames the dispatcher recognizes
    #[serde(default)]
    pub host: HostConfig,

    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Container engine configuration
    #[serde(default)]
    pub docker: DockerConfig,

    /// Registry storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Launch parameters mapped to container environment variables
    #[serde(default = "default_parameters")]
    pub parameters: Vec<Parameter>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            listen: ListenConfig::default(),
            docker: DockerConfig::default(),
            storage: StorageConfig::default(),
            parameters: default_parameters(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Hostname serving the control API (compared case-insensitively)
    #[serde(default = "default_webapi_host")]
    pub webapi: String,

    /// Suffix appended to a subdomain to form its public hostname
    /// (e.g. ".example.com" makes "app1.example.com" route to "app1")
    #[serde(default = "default_reverse_proxy_suffix")]
    pub reverse_proxy_suffix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            webapi: default_webapi_host(),
            reverse_proxy_suffix: default_reverse_proxy_suffix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    /// Bind address for every listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub foreign_address: String,

    /// One listener is started per entry
    #[serde(default = "default_listen_ports")]
    pub http: Vec<PortMap>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            foreign_address: default_bind_address(),
            http: default_listen_ports(),
        }
    }
}

/// A listening port and the container port traffic on it is forwarded to
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    pub listen_port: u16,
    pub target_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub endpoint: Option<String>,

    /// Image used when a launch request does not name one
    pub default_image: Option<String>,

    /// Grace period in seconds given to containers being stopped
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Host-level settings applied to every launched container
    #[serde(default)]
    pub host_config: ContainerHostConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            default_image: None,
            stop_grace_secs: default_stop_grace(),
            host_config: ContainerHostConfig::default(),
        }
    }
}

impl DockerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Static host configuration inherited by every created container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerHostConfig {
    /// Docker network mode (e.g. "bridge")
    pub network_mode: Option<String>,

    /// Port bindings keyed by container port ("5000/tcp")
    #[serde(default)]
    pub port_bindings: HashMap<String, Vec<PortBindingConfig>>,

    /// Memory limit (e.g. "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g. "0.5", "2")
    pub cpus: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PortBindingConfig {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the registry database
    #[serde(default = "default_datadir")]
    pub datadir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            datadir: default_datadir(),
        }
    }
}

impl StorageConfig {
    pub fn registry_path(&self) -> std::path::PathBuf {
        Path::new(&self.datadir).join("subgate.db")
    }
}

/// A launch option recognized by name and exported to the container as `env`
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub env: String,
    #[serde(default)]
    pub required: bool,
}

impl Parameter {
    pub fn new(name: &str, env: &str) -> Self {
        Self {
            name: name.to_string(),
            env: env.to_string(),
            required: false,
        }
    }
}

fn default_parameters() -> Vec<Parameter> {
    vec![Parameter::new("branch", "GIT_BRANCH")]
}

fn default_webapi_host() -> String {
    "localhost".to_string()
}

fn default_reverse_proxy_suffix() -> String {
    ".localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_ports() -> Vec<PortMap> {
    vec![PortMap {
        listen_port: 80,
        target_port: 5000,
    }]
}

fn default_stop_grace() -> u64 {
    5
}

fn default_datadir() -> String {
    "./data".to_string()
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches("kb").trim_end_matches('k'), 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Parse CPU limit string (e.g. "0.5") to Docker NanoCPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let cpu_count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
    Ok((cpu_count * 1_000_000_000.0) as i64)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.host.webapi.trim().is_empty() {
            errors.push("host.webapi must not be empty".to_string());
        }

        if self.listen.http.is_empty() {
            errors.push("at least one [[listen.http]] entry is required".to_string());
        }
        let mut ports = HashSet::new();
        for port in &self.listen.http {
            if !ports.insert(port.listen_port) {
                errors.push(format!("duplicate listen port {}", port.listen_port));
            }
        }

        let mut names = HashSet::new();
        let mut envs = HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() || param.env.is_empty() {
                errors.push("parameters need both 'name' and 'env'".to_string());
                continue;
            }
            if !names.insert(param.name.as_str()) {
                errors.push(format!("duplicate parameter name '{}'", param.name));
            }
            if !envs.insert(param.env.as_str()) {
                errors.push(format!("duplicate parameter env '{}'", param.env));
            }
        }

        if let Some(ref memory) = self.docker.host_config.memory {
            if let Err(e) = parse_memory_limit(memory) {
                errors.push(e.to_string());
            }
        }
        if let Some(ref cpus) = self.docker.host_config.cpus {
            if let Err(e) = parse_cpu_limit(cpus) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[host]
webapi = "api.example.com"
reverse_proxy_suffix = ".example.com"

[listen]
foreign_address = "127.0.0.1"

[[listen.http]]
listen_port = 8080
target_port = 5000

[[listen.http]]
listen_port = 8081
target_port = 3000

[docker]
endpoint = "unix:///var/run/docker.sock"
default_image = "app:latest"

[docker.host_config]
network_mode = "bridge"
memory = "512m"

[docker.host_config.port_bindings]
"5000/tcp" = [{ host_ip = "127.0.0.1", host_port = "" }]

[storage]
datadir = "/var/lib/subgate"

[[parameters]]
name = "branch"
env = "GIT_BRANCH"

[[parameters]]
name = "nick"
env = "NICK"
required = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.host.webapi, "api.example.com");
        assert_eq!(config.listen.http.len(), 2);
        assert_eq!(config.listen.http[1].target_port, 3000);
        assert_eq!(config.docker.default_image.as_deref(), Some("app:latest"));
        assert_eq!(config.docker.host_config.port_bindings.len(), 1);
        assert_eq!(config.parameters.len(), 2);
        assert!(config.parameters[1].required);
        assert_eq!(
            config.storage.registry_path(),
            Path::new("/var/lib/subgate").join("subgate.db")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.host.webapi, "localhost");
        assert_eq!(config.listen.foreign_address, "0.0.0.0");
        assert_eq!(config.listen.http, default_listen_ports());
        assert_eq!(config.docker.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.parameters, vec![Parameter::new("branch", "GIT_BRANCH")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let config: Config = toml::from_str(
            r#"
[[listen.http]]
listen_port = 80
target_port = 5000

[[listen.http]]
listen_port = 80
target_port = 5001
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate listen port 80"));
    }

    #[test]
    fn test_validate_rejects_duplicate_parameters() {
        let config: Config = toml::from_str(
            r#"
[[parameters]]
name = "branch"
env = "GIT_BRANCH"

[[parameters]]
name = "branch"
env = "OTHER"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate parameter name 'branch'"));
    }

    #[test]
    fn test_validate_rejects_empty_listen() {
        let mut config = Config::default();
        config.listen.http.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }

    #[test]
    fn test_parse_cpu_limit() {
        assert_eq!(parse_cpu_limit("0.5").unwrap(), 500_000_000);
        assert_eq!(parse_cpu_limit("2").unwrap(), 2_000_000_000);
        assert!(parse_cpu_limit("lots").is_err());
    }
}
