//! Container lifecycle orchestration
//!
//! The [`Orchestrator`] drives three independently failing collaborators:
//! the container engine, the registry and the route table. None of the
//! multi-step operations are transactional. The intermediate states a
//! failure can leave behind are:
//!
//! - Launch failing after `create` or `start`: a container exists at the
//!   engine that no record points to. It is not rolled back.
//! - Launch failing between the registry write and the route bind: the
//!   registry is ahead of the route table until the next
//!   [`Orchestrator::restore_routes`].
//! - Terminate never touches the registry or routes unless the stop call
//!   succeeded.
//!
//! Launch and Terminate on the same subdomain are serialized by a
//! per-subdomain lock; calls on different subdomains run concurrently.

use crate::config::{ContainerHostConfig, Parameter};
use crate::engine::{ContainerEngine, ContainerSpec, LogsQuery};
use crate::error::{OrchestratorError, Result};
use crate::info::{subdomain_key, Information};
use crate::registry::{Registry, RegistryError};
use crate::routes::RouteTable;
use chrono::DateTime;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Launch option copied into [`Information::git_branch`]
pub const BRANCH_OPTION: &str = "branch";

/// Environment variable every container receives with its subdomain
pub const SUBDOMAIN_ENV: &str = "SUBDOMAIN";

/// Maximum DNS label length
const MAX_SUBDOMAIN_LEN: usize = 63;

/// Static settings applied to every launch
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Recognized launch options and the env vars they map to
    pub parameters: Vec<Parameter>,
    /// Host config inherited by created containers
    pub host_config: ContainerHostConfig,
    /// Grace period before the engine kills a stopping container
    pub stop_grace: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            parameters: vec![Parameter::new(BRANCH_OPTION, "GIT_BRANCH")],
            host_config: ContainerHostConfig::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
    routes: Arc<dyn RouteTable>,
    settings: LaunchSettings,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn Registry>,
        routes: Arc<dyn RouteTable>,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            routes,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    /// Hold the subdomain's lock until the returned guard drops
    async fn lock_subdomain(&self, subdomain: &str) -> SubdomainGuard<'_> {
        let lock = Arc::clone(self.locks.entry(subdomain.to_string()).or_default().value());
        SubdomainGuard {
            locks: &self.locks,
            subdomain: subdomain.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Start a container for `subdomain` and make it the subdomain's backend.
    ///
    /// A previous container registered for the subdomain is stopped on a
    /// best-effort basis; failing to stop it does not fail the launch.
    pub async fn launch(
        &self,
        subdomain: &str,
        image: &str,
        name: &str,
        option: &HashMap<String, String>,
    ) -> Result<Information> {
        validate_subdomain(subdomain)?;
        if image.trim().is_empty() {
            return Err(OrchestratorError::Validation("image is required".to_string()));
        }
        if name.trim().is_empty() {
            return Err(OrchestratorError::Validation("container name is required".to_string()));
        }
        for param in self.settings.parameters.iter().filter(|p| p.required) {
            if option.get(&param.name).map_or(true, |v| v.is_empty()) {
                return Err(OrchestratorError::Validation(format!(
                    "parameter '{}' is required",
                    param.name
                )));
            }
        }

        let _guard = self.lock_subdomain(subdomain).await;

        let spec = ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: build_env(&self.settings.parameters, option, subdomain),
            host_config: self.settings.host_config.clone(),
        };

        let id = self.engine.create(&spec).await.map_err(|e| {
            warn!(subdomain, name, image, error = %e, "Cannot create container");
            e
        })?;
        self.engine.start(&id).await.map_err(|e| {
            warn!(subdomain, container_id = %id, error = %e, "Cannot start container");
            e
        })?;
        let details = self.engine.inspect(&id).await?;

        if let Some(old_id) = self.current_container_id(subdomain).await? {
            if old_id != details.id {
                match self.engine.stop(&old_id, self.settings.stop_grace).await {
                    Ok(()) => info!(subdomain, container_id = %old_id, "Stopped replaced container"),
                    Err(e) => {
                        warn!(subdomain, container_id = %old_id, error = %e, "Cannot stop replaced container")
                    }
                }
            }
        }

        let record = Information::new(
            details.id,
            subdomain,
            option.get(BRANCH_OPTION).cloned().unwrap_or_default(),
            image,
            details.ip_address,
            details.created,
        );
        let data = record
            .to_bytes()
            .map_err(|e| OrchestratorError::Persistence(format!("cannot encode record: {}", e)))?;

        self.registry.set(&subdomain_key(subdomain), &data).await?;
        self.registry.add_to_membership(subdomain).await?;
        self.routes.add_subdomain(subdomain, &record.ip_address);

        info!(
            subdomain,
            container_id = %record.short_id,
            image,
            ip_address = %record.ip_address,
            "Launched container"
        );
        Ok(record)
    }

    /// Stop the subdomain's container, then drop its record and route.
    ///
    /// If the stop fails nothing else is touched, so routing never
    /// disappears for a container that may still be serving.
    pub async fn terminate(&self, subdomain: &str) -> Result<()> {
        let _guard = self.lock_subdomain(subdomain).await;

        let id = self.require_container_id(subdomain).await?;
        self.engine.stop(&id, self.settings.stop_grace).await?;

        self.registry.remove_from_membership(subdomain).await?;
        self.registry.remove(&subdomain_key(subdomain)).await?;
        self.routes.remove_subdomain(subdomain);

        info!(subdomain, container_id = %id, "Terminated container");
        Ok(())
    }

    /// Combined stdout/stderr of the subdomain's container.
    ///
    /// `since` is an RFC 3339 timestamp (empty for everything); `tail` is a
    /// line count or "all" (empty means "all").
    pub async fn logs(&self, subdomain: &str, since: &str, tail: &str) -> Result<Vec<String>> {
        let since = parse_since(since)?;
        let tail = parse_tail(tail)?;

        let id = self.require_container_id(subdomain).await?;
        let query = LogsQuery { since, tail };

        let mut stream = self.engine.logs(&id, &query);
        let mut lines = LineSplitter::default();
        while let Some(chunk) = stream.next().await {
            lines.push(&chunk?);
        }

        debug!(subdomain, container_id = %id, "Fetched container logs");
        Ok(lines.finish())
    }

    /// Registered subdomains whose container the engine still reports.
    ///
    /// Records whose container has disappeared are skipped but kept; see
    /// [`Orchestrator::prune`] for removing them.
    pub async fn list(&self) -> Result<Vec<Information>> {
        let (live, stale) = self.reconcile().await?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "Skipped registry records without a container");
        }
        Ok(live)
    }

    /// Delete registry records (and routes) whose container no longer exists.
    /// Returns the removed subdomains.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let (_, stale) = self.reconcile().await?;

        let mut removed = Vec::new();
        for record in stale {
            let _guard = self.lock_subdomain(&record.subdomain).await;

            // A launch may have replaced the record since the snapshot
            if self.current_container_id(&record.subdomain).await? != Some(record.id.clone()) {
                continue;
            }

            self.registry.remove_from_membership(&record.subdomain).await?;
            self.registry.remove(&subdomain_key(&record.subdomain)).await?;
            self.routes.remove_subdomain(&record.subdomain);
            info!(subdomain = %record.subdomain, container_id = %record.short_id, "Pruned stale record");
            removed.push(record.subdomain);
        }

        Ok(removed)
    }

    /// Bind every live subdomain in the route table. Returns how many were bound.
    pub async fn restore_routes(&self) -> Result<usize> {
        let live = self.list().await?;
        for record in &live {
            self.routes.add_subdomain(&record.subdomain, &record.ip_address);
        }
        info!(count = live.len(), "Restored routes from registry");
        Ok(live.len())
    }

    /// Split registered records into (live, stale) by matching ids against
    /// the engine's container list. Order follows the membership index.
    async fn reconcile(&self) -> Result<(Vec<Information>, Vec<Information>)> {
        let subdomains = self.registry.membership().await?;

        let mut ids: Vec<String> = self.engine.list().await?.into_iter().map(|c| c.id).collect();
        ids.sort();

        let mut live = Vec::new();
        let mut stale = Vec::new();
        for subdomain in subdomains {
            let data = match self.registry.get(&subdomain_key(&subdomain)).await {
                Ok(data) => data,
                Err(RegistryError::NotFound(_)) => {
                    debug!(subdomain = %subdomain, "Indexed subdomain has no record");
                    continue;
                }
                Err(e) => {
                    warn!(subdomain = %subdomain, error = %e, "Cannot read registry record");
                    continue;
                }
            };
            let record = match Information::from_bytes(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!(subdomain = %subdomain, error = %e, "Cannot decode registry record");
                    continue;
                }
            };

            if ids.binary_search(&record.id).is_ok() {
                live.push(record);
            } else {
                stale.push(record);
            }
        }

        Ok((live, stale))
    }

    /// Container id registered for `subdomain`, `None` when absent or unreadable
    async fn current_container_id(&self, subdomain: &str) -> Result<Option<String>> {
        match self.registry.get(&subdomain_key(subdomain)).await {
            Ok(data) => match Information::from_bytes(&data) {
                Ok(record) => Ok(Some(record.id)),
                Err(e) => {
                    warn!(subdomain, error = %e, "Cannot decode registry record");
                    Ok(None)
                }
            },
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn require_container_id(&self, subdomain: &str) -> Result<String> {
        self.current_container_id(subdomain)
            .await?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OrchestratorError::NotFound(format!("subdomain={} is not found", subdomain)))
    }
}

/// Releases a per-subdomain lock and drops its map entry once nobody else
/// holds or waits for it
struct SubdomainGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    subdomain: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubdomainGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold their own clone, so a count of one means only the map is left
        self.locks
            .remove_if(&self.subdomain, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// `ENV=value` for every configured parameter present with a non-empty
/// value, followed by `SUBDOMAIN=<subdomain>`
pub fn build_env(
    parameters: &[Parameter],
    option: &HashMap<String, String>,
    subdomain: &str,
) -> Vec<String> {
    let mut env: Vec<String> = parameters
        .iter()
        .filter_map(|param| {
            option
                .get(&param.name)
                .filter(|value| !value.is_empty())
                .map(|value| format!("{}={}", param.env, value))
        })
        .collect();
    env.push(format!("{}={}", SUBDOMAIN_ENV, subdomain));
    env
}

/// Subdomains double as DNS labels
pub fn validate_subdomain(subdomain: &str) -> Result<()> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= MAX_SUBDOMAIN_LEN
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "subdomain '{}' must be 1-63 lowercase letters, digits or '-'",
            subdomain
        )))
    }
}

fn parse_since(since: &str) -> Result<Option<i64>> {
    if since.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(since)
        .map(|t| Some(t.timestamp()))
        .map_err(|e| OrchestratorError::Validation(format!("cannot parse since: {}", e)))
}

fn parse_tail(tail: &str) -> Result<String> {
    match tail {
        "" | "all" => Ok("all".to_string()),
        n if n.parse::<u64>().is_ok() => Ok(n.to_string()),
        other => Err(OrchestratorError::Validation(format!(
            "tail must be a line count or 'all', got '{}'",
            other
        ))),
    }
}

/// Reassembles lines from arbitrarily chunked output. A trailing `\r` is
/// dropped from each line; a final unterminated line is kept if non-empty.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
    lines: Vec<String>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn emit(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        self.lines.push(String::from_utf8_lossy(raw).into_owned());
    }

    fn finish(mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest);
        }
        self.lines
    }
}
