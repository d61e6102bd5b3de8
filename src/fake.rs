//! In-memory [`ContainerEngine`] for tests
//!
//! Mirrors the parts of Docker's behavior the orchestrator relies on: names
//! are unique among existing containers, `list` reports running containers
//! only, and stopping an unknown id fails.

use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerSummary, EngineError, LogsQuery,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub ip_address: String,
    pub running: bool,
    /// (unix timestamp, line)
    pub logs: Vec<(i64, String)>,
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    calls: Vec<String>,
    next: u64,
    fail_create: Option<String>,
    fail_start: bool,
    fail_list: bool,
    fail_stop: HashSet<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine call in order, e.g. `create:app1-c1`, `stop:<id>`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Ids passed to `stop`, in order
    pub fn stop_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("stop:").map(String::from))
            .collect()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.iter().find(|c| c.id == id).cloned()
    }

    /// Drop a container as if removed out of band
    pub fn remove_container(&self, id: &str) {
        self.state.lock().containers.retain(|c| c.id != id);
    }

    /// Mark a stopped container running again
    pub fn revive(&self, id: &str) {
        if let Some(c) = self.state.lock().containers.iter_mut().find(|c| c.id == id) {
            c.running = true;
        }
    }

    pub fn push_log(&self, id: &str, timestamp: i64, line: &str) {
        if let Some(c) = self.state.lock().containers.iter_mut().find(|c| c.id == id) {
            c.logs.push((timestamp, line.to_string()));
        }
    }

    pub fn fail_create(&self, message: &str) {
        self.state.lock().fail_create = Some(message.to_string());
    }

    pub fn fail_start(&self) {
        self.state.lock().fail_start = true;
    }

    pub fn fail_list(&self) {
        self.state.lock().fail_list = true;
    }

    pub fn fail_stop(&self, id: &str) {
        self.state.lock().fail_stop.insert(id.to_string());
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(format!("create:{}", spec.name));
        let mut state = self.state.lock();

        if let Some(ref message) = state.fail_create {
            return Err(EngineError::call("create", &spec.name, message));
        }
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::call("create", &spec.name, "container name already in use"));
        }

        state.next += 1;
        let n = state.next;
        let id = format!("{:016x}", n * 0x9e37_79b9).repeat(4);
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            ip_address: format!("172.17.0.{}", n + 1),
            running: false,
            logs: Vec::new(),
        });
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("start:{}", id));
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(EngineError::call("start", id, "OCI runtime create failed"));
        }
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::call("start", id, "no such container"))?;
        container.running = true;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        self.record(format!("inspect:{}", id));
        let state = self.state.lock();
        let container = state
            .containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::call("inspect", id, "no such container"))?;
        Ok(ContainerDetails {
            id: container.id.clone(),
            ip_address: container.ip_address.clone(),
            created: Utc.timestamp_opt(1_714_564_800, 0).single().unwrap_or_default(),
        })
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.record(format!("stop:{}", id));
        let mut state = self.state.lock();
        if state.fail_stop.contains(id) {
            return Err(EngineError::call("stop", id, "daemon timeout"));
        }
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::call("stop", id, "no such container"))?;
        container.running = false;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record("list".to_string());
        let state = self.state.lock();
        if state.fail_list {
            return Err(EngineError::call("list", "*", "connection refused"));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| c.running)
            .map(|c| ContainerSummary { id: c.id.clone() })
            .collect())
    }

    fn logs(&self, id: &str, query: &LogsQuery) -> BoxStream<'static, Result<Bytes, EngineError>> {
        self.record(format!("logs:{}", id));
        let state = self.state.lock();
        let Some(container) = state.containers.iter().find(|c| c.id == id) else {
            let err = EngineError::call("read logs of", id, "no such container");
            return futures::stream::once(async move { Err(err) }).boxed();
        };

        let mut lines: Vec<&str> = container
            .logs
            .iter()
            .filter(|(ts, _)| query.since.map_or(true, |since| *ts >= since))
            .map(|(_, line)| line.as_str())
            .collect();
        if let Ok(tail) = query.tail.parse::<usize>() {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }

        // Chunk boundaries deliberately ignore line boundaries
        let joined: Vec<u8> = lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect();
        let chunks: Vec<Result<Bytes, EngineError>> = joined
            .chunks(5)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }
}
