//! Host-header dispatch across one listener per configured port

use crate::api::ControlApi;
use crate::config::{HostConfig, ListenConfig, PortMap};
use crate::error::{json_error_response, ErrorCode};
use crate::routes::{ReverseProxy, X_REQUEST_ID};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    ControlApi,
    /// A subdomain bound in the route table, and its address
    Backend { subdomain: String, address: String },
    NotFound,
}

pub struct HostDispatcher {
    hosts: HostConfig,
    api: Arc<ControlApi>,
    proxy: Arc<ReverseProxy>,
}

impl HostDispatcher {
    pub fn new(hosts: HostConfig, api: Arc<ControlApi>, proxy: Arc<ReverseProxy>) -> Self {
        Self { hosts, api, proxy }
    }

    /// Resolve a raw Host header value
    pub fn destination(&self, host_header: &str) -> Destination {
        let host = normalize_host(host_header);

        if is_same_host(&self.hosts.webapi, &host) {
            return Destination::ControlApi;
        }

        let suffix = self.hosts.reverse_proxy_suffix.trim().to_lowercase();
        let subdomain = host
            .strip_suffix(suffix.as_str())
            .filter(|s| !suffix.is_empty() && !s.is_empty() && !s.contains('.'));

        match subdomain.and_then(|s| self.proxy.lookup(s).map(|address| (s, address))) {
            Some((subdomain, address)) => Destination::Backend {
                subdomain: subdomain.to_string(),
                address,
            },
            None => Destination::NotFound,
        }
    }

    /// Start one listener per configured port and wait for all of them.
    ///
    /// A listener that fails to bind is logged and skipped; the others keep
    /// serving. Returns an error if every listener stopped before shutdown
    /// was signalled.
    pub async fn run(
        self: Arc<Self>,
        listen: &ListenConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut listeners = JoinSet::new();

        for port_map in listen.http.iter().copied() {
            let addr = format!("{}:{}", listen.foreign_address, port_map.listen_port);
            let dispatcher = Arc::clone(&self);
            let shutdown_rx = shutdown_rx.clone();
            listeners.spawn(async move {
                if let Err(e) = dispatcher.serve_port(&addr, port_map, shutdown_rx).await {
                    error!(addr = %addr, error = %e, "Listener failed");
                }
            });
        }

        while listeners.join_next().await.is_some() {}

        if !*shutdown_rx.borrow() {
            anyhow::bail!("no listener is running");
        }
        info!("All listeners stopped");
        Ok(())
    }

    async fn serve_port(
        self: Arc<Self>,
        addr: &str,
        port_map: PortMap,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("cannot listen on {}: {}", addr, e))?;
        info!(addr, target_port = port_map.target_port, "Listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let dispatcher = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = dispatcher.serve_connection(stream, client_addr, port_map).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(addr, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        client_addr: SocketAddr,
        port_map: PortMap,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = Arc::clone(&self);
            async move {
                Ok::<_, hyper::Error>(dispatcher.handle_request(req, client_addr, port_map).await)
            }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        port_map: PortMap,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let host = request_host(&req).unwrap_or_default();

        match self.destination(&host) {
            Destination::ControlApi => self.api.handle(req).await,
            Destination::Backend { subdomain, address } => {
                let request_id = req
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                match self
                    .proxy
                    .forward(req, &address, port_map.target_port, client_addr, &request_id)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(subdomain = %subdomain, address = %address, port = port_map.target_port, error = %e, "Failed to forward request");
                        json_error_response(ErrorCode::BadGateway, "Failed to connect to backend")
                    }
                }
            }
            Destination::NotFound => {
                debug!(host = %host, listen_port = port_map.listen_port, "No route for host");
                json_error_response(ErrorCode::UnknownHost, "not found")
            }
        }
    }
}

/// Host header, falling back to the URI authority (HTTP/2)
fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().host().map(String::from))
}

/// Lowercase, port stripped
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.to_lowercase()
}

/// Case-insensitive comparison ignoring surrounding spaces
pub fn is_same_host(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEngine;
    use crate::orchestrator::{LaunchSettings, Orchestrator};
    use crate::registry::SqliteRegistry;
    use crate::routes::RouteTable;

    fn dispatcher() -> HostDispatcher {
        let proxy = Arc::new(ReverseProxy::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(FakeEngine::new()),
            Arc::new(SqliteRegistry::open_in_memory().unwrap()),
            proxy.clone(),
            LaunchSettings::default(),
        ));
        let hosts = HostConfig {
            webapi: " API.Example.com ".to_string(),
            reverse_proxy_suffix: ".example.com".to_string(),
        };
        HostDispatcher::new(hosts, Arc::new(ControlApi::new(orchestrator, None)), proxy)
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:8080"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host(" example.com "), "example.com");
    }

    #[test]
    fn test_is_same_host() {
        assert!(is_same_host(" API.example.com", "api.example.com "));
        assert!(!is_same_host("api.example.com", "api.example.org"));
    }

    #[test]
    fn test_control_api_host() {
        let d = dispatcher();
        assert_eq!(d.destination("api.example.com"), Destination::ControlApi);
        assert_eq!(d.destination("API.EXAMPLE.COM:8080"), Destination::ControlApi);
        assert_eq!(d.destination("other.example.org"), Destination::NotFound);
        assert_eq!(d.destination(""), Destination::NotFound);
    }

    #[test]
    fn test_bound_subdomain_routes_to_backend() {
        let d = dispatcher();
        assert_eq!(d.destination("app1.example.com"), Destination::NotFound);

        d.proxy.add_subdomain("app1", "172.17.0.2");
        assert_eq!(
            d.destination("App1.example.com:80"),
            Destination::Backend {
                subdomain: "app1".to_string(),
                address: "172.17.0.2".to_string(),
            }
        );
        // Nested labels and the bare suffix are not subdomains
        assert_eq!(d.destination("x.app1.example.com"), Destination::NotFound);
        assert_eq!(d.destination(".example.com"), Destination::NotFound);
    }
}
