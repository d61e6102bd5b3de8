//! Subdomain route table and request forwarding to bound containers
//!
//! The orchestrator is the only writer of the table; the dispatcher reads it
//! for every proxied request. Bindings are not persisted here; the registry
//! is the durable copy and [`crate::orchestrator::Orchestrator::restore_routes`]
//! rebuilds the table on startup.

use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Binds subdomains to backend addresses
pub trait RouteTable: Send + Sync {
    fn add_subdomain(&self, subdomain: &str, address: &str);

    fn remove_subdomain(&self, subdomain: &str);
}

/// Error forwarding a request to a backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// In-memory route table that also forwards requests to bound containers
pub struct ReverseProxy {
    routes: DashMap<String, String>,
    client: Client<HttpConnector, Incoming>,
    forwarded: AtomicU64,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            routes: DashMap::new(),
            client,
            forwarded: AtomicU64::new(0),
        }
    }

    /// Address currently bound to `subdomain`
    pub fn lookup(&self, subdomain: &str) -> Option<String> {
        self.routes.get(subdomain).map(|entry| entry.value().clone())
    }

    /// Snapshot of all bindings, sorted by subdomain
    pub fn bindings(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort();
        all
    }

    pub fn forwarded_requests(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Forward `req` to `address:port`, rewriting the URI and setting the
    /// X-Forwarded-* headers. Client-supplied forwarding headers are overwritten.
    ///
    /// Upgrade requests (e.g. WebSocket) are passed on as-is; when the backend
    /// switches protocols, both connections are spliced together.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        address: &str,
        port: u16,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = format!(
            "http://{}:{}{}",
            address,
            port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let client_upgrade = is_upgrade_request(&req).then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
            if let Ok(value) = HeaderValue::from_str(request_id) {
                headers.insert(X_REQUEST_ID, value);
            }
            if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
            if let Some(host) = headers.get(hyper::header::HOST).cloned() {
                headers.insert(X_FORWARDED_HOST, host);
            }
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(%uri, request_id, "Forwarding request");

        let mut response = self.client.request(backend_req).await?;

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let request_id = request_id.to_string();
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, backend_upgrade) {
                        Ok((client, backend)) => {
                            let mut client = TokioIo::new(client);
                            let mut backend = TokioIo::new(backend);
                            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                                Ok((sent, received)) => {
                                    debug!(request_id = %request_id, sent, received, "Upgraded connection closed")
                                }
                                Err(e) => debug!(request_id = %request_id, error = %e, "Upgraded connection error"),
                            }
                        }
                        Err(e) => warn!(request_id = %request_id, error = %e, "Failed to upgrade connection"),
                    }
                });
            }
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `Connection: upgrade` together with an `Upgrade` header
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

impl RouteTable for ReverseProxy {
    fn add_subdomain(&self, subdomain: &str, address: &str) {
        let previous = self.routes.insert(subdomain.to_string(), address.to_string());
        info!(subdomain, address, previous = ?previous, "Route bound");
    }

    fn remove_subdomain(&self, subdomain: &str) {
        if self.routes.remove(subdomain).is_some() {
            info!(subdomain, "Route removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let proxy = ReverseProxy::new();
        proxy.add_subdomain("app1", "172.17.0.2");
        proxy.add_subdomain("app2", "172.17.0.3");
        assert_eq!(proxy.lookup("app1").as_deref(), Some("172.17.0.2"));

        proxy.remove_subdomain("app1");
        assert_eq!(proxy.lookup("app1"), None);
        assert_eq!(
            proxy.bindings(),
            vec![("app2".to_string(), "172.17.0.3".to_string())]
        );

        // Removing an unbound subdomain is a no-op
        proxy.remove_subdomain("app1");
        assert_eq!(proxy.forwarded_requests(), 0);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder().header("Connection", "upgrade").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_rebind_replaces_address() {
        let proxy = ReverseProxy::new();
        proxy.add_subdomain("app1", "172.17.0.2");
        proxy.add_subdomain("app1", "172.17.0.9");
        assert_eq!(proxy.lookup("app1").as_deref(), Some("172.17.0.9"));
        assert_eq!(proxy.bindings().len(), 1);
    }
}
