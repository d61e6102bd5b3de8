//! Control API: HTTP/JSON front for the orchestrator
//!
//! Endpoints:
//! - `GET  /api/list`
//! - `POST /api/launch`     `{"subdomain", "image"?, "name"?, "option"?, <param>?...}`
//! - `POST /api/terminate`  `{"subdomain"}`
//! - `GET  /api/logs?subdomain=&since=&tail=`
//! - `POST /api/purge`
//! - `GET  /health`, `GET /version`

use crate::error::{json_error_response, ErrorCode, OrchestratorError};
use crate::orchestrator::Orchestrator;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Request bodies larger than this are rejected
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Body of `POST /api/launch`
#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    pub subdomain: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub option: HashMap<String, String>,
    /// Parameters may also be given as top-level string fields
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl LaunchRequest {
    /// Launch options: `option` entries win over top-level fields
    pub fn options(&self) -> HashMap<String, String> {
        let mut options: HashMap<String, String> = self
            .extra
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        options.extend(self.option.iter().map(|(k, v)| (k.clone(), v.clone())));
        options
    }

    /// The image to launch, falling back to the configured default
    pub fn image_or<'a>(&'a self, default_image: Option<&'a str>) -> &'a str {
        if self.image.is_empty() {
            default_image.unwrap_or("")
        } else {
            &self.image
        }
    }

    /// The container name, generated when omitted so a replacing launch
    /// never collides with its still-existing predecessor
    pub fn container_name(&self) -> String {
        if self.name.is_empty() {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", self.subdomain, &suffix[..8])
        } else {
            self.name.clone()
        }
    }
}

/// Body of `POST /api/terminate`
#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub subdomain: String,
}

/// Successful API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub result: T,
}

/// Control API handler, shared by every listener
pub struct ControlApi {
    orchestrator: Arc<Orchestrator>,
    default_image: Option<String>,
}

impl ControlApi {
    pub fn new(orchestrator: Arc<Orchestrator>, default_image: Option<String>) -> Self {
        Self {
            orchestrator,
            default_image,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Control API request");

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/health") => return json_response(StatusCode::OK, r#"{"status":"ok"}"#),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
                return json_response(StatusCode::OK, version.to_string());
            }
            (&Method::GET, "/api/list") => self.list().await,
            (&Method::POST, "/api/launch") => self.launch(req).await,
            (&Method::POST, "/api/terminate") => self.terminate(req).await,
            (&Method::GET, "/api/logs") => self.logs(&req).await,
            (&Method::POST, "/api/purge") => self.purge().await,
            _ => return json_error_response(ErrorCode::NotFound, "not found"),
        };

        result.unwrap_or_else(|e| {
            match e {
                OrchestratorError::Engine(_) | OrchestratorError::Persistence(_) => {
                    error!(%method, %path, error = %e, "Control API error")
                }
                _ => debug!(%method, %path, error = %e, "Control API request rejected"),
            }
            e.to_response()
        })
    }

    async fn list(&self) -> ApiResult {
        let records = self.orchestrator.list().await?;
        ok(&records)
    }

    async fn launch(&self, req: Request<Incoming>) -> ApiResult {
        let launch: LaunchRequest = read_json(req).await?;
        let options = launch.options();
        let image = launch.image_or(self.default_image.as_deref());
        let name = launch.container_name();

        info!(subdomain = %launch.subdomain, image, name = %name, "Launch requested");
        let record = self
            .orchestrator
            .launch(&launch.subdomain, image, &name, &options)
            .await?;
        ok(&record)
    }

    async fn terminate(&self, req: Request<Incoming>) -> ApiResult {
        let terminate: TerminateRequest = read_json(req).await?;
        self.orchestrator.terminate(&terminate.subdomain).await?;
        ok(&"ok")
    }

    async fn logs(&self, req: &Request<Incoming>) -> ApiResult {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let field = |name: &str| query.get(name).map(String::as_str).unwrap_or("");

        let subdomain = field("subdomain");
        if subdomain.is_empty() {
            return Err(OrchestratorError::Validation("subdomain is required".to_string()));
        }
        let lines = self
            .orchestrator
            .logs(subdomain, field("since"), field("tail"))
            .await?;
        ok(&lines)
    }

    async fn purge(&self) -> ApiResult {
        let removed = self.orchestrator.prune().await?;
        ok(&removed)
    }
}

type ApiResult = Result<Response<BoxBody<Bytes, hyper::Error>>, OrchestratorError>;

fn ok<T: Serialize>(result: &T) -> ApiResult {
    let body = serde_json::to_string(&ApiResponse { result })
        .map_err(|e| OrchestratorError::Persistence(format!("cannot encode response: {}", e)))?;
    Ok(json_response(StatusCode::OK, body))
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, OrchestratorError> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| OrchestratorError::Validation(format!("cannot read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| OrchestratorError::Validation(format!("invalid JSON: {}", e)))
}

/// Decode an `a=1&b=two` query string; later keys win
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw)
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = parse_query("subdomain=app1&since=2024-05-01T12%3A00%3A00Z&tail=10&flag");
        assert_eq!(q["subdomain"], "app1");
        assert_eq!(q["since"], "2024-05-01T12:00:00Z");
        assert_eq!(q["tail"], "10");
        assert_eq!(q["flag"], "");
        assert!(parse_query("").is_empty());
        assert_eq!(parse_query("msg=a+b")["msg"], "a b");
    }

    #[test]
    fn test_launch_request_options_merge() {
        let req: LaunchRequest = serde_json::from_str(
            r#"{"subdomain":"app1","branch":"top","nick":"n","count":3,"option":{"branch":"main"}}"#,
        )
        .unwrap();

        let options = req.options();
        assert_eq!(options["branch"], "main");
        assert_eq!(options["nick"], "n");
        assert!(!options.contains_key("count"));
    }

    #[test]
    fn test_launch_request_defaults() {
        let req: LaunchRequest = serde_json::from_str(r#"{"subdomain":"app1"}"#).unwrap();
        assert_eq!(req.image_or(Some("base:latest")), "base:latest");
        assert_eq!(req.image_or(None), "");

        let name = req.container_name();
        assert!(name.starts_with("app1-"));
        assert_eq!(name.len(), "app1-".len() + 8);
        assert_ne!(name, req.container_name());

        let req: LaunchRequest =
            serde_json::from_str(r#"{"subdomain":"app1","image":"demo:1","name":"fixed"}"#).unwrap();
        assert_eq!(req.image_or(Some("base:latest")), "demo:1");
        assert_eq!(req.container_name(), "fixed");
    }

    #[test]
    fn test_api_response_shape() {
        let json = serde_json::to_string(&ApiResponse { result: vec!["a", "b"] }).unwrap();
        assert_eq!(json, r#"{"result":["a","b"]}"#);
    }
}
