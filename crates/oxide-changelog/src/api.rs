//! Request routing for the migration service.
//!
//! [`MigrationApi`] maps a method and request target onto an engine call
//! and turns the [`MigrationResult`] into a status code and JSON body. It
//! binds no socket; a transport hands it the request line and writes back
//! whatever it returns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::MigrationEngine;
use crate::error::MigrateError;
use crate::filter::ChangeFilter;
use crate::result::MigrationResult;

/// Name reported by the health endpoint.
pub const SERVICE_NAME: &str = "oxide-changelog";

const BASE_PATH: &str = "/api/v1/migration";

/// HTTP methods the service distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method
    Get,
    /// POST method
    Post,
}

impl Method {
    /// Parses a method from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }

    /// Returns the method as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    /// Apply pending changesets.
    Run {
        contexts: Option<String>,
        labels: Option<String>,
    },
    /// Roll back the latest `count` changesets. Always positive.
    Rollback { count: i64 },
    /// Report pending changesets.
    Status { contexts: Option<String> },
    /// Validate the changelog.
    Validate,
    /// Liveness check.
    Health,
}

impl ApiRequest {
    /// Routes a request line.
    ///
    /// Returns the error response (404, 405 or 400) when the request cannot
    /// reach the engine.
    pub fn parse(method: &str, target: &str) -> Result<Self, ApiResponse> {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, HashMap::new()),
        };

        let Some(action) = path.strip_prefix(BASE_PATH) else {
            return Err(ApiResponse::not_found(path));
        };
        let expected = match action.trim_end_matches('/') {
            "/run" | "/rollback" => Method::Post,
            "/status" | "/validate" | "/health" => Method::Get,
            _ => return Err(ApiResponse::not_found(path)),
        };
        if Method::from_str(method) != Some(expected) {
            return Err(ApiResponse::method_not_allowed(method, path));
        }

        let param = |name: &str| query.get(name).filter(|v| !v.is_empty()).cloned();
        let request = match action.trim_end_matches('/') {
            "/run" => Self::Run {
                contexts: param("contexts"),
                labels: param("labels"),
            },
            "/rollback" => {
                let count = param("count")
                    .and_then(|c| c.trim().parse::<i64>().ok())
                    .filter(|c| *c >= 1)
                    .ok_or_else(|| ApiResponse::bad_request("Count must be a positive integer"))?;
                Self::Rollback { count }
            }
            "/status" => Self::Status {
                contexts: param("contexts"),
            },
            "/validate" => Self::Validate,
            _ => Self::Health,
        };
        Ok(request)
    }
}

/// Status code and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl ApiResponse {
    /// Converts an engine result: 200 on success, 500 otherwise.
    pub fn from_result(result: &MigrationResult) -> Self {
        let status = if result.is_success() { 200 } else { 500 };
        match serde_json::to_value(result) {
            Ok(body) => Self { status, body },
            Err(err) => Self::failed(500, MigrateError::from(err).to_string()),
        }
    }

    /// Creates a 400 Bad Request response.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::failed(400, message)
    }

    /// Creates a 404 Not Found response.
    pub fn not_found(path: &str) -> Self {
        Self::failed(404, format!("No route for {path}"))
    }

    /// Creates a 405 Method Not Allowed response.
    pub fn method_not_allowed(method: &str, path: &str) -> Self {
        Self::failed(405, format!("Method {method} not allowed for {path}"))
    }

    fn failed(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({
                "status": "FAILED",
                "message": message.into(),
                "timestamp": Utc::now().timestamp_millis(),
            }),
        }
    }

    /// Returns true for a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Serves migration requests against one changelog.
#[derive(Clone)]
pub struct MigrationApi {
    engine: Arc<MigrationEngine>,
    changelog: PathBuf,
}

impl MigrationApi {
    /// Creates an API over an engine and the changelog it migrates.
    pub fn new(engine: Arc<MigrationEngine>, changelog: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            changelog: changelog.into(),
        }
    }

    /// Returns the engine.
    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    /// Routes and serves a request.
    pub async fn handle(&self, method: &str, target: &str) -> ApiResponse {
        debug!(method, target, "Handling request");
        match ApiRequest::parse(method, target) {
            Ok(request) => self.dispatch(request).await,
            Err(response) => {
                warn!(method, target, status = response.status, "Rejected request");
                response
            }
        }
    }

    /// Serves an already routed request.
    pub async fn dispatch(&self, request: ApiRequest) -> ApiResponse {
        let changelog = self.changelog.as_path();
        let result = match request {
            ApiRequest::Run { contexts, labels } => {
                let filter = ChangeFilter::parse(contexts.as_deref(), labels.as_deref());
                self.engine.migrate(changelog, &filter).await
            }
            ApiRequest::Rollback { count } => self.engine.rollback(changelog, count).await,
            ApiRequest::Status { contexts } => {
                let filter = ChangeFilter::parse(contexts.as_deref(), None);
                self.engine.status(changelog, &filter).await
            }
            ApiRequest::Validate => self.engine.validate(changelog, &ChangeFilter::all()).await,
            ApiRequest::Health => return health(),
        };
        ApiResponse::from_result(&result)
    }
}

fn health() -> ApiResponse {
    ApiResponse {
        status: 200,
        body: json!({
            "status": "UP",
            "service": SERVICE_NAME,
            "timestamp": Utc::now().timestamp_millis(),
        }),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Decodes `%XX` escapes and `+`. Invalid escapes are kept literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let decoded = s
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
