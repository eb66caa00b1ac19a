//! Backend sites for preview apps
//!
//! A submission is markup, styling, client script and an optional table of
//! declarative backend routes. The supervisor turns it into a [`BackendSite`]
//! (the composed document plus a canned-response route table) and serves that
//! from a [`BackendServer`] bound to the instance's leased port. Submitted
//! content is only ever served back, never executed by this process.

use crate::error::{OrchestratorError, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, ALLOW, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Content of a submitted app
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppContent {
    #[serde(default, alias = "html")]
    pub markup: String,
    #[serde(default, alias = "css")]
    pub style: String,
    #[serde(default, alias = "js")]
    pub script: String,
    #[serde(default)]
    pub backend_routes: Option<Vec<RouteSpec>>,
}

impl AppContent {
    /// Total size of the submitted text, route bodies included
    pub fn size(&self) -> usize {
        let routes: usize = self
            .backend_routes
            .iter()
            .flatten()
            .map(|r| r.path.len() + r.body.to_string().len())
            .sum();
        self.markup.len() + self.style.len() + self.script.len() + routes
    }
}

/// One declared backend route and the response it always returns
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    #[serde(default = "default_route_method")]
    pub method: String,
    pub path: String,
    #[serde(default = "default_route_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_route_method() -> String {
    "GET".to_string()
}

fn default_route_status() -> u16 {
    200
}

/// Limits applied when building a site
#[derive(Debug, Clone, Copy)]
pub struct SiteLimits {
    pub max_content_bytes: usize,
    pub max_routes: usize,
}

#[derive(Debug, Clone)]
struct CannedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CannedResponse {
    fn from_spec(route: &RouteSpec) -> Result<Self> {
        let status = StatusCode::from_u16(route.status).map_err(|_| {
            OrchestratorError::ContentError(format!(
                "route {}: invalid status {}",
                route.path, route.status
            ))
        })?;

        let mut headers = Vec::with_capacity(route.headers.len() + 1);
        for (name, value) in &route.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                OrchestratorError::ContentError(format!("route {}: invalid header name {:?}", route.path, name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                OrchestratorError::ContentError(format!("route {}: invalid value for header {}", route.path, name))
            })?;
            headers.push((name, value));
        }

        let (body, default_type) = match &route.body {
            serde_json::Value::Null => (Bytes::new(), None),
            serde_json::Value::String(text) => (Bytes::from(text.clone()), Some("text/plain; charset=utf-8")),
            value => (Bytes::from(value.to_string()), Some("application/json")),
        };

        if let Some(content_type) = default_type {
            if !headers.iter().any(|(name, _)| name == CONTENT_TYPE) {
                headers.push((CONTENT_TYPE, HeaderValue::from_static(content_type)));
            }
        }

        Ok(Self { status, headers, body })
    }

    fn to_response(&self, include_body: bool) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(if include_body {
            self.body.clone()
        } else {
            Bytes::new()
        }));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            response.headers_mut().append(name.clone(), value.clone());
        }
        response
    }
}

/// Everything a backend serves for one app
#[derive(Debug)]
pub struct BackendSite {
    document: Bytes,
    /// Declared routes keyed by path, then method
    routes: HashMap<String, Vec<(Method, CannedResponse)>>,
}

impl BackendSite {
    /// Validate `content` and build the site for app `id`
    pub fn build(id: &str, content: &AppContent, limits: SiteLimits) -> Result<Self> {
        let size = content.size();
        if size > limits.max_content_bytes {
            return Err(OrchestratorError::ContentError(format!(
                "content is {} bytes, limit is {}",
                size, limits.max_content_bytes
            )));
        }

        let declared = content.backend_routes.as_deref().unwrap_or_default();
        if declared.len() > limits.max_routes {
            return Err(OrchestratorError::ContentError(format!(
                "{} backend routes declared, limit is {}",
                declared.len(),
                limits.max_routes
            )));
        }

        let mut routes: HashMap<String, Vec<(Method, CannedResponse)>> = HashMap::new();
        for route in declared {
            if !route.path.starts_with('/') || route.path.contains('?') {
                return Err(OrchestratorError::ContentError(format!(
                    "route path {:?} must start with '/' and carry no query",
                    route.path
                )));
            }
            let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                OrchestratorError::ContentError(format!("route {}: invalid method {:?}", route.path, route.method))
            })?;
            if is_document_path(&route.path) && (method == Method::GET || method == Method::HEAD) {
                return Err(OrchestratorError::ContentError(format!(
                    "route {} {} conflicts with the app document",
                    method, route.path
                )));
            }

            let methods = routes.entry(route.path.clone()).or_default();
            if methods.iter().any(|(m, _)| *m == method) {
                return Err(OrchestratorError::ContentError(format!(
                    "route {} {} declared twice",
                    method, route.path
                )));
            }
            methods.push((method, CannedResponse::from_spec(route)?));
        }

        Ok(Self {
            document: Bytes::from(compose_document(id, content)),
            routes,
        })
    }

    /// The composed HTML document
    pub fn document(&self) -> &Bytes {
        &self.document
    }

    /// Number of declared backend routes
    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// Answer a request against the document and the route table
    pub fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if is_document_path(path) && (method == Method::GET || method == Method::HEAD) {
            let body = if method == Method::HEAD {
                Bytes::new()
            } else {
                self.document.clone()
            };
            return Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, HTML_CONTENT_TYPE)
                .header(CACHE_CONTROL, "no-store")
                .body(Full::new(body))
                .expect("valid response with static headers");
        }

        if let Some(methods) = self.routes.get(path) {
            if let Some((_, canned)) = methods.iter().find(|(m, _)| m == method) {
                return canned.to_response(true);
            }
            // HEAD falls back to a declared GET without the body
            if method == Method::HEAD {
                if let Some((_, canned)) = methods.iter().find(|(m, _)| *m == Method::GET) {
                    return canned.to_response(false);
                }
            }

            let mut allowed: Vec<&str> = methods.iter().map(|(m, _)| m.as_str()).collect();
            if is_document_path(path) {
                allowed.extend(["GET", "HEAD"]);
            }
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, allowed.join(", "))
                .body(Full::new(Bytes::new()))
                .expect("valid response with static headers");
        }

        if is_document_path(path) {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, HEAD")
                .body(Full::new(Bytes::new()))
                .expect("valid response with static headers");
        }

        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("valid response with static headers")
    }
}

fn is_document_path(path: &str) -> bool {
    path == "/" || path == "/index.html"
}

/// Inline styling and script into a single HTML document.
///
/// The markup is embedded byte-for-byte.
pub fn compose_document(id: &str, content: &AppContent) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>Preview App - {id}</title>\n<style>{style}</style>\n</head>\n<body>\n\
         {markup}\n<script>{script}</script>\n</body>\n</html>\n",
        id = id,
        style = content.style,
        markup = content.markup,
        script = content.script,
    )
}

/// A running backend server for one app.
///
/// Dropping the handle also stops the server, without waiting for the drain.
pub struct BackendServer {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackendServer {
    /// Serve `site` on an already bound listener
    pub fn start(app_id: &str, port: u16, listener: TcpListener, site: Arc<BackendSite>, drain_grace: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(app_id.to_string(), listener, site, shutdown_rx, drain_grace));
        Self { port, shutdown_tx, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, drain open connections and wait for the server task.
    ///
    /// Returns once the listener is closed and every connection has finished
    /// or been aborted after the drain grace period.
    pub async fn shutdown(self) -> std::result::Result<(), JoinError> {
        let _ = self.shutdown_tx.send(true);
        self.task.await
    }
}

async fn serve(
    app_id: String,
    listener: TcpListener,
    site: Arc<BackendSite>,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let site = Arc::clone(&site);
                        let conn_shutdown = shutdown_rx.clone();
                        let app_id = app_id.clone();
                        connections.spawn(serve_connection(app_id, stream, site, conn_shutdown));
                    }
                    Err(e) => {
                        warn!(app_id, error = %e, "Backend failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                break;
            }
        }
    }

    drop(listener);

    let open = connections.len();
    let drained = tokio::time::timeout(drain_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            app_id,
            remaining = connections.len(),
            grace_secs = drain_grace.as_secs(),
            "Drain grace period exceeded, aborting connections"
        );
        connections.shutdown().await;
    } else if open > 0 {
        debug!(app_id, open, "Backend connections drained");
    }
}

async fn serve_connection(
    app_id: String,
    stream: tokio::net::TcpStream,
    site: Arc<BackendSite>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let site = Arc::clone(&site);
        async move { Ok::<_, Infallible>(site.respond(req.method(), req.uri().path())) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(app_id, error = %e, "Backend connection error");
            }
        }
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!(app_id, error = %e, "Backend connection error during drain");
            }
        }
    }
}
