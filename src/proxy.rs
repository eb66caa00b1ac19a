use crate::config::ServerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{validate_app_id, InstanceStatus, Registry};
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const HEALTH_PATH: &str = "/health";

/// Routing settings for the public proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// First path segment of preview URLs
    pub route_prefix: String,
    /// Max time to wait for a backend response
    pub request_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            route_prefix: "preview".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ServerConfig> for ProxySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            route_prefix: config.route_prefix.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// The public reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    settings: Arc<ProxySettings>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, registry: Arc<Registry>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self::with_pool_config(
            bind_addr,
            registry,
            shutdown_rx,
            ProxySettings::default(),
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
        settings: ProxySettings,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            registry,
            settings: Arc::new(settings),
            shutdown_rx,
            pool,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            prefix = %self.settings.route_prefix,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let settings = Arc::clone(&self.settings);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, settings, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    registry: Arc<Registry>,
    settings: Arc<ProxySettings>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let settings = Arc::clone(&settings);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, settings, pool, addr).await }
    });

    // Serves both HTTP/1.1 and h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Where a public request goes
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Forward { app_id: String, port: u16, path: String },
    NotReady(String),
    NotFound,
}

/// Split `/<prefix>/<id>[/<rest>]` into the app id and the path to forward.
///
/// A missing rest forwards `/`.
pub fn parse_preview_path<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
    let (id, tail) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, "/"),
    };
    if id.is_empty() {
        return None;
    }
    Some((id, tail))
}

fn route(registry: &Registry, prefix: &str, path: &str, query: Option<&str>) -> Route {
    if path == HEALTH_PATH {
        return Route::Health;
    }

    let Some((app_id, tail)) = parse_preview_path(path, prefix) else {
        return Route::NotFound;
    };
    if validate_app_id(app_id).is_err() {
        return Route::NotFound;
    }

    let Some(record) = registry.get(app_id) else {
        return Route::NotFound;
    };

    match (record.status, record.port) {
        (InstanceStatus::Live, Some(port)) => {
            let path = match query {
                Some(q) => format!("{}?{}", tail, q),
                None => tail.to_string(),
            };
            Route::Forward {
                app_id: record.id,
                port,
                path,
            }
        }
        (InstanceStatus::Creating, _) => Route::NotReady(record.id),
        _ => Route::NotFound,
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    settings: Arc<ProxySettings>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, never appended: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let decision = route(
        &registry,
        &settings.route_prefix,
        req.uri().path(),
        req.uri().query(),
    );

    let (app_id, port, path) = match decision {
        Route::Health => return Ok(health_response(&registry, req.method())),
        Route::NotFound => {
            return Ok(json_error_response(
                ProxyErrorCode::AppNotFound,
                "Preview app not found or expired",
            ));
        }
        Route::NotReady(app_id) => {
            debug!(app_id, request_id, "App still starting");
            return Ok(json_error_response(
                ProxyErrorCode::AppNotReady,
                "Preview app is starting, retry shortly",
            ));
        }
        Route::Forward { app_id, port, path } => (app_id, port, path),
    };

    let request_timeout = settings.request_timeout;
    let result = tokio::time::timeout(request_timeout, pool.send_request(req, port, &path)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            // Details stay in the log
            error!(app_id, port, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                "Failed to connect to preview backend",
            ))
        }
        Err(_) => {
            warn!(
                app_id,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    running_apps: Vec<String>,
    timestamp: String,
}

fn health_response(registry: &Registry, method: &Method) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = HealthBody {
        status: "healthy",
        running_apps: registry.live_ids(),
        timestamp: Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| r#"{"status":"healthy"}"#.to_string());
    let bytes = if method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(json)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(Full::new(bytes).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}
