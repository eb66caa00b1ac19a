//! Connection pool for backend HTTP connections
//!
//! Preview backends live on loopback ports; the pool keeps idle keep-alive
//! connections to them so repeated asset and API requests skip the handshake.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded through the pool
    pub total_requests: AtomicU64,
    /// Requests that never got a response from the backend
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the backend on `port`, replacing its path and query with
    /// `path_and_query`.
    ///
    /// Method, headers and body are passed through; the response is streamed
    /// back as-is.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .version(hyper::Version::HTTP_11)
            .uri(&uri);

        // Host is left to the client so the backend sees its own address
        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
