use crate::bridge::{CreateRequest, EventBridge};
use crate::error::OrchestratorError;
use crate::pool::PoolStats;
use crate::registry::validate_app_id;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Room for the JSON envelope around the submitted content
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: &OrchestratorError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    json_response(err.status_code(), body.to_string())
}

fn bad_request(message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "code": "INVALID_REQUEST",
        "message": message.to_string(),
    });
    json_response(StatusCode::BAD_REQUEST, body.to_string())
}

struct AdminState {
    bridge: Arc<EventBridge>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
    max_body_bytes: usize,
}

/// Loopback operator API
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        bridge: Arc<EventBridge>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        let max_body_bytes = bridge.supervisor().config().max_content_bytes + BODY_OVERHEAD_BYTES;
        Self {
            bind_addr,
            state: Arc::new(AdminState {
                bridge,
                pool_stats,
                auth_token,
                max_body_bytes,
            }),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Read a request body, refusing anything over `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            warn!(error = %e, limit, "Rejected admin request body");
            Err(response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExtendBody {
    lease_secs: Option<u64>,
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Public endpoints
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let supervisor = state.bridge.supervisor();
    let instance_path = path.strip_prefix("/instances/");

    let response = match (&method, path.as_str()) {
        // List instances: GET /instances
        (&Method::GET, "/instances") => {
            let instances = supervisor.registry().list();
            let response_body = serde_json::json!({
                "count": instances.len(),
                "instances": instances,
                "ports": {
                    "leased": supervisor.ports().leased_count(),
                    "capacity": supervisor.ports().capacity(),
                },
            });
            json_response(StatusCode::OK, response_body.to_string())
        }

        // Create an instance: POST /instances
        (&Method::POST, "/instances") => {
            let body = match read_body(req.into_body(), state.max_body_bytes).await {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            match serde_json::from_slice::<CreateRequest>(&body) {
                Err(e) => bad_request(format!("invalid creation request: {}", e)),
                Ok(request) => match state.bridge.handle_create(request).await {
                    Ok(notice) => match serde_json::to_string(&notice) {
                        Ok(json) => json_response(StatusCode::CREATED, json),
                        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    },
                    Err(e) => error_response(&e),
                },
            }
        }

        // Extend a lease: POST /instances/{id}/extend
        (&Method::POST, _) if instance_path.is_some_and(|p| p.ends_with("/extend")) => {
            let id = instance_path
                .and_then(|p| p.strip_suffix("/extend"))
                .unwrap_or_default()
                .to_string();
            let body = match read_body(req.into_body(), BODY_OVERHEAD_BYTES).await {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            let extend: ExtendBody = if body.is_empty() {
                ExtendBody::default()
            } else {
                match serde_json::from_slice(&body) {
                    Ok(extend) => extend,
                    Err(e) => return Ok(bad_request(format!("invalid extend request: {}", e))),
                }
            };

            let until = extend.lease_secs.and_then(|secs| {
                let secs = i64::try_from(secs).ok()?;
                Utc::now().checked_add_signed(chrono::Duration::try_seconds(secs)?)
            });
            match supervisor.extend(&id, until) {
                Ok(record) => {
                    let response_body = serde_json::json!({
                        "id": record.id,
                        "expiresAt": record.expires_at,
                    });
                    json_response(StatusCode::OK, response_body.to_string())
                }
                Err(e) => error_response(&e),
            }
        }

        // Stop an instance: DELETE /instances/{id}
        (&Method::DELETE, _) if instance_path.is_some() => {
            let id = instance_path.unwrap_or_default();
            if let Err(e) = validate_app_id(id) {
                error_response(&e)
            } else {
                match supervisor.stop(id).await {
                    Ok(()) => {
                        info!(app_id = id, "Instance stopped via admin API");
                        response(StatusCode::NO_CONTENT, Bytes::new())
                    }
                    Err(e) => error_response(&e),
                }
            }
        }

        // Proxy and instance counters: GET /stats
        (&Method::GET, "/stats") => {
            let response_body = serde_json::json!({
                "total_requests": state.pool_stats.get_total_requests(),
                "failed_requests": state.pool_stats.get_failed_requests(),
                "active_instances": supervisor.registry().active_count(),
                "running_backends": supervisor.running_backends(),
            });
            json_response(StatusCode::OK, response_body.to_string())
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::{BusConfig, InstanceConfig, ServerConfig};
    use crate::ports::PortAllocator;
    use crate::registry::Registry;
    use crate::supervisor::Supervisor;

    const TOKEN: &str = "test-token";

    fn create_test_state(max_concurrent: usize) -> Arc<AdminState> {
        let start = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = InstanceConfig {
            max_concurrent,
            drain_grace_secs: 1,
            ..InstanceConfig::default()
        };
        let supervisor = Supervisor::new(
            Arc::new(Registry::new()),
            Arc::new(PortAllocator::new(start, 4)),
            config,
            3,
        );
        let bridge = EventBridge::new(
            supervisor,
            Arc::new(LocalBus::new()),
            BusConfig::default(),
            ServerConfig::default(),
        );
        Arc::new(AdminState {
            bridge,
            pool_stats: Arc::new(PoolStats::default()),
            auth_token: TOKEN.to_string(),
            max_body_bytes: 1024 * 1024,
        })
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn send(state: &Arc<AdminState>, req: Request<Full<Bytes>>) -> (StatusCode, String) {
        let response = handle_admin_request(req, Arc::clone(state)).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_public_endpoints() {
        let state = create_test_state(5);
        let unauthenticated = |path: &str| {
            Request::builder()
                .uri(path)
                .body(Full::new(Bytes::new()))
                .unwrap()
        };

        let (status, body) = send(&state, unauthenticated("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = send(&state, unauthenticated("/version")).await;
        assert_eq!(status, StatusCode::OK);
        let version: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(version["name"], PKG_NAME);

        let (status, _) = send(&state, unauthenticated("/instances")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_check_auth() {
        let req = request(Method::GET, "/instances", "");
        assert!(check_auth(&req, TOKEN));
        assert!(!check_auth(&req, "other"));

        let raw = Request::builder()
            .header(AUTHORIZATION, TOKEN)
            .body(())
            .unwrap();
        assert!(check_auth(&raw, TOKEN));
    }

    #[tokio::test]
    async fn test_create_list_and_stop() {
        let state = create_test_state(5);

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/instances",
                r#"{"id":"app_1","content":{"markup":"<h1>Hi</h1>"}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let notice: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(notice["status"], "Live");
        assert_eq!(notice["url"], "http://localhost:3000/preview/app_1/");

        let (status, body) = send(&state, request(Method::GET, "/instances", "")).await;
        assert_eq!(status, StatusCode::OK);
        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(list["count"], 1);
        assert_eq!(list["instances"][0]["id"], "app_1");
        assert_eq!(list["instances"][0]["status"], "Live");
        assert_eq!(list["ports"]["leased"], 1);

        let (status, _) = send(
            &state,
            request(
                Method::POST,
                "/instances",
                r#"{"id":"app_1","content":{"markup":"again"}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&state, request(Method::DELETE, "/instances/app_1", "")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.bridge.supervisor().registry().is_empty());
    }

    #[tokio::test]
    async fn test_create_errors_map_to_statuses() {
        let state = create_test_state(1);

        let (status, _) = send(&state, request(Method::POST, "/instances", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &state,
            request(Method::POST, "/instances", r#"{"id":"a b","content":{}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("INVALID_ID"));

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/instances",
                r#"{"id":"bad","content":{"backendRoutes":[{"path":"x"}]}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("CONTENT_ERROR"));

        let (status, _) = send(
            &state,
            request(Method::POST, "/instances", r#"{"id":"first","content":{}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &state,
            request(Method::POST, "/instances", r#"{"id":"second","content":{}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("CAPACITY_EXCEEDED"));

        state.bridge.supervisor().stop_all().await;
    }

    #[tokio::test]
    async fn test_body_limit() {
        let mut state = create_test_state(5);
        Arc::get_mut(&mut state).unwrap().max_body_bytes = 16;

        let (status, _) = send(
            &state,
            request(
                Method::POST,
                "/instances",
                r#"{"id":"app_1","content":{"markup":"far too long for the limit"}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_extend_and_stats() {
        let state = create_test_state(5);

        let (status, _) = send(&state, request(Method::POST, "/instances/missing/extend", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state
            .bridge
            .supervisor()
            .create("app_1", &Default::default())
            .await
            .unwrap();

        let (status, body) = send(
            &state,
            request(Method::POST, "/instances/app_1/extend", r#"{"lease_secs":7200}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let extended: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(extended["id"], "app_1");
        let expires_at = state.bridge.supervisor().registry().get("app_1").unwrap().expires_at;
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(119));

        state.pool_stats.record_request();
        let (status, body) = send(&state, request(Method::GET, "/stats", "")).await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["total_requests"], 1);
        assert_eq!(stats["active_instances"], 1);
        assert_eq!(stats["running_backends"], 1);

        let (status, _) = send(&state, request(Method::GET, "/nope", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.bridge.supervisor().stop_all().await;
    }
}
