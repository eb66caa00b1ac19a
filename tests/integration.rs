//! Integration tests for Previewgate

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use previewgate::bridge::{EventBridge, Readiness, ReadinessNotice};
use previewgate::bus::{LocalBus, MessageBus};
use previewgate::config::{BusConfig, Config, InstanceConfig, ServerConfig};
use previewgate::pool::PoolConfig;
use previewgate::ports::PortAllocator;
use previewgate::proxy::{ProxyServer, ProxySettings};
use previewgate::registry::{InstanceRecord, InstanceStatus, Registry};
use previewgate::site::AppContent;
use previewgate::supervisor::Supervisor;
use previewgate::sweeper::Sweeper;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// A port that was free a moment ago, used as the start of a backend pool
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send an HTTP request and get the raw response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send a simple HTTP GET request and get the raw response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, None).await
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}

fn has_header(response: &str, name: &str, value: &str) -> bool {
    let head = response.split_once("\r\n\r\n").map(|(head, _)| head).unwrap_or(response);
    head.lines().any(|line| {
        line.split_once(':').is_some_and(|(n, v)| {
            n.trim().eq_ignore_ascii_case(name) && v.trim() == value
        })
    })
}

fn hello() -> AppContent {
    AppContent {
        markup: "<h1>Hi</h1>".to_string(),
        ..AppContent::default()
    }
}

struct TestGateway {
    supervisor: Arc<Supervisor>,
    proxy_port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl TestGateway {
    fn registry(&self) -> &Arc<Registry> {
        self.supervisor.registry()
    }

    async fn shutdown(self) {
        self.supervisor.stop_all().await;
        let _ = self.shutdown_tx.send(true);
    }
}

/// Start a proxy on `proxy_port` in front of a fresh supervisor
async fn start_gateway(proxy_port: u16, pool_start: u16, pool_size: u16) -> TestGateway {
    let instances = InstanceConfig {
        drain_grace_secs: 1,
        ..InstanceConfig::default()
    };
    let registry = Arc::new(Registry::new());
    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        Arc::new(PortAllocator::new(pool_start, pool_size)),
        instances,
        3,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
    let settings = ProxySettings {
        route_prefix: "preview".to_string(),
        request_timeout: Duration::from_secs(2),
    };
    let proxy = ProxyServer::with_pool_config(addr, registry, shutdown_rx, settings, PoolConfig::default());

    tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    assert!(
        wait_for_port(proxy_port, Duration::from_secs(5)).await,
        "proxy did not start on port {}",
        proxy_port
    );

    TestGateway {
        supervisor,
        proxy_port,
        shutdown_tx,
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
public_url = "https://previews.example.com"
admin_port = 9000
admin_token = "secret"

[ports]
start = 30000
size = 100
bind_attempts = 5

[instances]
lease_secs = 900
max_concurrent = 8
sweep_interval_secs = 60
drain_grace_secs = 3
max_routes = 16

[bus]
type = "local"
create_topic = "apps:new"
"#;

    let config: Config = toml::from_str(toml).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
    assert_eq!(config.ports.bind_attempts, 5);
    assert_eq!(config.instances.site_limits().max_routes, 16);
    assert_eq!(config.bus.create_topic, "apps:new");
    assert_eq!(config.bus.extend_topic, "app:extend");
    assert_eq!(
        config.server.preview_url("app_1"),
        "https://previews.example.com/preview/app_1/"
    );
}

// ============================================================================
// Proxy routing
// ============================================================================

#[tokio::test]
async fn test_preview_round_trip() {
    let gateway = start_gateway(18601, free_port(), 4).await;
    gateway.supervisor.create("app_1", &hello()).await.unwrap();

    let response = http_get(gateway.proxy_port, "/preview/app_1/").await.unwrap();
    assert!(status_line(&response).contains("200"), "got {}", response);
    assert!(body_of(&response).contains("<h1>Hi</h1>"));
    assert!(has_header(&response, "content-type", "text/html; charset=utf-8"));

    // Without the trailing slash the root document is served too
    let response = http_get(gateway.proxy_port, "/preview/app_1").await.unwrap();
    assert!(status_line(&response).contains("200"));
    assert!(body_of(&response).contains("<title>Preview App - app_1</title>"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_app_returns_404() {
    let gateway = start_gateway(18602, free_port(), 2).await;

    for path in ["/preview/nope/", "/preview/", "/elsewhere", "/preview/bad%20id/"] {
        let response = http_get(gateway.proxy_port, path).await.unwrap();
        assert!(status_line(&response).contains("404"), "{} gave {}", path, response);
        assert!(has_header(&response, "x-proxy-error", "APP_NOT_FOUND"));
    }

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_creating_app_returns_503() {
    let gateway = start_gateway(18603, free_port(), 2).await;
    let now = Utc::now();
    gateway
        .registry()
        .reserve("pending", now, now + chrono::Duration::minutes(5), 5)
        .unwrap();

    let response = http_get(gateway.proxy_port, "/preview/pending/").await.unwrap();
    assert!(status_line(&response).contains("503"), "got {}", response);
    assert!(has_header(&response, "retry-after", "1"));
    assert!(has_header(&response, "x-proxy-error", "APP_NOT_READY"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    let gateway = start_gateway(18604, free_port(), 2).await;
    let now = Utc::now();
    let mut record = InstanceRecord::creating("orphan", now, now + chrono::Duration::minutes(5));
    record.status = InstanceStatus::Live;
    record.port = Some(free_port());
    gateway.registry().insert(record).unwrap();

    let response = http_get(gateway.proxy_port, "/preview/orphan/").await.unwrap();
    assert!(status_line(&response).contains("502"), "got {}", response);
    assert!(has_header(&response, "x-proxy-error", "BACKEND_UNAVAILABLE"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_declared_routes_are_forwarded() {
    let gateway = start_gateway(18605, free_port(), 4).await;
    let content: AppContent = serde_json::from_value(serde_json::json!({
        "markup": "<form id=\"login\"></form>",
        "script": "fetch('api/login', { method: 'POST' })",
        "backendRoutes": [
            { "method": "POST", "path": "/api/login", "body": { "success": true, "token": "demo_jwt_token_123" } },
            { "path": "/api/ping", "body": "pong" }
        ]
    }))
    .unwrap();
    gateway.supervisor.create("app_api", &content).await.unwrap();

    let response = http_request(
        gateway.proxy_port,
        "POST",
        "/preview/app_api/api/login",
        Some(r#"{"user":"demo"}"#),
    )
    .await
    .unwrap();
    assert!(status_line(&response).contains("200"), "got {}", response);
    let body: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(body["token"], "demo_jwt_token_123");

    let response = http_get(gateway.proxy_port, "/preview/app_api/api/ping?cache=no")
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"));
    assert_eq!(body_of(&response), "pong");

    let response = http_get(gateway.proxy_port, "/preview/app_api/api/missing")
        .await
        .unwrap();
    assert!(status_line(&response).contains("404"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stopped_app_returns_404() {
    let gateway = start_gateway(18606, free_port(), 2).await;
    let port = gateway.supervisor.create("app_1", &hello()).await.unwrap();

    let response = http_get(gateway.proxy_port, "/preview/app_1/").await.unwrap();
    assert!(status_line(&response).contains("200"));

    gateway.supervisor.stop("app_1").await.unwrap();
    assert!(gateway.supervisor.ports().lessee(port).is_none());

    let response = http_get(gateway.proxy_port, "/preview/app_1/").await.unwrap();
    assert!(status_line(&response).contains("404"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_live_apps() {
    let gateway = start_gateway(18607, free_port(), 4).await;
    gateway.supervisor.create("app_b", &hello()).await.unwrap();
    gateway.supervisor.create("app_a", &hello()).await.unwrap();

    let response = http_get(gateway.proxy_port, "/health").await.unwrap();
    assert!(status_line(&response).contains("200"));
    let body: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["runningApps"], serde_json::json!(["app_a", "app_b"]));
    assert!(body["timestamp"].is_string());

    gateway.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_expired_app_is_reclaimed_and_port_reused() {
    let gateway = start_gateway(18608, free_port(), 1).await;
    let expires_at = Utc::now() + chrono::Duration::seconds(1);
    let port = gateway
        .supervisor
        .create_with_expiry("short", &hello(), Some(expires_at))
        .await
        .unwrap();

    let response = http_get(gateway.proxy_port, "/preview/short/").await.unwrap();
    assert!(status_line(&response).contains("200"));

    let sweeper = Sweeper::new(Arc::clone(&gateway.supervisor), Duration::from_secs(300));
    let report = sweeper
        .sweep_once(expires_at + chrono::Duration::seconds(1))
        .await;
    assert_eq!(report.reclaimed, vec!["short"]);

    let response = http_get(gateway.proxy_port, "/preview/short/").await.unwrap();
    assert!(status_line(&response).contains("404"));

    // The single-port pool hands the same port to the next app
    let reused = gateway.supervisor.create("next", &hello()).await.unwrap();
    assert_eq!(reused, port);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creates_are_isolated() {
    let gateway = start_gateway(18609, free_port(), 8).await;

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let supervisor = Arc::clone(&gateway.supervisor);
            tokio::spawn(async move {
                let content = AppContent {
                    markup: format!("<p>app {}</p>", i),
                    ..AppContent::default()
                };
                supervisor.create(&format!("app_{}", i), &content).await
            })
        })
        .collect();

    let mut ports = Vec::new();
    for task in tasks {
        ports.push(task.await.unwrap().unwrap());
    }
    ports.sort();
    ports.dedup();
    assert_eq!(ports.len(), 4);

    for i in 0..4 {
        let response = http_get(gateway.proxy_port, &format!("/preview/app_{}/", i))
            .await
            .unwrap();
        assert!(body_of(&response).contains(&format!("<p>app {}</p>", i)));
    }

    gateway.shutdown().await;
}

// ============================================================================
// Message bus
// ============================================================================

#[tokio::test]
async fn test_bus_creation_end_to_end() {
    let gateway = start_gateway(18610, free_port(), 4).await;
    let bus = Arc::new(LocalBus::new());
    let server_config = ServerConfig {
        public_url: "http://127.0.0.1:18610".to_string(),
        ..ServerConfig::default()
    };
    let bridge = EventBridge::new(
        Arc::clone(&gateway.supervisor),
        bus.clone(),
        BusConfig::default(),
        server_config,
    );

    let (bridge_shutdown_tx, bridge_shutdown_rx) = watch::channel(false);
    let bridge_handle = tokio::spawn(Arc::clone(&bridge).run(bridge_shutdown_rx));

    for _ in 0..100 {
        if bus.subscriber_count("app:create") > 0 && bus.subscriber_count("app:extend") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut ready = bus.subscribe("app:ready:app_bus").await.unwrap();
    bus.publish(
        "app:create",
        r#"{"appId":"app_bus","appData":{"html":"<h1>Hi</h1>","css":"h1{}","js":""}}"#.to_string(),
    )
    .await
    .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), ready.next())
        .await
        .unwrap()
        .unwrap();
    let notice: ReadinessNotice = serde_json::from_str(&payload).unwrap();
    assert_eq!(notice.id, "app_bus");
    assert_eq!(
        notice.outcome,
        Readiness::Live {
            url: "http://127.0.0.1:18610/preview/app_bus/".to_string()
        }
    );

    let response = http_get(gateway.proxy_port, "/preview/app_bus/").await.unwrap();
    assert!(body_of(&response).contains("<h1>Hi</h1>"));

    // Lease extension over the bus
    let until = Utc::now() + chrono::Duration::hours(4);
    bus.publish(
        "app:extend",
        format!(r#"{{"id":"app_bus","expiresAt":{}}}"#, until.timestamp_millis()),
    )
    .await
    .unwrap();

    let mut extended = false;
    for _ in 0..100 {
        let record = gateway.registry().get("app_bus").unwrap();
        if record.expires_at.timestamp_millis() == until.timestamp_millis() {
            extended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(extended);

    // A duplicate request is reported as failed
    bus.publish(
        "app:create",
        r#"{"id":"app_bus","content":{"markup":"again"}}"#.to_string(),
    )
    .await
    .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), ready.next())
        .await
        .unwrap()
        .unwrap();
    let notice: ReadinessNotice = serde_json::from_str(&payload).unwrap();
    assert!(matches!(notice.outcome, Readiness::Failed { .. }));

    let _ = bridge_shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), bridge_handle).await;
    gateway.shutdown().await;
}
