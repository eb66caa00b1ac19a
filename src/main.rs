use previewgate::admin::{AdminServer, PKG_NAME, VERSION};
use previewgate::bridge::EventBridge;
use previewgate::bus::{LocalBus, RedisBus, SharedBus};
use previewgate::config::{BusType, Config};
use previewgate::pool::PoolConfig;
use previewgate::ports::PortAllocator;
use previewgate::proxy::{ProxyServer, ProxySettings};
use previewgate::registry::Registry;
use previewgate::supervisor::Supervisor;
use previewgate::sweeper::Sweeper;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: explicit path, then ./config.toml, then defaults
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        default.exists().then_some(default)
    });

    let config = match &config_path {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let config = Config::from_env()?;
            info!("No configuration file, using defaults");
            config
        }
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(Registry::new());
    let ports = Arc::new(PortAllocator::new(config.ports.start, config.ports.size));
    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        Arc::clone(&ports),
        config.instances.clone(),
        config.ports.bind_attempts,
    );

    let bus: SharedBus = match config.bus.bus_type {
        BusType::Local => {
            info!("Using in-process message bus");
            Arc::new(LocalBus::new())
        }
        BusType::Redis => {
            info!(url = %config.bus.url, "Using redis message bus");
            Arc::new(RedisBus::new(&config.bus.url)?)
        }
    };

    let bridge = EventBridge::new(
        Arc::clone(&supervisor),
        Arc::clone(&bus),
        config.bus.clone(),
        config.server.clone(),
    );

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    // Public proxy
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        proxy_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        ProxySettings::from(&config.server),
        pool_config,
    );
    let pool_stats = proxy.pool().stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server (loopback only)
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&bridge),
        pool_stats,
        shutdown_rx.clone(),
        admin_token,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Expiry sweeper
    let sweeper = Sweeper::new(Arc::clone(&supervisor), config.instances.sweep_interval());
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    // Bus consumers
    let bridge_handle = tokio::spawn(Arc::clone(&bridge).run(shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all instances
    info!(instances = registry.len(), "Stopping all instances...");
    supervisor.stop_all().await;

    // Wait for servers and background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        let _ = sweeper_handle.await;
        let _ = bridge_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        public_url = %config.server.public_url,
        route_prefix = %config.server.route_prefix,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        port_start = config.ports.start,
        port_count = config.ports.size,
        bind_attempts = config.ports.bind_attempts,
        "Backend port pool"
    );
    info!(
        lease_secs = config.instances.lease_secs,
        max_concurrent = config.instances.max_concurrent,
        sweep_interval_secs = config.instances.sweep_interval_secs,
        drain_grace_secs = config.instances.drain_grace_secs,
        max_content_bytes = config.instances.max_content_bytes,
        max_routes = config.instances.max_routes,
        "Instance settings"
    );
    info!(
        bus = ?config.bus.bus_type,
        create_topic = %config.bus.create_topic,
        extend_topic = %config.bus.extend_topic,
        ready_topic_prefix = %config.bus.ready_topic_prefix,
        "Message bus settings"
    );
}
