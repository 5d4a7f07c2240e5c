use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::admin::{AdminServer, PKG_NAME, VERSION};
use wakegate::caddy::{CaddyController, NoopController, ProxyController};
use wakegate::config::Config;
use wakegate::docker::DockerRuntime;
use wakegate::monitor::Monitor;
use wakegate::orchestrator::Orchestrator;
use wakegate::pool::UpstreamPool;
use wakegate::proxy::ProxyServer;
use wakegate::registry::ServiceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = DockerRuntime::connect(
        config.runtime.docker_host.as_deref(),
        &config.runtime.compose_command,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to connect to the container engine");
        e
    })?;

    let edge: Arc<dyn ProxyController> = if config.caddy.enabled {
        info!(admin_url = %config.caddy.admin_url, server = %config.caddy.server_name, "Caddy route sync enabled");
        Arc::new(CaddyController::new(config.caddy_config())?)
    } else {
        warn!("Caddy route sync disabled");
        Arc::new(NoopController)
    };

    let registry = Arc::new(ServiceRegistry::new());
    for service in config.new_services()? {
        let name = service.name.clone();
        registry
            .create(service)
            .map_err(|e| anyhow::anyhow!("Failed to register service '{}': {}", name, e))?;
    }

    let pool = Arc::new(UpstreamPool::new(config.pool_config()));
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&registry),
            Arc::new(runtime),
            edge,
            config.orchestrator_config(),
        )
        .with_health_probe(pool.clone()),
    );

    let adopted = orchestrator.adopt_running().await;
    if !adopted.is_empty() {
        info!(services = ?adopted, "Adopted already running services");
    }

    // Create proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&orchestrator),
        Arc::clone(&pool),
        config.proxy_settings(),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Create admin server (bound to loopback)
    let admin_handle = if config.server.admin_port > 0 {
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

        let admin_server = AdminServer::new(admin_addr, Arc::clone(&orchestrator), shutdown_rx.clone(), admin_token);
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    let monitor_handle = if config.monitor.enabled {
        let monitor = Monitor::new(Arc::clone(&orchestrator), config.monitor_config());
        Some(tokio::spawn(monitor.run(shutdown_rx.clone())))
    } else {
        warn!("Resource monitor disabled, services will not be put to sleep automatically");
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload(&orchestrator, &config_path).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if config.server.stop_services_on_shutdown {
        info!("Stopping all running services...");
        for (service, e) in orchestrator.sleep_all().await {
            warn!(service = %service, error = %e, "Failed to stop service during shutdown");
        }
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn reload(orchestrator: &Arc<Orchestrator>, config_path: &Path) {
    let services = match Config::load(config_path).and_then(|config| config.new_services()) {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    let result = orchestrator.apply_config(services).await;
    info!(
        added = result.added.len(),
        removed = result.removed.len(),
        updated = result.updated.len(),
        deferred = result.deferred.len(),
        errors = result.errors.len(),
        "Configuration reloaded"
    );
    if !result.added.is_empty() {
        info!(services = ?result.added, "New services available");
    }
    if !result.removed.is_empty() {
        info!(services = ?result.removed, "Services removed");
    }
    if !result.deferred.is_empty() {
        info!(services = ?result.deferred, "Changes to running services apply on their next wake");
    }
    for e in &result.errors {
        warn!(error = %e, "Service not reconciled");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        base_domain = ?config.server.base_domain,
        passthrough = ?config.server.passthrough_upstream,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        network = ?config.runtime.network,
        container_prefix = %config.runtime.container_prefix,
        start_timeout_secs = config.runtime.start_timeout_secs,
        stop_timeout_secs = config.runtime.stop_timeout_secs,
        "Runtime settings"
    );
    info!(
        enabled = config.monitor.enabled,
        collect_interval_secs = config.monitor.collect_interval_secs,
        min_samples = config.monitor.min_samples,
        low_utilization_ratio = config.monitor.low_utilization_ratio,
        "Monitor settings"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.services.keys().collect::<Vec<_>>(),
        "Configured services"
    );
}
