use egressgate::admin::{AdminServer, PKG_NAME, VERSION};
use egressgate::config::{Config, ProviderType};
use egressgate::controller::PoolController;
use egressgate::docker::DockerProvider;
use egressgate::provider::ResourceProvider;
use egressgate::simulated::SimulatedProvider;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("egressgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("egressgate.toml"));

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

    let provider: Arc<dyn ResourceProvider> = match config.provider.provider_type {
        ProviderType::Simulated => {
            warn!("Using the simulated provider, endpoints are not real proxies");
            Arc::new(SimulatedProvider::new(
                config.provider.proxy_port,
                config.provider.ready_after_polls,
            ))
        }
        ProviderType::Docker => Arc::new(DockerProvider::new(&config.provider).await?),
    };

    let controller = PoolController::new(provider, config.pool.clone());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&controller), shutdown_rx, admin_token);

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Stop accepting admin requests before tearing the pool down
    let _ = shutdown_tx.send(true);

    info!("Tearing down all resources...");
    let teardown = controller.teardown_all();
    tokio::pin!(teardown);
    loop {
        tokio::select! {
            _ = &mut teardown => break,
            _ = wait_for_shutdown_signal() => {
                warn!("Second shutdown signal received, interrupting teardown waits");
                controller.interrupt();
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
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
    info!(name = PKG_NAME, version = VERSION, "Starting egress pool controller");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Admin API configuration"
    );
    info!(
        provider = ?config.provider.provider_type,
        image = ?config.provider.image,
        network = %config.provider.network,
        proxy_port = config.provider.proxy_port,
        "Provider settings"
    );
    info!(
        target_pool_size = config.pool.target_pool_size,
        ttl_secs = config.pool.ttl_secs,
        readiness_settle_secs = config.pool.readiness_settle_secs,
        termination_settle_secs = config.pool.termination_settle_secs,
        "Pool settings"
    );
    info!(
        readiness_poll_interval_ms = config.pool.readiness_poll_interval_ms,
        readiness_max_attempts = config.pool.readiness_max_attempts,
        provider_retries = config.pool.provider_retries,
        "Provisioning settings"
    );
}
