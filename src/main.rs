use devgate::api::{PKG_NAME, VERSION};
use devgate::config::Config;
use devgate::daemon::{Daemon, Startup};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let daemon = match Daemon::from_config(config)?.start().await? {
        Startup::Running(daemon) => daemon,
        Startup::AlreadyRunning { pid } => {
            info!(pid, "Another daemon is already running, nothing to do");
            return Ok(());
        }
    };

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

    daemon.shutdown().await;
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting devgate");
    info!(
        host = %config.server.host,
        api_port = config.server.api_port,
        tld = %config.server.tld,
        data_dir = %config.server.data_dir.display(),
        "Server configuration"
    );
    info!(
        port_env = %config.supervisor.port_env,
        shell = %config.supervisor.shell,
        stop_grace_period_secs = config.supervisor.stop_grace_period_secs,
        "Supervisor settings"
    );
    info!(
        enabled = config.proxy.enabled,
        binary = %config.proxy.binary,
        listen_port = config.proxy.listen_port,
        admin = %config.proxy.admin_addr,
        tls = config.proxy.tls,
        "Reverse proxy settings"
    );
}
