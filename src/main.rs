use dropgate::admission::Admission;
use dropgate::config::Config;
use dropgate::context::{provider_from_config, Context, Timings};
use dropgate::control::{ControlClient, ControlServer};
use dropgate::fleet::{Fleet, ReloadOutcome};
use dropgate::gateway::{Gateway, GatewayConfig, Listener};
use dropgate::lifecycle::Orchestrator;
use dropgate::monitor::Monitor;
use dropgate::probe::{ProbeConfig, StatusProbe};
use dropgate::tracker::ConnectionTracker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dropgate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timings = Timings::from(&config.timings);
    let cipher = config.cipher()?;

    // Bind failures are fatal
    let control_addr = format!("{}:{}", config.bind, config.control_port);
    let control_listener = TcpListener::bind(&control_addr).await.map_err(|e| {
        error!(addr = %control_addr, error = %e, "Failed to bind control channel");
        anyhow::anyhow!("Failed to bind control channel on {}: {}", control_addr, e)
    })?;
    let gateway_addr = format!("{}:{}", config.bind, config.listen_port);
    let gateway_listener = TcpListener::bind(&gateway_addr).await.map_err(|e| {
        error!(addr = %gateway_addr, error = %e, "Failed to bind game listener");
        anyhow::anyhow!("Failed to bind game listener on {}: {}", gateway_addr, e)
    })?;

    let fleet = Arc::new(Fleet::new(&config.servers));
    let tracker = Arc::new(ConnectionTracker::new(Arc::clone(&fleet)));
    let gateway = Gateway::new(
        tracker.clone(),
        GatewayConfig {
            read_timeout: timings.socket_deadline,
            connect_timeout: timings.socket_deadline,
        },
    );

    let ctx = Context::new(
        Arc::clone(&fleet),
        provider_from_config(&config)?,
        ControlClient::new(
            cipher.clone(),
            config.control_port,
            timings.socket_deadline,
            timings.retry_backoff,
        ),
        gateway.clone(),
        Arc::new(StatusProbe::new(ProbeConfig {
            port: config.game_port,
            timeout: timings.socket_deadline,
        })),
        timings.clone(),
        config.game_port,
    )
    .with_protected(config.protected_instances.iter().copied());
    let orchestrator = Orchestrator::new(Arc::new(ctx));

    gateway.install_handler(Admission::new(Arc::clone(&orchestrator)));
    fleet.initialize(gateway.as_ref(), config.game_port);

    let gateway_handle = tokio::spawn(Arc::clone(&gateway).serve(gateway_listener, shutdown_rx.clone()));

    let control_server = ControlServer::new(Arc::clone(&orchestrator), cipher);
    let control_handle = tokio::spawn(control_server.serve(control_listener, shutdown_rx.clone()));

    let monitor = Monitor::new(Arc::clone(&orchestrator));
    let monitor_shutdown_rx = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(monitor_shutdown_rx).await;
    });

    let tracker_orchestrator = Arc::clone(&orchestrator);
    let tracker_interval = timings.tracker_interval;
    let tracker_shutdown_rx = shutdown_rx.clone();
    let tracker_handle = tokio::spawn(async move {
        tracker
            .run(tracker_orchestrator, tracker_interval, tracker_shutdown_rx)
            .await;
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut active = config;

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
                    if let Some(next) = reload_config(&config_path, &active, &fleet, gateway.as_ref()) {
                        active = next;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        let _ = control_handle.await;
        let _ = monitor_handle.await;
        let _ = tracker_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Apply a changed configuration file. Returns the new configuration if it
/// was applied.
#[cfg_attr(not(unix), allow(dead_code))]
fn reload_config(
    path: &Path,
    active: &Config,
    fleet: &Fleet,
    listener: &dyn Listener,
) -> Option<Config> {
    let next = match Config::load(path) {
        Ok(next) => next,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return None;
        }
    };

    let needs_restart = active.restart_required(&next);
    if !needs_restart.is_empty() {
        warn!(settings = ?needs_restart, "Changed settings take effect after a restart");
    }

    match fleet.reload(&next.servers, listener, active.game_port) {
        ReloadOutcome::Applied { updated } => {
            info!(updated = ?updated, "Configuration reloaded successfully");
            Some(next)
        }
        ReloadOutcome::Refused(reason) => {
            warn!(reason = %reason, "Servers cannot be added, removed, reordered or renamed without a restart");
            None
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");

    info!(
        bind = %config.bind,
        listen_port = config.listen_port,
        control_port = config.control_port,
        game_port = config.game_port,
        dry_run = config.dry_run,
        "Network configuration"
    );

    info!(
        monitor_interval_secs = config.timings.monitor_interval_secs,
        transient_interval_secs = config.timings.transient_interval_secs,
        tracker_interval_secs = config.timings.tracker_interval_secs,
        operation_spacing_secs = config.timings.operation_spacing_secs,
        "Timing settings"
    );

    info!(
        server_count = config.servers.len(),
        servers = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Configured servers"
    );
}
