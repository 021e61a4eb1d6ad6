//! Viewer service for Nier Factory Floor Analytics
//!
//! Connects to the vision server, keeps one streaming session per configured
//! camera and logs the alerts and validation notifications it receives.
//!
//! # Architecture
//!
//! ```text
//! Vision Server -> WsConnector -> SessionRegistry -> ConnectionSession -> RasterSurface
//!                                                          |
//!                                                          +-> AlertBus -> alert log
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with VIEWER_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use nier_viewer::config::{LoggingConfig, ViewerConfig};
use nier_viewer::notifications::Notification;
use nier_viewer::transport::notifications_endpoint;
use nier_viewer::{
    AlertBus, AlertSubscription, Connector, NotificationListener, RasterSurface, SessionRegistry,
    WsConnector,
};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state and shared resources.
struct AppState {
    config: ViewerConfig,
    running: Arc<AtomicBool>,
    registry: Option<Arc<SessionRegistry<RasterSurface>>>,
    notifications: Option<Arc<NotificationListener>>,
}

impl AppState {
    fn new(config: ViewerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            registry: None,
            notifications: None,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "nier-viewer",
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.server.base_url,
        cameras = config.server.cameras.len(),
        "Starting viewer service"
    );

    // Validate configuration
    config.validate()?;

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let state = Arc::new(RwLock::new(AppState::new(config)));
    state.read().running.store(true, Ordering::SeqCst);

    run(state).await
}

/// Load configuration.
fn load_config() -> anyhow::Result<ViewerConfig> {
    // Try loading from files first, fall back to environment
    let config = ViewerConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        ViewerConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("nier_viewer={}", level).parse()?)
        .add_directive("tungstenite=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Open the configured camera sessions and run until shutdown.
async fn run(state: Arc<RwLock<AppState>>) -> anyhow::Result<()> {
    let config = state.read().config.clone();

    let connector: Arc<dyn Connector> =
        Arc::new(WsConnector::new(config.server.connection_timeout()));
    let alerts = AlertBus::new();
    let alert_handle = tokio::spawn(log_alerts(alerts.subscribe()));

    let registry = Arc::new(SessionRegistry::new(
        config.server.base_url.clone(),
        connector.clone(),
        alerts,
        config.session_options(),
    ));

    if config.server.cameras.is_empty() {
        warn!("No cameras configured");
    }
    for camera_id in &config.server.cameras {
        registry
            .view(camera_id, RasterSurface::default())
            .with_context(|| format!("Failed to open session for camera {camera_id}"))?;
    }

    // Notification side channel
    let mut notification_handle = None;
    if config.server.notifications {
        let listener = Arc::new(NotificationListener::new(
            notifications_endpoint(&config.server.base_url)?,
            connector.clone(),
            config.session.reconnect_policy(),
            config.session.event_capacity,
        ));
        let rx = listener.subscribe();
        listener.start()?;
        notification_handle = Some(tokio::spawn(log_notifications(rx)));
        state.write().notifications = Some(listener);
    }

    state.write().registry = Some(registry.clone());

    // Spawn the health monitoring task
    let health_handle = tokio::spawn({
        let state = state.clone();
        let interval = config.service.health_interval();
        async move {
            run_health_monitor(state, interval).await;
        }
    });

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    // Trigger shutdown
    state.read().shutdown();
    health_handle.abort();

    if let Some(listener) = state.write().notifications.take() {
        listener.stop();
    }
    if let Some(handle) = notification_handle {
        handle.abort();
    }

    // Log final statistics before the sessions go away
    log_final_stats(&state.read());

    registry.close_all();
    alert_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Log every alert published by any session.
async fn log_alerts(mut subscription: AlertSubscription) {
    while let Some(batch) = subscription.recv().await {
        for alert in batch.alerts.iter() {
            warn!(
                camera_id = %batch.camera_id,
                kind = %alert.kind,
                severity = %alert.severity,
                message = %alert.message,
                "Frame alert"
            );
        }
    }
}

/// Log validation notifications.
async fn log_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                info!(
                    kind = %notification.kind,
                    tag = %notification.tag,
                    message = %notification.message,
                    "Validation notification"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Notification log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run the health monitoring loop.
async fn run_health_monitor(state: Arc<RwLock<AppState>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    while state.read().is_running() {
        ticker.tick().await;

        let registry = state.read().registry.clone();
        let Some(registry) = registry else {
            continue;
        };

        for snapshot in registry.snapshots() {
            info!(
                camera_id = %snapshot.camera_id,
                phase = %snapshot.phase,
                indicator = ?snapshot.indicator,
                latency_ms = snapshot.latency_ms.unwrap_or(0),
                frames_received = snapshot.stats.frames_received,
                frames_rendered = snapshot.stats.frames_rendered,
                frames_dropped = snapshot.stats.frames_dropped,
                decode_errors = snapshot.stats.decode_errors,
                reconnects = snapshot.stats.reconnects,
                "Camera session stats"
            );
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(state: &AppState) {
    info!("=== Final Statistics ===");

    if let Some(registry) = &state.registry {
        for snapshot in registry.snapshots() {
            let stats = snapshot.stats;
            info!(
                camera_id = %snapshot.camera_id,
                frames_received = stats.frames_received,
                frames_rendered = stats.frames_rendered,
                frames_dropped = stats.frames_dropped,
                frames_stale = stats.frames_stale,
                decode_errors = stats.decode_errors,
                render_errors = stats.render_errors,
                alerts_published = stats.alerts_published,
                connect_attempts = stats.connect_attempts,
                reconnects = stats.reconnects,
                "Camera final stats"
            );
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
