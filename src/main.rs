//! crank-controller: the per-node supervisory process for the crank worker mesh.
//!
//! Startup order matters: logging comes up first so every later failure is
//! observable, then configuration, then the recovery log replay that warms the
//! registry, then the mTLS listener. A failure at any required step is a startup
//! failure, not a degraded-mode fallback.

mod capability;
mod config;
mod error;
mod http;
mod identity;
mod recovery_log;
mod registry;
mod reaper;
mod routing;
mod tls;
mod trace_context;
mod worker;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Config;
use recovery_log::RecoveryLog;
use registry::CapabilityRegistry;

fn init_logging(otlp_provider: Option<&opentelemetry_sdk::trace::TracerProvider>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crank_controller=info,tower_http=info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let otel_layer = otlp_provider.map(|provider| {
        let tracer = opentelemetry::trace::TracerProvider::tracer(provider, "crank-controller");
        tracing_opentelemetry::layer().with_tracer(tracer).boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration must resolve before the tracer pipeline does, since OTLP
    // init needs `otlp_endpoint` — but we still want a log line if config fails,
    // so bring up a bare console subscriber first and only add OTLP once we know
    // whether it's configured.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            init_logging(None);
            error!("startup failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let otlp_provider = match trace_context::init_span_exporter(config.otlp_endpoint.as_deref()) {
        Ok(provider) => provider,
        Err(e) => {
            init_logging(None);
            error!("failed to initialize span exporter: {}", e);
            return ExitCode::from(1);
        }
    };
    init_logging(otlp_provider.as_ref());

    info!(
        https_port = config.https_port,
        state_dir = %config.state_dir.display(),
        "starting crank-controller"
    );

    let tls_config = match tls::build_server_config(&config.ca_cert_path, &config.cert_path, &config.key_path) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to build TLS configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    let replayed = match RecoveryLog::replay(&config.state_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("failed to replay recovery log: {}", e);
            return ExitCode::from(1);
        }
    };

    let log = match RecoveryLog::open(&config.state_dir) {
        Ok(log) => Some(log),
        Err(e) => {
            error!("failed to open recovery log for writing: {}", e);
            return ExitCode::from(1);
        }
    };

    let registry = Arc::new(CapabilityRegistry::new(config.stale_timeout_seconds, log));
    registry.load_from_replay(replayed);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_handle = reaper::spawn(registry.clone(), config.reap_interval_seconds, shutdown_rx.clone());

    let router = http::build_router(http::AppState {
        registry: registry.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.https_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, "failed to bind HTTPS listener: {}", e);
            return ExitCode::from(1);
        }
    };

    let serve_result = tokio::select! {
        result = http::serve(router, listener, tls_config, shutdown_rx) => result,
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    info!("shutting down: stopping reaper and flushing recovery log");
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;

    if let Err(e) = registry.checkpoint(&config.state_dir) {
        error!("failed to checkpoint recovery log on shutdown: {}", e);
    }

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("HTTPS listener exited with an error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
