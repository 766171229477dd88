//! Interceptor Proxy - Entry Point
//!
//! Starts the proxy server and the connection registry reporter with
//! graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use interceptor::config::{Config, LogConfig};
use interceptor::error;
use interceptor::proxy::dialer::{Balancer, Detour, DialStrategy};
use interceptor::proxy::registry::{ConnectionRegistry, RegistryKind};
use interceptor::proxy::reporter::{RegistryReporter, RegistryReporterConfig, RegistryReporterHandle};
use interceptor::proxy::{
    DirectBalancer, EgressDetour, Interceptor, ProxyHandler, ProxyServer, UpstreamForwarder,
};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    init_tracing(&config.log);
    info!("Starting Interceptor Proxy");
    info!("Configuration loaded");

    // Connection registries
    let client_conns = ConnectionRegistry::new(RegistryKind::Client);
    let server_conns = ConnectionRegistry::new(RegistryKind::Server);

    // Start registry reporter
    let (reporter_handle, reporter_shutdown) = RegistryReporterHandle::new();
    let reporter = RegistryReporter::new(
        vec![client_conns.clone(), server_conns.clone()],
        RegistryReporterConfig::from(&config.registry),
    );
    let reporter_task = tokio::spawn(async move {
        reporter.run(reporter_shutdown).await;
    });

    // Dialing: direct balancer, optionally detoured through an egress proxy
    let balancer: Arc<dyn Balancer> =
        Arc::new(DirectBalancer::new(config.proxy.connect_timeout()));
    let detour: Option<Arc<dyn Detour>> = config.proxy.detour_egress.clone().map(|egress| {
        info!(
            "Detour enabled through egress proxy {}:{}",
            egress.host, egress.port
        );
        Arc::new(EgressDetour::new(egress, config.proxy.connect_timeout())) as Arc<dyn Detour>
    });
    let force_direct = config.force_direct();
    if force_direct && detour.is_some() {
        warn!(
            "Detour configured but disabled (platform: {}, proxy all: {})",
            config.proxy.platform, config.proxy.proxy_all
        );
    }
    let strategy = DialStrategy::new(detour, force_direct);

    let interceptor = Interceptor::new(
        balancer.clone(),
        strategy.clone(),
        config.proxy.min_qos,
        client_conns,
        server_conns,
    );
    let forwarder = UpstreamForwarder::new(
        balancer,
        strategy,
        config.proxy.min_qos,
        config.proxy.request_timeout(),
    );
    let handler = Arc::new(ProxyHandler::new(
        Arc::new(interceptor),
        Arc::new(forwarder),
    ));

    // Create shutdown channel and start the proxy server
    let (shutdown_tx, proxy_shutdown) = watch::channel(false);
    let proxy_server = ProxyServer::new(config.proxy.clone(), handler);
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Server started - Proxy: {}", config.proxy_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Open tunnels are not drained
    let _ = shutdown_tx.send(true);
    reporter_handle.shutdown();

    let _ = tokio::join!(proxy_task, reporter_task);

    info!("Interceptor Proxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("interceptor={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
