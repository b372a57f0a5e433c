//! Converge operator
//!
//! Main entry point. Loads configuration, sets up the Kubernetes client and
//! runs the Alert controller next to the metrics server.

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use converge_operator::{
    config::Config,
    controllers::{alert_controller, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting converge operator");

    let config = Config::from_env()?;
    let catalog = config.load_image_catalog()?;
    info!(?config, "Loaded configuration");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_port = config.metrics_port;
    let context = Context::new(client, config, catalog);
    let shutdown = CancellationToken::new();

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let mut controller_handle = tokio::spawn(alert_controller::run(context, shutdown.clone()));

    tokio::select! {
        res = &mut controller_handle => {
            error!("Alert controller exited unexpectedly");
            res??;
            return Ok(());
        }
        res = metrics_handle => {
            match res {
                Ok(Err(e)) => error!("Metrics server failed: {}", e),
                _ => error!("Metrics server exited unexpectedly"),
            }
            metrics::OPERATOR_HEALTH.set(0.0);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, waiting for in-flight reconciles");
        }
    }

    shutdown.cancel();
    controller_handle.await??;

    info!("Converge operator stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,converge_operator=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
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
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
