pub mod config;
pub mod error;
pub mod hub;
pub mod logger;
pub mod message;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

use crate::config::HubConfig;
use crate::hub::Hub;
use crate::peer::{NegotiatorFactory, RtcNegotiatorFactory};
use crate::signaling::AppState;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// Binds the configured address and serves until Ctrl+C or SIGTERM.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    let factory = Arc::new(RtcNegotiatorFactory::new(config.ice_server_configs()));
    serve(listener, &config, factory, shutdown_signal()).await
}

/// Serves the hub on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    config: &HubConfig,
    factory: Arc<dyn NegotiatorFactory>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let hub = Hub::spawn(config.write_wait());
    let app = signaling::router(AppState::new(config, hub, factory));

    info!(addr = %listener.local_addr()?, "signaling hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("signaling hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
