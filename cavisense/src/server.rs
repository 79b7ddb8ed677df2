use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cavisense_api::{create_push_router, create_router, AppState};
use cavisense_core::Config;
use cavisense_relay::{Broker, SensorRelay, SnapshotStore};

/// Upper bound for in-flight requests and viewer sessions to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP and push channel listeners around one relay
pub struct CavisenseServer {
    config: Arc<Config>,
    relay: Arc<SensorRelay>,
    store: Arc<dyn SnapshotStore>,
    broker: Arc<dyn Broker>,
}

impl CavisenseServer {
    pub fn new(
        config: Arc<Config>,
        relay: Arc<SensorRelay>,
        store: Arc<dyn SnapshotStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            relay,
            store,
            broker,
        }
    }

    /// Start all listeners and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(self.relay.clone(), self.config.clone());

        let http_address = self.config.http_address();
        let mut http_router = create_router(state.clone());

        let mut push_handle = if self.config.push_shares_http_listener() {
            info!("Push channel shares the HTTP listener");
            http_router = http_router.merge(create_push_router(state.clone()));
            None
        } else {
            let push_address = self.config.push_address();
            let router = create_push_router(state.clone());
            Some(Self::serve("Push channel", &push_address, router, shutdown_rx.clone()).await?)
        };

        let mut http_handle = Self::serve("HTTP", &http_address, http_router, shutdown_rx).await?;

        info!("All servers started successfully");

        // Wait for either a listener to stop or a shutdown signal
        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = wait_for(&mut push_handle) => {
                error!("Push channel server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        // Stop accepting requests
        let _ = shutdown_tx.send(true);

        self.shutdown(&state, http_handle, push_handle).await;

        info!("Cavisense relay shut down");
        Ok(())
    }

    /// Drain listeners and viewer sessions, then release the store and broker
    async fn shutdown(
        &self,
        state: &AppState,
        http_handle: JoinHandle<()>,
        push_handle: Option<JoinHandle<()>>,
    ) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

        // 1. Close viewer sessions; their writers flush a Close frame
        self.relay.stop().await;

        state.sessions.close();
        if !state.sessions.is_empty() {
            info!(
                "Waiting up to {}s for {} WebSocket session(s) to close...",
                DRAIN_TIMEOUT.as_secs(),
                state.sessions.len()
            );
        }
        if tokio::time::timeout_at(deadline, state.sessions.wait()).await.is_err() {
            warn!(
                "Drain timeout reached with {} WebSocket session(s) still open",
                state.sessions.len()
            );
        }

        // 2. Let in-flight requests finish
        for handle in std::iter::once(http_handle).chain(push_handle) {
            if handle.is_finished() {
                continue;
            }
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("Drain timeout reached before a listener finished, proceeding with shutdown");
            }
        }

        // 3. Release links
        self.store.close().await;
        self.broker.close().await;
    }

    async fn serve(
        name: &'static str,
        address: &str,
        router: Router,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {name} address {address}: {e}"))?;

        info!("{} server listening on {}", name, address);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("{} server error: {}", name, e);
            }

            info!("{} server shut down gracefully", name);
        });

        Ok(handle)
    }
}

/// Resolve when an optional listener task ends; never when there is none
async fn wait_for(handle: &mut Option<JoinHandle<()>>) {
    match handle {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
