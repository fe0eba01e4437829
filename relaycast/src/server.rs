//! Server lifecycle management
//!
//! Runs the HTTP server until a shutdown signal, then tears down every peer,
//! every bridge and the ingest transcoder and removes generated HLS files.

use anyhow::Context;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use relaycast_api::{create_router, AppState};
use relaycast_core::Config;
use relaycast_sfu::hls::{cleanup_output_dir, TranscoderProcess};

pub struct RelaycastServer {
    config: Config,
    state: AppState,
    hls_dir: PathBuf,
    ingest: Option<Box<dyn TranscoderProcess>>,
}

impl RelaycastServer {
    pub fn new(
        config: Config,
        state: AppState,
        hls_dir: PathBuf,
        ingest: Option<Box<dyn TranscoderProcess>>,
    ) -> Self {
        Self {
            config,
            state,
            hls_dir,
            ingest,
        }
    }

    /// Serve HTTP and wait for a shutdown signal
    pub async fn start(mut self) -> anyhow::Result<()> {
        let app = create_router(self.state.clone(), &self.hls_dir);
        let addr = self.config.http_address();

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
        info!("HTTP server listening on {}", addr);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        if let Err(e) = &result {
            error!("HTTP server error: {}", e);
        }

        self.shutdown().await;
        result.context("HTTP server stopped unexpectedly")
    }

    /// Release every peer, bridge and transcoder, then clean the output dir
    async fn shutdown(&mut self) {
        info!("Shutting down Relaycast server...");

        let peers = self.state.manager.close_all();
        info!(peers, "All peers disconnected");

        if let Some(mut process) = self.ingest.take() {
            let pid = process.pid();
            process.terminate();
            info!(pid = ?pid, "Ingest transcoder stopped");
        }

        if self.state.features.hls {
            match cleanup_output_dir(&self.hls_dir).await {
                Ok(removed) => info!(removed, dir = %self.hls_dir.display(), "HLS output cleaned"),
                Err(e) => warn!(error = %e, dir = %self.hls_dir.display(), "Failed to clean HLS output"),
            }
        }

        info!("Relaycast server stopped");
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
