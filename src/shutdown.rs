//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT (or Ctrl+C) and stops the server controller,
//! bounded by a timeout so a stuck reader cannot hang the process.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use crate::controller::ServerController;
use crate::error::ServerError;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Upper bound for stopping the controller
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolves once SIGTERM, SIGINT or Ctrl+C arrives
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Stop the controller, giving up after the configured timeout plus a
    /// small margin for the listener itself
    pub async fn shutdown_controller(&self, controller: &ServerController) -> Result<()> {
        let start_time = Instant::now();
        info!(
            "Stopping server with {} active connections (timeout: {:?})",
            controller.connection_count(),
            self.timeout
        );

        match tokio::time::timeout(self.timeout + Duration::from_secs(1), controller.stop()).await {
            Ok(Ok(())) => {
                info!("Server stopped gracefully in {:?}", start_time.elapsed());
                Ok(())
            }
            Ok(Err(ServerError::NotRunning)) => {
                info!("Server was not running");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} connections still active",
                    start_time.elapsed(),
                    controller.connection_count()
                );
                Err(anyhow::anyhow!("Shutdown did not complete within {:?}", self.timeout))
            }
        }
    }
}
