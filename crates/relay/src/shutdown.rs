// Ordered shutdown: stop the heartbeat, close every socket with a normal
// closure, wait for them to finish, then let the listener stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::connection::Outbound;
use crate::state::RelayState;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub closed: usize,
    pub remaining: usize,
}

pub struct ShutdownCoordinator {
    state: Arc<RelayState>,
    liveness_stop: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    /// Returns the coordinator and the stop receiver for the liveness monitor.
    pub fn new(state: Arc<RelayState>) -> (Self, watch::Receiver<bool>) {
        let (liveness_stop, stop_rx) = watch::channel(false);
        (Self { state, liveness_stop }, stop_rx)
    }

    pub async fn drain(&self) -> DrainReport {
        let _ = self.liveness_stop.send(true);

        let handles = self.state.rooms.all_handles().await;
        let mut report = DrainReport::default();
        for handle in &handles {
            if handle.send(Outbound::Close).is_ok() {
                report.closed += 1;
            }
        }
        tracing::info!(connections = report.closed, "closing connections for shutdown");

        let deadline = Instant::now() + self.state.config.shutdown_drain;
        loop {
            report.remaining = self.state.rooms.connection_count().await;
            if report.remaining == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if report.remaining > 0 {
            tracing::warn!(remaining = report.remaining, "shutdown drain timed out");
        }
        report
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
