// Heartbeat: each tick pings live connections and terminates the ones that
// have not answered since the previous tick.

use std::sync::Arc;

use tokio::sync::watch;

use crate::connection::Outbound;
use crate::metrics;
use crate::rooms::RoomMembership;
use crate::state::RelayState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub terminated: usize,
}

/// One heartbeat pass over every open connection.
///
/// A connection whose flag is still clear from the previous pass is
/// terminated; otherwise the flag is cleared and a ping sent. A pong or a
/// control-channel `ping` sets the flag again.
pub async fn sweep(rooms: &RoomMembership) -> SweepReport {
    let mut report = SweepReport::default();
    for handle in rooms.all_handles().await {
        if !handle.is_open() {
            continue;
        }
        if handle.take_alive() {
            if handle.send(Outbound::Ping).is_ok() {
                report.pinged += 1;
            }
        } else if handle.send(Outbound::Terminate).is_ok() {
            tracing::info!(connection_id = %handle.id, "terminating unresponsive connection");
            report.terminated += 1;
        }
    }
    report
}

/// Runs the heartbeat until `stop` flips to `true` or its sender is dropped.
/// Housekeeping ([`RelayState::maintain`]) rides on the same tick.
pub async fn run(state: Arc<RelayState>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.heartbeat_interval);
    interval.reset(); // skip immediate first tick

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = sweep(&state.rooms).await;
                if report.terminated > 0 {
                    metrics::increment_heartbeat_terminations(report.terminated as u64);
                }
                tracing::debug!(pinged = report.pinged, terminated = report.terminated, "heartbeat sweep");
                state.maintain().await;
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    tracing::debug!("liveness monitor stopped");
                    break;
                }
            }
        }
    }
}
