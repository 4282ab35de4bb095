//! Heartbeat supervision and eviction of unresponsive connections.
//!
//! One supervisor task serves the whole registry. Each sweep probes every
//! live connection with a heartbeat frame and evicts those silent for longer
//! than the timeout. [`HeartbeatSupervisor::sweep_at`] takes the current
//! instant explicitly so it can be driven step by step in tests; the
//! periodic loop uses tokio's clock, which `start_paused` tests control.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use roomcast_core::{Frame, TimeoutError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Outbound;
use super::registry::ConnectionRegistry;
use crate::metrics::WS_HEARTBEAT_EVICTIONS_TOTAL;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections a heartbeat was queued for.
    pub probed: usize,
    /// Heartbeats that could not be queued.
    pub send_failures: usize,
    /// Connections transitioned to DEAD and removed.
    pub evicted: usize,
}

/// Periodic liveness prober.
pub struct HeartbeatSupervisor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    started_at: Instant,
}

impl HeartbeatSupervisor {
    /// Create a supervisor. `timeout` is clamped to at least `interval`.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout: timeout.max(interval),
            started_at: Instant::now(),
        }
    }

    /// Sweep period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Eviction threshold.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one sweep as of `now`.
    ///
    /// Connections idle for at least the timeout are marked DEAD and removed;
    /// every other connection gets a heartbeat and moves to AWAITING_PONG.
    /// A failed send is counted and logged; the sweep continues.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let connections = self.registry.snapshot();

        let mut probe: Vec<_> = Vec::with_capacity(connections.len());
        for conn in connections {
            if let Some(idle) = conn.expire_if_idle(now, self.timeout) {
                let err = TimeoutError {
                    idle,
                    timeout: self.timeout,
                };
                if self.registry.remove(&conn.id).is_some() {
                    report.evicted += 1;
                    self.registry.counters().record_evicted();
                    counter!(WS_HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                    warn!(conn_id = %conn.id, error = %err, "evicting unresponsive connection");
                }
            } else {
                probe.push(conn);
            }
        }

        let uptime = now.saturating_duration_since(self.started_at);
        let frame = Frame::heartbeat(self.registry.len(), uptime);
        let json: Arc<str> = match frame.to_json() {
            Ok(j) => Arc::from(j),
            Err(e) => {
                warn!(error = %e, "failed to serialize heartbeat");
                return report;
            }
        };

        for conn in probe {
            match conn.send(Outbound::Heartbeat(json.clone())) {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    report.send_failures += 1;
                    debug!(conn_id = %conn.id, error = %e, "heartbeat not queued");
                }
            }
            conn.mark_probed();
        }

        if report.evicted > 0 || report.send_failures > 0 {
            info!(
                probed = report.probed,
                send_failures = report.send_failures,
                evicted = report.evicted,
                "heartbeat sweep"
            );
        }
        report
    }

    /// Sweep every `interval` until `cancel` fires.
    ///
    /// The first tick is skipped so nothing is sent at startup.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep_at(Instant::now());
                }
                () = cancel.cancelled() => {
                    debug!("heartbeat supervisor stopped");
                    return;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
