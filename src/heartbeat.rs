//! Timer-driven connection liveness.
//!
//! [`HeartbeatMonitor`] owns a repeating task that sends a heartbeat frame
//! every third of the negotiated interval, staying comfortably inside the
//! peer's timeout. The task holds only a [`Weak`] handle to the
//! connection: tearing the connection down ends the task instead of the
//! task keeping the connection alive.
//!
//! The facade starts the monitor only for consumer roles with a nonzero
//! interval; short-lived publishers tolerate idle disconnects and run
//! without one.

use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Owner of the repeating heartbeat task.
#[derive(Default)]
pub struct HeartbeatMonitor {
    cancel: Option<CancellationToken>,
}

impl HeartbeatMonitor {
    /// Create an inactive monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the repeating task is currently scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// Start sending heartbeats every `interval / 3`.
    ///
    /// Starting an active monitor is a no-op, as is a zero interval. Must
    /// be called from within a tokio runtime.
    pub fn start(&mut self, interval: Duration, connection: Weak<Mutex<Connection>>) {
        if interval.is_zero() {
            return;
        }
        if self.is_active() {
            tracing::debug!("heartbeat monitor already running");
            return;
        }

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let period = interval / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(connection) = connection.upgrade() else {
                            tracing::debug!("connection gone; heartbeat task ending");
                            break;
                        };
                        let result = connection.lock().expect("connection lock").heartbeat();
                        if let Err(error) = result {
                            tracing::warn!(%error, "heartbeat send failed; task ending");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Cancel the repeating task. Stopping an inactive monitor is a no-op.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
