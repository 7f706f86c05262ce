//! Readiness and liveness reporting to a process supervisor.

use crate::engine::{PeerStats, TunnelEngine};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the watchdog is checked, and how recent a handshake must be for a ping.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(
    REKEY_AFTER_TIME.as_secs() - KEEPALIVE_TIMEOUT.as_secs() - REKEY_TIMEOUT.as_secs() + 5,
);

pub trait Supervisor: Send + Sync {
    fn watchdog_enabled(&self) -> bool;

    fn reloading(&self);

    fn ready(&self);

    fn watchdog(&self);
}

#[cfg(unix)]
pub struct Systemd;

#[cfg(unix)]
impl Systemd {
    fn notify(&self, state: sd_notify::NotifyState, label: &str) {
        if let Err(err) = sd_notify::notify(false, &[state]) {
            error!(error = %err, "failed to notify {} to systemd", label);
        }
    }
}

#[cfg(unix)]
impl Supervisor for Systemd {
    fn watchdog_enabled(&self) -> bool {
        let mut usec = 0;
        sd_notify::watchdog_enabled(false, &mut usec)
    }

    fn reloading(&self) {
        self.notify(sd_notify::NotifyState::Reloading, "reloading");
    }

    fn ready(&self) {
        self.notify(sd_notify::NotifyState::Ready, "ready");
    }

    fn watchdog(&self) {
        self.notify(sd_notify::NotifyState::Watchdog, "watchdog");
    }
}

pub struct NoSupervisor;

impl Supervisor for NoSupervisor {
    fn watchdog_enabled(&self) -> bool {
        false
    }

    fn reloading(&self) {}

    fn ready(&self) {}

    fn watchdog(&self) {}
}

pub fn detect() -> Arc<dyn Supervisor> {
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("NOTIFY_SOCKET").is_some() {
            return Arc::new(Systemd);
        }
    }
    Arc::new(NoSupervisor)
}

pub fn handshake_is_fresh(last_handshake: Option<SystemTime>, now: SystemTime) -> bool {
    match last_handshake {
        Some(at) => now
            .duration_since(at)
            .map(|age| age < WATCHDOG_PERIOD)
            // a handshake stamped in the future counts as fresh
            .unwrap_or(true),
        None => false,
    }
}

/// One watchdog ping per peer with a fresh handshake. A stuck tunnel stops
/// pinging, which is what lets the supervisor restart us.
pub fn check_peers(supervisor: &dyn Supervisor, peers: &[PeerStats], now: SystemTime) -> usize {
    let mut pinged = 0;
    for peer in peers {
        if handshake_is_fresh(peer.last_handshake, now) {
            supervisor.watchdog();
            pinged += 1;
        }
    }
    pinged
}

pub async fn run_watchdog(
    engine: Arc<dyn TunnelEngine>,
    supervisor: Arc<dyn Supervisor>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match engine.peer_stats().await {
                    Ok(peers) => {
                        let pinged = check_peers(supervisor.as_ref(), &peers, SystemTime::now());
                        debug!(pinged, "watchdog check");
                    }
                    Err(err) => error!(error = %err, "failed to update watchdog timer"),
                }
            }
        }
    }
}
