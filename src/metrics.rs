use crate::engine::{PeerStats, TunnelEngine};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

fn labels(sim_id: &str, interface: &str, peer: &PeerStats) -> String {
    let endpoint = peer
        .endpoint
        .map(|endpoint| endpoint.to_string())
        .unwrap_or_default();
    format!(
        "{{simId=\"{}\",interface=\"{}\",endpoint=\"{}\"}}",
        sim_id, interface, endpoint
    )
}

fn handshake_epoch(last_handshake: Option<SystemTime>) -> u64 {
    last_handshake
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_secs())
        .unwrap_or(0)
}

pub fn metric_lines(sim_id: &str, interface: &str, peer: &PeerStats) -> [String; 3] {
    let labels = labels(sim_id, interface, peer);
    [
        format!("cellguard_sent_bytes_total{} {}", labels, peer.tx_bytes),
        format!("cellguard_received_bytes_total{} {}", labels, peer.rx_bytes),
        format!(
            "cellguard_latest_handshake_epoch{} {}",
            labels,
            handshake_epoch(peer.last_handshake)
        ),
    ]
}

/// Logged at error level so the counters survive `logLevel: 1`.
pub async fn run_reporter(
    engine: Arc<dyn TunnelEngine>,
    sim_id: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let peers = match engine.peer_stats().await {
                    Ok(peers) => peers,
                    Err(err) => {
                        error!(error = %err, "failed to collect metrics");
                        continue;
                    }
                };
                for peer in &peers {
                    for line in metric_lines(&sim_id, engine.interface_name(), peer) {
                        error!("{}", line);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::StatsEngine;
    use crate::keys::Key;

    #[test]
    fn lines_carry_labels_and_counters() {
        let peer = PeerStats {
            public_key: Key::from_bytes([1u8; 32]),
            endpoint: Some("198.51.100.7:11010".parse().unwrap()),
            tx_bytes: 1024,
            rx_bytes: 2048,
            last_handshake: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        };
        let lines = metric_lines("8900000000000000001", "cellguard0", &peer);
        let labels =
            r#"{simId="8900000000000000001",interface="cellguard0",endpoint="198.51.100.7:11010"}"#;
        assert_eq!(lines[0], format!("cellguard_sent_bytes_total{} 1024", labels));
        assert_eq!(lines[1], format!("cellguard_received_bytes_total{} 2048", labels));
        assert_eq!(
            lines[2],
            format!("cellguard_latest_handshake_epoch{} 1700000000", labels)
        );
    }

    #[test]
    fn missing_handshake_reports_zero_epoch() {
        let peer = PeerStats {
            public_key: Key::from_bytes([1u8; 32]),
            endpoint: None,
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: None,
        };
        let lines = metric_lines("sim", "utun4", &peer);
        assert!(lines[2].ends_with(" 0"));
        assert!(lines[2].contains(r#"endpoint="""#));
    }

    fn busy_peer() -> PeerStats {
        PeerStats {
            public_key: Key::from_bytes([1u8; 32]),
            endpoint: Some("198.51.100.7:11010".parse().unwrap()),
            tx_bytes: 4096,
            rx_bytes: 8192,
            last_handshake: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_logs_every_peer_once_per_period() {
        let (_guard, captured) = crate::logging::capture::logs("error");
        let engine = StatsEngine::new("cellguard0", vec![busy_peer()]);
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(run_reporter(
            engine.clone(),
            "sim-7".to_string(),
            METRICS_INTERVAL,
            cancel.clone(),
        ));

        tokio::time::sleep(METRICS_INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(engine.polls(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.polls(), 1);

        let logs = captured.text();
        let labels = r#"{simId="sim-7",interface="cellguard0",endpoint="198.51.100.7:11010"}"#;
        let sent = format!("cellguard_sent_bytes_total{} 4096", labels);
        assert!(logs.contains(&sent), "{logs}");
        assert!(logs.contains("cellguard_received_bytes_total"), "{logs}");
        assert!(logs.contains("cellguard_latest_handshake_epoch"), "{logs}");

        cancel.cancel();
        reporter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reporter_stops_before_polling() {
        let engine = StatsEngine::new("cellguard0", vec![busy_peer()]);
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(run_reporter(
            engine.clone(),
            "sim-7".to_string(),
            METRICS_INTERVAL,
            cancel.clone(),
        ));
        cancel.cancel();
        reporter.await.unwrap();
        tokio::time::sleep(METRICS_INTERVAL * 2).await;
        assert_eq!(engine.polls(), 0);
    }
}
