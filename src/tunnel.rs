//! Lifetime of one `up` run: bring the device up, program it, supervise it,
//! tear it down.

use crate::config::ClientConfig;
use crate::engine::{ControlListener, DeviceSettings, EngineFactory, PeerSettings, TunnelEngine};
use crate::error::{Error, Result};
use crate::hooks::{run_hooks, HookStage};
use crate::metrics::{self, METRICS_INTERVAL};
use crate::network::InterfaceConfigurator;
use crate::supervisor::{self, Supervisor, WATCHDOG_PERIOD};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    InterfaceUp,
    EngineConfigured,
    RoutesConfigured,
    Running,
    Draining,
    Stopped,
}

/// What ended the running phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Signal(&'static str),
    AcceptFailed(String),
    EngineClosed,
    Cancelled,
}

#[derive(Debug)]
pub struct TunnelReport {
    pub interface: String,
    pub states: Vec<TunnelState>,
    pub termination: Termination,
    pub hook_failures: usize,
}

struct Progress {
    states: Vec<TunnelState>,
}

impl Progress {
    fn new() -> Self {
        Self {
            states: vec![TunnelState::Created],
        }
    }

    fn enter(&mut self, state: TunnelState) {
        info!(state = ?state, "tunnel state");
        self.states.push(state);
    }
}

/// Runs the tunnel until a signal, an accept-loop failure, engine shutdown or
/// `cancel` fires. Failures before the tunnel is running are returned as-is
/// without undoing the steps already applied.
pub async fn run(
    config: &ClientConfig,
    factory: &dyn EngineFactory,
    configurator: &dyn InterfaceConfigurator,
    supervisor: Arc<dyn Supervisor>,
    cancel: CancellationToken,
) -> Result<TunnelReport> {
    let session = config.require_session()?;
    let ranges = config.effective_allowed_ranges()?;
    let watchdog = supervisor.watchdog_enabled();
    if watchdog {
        supervisor.reloading();
    }

    let mut progress = Progress::new();
    let engine = factory
        .create(config.interface_name(), config.effective_mtu())
        .await?;
    let interface = engine.interface_name().to_string();
    let span = info_span!("tunnel", interface = %interface);

    async move {
        progress.enter(TunnelState::InterfaceUp);

        let listener = engine.open_control().await?;
        let mut accept_task = tokio::spawn(
            accept_loop(listener.clone(), engine.clone()).in_current_span(),
        );

        let settings = DeviceSettings {
            private_key: config.private_key,
            peer: PeerSettings {
                public_key: session.server_public_key,
                endpoint: session.server_endpoint.socket_addr(),
                persistent_keepalive: config.effective_keepalive(),
                allowed_ranges: ranges.clone(),
            },
        };
        engine.configure(&settings).await?;
        progress.enter(TunnelState::EngineConfigured);

        configurator
            .configure(&interface, session.client_address, &ranges)
            .await?;
        progress.enter(TunnelState::RoutesConfigured);

        let mut hook_failures = run_hooks(HookStage::PostUp, &config.post_up, &interface)
            .await
            .len();

        let background = CancellationToken::new();
        let mut tickers = Vec::new();
        if watchdog {
            supervisor.ready();
            tickers.push(tokio::spawn(
                supervisor::run_watchdog(
                    engine.clone(),
                    supervisor.clone(),
                    WATCHDOG_PERIOD,
                    background.clone(),
                )
                .in_current_span(),
            ));
        }
        if config.enable_metrics {
            tickers.push(tokio::spawn(
                metrics::run_reporter(
                    engine.clone(),
                    config.sim_id.clone(),
                    METRICS_INTERVAL,
                    background.clone(),
                )
                .in_current_span(),
            ));
        }
        progress.enter(TunnelState::Running);
        info!(
            endpoint = %session.server_endpoint,
            address = %session.client_address,
            "tunnel is up"
        );

        let termination = tokio::select! {
            signal = wait_for_signal() => Termination::Signal(signal),
            joined = &mut accept_task => {
                let reason = match joined {
                    Ok(err) => err.to_string(),
                    Err(err) => err.to_string(),
                };
                error!(error = %reason, "control accept loop stopped");
                Termination::AcceptFailed(reason)
            }
            _ = engine.closed() => Termination::EngineClosed,
            _ = cancel.cancelled() => Termination::Cancelled,
        };
        info!(termination = ?termination, "shutting down");
        progress.enter(TunnelState::Draining);

        background.cancel();
        engine.close().await;
        accept_task.abort();
        hook_failures += run_hooks(HookStage::PostDown, &config.post_down, &interface)
            .await
            .len();
        listener.release();
        for ticker in tickers {
            let _ = ticker.await;
        }
        progress.enter(TunnelState::Stopped);

        Ok::<_, Error>(TunnelReport {
            interface,
            states: progress.states,
            termination,
            hook_failures,
        })
    }
    .instrument(span)
    .await
}

/// One handler task per connection. Only returns when accepting fails.
async fn accept_loop(listener: Arc<dyn ControlListener>, engine: Arc<dyn TunnelEngine>) -> Error {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let engine = engine.clone();
                tokio::spawn(
                    async move {
                        engine.handle_control(stream).await;
                    }
                    .in_current_span(),
                );
            }
            Err(err) => return err,
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut terminate), Ok(mut interrupt), Ok(mut abort)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::from_raw(libc::SIGABRT)),
    ) else {
        let _ = tokio::signal::ctrl_c().await;
        return "interrupt";
    };
    tokio::select! {
        _ = terminate.recv() => "terminate",
        _ = interrupt.recv() => "interrupt",
        _ = abort.recv() => "abort",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_config;
    use crate::engine::{BoxedControlStream, PeerStats};
    use crate::model::{AllowedRange, Endpoint};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    struct ChannelListener {
        incoming: tokio::sync::Mutex<mpsc::Receiver<DuplexStream>>,
        events: Events,
    }

    #[async_trait]
    impl ControlListener for ChannelListener {
        async fn accept(&self) -> Result<BoxedControlStream> {
            match self.incoming.lock().await.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(Error::engine("control listener closed")),
            }
        }

        fn release(&self) {
            record(&self.events, "release");
        }
    }

    struct FakeEngine {
        name: String,
        events: Events,
        listener: Mutex<Option<Arc<ChannelListener>>>,
        stopped: CancellationToken,
    }

    #[async_trait]
    impl TunnelEngine for FakeEngine {
        fn interface_name(&self) -> &str {
            &self.name
        }

        async fn open_control(&self) -> Result<Arc<dyn ControlListener>> {
            let listener: Arc<dyn ControlListener> = self
                .listener
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::engine("control already open"))?;
            Ok(listener)
        }

        async fn handle_control(&self, mut stream: BoxedControlStream) {
            let mut buf = [0u8; 6];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(b"errno=0\n\n").await;
            }
        }

        async fn configure(&self, settings: &DeviceSettings) -> Result<()> {
            record(
                &self.events,
                format!(
                    "configure {} keepalive={} ranges={}",
                    settings.peer.endpoint,
                    settings.peer.persistent_keepalive,
                    settings.peer.allowed_ranges.len()
                ),
            );
            Ok(())
        }

        async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
            Ok(Vec::new())
        }

        async fn closed(&self) {
            self.stopped.cancelled().await;
        }

        async fn close(&self) {
            record(&self.events, "close");
            self.stopped.cancel();
        }
    }

    struct FakeFactory {
        engine: Arc<FakeEngine>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl EngineFactory for FakeFactory {
        async fn create(&self, name: &str, mtu: u32) -> Result<Arc<dyn TunnelEngine>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            record(&self.engine.events, format!("create {} mtu={}", name, mtu));
            let engine: Arc<dyn TunnelEngine> = self.engine.clone();
            Ok(engine)
        }
    }

    struct FakeConfigurator {
        events: Events,
    }

    #[async_trait]
    impl InterfaceConfigurator for FakeConfigurator {
        async fn configure(
            &self,
            interface: &str,
            address: IpAddr,
            ranges: &[AllowedRange],
        ) -> Result<()> {
            record(
                &self.events,
                format!("routes {} {} {}", interface, address, ranges.len()),
            );
            Ok(())
        }
    }

    struct FakeSupervisor {
        events: Events,
    }

    impl Supervisor for FakeSupervisor {
        fn watchdog_enabled(&self) -> bool {
            true
        }
        fn reloading(&self) {
            record(&self.events, "reloading");
        }
        fn ready(&self) {
            record(&self.events, "ready");
        }
        fn watchdog(&self) {
            record(&self.events, "watchdog");
        }
    }

    struct Harness {
        events: Events,
        factory: FakeFactory,
        configurator: FakeConfigurator,
        supervisor: Arc<FakeSupervisor>,
        connections: mpsc::Sender<DuplexStream>,
    }

    fn harness(actual_name: &str) -> Harness {
        let events: Events = Arc::default();
        let (connections, incoming) = mpsc::channel(4);
        let listener = Arc::new(ChannelListener {
            incoming: tokio::sync::Mutex::new(incoming),
            events: events.clone(),
        });
        let engine = Arc::new(FakeEngine {
            name: actual_name.to_string(),
            events: events.clone(),
            listener: Mutex::new(Some(listener)),
            stopped: CancellationToken::new(),
        });
        Harness {
            events: events.clone(),
            factory: FakeFactory {
                engine,
                created: AtomicUsize::new(0),
            },
            configurator: FakeConfigurator {
                events: events.clone(),
            },
            supervisor: Arc::new(FakeSupervisor { events }),
            connections,
        }
    }

    fn config() -> ClientConfig {
        let mut config = sample_config().unwrap();
        config.interface = "cellguard0".to_string();
        config.enable_metrics = true;
        if let Some(session) = config.session.as_mut() {
            session.server_endpoint = Endpoint::parse("198.51.100.7:11010").unwrap();
        }
        config
    }

    #[tokio::test]
    async fn walks_every_state_and_tears_down_in_order() {
        let h = harness("cellguard0");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = run(
            &config(),
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(
            report.states,
            vec![
                TunnelState::Created,
                TunnelState::InterfaceUp,
                TunnelState::EngineConfigured,
                TunnelState::RoutesConfigured,
                TunnelState::Running,
                TunnelState::Draining,
                TunnelState::Stopped,
            ]
        );
        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.hook_failures, 0);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec![
                "reloading",
                "create cellguard0 mtu=1420",
                "configure 198.51.100.7:11010 keepalive=60 ranges=16",
                "routes cellguard0 127.0.0.1 16",
                "ready",
                "close",
                "release",
            ]
        );
    }

    #[tokio::test]
    async fn missing_session_fails_before_creating_the_device() {
        let h = harness("cellguard0");
        let mut config = config();
        config.session = None;

        let err = run(
            &config,
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
        assert!(h.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_shutdown_drains_the_tunnel() {
        let h = harness("cellguard0");
        let engine = h.factory.engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.stopped.cancel();
        });

        let report = run(
            &config(),
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.termination, Termination::EngineClosed);
        assert_eq!(report.states.last(), Some(&TunnelState::Stopped));
    }

    #[tokio::test]
    async fn accept_failure_drains_the_tunnel() {
        let h = harness("cellguard0");
        drop(h.connections);

        let report = run(
            &config(),
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            report.termination,
            Termination::AcceptFailed("engine error: control listener closed".to_string())
        );
        assert!(h.events.lock().unwrap().ends_with(&[
            "close".to_string(),
            "release".to_string()
        ]));
    }

    #[tokio::test]
    async fn control_connections_are_served_while_running() {
        let h = harness("cellguard0");
        let cancel = CancellationToken::new();
        let (mut client, server) = duplex(64);
        h.connections.send(server).await.unwrap();

        let trigger = cancel.clone();
        let exchange = tokio::spawn(async move {
            client.write_all(b"get=1\n").await.unwrap();
            let mut reply = [0u8; 9];
            client.read_exact(&mut reply).await.unwrap();
            trigger.cancel();
            reply
        });

        let report = run(
            &config(),
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(&exchange.await.unwrap(), b"errno=0\n\n");
        assert_eq!(report.termination, Termination::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hooks_use_the_actual_interface_name() {
        let h = harness("utun7");
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("hooks.log");
        let log = log.to_str().unwrap();

        let mut config = config();
        config.interface = "utun".to_string();
        config.post_up = vec![
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo up %i >> {}", log),
            ],
            vec!["false".to_string()],
        ];
        config.post_down = vec![vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo down %i >> {}", log),
        ]];

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run(
            &config,
            &h.factory,
            &h.configurator,
            h.supervisor.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.interface, "utun7");
        assert_eq!(report.hook_failures, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hooks.log")).unwrap(),
            "up utun7\ndown utun7\n"
        );
        assert!(h.events.lock().unwrap()[1].starts_with("create utun "));
    }
}
