use crate::error::Result;
use crate::keys::Key;
use crate::model::AllowedRange;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

pub type BoxedControlStream = Box<dyn ControlStream>;

/// Local endpoint that configuration tools connect to.
#[async_trait]
pub trait ControlListener: Send + Sync {
    async fn accept(&self) -> Result<BoxedControlStream>;

    /// Stops accepting and removes any filesystem entry backing the listener.
    fn release(&self);
}

/// Full device state applied on every start. Existing peers and their allowed
/// ranges are always replaced, never patched.
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    pub private_key: Key,
    pub peer: PeerSettings,
}

#[derive(Clone, Debug)]
pub struct PeerSettings {
    pub public_key: Key,
    pub endpoint: SocketAddr,
    pub persistent_keepalive: u16,
    pub allowed_ranges: Vec<AllowedRange>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeerStats {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

/// A running tunnel device. Safe to share between the accept loop and the
/// periodic tasks.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// The name the OS actually gave the device.
    fn interface_name(&self) -> &str;

    async fn open_control(&self) -> Result<Arc<dyn ControlListener>>;

    /// Serves one control connection until the peer hangs up.
    async fn handle_control(&self, stream: BoxedControlStream);

    async fn configure(&self, settings: &DeviceSettings) -> Result<()>;

    async fn peer_stats(&self) -> Result<Vec<PeerStats>>;

    /// Resolves once the device has stopped for any reason.
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, name: &str, mtu: u32) -> Result<Arc<dyn TunnelEngine>>;
}

#[cfg(unix)]
pub fn default_factory() -> Arc<dyn EngineFactory> {
    Arc::new(crate::wg::UserspaceFactory)
}

#[cfg(not(unix))]
pub fn default_factory() -> Arc<dyn EngineFactory> {
    Arc::new(crate::wg_portable::PortableFactory)
}
