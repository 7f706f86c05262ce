use crate::engine::{
    BoxedControlStream, ControlListener, DeviceSettings, EngineFactory, PeerStats, TunnelEngine,
};
use crate::error::{Error, Result};
use crate::keys::Key;
use async_trait::async_trait;
use boringtun::device::{DeviceConfig, DeviceHandle};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wireguard_control::{
    Backend, Device, DeviceUpdate, InterfaceName, Key as WgKey, PeerConfigBuilder,
};

const UAPI_DIR: &str = "/var/run/wireguard";
const CONTROL_DIR: &str = "/var/run/cellguard";
const DEVICE_TIMEOUT: Duration = Duration::from_secs(3);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);
const NO_DEVICES: &str = "no cellguard device found\n";

fn uapi_socket_path(interface: &str) -> PathBuf {
    Path::new(UAPI_DIR).join(format!("{interface}.sock"))
}

pub fn control_socket_path(interface: &str) -> PathBuf {
    Path::new(CONTROL_DIR).join(format!("{interface}.sock"))
}

/// Creates boringtun devices driven through their UAPI socket.
pub struct UserspaceFactory;

#[async_trait]
impl EngineFactory for UserspaceFactory {
    async fn create(&self, name: &str, mtu: u32) -> Result<Arc<dyn TunnelEngine>> {
        let name = resolve_interface_name(name)?;
        let iface: InterfaceName = name
            .parse()
            .map_err(|_| Error::engine(format!("invalid interface name {}", name)))?;

        let device_name = name.clone();
        let handle = tokio::task::spawn_blocking(move || {
            DeviceHandle::new(&device_name, DeviceConfig::default())
        })
        .await
        .map_err(|err| Error::engine(format!("device task failed: {}", err)))?
        .map_err(|err| Error::engine(format!("failed to create {}: {:?}", name, err)))?;

        let uapi = uapi_socket_path(&name);
        wait_for_socket(&uapi, DEVICE_TIMEOUT).await?;
        set_mtu(&name, mtu).await?;
        info!(interface = %name, mtu, "device started");

        let stopped = CancellationToken::new();
        tokio::spawn(watch_device(uapi, stopped.clone()));
        Ok(Arc::new(UserspaceEngine {
            name,
            iface,
            handle: Mutex::new(Some(handle)),
            stopped,
        }))
    }
}

/// The device counts as gone once its UAPI socket disappears.
async fn watch_device(uapi: PathBuf, stopped: CancellationToken) {
    loop {
        tokio::select! {
            _ = stopped.cancelled() => return,
            _ = sleep(LIVENESS_INTERVAL) => {
                if !uapi.exists() {
                    warn!(socket = %uapi.display(), "device socket vanished");
                    stopped.cancel();
                    return;
                }
            }
        }
    }
}

struct UserspaceEngine {
    name: String,
    iface: InterfaceName,
    handle: Mutex<Option<DeviceHandle>>,
    stopped: CancellationToken,
}

#[async_trait]
impl TunnelEngine for UserspaceEngine {
    fn interface_name(&self) -> &str {
        &self.name
    }

    async fn open_control(&self) -> Result<Arc<dyn ControlListener>> {
        let listener = UnixControlListener::bind(control_socket_path(&self.name)).await?;
        Ok(Arc::new(listener))
    }

    async fn handle_control(&self, mut stream: BoxedControlStream) {
        let uapi = uapi_socket_path(&self.name);
        match UnixStream::connect(&uapi).await {
            Ok(mut device) => {
                if let Err(err) = tokio::io::copy_bidirectional(&mut stream, &mut device).await {
                    debug!(error = %err, "control connection ended");
                }
            }
            Err(err) => warn!(socket = %uapi.display(), error = %err, "device socket unavailable"),
        }
    }

    async fn configure(&self, settings: &DeviceSettings) -> Result<()> {
        let update = device_update(settings)?;
        let iface = self.iface.clone();
        tokio::task::spawn_blocking(move || update.apply(&iface, Backend::Userspace))
            .await
            .map_err(|err| Error::engine(format!("configure task failed: {}", err)))?
            .map_err(|err| Error::engine(format!("failed to configure {}: {}", self.name, err)))
    }

    async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        let iface = self.iface.clone();
        let device = tokio::task::spawn_blocking(move || Device::get(&iface, Backend::Userspace))
            .await
            .map_err(|err| Error::engine(format!("device query task failed: {}", err)))?
            .map_err(|err| Error::engine(format!("failed to query {}: {}", self.name, err)))?;
        device
            .peers
            .into_iter()
            .map(|info| -> Result<PeerStats> {
                Ok(PeerStats {
                    public_key: Key::from_base64(&info.config.public_key.to_base64())?,
                    endpoint: info.config.endpoint,
                    tx_bytes: info.stats.tx_bytes,
                    rx_bytes: info.stats.rx_bytes,
                    last_handshake: info.stats.last_handshake_time,
                })
            })
            .collect()
    }

    async fn closed(&self) {
        self.stopped.cancelled().await;
    }

    async fn close(&self) {
        self.stopped.cancel();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            // dropping the handle joins the device threads
            let _ = tokio::task::spawn_blocking(move || drop(handle)).await;
        }
        let _ = std::fs::remove_file(uapi_socket_path(&self.name));
        info!(interface = %self.name, "device closed");
    }
}

fn wg_key(key: &Key) -> Result<WgKey> {
    WgKey::from_base64(&key.to_base64()).map_err(|_| Error::engine("invalid key"))
}

fn device_update(settings: &DeviceSettings) -> Result<DeviceUpdate> {
    let peer_key = wg_key(&settings.peer.public_key)?;
    let mut peer = PeerConfigBuilder::new(&peer_key)
        .replace_allowed_ips()
        .set_endpoint(settings.peer.endpoint);
    if settings.peer.persistent_keepalive > 0 {
        peer = peer.set_persistent_keepalive_interval(settings.peer.persistent_keepalive);
    }
    for range in &settings.peer.allowed_ranges {
        peer = peer.add_allowed_ip(range.addr(), range.prefix_len());
    }
    Ok(DeviceUpdate::new()
        .set_private_key(wg_key(&settings.private_key)?)
        .replace_peers()
        .add_peer(peer))
}

pub(crate) struct UnixControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixControlListener {
    pub(crate) async fn bind(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // a stale socket from a crashed run blocks bind
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(socket = %path.display(), "control listener started");
        Ok(Self { listener, path })
    }
}

#[async_trait]
impl ControlListener for UnixControlListener {
    async fn accept(&self) -> Result<BoxedControlStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if path.exists() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(Error::engine(format!(
                "device socket {} did not appear",
                path.display()
            )));
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(target_os = "linux")]
async fn set_mtu(name: &str, mtu: u32) -> Result<()> {
    let netlink = crate::netlink::Netlink::new().await?;
    let index = netlink.wait_for_link(name, DEVICE_TIMEOUT).await?;
    netlink.set_link_mtu(index, mtu).await
}

#[cfg(not(target_os = "linux"))]
async fn set_mtu(name: &str, mtu: u32) -> Result<()> {
    let mtu = mtu.to_string();
    crate::process::run(&["ifconfig", name, "mtu", mtu.as_str()]).await?;
    Ok(())
}

/// macOS only accepts `utunN`; a bare `utun` picks the first free unit.
#[cfg(target_os = "macos")]
fn resolve_interface_name(name: &str) -> Result<String> {
    if name != "utun" {
        return Ok(name.to_string());
    }
    for unit in 0..256 {
        let candidate = format!("utun{unit}");
        let c_name = std::ffi::CString::new(candidate.clone())
            .map_err(|_| Error::engine("invalid interface name"))?;
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
        if unsafe { libc::if_nametoindex(c_name.as_ptr()) } == 0 {
            return Ok(candidate);
        }
    }
    Err(Error::engine("no free utun device"))
}

#[cfg(not(target_os = "macos"))]
fn resolve_interface_name(name: &str) -> Result<String> {
    Ok(name.to_string())
}

/// `wg show` style listing of every userspace device, private keys hidden.
pub fn device_report() -> Result<String> {
    let names = Device::list(Backend::Userspace)
        .map_err(|err| Error::engine(format!("failed to list devices: {}", err)))?;
    let mut out = String::new();
    for name in names {
        let device = Device::get(&name, Backend::Userspace)
            .map_err(|err| Error::engine(format!("failed to query {}: {}", name, err)))?;
        let _ = writeln!(out, "interface: {}", device.name);
        if let Some(key) = &device.public_key {
            let _ = writeln!(out, "  public key: {}", key.to_base64());
        }
        let _ = writeln!(out, "  private key: (hidden)");
        if let Some(port) = device.listen_port {
            let _ = writeln!(out, "  listening port: {}", port);
        }
        for peer in &device.peers {
            let _ = writeln!(out);
            let _ = writeln!(out, "peer: {}", peer.config.public_key.to_base64());
            if let Some(endpoint) = peer.config.endpoint {
                let _ = writeln!(out, "  endpoint: {}", endpoint);
            }
            let allowed = peer
                .config
                .allowed_ips
                .iter()
                .map(|ip| format!("{}/{}", ip.address, ip.cidr))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "  allowed ips: {}", allowed);
            if let Some(age) = peer
                .stats
                .last_handshake_time
                .and_then(|at| SystemTime::now().duration_since(at).ok())
            {
                let _ = writeln!(out, "  latest handshake: {} seconds ago", age.as_secs());
            }
            let _ = writeln!(
                out,
                "  transfer: {} B received, {} B sent",
                peer.stats.rx_bytes, peer.stats.tx_bytes
            );
        }
        let _ = writeln!(out);
    }
    Ok(finish_report(out))
}

fn finish_report(out: String) -> String {
    if out.is_empty() {
        NO_DEVICES.to_string()
    } else {
        out
    }
}
