use crate::error::{Error, Result};
use crate::keys::{Key, KeyPair};
use crate::model::{AllowedRange, Endpoint, Profile, Session};
use crate::platform;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

pub const DEFAULT_MTU: u32 = 1420;
pub const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 60;
pub const LOG_LEVEL_SILENT: u8 = 0;
pub const LOG_LEVEL_ERROR: u8 = 1;
pub const LOG_LEVEL_VERBOSE: u8 = 2;

/// A command and its arguments. `%i` in any token is replaced by the interface name.
pub type HookCommand = Vec<String>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub private_key: Key,
    #[serde(default)]
    pub public_key: Key,
    #[serde(default)]
    pub sim_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub interface: String,
    #[serde(
        rename = "additionalAllowedIPs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_allowed_ranges: Vec<AllowedRange>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub persistent_keepalive: u16,
    #[serde(default, alias = "preUp", skip_serializing_if = "Vec::is_empty")]
    pub post_up: Vec<HookCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_down: Vec<HookCommand>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reject_overlapping_ranges: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(rename = "arcSessionStatus", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

fn default_log_level() -> u8 {
    LOG_LEVEL_VERBOSE
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u16(value: &u16) -> bool {
    *value == 0
}

impl ClientConfig {
    /// A config for a newly issued identity, with the operational defaults every
    /// bootstrap strategy starts from.
    pub fn fresh(keys: KeyPair, sim_id: impl Into<String>) -> Self {
        ClientConfig {
            private_key: keys.private_key,
            public_key: keys.public_key,
            sim_id: sim_id.into(),
            log_level: LOG_LEVEL_VERBOSE,
            enable_metrics: true,
            interface: platform::default_interface_name().to_string(),
            additional_allowed_ranges: Vec::new(),
            mtu: DEFAULT_MTU,
            persistent_keepalive: DEFAULT_PERSISTENT_KEEPALIVE,
            post_up: Vec::new(),
            post_down: Vec::new(),
            reject_overlapping_ranges: false,
            profile: None,
            session: None,
        }
    }

    pub fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 {
            DEFAULT_MTU
        } else {
            self.mtu
        }
    }

    pub fn effective_keepalive(&self) -> u16 {
        if self.persistent_keepalive == 0 {
            DEFAULT_PERSISTENT_KEEPALIVE
        } else {
            self.persistent_keepalive
        }
    }

    pub fn interface_name(&self) -> &str {
        if self.interface.is_empty() {
            platform::default_interface_name()
        } else {
            &self.interface
        }
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        self.mtu = mtu;
    }

    pub fn set_persistent_keepalive(&mut self, seconds: u16) {
        self.persistent_keepalive = seconds;
    }

    pub fn add_allowed_ranges(&mut self, ranges: impl IntoIterator<Item = AllowedRange>) {
        self.additional_allowed_ranges.extend(ranges);
    }

    pub fn set_reject_overlapping_ranges(&mut self, reject: bool) {
        self.reject_overlapping_ranges = reject;
    }

    /// The session, or a configuration error when this config was never bootstrapped.
    pub fn require_session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| {
            Error::config("no session in config; run `cellguard bootstrap` first")
        })
    }

    fn combined_ranges(&self, session: &Session) -> Vec<AllowedRange> {
        session
            .allowed_ranges
            .iter()
            .chain(self.additional_allowed_ranges.iter())
            .copied()
            .collect()
    }

    /// Session ranges followed by the additional ones, in order. Duplicates pass
    /// through unless `reject_overlapping_ranges` is set.
    pub fn effective_allowed_ranges(&self) -> Result<Vec<AllowedRange>> {
        let ranges = self.combined_ranges(self.require_session()?);
        if self.reject_overlapping_ranges {
            check_overlaps(&ranges)?;
        }
        Ok(ranges)
    }

    /// Renders the config in the `wg-quick` file layout.
    pub fn wireguard_config(&self, mask_private_key: bool) -> Result<String> {
        let session = self.require_session()?;
        let private_key = if mask_private_key {
            "(hidden)".to_string()
        } else {
            self.private_key.to_base64()
        };
        let ranges = self
            .combined_ranges(session)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "Address = {}/32", session.client_address);
        let _ = writeln!(out, "PrivateKey = {}", private_key);
        let _ = writeln!(out, "MTU = {}", self.effective_mtu());
        let _ = writeln!(out, "# SIM ID: {}", self.sim_id);
        for command in runnable(&self.post_up) {
            let _ = writeln!(out, "PostUp = {}", command.join(" "));
        }
        for command in runnable(&self.post_down) {
            let _ = writeln!(out, "PostDown = {}", command.join(" "));
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", session.server_public_key);
        let _ = writeln!(out, "AllowedIPs = {}", ranges);
        let _ = writeln!(out, "Endpoint = {}", session.server_endpoint.socket_addr());
        let _ = writeln!(out, "PersistentKeepalive = {}", self.effective_keepalive());
        Ok(out)
    }
}

/// A command with at least one token and a non-empty program.
pub fn is_runnable(command: &HookCommand) -> bool {
    command.first().is_some_and(|program| !program.is_empty())
}

pub fn runnable(commands: &[HookCommand]) -> impl Iterator<Item = &HookCommand> {
    commands.iter().filter(|command| is_runnable(command))
}

fn check_overlaps(ranges: &[AllowedRange]) -> Result<()> {
    for (index, range) in ranges.iter().enumerate() {
        for other in &ranges[index + 1..] {
            if range.overlaps(other) {
                return Err(Error::config(format!(
                    "allowed range {} overlaps {}",
                    range, other
                )));
            }
        }
    }
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("cellguard").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("cellguard.json"))
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        Error::config(format!("failed to open config file {}: {}", path.display(), err))
    })?;
    serde_json::from_str(&contents).map_err(|err| {
        Error::config(format!(
            "error while reading config file {}: {}",
            path.display(),
            err
        ))
    })
}

pub fn load_optional_config(path: &Path) -> Result<Option<ClientConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    load_config(path).map(Some)
}

pub fn save_config(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut json = serde_json::to_string_pretty(config)?;
    json.push('\n');
    write_private(path, json.as_bytes())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on create
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

const SAMPLE_RANGES: [&str; 16] = [
    "100.127.0.0/21",
    "100.127.8.0/23",
    "100.127.10.0/28",
    "100.127.10.17/32",
    "100.127.10.18/31",
    "100.127.10.20/30",
    "100.127.10.24/29",
    "100.127.10.32/27",
    "100.127.10.64/26",
    "100.127.10.128/25",
    "100.127.11.0/24",
    "100.127.12.0/22",
    "100.127.16.0/20",
    "100.127.32.0/19",
    "100.127.64.0/18",
    "100.127.128.0/17",
];

/// A starter config with a fresh key pair and placeholder peer details.
pub fn sample_config() -> Result<ClientConfig> {
    let keys = KeyPair::generate();
    let mut config = ClientConfig::fresh(keys, "<SIM ID>");
    let ranges = SAMPLE_RANGES
        .iter()
        .map(|range| range.parse())
        .collect::<Result<Vec<AllowedRange>>>()?;
    config.session = Some(Session {
        server_public_key: KeyPair::generate().public_key,
        server_endpoint: Endpoint::parse("localhost:11010")?,
        allowed_ranges: ranges,
        client_private_key: None,
        client_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
    });
    Ok(config)
}
