use crate::error::{Error, Result};
use crate::keys::Key;
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

pub const DEFAULT_ENDPOINT_PORT: u16 = 11010;

/// UDP endpoint of the remote peer. The text it was parsed from is kept so the
/// config file round-trips unchanged even when it names a host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    raw: String,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint {
            ip,
            port,
            raw: String::new(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (host, port) = split_host_port(text);
        let port = match port {
            Some(port) => parse_port(port)?,
            None => DEFAULT_ENDPOINT_PORT,
        };
        if host.is_empty() {
            return Err(Error::config(format!("invalid endpoint \"{}\": empty host", text)));
        }
        let ip = resolve_host(host)?;
        Ok(Endpoint {
            ip,
            port,
            raw: text.to_string(),
        })
    }
}

fn split_host_port(text: &str) -> (&str, Option<&str>) {
    if let Some(rest) = text.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':'));
        }
        return (text, None);
    }
    match text.matches(':').count() {
        1 => {
            let (host, port) = text.split_once(':').unwrap_or((text, ""));
            (host, Some(port))
        }
        // no colon, or a bare IPv6 literal
        _ => (text, None),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u32>()
        .ok()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| {
            Error::config(format!(
                "invalid endpoint port number: {}, it should be a 16-bit unsigned integer",
                port
            ))
        })
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|err| Error::config(format!("invalid endpoint \"{}\": {}", host, err)))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::config(format!("invalid endpoint \"{}\": no address", host)))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "{}", self.socket_addr())
        } else {
            f.write_str(&self.raw)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Endpoint::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A network routed into the tunnel, always held at its base address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllowedRange(IpNet);

impl AllowedRange {
    pub fn new(net: IpNet) -> Self {
        AllowedRange(net.trunc())
    }

    pub fn net(&self) -> IpNet {
        self.0
    }

    pub fn addr(&self) -> IpAddr {
        self.0.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn netmask(&self) -> IpAddr {
        self.0.netmask()
    }

    pub fn is_host(&self) -> bool {
        self.0.prefix_len() == self.0.max_prefix_len()
    }

    pub fn overlaps(&self, other: &AllowedRange) -> bool {
        self.0.contains(&other.0.network()) || other.0.contains(&self.0.network())
    }
}

impl fmt::Display for AllowedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0.network(), self.0.prefix_len())
    }
}

impl FromStr for AllowedRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let net: IpNet = s
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid CIDR address: {}", s.trim())))?;
        Ok(AllowedRange::new(net))
    }
}

impl Serialize for AllowedRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AllowedRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Peer parameters issued by the provisioning service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "arcServerPeerPublicKey", alias = "ArcServerPeerPublicKey")]
    pub server_public_key: Key,
    #[serde(rename = "arcServerEndpoint", alias = "ArcServerEndpoint")]
    pub server_endpoint: Endpoint,
    #[serde(rename = "arcAllowedIPs", alias = "ArcAllowedIPs", default)]
    pub allowed_ranges: Vec<AllowedRange>,
    /// Only ever received; the persisted config keeps the local key at its top level.
    #[serde(
        rename = "arcClientPeerPrivateKey",
        alias = "ArcClientPeerPrivateKey",
        default,
        skip_serializing
    )]
    pub client_private_key: Option<Key>,
    #[serde(rename = "arcClientPeerIpAddress", alias = "ArcClientPeerIpAddress")]
    pub client_address: IpAddr,
}

/// Credentials for the registration API.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("auth_key_id", &self.auth_key_id)
            .field("auth_key", &"(hidden)")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub auth_key_id: String,
    pub auth_key: String,
    pub token_timeout_seconds: u64,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub api_key: String,
    pub token: String,
}

#[derive(Clone, Serialize)]
pub struct CreateSimRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub subscription: String,
}

/// A virtual subscriber as returned by `POST /sims`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSim {
    #[serde(default)]
    pub operator_id: String,
    #[serde(default)]
    pub status: String,
    pub sim_id: String,
    #[serde(rename = "arcSessionStatus", default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub profiles: HashMap<String, SimProfile>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimProfile {
    #[serde(default)]
    pub iccid: String,
    #[serde(default)]
    pub arc_client_peer_private_key: String,
    #[serde(default)]
    pub arc_client_peer_public_key: String,
    #[serde(default)]
    pub primary_imsi: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn endpoint_without_port_defaults() {
        let endpoint: Endpoint = "192.0.2.2".parse().unwrap();
        assert_eq!(endpoint.ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)));
        assert_eq!(endpoint.port, DEFAULT_ENDPOINT_PORT);
        assert_eq!(endpoint.to_string(), "192.0.2.2");
    }

    #[test]
    fn endpoint_with_port() {
        let endpoint: Endpoint = "192.0.2.2:22212".parse().unwrap();
        assert_eq!(endpoint.port, 22212);
        assert_eq!(endpoint.socket_addr(), "192.0.2.2:22212".parse().unwrap());
    }

    #[test]
    fn endpoint_rejects_out_of_range_port() {
        let err = Endpoint::parse("192.0.2.2:70000").unwrap_err();
        assert!(err.to_string().contains("70000"));
        assert!(Endpoint::parse("192.0.2.2:http").is_err());
    }

    #[test]
    fn endpoint_accepts_ipv6_forms() {
        let bracketed: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(bracketed.port, 51820);
        let bare: Endpoint = "2001:db8::1".parse().unwrap();
        assert_eq!(bare.port, DEFAULT_ENDPOINT_PORT);
        assert_eq!(bare.ip, bracketed.ip);
    }

    #[test]
    fn endpoint_resolves_names_once_and_keeps_text() {
        let endpoint: Endpoint = "localhost:11010".parse().unwrap();
        assert!(endpoint.ip.is_loopback());
        assert_eq!(endpoint.raw(), "localhost:11010");
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"localhost:11010\"");
    }

    #[test]
    fn constructed_endpoint_serializes_socket_addr() {
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 11010);
        assert_eq!(endpoint.to_string(), "198.51.100.1:11010");
    }

    #[test]
    fn allowed_range_normalizes_to_base_address() {
        let range: AllowedRange = "100.127.10.17/24".parse().unwrap();
        assert_eq!(range.to_string(), "100.127.10.0/24");
        assert!(!range.is_host());
        let host: AllowedRange = "100.127.10.17/32".parse().unwrap();
        assert!(host.is_host());
        assert!("100.127.10.0/33".parse::<AllowedRange>().is_err());
        assert!("nonsense".parse::<AllowedRange>().is_err());
    }

    #[test]
    fn allowed_range_overlap() {
        let a: AllowedRange = "10.0.0.0/24".parse().unwrap();
        let b: AllowedRange = "10.0.0.128/25".parse().unwrap();
        let c: AllowedRange = "10.0.1.0/24".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn session_never_emits_client_private_key() {
        let json = r#"{
            "arcServerPeerPublicKey": "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=",
            "arcServerEndpoint": "192.0.2.2:22212",
            "arcAllowedIPs": ["203.0.113.0/24", "100.127.0.0/16"],
            "arcClientPeerPrivateKey": "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=",
            "arcClientPeerIpAddress": "198.51.100.2"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert!(session.client_private_key.is_some());

        let emitted = serde_json::to_string(&session).unwrap();
        assert!(!emitted.contains("arcClientPeerPrivateKey"));
        assert!(!emitted.contains("AgICAgIC"));

        let reparsed: Session = serde_json::from_str(&emitted).unwrap();
        assert_eq!(reparsed.server_endpoint, session.server_endpoint);
        assert_eq!(reparsed.server_public_key, session.server_public_key);
        assert_eq!(reparsed.allowed_ranges, session.allowed_ranges);
        assert_eq!(reparsed.client_private_key, None);
    }

    #[test]
    fn session_accepts_pascal_case_keys() {
        let json = r#"{
            "ArcServerPeerPublicKey": "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=",
            "ArcServerEndpoint": "192.0.2.2:22212",
            "ArcAllowedIPs": ["203.0.113.0/24"],
            "ArcClientPeerIpAddress": "198.51.100.2"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.server_endpoint.port, 22212);
        assert_eq!(session.allowed_ranges.len(), 1);
    }

    #[test]
    fn profile_debug_hides_secret() {
        let profile = Profile {
            auth_key: "secret-abc".to_string(),
            auth_key_id: "keyId-abc".to_string(),
            endpoint: String::new(),
        };
        let text = format!("{:?}", profile);
        assert!(text.contains("keyId-abc"));
        assert!(!text.contains("secret-abc"));
    }
}
