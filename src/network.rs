use crate::error::{Error, Result};
use crate::model::AllowedRange;
use crate::netlink::Netlink;
use crate::process;
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::debug;

/// Assigns the tunnel address and installs one route per allowed range.
#[async_trait]
pub trait InterfaceConfigurator: Send + Sync {
    async fn configure(
        &self,
        interface: &str,
        address: IpAddr,
        ranges: &[AllowedRange],
    ) -> Result<()>;
}

/// The configurator for a host OS, picked once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformConfigurator {
    Linux,
    Bsd,
    Windows,
    Unsupported(&'static str),
}

impl PlatformConfigurator {
    pub fn current() -> Self {
        Self::for_os(std::env::consts::OS)
    }

    pub fn for_os(os: &'static str) -> Self {
        match os {
            "linux" => PlatformConfigurator::Linux,
            "macos" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" => PlatformConfigurator::Bsd,
            "windows" => PlatformConfigurator::Windows,
            other => PlatformConfigurator::Unsupported(other),
        }
    }
}

#[async_trait]
impl InterfaceConfigurator for PlatformConfigurator {
    async fn configure(
        &self,
        interface: &str,
        address: IpAddr,
        ranges: &[AllowedRange],
    ) -> Result<()> {
        match self {
            PlatformConfigurator::Linux => configure_netlink(interface, address, ranges).await,
            PlatformConfigurator::Bsd => {
                run_all(&bsd_commands(interface, address, ranges)).await
            }
            PlatformConfigurator::Windows => {
                run_all(&windows_commands(interface, address, ranges)).await
            }
            PlatformConfigurator::Unsupported(os) => Err(Error::unsupported(format!(
                "no interface configurator for {}",
                os
            ))),
        }
    }
}

async fn configure_netlink(
    interface: &str,
    address: IpAddr,
    ranges: &[AllowedRange],
) -> Result<()> {
    let netlink = Netlink::new().await?;
    let index = netlink
        .link_index(interface)
        .await?
        .ok_or_else(|| Error::config(format!("interface {} not found", interface)))?;
    let host_prefix = if address.is_ipv4() { 32 } else { 128 };
    debug!(%address, "assign address");
    netlink.replace_address(index, address, host_prefix).await?;
    debug!("set link up");
    netlink.set_link_up(index).await?;
    for range in ranges {
        debug!(%range, "add route");
        netlink.replace_link_route(range.net(), index).await?;
    }
    Ok(())
}

async fn run_all(commands: &[Vec<String>]) -> Result<()> {
    for command in commands {
        debug!(command = %command.join(" "), "configure interface");
        process::run(command).await?;
    }
    Ok(())
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|token| token.to_string()).collect()
}

/// `ifconfig` for the address, then a host route for single-address ranges and a
/// network route for the rest.
pub fn bsd_commands(interface: &str, address: IpAddr, ranges: &[AllowedRange]) -> Vec<Vec<String>> {
    let address = address.to_string();
    let mut commands = vec![argv(&["ifconfig", interface, &address, &address])];
    for range in ranges {
        let command = if range.is_host() {
            argv(&[
                "route",
                "add",
                "-host",
                &range.addr().to_string(),
                "-interface",
                interface,
            ])
        } else {
            argv(&["route", "add", "-net", &range.to_string(), "-interface", interface])
        };
        commands.push(command);
    }
    commands
}

/// `netsh` static address plus one persistent route per range.
pub fn windows_commands(
    interface: &str,
    address: IpAddr,
    ranges: &[AllowedRange],
) -> Vec<Vec<String>> {
    let mut commands = vec![argv(&[
        "netsh",
        "interface",
        "ip",
        "set",
        "address",
        interface,
        "static",
        &address.to_string(),
        "255.255.255.255",
    ])];
    for range in ranges {
        commands.push(argv(&[
            "netsh",
            "routing",
            "ip",
            "add",
            "persistentroute",
            &format!("dest={}", range.addr()),
            &format!("mask={}", range.netmask()),
            &format!("name={}", interface),
        ]));
    }
    commands
}
