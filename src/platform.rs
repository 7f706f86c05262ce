use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportLevel {
    Supported,
    Partial,
    Unsupported,
}

impl SupportLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SupportLevel::Supported => "supported",
            SupportLevel::Partial => "partial",
            SupportLevel::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlatformProfile {
    pub os: &'static str,
    pub arch: &'static str,
    pub tunnel_engine: SupportLevel,
    pub hardware_bootstrap: SupportLevel,
    pub supervisor_integration: SupportLevel,
    pub default_interface: &'static str,
    pub note: &'static str,
}

pub fn current() -> PlatformProfile {
    profile_for(std::env::consts::OS, std::env::consts::ARCH)
}

pub fn default_interface_name() -> &'static str {
    current().default_interface
}

fn profile_for(os: &'static str, arch: &'static str) -> PlatformProfile {
    match os {
        "linux" => PlatformProfile {
            os,
            arch,
            tunnel_engine: SupportLevel::Supported,
            hardware_bootstrap: SupportLevel::Supported,
            supervisor_integration: SupportLevel::Supported,
            default_interface: "cellguard0",
            note: "linux is the primary target: netlink routing, systemd watchdog, SIM helper",
        },
        "macos" => PlatformProfile {
            os,
            arch,
            tunnel_engine: SupportLevel::Supported,
            hardware_bootstrap: SupportLevel::Unsupported,
            supervisor_integration: SupportLevel::Unsupported,
            // the kernel picks the next free utunN
            default_interface: "utun",
            note: "routing via ifconfig/route; no SIM helper",
        },
        "freebsd" | "openbsd" | "netbsd" | "dragonfly" => PlatformProfile {
            os,
            arch,
            tunnel_engine: SupportLevel::Partial,
            hardware_bootstrap: SupportLevel::Unsupported,
            supervisor_integration: SupportLevel::Unsupported,
            default_interface: "cellguard0",
            note: "routing via ifconfig/route; userspace engine is experimental",
        },
        "windows" => PlatformProfile {
            os,
            arch,
            tunnel_engine: SupportLevel::Unsupported,
            hardware_bootstrap: SupportLevel::Unsupported,
            supervisor_integration: SupportLevel::Unsupported,
            default_interface: "cellguard0",
            note: "bootstrap and config commands only; no tunnel engine on this host",
        },
        _ => PlatformProfile {
            os,
            arch,
            tunnel_engine: SupportLevel::Unsupported,
            hardware_bootstrap: SupportLevel::Unsupported,
            supervisor_integration: SupportLevel::Unsupported,
            default_interface: "cellguard0",
            note: "this platform is not a target yet; bootstrap commands only",
        },
    }
}

pub fn require_hardware_bootstrap() -> Result<()> {
    require_hardware_bootstrap_for(current())
}

pub fn require_tunnel_engine(command_name: &str) -> Result<()> {
    require_tunnel_engine_for(current(), command_name)
}

fn require_hardware_bootstrap_for(profile: PlatformProfile) -> Result<()> {
    if profile.hardware_bootstrap == SupportLevel::Supported {
        return Ok(());
    }
    Err(Error::unsupported(format!(
        "SIM bootstrap is only supported on linux (host: {}-{})",
        profile.os, profile.arch
    )))
}

fn require_tunnel_engine_for(profile: PlatformProfile, command_name: &str) -> Result<()> {
    if profile.tunnel_engine != SupportLevel::Unsupported {
        return Ok(());
    }
    Err(Error::unsupported(format!(
        "{} needs a tunnel engine, which is unavailable on host: {}-{}; use bootstrap/config commands on this platform",
        command_name, profile.os, profile.arch
    )))
}

#[cfg(test)]
mod tests {
    use super::{
        current, profile_for, require_hardware_bootstrap_for, require_tunnel_engine_for,
        SupportLevel,
    };
    use crate::error::Error;

    #[test]
    fn current_platform_has_non_empty_identity() {
        let profile = current();
        assert!(!profile.os.is_empty());
        assert!(!profile.arch.is_empty());
        assert!(!profile.default_interface.is_empty());
    }

    #[test]
    fn linux_is_expected_to_be_fully_supported() {
        let profile = profile_for("linux", "aarch64");
        assert_eq!(profile.tunnel_engine, SupportLevel::Supported);
        assert_eq!(profile.hardware_bootstrap, SupportLevel::Supported);
        assert_eq!(profile.default_interface, "cellguard0");
        require_hardware_bootstrap_for(profile).expect("linux supports the SIM helper");
    }

    #[test]
    fn macos_uses_utun_prefix() {
        assert_eq!(profile_for("macos", "aarch64").default_interface, "utun");
    }

    #[test]
    fn hardware_bootstrap_elsewhere_is_unsupported() {
        let err = require_hardware_bootstrap_for(profile_for("macos", "x86_64"))
            .expect_err("macos has no SIM helper");
        assert!(matches!(err, Error::UnsupportedPlatform(_)));
        assert!(err.to_string().contains("only supported on linux"));
    }

    #[test]
    fn missing_engine_returns_clear_error() {
        let err = require_tunnel_engine_for(profile_for("windows", "x86_64"), "up")
            .expect_err("windows has no engine");
        let text = err.to_string();
        assert!(text.contains("up needs a tunnel engine"));
        assert_eq!(SupportLevel::Unsupported.as_str(), "unsupported");
    }

    #[test]
    fn partial_engine_is_accepted_for_experimental_platforms() {
        require_tunnel_engine_for(profile_for("freebsd", "x86_64"), "up")
            .expect("partial engine support should pass");
    }
}
