mod bootstrap;
mod config;
mod engine;
mod error;
mod hooks;
mod keys;
mod logging;
mod metrics;
mod model;
mod netlink;
mod network;
mod platform;
mod process;
mod prompt;
mod provisioning;
mod supervisor;
mod tunnel;
#[cfg(unix)]
mod wg;
#[cfg(not(unix))]
mod wg_portable;

use anyhow::{anyhow, Context, Result};
use bootstrap::{
    bootstrap_and_persist, AuthKeyBootstrapper, Bootstrapper, CellularBootstrapper, SimBootstrapper,
    SimOptions, DEFAULT_HELPER_PATH,
};
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use config::{default_config_path, load_config, load_optional_config, sample_config, ClientConfig};
use model::{AllowedRange, Profile};
use network::PlatformConfigurator;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "cellguard", version, about = "WireGuard tunnel client for cellular devices")]
struct Args {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Obtain or refresh a session and write it to the config file.
    #[command(subcommand)]
    Bootstrap(BootstrapCommand),
    /// Bring the tunnel up and keep it running until signalled.
    Up {
        #[arg(long)]
        mtu: Option<u32>,
        #[arg(long, value_name = "SECONDS")]
        persistent_keepalive: Option<u16>,
        #[arg(long, value_name = "CIDR", value_delimiter = ',', action = ArgAction::Append)]
        additional_allowed_ips: Vec<AllowedRange>,
        /// Read the config JSON from standard input instead of the config file.
        #[arg(long)]
        read_stdin: bool,
        #[arg(long)]
        reject_overlapping_ranges: bool,
    },
    /// Print a sample config.
    Config,
    /// Print the config as a WireGuard configuration file.
    WgConfig,
    /// Show userspace WireGuard devices.
    Status,
    Version,
}

#[derive(Subcommand, Debug)]
enum BootstrapCommand {
    /// Authenticate with an API key pair.
    Authkey {
        #[arg(long, env = "CELLGUARD_AUTH_KEY_ID")]
        auth_key_id: Option<String>,
        #[arg(long, env = "CELLGUARD_AUTH_KEY")]
        auth_key: Option<String>,
        #[arg(long, default_value = "jp", value_parser = ["g", "jp"])]
        coverage_type: String,
    },
    /// Authenticate through the cellular network.
    Cellular {
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
        /// Print the resulting config instead of writing it.
        #[arg(long)]
        stdout: bool,
    },
    /// Authenticate with the SIM through the helper tool.
    Sim(SimArgs),
}

#[derive(ClapArgs, Debug)]
struct SimArgs {
    #[arg(long, default_value = DEFAULT_HELPER_PATH, value_name = "PATH")]
    helper_path: PathBuf,
    #[arg(long, default_value = "SHA-256")]
    signature_algorithm: String,
    #[arg(long, default_value = "autoDetect")]
    interface: String,
    #[arg(long)]
    port_name: Option<String>,
    #[arg(long, default_value_t = 57600)]
    baud_rate: u32,
    #[arg(long, default_value_t = 8)]
    data_bits: u32,
    #[arg(long, default_value_t = 1)]
    stop_bits: u32,
    #[arg(long, default_value_t = 0)]
    parity_mode: u32,
    #[arg(long, value_name = "URL")]
    provisioning_api_endpoint_url: Option<String>,
    #[arg(long, value_name = "URL")]
    keys_api_endpoint_url: Option<String>,
    #[arg(long, value_name = "JSON")]
    params: Option<String>,
    #[arg(long)]
    disable_key_cache: bool,
    #[arg(long)]
    clear_key_cache: bool,
}

impl From<SimArgs> for SimOptions {
    fn from(args: SimArgs) -> Self {
        SimOptions {
            helper_path: args.helper_path,
            signature_algorithm: args.signature_algorithm,
            interface: args.interface,
            port_name: args.port_name,
            baud_rate: args.baud_rate,
            data_bits: args.data_bits,
            stop_bits: args.stop_bits,
            parity_mode: args.parity_mode,
            provisioning_endpoint: args.provisioning_api_endpoint_url,
            keys_endpoint: args.keys_api_endpoint_url,
            params: args.params,
            disable_key_cache: args.disable_key_cache,
            clear_key_cache: args.clear_key_cache,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    match args.command {
        Command::Bootstrap(command) => {
            logging::init(None)?;
            run_bootstrap(command, &config_path).await?;
        }
        Command::Up {
            mtu,
            persistent_keepalive,
            additional_allowed_ips,
            read_stdin,
            reject_overlapping_ranges,
        } => {
            let mut config = if read_stdin {
                read_config_from_stdin()?
            } else {
                load_config(&config_path)?
            };
            logging::init(Some(config.log_level))?;
            platform::require_tunnel_engine("up")?;
            if let Some(mtu) = mtu {
                config.set_mtu(mtu);
            }
            if let Some(seconds) = persistent_keepalive {
                config.set_persistent_keepalive(seconds);
            }
            config.add_allowed_ranges(additional_allowed_ips);
            if reject_overlapping_ranges {
                config.set_reject_overlapping_ranges(true);
            }
            if logging::verbose() {
                info!("\n{}", config.wireguard_config(true)?);
            }

            let factory = engine::default_factory();
            let report = tunnel::run(
                &config,
                factory.as_ref(),
                &PlatformConfigurator::current(),
                supervisor::detect(),
                CancellationToken::new(),
            )
            .await?;
            info!(
                interface = %report.interface,
                termination = ?report.termination,
                hook_failures = report.hook_failures,
                "tunnel stopped"
            );
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&sample_config()?)?);
        }
        Command::WgConfig => {
            let config = load_config(&config_path)?;
            print!("{}", config.wireguard_config(false)?);
        }
        Command::Status => {
            logging::init(None)?;
            print!("{}", device_report()?);
        }
        Command::Version => {
            let profile = platform::current();
            let payload = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "userAgent": provisioning::user_agent(),
                "platform": {
                    "os": profile.os,
                    "arch": profile.arch,
                    "tunnelEngine": profile.tunnel_engine.as_str(),
                    "hardwareBootstrap": profile.hardware_bootstrap.as_str(),
                    "supervisorIntegration": profile.supervisor_integration.as_str(),
                    "defaultInterface": profile.default_interface,
                    "note": profile.note,
                },
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

async fn run_bootstrap(command: BootstrapCommand, config_path: &Path) -> Result<()> {
    let verbose = logging::verbose();
    let bootstrapper = match command {
        BootstrapCommand::Authkey {
            auth_key_id,
            auth_key,
            coverage_type,
        } => {
            let cached = load_optional_config(config_path)?.and_then(|config| config.profile);
            let profile = match (cached, auth_key_id, auth_key) {
                (Some(profile), _, _) => {
                    debug!("using the profile stored in the config");
                    profile
                }
                (None, Some(auth_key_id), Some(auth_key)) => Profile {
                    auth_key,
                    auth_key_id,
                    endpoint: provisioning::endpoint_for_coverage(&coverage_type).to_string(),
                },
                (None, _, _) if std::io::stdin().is_terminal() => {
                    prompt::prompt_profile(&coverage_type)?
                }
                (None, _, _) => {
                    return Err(anyhow!(
                        "no stored profile; pass --auth-key-id and --auth-key"
                    ))
                }
            };
            Bootstrapper::AuthKey(AuthKeyBootstrapper { profile, verbose })
        }
        BootstrapCommand::Cellular { endpoint, stdout } => {
            let bootstrapper = CellularBootstrapper { endpoint, verbose };
            if stdout {
                let current = load_optional_config(config_path)?;
                let config = bootstrapper.execute(current).await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            Bootstrapper::Cellular(bootstrapper)
        }
        BootstrapCommand::Sim(args) => Bootstrapper::Sim(SimBootstrapper {
            options: args.into(),
            verbose,
        }),
    };

    let config = bootstrap_and_persist(&bootstrapper, config_path)
        .await
        .with_context(|| format!("{} bootstrap failed", bootstrapper.name()))?;
    report_bootstrap(&config, config_path);
    Ok(())
}

fn report_bootstrap(config: &ClientConfig, config_path: &Path) {
    if !config.sim_id.is_empty() {
        println!("Virtual SIM/Subscriber: {}", config.sim_id);
    }
    let shown = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    println!("Created/updated configuration file: {}", shown.display());
}

fn read_config_from_stdin() -> Result<ClientConfig> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read config from stdin")?;
    serde_json::from_str(&raw).context("failed to parse config from stdin")
}

#[cfg(unix)]
fn device_report() -> error::Result<String> {
    wg::device_report()
}

#[cfg(not(unix))]
fn device_report() -> error::Result<String> {
    wg_portable::device_report()
}
