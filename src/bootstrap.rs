use crate::config::{load_optional_config, save_config, ClientConfig};
use crate::error::{Error, Result};
use crate::keys::{Key, KeyPair};
use crate::model::{Profile, Session};
use crate::platform;
use crate::process;
use crate::provisioning::{CellularApi, CellularClient, RegistrationApi, RegistrationClient};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_HELPER_PATH: &str = "/usr/local/bin/krypton-cli";

const CONSOLE_HINT: &str = "open the provisioning console and check the virtual SIM status; \
the configuration has to be written by hand";

/// One way of obtaining a session. Exactly one is chosen per invocation.
pub enum Bootstrapper {
    AuthKey(AuthKeyBootstrapper),
    Cellular(CellularBootstrapper),
    Sim(SimBootstrapper),
}

impl Bootstrapper {
    pub async fn execute(&self, current: Option<ClientConfig>) -> Result<ClientConfig> {
        match self {
            Bootstrapper::AuthKey(bootstrapper) => bootstrapper.execute(current).await,
            Bootstrapper::Cellular(bootstrapper) => bootstrapper.execute(current).await,
            Bootstrapper::Sim(bootstrapper) => bootstrapper.execute(current).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bootstrapper::AuthKey(_) => "authkey",
            Bootstrapper::Cellular(_) => "cellular",
            Bootstrapper::Sim(_) => "sim",
        }
    }
}

/// Loads the config at `path` (if any), runs the strategy and writes the result.
/// Nothing is written when the strategy fails.
pub async fn bootstrap_and_persist(
    bootstrapper: &Bootstrapper,
    path: &Path,
) -> Result<ClientConfig> {
    let current = load_optional_config(path)?;
    info!(method = bootstrapper.name(), existing = current.is_some(), "bootstrapping");
    let config = bootstrapper.execute(current).await?;
    save_config(path, &config)?;
    Ok(config)
}

/// Creates a virtual SIM on first use; afterwards refreshes only the session of
/// the SIM already in the config.
pub struct AuthKeyBootstrapper {
    pub profile: Profile,
    pub verbose: bool,
}

impl AuthKeyBootstrapper {
    pub async fn execute(&self, current: Option<ClientConfig>) -> Result<ClientConfig> {
        let client = RegistrationClient::authenticate(&self.profile, self.verbose).await?;
        self.execute_with(&client, current).await
    }

    pub(crate) async fn execute_with(
        &self,
        api: &dyn RegistrationApi,
        current: Option<ClientConfig>,
    ) -> Result<ClientConfig> {
        match current {
            Some(mut config) => {
                if config.sim_id.is_empty() {
                    return Err(Error::config(
                        "existing config has no simId; remove it to create a new virtual SIM",
                    ));
                }
                let mut session = api.create_session(&config.sim_id).await?;
                session.client_private_key = None;
                config.session = Some(session);
                if config.profile.is_none() {
                    config.profile = Some(self.profile.clone());
                }
                Ok(config)
            }
            None => {
                let sim = api.create_virtual_sim().await?;
                let issued = sim.profiles.get(&sim.sim_id).ok_or_else(|| {
                    Error::config(format!(
                        "virtual SIM {} was created but the response carries no profile for it; {}",
                        sim.sim_id, CONSOLE_HINT
                    ))
                })?;
                let private_key = Key::from_base64(&issued.arc_client_peer_private_key)
                    .map_err(|_| issued_key_error(&sim.sim_id, "private"))?;
                let public_key = Key::from_base64(&issued.arc_client_peer_public_key)
                    .map_err(|_| issued_key_error(&sim.sim_id, "public"))?;
                let mut session = sim.session.clone().ok_or_else(|| {
                    Error::config(format!(
                        "virtual SIM {} was created without a session; {}",
                        sim.sim_id, CONSOLE_HINT
                    ))
                })?;
                session.client_private_key = None;

                let mut config = ClientConfig::fresh(
                    KeyPair {
                        private_key,
                        public_key,
                    },
                    sim.sim_id.clone(),
                );
                config.profile = Some(self.profile.clone());
                config.session = Some(session);
                info!(sim_id = %sim.sim_id, status = %sim.status, "virtual SIM created");
                Ok(config)
            }
        }
    }
}

fn issued_key_error(sim_id: &str, which: &str) -> Error {
    Error::config(format!(
        "virtual SIM {} was created but the issued {} key is not valid; {}",
        sim_id, which, CONSOLE_HINT
    ))
}

/// Replaces identity and session with what the service issued, keeping any
/// operational settings of an existing config.
fn adopt_session(current: Option<ClientConfig>, session: Session) -> Option<ClientConfig> {
    let keys = KeyPair::from_private(session.client_private_key?);
    let mut config = match current {
        Some(mut config) => {
            config.private_key = keys.private_key;
            config.public_key = keys.public_key;
            config
        }
        None => ClientConfig::fresh(keys, ""),
    };
    config.session = Some(session);
    Some(config)
}

pub struct CellularBootstrapper {
    pub endpoint: Option<String>,
    pub verbose: bool,
}

impl CellularBootstrapper {
    pub async fn execute(&self, current: Option<ClientConfig>) -> Result<ClientConfig> {
        let client = CellularClient::new(self.endpoint.as_deref(), self.verbose)?;
        self.execute_with(&client, current).await
    }

    pub(crate) async fn execute_with(
        &self,
        api: &dyn CellularApi,
        current: Option<ClientConfig>,
    ) -> Result<ClientConfig> {
        let session = api.bootstrap().await?;
        adopt_session(current, session)
            .ok_or_else(|| Error::config("bootstrap response carries no client private key"))
    }
}

/// Parameters passed to the SIM authentication helper.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub helper_path: PathBuf,
    pub signature_algorithm: String,
    pub interface: String,
    pub port_name: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u32,
    pub stop_bits: u32,
    pub parity_mode: u32,
    pub provisioning_endpoint: Option<String>,
    pub keys_endpoint: Option<String>,
    pub params: Option<String>,
    pub disable_key_cache: bool,
    pub clear_key_cache: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            helper_path: PathBuf::from(DEFAULT_HELPER_PATH),
            signature_algorithm: "SHA-256".to_string(),
            interface: "autoDetect".to_string(),
            port_name: None,
            baud_rate: 57600,
            data_bits: 8,
            stop_bits: 1,
            parity_mode: 0,
            provisioning_endpoint: None,
            keys_endpoint: None,
            params: None,
            disable_key_cache: false,
            clear_key_cache: false,
        }
    }
}

impl SimOptions {
    pub fn arguments(&self, debug: bool) -> Vec<String> {
        let required = [
            ("-operation", "bootstrapArc".to_string()),
            ("-signature-algorithm", self.signature_algorithm.clone()),
            ("-interface", self.interface.clone()),
            ("-baud-rate", self.baud_rate.to_string()),
            ("-data-bits", self.data_bits.to_string()),
            ("-stop-bits", self.stop_bits.to_string()),
            ("-parity-mode", self.parity_mode.to_string()),
        ];
        let mut args = Vec::new();
        for (flag, value) in required {
            args.push(flag.to_string());
            args.push(value);
        }

        let optional = [
            ("-provisioning-api-endpoint-url", &self.provisioning_endpoint),
            ("-params", &self.params),
            ("-keys-api-endpoint-url", &self.keys_endpoint),
            ("-port-name", &self.port_name),
        ];
        for (flag, value) in optional {
            if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        if self.disable_key_cache {
            args.push("-disable-key-cache".to_string());
        }
        if self.clear_key_cache {
            args.push("-clear-key-cache".to_string());
        }
        if debug {
            args.push("-debug".to_string());
        }
        args
    }
}

pub struct SimBootstrapper {
    pub options: SimOptions,
    pub verbose: bool,
}

impl SimBootstrapper {
    pub async fn execute(&self, current: Option<ClientConfig>) -> Result<ClientConfig> {
        platform::require_hardware_bootstrap()?;
        let helper = &self.options.helper_path;
        if !helper.exists() {
            return Err(Error::ExternalTool(format!(
                "{} does not exist",
                helper.display()
            )));
        }

        let mut argv = vec![helper.display().to_string()];
        argv.extend(self.options.arguments(self.verbose));
        info!(helper = %helper.display(), "running SIM authentication helper");
        let output = process::run(&argv).await?;
        if self.verbose {
            info!(output = %output.stdout.trim(), "helper response");
        }

        let session: Session = serde_json::from_str(output.stdout.trim()).map_err(|err| {
            Error::ExternalTool(format!(
                "unexpected response from {}: {}\n-----\n{}",
                helper.display(),
                err,
                output.stdout
            ))
        })?;
        adopt_session(current, session).ok_or_else(|| {
            Error::ExternalTool(format!(
                "{} returned a session without a client private key",
                helper.display()
            ))
        })
    }
}
