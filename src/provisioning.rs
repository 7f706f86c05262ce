use crate::error::{Error, Result};
use crate::model::{AuthRequest, AuthResponse, CreateSimRequest, Profile, Session, VirtualSim};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

pub const DEFAULT_API_ENDPOINT: &str = "https://api.soracom.io";
pub const GLOBAL_API_ENDPOINT: &str = "https://g.api.soracom.io";
pub const DEFAULT_CELLULAR_ENDPOINT: &str = "https://krypton.soracom.io:8036";
pub const TOKEN_TIMEOUT_SECONDS: u64 = 300;

const SECRET_HEADERS: [&str; 2] = ["X-Soracom-API-Key", "X-Soracom-Token"];

const VIRTUAL_SIM_TYPE: &str = "virtual";
const VIRTUAL_SIM_SUBSCRIPTION: &str = "planArc01";

pub fn user_agent() -> String {
    format!(
        "cellguard/{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// API endpoint for a coverage type given on the command line.
pub fn endpoint_for_coverage(coverage: &str) -> &'static str {
    if coverage == "g" {
        GLOBAL_API_ENDPOINT
    } else {
        DEFAULT_API_ENDPOINT
    }
}

/// Operations the key-authenticated bootstrap needs once a token is held.
#[async_trait]
pub trait RegistrationApi: Send + Sync {
    async fn create_virtual_sim(&self) -> Result<VirtualSim>;
    async fn create_session(&self, sim_id: &str) -> Result<Session>;
}

#[async_trait]
pub trait CellularApi: Send + Sync {
    async fn bootstrap(&self) -> Result<Session>;
}

#[derive(Clone)]
struct Credentials {
    api_key: String,
    token: String,
}

/// JSON-over-HTTPS request helper shared by both clients. Any status >= 400 is a
/// `Remote` error carrying the response body; nothing is retried.
struct ApiTransport {
    client: reqwest::Client,
    verbose: bool,
}

impl ApiTransport {
    fn new(verbose: bool) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, verbose })
    }

    async fn post<B, T>(
        &self,
        url: &str,
        body: &B,
        credentials: Option<&Credentials>,
        sensitive: bool,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_string(body)?;
        let headers = request_headers(credentials);
        let mut request = self.client.post(url);
        for (name, value) in &headers {
            request = request.header(*name, value);
        }
        if self.verbose {
            info!(
                method = "POST",
                url,
                headers = %dump_headers(&headers),
                body = if sensitive { "(redacted)" } else { payload.as_str() },
                "request dump"
            );
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if self.verbose {
            info!(
                status = status.as_u16(),
                body = if sensitive && status.is_success() { "(redacted)" } else { text.as_str() },
                "response dump"
            );
        }
        if status.as_u16() >= 400 {
            return Err(Error::Remote {
                status: status.as_u16(),
                method: "POST".to_string(),
                url: url.to_string(),
                body: text,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn request_headers(credentials: Option<&Credentials>) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Content-Type", "application/json".to_string()),
        ("User-Agent", user_agent()),
        ("X-Soracom-Lang", "en".to_string()),
    ];
    if let Some(credentials) = credentials {
        headers.push(("X-Soracom-API-Key", credentials.api_key.clone()));
        headers.push(("X-Soracom-Token", credentials.token.clone()));
    }
    headers
}

fn dump_headers(headers: &[(&str, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            if SECRET_HEADERS.contains(name) {
                format!("{}: (redacted)", name)
            } else {
                format!("{}: {}", name, value)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/v1/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub fn validate_profile(profile: &Profile) -> Result<()> {
    if !profile.auth_key_id.starts_with("keyId-") {
        return Err(Error::config(format!(
            "invalid AuthKeyId \"{}\": it must start with \"keyId-\"",
            profile.auth_key_id
        )));
    }
    if !profile.auth_key.starts_with("secret-") {
        return Err(Error::config(
            "invalid AuthKey: it must start with \"secret-\"",
        ));
    }
    Ok(())
}

/// Client for the device registration API. Only obtainable through
/// [`RegistrationClient::authenticate`], so every call carries a token.
pub struct RegistrationClient {
    transport: ApiTransport,
    endpoint: String,
    credentials: Credentials,
}

impl RegistrationClient {
    pub async fn authenticate(profile: &Profile, verbose: bool) -> Result<Self> {
        validate_profile(profile)?;
        let endpoint = if profile.endpoint.trim().is_empty() {
            DEFAULT_API_ENDPOINT.to_string()
        } else {
            profile.endpoint.trim().to_string()
        };
        let transport = ApiTransport::new(verbose)?;
        let request = AuthRequest {
            auth_key_id: profile.auth_key_id.clone(),
            auth_key: profile.auth_key.clone(),
            token_timeout_seconds: TOKEN_TIMEOUT_SECONDS,
        };
        let response: AuthResponse = transport
            .post(&join_url(&endpoint, "/auth"), &request, None, true)
            .await?;
        Ok(Self {
            transport,
            endpoint,
            credentials: Credentials {
                api_key: response.api_key,
                token: response.token,
            },
        })
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.transport
            .post(
                &join_url(&self.endpoint, path),
                body,
                Some(&self.credentials),
                false,
            )
            .await
    }
}

#[async_trait]
impl RegistrationApi for RegistrationClient {
    async fn create_virtual_sim(&self) -> Result<VirtualSim> {
        let request = CreateSimRequest {
            kind: VIRTUAL_SIM_TYPE.to_string(),
            subscription: VIRTUAL_SIM_SUBSCRIPTION.to_string(),
        };
        self.call("/sims", &request).await
    }

    async fn create_session(&self, sim_id: &str) -> Result<Session> {
        // the SIM already carries its credential, so the body is empty
        self.call(&format!("/sims/{}/sessions/arc", sim_id), &serde_json::json!({}))
            .await
    }
}

/// Client for the bootstrap endpoint that trusts the cellular network path.
pub struct CellularClient {
    transport: ApiTransport,
    endpoint: String,
}

impl CellularClient {
    pub fn new(endpoint: Option<&str>, verbose: bool) -> Result<Self> {
        let endpoint = endpoint
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .unwrap_or(DEFAULT_CELLULAR_ENDPOINT)
            .to_string();
        Ok(Self {
            transport: ApiTransport::new(verbose)?,
            endpoint,
        })
    }
}

#[async_trait]
impl CellularApi for CellularClient {
    async fn bootstrap(&self) -> Result<Session> {
        self.transport
            .post(
                &join_url(&self.endpoint, "/provisioning/soracom/arc/bootstrap"),
                &serde_json::json!({}),
                None,
                false,
            )
            .await
    }
}
