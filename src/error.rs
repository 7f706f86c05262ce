//! Error taxonomy shared by the provisioning and tunnel modules.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing local configuration or credentials.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provisioning endpoint answered with status >= 400.
    #[error("{status}: {method} {url}: {body}")]
    Remote {
        status: u16,
        method: String,
        url: String,
        body: String,
    },

    /// The hardware bootstrap helper is missing, failed, or printed garbage.
    #[error("external tool error: {0}")]
    ExternalTool(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// The tunnel engine failed to start or rejected its configuration.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("failed to run {stage}({index}) \"{command}\": {reason}")]
    Hook {
        stage: &'static str,
        index: usize,
        command: String,
        reason: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Error::Engine(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedPlatform(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_reports_status_method_url_and_body() {
        let err = Error::Remote {
            status: 401,
            method: "POST".to_string(),
            url: "https://api.example.com/v1/auth".to_string(),
            body: "{\"code\":\"AUM0001\"}".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("401: POST https://api.example.com/v1/auth"));
        assert!(text.contains("AUM0001"));
    }
}
