//! Environment-driven server configuration.

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("REQUIRE_GITHUB_AUTH is set but JWT_SECRET is not configured")]
    MissingJwtSecret,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// When true, every WebSocket upgrade also requires a valid identity token.
    pub require_github_auth: bool,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,
    pub jwt_secret: Option<String>,
    pub cors_origin: String,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4321,
            tls_cert: None,
            tls_key: None,
            require_github_auth: false,
            github_client_id: None,
            github_client_secret: None,
            jwt_secret: None,
            cors_origin: "*".to_string(),
            data_dir: PathBuf::from("./data/yjs-docs"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.port = p,
                Err(_) => warn!(value = %port, "invalid PORT, using default"),
            }
        }

        let cert = std::env::var("TLS_CERT").ok().filter(|v| !v.is_empty());
        let key = std::env::var("TLS_KEY").ok().filter(|v| !v.is_empty());
        match (cert, key) {
            (Some(c), Some(k)) => {
                config.tls_cert = Some(PathBuf::from(c));
                config.tls_key = Some(PathBuf::from(k));
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("TLS_CERT and TLS_KEY must both be set; serving plain HTTP");
            }
            (None, None) => {}
        }

        if let Ok(val) = std::env::var("REQUIRE_GITHUB_AUTH") {
            config.require_github_auth = val == "true" || val == "1";
        }

        config.github_client_id = std::env::var("GITHUB_CLIENT_ID")
            .ok()
            .filter(|v| !v.is_empty());
        config.github_client_secret = std::env::var("GITHUB_CLIENT_SECRET")
            .ok()
            .filter(|v| !v.is_empty());
        config.jwt_secret = std::env::var("JWT_SECRET").ok().filter(|v| !v.is_empty());

        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            if !origin.is_empty() {
                config.cors_origin = origin;
            }
        }

        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup aborts on an identity gate with nothing to verify against.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.require_github_auth && self.jwt_secret.is_none() {
            return Err(ConfigError::MissingJwtSecret);
        }
        Ok(())
    }

    pub fn tls_pair(&self) -> Option<(&std::path::Path, &std::path::Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}
