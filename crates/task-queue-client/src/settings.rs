use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Connection settings for the remote task queue service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the service API, e.g. `http://localhost:8080/api`
    pub server_url: String,
    pub auth_key: Option<String>,
    pub auth_secret: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_url: "http://localhost:8080/api".to_string(),
            auth_key: None,
            auth_secret: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl ClientSettings {
    pub fn new(server_url: impl Into<String>) -> Self {
        ClientSettings {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Load from `CONDUCTOR_SERVER_URL`, `CONDUCTOR_AUTH_KEY` and
    /// `CONDUCTOR_AUTH_SECRET`, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::with_prefix("CONDUCTOR"))
            .build()?;

        config.try_deserialize()
    }

    pub fn with_auth(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self.auth_secret = Some(secret.into());
        self
    }

    pub fn has_auth(&self) -> bool {
        self.auth_key.is_some() && self.auth_secret.is_some()
    }

    /// `server_url` without a trailing slash
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ClientSettings::default();
        assert_eq!(settings.base_url(), "http://localhost:8080/api");
        assert!(!settings.has_auth());
    }

    #[test]
    fn test_base_url_trims_slash() {
        let settings = ClientSettings::new("http://queue:8080/api/").with_auth("k", "s");
        assert_eq!(settings.base_url(), "http://queue:8080/api");
        assert!(settings.has_auth());
    }
}
