use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

/// Service configuration, loaded from `config.toml` and `CHAT_RELAY_`
/// environment variables (environment wins).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// Endpoint settings for the four upstream providers. Base URLs are
/// overridable so tests can point adapters at a local mock server.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderEndpoint::groq")]
    pub groq: ProviderEndpoint,
    #[serde(default = "ProviderEndpoint::openai")]
    pub openai: ProviderEndpoint,
    #[serde(default = "ProviderEndpoint::anthropic")]
    pub anthropic: ProviderEndpoint,
    #[serde(default = "ProviderEndpoint::google")]
    pub google: ProviderEndpoint,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProviderEndpoint {
    pub api_base: String,
    /// Service-level key. Only meaningful for Groq, which serves the free
    /// tier on the relay's own account; the paid providers use per-user
    /// credentials resolved at dispatch time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

impl ProviderEndpoint {
    fn with_base(api_base: &str) -> Self {
        Self {
            api_base: api_base.to_string(),
            api_key: None,
            timeout_seconds: default_provider_timeout(),
        }
    }

    fn groq() -> Self {
        Self::with_base("https://api.groq.com/openai/v1")
    }

    fn openai() -> Self {
        Self::with_base("https://api.openai.com/v1")
    }

    fn anthropic() -> Self {
        Self::with_base("https://api.anthropic.com/v1")
    }

    fn google() -> Self {
        Self::with_base("https://generativelanguage.googleapis.com/v1beta")
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            groq: ProviderEndpoint::groq(),
            openai: ProviderEndpoint::openai(),
            anthropic: ProviderEndpoint::anthropic(),
            google: ProviderEndpoint::google(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}
fn default_provider_timeout() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration from `config.toml` merged with environment overrides.
pub fn load_config() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("config.toml"))
        .merge(Env::prefixed("CHAT_RELAY_").split("__"))
        .extract()
        .context("Failed to load configuration from config.toml or environment variables")?;

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.server.request_timeout_seconds == 0 {
            anyhow::bail!("Request timeout must be greater than 0");
        }
        for (name, endpoint) in [
            ("groq", &self.providers.groq),
            ("openai", &self.providers.openai),
            ("anthropic", &self.providers.anthropic),
            ("google", &self.providers.google),
        ] {
            endpoint
                .validate()
                .with_context(|| format!("Provider '{name}' configuration validation failed"))?;
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}': must be one of {:?}",
                self.logging.level,
                valid_levels
            );
        }
        Ok(())
    }

    /// Localhost configuration used by tests.
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                request_timeout_seconds: default_request_timeout(),
            },
            providers: ProvidersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProviderEndpoint {
    pub fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            anyhow::bail!("Provider API base URL cannot be empty");
        }
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            anyhow::bail!("Provider API base URL must start with http:// or https://");
        }
        if self.timeout_seconds == 0 || self.timeout_seconds > 600 {
            anyhow::bail!("Provider timeout must be between 1 and 600 seconds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_real_endpoints() {
        let providers = ProvidersConfig::default();
        assert!(providers.groq.api_base.contains("api.groq.com"));
        assert!(providers.google.api_base.contains("googleapis.com"));
        assert!(providers.groq.api_key.is_none());
    }

    #[test]
    fn validation_rejects_bad_endpoint_scheme() {
        let mut config = Config::for_tests();
        config.providers.openai.api_base = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_log_level() {
        let mut config = Config::for_tests();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_is_valid() {
        assert!(Config::for_tests().validate().is_ok());
    }
}
