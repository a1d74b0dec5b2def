//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, OPENAI_API_KEY, OPENAI_BASE_URL, OPENAI_MODEL)
//! 2. Environment variables (APP_SERVER__PORT, APP_PROVIDER__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Sections use a double underscore in environment names because field names
//! already contain single underscores (`APP_PROVIDER__API_KEY` → `provider.api_key`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Broken into logical groups: where to listen, which provider to call,
/// what the assistant says, and how long a silent connection may live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub prompt: PromptConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Chat-completion provider settings.
///
/// ## Fields:
/// - `base_url`: OpenAI-compatible API root, `/chat/completions` is appended
/// - `api_key`: Bearer token; empty means "not configured" and every turn will
///   come back as a provider status error
/// - `model`: Model identifier sent with each request
/// - `temperature`: Kept low so the phone persona stays consistent, never zero
/// - `stream`: Stream deltas (SSE) or wait for one complete answer
/// - `request_timeout_secs`: Upper bound for one upstream request; unset means
///   a hung provider blocks that turn until the caller moves on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub stream: bool,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// What the assistant says when it is not the model talking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System instruction prepended to every completion request
    pub system_prompt: String,

    /// Spoken as soon as the call starts
    pub greeting: String,

    /// User message used when a turn request carries no usable text
    pub fallback_user_message: String,

    /// Spoken when a turn fails for any reason other than a provider status
    pub technical_incident_message: String,
}

/// WebSocket liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "gpt-4o-mini".to_string(),
                temperature: 0.3,
                stream: true,
                request_timeout_secs: None,
            },
            prompt: PromptConfig {
                system_prompt: "Tu es un assistant téléphonique. Réponds en français, \
                                en phrases courtes et naturelles, adaptées à l'oral."
                    .to_string(),
                greeting: "Bonjour, je vous écoute.".to_string(),
                fallback_user_message: "Bonjour".to_string(),
                technical_incident_message:
                    "Désolé, un incident technique est survenu. Pouvez-vous répéter ?"
                        .to_string(),
            },
            session: SessionConfig {
                heartbeat_interval_secs: 15,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_PROVIDER__STREAM=false`: Ask for complete answers instead of deltas
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Provider credentials, as most deployments name them
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Variables used by deployment platforms and provider SDKs, outside the APP_ convention
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("OPENAI_API_KEY", "provider.api_key"),
            ("OPENAI_BASE_URL", "provider.base_url"),
            ("OPENAI_MODEL", "provider.model"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not an error here: the server still accepts
    /// calls and each turn reports the provider's 401 to the caller.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.provider.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Provider base URL cannot be empty"));
        }

        if self.provider.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Provider model cannot be empty"));
        }

        if !(self.provider.temperature > 0.0 && self.provider.temperature <= 2.0) {
            return Err(anyhow::anyhow!(
                "Provider temperature must be in (0, 2], got {}",
                self.provider.temperature
            ));
        }

        if self.provider.request_timeout_secs == Some(0) {
            return Err(anyhow::anyhow!("Provider request timeout cannot be 0"));
        }

        if self.session.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.session.client_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.session.client_timeout_secs,
                self.session.heartbeat_interval_secs
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ProviderConfig {
    /// Full URL of the chat-completion endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
