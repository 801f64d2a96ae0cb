//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream identity provider configuration
    pub upstream: UpstreamConfig,
    /// Flow timing and policy configuration
    pub flow: FlowConfig,
    /// Capabilities offered on the consent page
    pub capabilities: Vec<CapabilitySpec>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (CONSENT_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("CONSENT_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if config.capabilities.is_empty() {
            config.capabilities = default_capabilities();
        }

        Ok(config)
    }

    /// Validate the configuration at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if required upstream credentials are missing or an
    /// endpoint does not parse as a URL.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.resolve_client_id().is_empty() {
            return Err(Error::Config(
                "upstream.client_id must be set (or resolvable via env:VAR)".to_string(),
            ));
        }
        if self.upstream.resolve_client_secret().is_empty() {
            return Err(Error::Config(
                "upstream.client_secret must be set (or resolvable via env:VAR)".to_string(),
            ));
        }

        for (name, value) in [
            ("server.public_url", &self.server.public_url),
            (
                "upstream.authorization_endpoint",
                &self.upstream.authorization_endpoint,
            ),
            ("upstream.token_endpoint", &self.upstream.token_endpoint),
        ] {
            Url::parse(value).map_err(|e| Error::Config(format!("{name}: {e}")))?;
        }

        if self.flow.transaction_ttl.is_zero() || self.flow.code_ttl.is_zero() {
            return Err(Error::Config(
                "flow.transaction_ttl and flow.code_ttl must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up a configured capability by name.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&CapabilitySpec> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL; the provider redirects back to
    /// `{public_url}{callback_path}`
    pub public_url: String,
    /// Path of the provider callback endpoint
    pub callback_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            public_url: "http://localhost:8000".to_string(),
            callback_path: "/oauth/callback".to_string(),
        }
    }
}

impl ServerConfig {
    /// The redirect URI registered with the upstream provider.
    #[must_use]
    pub fn upstream_redirect_uri(&self) -> String {
        format!(
            "{}{}",
            self.public_url.trim_end_matches('/'),
            self.callback_path
        )
    }
}

/// Upstream identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OAuth client id (supports `env:VAR_NAME` indirection)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME` indirection)
    pub client_secret: String,
    /// Provider authorization endpoint
    pub authorization_endpoint: String,
    /// Provider token endpoint
    pub token_endpoint: String,
    /// Scopes requested on the upstream hop
    pub scopes: Vec<String>,
    /// Bounded timeout for the single token-exchange call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: "env:OAUTH_CLIENT_ID".to_string(),
            client_secret: "env:OAUTH_CLIENT_SECRET".to_string(),
            authorization_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ],
            timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamConfig {
    /// Resolve the client id (expand `env:VAR` indirection)
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_secret(&self.client_id)
    }

    /// Resolve the client secret (expand `env:VAR` indirection)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }
}

/// Expand `env:VAR_NAME` values; a missing variable resolves to empty so
/// that `validate()` reports it instead of a handler failing mid-flow.
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Flow timing and policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Absolute deadline for a paused transaction
    #[serde(with = "humantime_serde")]
    pub transaction_ttl: Duration,
    /// TTL of the pre-transaction authorization correlation
    #[serde(with = "humantime_serde")]
    pub pending_ttl: Duration,
    /// TTL of an issued downstream code
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// TTL of a minted session token
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Background sweep interval
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Keep exchanged identity claims on a transaction until TTL/terminal
    /// transition. When `false`, claims are dropped the moment a
    /// transaction turns EXPIRED or FAILED.
    pub retain_claims_until_ttl: bool,
    /// Pause every login for consent. When `false`, subjects with an
    /// existing preference entry skip the consent page.
    pub require_consent_every_login: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            transaction_ttl: Duration::from_secs(15 * 60),
            pending_ttl: Duration::from_secs(10 * 60),
            code_ttl: Duration::from_secs(60),
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            retain_claims_until_ttl: true,
            require_consent_every_login: true,
        }
    }
}

/// A capability offered on the consent page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Capability name, as protected operations declare it
    pub name: String,
    /// Human-readable description for the consent UI
    #[serde(default)]
    pub description: String,
}

fn default_capabilities() -> Vec<CapabilitySpec> {
    vec![
        CapabilitySpec {
            name: "get_email".to_string(),
            description: "Authenticated user's email address".to_string(),
        },
        CapabilitySpec {
            name: "get_name".to_string(),
            description: "Authenticated user's display name".to_string(),
        },
    ]
}
