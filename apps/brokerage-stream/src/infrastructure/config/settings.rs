//! Streaming Client Configuration Settings
//!
//! Configuration types for the streaming client, loaded from environment
//! variables. `.env` files are loaded by the binary before this runs.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use crate::application::ports::BearerToken;
use crate::application::services::ContextConfig;
use crate::domain::subscription::{Instrument, StreamRequest};
use crate::infrastructure::http::{HttpTransportConfig, default_reauthorize_url};
use crate::infrastructure::stream::BackoffConfig;

/// Brokerage endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// REST base URL for subscription calls.
    pub rest_url: Url,
    /// Streaming websocket base URL.
    pub streaming_url: Url,
    /// Reauthorize endpoint.
    pub reauthorize_url: Url,
}

/// Access token. `Debug` never prints it.
#[derive(Clone)]
pub struct Credentials {
    access_token: String,
}

impl Credentials {
    /// Wrap a raw access token.
    #[must_use]
    pub const fn new(access_token: String) -> Self {
        Self { access_token }
    }

    /// Bearer token for requests and the connect URL.
    #[must_use]
    pub fn bearer(&self) -> BearerToken {
        BearerToken::new(self.access_token.clone())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Connection and reconnect timing.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Websocket handshake timeout.
    pub connect_timeout: Duration,
    /// Close handshake and teardown timeout.
    pub close_timeout: Duration,
    /// Reconnect after this long without inbound traffic (zero disables).
    pub context_inactivity_timeout: Duration,
    /// Subscription staleness check period.
    pub heartbeat_check_interval: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// REST request timeout.
    pub request_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            context_inactivity_timeout: Duration::from_secs(120),
            heartbeat_check_interval: Duration::from_secs(1),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Complete streaming client configuration.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Brokerage endpoints.
    pub endpoints: EndpointSettings,
    /// Fixed context id, if any.
    pub context_id: Option<String>,
    /// What to subscribe to.
    pub request: StreamRequest,
    /// Timing.
    pub stream: StreamSettings,
    /// Address to serve Prometheus metrics on, if any.
    pub metrics_addr: Option<SocketAddr>,
}

impl StreamClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let access_token = env.required("BROKERAGE_ACCESS_TOKEN")?;
        let rest_url = env.url("BROKERAGE_REST_URL")?;
        let streaming_url = env.url("BROKERAGE_STREAMING_URL")?;
        let reauthorize_url = match env.optional("BROKERAGE_REAUTHORIZE_URL") {
            Some(raw) => parse_url("BROKERAGE_REAUTHORIZE_URL", &raw)?,
            None => default_reauthorize_url(&streaming_url),
        };

        let client_key = env.required("BROKERAGE_CLIENT_KEY")?;
        let account_keys = env
            .optional("BROKERAGE_ACCOUNT_KEYS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        let instruments = env
            .optional("BROKERAGE_PRICE_INSTRUMENTS")
            .map(|raw| {
                split_list(&raw)
                    .iter()
                    .map(|item| {
                        item.parse::<Instrument>().map_err(|e| ConfigError::InvalidValue {
                            key: "BROKERAGE_PRICE_INSTRUMENTS".to_string(),
                            message: e.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            connect_timeout: env.duration_secs("STREAM_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            close_timeout: env.duration_secs("STREAM_CLOSE_TIMEOUT_SECS", defaults.close_timeout),
            context_inactivity_timeout: env.duration_secs(
                "STREAM_CONTEXT_INACTIVITY_TIMEOUT_SECS",
                defaults.context_inactivity_timeout,
            ),
            heartbeat_check_interval: env.duration_millis(
                "STREAM_HEARTBEAT_CHECK_INTERVAL_MS",
                defaults.heartbeat_check_interval,
            ),
            reconnect_delay_initial: env.duration_millis(
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse_or(
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse_or(
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            request_timeout: env.duration_secs("STREAM_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
        };

        let metrics_addr = env
            .optional("METRICS_LISTEN_ADDR")
            .map(|raw| {
                raw.parse::<SocketAddr>().map_err(|e| ConfigError::InvalidValue {
                    key: "METRICS_LISTEN_ADDR".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            credentials: Credentials::new(access_token),
            endpoints: EndpointSettings {
                rest_url,
                streaming_url,
                reauthorize_url,
            },
            context_id: env.optional("BROKERAGE_CONTEXT_ID"),
            request: StreamRequest::new(client_key)
                .with_accounts(account_keys)
                .with_instruments(instruments),
            stream,
            metrics_addr,
        })
    }

    /// Settings for a streaming context.
    #[must_use]
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            streaming_url: self.endpoints.streaming_url.clone(),
            context_id: self.context_id.clone(),
            connect_timeout: self.stream.connect_timeout,
            close_timeout: self.stream.close_timeout,
            heartbeat_check_interval: self.stream.heartbeat_check_interval,
            context_inactivity_timeout: self.stream.context_inactivity_timeout,
            reconnect: BackoffConfig {
                initial_delay: self.stream.reconnect_delay_initial,
                max_delay: self.stream.reconnect_delay_max,
                multiplier: self.stream.reconnect_delay_multiplier,
                max_attempts: self.stream.max_reconnect_attempts,
                ..BackoffConfig::default()
            },
        }
    }

    /// Settings for the REST transport.
    #[must_use]
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            rest_url: self.endpoints.rest_url.clone(),
            reauthorize_url: self.endpoints.reauthorize_url.clone(),
            timeout: self.stream.request_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} is invalid: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse error.
        message: String,
    },
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn url(&self, key: &str) -> Result<Url, ConfigError> {
        parse_url(key, &self.required(key)?)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}
