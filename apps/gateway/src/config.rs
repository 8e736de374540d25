// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use chatgate_core::ChatGateError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::Level;

const fn default_true() -> bool {
    true
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_path_prefix() -> String {
    "/chatbox".to_string()
}

const fn default_reconnect_timeout_secs() -> u64 {
    15 * 60
}

const fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

const fn default_sweeper_interval_secs() -> u64 {
    5 * 60
}

const fn default_max_connections_per_user() -> usize {
    10_000
}

const fn default_max_ws_message_bytes() -> usize {
    1024 * 1024
}

const fn default_send_queue_depth() -> usize {
    256
}

const fn default_drain_timeout_secs() -> u64 {
    30
}

const fn default_pong_timeout_secs() -> u64 {
    30
}

const fn default_llm_stream_timeout_secs() -> u64 {
    120
}

const fn default_events_per_window() -> u32 {
    100
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_max_users_tracked() -> usize {
    100_000
}

const fn default_max_events_per_user() -> usize {
    1000
}

/// Sliding-window message limiter + connection cap configuration (§4.7).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct RateLimitConfig {
    #[serde(default = "default_events_per_window")]
    pub events_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_users_tracked")]
    pub max_users_tracked: usize,
    #[serde(default = "default_max_events_per_user")]
    pub max_events_per_user: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            events_per_window: default_events_per_window(),
            window_secs: default_window_secs(),
            max_users_tracked: default_max_users_tracked(),
            max_events_per_user: default_max_events_per_user(),
        }
    }
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for the HTTP layer hosting the WebSocket upgrade route.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// HTTP/WebSocket server configuration (§6 `server.*` keys).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    /// Base path a reverse proxy mounts this service under. Must begin
    /// with `/` (§6).
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Grace period during which a disconnected session stays resumable
    /// (§4.2, §6 `server.reconnectTimeout`, default 15m).
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
    /// Absolute idle TTL after which the sweeper ends an active session
    /// regardless of connectedness (§4.2).
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// `SessionManager::Sweeper` tick interval (§4.2, default 5m).
    #[serde(default = "default_sweeper_interval_secs")]
    pub sweeper_interval_secs: u64,
    /// Per-user concurrent connection cap (§6 `server.maxConnections`).
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Inbound frame size limit enforced by the read-pump (§4.3, default 1 MiB).
    #[serde(default = "default_max_ws_message_bytes")]
    pub max_ws_message_bytes: usize,
    /// Per-connection bounded send queue depth (§5, default 256).
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Bound on the write-pump's best-effort drain during shutdown/close
    /// (§4.3, §4.8, default 30s).
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Missing-pong deadline; pings are sent at half this interval (§4.3).
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Upper bound on an LLM streaming request's connection-derived
    /// cancellation scope (§6 `server.llmStreamTimeout`, default 120s).
    #[serde(default = "default_llm_stream_timeout_secs")]
    pub llm_stream_timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            tls: false,
            cert_path: String::new(),
            key_path: String::new(),
            path_prefix: default_path_prefix(),
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            sweeper_interval_secs: default_sweeper_interval_secs(),
            max_connections_per_user: default_max_connections_per_user(),
            max_ws_message_bytes: default_max_ws_message_bytes(),
            send_queue_depth: default_send_queue_depth(),
            drain_timeout_secs: default_drain_timeout_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            llm_stream_timeout_secs: default_llm_stream_timeout_secs(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

fn default_user_id_header() -> String {
    "x-user-id".to_string()
}

fn default_roles_header() -> String {
    "x-roles".to_string()
}

/// Names of the headers a trusted reverse proxy sets with the
/// pre-authenticated identity (§1 Non-goals: "no JWT parsing").
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct IdentityConfig {
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
    /// Comma-separated role names.
    #[serde(default = "default_roles_header")]
    pub roles_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { user_id_header: default_user_id_header(), roles_header: default_roles_header() }
    }
}

/// Upstream dialect a configured model speaks. Mirrors
/// `chatgate_llm::ProviderType` but stays config-crate-local so this module
/// doesn't need `schemars` wired into `chatgate-llm`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTypeConfig {
    Openai,
    Anthropic,
    Dify,
}

impl From<ProviderTypeConfig> for chatgate_llm::ProviderType {
    fn from(value: ProviderTypeConfig) -> Self {
        match value {
            ProviderTypeConfig::Openai => Self::Openai,
            ProviderTypeConfig::Anthropic => Self::Anthropic,
            ProviderTypeConfig::Dify => Self::Dify,
        }
    }
}

/// One configured upstream model (§6 `llm.providers[]`).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LlmProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderTypeConfig,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<LlmProviderConfig>,
}

/// JWT validation settings. Parsing itself is a non-goal (§1); this only
/// carries the secret the embedder's auth layer would check, plus the
/// invariants §6 states for it.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
}

const WEAK_SECRET_SUBSTRINGS: &[&str] = &[
    "secret", "test", "test123", "password", "admin", "changeme", "default", "example", "demo",
    "12345", "placeholder",
];

impl JwtConfig {
    fn validate(&self) -> Result<(), ChatGateError> {
        if self.secret.len() < 32 {
            return Err(ChatGateError::Validation(format!(
                "jwt.secret must be at least 32 characters, got {}",
                self.secret.len()
            )));
        }
        let lower = self.secret.to_ascii_lowercase();
        if let Some(needle) = WEAK_SECRET_SUBSTRINGS.iter().find(|n| lower.contains(**n)) {
            return Err(ChatGateError::Validation(format!(
                "jwt.secret contains the weak substring {needle:?}"
            )));
        }
        Ok(())
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default = "default_true")]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: true,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./chatgate.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Telemetry and observability configuration (OpenTelemetry, tokio-console).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub tracing_enable: bool,
    pub otlp_endpoint: Option<String>,
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
    #[serde(default)]
    pub tokio_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            tracing_enable: false,
            otlp_endpoint: None,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
            tokio_console: false,
        }
    }
}

/// Root configuration for the chatgate gateway.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Startup validation (§6/§8): JWT secret strength, https-only provider
    /// endpoints, a leading-slash path prefix, and a valid server port.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::Validation` describing the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), ChatGateError> {
        if !self.server.path_prefix.starts_with('/') {
            return Err(ChatGateError::Validation(format!(
                "server.path_prefix must begin with '/', got {:?}",
                self.server.path_prefix
            )));
        }

        validate_port(&self.server.address)?;

        self.jwt.validate()?;

        for provider in &self.llm.providers {
            chatgate_llm::providers::validate_endpoint(&provider.endpoint).map_err(|e| {
                ChatGateError::Validation(format!(
                    "llm.providers[{}] ({}): {e}",
                    provider.id, provider.endpoint
                ))
            })?;
        }

        Ok(())
    }
}

/// Ports 0 and 65536 are rejected; 1 and 65535 are accepted (§8).
fn validate_port(address: &str) -> Result<(), ChatGateError> {
    let port_str = address.rsplit(':').next().ok_or_else(|| {
        ChatGateError::Validation(format!("server.address {address:?} has no port"))
    })?;
    let port: u32 = port_str
        .parse()
        .map_err(|_| ChatGateError::Validation(format!("server.address {address:?} has an invalid port")))?;
    if port == 0 || port > 65535 {
        return Err(ChatGateError::Validation(format!(
            "server.address port {port} is out of range (must be 1..=65535)"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads configuration from defaults, a TOML file, and environment
/// variables (`CHATGATE_` prefixed, `__` nested), then applies the
/// per-provider API key override (`LLM_PROVIDER_<i>_API_KEY`, §6).
///
/// # Errors
///
/// Returns an error if the file contains invalid TOML, an environment
/// variable holds a value of the wrong type, or the resulting config
/// fails [`Config::validate`].
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<dyn std::error::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let mut config: Config =
        figment.merge(Env::prefixed("CHATGATE_").split("__")).extract().map_err(Box::new)?;

    apply_provider_api_key_overrides(&mut config);
    config.validate()?;

    Ok(ConfigLoadResult { config, file_missing })
}

fn apply_provider_api_key_overrides(config: &mut Config) {
    for (i, provider) in config.llm.providers.iter_mut().enumerate() {
        if let Ok(key) = std::env::var(format!("LLM_PROVIDER_{i}_API_KEY")) {
            provider.api_key = key;
        }
    }
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_prefix_must_start_with_slash() {
        let mut config = Config::default();
        config.server.path_prefix = "chatbox".to_string();
        config.jwt.secret = "a".repeat(40);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ChatGateError::Validation(_)));
    }

    #[test]
    fn port_zero_and_65536_rejected_one_and_65535_accepted() {
        assert!(validate_port("127.0.0.1:0").is_err());
        assert!(validate_port("127.0.0.1:65536").is_err());
        assert!(validate_port("127.0.0.1:1").is_ok());
        assert!(validate_port("127.0.0.1:65535").is_ok());
    }

    #[test]
    fn jwt_secret_length_boundary() {
        let mut config = Config::default();
        config.jwt.secret = "x".repeat(31);
        assert!(config.validate().is_err());
        config.jwt.secret = "x".repeat(32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn jwt_secret_rejects_weak_substrings() {
        let mut config = Config::default();
        config.jwt.secret = format!("{}changeme{}", "a".repeat(12), "b".repeat(12));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("weak substring"));
    }

    #[test]
    fn provider_endpoint_must_be_https() {
        let mut config = Config::default();
        config.jwt.secret = "a".repeat(40);
        config.llm.providers.push(LlmProviderConfig {
            id: "p1".into(),
            name: "p1".into(),
            provider_type: ProviderTypeConfig::Openai,
            endpoint: "http://api.openai.com/v1/".into(),
            api_key: String::new(),
            model: "gpt-test".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_api_key_override_applies_by_index() {
        let mut config = Config::default();
        config.llm.providers.push(LlmProviderConfig {
            id: "p1".into(),
            name: "p1".into(),
            provider_type: ProviderTypeConfig::Openai,
            endpoint: "https://api.openai.com/v1/".into(),
            api_key: "from-file".into(),
            model: "gpt-test".into(),
        });
        std::env::set_var("LLM_PROVIDER_0_API_KEY", "from-env");
        apply_provider_api_key_overrides(&mut config);
        std::env::remove_var("LLM_PROVIDER_0_API_KEY");
        assert_eq!(config.llm.providers[0].api_key, "from-env");
    }
}
