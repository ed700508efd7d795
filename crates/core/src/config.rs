use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub security: SecurityConfig,
    pub webhook: WebhookConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Pre-shared key required on the "wa" channel and the admin surface.
    pub internal_api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub verify_signature: bool,
    pub secret: Option<SecretString>,
    pub replay_window_secs: u64,
    pub max_future_skew_secs: u64,
    pub max_payload_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub enable_answerer: bool,
    pub confirmation_ttl_secs: u64,
    pub dedupe_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub tool_timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub session_max: u32,
    pub session_window_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub internal_api_key: Option<String>,
    pub webhook_verify_signature: Option<bool>,
    pub webhook_secret: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            llm: LlmConfig {
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            security: SecurityConfig { internal_api_key: None },
            webhook: WebhookConfig {
                verify_signature: false,
                secret: None,
                replay_window_secs: 300,
                max_future_skew_secs: 30,
                max_payload_bytes: 256_000,
            },
            agent: AgentConfig {
                enable_answerer: true,
                confirmation_ttl_secs: 1800,
                dedupe_ttl_secs: 3600,
                session_ttl_secs: 86_400,
                tool_timeout_secs: 30,
                rate_limit: RateLimitConfig {
                    enabled: true,
                    session_max: 30,
                    session_window_secs: 60,
                },
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key_value));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(security) = patch.security {
            if let Some(key_value) = security.internal_api_key {
                self.security.internal_api_key = Some(secret_value(key_value));
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(verify_signature) = webhook.verify_signature {
                self.webhook.verify_signature = verify_signature;
            }
            if let Some(secret) = webhook.secret {
                self.webhook.secret = Some(secret_value(secret));
            }
            if let Some(replay_window_secs) = webhook.replay_window_secs {
                self.webhook.replay_window_secs = replay_window_secs;
            }
            if let Some(max_future_skew_secs) = webhook.max_future_skew_secs {
                self.webhook.max_future_skew_secs = max_future_skew_secs;
            }
            if let Some(max_payload_bytes) = webhook.max_payload_bytes {
                self.webhook.max_payload_bytes = max_payload_bytes;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(enable_answerer) = agent.enable_answerer {
                self.agent.enable_answerer = enable_answerer;
            }
            if let Some(confirmation_ttl_secs) = agent.confirmation_ttl_secs {
                self.agent.confirmation_ttl_secs = confirmation_ttl_secs;
            }
            if let Some(dedupe_ttl_secs) = agent.dedupe_ttl_secs {
                self.agent.dedupe_ttl_secs = dedupe_ttl_secs;
            }
            if let Some(session_ttl_secs) = agent.session_ttl_secs {
                self.agent.session_ttl_secs = session_ttl_secs;
            }
            if let Some(tool_timeout_secs) = agent.tool_timeout_secs {
                self.agent.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(rate_limit) = agent.rate_limit {
                if let Some(enabled) = rate_limit.enabled {
                    self.agent.rate_limit.enabled = enabled;
                }
                if let Some(session_max) = rate_limit.session_max {
                    self.agent.rate_limit.session_max = session_max;
                }
                if let Some(session_window_secs) = rate_limit.session_window_secs {
                    self.agent.rate_limit.session_window_secs = session_window_secs;
                }
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_PORT") {
            self.server.port = parse_u16("CONCIERGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("CONCIERGE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_INTERNAL_API_KEY") {
            self.security.internal_api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("CONCIERGE_WEBHOOK_VERIFY_SIGNATURE") {
            self.webhook.verify_signature = parse_bool("CONCIERGE_WEBHOOK_VERIFY_SIGNATURE", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_WEBHOOK_REPLAY_WINDOW_SECS") {
            self.webhook.replay_window_secs =
                parse_u64("CONCIERGE_WEBHOOK_REPLAY_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_WEBHOOK_MAX_FUTURE_SKEW_SECS") {
            self.webhook.max_future_skew_secs =
                parse_u64("CONCIERGE_WEBHOOK_MAX_FUTURE_SKEW_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_WEBHOOK_MAX_PAYLOAD_BYTES") {
            self.webhook.max_payload_bytes =
                parse_u64("CONCIERGE_WEBHOOK_MAX_PAYLOAD_BYTES", &value)? as usize;
        }

        if let Some(value) = read_env("CONCIERGE_AGENT_ENABLE_ANSWERER") {
            self.agent.enable_answerer = parse_bool("CONCIERGE_AGENT_ENABLE_ANSWERER", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_CONFIRMATION_TTL_SECS") {
            self.agent.confirmation_ttl_secs =
                parse_u64("CONCIERGE_AGENT_CONFIRMATION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_DEDUPE_TTL_SECS") {
            self.agent.dedupe_ttl_secs = parse_u64("CONCIERGE_AGENT_DEDUPE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_SESSION_TTL_SECS") {
            self.agent.session_ttl_secs = parse_u64("CONCIERGE_AGENT_SESSION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_TOOL_TIMEOUT_SECS") {
            self.agent.tool_timeout_secs = parse_u64("CONCIERGE_AGENT_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_RATE_LIMIT_ENABLED") {
            self.agent.rate_limit.enabled = parse_bool("CONCIERGE_RATE_LIMIT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_RATE_LIMIT_SESSION_MAX") {
            self.agent.rate_limit.session_max =
                parse_u32("CONCIERGE_RATE_LIMIT_SESSION_MAX", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_RATE_LIMIT_SESSION_WINDOW_SECS") {
            self.agent.rate_limit.session_window_secs =
                parse_u64("CONCIERGE_RATE_LIMIT_SESSION_WINDOW_SECS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(internal_api_key) = overrides.internal_api_key {
            self.security.internal_api_key = Some(secret_value(internal_api_key));
        }
        if let Some(verify_signature) = overrides.webhook_verify_signature {
            self.webhook.verify_signature = verify_signature;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.webhook.secret = Some(secret_value(webhook_secret));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_llm(&self.llm)?;
        validate_webhook(&self.webhook)?;
        validate_agent(&self.agent)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.base_url.trim().is_empty() {
        return Err(ConfigError::Validation("llm.base_url is required".to_string()));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    if webhook.verify_signature {
        let missing = webhook
            .secret
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "webhook.verify_signature is enabled but webhook.secret is not set".to_string(),
            ));
        }
    }

    if webhook.replay_window_secs == 0 {
        return Err(ConfigError::Validation(
            "webhook.replay_window_secs must be greater than zero".to_string(),
        ));
    }

    if webhook.max_payload_bytes == 0 {
        return Err(ConfigError::Validation(
            "webhook.max_payload_bytes must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.confirmation_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.confirmation_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if agent.dedupe_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.dedupe_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if agent.tool_timeout_secs == 0 || agent.tool_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "agent.tool_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if agent.rate_limit.enabled
        && (agent.rate_limit.session_max == 0 || agent.rate_limit.session_window_secs == 0)
    {
        return Err(ConfigError::Validation(
            "agent.rate_limit requires session_max and session_window_secs above zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    llm: Option<LlmPatch>,
    security: Option<SecurityPatch>,
    webhook: Option<WebhookPatch>,
    agent: Option<AgentPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SecurityPatch {
    internal_api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    verify_signature: Option<bool>,
    secret: Option<String>,
    replay_window_secs: Option<u64>,
    max_future_skew_secs: Option<u64>,
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    enable_answerer: Option<bool>,
    confirmation_ttl_secs: Option<u64>,
    dedupe_ttl_secs: Option<u64>,
    session_ttl_secs: Option<u64>,
    tool_timeout_secs: Option<u64>,
    rate_limit: Option<RateLimitPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    enabled: Option<bool>,
    session_max: Option<u32>,
    session_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_cleanly() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(!config.webhook.verify_signature, "signature checking defaults off for dev")?;
        ensure(config.agent.confirmation_ttl_secs == 1800, "default confirmation ttl")?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_WEBHOOK_SECRET", "hmac-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[webhook]
verify_signature = true
secret = "${TEST_WEBHOOK_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.webhook.verify_signature, "signature checking should be enabled")?;
            ensure(
                config
                    .webhook
                    .secret
                    .as_ref()
                    .map(|secret| secret.expose_secret() == "hmac-from-env")
                    .unwrap_or(false),
                "webhook secret should be loaded from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "programmatic override should win over env and file",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_DATABASE_URL"]);
        result
    }

    #[test]
    fn signature_verification_without_secret_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_WEBHOOK_VERIFY_SIGNATURE", "true");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("webhook.secret")
            );
            ensure(has_message, "validation failure should mention webhook.secret")
        })();

        clear_vars(&["CONCIERGE_WEBHOOK_VERIFY_SIGNATURE"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_INTERNAL_API_KEY", "internal-secret-value");
        env::set_var("CONCIERGE_WEBHOOK_SECRET", "webhook-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("internal-secret-value"),
                "debug output should not contain the internal api key",
            )?;
            ensure(
                !debug.contains("webhook-secret-value"),
                "debug output should not contain the webhook secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_INTERNAL_API_KEY", "CONCIERGE_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LOG_LEVEL", "warn");
        env::set_var("CONCIERGE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warn log level should come from env")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should come from env",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LOG_LEVEL", "CONCIERGE_LOG_FORMAT"]);
        result
    }
}
