//! Configuration
//!
//! Layered settings: built-in defaults, then an optional TOML file, then
//! `RELAY_*` environment variables. Validated once at startup.

use crate::error::ConfigError;
use crate::router::{DEFAULT_APOLOGY, ProcessorEndpoint};
use crate::whatsapp::{ReconnectPolicy, SessionLimits};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "RELAY";
pub const PROCESSOR_URLS_VAR: &str = "RELAY_PROCESSOR_URLS";
const DEFAULT_PROCESSOR_TIMEOUT_MS: u64 = 25_000;

/// `~/.viya-relay`, falling back to the working directory.
pub fn relay_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".viya-relay"))
        .unwrap_or_else(|| PathBuf::from(".viya-relay"))
}

pub fn default_config_path() -> PathBuf {
    relay_home().join("config.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Evolution API base URL.
    pub api_url: String,
    pub api_key: String,
    pub instance_name: String,
    /// Public URL of this relay's `/webhook/whatsapp`, registered on instance creation.
    pub webhook_url: Option<String>,
    /// Extra key a webhook may present as `?token=` or an `apikey` header.
    pub webhook_secret: Option<String>,
    /// Credentials and the pairing PNG live here.
    pub data_dir: PathBuf,
    pub default_country_code: String,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
    /// Time allowed in `connecting` before the attempt counts as failed.
    pub handshake_timeout_secs: u64,
    pub max_message_chars: usize,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            instance_name: "viya".to_string(),
            webhook_url: None,
            webhook_secret: None,
            data_dir: relay_home().join("whatsapp"),
            default_country_code: "91".to_string(),
            connect_timeout_secs: 30,
            send_timeout_secs: 20,
            handshake_timeout_secs: 120,
            max_message_chars: 4000,
        }
    }
}

impl WhatsAppConfig {
    /// Keys accepted on inbound webhooks besides the stored instance token.
    pub fn webhook_keys(&self) -> Vec<String> {
        [Some(&self.api_key), self.webhook_secret.as_ref()]
            .into_iter()
            .flatten()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect()
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_message_chars: self.max_message_chars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            cap: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// When set, `/send`, `/pairing` and `/session/reconnect` require a matching `x-api-key`.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Daily rolling log files are written here when set.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub apology: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            apology: DEFAULT_APOLOGY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub whatsapp: WhatsAppConfig,
    pub reconnect: ReconnectConfig,
    pub processors: Vec<ProcessorEndpoint>,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
    pub fallback: FallbackConfig,
}

impl RelayConfig {
    /// Load defaults, then `path` (or the default file if present), then env.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let mut cfg: RelayConfig = Config::builder()
            .add_source(Config::try_from(&RelayConfig::default())?)
            .add_source(File::from(path.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if let Ok(raw) = std::env::var(PROCESSOR_URLS_VAR) {
            cfg.apply_processor_urls(&raw);
        }

        tracing::debug!("Config: loaded (file: {})", path.display());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace the processor list from a comma-separated URL list, in order.
    pub fn apply_processor_urls(&mut self, raw: &str) {
        let urls: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return;
        }
        self.processors = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| ProcessorEndpoint {
                name: format!("processor-{}", i + 1),
                url: url.to_string(),
                timeout_ms: DEFAULT_PROCESSOR_TIMEOUT_MS,
                priority: i as u32,
            })
            .collect();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processors.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one processor endpoint is required".into(),
            ));
        }
        for endpoint in &self.processors {
            if endpoint.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "processor '{}' has an empty url",
                    endpoint.name
                )));
            }
            if endpoint.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "processor '{}' has a zero timeout",
                    endpoint.name
                )));
            }
        }

        let wa = &self.whatsapp;
        if wa.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("whatsapp.api_url is empty".into()));
        }
        if wa.instance_name.trim().is_empty() {
            return Err(ConfigError::Invalid("whatsapp.instance_name is empty".into()));
        }
        if wa.connect_timeout_secs == 0 || wa.send_timeout_secs == 0 || wa.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("whatsapp timeouts must be non-zero".into()));
        }
        if wa.max_message_chars == 0 {
            return Err(ConfigError::Invalid("whatsapp.max_message_chars must be non-zero".into()));
        }

        let rc = &self.reconnect;
        if rc.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnect.base_delay_ms must be non-zero".into()));
        }
        if rc.base_delay_ms > rc.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        if rc.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Settings that load fine but leave the relay partly blind.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.whatsapp.webhook_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            warnings.push(
                "whatsapp.webhook_url is not set: inbound messages and connection events \
                 will not arrive; the session falls back to polling on handshake expiry"
                    .to_string(),
            );
        }
        if self.whatsapp.webhook_keys().is_empty() {
            warnings.push(
                "neither whatsapp.api_key nor whatsapp.webhook_secret is set: webhooks \
                 are only accepted once an instance token is stored"
                    .to_string(),
            );
        }
        if self.control.api_key.as_deref().is_none_or(str::is_empty) {
            warnings.push("control.api_key is not set: /send and /pairing are open".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_layer_over_defaults() {
        let file = write_config(
            r#"
[server]
port = 9191

[whatsapp]
api_url = "http://evolution:8080"
instance_name = "viya-test"

[[processors]]
name = "backup"
url = "http://backup/process"
timeout_ms = 5000
priority = 1

[[processors]]
name = "primary"
url = "http://primary/process"
timeout_ms = 25000
priority = 0
"#,
        );

        let cfg = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.port, 9191);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.whatsapp.instance_name, "viya-test");
        assert_eq!(cfg.whatsapp.default_country_code, "91");
        assert_eq!(cfg.processors.len(), 2);
        assert_eq!(cfg.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_missing_processors_rejected() {
        let cfg = RelayConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_processor_urls_override() {
        let mut cfg = RelayConfig::default();
        cfg.apply_processor_urls(" http://a/process , ,http://b/process");
        assert_eq!(cfg.processors.len(), 2);
        assert_eq!(cfg.processors[0].url, "http://a/process");
        assert_eq!(cfg.processors[0].priority, 0);
        assert_eq!(cfg.processors[1].priority, 1);
        assert_eq!(cfg.processors[1].timeout_ms, DEFAULT_PROCESSOR_TIMEOUT_MS);
        cfg.validate().unwrap();

        // Blank override keeps what was there
        cfg.apply_processor_urls("  ");
        assert_eq!(cfg.processors.len(), 2);
    }

    #[test]
    fn test_invalid_reconnect_bounds() {
        let mut cfg = RelayConfig::default();
        cfg.apply_processor_urls("http://a/process");
        cfg.reconnect.base_delay_ms = 10_000;
        cfg.reconnect.max_delay_ms = 1_000;
        assert!(cfg.validate().is_err());

        cfg.reconnect.max_delay_ms = 10_000;
        cfg.reconnect.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.apply_processor_urls("http://a/process");
        cfg.processors[0].timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_webhook_url_is_flagged() {
        let mut cfg = RelayConfig::default();
        cfg.apply_processor_urls("http://a/process");
        cfg.validate().unwrap();
        assert!(cfg.warnings().iter().any(|w| w.contains("webhook_url")));

        cfg.whatsapp.webhook_url = Some("http://relay:8090/webhook/whatsapp".into());
        assert!(!cfg.warnings().iter().any(|w| w.contains("webhook_url")));
    }

    #[test]
    fn test_webhook_keys_skip_blanks() {
        let mut cfg = RelayConfig::default();
        assert!(cfg.whatsapp.webhook_keys().is_empty());

        cfg.whatsapp.api_key = "global".into();
        cfg.whatsapp.webhook_secret = Some("  ".into());
        assert_eq!(cfg.whatsapp.webhook_keys(), vec!["global".to_string()]);

        cfg.whatsapp.webhook_secret = Some("hook".into());
        assert_eq!(cfg.whatsapp.webhook_keys().len(), 2);
    }

    #[test]
    fn test_policy_and_limits_mapping() {
        let cfg = RelayConfig::default();
        let policy = cfg.reconnect.policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.cap, Duration::from_secs(60));
        assert_eq!(cfg.whatsapp.limits().max_message_chars, 4000);
        assert_eq!(cfg.whatsapp.limits().handshake_timeout, Duration::from_secs(120));
    }
}
