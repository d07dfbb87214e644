//! Configuration management for quotaguard.
//!
//! Settings are assembled once at startup, from the environment or a YAML
//! file, and handed to the components that need them. Nothing reads the
//! environment after that.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{QuotaguardError, Result};
use crate::ratelimit::{
    Backends, FixedWindowCounter, Preset, PresetSettings, RedisStoreConfig, RedisWindowStore,
    RuleConfig, DEFAULT_KEY_PREFIX,
};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaguardConfig {
    /// Preset limits and windows
    #[serde(default)]
    pub presets: PresetSettings,

    /// Shared store connection
    #[serde(default)]
    pub store: StoreSettings,

    /// Local fallback behaviour
    #[serde(default)]
    pub fallback: FallbackSettings,

    /// Additional named rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Shared store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Connection URL; absent means fallback-only mode
    #[serde(default)]
    pub url: Option<String>,

    /// Access token
    #[serde(default)]
    pub token: Option<String>,

    /// Key prefix
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("key_prefix", &self.key_prefix)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Store URL variables in priority order. The REST names are accepted so
/// deployments configured for a REST gateway keep working.
const STORE_URL_KEYS: [&str; 3] = ["redis_url", "redis_rest_url", "upstash_redis_rest_url"];

const STORE_TOKEN_KEYS: [&str; 3] = ["redis_token", "redis_rest_token", "upstash_redis_rest_token"];

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

/// Local fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    /// Interval between sweeps of expired windows, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

impl QuotaguardConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::default())
    }

    /// Load configuration from an explicit set of environment-style variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_environment(Environment::default().source(Some(map)))
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaguardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaguardError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn from_environment(env: Environment) -> Result<Self> {
        let source = Config::builder().add_source(env).build()?;
        let mut config = QuotaguardConfig::default();

        for preset in Preset::ALL {
            let name = preset.env_name();
            let numbers = config.presets.get_mut(preset);
            if let Some(limit) = lookup::<u64>(&source, name)? {
                numbers.limit = limit;
            }
            if let Some(window) = lookup::<u64>(&source, &format!("{}_window", name))? {
                numbers.window_secs = window;
            }
        }

        config.store.url = first_set(&source, &STORE_URL_KEYS)?.map(protocol_url);
        config.store.token = first_set(&source, &STORE_TOKEN_KEYS)?;
        if let Some(prefix) = lookup::<String>(&source, "rate_limit_key_prefix")? {
            config.store.key_prefix = prefix;
        }
        if let Some(timeout) = lookup::<u64>(&source, "rate_limit_store_timeout_ms")? {
            config.store.timeout_ms = timeout;
        }
        if let Some(interval) = lookup::<u64>(&source, "rate_limit_sweep_interval_secs")? {
            config.fallback.sweep_interval_secs = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every preset and custom rule.
    pub fn validate(&self) -> Result<()> {
        self.presets.validate()?;
        for rule in &self.rules {
            rule.validate()?;
        }
        if self.store.timeout_ms == 0 {
            return Err(QuotaguardError::Config(
                "store timeout must be non-zero".to_string(),
            ));
        }
        if self.fallback.sweep_interval_secs == 0 {
            return Err(QuotaguardError::Config(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Rule for a preset under these settings.
    pub fn preset(&self, preset: Preset) -> RuleConfig {
        preset.rule(&self.presets)
    }

    /// A custom rule by identifier.
    pub fn rule(&self, identifier: &str) -> Option<&RuleConfig> {
        self.rules.iter().find(|r| r.identifier == identifier)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.fallback.sweep_interval_secs)
    }

    /// Build the process-wide backends.
    ///
    /// Without a store URL the limiter runs on the local fallback alone. That
    /// is logged, not treated as an error.
    pub fn backends(&self, fallback: Arc<FixedWindowCounter>) -> Result<Backends> {
        let backends = Backends::with_fallback(fallback).with_store_timeout(self.store_timeout());

        let Some(url) = &self.store.url else {
            warn!("Rate limit store not configured; using in-memory fallback (not shared across processes)");
            return Ok(backends);
        };

        let mut store_config = RedisStoreConfig::new(url.clone())
            .with_key_prefix(self.store.key_prefix.clone());
        if let Some(token) = &self.store.token {
            store_config = store_config.with_token(token.clone());
        }

        let store = RedisWindowStore::new(store_config)?;
        info!(prefix = %self.store.key_prefix, "Rate limit store configured");
        Ok(backends.with_primary(Arc::new(store)))
    }
}

/// First non-empty value among `keys`.
fn first_set(source: &Config, keys: &[&str]) -> Result<Option<String>> {
    for key in keys {
        if let Some(value) = lookup::<String>(source, key)?.filter(|v| !v.is_empty()) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Map a REST endpoint onto the same host's Redis protocol endpoint.
fn protocol_url(url: String) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("rediss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("redis://{}", rest)
    } else {
        url
    }
}

/// Read an optional key, treating absence as `None` and bad values as errors.
fn lookup<T: serde::de::DeserializeOwned>(source: &Config, key: &str) -> Result<Option<T>> {
    match source.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(QuotaguardError::Config(format!("invalid value for {}: {}", key, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_variables() {
        let config = QuotaguardConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.presets, PresetSettings::default());
        assert!(config.store.url.is_none());
        assert_eq!(config.store_timeout(), Duration::from_millis(500));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_preset_overrides_from_vars() {
        let config = QuotaguardConfig::from_vars([
            ("RATE_LIMIT_AUTH", "7"),
            ("RATE_LIMIT_AUTH_WINDOW", "120"),
            ("RATE_LIMIT_CREATE_EVENT", "2"),
            ("RATE_LIMIT_PUBLIC_API_WINDOW", "30"),
        ])
        .unwrap();

        let auth = config.preset(Preset::Auth);
        assert_eq!(auth.limit, 7);
        assert_eq!(auth.window_secs, 120);

        let create = config.preset(Preset::CreateResource);
        assert_eq!(create.limit, 2);
        assert_eq!(create.window_secs, 300);

        let public = config.preset(Preset::PublicApi);
        assert_eq!(public.limit, 100);
        assert_eq!(public.window_secs, 30);
    }

    #[test]
    fn test_store_settings_from_vars() {
        let config = QuotaguardConfig::from_vars([
            ("REDIS_URL", "redis://cache:6379/"),
            ("REDIS_TOKEN", "secret"),
            ("RATE_LIMIT_STORE_TIMEOUT_MS", "250"),
            ("RATE_LIMIT_SWEEP_INTERVAL_SECS", "60"),
        ])
        .unwrap();

        assert_eq!(config.store.url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.store.token.as_deref(), Some("secret"));
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert!(!format!("{:?}", config.store).contains("secret"));
    }

    #[test]
    fn test_rest_store_variables_are_aliases() {
        let config = QuotaguardConfig::from_vars([
            ("UPSTASH_REDIS_REST_URL", "https://eu1-fleet.upstash.io"),
            ("UPSTASH_REDIS_REST_TOKEN", "tok"),
        ])
        .unwrap();
        assert_eq!(config.store.url.as_deref(), Some("rediss://eu1-fleet.upstash.io"));
        assert_eq!(config.store.token.as_deref(), Some("tok"));

        let config = QuotaguardConfig::from_vars([
            ("REDIS_REST_URL", "http://cache.internal:6379"),
            ("REDIS_REST_TOKEN", "t2"),
        ])
        .unwrap();
        assert_eq!(config.store.url.as_deref(), Some("redis://cache.internal:6379"));
        assert_eq!(config.store.token.as_deref(), Some("t2"));
    }

    #[test]
    fn test_redis_url_wins_over_aliases() {
        let config = QuotaguardConfig::from_vars([
            ("REDIS_URL", "redis://primary:6379/"),
            ("UPSTASH_REDIS_REST_URL", "https://other.upstash.io"),
            ("REDIS_REST_TOKEN", "rest"),
            ("REDIS_TOKEN", ""),
        ])
        .unwrap();
        assert_eq!(config.store.url.as_deref(), Some("redis://primary:6379/"));
        // An empty primary name falls through to the next alias.
        assert_eq!(config.store.token.as_deref(), Some("rest"));
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        assert!(QuotaguardConfig::from_vars([("RATE_LIMIT_AUTH", "lots")]).is_err());
        assert!(QuotaguardConfig::from_vars([("RATE_LIMIT_ADMIN", "0")]).is_err());
        assert!(QuotaguardConfig::from_vars([("RATE_LIMIT_PAYMENT_WINDOW", "0")]).is_err());
        assert!(
            QuotaguardConfig::from_vars([("RATE_LIMIT_AUTH_WINDOW", "10000000000000000")]).is_err()
        );
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
presets:
  payment:
    limit: 20
    window_secs: 60
store:
  url: redis://127.0.0.1/
  timeout_ms: 100
rules:
  - identifier: custom-check
    limit: 10
    window_secs: 60
  - identifier: user-action
    limit: 10
    window_secs: 60
    partition_by: user
"#;
        let config = QuotaguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.preset(Preset::Payment).limit, 20);
        assert_eq!(config.preset(Preset::Auth).limit, 5);
        assert_eq!(config.store_timeout(), Duration::from_millis(100));
        assert_eq!(config.store.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.rule("custom-check").unwrap().limit, 10);
        assert!(config.rule("missing").is_none());
    }

    #[test]
    fn test_yaml_rejects_bad_rule() {
        let yaml = r#"
rules:
  - identifier: broken
    limit: 0
    window_secs: 60
"#;
        assert!(QuotaguardConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_backends_without_store() {
        let config = QuotaguardConfig::default();
        let backends = config.backends(Arc::new(FixedWindowCounter::new())).unwrap();
        assert!(backends.primary().is_none());
    }

    #[tokio::test]
    async fn test_backends_with_store() {
        let config = QuotaguardConfig::from_vars([("REDIS_URL", "redis://127.0.0.1:6379/")]).unwrap();
        let backends = config.backends(Arc::new(FixedWindowCounter::new())).unwrap();
        assert_eq!(backends.primary().map(|p| p.name()), Some("redis"));
        assert_eq!(backends.store_timeout(), Duration::from_millis(500));
    }
}
