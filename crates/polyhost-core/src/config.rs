//! Engine and context configuration

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the thread that collects released contexts
    pub reaper_thread_name: String,
    /// Name given to polyglot threads created by languages
    pub polyglot_thread_name: String,
    /// Upper bound for waiting on executing threads during a cancelling close
    pub cancel_timeout_ms: u64,
    /// Wake interval of safepoint-aware waits
    pub safepoint_poll_interval_ms: u64,
    /// Whether releasing the last embedder reference queues the context for collection
    pub collect_on_release: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reaper_thread_name: "polyhost-reaper".to_string(),
            polyglot_thread_name: "polyhost-polyglot".to_string(),
            cancel_timeout_ms: 10_000,
            safepoint_poll_interval_ms: 10,
            collect_on_release: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `POLYHOST_*` environment variables
    ///
    /// Priority: environment variables > defaults. Values that fail to parse
    /// keep the default and are logged.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("POLYHOST_REAPER_THREAD_NAME") {
            config.reaper_thread_name = name;
        }
        if let Some(name) = lookup("POLYHOST_POLYGLOT_THREAD_NAME") {
            config.polyglot_thread_name = name;
        }
        if let Some(value) = lookup("POLYHOST_CANCEL_TIMEOUT_MS") {
            config.cancel_timeout_ms = parse_or("POLYHOST_CANCEL_TIMEOUT_MS", &value, config.cancel_timeout_ms);
        }
        if let Some(value) = lookup("POLYHOST_SAFEPOINT_POLL_INTERVAL_MS") {
            config.safepoint_poll_interval_ms = parse_or(
                "POLYHOST_SAFEPOINT_POLL_INTERVAL_MS",
                &value,
                config.safepoint_poll_interval_ms,
            );
        }
        if let Some(value) = lookup("POLYHOST_COLLECT_ON_RELEASE") {
            config.collect_on_release = parse_or("POLYHOST_COLLECT_ON_RELEASE", &value, config.collect_on_release);
        }

        config
    }

    /// Parse configuration from a TOML document
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty thread name or a zero poll interval.
    pub fn validate(&self) -> Result<()> {
        if self.reaper_thread_name.is_empty() || self.polyglot_thread_name.is_empty() {
            return Err(Error::config("thread names must not be empty"));
        }
        if self.safepoint_poll_interval_ms == 0 {
            return Err(Error::config("safepoint_poll_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Cancel timeout as a duration
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Safepoint poll interval as a duration
    pub fn safepoint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.safepoint_poll_interval_ms)
    }

    /// Set the cancel timeout
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable collection on release
    pub fn with_collect_on_release(mut self, enabled: bool) -> Self {
        self.collect_on_release = enabled;
        self
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", value, key);
            default
        }
    }
}

/// Per-context configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Options passed to languages through `Env::options`
    pub options: BTreeMap<String, String>,
    /// Languages that may be initialized in the context; empty permits all
    pub permitted_languages: Vec<String>,
}

impl ContextConfig {
    /// Add an option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Restrict the context to the given languages
    pub fn with_permitted_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the language may be used in the context
    pub fn permits(&self, language_id: &str) -> bool {
        self.permitted_languages.is_empty() || self.permitted_languages.iter().any(|id| id == language_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.reaper_thread_name, "polyhost-reaper");
        assert_eq!(config.cancel_timeout(), Duration::from_secs(10));
        assert_eq!(config.safepoint_poll_interval(), Duration::from_millis(10));
        assert!(config.collect_on_release);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("POLYHOST_CANCEL_TIMEOUT_MS", "250"),
            ("POLYHOST_COLLECT_ON_RELEASE", "false"),
            ("POLYHOST_SAFEPOINT_POLL_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.cancel_timeout_ms, 250);
        assert!(!config.collect_on_release);
        assert_eq!(config.safepoint_poll_interval_ms, 10);
    }

    #[test]
    fn test_config_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            polyglot_thread_name = "guest"
            cancel_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.polyglot_thread_name, "guest");
        assert_eq!(config.cancel_timeout_ms, 500);
        assert_eq!(config.reaper_thread_name, "polyhost-reaper");
    }

    #[test]
    fn test_config_rejects_invalid_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("safepoint_poll_interval_ms = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("cancel_timeout_ms = \"soon\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_context_config_permits() {
        let config = ContextConfig::default();
        assert!(config.permits("anything"));

        let config = ContextConfig::default()
            .with_permitted_languages(["js"])
            .with_option("js.strict", "true");
        assert!(config.permits("js"));
        assert!(!config.permits("ruby"));
        assert_eq!(config.options.get("js.strict").map(String::as_str), Some("true"));
    }
}
