//! Core configuration
//!
//! Defaults are usable as-is. A TOML file can override any subset of fields,
//! and `SORTIE_*` environment variables override the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{OrchestratorError, Result, ResultExt};
use crate::registry::MAX_DURATION_HINT_SECS;

/// Main core configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerSettings,
    pub intent: IntentSettings,
    pub knowledge: KnowledgeSettings,
    pub workflow: WorkflowSettings,
}

/// Longest timeout the scheduler arms for one attempt
pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Execution scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Concurrent slots shared by all shared-limited modules
    pub shared_pool_size: usize,

    /// Timeout = duration hint × multiplier
    pub timeout_multiplier: f64,

    /// Retries after the first attempt
    pub max_retries: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Duration hint for modules that declare none
    pub default_duration_hint_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            shared_pool_size: 8,
            timeout_multiplier: 3.0,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            default_duration_hint_secs: 60,
        }
    }
}

impl SchedulerSettings {
    pub fn default_duration_hint(&self) -> Duration {
        Duration::from_secs(self.default_duration_hint_secs)
    }

    /// Timeout derived from a duration hint, saturating at
    /// [`MAX_ATTEMPT_TIMEOUT`]
    pub fn timeout_for(&self, hint: Duration) -> Duration {
        Duration::try_from_secs_f64(hint.as_secs_f64() * self.timeout_multiplier)
            .unwrap_or(MAX_ATTEMPT_TIMEOUT)
            .clamp(Duration::from_millis(1), MAX_ATTEMPT_TIMEOUT)
    }

    /// Delay before retry number `retry` (1-based), doubling up to the cap
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Intent resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentSettings {
    /// Candidates below this confidence require explicit confirmation
    pub confidence_threshold: f64,

    pub oracle_timeout_secs: u64,
    pub max_prompt_chars: usize,

    /// Entities and history entries included in the prompt context
    pub context_items: usize,

    /// Recent user commands included in the prompt context
    pub recent_commands: usize,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            oracle_timeout_secs: 30,
            max_prompt_chars: 8000,
            context_items: 20,
            recent_commands: 5,
        }
    }
}

impl IntentSettings {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

/// Knowledge store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeSettings {
    /// Snapshot size used for dependency resolution
    pub resolver_snapshot_items: usize,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self {
            resolver_snapshot_items: 256,
        }
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Upper bound on oracle-chosen steps per adaptive run
    pub max_adaptive_steps: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self { max_adaptive_steps: 10 }
    }
}

impl CoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_pool_size(mut self, size: usize) -> Self {
        self.scheduler.shared_pool_size = size;
        self
    }

    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.scheduler.timeout_multiplier = multiplier;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.scheduler.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.scheduler.backoff_base_ms = base_ms;
        self.scheduler.backoff_max_ms = max_ms;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.intent.confidence_threshold = threshold;
        self
    }

    /// Whole seconds, rounded up so a sub-second timeout stays non-zero
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.intent.oracle_timeout_secs = timeout.as_secs().saturating_add(partial);
        self
    }

    pub fn with_max_adaptive_steps(mut self, steps: usize) -> Self {
        self.workflow.max_adaptive_steps = steps;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| OrchestratorError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(OrchestratorError::from)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Defaults, then the optional file, then the environment (a `.env` file
    /// in the working directory is loaded first)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SORTIE_*` overrides read through `lookup`
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| OrchestratorError::Config(format!("{} has an invalid value '{}'", key, raw)))
        }

        if let Some(v) = lookup("SORTIE_SHARED_POOL_SIZE") {
            self.scheduler.shared_pool_size = parse("SORTIE_SHARED_POOL_SIZE", v)?;
        }
        if let Some(v) = lookup("SORTIE_TIMEOUT_MULTIPLIER") {
            self.scheduler.timeout_multiplier = parse("SORTIE_TIMEOUT_MULTIPLIER", v)?;
        }
        if let Some(v) = lookup("SORTIE_MAX_RETRIES") {
            self.scheduler.max_retries = parse("SORTIE_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("SORTIE_CONFIDENCE_THRESHOLD") {
            self.intent.confidence_threshold = parse("SORTIE_CONFIDENCE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("SORTIE_ORACLE_TIMEOUT_SECS") {
            self.intent.oracle_timeout_secs = parse("SORTIE_ORACLE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("SORTIE_MAX_ADAPTIVE_STEPS") {
            self.workflow.max_adaptive_steps = parse("SORTIE_MAX_ADAPTIVE_STEPS", v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.shared_pool_size == 0 {
            return Err(OrchestratorError::Config("scheduler.shared_pool_size must be at least 1".into()));
        }
        if !(s.timeout_multiplier.is_finite() && s.timeout_multiplier > 0.0) {
            return Err(OrchestratorError::Config("scheduler.timeout_multiplier must be positive".into()));
        }
        if s.backoff_base_ms > s.backoff_max_ms {
            return Err(OrchestratorError::Config(
                "scheduler.backoff_base_ms must not exceed scheduler.backoff_max_ms".into(),
            ));
        }
        if s.default_duration_hint_secs == 0 || s.default_duration_hint_secs > MAX_DURATION_HINT_SECS {
            return Err(OrchestratorError::Config(format!(
                "scheduler.default_duration_hint_secs must be within 1..={}",
                MAX_DURATION_HINT_SECS
            )));
        }
        if self.intent.oracle_timeout_secs == 0 {
            return Err(OrchestratorError::Config("intent.oracle_timeout_secs must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.intent.confidence_threshold) {
            return Err(OrchestratorError::Config("intent.confidence_threshold must be within [0, 1]".into()));
        }
        if self.intent.max_prompt_chars < 256 {
            return Err(OrchestratorError::Config("intent.max_prompt_chars must be at least 256".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.shared_pool_size, 8);
        assert_eq!(config.intent.confidence_threshold, 0.7);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = SchedulerSettings::default();
        assert_eq!(s.backoff(1), Duration::from_millis(500));
        assert_eq!(s.backoff(2), Duration::from_millis(1000));
        assert_eq!(s.backoff(3), Duration::from_millis(2000));
        assert_eq!(s.backoff(40), Duration::from_millis(30_000));
        assert_eq!(s.timeout_for(Duration::from_secs(10)), Duration::from_secs(30));
    }

    #[test]
    fn timeout_saturates_instead_of_overflowing() {
        let s = SchedulerSettings::default();
        assert_eq!(s.timeout_for(Duration::from_secs(u64::MAX / 2)), MAX_ATTEMPT_TIMEOUT);
        assert_eq!(s.timeout_for(Duration::MAX), MAX_ATTEMPT_TIMEOUT);
        assert_eq!(s.timeout_for(Duration::ZERO), Duration::from_millis(1));

        let huge_default = CoreConfig::from_toml_str("[scheduler]\ndefault_duration_hint_secs = 9223372036854775807");
        assert!(huge_default.is_err());
    }

    #[test]
    fn oracle_timeout_rounds_up_and_rejects_zero() {
        let config = CoreConfig::default().with_oracle_timeout(Duration::from_millis(500));
        assert_eq!(config.intent.oracle_timeout_secs, 1);
        assert!(config.validate().is_ok());

        let config = CoreConfig::default().with_oracle_timeout(Duration::from_millis(2_001));
        assert_eq!(config.intent.oracle_timeout(), Duration::from_secs(3));

        assert!(CoreConfig::default().with_oracle_timeout(Duration::ZERO).validate().is_err());
        assert!(CoreConfig::from_toml_str("[intent]\noracle_timeout_secs = 0").is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nshared_pool_size = 2\n\n[intent]\nconfidence_threshold = 0.9").unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.shared_pool_size, 2);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.intent.confidence_threshold, 0.9);
        assert_eq!(config.workflow.max_adaptive_steps, 10);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(CoreConfig::default().with_shared_pool_size(0).validate().is_err());
        assert!(CoreConfig::default().with_confidence_threshold(1.5).validate().is_err());
        assert!(CoreConfig::default().with_backoff(5000, 100).validate().is_err());
        assert!(CoreConfig::from_toml_str("[scheduler]\ntimeout_multiplier = 0.0").is_err());
    }

    #[test]
    fn environment_overrides_apply() {
        let env: HashMap<&str, &str> = [("SORTIE_SHARED_POOL_SIZE", "3"), ("SORTIE_MAX_RETRIES", "0")]
            .into_iter()
            .collect();
        let config = CoreConfig::default()
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scheduler.shared_pool_size, 3);
        assert_eq!(config.scheduler.max_retries, 0);

        let err = CoreConfig::default()
            .apply_env_from(|k| (k == "SORTIE_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sortie.toml");
        let config = CoreConfig::default().with_max_adaptive_steps(4);
        config.to_file(&path).unwrap();
        assert_eq!(CoreConfig::from_file(&path).unwrap(), config);
    }
}
