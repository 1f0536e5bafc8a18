//! Configuration management for Sluice
//!
//! Every section is optional in the file; missing values fall back to the
//! defaults below. Components take their section by reference at
//! construction time, so tests can build isolated instances without a file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, SluiceError};

/// Project-level Sluice configuration
///
/// Loaded from `.sluice/config.toml` under the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Pacing of outbound provider calls
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Pacing of artifact saves into workspaces
    #[serde(default = "default_artifact_rate_limit")]
    pub artifact_rate_limit: RateLimitConfig,

    /// Per-provider circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry policy for provider calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Providers in preference order (first is primary)
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Workspace layout and generation policy
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Input resolution limits
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Token bucket parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst of tokens
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens added per second at full speed
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,

    /// Upper bound on how long one `acquire` may wait
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_wait_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Circuit breaker parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive retriable failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before allowing a probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per provider, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// One remote model provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name used in logs and failure summaries
    pub name: String,

    /// Model identifier sent to the provider
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Override of the provider endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

/// How `Workspace::ensure` treats a session with no bound workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPolicy {
    /// Every new session gets its own timestamped generation
    #[default]
    NewPerSession,
    /// Attach to the most recent existing generation of the dataset
    ReuseLatest,
}

/// Workspace layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding `<dataset>/<generation>/` trees
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub generation_policy: GenerationPolicy,

    /// Well-known upload locations searched when a dataset is missing
    #[serde(default = "default_upload_dirs")]
    pub upload_dirs: Vec<PathBuf>,
}

/// Input resolution limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Bytes read from the start of a file to prove it is readable
    #[serde(default = "default_prefix_bytes")]
    pub prefix_bytes: usize,

    /// Cap on directory entries inspected by the fuzzy search
    #[serde(default = "default_max_scan_entries")]
    pub max_scan_entries: usize,
}

// Default value providers
fn default_capacity() -> f64 {
    10.0
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_max_wait_secs() -> f64 {
    10.0
}

fn default_artifact_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        capacity: 20.0,
        refill_per_sec: 5.0,
        max_wait_secs: default_max_wait_secs(),
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> usize {
    4096
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".sluice/workspaces")
}

fn default_upload_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("uploads"), PathBuf::from("data")]
}

fn default_prefix_bytes() -> usize {
    4096
}

fn default_max_scan_entries() -> usize {
    500
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            artifact_rate_limit: default_artifact_rate_limit(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            providers: Vec::new(),
            workspace: WorkspaceConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            generation_policy: GenerationPolicy::default(),
            upload_dirs: default_upload_dirs(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            prefix_bytes: default_prefix_bytes(),
            max_scan_entries: default_max_scan_entries(),
        }
    }
}

impl SluiceConfig {
    /// Load configuration from `.sluice/config.toml` or use defaults
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".sluice/config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.anchor_paths(project_root);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SluiceError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.sluice/config.toml`
    pub fn write_default(project_root: &Path) -> Result<PathBuf> {
        let config_dir = project_root.join(".sluice");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| SluiceError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Resolve relative workspace and upload paths against the project root
    pub fn anchor_paths(&mut self, project_root: &Path) {
        if self.workspace.root.is_relative() {
            self.workspace.root = project_root.join(&self.workspace.root);
        }
        for dir in &mut self.workspace.upload_dirs {
            if dir.is_relative() {
                *dir = project_root.join(&*dir);
            }
        }
    }

    /// Reject values the components cannot operate with
    pub fn validate(&self) -> Result<()> {
        for (section, limit) in [
            ("rate_limit", &self.rate_limit),
            ("artifact_rate_limit", &self.artifact_rate_limit),
        ] {
            if limit.capacity <= 0.0 || limit.refill_per_sec <= 0.0 {
                return Err(SluiceError::Config(format!(
                    "[{}] capacity and refill_per_sec must be positive",
                    section
                )));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(SluiceError::Config(
                "[breaker] failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(SluiceError::Config(
                "[retry] max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry.factor < 1.0 {
            return Err(SluiceError::Config(
                "[retry] factor must be >= 1.0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(SluiceError::Config(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SluiceConfig::default();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(300));
        assert_eq!(config.rate_limit.max_wait(), Duration::from_secs(10));
        assert_eq!(config.workspace.generation_policy, GenerationPolicy::NewPerSession);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = SluiceConfig::from_toml(
            r#"
            [breaker]
            cooldown_secs = 60

            [[providers]]
            name = "primary"
            model = "claude-sonnet-4-5"

            [[providers]]
            name = "secondary"
            model = "claude-haiku-4-5"
            api_key_env = "BACKUP_KEY"

            [workspace]
            generation_policy = "reuse_latest"
            "#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_secs, 60);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.providers[1].api_key_env, "BACKUP_KEY");
        assert_eq!(config.workspace.generation_policy, GenerationPolicy::ReuseLatest);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_write_default_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = SluiceConfig::write_default(temp_dir.path()).unwrap();
        assert!(path.exists());

        let config = SluiceConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.workspace.root, temp_dir.path().join(".sluice/workspaces"));
        assert_eq!(config.workspace.upload_dirs[0], temp_dir.path().join("uploads"));
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        let config = SluiceConfig::from_toml(
            r#"
            [[providers]]
            name = "primary"
            model = "a"

            [[providers]]
            name = "primary"
            model = "b"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = SluiceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
