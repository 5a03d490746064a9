use anyhow::{Context, bail};
use phimask_core::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where masked documents go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingMode {
    /// Copy masked documents into `{collection}{destination_suffix}`.
    #[serde(alias = "copy")]
    Separate,
    /// Overwrite fields in the source collection.
    #[serde(alias = "in-situ", alias = "insitu")]
    InSitu,
}

/// Masking job configuration (TOML or JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub masking_mode: MaskingMode,

    pub phi_collections: Vec<String>,

    /// Rule file; relative paths resolve against the config file's directory.
    pub rules_path: PathBuf,

    pub checkpoint_interval: u64,

    pub batch_size: BatchSizeConfig,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Makes random strategies reproducible across runs and resumes.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_destination_suffix")]
    pub destination_suffix: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSizeConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    #[serde(default = "default_target_write_latency_ms")]
    pub target_write_latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sqlite:` URL of the document database. Defaults to the data dir.
    #[serde(default)]
    pub documents_url: Option<String>,

    /// `sqlite:` URL, or a `.json` path for a file-backed store.
    /// Defaults to the document database.
    #[serde(default)]
    pub checkpoint_url: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            target_write_latency_ms: default_target_write_latency_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_destination_suffix() -> String {
    "_masked".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_op_timeout_ms() -> u64 {
    30_000
}

fn default_target_write_latency_ms() -> u64 {
    2_000
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn target_write_latency(&self) -> Duration {
        Duration::from_millis(self.target_write_latency_ms)
    }
}

/// Where checkpoints live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointLocation {
    Sqlite(String),
    /// Directory holding one JSON file per run.
    JsonDir(PathBuf),
}

impl StorageConfig {
    pub fn checkpoint_location(&self) -> Option<CheckpointLocation> {
        let url = self.checkpoint_url.as_deref()?;
        if url.starts_with("sqlite:") {
            return Some(CheckpointLocation::Sqlite(url.to_string()));
        }
        let path = PathBuf::from(url);
        // A `.json` path names the store; runs are kept next to it.
        if path.extension().is_some_and(|ext| ext == "json") {
            let dir = path.with_extension("");
            Some(CheckpointLocation::JsonDir(dir))
        } else {
            Some(CheckpointLocation::JsonDir(path))
        }
    }
}

impl JobConfig {
    /// Load and validate a job config. `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        if config.rules_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.rules_path = dir.join(&config.rules_path);
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: JobConfig = toml::from_str(content).context("Invalid TOML job config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let config: JobConfig = serde_json::from_str(content).context("Invalid JSON job config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.phi_collections.is_empty() {
            bail!(ConfigurationError::Invalid(
                "phi_collections must name at least one collection".to_string()
            ));
        }
        let mut seen = HashSet::new();
        for collection in &self.phi_collections {
            if collection.trim().is_empty() {
                bail!(ConfigurationError::Invalid("empty collection name".to_string()));
            }
            if !seen.insert(collection.as_str()) {
                bail!(ConfigurationError::Invalid(format!(
                    "collection '{}' is listed twice",
                    collection
                )));
            }
        }
        if self.checkpoint_interval == 0 {
            bail!(ConfigurationError::Invalid(
                "checkpoint_interval must be at least 1".to_string()
            ));
        }

        let sizes = &self.batch_size;
        if sizes.min == 0 || sizes.min > sizes.max || sizes.initial < sizes.min || sizes.initial > sizes.max {
            bail!(ConfigurationError::InvalidBatchSize(format!(
                "expected 1 <= min <= initial <= max, got min={} initial={} max={}",
                sizes.min, sizes.initial, sizes.max
            )));
        }

        if self.workers == 0 {
            bail!(ConfigurationError::Invalid("workers must be at least 1".to_string()));
        }
        if self.masking_mode == MaskingMode::Separate && self.destination_suffix.is_empty() {
            bail!(ConfigurationError::Invalid(
                "destination_suffix must not be empty in separate mode".to_string()
            ));
        }
        if self.retry.max_attempts == 0 {
            bail!(ConfigurationError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn destination_for(&self, collection: &str) -> String {
        format!("{}{}", collection, self.destination_suffix)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("org", "phimask", "phimask") {
            dirs.config_dir().join("phimask.toml")
        } else {
            PathBuf::from(".phimask/phimask.toml")
        }
    }
}
