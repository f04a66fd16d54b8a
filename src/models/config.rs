//! Configuration models for pairgen.
//!
//! Every tunable of a run lives here and is loaded once from a TOML file.
//! The resulting `Config` is immutable and passed into the sampler and
//! dispatcher at construction time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level configuration for pairgen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seed for every random draw made by the sampler
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Reservoir sampling settings
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Where corpus files live and how they are labeled
    pub sources: SourcesConfig,

    /// Prompt and schema settings
    pub generation: GenerationConfig,

    /// Backing generation providers
    pub providers: Vec<ProviderConfig>,

    /// Ledger persistence
    pub ledger: LedgerConfig,

    /// Re-asking existing pairs from a pair file
    #[serde(default)]
    pub reask: Option<ReaskConfig>,
}

fn default_seed() -> u64 {
    42
}

/// Reservoir sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Reservoir capacity per source label
    #[serde(default = "default_sample_size")]
    pub sample_size_per_source: usize,

    /// Drop chunks longer than this many characters before sampling
    #[serde(default)]
    pub max_chars: Option<usize>,

    /// Ordered slices cut from each sampled set, by fixed offsets
    #[serde(default)]
    pub splits: Vec<SplitSpec>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_size_per_source: default_sample_size(),
            max_chars: None,
            splits: Vec::new(),
        }
    }
}

fn default_sample_size() -> usize {
    160
}

/// A named slice of the sampled set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub name: String,
    pub size: usize,
}

/// Corpus discovery and labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Directory scanned for corpus shards
    pub dir: PathBuf,

    /// Glob pattern (relative to `dir`) selecting shard files
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// File-name substring → source label
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Label for files that match no entry in `labels`; unmatched files are
    /// dropped when unset
    #[serde(default)]
    pub default_label: Option<String>,
}

fn default_pattern() -> String {
    "*.txt".to_string()
}

/// Generation settings shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Path to the prompt template; `{TEXT}` is replaced by the chunk text
    pub prompt_template: PathBuf,

    /// How many independent generations to request per chunk and provider
    #[serde(default = "default_variants")]
    pub variants_per_job: u32,

    /// Extra whole-prompt attempts after a terminal adapter failure
    #[serde(default = "default_reask_attempts")]
    pub reask_attempts: u32,

    /// Required output fields, in order
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
}

fn default_variants() -> u32 {
    1
}

fn default_reask_attempts() -> u32 {
    1
}

fn default_fields() -> Vec<String> {
    vec!["instruction".to_string(), "response".to_string()]
}

/// Re-ask settings: existing pairs are sent to every provider again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaskConfig {
    /// JSONL file of existing pairs
    pub input: PathBuf,

    /// Source label recorded for these pairs
    #[serde(default = "default_reask_label")]
    pub label: String,

    /// Prompt template; `{INSTRUCTION}` and `{RESPONSE}` are the pair's fields
    pub prompt_template: PathBuf,

    /// Required output fields, in order
    #[serde(default = "default_reask_fields")]
    pub fields: Vec<String>,

    /// Ledger for re-ask records; the main ledger when unset
    #[serde(default)]
    pub ledger: Option<PathBuf>,

    /// Re-ask at most this many not-yet-done pairs per run
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_reask_label() -> String {
    "pairs".to_string()
}

fn default_reask_fields() -> Vec<String> {
    vec![
        "instruction".to_string(),
        "response".to_string(),
        "response_variant_2".to_string(),
    ]
}

/// Transport used to reach a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any endpoint speaking the OpenAI chat completions API
    #[default]
    OpenaiCompatible,
    /// Anthropic Messages API; structured mode forces a tool call
    AnthropicMessages,
}

/// Configuration for one backing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier, recorded in the ledger and part of every fingerprint
    pub id: String,

    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL for the API (e.g. "https://api.openai.com/v1")
    pub base_url: String,

    /// Model name sent to the endpoint
    pub model: String,

    /// API key; `${VAR}` placeholders are expanded from the environment
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Maximum concurrent in-flight jobs for this provider
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between retries, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Use the endpoint's schema-constrained output mode instead of free text
    #[serde(default = "default_true")]
    pub structured: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    800
}

impl ProviderConfig {
    /// Resolve the API key from config or environment.
    ///
    /// `Ok(None)` means no key is configured, which is valid for local
    /// endpoints.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        match &self.api_key_env {
            Some(env_var) => std::env::var(env_var)
                .map(Some)
                .map_err(|_| ConfigError::MissingApiKey {
                    provider: self.id.clone(),
                    env_var: env_var.clone(),
                }),
            None => Ok(None),
        }
    }
}

/// Ledger persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSONL file holding one committed record per line
    pub path: PathBuf,

    /// fsync after every append
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one provider is required".into()));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}': concurrency must be at least 1",
                    provider.id
                )));
            }
        }

        require_pair_fields("generation", &self.generation.fields)?;
        if let Some(reask) = &self.reask {
            require_pair_fields("reask", &reask.fields)?;
            if reask.label.trim().is_empty() {
                return Err(ConfigError::Invalid("reask label must not be empty".into()));
            }
        }
        if self.generation.variants_per_job == 0 {
            return Err(ConfigError::Invalid("variants_per_job must be at least 1".into()));
        }

        let split_total: usize = self.sampling.splits.iter().map(|s| s.size).sum();
        if split_total > self.sampling.sample_size_per_source {
            return Err(ConfigError::Invalid(format!(
                "splits take {split_total} chunks but only {} are sampled per source",
                self.sampling.sample_size_per_source
            )));
        }

        Ok(())
    }
}

fn require_pair_fields(section: &str, fields: &[String]) -> Result<(), ConfigError> {
    for required in ["instruction", "response"] {
        if !fields.iter().any(|f| f == required) {
            return Err(ConfigError::Invalid(format!(
                "{section} fields must include '{required}'"
            )));
        }
    }
    Ok(())
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key for provider '{provider}': set {env_var} env var or api_key in config")]
    MissingApiKey { provider: String, env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
