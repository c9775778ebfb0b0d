//! Application configuration for Knowledge Horizon.
//!
//! User config lives at `~/.horizon/horizon.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HorizonError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "horizon.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".horizon";

// ---------------------------------------------------------------------------
// Config structs (matching horizon.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// PubMed E-utilities settings.
    #[serde(default)]
    pub pubmed: PubMedConfig,

    /// Pipeline limits and LLM defaults.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file path.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.horizon/horizon.db".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model for every LLM stage without an override.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// API base URL.
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_timeout() -> u64 {
    120
}

/// `[pubmed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubMedConfig {
    /// E-utilities base URL.
    #[serde(default = "default_pubmed_url")]
    pub base_url: String,

    /// Optional env var holding an NCBI API key (raises the rate limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_pubmed_timeout")]
    pub timeout_secs: u64,
}

impl Default for PubMedConfig {
    fn default() -> Self {
        Self {
            base_url: default_pubmed_url(),
            api_key_env: None,
            timeout_secs: default_pubmed_timeout(),
        }
    }
}

fn default_pubmed_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".into()
}
fn default_pubmed_timeout() -> u64 {
    30
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hard cap on candidates fetched per query from one source.
    #[serde(default = "default_max_per_source")]
    pub max_articles_per_source: usize,

    /// Hard cap on candidates staged per execution.
    #[serde(default = "default_max_total")]
    pub max_total_articles: usize,

    /// Seconds without progress before a heartbeat event is emitted.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Report batch progress every N completions.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Concurrent LLM calls per stage unless the execution overrides it.
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// Sampling temperature unless the execution overrides it.
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_articles_per_source: default_max_per_source(),
            max_total_articles: default_max_total(),
            heartbeat_secs: default_heartbeat_secs(),
            progress_interval: default_progress_interval(),
            default_max_concurrency: default_max_concurrency(),
            default_temperature: default_temperature(),
        }
    }
}

fn default_max_per_source() -> usize {
    500
}
fn default_max_total() -> usize {
    1000
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_progress_interval() -> usize {
    10
}
fn default_max_concurrency() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.0
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.horizon/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HorizonError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.horizon/horizon.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HorizonError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HorizonError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HorizonError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HorizonError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HorizonError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| HorizonError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(HorizonError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
