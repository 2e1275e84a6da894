//! Configuration loading and resolution
//!
//! Config file resolution order:
//! 1. Explicit path (command-line argument)
//! 2. `STUDYLINK_CONFIG` environment variable
//! 3. `<platform config dir>/studylink/config.toml`
//! 4. Compiled defaults
//!
//! A missing or unreadable file never aborts startup: a warning is logged and
//! compiled defaults are used. Environment variables are applied on top of
//! whatever was loaded, so secrets never need to live in the TOML file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "STUDYLINK_CONFIG";

/// Default classifier endpoint (OpenAI-compatible chat completions API)
pub const DEFAULT_CLASSIFIER_BASE_URL: &str = "https://api.openai.com/v1";

/// Default classifier model
pub const DEFAULT_CLASSIFIER_MODEL: &str = "gpt-5";

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudylinkConfig {
    pub logging: LoggingConfig,
    pub classifier: ClassifierSettings,
    pub document_store: DocumentStoreSettings,
    pub file_upload: FileUploadSettings,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive (e.g. "info", "studylink_eval=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[classifier]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Per-invocation timeout
    pub timeout_secs: u64,
    /// Retries per invocation strategy
    pub max_retries: u32,
    /// Backoff base; delay before retry n is `base * 2^n`
    pub backoff_base_ms: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CLASSIFIER_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_CLASSIFIER_MODEL.to_string(),
            timeout_secs: 120,
            max_retries: 1,
            backoff_base_ms: 500,
        }
    }
}

/// `[document_store]` section (report attachment source)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentStoreSettings {
    /// None disables attachment fetching entirely
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for DocumentStoreSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: 60,
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

/// `[file_upload]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileUploadSettings {
    /// When false, attachments are always sent inline
    pub enabled: bool,
}

impl Default for FileUploadSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl StudylinkConfig {
    /// Resolve, load and apply environment overrides
    ///
    /// Never fails: problems are logged and defaults are used.
    pub fn load(cli_path: Option<&Path>) -> Self {
        let mut config = match resolve_config_path(cli_path) {
            Some(path) => match load_toml_config(&path) {
                Ok(config) => {
                    info!("Configuration loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to load config {}: {}. Using compiled defaults.",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            None => {
                info!("No config file found, using compiled defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Blank values are ignored. Unparseable numeric values are logged and
    /// ignored rather than rejected.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("STUDYLINK_OPENAI_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.classifier.api_key = Some(key.trim().to_string());
        }
        if let Some(url) = get("STUDYLINK_OPENAI_BASE_URL") {
            self.classifier.base_url = url.trim().to_string();
        }
        if let Some(model) = get("STUDYLINK_CLASSIFIER_MODEL") {
            self.classifier.model = model.trim().to_string();
        }
        if let Some(v) = get("STUDYLINK_CLASSIFIER_MAX_RETRIES") {
            apply_parsed(&v, "STUDYLINK_CLASSIFIER_MAX_RETRIES", &mut self.classifier.max_retries);
        }
        if let Some(v) = get("STUDYLINK_CLASSIFIER_BACKOFF_MS") {
            apply_parsed(&v, "STUDYLINK_CLASSIFIER_BACKOFF_MS", &mut self.classifier.backoff_base_ms);
        }

        if let Some(url) = get("MEERKAT_API_URL") {
            self.document_store.base_url = Some(url.trim().to_string());
        }
        if let Some(key) = get("MEERKAT_API_KEY") {
            self.document_store.api_key = Some(key.trim().to_string());
        }
        if let Some(v) = get("MEERKAT_TIMEOUT_SECONDS") {
            match parse_seconds_ms(&v) {
                Some(ms) => self.document_store.timeout_secs = (ms / 1000).max(1),
                None => warn!("Ignoring invalid MEERKAT_TIMEOUT_SECONDS={}", v),
            }
        }
        if let Some(v) = get("MEERKAT_PDF_RETRIES") {
            apply_parsed(&v, "MEERKAT_PDF_RETRIES", &mut self.document_store.max_retries);
        }
        if let Some(v) = get("MEERKAT_PDF_RETRY_BACKOFF_SECONDS") {
            match parse_seconds_ms(&v) {
                Some(ms) => self.document_store.backoff_base_ms = ms,
                None => warn!("Ignoring invalid MEERKAT_PDF_RETRY_BACKOFF_SECONDS={}", v),
            }
        }
    }
}

fn apply_parsed<T: std::str::FromStr>(raw: &str, name: &str, target: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!("Ignoring invalid {}={}", name, raw),
    }
}

/// Parse a (possibly fractional) number of seconds into milliseconds
fn parse_seconds_ms(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0).round() as u64)
}

/// Find the config file to load, if any
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    default_config_path().filter(|p| p.exists())
}

/// `<platform config dir>/studylink/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("studylink").join("config.toml"))
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<StudylinkConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)?;
    Ok(config)
}
