//! Configuration for the evaluation harness.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{EvalError, Result};
use crate::rubric::RetryPolicy;
use crate::scorer::Thresholds;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Judge model connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the judge API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Grading model name (e.g., "gpt-4o")
    pub model: String,

    /// Maximum tokens for the judge reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature for the judge
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Ask the endpoint for a JSON object reply (`response_format`)
    #[serde(default = "default_json_mode")]
    pub json_mode: bool,

    /// Sampling seed, for endpoints that support reproducible grading
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.0
}

fn default_json_mode() -> bool {
    true
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            json_mode: default_json_mode(),
            seed: None,
        }
    }
}

/// Scoring and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Pass threshold for reference coverage, in [0, 1].
    pub reference_threshold: f64,

    /// Pass threshold for must-include coverage, in [0, 1].
    pub must_include_threshold: f64,

    /// Samples scored at once. 1 means sequential.
    pub concurrency: usize,

    /// Per judge call deadline in seconds. 0 or `None` waits indefinitely.
    pub timeout_secs: Option<u64>,

    /// Retries after a timed-out judge call.
    pub max_retries: u32,

    /// Backoff before the first retry; doubled on each further attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            reference_threshold: 0.5,
            must_include_threshold: 0.5,
            concurrency: 1,
            timeout_secs: Some(60),
            max_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl EvalConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            reference_coverage: self.reference_threshold,
            must_include_coverage: self.must_include_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self
                .timeout_secs
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Judge model settings
    pub judge: LlmConfig,
    /// Evaluation settings
    pub eval: EvalConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    judge: Option<JudgeFileSection>,
    eval: Option<EvalFileSection>,
}

#[derive(Debug, Deserialize)]
struct JudgeFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    json_mode: Option<bool>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EvalFileSection {
    reference_threshold: Option<f64>,
    must_include_threshold: Option<f64>,
    concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
}

/// Parse an environment variable, ignoring unset or unparsable values.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (JUDGE_*, EVAL_*)
    /// 2. Config file (~/.config/screen-eval/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(api_base) = env::var("JUDGE_API_BASE") {
            self.judge.api_base = api_base;
        }
        if let Ok(api_key) = env::var("JUDGE_API_KEY") {
            self.judge.api_key = api_key;
        }
        if let Ok(model) = env::var("JUDGE_MODEL") {
            self.judge.model = model;
        }
        if let Some(tokens) = env_parse("JUDGE_MAX_TOKENS") {
            self.judge.max_tokens = tokens;
        }
        if let Some(temp) = env_parse("JUDGE_TEMPERATURE") {
            self.judge.temperature = temp;
        }
        if let Some(json_mode) = env_parse("JUDGE_JSON_MODE") {
            self.judge.json_mode = json_mode;
        }
        if let Some(seed) = env_parse("JUDGE_SEED") {
            self.judge.seed = Some(seed);
        }

        if let Some(t) = env_parse("EVAL_REFERENCE_THRESHOLD") {
            self.eval.reference_threshold = t;
        }
        if let Some(t) = env_parse("EVAL_MUST_INCLUDE_THRESHOLD") {
            self.eval.must_include_threshold = t;
        }
        if let Some(n) = env_parse("EVAL_CONCURRENCY") {
            self.eval.concurrency = n;
        }
        if let Some(secs) = env_parse("EVAL_TIMEOUT_SECS") {
            self.eval.timeout_secs = Some(secs);
        }
        if let Some(n) = env_parse("EVAL_MAX_RETRIES") {
            self.eval.max_retries = n;
        }
        if let Some(ms) = env_parse("EVAL_RETRY_BASE_DELAY_MS") {
            self.eval.retry_base_delay_ms = ms;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Self::from_yaml(&content)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        let file_config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(judge) = file_config.judge {
            if let Some(api_base) = judge.api_base {
                config.judge.api_base = api_base;
            }
            if let Some(api_key) = judge.api_key {
                config.judge.api_key = api_key;
            }
            if let Some(model) = judge.model {
                config.judge.model = model;
            }
            if let Some(max_tokens) = judge.max_tokens {
                config.judge.max_tokens = max_tokens;
            }
            if let Some(temperature) = judge.temperature {
                config.judge.temperature = temperature;
            }
            if let Some(json_mode) = judge.json_mode {
                config.judge.json_mode = json_mode;
            }
            if judge.seed.is_some() {
                config.judge.seed = judge.seed;
            }
        }

        if let Some(eval) = file_config.eval {
            if let Some(t) = eval.reference_threshold {
                config.eval.reference_threshold = t;
            }
            if let Some(t) = eval.must_include_threshold {
                config.eval.must_include_threshold = t;
            }
            if let Some(n) = eval.concurrency {
                config.eval.concurrency = n;
            }
            if eval.timeout_secs.is_some() {
                config.eval.timeout_secs = eval.timeout_secs;
            }
            if let Some(n) = eval.max_retries {
                config.eval.max_retries = n;
            }
            if let Some(ms) = eval.retry_base_delay_ms {
                config.eval.retry_base_delay_ms = ms;
            }
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "screen-eval")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate the scoring settings. Judge settings are checked separately
    /// because offline commands never contact the judge.
    pub fn validate_eval(&self) -> Result<()> {
        for (name, value) in [
            ("reference_threshold", self.eval.reference_threshold),
            ("must_include_threshold", self.eval.must_include_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EvalError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.eval.concurrency == 0 {
            return Err(EvalError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.judge.api_base.is_empty() {
            return Err(EvalError::Config(
                "Judge API base URL is required. Set JUDGE_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.judge.api_key.is_empty() {
            return Err(EvalError::Config(
                "Judge API key is required. Set JUDGE_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.judge.model.is_empty() {
            return Err(EvalError::Config(
                "Judge model is required. Set JUDGE_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        self.validate_eval()
    }

    /// Create a config from explicit values (useful for testing).
    pub fn with_judge(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            judge: LlmConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            eval: EvalConfig::default(),
        }
    }
}
