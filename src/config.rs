// src/config.rs

//! Manages pipeline configuration: loading, resolving defaults, and validation.

use crate::core::errors::PageVeilError;
use crate::core::scheduler::job::{JobConfig, JobConfigOverride};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use tracing::warn;
use url::Url;

/// Static client configuration attached to alive messages (quorum-gated).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BrowserInfo {
    #[serde(default = "default_redacted")]
    pub browser: String,
    #[serde(default = "default_redacted")]
    pub version: String,
    #[serde(default = "default_redacted")]
    pub os: String,
    #[serde(default = "default_redacted")]
    pub language: String,
}

impl Default for BrowserInfo {
    fn default() -> Self {
        Self {
            browser: default_redacted(),
            version: default_redacted(),
            os: default_redacted(),
            language: default_redacted(),
        }
    }
}

fn default_redacted() -> String {
    "--".to_string()
}

/// Top-level configuration. Only the documented knobs are recognized;
/// unknown keys fail the load rather than being silently ignored.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReportingConfig {
    /// Countries large enough to report without narrowing the population.
    #[serde(rename = "ALLOWED_COUNTRY_CODES", default = "default_allowed_country_codes")]
    pub allowed_country_codes: Vec<String>,

    /// Where pattern rulesets are downloaded from.
    #[serde(rename = "PATTERNS_URL", default = "default_patterns_url")]
    pub patterns_url: String,

    /// Where the remote pipeline configuration is downloaded from.
    #[serde(rename = "CONFIG_URL", default = "default_config_url")]
    pub config_url: String,

    #[serde(default)]
    pub browser: BrowserInfo,

    /// Per-handler scheduling overrides keyed by job type. Only the five
    /// JobConfig keys are accepted; anything else is rejected on load.
    #[serde(default)]
    pub jobs: HashMap<String, JobConfigOverride>,
}

fn default_allowed_country_codes() -> Vec<String> {
    [
        "at", "be", "ch", "de", "dk", "es", "fi", "fr", "gb", "ie", "it", "nl", "no", "pl",
        "pt", "se", "us",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_patterns_url() -> String {
    "https://rules.pageveil.net/patterns.json".to_string()
}

fn default_config_url() -> String {
    "https://rules.pageveil.net/config.json".to_string()
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            allowed_country_codes: default_allowed_country_codes(),
            patterns_url: default_patterns_url(),
            config_url: default_config_url(),
            browser: BrowserInfo::default(),
            jobs: HashMap::new(),
        }
    }
}

impl ReportingConfig {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &str) -> Result<Self, PageVeilError> {
        let contents = fs::read_to_string(path)?;
        let config: ReportingConfig = toml::from_str(&contents)
            .map_err(|e| PageVeilError::InvalidConfig(format!("failed to parse '{path}': {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    /// An empty URL disables the corresponding download.
    pub fn validate(&self) -> Result<(), PageVeilError> {
        for (name, value) in [
            ("PATTERNS_URL", &self.patterns_url),
            ("CONFIG_URL", &self.config_url),
        ] {
            if value.is_empty() {
                continue;
            }
            let parsed = Url::parse(value)
                .map_err(|e| PageVeilError::InvalidConfig(format!("{name} is invalid: {e}")))?;
            if parsed.scheme() != "https" {
                return Err(PageVeilError::InvalidConfig(format!(
                    "{name} must use https, got '{}'",
                    parsed.scheme()
                )));
            }
        }
        for code in &self.allowed_country_codes {
            if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_lowercase()) {
                warn!(
                    "ALLOWED_COUNTRY_CODES entry '{code}' is not a lowercase ISO 3166-1 code"
                );
            }
        }
        for (job_type, override_) in &self.jobs {
            override_.resolve().validate().map_err(|e| {
                PageVeilError::InvalidConfig(format!("job config for '{job_type}': {e}"))
            })?;
        }
        Ok(())
    }

    /// The scheduling config for a job type: built-in defaults overlaid
    /// with the host's overrides.
    pub fn job_config_for(&self, job_type: &str, defaults: JobConfig) -> JobConfig {
        match self.jobs.get(job_type) {
            Some(override_) => override_.apply(defaults),
            None => defaults,
        }
    }
}
