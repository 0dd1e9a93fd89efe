//! Configuration for the program continuity engine.
//!
//! Strongly typed structs with serde defaults, so a partial YAML document (or
//! none at all) always yields a usable configuration. Values can then be
//! overridden from the environment with the `PMOPROGRAM_CONFIG__<KEY>`
//! convention.

use crate::fuzzy::FuzzyFactor;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment overrides, e.g. `PMOPROGRAM_CONFIG__FUZZY_FACTOR_MS=60000`
pub const ENV_PREFIX: &str = "PMOPROGRAM_CONFIG__";

/// Top-level configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Jitter window bounding how early the backend is contacted before a boundary
    #[serde(default, rename = "fuzzy_factor_ms")]
    pub fuzzy_factor: FuzzyFactor,
    #[serde(default = "ProgramConfig::default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "ProgramConfig::default_command_buffer")]
    pub command_buffer: usize,
    /// Fixed seed for the jitter generator. Random when absent.
    #[serde(default)]
    pub jitter_seed: Option<u64>,
    #[serde(default)]
    pub restrictions: RestrictionsConfig,
}

impl ProgramConfig {
    const fn default_event_buffer() -> usize {
        64
    }

    const fn default_command_buffer() -> usize {
        32
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(yaml).context("Failed to parse program configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Load `path` when it exists, then apply environment overrides
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be greater than 0"));
        }
        if self.command_buffer == 0 {
            return Err(anyhow!("command_buffer must be greater than 0"));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let vars: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        self.apply_overrides(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Apply `PMOPROGRAM_CONFIG__*` style key/value pairs
    pub fn apply_overrides<'a>(
        &mut self,
        vars: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "fuzzy_factor_ms" => {
                    let millis: i64 = value
                        .parse()
                        .with_context(|| format!("Invalid {key}: {value}"))?;
                    self.fuzzy_factor = FuzzyFactor::new(millis)?;
                }
                "event_buffer" => {
                    self.event_buffer = value
                        .parse()
                        .with_context(|| format!("Invalid {key}: {value}"))?;
                }
                "command_buffer" => {
                    self.command_buffer = value
                        .parse()
                        .with_context(|| format!("Invalid {key}: {value}"))?;
                }
                "jitter_seed" => {
                    self.jitter_seed = Some(
                        value
                            .parse()
                            .with_context(|| format!("Invalid {key}: {value}"))?,
                    );
                }
                "rewind_enabled" => {
                    self.restrictions.rewind_enabled = parse_bool(key, value)?;
                }
                "fast_forward_enabled" => {
                    self.restrictions.fast_forward_enabled = parse_bool(key, value)?;
                }
                other => tracing::warn!("Ignoring unknown configuration override: {other}"),
            }
        }
        self.validate()
    }
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            fuzzy_factor: FuzzyFactor::default(),
            event_buffer: Self::default_event_buffer(),
            command_buffer: Self::default_command_buffer(),
            jitter_seed: None,
            restrictions: RestrictionsConfig::default(),
        }
    }
}

/// Entitlement flags feeding the default contract restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionsConfig {
    #[serde(default = "default_true")]
    pub rewind_enabled: bool,
    #[serde(default = "default_true")]
    pub fast_forward_enabled: bool,
}

impl Default for RestrictionsConfig {
    fn default() -> Self {
        Self {
            rewind_enabled: true,
            fast_forward_enabled: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Invalid {key}: {value}")),
    }
}
