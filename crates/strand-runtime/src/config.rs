#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! [`RuntimeConfig`] can be built three ways:
//!
//! ```rust,ignore
//! let config = RuntimeConfig::default();
//! let config = RuntimeConfig::from_env()?;
//! let config = RuntimeConfig::from_toml_str(doc)?; // `policy-config` feature
//! ```
//!
//! # Environment
//!
//! | variable                  | field              |
//! |---------------------------|--------------------|
//! | `STRAND_STRICT_PAUSE`     | `strict_pause`     |
//! | `STRAND_MAX_FLUSH_ROUNDS` | `max_flush_rounds` |
//! | `STRAND_TEXT_PATCH`       | `text_patch`       |
//!
//! Boolean variables accept `1/true/yes/on` and `0/false/no/off`.

#[cfg(feature = "policy-config")]
use serde::{Deserialize, Serialize};

/// Default upper bound on flush rounds per outermost unpause.
pub const DEFAULT_MAX_FLUSH_ROUNDS: u32 = 64;

/// Name of the root view rendered by a page.
pub const DEFAULT_PAGE_VIEW: &str = "Page";

/// Tunables for a [`Page`](crate::page::Page) and its batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "policy-config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "policy-config", serde(default))]
pub struct RuntimeConfig {
    /// Panic on unpause without a matching pause. Off: log and ignore.
    pub strict_pause: bool,

    /// Rounds a single flush may run before the remaining queue is dropped.
    /// Bounds update cycles where a binding keeps mutating the store.
    pub max_flush_rounds: u32,

    /// Patch text controls in place for string insert/remove provenance.
    pub text_patch: bool,

    /// View rendered by `render`/`attach`.
    pub page_view: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strict_pause: cfg!(debug_assertions),
            max_flush_rounds: DEFAULT_MAX_FLUSH_ROUNDS,
            text_patch: true,
            page_view: DEFAULT_PAGE_VIEW.to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("STRAND_STRICT_PAUSE") {
            config.strict_pause = parse_flag("STRAND_STRICT_PAUSE", &raw)?;
        }
        if let Some(raw) = lookup("STRAND_MAX_FLUSH_ROUNDS") {
            config.max_flush_rounds = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: "STRAND_MAX_FLUSH_ROUNDS",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup("STRAND_TEXT_PATCH") {
            config.text_patch = parse_flag("STRAND_TEXT_PATCH", &raw)?;
        }
        config.validated()
    }

    /// Load from a TOML string. Missing keys take their defaults.
    #[cfg(feature = "policy-config")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(ConfigError::Toml)?;
        config.validated()
    }

    /// Load from a JSON string. Missing keys take their defaults.
    #[cfg(feature = "policy-config")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(ConfigError::Json)?;
        config.validated()
    }

    /// Check parameter ranges. An empty list means the config is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_flush_rounds == 0 {
            errors.push("max_flush_rounds must be at least 1".to_owned());
        }
        if self.page_view.trim().is_empty() {
            errors.push("page_view must not be empty".to_owned());
        }
        errors
    }

    /// `self` if [`validate`](Self::validate) reports nothing.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: raw.to_owned(),
        }),
    }
}

/// Errors that can occur when building a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[cfg(feature = "policy-config")]
    #[error("TOML parse error: {0}")]
    Toml(#[source] toml::de::Error),

    #[cfg(feature = "policy-config")]
    #[error("JSON parse error: {0}")]
    Json(#[source] serde_json::Error),

    #[error("validation errors: {}", .0.join("; "))]
    Validation(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.strict_pause, cfg!(debug_assertions));
        assert_eq!(config.max_flush_rounds, 64);
        assert!(config.text_patch);
        assert_eq!(config.page_view, "Page");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn env_overrides() {
        let config = RuntimeConfig::from_env_with(env(&[
            ("STRAND_STRICT_PAUSE", "off"),
            ("STRAND_MAX_FLUSH_ROUNDS", " 8 "),
            ("STRAND_TEXT_PATCH", "0"),
        ]))
        .expect("valid env");
        assert!(!config.strict_pause);
        assert_eq!(config.max_flush_rounds, 8);
        assert!(!config.text_patch);
    }

    #[test]
    fn env_absent_keeps_defaults() {
        let config = RuntimeConfig::from_env_with(|_| None).expect("defaults are valid");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn env_rejects_garbage() {
        let err = RuntimeConfig::from_env_with(env(&[("STRAND_TEXT_PATCH", "maybe")]))
            .expect_err("not a flag");
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: "STRAND_TEXT_PATCH",
                ..
            }
        ));
    }

    #[test]
    fn zero_rounds_fails_validation() {
        let err = RuntimeConfig::from_env_with(env(&[("STRAND_MAX_FLUSH_ROUNDS", "0")]))
            .expect_err("zero rounds");
        assert_eq!(
            err.to_string(),
            "validation errors: max_flush_rounds must be at least 1"
        );
    }

    #[cfg(feature = "policy-config")]
    #[test]
    fn toml_partial_document() {
        let config = RuntimeConfig::from_toml_str("text_patch = false\nmax_flush_rounds = 3\n")
            .expect("valid toml");
        assert!(!config.text_patch);
        assert_eq!(config.max_flush_rounds, 3);
        assert_eq!(config.page_view, "Page");
    }

    #[cfg(feature = "policy-config")]
    #[test]
    fn json_rejects_empty_view() {
        let err = RuntimeConfig::from_json_str(r#"{"page_view": " "}"#).expect_err("empty view");
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
