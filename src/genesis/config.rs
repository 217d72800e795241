//! Runtime configuration.
//!
//! Genesis reads a small set of optional `GENESIS_*` environment variables;
//! everything has a sensible default so a bare process can join a domain with
//! no configuration at all. Launchers that fail configuration parsing should
//! exit with [`EXIT_CONFIG_ERROR`].

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::genesis::error::GenesisError;

/// Process exited cleanly.
pub const EXIT_OK: i32 = 0;
/// Unspecified failure.
pub const EXIT_FAILURE: i32 = 1;
/// Configuration could not be parsed.
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// The transport was unavailable at join time.
pub const EXIT_TRANSPORT_UNAVAILABLE: i32 = 3;
/// A provider-required environment variable (e.g. the LLM key) was missing.
pub const EXIT_PROVIDER_ENV_MISSING: i32 = 4;

/// How the orchestrator constrains the LLM's tool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoiceMode {
    /// The model decides whether to call a tool.
    Auto,
    /// The model must call some tool.
    Required,
    /// Tool calling is disabled for the turn.
    None,
}

impl Default for ToolChoiceMode {
    fn default() -> Self {
        ToolChoiceMode::Auto
    }
}

impl FromStr for ToolChoiceMode {
    type Err = GenesisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ToolChoiceMode::Auto),
            "required" => Ok(ToolChoiceMode::Required),
            "none" => Ok(ToolChoiceMode::None),
            other => Err(GenesisError::Configuration(format!(
                "GENESIS_TOOL_CHOICE must be one of auto|required|none, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ToolChoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolChoiceMode::Auto => write!(f, "auto"),
            ToolChoiceMode::Required => write!(f, "required"),
            ToolChoiceMode::None => write!(f, "none"),
        }
    }
}

/// Resolved runtime configuration for one participant.
///
/// Construct with [`GenesisConfig::from_env`] or fill the fields directly in
/// tests. No config-file parsing is involved.
#[derive(Debug, Clone)]
pub struct GenesisConfig {
    /// Logical discovery domain id (`GENESIS_DOMAIN`). Participants on
    /// different domains never discover each other.
    pub domain: u32,
    /// Tool-choice constraint passed to the LLM adapter
    /// (`GENESIS_TOOL_CHOICE`).
    pub tool_choice: ToolChoiceMode,
    /// Hop cap for the orchestrator tool loop (`GENESIS_MAX_TOOL_HOPS`).
    pub max_tool_hops: usize,
    /// Upper bound on the classifier's candidate set size.
    pub classifier_window: usize,
    /// How long a joining participant waits for its first durable
    /// advertisement acknowledgement.
    pub join_timeout: Duration,
    /// Cap on one orchestrator turn regardless of the caller's deadline.
    pub max_turn_time: Duration,
    /// How often a participant refreshes its own advertisements
    /// (re-stamping `last_seen`).
    pub liveliness_interval: Duration,
    /// Age past which cached peer advertisements are treated as lost and
    /// swept. Must exceed `liveliness_interval` by a comfortable margin.
    pub liveliness_timeout: Duration,
    /// Transitional monitoring-topic flag
    /// (`GENESIS_USE_NEW_MONITORING_TOPICS`). Both settings currently resolve
    /// to the unified GraphTopology/Event topics.
    pub use_new_monitoring_topics: bool,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            domain: 0,
            tool_choice: ToolChoiceMode::Auto,
            max_tool_hops: 8,
            classifier_window: 10,
            join_timeout: Duration::from_secs(10),
            max_turn_time: Duration::from_secs(120),
            liveliness_interval: Duration::from_secs(10),
            liveliness_timeout: Duration::from_secs(30),
            use_new_monitoring_topics: false,
        }
    }
}

impl GenesisConfig {
    /// Load configuration from the recognized `GENESIS_*` environment
    /// variables. Unset variables keep their defaults; malformed values are a
    /// [`GenesisError::Configuration`].
    pub fn from_env() -> Result<Self, GenesisError> {
        let mut config = Self::default();

        if let Ok(domain) = env::var("GENESIS_DOMAIN") {
            config.domain = domain.parse().map_err(|_| {
                GenesisError::Configuration(format!(
                    "GENESIS_DOMAIN must be an unsigned integer, got '{}'",
                    domain
                ))
            })?;
        }
        if let Ok(choice) = env::var("GENESIS_TOOL_CHOICE") {
            config.tool_choice = choice.parse()?;
        }
        if let Ok(hops) = env::var("GENESIS_MAX_TOOL_HOPS") {
            config.max_tool_hops = hops.parse().map_err(|_| {
                GenesisError::Configuration(format!(
                    "GENESIS_MAX_TOOL_HOPS must be an unsigned integer, got '{}'",
                    hops
                ))
            })?;
        }
        if let Ok(flag) = env::var("GENESIS_USE_NEW_MONITORING_TOPICS") {
            config.use_new_monitoring_topics = matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        Ok(config)
    }
}

/// Initialize `env_logger` honoring `GENESIS_LOG_LEVEL`.
///
/// Safe to call more than once; subsequent calls are no-ops. Defaults to
/// `info` when the variable is unset.
pub fn init_logging() {
    let env = env_logger::Env::default().filter_or("GENESIS_LOG_LEVEL", "info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = GenesisConfig::default();
        assert_eq!(config.domain, 0);
        assert_eq!(config.tool_choice, ToolChoiceMode::Auto);
        assert_eq!(config.max_tool_hops, 8);
        assert_eq!(config.classifier_window, 10);
    }

    #[test]
    fn tool_choice_parses() {
        assert_eq!(
            "required".parse::<ToolChoiceMode>().unwrap(),
            ToolChoiceMode::Required
        );
        assert!("sometimes".parse::<ToolChoiceMode>().is_err());
    }
}
