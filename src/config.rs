// src/config.rs
//! Coordinator settings.
//!
//! Layered with the `config` crate, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. the TOML file named by `MSIG_CONFIG` (default `coordinator.toml`, optional)
//! 3. `MSIG__*` environment variables, `__` separating nested keys
//!    (`MSIG__POLLING__MAILBOX__MAX_ATTEMPTS=10`)
//!
//! `.env` is loaded into the environment first.

use crate::models::key_state::Threshold;
use crate::services::Policies;
use crate::utils::retry::{BackoffStrategy, RetryPolicy};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "coordinator.toml";

/// Which identity agent implementation backs the parties.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Http,
    /// In-process agents, for dry runs
    Local,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PartySettings {
    pub name: String,
    /// Name of the party's own member identifier
    pub member: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// A threshold as written in the settings file: `2` or `["1/2", "1/2", "1/2"]`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdSetting {
    Count(u64),
    Weighted(Vec<String>),
}

impl From<&ThresholdSetting> for Threshold {
    fn from(setting: &ThresholdSetting) -> Self {
        match setting {
            ThresholdSetting::Count(n) => Threshold::Count(*n),
            ThresholdSetting::Weighted(weights) => Threshold::Weighted(weights.clone()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GroupSettings {
    pub name: String,
    /// Defaults to every member signing
    pub isith: Option<ThresholdSetting>,
    pub nsith: Option<ThresholdSetting>,
    pub toad: u64,
    pub witnesses: Vec<String>,
    pub delegator: Option<String>,
    pub registry: String,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            name: "multisig".to_string(),
            isith: None,
            nsith: None,
            toad: 0,
            witnesses: Vec::new(),
            delegator: None,
            registry: "vLEI".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            strategy: settings.strategy,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PollingSettings {
    pub operation: RetrySettings,
    pub mailbox: RetrySettings,
    pub credential_attempts: u32,
    pub credential_interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            operation: RetrySettings {
                max_attempts: 20,
                ..RetrySettings::default()
            },
            mailbox: RetrySettings::default(),
            credential_attempts: 20,
            credential_interval_ms: 1_000,
        }
    }
}

impl PollingSettings {
    pub fn policies(&self) -> Policies {
        Policies {
            operation: RetryPolicy::from(&self.operation),
            mailbox: RetryPolicy::from(&self.mailbox),
            credential: RetryPolicy::fixed(
                self.credential_attempts,
                Duration::from_millis(self.credential_interval_ms),
            ),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub mode: AgentMode,
    /// Ordered members; the first one initiates every group action
    pub parties: Vec<PartySettings>,
    pub group: GroupSettings,
    pub polling: PollingSettings,
    /// Also rotate the group after the registry step
    pub rotate: bool,
}

impl Settings {
    /// Loads `.env`, then the settings file and `MSIG__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let path = std::env::var("MSIG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("MSIG").separator("__"));
        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// [`ConfigError::Message`] if no party is configured, a party name
    /// repeats, or an HTTP party has no URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parties.is_empty() {
            return Err(ConfigError::Message("at least one party must be configured".into()));
        }
        let mut names = HashSet::new();
        for party in &self.parties {
            if !names.insert(party.name.as_str()) {
                return Err(ConfigError::Message(format!("duplicate party {}", party.name)));
            }
            if self.mode == AgentMode::Http && party.url.is_none() {
                return Err(ConfigError::Message(format!("party {} has no agent url", party.name)));
            }
        }
        Ok(())
    }
}
