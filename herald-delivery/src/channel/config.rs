use std::time::Duration;

use serde::Deserialize;

use super::step::{StepDescriptor, standard_plan};
use crate::{recovery::RecoveryConfig, types::ChannelName};

const fn default_enabled() -> bool {
    true
}

/// Settings handed to the transport on every step
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelSettings {
    /// Where the transport delivers to, e.g. a base URL
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Account to deliver from when the transport supports several
    #[serde(default)]
    pub account: Option<String>,

    /// Upper bound on a single step; a step that runs longer fails as a
    /// transient timeout
    ///
    /// Default: None (bounded only by the dispatcher's attempt timeout)
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

impl ChannelSettings {
    #[must_use]
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration for one channel
///
/// ```ron
/// (
///     name: "CloudMail",
///     fallback: Some("LocalMailApp"),
///     recovery: (max_retries: 3),
///     settings: (endpoint: Some("https://mail.example.com")),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: ChannelName,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Channel to hand the message to once this one gives up
    #[serde(default)]
    pub fallback: Option<ChannelName>,

    #[serde(default = "standard_plan")]
    pub steps: Vec<StepDescriptor>,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Name of a custom recovery policy registered with the registry builder,
    /// used instead of the standard policy built from `recovery`
    #[serde(default)]
    pub policy: Option<String>,

    #[serde(default)]
    pub settings: ChannelSettings,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(name: impl Into<ChannelName>) -> Self {
        Self {
            name: name.into(),
            enabled: default_enabled(),
            fallback: None,
            steps: standard_plan(),
            recovery: RecoveryConfig::default(),
            policy: None,
            settings: ChannelSettings::default(),
        }
    }

    #[must_use]
    pub fn fallback(mut self, name: impl Into<ChannelName>) -> Self {
        self.fallback = Some(name.into());
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: Vec<StepDescriptor>) -> Self {
        self.steps = steps;
        self
    }

    #[must_use]
    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub fn policy(mut self, name: impl Into<String>) -> Self {
        self.policy = Some(name.into());
        self
    }

    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: ChannelSettings) -> Self {
        self.settings = settings;
        self
    }
}
