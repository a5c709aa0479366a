//! Engine configuration, usually read from YAML.

use std::str::FromStr;
use std::time::Duration;

use displaydoc::Display;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
mod tests;

pub(crate) const DEFAULT_BUFFER_POOL_MAX_SIZE: usize = 1024;
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
}

/// The configuration of the fetch engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Fetch execution
    pub fetch: FetchConfig,
    /// Subscription multiplexing
    pub subscription: SubscriptionConfig,
}

/// Fetch execution configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct FetchConfig {
    /// Share one upstream call between concurrent identical fetches
    /// (default: true)
    pub single_flight: bool,
    /// Maximum number of response buffers alive at the same time
    pub buffer_pool_max_size: usize,
    /// How long to wait for a response buffer before failing the fetch.
    /// Waits forever when not set.
    #[serde(with = "humantime_serde", default)]
    #[schemars(with = "Option<String>", default)]
    pub buffer_pool_wait_timeout: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            single_flight: true,
            buffer_pool_max_size: DEFAULT_BUFFER_POOL_MAX_SIZE,
            buffer_pool_wait_timeout: None,
        }
    }
}

/// Subscriptions configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SubscriptionConfig {
    /// Share one upstream stream between subscriptions targeting the same upstream
    /// (default: true)
    pub enable_deduplication: bool,
    /// Capacity of the in memory queue of each stream. A subscriber lagging
    /// further behind loses its oldest events.
    pub queue_capacity: usize,
    /// What to do with a stream once its last subscriber left
    pub idle_stream: IdleStreamPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_stream: IdleStreamPolicy::default(),
        }
    }
}

/// Lifecycle of streams without subscribers
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdleStreamPolicy {
    /// Keep the upstream open until the process exits
    #[default]
    Keep,
    /// Close the upstream and forget the stream when the last subscriber leaves
    Evict,
}

impl Configuration {
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.fetch.buffer_pool_max_size == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "bad configuration for fetch",
                error: "buffer_pool_max_size must be greater than 0".to_string(),
            });
        }
        if self.subscription.queue_capacity == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "bad configuration for subscription",
                error: "queue_capacity must be greater than 0".to_string(),
            });
        }
        Ok(self)
    }

    /// JSON schema of the YAML configuration.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Configuration))
            .expect("a JSON schema always serializes; qed")
    }
}

/// Parse configuration from a string in YAML syntax
impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration =
            serde_yaml::from_str(s).map_err(ConfigurationError::DeserializeConfigError)?;
        configuration.validate()
    }
}
