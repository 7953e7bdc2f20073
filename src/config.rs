//! Configuration
//!
//! The config is usually loaded from a TOML file with [`Config::load`]. Every section and field
//! is optional and falls back to the defaults documented on the field. Durations are written as
//! human readable strings, e.g. `"500ms"` or `"1h"`.
//!
//! ```toml
//! [loader]
//! max_batch_size = 50
//!
//! [channel]
//! max_retained = 500
//! max_age = "30m"
//!
//! [rpc]
//! default_update_mode = "patch"
//! mutation_timeout = "10s"
//!
//! [stream]
//! persist_debounce = "250ms"
//! ```

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub use crate::loader::LoaderOptions;
use crate::rpc::UpdateMode;

/// Full configuration of the crate's components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Options for batch loaders created by the rpc router.
    pub loader: LoaderOptions,
    /// Event channel retention and fan out.
    pub channel: ChannelConfig,
    /// Rpc client and router behavior.
    pub rpc: RpcConfig,
    /// Streaming orchestrator behavior.
    pub stream: StreamConfig,
}

/// Event channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum number of events retained in memory per channel.
    ///
    /// Defaults to 1000.
    pub max_retained: usize,
    /// Events older than this are dropped by cleanup.
    ///
    /// Defaults to one hour.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Interval of the background cleanup task.
    ///
    /// Defaults to 60 seconds.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Number of live events buffered per subscriber before it lags.
    ///
    /// Defaults to 1024.
    pub subscriber_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            max_age: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(60),
            subscriber_capacity: 1024,
        }
    }
}

/// Rpc configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Update mode used for subscriptions that do not request one.
    ///
    /// Defaults to [`UpdateMode::Auto`].
    pub default_update_mode: UpdateMode,
    /// Time after which a pending mutation fails and its optimistic update is reverted.
    ///
    /// Defaults to 30 seconds.
    #[serde(with = "humantime_serde")]
    pub mutation_timeout: Duration,
    /// Whether the router strips fields outside the requested selection from results.
    ///
    /// Defaults to true.
    pub prune_selection: bool,
    /// Maximum number of changed leaves for which [`UpdateMode::Auto`] still picks a patch.
    ///
    /// Defaults to 8.
    pub auto_patch_max_changes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_update_mode: UpdateMode::Auto,
            mutation_timeout: Duration::from_secs(30),
            prune_selection: true,
            auto_patch_max_changes: 8,
        }
    }
}

/// Streaming orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum interval between two debounced persists of one session.
    ///
    /// Defaults to 500 milliseconds.
    #[serde(with = "humantime_serde")]
    pub persist_debounce: Duration,
    /// Number of retained events replayed by [`crate::stream::Orchestrator::attach`].
    ///
    /// Defaults to 0, which attaches to live events only.
    pub history_on_attach: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_millis(500),
            history_on_attach: 0,
        }
    }
}

/// Config errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Failed to read {path}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse {path}"))]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl Config {
    /// Loads the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&s).context(ParseSnafu {
            path: path.display().to_string(),
        })
    }

    /// Parses the config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_is_default() -> Result {
        let config = Config::from_toml("").e()?;
        assert_eq!(config, Config::default());
        assert_eq!(config.loader.max_batch_size, 100);
        assert_eq!(config.channel.max_age, Duration::from_secs(3600));
        Ok(())
    }

    #[test]
    fn partial_sections_keep_defaults() -> Result {
        let config = Config::from_toml(
            r#"
            [channel]
            max_retained = 10
            max_age = "30m"

            [rpc]
            default_update_mode = "patch"
            mutation_timeout = "2s"

            [stream]
            persist_debounce = "250ms"
            "#,
        )
        .e()?;
        assert_eq!(config.channel.max_retained, 10);
        assert_eq!(config.channel.max_age, Duration::from_secs(30 * 60));
        assert_eq!(config.channel.subscriber_capacity, 1024);
        assert_eq!(config.rpc.default_update_mode, UpdateMode::Patch);
        assert_eq!(config.rpc.mutation_timeout, Duration::from_secs(2));
        assert!(config.rpc.prune_selection);
        assert_eq!(config.stream.persist_debounce, Duration::from_millis(250));
        assert!(config.loader.cache);
        Ok(())
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/syncwire.toml").await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
