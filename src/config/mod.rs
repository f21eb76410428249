//! # Configuration
//!
//! A `category → name → value` settings tree fed from two sources: a
//! HOCON-like config file and command-line options. CLI values override file
//! values. The runtime consumes the `scheduler.*` keys; everything else
//! passes through to the application.

use std::path::Path;

use anyhow::Context;

use crate::error::{Error, ErrorCode, Result};
use crate::scheduler::{SchedulerConfig, SchedulerPolicy};

mod cli;
mod parser;
mod value;

pub use cli::{CliArgs, OptionSet};
pub use parser::parse_settings;
pub use value::{ConfigValue, Settings};

/// Runtime configuration of an actor system.
#[derive(Debug, Clone, Default)]
pub struct ActorSystemConfig {
    pub scheduler: SchedulerConfig,
}

impl ActorSystemConfig {
    /// Reads the recognized core options out of a settings tree. Unknown
    /// keys are left alone for the application.
    ///
    /// | Key | Effect |
    /// |-----|--------|
    /// | `scheduler.policy` | `"sharing"` or `"stealing"` |
    /// | `scheduler.max-threads` | worker count |
    /// | `scheduler.max-throughput` | messages per resume |
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = settings.get("scheduler.policy") {
            let name = value.as_str().ok_or_else(|| {
                Error::with_message(ErrorCode::InvalidArgument, "scheduler.policy must be a string")
            })?;
            config.scheduler.policy = match name {
                "sharing" => SchedulerPolicy::Sharing,
                "stealing" => SchedulerPolicy::Stealing,
                other => {
                    return Err(Error::with_message(
                        ErrorCode::InvalidArgument,
                        format!("unknown scheduler policy '{other}'"),
                    ))
                }
            };
        }
        if let Some(value) = settings.get("scheduler.max-threads") {
            config.scheduler.max_threads = positive_usize(value, "scheduler.max-threads")?;
        }
        if let Some(value) = settings.get("scheduler.max-throughput") {
            config.scheduler.max_throughput = positive_usize(value, "scheduler.max-throughput")?;
        }
        Ok(config)
    }
}

fn positive_usize(value: &ConfigValue, key: &str) -> Result<usize> {
    let n = value.as_integer().ok_or_else(|| {
        Error::with_message(ErrorCode::InvalidArgument, format!("{key} must be an integer"))
    })?;
    if n <= 0 {
        return Err(Error::with_message(
            ErrorCode::OutOfRange,
            format!("{key} must be positive"),
        ));
    }
    Ok(n as usize)
}

/// Loads and parses a config file.
pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let settings = parse_settings(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_options_are_applied() {
        let settings = parse_settings(
            "scheduler {\n  policy = \"stealing\"\n  max-threads = 8\n  max-throughput = 20\n}\n",
        )
        .unwrap();
        let config = ActorSystemConfig::from_settings(&settings).unwrap();
        assert_eq!(config.scheduler.policy, SchedulerPolicy::Stealing);
        assert_eq!(config.scheduler.max_threads, 8);
        assert_eq!(config.scheduler.max_throughput, 20);
    }

    #[test]
    fn defaults_survive_an_empty_tree() {
        let config = ActorSystemConfig::from_settings(&Settings::new()).unwrap();
        assert_eq!(config.scheduler.policy, SchedulerPolicy::Sharing);
        assert_eq!(config.scheduler.max_throughput, 5);
    }

    #[test]
    fn bad_policy_names_are_rejected() {
        let settings = parse_settings("scheduler.policy = \"magic\"").unwrap();
        let err = ActorSystemConfig::from_settings(&settings).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn non_positive_thread_counts_are_rejected() {
        let settings = parse_settings("scheduler.max-threads = 0").unwrap();
        let err = ActorSystemConfig::from_settings(&settings).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfRange);
    }
}
