//! Process-wide log level, adjustable at runtime.

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

const TARGET: &str = "catalogued";

struct Current {
    handle: reload::Handle<EnvFilter, Registry>,
    level: String,
}

/// Owns the reload handle of the global filter.
///
/// When `RUST_LOG` is set at startup the filter it describes is pinned and configured levels are
/// ignored.
pub struct LogLevelSwitch {
    current: Mutex<Current>,
    pinned: bool,
}

impl LogLevelSwitch {
    /// Install the global subscriber. Call once, before anything logs.
    pub fn init() -> Result<Self> {
        let (filter, pinned) = match EnvFilter::try_from_default_env() {
            Ok(filter) => (filter, true),
            Err(_) => (directive("info")?, false),
        };
        let (filter, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .context("Failed to install tracing subscriber")?;

        Ok(Self::from_handle(handle, pinned))
    }

    fn from_handle(handle: reload::Handle<EnvFilter, Registry>, pinned: bool) -> Self {
        Self {
            current: Mutex::new(Current {
                handle,
                level: "info".to_string(),
            }),
            pinned,
        }
    }

    pub fn level(&self) -> String {
        self.current
            .lock()
            .map(|c| c.level.clone())
            .unwrap_or_default()
    }

    /// Switch the crate's log level. A no-op when the filter is pinned by the environment.
    pub fn set_level(&self, level: &str) -> Result<()> {
        if self.pinned {
            tracing::debug!(level, "RUST_LOG is set, ignoring configured log level");
            return Ok(());
        }
        let filter = directive(level)?;

        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow!("log level switch poisoned"))?;
        current
            .handle
            .reload(filter)
            .context("Failed to reload log filter")?;
        if current.level != level {
            tracing::info!(from = %current.level, to = level, "Log level changed");
            current.level = level.to_string();
        }
        Ok(())
    }
}

fn directive(level: &str) -> Result<EnvFilter> {
    tracing::Level::from_str(level).map_err(|_| anyhow!("Invalid log level '{level}'"))?;
    EnvFilter::try_new(format!("{TARGET}={level}"))
        .with_context(|| format!("Invalid log level '{level}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(pinned: bool) -> (LogLevelSwitch, impl tracing::Subscriber) {
        let (filter, handle) = reload::Layer::new(directive("info").unwrap());
        let subscriber = tracing_subscriber::registry().with(filter);
        (LogLevelSwitch::from_handle(handle, pinned), subscriber)
    }

    #[test]
    fn test_set_level_updates_filter() {
        let (switch, _subscriber) = detached(false);
        assert_eq!(switch.level(), "info");

        switch.set_level("debug").unwrap();
        assert_eq!(switch.level(), "debug");
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let (switch, _subscriber) = detached(false);
        assert!(switch.set_level("chatty").is_err());
        assert_eq!(switch.level(), "info");
    }

    #[test]
    fn test_pinned_filter_ignores_config() {
        let (switch, _subscriber) = detached(true);
        switch.set_level("trace").unwrap();
        assert_eq!(switch.level(), "info");
    }
}
