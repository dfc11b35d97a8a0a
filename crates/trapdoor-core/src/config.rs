//! # Engine Configuration
//!
//! Tunables for an [`Engine`](crate::engine::Engine), and the options for
//! programs it launches.
//!
//! ## Environment Variables
//!
//! [`EngineConfig::from_env`] starts from the defaults and applies:
//!
//! - `TRAPDOOR_WAIT_POLL_US`: poll interval for timed waits, in microseconds
//! - `TRAPDOOR_KILL_ON_DROP`: `true`/`false`, kill launched tracees when the
//!   engine is dropped
//! - `TRAPDOOR_FOLLOW_THREADS`: `true`/`false`, trace threads the tracee
//!   creates after attach
//!
//! Unparseable values are reported with `warn!` and ignored.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use trapdoor_core::config::EngineConfig;
//!
//! let config = EngineConfig::default()
//!     .with_wait_poll_interval(Duration::from_micros(250))
//!     .with_kill_on_drop(false);
//! assert!(config.follow_threads);
//! ```

use std::env;
use std::time::Duration;

use tracing::warn;

/// Poll interval env var
pub const ENV_WAIT_POLL_US: &str = "TRAPDOOR_WAIT_POLL_US";
/// Kill-on-drop env var
pub const ENV_KILL_ON_DROP: &str = "TRAPDOOR_KILL_ON_DROP";
/// Thread-following env var
pub const ENV_FOLLOW_THREADS: &str = "TRAPDOOR_FOLLOW_THREADS";

/// Engine tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig
{
    /// How long a timed wait sleeps between non-blocking polls
    pub wait_poll_interval: Duration,
    /// Kill launched tracees (rather than detach) when the engine is dropped
    pub kill_on_drop: bool,
    /// Trace threads created after attach (`PTRACE_O_TRACECLONE`)
    pub follow_threads: bool,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            wait_poll_interval: Duration::from_millis(1),
            kill_on_drop: true,
            follow_threads: true,
        }
    }
}

impl EngineConfig
{
    /// Defaults overridden by the `TRAPDOOR_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_WAIT_POLL_US) {
            match raw.trim().parse::<u64>() {
                Ok(micros) if micros > 0 => config.wait_poll_interval = Duration::from_micros(micros),
                _ => warn!(variable = ENV_WAIT_POLL_US, value = %raw, "Ignoring invalid poll interval"),
            }
        }
        if let Some(raw) = lookup(ENV_KILL_ON_DROP) {
            match parse_flag(&raw) {
                Some(flag) => config.kill_on_drop = flag,
                None => warn!(variable = ENV_KILL_ON_DROP, value = %raw, "Ignoring invalid flag"),
            }
        }
        if let Some(raw) = lookup(ENV_FOLLOW_THREADS) {
            match parse_flag(&raw) {
                Some(flag) => config.follow_threads = flag,
                None => warn!(variable = ENV_FOLLOW_THREADS, value = %raw, "Ignoring invalid flag"),
            }
        }

        config
    }

    /// Set the poll interval (clamped to at least one microsecond).
    #[must_use]
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self
    {
        self.wait_poll_interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Set whether launched tracees are killed on drop.
    #[must_use]
    pub const fn with_kill_on_drop(mut self, kill: bool) -> Self
    {
        self.kill_on_drop = kill;
        self
    }

    /// Set whether new threads are traced.
    #[must_use]
    pub const fn with_follow_threads(mut self, follow: bool) -> Self
    {
        self.follow_threads = follow;
        self
    }
}

/// How [`Engine::launch_with`](crate::engine::Engine::launch_with) starts a program
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::config::LaunchOptions;
///
/// let options = LaunchOptions::default()
///     .with_disable_aslr(true)
///     .with_env_var("LANG", "C");
/// assert_eq!(options.env.as_deref(), Some(&[("LANG".to_string(), "C".to_string())][..]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions
{
    /// Load the program at fixed addresses (`ADDR_NO_RANDOMIZE`)
    pub disable_aslr: bool,
    /// Environment of the new process; `None` inherits the tracer's
    pub env: Option<Vec<(String, String)>>,
}

impl LaunchOptions
{
    /// Set whether address space randomization is turned off.
    #[must_use]
    pub fn with_disable_aslr(mut self, disable: bool) -> Self
    {
        self.disable_aslr = disable;
        self
    }

    /// Replace the whole environment.
    #[must_use]
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(key, value)| (key.into(), value.into())).collect());
        self
    }

    /// Add one variable, starting from an empty environment if none was set.
    #[must_use]
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self
    {
        self.env.get_or_insert_with(Vec::new).push((key.into(), value.into()));
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool>
{
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults()
    {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.wait_poll_interval, Duration::from_millis(1));
        assert!(config.kill_on_drop);
    }

    #[test]
    fn test_env_overrides()
    {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_WAIT_POLL_US, "250"),
            (ENV_KILL_ON_DROP, "off"),
            (ENV_FOLLOW_THREADS, "0"),
        ]));
        assert_eq!(config.wait_poll_interval, Duration::from_micros(250));
        assert!(!config.kill_on_drop);
        assert!(!config.follow_threads);
    }

    #[test]
    fn test_launch_options_builders()
    {
        let options = LaunchOptions::default();
        assert!(!options.disable_aslr);
        assert_eq!(options.env, None);

        let options = LaunchOptions::default()
            .with_env([("A", "1")])
            .with_env_var("B", "2")
            .with_disable_aslr(true);
        assert!(options.disable_aslr);
        assert_eq!(
            options.env,
            Some(vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())])
        );
    }

    #[test]
    fn test_invalid_values_are_ignored()
    {
        let config = EngineConfig::from_lookup(lookup(&[(ENV_WAIT_POLL_US, "soon"), (ENV_KILL_ON_DROP, "maybe")]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(
            EngineConfig::default().with_wait_poll_interval(Duration::ZERO).wait_poll_interval,
            Duration::from_micros(1)
        );
    }
}
