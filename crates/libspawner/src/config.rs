//! Environment-driven spawner configuration.
//!
//! Recognised variables:
//! - `SPAWNER_NATIVE`: `0`, `false`, `off` or `no` disables the native backend.
//! - `SPAWNER_GRACEFUL_EXIT_MS`: default grace period used by `destroy`.
//! - `FLATPAK_SANDBOX_DIR`: presence selects the Flatpak sandbox rewrite.

use std::time::Duration;

use log::warn;

use crate::sandbox::Sandbox;

pub const NATIVE_VAR: &str = "SPAWNER_NATIVE";
pub const GRACEFUL_EXIT_VAR: &str = "SPAWNER_GRACEFUL_EXIT_MS";

/// Grace period between the termination and kill signals of `destroy`.
pub const DEFAULT_GRACEFUL_EXIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerConfig {
    pub native: bool,
    pub graceful_exit: Duration,
    pub sandbox: Sandbox,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            native: true,
            graceful_exit: DEFAULT_GRACEFUL_EXIT,
            sandbox: Sandbox::Direct,
        }
    }
}

impl SpawnerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(NATIVE_VAR) {
            config.native = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }

        if let Some(value) = lookup(GRACEFUL_EXIT_VAR) {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.graceful_exit = Duration::from_millis(ms),
                Err(_) => warn!("ignoring {GRACEFUL_EXIT_VAR}={value:?}: not a millisecond count"),
            }
        }

        config.sandbox = Sandbox::detect_with(&lookup);
        config
    }

    pub fn with_native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn with_graceful_exit(mut self, graceful_exit: Duration) -> Self {
        self.graceful_exit = graceful_exit;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }
}
