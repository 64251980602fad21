//! Core library for launching child processes with optional pseudo-terminals.
//! Provides modules reused by the CLI front end.

#[cfg(not(unix))]
compile_error!("libspawner supports Unix hosts only");

pub mod config;
pub mod errors;
pub mod factory;
pub mod process;
pub mod pty;
pub mod sandbox;
pub mod signal;
pub mod stream;
mod sys;

pub use config::SpawnerConfig;
pub use errors::{SpawnError, SpawnResult};
pub use factory::{LaunchPlan, LaunchSpec, LaunchStrategy, ProcessFactory};
pub use process::{ExitStatus, Spawner};
pub use pty::{Pty, PtyMode};
pub use sandbox::Sandbox;
pub use signal::SpawnSignal;
pub use stream::{SpawnerInputStream, SpawnerOutputStream};

/// Exposes the crate version for CLI reporting.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
