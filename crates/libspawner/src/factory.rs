//! Launch planning: picks a backend and strategy once per launch, then hands
//! a fully resolved request to a new [`Spawner`].

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::config::{NATIVE_VAR, SpawnerConfig};
use crate::errors::{SpawnError, SpawnResult};
use crate::process::{LaunchRequest, Spawner, Starter};
use crate::pty::{Pty, PtyMode};
use crate::sandbox::Sandbox;
use crate::sys::{self, ChildStdio};

/// Capability token proving the native create-process primitives may be used.
#[derive(Debug, Clone, Copy)]
pub struct Native {
    _private: (),
}

impl Native {
    /// Initialise native support for `config`, or explain why it is off.
    pub fn load(config: &SpawnerConfig) -> Option<Self> {
        if config.native {
            debug!("native spawner available");
            Some(Self { _private: () })
        } else {
            warn!("native spawner disabled by {NATIVE_VAR}; using std::process");
            None
        }
    }
}

/// How the child's stdio and session are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    Standard,
    Pty(PtyMode),
    Detached,
}

/// Which primitive creates the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPlan {
    pub strategy: LaunchStrategy,
    pub sandbox: Sandbox,
    pub backend: Backend,
}

/// Everything needed to start one child. Consumed by the launch.
#[derive(Debug, Default)]
pub struct LaunchSpec {
    argv: Vec<String>,
    env: Option<Vec<(String, String)>>,
    dir: Option<PathBuf>,
    pty: Option<Pty>,
    graceful_exit: Option<Duration>,
    detached: bool,
}

impl LaunchSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add a variable. Any explicit variable replaces the inherited
    /// environment as a whole.
    ///
    /// Inside a Flatpak sandbox the environment is given to the local
    /// `flatpak-spawn` and is not forwarded to the host command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Set the environment from `KEY=VALUE` entries. An empty list launches
    /// with an empty environment.
    pub fn envp<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let env = self.env.get_or_insert_with(Vec::new);
        for var in vars {
            let (key, value) = var.as_ref().split_once('=').unwrap_or((var.as_ref(), ""));
            env.push((key.to_string(), value.to_string()));
        }
        self
    }

    /// Working directory. Like `env`, it is not forwarded to the host
    /// command inside a Flatpak sandbox.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn pty(mut self, pty: Pty) -> Self {
        self.pty = Some(pty);
        self
    }

    /// Grace period `destroy` allows before killing. Native backend only.
    pub fn graceful_exit(mut self, grace: Duration) -> Self {
        self.graceful_exit = Some(grace);
        self
    }

    /// Start the child in its own session with the host's stdio.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// Splits a command line on whitespace. Quotes are not understood.
pub fn tokenize(command_line: &str) -> Vec<String> {
    command_line.split_whitespace().map(str::to_string).collect()
}

/// Entry point for launching children.
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    native: Option<Native>,
    config: SpawnerConfig,
}

impl ProcessFactory {
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            native: Native::load(&config),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(SpawnerConfig::from_env())
    }

    /// A factory restricted to `std::process`.
    pub fn standard(config: SpawnerConfig) -> Self {
        Self {
            native: None,
            config,
        }
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Decide how `spec` would be launched without launching it.
    pub fn plan(&self, spec: &LaunchSpec) -> SpawnResult<LaunchPlan> {
        let strategy = match (&spec.pty, spec.detached) {
            (Some(_), true) => {
                return Err(SpawnError::InvalidCommand(
                    "a detached launch cannot attach a pty".to_string(),
                ));
            }
            (Some(pty), false) => LaunchStrategy::Pty(pty.mode()),
            (None, true) => LaunchStrategy::Detached,
            (None, false) => LaunchStrategy::Standard,
        };

        let backend = match (self.native, strategy) {
            (Some(_), _) => Backend::Native,
            (None, LaunchStrategy::Pty(_)) => return Err(SpawnError::Unsupported("pseudo-terminal")),
            (None, LaunchStrategy::Detached) => return Err(SpawnError::Unsupported("detached launch")),
            (None, LaunchStrategy::Standard) if spec.graceful_exit.is_some() => {
                return Err(SpawnError::Unsupported("graceful exit time"));
            }
            (None, LaunchStrategy::Standard) => Backend::Std,
        };

        Ok(LaunchPlan {
            strategy,
            sandbox: self.config.sandbox,
            backend,
        })
    }

    pub fn launch(&self, spec: LaunchSpec) -> SpawnResult<Spawner> {
        if spec.argv.is_empty() {
            return Err(SpawnError::InvalidCommand("empty command".to_string()));
        }
        let plan = self.plan(&spec)?;
        let LaunchSpec {
            argv,
            env,
            dir,
            pty,
            graceful_exit,
            ..
        } = spec;

        for arg in &argv {
            CString::new(arg.as_str())?;
        }
        if plan.sandbox == Sandbox::Flatpak && (env.is_some() || dir.is_some()) {
            debug!("env and dir apply to flatpak-spawn, not to the host command {:?}", argv[0]);
        }
        let argv = plan.sandbox.rewrite(argv);
        let pty = pty.map(Arc::new);
        let starter = match plan.backend {
            Backend::Std => Starter::Std,
            Backend::Native => {
                let program = sys::find_program(&argv[0], env.as_deref())
                    .ok_or_else(|| SpawnError::launch(&argv[0], "No such file or directory"))?;
                let stdio = match (plan.strategy, &pty) {
                    (LaunchStrategy::Pty(mode), Some(pty)) => ChildStdio::Pty {
                        slave: pty.take_slave()?,
                        console: mode == PtyMode::Console,
                    },
                    (LaunchStrategy::Detached, _) => ChildStdio::Detached,
                    _ => ChildStdio::Pipes,
                };
                Starter::Native { program, stdio }
            }
        };
        debug!("launching {argv:?} with {plan:?}");

        Spawner::start(LaunchRequest {
            argv,
            env,
            dir,
            starter,
            pty,
            graceful_exit: graceful_exit.unwrap_or(self.config.graceful_exit),
        })
    }

    /// Launch a whitespace-separated command line.
    #[deprecated(note = "splits on whitespace without honouring quotes; use `exec_args`")]
    pub fn exec(&self, command_line: &str) -> SpawnResult<Spawner> {
        self.launch(LaunchSpec::new(tokenize(command_line)))
    }

    pub fn exec_args<I, S>(&self, argv: I) -> SpawnResult<Spawner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(LaunchSpec::new(argv))
    }

    pub fn exec_with<I, S>(&self, argv: I, envp: Option<&[&str]>, dir: Option<&Path>) -> SpawnResult<Spawner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(with_context(LaunchSpec::new(argv), envp, dir))
    }

    pub fn exec_pty<I, S>(
        &self,
        argv: I,
        envp: Option<&[&str]>,
        dir: Option<&Path>,
        pty: Pty,
    ) -> SpawnResult<Spawner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(with_context(LaunchSpec::new(argv), envp, dir).pty(pty))
    }

    pub fn exec_detached<I, S>(&self, argv: I, envp: Option<&[&str]>, dir: Option<&Path>) -> SpawnResult<Spawner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(with_context(LaunchSpec::new(argv), envp, dir).detached())
    }
}

impl Default for ProcessFactory {
    fn default() -> Self {
        Self::from_env()
    }
}

fn with_context(mut spec: LaunchSpec, envp: Option<&[&str]>, dir: Option<&Path>) -> LaunchSpec {
    if let Some(vars) = envp {
        spec = spec.envp(vars);
    }
    if let Some(dir) = dir {
        spec = spec.dir(dir);
    }
    spec
}
