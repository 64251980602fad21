//! Child process handles and the reaper threads behind them.
//!
//! Each launch gets one reaper thread. It creates the child, posts the pid
//! to the handle's monitor, then blocks in wait-for-exit and posts the
//! status. Creating and reaping on the same thread keeps `waitpid`
//! semantics simple. All mutable handle state sits behind that one monitor.

use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::errors::{SpawnError, SpawnResult};
use crate::pty::Pty;
use crate::signal::{self, SpawnSignal};
use crate::stream::{SpawnerInputStream, SpawnerOutputStream};
use crate::sys::{self, Channels, ChildStdio, ExecImage};

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
    /// The status could not be collected.
    Unknown,
}

impl ExitStatus {
    /// Integer exit value: the exit code, `128 + signo` for a signal, or -1.
    pub fn value(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(sig) => 128 + sig as i32,
            ExitStatus::Unknown => -1,
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Exited(code);
        }
        status
            .signal()
            .and_then(|sig| Signal::try_from(sig).ok())
            .map_or(ExitStatus::Unknown, ExitStatus::Signaled)
    }
}

/// Which primitive the reaper uses to create the child.
#[derive(Debug)]
pub(crate) enum Starter {
    Native { program: PathBuf, stdio: ChildStdio },
    Std,
}

#[derive(Debug)]
pub(crate) struct LaunchRequest {
    pub argv: Vec<String>,
    pub env: Option<Vec<(String, String)>>,
    pub dir: Option<PathBuf>,
    pub starter: Starter,
    pub pty: Option<Arc<Pty>>,
    pub graceful_exit: Duration,
}

#[derive(Debug, Default)]
enum Launch {
    #[default]
    Pending,
    Started(Pid),
    Failed(String),
}

#[derive(Debug, Default)]
struct HandleState {
    launch: Launch,
    status: Option<ExitStatus>,
    /// Parent ends nobody has asked for yet.
    channels: Channels,
    stdin: Option<Arc<SpawnerOutputStream>>,
    stdout: Option<Arc<SpawnerInputStream>>,
    stderr: Option<Arc<SpawnerInputStream>>,
}

#[derive(Debug, Default)]
struct Monitor {
    state: Mutex<HandleState>,
    changed: Condvar,
}

impl Monitor {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_started(&self, pid: Pid, channels: Channels) {
        let mut state = self.lock();
        state.launch = Launch::Started(pid);
        state.channels = channels;
        self.changed.notify_all();
    }

    fn post_failed(&self, reason: String) {
        self.lock().launch = Launch::Failed(reason);
        self.changed.notify_all();
    }

    fn post_exit(&self, status: ExitStatus) {
        self.lock().status = Some(status);
        self.changed.notify_all();
    }

    fn await_launch(&self) -> Result<Pid, String> {
        let state = self
            .changed
            .wait_while(self.lock(), |s| matches!(s.launch, Launch::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        match &state.launch {
            Launch::Started(pid) => Ok(*pid),
            Launch::Failed(reason) => Err(reason.clone()),
            Launch::Pending => Err("reaper stopped before launching".to_string()),
        }
    }

    fn await_exit(&self) -> MutexGuard<'_, HandleState> {
        self.changed
            .wait_while(self.lock(), |s| s.status.is_none())
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn await_exit_for(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |s| s.status.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.status.is_some()
    }
}

/// Releases every waiter even if the reaper unwinds.
struct ReaperGuard(Arc<Monitor>);

impl Drop for ReaperGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        match state.launch {
            Launch::Pending => {
                state.launch = Launch::Failed("reaper stopped before launching".to_string());
            }
            Launch::Started(_) if state.status.is_none() => state.status = Some(ExitStatus::Unknown),
            _ => {}
        }
        self.0.changed.notify_all();
    }
}

/// Handle on one spawned child.
///
/// Streams are created on first request and cached; channels the caller never
/// asked for are closed by `wait_for`, `destroy`, or dropping the handle.
#[derive(Debug)]
pub struct Spawner {
    command: String,
    pid: Pid,
    monitor: Arc<Monitor>,
    pty: Option<Arc<Pty>>,
    graceful_exit: Duration,
}

impl Spawner {
    /// Launch on a fresh reaper thread and block until the child exists.
    pub(crate) fn start(request: LaunchRequest) -> SpawnResult<Self> {
        let LaunchRequest {
            argv,
            env,
            dir,
            starter,
            pty,
            graceful_exit,
        } = request;
        let command = argv
            .first()
            .cloned()
            .ok_or_else(|| SpawnError::InvalidCommand("empty command".to_string()))?;

        let monitor = Arc::new(Monitor::default());
        let guard = ReaperGuard(Arc::clone(&monitor));
        let name = Path::new(&command)
            .file_name()
            .map_or_else(|| command.clone(), |n| n.to_string_lossy().into_owned());

        thread::Builder::new()
            .name(format!("spawner-reaper-{name}"))
            .spawn(move || {
                let monitor = &guard.0;
                match starter {
                    Starter::Native { program, stdio } => {
                        reap_native(monitor, &program, &argv, env.as_deref(), dir.as_deref(), stdio)
                    }
                    Starter::Std => reap_std(monitor, &argv, env.as_deref(), dir.as_deref()),
                }
            })
            .map_err(|e| SpawnError::launch(&command, format!("reaper thread: {e}")))?;

        let pid = monitor
            .await_launch()
            .map_err(|reason| SpawnError::launch(&command, reason))?;
        debug!("launched {command} as pid {pid}");

        Ok(Self {
            command,
            pid,
            monitor,
            pty,
            graceful_exit,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Program name the child was launched with.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pty(&self) -> Option<&Pty> {
        self.pty.as_deref()
    }

    /// Writable stream feeding the child's stdin.
    pub fn stdin(&self) -> Arc<SpawnerOutputStream> {
        if let Some(pty) = &self.pty {
            return pty.output_stream();
        }
        let mut state = self.monitor.lock();
        let HandleState {
            channels, stdin, ..
        } = &mut *state;
        Arc::clone(stdin.get_or_insert_with(|| {
            Arc::new(SpawnerOutputStream::new(channels.stdin.take()))
        }))
    }

    /// Readable stream of the child's stdout.
    pub fn stdout(&self) -> Arc<SpawnerInputStream> {
        if let Some(pty) = &self.pty {
            return pty.input_stream();
        }
        let mut state = self.monitor.lock();
        let HandleState {
            channels, stdout, ..
        } = &mut *state;
        Arc::clone(stdout.get_or_insert_with(|| {
            Arc::new(SpawnerInputStream::new(channels.stdout.take()))
        }))
    }

    /// Readable stream of the child's stderr. Under a terminal-mode pty this
    /// is a null stream, as stderr shares the terminal.
    pub fn stderr(&self) -> Arc<SpawnerInputStream> {
        let mut state = self.monitor.lock();
        let HandleState {
            channels, stderr, ..
        } = &mut *state;
        Arc::clone(stderr.get_or_insert_with(|| {
            Arc::new(SpawnerInputStream::new(channels.stderr.take()))
        }))
    }

    pub fn is_done(&self) -> bool {
        self.monitor.lock().status.is_some()
    }

    /// Block until the child exits and return its exit value.
    pub fn wait_for(&self) -> i32 {
        let mut state = self.monitor.await_exit();
        state.channels.close_all();
        state.status.map_or(-1, ExitStatus::value)
    }

    /// Exit value of a child that has already exited.
    pub fn exit_value(&self) -> SpawnResult<i32> {
        self.exit_status()
            .map(ExitStatus::value)
            .ok_or(SpawnError::IllegalState("process has not exited"))
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.monitor.lock().status
    }

    /// Terminate the child, escalating to a kill after the grace period.
    pub fn destroy(&self) {
        if let Err(e) = self.terminate() {
            debug!("terminate {} (pid {}): {e}", self.command, self.pid);
        }
        self.monitor.lock().channels.close_all();
        if self.monitor.await_exit_for(self.graceful_exit) {
            return;
        }
        debug!(
            "{} (pid {}) survived {:?}; killing",
            self.command, self.pid, self.graceful_exit
        );
        if let Err(e) = self.kill() {
            warn!("kill {} (pid {}): {e}", self.command, self.pid);
        }
    }

    /// Deliver `sig` unless the child has already been reaped.
    pub fn raise(&self, sig: SpawnSignal) -> SpawnResult<()> {
        if self.is_done() {
            debug!("pid {} already reaped; dropping {sig:?}", self.pid);
            return Ok(());
        }
        match signal::raise(self.pid, sig) {
            // Exited between the check and the signal.
            Err(SpawnError::Signal {
                source: Errno::ESRCH,
                ..
            }) => Ok(()),
            other => other,
        }
    }

    pub fn interrupt(&self) -> SpawnResult<()> {
        self.raise(SpawnSignal::Interrupt)
    }

    pub fn interrupt_ctrl_c(&self) -> SpawnResult<()> {
        self.raise(SpawnSignal::CtrlC)
    }

    pub fn hangup(&self) -> SpawnResult<()> {
        self.raise(SpawnSignal::Hangup)
    }

    pub fn kill(&self) -> SpawnResult<()> {
        self.raise(SpawnSignal::Kill)
    }

    pub fn terminate(&self) -> SpawnResult<()> {
        self.raise(SpawnSignal::Terminate)
    }

    pub fn is_running(&self) -> bool {
        !self.is_done() && signal::is_alive(self.pid)
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        self.monitor.lock().channels.close_all();
    }
}

fn reap_native(
    monitor: &Monitor,
    program: &Path,
    argv: &[String],
    env: Option<&[(String, String)]>,
    dir: Option<&Path>,
    stdio: ChildStdio,
) {
    let image = match ExecImage::new(program, argv, env, dir) {
        Ok(image) => image,
        Err(e) => return monitor.post_failed(e.to_string()),
    };
    match sys::spawn(&image, stdio) {
        Err(reason) => monitor.post_failed(reason),
        Ok((pid, channels)) => {
            monitor.post_started(pid, channels);
            let status = sys::wait_for_exit(pid);
            debug!("reaped pid {pid}: {status:?}");
            monitor.post_exit(status);
        }
    }
}

fn reap_std(
    monitor: &Monitor,
    argv: &[String],
    env: Option<&[(String, String)]>,
    dir: Option<&Path>,
) {
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(vars) = env {
        command.env_clear().envs(vars.iter().map(|(k, v)| (k, v)));
    }
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = e
                .raw_os_error()
                .map_or_else(|| e.to_string(), |code| Errno::from_raw(code).desc().to_string());
            return monitor.post_failed(reason);
        }
    };
    let channels = Channels {
        stdin: child.stdin.take().map(OwnedFd::from),
        stdout: child.stdout.take().map(OwnedFd::from),
        stderr: child.stderr.take().map(OwnedFd::from),
    };
    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return monitor.post_failed(format!("pid {} out of range", child.id()));
    };
    let pid = Pid::from_raw(raw);
    monitor.post_started(pid, channels);

    let status = match child.wait() {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            warn!("wait on pid {pid} failed: {e}");
            ExitStatus::Unknown
        }
    };
    debug!("reaped pid {pid}: {status:?}");
    monitor.post_exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_values_follow_shell_convention() {
        assert_eq!(ExitStatus::Exited(3).value(), 3);
        assert_eq!(ExitStatus::Signaled(Signal::SIGTERM).value(), 143);
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).value(), 137);
        assert_eq!(ExitStatus::Unknown.value(), -1);
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Signaled(Signal::SIGINT).code(), None);
    }

    #[test]
    fn guard_releases_waiters_when_reaper_dies() {
        let monitor = Arc::new(Monitor::default());
        drop(ReaperGuard(Arc::clone(&monitor)));
        assert!(monitor.await_launch().is_err());

        let monitor = Arc::new(Monitor::default());
        monitor.post_started(Pid::this(), Channels::default());
        drop(ReaperGuard(Arc::clone(&monitor)));
        assert_eq!(monitor.await_exit().status, Some(ExitStatus::Unknown));
    }

    #[test]
    fn empty_request_is_rejected() {
        let request = LaunchRequest {
            argv: Vec::new(),
            env: None,
            dir: None,
            starter: Starter::Std,
            pty: None,
            graceful_exit: Duration::from_millis(10),
        };
        assert!(matches!(Spawner::start(request), Err(SpawnError::InvalidCommand(_))));
    }
}
