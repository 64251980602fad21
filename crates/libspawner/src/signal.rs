//! Signal delivery to spawned children.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::errors::{SpawnError, SpawnResult};

/// Signals a spawned child can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnSignal {
    /// The null signal: checks that the process exists without touching it.
    Noop,
    Hangup,
    Interrupt,
    /// Console-style interrupt, delivered to the child's whole process group.
    CtrlC,
    Kill,
    Terminate,
}

impl SpawnSignal {
    /// POSIX signal backing this request; `None` for the null signal.
    pub fn as_signal(self) -> Option<Signal> {
        match self {
            SpawnSignal::Noop => None,
            SpawnSignal::Hangup => Some(Signal::SIGHUP),
            SpawnSignal::Interrupt | SpawnSignal::CtrlC => Some(Signal::SIGINT),
            SpawnSignal::Kill => Some(Signal::SIGKILL),
            SpawnSignal::Terminate => Some(Signal::SIGTERM),
        }
    }

    fn targets_group(self) -> bool {
        matches!(self, SpawnSignal::CtrlC)
    }
}

/// Raise `sig` on `pid`.
///
/// Every launch mode makes the child a process-group leader, so a Ctrl-C
/// reaches the group whose id equals the child's pid.
pub fn raise(pid: Pid, sig: SpawnSignal) -> SpawnResult<()> {
    let result = if sig.targets_group() {
        signal::killpg(pid, sig.as_signal()).or_else(|_| signal::kill(pid, sig.as_signal()))
    } else {
        signal::kill(pid, sig.as_signal())
    };

    result.map_err(|source| match sig.as_signal() {
        Some(signal) => SpawnError::Signal {
            signal,
            pid: pid.as_raw(),
            source,
        },
        None => SpawnError::SysCall(source),
    })
}

/// Liveness probe through the null signal.
pub fn is_alive(pid: Pid) -> bool {
    raise(pid, SpawnSignal::Noop).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_posix_signals() {
        assert_eq!(SpawnSignal::Noop.as_signal(), None);
        assert_eq!(SpawnSignal::Hangup.as_signal(), Some(Signal::SIGHUP));
        assert_eq!(SpawnSignal::CtrlC.as_signal(), Some(Signal::SIGINT));
        assert_eq!(SpawnSignal::Kill.as_signal(), Some(Signal::SIGKILL));
        assert_eq!(SpawnSignal::Terminate.as_signal(), Some(Signal::SIGTERM));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(Pid::this()));
    }

    #[test]
    fn reports_missing_process() {
        // pid_max on Linux never reaches i32::MAX.
        let err = raise(Pid::from_raw(i32::MAX), SpawnSignal::Terminate).unwrap_err();
        assert!(matches!(err, SpawnError::Signal { signal: Signal::SIGTERM, .. }));
    }
}
