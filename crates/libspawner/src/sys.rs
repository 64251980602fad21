//! Native create-process and wait primitives.
//!
//! Everything the child needs is allocated before `fork`; between `fork`
//! and `exec` the child only makes async-signal-safe libc calls. Setup
//! failures travel back over a close-on-exec pipe as errno plus a stage
//! byte, so a failed exec surfaces synchronously in the parent.

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::errors::SpawnResult;
use crate::process::ExitStatus;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

nix::ioctl_read_bad!(pending_bytes, libc::FIONREAD, libc::c_int);
nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, libc::winsize);

/// Mark `fd` close-on-exec.
pub(crate) fn set_cloexec(fd: &impl AsRawFd) -> SpawnResult<()> {
    // SAFETY: F_SETFD only updates descriptor flags.
    Errno::result(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

/// A pipe whose both ends are close-on-exec.
pub(crate) fn cloexec_pipe() -> SpawnResult<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let (r, w) = nix::unistd::pipe()?;
        set_cloexec(&r)?;
        set_cloexec(&w)?;
        Ok((r, w))
    }
}

/// Locate `program` the way a shell would.
///
/// Names containing `/` are taken as paths. Bare names are searched on the
/// `PATH` of `env` when one is supplied, else on the host's `PATH`.
pub(crate) fn find_program(program: &str, env: Option<&[(String, String)]>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    let search: OsString = env
        .and_then(|vars| vars.iter().find(|(k, _)| k == "PATH"))
        .map(|(_, v)| OsString::from(v))
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from(DEFAULT_PATH));

    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// How the child's standard streams and session are set up.
#[derive(Debug)]
pub(crate) enum ChildStdio {
    /// Three pipes; the child leads a new process group.
    Pipes,
    /// A pseudo-terminal slave; the child leads a new session. In console
    /// mode stderr is a separate pipe.
    Pty { slave: OwnedFd, console: bool },
    /// Inherited host stdio in a new session.
    Detached,
}

/// Parent-side descriptors of a freshly created child.
#[derive(Debug, Default)]
pub(crate) struct Channels {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl Channels {
    pub(crate) fn close_all(&mut self) {
        for (name, fd) in [
            ("stdin", self.stdin.take()),
            ("stdout", self.stdout.take()),
            ("stderr", self.stderr.take()),
        ] {
            if let Some(fd) = fd {
                debug!("closing unused {name} fd {}", fd.as_raw_fd());
            }
        }
    }
}

/// Program image prepared for `exec`, with NULL-terminated pointer arrays.
pub(crate) struct ExecImage {
    path: CString,
    dir: Option<CString>,
    _argv: Vec<CString>,
    _envp: Option<Vec<CString>>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Option<Vec<*const libc::c_char>>,
}

impl ExecImage {
    pub(crate) fn new(
        path: &Path,
        argv: &[String],
        env: Option<&[(String, String)]>,
        dir: Option<&Path>,
    ) -> SpawnResult<Self> {
        let path = CString::new(path.as_os_str().as_bytes())?;
        let dir = dir
            .map(|d| CString::new(d.as_os_str().as_bytes()))
            .transpose()?;
        let argv = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = env
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| CString::new(format!("{k}={v}")))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = envp.as_deref().map(null_terminated);
        Ok(Self {
            path,
            dir,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Session = 1,
    Terminal = 2,
    Redirect = 3,
    Chdir = 4,
    Exec = 5,
}

impl Stage {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Stage::Session),
            2 => Some(Stage::Terminal),
            3 => Some(Stage::Redirect),
            4 => Some(Stage::Chdir),
            5 => Some(Stage::Exec),
            _ => None,
        }
    }
}

const REPORT_LEN: usize = 5;

/// Dispositions restored to their defaults in the child; ignored signals
/// would otherwise survive `exec`.
const RESET_SIGNALS: [libc::c_int; 9] = [
    libc::SIGPIPE,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGHUP,
    libc::SIGTERM,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGCHLD,
];

/// Descriptors the child installs on 0, 1 and 2.
struct ChildFds {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
    session: Session,
}

enum Session {
    Group,
    Terminal(RawFd),
    Detached,
}

/// Fork and exec `image`. Must run on the thread that will later reap the
/// child. Returns the pid and the parent's ends of the stdio channels, or a
/// human-readable failure reason.
pub(crate) fn spawn(image: &ExecImage, stdio: ChildStdio) -> Result<(Pid, Channels), String> {
    let mut channels = Channels::default();
    // Child-side descriptors stay open here until the fork is done.
    let mut child_side: Vec<OwnedFd> = Vec::new();

    let fds = prepare_stdio(stdio, &mut channels, &mut child_side).map_err(|e| e.to_string())?;
    let (report_r, report_w) = cloexec_pipe().map_err(|e| e.to_string())?;

    // SAFETY: the child only runs async-signal-safe code before exec/_exit.
    match unsafe { fork() } {
        Err(errno) => Err(format!("fork: {}", errno.desc())),
        Ok(ForkResult::Child) => {
            // SAFETY: we are the freshly forked child.
            unsafe { exec_child(image, &fds, report_w.as_raw_fd()) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(child_side);
            drop(report_w);
            match read_failure(report_r) {
                None => Ok((child, channels)),
                Some((errno, stage)) => {
                    // Reap the failed child so it does not linger as a zombie.
                    let _ = waitpid(child, None);
                    Err(describe_failure(errno, stage, image))
                }
            }
        }
    }
}

fn prepare_stdio(
    stdio: ChildStdio,
    channels: &mut Channels,
    child_side: &mut Vec<OwnedFd>,
) -> SpawnResult<ChildFds> {
    let mut keep = |fd: OwnedFd| {
        let raw = fd.as_raw_fd();
        child_side.push(fd);
        raw
    };

    Ok(match stdio {
        ChildStdio::Pipes => {
            let (in_r, in_w) = cloexec_pipe()?;
            let (out_r, out_w) = cloexec_pipe()?;
            let (err_r, err_w) = cloexec_pipe()?;
            channels.stdin = Some(in_w);
            channels.stdout = Some(out_r);
            channels.stderr = Some(err_r);
            ChildFds {
                stdin: Some(keep(in_r)),
                stdout: Some(keep(out_w)),
                stderr: Some(keep(err_w)),
                session: Session::Group,
            }
        }
        ChildStdio::Pty { slave, console } => {
            let stderr = if console {
                let (err_r, err_w) = cloexec_pipe()?;
                channels.stderr = Some(err_r);
                Some(err_w)
            } else {
                None
            };
            let slave = keep(slave);
            ChildFds {
                stdin: Some(slave),
                stdout: Some(slave),
                stderr: Some(stderr.map(&mut keep).unwrap_or(slave)),
                session: Session::Terminal(slave),
            }
        }
        ChildStdio::Detached => ChildFds {
            stdin: None,
            stdout: None,
            stderr: None,
            session: Session::Detached,
        },
    })
}

/// Child half of `spawn`; never returns.
unsafe fn exec_child(image: &ExecImage, fds: &ChildFds, report: RawFd) -> ! {
    unsafe {
        for sig in RESET_SIGNALS {
            libc::signal(sig, libc::SIG_DFL);
        }
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());

        match fds.session {
            Session::Group => {
                if libc::setpgid(0, 0) < 0 {
                    report_and_exit(report, Stage::Session);
                }
            }
            Session::Terminal(slave) => {
                if libc::setsid() < 0 {
                    report_and_exit(report, Stage::Session);
                }
                if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
                    report_and_exit(report, Stage::Terminal);
                }
            }
            Session::Detached => {
                if libc::setsid() < 0 {
                    report_and_exit(report, Stage::Session);
                }
            }
        }

        for (src, dst) in [(fds.stdin, 0), (fds.stdout, 1), (fds.stderr, 2)] {
            if let Some(src) = src {
                redirect(src, dst, report);
            }
        }

        if let Some(dir) = &image.dir {
            if libc::chdir(dir.as_ptr()) < 0 {
                report_and_exit(report, Stage::Chdir);
            }
        }

        match &image.envp_ptrs {
            Some(envp) => libc::execve(image.path.as_ptr(), image.argv_ptrs.as_ptr(), envp.as_ptr()),
            None => libc::execv(image.path.as_ptr(), image.argv_ptrs.as_ptr()),
        };
        report_and_exit(report, Stage::Exec)
    }
}

unsafe fn redirect(src: RawFd, dst: RawFd, report: RawFd) {
    unsafe {
        // dup2 onto itself keeps close-on-exec, so clear the flag instead.
        let rc = if src == dst {
            libc::fcntl(dst, libc::F_SETFD, 0)
        } else {
            libc::dup2(src, dst)
        };
        if rc < 0 {
            report_and_exit(report, Stage::Redirect);
        }
    }
}

unsafe fn report_and_exit(report: RawFd, stage: Stage) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let code = errno.to_be_bytes();
    let msg: [u8; REPORT_LEN] = [code[0], code[1], code[2], code[3], stage as u8];
    unsafe {
        libc::write(report, msg.as_ptr().cast(), msg.len());
        libc::_exit(127)
    }
}

fn read_failure(report: OwnedFd) -> Option<(i32, Stage)> {
    let mut file = File::from(report);
    let mut buf = [0u8; REPORT_LEN];
    let mut filled = 0;
    while filled < REPORT_LEN {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("lost exec status pipe: {e}");
                break;
            }
        }
    }
    if filled < REPORT_LEN {
        return None;
    }
    let errno = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Some((errno, Stage::from_byte(buf[4])?))
}

fn describe_failure(errno: i32, stage: Stage, image: &ExecImage) -> String {
    let desc = Errno::from_raw(errno).desc();
    match stage {
        Stage::Exec => desc.to_string(),
        Stage::Chdir => {
            let dir = image
                .dir
                .as_deref()
                .map(|d| OsStr::from_bytes(d.to_bytes()).to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("chdir {dir}: {desc}")
        }
        Stage::Session => format!("session setup: {desc}"),
        Stage::Terminal => format!("controlling terminal: {desc}"),
        Stage::Redirect => format!("stdio redirect: {desc}"),
    }
}

/// Block until `pid` terminates.
pub(crate) fn wait_for_exit(pid: Pid) -> ExitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitStatus::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitStatus::Signaled(signal),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                warn!("waitpid({pid}) failed: {errno}");
                return ExitStatus::Unknown;
            }
        }
    }
}
