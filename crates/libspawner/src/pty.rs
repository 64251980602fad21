//! Pseudo-terminal allocation for spawned children.

use std::ffi::{CStr, OsStr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use nix::errno::Errno;
use nix::libc;
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::{self, LocalFlags, SetArg};

use crate::errors::{SpawnError, SpawnResult};
use crate::stream::{SpawnerInputStream, SpawnerOutputStream};
use crate::sys;

/// How a child is wired to its pseudo-terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PtyMode {
    /// stdin/stdout through the terminal with echo off; stderr stays a pipe.
    #[default]
    Console,
    /// All three standard streams through the terminal.
    Terminal,
}

/// A master/slave pseudo-terminal pair awaiting, or attached to, one child.
#[derive(Debug)]
pub struct Pty {
    mode: PtyMode,
    master: OwnedFd,
    slave: Mutex<Option<OwnedFd>>,
    slave_name: PathBuf,
    input: Arc<SpawnerInputStream>,
    output: Arc<SpawnerOutputStream>,
}

impl Pty {
    pub fn new(mode: PtyMode) -> SpawnResult<Self> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None)?;
        sys::set_cloexec(&master)?;
        sys::set_cloexec(&slave)?;

        let slave_name = terminal_name(&slave)?;
        if mode == PtyMode::Console {
            disable_echo(&slave)?;
        }

        let input = Arc::new(SpawnerInputStream::new(Some(master.try_clone()?)));
        let output = Arc::new(SpawnerOutputStream::new(Some(master.try_clone()?)));
        debug!("allocated {mode:?} pty {}", slave_name.display());

        Ok(Self {
            mode,
            master,
            slave: Mutex::new(Some(slave)),
            slave_name,
            input,
            output,
        })
    }

    pub fn mode(&self) -> PtyMode {
        self.mode
    }

    pub fn is_console(&self) -> bool {
        self.mode == PtyMode::Console
    }

    /// Device path of the slave side, e.g. `/dev/pts/4`.
    pub fn slave_name(&self) -> &Path {
        &self.slave_name
    }

    /// Reads what the child writes to the terminal.
    pub fn input_stream(&self) -> Arc<SpawnerInputStream> {
        Arc::clone(&self.input)
    }

    /// Writes keystrokes to the child.
    pub fn output_stream(&self) -> Arc<SpawnerOutputStream> {
        Arc::clone(&self.output)
    }

    pub fn set_terminal_size(&self, cols: u16, rows: u16) -> SpawnResult<()> {
        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads one winsize from the pointer.
        unsafe { sys::set_window_size(self.master.as_raw_fd(), &size) }?;
        Ok(())
    }

    /// Hand the slave side over to a launch. A pty serves a single child.
    pub(crate) fn take_slave(&self) -> SpawnResult<OwnedFd> {
        self.slave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SpawnError::IllegalState("pty is already attached to a process"))
    }
}

fn terminal_name(fd: &OwnedFd) -> SpawnResult<PathBuf> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: the buffer length is passed alongside the buffer.
    let rc = unsafe { libc::ttyname_r(fd.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(Errno::from_raw(rc).into());
    }
    // SAFETY: ttyname_r NUL-terminates on success.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

fn disable_echo(fd: &OwnedFd) -> SpawnResult<()> {
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.local_flags.remove(
        LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL,
    );
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn allocates_a_named_slave() {
        let pty = Pty::new(PtyMode::Terminal).unwrap();
        assert!(pty.slave_name().starts_with("/dev"));
        assert!(!pty.is_console());
        pty.set_terminal_size(120, 40).unwrap();
    }

    #[test]
    fn streams_are_cached() {
        let pty = Pty::new(PtyMode::Console).unwrap();
        assert!(Arc::ptr_eq(&pty.input_stream(), &pty.input_stream()));
        assert!(Arc::ptr_eq(&pty.output_stream(), &pty.output_stream()));
    }

    #[test]
    fn slave_is_handed_out_once() {
        let pty = Pty::new(PtyMode::Console).unwrap();
        let _slave = pty.take_slave().unwrap();
        assert!(matches!(pty.take_slave(), Err(SpawnError::IllegalState(_))));
    }

    #[test]
    fn terminal_mode_echoes_input() {
        let pty = Pty::new(PtyMode::Terminal).unwrap();
        (&*pty.output_stream()).write_all(b"ping\n").unwrap();

        let mut buf = [0u8; 16];
        let n = (&*pty.input_stream()).read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("ping"));
    }
}
