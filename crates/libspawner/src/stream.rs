//! Stream adapters over raw child descriptors.
//!
//! A stream owns at most one descriptor. Once closed (or when it never had
//! one) reads report end-of-stream and writes fail with `BrokenPipe`.
//! Each read or write holds its own reference to the descriptor, so `close`
//! returns at once and the descriptor is released when the last in-flight
//! call finishes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use nix::errno::Errno;
use nix::libc;

use crate::sys;

#[derive(Debug)]
struct Channel {
    file: Mutex<Option<Arc<File>>>,
}

impl Channel {
    fn new(fd: Option<OwnedFd>) -> Self {
        Self {
            file: Mutex::new(fd.map(|fd| Arc::new(File::from(fd)))),
        }
    }

    fn current(&self) -> Option<Arc<File>> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    fn is_closed(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(file) = taken else {
            return Ok(());
        };
        let file = match Arc::try_unwrap(file) {
            Ok(file) => file,
            Err(busy) => {
                debug!("fd {} closes after in-flight I/O", busy.as_raw_fd());
                return Ok(());
            }
        };
        let raw = file.into_raw_fd();
        debug!("closing fd {raw}");
        // SAFETY: `raw` was just released from an owning `File` and is closed exactly once.
        Errno::result(unsafe { libc::close(raw) })
            .map(drop)
            .map_err(io::Error::from)
    }
}

/// Readable end of a child stream (its stdout, stderr, or a PTY master).
#[derive(Debug)]
pub struct SpawnerInputStream {
    channel: Channel,
}

impl SpawnerInputStream {
    pub(crate) fn new(fd: Option<OwnedFd>) -> Self {
        Self {
            channel: Channel::new(fd),
        }
    }

    /// A stream that is already at end-of-stream.
    pub fn null() -> Self {
        Self::new(None)
    }

    /// Read directly into `buf`.
    ///
    /// `EIO` and `EBADF` read as end-of-stream; a PTY master reports `EIO`
    /// once every slave descriptor is gone.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(file) = self.channel.current() else {
            return Ok(0);
        };
        let mut file = &*file;
        loop {
            match file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EIO) | Some(libc::EBADF)) => {
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort count of bytes readable without blocking.
    pub fn available(&self) -> io::Result<usize> {
        let Some(file) = self.channel.current() else {
            return Ok(0);
        };
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the pointer.
        match unsafe { sys::pending_bytes(file.as_raw_fd(), &mut pending) } {
            Ok(_) => Ok(usize::try_from(pending).unwrap_or(0)),
            Err(_) => Ok(0),
        }
    }

    pub fn close(&self) -> io::Result<()> {
        self.channel.close()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl Read for &SpawnerInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SpawnerInputStream::read(self, buf)
    }
}

impl Read for SpawnerInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SpawnerInputStream::read(self, buf)
    }
}

/// Writable end of a child stream (its stdin, or a PTY master).
#[derive(Debug)]
pub struct SpawnerOutputStream {
    channel: Channel,
}

impl SpawnerOutputStream {
    pub(crate) fn new(fd: Option<OwnedFd>) -> Self {
        Self {
            channel: Channel::new(fd),
        }
    }

    /// A stream that rejects every write.
    pub fn null() -> Self {
        Self::new(None)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let Some(file) = self.channel.current() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        };
        let mut file = &*file;
        loop {
            match file.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    pub fn close(&self) -> io::Result<()> {
        self.channel.close()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl Write for &SpawnerOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SpawnerOutputStream::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for SpawnerOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SpawnerOutputStream::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
