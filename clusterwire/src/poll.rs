//! Readiness wait on a single socket.

use std::io;
use std::time::Instant;

#[cfg(unix)]
pub use std::os::unix::io::RawFd;

/// What the caller wants to wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    pub fn wants_read(self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
}

#[cfg(unix)]
pub fn as_fd<T: std::os::unix::io::AsRawFd>(source: &T) -> RawFd {
    source.as_raw_fd()
}

/// Wait until `fd` is readable and/or writable, or `deadline` passes.
///
/// `None` waits indefinitely; a deadline in the past polls once. Interrupted
/// waits are resumed with the remaining time.
#[cfg(unix)]
pub fn wait(
    fd: RawFd,
    for_read: bool,
    for_write: bool,
    deadline: Option<Instant>,
) -> io::Result<Readiness> {
    if !for_read && !for_write {
        return Ok(Readiness::Ready);
    }

    let mut events: libc::c_short = 0;
    if for_read {
        events |= libc::POLLIN;
    }
    if for_write {
        events |= libc::POLLOUT;
    }

    loop {
        let timeout_ms: libc::c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                // round up so a sub-millisecond remainder still waits
                let ms = (left.as_micros() + 999) / 1000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: a single valid pollfd is passed.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ret {
            -1 => {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            0 => return Ok(Readiness::Timeout),
            _ => return Ok(Readiness::Ready),
        }
    }
}

/// Whether `fd` has data (or EOF) to read right now.
#[cfg(unix)]
pub fn read_ready(fd: RawFd) -> io::Result<bool> {
    Ok(wait(fd, true, false, Some(Instant::now()))? == Readiness::Ready)
}
