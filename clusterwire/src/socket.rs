//! Socket factory: creation, options and non-blocking connect.

use std::io::{self, Read};
use std::time::Duration;

use socket2::{Protocol, SockAddr, Socket, TcpKeepalive, Type};

use crate::address::AddressCandidate;

/// Options applied to every new socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub keepalives: bool,
    pub keepalives_idle: Option<Duration>,
    pub tcp_user_timeout: Option<Duration>,
}

/// Result of starting a non-blocking connect.
#[derive(Debug)]
pub enum ConnectStart {
    Connected,
    InProgress,
}

/// Open a close-on-exec, non-blocking stream socket for `candidate`.
pub fn open(candidate: &AddressCandidate, options: &SocketOptions) -> io::Result<Socket> {
    let protocol = if candidate.is_local() {
        None
    } else {
        Some(Protocol::TCP)
    };
    let socket = Socket::new(candidate.domain(), Type::STREAM, protocol)?;

    #[cfg(unix)]
    set_cloexec(&socket)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    socket.set_nonblocking(true)?;

    if !candidate.is_local() {
        socket.set_nodelay(true)?;
        apply_keepalive(&socket, options)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(timeout) = options.tcp_user_timeout {
            socket.set_tcp_user_timeout(Some(timeout))?;
        }
    }

    Ok(socket)
}

#[cfg(unix)]
fn set_cloexec(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let previous = libc::fcntl(fd, libc::F_GETFD);
        if previous == -1 {
            return Err(io::Error::last_os_error());
        }
        if previous & libc::FD_CLOEXEC == 0
            && libc::fcntl(fd, libc::F_SETFD, previous | libc::FD_CLOEXEC) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn apply_keepalive(socket: &Socket, options: &SocketOptions) -> io::Result<()> {
    if !options.keepalives {
        socket.set_keepalive(false)?;
        return Ok(());
    }
    socket.set_keepalive(true)?;
    if let Some(idle) = options.keepalives_idle {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}

/// Start connecting. Interrupted calls are retried.
pub fn connect(socket: &Socket, addr: &SockAddr) -> io::Result<ConnectStart> {
    loop {
        match socket.connect(addr) {
            Ok(()) => return Ok(ConnectStart::Connected),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_in_progress(&e) => return Ok(ConnectStart::InProgress),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn is_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn is_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Outcome of a connect that was in progress, once the socket turned
/// writable.
pub fn finish_connect(socket: &Socket) -> io::Result<()> {
    match socket.take_error()? {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Write without raising `SIGPIPE` where the platform allows it.
pub fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        socket.send_with_flags(buf, libc::MSG_NOSIGNAL)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        socket.send(buf)
    }
}

pub fn recv(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = socket;
    reader.read(buf)
}

/// User name owning the peer of a local socket.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_user_name(socket: &Socket) -> io::Result<String> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes of the sizes passed.
    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    user_name(cred.uid)
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub fn peer_user_name(socket: &Socket) -> io::Result<String> {
    use std::os::unix::io::AsRawFd;

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: both out-pointers are valid.
    let ret = unsafe { libc::getpeereid(socket.as_raw_fd(), &mut uid, &mut gid) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    user_name(uid)
}

#[cfg(not(unix))]
pub fn peer_user_name(_socket: &Socket) -> io::Result<String> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "requirepeer parameter is not supported on this platform",
    ))
}

#[cfg(unix)]
fn user_name(uid: libc::uid_t) -> io::Result<String> {
    use std::ffi::CStr;

    let mut buf = vec![0 as libc::c_char; 1024];
    // SAFETY: passwd is plain old data; getpwuid_r fills it.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        // SAFETY: every pointer refers to live, correctly sized storage.
        let ret = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if ret == libc::ERANGE && buf.len() < 65536 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        break;
    }
    if result.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("local user with ID {} does not exist", uid),
        ));
    }
    // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Ok(name.to_string_lossy().into_owned())
}
