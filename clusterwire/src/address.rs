//! Resolution of a [`HostEntry`] into concrete socket addresses.

use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use socket2::{Domain, SockAddr};

use crate::conninfo::{HostEntry, HostKind, DEFAULT_PORT};

/// Longest path a local socket address can hold (`sun_path` minus the NUL).
#[cfg(target_os = "linux")]
const MAX_SOCKET_PATH: usize = 107;
#[cfg(not(target_os = "linux"))]
const MAX_SOCKET_PATH: usize = 103;

/// File name of the agent's local socket inside the socket directory.
pub fn local_socket_path(dir: &str, port: u16) -> PathBuf {
    PathBuf::from(dir).join(format!(".s.CLUSTER.{}", port))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Inet4,
    Inet6,
    Local,
}

/// One concrete address to try for a host.
#[derive(Clone)]
pub struct AddressCandidate {
    pub family: Family,
    pub addr: SockAddr,
}

impl AddressCandidate {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        AddressCandidate {
            family: if addr.is_ipv4() {
                Family::Inet4
            } else {
                Family::Inet6
            },
            addr: SockAddr::from(addr),
        }
    }

    pub fn domain(&self) -> Domain {
        match self.family {
            Family::Inet4 => Domain::IPV4,
            Family::Inet6 => Domain::IPV6,
            Family::Local => Domain::UNIX,
        }
    }

    pub fn is_local(&self) -> bool {
        self.family == Family::Local
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr.as_socket() {
            Some(sa) => write!(f, "{}", sa.ip()),
            None => match self.addr.as_pathname() {
                Some(path) => write!(f, "{}", path.display()),
                None => f.write_str("<unnamed>"),
            },
        }
    }
}

impl fmt::Debug for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressCandidate({:?}, {})", self.family, self)
    }
}

/// The numeric port of an entry: its own, or the protocol default.
pub fn entry_port(entry: &HostEntry) -> Result<u16, String> {
    let port = entry.port.trim();
    if port.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    match port.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err(format!("invalid port number: \"{}\"", port)),
    }
}

/// Resolve one host entry. The error text is a one-line diagnostic.
pub fn resolve(entry: &HostEntry, port: u16) -> Result<Vec<AddressCandidate>, String> {
    match entry.kind {
        HostKind::NumericAddress => {
            let literal = entry.hostaddr.as_deref().unwrap_or(&entry.host);
            literal
                .parse::<IpAddr>()
                .map(|ip| vec![AddressCandidate::from_socket_addr(SocketAddr::new(ip, port))])
                .map_err(|_| format!("could not parse network address \"{}\"", literal))
        }
        HostKind::Name => match (entry.host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.map(AddressCandidate::from_socket_addr).collect();
                if addrs.is_empty() {
                    Err(format!(
                        "could not translate host name \"{}\" to address",
                        entry.host
                    ))
                } else {
                    Ok(addrs)
                }
            }
            Err(e) => Err(format!(
                "could not translate host name \"{}\" to address: {}",
                entry.host, e
            )),
        },
        HostKind::LocalSocket => {
            let path = local_socket_path(&entry.host, port);
            if path.as_os_str().len() > MAX_SOCKET_PATH {
                return Err(format!(
                    "Unix-domain socket path \"{}\" is too long (maximum {} bytes)",
                    path.display(),
                    MAX_SOCKET_PATH
                ));
            }
            SockAddr::unix(&path)
                .map(|addr| {
                    vec![AddressCandidate {
                        family: Family::Local,
                        addr,
                    }]
                })
                .map_err(|e| format!("invalid socket path \"{}\": {}", path.display(), e))
        }
    }
}

type Resolved = Result<Vec<AddressCandidate>, String>;

/// A [`resolve`] call running on its own thread.
///
/// [`PendingLookup::fd`] turns readable once the outcome can be taken with
/// [`PendingLookup::poll`]. Dropping it abandons the lookup.
pub struct PendingLookup {
    wakeup: UnixStream,
    outcome: mpsc::Receiver<Resolved>,
}

impl PendingLookup {
    pub fn start(entry: &HostEntry, port: u16) -> io::Result<Self> {
        let (wakeup, mut notify) = UnixStream::pair()?;
        let (sender, outcome) = mpsc::channel();
        let entry = entry.clone();
        thread::Builder::new()
            .name("clusterwire-resolve".into())
            .spawn(move || {
                let resolved = resolve(&entry, port);
                log::trace!("lookup of \"{}\" finished", entry.host);
                // the receiver is gone when the attempt was abandoned
                if sender.send(resolved).is_ok() {
                    let _ = notify.write_all(&[1]);
                }
            })?;
        Ok(PendingLookup { wakeup, outcome })
    }

    /// Descriptor to wait on for readability.
    pub fn fd(&self) -> RawFd {
        self.wakeup.as_raw_fd()
    }

    /// The outcome, once the lookup has finished.
    pub fn poll(&mut self) -> Option<Resolved> {
        match self.outcome.try_recv() {
            Ok(resolved) => Some(resolved),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                Some(Err("host name lookup terminated unexpectedly".to_string()))
            }
        }
    }
}

impl fmt::Debug for PendingLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingLookup(fd {})", self.fd())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(kind: HostKind, host: &str, hostaddr: Option<&str>, port: &str) -> HostEntry {
        HostEntry {
            kind,
            host: host.into(),
            hostaddr: hostaddr.map(Into::into),
            port: port.into(),
            password: None,
        }
    }

    #[test]
    fn ports() {
        assert_eq!(entry_port(&entry(HostKind::Name, "h", None, "")), Ok(DEFAULT_PORT));
        assert_eq!(entry_port(&entry(HostKind::Name, "h", None, "9000")), Ok(9000));
        assert!(entry_port(&entry(HostKind::Name, "h", None, "0")).is_err());
        assert!(entry_port(&entry(HostKind::Name, "h", None, "65536")).is_err());
        assert!(entry_port(&entry(HostKind::Name, "h", None, "http")).is_err());
    }

    #[test]
    fn numeric() {
        let addrs = resolve(&entry(HostKind::NumericAddress, "", Some("::1"), ""), 7070).unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].family, Family::Inet6);
        assert_eq!(addrs[0].addr.as_socket(), Some("[::1]:7070".parse().unwrap()));
        assert!(resolve(&entry(HostKind::NumericAddress, "", Some("10.0.0.300"), ""), 1).is_err());
    }

    #[test]
    fn local_socket() {
        let addrs = resolve(&entry(HostKind::LocalSocket, "/tmp", None, ""), 7070).unwrap();
        assert!(addrs[0].is_local());
        assert_eq!(addrs[0].to_string(), "/tmp/.s.CLUSTER.7070");

        let long = format!("/{}", "d".repeat(200));
        assert!(resolve(&entry(HostKind::LocalSocket, &long, None, ""), 7070).is_err());
    }

    #[test]
    fn name_lookup_of_localhost() {
        let addrs = resolve(&entry(HostKind::Name, "localhost", None, ""), 7070).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs
            .iter()
            .all(|a| a.addr.as_socket().map(|s| s.port()) == Some(7070)));
    }

    #[test]
    fn lookup_off_thread() {
        let mut lookup =
            PendingLookup::start(&entry(HostKind::Name, "localhost", None, ""), 7171).unwrap();
        crate::poll::wait(lookup.fd(), true, false, None).unwrap();
        let addrs = lookup.poll().unwrap().unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs
            .iter()
            .all(|a| a.addr.as_socket().map(|s| s.port()) == Some(7171)));
    }

    #[test]
    fn lookup_failure_is_reported() {
        let mut lookup =
            PendingLookup::start(&entry(HostKind::Name, "no-such-host.invalid", None, ""), 1)
                .unwrap();
        crate::poll::wait(lookup.fd(), true, false, None).unwrap();
        let e = lookup.poll().unwrap().unwrap_err();
        assert!(e.contains("could not translate host name"), "{}", e);
    }
}
