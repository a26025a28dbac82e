//! Derived options: the per-host connection plan.

use std::env;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chainerror::*;

use super::{passfile, ConnectionParameters};
use crate::error::*;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7070;
pub(super) const DEFAULT_PORT_STR: &str = "7070";

const PASSFILE_NAME: &str = ".clusterpass";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKind {
    /// A host name that needs a name lookup.
    Name,
    /// A literal IPv4/IPv6 address.
    NumericAddress,
    /// A directory holding the agent's local socket.
    LocalSocket,
}

/// One element of the host list.
#[derive(Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub kind: HostKind,
    /// Host name or socket directory as given; empty if only an address was.
    pub host: String,
    /// Numeric address to connect to, bypassing name lookup.
    pub hostaddr: Option<String>,
    /// Port as given; empty selects [`DEFAULT_PORT`].
    pub port: String,
    pub password: Option<String>,
}

impl HostEntry {
    /// Name used in diagnostics and for certificate verification.
    pub fn display_name(&self) -> &str {
        if self.host.is_empty() {
            self.hostaddr.as_deref().unwrap_or(DEFAULT_HOST)
        } else {
            &self.host
        }
    }
}

impl fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEntry")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("hostaddr", &self.hostaddr)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Whether the connection must be encrypted.
    pub fn requires_tls(self) -> bool {
        matches!(self, SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "disable" => SslMode::Disable,
            "allow" => SslMode::Allow,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            "verify-ca" => SslMode::VerifyCa,
            "verify-full" => SslMode::VerifyFull,
            _ => {
                return Err(cherr!(ErrorKind::InvalidOption(format!(
                    "invalid sslmode value: \"{}\"",
                    s
                ))))
            }
        })
    }
}

/// Everything the connection state machine needs, validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub hosts: Vec<HostEntry>,
    pub user: Option<String>,
    pub dbname: Option<String>,
    pub options: Option<String>,
    pub application_name: Option<String>,
    pub client_encoding: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub keepalives: bool,
    pub keepalives_idle: Option<Duration>,
    pub tcp_user_timeout: Option<Duration>,
    pub sslmode: SslMode,
    pub sslrootcert: Option<PathBuf>,
    pub requirepeer: Option<String>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => Vec::new(),
    }
}

fn parse_int_option(params: &ConnectionParameters, keyword: &str) -> Result<Option<i64>> {
    match params.get(keyword).map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse::<i64>().map(Some).map_err(|_| {
            cherr!(ErrorKind::InvalidOption(format!(
                "invalid integer value \"{}\" for connection option \"{}\"",
                v, keyword
            )))
        }),
    }
}

fn parse_seconds(params: &ConnectionParameters, keyword: &str) -> Result<Option<Duration>> {
    match parse_int_option(params, keyword)? {
        Some(v) if v < 0 => Err(cherr!(ErrorKind::InvalidOption(format!(
            "invalid value \"{}\" for connection option \"{}\"",
            v, keyword
        )))),
        Some(0) | None => Ok(None),
        Some(v) => Ok(Some(Duration::from_secs(v as u64))),
    }
}

fn non_empty(params: &ConnectionParameters, keyword: &str) -> Option<String> {
    params
        .get(keyword)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn classify(host: &str, hostaddr: Option<&str>) -> (HostKind, Option<String>) {
    if let Some(addr) = hostaddr.filter(|a| !a.is_empty()) {
        return (HostKind::NumericAddress, Some(addr.to_string()));
    }
    if host.starts_with('/') {
        (HostKind::LocalSocket, None)
    } else if host.parse::<IpAddr>().is_ok() {
        (HostKind::NumericAddress, Some(host.to_string()))
    } else {
        (HostKind::Name, None)
    }
}

fn default_passfile() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| PathBuf::from(home).join(PASSFILE_NAME))
}

pub(super) fn resolve_target(params: &ConnectionParameters) -> Result<ConnectionTarget> {
    let hosts = split_list(params.get("host"));
    let hostaddrs = split_list(params.get("hostaddr"));
    let ports = split_list(params.get("port"));

    let count = if hosts.is_empty() {
        hostaddrs.len().max(1)
    } else {
        hosts.len()
    };

    if !hostaddrs.is_empty() && hostaddrs.len() != 1 && hostaddrs.len() != count {
        return Err(cherr!(ErrorKind::InvalidConnectionString(format!(
            "could not match {} host names to {} hostaddr values",
            count,
            hostaddrs.len()
        ))));
    }
    if !ports.is_empty() && ports.len() != 1 && ports.len() != count {
        return Err(cherr!(ErrorKind::InvalidConnectionString(format!(
            "could not match {} port numbers to {} hosts",
            ports.len(),
            count
        ))));
    }

    let user = non_empty(params, "user");
    let dbname = non_empty(params, "dbname");
    let password = params.get("password").filter(|p| !p.is_empty());
    let passfile = non_empty(params, "passfile")
        .map(PathBuf::from)
        .or_else(default_passfile);

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let host = hosts.get(i).cloned().unwrap_or_default();
        let hostaddr = match hostaddrs.len() {
            0 => None,
            1 => hostaddrs.first(),
            _ => hostaddrs.get(i),
        };
        let port = match ports.len() {
            0 => String::new(),
            1 => ports[0].clone(),
            _ => ports[i].clone(),
        };

        let (kind, hostaddr) = classify(&host, hostaddr.map(String::as_str));
        let host = if host.is_empty() && hostaddr.is_none() {
            DEFAULT_HOST.to_string()
        } else {
            host
        };

        let mut entry = HostEntry {
            kind,
            host,
            hostaddr,
            port,
            password: password.map(str::to_string),
        };

        if entry.password.is_none() {
            if let (Some(path), Some(user)) = (passfile.as_ref(), user.as_deref()) {
                let match_host = match entry.kind {
                    HostKind::LocalSocket => DEFAULT_HOST,
                    _ => entry.display_name(),
                };
                let match_port = if entry.port.is_empty() {
                    DEFAULT_PORT_STR
                } else {
                    &entry.port
                };
                entry.password = passfile::lookup(
                    path,
                    match_host,
                    match_port,
                    dbname.as_deref().unwrap_or(""),
                    user,
                );
            }
        }

        entries.push(entry);
    }

    let sslmode = match params.get("sslmode") {
        Some(mode) if !mode.is_empty() => mode.parse()?,
        _ => SslMode::Disable,
    };

    // a single second is too short to be useful
    let connect_timeout = parse_seconds(params, "connect_timeout")?
        .map(|t| t.max(Duration::from_secs(2)));

    let keepalives = match parse_int_option(params, "keepalives")? {
        Some(v) => v != 0,
        None => true,
    };

    Ok(ConnectionTarget {
        hosts: entries,
        user,
        dbname,
        options: non_empty(params, "options"),
        application_name: non_empty(params, "application_name"),
        client_encoding: non_empty(params, "client_encoding"),
        connect_timeout,
        keepalives,
        keepalives_idle: parse_seconds(params, "keepalives_idle")?,
        tcp_user_timeout: parse_seconds(params, "tcp_user_timeout")?,
        sslmode,
        sslrootcert: non_empty(params, "sslrootcert").map(PathBuf::from),
        requirepeer: non_empty(params, "requirepeer"),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn target(conninfo: &str) -> Result<ConnectionTarget> {
        let mut params = ConnectionParameters::parse(conninfo)?;
        // keep the test independent of the user's password file
        if params.get("passfile").is_none() {
            params.set("passfile", "/nonexistent/clusterpass")?;
        }
        params.resolve_target()
    }

    #[test]
    fn one_port_serves_all_hosts() {
        let t = target("host=a,b,c port=9000").unwrap();
        assert_eq!(t.hosts.len(), 3);
        assert!(t.hosts.iter().all(|h| h.port == "9000"));
        assert_eq!(t.hosts[1].host, "b");
        assert_eq!(t.hosts[1].kind, HostKind::Name);
    }

    #[test]
    fn cardinality_mismatch() {
        let e = target("host=a,b port=1,2,3").unwrap_err();
        assert_eq!(
            e.kind(),
            &ErrorKind::InvalidConnectionString(
                "could not match 3 port numbers to 2 hosts".into()
            )
        );
        assert!(target("host=a,b,c hostaddr=10.0.0.1,10.0.0.2").is_err());
        assert!(target("host=a,b hostaddr=10.0.0.1").is_ok());
    }

    #[test]
    fn host_kinds() {
        let t = target("host=/run/cluster,10.1.2.3,::1,node7").unwrap();
        let kinds: Vec<_> = t.hosts.iter().map(|h| h.kind).collect();
        assert_eq!(
            kinds,
            vec![
                HostKind::LocalSocket,
                HostKind::NumericAddress,
                HostKind::NumericAddress,
                HostKind::Name
            ]
        );
        assert_eq!(t.hosts[2].hostaddr.as_deref(), Some("::1"));
    }

    #[test]
    fn hostaddr_without_host() {
        let t = target("hostaddr=10.0.0.1,10.0.0.2 port=1,2").unwrap();
        assert_eq!(t.hosts.len(), 2);
        assert_eq!(t.hosts[1].display_name(), "10.0.0.2");
        assert_eq!(t.hosts[1].port, "2");
        assert!(t.hosts[1].host.is_empty());
    }

    #[test]
    fn empty_host_element_defaults() {
        let t = target("host=a,,b").unwrap();
        assert_eq!(t.hosts[1].host, DEFAULT_HOST);
    }

    #[test]
    fn option_validation() {
        assert!(target("sslmode=sometimes").is_err());
        assert!(target("connect_timeout=soon").is_err());
        assert!(target("keepalives_idle=-1").is_err());
        let t = target("connect_timeout=1 keepalives=0 sslmode=verify-full").unwrap();
        assert_eq!(t.connect_timeout, Some(Duration::from_secs(2)));
        assert!(!t.keepalives);
        assert!(t.sslmode.requires_tls());
        let t = target("connect_timeout=0").unwrap();
        assert_eq!(t.connect_timeout, None);
    }

    #[test]
    fn explicit_password_applies_to_every_host() {
        let t = target("host=a,b password=pw").unwrap();
        assert!(t.hosts.iter().all(|h| h.password.as_deref() == Some("pw")));
    }
}
