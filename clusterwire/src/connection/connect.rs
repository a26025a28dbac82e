//! Connection establishment.
//!
//! [`Connection::connect_poll`] never blocks on the network: it returns
//! [`ConnectPoll::Pending`] whenever progress needs the socket to become
//! readable or writable, and resumes at the same host and address on the
//! next call. Host names are looked up on a helper thread whose wakeup
//! descriptor stands in for the socket meanwhile. [`Connection::connect`]
//! is the blocking driver on top of it.

use std::time::Instant;

use chainerror::*;

use super::{ConnectPoll, Connection, ConnectionStatus, Phase, Transport};
use crate::address::{self, AddressCandidate, PendingLookup};
use crate::conninfo::{ConnectionParameters, ConnectionTarget, HostEntry, HostKind};
use crate::error::*;
use crate::poll::{self, Interest, Readiness};
use crate::security::{self, ChannelFactory, HandshakeStatus};
use crate::socket::{self, ConnectStart, SocketOptions};

fn open_candidate(
    target: &ConnectionTarget,
    entry: &HostEntry,
    candidate: &AddressCandidate,
    factory: Option<&ChannelFactory>,
) -> std::result::Result<(Transport, ConnectStart), String> {
    let channel = match factory {
        Some(factory) => factory(target, entry, candidate)?,
        None => security::negotiate(target, entry, candidate)?,
    };
    let options = SocketOptions {
        keepalives: target.keepalives,
        keepalives_idle: target.keepalives_idle,
        tcp_user_timeout: target.tcp_user_timeout,
    };
    let socket =
        socket::open(candidate, &options).map_err(|e| format!("could not create socket: {}", e))?;
    let start = socket::connect(&socket, &candidate.addr).map_err(|e| e.to_string())?;
    Ok((Transport { socket, channel }, start))
}

fn describe(entry: Option<&HostEntry>, candidate: &AddressCandidate) -> String {
    if candidate.is_local() {
        return format!("connection to server on socket \"{}\" failed", candidate);
    }
    let port = candidate.addr.as_socket().map(|a| a.port()).unwrap_or(0);
    let address = candidate.to_string();
    match entry.map(|e| e.host.as_str()) {
        Some(host) if !host.is_empty() && host != address => format!(
            "connection to server at \"{}\" ({}), port {} failed",
            host, address, port
        ),
        _ => format!("connection to server at \"{}\", port {} failed", address, port),
    }
}

impl Connection {
    /// Connect to the first host in `params` that accepts, waiting as long
    /// as needed.
    ///
    /// Unset options are filled from the environment and compiled defaults.
    /// On failure the error lists every host and address that was tried.
    pub fn connect(params: &ConnectionParameters) -> Result<Connection> {
        let mut conn = Connection::new();
        conn.start(params)?;
        conn.complete_connect()?;
        Ok(conn)
    }

    /// [`Connection::connect`] for a `keyword=value` or URI string.
    pub fn connect_str(conninfo: &str) -> Result<Connection> {
        Connection::connect(&ConnectionParameters::parse(conninfo)?)
    }

    /// Resolve `params` and prepare the first attempt without touching the
    /// network. Drive the attempt with [`Connection::connect_poll`].
    pub fn start(&mut self, params: &ConnectionParameters) -> Result<()> {
        let mut params = params.clone();
        params.add_defaults();
        let target = params.resolve_target()?;
        self.start_target(target);
        Ok(())
    }

    /// Like [`Connection::start`] for an already resolved target.
    pub fn start_target(&mut self, target: ConnectionTarget) {
        self.clear_session();
        self.target = Some(target);
        self.restart();
    }

    fn restart(&mut self) {
        self.status = ConnectionStatus::Started;
        self.phase = Phase::ResolveHost;
        self.host_index = 0;
        self.addr_index = 0;
        self.addrs.clear();
        self.attempt_deadline = None;
    }

    /// Advance establishment as far as possible without blocking.
    ///
    /// Hosts are tried in order, and each host's addresses in resolver
    /// order. The first candidate whose connect and security handshake
    /// both succeed wins. Every failure appends a line to
    /// [`Connection::error_message`].
    pub fn connect_poll(&mut self) -> ConnectPoll {
        loop {
            let step = match self.phase {
                Phase::Idle => return ConnectPoll::Failed,
                Phase::Done => {
                    return match self.status {
                        ConnectionStatus::Established => ConnectPoll::Established,
                        _ => ConnectPoll::Failed,
                    }
                }
                Phase::ResolveHost => self.resolve_host(),
                Phase::Resolving => self.poll_resolving(),
                Phase::TryAddress => self.try_address(),
                Phase::Connecting => self.poll_connecting(),
                Phase::Handshaking => self.poll_handshake(),
            };
            if let Some(result) = step {
                return result;
            }
        }
    }

    /// Block until the attempt started by [`Connection::start`] finishes.
    ///
    /// With `connect_timeout` set, a host name lookup or an address that
    /// does not get through connect and handshake in time is abandoned and
    /// the next one tried.
    pub fn complete_connect(&mut self) -> Result<()> {
        let timeout = self.target.as_ref().and_then(|t| t.connect_timeout);
        loop {
            match self.connect_poll() {
                ConnectPoll::Established => return Ok(()),
                ConnectPoll::Failed => {
                    return Err(cherr!(ErrorKind::ConnectionFailed(
                        self.error_message().trim_end().to_string()
                    )))
                }
                ConnectPoll::Pending(interest) => {
                    let deadline = match (timeout, self.attempt_deadline) {
                        (Some(timeout), None) => {
                            let deadline = Instant::now() + timeout;
                            self.attempt_deadline = Some(deadline);
                            Some(deadline)
                        }
                        (_, deadline) => deadline,
                    };
                    if self.wait(interest, deadline)? == Readiness::Timeout {
                        self.abandon_candidate("timeout expired");
                    }
                }
            }
        }
    }

    /// Give up on the address currently being connected, or the host name
    /// being looked up, and move on to the next one, e.g. when the caller's
    /// own timeout expired.
    pub fn abandon_candidate(&mut self, reason: &str) {
        match self.phase {
            Phase::Connecting | Phase::Handshaking => self.candidate_failed(reason),
            Phase::Resolving => {
                self.attempt_deadline = None;
                if let Some(entry) = self.host().cloned() {
                    let line = format!(
                        "could not translate host name \"{}\" to address: {}",
                        entry.host, reason
                    );
                    self.host_failed(&entry, &line);
                }
            }
            _ => {}
        }
    }

    /// Close the connection and connect again from the first host.
    pub fn reset(&mut self) -> Result<()> {
        self.reset_start()?;
        self.complete_connect()
    }

    /// Non-blocking [`Connection::reset`]: prepare the new attempt and leave
    /// it to [`Connection::connect_poll`].
    pub fn reset_start(&mut self) -> Result<()> {
        if self.target.is_none() {
            return Err(cherr!(ErrorKind::NotConnected));
        }
        self.clear_session();
        self.restart();
        Ok(())
    }

    /// The host being tried, or the one connected to.
    pub fn host(&self) -> Option<&HostEntry> {
        self.target
            .as_ref()
            .and_then(|t| t.hosts.get(self.host_index))
    }

    fn advance_host(&mut self) {
        self.host_index += 1;
        self.addr_index = 0;
        self.addrs.clear();
        self.lookup = None;
        self.phase = Phase::ResolveHost;
    }

    fn host_failed(&mut self, entry: &HostEntry, reason: &str) {
        log::debug!("host \"{}\" skipped: {}", entry.display_name(), reason);
        self.append_error(reason);
        self.advance_host();
    }

    fn resolve_host(&mut self) -> Option<ConnectPoll> {
        let entry = match self.host() {
            Some(entry) => entry.clone(),
            None => return Some(self.fail_attempt()),
        };
        let port = match address::entry_port(&entry) {
            Ok(port) => port,
            Err(reason) => {
                self.host_failed(&entry, &reason);
                return None;
            }
        };

        if entry.kind != HostKind::Name {
            self.resolved(&entry, address::resolve(&entry, port));
            return None;
        }
        match PendingLookup::start(&entry, port) {
            Ok(lookup) => {
                log::debug!("looking up \"{}\" on {:?}", entry.host, lookup);
                self.lookup = Some(lookup);
                self.phase = Phase::Resolving;
                return Some(ConnectPoll::Pending(Interest::Read));
            }
            Err(e) => {
                self.host_failed(&entry, &format!("could not start host name lookup: {}", e))
            }
        }
        None
    }

    fn poll_resolving(&mut self) -> Option<ConnectPoll> {
        let outcome = match self.lookup.as_mut().map(PendingLookup::poll) {
            Some(Some(outcome)) => outcome,
            Some(None) => return Some(ConnectPoll::Pending(Interest::Read)),
            None => Err("host name lookup lost".to_string()),
        };
        self.lookup = None;
        match self.host().cloned() {
            Some(entry) => self.resolved(&entry, outcome),
            None => return Some(self.fail_attempt()),
        }
        None
    }

    fn resolved(
        &mut self,
        entry: &HostEntry,
        outcome: std::result::Result<Vec<AddressCandidate>, String>,
    ) {
        match outcome {
            Ok(addrs) => {
                log::debug!(
                    "host \"{}\": {} address(es) to try",
                    entry.display_name(),
                    addrs.len()
                );
                self.addrs = addrs;
                self.addr_index = 0;
                self.attempt_deadline = None;
                self.phase = Phase::TryAddress;
            }
            Err(reason) => self.host_failed(entry, &reason),
        }
    }

    fn try_address(&mut self) -> Option<ConnectPoll> {
        let candidate = match self.addrs.get(self.addr_index) {
            Some(candidate) => candidate.clone(),
            None => {
                self.advance_host();
                return None;
            }
        };
        let opened = match (self.target.as_ref(), self.host()) {
            (Some(target), Some(entry)) => {
                open_candidate(target, entry, &candidate, self.channel_factory.as_ref())
            }
            _ => return Some(self.fail_attempt()),
        };

        log::debug!("trying {:?}", candidate);
        self.attempt_deadline = None;
        match opened {
            Ok((transport, start)) => {
                self.transport = Some(transport);
                match start {
                    ConnectStart::Connected => self.connected(),
                    ConnectStart::InProgress => {
                        self.phase = Phase::Connecting;
                        return Some(ConnectPoll::Pending(Interest::Write));
                    }
                }
            }
            Err(reason) => self.candidate_failed(&reason),
        }
        None
    }

    fn poll_connecting(&mut self) -> Option<ConnectPoll> {
        let fd = match self.socket_fd() {
            Some(fd) => fd,
            None => {
                self.candidate_failed("socket lost while connecting");
                return None;
            }
        };
        // re-polled before the connect finished
        match poll::wait(fd, false, true, Some(Instant::now())) {
            Ok(Readiness::Timeout) => return Some(ConnectPoll::Pending(Interest::Write)),
            Ok(Readiness::Ready) => {}
            Err(e) => {
                self.candidate_failed(&e.to_string());
                return None;
            }
        }

        let finished = match self.transport.as_ref() {
            Some(transport) => socket::finish_connect(&transport.socket),
            None => return None,
        };
        match finished {
            Ok(()) => self.connected(),
            Err(e) => self.candidate_failed(&e.to_string()),
        }
        None
    }

    fn connected(&mut self) {
        let peer_check = match (self.transport.as_ref(), self.target.as_ref()) {
            (Some(transport), Some(target)) => {
                self.local_addr = transport.socket.local_addr().ok();
                let is_local = self
                    .addrs
                    .get(self.addr_index)
                    .map_or(false, AddressCandidate::is_local);
                match target.requirepeer.as_deref() {
                    Some(required) if is_local => {
                        match socket::peer_user_name(&transport.socket) {
                            Ok(name) if name == required => None,
                            Ok(name) => Some(format!(
                                "requirepeer specifies \"{}\", but actual peer user name is \"{}\"",
                                required, name
                            )),
                            Err(e) => Some(format!("could not get peer credentials: {}", e)),
                        }
                    }
                    _ => None,
                }
            }
            _ => Some("socket lost while connecting".to_string()),
        };

        match peer_check {
            Some(reason) => self.candidate_failed(&reason),
            None => self.phase = Phase::Handshaking,
        }
    }

    fn poll_handshake(&mut self) -> Option<ConnectPoll> {
        let status = match self.transport.as_mut() {
            Some(t) => t.channel.poll_handshake(&t.socket),
            None => HandshakeStatus::Failed,
        };
        match status {
            HandshakeStatus::Complete => {
                self.status = ConnectionStatus::Established;
                self.phase = Phase::Done;
                self.attempt_deadline = None;
                if let Some(candidate) = self.addrs.get(self.addr_index) {
                    log::debug!(
                        "connected to {:?} over {}",
                        candidate,
                        self.channel_name().unwrap_or("?")
                    );
                }
                Some(ConnectPoll::Established)
            }
            HandshakeStatus::WantRead => Some(ConnectPoll::Pending(Interest::Read)),
            HandshakeStatus::WantWrite => Some(ConnectPoll::Pending(Interest::Write)),
            HandshakeStatus::Failed => {
                let reason = self
                    .transport
                    .as_ref()
                    .and_then(|t| t.channel.failure_reason())
                    .unwrap_or("security handshake failed")
                    .to_string();
                self.candidate_failed(&reason);
                None
            }
        }
    }

    fn candidate_failed(&mut self, reason: &str) {
        let line = match self.addrs.get(self.addr_index) {
            Some(candidate) => format!("{}: {}", describe(self.host(), candidate), reason),
            None => reason.to_string(),
        };
        log::debug!("{}", line);
        self.append_error(&line);
        self.close_socket();
        self.local_addr = None;
        self.addr_index += 1;
        self.attempt_deadline = None;
        self.phase = Phase::TryAddress;
    }

    fn fail_attempt(&mut self) -> ConnectPoll {
        self.close_socket();
        self.status = ConnectionStatus::Failed;
        self.phase = Phase::Done;
        if self.error_message.is_empty() {
            self.append_error("no host to connect to");
        }
        log::debug!("all hosts failed");
        ConnectPoll::Failed
    }
}
