//! Security layer negotiated after the transport connects.
//!
//! A [`SecureChannel`] is driven by the connection state machine one
//! [`SecureChannel::poll_handshake`] call at a time; between calls the
//! connection waits for the readiness the channel asked for. Once the
//! handshake completes every byte of the session flows through
//! [`SecureChannel::read`] and [`SecureChannel::write`].

use std::io;

use socket2::Socket;

use crate::address::AddressCandidate;
use crate::conninfo::{ConnectionTarget, HostEntry};
use crate::socket;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    WantRead,
    WantWrite,
    Failed,
}

pub trait SecureChannel: Send {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Advance the handshake as far as the socket allows.
    fn poll_handshake(&mut self, socket: &Socket) -> HandshakeStatus;

    /// Why the handshake failed, after [`HandshakeStatus::Failed`].
    fn failure_reason(&self) -> Option<&str>;

    fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, socket: &Socket, buf: &[u8]) -> io::Result<usize>;

    /// Push out bytes the channel accepted but has not yet written.
    /// Returns `WouldBlock` while some remain.
    fn flush(&mut self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Unencrypted pass-through channel.
#[derive(Debug, Default)]
pub struct PlainChannel;

impl SecureChannel for PlainChannel {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn poll_handshake(&mut self, _socket: &Socket) -> HandshakeStatus {
        HandshakeStatus::Complete
    }

    fn failure_reason(&self) -> Option<&str> {
        None
    }

    fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(socket, buf)
    }

    fn write(&mut self, socket: &Socket, buf: &[u8]) -> io::Result<usize> {
        socket::send(socket, buf)
    }
}

/// Picks the channel for one candidate in place of [`negotiate`].
pub type ChannelFactory = Box<
    dyn Fn(&ConnectionTarget, &HostEntry, &AddressCandidate) -> Result<Box<dyn SecureChannel>, String>
        + Send,
>;

/// Pick the channel for one candidate. The error is a one-line diagnostic.
pub fn negotiate(
    target: &ConnectionTarget,
    entry: &HostEntry,
    candidate: &AddressCandidate,
) -> Result<Box<dyn SecureChannel>, String> {
    // local sockets are never encrypted
    if !target.sslmode.requires_tls() || candidate.is_local() {
        return Ok(Box::new(PlainChannel));
    }

    #[cfg(feature = "tls")]
    {
        tls::TlsChannel::new(target, entry.display_name())
            .map(|c| Box::new(c) as Box<dyn SecureChannel>)
    }
    #[cfg(not(feature = "tls"))]
    {
        let _ = entry;
        Err(format!(
            "sslmode value \"{}\" invalid when TLS support is not compiled in",
            target.sslmode.as_str()
        ))
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS over rustls' sans-io client connection.

    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::sync::Arc;

    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore};
    use socket2::Socket;

    use super::{HandshakeStatus, SecureChannel};
    use crate::conninfo::ConnectionTarget;
    use crate::socket;

    struct SocketIo<'a>(&'a Socket);

    impl Read for SocketIo<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            socket::recv(self.0, buf)
        }
    }

    impl Write for SocketIo<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            socket::send(self.0, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub struct TlsChannel {
        conn: ClientConnection,
        reason: Option<String>,
    }

    fn load_roots(target: &ConnectionTarget) -> Result<RootCertStore, String> {
        let path = target
            .sslrootcert
            .as_ref()
            .ok_or_else(|| "root certificate file not specified (sslrootcert)".to_string())?;
        let file = File::open(path).map_err(|e| {
            format!("could not read root certificate file \"{}\": {}", path.display(), e)
        })?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|e| {
                format!("could not parse root certificate file \"{}\": {}", path.display(), e)
            })?;
            roots.add(cert).map_err(|e| format!("invalid root certificate: {}", e))?;
        }
        if roots.is_empty() {
            return Err(format!("no certificates found in \"{}\"", path.display()));
        }
        Ok(roots)
    }

    impl TlsChannel {
        pub fn new(target: &ConnectionTarget, host: &str) -> Result<Self, String> {
            let roots = load_roots(target)?;
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| format!("could not configure TLS: {}", e))?
                .with_root_certificates(roots)
                .with_no_client_auth();
            let name = ServerName::try_from(host.to_string())
                .map_err(|e| format!("invalid server name \"{}\": {}", host, e))?;
            let conn = ClientConnection::new(Arc::new(config), name)
                .map_err(|e| format!("could not start TLS session: {}", e))?;
            Ok(TlsChannel { conn, reason: None })
        }

        fn fail(&mut self, reason: String) -> HandshakeStatus {
            self.reason = Some(reason);
            HandshakeStatus::Failed
        }
    }

    impl SecureChannel for TlsChannel {
        fn name(&self) -> &'static str {
            "tls"
        }

        fn poll_handshake(&mut self, socket: &Socket) -> HandshakeStatus {
            loop {
                if self.conn.wants_write() {
                    match self.conn.write_tls(&mut SocketIo(socket)) {
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return HandshakeStatus::WantWrite
                        }
                        Err(e) => return self.fail(format!("TLS handshake write failed: {}", e)),
                    }
                }
                if !self.conn.is_handshaking() {
                    return HandshakeStatus::Complete;
                }
                match self.conn.read_tls(&mut SocketIo(socket)) {
                    Ok(0) => {
                        return self
                            .fail("server closed the connection during the TLS handshake".into())
                    }
                    Ok(_) => {
                        if let Err(e) = self.conn.process_new_packets() {
                            // best effort: deliver the alert
                            let _ = self.conn.write_tls(&mut SocketIo(socket));
                            return self.fail(format!("TLS error: {}", e));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::WantRead
                    }
                    Err(e) => return self.fail(format!("TLS handshake read failed: {}", e)),
                }
            }
        }

        fn failure_reason(&self) -> Option<&str> {
            self.reason.as_deref()
        }

        fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match self.conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        match self.conn.read_tls(&mut SocketIo(socket))? {
                            0 => return Ok(0),
                            _ => {
                                self.conn
                                    .process_new_packets()
                                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                            }
                        }
                    }
                    // peer went away without close_notify
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
        }

        fn write(&mut self, socket: &Socket, buf: &[u8]) -> io::Result<usize> {
            self.flush(socket)?;
            let n = self.conn.writer().write(buf)?;
            match self.flush(socket) {
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
                _ => Ok(n),
            }
        }

        fn flush(&mut self, socket: &Socket) -> io::Result<()> {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut SocketIo(socket)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

}
