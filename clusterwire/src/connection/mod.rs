//! A connection to one agent.
//!
//! [`Connection`] owns the socket, the negotiated [`SecureChannel`], the
//! host/address cursor used while connecting, the input and output buffers
//! of the message engine and the accumulated diagnostics. Establishment is
//! driven by [`Connection::connect_poll`] (see `connect.rs`); framing and
//! the send/receive loops live in `message.rs`.

use std::fmt;
use std::time::Instant;

use chainerror::*;
use socket2::{SockAddr, Socket};

use crate::address::{AddressCandidate, PendingLookup};
use crate::buffer::ExpandableBuffer;
use crate::conninfo::{ConnectionTarget, HostEntry};
use crate::error::*;
use crate::poll::{self, Interest, RawFd, Readiness};
use crate::security::{ChannelFactory, SecureChannel};

mod connect;
mod message;

pub use self::message::{Fetch, FlushStatus, Shortfall, WireInt};

/// Initial size of both the input and the output buffer.
const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created, no attempt started.
    NeedsConnect,
    /// Trying hosts and addresses.
    Started,
    Established,
    Failed,
}

/// Outcome of one [`Connection::connect_poll`] step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectPoll {
    /// Wait for the socket to become ready as given, then poll again.
    Pending(Interest),
    Established,
    Failed,
}

// Steps of connection establishment. The cursor (host_index, addr_index)
// says which host and address the step applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    ResolveHost,
    Resolving,
    TryAddress,
    Connecting,
    Handshaking,
    Done,
}

/// The socket together with the channel negotiated over it.
pub(crate) struct Transport {
    socket: Socket,
    channel: Box<dyn SecureChannel>,
}

impl Transport {
    fn fd(&self) -> RawFd {
        poll::as_fd(&self.socket)
    }
}

pub struct Connection {
    target: Option<ConnectionTarget>,
    status: ConnectionStatus,
    phase: Phase,
    host_index: usize,
    addr_index: usize,
    addrs: Vec<AddressCandidate>,
    lookup: Option<PendingLookup>,
    attempt_deadline: Option<Instant>,
    channel_factory: Option<ChannelFactory>,
    transport: Option<Transport>,
    local_addr: Option<SockAddr>,
    nonblocking: bool,
    error_message: ExpandableBuffer,

    // input: [in_start, in_end) is unconsumed, in_cursor is the read position
    in_buf: Vec<u8>,
    in_start: usize,
    in_cursor: usize,
    in_end: usize,

    // output: [0, out_ready) is complete and may be sent; a message being
    // built runs from out_msg_start to the end of out_buf
    out_buf: Vec<u8>,
    out_ready: usize,
    out_msg_start: Option<usize>,

    write_failed: bool,
    write_error: Option<String>,
}

impl Connection {
    /// An unconnected connection with empty buffers.
    pub fn new() -> Self {
        Connection {
            target: None,
            status: ConnectionStatus::NeedsConnect,
            phase: Phase::Idle,
            host_index: 0,
            addr_index: 0,
            addrs: Vec::new(),
            lookup: None,
            attempt_deadline: None,
            channel_factory: None,
            transport: None,
            local_addr: None,
            nonblocking: false,
            error_message: ExpandableBuffer::new(),
            in_buf: vec![0; INITIAL_BUFFER_SIZE],
            in_start: 0,
            in_cursor: 0,
            in_end: 0,
            out_buf: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            out_ready: 0,
            out_msg_start: None,
            write_failed: false,
            write_error: None,
        }
    }

    /// Wrap a socket that is already connected, with `channel` already
    /// negotiated over it.
    pub fn from_transport(socket: Socket, channel: Box<dyn SecureChannel>) -> Result<Self> {
        socket.set_nonblocking(true).map_err(minto_cherr!())?;
        let mut conn = Connection::new();
        conn.local_addr = socket.local_addr().ok();
        conn.transport = Some(Transport { socket, channel });
        conn.status = ConnectionStatus::Established;
        conn.phase = Phase::Done;
        Ok(conn)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn target(&self) -> Option<&ConnectionTarget> {
        self.target.as_ref()
    }

    /// Diagnostics accumulated by the last connection attempt, one line per
    /// failed host or address.
    ///
    /// A broken buffer means memory ran out while recording them.
    pub fn error_message(&self) -> String {
        if self.error_message.is_broken() {
            return "out of memory\n".to_string();
        }
        self.error_message.as_str().into_owned()
    }

    pub(crate) fn append_error(&mut self, line: &str) {
        self.error_message.append_str(line);
        self.error_message.append_char('\n');
    }

    /// Descriptor to wait on, while a socket is open.
    ///
    /// While a host name is being looked up this is the lookup's wakeup
    /// descriptor, so event loops can wait on it for the readiness
    /// [`Connection::connect_poll`] asked for.
    pub fn socket_fd(&self) -> Option<RawFd> {
        match (&self.transport, &self.lookup) {
            (Some(transport), _) => Some(transport.fd()),
            (None, Some(lookup)) => Some(lookup.fd()),
            (None, None) => None,
        }
    }

    pub fn local_addr(&self) -> Option<&SockAddr> {
        self.local_addr.as_ref()
    }

    /// Name of the negotiated channel, once connected.
    pub fn channel_name(&self) -> Option<&'static str> {
        self.transport.as_ref().map(|t| t.channel.name())
    }

    /// Choose the channel for every address tried from now on, instead of
    /// deriving it from `sslmode`. An error fails that address only.
    pub fn set_channel_factory<F>(&mut self, factory: F)
    where
        F: Fn(
                &ConnectionTarget,
                &HostEntry,
                &AddressCandidate,
            ) -> std::result::Result<Box<dyn SecureChannel>, String>
            + Send
            + 'static,
    {
        self.channel_factory = Some(Box::new(factory));
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// In non-blocking mode sends that cannot complete return
    /// [`FlushStatus::Pending`] instead of waiting.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// Wait for the socket to become ready for `interest`.
    pub fn wait(&self, interest: Interest, deadline: Option<Instant>) -> Result<Readiness> {
        let fd = self.socket_fd().ok_or_else(|| cherr!(ErrorKind::NotConnected))?;
        poll::wait(fd, interest.wants_read(), interest.wants_write(), deadline)
            .map_err(minto_cherr!())
    }

    fn close_socket(&mut self) {
        if let Some(transport) = self.transport.take() {
            log::debug!(
                "closing {} connection on fd {}",
                transport.channel.name(),
                transport.fd()
            );
        }
    }

    /// Close the socket and release the buffers.
    pub fn finish(mut self) {
        self.close_socket();
    }

    /// Drop everything a previous session left behind: socket, buffered
    /// data, write-failure state and diagnostics.
    fn clear_session(&mut self) {
        self.close_socket();
        self.lookup = None;
        self.local_addr = None;
        self.in_start = 0;
        self.in_cursor = 0;
        self.in_end = 0;
        self.out_buf.clear();
        self.out_ready = 0;
        self.out_msg_start = None;
        self.write_failed = false;
        self.write_error = None;
        self.error_message.reset();
    }
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status)
            .field("phase", &self.phase)
            .field("host_index", &self.host_index)
            .field("addr_index", &self.addr_index)
            .field("fd", &self.socket_fd())
            .field("nonblocking", &self.nonblocking)
            .field("unconsumed", &(self.in_end - self.in_start))
            .field("queued", &self.out_buf.len())
            .field("write_failed", &self.write_failed)
            .finish()
    }
}
