//! Message I/O: framing into the output buffer, the send loop with its
//! write-failure deferral, and the receive path with cursor-based decoding.
//!
//! Outbound, a frame is `[tag] [int32 length] [payload]` where the length
//! counts itself and the payload but not the tag. Complete frames are
//! batched and only written once [`SEND_THRESHOLD`] bytes accumulated or
//! on [`Connection::flush`].
//!
//! Inbound, callers decode at a cursor with the `get_*` functions and call
//! [`Connection::consume`] once a whole logical unit parsed. Any
//! [`Shortfall`] leaves the consumed mark untouched, so the caller can
//! [`Connection::rewind`], read more data and try again.

use std::io;

use chainerror::*;

use super::Connection;
use crate::buffer::MAX_SIZE;
use crate::error::*;
use crate::poll::Interest;

/// Complete frames are written once this many bytes are queued.
pub const SEND_THRESHOLD: usize = 8192;

/// Minimum free space in the input buffer before a read.
const READ_HEADROOM: usize = 8192;

/// Keep reading without returning while this much is buffered.
const READ_AHEAD: usize = 32768;

const GROW_STEP: usize = 8192;

mod sealed {
    pub trait Sealed {}
}

/// Integers with a wire encoding: 2 or 4 bytes, network byte order.
pub trait WireInt: sealed::Sealed + Copy {
    const SIZE: usize;

    fn put(self, out: &mut Vec<u8>);

    /// Decode from the first `SIZE` bytes of `bytes`.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! wire_int {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}

            impl WireInt for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                fn get(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_be_bytes(raw)
                }
            }
        )*
    };
}

wire_int!(u16, i16, u32, i32);

/// Why a `get_*` call could not produce a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shortfall {
    /// Nothing left after the cursor.
    Exhausted,
    /// Some bytes are there, but not the whole value yet.
    Incomplete,
}

pub type Fetch<T> = std::result::Result<T, Shortfall>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    Done,
    /// Non-blocking only: data is still queued, wait for writability and
    /// flush again.
    Pending,
}

/// Capacity to grow to so that `needed` bytes fit: doubling, then fixed
/// steps once doubling would pass [`MAX_SIZE`].
fn grown_size(current: usize, needed: usize) -> Option<usize> {
    if needed > MAX_SIZE {
        return None;
    }
    let mut size = current.max(1);
    while size < needed {
        match size.checked_mul(2) {
            Some(doubled) if doubled <= MAX_SIZE => size = doubled,
            _ => break,
        }
    }
    while size < needed {
        size = size.checked_add(GROW_STEP)?;
    }
    Some(size.min(MAX_SIZE))
}

impl Connection {
    fn ensure_output(&mut self, extra: usize) -> Result<()> {
        let needed = self
            .out_buf
            .len()
            .checked_add(extra)
            .ok_or_else(|| cherr!(ErrorKind::OutOfMemory))?;
        if needed <= self.out_buf.capacity() {
            return Ok(());
        }
        let size = grown_size(self.out_buf.capacity(), needed)
            .ok_or_else(|| cherr!(ErrorKind::OutOfMemory))?;
        self.out_buf
            .try_reserve_exact(size - self.out_buf.len())
            .map_err(|_| cherr!(ErrorKind::OutOfMemory))?;
        log::trace!("output buffer grown to {}", self.out_buf.capacity());
        Ok(())
    }

    /// Start a frame. `None` omits the tag; only the startup frame does.
    ///
    /// An unfinished frame is dropped.
    pub fn begin_message(&mut self, tag: Option<u8>) -> Result<()> {
        self.out_buf.truncate(self.out_ready);
        self.ensure_output(5)?;
        if let Some(tag) = tag {
            self.out_buf.push(tag);
        }
        self.out_msg_start = Some(self.out_buf.len());
        self.out_buf.extend_from_slice(&[0; 4]);
        Ok(())
    }

    fn message_started(&self) -> Result<()> {
        match self.out_msg_start {
            Some(_) => Ok(()),
            None => Err(cherr!(ErrorKind::Protocol(
                "no message in progress".to_string()
            ))),
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.message_started()?;
        self.ensure_output(bytes.len())?;
        self.out_buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.put_bytes(&[byte])
    }

    /// Append `s` and its NUL terminator.
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(cherr!(ErrorKind::InvalidParameter(s.to_string())));
        }
        self.message_started()?;
        self.ensure_output(s.len() + 1)?;
        self.out_buf.extend_from_slice(s.as_bytes());
        self.out_buf.push(0);
        Ok(())
    }

    pub fn put_int<I: WireInt>(&mut self, value: I) -> Result<()> {
        self.message_started()?;
        self.ensure_output(I::SIZE)?;
        value.put(&mut self.out_buf);
        Ok(())
    }

    /// Finish the frame: patch in its length and queue it for sending.
    pub fn end_message(&mut self) -> Result<()> {
        let start = self
            .out_msg_start
            .take()
            .ok_or_else(|| cherr!(ErrorKind::Protocol("no message in progress".to_string())))?;
        let length = self.out_buf.len() - start;
        let length = i32::try_from(length).map_err(|_| cherr!(ErrorKind::OutOfMemory))?;
        self.out_buf[start..start + 4].copy_from_slice(&length.to_be_bytes());
        self.out_ready = self.out_buf.len();

        if self.out_ready >= SEND_THRESHOLD {
            let batch = self.out_ready - self.out_ready % SEND_THRESHOLD;
            self.send_some(batch)?;
        }
        Ok(())
    }

    /// Complete frames waiting to be sent.
    pub fn pending_output(&self) -> &[u8] {
        &self.out_buf[..self.out_ready]
    }

    /// Send everything queued.
    pub fn flush(&mut self) -> Result<FlushStatus> {
        if self.out_ready > 0 && self.send_some(self.out_ready)? == FlushStatus::Pending {
            return Ok(FlushStatus::Pending);
        }
        if self.write_failed {
            return Ok(FlushStatus::Done);
        }
        loop {
            let flushed = match self.transport.as_mut() {
                Some(t) => t.channel.flush(&t.socket),
                None => return Err(cherr!(ErrorKind::NotConnected)),
            };
            match flushed {
                Ok(()) => return Ok(FlushStatus::Done),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.nonblocking {
                        return Ok(FlushStatus::Pending);
                    }
                    self.wait(Interest::Write, None)?;
                }
                Err(e) => {
                    self.record_write_failure(&e);
                    return Ok(FlushStatus::Done);
                }
            }
        }
    }

    /// Drop the first `n` queued bytes.
    fn discard_output(&mut self, n: usize) {
        self.out_buf.drain(..n);
        self.out_ready -= n;
        if let Some(start) = self.out_msg_start.as_mut() {
            *start -= n;
        }
    }

    fn record_write_failure(&mut self, e: &io::Error) {
        self.write_failed = true;
        if self.write_error.is_none() {
            self.write_error = Some(format!("could not send data to server: {}", e));
        }
        log::warn!("write failed, reporting deferred until read side is drained: {}", e);
    }

    /// Write the first `len` queued bytes.
    ///
    /// While the socket cannot take more, pending input is read first so
    /// that a peer blocked on its own send can make progress. A hard write
    /// error is recorded and the queued data discarded, but the call still
    /// succeeds: what the peer sent before it went away is more useful to
    /// the caller, and [`Connection::write_error`] keeps the reason.
    fn send_some(&mut self, mut len: usize) -> Result<FlushStatus> {
        if self.write_failed {
            self.discard_output(self.out_ready);
            return Ok(FlushStatus::Done);
        }
        if self.transport.is_none() {
            return Err(cherr!(ErrorKind::NotConnected));
        }

        let mut sent = 0;
        while sent < len {
            let written = match self.transport.as_mut() {
                Some(t) => t.channel.write(&t.socket, &self.out_buf[sent..len]),
                None => return Err(cherr!(ErrorKind::NotConnected)),
            };
            match written {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "transport accepted no data");
                    self.record_write_failure(&e);
                    self.discard_output(self.out_ready);
                    return Ok(FlushStatus::Done);
                }
                Ok(n) => {
                    log::trace!("sent {} bytes", n);
                    sent += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.discard_output(sent);
                    len -= sent;
                    sent = 0;

                    self.read_data()?;
                    if self.nonblocking {
                        return Ok(FlushStatus::Pending);
                    }
                    self.wait(Interest::ReadWrite, None)?;
                }
                Err(e) => {
                    self.record_write_failure(&e);
                    self.discard_output(self.out_ready);
                    return Ok(FlushStatus::Done);
                }
            }
        }
        self.discard_output(sent);
        Ok(FlushStatus::Done)
    }

    /// Whether an earlier send failed. Later sends are discarded until
    /// the connection is reset.
    pub fn write_failed(&self) -> bool {
        self.write_failed
    }

    /// Reason of the deferred write failure, kept until reset.
    pub fn write_error(&self) -> Option<&str> {
        self.write_error.as_deref()
    }

    /// Make room for at least `extra` more bytes after `in_end`, moving
    /// unconsumed data to the front first.
    fn ensure_input(&mut self, extra: usize) -> Result<()> {
        if self.in_start > 0 {
            self.in_buf.copy_within(self.in_start..self.in_end, 0);
            self.in_end -= self.in_start;
            self.in_cursor -= self.in_start;
            self.in_start = 0;
        }
        let needed = self
            .in_end
            .checked_add(extra)
            .ok_or_else(|| cherr!(ErrorKind::OutOfMemory))?;
        if needed <= self.in_buf.len() {
            return Ok(());
        }
        let size = grown_size(self.in_buf.len(), needed)
            .ok_or_else(|| cherr!(ErrorKind::OutOfMemory))?;
        self.in_buf
            .try_reserve_exact(size - self.in_buf.len())
            .map_err(|_| cherr!(ErrorKind::OutOfMemory))?;
        self.in_buf.resize(size, 0);
        log::trace!("input buffer grown to {}", size);
        Ok(())
    }

    /// Read whatever the socket has. `Ok(0)` means nothing was available.
    ///
    /// The peer closing the connection is an error; the connection is
    /// dropped but the data already buffered stays decodable.
    pub fn read_data(&mut self) -> Result<usize> {
        if self.transport.is_none() {
            return Err(cherr!(ErrorKind::NotConnected));
        }
        if let Err(e) = self.ensure_input(READ_HEADROOM) {
            // keep going with whatever room is left
            if self.in_end >= self.in_buf.len() {
                return Err(e);
            }
        }

        let mut total = 0;
        loop {
            let read = match self.transport.as_mut() {
                Some(t) => t.channel.read(&t.socket, &mut self.in_buf[self.in_end..]),
                None => return Err(cherr!(ErrorKind::NotConnected)),
            };
            match read {
                Ok(0) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    log::debug!("server closed the connection");
                    self.close_socket();
                    self.status = super::ConnectionStatus::Failed;
                    return Err(cherr!(ErrorKind::ConnectionClosed));
                }
                Ok(n) => {
                    log::trace!("received {} bytes", n);
                    self.in_end += n;
                    total += n;
                    let buffered = self.in_end - self.in_start;
                    let headroom = self.in_buf.len() - self.in_end;
                    if !(buffered > READ_AHEAD && headroom >= READ_HEADROOM) {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => {
                    let e = ErrorKind::chain_error_from(e, Some((line!(), file!())));
                    if let ErrorKind::ConnectionClosed = e.kind() {
                        self.close_socket();
                        self.status = super::ConnectionStatus::Failed;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Bytes after the cursor.
    pub fn available(&self) -> usize {
        self.in_end - self.in_cursor
    }

    fn take_input(&mut self, n: usize) -> Fetch<usize> {
        match self.available() {
            0 if n > 0 => Err(Shortfall::Exhausted),
            left if left < n => Err(Shortfall::Incomplete),
            _ => {
                let at = self.in_cursor;
                self.in_cursor += n;
                Ok(at)
            }
        }
    }

    pub fn get_byte(&mut self) -> Fetch<u8> {
        let at = self.take_input(1)?;
        Ok(self.in_buf[at])
    }

    pub fn get_int<I: WireInt>(&mut self) -> Fetch<I> {
        let at = self.take_input(I::SIZE)?;
        Ok(I::get(&self.in_buf[at..]))
    }

    pub fn get_bytes(&mut self, n: usize) -> Fetch<&[u8]> {
        let at = self.take_input(n)?;
        Ok(&self.in_buf[at..at + n])
    }

    /// Read a NUL-terminated string, without the terminator.
    pub fn get_string(&mut self) -> Fetch<String> {
        if self.available() == 0 {
            return Err(Shortfall::Exhausted);
        }
        let rest = &self.in_buf[self.in_cursor..self.in_end];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Shortfall::Incomplete)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.in_cursor += nul + 1;
        Ok(s)
    }

    /// Mark everything before the cursor as consumed.
    pub fn consume(&mut self) {
        self.in_start = self.in_cursor;
        if self.in_start == self.in_end {
            self.in_start = 0;
            self.in_cursor = 0;
            self.in_end = 0;
        }
    }

    /// Move the cursor back to the first unconsumed byte.
    pub fn rewind(&mut self) {
        self.in_cursor = self.in_start;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::security::{HandshakeStatus, SecureChannel};
    use socket2::Socket;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Channel writing at most `chunk` bytes per call and failing all
    /// writes once `fail` is set.
    struct Trickle {
        chunk: usize,
        fail: Arc<AtomicBool>,
    }

    impl SecureChannel for Trickle {
        fn name(&self) -> &'static str {
            "trickle"
        }

        fn poll_handshake(&mut self, _socket: &Socket) -> HandshakeStatus {
            HandshakeStatus::Complete
        }

        fn failure_reason(&self) -> Option<&str> {
            None
        }

        fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
            crate::socket::recv(socket, buf)
        }

        fn write(&mut self, socket: &Socket, buf: &[u8]) -> io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            let n = buf.len().min(self.chunk);
            crate::socket::send(socket, &buf[..n])
        }
    }

    fn trickle_pair(chunk: usize) -> (Connection, UnixStream, Arc<AtomicBool>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let fail = Arc::new(AtomicBool::new(false));
        let channel = Trickle {
            chunk,
            fail: fail.clone(),
        };
        let conn = Connection::from_transport(Socket::from(ours), Box::new(channel)).unwrap();
        (conn, theirs, fail)
    }

    #[test]
    fn frame_layout() {
        let mut conn = Connection::new();
        conn.begin_message(Some(5)).unwrap();
        conn.put_bytes(b"hi").unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.pending_output(), &[5, 0, 0, 0, 6, b'h', b'i']);

        conn.begin_message(None).unwrap();
        conn.put_int(0x0102u16).unwrap();
        conn.put_int(-2i32).unwrap();
        conn.put_string("ab").unwrap();
        conn.end_message().unwrap();
        assert_eq!(
            &conn.pending_output()[7..],
            &[0, 0, 0, 13, 1, 2, 0xff, 0xff, 0xff, 0xfe, b'a', b'b', 0]
        );
    }

    #[test]
    fn put_without_message() {
        let mut conn = Connection::new();
        assert!(conn.put_byte(1).is_err());
        assert!(conn.end_message().is_err());
        conn.begin_message(Some(b'Q')).unwrap();
        assert!(conn.put_string("a\0b").is_err());
    }

    #[test]
    fn unfinished_message_not_sent() {
        let mut conn = Connection::new();
        conn.begin_message(Some(1)).unwrap();
        conn.end_message().unwrap();
        conn.begin_message(Some(2)).unwrap();
        conn.put_bytes(b"partial").unwrap();
        assert_eq!(conn.pending_output(), &[1, 0, 0, 0, 4]);
        conn.begin_message(Some(3)).unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.pending_output(), &[1, 0, 0, 0, 4, 3, 0, 0, 0, 4]);
    }

    #[test]
    fn partial_writes_deliver_everything_in_order() {
        let (mut conn, mut peer, _) = trickle_pair(100);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let reader = thread::spawn(move || {
            let mut got = vec![0u8; 5 + 10_000];
            peer.read_exact(&mut got).unwrap();
            got
        });

        conn.begin_message(Some(b'D')).unwrap();
        conn.put_bytes(&payload).unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);
        assert!(conn.pending_output().is_empty());

        let got = reader.join().unwrap();
        assert_eq!(got[0], b'D');
        assert_eq!(i32::get(&got[1..]), 10_004);
        assert_eq!(&got[5..], &payload[..]);
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
    }

    #[test]
    fn nonblocking_flush_resumes_where_it_stopped() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        conn.set_nonblocking(true);
        // far more than a local socket buffers
        let first = pattern(1 << 20, 0);
        let second = pattern(3000, 0x5a);

        conn.begin_message(Some(b'D')).unwrap();
        conn.put_bytes(&first).unwrap();
        conn.end_message().unwrap();
        conn.begin_message(Some(b'E')).unwrap();
        conn.put_bytes(&second).unwrap();
        conn.end_message().unwrap();

        assert_eq!(conn.flush().unwrap(), FlushStatus::Pending);
        assert!(!conn.pending_output().is_empty());
        assert!(!conn.write_failed());

        let total = 5 + first.len() + 5 + second.len();
        let reader = thread::spawn(move || {
            let mut got = vec![0u8; total];
            peer.read_exact(&mut got).unwrap();
            got
        });

        let mut rounds = 0;
        while conn.flush().unwrap() == FlushStatus::Pending {
            conn.wait(Interest::Write, None).unwrap();
            rounds += 1;
        }
        assert!(rounds > 0);
        assert!(conn.pending_output().is_empty());

        let got = reader.join().unwrap();
        assert_eq!(got[0], b'D');
        assert_eq!(i32::get(&got[1..]) as usize, 4 + first.len());
        assert_eq!(&got[5..5 + first.len()], &first[..]);
        let rest = &got[5 + first.len()..];
        assert_eq!(rest[0], b'E');
        assert_eq!(i32::get(&rest[1..]) as usize, 4 + second.len());
        assert_eq!(&rest[5..], &second[..]);
    }

    #[test]
    fn both_sides_sending_do_not_deadlock() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        let ours = pattern(512 * 1024, 0x11);
        let theirs = pattern(512 * 1024, 0x22);

        // the peer writes everything before it reads a single byte
        let expected = theirs.clone();
        let outgoing = ours.len();
        let peer_side = thread::spawn(move || {
            peer.write_all(&expected).unwrap();
            let mut got = vec![0u8; 5 + outgoing];
            peer.read_exact(&mut got).unwrap();
            got
        });

        conn.begin_message(Some(b'D')).unwrap();
        conn.put_bytes(&ours).unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);

        while conn.available() < theirs.len() {
            conn.wait(Interest::Read, None).unwrap();
            conn.read_data().unwrap();
        }
        assert_eq!(conn.get_bytes(theirs.len()), Ok(&theirs[..]));

        let got = peer_side.join().unwrap();
        assert_eq!(got[0], b'D');
        assert_eq!(&got[5..], &ours[..]);
    }

    #[test]
    fn small_messages_wait_for_flush() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        peer.set_nonblocking(true).unwrap();
        conn.begin_message(Some(b'S')).unwrap();
        conn.end_message().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            peer.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        conn.flush().unwrap();
        peer.set_nonblocking(false).unwrap();
        assert_eq!(peer.read(&mut buf).unwrap(), 5);
    }

    #[test]
    fn large_batches_go_out_without_flush() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        conn.begin_message(Some(b'B')).unwrap();
        conn.put_bytes(&[7u8; SEND_THRESHOLD + 100]).unwrap();
        conn.end_message().unwrap();
        // whole 8 KiB blocks are sent, the tail waits
        assert_eq!(conn.pending_output().len(), 5 + 100);
        let mut got = vec![0u8; SEND_THRESHOLD];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got[0], b'B');
    }

    #[test]
    fn write_failure_is_deferred() {
        let (mut conn, _peer, fail) = trickle_pair(usize::MAX);
        fail.store(true, Ordering::SeqCst);

        conn.begin_message(Some(b'Q')).unwrap();
        conn.put_string("status").unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);
        assert!(conn.write_failed());
        let reason = conn.write_error().unwrap().to_string();
        assert!(reason.contains("peer gone"));

        // later sends succeed without transmitting
        fail.store(false, Ordering::SeqCst);
        conn.begin_message(Some(b'Q')).unwrap();
        conn.put_bytes(&[0u8; 20_000]).unwrap();
        conn.end_message().unwrap();
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);
        assert!(conn.pending_output().is_empty());
        assert_eq!(conn.write_error(), Some(reason.as_str()));
    }

    #[test]
    fn cursor_decoding_and_consume() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        peer.write_all(&[b'C', 0, 0, 0, 8]).unwrap();
        peer.write_all(b"ok").unwrap();

        while conn.available() < 7 {
            conn.wait(Interest::Read, None).unwrap();
            conn.read_data().unwrap();
        }
        assert_eq!(conn.get_byte(), Ok(b'C'));
        assert_eq!(conn.get_int::<i32>(), Ok(8));
        assert_eq!(conn.get_string(), Err(Shortfall::Incomplete));
        conn.rewind();
        assert_eq!(conn.available(), 7);

        peer.write_all(b"\0!").unwrap();
        while conn.available() < 9 {
            conn.wait(Interest::Read, None).unwrap();
            conn.read_data().unwrap();
        }
        conn.get_bytes(5).unwrap();
        assert_eq!(conn.get_string().as_deref(), Ok("ok"));
        conn.consume();
        assert_eq!(conn.get_bytes(1), Ok(&b"!"[..]));
        assert_eq!(conn.get_byte(), Err(Shortfall::Exhausted));
        assert_eq!(conn.get_int::<u16>(), Err(Shortfall::Exhausted));
        conn.consume();
        assert_eq!(conn.available(), 0);
    }

    #[test]
    fn nothing_to_read_is_not_an_error() {
        let (mut conn, _peer, _) = trickle_pair(usize::MAX);
        assert_eq!(conn.read_data().unwrap(), 0);
    }

    #[test]
    fn peer_close_is_fatal() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        peer.write_all(b"xyz").unwrap();
        drop(peer);
        while conn.available() < 3 {
            conn.wait(Interest::Read, None).unwrap();
            conn.read_data().unwrap();
        }
        let e = conn.read_data().unwrap_err();
        assert_eq!(e.kind(), &ErrorKind::ConnectionClosed);
        assert_eq!(conn.status(), ConnectionStatus::Failed);
        // what arrived before the close is still there
        assert_eq!(conn.get_bytes(3), Ok(&b"xyz"[..]));
    }

    #[test]
    fn input_grows_for_large_frames() {
        let (mut conn, mut peer, _) = trickle_pair(usize::MAX);
        let writer = thread::spawn(move || {
            peer.write_all(&vec![9u8; 100_000]).unwrap();
            peer
        });
        let mut received = 0;
        while received < 100_000 {
            conn.wait(Interest::Read, None).unwrap();
            received += conn.read_data().unwrap();
        }
        let _peer = writer.join().unwrap();
        assert_eq!(conn.get_bytes(100_000).map(|b| b.len()), Ok(100_000));
    }

    #[test]
    fn growth_policy() {
        assert_eq!(grown_size(16, 17), Some(32));
        assert_eq!(grown_size(16384, 100_000), Some(131_072));
        assert_eq!(grown_size(MAX_SIZE - 100, MAX_SIZE - 50), Some(MAX_SIZE));
        assert_eq!(grown_size(0, MAX_SIZE + 1), None);
    }
}
