//! Client side of the agent protocol.

use chainerror::*;

use crate::command::CommandRequest;
use crate::connection::Connection;
use crate::conninfo::ConnectionParameters;
use crate::error::*;
use crate::poll::Interest;
use crate::protocol::{self, tag, FrameReader, MAX_FRAME_LEN};

/// A session with one agent: connected, started up and authenticated.
#[derive(Debug)]
pub struct AgentClient {
    conn: Connection,
}

impl AgentClient {
    pub fn connect(params: &ConnectionParameters) -> Result<Self> {
        AgentClient::from_connection(Connection::connect(params)?)
    }

    pub fn connect_str(conninfo: &str) -> Result<Self> {
        AgentClient::connect(&ConnectionParameters::parse(conninfo)?)
    }

    /// Run the startup exchange on an established connection.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let mut client = AgentClient { conn };
        client.startup()?;
        Ok(client)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn startup(&mut self) -> Result<()> {
        let mut pairs = Vec::new();
        if let Some(target) = self.conn.target() {
            let options = [
                ("user", &target.user),
                ("dbname", &target.dbname),
                ("options", &target.options),
                ("application_name", &target.application_name),
                ("client_encoding", &target.client_encoding),
            ];
            for (key, value) in options {
                if let Some(value) = value {
                    pairs.push((key, value.clone()));
                }
            }
        }

        self.conn.begin_message(None)?;
        self.conn.put_int(protocol::PROTOCOL_VERSION)?;
        for (key, value) in &pairs {
            self.conn.put_string(key)?;
            self.conn.put_string(value)?;
        }
        self.conn.put_byte(0)?;
        self.conn.end_message()?;
        self.conn.flush()?;

        loop {
            let (tag, payload) = self.read_frame()?;
            let mut reader = FrameReader::new(&payload);
            match tag {
                tag::AUTHENTICATION => match reader.read_int32() {
                    Some(protocol::AUTH_OK) => log::debug!("authenticated"),
                    Some(protocol::AUTH_PASSWORD) => self.send_password()?,
                    Some(code) => {
                        return Err(cherr!(ErrorKind::Authentication(format!(
                            "authentication method {} not supported",
                            code
                        ))))
                    }
                    None => {
                        return Err(cherr!(ErrorKind::Protocol(
                            "authentication request without a code".to_string()
                        )))
                    }
                },
                tag::ERROR => {
                    return Err(cherr!(ErrorKind::Authentication(
                        reader.read_string().unwrap_or_default()
                    )))
                }
                tag::READY => return Ok(()),
                other => {
                    return Err(cherr!(ErrorKind::Protocol(format!(
                        "unexpected message type 0x{:02x} during startup",
                        other
                    ))))
                }
            }
        }
    }

    fn send_password(&mut self) -> Result<()> {
        let password = self
            .conn
            .host()
            .and_then(|h| h.password.clone())
            .ok_or_else(|| {
                cherr!(ErrorKind::Authentication(
                    "password requested but none supplied".to_string()
                ))
            })?;
        self.conn.begin_message(Some(tag::PASSWORD))?;
        self.conn.put_string(&password)?;
        self.conn.end_message()?;
        self.conn.flush()?;
        Ok(())
    }

    /// Frame at the cursor, if all of it is buffered.
    fn parse_buffered(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let tag = match self.conn.get_byte() {
            Ok(tag) => tag,
            Err(_) => return Ok(None),
        };
        let length = match self.conn.get_int::<i32>() {
            Ok(length) => length,
            Err(_) => return Ok(None),
        };
        if length < 4 || length as usize > MAX_FRAME_LEN {
            return Err(cherr!(ErrorKind::Protocol(format!(
                "invalid length {} in message type 0x{:02x}",
                length, tag
            ))));
        }
        match self.conn.get_bytes(length as usize - 4) {
            Ok(payload) => Ok(Some((tag, payload.to_vec()))),
            Err(_) => Ok(None),
        }
    }

    fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        loop {
            self.conn.rewind();
            if let Some(frame) = self.parse_buffered()? {
                self.conn.consume();
                return Ok(frame);
            }

            if self.conn.socket_fd().is_none() {
                return Err(self.write_failure(cherr!(ErrorKind::ConnectionClosed)));
            }
            self.conn.wait(Interest::Read, None)?;
            match self.conn.read_data() {
                Ok(_) => {}
                Err(e) if *e.kind() == ErrorKind::ConnectionClosed => {
                    return Err(self.write_failure(e))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A peer that closed without answering: the failed write explains more.
    fn write_failure(&self, e: Error) -> Error {
        match self.conn.write_error() {
            Some(reason) => cherr!(e, ErrorKind::ConnectionFailed(reason.to_string())),
            None => e,
        }
    }

    /// Send `request` and wait for its result text.
    pub fn execute(&mut self, request: &CommandRequest) -> Result<String> {
        log::debug!("sending {} (opcode 0x{:02x})", request, request.opcode());
        request.encode(&mut self.conn)?;

        let (tag, payload) = self.read_frame()?;
        let text = FrameReader::new(&payload).read_string().unwrap_or_default();
        match tag {
            tag::COMPLETE => Ok(text),
            tag::ERROR => Err(cherr!(ErrorKind::Remote(text))),
            other => Err(cherr!(ErrorKind::Protocol(format!(
                "unexpected message type 0x{:02x} in reply to {}",
                other, request
            )))),
        }
    }

    /// Say goodbye and close the connection.
    pub fn close(mut self) {
        let terminated = self
            .conn
            .begin_message(Some(tag::TERMINATE))
            .and_then(|_| self.conn.end_message())
            .and_then(|_| self.conn.flush());
        if let Err(e) = terminated {
            log::debug!("terminate message not sent: {}", e);
        }
        self.conn.finish();
    }
}
