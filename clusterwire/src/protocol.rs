//! Frame constants and side-effect-free frame parsing.
//!
//! On the wire a frame is an optional one-byte tag, a big-endian `i32`
//! length counting itself and the payload, then the payload. Only the
//! startup frame the client sends first is untagged.
//!
//! Control tags are ASCII letters; command frames use an opcode as the tag,
//! and opcodes always have the high bit set.

/// Version sent at the start of the startup frame.
pub const PROTOCOL_VERSION: i32 = 0x0001_0000;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub mod tag {
    /// Server: authentication request or result, `i32` code follows.
    pub const AUTHENTICATION: u8 = b'R';
    /// Client: password in answer to [`AUTH_PASSWORD`](super::AUTH_PASSWORD).
    pub const PASSWORD: u8 = b'p';
    /// Server: ready for commands.
    pub const READY: u8 = b'Z';
    /// Server: error text follows.
    pub const ERROR: u8 = b'E';
    /// Server: command completed, result text follows.
    pub const COMPLETE: u8 = b'C';
    /// Client: end of session.
    pub const TERMINATE: u8 = b'X';
}

/// Authentication code: no (further) authentication needed.
pub const AUTH_OK: i32 = 0;
/// Authentication code: send the password in clear text.
pub const AUTH_PASSWORD: i32 = 3;

/// Result of parsing one frame from the front of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A complete frame
    Complete {
        tag: Option<u8>,
        payload: Vec<u8>,
        /// Bytes of input the frame occupied
        consumed: usize,
    },
    /// More data is needed
    Incomplete {
        /// Additional bytes needed, if known (0 if not)
        needed: usize,
    },
    /// The buffer does not start with a valid frame
    Invalid { error: String },
}

/// Parse the frame at the start of `buf`.
///
/// `tagged` says whether the frame starts with a tag byte.
///
/// # Example
///
/// ```
/// use clusterwire::protocol::{parse_frame, ParseResult};
///
/// let buf = [b'C', 0, 0, 0, 7, b'o', b'k', 0];
/// match parse_frame(&buf, true) {
///     ParseResult::Complete { tag, payload, consumed } => {
///         assert_eq!(tag, Some(b'C'));
///         assert_eq!(payload, b"ok\0");
///         assert_eq!(consumed, buf.len());
///     }
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn parse_frame(buf: &[u8], tagged: bool) -> ParseResult {
    let header = if tagged { 5 } else { 4 };
    if buf.len() < header {
        return ParseResult::Incomplete {
            needed: header - buf.len(),
        };
    }
    let (tag, len_at) = if tagged { (Some(buf[0]), 1) } else { (None, 0) };
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[len_at..len_at + 4]);
    let length = i32::from_be_bytes(raw);
    if length < 4 || length as usize > MAX_FRAME_LEN {
        return ParseResult::Invalid {
            error: format!("invalid frame length {}", length),
        };
    }

    let total = len_at + length as usize;
    if buf.len() < total {
        return ParseResult::Incomplete {
            needed: total - buf.len(),
        };
    }
    ParseResult::Complete {
        tag,
        payload: buf[header..total].to_vec(),
        consumed: total,
    }
}

/// Append a frame to `out`.
pub fn encode_frame(out: &mut Vec<u8>, tag: Option<u8>, payload: &[u8]) {
    if let Some(tag) = tag {
        out.push(tag);
    }
    out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Cursor over a frame payload.
#[derive(Debug)]
pub struct FrameReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        FrameReader { payload, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.payload.len()
    }

    pub fn read_int32(&mut self) -> Option<i32> {
        let bytes = self.payload.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Some(i32::from_be_bytes(raw))
    }

    /// The next NUL-terminated string.
    pub fn read_string(&mut self) -> Option<String> {
        let rest = self.payload.get(self.pos..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        self.pos += nul + 1;
        Some(String::from_utf8_lossy(&rest[..nul]).into_owned())
    }
}

/// Payload of a startup frame: version, `key\0value\0` pairs and a final NUL.
pub fn startup_payload(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
    for (key, value) in pairs {
        payload.extend_from_slice(key.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    payload
}

/// Split a startup payload back into its version and pairs.
pub fn parse_startup(payload: &[u8]) -> Result<(i32, Vec<(String, String)>), String> {
    let mut reader = FrameReader::new(payload);
    let version = reader
        .read_int32()
        .ok_or_else(|| "startup packet too short".to_string())?;
    let mut pairs = Vec::new();
    loop {
        let key = reader
            .read_string()
            .ok_or_else(|| "startup packet is missing its terminator".to_string())?;
        if key.is_empty() {
            break;
        }
        let value = reader
            .read_string()
            .ok_or_else(|| format!("no value for startup parameter \"{}\"", key))?;
        pairs.push((key, value));
    }
    if !reader.is_empty() {
        return Err("trailing data after startup packet".to_string());
    }
    Ok((version, pairs))
}
