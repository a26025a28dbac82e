//! Growable byte/text buffer with an explicit "broken" state.
//!
//! An [`ExpandableBuffer`] is used wherever data is accumulated piecewise:
//! diagnostic text for a connection attempt, scratch space, connection-string
//! assembly. When an allocation fails the buffer becomes *broken*: every
//! further append is silently ignored, so accumulation-style callers check
//! [`ExpandableBuffer::is_broken`] once at the end instead of a return code on
//! every append.

use std::borrow::Cow;
use std::fmt;

/// Capacity of a freshly created or revived buffer.
pub const INITIAL_SIZE: usize = 256;

/// Largest capacity a buffer may grow to.
pub const MAX_SIZE: usize = i32::MAX as usize;

/// Growable byte container that keeps its content NUL-terminated.
///
/// Invariant: when not broken, `len() < capacity()`; the byte after the
/// content is always a NUL terminator.
pub struct ExpandableBuffer {
    // content followed by one NUL; empty when broken
    data: Vec<u8>,
    // 0 means broken
    maxlen: usize,
}

impl ExpandableBuffer {
    /// Create an empty buffer of [`INITIAL_SIZE`] capacity.
    ///
    /// The result is broken if even the initial allocation fails.
    pub fn new() -> Self {
        let mut buf = ExpandableBuffer {
            data: Vec::new(),
            maxlen: 0,
        };
        buf.revive();
        buf
    }

    fn revive(&mut self) {
        let mut data = Vec::new();
        if data.try_reserve_exact(INITIAL_SIZE).is_ok() {
            data.push(0);
            self.data = data;
            self.maxlen = INITIAL_SIZE;
        } else {
            self.mark_broken();
        }
    }

    fn mark_broken(&mut self) {
        self.data = Vec::new();
        self.maxlen = 0;
    }

    pub fn is_broken(&self) -> bool {
        self.maxlen == 0
    }

    pub fn len(&self) -> usize {
        self.data.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.maxlen
    }

    /// Truncate to empty. A broken buffer is revived if memory allows.
    pub fn reset(&mut self) {
        if self.is_broken() {
            self.revive();
        } else {
            self.data.clear();
            self.data.push(0);
        }
    }

    /// Release the storage. The buffer stays broken until the next
    /// [`ExpandableBuffer::reset`].
    pub fn destroy(&mut self) {
        self.mark_broken();
    }

    /// Make room for `extra` more bytes plus the terminator.
    ///
    /// Returns `false` and breaks the buffer when the request cannot be
    /// satisfied, including sizes near the representable maximum.
    pub fn ensure_capacity(&mut self, extra: usize) -> bool {
        if self.is_broken() {
            return false;
        }

        let len = self.len();
        // would overflow the size computations below
        if extra >= MAX_SIZE - len {
            self.mark_broken();
            return false;
        }

        let needed = extra + len + 1;
        if needed <= self.maxlen {
            return true;
        }

        let mut newlen = if self.maxlen > 0 { 2 * self.maxlen } else { 64 };
        while needed > newlen {
            newlen *= 2;
        }
        if newlen > MAX_SIZE {
            newlen = MAX_SIZE;
        }

        match self.data.try_reserve_exact(newlen - self.data.len()) {
            Ok(()) => {
                log::trace!("expandable buffer grown from {} to {}", self.maxlen, newlen);
                self.maxlen = newlen;
                true
            }
            Err(_) => {
                self.mark_broken();
                false
            }
        }
    }

    /// Append formatted text, enlarging the buffer as often as the output
    /// requires.
    pub fn append_formatted(&mut self, args: fmt::Arguments<'_>) {
        if self.is_broken() {
            return;
        }
        let _ = fmt::Write::write_fmt(self, args);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append_bytes(s.as_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        if !self.ensure_capacity(bytes.len()) {
            return;
        }
        self.data.pop();
        self.data.extend_from_slice(bytes);
        self.data.push(0);
    }

    pub fn append_char(&mut self, c: char) {
        let mut tmp = [0u8; 4];
        self.append_bytes(c.encode_utf8(&mut tmp).as_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Content including the trailing NUL. A broken buffer yields a lone
    /// terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        if self.is_broken() {
            &[0]
        } else {
            &self.data
        }
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl Default for ExpandableBuffer {
    fn default() -> Self {
        ExpandableBuffer::new()
    }
}

impl fmt::Write for ExpandableBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s);
        if self.is_broken() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ExpandableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broken() {
            f.write_str("ExpandableBuffer(<broken>)")
        } else {
            f.debug_tuple("ExpandableBuffer").field(&self.as_str()).finish()
        }
    }
}
