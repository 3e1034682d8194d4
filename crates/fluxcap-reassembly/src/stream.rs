//! Stream reassembler & parser (C6, spec §4.4): a pull-based byte stream
//! per `(conntrack entry, direction)` with line, fixed-length and skip
//! extraction, plus the generic three-state text-protocol state machine
//! that line-oriented protocols (SIP) specialize.

#[derive(Debug, PartialEq, Eq)]
pub enum StreamError {
    /// Buffered data exceeded `max_line_len` without a delimiter. The
    /// direction's buffer is reset as a side effect (spec §4.4, §8
    /// invariant 9).
    LineTooLong,
    /// A previous error already marked this direction invalid; all
    /// further bytes are dropped until a new conntrack entry replaces it.
    AlreadyInvalid,
}

/// One direction's worth of buffered, not-yet-consumed bytes.
pub struct StreamParser {
    buffer: Vec<u8>,
    max_line_len: usize,
    invalid: bool,
}

impl StreamParser {
    pub fn new(max_line_len: usize) -> Self {
        StreamParser {
            buffer: Vec::new(),
            max_line_len,
            invalid: false,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Marks this direction invalid and discards anything buffered.
    /// Called on unparseable first lines or malformed headers (spec
    /// §4.4).
    pub fn mark_invalid(&mut self) {
        self.invalid = true;
        self.buffer.clear();
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.invalid {
            return;
        }
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Line mode: the next complete line delimited by CRLF or LF, with the
    /// delimiter stripped. `Ok(None)` means "not enough data yet".
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.invalid {
            return Err(StreamError::AlreadyInvalid);
        }

        if let Some((end, delim_len)) = find_line_end(&self.buffer) {
            let line = self.buffer[..end].to_vec();
            self.buffer.drain(..end + delim_len);
            return Ok(Some(line));
        }

        if self.buffer.len() > self.max_line_len {
            self.mark_invalid();
            return Err(StreamError::LineTooLong);
        }

        Ok(None)
    }

    /// Length mode: exactly `n` bytes, or `None` if not enough are
    /// buffered yet.
    pub fn next_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.invalid || self.buffer.len() < n {
            return None;
        }
        Some(self.buffer.drain(..n).collect())
    }

    /// Skip mode: consume `n` bytes without returning them.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.invalid || self.buffer.len() < n {
            return false;
        }
        self.buffer.drain(..n);
        true
    }
}

fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i] == b'\n' {
            if i > 0 && buf[i - 1] == b'\r' {
                return Some((i - 1, 2));
            }
            return Some((i, 1));
        }
    }
    None
}

/// Generic three-state machine driving a text protocol's direction (spec
/// §4.4): `FirstLine -> Headers -> Body`, then back to `FirstLine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextState {
    FirstLine,
    Headers,
    Body { remaining: usize },
}

impl Default for TextState {
    fn default() -> Self {
        TextState::FirstLine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_mode_splits_on_crlf_and_lf() {
        let mut sp = StreamParser::new(64);
        sp.feed(b"GET / HTTP/1.1\r\nHost: x\n");
        assert_eq!(sp.next_line().unwrap().unwrap(), b"GET / HTTP/1.1");
        assert_eq!(sp.next_line().unwrap().unwrap(), b"Host: x");
        assert_eq!(sp.next_line().unwrap(), None);
    }

    #[test]
    fn oversized_line_without_delimiter_fails_and_resets() {
        let mut sp = StreamParser::new(4);
        sp.feed(b"toolongline");
        let err = sp.next_line().unwrap_err();
        assert_eq!(err, StreamError::LineTooLong);
        assert!(sp.is_invalid());
        assert_eq!(sp.buffered_len(), 0);
    }

    #[test]
    fn invalid_direction_drops_further_bytes() {
        let mut sp = StreamParser::new(64);
        sp.mark_invalid();
        sp.feed(b"ignored");
        assert_eq!(sp.buffered_len(), 0);
        assert_eq!(sp.next_line(), Err(StreamError::AlreadyInvalid));
    }

    #[test]
    fn length_mode_waits_for_enough_bytes() {
        let mut sp = StreamParser::new(64);
        sp.feed(b"ab");
        assert_eq!(sp.next_exact(3), None);
        sp.feed(b"c");
        assert_eq!(sp.next_exact(3), Some(b"abc".to_vec()));
    }
}
