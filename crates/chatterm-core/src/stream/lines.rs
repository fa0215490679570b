//! Line Reassembler
//!
//! Turns arbitrarily split chunks into complete lines. The undelimited tail
//! stays inside the reassembler until its newline arrives.

pub struct LineReassembler {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to contain no `\n`
    scanned: usize,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Append a chunk and return every line it completed, delimiters
    /// (`\n` or `\r\n`) trimmed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.buf[start..end];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            search_from = start;
        }

        if start > 0 {
            self.buf.drain(..start);
        }
        self.scanned = self.buf.len();
        lines
    }

    /// Length in bytes of the retained fragment.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop the retained fragment without emitting it.
    pub fn discard(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new()
    }
}
