//! Line assembly for worker pipes.

use crate::util::truncate_front;

/// Splits raw pipe chunks into lines. Bytes after the last newline are
/// held until more data arrives or the stream ends.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// trailing `\n` or `\r\n`. Invalid UTF-8 is replaced, never fatal.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// The last `capacity` characters of a task's combined output, kept for
/// failure classification after exit.
#[derive(Debug, Clone)]
pub struct OutputTail {
    buf: String,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        // Trim lazily so long runs do not rescan on every line.
        if self.buf.len() > self.capacity * 2 {
            truncate_front(&mut self.buf, self.capacity);
        }
    }

    pub fn contents(&mut self) -> &str {
        truncate_front(&mut self.buf, self.capacity);
        &self.buf
    }
}
