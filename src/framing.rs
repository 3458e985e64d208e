/// Accumulates raw bytes and hands out complete newline-terminated lines.
///
/// Bytes after the last `\n` stay buffered until a terminator arrives, so a
/// partial line is never surfaced.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its `\n` or a trailing `\r`.
    pub fn pop_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Number of buffered bytes not yet terminated.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
