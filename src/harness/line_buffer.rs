/// Splits a raw output byte stream into lines on `\n`, `\r\n` and bare `\r`.
///
/// Bytes are held until a terminator arrives so multi-byte UTF-8 sequences
/// split across reads decode intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_pending_bytes: Option<usize>,
    overflowed_bytes: usize,
    trailing_cr: bool,
}

impl LineBuffer {
    pub fn new(max_pending_bytes: Option<usize>) -> Self {
        Self {
            pending: Vec::new(),
            max_pending_bytes,
            overflowed_bytes: 0,
            trailing_cr: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.trailing_cr {
                self.trailing_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.trailing_cr = true;
                }
                _ => self.pending.push(byte),
            }
        }

        if let Some(max) = self.max_pending_bytes {
            if self.pending.len() > max {
                let excess = self.pending.len() - max;
                self.pending.drain(..excess);
                self.overflowed_bytes = self.overflowed_bytes.saturating_add(excess);
            }
        }

        lines
    }

    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    /// Remaining partial line once the stream hits EOF, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
