//! Line reassembly for the serial byte stream
//!
//! The device writes newline-terminated records, but reads return arbitrary
//! chunks. The reassembler buffers the unterminated tail between calls.

/// Longest unterminated tail kept before it is treated as line noise.
pub const MAX_PENDING_BYTES: usize = 4096;

/// Buffers input and emits a record whenever a newline is encountered.
///
/// The pending tail is kept as raw bytes so a UTF-8 sequence split across
/// two chunks still decodes correctly once the line completes.
#[derive(Debug, Default)]
pub struct LineReassembler {
    pending: Vec<u8>,
    /// Set after an oversized tail was dropped; bytes are skipped up to the next newline.
    discarding: bool,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(256),
            discarding: false,
        }
    }

    /// Feed one chunk and return every record it completed, in arrival order.
    ///
    /// Records are trimmed; blank lines are dropped. A tail that grows past
    /// [`MAX_PENDING_BYTES`] without a newline is dropped along with the rest
    /// of its line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.discarding {
                self.discarding = false;
                rest = &rest[pos + 1..];
                continue;
            }
            self.pending.extend_from_slice(&rest[..pos]);
            let line = String::from_utf8_lossy(&self.pending);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                records.push(trimmed.to_string());
            }
            self.pending.clear();
            rest = &rest[pos + 1..];
        }

        if !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > MAX_PENDING_BYTES {
                log::warn!(
                    "[serial] dropping {} bytes without a line break",
                    self.pending.len()
                );
                self.pending.clear();
                self.discarding = true;
            }
        }
        records
    }

    /// The unterminated tail, decoded lossily.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}
