//! Byte framer: turns the raw receive stream into packet bodies.
//!
//! The scanner owns a bounded buffer of bytes that have arrived from the
//! transport but not yet decoded. Smart-mode frames are `\` + uppercase
//! hex-ASCII + CR with a trailing checksum byte; reset echoes, PCI error
//! indicators and confirmations arrive as bare ASCII and are self-framing.
//! Anything else (prompts, stray CR/LF, line noise) is discarded.

use thiserror::Error;

use super::{checksum_valid, hex_digit, is_confirmation_tag, FRAME_START, PCI_ERROR, RESET};

/// Hard cap on buffered undecoded bytes.
pub const MAX_BUFFER_SIZE: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("frame contains invalid hex-ASCII")]
    BadHex,
    #[error("frame checksum does not sum to zero")]
    BadChecksum,
    #[error("frame too short to carry a payload and checksum")]
    ShortFrame,
    #[error("receive buffer overflowed without a frame terminator")]
    Overflow,
}

/// Incremental frame scanner.
///
/// `push` may be called with arbitrary chunkings of the input stream; the
/// emitted sequence of bodies is the same for any chunking.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all buffered bytes (connection reset).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Ingest `bytes` and return every complete body found, in order.
    ///
    /// A returned body is either the decoded, checksum-verified content of a
    /// `\`-framed command (checksum stripped), or the raw bytes of a
    /// self-framing event (`~`, `#`, or a tag plus `.`/`!`).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, ScanError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            // Discard leading bytes that cannot start a frame.
            let start = self
                .buf
                .iter()
                .position(|&b| {
                    b == FRAME_START || b == RESET || b == PCI_ERROR || is_confirmation_tag(b)
                })
                .unwrap_or(self.buf.len());
            self.buf.drain(..start);

            let Some(&first) = self.buf.first() else {
                break;
            };

            match first {
                RESET => {
                    self.buf.drain(..1);
                    out.push(Ok(vec![RESET]));
                }
                PCI_ERROR => {
                    self.buf.drain(..1);
                    out.push(Ok(vec![PCI_ERROR]));
                }
                FRAME_START => {
                    let Some(end) = self.buf.iter().position(|&b| b == b'\r') else {
                        break;
                    };
                    let mut content_end = end;
                    if content_end > 1 && self.buf[content_end - 1] == b'\n' {
                        content_end -= 1;
                    }
                    let decoded = decode_hex_body(&self.buf[1..content_end]);
                    self.buf.drain(..=end);
                    out.push(decoded);
                }
                tag => {
                    let Some(&indicator) = self.buf.get(1) else {
                        break;
                    };
                    if indicator == b'.' || indicator == b'!' {
                        self.buf.drain(..2);
                        out.push(Ok(vec![tag, indicator]));
                    } else {
                        // A lone tag byte is line noise.
                        self.buf.drain(..1);
                    }
                }
            }
        }

        if self.buf.len() >= MAX_BUFFER_SIZE {
            self.buf.clear();
            out.push(Err(ScanError::Overflow));
        }

        out
    }
}

fn decode_hex_body(chars: &[u8]) -> Result<Vec<u8>, ScanError> {
    if chars.len() % 2 != 0 {
        return Err(ScanError::BadHex);
    }
    let mut body = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks_exact(2) {
        let hi = hex_digit(pair[0]).ok_or(ScanError::BadHex)?;
        let lo = hex_digit(pair[1]).ok_or(ScanError::BadHex)?;
        body.push(hi << 4 | lo);
    }
    if body.len() < 2 {
        return Err(ScanError::ShortFrame);
    }
    if !checksum_valid(&body) {
        return Err(ScanError::BadChecksum);
    }
    body.pop();
    Ok(body)
}
