//! Incremental UTF-8 decoding for unframed serial chunks.
//!
//! A single read can end in the middle of a multi-byte character. The decoder
//! keeps those trailing bytes and prepends them to the next chunk instead of
//! emitting a replacement character for each half.

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
    decode_errors: u64,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invalid sequences replaced so far
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to always lands on a char boundary
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT);
                            self.decode_errors += 1;
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // incomplete sequence at the end of the chunk
                            self.pending.extend_from_slice(&rest[valid..]);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush any held bytes at end of stream
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let bytes = std::mem::take(&mut self.pending);
        self.decode_errors += 1;
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
