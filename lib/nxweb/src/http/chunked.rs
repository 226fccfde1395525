//! Streaming `Transfer-Encoding: chunked` codec. The decoder rewrites
//! chunk framing out of the buffer in place; the encoder frames
//! outgoing data and emits the terminating `0\r\n\r\n` exactly once.

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DecoderState {
    Size,
    Lf2,
    Data,
    Cr1,
    Lf1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodeOutcome {
    /// Length of the decoded payload now at the front of the buffer.
    /// In monitor mode this is always the consumed input length.
    pub len: usize,
    /// The zero-length chunk and its trailing CRLF have been seen.
    pub complete: bool,
    /// Input bytes consumed. Short of the input length only when the
    /// body completed and pipelined bytes follow the terminator.
    pub input_consumed: usize,
}

/// Incremental chunked decoder. Feed it consecutive regions of the
/// body; state carries over between calls.
///
/// In monitor mode the decoder only tracks framing (used when relaying
/// an already-chunked stream verbatim); it never touches the buffer.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_bytes_left: usize,
    final_chunk: bool,
    monitor_only: bool,
}

impl ChunkedDecoder {
    #[inline]
    pub fn new() -> ChunkedDecoder {
        ChunkedDecoder {
            state: DecoderState::Size,
            chunk_bytes_left: 0,
            final_chunk: false,
            monitor_only: false,
        }
    }

    #[inline]
    pub fn monitor() -> ChunkedDecoder {
        ChunkedDecoder {
            monitor_only: true,
            ..ChunkedDecoder::new()
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        let monitor_only = self.monitor_only;
        *self = ChunkedDecoder::new();
        self.monitor_only = monitor_only;
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.final_chunk && self.state == DecoderState::Lf1
    }

    /// Decode the next region of the body. Returns Err on malformed
    /// framing.
    pub fn decode(&mut self, buf: &mut [u8]) -> Result<DecodeOutcome, ()> {
        let input_len = buf.len();
        let mut end = buf.len();
        let mut p = 0;
        let mut d = 0;
        while p < end {
            let c = buf[p];
            match self.state {
                DecoderState::Data => {
                    if end - p >= self.chunk_bytes_left {
                        p += self.chunk_bytes_left;
                        self.chunk_bytes_left = 0;
                        self.state = DecoderState::Cr1;
                        d = p;
                    } else {
                        self.chunk_bytes_left -= end - p;
                        return Ok(DecodeOutcome {
                            len: if self.monitor_only { input_len } else { end },
                            complete: false,
                            input_consumed: input_len,
                        });
                    }
                }
                DecoderState::Cr1 => {
                    if c != b'\r' {
                        return Err(());
                    }
                    p += 1;
                    self.state = DecoderState::Lf1;
                }
                DecoderState::Lf1 => {
                    if c != b'\n' {
                        return Err(());
                    }
                    if self.final_chunk {
                        // everything past the terminator is pipelined
                        // input that belongs to the next request
                        let tail = end - (p + 1);
                        return Ok(DecodeOutcome {
                            len: if self.monitor_only { input_len - tail } else { d },
                            complete: true,
                            input_consumed: input_len - tail,
                        });
                    }
                    p += 1;
                    self.state = DecoderState::Size;
                }
                DecoderState::Size => {
                    if c == b'\r' {
                        if self.chunk_bytes_left == 0 {
                            // terminator found
                            self.final_chunk = true;
                        }
                        p += 1;
                        self.state = DecoderState::Lf2;
                    } else {
                        let digit = match c {
                            b'0'..=b'9' => c - b'0',
                            b'A'..=b'F' => c - b'A' + 10,
                            b'a'..=b'f' => c - b'a' + 10,
                            _ => return Err(()),
                        };
                        self.chunk_bytes_left = (self.chunk_bytes_left << 4) + digit as usize;
                        p += 1;
                    }
                }
                DecoderState::Lf2 => {
                    if c != b'\n' {
                        return Err(());
                    }
                    p += 1;
                    if !self.monitor_only {
                        buf.copy_within(p..end, d);
                        end -= p - d;
                        p = d;
                    }
                    self.state = DecoderState::Data;
                }
            }
        }
        Ok(DecodeOutcome {
            len: if self.monitor_only { input_len } else { d },
            complete: false,
            input_consumed: input_len,
        })
    }
}

/// Decode a complete chunked body in one pass (whole body in memory).
pub fn decode_chunked(buf: &mut Vec<u8>) -> Result<(), ()> {
    let mut decoder = ChunkedDecoder::new();
    let outcome = decoder.decode(buf)?;
    if !outcome.complete {
        return Err(());
    }
    buf.truncate(outcome.len);
    Ok(())
}

// Max chunk body per frame; the size header is four zero-padded hex
// digits.
const MAX_CHUNK_SIZE: usize = 0xffff;

/// Chunked encoder for outgoing bodies with unknown length.
pub struct ChunkedEncoder {
    final_sent: bool,
}

impl ChunkedEncoder {
    #[inline]
    pub fn new() -> ChunkedEncoder {
        ChunkedEncoder { final_sent: false }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.final_sent = false;
    }

    /// Frame a block of data into `out`. Splits blocks larger than the
    /// chunk size cap.
    pub fn encode(&mut self, out: &mut Vec<u8>, mut data: &[u8]) {
        debug_assert!(!self.final_sent);
        while !data.is_empty() {
            let take = data.len().min(MAX_CHUNK_SIZE);
            let mut header = [b'0'; 6];
            for (i, shift) in (0..4).rev().enumerate() {
                header[i] = crate::arena::hex_digit(((take >> (shift * 4)) & 0xf) as u8);
            }
            header[4] = b'\r';
            header[5] = b'\n';
            out.extend_from_slice(&header);
            out.extend_from_slice(&data[..take]);
            out.extend_from_slice(b"\r\n");
            data = &data[take..];
        }
    }

    /// Emit the terminating zero chunk. Idempotent.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.final_sent {
            out.extend_from_slice(b"0\r\n\r\n");
            self.final_sent = true;
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.final_sent
    }

    /// Worst-case framing overhead for a block of the given size.
    #[inline]
    pub fn overhead(size: usize) -> usize {
        (size / MAX_CHUNK_SIZE + 1) * 8 + 5
    }
}
