use thiserror::Error;

/// Largest single chunk accepted by the decoder. Bounds memory for any one
/// decode step; well past what real clients emit.
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

const CHUNK_LINE_LIMIT: usize = 8 * 1024;
const TRAILER_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkedError {
    #[error("chunk size line had invalid hex length")]
    InvalidSizeLine,
    #[error("chunk size line exceeds limit")]
    SizeLineTooLong,
    #[error("single chunk exceeds maximum size")]
    ChunkTooLarge,
    #[error("chunk data not terminated by CRLF")]
    BadChunkTerminator,
    #[error("chunked trailers exceed limit")]
    TrailersTooLarge,
}

/// A step of decoded output. `Data` borrows from the caller's input buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent<'a> {
    Data(&'a [u8]),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailers,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// The decoder consumes raw wire bytes and reports decoded body bytes, so a
/// relay can forward the wire bytes untouched while observers see plaintext.
/// Size lines tolerate LF-only terminators like the head parser; the CRLF
/// after each chunk's data is required exactly.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
    trailer_bytes: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
            trailer_bytes: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consume bytes from `input`. Returns how many bytes were consumed and
    /// at most one event. Call repeatedly until the input is drained or the
    /// decoder is done.
    pub fn advance<'a>(
        &mut self,
        input: &'a [u8],
    ) -> Result<(usize, Option<ChunkEvent<'a>>), ChunkedError> {
        if input.is_empty() || self.state == State::Done {
            return Ok((0, None));
        }

        match self.state {
            State::Size => self.consume_size_line(input),
            State::Data { remaining } => {
                let take = std::cmp::min(remaining as usize, input.len());
                let remaining = remaining - take as u64;
                self.state = if remaining == 0 {
                    State::DataCr
                } else {
                    State::Data { remaining }
                };
                Ok((take, Some(ChunkEvent::Data(&input[..take]))))
            }
            State::DataCr => {
                if input[0] != b'\r' {
                    return Err(ChunkedError::BadChunkTerminator);
                }
                self.state = State::DataLf;
                Ok((1, None))
            }
            State::DataLf => {
                if input[0] != b'\n' {
                    return Err(ChunkedError::BadChunkTerminator);
                }
                self.state = State::Size;
                Ok((1, None))
            }
            State::Trailers => self.consume_trailer_line(input),
            State::Done => Ok((0, None)),
        }
    }

    fn consume_size_line<'a>(
        &mut self,
        input: &'a [u8],
    ) -> Result<(usize, Option<ChunkEvent<'a>>), ChunkedError> {
        let Some(newline) = input.iter().position(|byte| *byte == b'\n') else {
            if self.line.len() + input.len() > CHUNK_LINE_LIMIT {
                return Err(ChunkedError::SizeLineTooLong);
            }
            self.line.extend_from_slice(input);
            return Ok((input.len(), None));
        };

        if self.line.len() + newline > CHUNK_LINE_LIMIT {
            return Err(ChunkedError::SizeLineTooLong);
        }
        self.line.extend_from_slice(&input[..newline]);
        let size = parse_chunk_size(&self.line)?;
        self.line.clear();

        if size > MAX_CHUNK_SIZE {
            return Err(ChunkedError::ChunkTooLarge);
        }
        if size == 0 {
            self.state = State::Trailers;
        } else {
            self.state = State::Data { remaining: size };
        }
        Ok((newline + 1, None))
    }

    fn consume_trailer_line<'a>(
        &mut self,
        input: &'a [u8],
    ) -> Result<(usize, Option<ChunkEvent<'a>>), ChunkedError> {
        let Some(newline) = input.iter().position(|byte| *byte == b'\n') else {
            self.trailer_bytes += input.len();
            if self.trailer_bytes > TRAILER_LIMIT {
                return Err(ChunkedError::TrailersTooLarge);
            }
            self.line.extend_from_slice(input);
            return Ok((input.len(), None));
        };

        self.trailer_bytes += newline + 1;
        if self.trailer_bytes > TRAILER_LIMIT {
            return Err(ChunkedError::TrailersTooLarge);
        }
        self.line.extend_from_slice(&input[..newline]);
        let blank = self.line.is_empty() || self.line.as_slice() == b"\r";
        self.line.clear();
        if blank {
            self.state = State::Done;
            return Ok((newline + 1, Some(ChunkEvent::End)));
        }
        Ok((newline + 1, None))
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkedError> {
    let text = std::str::from_utf8(line).map_err(|_| ChunkedError::InvalidSizeLine)?;
    let trimmed = text.trim();
    // Chunk extensions after ';' are tolerated and ignored.
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    if size_text.is_empty() {
        return Err(ChunkedError::InvalidSizeLine);
    }
    u64::from_str_radix(size_text, 16).map_err(|_| ChunkedError::InvalidSizeLine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(wire: &[u8]) -> Result<(Vec<u8>, bool), ChunkedError> {
        let mut decoder = ChunkedDecoder::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut ended = false;
        while offset < wire.len() && !decoder.is_done() {
            let (consumed, event) = decoder.advance(&wire[offset..])?;
            offset += consumed;
            match event {
                Some(ChunkEvent::Data(bytes)) => decoded.extend_from_slice(bytes),
                Some(ChunkEvent::End) => ended = true,
                None => {}
            }
        }
        Ok((decoded, ended))
    }

    #[test]
    fn decodes_simple_chunked_body() {
        let (decoded, ended) = decode_all(b"5\r\nhello\r\n0\r\n\r\n").expect("decode");
        assert_eq!(decoded, b"hello");
        assert!(ended);
    }

    #[test]
    fn decodes_across_arbitrary_split_points() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        for split in 1..wire.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut decoded = Vec::new();
            for part in [&wire[..split], &wire[split..]] {
                let mut offset = 0;
                while offset < part.len() && !decoder.is_done() {
                    let (consumed, event) =
                        decoder.advance(&part[offset..]).expect("decode");
                    offset += consumed;
                    if let Some(ChunkEvent::Data(bytes)) = event {
                        decoded.extend_from_slice(bytes);
                    }
                }
            }
            assert_eq!(decoded, b"hello world", "split at {split}");
            assert!(decoder.is_done(), "split at {split}");
        }
    }

    #[test]
    fn ignores_chunk_extensions() {
        let (decoded, _) = decode_all(b"5;ext=1\r\nhello\r\n0\r\n\r\n").expect("decode");
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn consumes_trailers_until_blank_line() {
        let (decoded, ended) =
            decode_all(b"2\r\nhi\r\n0\r\nX-Trailer: v\r\n\r\n").expect("decode");
        assert_eq!(decoded, b"hi");
        assert!(ended);
    }

    #[test]
    fn rejects_invalid_hex_size() {
        assert_eq!(decode_all(b"zz\r\nhello\r\n"), Err(ChunkedError::InvalidSizeLine));
    }

    #[test]
    fn rejects_missing_chunk_crlf() {
        assert_eq!(
            decode_all(b"5\r\nhelloXX0\r\n\r\n"),
            Err(ChunkedError::BadChunkTerminator)
        );
    }

    #[test]
    fn chunk_at_size_cap_is_accepted_and_one_over_rejected() {
        let at_cap = format!("{:x}\r\n", MAX_CHUNK_SIZE);
        let mut decoder = ChunkedDecoder::new();
        let (consumed, event) = decoder.advance(at_cap.as_bytes()).expect("size line");
        assert_eq!(consumed, at_cap.len());
        assert!(event.is_none());

        let over_cap = format!("{:x}\r\n", MAX_CHUNK_SIZE + 1);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(
            decoder.advance(over_cap.as_bytes()),
            Err(ChunkedError::ChunkTooLarge)
        );
    }
}
