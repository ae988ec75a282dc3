use crate::{ParseError, ParseLimits};

/// Incremental scanner that finds the end of a message head inside a growing
/// read buffer while enforcing the request-line and head-block limits.
///
/// The scanner tolerates LF-only line terminators on input; the blank line
/// ending the head may therefore be `\r\n\r\n`, `\n\n`, or a mixture.
#[derive(Debug)]
pub struct HeadBuffer {
    limits: ParseLimits,
    scanned: usize,
    line_start: usize,
    first_line_complete: bool,
}

impl HeadBuffer {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            scanned: 0,
            line_start: 0,
            first_line_complete: false,
        }
    }

    /// Scan `buf` (the whole accumulated buffer, not just the new bytes) for
    /// the end of the head. Returns `Some(len)` with the head length
    /// including the terminating blank line once it is complete.
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        while self.scanned < buf.len() {
            let index = self.scanned;
            self.scanned += 1;
            if buf[index] != b'\n' {
                continue;
            }

            let mut line_end = index;
            if line_end > self.line_start && buf[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line_len = line_end - self.line_start;

            if !self.first_line_complete {
                if line_len > self.limits.max_request_line {
                    return Err(ParseError::RequestLineTooLong);
                }
                self.first_line_complete = true;
            } else if line_len == 0 {
                return Ok(Some(index + 1));
            }
            self.line_start = index + 1;
        }

        // No terminator yet: bound the partial first line and the head block.
        if !self.first_line_complete {
            let mut pending = buf.len();
            if pending > 0 && buf[pending - 1] == b'\r' {
                pending -= 1;
            }
            if pending > self.limits.max_request_line {
                return Err(ParseError::RequestLineTooLong);
            }
        }
        if buf.len() > self.limits.max_head_bytes {
            return Err(ParseError::HeadTooLarge);
        }
        Ok(None)
    }

    /// Reset for the next message on a keep-alive connection.
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.line_start = 0;
        self.first_line_complete = false;
    }
}
