//! Byte-to-line framing shared by the AMI and AGI parsers.

/// Turns arbitrary byte chunks into a stream of complete lines.
///
/// Recognizes `\n`, `\r\n` and a bare `\r` as line terminators; each
/// returned line includes its terminator. A bare `\r` is surfaced
/// immediately instead of waiting for a line break that may never arrive;
/// if the following byte turns out to be `\n`, it is swallowed silently so
/// that a `\r\n` split across two chunks still reads as one line.
///
/// Chunk boundaries never affect the emitted lines: feeding `"abc\r\n"` in
/// one call or in five one-byte calls produces the same single line.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    buf: Vec<u8>,
    eat_lf: bool,
}

impl LineAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` into the accumulator, returning the complete lines it
    /// produced, in order. Each returned line still carries its terminator.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }
        let mut data = data;
        if self.buf.is_empty() && self.eat_lf {
            self.eat_lf = false;
            if data.first() == Some(&b'\n') {
                data = &data[1..];
            }
        }
        if data.is_empty() {
            return Vec::new();
        }

        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0usize;
        let buf_len = self.buf.len();
        let mut i = 0usize;
        while i < buf_len {
            let b = self.buf[i];
            if b == b'\n' {
                lines.push(self.buf[start..=i].to_vec());
                start = i + 1;
                i += 1;
            } else if b == b'\r' {
                if i + 1 < buf_len {
                    if self.buf[i + 1] == b'\n' {
                        lines.push(self.buf[start..=i + 1].to_vec());
                        start = i + 2;
                        i += 2;
                        continue;
                    }
                    lines.push(self.buf[start..=i].to_vec());
                    start = i + 1;
                    i += 1;
                } else {
                    // Trailing `\r` at the end of what we've received so
                    // far: emit it now, the next chunk's leading `\n` (if
                    // any) is swallowed by `eat_lf`.
                    lines.push(self.buf[start..=i].to_vec());
                    start = i + 1;
                    self.eat_lf = true;
                    i += 1;
                }
            } else {
                i += 1;
            }
        }
        self.buf = self.buf[start..].to_vec();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_lf_lines() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed(b"foo\nbar\n");
        assert_eq!(lines, vec![b"foo\n".to_vec(), b"bar\n".to_vec()]);
    }

    #[test]
    fn byte_at_a_time_matches_one_shot() {
        let data = b"foo\r\nbar\rbaz\n";
        let mut whole = LineAccumulator::new();
        let whole_lines = whole.feed(data);

        let mut piecewise = LineAccumulator::new();
        let mut piecewise_lines = Vec::new();
        for byte in data {
            piecewise_lines.extend(piecewise.feed(&[*byte]));
        }
        assert_eq!(whole_lines, piecewise_lines);
    }

    #[test]
    fn trailing_cr_emitted_immediately_and_following_lf_swallowed() {
        let mut acc = LineAccumulator::new();
        let first = acc.feed(b"foo\r");
        assert_eq!(first, vec![b"foo\r".to_vec()]);
        let second = acc.feed(b"\nbar\n");
        assert_eq!(second, vec![b"bar\n".to_vec()]);
    }

    #[test]
    fn incomplete_line_is_buffered() {
        let mut acc = LineAccumulator::new();
        assert!(acc.feed(b"partial").is_empty());
        let lines = acc.feed(b" line\n");
        assert_eq!(lines, vec![b"partial line\n".to_vec()]);
    }

    #[test]
    fn empty_input_produces_no_output() {
        let mut acc = LineAccumulator::new();
        assert!(acc.feed(b"").is_empty());
    }

    #[test]
    fn bare_cr_not_at_end_of_chunk() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed(b"foo\rbar\r\nbaz\n");
        assert_eq!(
            lines,
            vec![b"foo\r".to_vec(), b"bar\r\n".to_vec(), b"baz\n".to_vec()]
        );
    }
}
