//! Response framing.
//!
//! IMAP framing is line-oriented except where a line announces a literal:
//! `{N}` or `{N+}` immediately before the line break means the next N
//! bytes are opaque payload that must not be scanned for terminators. The
//! scanner accumulates arbitrary byte chunks and yields complete frames,
//! each holding one server line plus any literal payloads it announced,
//! with the final terminator removed.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum length of a single response line, literals excluded.
const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// Maximum size of a single announced literal.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024; // 100 MB

/// Incremental frame scanner.
///
/// Feed it received chunks with [`feed`](Self::feed) and drain completed
/// frames with [`next_frame`](Self::next_frame) until it reports that it
/// needs more data.
#[derive(Debug, Default)]
pub struct FrameScanner {
    /// Received bytes not yet consumed.
    buffer: BytesMut,
    /// The partially accumulated in-progress frame.
    frame: BytesMut,
    /// Bytes still owed to an announced literal.
    literal_remaining: usize,
}

impl FrameScanner {
    /// Creates an empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a received chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` until more data arrives.
    ///
    /// # Errors
    ///
    /// Fails when a line or literal exceeds the hard size guards; the
    /// stream is no longer interpretable at that point.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let Some(terminator) = find_terminator(&self.buffer) else {
                // A line this long without a terminator will never frame.
                // Captured literal bytes live in `frame` and don't count.
                if self.literal_remaining == 0 && self.buffer.len() > MAX_LINE_LENGTH {
                    return Err(Error::Parse {
                        position: self.frame.len(),
                        message: "response line too long".to_string(),
                    });
                }
                return Ok(None);
            };

            if self.literal_remaining > 0 {
                // The matched terminator may sit inside the literal; the
                // owed bytes are opaque and win.
                if self.buffer.len() < self.literal_remaining {
                    return Ok(None);
                }
                let payload = self.buffer.split_to(self.literal_remaining);
                self.frame.extend_from_slice(&payload);
                self.literal_remaining = 0;
                continue;
            }

            if let Some(size) = terminator.literal {
                if size > MAX_LITERAL_SIZE as u128 {
                    return Err(Error::Parse {
                        position: self.frame.len(),
                        message: format!(
                            "literal too large: {size} bytes (max {MAX_LITERAL_SIZE})"
                        ),
                    });
                }
                // Keep the marker and its line break inside the frame so
                // the payload stays attached to its announcement.
                let announced = self.buffer.split_to(terminator.end);
                self.frame.extend_from_slice(&announced);
                self.literal_remaining = usize::try_from(size).unwrap_or(usize::MAX);
                continue;
            }

            let line = self.buffer.split_to(terminator.end);
            self.frame.extend_from_slice(&line[..terminator.start]);
            return Ok(Some(self.frame.split().freeze()));
        }
    }
}

struct Terminator {
    /// Index of the first byte of the matched pattern.
    start: usize,
    /// Index one past the line feed.
    end: usize,
    /// Announced literal size, if the line break was preceded by `{N}` or
    /// `{N+}`.
    literal: Option<u128>,
}

/// Finds the first `({N}|{N+})?\r?\n` in the buffer.
fn find_terminator(buffer: &[u8]) -> Option<Terminator> {
    let newline = buffer.iter().position(|&byte| byte == b'\n')?;

    let mut start = newline;
    if start > 0 && buffer[start - 1] == b'\r' {
        start -= 1;
    }

    let mut literal = None;
    if start > 0 && buffer[start - 1] == b'}' {
        let mut cursor = start - 1;
        if cursor > 0 && buffer[cursor - 1] == b'+' {
            cursor -= 1;
        }
        let digits_end = cursor;
        while cursor > 0 && buffer[cursor - 1].is_ascii_digit() {
            cursor -= 1;
        }
        if cursor < digits_end && cursor > 0 && buffer[cursor - 1] == b'{' {
            // Unparseable sizes only occur past the literal guard; pin
            // them to the maximum so the scanner reports them as such.
            let size = std::str::from_utf8(&buffer[cursor..digits_end])
                .ok()
                .and_then(|digits| digits.parse().ok())
                .unwrap_or(u128::MAX);
            literal = Some(size);
            start = cursor - 1;
        }
    }

    Some(Terminator {
        start,
        end: newline + 1,
        literal,
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn collect_frames(scanner: &mut FrameScanner) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = scanner.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_line() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* OK ready\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(frames, vec![Bytes::from_static(b"* OK ready")]);
    }

    #[test]
    fn test_terminator_without_cr() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* OK ready\n* 2 EXISTS\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"* OK ready"),
                Bytes::from_static(b"* 2 EXISTS"),
            ]
        );
    }

    #[test]
    fn test_greeting_arrives_chunked() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* OK [CAPABILITY IMAP4rev1 LIT");
        assert!(scanner.next_frame().unwrap().is_none());
        scanner.feed(b"ERAL+] ready\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"* OK [CAPABILITY IMAP4rev1 LITERAL+] ready")]
        );
    }

    #[test]
    fn test_literal_framing_split_after_marker() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH (BODY[] {5}\r\n");
        assert!(scanner.next_frame().unwrap().is_none());
        scanner.feed(b"hello)\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"* 1 FETCH (BODY[] {5}\r\nhello)")]
        );
    }

    #[test]
    fn test_literal_payload_is_not_scanned() {
        // The payload contains both a fake terminator and a fake literal
        // marker; neither may be interpreted.
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH {12}\r\nhi\r\n{99}\r\nxy ok\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"* 1 FETCH {12}\r\nhi\r\n{99}\r\nxy ok")]
        );
    }

    #[test]
    fn test_zero_length_literal_emits_immediately() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH (BODY[] {0}\r\n)\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"* 1 FETCH (BODY[] {0}\r\n)")]
        );
    }

    #[test]
    fn test_nonsync_literal_marker() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH {3+}\r\nabc\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(frames, vec![Bytes::from_static(b"* 1 FETCH {3+}\r\nabc")]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 EXISTS\r\n* 2 RECENT\r\nW1 OK done\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Bytes::from_static(b"W1 OK done"));
    }

    #[test]
    fn test_literal_followed_by_more_protocol_in_same_chunk() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH (X {2}\r\nab Y {2}\r\ncd)\r\nW1 OK done\r\n");
        let frames = collect_frames(&mut scanner);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"* 1 FETCH (X {2}\r\nab Y {2}\r\ncd)"),
                Bytes::from_static(b"W1 OK done"),
            ]
        );
    }

    #[test]
    fn test_every_split_position_yields_identical_frames() {
        let stream: &[u8] = b"* OK greet\r\n* 1 FETCH (BODY[] {5}\r\nh\r\n{o)\r\nW1 OK fine\r\n";
        let mut expected = FrameScanner::new();
        expected.feed(stream);
        let expected = collect_frames(&mut expected);
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut scanner = FrameScanner::new();
            let mut frames = Vec::new();
            scanner.feed(&stream[..split]);
            frames.extend(collect_frames(&mut scanner));
            scanner.feed(&stream[split..]);
            frames.extend(collect_frames(&mut scanner));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_line_too_long_is_fatal() {
        let mut scanner = FrameScanner::new();
        scanner.feed(&vec![b'a'; MAX_LINE_LENGTH + 1]);
        assert!(scanner.next_frame().is_err());
    }

    #[test]
    fn test_large_literal_does_not_trip_line_guard() {
        // A literal bigger than the line limit is fine; only the line
        // itself is bounded.
        let mut scanner = FrameScanner::new();
        scanner.feed(format!("* 1 FETCH (BODY[] {{{}}}\r\n", MAX_LINE_LENGTH * 2).as_bytes());
        assert!(scanner.next_frame().unwrap().is_none());
        scanner.feed(&vec![b'x'; MAX_LINE_LENGTH * 2]);
        scanner.feed(b" partial tail");
        assert!(scanner.next_frame().unwrap().is_none());
        scanner.feed(b")\r\n");
        let frame = scanner.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), "* 1 FETCH (BODY[] {2097152}\r\n".len() + MAX_LINE_LENGTH * 2 + " partial tail)".len());
    }

    #[test]
    fn test_literal_too_large_is_fatal() {
        let mut scanner = FrameScanner::new();
        scanner.feed(format!("* 1 FETCH {{{}}}\r\n", MAX_LITERAL_SIZE + 1).as_bytes());
        assert!(scanner.next_frame().is_err());
    }

    #[test]
    fn test_unparseable_literal_size_is_fatal() {
        let mut scanner = FrameScanner::new();
        scanner.feed(b"* 1 FETCH {99999999999999999999999999999999999999999}\r\n");
        assert!(scanner.next_frame().is_err());
    }
}
