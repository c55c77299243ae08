//! Line framing for the cluster wire protocol.
//!
//! Cluster nodes speak a plain byte stream of text lines terminated by CR,
//! LF, or CRLF, in a single-byte encoding. [`LineFramer`] turns arbitrary
//! read chunks into discrete lines:
//!
//! - CR, LF, and CRLF each delimit exactly one line; a CRLF split across
//!   two reads still resolves to a single boundary.
//! - Empty lines are emitted, not dropped — policy belongs to consumers.
//! - [`LineFramer::finish`] flushes an unterminated remainder at stream
//!   end as one final best-effort line.
//! - Bytes decode as Latin-1 (byte value == code point), so out-of-band
//!   control bytes (stray telnet negotiation and the like) pass through
//!   as opaque text and can never fail decoding.

// ============================================================================
// Constants
// ============================================================================

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

// ============================================================================
// LineFramer
// ============================================================================

/// Incremental splitter turning a raw byte stream into text lines.
///
/// Feed chunks with [`push`](Self::push) as they arrive; the ordered list
/// of produced lines is independent of how the bytes were chunked.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes of the current, not-yet-terminated line.
    buf: Vec<u8>,
    /// The last byte of the previous chunk was a CR; an LF at the start
    /// of the next chunk completes that terminator instead of ending a
    /// new (empty) line.
    pending_cr: bool,
}

impl LineFramer {
    /// Creates an empty framer.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read chunk, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == LF {
                    // Second half of a CRLF; boundary already emitted.
                    continue;
                }
            }

            match byte {
                CR => {
                    lines.push(Self::decode(&mut self.buf));
                    self.pending_cr = true;
                }
                LF => lines.push(Self::decode(&mut self.buf)),
                _ => self.buf.push(byte),
            }
        }

        lines
    }

    /// Flushes the unterminated remainder at end of stream, if any.
    ///
    /// Resets the framer; safe to call more than once.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_cr = false;
        if self.buf.is_empty() {
            None
        } else {
            Some(Self::decode(&mut self.buf))
        }
    }

    /// Returns `true` if no partial line is buffered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drains `buf` into a Latin-1 decoded string.
    fn decode(buf: &mut Vec<u8>) -> String {
        let line = buf.iter().map(|&b| b as char).collect();
        buf.clear();
        line
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    /// Runs a byte sequence through the framer in one shot.
    fn frame_all(bytes: &[u8]) -> Vec<String> {
        let mut framer = LineFramer::new();
        let mut lines = framer.push(bytes);
        lines.extend(framer.finish());
        lines
    }

    /// Runs the same byte sequence split at the given boundaries.
    fn frame_chunked(bytes: &[u8], splits: &[usize]) -> Vec<String> {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        let mut start = 0;
        for &split in splits {
            let end = split.min(bytes.len()).max(start);
            lines.extend(framer.push(&bytes[start..end]));
            start = end;
        }
        lines.extend(framer.push(&bytes[start..]));
        lines.extend(framer.finish());
        lines
    }

    #[test]
    fn test_each_terminator_delimits() {
        assert_eq!(frame_all(b"a\rb\nc\r\nd"), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_empty_lines_are_emitted() {
        assert_eq!(frame_all(b"a\n\nb\n"), ["a", "", "b"]);
        assert_eq!(frame_all(b"\r\n\r\n"), ["", ""]);
    }

    #[test]
    fn test_crlf_split_across_reads_is_one_boundary() {
        let mut framer = LineFramer::new();
        let mut lines = framer.push(b"HELLO\r");
        lines.extend(framer.push(b"\nWORLD\r\n"));
        assert_eq!(lines, ["HELLO", "WORLD"]);
    }

    #[test]
    fn test_cr_then_data_in_next_read() {
        let mut framer = LineFramer::new();
        let mut lines = framer.push(b"A\r");
        lines.extend(framer.push(b"B\r"));
        lines.extend(framer.finish());
        assert_eq!(lines, ["A", "B"]);
    }

    #[test]
    fn test_finish_flushes_remainder() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"partial").is_empty());
        assert_eq!(framer.finish().as_deref(), Some("partial"));
        // Idempotent after the flush.
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_finish_empty_buffer_yields_nothing() {
        let mut framer = LineFramer::new();
        let _ = framer.push(b"done\r\n");
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_reassembly_across_uneven_chunks() {
        // "LINE1\r\nLINE2\r" as ["LI", "NE1\r\n", "LINE", "2\r"]
        let lines = frame_chunked(b"LINE1\r\nLINE2\r", &[2, 7, 11]);
        assert_eq!(lines, ["LINE1", "LINE2"]);
    }

    #[test]
    fn test_control_bytes_pass_through() {
        // Telnet IAC WILL ECHO embedded in a line must not crash or split.
        let lines = frame_all(&[b'a', 0xFF, 0xFB, 0x01, b'b', LF]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].chars().count(), 5);
        assert_eq!(lines[0].chars().nth(1), Some('\u{FF}'));
    }

    proptest! {
        #[test]
        fn prop_chunk_boundary_independence(
            bytes in proptest::collection::vec(any::<u8>(), 0..256),
            splits in proptest::collection::vec(0usize..256, 0..8),
        ) {
            let mut sorted = splits.clone();
            sorted.sort_unstable();
            prop_assert_eq!(frame_all(&bytes), frame_chunked(&bytes, &sorted));
        }

        #[test]
        fn prop_line_count_matches_terminators(
            lines in proptest::collection::vec("[a-zA-Z0-9 ]{0,16}", 0..16),
        ) {
            let wire: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            prop_assert_eq!(frame_all(wire.as_bytes()), lines);
        }
    }
}
