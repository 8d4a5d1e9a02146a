//! Line framing over loaned buffers.
//!
//! A [`LineCursor`] walks the bytes of one loan without copying: the current
//! line is `start..end` (terminator included when present), `filled` is the
//! loan length. The unterminated tail left after the last complete line is
//! reported as a carry range; the reader moves those bytes to the head of
//! the next read so lines never straddle two live buffers.

use memchr::memchr;
use std::ops::Range;

/// Per-source cursor over the current loan's bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineCursor {
    start: usize,
    end: usize,
    filled: usize,
    lines_seen: u64,
}

impl LineCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames the first line of a fresh loan.
    ///
    /// The line runs to the first newline (inclusive), or to the end of the
    /// loan when no terminator is present yet.
    pub fn reset(&mut self, bytes: &[u8]) {
        self.filled = bytes.len();
        self.start = 0;
        self.end = match memchr(b'\n', bytes) {
            Some(at) => at + 1,
            None => self.filled,
        };
        if self.filled > 0 {
            self.lines_seen += 1;
        }
    }

    /// Re-frames from `from`, used after streaming past a long line's tail.
    pub fn resume(&mut self, bytes: &[u8], from: usize) {
        debug_assert!(from <= bytes.len());
        self.filled = bytes.len();
        self.start = from;
        self.end = match memchr(b'\n', &bytes[from..]) {
            Some(at) => from + at + 1,
            None => self.filled,
        };
        if self.start < self.filled {
            self.lines_seen += 1;
        }
    }

    /// The current line.
    pub fn line<'b>(&self, bytes: &'b [u8]) -> &'b [u8] {
        &bytes[self.start..self.end]
    }

    /// Whether the current line carries its terminator.
    pub fn line_terminated(&self, bytes: &[u8]) -> bool {
        self.end > self.start && bytes[self.end - 1] == b'\n'
    }

    /// Advances to the next complete line; `false` when none remains in the
    /// loan. The cursor is left so that [`LineCursor::carry`] names the
    /// unconsumed tail.
    pub fn advance(&mut self, bytes: &[u8]) -> bool {
        if self.end == self.filled {
            self.start = self.end;
            return false;
        }
        match memchr(b'\n', &bytes[self.end..self.filled]) {
            Some(at) => {
                self.start = self.end;
                self.end += at + 1;
                self.lines_seen += 1;
                true
            }
            None => false,
        }
    }

    /// The unterminated tail after the last framed line, to be preserved
    /// across the next read.
    pub fn carry(&self) -> Range<usize> {
        self.end..self.filled
    }

    /// Lines framed so far on this source.
    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }
}
