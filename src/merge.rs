//! The merge driver.
//!
//! Seeds the heap with each source's first line, then repeatedly pops the
//! smallest line, prints a `>>> <filename>` header whenever the source
//! changes, and advances the popped source: repush when another complete
//! line is already loaned, carry an unterminated tail into the next read,
//! or stream a buffer-spanning line straight to the output until its
//! terminator appears. Sources are closed (and their buffers donated) the
//! moment they report end of file.
//!
//! Equal keys must extend the current run rather than bounce between
//! sources, so headers stay maximal. The heap settles equal keys by value,
//! lowest first; the driver exploits that by packing a rank into the high
//! half of each value (source index in the low half): seeds share the
//! maximal rank (argument order decides), and every repush takes a fresh,
//! strictly decreasing rank. The source that just emitted therefore holds
//! the lowest-ranked entry and wins any tie against a waiting equal line.

use crate::arena::{Arena, ArenaLayout};
use crate::error::MergeError;
use crate::framer::LineCursor;
use crate::heap::LineHeap;
use crate::output::{Coalescer, DEFAULT_BATCH_CAPACITY};
use crate::reader::{
    write_scratch_len, Backend, Loan, ReaderConfig, SourceReader, DEFAULT_SOURCE_BUFFER,
};
use memchr::memchr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

const MARKER: &[u8] = b"\n>>> ";
const NEWLINE: &[u8] = b"\n";

/// Rank shared by the initial pushes; repushes count down from just below.
const SEED_RANK: u32 = u32::MAX;

fn entry_value(rank: u32, source: usize) -> u64 {
    (u64::from(rank) << 32) | source as u64
}

fn entry_source(value: u64) -> usize {
    (value & 0xffff_ffff) as usize
}

/// Merge parameters.
#[derive(Clone, Copy, Debug)]
pub struct MergeConfig {
    /// Bytes per source bucket.
    pub per_source_buffer: usize,
    /// Output batch capacity, in slices.
    pub batch_capacity: usize,
    pub backend: Backend,
    /// Descriptor the reader's own write path targets.
    pub out_fd: RawFd,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            per_source_buffer: DEFAULT_SOURCE_BUFFER,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            backend: Backend::Auto,
            out_fd: 1,
        }
    }
}

/// Counters reported by a completed merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeStats {
    pub sources: usize,
    /// Lines delivered through the heap.
    pub lines: u64,
    /// Bytes read from every source.
    pub bytes_in: u64,
    /// Bytes written to the sink.
    pub bytes_out: u64,
    /// Header bytes emitted (markers, names, their newlines).
    pub header_bytes: u64,
    /// Synthetic newlines appended after unterminated final lines.
    pub appended_newlines: u64,
}

struct SourceState<'k> {
    cursor: LineCursor,
    loan: Option<Loan>,
    bytes: &'k [u8],
}

impl SourceState<'_> {
    fn empty() -> Self {
        Self {
            cursor: LineCursor::new(),
            loan: None,
            bytes: &[],
        }
    }
}

struct Merger<'k, 'io, W: Write> {
    reader: SourceReader,
    heap: LineHeap<'k>,
    batch: Coalescer<'k>,
    names: &'k [Vec<u8>],
    states: Vec<SourceState<'k>>,
    out: &'io mut W,
    stats: MergeStats,
    last: Option<usize>,
    next_rank: u32,
}

/// Merges `paths` into `out`, headers included. The memory high-water mark
/// is a constant per source; file contents are never held whole.
pub fn merge_files<W: Write>(
    paths: &[PathBuf],
    out: &mut W,
    config: &MergeConfig,
) -> Result<MergeStats, MergeError> {
    let n = paths.len();
    if n == 0 {
        return Ok(MergeStats::default());
    }

    let arena = Arena::new(ArenaLayout {
        sources: n,
        per_source: config.per_source_buffer,
        extra_registered: 0,
        tail: write_scratch_len(),
    })?;
    let names: Vec<Vec<u8>> = paths
        .iter()
        .map(|p| p.as_os_str().as_bytes().to_vec())
        .collect();
    let path_refs: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    let reader = SourceReader::open(
        &path_refs,
        &arena,
        &ReaderConfig {
            per_source_buffer: config.per_source_buffer,
            backend: config.backend,
            out_fd: config.out_fd,
        },
    )?;

    let mut merger = Merger {
        reader,
        heap: LineHeap::with_capacity(n),
        batch: Coalescer::with_capacity(config.batch_capacity),
        names: &names,
        states: (0..n).map(|_| SourceState::empty()).collect(),
        out,
        stats: MergeStats {
            sources: n,
            ..MergeStats::default()
        },
        last: None,
        next_rank: SEED_RANK - 1,
    };
    merger.seed(n)?;
    merger.run()?;
    merger.finish()
}

impl<'k, 'io, W: Write> Merger<'k, 'io, W> {
    /// Collects every source's first read and pushes its first line.
    fn seed(&mut self, sources: usize) -> Result<(), MergeError> {
        let mut pending = sources;
        while pending > 0 {
            let Some(loan) = self.reader.next_event()? else {
                return Err(MergeError::Invariant("reader ran dry during startup"));
            };
            pending -= 1;
            let i = loan.source as usize;
            if loan.is_eof() {
                self.reader.close_source(i)?;
                continue;
            }
            self.install_loan(i, loan);
            self.push_line(i, entry_value(SEED_RANK, i))?;
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), MergeError> {
        while let Some((line, value)) = self.heap.pop() {
            let i = entry_source(value);
            if self.last != Some(i) {
                self.emit_header(i)?;
                self.last = Some(i);
            }
            self.emit(line)?;
            self.stats.lines += 1;
            self.advance(i, line)?;
        }
        Ok(())
    }

    /// A fresh rank below every resident entry's, so the repushed source
    /// wins ties against waiting equals.
    fn repush_value(&mut self, source: usize) -> Result<u64, MergeError> {
        let rank = self.next_rank;
        self.next_rank = self
            .next_rank
            .checked_sub(1)
            .ok_or(MergeError::Invariant("repush ranks exhausted"))?;
        Ok(entry_value(rank, source))
    }

    fn finish(mut self) -> Result<MergeStats, MergeError> {
        self.flush()?;
        self.stats.bytes_in = self.reader.bytes_read();
        self.stats.bytes_out = self.batch.bytes_flushed();
        Ok(self.stats)
    }

    /// Moves the popped source forward after its line was emitted.
    fn advance(&mut self, i: usize, line: &'k [u8]) -> Result<(), MergeError> {
        let has_next = {
            let st = &mut self.states[i];
            st.cursor.advance(st.bytes)
        };
        if has_next {
            let value = self.repush_value(i)?;
            return self.push_line(i, value);
        }

        if line.last() == Some(&b'\n') {
            // The loan is exhausted; flush every reference to it, carry the
            // unterminated tail, and read on.
            self.flush()?;
            let (loan, carry) = {
                let st = &mut self.states[i];
                (st.loan.take(), st.cursor.carry())
            };
            let loan =
                loan.ok_or(MergeError::Invariant("source advanced without a loan"))?;
            self.states[i].bytes = &[];
            self.reader.return_loan(loan, carry)?;
            self.refill(i)
        } else {
            // The line runs past the end of the buffer (or the file). Its
            // prefix was the sort key; stream the rest verbatim.
            self.flush()?;
            let loan = self.states[i]
                .loan
                .take()
                .ok_or(MergeError::Invariant("source advanced without a loan"))?;
            self.states[i].bytes = &[];
            self.reader.return_loan(loan, 0..0)?;
            self.stream_tail(i)
        }
    }

    /// Requests the next loan for `i` and pushes its first line, closing the
    /// source at end of file.
    fn refill(&mut self, i: usize) -> Result<(), MergeError> {
        let loan = self.await_source(i)?;
        if loan.is_eof() {
            return self.reader.close_source(i);
        }
        self.install_loan(i, loan);
        let value = self.repush_value(i)?;
        self.push_line(i, value)
    }

    /// Streams loans straight through until the long line's terminator
    /// appears, then rejoins the heap discipline.
    fn stream_tail(&mut self, i: usize) -> Result<(), MergeError> {
        loop {
            let loan = self.await_source(i)?;
            if loan.is_eof() {
                // The file ended inside the line; supply its newline.
                self.emit(NEWLINE)?;
                self.stats.appended_newlines += 1;
                return self.reader.close_source(i);
            }
            // SAFETY: flushed before the loan returns, as everywhere else.
            let bytes: &'k [u8] = unsafe { loan.bytes_unbound() };
            match memchr(b'\n', bytes) {
                Some(at) if at + 1 == bytes.len() => {
                    self.emit(bytes)?;
                    self.flush()?;
                    self.reader.return_loan(loan, bytes.len()..bytes.len())?;
                    return self.refill(i);
                }
                Some(at) => {
                    self.emit(&bytes[..at + 1])?;
                    let framed = {
                        let st = &mut self.states[i];
                        st.cursor.resume(bytes, at + 1);
                        st.cursor.line_terminated(bytes)
                    };
                    if framed {
                        let st = &mut self.states[i];
                        st.bytes = bytes;
                        st.loan = Some(loan);
                        let value = self.repush_value(i)?;
                        return self.push_line(i, value);
                    }
                    // The next line is itself cut off at the loan boundary;
                    // carry it rather than keying on a partial prefix.
                    self.flush()?;
                    self.reader.return_loan(loan, at + 1..bytes.len())?;
                    return self.refill(i);
                }
                None => {
                    self.emit(bytes)?;
                    self.flush()?;
                    self.reader.return_loan(loan, 0..0)?;
                }
            }
        }
    }

    fn await_source(&mut self, i: usize) -> Result<Loan, MergeError> {
        match self.reader.next_event()? {
            Some(loan) if loan.source as usize == i => Ok(loan),
            Some(_) => Err(MergeError::Invariant("completion for an unexpected source")),
            None => Err(MergeError::Invariant("reader ran dry awaiting a source")),
        }
    }

    fn install_loan(&mut self, i: usize, loan: Loan) {
        // SAFETY: the slice is referenced only while the loan is held; the
        // driver flushes the batch before every return.
        let bytes: &'k [u8] = unsafe { loan.bytes_unbound() };
        let st = &mut self.states[i];
        st.cursor.reset(bytes);
        st.bytes = bytes;
        st.loan = Some(loan);
    }

    fn push_line(&mut self, i: usize, value: u64) -> Result<(), MergeError> {
        let line = {
            let st = &self.states[i];
            st.cursor.line(st.bytes)
        };
        if !self.heap.push(line, value) {
            return Err(MergeError::Invariant("heap overflow"));
        }
        Ok(())
    }

    fn emit_header(&mut self, i: usize) -> Result<(), MergeError> {
        let marker: &'static [u8] = if self.last.is_none() {
            &MARKER[1..]
        } else {
            MARKER
        };
        let names = self.names;
        let name: &'k [u8] = &names[i];
        self.emit(marker)?;
        self.emit(name)?;
        self.emit(NEWLINE)?;
        self.stats.header_bytes += (marker.len() + name.len() + NEWLINE.len()) as u64;
        Ok(())
    }

    fn emit(&mut self, slice: &'k [u8]) -> Result<(), MergeError> {
        self.batch
            .push(slice, self.out)
            .map_err(|source| MergeError::Write { source })
    }

    fn flush(&mut self) -> Result<(), MergeError> {
        self.batch
            .flush(self.out)
            .map_err(|source| MergeError::Write { source })
    }
}
