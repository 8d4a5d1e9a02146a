//! Merge text files in line-sort order, like `sort` crossed with `tail -f`.
//!
//! `tailmerge` interleaves the lines of N files by full-line byte
//! comparison, printing a `>>> <filename>` header above each run of
//! consecutive lines from one source. Lines from the same file are never
//! reordered, and equal lines across files keep argument order. Memory use
//! is a constant per source: two fixed buckets each, plus the output batch.
//!
//! Flow (single line):
//! 1) The reader keeps one read in flight per source (io_uring with
//!    registered buffers and fixed files on Linux, blocking `read(2)`
//!    elsewhere) and loans filled buffers to the driver.
//! 2) The framer splits a loan into newline-terminated lines without
//!    copying, carrying any unterminated tail into the next read.
//! 3) The heap orders each source's current line by raw bytes; the driver
//!    pops the smallest, batches it into vectored writes, and repushes the
//!    source.
//!
//! The heap, framer, and coalescer are plain components with their own
//! tests; `heapseq` (in `src/bin`) drives the heap from the command line.

pub mod arena;
pub mod error;
pub mod framer;
pub mod heap;
pub mod merge;
pub mod output;
pub mod reader;

pub use error::MergeError;
pub use merge::{merge_files, MergeConfig, MergeStats};
pub use reader::{Backend, ReaderConfig};
