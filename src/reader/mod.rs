//! Source readers: the buffer-loan contract and its two backends.
//!
//! A reader keeps one read in flight per open source and hands completed
//! buffers to the consumer as [`Loan`]s. The consumer inspects the bytes,
//! then returns the loan together with the range of any unterminated tail;
//! the reader moves that carry to the head of the next read target before
//! submitting, so the consumer always sees `carry + fresh bytes` as one
//! contiguous slice.
//!
//! Backends:
//! - [`uring::UringReader`] (Linux): io_uring with registered buffers and
//!   fixed files, linked open+read pairs, one read in flight per source.
//! - [`blocking::BlockingReader`]: portable synchronous `read(2)` with the
//!   same contract; used when the ring cannot be created.

pub mod blocking;
#[cfg(target_os = "linux")]
pub mod uring;

use crate::arena::Arena;
use crate::error::MergeError;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::slice;

/// Default per-bucket buffer size.
pub const DEFAULT_SOURCE_BUFFER: usize = 64 * 1024;

/// Most slices one ring write can carry.
pub(crate) const WRITE_IOVEC_CAP: usize = 64;

/// Arena tail bytes the readers need for in-flight write iovecs (includes
/// alignment slack).
pub fn write_scratch_len() -> usize {
    WRITE_IOVEC_CAP * std::mem::size_of::<libc::iovec>() + std::mem::align_of::<libc::iovec>()
}

/// Backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// io_uring when the kernel provides it, blocking otherwise.
    Auto,
    /// io_uring or fail.
    Uring,
    /// Force synchronous reads.
    Blocking,
}

/// Reader construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct ReaderConfig {
    /// Bytes per bucket (each source owns two buckets).
    pub per_source_buffer: usize,
    pub backend: Backend,
    /// Descriptor that `write_and_return_loan` targets.
    pub out_fd: RawFd,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            per_source_buffer: DEFAULT_SOURCE_BUFFER,
            backend: Backend::Auto,
            out_fd: 1,
        }
    }
}

/// A filled buffer on loan to the consumer.
///
/// The bytes stay valid until the loan is returned. A zero-length loan
/// reports end of file for the source and needs no return.
#[derive(Debug)]
pub struct Loan {
    pub source: u32,
    ptr: *const u8,
    len: usize,
}

impl Loan {
    pub(crate) fn new(source: u32, ptr: *const u8, len: usize) -> Self {
        Self { source, ptr, len }
    }

    pub(crate) fn eof(source: u32) -> Self {
        Self {
            source,
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// End-of-file marker: no bytes, nothing borrowed.
    pub fn is_eof(&self) -> bool {
        self.len == 0
    }

    /// The loaned bytes, borrowed from the loan itself.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the reader filled `ptr..ptr+len` and will not touch it
        // again until this loan is returned.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The loaned bytes with a caller-chosen lifetime.
    ///
    /// # Safety
    /// The slice must not be used once the underlying buffer is reused,
    /// i.e. after the next read submitted for this source following the
    /// loan's return. The merge driver upholds this by flushing every
    /// output reference before returning a loan.
    pub unsafe fn bytes_unbound<'k>(&self) -> &'k [u8] {
        slice::from_raw_parts(self.ptr, self.len)
    }

    pub(crate) fn ptr(&self) -> *const u8 {
        self.ptr
    }
}

/// One source's bucket territory inside the arena's registered region.
#[derive(Clone, Copy, Debug)]
pub struct BucketRegion {
    pub a_off: usize,
    pub b_off: usize,
    pub size: usize,
    pub open: bool,
}

/// Per-source bucket offsets and sizes, including close-time donation.
///
/// Buckets of one kind are laid out contiguously by source index, so when a
/// source closes its territory can be merged into the next still-open
/// source on its right: the recipient's base moves down to the donor's and
/// its size absorbs everything in between.
#[derive(Debug)]
pub struct BucketMap {
    regions: Vec<BucketRegion>,
}

impl BucketMap {
    /// Standard two-bucket layout: bucket A at `i * per`, bucket B at
    /// `(sources + i) * per`.
    pub fn new(sources: usize, per_source: usize) -> Self {
        let regions = (0..sources)
            .map(|i| BucketRegion {
                a_off: i * per_source,
                b_off: (sources + i) * per_source,
                size: per_source,
                open: true,
            })
            .collect();
        Self { regions }
    }

    /// Fused layout for the blocking backend: both buckets of a source form
    /// one doubled buffer.
    pub fn fused(sources: usize, per_source: usize) -> Self {
        let regions = (0..sources)
            .map(|i| BucketRegion {
                a_off: i * 2 * per_source,
                b_off: i * 2 * per_source,
                size: 2 * per_source,
                open: true,
            })
            .collect();
        Self { regions }
    }

    pub fn region(&self, i: usize) -> BucketRegion {
        self.regions[i]
    }

    /// Closes source `i`, donating its territory to the next open source on
    /// the right. Returns the recipient, if any.
    pub fn close(&mut self, i: usize) -> Option<usize> {
        if !self.regions[i].open {
            return None;
        }
        let donor = self.regions[i];
        self.regions[i].open = false;
        self.regions[i].size = 0;

        let recipient = (i + 1..self.regions.len()).find(|&j| self.regions[j].open)?;
        let r = &mut self.regions[recipient];
        // Absorb the donor's span plus any retired territory in between.
        r.size += r.a_off - donor.a_off;
        r.a_off = donor.a_off;
        r.b_off = donor.b_off;
        Some(recipient)
    }

    pub fn open_count(&self) -> usize {
        self.regions.iter().filter(|r| r.open).count()
    }
}

/// Backend-dispatched reader.
pub enum SourceReader {
    #[cfg(target_os = "linux")]
    Uring(uring::UringReader),
    Blocking(blocking::BlockingReader),
}

impl SourceReader {
    /// Opens all sources with the configured backend.
    ///
    /// `Auto` tries the ring first and downgrades to blocking reads when
    /// ring setup fails, printing the one-line notice the CLI contract
    /// requires. Failures to open an input are never downgraded.
    pub fn open(paths: &[&Path], arena: &Arena, config: &ReaderConfig) -> Result<Self, MergeError> {
        match config.backend {
            Backend::Blocking => Ok(SourceReader::Blocking(blocking::BlockingReader::open(
                paths, arena, config,
            )?)),
            Backend::Uring => {
                #[cfg(target_os = "linux")]
                {
                    Ok(SourceReader::Uring(uring::UringReader::open(
                        paths, arena, config,
                    )?))
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(MergeError::Resource {
                        what: "create ring",
                        source: std::io::Error::from_raw_os_error(libc::ENOSYS),
                    })
                }
            }
            Backend::Auto => {
                #[cfg(target_os = "linux")]
                {
                    match uring::UringReader::open(paths, arena, config) {
                        Ok(reader) => return Ok(SourceReader::Uring(reader)),
                        Err(err) if err.is_ring_unavailable() => {
                            eprintln!("io_uring is not available, falling back to blocking IO.");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(SourceReader::Blocking(blocking::BlockingReader::open(
                    paths, arena, config,
                )?))
            }
        }
    }

    /// Returns the next completed read as a loan, waiting if necessary.
    ///
    /// `None` means every source has reached end of file and nothing is in
    /// flight.
    pub fn next_event(&mut self) -> Result<Option<Loan>, MergeError> {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.next_event(),
            SourceReader::Blocking(r) => r.next_event(),
        }
    }

    /// Returns a loan, carrying `carry` (a range within the loaned bytes)
    /// to the head of the next read, which is submitted here.
    pub fn return_loan(&mut self, loan: Loan, carry: Range<usize>) -> Result<(), MergeError> {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.return_loan(loan, carry),
            SourceReader::Blocking(r) => r.return_loan(loan, carry),
        }
    }

    /// Writes `slices` to the configured output descriptor and, when a loan
    /// is supplied, returns it with a follow-up read into the same buffer
    /// ordered after the write.
    pub fn write_and_return_loan(
        &mut self,
        slices: &[&[u8]],
        loan: Option<Loan>,
    ) -> Result<(), MergeError> {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.write_and_return_loan(slices, loan),
            SourceReader::Blocking(r) => r.write_and_return_loan(slices, loan),
        }
    }

    /// Waits for any queued write to complete (`now`), or leaves it to be
    /// reaped by the next wait (`!now`).
    pub fn wait_for_write(&mut self, now: bool) -> Result<(), MergeError> {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.wait_for_write(now),
            SourceReader::Blocking(r) => r.wait_for_write(now),
        }
    }

    /// Bytes confirmed written through `write_and_return_loan`.
    pub fn bytes_written(&self) -> u64 {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.bytes_written(),
            SourceReader::Blocking(r) => r.bytes_written(),
        }
    }

    /// Stops reading source `i`, cancelling any in-flight read and donating
    /// its buffers to the next open source.
    pub fn close_source(&mut self, i: usize) -> Result<(), MergeError> {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.close_source(i),
            SourceReader::Blocking(r) => r.close_source(i),
        }
    }

    /// Total bytes read from all sources.
    pub fn bytes_read(&self) -> u64 {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.bytes_read(),
            SourceReader::Blocking(r) => r.bytes_read(),
        }
    }

    /// Sources not yet at end of file.
    pub fn open_sources(&self) -> u32 {
        match self {
            #[cfg(target_os = "linux")]
            SourceReader::Uring(r) => r.open_sources(),
            SourceReader::Blocking(r) => r.open_sources(),
        }
    }
}

pub(crate) fn path_display(path: &Path) -> String {
    path.display().to_string()
}
