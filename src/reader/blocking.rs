//! Portable blocking reader.
//!
//! Implements the loan contract with synchronous `read(2)`. Each source
//! gets one doubled buffer (both bucket regions fused); the carry is moved
//! to the buffer head before the next read fills the remainder, so the
//! consumer sees the same `carry + fresh bytes` slice the ring produces.

use super::{path_display, BucketMap, Loan, ReaderConfig};
use crate::arena::Arena;
use crate::error::MergeError;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

#[derive(Debug)]
struct BlockSource {
    display: String,
    file: Option<File>,
    /// Carry bytes staged at the buffer head for the next read.
    carry_len: usize,
    eof: bool,
    closed: bool,
    loaned: bool,
    bytes_read: u64,
}

#[derive(Debug)]
pub struct BlockingReader {
    base: NonNull<u8>,
    buckets: BucketMap,
    sources: Vec<BlockSource>,
    /// Sources with a requested read (or a pending EOF report).
    queue: VecDeque<usize>,
    open_files: u32,
    out_fd: RawFd,
    written: u64,
}

impl BlockingReader {
    /// Opens every path and queues an initial read for each.
    pub fn open(paths: &[&Path], arena: &Arena, config: &ReaderConfig) -> Result<Self, MergeError> {
        let layout = arena.layout();
        debug_assert_eq!(layout.sources, paths.len());
        debug_assert_eq!(layout.per_source, config.per_source_buffer);

        let mut sources = Vec::with_capacity(paths.len());
        let mut queue = VecDeque::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let display = path_display(path);
            let file = File::open(path).map_err(|source| MergeError::Open {
                path: display.clone(),
                source,
            })?;
            sources.push(BlockSource {
                display,
                file: Some(file),
                carry_len: 0,
                eof: false,
                closed: false,
                loaned: false,
                bytes_read: 0,
            });
            queue.push_back(i);
        }

        let (base, _) = arena.registered_span();
        Ok(Self {
            base: NonNull::new(base)
                .ok_or(MergeError::Invariant("arena base pointer is null"))?,
            buckets: BucketMap::fused(paths.len(), config.per_source_buffer),
            open_files: paths.len() as u32,
            sources,
            queue,
            out_fd: config.out_fd,
            written: 0,
        })
    }

    pub fn next_event(&mut self) -> Result<Option<Loan>, MergeError> {
        let Some(i) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.read_into(i).map(Some)
    }

    fn read_into(&mut self, i: usize) -> Result<Loan, MergeError> {
        let region = self.buckets.region(i);
        let src = &mut self.sources[i];
        if src.eof || src.closed || src.file.is_none() {
            return Ok(Loan::eof(i as u32));
        }

        let carry = src.carry_len;
        src.carry_len = 0;
        // SAFETY: this source's region is exclusive to it, and no loan is
        // outstanding while a read is queued.
        let buf = unsafe { self.base.as_ptr().add(region.a_off + carry) };
        let room = region.size - carry;
        let file = src.file.as_mut().ok_or(MergeError::Invariant(
            "read requested on a closed source",
        ))?;
        let got = loop {
            // SAFETY: buf..buf+room lies inside this source's region.
            let dst = unsafe { std::slice::from_raw_parts_mut(buf, room) };
            match file.read(dst) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(MergeError::Read {
                        path: src.display.clone(),
                        source,
                    })
                }
            }
        };
        src.bytes_read += got as u64;

        if got == 0 {
            src.eof = true;
            src.file = None;
            self.open_files -= 1;
            if carry == 0 {
                return Ok(Loan::eof(i as u32));
            }
        }
        src.loaned = true;
        Ok(Loan::new(
            i as u32,
            self.base.as_ptr().wrapping_add(region.a_off),
            carry + got,
        ))
    }

    pub fn return_loan(&mut self, loan: Loan, carry: Range<usize>) -> Result<(), MergeError> {
        let i = loan.source as usize;
        let region = self.buckets.region(i);
        let src = &mut self.sources[i];
        if !src.loaned {
            return Err(MergeError::Invariant("loan returned twice"));
        }
        src.loaned = false;

        if src.eof || src.closed {
            if src.eof && !src.closed {
                // Final EOF report still owed to the consumer.
                self.queue.push_back(i);
            }
            return Ok(());
        }

        let carry_len = carry.len();
        if carry_len > 0 {
            debug_assert!(carry.end <= region.size);
            // Move the unterminated tail to the buffer head. Ranges may
            // overlap, so this is a copy with memmove semantics.
            unsafe {
                let base = self.base.as_ptr().add(region.a_off);
                std::ptr::copy(loan.ptr().add(carry.start), base, carry_len);
            }
        }
        src.carry_len = carry_len;
        self.queue.push_back(i);
        Ok(())
    }

    pub fn write_and_return_loan(
        &mut self,
        slices: &[&[u8]],
        loan: Option<Loan>,
    ) -> Result<(), MergeError> {
        self.written += writev_all(self.out_fd, slices)
            .map_err(|source| MergeError::Write { source })?;
        if let Some(loan) = loan {
            self.return_loan(loan, 0..0)?;
        }
        Ok(())
    }

    pub fn wait_for_write(&mut self, _now: bool) -> Result<(), MergeError> {
        // Synchronous writes complete before returning.
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn close_source(&mut self, i: usize) -> Result<(), MergeError> {
        let src = &mut self.sources[i];
        if src.closed {
            return Ok(());
        }
        src.closed = true;
        if !src.eof {
            src.eof = true;
            src.file = None;
            self.open_files -= 1;
        }
        self.buckets.close(i);
        self.queue.retain(|&q| q != i);
        Ok(())
    }

    pub fn bytes_read(&self) -> u64 {
        self.sources.iter().map(|s| s.bytes_read).sum()
    }

    pub fn open_sources(&self) -> u32 {
        self.open_files
    }
}

/// Drains `slices` through `writev(2)`, retrying short writes.
fn writev_all(fd: RawFd, slices: &[&[u8]]) -> io::Result<u64> {
    let mut iov: Vec<libc::iovec> = slices
        .iter()
        .map(|s| libc::iovec {
            iov_base: s.as_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect();
    let mut total = 0u64;
    let mut done = 0usize;
    while done < iov.len() {
        // SAFETY: iov[done..] points at live slices.
        let wrote = unsafe {
            libc::writev(
                fd,
                iov[done..].as_ptr(),
                (iov.len() - done).min(libc::c_int::MAX as usize) as libc::c_int,
            )
        };
        if wrote < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if wrote == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "vectored write made no progress",
            ));
        }
        let mut wrote = wrote as usize;
        total += wrote as u64;
        while done < iov.len() && wrote >= iov[done].iov_len {
            wrote -= iov[done].iov_len;
            done += 1;
        }
        if wrote != 0 {
            iov[done].iov_base = unsafe { (iov[done].iov_base as *mut u8).add(wrote) } as *mut _;
            iov[done].iov_len -= wrote;
        }
    }
    Ok(total)
}
