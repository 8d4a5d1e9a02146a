//! Linux io_uring reader.
//!
//! One ring serves every source. Setup registers a sparse fixed-file table
//! and one buffer spanning the arena's read region, restricts the ring to
//! the operations this reader submits, then issues each source's open and
//! first read as a linked pair: the open lands in a fixed-file slot, so the
//! read can name the slot before the open completes, and successful opens
//! suppress their completions entirely. After that the reader keeps one
//! read in flight per source, alternating between the source's two buckets;
//! the next read is submitted when the previous loan is returned, after the
//! carry bytes are staged at the target bucket's head.
//!
//! Completion tags pack `{op, file}` into the 64-bit user data. The crate's
//! typed submission/completion queues carry the acquire/release ordering at
//! the user/kernel boundary.

use super::{path_display, BucketMap, Loan, ReaderConfig, WRITE_IOVEC_CAP};
use crate::arena::Arena;
use crate::error::MergeError;
use io_uring::{opcode, register::Restriction, squeue, types, IoUring};
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::mem::{align_of, size_of};
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

const OP_OPEN: u32 = 0;
const OP_READ_A: u32 = 1;
const OP_READ_B: u32 = 2;
const OP_WRITE: u32 = 3;
const OP_CANCEL: u32 = 4;

/// File field of tags that do not belong to a source.
const NO_FILE: u32 = u32::MAX;

fn tag(file: u32, op: u32) -> u64 {
    (u64::from(op) << 32) | u64::from(file)
}

fn untag(data: u64) -> (u32, u32) {
    (data as u32, (data >> 32) as u32)
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    A,
    B,
}

impl Bucket {
    fn flip(self) -> Self {
        match self {
            Bucket::A => Bucket::B,
            Bucket::B => Bucket::A,
        }
    }

    fn read_op(self) -> u32 {
        match self {
            Bucket::A => OP_READ_A,
            Bucket::B => OP_READ_B,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Inflight {
    bucket: Bucket,
    /// Bucket base offset the read targets (carry occupies its head).
    off: usize,
    carry: usize,
}

struct RingSource {
    path: CString,
    display: String,
    bytes_read: u64,
    inflight: Option<Inflight>,
    next_bucket: Bucket,
    loaned: bool,
    eof: bool,
    eof_reported: bool,
    closed: bool,
}

struct PendingWrite {
    /// Remaining (ptr, len) pieces, advanced across short writes.
    slices: Vec<(usize, usize)>,
}

pub struct UringReader {
    ring: IoUring,
    buckets: BucketMap,
    sources: Vec<RingSource>,
    base: NonNull<u8>,
    iovecs: *mut libc::iovec,
    open_files: u32,
    in_flight_reads: u32,
    pending: VecDeque<Loan>,
    pending_write: Option<PendingWrite>,
    written: u64,
    out_fd: RawFd,
}

impl UringReader {
    /// Creates the ring, registers resources, and submits every source's
    /// linked open+read pair.
    pub fn open(paths: &[&Path], arena: &Arena, config: &ReaderConfig) -> Result<Self, MergeError> {
        let n = paths.len();
        let layout = arena.layout();
        debug_assert_eq!(layout.sources, n);
        debug_assert_eq!(layout.per_source, config.per_source_buffer);

        // One completion per source suffices (successful opens are skipped),
        // but the initial half+half submission needs an even entry count.
        let entries = ((n + (n & 1)) as u32).max(2);
        let ring = build_ring(entries)?;

        let mut restrictions = [
            Restriction::sqe_flags_allowed(
                (squeue::Flags::IO_LINK | squeue::Flags::SKIP_SUCCESS | squeue::Flags::FIXED_FILE)
                    .bits(),
            ),
            Restriction::sqe_op(opcode::OpenAt::CODE),
            Restriction::sqe_op(opcode::ReadFixed::CODE),
            Restriction::sqe_op(opcode::Writev::CODE),
            Restriction::sqe_op(opcode::AsyncCancel::CODE),
        ];
        ring.submitter()
            .register_restrictions(&mut restrictions)
            .map_err(resource("restrict ring operations"))?;
        ring.submitter()
            .register_files_sparse(n as u32)
            .map_err(resource("register the file table"))?;
        let (span_ptr, span_len) = arena.registered_span();
        let span = libc::iovec {
            iov_base: span_ptr.cast(),
            iov_len: span_len,
        };
        // SAFETY: the span covers the arena's registered region, which lives
        // as long as the ring (the merge owns both, reader first).
        unsafe { ring.submitter().register_buffers(&[span]) }
            .map_err(resource("register the read buffers"))?;
        ring.submitter()
            .register_enable_rings()
            .map_err(resource("enable the ring"))?;

        let sources = paths
            .iter()
            .map(|path| {
                let display = path_display(path);
                let cstr = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                    MergeError::Open {
                        path: display.clone(),
                        source: io::Error::from(io::ErrorKind::InvalidInput),
                    }
                })?;
                Ok(RingSource {
                    path: cstr,
                    display,
                    bytes_read: 0,
                    inflight: None,
                    next_bucket: Bucket::A,
                    loaned: false,
                    eof: false,
                    eof_reported: false,
                    closed: false,
                })
            })
            .collect::<Result<Vec<_>, MergeError>>()?;

        let base = NonNull::new(span_ptr)
            .ok_or(MergeError::Invariant("arena base pointer is null"))?;
        let iov_off = align_up(layout.tail_offset(), align_of::<libc::iovec>());
        debug_assert!(
            iov_off + WRITE_IOVEC_CAP * size_of::<libc::iovec>() <= layout.total_len(),
            "arena tail too small for write scratch"
        );
        let iovecs = arena.ptr_at(iov_off).cast::<libc::iovec>();

        let mut reader = Self {
            ring,
            buckets: BucketMap::new(n, config.per_source_buffer),
            sources,
            base,
            iovecs,
            open_files: n as u32,
            in_flight_reads: 0,
            pending: VecDeque::with_capacity(n),
            pending_write: None,
            written: 0,
            out_fd: config.out_fd,
        };

        // First half, drain the submission queue, then the rest.
        let half = n / 2;
        for i in 0..half {
            reader.push_open_read(i)?;
        }
        reader.submit()?;
        for i in half..n {
            reader.push_open_read(i)?;
        }
        reader.submit()?;
        Ok(reader)
    }

    fn arena_ptr(&self, off: usize) -> *mut u8 {
        self.base.as_ptr().wrapping_add(off)
    }

    fn submit(&self) -> Result<(), MergeError> {
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(MergeError::Resource {
                        what: "submit ring entries",
                        source,
                    })
                }
            }
        }
    }

    fn push_sqe(&mut self, entry: &squeue::Entry) -> Result<(), MergeError> {
        let mut sq = self.ring.submission();
        // SAFETY: every entry's buffers (paths, arena regions, the iovec
        // scratch) stay valid until the operation completes.
        unsafe { sq.push(entry) }
            .map_err(|_| MergeError::Invariant("submission queue overflow"))
    }

    /// Queues the linked open + first read for source `i`.
    fn push_open_read(&mut self, i: usize) -> Result<(), MergeError> {
        let region = self.buckets.region(i);
        let slot = types::DestinationSlot::try_from_slot_target(i as u32)
            .map_err(|_| MergeError::Invariant("fixed-file slot out of range"))?;
        let open = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), self.sources[i].path.as_ptr())
            .flags(libc::O_RDONLY)
            .mode(0o400)
            .file_index(Some(slot))
            .build()
            .flags(squeue::Flags::IO_LINK | squeue::Flags::SKIP_SUCCESS)
            .user_data(tag(i as u32, OP_OPEN));
        let read = opcode::ReadFixed::new(
            types::Fixed(i as u32),
            self.arena_ptr(region.a_off),
            region.size as u32,
            0,
        )
        .offset(0)
        .build()
        .user_data(tag(i as u32, OP_READ_A));

        self.push_sqe(&open)?;
        self.push_sqe(&read)?;
        let src = &mut self.sources[i];
        src.inflight = Some(Inflight {
            bucket: Bucket::A,
            off: region.a_off,
            carry: 0,
        });
        src.next_bucket = Bucket::B;
        self.in_flight_reads += 1;
        Ok(())
    }

    pub fn next_event(&mut self) -> Result<Option<Loan>, MergeError> {
        loop {
            if let Some(loan) = self.pending.pop_front() {
                return Ok(Some(loan));
            }
            self.drain_completions()?;
            if let Some(loan) = self.pending.pop_front() {
                return Ok(Some(loan));
            }
            if self.in_flight_reads == 0 && self.pending_write.is_none() {
                return Ok(None);
            }
            self.submit_and_wait(1)?;
        }
    }

    fn submit_and_wait(&self, want: usize) -> Result<(), MergeError> {
        loop {
            match self.ring.submit_and_wait(want) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(MergeError::Resource {
                        what: "wait for ring completions",
                        source,
                    })
                }
            }
        }
    }

    fn drain_completions(&mut self) -> Result<(), MergeError> {
        loop {
            let next = {
                let mut cq = self.ring.completion();
                cq.next()
            };
            let Some(cqe) = next else { break };
            let (file, op) = untag(cqe.user_data());
            let res = cqe.result();
            match op {
                OP_OPEN => {
                    // Successful opens are suppressed; tolerate them anyway
                    // in case the link was broken and the skip ignored.
                    if res < 0 {
                        return Err(MergeError::Open {
                            path: self.sources[file as usize].display.clone(),
                            source: io::Error::from_raw_os_error(-res),
                        });
                    }
                }
                OP_READ_A | OP_READ_B => {
                    self.in_flight_reads -= 1;
                    self.complete_read(file as usize, res)?;
                }
                OP_WRITE => self.complete_write(res)?,
                OP_CANCEL => {}
                _ => return Err(MergeError::Invariant("unexpected completion tag")),
            }
        }
        Ok(())
    }

    fn complete_read(&mut self, i: usize, res: i32) -> Result<(), MergeError> {
        let src = &mut self.sources[i];
        if res == -libc::ECANCELED {
            src.inflight = None;
            return Ok(());
        }
        let Some(infl) = src.inflight.take() else {
            if src.closed {
                // Raced with close_source; the bytes are no longer wanted.
                return Ok(());
            }
            return Err(MergeError::Invariant(
                "read completion without an in-flight record",
            ));
        };
        if src.closed {
            return Ok(());
        }
        if res < 0 {
            return Err(MergeError::Read {
                path: src.display.clone(),
                source: io::Error::from_raw_os_error(-res),
            });
        }
        let got = res as usize;
        src.bytes_read += got as u64;
        if got == 0 {
            src.eof = true;
            self.open_files -= 1;
            if infl.carry == 0 {
                src.eof_reported = true;
                self.pending.push_back(Loan::eof(i as u32));
                return Ok(());
            }
        }
        src.loaned = true;
        let ptr = self.base.as_ptr().wrapping_add(infl.off);
        self.pending
            .push_back(Loan::new(i as u32, ptr, infl.carry + got));
        Ok(())
    }

    pub fn return_loan(&mut self, loan: Loan, carry: Range<usize>) -> Result<(), MergeError> {
        let i = loan.source as usize;
        {
            let src = &mut self.sources[i];
            if !src.loaned {
                return Err(MergeError::Invariant("loan returned twice"));
            }
            src.loaned = false;
            if src.eof || src.closed {
                if src.eof && !src.eof_reported && !src.closed {
                    src.eof_reported = true;
                    self.pending.push_back(Loan::eof(i as u32));
                }
                return Ok(());
            }
        }

        let region = self.buckets.region(i);
        let bucket = self.sources[i].next_bucket;
        let dst_off = match bucket {
            Bucket::A => region.a_off,
            Bucket::B => region.b_off,
        };
        let carry_len = carry.len();
        debug_assert!(carry.end <= loan.len());
        debug_assert!(carry_len < region.size);
        if carry_len > 0 {
            // Stage the unterminated tail at the target bucket's head. The
            // regions can overlap after a donation, so copy with memmove
            // semantics.
            unsafe {
                std::ptr::copy(
                    loan.ptr().add(carry.start),
                    self.arena_ptr(dst_off),
                    carry_len,
                );
            }
        }

        let read = opcode::ReadFixed::new(
            types::Fixed(i as u32),
            self.arena_ptr(dst_off + carry_len),
            (region.size - carry_len) as u32,
            0,
        )
        .offset(self.sources[i].bytes_read)
        .build()
        .user_data(tag(i as u32, bucket.read_op()));
        self.push_sqe(&read)?;
        self.submit()?;

        let src = &mut self.sources[i];
        src.inflight = Some(Inflight {
            bucket,
            off: dst_off,
            carry: carry_len,
        });
        src.next_bucket = bucket.flip();
        self.in_flight_reads += 1;
        Ok(())
    }

    /// Queues a vectored write of `slices` to the output descriptor; when a
    /// loan is supplied, a follow-up read into the loan's bucket is linked
    /// behind the write, so the buffer is reused only after the write has
    /// read it.
    pub fn write_and_return_loan(
        &mut self,
        slices: &[&[u8]],
        loan: Option<Loan>,
    ) -> Result<(), MergeError> {
        // One ring write at a time keeps output ordering trivial.
        self.wait_for_write(true)?;
        if slices.len() > WRITE_IOVEC_CAP {
            return Err(MergeError::Invariant("too many slices for one ring write"));
        }

        let pieces: Vec<(usize, usize)> = slices
            .iter()
            .map(|s| (s.as_ptr() as usize, s.len()))
            .collect();
        self.stage_iovecs(&pieces);
        let mut write = opcode::Writev::new(
            types::Fd(self.out_fd),
            self.iovecs,
            pieces.len() as u32,
        )
        .offset(u64::MAX)
        .build()
        .user_data(tag(NO_FILE, OP_WRITE));
        if loan.is_some() {
            write = write.flags(squeue::Flags::IO_LINK);
        }
        self.push_sqe(&write)?;
        self.pending_write = Some(PendingWrite { slices: pieces });

        if let Some(loan) = loan {
            let i = loan.source as usize;
            let eligible = {
                let src = &mut self.sources[i];
                if !src.loaned {
                    return Err(MergeError::Invariant("loan returned twice"));
                }
                src.loaned = false;
                if src.eof || src.closed {
                    if src.eof && !src.eof_reported && !src.closed {
                        src.eof_reported = true;
                        self.pending.push_back(Loan::eof(i as u32));
                    }
                    false
                } else {
                    true
                }
            };
            if eligible {
                let region = self.buckets.region(i);
                let off = loan.ptr() as usize - self.base.as_ptr() as usize;
                let bucket = if off == region.a_off {
                    Bucket::A
                } else {
                    Bucket::B
                };
                let read = opcode::ReadFixed::new(
                    types::Fixed(i as u32),
                    self.arena_ptr(off),
                    region.size as u32,
                    0,
                )
                .offset(self.sources[i].bytes_read)
                .build()
                .user_data(tag(i as u32, bucket.read_op()));
                self.push_sqe(&read)?;
                let src = &mut self.sources[i];
                src.inflight = Some(Inflight {
                    bucket,
                    off,
                    carry: 0,
                });
                self.in_flight_reads += 1;
            }
        }
        self.submit()
    }

    fn stage_iovecs(&mut self, pieces: &[(usize, usize)]) {
        for (at, &(ptr, len)) in pieces.iter().enumerate() {
            // SAFETY: `iovecs` points at WRITE_IOVEC_CAP aligned slots in
            // the arena tail; `at` is bounded by the caller.
            unsafe {
                self.iovecs.add(at).write(libc::iovec {
                    iov_base: ptr as *mut libc::c_void,
                    iov_len: len,
                });
            }
        }
    }

    fn complete_write(&mut self, res: i32) -> Result<(), MergeError> {
        let Some(mut pw) = self.pending_write.take() else {
            return Err(MergeError::Invariant("write completion without a pending write"));
        };
        if res < 0 {
            return Err(MergeError::Write {
                source: io::Error::from_raw_os_error(-res),
            });
        }
        let mut wrote = res as usize;
        if wrote == 0 && pw.slices.iter().any(|&(_, len)| len > 0) {
            return Err(MergeError::Write {
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    "vectored write made no progress",
                ),
            });
        }
        self.written += wrote as u64;

        let mut done = 0;
        while done < pw.slices.len() && wrote >= pw.slices[done].1 {
            wrote -= pw.slices[done].1;
            done += 1;
        }
        if done == pw.slices.len() {
            return Ok(());
        }
        // Short write: advance the partially-written slice and resubmit the
        // remainder (the linked read, if any, has already fired).
        pw.slices.drain(..done);
        pw.slices[0].0 += wrote;
        pw.slices[0].1 -= wrote;
        self.stage_iovecs(&pw.slices);
        let write = opcode::Writev::new(
            types::Fd(self.out_fd),
            self.iovecs,
            pw.slices.len() as u32,
        )
        .offset(u64::MAX)
        .build()
        .user_data(tag(NO_FILE, OP_WRITE));
        self.push_sqe(&write)?;
        self.pending_write = Some(pw);
        self.submit()
    }

    /// Waits for the queued write (`now`), or leaves it for the next
    /// completion drain (`!now`).
    pub fn wait_for_write(&mut self, now: bool) -> Result<(), MergeError> {
        if !now {
            return Ok(());
        }
        while self.pending_write.is_some() {
            self.drain_completions()?;
            if self.pending_write.is_none() {
                break;
            }
            self.submit_and_wait(1)?;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Stops reading source `i`: cancels its in-flight read and donates its
    /// buckets to the next open source.
    pub fn close_source(&mut self, i: usize) -> Result<(), MergeError> {
        let (cancel_op, was_open) = {
            let src = &mut self.sources[i];
            if src.closed {
                return Ok(());
            }
            src.closed = true;
            let op = src.inflight.take().map(|infl| infl.bucket.read_op());
            let was_open = !src.eof;
            src.eof = true;
            (op, was_open)
        };
        if was_open {
            self.open_files -= 1;
        }
        if let Some(op) = cancel_op {
            let cancel = opcode::AsyncCancel::new(tag(i as u32, op))
                .build()
                .user_data(tag(i as u32, OP_CANCEL));
            self.push_sqe(&cancel)?;
            self.submit()?;
        }
        self.buckets.close(i);
        Ok(())
    }

    pub fn bytes_read(&self) -> u64 {
        self.sources.iter().map(|s| s.bytes_read).sum()
    }

    pub fn open_sources(&self) -> u32 {
        self.open_files
    }
}

fn resource(what: &'static str) -> impl FnOnce(io::Error) -> MergeError {
    move |source| MergeError::Resource { what, source }
}

fn build_ring(entries: u32) -> Result<IoUring, MergeError> {
    let full = IoUring::builder()
        .setup_cqsize(entries)
        .setup_r_disabled()
        .setup_submit_all()
        .setup_coop_taskrun()
        .build(entries);
    match full {
        Ok(ring) => Ok(ring),
        // Older kernels reject the optional flags; retry with the required
        // set only.
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => IoUring::builder()
            .setup_cqsize(entries)
            .setup_r_disabled()
            .build(entries)
            .map_err(resource("create ring")),
        Err(source) => Err(MergeError::Resource {
            what: "create ring",
            source,
        }),
    }
}
