//! Single-allocation buffer arena backing the source readers.
//!
//! One anonymous mapping holds, in order: the registered read-buffer region
//! (two buckets per source), an optional extra registered area for the
//! caller, and an unregistered tail used for bookkeeping that must stay at
//! a stable address while the kernel looks at it (in-flight write iovecs).
//!
//! The kernel writes into the registered region while reads are in flight,
//! so the arena hands out raw regions instead of borrow-checked slices.
//! Callers uphold the loan discipline: a region is mutated only by its
//! reader while no loan is outstanding, and inspected only by the consumer
//! while one is.

use crate::error::MergeError;
use memmap2::MmapMut;
use std::ptr::NonNull;
use std::slice;

/// How the arena's mapping is carved up.
#[derive(Clone, Copy, Debug)]
pub struct ArenaLayout {
    /// Number of sources sharing the registered region.
    pub sources: usize,
    /// Bytes per bucket; each source owns two buckets.
    pub per_source: usize,
    /// Extra bytes appended to the registered region for the caller.
    pub extra_registered: usize,
    /// Unregistered tail bytes.
    pub tail: usize,
}

impl ArenaLayout {
    /// Length of the kernel-registered span.
    pub fn registered_len(&self) -> usize {
        self.sources * self.per_source * 2 + self.extra_registered
    }

    /// Total mapping length.
    pub fn total_len(&self) -> usize {
        self.registered_len() + self.tail
    }

    /// Offset of source `i`'s first bucket.
    pub fn bucket_a(&self, i: usize) -> usize {
        debug_assert!(i < self.sources);
        i * self.per_source
    }

    /// Offset of source `i`'s second bucket.
    pub fn bucket_b(&self, i: usize) -> usize {
        debug_assert!(i < self.sources);
        (self.sources + i) * self.per_source
    }

    /// Offset of the caller's extra registered area.
    pub fn extra_offset(&self) -> usize {
        self.sources * self.per_source * 2
    }

    /// Offset of the unregistered tail.
    pub fn tail_offset(&self) -> usize {
        self.registered_len()
    }
}

/// Owns the mapping; unmapped on drop.
pub struct Arena {
    // Held for its Drop; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<u8>,
    layout: ArenaLayout,
}

impl Arena {
    pub fn new(layout: ArenaLayout) -> Result<Self, MergeError> {
        let len = layout.total_len().max(1);
        let mut map = MmapMut::map_anon(len).map_err(|source| MergeError::Resource {
            what: "map the buffer arena",
            source,
        })?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or(MergeError::Invariant("anonymous mapping returned null"))?;
        Ok(Self {
            _map: map,
            base,
            layout,
        })
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Base pointer and length of the registered span, for
    /// `IORING_REGISTER_BUFFERS`.
    pub fn registered_span(&self) -> (*mut u8, usize) {
        (self.base.as_ptr(), self.layout.registered_len())
    }

    /// Raw pointer `offset` bytes into the mapping.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.layout.total_len());
        // SAFETY: offset is within the mapping (debug-asserted above and
        // upheld by the layout arithmetic of all callers).
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Shared view of a region.
    ///
    /// # Safety
    /// The region must lie within the mapping and must not be concurrently
    /// written, neither through [`Arena::region_mut`] nor by an in-flight
    /// kernel read targeting it.
    pub unsafe fn region(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.layout.total_len());
        slice::from_raw_parts(self.ptr_at(offset), len)
    }

    /// Mutable view of a region.
    ///
    /// # Safety
    /// Same bounds requirement as [`Arena::region`], and the region must not
    /// alias any other live view or in-flight read.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn region_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.layout.total_len());
        slice::from_raw_parts_mut(self.ptr_at(offset), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_partition_the_mapping() {
        let layout = ArenaLayout {
            sources: 3,
            per_source: 64,
            extra_registered: 16,
            tail: 32,
        };
        assert_eq!(layout.bucket_a(0), 0);
        assert_eq!(layout.bucket_a(2), 128);
        assert_eq!(layout.bucket_b(0), 192);
        assert_eq!(layout.bucket_b(2), 320);
        assert_eq!(layout.extra_offset(), 384);
        assert_eq!(layout.registered_len(), 400);
        assert_eq!(layout.tail_offset(), 400);
        assert_eq!(layout.total_len(), 432);
    }

    #[test]
    fn regions_are_writable_and_disjoint() {
        let layout = ArenaLayout {
            sources: 2,
            per_source: 8,
            extra_registered: 8,
            tail: 8,
        };
        let arena = Arena::new(layout).expect("map arena");
        unsafe {
            arena.region_mut(layout.bucket_a(0), 8).fill(b'a');
            arena.region_mut(layout.bucket_b(0), 8).fill(b'b');
            arena.region_mut(layout.extra_offset(), 8).fill(b'x');
            assert_eq!(arena.region(layout.bucket_a(0), 8), b"aaaaaaaa");
            assert_eq!(arena.region(layout.bucket_b(0), 8), b"bbbbbbbb");
            // the second source's buckets were never touched
            assert_eq!(arena.region(layout.bucket_a(1), 8), &[0u8; 8]);
        }
        let (ptr, len) = arena.registered_span();
        assert!(!ptr.is_null());
        assert_eq!(len, 40);
    }
}
