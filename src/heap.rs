//! Bounded stable min-heap keyed by borrowed byte slices.
//!
//! The merge keeps at most one entry per source in flight, so the heap is
//! fixed at source count and never grows. Keys borrow the source buffers
//! directly; entries carry a caller-assigned integer that settles equal
//! keys: lower values pop first. The sequence harness passes a plain
//! insertion counter (equal keys pop in push order); the merge driver packs
//! its run preference and the source index into the value instead.

use std::cmp::Ordering;

#[derive(Clone, Copy)]
struct HeapEntry<'k> {
    key: &'k [u8],
    value: u64,
}

impl HeapEntry<'_> {
    /// Slice `Ord` is bytewise with shorter-prefix-first, which is exactly
    /// the key order; the value breaks remaining ties so equal keys pop in
    /// insertion order.
    fn order(&self, other: &Self) -> Ordering {
        self.key
            .cmp(other.key)
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// Fixed-capacity min-heap over `(key slice, value)` pairs.
///
/// Storage is allocated once at construction. `push` reports fullness
/// instead of reallocating; everything else is total.
pub struct LineHeap<'k> {
    entries: Vec<HeapEntry<'k>>,
    capacity: usize,
}

impl<'k> LineHeap<'k> {
    /// Creates a heap that holds at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry and sifts it up. Returns `false` when full.
    pub fn push(&mut self, key: &'k [u8], value: u64) -> bool {
        if self.entries.len() == self.capacity {
            return false;
        }
        self.entries.push(HeapEntry { key, value });
        self.sift_up(self.entries.len() - 1);
        true
    }

    /// The smallest entry, without removing it.
    pub fn peek(&self) -> Option<(&'k [u8], u64)> {
        self.entries.first().map(|e| (e.key, e.value))
    }

    /// Removes and returns the smallest entry.
    pub fn pop(&mut self) -> Option<(&'k [u8], u64)> {
        if self.entries.is_empty() {
            return None;
        }
        let top = self.entries.swap_remove(0);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some((top.key, top.value))
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.entries[parent].order(&self.entries[at]) != Ordering::Greater {
                break;
            }
            self.entries.swap(parent, at);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * at + 1;
            if left >= len {
                break;
            }
            // Compare the children against each other first, then the winner
            // against the parent; equal siblings stay put that way.
            let right = left + 1;
            let child = if right < len
                && self.entries[right].order(&self.entries[left]) == Ordering::Less
            {
                right
            } else {
                left
            };
            if self.entries[at].order(&self.entries[child]) != Ordering::Greater {
                break;
            }
            self.entries.swap(at, child);
            at = child;
        }
    }
}

/// Pops recorded by [`run_sequence`].
///
/// A pop of an empty heap records an empty key and value `-1`, matching
/// what the harness prints.
#[derive(Debug, Default)]
pub struct SequenceLog {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<i64>,
}

impl SequenceLog {
    fn record(&mut self, popped: Option<(&[u8], u64)>) {
        match popped {
            Some((key, value)) => {
                self.keys.push(key.to_vec());
                self.values.push(value as i64);
            }
            None => {
                self.keys.push(Vec::new());
                self.values.push(-1);
            }
        }
    }

    /// Keys joined with `,`, lossily decoded.
    pub fn keys_joined(&self) -> String {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect();
        parts.join(",")
    }

    /// Values joined with `,`.
    pub fn values_joined(&self) -> String {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        parts.join(",")
    }
}

/// Interprets a push/pop sequence against `heap`, recording pops in `log`.
///
/// `,` pushes the bytes since the previous delimiter (also when empty) with
/// the next insertion number; `-` pushes any pending bytes first, then pops
/// once. The remaining bytes are pushed at the end of input, then the heap
/// is drained. Returns the highest insertion number handed out.
pub fn run_sequence<'k>(heap: &mut LineHeap<'k>, input: &'k [u8], log: &mut SequenceLog) -> u64 {
    while heap.pop().is_some() {}

    let mut insertions = 0u64;
    let mut item_start = 0usize;
    for (at, &byte) in input.iter().enumerate() {
        match byte {
            b',' => {
                insertions += 1;
                heap.push(&input[item_start..at], insertions);
                item_start = at + 1;
            }
            b'-' => {
                if item_start < at {
                    insertions += 1;
                    heap.push(&input[item_start..at], insertions);
                }
                log.record(heap.pop());
                item_start = at + 1;
            }
            _ => {}
        }
    }

    if item_start < input.len() {
        insertions += 1;
        heap.push(&input[item_start..], insertions);
    }

    while !heap.is_empty() {
        log.record(heap.pop());
    }
    insertions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(input: &str, expected_keys: &str, expected_values: &str, expected_max: u64) {
        let mut heap = LineHeap::with_capacity(input.len().max(1));
        let mut log = SequenceLog::default();
        let max = run_sequence(&mut heap, input.as_bytes(), &mut log);
        assert_eq!(log.keys_joined(), expected_keys, "keys for {input:?}");
        assert_eq!(log.values_joined(), expected_values, "values for {input:?}");
        assert_eq!(max, expected_max, "max insertion for {input:?}");
    }

    #[test]
    fn reverse_input_sorts() {
        check("z,y,x", "x,y,z", "3,2,1", 3);
    }

    #[test]
    fn shorter_prefix_pops_first() {
        check("app,apple,applejuice", "app,apple,applejuice", "1,2,3", 3);
        check("applejuice,app,apple", "app,apple,applejuice", "2,3,1", 3);
    }

    #[test]
    fn equal_keys_pop_in_insertion_order() {
        check("foo,foo,bar", "bar,foo,foo", "3,1,2", 3);
    }

    #[test]
    fn push_pop_alternating() {
        check("d-c-b-a", "d,c,b,a", "1,2,3,4", 4);
    }

    #[test]
    fn mixed_pushes_and_pops() {
        check("u,x-y,w--a,b", "u,w,x,a,b,y", "1,4,2,5,6,3", 6);
    }

    #[test]
    fn pop_on_empty_records_sentinel() {
        let mut heap = LineHeap::with_capacity(4);
        let mut log = SequenceLog::default();
        run_sequence(&mut heap, b"-", &mut log);
        assert_eq!(log.values, vec![-1]);
        assert_eq!(log.keys, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn push_fails_when_full() {
        let mut heap = LineHeap::with_capacity(2);
        assert!(heap.push(b"a", 1));
        assert!(heap.push(b"b", 2));
        assert!(!heap.push(b"c", 3));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.pop(), Some((&b"a"[..], 1)));
        assert!(heap.push(b"c", 3));
    }

    #[test]
    fn peek_matches_next_pop() {
        let mut heap = LineHeap::with_capacity(3);
        heap.push(b"m", 1);
        heap.push(b"a", 2);
        heap.push(b"z", 3);
        assert_eq!(heap.peek(), Some((&b"a"[..], 2)));
        assert_eq!(heap.pop(), Some((&b"a"[..], 2)));
        assert_eq!(heap.peek(), Some((&b"m"[..], 1)));
    }

    #[test]
    fn empty_key_precedes_everything() {
        let mut heap = LineHeap::with_capacity(2);
        heap.push(b"a", 1);
        heap.push(b"", 2);
        assert_eq!(heap.pop(), Some((&b""[..], 2)));
    }
}
