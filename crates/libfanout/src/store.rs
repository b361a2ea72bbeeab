use std::alloc::{self, Layout};

/// fd tag for bytes read from a child's stdout.
pub const STDOUT_TAG: u8 = 1;
/// fd tag for bytes read from a child's stderr.
pub const STDERR_TAG: u8 = 2;

const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<u32>();
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Append-only log of `(fd, bytes)` chunks for one child.
///
/// The slab is a single raw allocation held apart from the collection types
/// so that freeing it after a flush returns one large contiguous region to
/// the allocator at once instead of leaving it pinned in a `Vec`'s growth
/// history. Layout per chunk: `{u32 native-endian length}{u8 fd}{payload}`,
/// where the length counts the fd byte plus the payload.
pub struct ChunkStore {
    slab: *mut u8,
    len: usize,
    cap: usize,
    freed: bool,
}

// SAFETY: the raw pointer is owned exclusively by this store and is only
// touched through &mut self.
unsafe impl Send for ChunkStore {}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            slab: std::ptr::null_mut(),
            len: 0,
            cap: 0,
            freed: false,
        }
    }

    /// Total bytes held, chunk headers included. This is the exact amount
    /// charged against the global memory budget.
    pub fn len_bytes(&self) -> usize {
        self.len
    }

    /// Accounting size of one chunk before it is appended: header, fd tag,
    /// payload.
    pub fn chunk_size_with_header(payload_len: usize) -> u64 {
        (CHUNK_HEADER_SIZE + 1 + payload_len) as u64
    }

    pub fn append(&mut self, tag: u8, payload: &[u8]) {
        assert!(!self.freed, "append to a freed output store");
        assert!(!payload.is_empty(), "appended an empty chunk to the output store");

        let record_len = payload.len() + 1;
        let total = CHUNK_HEADER_SIZE + record_len;
        self.reserve(total);

        let header = (record_len as u32).to_ne_bytes();
        // SAFETY: reserve guaranteed self.len + total <= self.cap, and the
        // slab is a live allocation of self.cap bytes.
        unsafe {
            let dst = self.slab.add(self.len);
            std::ptr::copy_nonoverlapping(header.as_ptr(), dst, CHUNK_HEADER_SIZE);
            *dst.add(CHUNK_HEADER_SIZE) = tag;
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                dst.add(CHUNK_HEADER_SIZE + 1),
                payload.len(),
            );
        }
        self.len += total;
    }

    /// Walks the chunks front to back in append order.
    ///
    /// Panics on a zero-length chunk: every append carries at least the fd
    /// tag plus one payload byte, so an empty record means the slab was
    /// corrupted.
    pub fn drain(&self, mut visit: impl FnMut(u8, &[u8])) {
        let mut offset = 0;
        while offset < self.len {
            let mut header = [0u8; CHUNK_HEADER_SIZE];
            // SAFETY: offset + CHUNK_HEADER_SIZE <= self.len, checked below
            // through record_len; the slab holds self.len initialized bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.slab.add(offset),
                    header.as_mut_ptr(),
                    CHUNK_HEADER_SIZE,
                );
            }
            let record_len = u32::from_ne_bytes(header) as usize;
            offset += CHUNK_HEADER_SIZE;
            assert!(
                record_len > 1 && offset + record_len <= self.len,
                "corrupt chunk in output store: record of {record_len} bytes at offset {offset}"
            );
            let record =
                // SAFETY: bounds checked just above.
                unsafe { std::slice::from_raw_parts(self.slab.add(offset), record_len) };
            visit(record[0], &record[1..]);
            offset += record_len;
        }
    }

    /// Releases the slab back to the allocator. Appending afterwards is a
    /// bug and panics.
    pub fn free(&mut self) {
        if !self.slab.is_null() {
            // SAFETY: slab was allocated with this exact layout.
            unsafe { alloc::dealloc(self.slab, Self::layout(self.cap)) };
            self.slab = std::ptr::null_mut();
        }
        self.len = 0;
        self.cap = 0;
        self.freed = true;
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.cap {
            return;
        }
        if self.slab.is_null() {
            let cap = INITIAL_CAPACITY.max(needed);
            // SAFETY: cap > 0.
            let slab = unsafe { alloc::alloc(Self::layout(cap)) };
            if slab.is_null() {
                alloc::handle_alloc_error(Self::layout(cap));
            }
            self.slab = slab;
            self.cap = cap;
            return;
        }
        let new_cap = (needed * 2).max(self.cap * 2);
        // SAFETY: slab was allocated with layout(self.cap); new_cap > 0.
        let slab = unsafe { alloc::realloc(self.slab, Self::layout(self.cap), new_cap) };
        if slab.is_null() {
            alloc::handle_alloc_error(Self::layout(new_cap));
        }
        self.slab = slab;
        self.cap = new_cap;
    }

    fn layout(cap: usize) -> Layout {
        Layout::array::<u8>(cap).expect("slab layout overflow")
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(store: &ChunkStore) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        store.drain(|tag, payload| out.push((tag, payload.to_vec())));
        out
    }

    #[test]
    fn drain_returns_chunks_in_append_order() {
        let mut store = ChunkStore::new();
        store.append(STDOUT_TAG, b"first");
        store.append(STDERR_TAG, b"second");
        store.append(STDOUT_TAG, b"third");

        assert_eq!(
            collect(&store),
            vec![
                (STDOUT_TAG, b"first".to_vec()),
                (STDERR_TAG, b"second".to_vec()),
                (STDOUT_TAG, b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn round_trips_arbitrary_sequences() {
        let mut store = ChunkStore::new();
        let chunks: Vec<(u8, Vec<u8>)> = (1..=100)
            .map(|i: u32| {
                let tag = if i % 3 == 0 { STDERR_TAG } else { STDOUT_TAG };
                (tag, i.to_le_bytes().repeat(i as usize).to_vec())
            })
            .collect();
        for (tag, payload) in &chunks {
            store.append(*tag, payload);
        }
        assert_eq!(collect(&store), chunks);
    }

    #[test]
    fn growth_preserves_earlier_chunks() {
        let mut store = ChunkStore::new();
        let big = vec![0xabu8; INITIAL_CAPACITY];
        store.append(STDOUT_TAG, b"small");
        store.append(STDOUT_TAG, &big);
        let collected = collect(&store);
        assert_eq!(collected[0].1, b"small");
        assert_eq!(collected[1].1, big);
    }

    #[test]
    fn len_bytes_matches_accounting_helper() {
        let mut store = ChunkStore::new();
        store.append(STDOUT_TAG, b"ab");
        store.append(STDERR_TAG, b"cdef");
        let expected =
            ChunkStore::chunk_size_with_header(2) + ChunkStore::chunk_size_with_header(4);
        assert_eq!(store.len_bytes() as u64, expected);
    }

    #[test]
    fn free_empties_the_store() {
        let mut store = ChunkStore::new();
        store.append(STDOUT_TAG, b"gone");
        store.free();
        assert!(store.is_freed());
        assert_eq!(store.len_bytes(), 0);
        assert!(collect(&store).is_empty());
    }

    #[test]
    #[should_panic(expected = "empty chunk")]
    fn empty_chunks_are_rejected() {
        let mut store = ChunkStore::new();
        store.append(STDOUT_TAG, b"");
    }

    #[test]
    #[should_panic(expected = "freed output store")]
    fn append_after_free_is_rejected() {
        let mut store = ChunkStore::new();
        store.append(STDOUT_TAG, b"x");
        store.free();
        store.append(STDOUT_TAG, b"y");
    }
}
