//! Fixed-capacity byte chunks and their pool. A chunk is a linear memory
//! region with two cursors: consuming data advances `start`, writing data
//! advances `end`. When both coincide the chunk is empty and its cursors
//! are reset to the origin so the whole capacity becomes available again.

/// Lower and upper bounds on chunk capacity. Values outside this range are
/// rejected by configuration validation before any chunk is ever allocated.
pub const MIN_CHUNK_SIZE: usize = 512;
pub const MAX_CHUNK_SIZE: usize = 65536;
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

pub struct Chunk {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Chunk {
    #[inline]
    pub fn new(size: usize) -> Chunk {
        debug_assert!(size >= MIN_CHUNK_SIZE && size <= MAX_CHUNK_SIZE);
        Chunk {
            data: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Free capacity at the write end.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len() - self.end
    }

    /// Unread bytes at the read end.
    #[inline]
    pub fn remaining_data(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    /// Consume `count` bytes from the read end and return them.
    #[inline]
    pub fn read(&mut self, count: usize) -> &[u8] {
        let orig_start = self.start;
        let offset = self.start + count;

        self.validate_advance(count);
        self.start += count;
        self.check_clear();

        &self.data[orig_start..offset]
    }

    /// Append `slice` at the write end. Panics if it would not fit; callers
    /// must check `capacity()` first, which every caller in this crate does
    /// via the chain, which never writes past what `writeable_slice` offers.
    #[inline]
    pub fn write(&mut self, slice: &[u8]) {
        self.data[self.end..(self.end + slice.len())].copy_from_slice(slice);
        self.end += slice.len();
    }

    /// Advance the read cursor, as if `count` bytes had been consumed by a
    /// caller operating directly on `readable_slice`.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.validate_advance(count);
        self.start += count;
        self.check_clear();
    }

    /// Advance the write cursor, as if `count` bytes had been written
    /// directly into `writeable_slice` (e.g. by a socket read).
    #[inline]
    pub fn expand(&mut self, count: usize) {
        let new_end = self.end + count;
        if new_end > self.data.len() {
            panic!("attempted to expand chunk past its capacity");
        }
        self.end = new_end;
    }

    #[inline]
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    #[inline]
    pub fn writeable_slice(&mut self) -> &mut [u8] {
        let end = self.data.len();
        &mut self.data[self.end..end]
    }

    /// Reset both cursors to the origin, discarding any data. Used when a
    /// chunk is returned to the pool still holding unconsumed bytes (e.g.
    /// a half-closed connection being torn down).
    #[inline]
    pub fn rewind(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Split off the bytes in `[at, end)` into a brand-new chunk, truncating
    /// this chunk to end at `at`. The new chunk is passed to `prepend`
    /// before its tail is copied in, letting a caller prepend a synthesized
    /// header (e.g. a `get` line restricted to one server's keys) without
    /// copying the value payload it is attached to.
    pub fn split<F>(&mut self, at: usize, size: usize, mut prepend: F) -> Chunk
    where
        F: FnMut(&mut Chunk),
    {
        assert!(at >= self.start && at <= self.end, "split point out of range");

        let tail_len = self.end - at;
        let mut tail = Chunk::new(size);
        prepend(&mut tail);
        let header_len = tail.remaining_data();
        tail.write(&self.data[at..self.end]);

        self.end = at;
        self.check_clear();

        debug_assert_eq!(tail.remaining_data(), header_len + tail_len);
        tail
    }

    #[inline]
    fn check_clear(&mut self) {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    #[inline]
    fn validate_advance(&self, count: usize) {
        if self.start + count > self.end {
            panic!("attempted to advance past chunk edge");
        }
    }
}

/// Free-list pool of chunks of a single, fixed size. `alloc` reuses a
/// returned chunk if one is available, otherwise allocates fresh. `reclaim`
/// resets the chunk's cursors and returns it to the free list, unless the
/// pool is already at its soft cap, in which case the chunk is dropped.
pub struct ChunkPool {
    size: usize,
    free: Vec<Chunk>,
    soft_cap: usize,
}

impl ChunkPool {
    pub fn new(size: usize) -> ChunkPool {
        ChunkPool::with_cap(size, 4096)
    }

    pub fn with_cap(size: usize, soft_cap: usize) -> ChunkPool {
        ChunkPool {
            size,
            free: Vec::new(),
            soft_cap,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.size
    }

    pub fn alloc(&mut self) -> Chunk {
        self.free.pop().unwrap_or_else(|| Chunk::new(self.size))
    }

    pub fn reclaim(&mut self, mut chunk: Chunk) {
        chunk.rewind();
        if self.free.len() < self.soft_cap {
            self.free.push(chunk);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chunk_is_empty() {
        let chunk = Chunk::new(DEFAULT_CHUNK_SIZE);
        assert_eq!(chunk.size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(chunk.capacity(), DEFAULT_CHUNK_SIZE);
        assert_eq!(chunk.remaining_data(), 0);
        assert!(chunk.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut chunk = Chunk::new(64);
        chunk.write(b"hello");
        assert_eq!(chunk.remaining_data(), 5);
        assert_eq!(chunk.read(5), b"hello");
        assert!(chunk.is_empty());
    }

    #[test]
    fn reading_to_the_end_resets_cursors() {
        let mut chunk = Chunk::new(64);
        chunk.write(&[1, 2, 3, 4]);
        assert_eq!(chunk.read(2), &[1u8, 2u8]);
        assert_eq!(chunk.read(2), &[3u8, 4u8]);
        assert!(chunk.is_empty());
        assert_eq!(chunk.capacity(), 64);
    }

    #[test]
    #[should_panic(expected = "attempted to advance past chunk edge")]
    fn read_past_end_panics() {
        let mut chunk = Chunk::new(64);
        chunk.write(&[1, 2, 3, 4]);
        chunk.read(5);
    }

    #[test]
    #[should_panic(expected = "attempted to expand chunk past its capacity")]
    fn expand_past_capacity_panics() {
        let mut chunk = Chunk::new(64);
        chunk.expand(65);
    }

    #[test]
    fn split_moves_tail_into_a_new_chunk_with_prepended_header() {
        let mut chunk = Chunk::new(64);
        chunk.write(b"get a b\r\n");
        let split_at = chunk.readable_slice().len() - 2; // keep "a b\r\n" as the tail, roughly
        let at = chunk.start + split_at;

        let tail = chunk.split(at, 64, |c| c.write(b"get "));
        assert!(tail.readable_slice().starts_with(b"get "));
        assert_eq!(
            chunk.readable_slice().len() + (tail.readable_slice().len() - 4),
            9
        );
    }

    #[test]
    fn pool_reuses_reclaimed_chunks() {
        let mut pool = ChunkPool::new(64);
        let chunk = pool.alloc();
        assert_eq!(pool.pooled(), 0);
        pool.reclaim(chunk);
        assert_eq!(pool.pooled(), 1);
        let reused = pool.alloc();
        assert_eq!(reused.size(), 64);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_drops_beyond_soft_cap() {
        let mut pool = ChunkPool::with_cap(64, 1);
        pool.reclaim(Chunk::new(64));
        pool.reclaim(Chunk::new(64));
        assert_eq!(pool.pooled(), 1);
    }
}
