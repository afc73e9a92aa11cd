//! A chain is a FIFO of chunks attached to one direction of a connection or
//! to a message under construction. Bytes are appended at the tail chunk and
//! consumed from the head chunk; fully drained head chunks are returned to
//! the pool immediately so the chain never holds more memory than its live
//! data needs.

use crate::mbuf::{Chunk, ChunkPool};
use shoal_support::error::ProxyResult;
use std::io::{Read, Write};

pub struct Chain {
    chunks: Vec<Chunk>,
}

impl Chain {
    pub fn new(pool: &mut ChunkPool) -> Chain {
        Chain {
            chunks: vec![pool.alloc()],
        }
    }

    /// Total unread bytes across every chunk in the chain.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::remaining_data).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read as much as the reader offers into the chain, growing new chunks
    /// from the pool as the tail fills up. Returns the total bytes read.
    /// Returns `Wait` only if nothing at all was read before the first
    /// would-block; any partial progress is reported as `Ok`.
    pub fn ingress<R: Read>(&mut self, reader: &mut R, pool: &mut ChunkPool) -> ProxyResult<usize> {
        let mut total = 0;
        loop {
            let tail = self.chunks.last_mut().expect("chain always has a tail chunk");
            if tail.capacity() == 0 {
                self.chunks.push(pool.alloc());
                continue;
            }

            match reader.read(tail.writeable_slice()) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    tail.expand(n);
                    total += n;
                }
                Err(e) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Write as much of the chain as the writer accepts, reclaiming fully
    /// drained head chunks back into the pool. Returns bytes written.
    pub fn egress<W: Write>(&mut self, writer: &mut W, pool: &mut ChunkPool) -> ProxyResult<usize> {
        let mut total = 0;
        loop {
            if self.chunks.len() > 1 {
                let head = &mut self.chunks[0];
                if head.is_empty() {
                    pool.reclaim(self.chunks.remove(0));
                    continue;
                }
            }

            let head = &mut self.chunks[0];
            if head.is_empty() {
                return Ok(total);
            }

            match writer.write(head.readable_slice()) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    head.advance(n);
                    total += n;
                }
                Err(e) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Append locally-synthesized bytes (a memcached reply line, an error
    /// message) at the tail, growing chunks from the pool as needed.
    pub fn push(&mut self, mut bytes: &[u8], pool: &mut ChunkPool) {
        while !bytes.is_empty() {
            let tail = self.chunks.last_mut().expect("chain always has a tail chunk");
            let room = tail.capacity();
            if room == 0 {
                self.chunks.push(pool.alloc());
                continue;
            }

            let take = room.min(bytes.len());
            tail.write(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Byte at logical offset `at` from the current head, without consuming
    /// anything. Used by the parser to scan for a CRLF or command boundary
    /// ahead of the current cursor.
    pub fn byte_at(&self, at: usize) -> Option<u8> {
        let mut remaining = at;
        for chunk in &self.chunks {
            let data = chunk.readable_slice();
            if remaining < data.len() {
                return Some(data[remaining]);
            }
            remaining -= data.len();
        }
        None
    }

    /// Copy out `len` bytes starting at logical offset `at`, without
    /// consuming them. Used for short header fields (command, key, flags)
    /// that the parser needs as an owned value; bulk payload data is never
    /// copied this way, it stays referenced in place via `consume`.
    pub fn copy_range(&self, at: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = at;
        let mut need = len;

        for chunk in &self.chunks {
            if need == 0 {
                break;
            }
            let data = chunk.readable_slice();
            if remaining >= data.len() {
                remaining -= data.len();
                continue;
            }
            let start = remaining;
            let take = (data.len() - start).min(need);
            out.extend_from_slice(&data[start..start + take]);
            need -= take;
            remaining = 0;
        }

        out
    }

    /// Consume `count` bytes from the head, reclaiming any chunk that
    /// becomes fully drained as a result.
    pub fn consume(&mut self, mut count: usize, pool: &mut ChunkPool) {
        while count > 0 {
            let head = self.chunks.first_mut().expect("chain always has a head chunk");
            let available = head.remaining_data();
            let take = available.min(count);
            head.advance(take);
            count -= take;

            if head.is_empty() && self.chunks.len() > 1 {
                pool.reclaim(self.chunks.remove(0));
            } else if count > 0 {
                // Took everything from this chunk but more is requested and
                // it was the last one: nothing further to consume.
                break;
            }
        }
    }

    /// True once the readable prefix, starting at the head, contains at
    /// least `len` contiguous bytes within a single chunk. When false and
    /// more than one chunk holds the requested range, the parser's caller
    /// should fall back to `copy_range`, which walks chunk boundaries.
    pub fn head_contiguous_len(&self) -> usize {
        self.chunks.first().map(Chunk::remaining_data).unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Release every chunk back to the pool. Used when a connection closes.
    pub fn drain_to_pool(&mut self, pool: &mut ChunkPool) {
        for chunk in self.chunks.drain(..) {
            pool.reclaim(chunk);
        }
        self.chunks.push(pool.alloc());
    }
}
