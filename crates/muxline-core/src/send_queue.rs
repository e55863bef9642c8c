//! PooledSendQueue - bytes waiting for a socket to become writable
//!
//! `size()` is the byte total used for backpressure, `count()` the number of
//! discrete buffers used to size vectored writes.

use std::collections::VecDeque;

use crate::constants::MAX_POOL_BLOCK;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, PoolBuf};

#[derive(Debug, Default)]
pub struct PooledSendQueue {
    bufs: VecDeque<PoolBuf>,
    bytes: usize,
}

impl PooledSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queued bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// Number of queued buffers.
    #[inline]
    pub fn count(&self) -> usize {
        self.bufs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Copy `data` into pooled buffers at the tail.
    ///
    /// The tail buffer's free space is filled first so runs of small writes
    /// coalesce. Either all of `data` is queued or, on pool exhaustion,
    /// nothing is.
    pub fn push(&mut self, pool: &BufferPool, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        // Plan against the tail's room after compaction, so the tail takes
        // exactly `tail_room` bytes below and fresh blocks the rest.
        let tail_room = match self.bufs.back_mut() {
            Some(tail) => {
                if data.len() > tail.remaining() {
                    tail.compact();
                }
                tail.remaining()
            }
            None => 0,
        };
        let mut rest = data.len().saturating_sub(tail_room);

        let mut fresh = Vec::new();
        while rest > 0 {
            let want = rest.min(MAX_POOL_BLOCK);
            let buf = pool
                .allocate(want)
                .ok_or(Error::PoolExhausted { requested: want })?;
            rest -= want;
            fresh.push(buf);
        }

        let mut data = data;
        if let Some(tail) = self.bufs.back_mut() {
            let n = tail.extend_from_slice(data);
            data = &data[n..];
            self.bytes += n;
        }
        for mut buf in fresh {
            let n = buf.extend_from_slice(data);
            if n == 0 {
                break;
            }
            data = &data[n..];
            self.bytes += n;
            self.bufs.push_back(buf);
        }
        debug_assert!(data.is_empty());
        Ok(())
    }

    /// Queued data in send order, one slice per buffer.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.bufs.iter().map(PoolBuf::as_slice)
    }

    #[inline]
    pub fn front(&self) -> Option<&[u8]> {
        self.bufs.front().map(PoolBuf::as_slice)
    }

    /// Mark `n` bytes as sent: fully sent buffers go back to the pool, a
    /// partially sent one is shifted.
    pub fn consume(&mut self, mut n: usize) {
        n = n.min(self.bytes);
        self.bytes -= n;
        while n > 0 {
            let Some(front) = self.bufs.front_mut() else { break };
            if n >= front.len() {
                n -= front.len();
                self.bufs.pop_front();
            } else {
                front.consume(n);
                n = 0;
            }
        }
        while self.bufs.front().is_some_and(PoolBuf::is_empty) {
            self.bufs.pop_front();
        }
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.bufs.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gather(q: &PooledSendQueue) -> Vec<u8> {
        q.chunks().flatten().copied().collect()
    }

    #[test]
    fn test_push_coalesces_small_writes() {
        let pool = BufferPool::new(1 << 20);
        let mut q = PooledSendQueue::new();
        q.push(&pool, b"abc").unwrap();
        q.push(&pool, b"def").unwrap();
        assert_eq!(q.size(), 6);
        assert_eq!(q.count(), 1);
        assert_eq!(gather(&q), b"abcdef");
    }

    #[test]
    fn test_large_push_spans_blocks() {
        let pool = BufferPool::new(4 << 20);
        let mut q = PooledSendQueue::new();
        let data: Vec<u8> = (0..(MAX_POOL_BLOCK + 100)).map(|i| i as u8).collect();
        q.push(&pool, &data).unwrap();
        assert_eq!(q.size(), data.len());
        assert_eq!(q.count(), 2);
        assert_eq!(gather(&q), data);
    }

    #[test]
    fn test_consume_partial_and_full() {
        let pool = BufferPool::new(1 << 20);
        let mut q = PooledSendQueue::new();
        q.push(&pool, &[1u8; 300]).unwrap();
        q.push(&pool, &[2u8; 600]).unwrap();
        assert_eq!(q.count(), 2);

        q.consume(100);
        assert_eq!(q.size(), 800);
        assert_eq!(q.front().unwrap()[0], 1);

        q.consume(200 + 50);
        assert_eq!(q.front().unwrap()[0], 2);
        assert_eq!(q.size(), 550);
        assert!(gather(&q).iter().all(|&b| b == 2));

        q.consume(10_000);
        assert!(q.is_empty());
        assert_eq!(q.count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_push_is_all_or_nothing() {
        let pool = BufferPool::new(1024);
        let mut q = PooledSendQueue::new();
        q.push(&pool, &[0u8; 1000]).unwrap();
        assert!(matches!(
            q.push(&pool, &[0u8; 4000]),
            Err(Error::PoolExhausted { .. })
        ));
        assert_eq!(q.size(), 1000);
    }

    #[test]
    fn test_push_after_partial_consume_fills_tail_first() {
        let pool = BufferPool::new(1 << 20);
        let mut q = PooledSendQueue::new();
        q.push(&pool, &[1u8; 700]).unwrap();
        q.consume(100);
        q.push(&pool, &[2u8; 400]).unwrap();
        assert_eq!(q.size(), 1000);
        assert_eq!(q.count(), 1);

        // Exactly the compacted room: no empty block may be queued.
        q.consume(600);
        q.push(&pool, &[3u8; 624]).unwrap();
        assert_eq!(q.count(), 1);
        let mut expect = vec![2u8; 400];
        expect.extend_from_slice(&[3u8; 624]);
        assert_eq!(gather(&q), expect);

        q.consume(q.size());
        assert_eq!(q.count(), 0);
        assert!(q.front().is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_clear_returns_buffers() {
        let pool = BufferPool::new(1 << 20);
        let mut q = PooledSendQueue::new();
        q.push(&pool, &[7u8; 5000]).unwrap();
        q.clear();
        assert!(q.is_empty());
        assert_eq!(pool.in_use(), 0);
    }
}
