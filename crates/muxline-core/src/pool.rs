//! Pooled byte buffers
//!
//! A per-shard buddy allocator over one arena reserved up front. Blocks come
//! in power-of-two size classes (`MIN_POOL_BLOCK` ..= `MAX_POOL_BLOCK`);
//! allocating splits a larger free block, freeing merges a block with its
//! buddy again. The global allocator is touched once, in [`BufferPool::new`].
//!
//! When no free block of the class or above is left `allocate` returns
//! `None` and the caller fails whatever needed the memory.
//!
//! The pool is `!Send` by construction (`Rc`), one per reactor.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::constants::{MAX_POOL_BLOCK, MIN_POOL_BLOCK};

const NUM_CLASSES: usize =
    (MAX_POOL_BLOCK.trailing_zeros() - MIN_POOL_BLOCK.trailing_zeros()) as usize + 1;

/// Size class index for a request, `None` if larger than the biggest block.
#[inline]
fn class_of(size: usize) -> Option<usize> {
    if size > MAX_POOL_BLOCK {
        return None;
    }
    let rounded = size.max(MIN_POOL_BLOCK).next_power_of_two();
    Some((rounded.trailing_zeros() - MIN_POOL_BLOCK.trailing_zeros()) as usize)
}

#[inline]
fn class_size(class: usize) -> usize {
    MIN_POOL_BLOCK << class
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Byte budget
    pub capacity: usize,
    /// Bytes of the arena carved into blocks; the budget rounded down to
    /// whole blocks
    pub reserved: usize,
    /// Bytes in blocks currently handed out
    pub in_use: usize,
    /// Successful allocations
    pub allocations: u64,
    /// Allocations refused for lack of a free block
    pub failures: u64,
}

struct Arena {
    /// The reserved region. Owned here and released in `Drop`.
    mem: NonNull<[u8]>,
    capacity: usize,
    reserved: usize,
    in_use: usize,
    /// Offsets of free blocks, per class
    free: [BTreeSet<usize>; NUM_CLASSES],
    allocations: u64,
    failures: u64,
}

impl Arena {
    /// Reserve `capacity` bytes (rounded down to whole blocks) and seed the
    /// free lists with the largest blocks that fit. Every seeded block sits
    /// at an offset aligned to its own size, which keeps buddy arithmetic
    /// (`offset ^ size`) valid across the whole arena.
    fn new(capacity: usize) -> Self {
        let mut free: [BTreeSet<usize>; NUM_CLASSES] = Default::default();
        let mut reserved = 0;
        for class in (0..NUM_CLASSES).rev() {
            let size = class_size(class);
            while capacity - reserved >= size {
                free[class].insert(reserved);
                reserved += size;
            }
        }
        let mem = NonNull::from(Box::leak(vec![0u8; reserved].into_boxed_slice()));
        Self {
            mem,
            capacity,
            reserved,
            in_use: 0,
            free,
            allocations: 0,
            failures: 0,
        }
    }

    /// Offset of a free block of `class`, splitting a larger one if needed.
    fn take_block(&mut self, class: usize) -> Option<usize> {
        let Some(mut k) = (class..NUM_CLASSES).find(|&k| !self.free[k].is_empty()) else {
            self.failures += 1;
            return None;
        };
        let offset = self.free[k].pop_first()?;
        while k > class {
            k -= 1;
            self.free[k].insert(offset + class_size(k));
        }
        self.in_use += class_size(class);
        self.allocations += 1;
        Some(offset)
    }

    fn put_block(&mut self, mut offset: usize, mut class: usize) {
        self.in_use -= class_size(class);
        while class + 1 < NUM_CLASSES {
            let buddy = offset ^ class_size(class);
            if !self.free[class].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            class += 1;
        }
        self.free[class].insert(offset);
    }

    #[inline]
    fn block_ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.reserved);
        // SAFETY: offset lies inside the reserved region.
        unsafe { NonNull::new_unchecked(self.mem.cast::<u8>().as_ptr().add(offset)) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `mem` came from `Box::leak` in `new`, and every PoolBuf
        // holds an Rc to the arena, so no block outlives this.
        unsafe { drop(Box::from_raw(self.mem.as_ptr())) }
    }
}

/// Handle to a shard's buffer pool. Cloning shares the same arena.
#[derive(Clone)]
pub struct BufferPool {
    arena: Rc<RefCell<Arena>>,
}

impl BufferPool {
    /// Create a pool and reserve its `capacity`-byte arena.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Rc::new(RefCell::new(Arena::new(capacity))),
        }
    }

    /// Allocate a buffer able to hold at least `size` bytes. The returned
    /// buffer is empty (`len() == 0`).
    pub fn allocate(&self, size: usize) -> Option<PoolBuf> {
        let class = class_of(size)?;
        let mut arena = self.arena.borrow_mut();
        let offset = arena.take_block(class)?;
        let ptr = arena.block_ptr(offset);
        Some(PoolBuf {
            ptr,
            offset,
            class: class as u8,
            start: 0,
            end: 0,
            arena: Rc::clone(&self.arena),
        })
    }

    /// Grow `buf` so it can hold `new_size` bytes, keeping its contents.
    ///
    /// On failure the original buffer is handed back untouched.
    pub fn reallocate(&self, mut buf: PoolBuf, new_size: usize) -> Result<PoolBuf, PoolBuf> {
        if new_size <= buf.capacity() {
            buf.compact();
            return Ok(buf);
        }
        if new_size < buf.len() {
            return Err(buf);
        }
        match self.allocate(new_size) {
            Some(mut grown) => {
                grown.extend_from_slice(buf.as_slice());
                Ok(grown)
            }
            None => Err(buf),
        }
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    #[inline]
    pub fn deallocate(&self, buf: PoolBuf) {
        drop(buf);
    }

    pub fn stats(&self) -> PoolStats {
        let a = self.arena.borrow();
        PoolStats {
            capacity: a.capacity,
            reserved: a.reserved,
            in_use: a.in_use,
            allocations: a.allocations,
            failures: a.failures,
        }
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.arena.borrow().in_use
    }

    /// Whether both handles share one arena.
    #[inline]
    pub fn ptr_eq(&self, other: &BufferPool) -> bool {
        Rc::ptr_eq(&self.arena, &other.arena)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BufferPool").field(&self.stats()).finish()
    }
}

/// A block borrowed from a [`BufferPool`]; returns itself on drop.
///
/// Holds a readable window `start..end` inside the block. Writers append at
/// `end`, readers consume from `start`.
pub struct PoolBuf {
    ptr: NonNull<u8>,
    offset: usize,
    class: u8,
    start: usize,
    end: usize,
    arena: Rc<RefCell<Arena>>,
}

impl PoolBuf {
    #[inline]
    fn block(&self) -> &[u8] {
        // SAFETY: blocks never overlap and each is owned by exactly one
        // PoolBuf; the arena outlives it through `arena`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity()) }
    }

    #[inline]
    fn block_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `block`, and `&mut self` makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity()) }
    }

    /// Readable bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Size of the underlying block.
    #[inline]
    pub fn capacity(&self) -> usize {
        class_size(self.class as usize)
    }

    /// Bytes that can still be appended without compacting.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.end
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.block()[self.start..self.end]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.block_mut()[start..end]
    }

    /// Writable tail, to be followed by [`commit`](Self::commit).
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.block_mut()[end..]
    }

    /// Mark `n` bytes of the spare tail as written.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.end = (self.end + n).min(self.capacity());
    }

    /// Append as much of `data` as fits; returns bytes copied.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        if data.len() > self.remaining() && self.start > 0 {
            self.compact();
        }
        let n = data.len().min(self.remaining());
        let end = self.end;
        self.block_mut()[end..end + n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    /// Drop `n` bytes from the front.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Move the readable window to the front of the block.
    pub fn compact(&mut self) {
        if self.start > 0 {
            let (start, end) = (self.start, self.end);
            self.block_mut().copy_within(start..end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PoolBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Ok(mut arena) = self.arena.try_borrow_mut() {
            arena.put_block(self.offset, self.class as usize);
        }
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_of(MIN_POOL_BLOCK), Some(0));
        assert_eq!(class_of(MIN_POOL_BLOCK + 1), Some(1));
        assert_eq!(class_of(MAX_POOL_BLOCK), Some(NUM_CLASSES - 1));
        assert_eq!(class_of(MAX_POOL_BLOCK + 1), None);
    }

    #[test]
    fn test_allocate_and_return() {
        let pool = BufferPool::new(64 * 1024);
        let buf = pool.allocate(1000).unwrap();
        assert_eq!(buf.capacity(), 1024);
        assert!(buf.is_empty());
        assert_eq!(pool.in_use(), 1024);

        pool.deallocate(buf);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.stats().reserved, 64 * 1024);
    }

    #[test]
    fn test_arena_reserved_up_front() {
        let pool = BufferPool::new(1 << 20);
        assert_eq!(pool.stats().reserved, 1 << 20);

        let a = pool.allocate(256).unwrap();
        let b = pool.allocate(8192).unwrap();
        assert_eq!(pool.stats().reserved, 1 << 20);
        assert_eq!(pool.in_use(), 256 + 8192);
        drop((a, b));

        for _ in 0..100 {
            let _b = pool.allocate(8192).unwrap();
        }
        assert_eq!(pool.stats().reserved, 1 << 20);
        assert_eq!(pool.stats().allocations, 102);
    }

    #[test]
    fn test_budget_rounds_down_to_blocks() {
        // 1000 = 512 + 256 + 232 unusable
        let pool = BufferPool::new(1000);
        assert_eq!(pool.stats().reserved, 768);
        let a = pool.allocate(512).unwrap();
        let b = pool.allocate(256).unwrap();
        assert!(pool.allocate(1).is_none());
        drop((a, b));
        assert!(pool.allocate(1024).is_none());
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        let pool = BufferPool::new(8192);
        let mut bufs: Vec<PoolBuf> = (0..32).map(|_| pool.allocate(256).unwrap()).collect();
        for (i, b) in bufs.iter_mut().enumerate() {
            b.extend_from_slice(&[i as u8; 256]);
        }
        for (i, b) in bufs.iter().enumerate() {
            assert!(b.iter().all(|&x| x == i as u8));
        }
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = BufferPool::new(8192);
        let a = pool.allocate(4096).unwrap();
        let b = pool.allocate(4096).unwrap();
        assert!(pool.allocate(256).is_none());
        assert_eq!(pool.stats().failures, 1);
        drop(a);
        assert!(pool.allocate(256).is_some());
        drop(b);
    }

    #[test]
    fn test_oversize_request_refused() {
        let pool = BufferPool::new(4 * MAX_POOL_BLOCK);
        assert!(pool.allocate(MAX_POOL_BLOCK + 1).is_none());
    }

    #[test]
    fn test_freed_blocks_coalesce() {
        let pool = BufferPool::new(8192);
        let mut small: Vec<_> = (0..32).map(|_| pool.allocate(256).unwrap()).collect();
        assert!(pool.allocate(256).is_none());

        // Free in an interleaved order; buddies still merge back up.
        let odd: Vec<_> = (0..16).map(|i| small.remove(i)).collect();
        drop(small);
        assert!(pool.allocate(8192).is_none());
        drop(odd);

        let big = pool.allocate(8192).unwrap();
        assert_eq!(big.capacity(), 8192);
        assert_eq!(pool.in_use(), 8192);
    }

    #[test]
    fn test_extend_consume_compact() {
        let pool = BufferPool::new(4096);
        let mut buf = pool.allocate(256).unwrap();
        assert_eq!(buf.extend_from_slice(b"hello world"), 11);
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");

        let filler = vec![b'x'; 251];
        assert_eq!(buf.extend_from_slice(&filler), 251);
        assert_eq!(buf.len(), 256);
        assert_eq!(&buf[..5], b"world");

        buf.consume(256);
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 256);
    }

    #[test]
    fn test_reallocate_preserves_contents() {
        let pool = BufferPool::new(64 * 1024);
        let mut buf = pool.allocate(256).unwrap();
        buf.extend_from_slice(b"partial frame");
        let grown = pool.reallocate(buf, 4000).unwrap();
        assert_eq!(grown.capacity(), 4096);
        assert_eq!(grown.as_slice(), b"partial frame");
        assert_eq!(pool.in_use(), 4096);
    }

    #[test]
    fn test_reallocate_failure_hands_back_original() {
        let pool = BufferPool::new(1024);
        let mut buf = pool.allocate(512).unwrap();
        buf.extend_from_slice(b"keep me");
        let buf = pool.reallocate(buf, 2048).unwrap_err();
        assert_eq!(buf.as_slice(), b"keep me");
    }

    #[test]
    fn test_spare_and_commit() {
        let pool = BufferPool::new(4096);
        let mut buf = pool.allocate(512).unwrap();
        buf.spare_mut()[..3].copy_from_slice(b"abc");
        buf.commit(3);
        assert_eq!(buf.as_slice(), b"abc");
    }
}
