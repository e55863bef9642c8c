//! SocketTable - fd-indexed records guarded by generations
//!
//! Every registered fd gets a fresh, never-zero generation. The pair travels
//! through epoll as an [`EventKey`] and comes back as a [`SocketHandle`]; a
//! lookup with a stale generation misses instead of reaching whatever now
//! owns the reused fd.
//!
//! Connection records are also threaded on an index-linked active list
//! (prev/next slot indices, no side allocation) so sweeps can walk live
//! connections in O(n) of connections, not of table capacity.

use std::fmt;
use std::os::fd::RawFd;

use muxline_core::{Error, Result};

const NIL: u32 = u32::MAX;

/// What a registered fd is, decides how its events are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Listener,
    Connection,
    Timer,
    DnsQuery,
    /// Cross-thread wake eventfd
    Waker,
}

/// Generation-checked reference to a table slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle {
    fd: RawFd,
    generation: u32,
}

impl SocketHandle {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn key(&self) -> EventKey {
        EventKey::new(self.fd, self.generation)
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketHandle({}#{})", self.fd, self.generation)
    }
}

/// `(generation << 32) | fd`, the epoll user data of every registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey(u64);

impl EventKey {
    #[inline]
    pub fn new(fd: RawFd, generation: u32) -> Self {
        EventKey(((generation as u64) << 32) | (fd as u32 as u64))
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        EventKey(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn fd(self) -> RawFd {
        self.0 as u32 as RawFd
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn handle(self) -> SocketHandle {
        SocketHandle {
            fd: self.fd(),
            generation: self.generation(),
        }
    }
}

impl fmt::Debug for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKey({}#{})", self.fd(), self.generation())
    }
}

pub struct SocketRecord<O> {
    pub kind: SocketKind,
    pub owner: O,
}

struct Slot<O> {
    generation: u32,
    record: Option<SocketRecord<O>>,
    prev: u32,
    next: u32,
}

pub struct SocketTable<O> {
    slots: Vec<Slot<O>>,
    next_generation: u32,
    head: u32,
    len: usize,
    active: usize,
}

impl<O> SocketTable<O> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            generation: 0,
            record: None,
            prev: NIL,
            next: NIL,
        });
        Self {
            slots,
            next_generation: 1,
            head: NIL,
            len: 0,
            active: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Registered fds of any kind.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registered connections.
    #[inline]
    pub fn active_len(&self) -> usize {
        self.active
    }

    fn bump_generation(&mut self) -> u32 {
        let g = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        if self.next_generation == 0 {
            self.next_generation = 1;
        }
        g
    }

    #[inline]
    fn index(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.slots.len())
    }

    /// Register `fd`. Fails when the fd does not fit the table.
    pub fn add(&mut self, fd: RawFd, kind: SocketKind, owner: O) -> Result<SocketHandle> {
        let idx = self.index(fd).ok_or(Error::FdOutOfRange {
            fd,
            capacity: self.slots.len(),
        })?;
        if self.slots[idx].record.is_some() {
            tracing::warn!(fd, "fd re-registered without removal, dropping stale record");
            self.remove(fd);
        }
        let generation = self.bump_generation();
        let slot = &mut self.slots[idx];
        slot.generation = generation;
        slot.record = Some(SocketRecord { kind, owner });
        self.len += 1;
        if kind == SocketKind::Connection {
            self.link(idx);
        }
        Ok(SocketHandle { fd, generation })
    }

    /// Record for `(fd, generation)`, `None` if stale or empty.
    pub fn get(&self, fd: RawFd, generation: u32) -> Option<&SocketRecord<O>> {
        let slot = &self.slots[self.index(fd)?];
        if slot.generation != generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get_mut(&mut self, fd: RawFd, generation: u32) -> Option<&mut SocketRecord<O>> {
        let idx = self.index(fd)?;
        let slot = &mut self.slots[idx];
        if slot.generation != generation {
            return None;
        }
        slot.record.as_mut()
    }

    #[inline]
    pub fn lookup(&self, handle: SocketHandle) -> Option<&SocketRecord<O>> {
        self.get(handle.fd, handle.generation)
    }

    #[inline]
    pub fn lookup_mut(&mut self, handle: SocketHandle) -> Option<&mut SocketRecord<O>> {
        self.get_mut(handle.fd, handle.generation)
    }

    #[inline]
    pub fn contains(&self, handle: SocketHandle) -> bool {
        self.lookup(handle).is_some()
    }

    /// Handle of whatever currently occupies `fd`.
    pub fn handle_of(&self, fd: RawFd) -> Option<SocketHandle> {
        let slot = &self.slots[self.index(fd)?];
        slot.record.as_ref().map(|_| SocketHandle {
            fd,
            generation: slot.generation,
        })
    }

    /// Clear the slot and return its owner. Bumps the generation so every
    /// outstanding handle for it goes stale.
    pub fn remove(&mut self, fd: RawFd) -> Option<SocketRecord<O>> {
        let idx = self.index(fd)?;
        let record = self.slots[idx].record.take()?;
        if record.kind == SocketKind::Connection {
            self.unlink(idx);
        }
        self.slots[idx].generation = self.bump_generation();
        self.len -= 1;
        Some(record)
    }

    fn link(&mut self, idx: usize) {
        let old_head = self.head;
        self.slots[idx].prev = NIL;
        self.slots[idx].next = old_head;
        if old_head != NIL {
            self.slots[old_head as usize].prev = idx as u32;
        }
        self.head = idx as u32;
        self.active += 1;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
        self.active -= 1;
    }

    /// Handles of every registered connection, most recent first.
    pub fn active_handles(&self) -> Vec<SocketHandle> {
        let mut out = Vec::with_capacity(self.active);
        let mut cur = self.head;
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            out.push(SocketHandle {
                fd: cur as RawFd,
                generation: slot.generation,
            });
            cur = slot.next;
        }
        out
    }

    /// Handles of every registered fd of `kind`.
    pub fn handles_of_kind(&self, kind: SocketKind) -> Vec<SocketHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.record.as_ref().is_some_and(|r| r.kind == kind))
            .map(|(i, s)| SocketHandle {
                fd: i as RawFd,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_packing() {
        let key = EventKey::new(1234, 0xdead_beef);
        assert_eq!(key.fd(), 1234);
        assert_eq!(key.generation(), 0xdead_beef);
        assert_eq!(EventKey::from_raw(key.raw()), key);
        assert_eq!(key.raw(), (0xdead_beef_u64 << 32) | 1234);
    }

    #[test]
    fn test_add_get_remove() {
        let mut t: SocketTable<&str> = SocketTable::with_capacity(16);
        let h = t.add(5, SocketKind::Connection, "conn").unwrap();
        assert_eq!(t.lookup(h).map(|r| r.owner), Some("conn"));
        assert_eq!(t.active_len(), 1);

        let rec = t.remove(5).unwrap();
        assert_eq!(rec.owner, "conn");
        assert!(t.lookup(h).is_none());
        assert_eq!(t.active_len(), 0);
        assert!(t.remove(5).is_none());
    }

    #[test]
    fn test_stale_generation_rejected_after_reuse() {
        let mut t: SocketTable<u32> = SocketTable::with_capacity(16);
        let old = t.add(7, SocketKind::Connection, 1).unwrap();
        t.remove(7);
        let new = t.add(7, SocketKind::Connection, 2).unwrap();

        assert_ne!(old.generation(), new.generation());
        assert!(t.get(7, old.generation()).is_none());
        assert_eq!(t.get(7, new.generation()).map(|r| r.owner), Some(2));
    }

    #[test]
    fn test_out_of_range_fd() {
        let mut t: SocketTable<()> = SocketTable::with_capacity(4);
        assert!(matches!(
            t.add(4, SocketKind::Listener, ()),
            Err(Error::FdOutOfRange { fd: 4, capacity: 4 })
        ));
        assert!(t.add(-1, SocketKind::Listener, ()).is_err());
        assert!(t.get(99, 1).is_none());
    }

    #[test]
    fn test_generation_skips_zero_on_wrap() {
        let mut t: SocketTable<()> = SocketTable::with_capacity(4);
        t.next_generation = u32::MAX;
        let a = t.add(1, SocketKind::Timer, ()).unwrap();
        assert_eq!(a.generation(), u32::MAX);
        let b = t.add(2, SocketKind::Timer, ()).unwrap();
        assert_eq!(b.generation(), 1);
    }

    #[test]
    fn test_active_list_tracks_connections_only() {
        let mut t: SocketTable<()> = SocketTable::with_capacity(32);
        t.add(3, SocketKind::Listener, ()).unwrap();
        let a = t.add(10, SocketKind::Connection, ()).unwrap();
        let b = t.add(11, SocketKind::Connection, ()).unwrap();
        let c = t.add(12, SocketKind::Connection, ()).unwrap();

        assert_eq!(t.active_handles(), vec![c, b, a]);
        t.remove(11);
        assert_eq!(t.active_handles(), vec![c, a]);
        t.remove(12);
        t.remove(10);
        assert!(t.active_handles().is_empty());
        assert_eq!(t.len(), 1);
        assert_eq!(t.handles_of_kind(SocketKind::Listener).len(), 1);
    }
}
