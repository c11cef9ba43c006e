//! Malloc pool: each object is an individual heap allocation; idle objects
//! are stacked LIFO so the hottest storage is reused first.

use bytes::BytesMut;

pub(crate) struct MallocPool {
    object_size: usize,
    freelist: Vec<BytesMut>,
}

impl MallocPool {
    pub fn new(object_size: usize) -> MallocPool {
        MallocPool {
            object_size,
            freelist: Vec::new(),
        }
    }

    /// Pops an idle object, or allocates a fresh one. The bool is true when
    /// the allocation was satisfied from the freelist.
    pub fn get(&mut self) -> (BytesMut, bool) {
        match self.freelist.pop() {
            Some(buf) => (buf, true),
            None => (BytesMut::with_capacity(self.object_size), false),
        }
    }

    /// Returns an object. When `keep` is false (global idle budget exhausted)
    /// the storage goes back to the system instead.
    pub fn put(&mut self, mut buf: BytesMut, keep: bool) -> bool {
        if !keep {
            return false;
        }
        buf.clear();
        self.freelist.push(buf);
        true
    }

    pub fn idle_trigger(&self, shift: u32) -> bool {
        (self.freelist.len() >> if shift != 0 { 8 } else { 0 }) != 0
    }

    /// Drops every idle object; returns how many were released.
    pub fn clean(&mut self) -> usize {
        let n = self.freelist.len();
        self.freelist.clear();
        self.freelist.shrink_to_fit();
        n
    }
}
