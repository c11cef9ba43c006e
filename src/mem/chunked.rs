//! Chunked pool: objects are carved out of fixed-capacity chunks so idle
//! memory can be returned to the system a whole chunk at a time.

use std::collections::BTreeMap;

use bytes::BytesMut;

use crate::mem::Home;
use crate::utils::clock;

const MEM_PAGE_SIZE: usize = 4096;
const MEM_CHUNK_SIZE: usize = 16 * 1024;
const MEM_CHUNK_MAX_SIZE: usize = 256 * 1024;
const MEM_MIN_FREE: usize = 32;
const MEM_MAX_FREE: usize = 65535;

struct Chunk {
    slots: Vec<Option<BytesMut>>,
    free: Vec<u16>,
    inuse: u16,
    last_ref: i64,
}

impl Chunk {
    fn new(capacity: usize, object_size: usize) -> Chunk {
        Chunk {
            slots: (0..capacity)
                .map(|_| Some(BytesMut::with_capacity(object_size)))
                .collect(),
            free: (0..capacity as u16).rev().collect(),
            inuse: 0,
            last_ref: clock::current_time(),
        }
    }
}

pub(crate) struct ChunkedPool {
    object_size: usize,
    chunk_size: usize,
    chunk_capacity: usize,
    next_chunk_id: u64,
    chunks: BTreeMap<u64, Chunk>,
    /// Chunk ids with free slots, most-populated first; rebuilt by `clean()`.
    free_chunks: Vec<u64>,
}

/// Result of one chunked alloc: the buffer, its home, and whether a brand-new
/// chunk had to be created (the caller accounts `alloc/idle` for it).
pub(crate) struct ChunkedAlloc {
    pub buf: BytesMut,
    pub home: Home,
    pub grew_by: usize,
}

impl ChunkedPool {
    pub fn new(object_size: usize) -> ChunkedPool {
        let (chunk_size, chunk_capacity) = Self::size_chunk(object_size, MEM_CHUNK_SIZE);
        ChunkedPool {
            object_size,
            chunk_size,
            chunk_capacity,
            next_chunk_id: 0,
            chunks: BTreeMap::new(),
            free_chunks: Vec::new(),
        }
    }

    /// Round the chunk to page size and clamp its capacity to
    /// [MEM_MIN_FREE, MEM_MAX_FREE] objects and MEM_CHUNK_MAX_SIZE bytes.
    fn size_chunk(object_size: usize, wanted: usize) -> (usize, usize) {
        let mut csize = wanted.div_ceil(MEM_PAGE_SIZE) * MEM_PAGE_SIZE;
        let mut cap = csize / object_size;

        if cap < MEM_MIN_FREE {
            cap = MEM_MIN_FREE;
        }
        if cap * object_size > MEM_CHUNK_MAX_SIZE {
            cap = MEM_CHUNK_MAX_SIZE / object_size;
        }
        if cap > MEM_MAX_FREE {
            cap = MEM_MAX_FREE;
        }
        if cap < 1 {
            cap = 1;
        }

        csize = (cap * object_size).div_ceil(MEM_PAGE_SIZE) * MEM_PAGE_SIZE;
        cap = csize / object_size;
        (csize, cap)
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn get(&mut self) -> ChunkedAlloc {
        let mut grew_by = 0;

        if self.free_chunks.is_empty() {
            let id = self.next_chunk_id;
            self.next_chunk_id += 1;
            self.chunks
                .insert(id, Chunk::new(self.chunk_capacity, self.object_size));
            // prefer the lowest chunk so compaction drifts toward old chunks
            let at = self
                .free_chunks
                .iter()
                .position(|&c| c > id)
                .unwrap_or(self.free_chunks.len());
            self.free_chunks.insert(at, id);
            grew_by = self.chunk_capacity;
        }

        let id = self.free_chunks[0];
        let chunk = self.chunks.get_mut(&id).expect("free chunk exists");
        let slot = chunk.free.pop().expect("chunk on free list has free slot");
        let buf = chunk.slots[slot as usize].take().expect("slot was idle");
        chunk.inuse += 1;
        chunk.last_ref = clock::current_time();
        if chunk.free.is_empty() {
            self.free_chunks.remove(0);
        }

        ChunkedAlloc {
            buf,
            home: Home::Chunk { chunk: id, slot },
            grew_by,
        }
    }

    pub fn put(&mut self, home: Home, mut buf: BytesMut) {
        let (id, slot) = match home {
            Home::Chunk { chunk, slot } => (chunk, slot),
            Home::Heap => unreachable!("heap object returned to chunked pool"),
        };
        let chunk = self.chunks.get_mut(&id).expect("owning chunk exists");
        buf.clear();
        assert!(chunk.slots[slot as usize].is_none());
        chunk.slots[slot as usize] = Some(buf);
        assert!(chunk.inuse > 0);
        chunk.inuse -= 1;
        chunk.last_ref = clock::current_time();
        if chunk.free.is_empty() {
            self.free_chunks.push(id);
        }
        chunk.free.push(slot);
    }

    /// Releases fully-idle chunks not referenced for `maxage` seconds and
    /// rebuilds the free-chunk preference list so the most-populated chunks
    /// are used first, concentrating fragmentation in few chunks.
    /// Returns the number of objects whose storage went away.
    pub fn clean(&mut self, maxage: i64) -> usize {
        let now = clock::current_time();
        let first = self.chunks.keys().next().copied();

        let mut doomed = Vec::new();
        for (&id, chunk) in &self.chunks {
            // the first (create-time) chunk is never released
            if Some(id) == first {
                continue;
            }
            if chunk.inuse == 0 && now - chunk.last_ref >= maxage {
                doomed.push(id);
            }
        }
        let mut released = 0;
        for id in doomed {
            self.chunks.remove(&id);
            released += self.chunk_capacity;
        }

        let mut ids: Vec<u64> = self
            .chunks
            .iter()
            .filter(|(_, c)| (c.inuse as usize) < self.chunk_capacity)
            .map(|(&id, _)| id)
            .collect();
        let chunks = &self.chunks;
        ids.sort_by(|a, b| {
            // create-time chunk stays on top no matter how full
            if Some(*a) == first {
                return std::cmp::Ordering::Less;
            }
            if Some(*b) == first {
                return std::cmp::Ordering::Greater;
            }
            chunks[b].inuse.cmp(&chunks[a].inuse).then(a.cmp(b))
        });
        self.free_chunks = ids;

        released
    }

    /// Whether idle storage exceeds `chunk_capacity << shift` objects.
    pub fn idle_trigger(&self, idle_level: isize, shift: u32) -> bool {
        idle_level > (self.chunk_capacity << shift) as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizing_bounds() {
        // small objects: page-rounded 16K chunk
        let (csize, cap) = ChunkedPool::size_chunk(64, MEM_CHUNK_SIZE);
        assert_eq!(csize % MEM_PAGE_SIZE, 0);
        assert!(cap >= MEM_MIN_FREE);
        assert!(cap <= MEM_MAX_FREE);

        // large objects: capacity still at least MIN_FREE unless it would
        // blow the 256 KiB ceiling
        let (csize, cap) = ChunkedPool::size_chunk(8192, MEM_CHUNK_SIZE);
        assert!(csize <= MEM_CHUNK_MAX_SIZE);
        assert_eq!(cap, MEM_CHUNK_MAX_SIZE / 8192);
    }

    #[test]
    fn test_get_put_roundtrip_reuses_chunk() {
        let mut p = ChunkedPool::new(128);
        let a = p.get();
        assert_eq!(a.grew_by, p.chunk_capacity());
        let b = p.get();
        assert_eq!(b.grew_by, 0);
        assert_eq!(p.chunk_count(), 1);
        p.put(a.home, a.buf);
        p.put(b.home, b.buf);
        assert_eq!(p.chunk_count(), 1);
    }

    #[test]
    fn test_clean_releases_idle_chunks_but_not_first() {
        let mut p = ChunkedPool::new(512);
        let cap = p.chunk_capacity();
        // force two chunks
        let mut held: Vec<_> = (0..cap + 1).map(|_| p.get()).collect();
        assert_eq!(p.chunk_count(), 2);
        for a in held.drain(..) {
            p.put(a.home, a.buf);
        }
        let released = p.clean(0);
        assert_eq!(released, cap);
        assert_eq!(p.chunk_count(), 1);
        // the surviving create-time chunk is still usable
        let again = p.get();
        assert_eq!(again.grew_by, 0);
    }
}
