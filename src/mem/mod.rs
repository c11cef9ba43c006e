//! Fixed-object-size pool allocator with per-pool meters and a process-wide
//! idle-memory budget.
//!
//! Two interchangeable implementations back the same `Pool` handle: a
//! chunked pool (dense small-object workloads, storage reclaimed a chunk at
//! a time) and a malloc pool (LIFO stack of individual allocations). The
//! `MEMPOOLS=1` environment variable makes chunking the default.

mod chunked;
mod malloc;
pub mod meter;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use chunked::ChunkedPool;
use malloc::MallocPool;
pub use meter::{Meter, MeterAccount, PoolMeter};

/// Interval between idle-chunk sweeps, seconds.
pub const CLEAN_INTERVAL: i64 = 15;

/// Where a pooled object lives, recorded at alloc time so the drop path can
/// return it without any address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    Heap,
    Chunk { chunk: u64, slot: u16 },
}

enum PoolImpl {
    Chunked(ChunkedPool),
    Malloc(MallocPool),
}

struct PoolCore {
    meter: PoolMeter,
    count_allocs: usize,
    count_saved: usize,
    count_freed: usize,
    imp: PoolImpl,
}

pub struct PoolInner {
    label: String,
    object_size: usize,
    core: Mutex<PoolCore>,
}

/// Handle to one registered pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn object_size(&self) -> usize {
        self.inner.object_size
    }

    /// Reserve one object. Failure to obtain memory from the system is fatal
    /// to the worker (the process aborts); there is no recovery path.
    pub fn alloc(&self) -> PooledBuf {
        let mut core = self.inner.core.lock();
        core.count_allocs += 1;
        let (buf, home) = match &mut core.imp {
            PoolImpl::Chunked(p) => {
                let got = p.get();
                if got.grew_by > 0 {
                    core.meter.alloc.add(got.grew_by as isize);
                    core.meter.idle.add(got.grew_by as isize);
                    pools()
                        .idle_bytes
                        .fetch_add((got.grew_by * self.inner.object_size) as isize, Ordering::Relaxed);
                } else {
                    core.count_saved += 1;
                }
                (got.buf, got.home)
            }
            PoolImpl::Malloc(p) => {
                let (buf, reused) = p.get();
                if reused {
                    core.count_saved += 1;
                } else {
                    core.meter.alloc.inc();
                    // fresh allocation starts in the idle column and moves
                    // to inuse below, keeping the meter identity intact
                    core.meter.idle.inc();
                    pools()
                        .idle_bytes
                        .fetch_add(self.inner.object_size as isize, Ordering::Relaxed);
                }
                (buf, Home::Heap)
            }
        };
        core.meter.idle.dec();
        core.meter.inuse.inc();
        pools()
            .idle_bytes
            .fetch_sub(self.inner.object_size as isize, Ordering::Relaxed);
        PooledBuf {
            buf: Some(buf),
            home,
            pool: Arc::downgrade(&self.inner),
        }
    }

    fn free_one(inner: &PoolInner, home: Home, buf: BytesMut) {
        let mut core = inner.core.lock();
        core.count_freed += 1;
        assert!(core.meter.inuse.level() > 0);
        core.meter.inuse.dec();
        match &mut core.imp {
            PoolImpl::Chunked(p) => {
                p.put(home, buf);
                core.meter.idle.inc();
                pools()
                    .idle_bytes
                    .fetch_add(inner.object_size as isize, Ordering::Relaxed);
            }
            PoolImpl::Malloc(p) => {
                let keep = pools().within_idle_budget();
                if p.put(buf, keep) {
                    core.meter.idle.inc();
                    pools()
                        .idle_bytes
                        .fetch_add(inner.object_size as isize, Ordering::Relaxed);
                } else {
                    core.meter.alloc.dec();
                }
            }
        }
    }

    /// Returns fully-idle storage older than `maxage` seconds to the system.
    pub fn clean(&self, maxage: i64) {
        let mut core = self.inner.core.lock();
        self.flush_locked(&mut core);
        let released = match &mut core.imp {
            PoolImpl::Chunked(p) => p.clean(maxage),
            PoolImpl::Malloc(p) => p.clean(),
        };
        if released > 0 {
            core.meter.alloc.sub(released as isize);
            core.meter.idle.sub(released as isize);
            pools()
                .idle_bytes
                .fetch_sub((released * self.inner.object_size) as isize, Ordering::Relaxed);
            debug!(
                "pool {}: released {} idle objects",
                self.inner.label, released
            );
        }
    }

    /// Folds fast-path counters into the pool's long-term meter.
    pub fn flush_counters(&self) {
        let mut core = self.inner.core.lock();
        self.flush_locked(&mut core);
    }

    fn flush_locked(&self, core: &mut PoolCore) {
        let size = self.inner.object_size;
        let allocs = core.count_allocs;
        let saved = core.count_saved;
        let freed = core.count_freed;
        core.meter.gb_allocated.update(allocs, size);
        core.meter.gb_saved.update(saved, size);
        core.meter.gb_freed.update(freed, size);
        core.count_allocs = 0;
        core.count_saved = 0;
        core.count_freed = 0;
    }

    pub fn meter(&self) -> PoolMeter {
        self.inner.core.lock().meter.clone()
    }

    fn idle_trigger(&self, shift: u32) -> bool {
        let core = self.inner.core.lock();
        match &core.imp {
            PoolImpl::Chunked(p) => p.idle_trigger(core.meter.idle.level(), shift),
            PoolImpl::Malloc(p) => p.idle_trigger(shift),
        }
    }
}

/// RAII pooled buffer; returns itself to its pool when dropped.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<BytesMut>,
    home: Home,
    pool: Weak<PoolInner>,
}

impl PooledBuf {
    /// Capacity the pool guarantees for this object.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(BytesMut::capacity).unwrap_or(0)
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("live pooled buffer")
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("live pooled buffer")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(pool) = self.pool.upgrade() {
                Pool::free_one(&pool, self.home, buf);
            }
        }
    }
}

/// Which implementation a new pool gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Chunked,
    Malloc,
}

/// Process-wide pool registry and idle-memory budget.
pub struct PoolsManager {
    registry: Mutex<Vec<Pool>>,
    idle_limit: AtomicIsize,
    idle_bytes: AtomicIsize,
    default_kind: PoolKind,
}

static POOLS: Lazy<PoolsManager> = Lazy::new(|| PoolsManager {
    registry: Mutex::new(Vec::new()),
    idle_limit: AtomicIsize::new(2 * 1024 * 1024),
    idle_bytes: AtomicIsize::new(0),
    default_kind: if std::env::var("MEMPOOLS").map(|v| v == "1").unwrap_or(false) {
        PoolKind::Chunked
    } else {
        PoolKind::Malloc
    },
});

pub fn pools() -> &'static PoolsManager {
    &POOLS
}

impl PoolsManager {
    /// Registers a new pool under global metering.
    pub fn create(&self, label: &str, object_size: usize) -> Pool {
        self.create_kind(label, object_size, self.default_kind)
    }

    pub fn create_kind(&self, label: &str, object_size: usize, kind: PoolKind) -> Pool {
        // round the object size up to pointer alignment
        let align = std::mem::size_of::<usize>();
        let object_size = object_size.div_ceil(align) * align;

        let imp = match kind {
            PoolKind::Chunked => PoolImpl::Chunked(ChunkedPool::new(object_size)),
            PoolKind::Malloc => PoolImpl::Malloc(MallocPool::new(object_size)),
        };
        let pool = Pool {
            inner: Arc::new(PoolInner {
                label: label.to_string(),
                object_size,
                core: Mutex::new(PoolCore {
                    meter: PoolMeter::default(),
                    count_allocs: 0,
                    count_saved: 0,
                    count_freed: 0,
                    imp,
                }),
            }),
        };
        self.registry.lock().push(pool.clone());
        pool
    }

    pub fn set_idle_limit(&self, bytes: isize) {
        self.idle_limit.store(bytes, Ordering::Relaxed);
    }

    pub fn idle_limit(&self) -> isize {
        self.idle_limit.load(Ordering::Relaxed)
    }

    fn within_idle_budget(&self) -> bool {
        let limit = self.idle_limit();
        limit > 0 && self.idle_bytes.load(Ordering::Relaxed) < limit
    }

    /// Total bytes currently sitting idle across all pools.
    pub fn total_idle_bytes(&self) -> isize {
        self.idle_bytes.load(Ordering::Relaxed)
    }

    /// Periodic sweep. Pools past their idle trigger are cleaned with
    /// `maxage`; when the global idle budget is breached everything is
    /// cleaned aggressively with `maxage = 0`.
    pub fn clean_pools(&self, maxage: i64) {
        let over_budget = !self.within_idle_budget();
        let registry = self.registry.lock().clone();
        for pool in &registry {
            pool.flush_counters();
            if over_budget {
                pool.clean(0);
            } else if pool.idle_trigger(0) {
                pool.clean(maxage);
            }
        }
    }

    pub fn flush_all_counters(&self) {
        let registry = self.registry.lock().clone();
        for pool in &registry {
            pool.flush_counters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_meter_identity_holds() {
        let p = pools().create_kind("t-identity", 64, PoolKind::Chunked);
        let a = p.alloc();
        let b = p.alloc();
        let m = p.meter();
        assert_eq!(m.inuse.level() + m.idle.level(), m.alloc.level());
        assert_eq!(m.inuse.level(), 2);
        drop(a);
        drop(b);
        let m = p.meter();
        assert_eq!(m.inuse.level() + m.idle.level(), m.alloc.level());
        assert_eq!(m.inuse.level(), 0);
    }

    #[test]
    #[serial]
    fn test_alloc_free_leaves_inuse_unchanged() {
        let p = pools().create_kind("t-idem", 256, PoolKind::Malloc);
        let before = p.meter().inuse.level();
        let idle_before = p.meter().idle.level();
        drop(p.alloc());
        assert_eq!(p.meter().inuse.level(), before);
        let idle_after = p.meter().idle.level();
        // idle grew, unless the aggressive-free threshold held it down
        assert!(idle_after == idle_before + 1 || idle_after == idle_before);
    }

    #[test]
    #[serial]
    fn test_malloc_pool_reuses_lifo() {
        let p = pools().create_kind("t-lifo", 128, PoolKind::Malloc);
        pools().set_idle_limit(8 * 1024 * 1024);
        drop(p.alloc());
        let _second = p.alloc();
        p.flush_counters();
        let m = p.meter();
        assert!(m.gb_saved.count >= 1.0);
    }

    #[test]
    #[serial]
    fn test_zero_idle_limit_frees_to_system() {
        let p = pools().create_kind("t-nolimit", 128, PoolKind::Malloc);
        let old = pools().idle_limit();
        pools().set_idle_limit(0);
        drop(p.alloc());
        let m = p.meter();
        assert_eq!(m.idle.level(), 0);
        assert_eq!(m.alloc.level(), 0);
        pools().set_idle_limit(old);
    }

    #[test]
    #[serial]
    fn test_object_size_rounded_to_pointer_alignment() {
        let p = pools().create_kind("t-align", 13, PoolKind::Malloc);
        assert_eq!(p.object_size() % std::mem::size_of::<usize>(), 0);
        assert!(p.object_size() >= 13);
    }
}
