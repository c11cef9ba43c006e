//! The object cache: cached-or-in-flight response records shared between one
//! writer (the server-side fetch) and any number of readers (client
//! streams), with the delete-behind discipline that bounds memory for
//! oversized objects.

pub mod ttl;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use bytes::{BufMut, BytesMut};
use iota::iota;
use log::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

use crate::comm::Reactor;
use crate::http::{Method, Reply};
use crate::utils::clock;

iota! {
    pub const ENTRY_DELETE_BEHIND: u32 = 1 << iota;
        , ENTRY_CACHABLE
        , ENTRY_RELEASE_REQUEST
        , ENTRY_CLIENT_ABORT
        , ENTRY_COMPLETE
        , ENTRY_ABORTED
        , ENTRY_NEGCACHED
}

/// Maximum reader lag tolerated before the fetch defers its reads, per
/// protocol.
pub const HTTP_DELETE_GAP: u64 = 64 * 1024;
pub const FTP_DELETE_GAP: u64 = 64 * 1024;

/// In-memory body buffer. `base_offset` is the lowest byte still retained;
/// delete-behind advances it by trimming the front.
#[derive(Debug, Default)]
pub struct MemObject {
    data: BytesMut,
    base_offset: u64,
}

impl MemObject {
    #[inline]
    pub fn lowest_offset(&self) -> u64 {
        self.base_offset
    }

    #[inline]
    pub fn current_len(&self) -> u64 {
        self.base_offset + self.data.len() as u64
    }

    pub fn append(&mut self, buf: &[u8]) {
        self.data.put_slice(buf);
    }

    /// Bytes available at `offset`; empty when the reader has drained us.
    pub fn read_at(&self, offset: u64) -> &[u8] {
        assert!(
            offset >= self.base_offset,
            "reader below the retained window"
        );
        let skip = (offset - self.base_offset) as usize;
        if skip >= self.data.len() {
            &[]
        } else {
            &self.data[skip..]
        }
    }

    /// Forget bytes below `offset`.
    fn trim_to(&mut self, offset: u64) {
        if offset <= self.base_offset {
            return;
        }
        let n = ((offset - self.base_offset) as usize).min(self.data.len());
        let _ = self.data.split_to(n);
        self.base_offset += n as u64;
    }

    fn replace(&mut self, body: &[u8]) {
        self.data.clear();
        self.base_offset = 0;
        self.data.put_slice(body);
    }
}

/// One reader's subscription to an entry.
pub struct StoreClient {
    pub offset: u64,
    callback: Option<Box<dyn FnOnce(&mut Reactor)>>,
}

pub type ClientRef = Rc<RefCell<StoreClient>>;

/// The cached-or-in-flight response record.
pub struct StoreEntry {
    pub key: u64,
    pub url: String,
    pub method: Method,
    pub flags: u32,
    pub reply: Option<Reply>,
    pub mem: MemObject,
    /// Absolute expiry, seconds. 0 while unknown.
    pub expires: i64,
    pub timestamp: i64,
    pub last_ref: i64,
    pub writer_active: bool,
    readers: Vec<Weak<RefCell<StoreClient>>>,
}

pub type Entry = Rc<RefCell<StoreEntry>>;

impl StoreEntry {
    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires > now
    }

    /// Smallest offset any live reader still needs, if there is one.
    pub fn lowest_reader_offset(&self) -> Option<u64> {
        self.readers
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.borrow().offset)
            .min()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.iter().filter(|w| w.strong_count() > 0).count()
    }

    fn prune_readers(&mut self) {
        self.readers.retain(|w| w.strong_count() > 0);
    }
}

/// Per-worker table of public (shareable) entries.
pub struct StoreTable {
    public: AHashMap<u64, Entry>,
}

impl StoreTable {
    pub fn new() -> StoreTable {
        StoreTable {
            public: AHashMap::new(),
        }
    }

    pub fn key_for(method: Method, url: &str) -> u64 {
        let mut h = Xxh3::new();
        h.update(method.as_str().as_bytes());
        h.update(b" ");
        h.update(url.as_bytes());
        h.digest()
    }

    /// Look up a shareable entry; entries pending eviction are invisible.
    pub fn get_public(&self, key: u64) -> Option<Entry> {
        let e = self.public.get(&key)?;
        if e.borrow().has(ENTRY_RELEASE_REQUEST) {
            return None;
        }
        Some(e.clone())
    }

    pub fn len(&self) -> usize {
        self.public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.public.is_empty()
    }

    fn forget(&mut self, key: u64) {
        self.public.remove(&key);
    }
}

impl Default for StoreTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a new in-flight entry and, when cachable, publish it so later
/// requests collapse onto the same fetch.
pub fn create_entry(r: &mut Reactor, method: Method, url: &str, flags: u32) -> Entry {
    let now = clock::current_time();
    let key = StoreTable::key_for(method, url);
    let entry = Rc::new(RefCell::new(StoreEntry {
        key,
        url: url.to_string(),
        method,
        flags,
        reply: None,
        mem: MemObject::default(),
        expires: 0,
        timestamp: now,
        last_ref: now,
        writer_active: true,
        readers: Vec::new(),
    }));
    debug!("storeCreateEntry {url} flags={flags:#x}");
    if flags & ENTRY_CACHABLE != 0 {
        r.store.public.insert(key, entry.clone());
    }
    entry
}

/// Subscribe a reader at `offset`. Released entries accept no new readers.
pub fn subscribe(entry: &Entry, offset: u64) -> ClientRef {
    let mut e = entry.borrow_mut();
    assert!(
        !e.has(ENTRY_RELEASE_REQUEST) || e.writer_active,
        "subscribe to a released entry"
    );
    let client = Rc::new(RefCell::new(StoreClient {
        offset,
        callback: None,
    }));
    e.readers.push(Rc::downgrade(&client));
    e.last_ref = clock::current_time();
    client
}

/// Whether at least one reader is still attached.
pub fn client_waiting(entry: &Entry) -> bool {
    entry.borrow_mut().prune_readers();
    entry.borrow().reader_count() > 0
}

/// Extend the body tail, apply delete-behind trimming, wake readers.
pub fn append(r: &mut Reactor, entry: &Entry, buf: &[u8]) {
    {
        let mut e = entry.borrow_mut();
        e.mem.append(buf);
        if e.has(ENTRY_DELETE_BEHIND) {
            if let Some(min) = e.lowest_reader_offset() {
                e.mem.trim_to(min);
            }
        }
    }
    wake_readers(r, entry);
}

/// Install the parsed reply headers and wake readers blocked on them.
pub fn set_reply(r: &mut Reactor, entry: &Entry, reply: Reply) {
    entry.borrow_mut().reply = Some(reply);
    wake_readers(r, entry);
}

/// Mark end-of-body. The caller has already set `expires` per TTL rules.
pub fn complete(r: &mut Reactor, entry: &Entry) {
    {
        let mut e = entry.borrow_mut();
        e.set(ENTRY_COMPLETE);
        e.writer_active = false;
        trace!("storeComplete {} len={}", e.url, e.mem.current_len());
    }
    wake_readers(r, entry);
    maybe_release(r, entry);
}

/// Abort the entry with a generated error body. This is the single point
/// where transactional errors become response content; the error is
/// negative-cached and served only to the current readers.
pub fn abort(r: &mut Reactor, entry: &Entry, error_reply: Reply, error_body: &[u8]) {
    let negative_ttl = crate::config::get_config().general.negative_ttl.as_secs() as i64;
    {
        let mut e = entry.borrow_mut();
        debug!("storeAbort {}", e.url);
        if e.mem.current_len() == 0 && e.mem.lowest_offset() == 0 {
            // nothing delivered yet: the error page replaces the response
            let mut reply = error_reply;
            reply
                .headers
                .replace("Content-Length", &error_body.len().to_string());
            e.reply = Some(reply);
            e.mem.replace(error_body);
        }
        e.set(ENTRY_ABORTED | ENTRY_COMPLETE | ENTRY_RELEASE_REQUEST | ENTRY_NEGCACHED);
        e.clear(ENTRY_CACHABLE);
        e.expires = clock::current_time() + negative_ttl;
        e.writer_active = false;
    }
    wake_readers(r, entry);
    maybe_release(r, entry);
}

/// Transition an over-limit response into streaming mode: memory below the
/// slowest reader is forgotten and the entry will not outlive its readers.
pub fn start_delete_behind(r: &mut Reactor, entry: &Entry) {
    let key = {
        let mut e = entry.borrow_mut();
        debug!("storeStartDeleteBehind {}", e.url);
        e.set(ENTRY_DELETE_BEHIND | ENTRY_RELEASE_REQUEST);
        e.clear(ENTRY_CACHABLE);
        e.key
    };
    r.store.forget(key);
}

/// Make the entry private and doomed: evicted after current readers drain,
/// invisible to new lookups.
pub fn release_request(r: &mut Reactor, entry: &Entry) {
    let key = {
        let mut e = entry.borrow_mut();
        e.set(ENTRY_RELEASE_REQUEST);
        e.clear(ENTRY_CACHABLE);
        e.key
    };
    r.store.forget(key);
    maybe_release(r, entry);
}

/// Drop the entry from the public table once no reader and no writer can
/// still touch it.
pub fn maybe_release(r: &mut Reactor, entry: &Entry) {
    let key = {
        let mut e = entry.borrow_mut();
        e.prune_readers();
        if !e.has(ENTRY_RELEASE_REQUEST) || e.writer_active || e.reader_count() > 0 {
            return;
        }
        e.key
    };
    if let Some(current) = r.store.public.get(&key) {
        if Rc::ptr_eq(current, entry) {
            r.store.forget(key);
        }
    }
}

/// Detach a reader. May complete a pending release, and flags client abort
/// for fetches that cannot fall back to delete-behind.
pub fn unsubscribe(r: &mut Reactor, entry: &Entry, client: &ClientRef) {
    {
        let mut e = entry.borrow_mut();
        e.readers.retain(|w| match w.upgrade() {
            Some(c) => !Rc::ptr_eq(&c, client),
            None => false,
        });
        if e.writer_active && e.reader_count() == 0 && !e.has(ENTRY_CACHABLE) {
            e.set(ENTRY_CLIENT_ABORT);
        }
    }
    maybe_release(r, entry);
}

/// What a reader got out of `copy_some`.
pub enum CopyResult {
    /// Bytes were copied out; the reader's offset advanced.
    Data(BytesMut),
    /// Nothing available yet; register a callback and wait.
    Pending,
    /// The body ended at the reader's offset.
    Complete,
}

/// Copy up to `max` available bytes at the reader's offset.
pub fn copy_some(entry: &Entry, client: &ClientRef, max: usize) -> CopyResult {
    let e = entry.borrow();
    let mut c = client.borrow_mut();
    let avail = e.mem.read_at(c.offset);
    if avail.is_empty() {
        return if e.has(ENTRY_COMPLETE) {
            CopyResult::Complete
        } else {
            CopyResult::Pending
        };
    }
    let n = avail.len().min(max);
    let mut out = BytesMut::with_capacity(n);
    out.put_slice(&avail[..n]);
    c.offset += n as u64;
    CopyResult::Data(out)
}

/// Park a reader until the entry changes (more data, headers, completion).
pub fn register_callback(client: &ClientRef, cb: Box<dyn FnOnce(&mut Reactor)>) {
    client.borrow_mut().callback = Some(cb);
}

/// Wake every parked reader, in subscription order.
pub fn wake_readers(r: &mut Reactor, entry: &Entry) {
    let callbacks: Vec<_> = {
        let mut e = entry.borrow_mut();
        e.prune_readers();
        e.readers
            .iter()
            .filter_map(|w| w.upgrade())
            .filter_map(|c| c.borrow_mut().callback.take())
            .collect()
    };
    for cb in callbacks {
        cb(r);
    }
}

#[cfg(test)]
mod tests;
