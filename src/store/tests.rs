//! Store entry behavior tests.

use super::*;
use crate::comm::loops::BackendKind;
use crate::http::{Method, Reply};

fn reactor() -> Reactor {
    crate::utils::clock::update_current_time();
    Reactor::new(64, BackendKind::Poll).expect("poll reactor")
}

fn error_reply() -> Reply {
    let mut r = Reply::new(503, "Service Unavailable");
    r.headers.put("Content-Type", "text/html");
    r
}

#[test]
fn test_lowest_offset_never_exceeds_current_len() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/a", ENTRY_CACHABLE);
    let c = subscribe(&e, 0);

    for chunk in [&b"aaaa"[..], &b"bbbbbb"[..], &b"cc"[..]] {
        append(&mut r, &e, chunk);
        let b = e.borrow();
        assert!(b.mem.lowest_offset() <= b.mem.current_len());
    }
    assert_eq!(e.borrow().mem.current_len(), 12);
    assert_eq!(e.borrow().mem.lowest_offset(), 0);
    drop(c);
}

#[test]
fn test_delete_behind_trims_to_reader_offset() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/big", ENTRY_CACHABLE);
    let c = subscribe(&e, 0);

    append(&mut r, &e, &[0u8; 1000]);
    start_delete_behind(&mut r, &e);
    assert!(e.borrow().has(ENTRY_RELEASE_REQUEST));
    assert!(!e.borrow().has(ENTRY_CACHABLE));
    // released entries are invisible to new lookups
    assert!(r.store.get_public(e.borrow().key).is_none());

    // reader consumes 600 bytes, then more data arrives
    c.borrow_mut().offset = 600;
    append(&mut r, &e, &[0u8; 100]);
    let b = e.borrow();
    assert_eq!(b.mem.lowest_offset(), 600);
    assert_eq!(b.mem.current_len(), 1100);
    // retained memory equals current_len - lowest_offset
    assert_eq!(b.mem.read_at(600).len(), 500);
}

#[test]
fn test_reader_copy_wakeup_flow() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/x", ENTRY_CACHABLE);
    let c = subscribe(&e, 0);

    assert!(matches!(copy_some(&e, &c, 4096), CopyResult::Pending));

    let woke = std::rc::Rc::new(std::cell::Cell::new(false));
    let woke2 = woke.clone();
    register_callback(&c, Box::new(move |_| woke2.set(true)));
    append(&mut r, &e, b"hello");
    assert!(woke.get());

    match copy_some(&e, &c, 3) {
        CopyResult::Data(d) => assert_eq!(&d[..], b"hel"),
        _ => panic!("expected data"),
    }
    match copy_some(&e, &c, 100) {
        CopyResult::Data(d) => assert_eq!(&d[..], b"lo"),
        _ => panic!("expected data"),
    }
    assert!(matches!(copy_some(&e, &c, 100), CopyResult::Pending));

    e.borrow_mut().expires = crate::utils::clock::current_time() + 60;
    complete(&mut r, &e);
    assert!(matches!(copy_some(&e, &c, 100), CopyResult::Complete));
}

#[test]
fn test_wake_order_is_subscription_order() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/ord", ENTRY_CACHABLE);
    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let c1 = subscribe(&e, 0);
    let c2 = subscribe(&e, 0);
    for (tag, c) in [(1, &c1), (2, &c2)] {
        let order = order.clone();
        register_callback(c, Box::new(move |_| order.borrow_mut().push(tag)));
    }
    append(&mut r, &e, b"x");
    assert_eq!(*order.borrow(), vec![1, 2]);
}

#[test]
fn test_abort_replaces_undelivered_body_and_negative_caches() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/err", ENTRY_CACHABLE);
    let _c = subscribe(&e, 0);

    abort(&mut r, &e, error_reply(), b"<html>origin down</html>");
    let b = e.borrow();
    assert!(b.has(ENTRY_ABORTED));
    assert!(b.has(ENTRY_RELEASE_REQUEST));
    assert!(b.has(ENTRY_NEGCACHED));
    assert!(!b.has(ENTRY_CACHABLE));
    assert!(b.expires > crate::utils::clock::current_time());
    assert_eq!(b.mem.read_at(0), b"<html>origin down</html>");
    assert_eq!(
        b.reply.as_ref().unwrap().headers.get("Content-Length"),
        Some("24")
    );
}

#[test]
fn test_release_after_last_reader_detaches() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/rel", ENTRY_CACHABLE);
    let key = e.borrow().key;
    let c = subscribe(&e, 0);

    append(&mut r, &e, b"data");
    abort(&mut r, &e, error_reply(), b"err");
    // a reader is still attached: the entry structure survives
    assert!(client_waiting(&e));

    unsubscribe(&mut r, &e, &c);
    drop(c);
    assert!(!client_waiting(&e));
    assert!(r.store.get_public(key).is_none());
}

#[test]
fn test_collapsed_lookup_sees_incomplete_entry() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/c", ENTRY_CACHABLE);
    let key = StoreTable::key_for(Method::Get, "http://o/c");
    let found = r.store.get_public(key).expect("incomplete entry visible");
    assert!(Rc::ptr_eq(&found, &e));

    // different method, different key
    assert!(r
        .store
        .get_public(StoreTable::key_for(Method::Head, "http://o/c"))
        .is_none());
}

#[test]
fn test_client_abort_flagged_when_uncachable_loses_readers() {
    let mut r = reactor();
    let e = create_entry(&mut r, Method::Get, "http://o/ab", ENTRY_CACHABLE);
    let c = subscribe(&e, 0);
    start_delete_behind(&mut r, &e);
    unsubscribe(&mut r, &e, &c);
    assert!(e.borrow().has(ENTRY_CLIENT_ABORT));
}
