//! Server-side fetch tests against a loopback origin.

use std::io::{Read, Write};
use std::net::TcpListener;

use serial_test::serial;

use super::*;
use crate::comm::loops::BackendKind;
use crate::store::{subscribe, CopyResult, ENTRY_ABORTED, ENTRY_CACHABLE, ENTRY_COMPLETE, ENTRY_NEGCACHED};

fn reactor() -> Reactor {
    clock::update_current_time();
    Reactor::new(512, BackendKind::Poll).expect("poll reactor")
}

fn test_config() -> crate::config::Config {
    let mut c = crate::config::Config::default();
    c.http_port.push("0".to_string());
    c
}

/// Spawn a one-shot origin that answers every accepted connection with
/// `head` + `body` and then closes.
fn spawn_origin(head: &str, body: Vec<u8>) -> (std::thread::JoinHandle<()>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let head = head.to_string();
    let handle = std::thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            let mut discard = [0u8; 4096];
            let _ = sock.read(&mut discard);
            let _ = sock.write_all(head.as_bytes());
            let _ = sock.write_all(&body);
        }
    });
    (handle, port)
}

fn pump(r: &mut Reactor, mut done: impl FnMut(&mut Reactor) -> bool) {
    for _ in 0..20_000 {
        crate::comm::event::run_due(r);
        r.check_timeouts();
        if done(r) {
            return;
        }
        r.do_select(20);
    }
    panic!("pump did not converge");
}

#[test]
#[serial]
fn test_miss_fetch_fills_and_caches_entry() {
    crate::config::install(test_config());
    let (origin, port) = spawn_origin(
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\n",
        b"hello".to_vec(),
    );
    ipcache::seed("origin.test", vec!["127.0.0.1".parse().unwrap()], 300);

    let mut r = reactor();
    let url = format!("http://origin.test:{port}/a");
    let entry = store::create_entry(&mut r, Method::Get, &url, ENTRY_CACHABLE);
    let reader = subscribe(&entry, 0);
    let req = Request::new(Method::Get, &url);
    start(&mut r, &entry, &req);

    pump(&mut r, |_| entry.borrow().has(ENTRY_COMPLETE));

    let e = entry.borrow();
    assert!(!e.has(ENTRY_ABORTED));
    assert_eq!(e.reply.as_ref().unwrap().status, 200);
    assert!(e.expires > clock::current_time());
    assert!(e.expires <= clock::current_time() + 60);
    drop(e);

    match store::copy_some(&entry, &reader, 4096) {
        CopyResult::Data(d) => assert_eq!(&d[..], b"hello"),
        _ => panic!("expected body"),
    }
    // still publicly visible: a second lookup is a hit
    let key = store::StoreTable::key_for(Method::Get, &url);
    assert!(r.store.get_public(key).is_some());

    origin.join().unwrap();
    crate::config::install(crate::config::Config::default());
}

#[test]
#[serial]
fn test_dns_failure_aborts_with_negative_cache() {
    crate::config::install(test_config());
    ipcache::seed("nowhere.test", vec![], 300);

    let mut r = reactor();
    let entry = store::create_entry(
        &mut r,
        Method::Get,
        "http://nowhere.test/x",
        ENTRY_CACHABLE,
    );
    let req = Request::new(Method::Get, "http://nowhere.test/x");
    start(&mut r, &entry, &req);

    let e = entry.borrow();
    assert!(e.has(ENTRY_ABORTED));
    assert!(e.has(ENTRY_NEGCACHED));
    assert!(!e.has(ENTRY_CACHABLE));
    assert_eq!(e.reply.as_ref().unwrap().status, 503);
    assert!(e.expires > clock::current_time());
    crate::config::install(crate::config::Config::default());
}

#[test]
#[serial]
fn test_origin_reset_before_headers_is_a_bad_gateway() {
    crate::config::install(test_config());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let origin = std::thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            let mut discard = [0u8; 1024];
            let _ = sock.read(&mut discard);
            // close without writing anything
            drop(sock);
        }
    });
    ipcache::seed("dead.test", vec!["127.0.0.1".parse().unwrap()], 300);

    let mut r = reactor();
    let url = format!("http://dead.test:{port}/x");
    let entry = store::create_entry(&mut r, Method::Get, &url, ENTRY_CACHABLE);
    let req = Request::new(Method::Get, &url);
    start(&mut r, &entry, &req);

    pump(&mut r, |_| entry.borrow().has(ENTRY_COMPLETE));
    let e = entry.borrow();
    assert!(e.has(ENTRY_ABORTED));
    assert_eq!(e.reply.as_ref().unwrap().status, 502);
    origin.join().unwrap();
    crate::config::install(crate::config::Config::default());
}

#[test]
#[serial]
fn test_oversized_body_switches_to_delete_behind() {
    let mut cfg = test_config();
    cfg.general.max_object_size_in_memory = crate::config::ByteSize::from_kb(64);
    crate::config::install(cfg);

    const TOTAL: usize = 1024 * 1024;
    let (origin, port) = spawn_origin(
        &format!("HTTP/1.1 200 OK\r\nContent-Length: {TOTAL}\r\n\r\n"),
        vec![0x5a; TOTAL],
    );
    ipcache::seed("big.test", vec!["127.0.0.1".parse().unwrap()], 300);

    let mut r = reactor();
    let url = format!("http://big.test:{port}/big");
    let entry = store::create_entry(&mut r, Method::Get, &url, ENTRY_CACHABLE);
    let reader = subscribe(&entry, 0);
    let req = Request::new(Method::Get, &url);
    start(&mut r, &entry, &req);

    let mut received = 0usize;
    let mut max_retained = 0u64;
    pump(&mut r, |_| {
        loop {
            match store::copy_some(&entry, &reader, 8 * 1024) {
                CopyResult::Data(d) => received += d.len(),
                _ => break,
            }
        }
        let e = entry.borrow();
        max_retained = max_retained.max(e.mem.current_len() - e.mem.lowest_offset());
        e.has(ENTRY_COMPLETE) && {
            drop(e);
            matches!(store::copy_some(&entry, &reader, 1), CopyResult::Complete)
        }
    });

    assert_eq!(received, TOTAL);
    let e = entry.borrow();
    assert!(e.has(ENTRY_DELETE_BEHIND));
    // after delete-behind, the entry must not remain cached
    assert!(e.has(crate::store::ENTRY_RELEASE_REQUEST));
    // retained memory stays within the delete gap plus one read's slack
    assert!(
        max_retained <= HTTP_DELETE_GAP + 2 * FETCH_READ_SIZE as u64 + 64 * 1024,
        "retained {max_retained} bytes"
    );
    let key = store::StoreTable::key_for(Method::Get, &url);
    drop(e);
    assert!(r.store.get_public(key).is_none());

    origin.join().unwrap();
    crate::config::install(crate::config::Config::default());
}
