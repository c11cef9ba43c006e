//! Response write-back: drain the transaction's store entry to the client
//! socket, parking on the entry whenever the writer is ahead of us.

use log::trace;

use crate::client::{process_next, stream_write, ConnRef};
use crate::comm::{Flag, Reactor};
use crate::http::{self, Method};
use crate::store::{self, CopyResult, ENTRY_ABORTED};
use crate::utils::clock;

const STREAM_CHUNK: usize = 64 * 1024;

/// Advance the current transaction: send headers once the entry has them,
/// then body bytes as they become available.
pub fn kick(r: &mut Reactor, conn: &ConnRef) {
    let Some((entry, headers_sent)) = ({
        let c = conn.borrow();
        c.current
            .as_ref()
            .map(|t| (t.entry.clone(), t.headers_sent))
    }) else {
        return;
    };

    if headers_sent {
        write_some_body(r, conn);
        return;
    }

    if entry.borrow().reply.is_none() {
        park(r, conn);
        return;
    }

    // build the client-facing head from the stored reply
    let wire = {
        let mut c = conn.borrow_mut();
        let txn = c.current.as_mut().expect("current transaction");
        let e = txn.entry.borrow();
        let stored = e.reply.as_ref().expect("reply present");
        let mut reply = stored.clone();

        if txn.hit {
            let age = (clock::current_time() - e.timestamp).max(0);
            reply.headers.replace("Age", &age.to_string());
        }

        // keepalive needs a delimited body; EOF-framed responses close
        let framed = reply.headers.content_length().ok().flatten().is_some()
            || reply.headers.has("Transfer-Encoding")
            || txn.request.method == Method::Head;
        txn.keepalive = txn.keepalive && framed && !e.has(ENTRY_ABORTED);

        if txn.keepalive {
            if txn.request.version == http::Version::HTTP10 {
                reply.headers.replace("Connection", "keep-alive");
            }
        } else {
            reply.headers.replace("Connection", "close");
        }

        txn.headers_sent = true;
        reply.pack()
    };

    {
        let mut c = conn.borrow_mut();
        c.out_headers_sz += wire.len() as u64;
    }
    trace!(
        "client FD {}: sending {} header bytes",
        conn.borrow().fd,
        wire.len()
    );

    let conn2 = conn.clone();
    stream_write(
        r,
        conn,
        wire,
        Box::new(move |r, flag, _| {
            if flag != Flag::Ok {
                finish_or_close(r, &conn2, false);
                return;
            }
            let head_only = conn2
                .borrow()
                .current
                .as_ref()
                .map(|t| t.request.method == Method::Head)
                .unwrap_or(true);
            if head_only {
                finish_or_close(r, &conn2, true);
            } else {
                write_some_body(r, &conn2);
            }
        }),
    );
}

fn park(r: &mut Reactor, conn: &ConnRef) {
    let _ = r;
    let Some(reader) = conn.borrow().current.as_ref().map(|t| t.reader.clone()) else {
        return;
    };
    let conn2 = conn.clone();
    store::register_callback(&reader, Box::new(move |r| kick(r, &conn2)));
}

fn write_some_body(r: &mut Reactor, conn: &ConnRef) {
    let Some((entry, reader)) = ({
        let c = conn.borrow();
        c.current
            .as_ref()
            .map(|t| (t.entry.clone(), t.reader.clone()))
    }) else {
        return;
    };

    match store::copy_some(&entry, &reader, STREAM_CHUNK) {
        CopyResult::Data(chunk) => {
            let n = chunk.len() as u64;
            conn.borrow_mut().out_size += n;
            let conn2 = conn.clone();
            stream_write(
                r,
                conn,
                chunk,
                Box::new(move |r, flag, _| {
                    if flag == Flag::Ok {
                        write_some_body(r, &conn2);
                    } else {
                        finish_or_close(r, &conn2, false);
                    }
                }),
            );
        }
        CopyResult::Pending => park(r, conn),
        CopyResult::Complete => finish_or_close(r, conn, true),
    }
}

/// Retire the transaction: keepalive connections go back to parsing, the
/// rest close. `clean` is false when the write side failed mid-stream.
fn finish_or_close(r: &mut Reactor, conn: &ConnRef, clean: bool) {
    let fd = conn.borrow().fd;
    let keepalive = {
        let mut c = conn.borrow_mut();
        match c.current.take() {
            Some(txn) => {
                store::unsubscribe(r, &txn.entry, &txn.reader);
                clean && txn.keepalive
            }
            None => false,
        }
    };

    if keepalive {
        trace!("client FD {fd}: transaction complete, keepalive");
        process_next(r, conn);
    } else {
        trace!("client FD {fd}: transaction complete, closing");
        r.comm_close(fd);
    }
}
