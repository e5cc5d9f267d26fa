//! Integration tests for rcpipe connections.
//!
//! These drive two contexts (one per simulated process) on one thread,
//! connected over loopback TCP for the handshake and a real RDMA device
//! for the data path. Every test skips itself when the host has no
//! device.

use std::cell::{Cell, RefCell};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use rcpipe::{Connection, Context, Error};

const MIB: usize = 1024 * 1024;

fn make_context() -> Option<Context> {
    // First caller wins; later calls are no-ops.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    match Context::builder().build() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no usable RDMA device ({})", e);
            None
        }
    }
}

/// Poll both contexts until `done` reports true.
fn pump(contexts: &[&Context], mut done: impl FnMut() -> bool, what: &str) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        for ctx in contexts {
            ctx.poll(Duration::from_millis(1)).expect("poll failed");
        }
    }
    panic!("timed out waiting for {}", what);
}

/// Dial from `client` into a fresh listener and adopt the accepted socket
/// on `server`, returning both ends.
fn connect_pair(client: &Context, server: &Context) -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("local addr");

    let conn_a = client.connect(addr);
    let stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                client.poll(Duration::from_millis(1)).expect("poll failed");
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    };
    let conn_b = server.accepted(stream);
    (conn_a, conn_b)
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed) & 0xff) as u8).collect()
}

#[test]
fn test_tiny_echo() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    let wrote = Rc::new(Cell::new(false));
    let got = Rc::new(RefCell::new(Vec::new()));
    {
        let wrote = wrote.clone();
        conn_a.write(b"hello".to_vec(), move |r| {
            r.expect("write failed");
            wrote.set(true);
        });
    }
    {
        let got = got.clone();
        conn_b.read(move |r| {
            got.borrow_mut().extend_from_slice(r.expect("read failed"));
        });
    }

    pump(
        &[&ctx_a, &ctx_b],
        || wrote.get() && !got.borrow().is_empty(),
        "tiny echo",
    );
    assert_eq!(&*got.borrow(), b"hello");
}

#[test]
fn test_exact_fit_buffer_sized_write() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    let data = pattern(rcpipe::BUFFER_SIZE, 7);
    let wrote = Rc::new(Cell::new(false));
    let got: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    {
        let wrote = wrote.clone();
        conn_a.write(data.clone(), move |r| {
            r.expect("write failed");
            wrote.set(true);
        });
    }
    {
        let got = got.clone();
        conn_b.read_exact(vec![0; rcpipe::BUFFER_SIZE], move |r| {
            *got.borrow_mut() = Some(r.expect("read failed"));
        });
    }

    pump(
        &[&ctx_a, &ctx_b],
        || wrote.get() && got.borrow().is_some(),
        "exact-fit transfer",
    );
    assert_eq!(got.borrow().as_deref(), Some(data.as_slice()));
}

#[test]
fn test_backpressure_and_write_order() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    // Four 1 MiB writes against a 2 MiB outbox: the later ones must wait
    // for acknowledgements before their bytes fit.
    let write_order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..4 {
        let write_order = write_order.clone();
        conn_a.write(pattern(MIB, i), move |r| {
            r.expect("write failed");
            write_order.borrow_mut().push(i);
        });
    }

    let reads: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..4 {
        let reads = reads.clone();
        conn_b.read_exact(vec![0; MIB], move |r| {
            reads.borrow_mut().push(r.expect("read failed"));
        });
    }

    pump(
        &[&ctx_a, &ctx_b],
        || write_order.borrow().len() == 4 && reads.borrow().len() == 4,
        "four backpressured writes",
    );
    assert_eq!(&*write_order.borrow(), &[0, 1, 2, 3]);
    for (i, read) in reads.borrow().iter().enumerate() {
        assert_eq!(read, &pattern(MIB, i), "read {} mismatched", i);
    }
}

#[test]
fn test_wraparound_alternation() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    // Alternating 512 KiB transfers walk the rings across their 2 MiB
    // boundary several times.
    for i in 0..10 {
        let data = pattern(512 * 1024, i);
        let wrote = Rc::new(Cell::new(false));
        let got: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
        {
            let wrote = wrote.clone();
            conn_a.write(data.clone(), move |r| {
                r.expect("write failed");
                wrote.set(true);
            });
        }
        {
            let got = got.clone();
            conn_b.read_exact(vec![0; 512 * 1024], move |r| {
                *got.borrow_mut() = Some(r.expect("read failed"));
            });
        }
        pump(
            &[&ctx_a, &ctx_b],
            || wrote.get() && got.borrow().is_some(),
            "wraparound iteration",
        );
        assert_eq!(got.borrow().as_deref(), Some(data.as_slice()), "iteration {}", i);
    }
}

#[test]
fn test_framed_roundtrip() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    let payload = pattern(100_000, 3);
    let got = Rc::new(RefCell::new(Vec::new()));
    conn_a.write_framed(payload.clone(), |r| r.expect("write failed"));
    {
        let got = got.clone();
        conn_b.read_framed(move |r| {
            got.borrow_mut().extend_from_slice(r.expect("read failed"));
        });
    }

    pump(
        &[&ctx_a, &ctx_b],
        || !got.borrow().is_empty(),
        "framed roundtrip",
    );
    assert_eq!(&*got.borrow(), &payload);
}

#[test]
fn test_read_callback_order_across_flavours() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    // One frame then raw bytes; the framed read and the sized read must
    // complete in submission order.
    conn_a.write_framed(b"first".to_vec(), |r| r.expect("write failed"));
    conn_a.write(b"second".to_vec(), |r| r.expect("write failed"));

    let order = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        conn_b.read_framed(move |r| {
            assert_eq!(r.expect("framed read failed"), b"first");
            order.borrow_mut().push("framed");
        });
    }
    {
        let order = order.clone();
        conn_b.read_exact(vec![0; 6], move |r| {
            assert_eq!(r.expect("sized read failed"), b"second");
            order.borrow_mut().push("sized");
        });
    }

    pump(
        &[&ctx_a, &ctx_b],
        || order.borrow().len() == 2,
        "ordered reads",
    );
    assert_eq!(&*order.borrow(), &["framed", "sized"]);
}

#[test]
fn test_close_mid_flight_fails_pending_and_later_operations() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, _conn_b) = connect_pair(&ctx_a, &ctx_b);

    // Submit and close back to back, before the loop had a chance to run
    // the handshake: the write must fail with ConnectionClosed, exactly
    // once.
    let failures = Rc::new(RefCell::new(Vec::new()));
    {
        let failures = failures.clone();
        conn_a.write(pattern(MIB, 1), move |r| {
            failures.borrow_mut().push(r.expect_err("write should fail"));
        });
    }
    conn_a.close();
    conn_a.close();

    pump(
        &[&ctx_a, &ctx_b],
        || !failures.borrow().is_empty(),
        "close mid-flight",
    );
    assert_eq!(failures.borrow().len(), 1);
    assert_eq!(failures.borrow()[0], Error::ConnectionClosed);

    // Operations submitted after the error complete with the same error.
    let late = Rc::new(RefCell::new(Vec::new()));
    {
        let late = late.clone();
        conn_a.read(move |r| {
            late.borrow_mut().push(r.map(|_| ()).expect_err("read should fail"));
        });
    }
    {
        let late = late.clone();
        conn_a.write(b"late".to_vec(), move |r| {
            late.borrow_mut().push(r.expect_err("write should fail"));
        });
    }
    pump(&[&ctx_a, &ctx_b], || late.borrow().len() == 2, "late failures");
    assert_eq!(
        &*late.borrow(),
        &[Error::ConnectionClosed, Error::ConnectionClosed]
    );
}

#[test]
fn test_peer_eof_during_handshake() {
    let Some(ctx_a) = make_context() else {
        return;
    };

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("local addr");

    let conn_a = ctx_a.connect(addr);
    let eof = Rc::new(RefCell::new(None));
    {
        let eof = eof.clone();
        conn_a.read(move |r| {
            *eof.borrow_mut() = Some(r.map(|_| ()).expect_err("read should fail"));
        });
    }

    let stream: TcpStream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                ctx_a.poll(Duration::from_millis(1)).expect("poll failed");
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    };

    // Play the peer far enough to absorb A's setup blob, then hang up
    // without answering. A sits in the receive half of its handshake and
    // must observe end of file.
    stream.set_nonblocking(true).expect("nonblocking");
    let mut peer = stream;
    let mut blob = Vec::new();
    pump(
        &[&ctx_a],
        || {
            let mut chunk = [0u8; 64];
            match peer.read(&mut chunk) {
                Ok(n) => blob.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("peer read failed: {}", e),
            }
            blob.len() >= rcpipe::wire::SETUP_BLOB_SIZE
        },
        "setup blob from A",
    );
    drop(peer);

    pump(&[&ctx_a], || eof.borrow().is_some(), "EOF on A");
    assert_eq!(*eof.borrow(), Some(Error::Eof));
}

#[test]
fn test_context_close_fails_every_connection() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);

    let errors = Rc::new(RefCell::new(Vec::new()));
    {
        let errors = errors.clone();
        conn_a.read(move |r| {
            errors.borrow_mut().push(r.map(|_| ()).expect_err("read should fail"));
        });
    }
    {
        let errors = errors.clone();
        conn_b.read(move |r| {
            errors.borrow_mut().push(r.map(|_| ()).expect_err("read should fail"));
        });
    }

    // Let both connections establish first.
    for _ in 0..200 {
        ctx_a.poll(Duration::from_millis(1)).expect("poll failed");
        ctx_b.poll(Duration::from_millis(1)).expect("poll failed");
    }

    ctx_a.close();
    ctx_b.close();
    pump(
        &[&ctx_a, &ctx_b],
        || errors.borrow().len() == 2,
        "context close",
    );
    assert_eq!(
        &*errors.borrow(),
        &[Error::ConnectionClosed, Error::ConnectionClosed]
    );
}

#[test]
fn test_set_id_has_no_behavioural_effect() {
    let (Some(ctx_a), Some(ctx_b)) = (make_context(), make_context()) else {
        return;
    };
    let (conn_a, conn_b) = connect_pair(&ctx_a, &ctx_b);
    conn_a.set_id("alice".to_string());
    conn_b.set_id("bob".to_string());

    let got = Rc::new(RefCell::new(Vec::new()));
    conn_a.write(b"still works".to_vec(), |r| r.expect("write failed"));
    {
        let got = got.clone();
        conn_b.read(move |r| {
            got.borrow_mut().extend_from_slice(r.expect("read failed"));
        });
    }
    pump(&[&ctx_a, &ctx_b], || !got.borrow().is_empty(), "renamed echo");
    assert_eq!(&*got.borrow(), b"still works");
}
