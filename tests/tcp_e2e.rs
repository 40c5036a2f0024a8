//! End-to-end TCP scenarios over loopback sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use senmux::config::load_from_bytes;
use senmux::engine::Engine;
use senmux::queue::SenQueue;
use senmux::sentence::Senblk;
use senmux::tcp::{init_tcp, TcpIface, TcpLink};
use senmux::{Direction, IfaceCtx, TagFlags};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn ctx(name: &str, id: u32, direction: Direction, persist: bool, ipersist: bool) -> IfaceCtx {
    IfaceCtx {
        id,
        name: name.to_string(),
        direction,
        persist,
        ipersist,
        qsize: 32,
        tagflags: TagFlags::default(),
        heartbeat: 0,
        checksum: false,
        strict: false,
        ifilter: None,
        ofilter: None,
    }
}

fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
    kv.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn read_exactly(sock: &mut TcpStream, n: usize) -> Vec<u8> {
    sock.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut buf = vec![0u8; n];
    sock.read_exact(&mut buf).unwrap();
    buf
}

fn next_with_timeout(q: &Arc<SenQueue>, millis: u64) -> Option<Senblk> {
    // Poll rather than block so a broken pipeline fails the test
    // instead of hanging it.
    let deadline = std::time::Instant::now() + Duration::from_millis(millis);
    loop {
        if !q.is_empty() {
            return q.next_senblk();
        }
        if std::time::Instant::now() > deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Non-persist client with a preamble: the first bytes on the wire are
/// exactly the parsed preamble, then queued payload; the interface
/// exits when its queue closes.
#[test]
fn client_preamble_before_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let engine = Engine::new(32);
    let ifaces = init_tcp(
        &engine,
        ctx("out0", engine.alloc_id(), Direction::Out, false, false),
        &pairs(&[
            ("address", "127.0.0.1"),
            ("port", &port.to_string()),
            ("preamble", "?WATCH={\\\"enable\\\":true}\\r\\n"),
        ]),
    )
    .unwrap();
    assert_eq!(ifaces.len(), 1);
    let q = ifaces[0].q.clone().unwrap();
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    let (mut peer, _) = listener.accept().unwrap();
    let preamble = read_exactly(&mut peer, 24);
    assert_eq!(preamble, b"?WATCH={\"enable\":true}\r\n");

    q.push(Senblk::new(b"$GPGGA,1*00\r\n".to_vec(), 0));
    q.close();

    let mut rest = Vec::new();
    peer.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    peer.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"$GPGGA,1*00\r\n");
}

/// Bidirectional persist client: the peer drops the connection after
/// one sentence; the reader repairs it exactly once, the preamble is
/// re-sent before anything else, and the writer resumes on the fresh
/// socket.
#[test]
fn persist_client_reconnects_after_peer_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let engine = Engine::new(32);
    engine.start();

    // A second output captures what the inbound side feeds the engine.
    let capture = Arc::new(SenQueue::new(32));
    engine.register_output(engine.alloc_id(), Arc::clone(&capture), None);

    let ifaces = init_tcp(
        &engine,
        ctx("gps", engine.alloc_id(), Direction::Both, true, false),
        &pairs(&[
            ("address", "127.0.0.1"),
            ("port", &port.to_string()),
            ("retry", "1"),
            ("preamble", "PRE\\n"),
        ]),
    )
    .unwrap();
    assert_eq!(ifaces.len(), 2);
    let out_q = ifaces[0].q.clone().unwrap();
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    // First connection: preamble arrives before anything else.
    let (mut conn1, _) = listener.accept().unwrap();
    assert_eq!(read_exactly(&mut conn1, 4), b"PRE\n");

    // Peer sends one sentence, which surfaces through the engine.
    conn1.write_all(b"A*00\r\n").unwrap();
    let got = next_with_timeout(&capture, 3000).expect("sentence did not reach the engine");
    assert_eq!(got.data, b"A*00\r\n");

    // Peer drops. The reader sees EOF and repairs the connection.
    drop(conn1);

    let (mut conn2, _) = listener.accept().unwrap();
    assert_eq!(read_exactly(&mut conn2, 4), b"PRE\n");

    // The writer picks up the fresh socket transparently.
    out_q.push(Senblk::new(b"B*00\r\n".to_vec(), 0));
    assert_eq!(read_exactly(&mut conn2, 6), b"B*00\r\n");

    // Exactly one reconnect happened for the one outage.
    listener.set_nonblocking(true).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(
        listener.accept().is_err(),
        "unexpected extra reconnect after a single outage"
    );
}

/// Persist writer: a write failure triggers one reconnect which flushes
/// everything buffered during the outage; records enqueued afterwards
/// flow normally.
#[test]
fn persist_writer_flushes_queue_on_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let engine = Engine::new(32);
    let ifaces = init_tcp(
        &engine,
        ctx("out1", engine.alloc_id(), Direction::Out, true, false),
        &pairs(&[
            ("address", "127.0.0.1"),
            ("port", &port.to_string()),
            ("retry", "1"),
        ]),
    )
    .unwrap();
    let q = ifaces[0].q.clone().unwrap();
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    let (conn1, _) = listener.accept().unwrap();
    // Close the first connection outright; subsequent writes fail once
    // the reset propagates.
    drop(conn1);
    thread::sleep(Duration::from_millis(100));

    // The record in flight when the connection dies is considered
    // delivered to the lost connection; everything buffered during the
    // outage is flushed on reconnect.
    q.push(Senblk::new(b"STALE1\r\n".to_vec(), 0));
    thread::sleep(Duration::from_millis(150));
    q.push(Senblk::new(b"STALE2\r\n".to_vec(), 0));
    thread::sleep(Duration::from_millis(150));
    q.push(Senblk::new(b"STALE3\r\n".to_vec(), 0));

    // Reconnect lands once the writer's retry interval elapses.
    let (mut conn2, _) = listener.accept().unwrap();
    // Give the writer time to finish the repair and flush.
    thread::sleep(Duration::from_millis(500));

    q.push(Senblk::new(b"FRESH*00\r\n".to_vec(), 0));
    let first = read_exactly(&mut conn2, 10);
    assert_eq!(
        first, b"FRESH*00\r\n",
        "stale records survived the reconnect flush"
    );
}

/// Initial-persist: the first connect fails, initialization still
/// succeeds, and the armed connector keeps retrying until the service
/// appears.
#[test]
fn ipersist_defers_connect_until_service_appears() {
    // Reserve a port nothing listens on yet.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let engine = Engine::new(32);
    let ifaces = init_tcp(
        &engine,
        ctx("lazy", engine.alloc_id(), Direction::Out, true, true),
        &pairs(&[
            ("address", "127.0.0.1"),
            ("port", &port.to_string()),
            ("retry", "1"),
        ]),
    )
    .unwrap();
    assert!(matches!(ifaces[0].link, TcpLink::Deferred(_)));
    let q = ifaces[0].q.clone().unwrap();
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    // Let the deferred connector fail at least once, then provide the
    // service it is waiting for.
    thread::sleep(Duration::from_millis(300));
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    q.push(Senblk::new(b"$GPGGA,1\r\n".to_vec(), 0));
    assert_eq!(read_exactly(&mut peer, 10), b"$GPGGA,1\r\n");
}

/// Bidirectional server: every accepted connection gets its own
/// interface pair, sentences from one client fan out to the others, and
/// nothing is echoed back to its source.
#[test]
fn server_fans_out_between_clients() {
    let engine = Engine::new(32);
    engine.start();

    let ifaces = init_tcp(
        &engine,
        ctx("srv", engine.alloc_id(), Direction::Both, false, false),
        &pairs(&[("mode", "server"), ("address", "127.0.0.1"), ("port", "0")]),
    )
    .unwrap();
    let bound = match &ifaces[0].link {
        TcpLink::Listener(st) => st.local_addr().unwrap(),
        _ => panic!("expected a listener"),
    };
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    let mut client_a = TcpStream::connect(bound).unwrap();
    let mut client_b = TcpStream::connect(bound).unwrap();
    // Let the accept loop spawn both connection pairs.
    thread::sleep(Duration::from_millis(300));

    client_a.write_all(b"$GPGGA,from-a*00\r\n").unwrap();

    let echoed = read_exactly(&mut client_b, 18);
    assert_eq!(echoed, b"$GPGGA,from-a*00\r\n");

    // The sender must not hear its own sentence back.
    client_a.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut buf = [0u8; 16];
    assert!(
        client_a.read(&mut buf).is_err(),
        "sentence was echoed to its source"
    );
}

/// gpsd mode: port defaults to 2947 unless overridden, and the WATCH
/// command goes out on connect.
#[test]
fn gpsd_client_sends_watch_command() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let engine = Engine::new(32);
    let ifaces = init_tcp(
        &engine,
        ctx("gpsd", engine.alloc_id(), Direction::In, false, false),
        &pairs(&[
            ("address", "127.0.0.1"),
            ("gpsd", "yes"),
            ("port", &port.to_string()),
        ]),
    )
    .unwrap();
    for ifa in ifaces {
        engine.spawn(ifa);
    }

    let (mut peer, _) = listener.accept().unwrap();
    let watch = read_exactly(&mut peer, 34);
    assert_eq!(watch, b"?WATCH={\"enable\":true,\"nmea\":true}");
}

/// A full configuration boots through the engine.
#[test]
fn launch_from_config() {
    let yaml = br#"
engine:
  qsize: 32
interfaces:
  - name: listen0
    direction: both
    options:
      mode: server
      address: 127.0.0.1
      port: "0"
"#;
    let cfg = load_from_bytes(yaml).unwrap();
    let engine = Engine::launch(&cfg).unwrap();
    assert_eq!(engine.output_count(), 0);
    engine.shutdown();
}

/// TcpIface fields stay reachable for embedding hosts.
#[test]
fn iface_exposes_its_parts() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = Engine::new(32);
    let ifaces: Vec<TcpIface> = init_tcp(
        &engine,
        ctx("x", engine.alloc_id(), Direction::Out, false, false),
        &pairs(&[("address", "127.0.0.1"), ("port", &port.to_string())]),
    )
    .unwrap();
    assert_eq!(ifaces[0].ctx.name, "x");
    assert!(ifaces[0].q.is_some());
}
