//! Handover Integration Tests
//!
//! These tests run both generations inside one process: the "parent" acquires
//! listeners and extracts its descriptors exactly as a reload would, the
//! descriptors are mapped to a contiguous range the way the child's spawn hook
//! maps them to `3..`, and the "successor" adopts them from the decoded
//! environment.
//!
//! Run with: `cargo test -p molt --test handover`

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use molt::codec::{self, ENV_INHERITED, ENV_LISTENERS};
use molt::respawn::extract_descriptors;
use molt::{Handover, HandoverError, Inheritance, ListenerKey, Registry, SignalClass, SlotTable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests.
fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Map the parent's extracted descriptors onto `base..base + n`, then decode
/// the parent's encoded environment into the successor's inheritance.
fn hand_over(parent: &Registry, base: RawFd) -> Inheritance {
    let descriptors = extract_descriptors(parent).unwrap();
    for (i, inherited) in descriptors.iter().enumerate() {
        let target = base + i as RawFd;
        assert_eq!(unsafe { libc::dup2(inherited.fd.as_raw_fd(), target) }, target);
    }

    let keys: Vec<ListenerKey> = descriptors.iter().map(|d| d.key.clone()).collect();
    let env = codec::encode(&keys);
    let lookup = |name: &str| env.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str());

    match codec::decode(lookup(ENV_INHERITED), lookup(ENV_LISTENERS)).unwrap() {
        Inheritance::Inherited(table) => {
            Inheritance::Inherited(SlotTable::with_base(base, table.keys().to_vec()))
        }
        Inheritance::Fresh => panic!("handover environment decoded as a fresh start"),
    }
}

/// Accept connections, echoing `hello world` back, until `stop` fires.
fn serve_echo(listener: TcpListener, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                accepted = listener.accept() => {
                    let (mut stream, _) = accepted.unwrap();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 11];
                        stream.read_exact(&mut buf).await.unwrap();
                        stream.write_all(&buf).await.unwrap();
                    });
                }
            }
        }
    })
}

async fn echo_tcp(addr: std::net::SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connection refused");
    stream.write_all(b"hello world").await.unwrap();
    let mut reply = vec![0u8; 11];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

async fn echo_udp(server: Arc<UdpSocket>) {
    let mut buf = [0u8; 64];
    let (n, peer) = server.recv_from(&mut buf).await.unwrap();
    server.send_to(&buf[..n], peer).await.unwrap();
}

/// TCP then UDP in one generation; the successor sees both in that order and
/// its TCP listener answers exactly like the parent's.
#[tokio::test]
async fn test_tcp_and_udp_handover_scenario() {
    init_test();

    let parent = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let tcp = parent.listen_tcp("127.0.0.1:0").unwrap();
    let udp = parent.listen_udp("127.0.0.1:0").unwrap();
    let tcp_addr = tcp.local_addr().unwrap();
    let udp_addr = udp.local_addr().unwrap();
    parent.finish().unwrap();

    assert_eq!(
        parent.registry().ordinal_of(&ListenerKey::tcp("127.0.0.1:0").unwrap()),
        Some(0)
    );
    assert_eq!(
        parent.registry().ordinal_of(&ListenerKey::udp("127.0.0.1:0").unwrap()),
        Some(1)
    );

    let parent_stop = CancellationToken::new();
    let parent_server = serve_echo(tcp, parent_stop.clone());
    assert_eq!(echo_tcp(tcp_addr).await, b"hello world");

    let inheritance = hand_over(parent.registry(), 800);
    let decoded: Vec<String> = inheritance
        .slot_table()
        .unwrap()
        .keys()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(decoded, vec!["tcp@127.0.0.1:0", "udp@127.0.0.1:0"]);

    let successor = Handover::new(Arc::new(Registry::new()), inheritance);
    assert!(successor.is_inherited());
    let tcp = successor.listen_tcp("127.0.0.1:0").unwrap();
    let udp = Arc::new(successor.listen_udp("127.0.0.1:0").unwrap());
    successor.finish().unwrap();

    assert_eq!(tcp.local_addr().unwrap(), tcp_addr);
    assert_eq!(udp.local_addr().unwrap(), udp_addr);
    assert_eq!(
        successor.registry().keys(),
        parent.registry().keys(),
        "successor ordinals must match the parent's"
    );

    // The parent stops accepting; the successor owns the port from here.
    parent_stop.cancel();
    parent_server.await.unwrap();

    let successor_stop = CancellationToken::new();
    let successor_server = serve_echo(tcp, successor_stop.clone());
    assert_eq!(echo_tcp(tcp_addr).await, b"hello world");

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo = tokio::spawn(echo_udp(Arc::clone(&udp)));
    client.send_to(b"ping", udp_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    echo.await.unwrap();

    successor_stop.cancel();
    successor_server.await.unwrap();
}

/// Connections made while neither generation is accepting wait in the
/// shared backlog instead of being refused.
#[tokio::test]
async fn test_no_refusal_across_handover() {
    init_test();

    let parent = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let tcp = parent.listen_tcp("127.0.0.1:0").unwrap();
    let addr = tcp.local_addr().unwrap();
    parent.finish().unwrap();

    let inheritance = hand_over(parent.registry(), 820);

    // Parent's serving handle goes away before the successor starts.
    drop(tcp);
    let pending = tokio::spawn(echo_tcp(addr));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let successor = Handover::new(Arc::new(Registry::new()), inheritance);
    let tcp = successor.listen_tcp("127.0.0.1:0").unwrap();
    let stop = CancellationToken::new();
    let server = serve_echo(tcp, stop.clone());

    let reply = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"hello world");

    stop.cancel();
    server.await.unwrap();
}

/// The successor asks for a listener the parent never passed down.
#[tokio::test]
async fn test_adoption_of_unknown_key_is_fatal() {
    init_test();

    let parent = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let _tcp = parent.listen_tcp("127.0.0.1:0").unwrap();
    parent.finish().unwrap();

    let inheritance = hand_over(parent.registry(), 840);
    let successor = Handover::new(Arc::new(Registry::new()), inheritance);

    let err = successor.listen_tcp("127.0.0.1:1").unwrap_err();
    assert!(matches!(err, HandoverError::Adoption { .. }), "got {err:?}");
    assert!(successor.registry().is_empty());

    let err = successor.finish().unwrap_err();
    assert!(matches!(err, HandoverError::UnclaimedInherited(_)), "got {err:?}");
}

/// Ordinals depend only on acquisition order, across many keys.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_ordinals_survive_handover_for_many_keys() {
    init_test();

    let parent = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let mut listeners = Vec::new();
    let mut addresses = Vec::new();
    for i in 0..12 {
        if i % 3 == 0 {
            let socket = parent.listen_udp(&format!("127.0.0.{}:0", i + 1)).unwrap();
            addresses.push(socket.local_addr().unwrap());
        } else {
            let listener = parent.listen_tcp(&format!("127.0.0.{}:0", i + 1)).unwrap();
            addresses.push(listener.local_addr().unwrap());
            listeners.push(listener);
        }
    }
    parent.finish().unwrap();

    let inheritance = hand_over(parent.registry(), 860);
    let table = inheritance.slot_table().unwrap().clone();
    for (i, key) in parent.registry().keys().iter().enumerate() {
        assert_eq!(table.offset_of(key), Some(i));
    }

    let successor = Handover::new(Arc::new(Registry::new()), inheritance);
    // Acquire in reverse; the successor still records the parent's ordinals.
    for (i, key) in parent.registry().keys().iter().enumerate().rev() {
        let addr = match key.protocol() {
            molt::Protocol::Tcp => successor.listen_tcp(key.address()).unwrap().local_addr(),
            molt::Protocol::Udp => successor.listen_udp(key.address()).unwrap().local_addr(),
        };
        assert_eq!(addr.unwrap(), addresses[i]);
    }
    successor.finish().unwrap();
    assert_eq!(successor.registry().keys(), parent.registry().keys());
}

/// The full coordinator path with a programmatic terminate trigger.
#[tokio::test]
async fn test_on_signal_with_terminate() {
    init_test();

    let handover = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let listener = handover.listen_tcp("127.0.0.1:0").unwrap();
    let registry = Arc::clone(handover.registry());
    let respawner = molt::Respawner::new(
        Arc::clone(&registry),
        molt::SpawnSpec::new("/bin/false", Vec::<String>::new()),
    );

    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tx.send(SignalClass::Terminate).await.unwrap();

    let class = handover
        .on_signal_with(rx, respawner, |ctx| async move {
            assert!(!ctx.is_cancelled());
            drop(listener);
            Ok::<(), std::io::Error>(())
        })
        .await
        .unwrap();

    assert_eq!(class, SignalClass::Terminate);
    assert!(registry.is_sealed());
    assert!(!registry.handover_started());
}

/// A second `SIGTERM` while the callback drains cancels its context.
#[tokio::test]
async fn test_second_sigterm_hurries_on_signal() {
    init_test();

    let handover = Handover::new(Arc::new(Registry::new()), Inheritance::Fresh);
    let _listener = handover.listen_tcp("127.0.0.1:0").unwrap();

    let lifecycle = tokio::spawn(handover.on_signal(|ctx| async move {
        ctx.cancelled().await;
        Err::<(), _>("drain interrupted")
    }));

    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGTERM) }, 0);
    }

    let class = tokio::time::timeout(Duration::from_secs(5), lifecycle)
        .await
        .expect("second SIGTERM never cancelled the callback context")
        .unwrap()
        .unwrap();
    assert_eq!(class, SignalClass::Terminate);
}
