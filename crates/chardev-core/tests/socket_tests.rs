//! Socket backend integration tests.
//!
//! Each test opens real listening or connecting sockets on loopback or in a
//! temporary directory and drives them from the peer side.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;

use chardev_core::telnet::{option, TelnetGreeting, TelnetMode, IAC, IAC_BREAK, IAC_WILL};
use chardev_core::{Chardev, ChardevError, ChardevEvent, ConnectionPhase};

use common::WAIT;

// =============================================================================
// Listen mode
// =============================================================================

/// A telnet listener greets the peer, strips negotiation and reports BREAK.
#[tokio::test]
async fn test_telnet_listen_greets_and_filters() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=tel,host=127.0.0.1,port=0,server=on,telnet=on")
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);

    let mut peer = TcpStream::connect(common::bound_addr(&chr)).await.unwrap();
    let expected = TelnetGreeting::new(TelnetMode::Telnet);
    let mut greeting = vec![0u8; expected.bytes().len()];
    peer.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, expected.bytes());
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    assert!(chr.backend().filename().starts_with("telnet:127.0.0.1:"));

    peer.write_all(&[IAC, IAC_WILL, option::ECHO, b'A'])
        .await
        .unwrap();
    assert!(fe.wait_for_data(b"A", WAIT).await);

    peer.write_all(&[IAC, IAC_BREAK]).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Break, 1, WAIT).await);

    // 0xFF goes out doubled.
    assert_eq!(handle.write(&[b'x', 0xFF], true).await.unwrap(), 2);
    let mut out = [0u8; 3];
    peer.read_exact(&mut out).await.unwrap();
    assert_eq!(out, [b'x', 0xFF, 0xFF]);

    drop(handle);
    reg.cleanup().await;
}

/// While one peer is connected a second one is left in the backlog; it is
/// served once the first goes away.
#[tokio::test]
async fn test_listen_serves_one_peer_at_a_time() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=one,host=127.0.0.1,port=0,server=on,telnet=on")
        .await
        .unwrap();
    let (_handle, fe) = common::attach(&chr, 4096);
    let addr = common::bound_addr(&chr);
    let greeting_len = TelnetGreeting::new(TelnetMode::Telnet).bytes().len();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut buf = vec![0u8; greeting_len];
    first.read_exact(&mut buf).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut probe = [0u8; 1];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), second.read(&mut probe))
            .await
            .is_err(),
        "second peer must not be greeted while the first is connected"
    );

    drop(first);
    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, WAIT).await);

    second.read_exact(&mut buf).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 2, WAIT).await);
    assert_eq!(fe.count(ChardevEvent::Closed), 1);
    reg.cleanup().await;
}

/// Forced disconnect closes the channel and the listener takes new peers.
#[tokio::test]
async fn test_disconnect_then_accept_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dc.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=dc,path={},server=on", path.display()))
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);

    let mut peer = UnixStream::connect(&path).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    assert!(chr.backend().filename().starts_with("unix:"));

    handle.disconnect();
    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, WAIT).await);
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    assert!(chr.backend().filename().starts_with("disconnected:unix:"));

    let _again = UnixStream::connect(&path).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 2, WAIT).await);
    drop(handle);
    reg.cleanup().await;
    assert!(!path.exists());
}

/// With `wait=on`, creation only completes once a peer has connected.
#[tokio::test]
async fn test_wait_blocks_until_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wait.sock");
    let reg = Arc::new(common::registry());

    let options = format!("socket,id=w,path={},server=on,wait=on", path.display());
    let create = tokio::spawn({
        let reg = Arc::clone(&reg);
        async move { reg.create_from_str(&options).await }
    });

    let mut peer = None;
    for _ in 0..200 {
        if let Ok(stream) = UnixStream::connect(&path).await {
            peer = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(peer.is_some(), "listener never appeared");

    let chr = tokio::time::timeout(WAIT, create)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(chr.status().unwrap().phase, ConnectionPhase::Connected);
    reg.cleanup().await;
}

/// A back-pressured front-end still hears about a hang-up.
#[tokio::test]
async fn test_hangup_seen_with_zero_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hup.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=hup,path={},server=on", path.display()))
        .await
        .unwrap();
    let (_handle, fe) = common::attach(&chr, 0);

    let mut peer = UnixStream::connect(&path).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    peer.write_all(b"held").await.unwrap();
    drop(peer);

    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, WAIT).await);
    assert!(fe.data().is_empty());
    reg.cleanup().await;
}

// =============================================================================
// Connect mode
// =============================================================================

/// A plain client connects during creation.
#[tokio::test]
async fn test_client_connects_synchronously() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let reg = common::registry();

    let chr = reg
        .create_from_str(&format!("socket,id=cl,host=127.0.0.1,port={port}"))
        .await
        .unwrap();
    let (mut peer, _) = server.accept().await.unwrap();
    let (handle, fe) = common::attach(&chr, 4096);
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    assert!(chr
        .backend()
        .filename()
        .ends_with(&format!("<-127.0.0.1:{port}")));

    handle.write(b"hello", true).await.unwrap();
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    peer.write_all(b"world").await.unwrap();
    assert!(fe.wait_for_data(b"world", WAIT).await);
    drop(handle);
    reg.cleanup().await;
}

/// Without `reconnect`, a refused connect fails creation.
#[tokio::test]
async fn test_client_connect_failure_fails_create() {
    let dir = tempfile::tempdir().unwrap();
    let reg = common::registry();
    let result = reg
        .create_from_str(&format!(
            "socket,id=nope,path={}",
            dir.path().join("missing.sock").display()
        ))
        .await;
    assert!(matches!(result, Err(ChardevError::Connect { .. })));
    assert!(reg.is_empty());
}

/// A retrying client reports the outage once, keeps trying, and connects
/// once the peer shows up.
#[tokio::test]
async fn test_reconnect_reports_once_then_connects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("later.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=rc,path={},reconnect=1", path.display()))
        .await
        .unwrap();
    let (_handle, fe) = common::attach(&chr, 4096);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let status = chr.status().unwrap();
    assert_ne!(status.phase, ConnectionPhase::Connected);
    assert!(status.connect_attempts >= 1);
    assert_eq!(status.reported_failures, 1);
    assert_eq!(fe.count(ChardevEvent::Closed), 0);

    let listener = UnixListener::bind(&path).unwrap();
    let (peer, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    // Losing the peer re-arms the timer without a new report.
    drop(peer);
    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, WAIT).await);
    let (_peer, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 2, WAIT).await);
    assert_eq!(chr.status().unwrap().reported_failures, 1);
    reg.cleanup().await;
}

/// `wait_connected` on a retrying client connects on demand.
#[tokio::test]
async fn test_wait_connected_triggers_connect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demand.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=wc,path={},reconnect=60", path.display()))
        .await
        .unwrap();
    assert!(matches!(
        chr.wait_connected(Some(Duration::ZERO)).await,
        Err(ChardevError::Timeout { .. })
    ));

    let listener = UnixListener::bind(&path).unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
    chr.wait_connected(Some(WAIT)).await.unwrap();
    let _peer = accept.await.unwrap().unwrap();
    assert_eq!(chr.status().unwrap().phase, ConnectionPhase::Connected);
    reg.cleanup().await;
}

// =============================================================================
// Writes
// =============================================================================

/// A full write delivers every byte even when the socket buffer fills.
#[tokio::test]
async fn test_full_write_sends_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bulk.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=bulk,path={},server=on", path.display()))
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);
    let mut peer = UnixStream::connect(&path).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let reader = tokio::spawn(async move {
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).await.unwrap();
        got == expected
    });

    let written = handle.write(&payload, true).await.unwrap();
    assert_eq!(written, payload.len());
    assert!(reader.await.unwrap());
    assert_eq!(
        reg.metrics()
            .bytes_written
            .with_label_values(&["bulk"])
            .get(),
        payload.len() as u64
    );
    drop(handle);
    reg.cleanup().await;
}

/// Output with no peer is dropped without an error.
#[tokio::test]
async fn test_write_without_peer_is_discarded() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=idle,host=127.0.0.1,port=0,server=on")
        .await
        .unwrap();
    assert_eq!(chr.write(b"nobody", true).await.unwrap(), 6);
    reg.cleanup().await;
}

/// Bound on teardown while a write is stuck.
const STUCK_WAIT: Duration = Duration::from_secs(3);

/// Start a write far larger than the socket buffers and check that it is
/// still waiting on the peer.
async fn start_stuck_write(chr: &Arc<Chardev>) -> JoinHandle<chardev_core::Result<usize>> {
    let chr = Arc::clone(chr);
    let writer = tokio::spawn(async move { chr.write(&vec![b'x'; 32 << 20], true).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());
    writer
}

/// Cleanup finishes while a telnet write waits on a peer that never reads.
#[tokio::test]
async fn test_cleanup_not_blocked_by_stuck_telnet_write() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=stuck,host=127.0.0.1,port=0,server=on,telnet=on")
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);
    let _peer = TcpStream::connect(common::bound_addr(&chr)).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let writer = start_stuck_write(&chr).await;
    tokio::time::timeout(STUCK_WAIT, reg.cleanup())
        .await
        .expect("cleanup should not wait for the writer");
    let result = tokio::time::timeout(STUCK_WAIT, writer).await.unwrap().unwrap();
    assert!(result.is_err());
    drop(handle);
}

/// Disconnect closes the channel under a stuck telnet write, and the
/// listener keeps serving.
#[tokio::test]
async fn test_disconnect_not_blocked_by_stuck_telnet_write() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=stuck2,host=127.0.0.1,port=0,server=on,telnet=on")
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);
    let addr = common::bound_addr(&chr);
    let _first = TcpStream::connect(addr).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let writer = start_stuck_write(&chr).await;
    handle.disconnect();
    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, STUCK_WAIT).await);
    assert!(matches!(
        tokio::time::timeout(STUCK_WAIT, writer).await.unwrap().unwrap(),
        Err(ChardevError::NotConnected(_))
    ));

    let _second = TcpStream::connect(addr).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 2, WAIT).await);
    assert_eq!(chr.status().unwrap().phase, ConnectionPhase::Connected);

    drop(handle);
    reg.cleanup().await;
}

/// Cleanup finishes while a plain unix write waits for buffer space.
#[tokio::test]
async fn test_cleanup_not_blocked_by_stuck_plain_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stuck.sock");
    let reg = common::registry();
    let chr = reg
        .create_from_str(&format!("socket,id=stuck3,path={},server=on", path.display()))
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);
    let _peer = UnixStream::connect(&path).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let writer = start_stuck_write(&chr).await;
    tokio::time::timeout(STUCK_WAIT, reg.cleanup())
        .await
        .expect("cleanup should not wait for the writer");
    let result = tokio::time::timeout(STUCK_WAIT, writer).await.unwrap().unwrap();
    assert!(result.is_err());
    drop(handle);
}
