//! Device lifecycle through the registry: create, change, remove, cleanup.

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use chardev_core::{ChardevError, ChardevEvent, ChardevOptions, ConnectionPhase};

use common::WAIT;

/// Changing a socket's address keeps the front-end attached and moves the
/// listener.
#[tokio::test]
async fn test_change_moves_listener_keeps_front_end() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.sock");
    let second = dir.path().join("second.sock");
    let reg = common::registry();

    let chr = reg
        .create_from_str(&format!("socket,id=mv,path={},server=on", first.display()))
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);

    let _old_peer = UnixStream::connect(&first).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);

    let opts =
        ChardevOptions::parse(&format!("socket,id=mv,path={},server=on", second.display()))
            .unwrap();
    reg.change(opts).await.unwrap();
    assert_eq!(fe.changes(), 1);
    assert!(!first.exists());
    assert!(chr.backend().filename().contains("second.sock"));

    let mut peer = UnixStream::connect(&second).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 2, WAIT).await);
    peer.write_all(b"moved").await.unwrap();
    assert!(fe.wait_for_data(b"moved", WAIT).await);

    handle.write(b"ok", true).await.unwrap();
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    drop(handle);
    reg.cleanup().await;
}

/// A change whose new transport cannot open leaves the old configuration in
/// place.
#[tokio::test]
async fn test_failed_change_restores_previous_transport() {
    let dir = tempfile::tempdir().unwrap();
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=keep,host=127.0.0.1,port=0,server=on")
        .await
        .unwrap();
    let (_handle, fe) = common::attach(&chr, 4096);

    let bad = ChardevOptions::parse(&format!(
        "socket,id=keep,path={}",
        dir.path().join("absent.sock").display()
    ))
    .unwrap();
    assert!(reg.change(bad).await.is_err());
    assert_eq!(fe.changes(), 0);
    assert!(chr.options().backend.kind() == "socket");

    // The restored listener took a fresh port.
    let _peer = TcpStream::connect(common::bound_addr(&chr)).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    assert_eq!(chr.status().unwrap().phase, ConnectionPhase::Connected);
    reg.cleanup().await;
}

/// Cleanup stops every device, even with peers and retry timers active.
#[tokio::test]
async fn test_cleanup_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let listen = dir.path().join("l.sock");
    let reg = common::registry();

    let server = reg
        .create_from_str(&format!("socket,id=srv,path={},server=on", listen.display()))
        .await
        .unwrap();
    reg.create_from_str(&format!(
        "socket,id=retry,path={},reconnect=1",
        dir.path().join("never.sock").display()
    ))
    .await
    .unwrap();
    reg.create_from_str("ringbuf,id=ring").await.unwrap();
    let mut peer = UnixStream::connect(&listen).await.unwrap();
    server.wait_connected(Some(WAIT)).await.unwrap();

    reg.machine_done().unwrap();
    reg.cleanup().await;
    assert!(reg.is_empty());
    assert!(!listen.exists());

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    assert!(matches!(
        server.wait_connected(None).await,
        Err(ChardevError::Shutdown)
    ));
}

/// Legacy filenames create the same devices as option strings.
#[tokio::test]
async fn test_compat_filenames() {
    let reg = common::registry();
    let chr = reg
        .create_compat("legacy", "telnet:127.0.0.1:0,server=on")
        .await
        .unwrap();
    assert_eq!(chr.kind(), "socket");
    assert!(chr
        .backend()
        .filename()
        .starts_with("disconnected:tcp:127.0.0.1:0,server=on"));
    reg.cleanup().await;
}
