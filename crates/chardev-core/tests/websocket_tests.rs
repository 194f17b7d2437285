//! WebSocket listeners.

mod common;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use chardev_core::{ChardevEvent, ChardevError};

use common::WAIT;

/// Front-end bytes travel as binary messages in both directions.
#[tokio::test]
async fn test_websocket_round_trip() {
    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=ws,host=127.0.0.1,port=0,server=on,websocket=on")
        .await
        .unwrap();
    let (handle, fe) = common::attach(&chr, 4096);

    let addr = common::bound_addr(&chr);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut ws, _response) = tokio_tungstenite::client_async(format!("ws://{addr}/"), tcp)
        .await
        .unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Opened, 1, WAIT).await);
    assert!(chr.backend().filename().starts_with("websocket:"));

    ws.send(Message::binary(b"ping".to_vec())).await.unwrap();
    assert!(fe.wait_for_data(b"ping", WAIT).await);
    ws.send(Message::text("text")).await.unwrap();
    assert!(fe.wait_for_data(b"pingtext", WAIT).await);

    handle.write(b"pong", true).await.unwrap();
    let reply = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.into_data(), b"pong".to_vec());

    ws.close(None).await.unwrap();
    assert!(fe.wait_for_event(ChardevEvent::Closed, 1, WAIT).await);

    drop(handle);
    reg.cleanup().await;
}

/// A peer that never upgrades is dropped and the device stays closed.
#[tokio::test]
async fn test_websocket_rejects_plain_peer() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let reg = common::registry();
    let chr = reg
        .create_from_str("socket,id=ws2,host=127.0.0.1,port=0,server=on,websocket=on")
        .await
        .unwrap();
    let (_handle, fe) = common::attach(&chr, 4096);

    let mut tcp = TcpStream::connect(common::bound_addr(&chr)).await.unwrap();
    tcp.write_all(b"not http at all\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(WAIT, tcp.read_to_end(&mut buf)).await.unwrap();
    assert_eq!(fe.count(ChardevEvent::Opened), 0);
    reg.cleanup().await;
}

/// websocket requires listen mode and excludes telnet.
#[tokio::test]
async fn test_websocket_option_conflicts() {
    let reg = common::registry();
    for options in [
        "socket,id=a,host=127.0.0.1,port=0,websocket=on",
        "socket,id=b,host=127.0.0.1,port=0,server=on,websocket=on,telnet=on",
    ] {
        assert!(matches!(
            reg.create_from_str(options).await,
            Err(ChardevError::Config(_))
        ));
    }
}
