//! Connect/disconnect/reconnect cycles against a loopback WebSocket server.

use async_tungstenite::tungstenite::Message;
use futures::{SinkExt, StreamExt};
use ovoplot::Transport;
use ovoplot::transport::SendOptions;
use ovoplot_common::TransportError;
use ovoplot_websockets::{WifiSettings, WifiTransport};
use tokio::net::TcpListener;
use url::Url;

/// Accepts connections forever; answers every `v` query with a version line.
async fn spawn_version_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(ws) = async_tungstenite::tokio::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(message)) = source.next().await {
                    match message {
                        Message::Text(text) => {
                            if text.starts_with('v') {
                                let _ = sink.send(Message::text("EBBv13\r\n")).await;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

fn transport_for(port: u16) -> WifiTransport {
    let url = Url::parse(&format!("ws://127.0.0.1:{}/", port)).expect("loopback url");
    WifiTransport::new(WifiSettings {
        url: Some(url),
        ..WifiSettings::default()
    })
}

#[tokio::test]
async fn reconnect_after_disconnect_receives_responses_again() {
    let port = spawn_version_server().await;
    let mut transport = transport_for(port);

    let status = transport.connect().await.expect("first connect");
    assert_eq!(status, "EBBv13");
    transport.disconnect().await;
    assert!(!transport.is_connected());

    // While disconnected the framing layer stays shut.
    transport.protocol().feed(b"stale\r");
    assert_eq!(transport.protocol().backlog_len(), 0);
    match transport.send_command("v", SendOptions::response()).await {
        Err(TransportError::NotConnected) => {}
        other => panic!("expected not connected, got {:?}", other),
    }

    let status = transport.connect().await.expect("second connect");
    assert_eq!(status, "EBBv13");
    assert!(transport.is_connected());
    let version = transport
        .send_command("v", SendOptions::response())
        .await
        .expect("response after reconnect");
    assert_eq!(version, "EBBv13");
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let port = spawn_version_server().await;
    let mut transport = transport_for(port);

    transport.connect().await.expect("connect");
    transport.disconnect().await;
    transport.disconnect().await;
    assert!(!transport.is_connected());
}
