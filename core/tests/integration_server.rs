//! Subscriber server over real WebSockets
//!
//! Run with: cargo test --test integration_server

use danmuhub_core::command::Envelope;
use danmuhub_core::server::{self, BroadcastHub};
use danmuhub_core::{Command, Config, ConfigStore, ConnectionState, GiftCache};
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Client {
    // The server task may still be binding
    for _ in 0..50 {
        if let Ok((client, _)) = tokio_tungstenite::connect_async(format!("ws://{}/", addr)).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("subscriber server on {} never came up", addr);
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for the server")
            .expect("server closed the stream")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_subscribers(hub: &BroadcastHub, count: usize) {
    for _ in 0..100 {
        if hub.subscriber_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} subscribers, have {}", count, hub.subscriber_count());
}

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_bootstrap_then_live() {
    let gifts = GiftCache::new();
    gifts.replace(json!({"31036": {"name": "小花花"}}));

    let mut config = Config::default();
    config.danmu_receiver.roomid = 7;
    let hub = Arc::new(BroadcastHub::new(
        Arc::new(ConfigStore::new(config)),
        gifts,
        true,
        16,
    ));
    hub.publish_envelope(&Envelope::new(Command::Upstream(
        json!({"cmd": "DANMU_MSG", "info": [[0], "earlier"]}),
    )));
    hub.publish_envelope(&Envelope::new(Command::status(ConnectionState::Open)));

    let handle = server::start(hub.clone(), local()).unwrap();
    assert_ne!(handle.addr.port(), 0);

    let mut client = connect(handle.addr).await;

    let config = next_json(&mut client).await;
    assert_eq!(config["cmd"], "appCommand");
    assert_eq!(config["data"]["cmd"], "configUpdate");
    assert_eq!(config["data"]["data"]["danmuReceiver"]["roomid"], 7);

    let gift = next_json(&mut client).await;
    assert_eq!(gift["data"]["cmd"], "giftConfigUpdate");
    assert_eq!(gift["data"]["data"]["31036"]["name"], "小花花");

    let status = next_json(&mut client).await;
    assert_eq!(status["data"]["cmd"], "statusUpdate");
    assert_eq!(status["data"]["data"]["status"], "open");

    // Only the renderable upstream entry is replayed
    let replay = next_json(&mut client).await;
    assert_eq!(replay["cmd"], "messageLog");
    assert_eq!(replay["message"]["data"]["info"][1], "earlier");

    wait_for_subscribers(&hub, 1).await;
    hub.publish(&Command::Upstream(json!({"cmd": "DANMU_MSG", "info": [[0], "live"]})));

    let live = next_json(&mut client).await;
    assert_eq!(live["cmd"], "biliBiliCommand");
    assert_eq!(live["data"]["info"][1], "live");

    handle.stop();
}

#[tokio::test]
async fn test_every_subscriber_gets_each_command() {
    let hub = Arc::new(BroadcastHub::new(
        Arc::new(ConfigStore::new(Config::default())),
        GiftCache::new(),
        false,
        16,
    ));
    let handle = server::start(hub.clone(), local()).unwrap();

    let mut a = connect(handle.addr).await;
    let mut b = connect(handle.addr).await;
    for client in [&mut a, &mut b] {
        for _ in 0..3 {
            next_json(client).await;
        }
    }
    wait_for_subscribers(&hub, 2).await;

    for i in 0..3 {
        hub.publish(&Command::Upstream(json!({"cmd": "DANMU_MSG", "n": i})));
    }

    for client in [&mut a, &mut b] {
        for i in 0..3 {
            assert_eq!(next_json(client).await["data"]["n"], i);
        }
    }

    handle.stop();
}

#[tokio::test]
async fn test_status_endpoint() {
    let hub = Arc::new(BroadcastHub::new(
        Arc::new(ConfigStore::new(Config::default())),
        GiftCache::new(),
        false,
        16,
    ));
    hub.publish(&Command::status(ConnectionState::Reconnecting));
    let handle = server::start(hub, local()).unwrap();

    // Minimal HTTP/1.1 request; warp closes after replying
    let mut response = String::new();
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(handle.addr).await {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            stream
                .write_all(b"GET /api/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            stream.read_to_string(&mut response).await.unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let status: Value = serde_json::from_str(body).unwrap();
    assert_eq!(status["connection"], "reconnecting");
    assert_eq!(status["subscribers"], 0);

    handle.stop();
}

#[tokio::test]
async fn test_stop_closes_connected_subscribers() {
    let hub = Arc::new(BroadcastHub::new(
        Arc::new(ConfigStore::new(Config::default())),
        GiftCache::new(),
        false,
        16,
    ));
    let handle = server::start(hub.clone(), local()).unwrap();
    let mut client = connect(handle.addr).await;
    for _ in 0..3 {
        next_json(&mut client).await;
    }
    wait_for_subscribers(&hub, 1).await;

    handle.stop();

    // The socket is closed rather than fed further commands
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(other)) => panic!("unexpected message after stop: {:?}", other),
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "subscriber still open after stop");

    for _ in 0..100 {
        if hub.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.subscriber_count(), 0);
    assert_eq!(hub.publish(&Command::Upstream(json!({"after": "stop"}))), 0);
}

#[tokio::test]
async fn test_port_in_use_is_an_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let hub = Arc::new(BroadcastHub::new(
        Arc::new(ConfigStore::new(Config::default())),
        GiftCache::new(),
        false,
        16,
    ));
    assert!(matches!(
        server::start(hub, addr),
        Err(server::ServerError::Bind { .. })
    ));
}
