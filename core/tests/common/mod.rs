//! Shared fixtures for the integration tests: a scripted fake upstream feed
//! and config helpers pointing the receiver at it.

#![allow(dead_code)]

use danmuhub_core::protocol::{Frame, OpCode, PayloadKind};
use danmuhub_core::Config;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// What the fake upstream does after reading a client's join frame.
#[derive(Clone)]
pub enum Behaviour {
    /// Send these binary messages, then keep reading
    Script(Vec<Vec<u8>>),
    /// Drop the connection without a close handshake
    DropAfterJoin,
    /// Close with this code
    CloseWith(u16),
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    /// Every binary message received, tagged with its connection index
    pub inbound: mpsc::UnboundedReceiver<(usize, Vec<u8>)>,
}

impl FakeUpstream {
    pub async fn next(&mut self) -> (usize, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("timed out waiting for upstream traffic")
            .expect("fake upstream stopped")
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some((conn, bytes))) = tokio::time::timeout(wait, self.inbound.recv()).await {
            panic!("unexpected {} bytes on connection {}", bytes.len(), conn);
        }
    }
}

pub async fn spawn_upstream(behaviour: Behaviour) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, inbound) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut index = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let conn = index;
            index += 1;
            let behaviour = behaviour.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };

                let join = match ws.next().await {
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    _ => return,
                };
                let _ = tx.send((conn, join));

                match behaviour {
                    Behaviour::Script(messages) => {
                        for message in messages {
                            if ws.send(Message::Binary(message)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Behaviour::DropAfterJoin => return,
                    Behaviour::CloseWith(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "closed by test".into(),
                        };
                        let _ = ws.send(Message::Close(Some(frame))).await;
                        while let Some(Ok(_)) = ws.next().await {}
                        return;
                    }
                }

                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Binary(bytes) = message {
                        let _ = tx.send((conn, bytes));
                    }
                }
            });
        }
    });

    FakeUpstream { addr, inbound }
}

/// Config pointing the receiver at `upstream`, with history in `history_dir`.
pub fn config_for(upstream: SocketAddr, history_dir: &Path) -> Config {
    let mut config = Config::default();
    config.danmu_receiver.host = upstream.ip().to_string();
    config.danmu_receiver.port = upstream.port();
    config.danmu_receiver.secure = false;
    config.danmu_receiver.roomid = 123;
    config.danmu_receiver.reconnect_delay_ms = 50;
    config.history.directory = Some(history_dir.to_path_buf());
    config.http_server_port = 0;
    config
}

pub fn heartbeat_reply(popularity: i32) -> Vec<u8> {
    Frame::new(
        OpCode::HeartbeatResponse,
        PayloadKind::Int32,
        popularity.to_be_bytes().to_vec(),
    )
    .encode()
}

pub fn message_frame(json: &str) -> Vec<u8> {
    Frame::new(OpCode::Message, PayloadKind::PlainJson, json.as_bytes().to_vec()).encode()
}
