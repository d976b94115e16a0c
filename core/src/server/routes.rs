use super::hub::{BroadcastHub, Subscription};
use super::ServerError;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warp::Filter;

// ============================================================================
// API RESPONSE TYPES
// ============================================================================

#[derive(Serialize)]
struct StatusResponse {
    connection: String,
    subscribers: usize,
    version: String,
}

// ============================================================================
// SERVER START
// ============================================================================

/// Running subscriber server.
///
/// Dropping the handle stops the server the same way `stop` does.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// Stop accepting subscribers and close the existing ones.
    pub fn stop(self) {
        self.shutdown.send_replace(true);
        info!("Subscriber server on {} stopped", self.addr);
    }
}

/// Serve subscribers on `addr`. Must be called inside a tokio runtime.
///
/// A WebSocket upgrade on any path becomes a subscriber; `GET /api/status`
/// reports the connection state. Port 0 picks a free port, reported in the
/// returned handle.
pub fn start(hub: Arc<BroadcastHub>, addr: SocketAddr) -> Result<ServerHandle, ServerError> {
    // Bind here so a taken port is an error rather than a panic inside the
    // server task.
    let bind_err = |source| ServerError::Bind { addr, source };
    let std_listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    std_listener.set_nonblocking(true).map_err(bind_err)?;
    let addr = std_listener.local_addr().map_err(bind_err)?;
    let listener = tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)?;

    let (shutdown, stopped) = watch::channel(false);

    let hub_filter = warp::any().map({
        let hub = hub.clone();
        move || hub.clone()
    });
    let stop_filter = warp::any().map({
        let stopped = stopped.clone();
        move || stopped.clone()
    });

    // 1. Status API
    let status_route = warp::path!("api" / "status")
        .and(warp::get())
        .and(hub_filter.clone())
        .and_then(handle_status)
        .boxed();

    // 2. Subscriber WebSocket on any path
    let ws_route = warp::ws()
        .and(hub_filter)
        .and(stop_filter)
        .map(
            |ws: warp::ws::Ws, hub: Arc<BroadcastHub>, stopped: watch::Receiver<bool>| {
                ws.on_upgrade(move |socket| handle_subscriber(socket, hub, stopped))
            },
        )
        .boxed();

    let cors = warp::cors().allow_any_origin();
    let routes = status_route.or(ws_route).with(cors).boxed();

    info!("Subscriber server listening on {}", addr);

    let mut signal = stopped;
    tokio::spawn(async move {
        warp::serve(routes)
            .incoming(listener)
            .graceful(async move {
                // A dropped handle also ends the wait
                let _ = signal.changed().await;
            })
            .run()
            .await;
        debug!("Subscriber server on {} finished", addr);
    });

    Ok(ServerHandle { addr, shutdown })
}

// ============================================================================
// API HANDLERS
// ============================================================================

async fn handle_status(hub: Arc<BroadcastHub>) -> Result<impl warp::Reply, warp::Rejection> {
    let response = StatusResponse {
        connection: hub.connection_state().to_string(),
        subscribers: hub.subscriber_count(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    Ok(warp::reply::json(&response))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn handle_subscriber(
    ws: warp::ws::WebSocket,
    hub: Arc<BroadcastHub>,
    mut stopped: watch::Receiver<bool>,
) {
    let (mut user_ws_tx, mut user_ws_rx) = ws.split();
    let Subscription {
        bootstrap,
        mut live,
    } = hub.subscribe();

    debug!("Subscriber connected ({} total)", hub.subscriber_count());

    for text in bootstrap {
        if user_ws_tx.send(warp::ws::Message::text(text)).await.is_err() {
            debug!("Subscriber left during bootstrap");
            return;
        }
    }

    // Forward live commands -> WebSocket until the server stops
    let forward = async move {
        if !*stopped.borrow_and_update() {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    received = live.recv() => match received {
                        Ok(text) => {
                            if user_ws_tx
                                .send(warp::ws::Message::text(text.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Dropping slow subscriber ({} commands behind)", missed);
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
        drop(live);
        let _ = user_ws_tx.close().await;
    };

    // Subscribers do not send commands; only watch for the close
    let inbound = async move {
        while let Some(result) = user_ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = inbound => {}
    }

    debug!("Subscriber disconnected");
}
