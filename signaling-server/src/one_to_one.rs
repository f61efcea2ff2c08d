use futures_util::{SinkExt, StreamExt, TryFutureExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::ws::{Message, WebSocket};

use call_relay_protocol::{ClientMessage, ServerMessage, UserId};

use crate::router::{Relay, RouteOutcome};

pub async fn user_connected(ws: WebSocket, relay: Relay) {
    let (mut user_ws_tx, mut user_ws_rx) = ws.split();

    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let user_id = match relay.connect(tx).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("refusing connection: {e}");
            let _ = user_ws_tx.close().await;
            return;
        }
    };
    info!("new user connected: {user_id}");

    let mut rx = UnboundedReceiverStream::new(rx);
    tokio::task::spawn(async move {
        while let Some(message) = rx.next().await {
            let frame = match call_relay_protocol::encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{e}");
                    continue;
                }
            };
            user_ws_tx
                .send(Message::binary(frame))
                .unwrap_or_else(|e| warn!("websocket send error: {e}"))
                .await;
        }
    });

    while let Some(result) = user_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                error!("websocket error (id={user_id}): {e}");
                break;
            }
        };
        user_message(&user_id, msg, &relay).await;
    }
    info!("user disconnected: {user_id}");
    relay.disconnect(&user_id).await;
}

async fn user_message(user_id: &UserId, msg: Message, relay: &Relay) {
    if !msg.is_binary() {
        if !msg.is_close() {
            debug!("ignoring non-binary frame from {user_id}");
        }
        return;
    }
    let request = match call_relay_protocol::decode::<ClientMessage>(msg.as_bytes()) {
        Ok(request) => request,
        Err(e) => {
            warn!("malformed message from {user_id}: {e}");
            return;
        }
    };
    debug!(
        "{} received from {user_id} for {}",
        request.signal.name(),
        request.to
    );
    if let RouteOutcome::Dropped(reason) = relay.route(user_id, request).await {
        debug!("message from {user_id} dropped: {reason}");
    }
}
