//! Websocket session plumbing between a socket and the [`Hub`].

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hive_shared::protocol::ServerEvent;
use hive_shared::types::UserId;

use crate::hub::engine::Hub;

/// Outbound events buffered per connection before new ones are dropped.
const OUTBOUND_BUFFER: usize = 256;

/// Drive one websocket connection until either side closes it.
pub async fn serve_socket(hub: Arc<Hub>, socket: WebSocket, user_id: UserId, failover: bool) {
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let conn = hub.connect(user_id.clone(), failover, tx.clone()).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode hub event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                for event in hub.dispatch(conn, &user_id, &text).await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn, error = %e, "Websocket read failed");
                break;
            }
        }
    }

    drop(tx);
    writer.abort();
    // may wait out the redirect grace period; the socket is already gone
    hub.disconnect(conn, &user_id).await;
}
